use chrono::{DateTime, Datelike, Duration, Months, Utc};
use serde::{Deserialize, Serialize};

/// Half-open time window `[from, to)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Period {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl Period {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self { from, to }
    }

    pub fn contains(&self, t: DateTime<Utc>) -> bool {
        self.from <= t && t < self.to
    }

    /// True when `t` lies strictly between the bounds.
    pub fn strictly_contains(&self, t: DateTime<Utc>) -> bool {
        self.from < t && t < self.to
    }

    pub fn overlaps(&self, other: &Period) -> bool {
        self.from < other.to && other.from < self.to
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecurrenceInterval {
    Day,
    Week,
    Month,
    Year,
}

impl RecurrenceInterval {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecurrenceInterval::Day => "day",
            RecurrenceInterval::Week => "week",
            RecurrenceInterval::Month => "month",
            RecurrenceInterval::Year => "year",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "day" | "daily" => Some(Self::Day),
            "week" | "weekly" => Some(Self::Week),
            "month" | "monthly" => Some(Self::Month),
            "year" | "yearly" | "annual" => Some(Self::Year),
            _ => None,
        }
    }
}

/// key: credit-recurrence -> anchor + k * interval
///
/// Every instant is computed from the anchor, so month and year steps never drift
/// when they pass through shorter months.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recurrence {
    pub interval: RecurrenceInterval,
    pub anchor: DateTime<Utc>,
}

impl Recurrence {
    pub fn new(interval: RecurrenceInterval, anchor: DateTime<Utc>) -> Self {
        Self { interval, anchor }
    }

    /// Smallest recurrence instant strictly after `t`.
    pub fn next_after(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        self.step(self.index_at(t) + 1)
    }

    /// Largest recurrence instant at or before `t`.
    pub fn prev_before_or_equal(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        self.step(self.index_at(t))
    }

    /// The recurrence period `t` falls into.
    pub fn period_containing(&self, t: DateTime<Utc>) -> Period {
        let index = self.index_at(t);
        Period::new(self.step(index), self.step(index + 1))
    }

    /// Index `k` such that `step(k) <= t < step(k + 1)`.
    fn index_at(&self, t: DateTime<Utc>) -> i64 {
        let mut k = self.estimate(t);
        while self.step(k) > t {
            k -= 1;
        }
        while self.step(k + 1) <= t {
            k += 1;
        }
        k
    }

    fn estimate(&self, t: DateTime<Utc>) -> i64 {
        let anchor = self.anchor;
        match self.interval {
            RecurrenceInterval::Day => (t - anchor).num_seconds().div_euclid(86_400),
            RecurrenceInterval::Week => (t - anchor).num_seconds().div_euclid(7 * 86_400),
            RecurrenceInterval::Month => {
                (t.year() as i64 - anchor.year() as i64) * 12 + t.month() as i64
                    - anchor.month() as i64
            }
            RecurrenceInterval::Year => t.year() as i64 - anchor.year() as i64,
        }
    }

    fn step(&self, k: i64) -> DateTime<Utc> {
        let anchor = self.anchor;
        let stepped = match self.interval {
            RecurrenceInterval::Day => Duration::try_days(k).and_then(|d| anchor.checked_add_signed(d)),
            RecurrenceInterval::Week => {
                Duration::try_weeks(k).and_then(|d| anchor.checked_add_signed(d))
            }
            RecurrenceInterval::Month => add_months(anchor, k),
            RecurrenceInterval::Year => k.checked_mul(12).and_then(|m| add_months(anchor, m)),
        };
        stepped.unwrap_or(if k >= 0 {
            DateTime::<Utc>::MAX_UTC
        } else {
            DateTime::<Utc>::MIN_UTC
        })
    }
}

pub(crate) fn add_months(t: DateTime<Utc>, months: i64) -> Option<DateTime<Utc>> {
    let magnitude = u32::try_from(months.unsigned_abs()).ok()?;
    if months >= 0 {
        t.checked_add_months(Months::new(magnitude))
    } else {
        t.checked_sub_months(Months::new(magnitude))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).single().unwrap()
    }

    #[test]
    fn monthly_recurrence_is_anchored_not_cumulative() {
        let recurrence = Recurrence::new(RecurrenceInterval::Month, at(2024, 1, 31, 0));

        assert_eq!(recurrence.next_after(at(2024, 1, 31, 0)), at(2024, 2, 29, 0));
        assert_eq!(recurrence.next_after(at(2024, 2, 29, 0)), at(2024, 3, 31, 0));
        assert_eq!(recurrence.prev_before_or_equal(at(2024, 3, 15, 0)), at(2024, 2, 29, 0));
    }

    #[test]
    fn recurrence_works_before_the_anchor() {
        let recurrence = Recurrence::new(RecurrenceInterval::Day, at(2024, 6, 10, 12));

        assert_eq!(recurrence.next_after(at(2024, 6, 1, 0)), at(2024, 6, 1, 12));
        assert_eq!(recurrence.next_after(at(2024, 6, 1, 12)), at(2024, 6, 2, 12));
        let period = recurrence.period_containing(at(2024, 6, 1, 13));
        assert_eq!(period, Period::new(at(2024, 6, 1, 12), at(2024, 6, 2, 12)));
    }

    #[test]
    fn weekly_and_yearly_steps() {
        let weekly = Recurrence::new(RecurrenceInterval::Week, at(2024, 1, 1, 0));
        assert_eq!(weekly.next_after(at(2024, 1, 3, 0)), at(2024, 1, 8, 0));

        let yearly = Recurrence::new(RecurrenceInterval::Year, at(2020, 2, 29, 0));
        assert_eq!(yearly.next_after(at(2021, 1, 1, 0)), at(2021, 2, 28, 0));
        assert_eq!(yearly.next_after(at(2023, 6, 1, 0)), at(2024, 2, 29, 0));
    }
}
