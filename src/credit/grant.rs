use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::period::{add_months, Recurrence};

/// Opaque `(namespace, id)` pair used purely as a repository lookup key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OwnerRef {
    pub namespace: String,
    pub id: String,
}

impl OwnerRef {
    pub fn new(namespace: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for OwnerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.id)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExpirationDuration {
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl ExpirationDuration {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExpirationDuration::Hour => "hour",
            ExpirationDuration::Day => "day",
            ExpirationDuration::Week => "week",
            ExpirationDuration::Month => "month",
            ExpirationDuration::Year => "year",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "hour" => Some(Self::Hour),
            "day" => Some(Self::Day),
            "week" => Some(Self::Week),
            "month" => Some(Self::Month),
            "year" => Some(Self::Year),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpirationPeriod {
    pub duration: ExpirationDuration,
    pub count: u32,
}

impl ExpirationPeriod {
    pub fn new(duration: ExpirationDuration, count: u32) -> Self {
        Self { duration, count }
    }

    /// Exclusive upper bound of a grant that became effective at `effective_at`.
    pub fn expires_at(&self, effective_at: DateTime<Utc>) -> DateTime<Utc> {
        let count = i64::from(self.count);
        let expires = match self.duration {
            ExpirationDuration::Hour => {
                Duration::try_hours(count).and_then(|d| effective_at.checked_add_signed(d))
            }
            ExpirationDuration::Day => {
                Duration::try_days(count).and_then(|d| effective_at.checked_add_signed(d))
            }
            ExpirationDuration::Week => {
                Duration::try_weeks(count).and_then(|d| effective_at.checked_add_signed(d))
            }
            ExpirationDuration::Month => add_months(effective_at, count),
            ExpirationDuration::Year => add_months(effective_at, count * 12),
        };
        expires.unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// key: credit-grant -> immutable unit of credit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Grant {
    pub id: String,
    pub owner: OwnerRef,
    pub amount: f64,
    pub priority: u8,
    pub effective_at: DateTime<Utc>,
    pub expiration: ExpirationPeriod,
    pub expires_at: DateTime<Utc>,
    pub voided_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub recurrence: Option<Recurrence>,
    pub reset_min_rollover: f64,
    pub reset_max_rollover: f64,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl Grant {
    pub fn active_at(&self, t: DateTime<Utc>) -> bool {
        if matches!(self.deleted_at, Some(deleted) if deleted <= t) {
            return false;
        }
        if matches!(self.voided_at, Some(voided) if voided <= t) {
            return false;
        }
        self.effective_at <= t && t < self.expires_at
    }

    /// Instants at which the grant enters or leaves the active set.
    pub fn activity_changes(&self) -> impl Iterator<Item = DateTime<Utc>> {
        [
            Some(self.effective_at),
            Some(self.expires_at),
            self.voided_at,
            self.deleted_at,
        ]
        .into_iter()
        .flatten()
    }

    /// Balance carried over a manual usage reset.
    pub fn rollover_balance(&self, balance: f64) -> f64 {
        balance
            .min(self.reset_max_rollover)
            .max(self.reset_min_rollover)
    }
}

/// Input accepted by the credit connector when issuing a grant.
#[derive(Debug, Clone)]
pub struct CreateGrantInput {
    pub amount: f64,
    pub priority: u8,
    pub effective_at: DateTime<Utc>,
    pub expiration: ExpirationPeriod,
    pub recurrence: Option<Recurrence>,
    pub reset_min_rollover: f64,
    pub reset_max_rollover: f64,
    pub metadata: BTreeMap<String, String>,
}

impl CreateGrantInput {
    pub fn new(amount: f64, effective_at: DateTime<Utc>, expiration: ExpirationPeriod) -> Self {
        Self {
            amount,
            priority: 1,
            effective_at,
            expiration,
            recurrence: None,
            reset_min_rollover: 0.0,
            reset_max_rollover: 0.0,
            metadata: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credit::period::RecurrenceInterval;
    use chrono::TimeZone;

    fn grant(effective_at: DateTime<Utc>) -> Grant {
        let expiration = ExpirationPeriod::new(ExpirationDuration::Day, 10);
        Grant {
            id: "grant-1".into(),
            owner: OwnerRef::new("ns", "owner"),
            amount: 100.0,
            priority: 1,
            effective_at,
            expiration,
            expires_at: expiration.expires_at(effective_at),
            voided_at: None,
            deleted_at: None,
            recurrence: Some(Recurrence::new(RecurrenceInterval::Day, effective_at)),
            reset_min_rollover: 10.0,
            reset_max_rollover: 50.0,
            metadata: BTreeMap::new(),
            created_at: effective_at,
        }
    }

    #[test]
    fn active_window_is_half_open() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap();
        let g = grant(start);

        assert!(!g.active_at(start - Duration::seconds(1)));
        assert!(g.active_at(start));
        assert!(g.active_at(g.expires_at - Duration::seconds(1)));
        assert!(!g.active_at(g.expires_at));
    }

    #[test]
    fn voided_or_deleted_grants_are_inactive_from_that_instant() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap();
        let mut g = grant(start);
        g.voided_at = Some(start + Duration::days(2));

        assert!(g.active_at(start + Duration::days(1)));
        assert!(!g.active_at(start + Duration::days(2)));

        let mut g = grant(start);
        g.deleted_at = Some(start + Duration::days(3));
        assert!(!g.active_at(start + Duration::days(3)));
        assert_eq!(g.activity_changes().count(), 3);
    }

    #[test]
    fn rollover_is_clamped_between_bounds() {
        let g = grant(Utc::now());
        assert_eq!(g.rollover_balance(80.0), 50.0);
        assert_eq!(g.rollover_balance(2.0), 10.0);
        assert_eq!(g.rollover_balance(25.0), 25.0);
    }

    #[test]
    fn monthly_expiration_uses_calendar_months() {
        let start = Utc.with_ymd_and_hms(2024, 1, 31, 0, 0, 0).single().unwrap();
        let period = ExpirationPeriod::new(ExpirationDuration::Month, 1);
        assert_eq!(
            period.expires_at(start),
            Utc.with_ymd_and_hms(2024, 2, 29, 0, 0, 0).single().unwrap()
        );
    }
}
