use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use super::Granularity;
use crate::credit::grant::Grant;
use crate::credit::period::Period;

/// Sub-interval of a run within which burn order and the active grant set stay constant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BurnPhase {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub priority_change: bool,
    pub grants_recurred_at_end: Vec<String>,
}

impl BurnPhase {
    pub fn period(&self) -> Period {
        Period::new(self.from, self.to)
    }
}

/// Truncated, deduplicated instants strictly inside `period` where a grant starts, expires,
/// is voided or is deleted.
pub fn activity_changes(
    grants: &[Grant],
    period: &Period,
    granularity: Granularity,
) -> Vec<DateTime<Utc>> {
    let mut times: Vec<DateTime<Utc>> = grants
        .iter()
        .flat_map(Grant::activity_changes)
        .map(|t| granularity.truncate(t))
        .filter(|t| period.strictly_contains(*t))
        .collect();
    times.sort();
    times.dedup();
    times
}

/// Activity check against the truncated instants phases are cut at.
pub fn active_at(grant: &Grant, t: DateTime<Utc>, granularity: Granularity) -> bool {
    let truncate = |value: DateTime<Utc>| granularity.truncate(value);
    if matches!(grant.deleted_at.map(truncate), Some(deleted) if deleted <= t) {
        return false;
    }
    if matches!(grant.voided_at.map(truncate), Some(voided) if voided <= t) {
        return false;
    }
    truncate(grant.effective_at) <= t && t < truncate(grant.expires_at)
}

/// Recurrence instants strictly inside `period`, grouped by instant. Ids keep input order.
pub fn recurrence_times(
    grants: &[Grant],
    period: &Period,
    granularity: Granularity,
) -> Vec<(DateTime<Utc>, Vec<String>)> {
    let mut grouped: BTreeMap<DateTime<Utc>, Vec<String>> = BTreeMap::new();

    for grant in grants {
        let Some(recurrence) = grant.recurrence else {
            continue;
        };

        let end = [Some(grant.expires_at), grant.voided_at, grant.deleted_at]
            .into_iter()
            .flatten()
            .map(|t| granularity.truncate(t))
            .chain(Some(period.to))
            .min()
            .unwrap_or(period.to);

        let mut at = recurrence.next_after(period.from);
        while at < end {
            if active_at(grant, at, granularity) {
                let ids = grouped.entry(at).or_default();
                if !ids.contains(&grant.id) {
                    ids.push(grant.id.clone());
                }
            }
            at = recurrence.next_after(at);
        }
    }

    grouped.into_iter().collect()
}

/// key: credit-phases -> merge-walk of activity changes and recurrences
pub fn compute_phases(grants: &[Grant], period: &Period, granularity: Granularity) -> Vec<BurnPhase> {
    let activity = activity_changes(grants, period, granularity);
    let recurrences = recurrence_times(grants, period, granularity);

    let mut phases = Vec::with_capacity(activity.len() + recurrences.len() + 1);
    let mut from = period.from;
    let mut activity_iter = activity.into_iter().peekable();
    let mut recurrence_iter = recurrences.into_iter().peekable();

    loop {
        let next_activity = activity_iter.peek().copied();
        let next_recurrence = recurrence_iter.peek().map(|(at, _)| *at);

        let (to, priority_change, recurred) = match (next_activity, next_recurrence) {
            (None, None) => break,
            (Some(activity_at), Some(recurrence_at)) if activity_at == recurrence_at => {
                activity_iter.next();
                let ids = recurrence_iter
                    .next()
                    .map(|(_, ids)| ids)
                    .unwrap_or_default();
                (activity_at, true, ids)
            }
            (Some(activity_at), Some(recurrence_at)) if activity_at < recurrence_at => {
                activity_iter.next();
                (activity_at, true, Vec::new())
            }
            (Some(activity_at), None) => {
                activity_iter.next();
                (activity_at, true, Vec::new())
            }
            (_, Some(_)) => match recurrence_iter.next() {
                Some((recurrence_at, ids)) => (recurrence_at, false, ids),
                None => break,
            },
        };

        phases.push(BurnPhase {
            from,
            to,
            priority_change,
            grants_recurred_at_end: recurred,
        });
        from = to;
    }

    phases.push(BurnPhase {
        from,
        to: period.to,
        priority_change: false,
        grants_recurred_at_end: Vec::new(),
    });
    phases
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credit::grant::{ExpirationDuration, ExpirationPeriod, OwnerRef};
    use crate::credit::period::{Recurrence, RecurrenceInterval};
    use chrono::{Duration, TimeZone};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap()
    }

    fn grant(id: &str, effective_at: DateTime<Utc>, days: u32) -> Grant {
        let expiration = ExpirationPeriod::new(ExpirationDuration::Day, days);
        Grant {
            id: id.into(),
            owner: OwnerRef::new("ns", "owner"),
            amount: 100.0,
            priority: 1,
            effective_at,
            expiration,
            expires_at: expiration.expires_at(effective_at),
            voided_at: None,
            deleted_at: None,
            recurrence: None,
            reset_min_rollover: 0.0,
            reset_max_rollover: 0.0,
            metadata: Default::default(),
            created_at: effective_at,
        }
    }

    #[test]
    fn no_boundaries_yields_one_phase() {
        let grants = vec![grant("a", start() - Duration::days(1), 60)];
        let period = Period::new(start(), start() + Duration::days(5));

        let phases = compute_phases(&grants, &period, Granularity::Minute);
        assert_eq!(phases.len(), 1);
        assert_eq!(phases[0].period(), period);
        assert!(!phases[0].priority_change);
    }

    #[test]
    fn activity_changes_are_truncated_and_deduplicated() {
        let mut late = grant("b", start() + Duration::days(2) + Duration::seconds(30), 60);
        late.voided_at = Some(start() + Duration::days(3));
        let grants = vec![
            grant("a", start() + Duration::days(2), 60),
            late,
            grant("c", start() - Duration::days(10), 1),
        ];
        let period = Period::new(start(), start() + Duration::days(5));

        let times = activity_changes(&grants, &period, Granularity::Minute);
        assert_eq!(
            times,
            vec![start() + Duration::days(2), start() + Duration::days(3)]
        );
    }

    #[test]
    fn coinciding_boundary_carries_both_flags() {
        let mut recurring = grant("r", start() - Duration::days(1), 365);
        recurring.recurrence = Some(Recurrence::new(RecurrenceInterval::Day, start()));
        let joining = grant("j", start() + Duration::days(1), 30);
        let grants = vec![recurring, joining];
        let period = Period::new(start(), start() + Duration::days(2));

        let phases = compute_phases(&grants, &period, Granularity::Minute);
        assert_eq!(phases.len(), 2);
        assert_eq!(phases[0].to, start() + Duration::days(1));
        assert!(phases[0].priority_change);
        assert_eq!(phases[0].grants_recurred_at_end, vec!["r".to_string()]);
        assert!(!phases[1].priority_change);
        assert!(phases[1].grants_recurred_at_end.is_empty());
    }

    #[test]
    fn recurrence_stops_when_grant_expires() {
        let mut recurring = grant("r", start(), 3);
        recurring.recurrence = Some(Recurrence::new(RecurrenceInterval::Day, start()));
        let period = Period::new(start(), start() + Duration::days(10));

        let times: Vec<_> = recurrence_times(&[recurring], &period, Granularity::Minute)
            .into_iter()
            .map(|(at, _)| at)
            .collect();
        assert_eq!(
            times,
            vec![start() + Duration::days(1), start() + Duration::days(2)]
        );
    }

    #[test]
    fn recurrence_respects_the_truncated_expiry() {
        let mut recurring = grant("r", start(), 2);
        recurring.expires_at = start() + Duration::days(2) + Duration::seconds(30);
        recurring.recurrence = Some(Recurrence::new(RecurrenceInterval::Day, start()));
        let period = Period::new(start(), start() + Duration::days(5));

        let times: Vec<_> = recurrence_times(&[recurring.clone()], &period, Granularity::Minute)
            .into_iter()
            .map(|(at, _)| at)
            .collect();
        assert_eq!(times, vec![start() + Duration::days(1)]);
        assert!(!active_at(&recurring, start() + Duration::days(2), Granularity::Minute));
        assert!(recurring.active_at(start() + Duration::days(2)));
    }
}
