use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;

use crate::credit::balance::BalanceMap;
use crate::credit::grant::Grant;
use crate::credit::history::{BurnReason, GrantUsage};
use crate::error::{CreditError, CreditResult};

#[derive(Debug, Clone, PartialEq)]
pub struct BurnDownOutcome {
    pub balances: BalanceMap,
    pub usages: Vec<GrantUsage>,
    pub overage: f64,
}

/// Depletes `grants` (already in priority order) by `usage`.
///
/// Arithmetic happens in `Decimal`; floats only cross the function boundary.
pub fn burn_down_grants(
    balances: &BalanceMap,
    grants: &[&Grant],
    usage: f64,
) -> CreditResult<BurnDownOutcome> {
    let mut balances = balances.copy();
    let mut remaining = to_decimal(usage, "usage")?;
    let mut usages = Vec::new();

    for grant in grants {
        if remaining.is_zero() {
            break;
        }
        let balance = to_decimal(balances.get(&grant.id).unwrap_or(0.0), "grant balance")?;
        if balance.is_zero() {
            continue;
        }

        if balance <= remaining {
            remaining -= balance;
            balances.set(&grant.id, 0.0);
            usages.push(GrantUsage {
                grant_id: grant.id.clone(),
                usage: to_float(balance)?,
                reason: BurnReason::Exhausted,
            });
        } else {
            balances.set(&grant.id, to_float(balance - remaining)?);
            usages.push(GrantUsage {
                grant_id: grant.id.clone(),
                usage: to_float(remaining)?,
                reason: BurnReason::SegmentTerminated,
            });
            remaining = Decimal::ZERO;
        }
    }

    Ok(BurnDownOutcome {
        balances,
        usages,
        overage: to_float(remaining.max(Decimal::ZERO))?,
    })
}

/// Exact sum of two amounts, used to fold carried overage into the next phase's usage.
pub(crate) fn add_exact(a: f64, b: f64) -> CreditResult<f64> {
    to_float(to_decimal(a, "usage")? + to_decimal(b, "overage")?)
}

fn to_decimal(value: f64, what: &str) -> CreditResult<Decimal> {
    Decimal::from_f64(value)
        .ok_or_else(|| CreditError::validation(format!("{what} is not a finite number: {value}")))
}

fn to_float(value: Decimal) -> CreditResult<f64> {
    value
        .to_f64()
        .ok_or_else(|| CreditError::validation(format!("{value} does not fit a double")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credit::grant::{ExpirationDuration, ExpirationPeriod, OwnerRef};
    use chrono::{Duration, TimeZone, Utc};

    fn grant(id: &str, amount: f64) -> Grant {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap();
        Grant {
            id: id.into(),
            owner: OwnerRef::new("ns", "owner"),
            amount,
            priority: 1,
            effective_at: start,
            expiration: ExpirationPeriod::new(ExpirationDuration::Day, 30),
            expires_at: start + Duration::days(30),
            voided_at: None,
            deleted_at: None,
            recurrence: None,
            reset_min_rollover: 0.0,
            reset_max_rollover: 0.0,
            metadata: Default::default(),
            created_at: start,
        }
    }

    fn balances(entries: &[(&str, f64)]) -> BalanceMap {
        entries
            .iter()
            .map(|(id, amount)| (id.to_string(), *amount))
            .collect()
    }

    #[test]
    fn exhausts_in_order_and_terminates_on_the_last_grant() {
        let a = grant("a", 100.0);
        let b = grant("b", 50.0);
        let outcome =
            burn_down_grants(&balances(&[("a", 100.0), ("b", 50.0)]), &[&a, &b], 120.0).unwrap();

        assert_eq!(outcome.balances.get("a"), Some(0.0));
        assert_eq!(outcome.balances.get("b"), Some(30.0));
        assert_eq!(outcome.overage, 0.0);
        assert_eq!(outcome.usages[0].reason, BurnReason::Exhausted);
        assert_eq!(outcome.usages[1].reason, BurnReason::SegmentTerminated);
        assert_eq!(outcome.usages[1].usage, 20.0);
    }

    #[test]
    fn leftover_usage_becomes_overage_and_empty_grants_are_skipped() {
        let a = grant("a", 100.0);
        let b = grant("b", 10.0);
        let outcome =
            burn_down_grants(&balances(&[("a", 0.0), ("b", 10.0)]), &[&a, &b], 25.0).unwrap();

        assert_eq!(outcome.usages.len(), 1);
        assert_eq!(outcome.usages[0].grant_id, "b");
        assert_eq!(outcome.overage, 15.0);
    }

    #[test]
    fn many_small_burns_do_not_drift() {
        let a = grant("a", 1.0);
        let mut current = balances(&[("a", 1.0)]);
        for _ in 0..10 {
            current = burn_down_grants(&current, &[&a], 0.1).unwrap().balances;
        }
        assert_eq!(current.get("a"), Some(0.0));
    }

    #[test]
    fn conservation_holds_for_each_call() {
        let a = grant("a", 33.3);
        let b = grant("b", 12.7);
        let outcome =
            burn_down_grants(&balances(&[("a", 33.3), ("b", 12.7)]), &[&a, &b], 50.05).unwrap();

        let attributed: f64 = outcome.usages.iter().map(|u| u.usage).sum();
        assert!((attributed + outcome.overage - 50.05).abs() < 1e-9);
    }

    #[test]
    fn non_finite_usage_is_rejected() {
        let a = grant("a", 1.0);
        let err = burn_down_grants(&balances(&[("a", 1.0)]), &[&a], f64::NAN).unwrap_err();
        assert!(matches!(err, CreditError::Validation(_)));
    }
}
