pub mod burn;
pub mod phases;
pub mod priority;

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Duration, DurationRound, Utc};
use tracing::trace;

use super::balance::BalanceMap;
use super::grant::Grant;
use super::history::{GrantBurnDownHistory, GrantBurnDownHistorySegment, SegmentTerminationReasons};
use super::period::Period;
use crate::error::{CreditError, CreditResult};

pub use burn::{burn_down_grants, BurnDownOutcome};
pub use phases::{compute_phases, BurnPhase};
pub use priority::prioritize;

/// Precision that grant activity changes are truncated to before phases are cut.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Granularity {
    Second,
    Minute,
    Hour,
}

impl Granularity {
    pub fn truncate(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        let step = match self {
            Granularity::Second => Duration::seconds(1),
            Granularity::Minute => Duration::minutes(1),
            Granularity::Hour => Duration::hours(1),
        };
        t.duration_trunc(step).unwrap_or(t)
    }
}

impl FromStr for Granularity {
    type Err = CreditError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "second" | "seconds" | "s" => Ok(Granularity::Second),
            "minute" | "minutes" | "m" => Ok(Granularity::Minute),
            "hour" | "hours" | "h" => Ok(Granularity::Hour),
            other => Err(CreditError::validation(format!(
                "unknown engine granularity `{other}`"
            ))),
        }
    }
}

/// Total metered usage in `[from, to)`.
#[async_trait]
pub trait UsageQuery: Send + Sync {
    async fn usage(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> CreditResult<f64>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunResult {
    pub ending_balances: BalanceMap,
    pub ending_overage: f64,
    pub history: GrantBurnDownHistory,
}

/// key: credit-engine -> grant burn-down over a period
///
/// Phases run strictly one after another because balances and overage carry forward;
/// each phase awaits exactly one usage query. The engine never persists anything.
pub struct Engine<'a> {
    usage: &'a dyn UsageQuery,
    granularity: Granularity,
}

impl<'a> Engine<'a> {
    pub fn new(usage: &'a dyn UsageQuery, granularity: Granularity) -> Self {
        Self { usage, granularity }
    }

    pub async fn run(
        &self,
        grants: &[Grant],
        starting_balances: BalanceMap,
        starting_overage: f64,
        period: Period,
    ) -> CreditResult<RunResult> {
        if !starting_balances.exactly_for_grants(grants) {
            return Err(CreditError::validation(
                "grants and balances don't pair up",
            ));
        }
        if period.to < period.from {
            return Err(CreditError::validation(format!(
                "period ends ({}) before it starts ({})",
                period.to, period.from
            )));
        }

        let phases = compute_phases(grants, &period, self.granularity);
        let mut balances = starting_balances;
        let mut overage = starting_overage;
        let mut segments = Vec::with_capacity(phases.len());
        let mut ordered = self.active_in_priority_order(grants, period.from);

        for (index, phase) in phases.iter().enumerate() {
            if let Some(previous) = index.checked_sub(1).map(|i| &phases[i]) {
                if previous.priority_change {
                    ordered = self.active_in_priority_order(grants, phase.from);
                }
                for grant_id in &previous.grants_recurred_at_end {
                    if let Some(grant) = grants.iter().find(|grant| &grant.id == grant_id) {
                        balances.set(&grant.id, grant.amount);
                    }
                }
            }

            if index == 0 {
                for grant in grants.iter().filter(|grant| self.recurs_at(grant, phase.from)) {
                    balances.set(&grant.id, grant.amount);
                }
            }

            for grant in grants {
                if !self.active_at(grant, phase.from) {
                    balances.set(&grant.id, 0.0);
                } else if self.granularity.truncate(grant.effective_at) == phase.from {
                    balances.set(&grant.id, grant.amount);
                }
            }

            let balance_at_start = balances.copy();
            let overage_at_start = overage;
            let usage = self.usage.usage(phase.from, phase.to).await?;
            let outcome = burn_down_grants(&balances, &ordered, burn::add_exact(usage, overage)?)?;

            trace!(
                from = %phase.from,
                to = %phase.to,
                usage,
                overage = outcome.overage,
                "burn phase evaluated"
            );

            balances = outcome.balances;
            overage = outcome.overage;
            segments.push(GrantBurnDownHistorySegment {
                period: phase.period(),
                balance_at_start,
                overage_at_start,
                grant_usages: outcome.usages,
                total_usage: usage,
                overage,
                termination_reasons: SegmentTerminationReasons {
                    priority_change: phase.priority_change,
                    recurrence: phase.grants_recurred_at_end.clone(),
                },
            });
        }

        Ok(RunResult {
            ending_balances: balances,
            ending_overage: overage,
            history: GrantBurnDownHistory::new(segments),
        })
    }

    fn active_at(&self, grant: &Grant, t: DateTime<Utc>) -> bool {
        phases::active_at(grant, t, self.granularity)
    }

    /// A recurrence landing exactly on the run start resets the grant before any usage burns.
    /// Runs ending on that instant leave it out, so a snapshot taken there still needs it.
    fn recurs_at(&self, grant: &Grant, t: DateTime<Utc>) -> bool {
        grant
            .recurrence
            .map_or(false, |recurrence| recurrence.prev_before_or_equal(t) == t)
            && self.active_at(grant, t)
    }

    fn active_in_priority_order<'g>(&self, grants: &'g [Grant], at: DateTime<Utc>) -> Vec<&'g Grant> {
        prioritize(grants.iter().filter(|grant| self.active_at(grant, at)))
    }
}
