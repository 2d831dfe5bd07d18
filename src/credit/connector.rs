use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use super::balance::{BalanceMap, GrantBalanceSnapshot};
use super::engine::{Engine, Granularity, RunResult, UsageQuery};
use super::grant::{CreateGrantInput, Grant, OwnerRef};
use super::history::GrantBurnDownHistory;
use super::owner::{OwnerConnector, OwnerMeta};
use super::period::Period;
use super::repository::{BalanceSnapshotRepo, GrantRepo};
use crate::bus::{publish_event, Publisher};
use crate::config;
use crate::error::{CreditError, CreditResult};
use crate::events::{EntitlementResetEvent, GrantCreatedEvent, GrantVoidedEvent};

#[derive(Clone, Debug)]
pub struct CreditConnectorOptions {
    pub granularity: Granularity,
    /// Snapshots are only persisted for instants at least this far in the past, so late
    /// usage can still land in the open window without invalidating anything.
    pub snapshot_grace_period: Duration,
}

impl CreditConnectorOptions {
    pub fn from_env() -> Self {
        Self {
            granularity: *config::CREDIT_ENGINE_GRANULARITY,
            snapshot_grace_period: Duration::seconds(*config::CREDIT_SNAPSHOT_GRACE_SECS),
        }
    }
}

impl Default for CreditConnectorOptions {
    fn default() -> Self {
        Self {
            granularity: Granularity::Minute,
            snapshot_grace_period: Duration::hours(1),
        }
    }
}

struct OwnerUsage<'a> {
    owners: &'a dyn OwnerConnector,
    owner: &'a OwnerRef,
}

#[async_trait]
impl UsageQuery for OwnerUsage<'_> {
    async fn usage(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> CreditResult<f64> {
        self.owners.usage_between(self.owner, from, to).await
    }
}

struct Replay {
    meta: OwnerMeta,
    start: GrantBalanceSnapshot,
    grants: Vec<Grant>,
    result: RunResult,
}

/// key: credit-connector -> engine runs against persisted grants and snapshots
pub struct CreditConnector {
    grants: Arc<dyn GrantRepo>,
    snapshots: Arc<dyn BalanceSnapshotRepo>,
    owners: Arc<dyn OwnerConnector>,
    publisher: Arc<dyn Publisher>,
    options: CreditConnectorOptions,
}

impl CreditConnector {
    pub fn new(
        grants: Arc<dyn GrantRepo>,
        snapshots: Arc<dyn BalanceSnapshotRepo>,
        owners: Arc<dyn OwnerConnector>,
        publisher: Arc<dyn Publisher>,
        options: CreditConnectorOptions,
    ) -> Self {
        Self {
            grants,
            snapshots,
            owners,
            publisher,
            options,
        }
    }

    pub fn options(&self) -> &CreditConnectorOptions {
        &self.options
    }

    /// Balances and overage of `owner` as of `at`.
    pub async fn get_balance_of_owner(
        &self,
        owner: &OwnerRef,
        at: DateTime<Utc>,
    ) -> CreditResult<GrantBalanceSnapshot> {
        let replay = self.replay(owner, at, at).await?;
        self.checkpoint(owner, &replay, at).await?;
        Ok(GrantBalanceSnapshot {
            balances: replay.result.ending_balances,
            overage: replay.result.ending_overage,
            at,
        })
    }

    /// Burn-down segments overlapping `period`.
    pub async fn get_balance_history_of_owner(
        &self,
        owner: &OwnerRef,
        period: Period,
    ) -> CreditResult<GrantBurnDownHistory> {
        let replay = self.replay(owner, period.from, period.to).await?;
        Ok(GrantBurnDownHistory::new(
            replay.result.history.segments_in(&period),
        ))
    }

    pub async fn create_grant(
        &self,
        owner: &OwnerRef,
        input: CreateGrantInput,
    ) -> CreditResult<Grant> {
        validate_grant_input(&input)?;
        let meta = self.owners.describe_owner(owner).await?;

        let mut input = input;
        input.effective_at = self.options.granularity.truncate(input.effective_at);
        if let Some(last_reset) = meta.last_reset {
            if input.effective_at < last_reset {
                return Err(CreditError::validation(format!(
                    "grant cannot take effect ({}) before the last usage reset ({last_reset})",
                    input.effective_at
                )));
            }
        }

        let expires_at = input.expiration.expires_at(input.effective_at);
        let grant = self.grants.create_grant(owner, &input, expires_at).await?;
        self.snapshots
            .invalidate_after(owner, grant.effective_at)
            .await?;

        info!(
            owner = %owner,
            grant = %grant.id,
            amount = grant.amount,
            effective_at = %grant.effective_at,
            "grant created"
        );
        publish_event(
            self.publisher.as_ref(),
            &GrantCreatedEvent {
                grant: grant.clone(),
            },
        )
        .await?;
        Ok(grant)
    }

    pub async fn void_grant(&self, owner: &OwnerRef, grant_id: &str) -> CreditResult<Grant> {
        let grant = self.grants.get_grant(owner, grant_id).await?;
        if grant.voided_at.is_some() {
            return Err(CreditError::validation(format!(
                "grant {grant_id} is already voided"
            )));
        }

        let now = Utc::now();
        let voided = self.grants.void_grant(owner, grant_id, now).await?;
        self.snapshots.invalidate_after(owner, now).await?;

        info!(owner = %owner, grant = %grant_id, "grant voided");
        publish_event(
            self.publisher.as_ref(),
            &GrantVoidedEvent {
                grant: voided.clone(),
            },
        )
        .await?;
        Ok(voided)
    }

    /// Starts a new usage period at `at`: every grant keeps only its rollover-bounded
    /// balance and accumulated overage is forgiven.
    pub async fn reset_usage_for_owner(
        &self,
        owner: &OwnerRef,
        at: DateTime<Utc>,
    ) -> CreditResult<GrantBalanceSnapshot> {
        if at > Utc::now() {
            return Err(CreditError::validation(format!(
                "usage cannot be reset in the future ({at})"
            )));
        }

        let replay = self.replay(owner, at, at).await?;
        if let Some(last_reset) = replay.meta.last_reset {
            if at < last_reset {
                return Err(CreditError::validation(format!(
                    "reset at {at} precedes the last reset at {last_reset}"
                )));
            }
        }

        let mut balances = BalanceMap::new();
        for grant in replay.grants.iter().filter(|grant| grant.active_at(at)) {
            let balance = replay.result.ending_balances.get(&grant.id).unwrap_or(0.0);
            balances.set(&grant.id, grant.rollover_balance(balance));
        }
        let snapshot = GrantBalanceSnapshot {
            balances,
            overage: 0.0,
            at,
        };

        self.snapshots
            .invalidate_after(owner, at - Duration::milliseconds(1))
            .await?;
        self.snapshots
            .save(owner, std::slice::from_ref(&snapshot))
            .await?;
        self.owners.end_current_usage_period(owner, at).await?;

        info!(
            owner = %owner,
            reset_at = %at,
            balance = snapshot.balance(),
            "usage reset"
        );
        publish_event(
            self.publisher.as_ref(),
            &EntitlementResetEvent {
                entitlement_id: owner.id.clone(),
                namespace: owner.namespace.clone(),
                subject_key: replay.meta.subject_key.clone(),
                reset_at: at,
            },
        )
        .await?;
        Ok(snapshot)
    }

    /// Runs the engine from the latest valid snapshot at or before `snapshot_at` up to `until`.
    async fn replay(
        &self,
        owner: &OwnerRef,
        snapshot_at: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> CreditResult<Replay> {
        let meta = self.owners.describe_owner(owner).await?;
        let start = match self.snapshots.latest_valid_at(owner, snapshot_at).await? {
            Some(snapshot) => snapshot,
            None => GrantBalanceSnapshot {
                balances: BalanceMap::new(),
                overage: 0.0,
                at: meta.start_of_measurement.min(until),
            },
        };

        let grants = self
            .grants
            .list_active_grants_between(owner, start.at, until)
            .await?;
        let balances = self.align_balances(owner, &start, &grants);

        let usage = OwnerUsage {
            owners: self.owners.as_ref(),
            owner,
        };
        let engine = Engine::new(&usage, self.options.granularity);
        let result = engine
            .run(&grants, balances, start.overage, Period::new(start.at, until))
            .await?;

        debug!(
            owner = %owner,
            from = %start.at,
            to = %until,
            grants = grants.len(),
            segments = result.history.len(),
            "balance replayed"
        );
        Ok(Replay {
            meta,
            start,
            grants,
            result,
        })
    }

    /// Starting balances keyed exactly by `grants`. Grants unknown to the snapshot start empty
    /// and are topped up by the engine at their effective time.
    fn align_balances(
        &self,
        owner: &OwnerRef,
        start: &GrantBalanceSnapshot,
        grants: &[Grant],
    ) -> BalanceMap {
        let mut balances = BalanceMap::new();
        for grant in grants {
            let balance = match start.balances.get(&grant.id) {
                Some(balance) => balance,
                None if self.options.granularity.truncate(grant.effective_at) < start.at
                    && grant.active_at(start.at) =>
                {
                    warn!(
                        owner = %owner,
                        grant = %grant.id,
                        snapshot_at = %start.at,
                        "grant missing from an older snapshot, assuming full amount"
                    );
                    grant.amount
                }
                None => 0.0,
            };
            balances.set(&grant.id, balance);
        }
        balances
    }

    /// Persists the newest state that is old enough to be final.
    async fn checkpoint(
        &self,
        owner: &OwnerRef,
        replay: &Replay,
        at: DateTime<Utc>,
    ) -> CreditResult<()> {
        let threshold = Utc::now() - self.options.snapshot_grace_period;
        let candidate = if at <= threshold {
            Some(GrantBalanceSnapshot {
                balances: replay.result.ending_balances.copy(),
                overage: replay.result.ending_overage,
                at,
            })
        } else {
            replay
                .result
                .history
                .segments()
                .iter()
                .rev()
                .find(|segment| segment.period.from <= threshold)
                .map(|segment| GrantBalanceSnapshot {
                    balances: segment.balance_at_start.copy(),
                    overage: segment.overage_at_start,
                    at: segment.period.from,
                })
        };

        match candidate {
            Some(snapshot) if snapshot.at > replay.start.at => {
                debug!(owner = %owner, at = %snapshot.at, "saving balance snapshot");
                self.snapshots
                    .save(owner, std::slice::from_ref(&snapshot))
                    .await
            }
            _ => Ok(()),
        }
    }
}

fn validate_grant_input(input: &CreateGrantInput) -> CreditResult<()> {
    if !input.amount.is_finite() {
        return Err(CreditError::validation("grant amount must be a finite number"));
    }
    if input.expiration.count == 0 {
        return Err(CreditError::validation("grant expiration count must be positive"));
    }
    if !input.reset_min_rollover.is_finite() || !input.reset_max_rollover.is_finite() {
        return Err(CreditError::validation("rollover bounds must be finite numbers"));
    }
    if input.reset_min_rollover > input.reset_max_rollover {
        return Err(CreditError::validation(
            "reset min rollover cannot exceed reset max rollover",
        ));
    }
    Ok(())
}
