#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};

use credits::bus::{Publisher, RecordingPublisher};
use credits::credit::{
    CreditConnector, CreditConnectorOptions, ExpirationDuration, ExpirationPeriod, Grant,
    Granularity, OwnerConnector, OwnerRef, Recurrence,
};
use credits::entitlement::{
    Entitlement, EntitlementKind, EntitlementOwner, EntitlementValueResolver, Feature,
};
use credits::store::MemoryStore;
use credits::worker::{
    BalanceWorker, Recalculator, RecalculatorOptions, SnapshotBuilder, WorkerOptions,
};

pub const NAMESPACE: &str = "acme";
pub const METER: &str = "tokens";

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap()
}

pub fn grant(id: &str, amount: f64, priority: u8, effective_at: DateTime<Utc>, expiration: ExpirationPeriod) -> Grant {
    Grant {
        id: id.to_string(),
        owner: OwnerRef::new(NAMESPACE, "ent-1"),
        amount,
        priority,
        effective_at,
        expiration,
        expires_at: expiration.expires_at(effective_at),
        voided_at: None,
        deleted_at: None,
        recurrence: None,
        reset_min_rollover: 0.0,
        reset_max_rollover: 0.0,
        metadata: BTreeMap::new(),
        created_at: effective_at,
    }
}

pub fn months(count: u32) -> ExpirationPeriod {
    ExpirationPeriod::new(ExpirationDuration::Month, count)
}

pub fn recurring(mut grant: Grant, recurrence: Recurrence) -> Grant {
    grant.recurrence = Some(recurrence);
    grant
}

pub fn feature() -> Feature {
    Feature {
        id: "feat-tokens".into(),
        namespace: NAMESPACE.into(),
        key: "tokens".into(),
        name: "LLM tokens".into(),
        meter_slug: Some(METER.into()),
    }
}

pub fn metered_entitlement(id: &str, subject_key: &str, measure_from: DateTime<Utc>) -> Entitlement {
    Entitlement {
        id: id.into(),
        namespace: NAMESPACE.into(),
        subject_key: subject_key.into(),
        feature_id: "feat-tokens".into(),
        feature_key: "tokens".into(),
        kind: EntitlementKind::Metered,
        measure_usage_from: measure_from,
        usage_period: None,
        last_reset: None,
        is_soft_limit: false,
        config: None,
        created_at: measure_from,
        deleted_at: None,
    }
}

/// Everything wired against one in-memory store, the way the daemon wires Postgres.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub events: Arc<RecordingPublisher>,
    pub snapshots_out: Arc<RecordingPublisher>,
    pub credit: Arc<CreditConnector>,
    pub builder: SnapshotBuilder,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_snapshot_publisher(RecordingPublisher::new())
    }

    pub fn with_snapshot_publisher(snapshots_out: RecordingPublisher) -> Self {
        let store = Arc::new(MemoryStore::new());
        store.insert_feature(feature());
        let events = Arc::new(RecordingPublisher::new());
        let snapshots_out = Arc::new(snapshots_out);

        let owners: Arc<dyn OwnerConnector> = Arc::new(EntitlementOwner::new(
            store.clone(),
            store.clone(),
            store.clone(),
        ));
        let credit = Arc::new(CreditConnector::new(
            store.clone(),
            store.clone(),
            owners.clone(),
            events.clone(),
            CreditConnectorOptions {
                granularity: Granularity::Minute,
                snapshot_grace_period: Duration::hours(1),
            },
        ));
        let builder = SnapshotBuilder::new(Arc::new(EntitlementValueResolver::new(
            credit.clone(),
            owners,
        )));

        Self {
            store,
            events,
            snapshots_out,
            credit,
            builder,
        }
    }

    pub fn worker(&self, options: WorkerOptions) -> BalanceWorker {
        let publisher: Arc<dyn Publisher> = self.snapshots_out.clone();
        BalanceWorker::new(
            self.store.clone(),
            self.store.clone(),
            self.store.clone(),
            self.builder.clone(),
            publisher,
            options,
        )
    }

    pub fn recalculator(&self, options: RecalculatorOptions) -> Recalculator {
        let publisher: Arc<dyn Publisher> = self.snapshots_out.clone();
        Recalculator::new(
            self.store.clone(),
            self.store.clone(),
            self.store.clone(),
            self.builder.clone(),
            publisher,
            options,
        )
    }
}
