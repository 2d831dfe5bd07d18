//! Balance worker: turns domain events into `entitlement.v1.snapshot` messages.

pub mod cache;
pub mod recalculate;
pub mod snapshot;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, DurationRound, Utc};
use tracing::{debug, warn};

use crate::bus::{publish_event, Handler, Publisher, Router};
use crate::config;
use crate::entitlement::models::Entitlement;
use crate::entitlement::repository::{EntitlementRepo, FeatureRepo, SubjectResolver};
use crate::error::{CreditError, CreditResult};
use crate::events::{
    DomainEvent, EntitlementCreatedEvent, EntitlementDeletedEvent, EntitlementResetEvent,
    EntitlementSnapshotEvent, Envelope, GrantCreatedEvent, GrantVoidedEvent, IngestEventsFlushed,
    IngestedSubjectMeters,
};

pub use cache::{HighWatermarkCache, HighWatermarkEntry};
pub use recalculate::{RecalculationReport, Recalculator, RecalculatorOptions};
pub use snapshot::SnapshotBuilder;

#[derive(Clone, Debug)]
pub struct WorkerOptions {
    pub cache_size: usize,
    pub clock_drift: Duration,
    /// Upper bound on entries per republished ingest event.
    pub max_batch_size: usize,
}

impl WorkerOptions {
    pub fn from_env() -> Self {
        Self {
            cache_size: *config::BALANCE_WORKER_CACHE_SIZE,
            clock_drift: Duration::milliseconds(*config::BALANCE_WORKER_CLOCK_DRIFT_MS),
            max_batch_size: *config::BUS_MAX_BATCH_SIZE,
        }
    }
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            cache_size: 200_000,
            clock_drift: Duration::milliseconds(1),
            max_batch_size: 100,
        }
    }
}

/// key: balance-worker -> event-driven snapshot publisher
pub struct BalanceWorker {
    entitlements: Arc<dyn EntitlementRepo>,
    features: Arc<dyn FeatureRepo>,
    subjects: Arc<dyn SubjectResolver>,
    snapshots: SnapshotBuilder,
    publisher: Arc<dyn Publisher>,
    cache: HighWatermarkCache,
    options: WorkerOptions,
}

impl BalanceWorker {
    pub fn new(
        entitlements: Arc<dyn EntitlementRepo>,
        features: Arc<dyn FeatureRepo>,
        subjects: Arc<dyn SubjectResolver>,
        snapshots: SnapshotBuilder,
        publisher: Arc<dyn Publisher>,
        options: WorkerOptions,
    ) -> Self {
        Self {
            cache: HighWatermarkCache::new(options.cache_size, options.clock_drift),
            entitlements,
            features,
            subjects,
            snapshots,
            publisher,
            options,
        }
    }

    pub fn subscriptions() -> Vec<String> {
        vec![
            EntitlementCreatedEvent::event_name(),
            EntitlementDeletedEvent::event_name(),
            GrantCreatedEvent::event_name(),
            GrantVoidedEvent::event_name(),
            EntitlementResetEvent::event_name(),
            IngestEventsFlushed::event_name(),
        ]
    }

    pub fn register(self: &Arc<Self>, router: &mut Router) {
        for name in Self::subscriptions() {
            router.add_handler(name, self.clone());
        }
    }

    pub fn cache(&self) -> &HighWatermarkCache {
        &self.cache
    }

    /// Recomputes and publishes the entitlement's value unless a newer computation already
    /// went out. Returns the published snapshot, or `None` for a stale trigger.
    pub async fn handle_update_trigger(
        &self,
        namespace: &str,
        entitlement_id: &str,
    ) -> CreditResult<Option<EntitlementSnapshotEvent>> {
        let now = trigger_time();
        if self.cache.is_stale(entitlement_id, now) {
            debug!(%namespace, entitlement = %entitlement_id, "stale trigger skipped");
            return Ok(None);
        }

        let entitlement = self
            .entitlements
            .get_entitlement(namespace, entitlement_id)
            .await?;
        if entitlement.is_deleted_at(now) {
            return self.handle_delete_trigger(&entitlement).await.map(Some);
        }

        let feature = self
            .features
            .get_feature(namespace, &entitlement.feature_id)
            .await?;
        let subject_id = self
            .subjects
            .subject_id(namespace, &entitlement.subject_key)
            .await?;
        let event = self
            .snapshots
            .update(&entitlement, feature, subject_id, now)
            .await?;

        publish_event(self.publisher.as_ref(), &event).await?;
        self.cache.record(entitlement_id, now, false);
        debug!(%namespace, entitlement = %entitlement_id, "snapshot published");
        Ok(Some(event))
    }

    pub async fn handle_delete_trigger(
        &self,
        entitlement: &Entitlement,
    ) -> CreditResult<EntitlementSnapshotEvent> {
        let now = trigger_time();
        let feature = self
            .features
            .get_feature(&entitlement.namespace, &entitlement.feature_id)
            .await?;
        let subject_id = self
            .subjects
            .subject_id(&entitlement.namespace, &entitlement.subject_key)
            .await?;
        let event = SnapshotBuilder::delete(entitlement, feature, subject_id, now);

        publish_event(self.publisher.as_ref(), &event).await?;
        self.cache.record(&entitlement.id, now, true);
        debug!(
            namespace = %entitlement.namespace,
            entitlement = %entitlement.id,
            "delete snapshot published"
        );
        Ok(event)
    }

    /// Fans an ingest batch out to every affected entitlement. When only some of them fail
    /// the retryable remainder is handed back as narrowed ingest events.
    async fn handle_ingest(&self, batch: IngestEventsFlushed) -> CreditResult<()> {
        // entitlement id -> first entry that touched it
        let mut affected: BTreeMap<String, usize> = BTreeMap::new();
        for (index, entry) in batch.entries.iter().enumerate() {
            let entitlements = self
                .entitlements
                .list_affected_by_meters(&batch.namespace, &entry.subject_key, &entry.meter_slugs)
                .await?;
            for entitlement in entitlements {
                affected.entry(entitlement.id).or_insert(index);
            }
        }

        let total = affected.len();
        let mut retry_entries = BTreeSet::new();
        let mut errors = Vec::new();
        for (id, entry_index) in &affected {
            if let Err(err) = self.handle_update_trigger(&batch.namespace, id).await {
                warn!(?err, namespace = %batch.namespace, entitlement = %id, "snapshot update failed");
                if err.is_retryable() {
                    retry_entries.insert(*entry_index);
                }
                errors.push(err);
            }
        }

        if retry_entries.is_empty() {
            return CreditError::join(errors).map_or(Ok(()), Err);
        }

        let entries: Vec<IngestedSubjectMeters> = retry_entries
            .into_iter()
            .filter_map(|index| batch.entries.get(index).cloned())
            .collect();
        let retry = entries
            .chunks(self.options.max_batch_size.max(1))
            .map(|chunk| {
                Envelope::new(&IngestEventsFlushed {
                    namespace: batch.namespace.clone(),
                    entries: chunk.to_vec(),
                })
            })
            .collect::<CreditResult<Vec<_>>>()?;

        Err(CreditError::PartialBatch {
            failed: errors.len(),
            total,
            retry,
        })
    }
}

#[async_trait]
impl Handler for BalanceWorker {
    async fn handle(&self, envelope: &Envelope) -> CreditResult<()> {
        let name = envelope.name.as_str();
        if name == EntitlementCreatedEvent::event_name() {
            let event: EntitlementCreatedEvent = envelope.decode()?;
            let entitlement = event.entitlement;
            self.handle_update_trigger(&entitlement.namespace, &entitlement.id)
                .await
                .map(drop)
        } else if name == EntitlementDeletedEvent::event_name() {
            let event: EntitlementDeletedEvent = envelope.decode()?;
            self.handle_delete_trigger(&event.entitlement).await.map(drop)
        } else if name == GrantCreatedEvent::event_name() {
            let event: GrantCreatedEvent = envelope.decode()?;
            let owner = event.grant.owner;
            self.handle_update_trigger(&owner.namespace, &owner.id)
                .await
                .map(drop)
        } else if name == GrantVoidedEvent::event_name() {
            let event: GrantVoidedEvent = envelope.decode()?;
            let owner = event.grant.owner;
            self.handle_update_trigger(&owner.namespace, &owner.id)
                .await
                .map(drop)
        } else if name == EntitlementResetEvent::event_name() {
            let event: EntitlementResetEvent = envelope.decode()?;
            self.handle_update_trigger(&event.namespace, &event.entitlement_id)
                .await
                .map(drop)
        } else if name == IngestEventsFlushed::event_name() {
            self.handle_ingest(envelope.decode()?).await
        } else {
            debug!(%name, "balance worker ignores event");
            Ok(())
        }
    }
}

fn trigger_time() -> DateTime<Utc> {
    let now = Utc::now();
    now.duration_trunc(Duration::milliseconds(1)).unwrap_or(now)
}
