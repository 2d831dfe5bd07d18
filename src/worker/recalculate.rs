use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use lru::LruCache;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{info, warn};

use super::snapshot::SnapshotBuilder;
use crate::bus::Publisher;
use crate::config;
use crate::entitlement::models::{Entitlement, Feature};
use crate::entitlement::repository::{EntitlementRepo, FeatureRepo, SubjectResolver};
use crate::error::{CreditError, CreditResult};
use crate::events::Envelope;

#[derive(Clone, Debug)]
pub struct RecalculatorOptions {
    /// Entitlements deleted within this window still get a delete snapshot.
    pub deleted_window: Duration,
    pub lookup_cache_size: usize,
    pub max_batch_size: usize,
}

impl RecalculatorOptions {
    pub fn from_env() -> Self {
        Self {
            deleted_window: Duration::hours(*config::RECALCULATOR_DELETED_WINDOW_HOURS),
            lookup_cache_size: *config::RECALCULATOR_LOOKUP_CACHE_SIZE,
            max_batch_size: *config::BUS_MAX_BATCH_SIZE,
        }
    }
}

impl Default for RecalculatorOptions {
    fn default() -> Self {
        Self {
            deleted_window: Duration::hours(24),
            lookup_cache_size: 10_000,
            max_batch_size: 100,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecalculationReport {
    pub namespace: String,
    pub processed: usize,
    pub published: usize,
    pub failed: usize,
}

type LookupKey = (String, String);

/// key: recalculator -> full sweep of a namespace's snapshots
///
/// Runs without the high-watermark cache so every entitlement is republished.
pub struct Recalculator {
    entitlements: Arc<dyn EntitlementRepo>,
    features: Arc<dyn FeatureRepo>,
    subjects: Arc<dyn SubjectResolver>,
    snapshots: SnapshotBuilder,
    publisher: Arc<dyn Publisher>,
    options: RecalculatorOptions,
    feature_cache: Mutex<LruCache<LookupKey, Feature>>,
    subject_cache: Mutex<LruCache<LookupKey, Option<String>>>,
}

impl Recalculator {
    pub fn new(
        entitlements: Arc<dyn EntitlementRepo>,
        features: Arc<dyn FeatureRepo>,
        subjects: Arc<dyn SubjectResolver>,
        snapshots: SnapshotBuilder,
        publisher: Arc<dyn Publisher>,
        options: RecalculatorOptions,
    ) -> Self {
        let capacity = NonZeroUsize::new(options.lookup_cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            entitlements,
            features,
            subjects,
            snapshots,
            publisher,
            options,
            feature_cache: Mutex::new(LruCache::new(capacity)),
            subject_cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Republishes a snapshot for every entitlement of `namespace`. Failures are collected;
    /// the sweep continues past them and reports them together at the end.
    pub async fn recalculate(&self, namespace: &str) -> CreditResult<RecalculationReport> {
        let now = Utc::now();
        let entitlements = self
            .entitlements
            .list_entitlements(namespace, now - self.options.deleted_window)
            .await?;

        let batch_size = self.options.max_batch_size.max(1);
        let mut report = RecalculationReport {
            namespace: namespace.to_string(),
            ..RecalculationReport::default()
        };
        let mut errors = Vec::new();
        let mut pending = Vec::with_capacity(batch_size);

        for entitlement in &entitlements {
            report.processed += 1;
            match self.snapshot_envelope(entitlement, now).await {
                Ok(envelope) => pending.push(envelope),
                Err(err) => {
                    warn!(?err, %namespace, entitlement = %entitlement.id, "recalculation failed");
                    report.failed += 1;
                    errors.push(err);
                }
            }

            if pending.len() >= batch_size {
                self.flush(&mut pending, &mut report, &mut errors).await;
            }
        }
        self.flush(&mut pending, &mut report, &mut errors).await;

        info!(
            %namespace,
            processed = report.processed,
            published = report.published,
            failed = report.failed,
            "namespace recalculated"
        );
        match CreditError::join(errors) {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }

    async fn snapshot_envelope(
        &self,
        entitlement: &Entitlement,
        now: DateTime<Utc>,
    ) -> CreditResult<Envelope> {
        let feature = self.feature(entitlement).await?;
        let subject_id = self.subject_id(entitlement).await?;
        let event = if entitlement.is_deleted_at(now) {
            SnapshotBuilder::delete(entitlement, feature, subject_id, now)
        } else {
            self.snapshots
                .update(entitlement, feature, subject_id, now)
                .await?
        };
        Envelope::new(&event)
    }

    async fn flush(
        &self,
        pending: &mut Vec<Envelope>,
        report: &mut RecalculationReport,
        errors: &mut Vec<CreditError>,
    ) {
        if pending.is_empty() {
            return;
        }
        let batch = std::mem::take(pending);
        let count = batch.len();
        match self.publisher.publish_batch(batch).await {
            Ok(()) => report.published += count,
            Err(err) => {
                warn!(?err, namespace = %report.namespace, count, "snapshot batch publish failed");
                report.failed += count;
                errors.push(err);
            }
        }
    }

    async fn feature(&self, entitlement: &Entitlement) -> CreditResult<Feature> {
        let key = (entitlement.namespace.clone(), entitlement.feature_id.clone());
        let cached = self
            .feature_cache
            .lock()
            .ok()
            .and_then(|mut cache| cache.get(&key).cloned());
        if let Some(feature) = cached {
            return Ok(feature);
        }

        let feature = self
            .features
            .get_feature(&entitlement.namespace, &entitlement.feature_id)
            .await?;
        if let Ok(mut cache) = self.feature_cache.lock() {
            cache.put(key, feature.clone());
        }
        Ok(feature)
    }

    async fn subject_id(&self, entitlement: &Entitlement) -> CreditResult<Option<String>> {
        let key = (entitlement.namespace.clone(), entitlement.subject_key.clone());
        let cached = self
            .subject_cache
            .lock()
            .ok()
            .and_then(|mut cache| cache.get(&key).cloned());
        if let Some(subject_id) = cached {
            return Ok(subject_id);
        }

        let subject_id = self
            .subjects
            .subject_id(&entitlement.namespace, &entitlement.subject_key)
            .await?;
        if let Ok(mut cache) = self.subject_cache.lock() {
            cache.put(key, subject_id.clone());
        }
        Ok(subject_id)
    }
}

/// key: recalculator-scheduler -> periodic sweep of the configured namespaces
pub fn spawn(
    recalculator: Arc<Recalculator>,
    namespaces: Vec<String>,
    interval: std::time::Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        loop {
            ticker.tick().await;
            for namespace in &namespaces {
                if let Err(err) = recalculator.recalculate(namespace).await {
                    warn!(?err, %namespace, "recalculation sweep finished with errors");
                }
            }
        }
    })
}
