use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::models::{Entitlement, Feature};
use crate::error::CreditResult;

#[async_trait]
pub trait EntitlementRepo: Send + Sync {
    /// Fetches an entitlement by id, deleted ones included.
    async fn get_entitlement(&self, namespace: &str, id: &str) -> CreditResult<Entitlement>;

    /// Live entitlements of `subject_key` whose feature is backed by one of `meter_slugs`.
    async fn list_affected_by_meters(
        &self,
        namespace: &str,
        subject_key: &str,
        meter_slugs: &[String],
    ) -> CreditResult<Vec<Entitlement>>;

    /// Every entitlement of the namespace, plus those deleted after `deleted_after`.
    async fn list_entitlements(
        &self,
        namespace: &str,
        deleted_after: DateTime<Utc>,
    ) -> CreditResult<Vec<Entitlement>>;

    async fn record_reset(
        &self,
        namespace: &str,
        id: &str,
        reset_at: DateTime<Utc>,
    ) -> CreditResult<()>;
}

#[async_trait]
pub trait FeatureRepo: Send + Sync {
    async fn get_feature(&self, namespace: &str, id: &str) -> CreditResult<Feature>;
}

/// Maps subject keys onto the external identifiers downstream consumers expect.
#[async_trait]
pub trait SubjectResolver: Send + Sync {
    async fn subject_id(&self, namespace: &str, subject_key: &str) -> CreditResult<Option<String>>;
}

/// Read side of the metering engine.
#[async_trait]
pub trait MeterUsage: Send + Sync {
    async fn usage(
        &self,
        namespace: &str,
        meter_slug: &str,
        subject_key: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> CreditResult<f64>;
}
