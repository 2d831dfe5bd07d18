use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lru::LruCache;
use tracing::warn;

use super::models::EntitlementKind;
use super::repository::{EntitlementRepo, FeatureRepo, MeterUsage};
use crate::config;
use crate::credit::grant::OwnerRef;
use crate::credit::owner::{OwnerConnector, OwnerMeta};
use crate::error::{CreditError, CreditResult};

#[derive(Clone, Debug)]
struct MeterBinding {
    subject_key: String,
    meter_slug: String,
}

/// key: entitlement-owner -> metered entitlements as credit owners
///
/// The subject and meter an entitlement measures never change; resolved bindings are kept
/// in a bounded LRU and looked up again after eviction.
pub struct EntitlementOwner {
    entitlements: Arc<dyn EntitlementRepo>,
    features: Arc<dyn FeatureRepo>,
    meters: Arc<dyn MeterUsage>,
    bindings: Mutex<LruCache<OwnerRef, MeterBinding>>,
}

impl EntitlementOwner {
    pub fn new(
        entitlements: Arc<dyn EntitlementRepo>,
        features: Arc<dyn FeatureRepo>,
        meters: Arc<dyn MeterUsage>,
    ) -> Self {
        Self::with_cache_size(entitlements, features, meters, *config::OWNER_BINDING_CACHE_SIZE)
    }

    pub fn with_cache_size(
        entitlements: Arc<dyn EntitlementRepo>,
        features: Arc<dyn FeatureRepo>,
        meters: Arc<dyn MeterUsage>,
        cache_size: usize,
    ) -> Self {
        let capacity = NonZeroUsize::new(cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            entitlements,
            features,
            meters,
            bindings: Mutex::new(LruCache::new(capacity)),
        }
    }

    async fn binding(&self, owner: &OwnerRef) -> CreditResult<MeterBinding> {
        let cached = match self.bindings.lock() {
            Ok(mut bindings) => bindings.get(owner).cloned(),
            Err(_) => {
                warn!(owner = %owner, "meter binding cache poisoned, resolving from repository");
                None
            }
        };
        if let Some(binding) = cached {
            return Ok(binding);
        }

        let entitlement = self
            .entitlements
            .get_entitlement(&owner.namespace, &owner.id)
            .await?;
        let feature = self
            .features
            .get_feature(&owner.namespace, &entitlement.feature_id)
            .await?;
        let meter_slug = feature.meter_slug.ok_or_else(|| {
            CreditError::validation(format!(
                "feature {} of entitlement {} is not backed by a meter",
                feature.key, owner.id
            ))
        })?;

        let binding = MeterBinding {
            subject_key: entitlement.subject_key,
            meter_slug,
        };
        if let Ok(mut bindings) = self.bindings.lock() {
            bindings.put(owner.clone(), binding.clone());
        }
        Ok(binding)
    }
}

#[async_trait]
impl OwnerConnector for EntitlementOwner {
    async fn describe_owner(&self, owner: &OwnerRef) -> CreditResult<OwnerMeta> {
        let entitlement = self
            .entitlements
            .get_entitlement(&owner.namespace, &owner.id)
            .await?;
        if entitlement.kind != EntitlementKind::Metered {
            return Err(CreditError::validation(format!(
                "entitlement {} is {} and cannot own grants",
                owner.id,
                entitlement.kind.as_str()
            )));
        }

        Ok(OwnerMeta {
            owner: owner.clone(),
            subject_key: entitlement.subject_key,
            start_of_measurement: entitlement.measure_usage_from,
            last_reset: entitlement.last_reset,
        })
    }

    async fn usage_between(
        &self,
        owner: &OwnerRef,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> CreditResult<f64> {
        let binding = self.binding(owner).await?;
        self.meters
            .usage(
                &owner.namespace,
                &binding.meter_slug,
                &binding.subject_key,
                from,
                to,
            )
            .await
    }

    async fn end_current_usage_period(
        &self,
        owner: &OwnerRef,
        at: DateTime<Utc>,
    ) -> CreditResult<()> {
        self.entitlements
            .record_reset(&owner.namespace, &owner.id, at)
            .await
    }
}
