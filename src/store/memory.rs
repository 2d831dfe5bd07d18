use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::credit::balance::GrantBalanceSnapshot;
use crate::credit::grant::{CreateGrantInput, Grant, OwnerRef};
use crate::credit::repository::{BalanceSnapshotRepo, GrantRepo};
use crate::entitlement::models::{Entitlement, Feature};
use crate::entitlement::repository::{EntitlementRepo, FeatureRepo, MeterUsage, SubjectResolver};
use crate::error::{CreditError, CreditResult};

type Scoped = (String, String);

#[derive(Debug, Clone)]
struct StoredSnapshot {
    seq: u64,
    snapshot: GrantBalanceSnapshot,
    invalidated: bool,
}

#[derive(Debug, Clone, Copy)]
struct UsageEvent {
    at: DateTime<Utc>,
    value: f64,
}

/// key: store-memory -> every repository backed by concurrent maps
///
/// Used by the test suite and for running the worker without a database.
#[derive(Default)]
pub struct MemoryStore {
    grants: DashMap<OwnerRef, Vec<Grant>>,
    snapshots: DashMap<OwnerRef, Vec<StoredSnapshot>>,
    entitlements: DashMap<Scoped, Entitlement>,
    features: DashMap<Scoped, Feature>,
    subjects: DashMap<Scoped, String>,
    // (namespace, meter slug, subject key)
    usage: DashMap<(String, String, String), Vec<UsageEvent>>,
    seq: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_feature(&self, feature: Feature) {
        self.features
            .insert((feature.namespace.clone(), feature.id.clone()), feature);
    }

    pub fn insert_entitlement(&self, entitlement: Entitlement) {
        self.entitlements.insert(
            (entitlement.namespace.clone(), entitlement.id.clone()),
            entitlement,
        );
    }

    pub fn delete_entitlement(&self, namespace: &str, id: &str, at: DateTime<Utc>) -> bool {
        match self
            .entitlements
            .get_mut(&(namespace.to_string(), id.to_string()))
        {
            Some(mut entitlement) => {
                entitlement.deleted_at = Some(at);
                true
            }
            None => false,
        }
    }

    pub fn insert_subject(&self, namespace: &str, key: &str, id: &str) {
        self.subjects
            .insert((namespace.to_string(), key.to_string()), id.to_string());
    }

    pub fn record_usage(
        &self,
        namespace: &str,
        meter_slug: &str,
        subject_key: &str,
        at: DateTime<Utc>,
        value: f64,
    ) {
        self.usage
            .entry((
                namespace.to_string(),
                meter_slug.to_string(),
                subject_key.to_string(),
            ))
            .or_default()
            .push(UsageEvent { at, value });
    }

    /// Valid snapshots of `owner`, oldest first.
    pub fn valid_snapshots(&self, owner: &OwnerRef) -> Vec<GrantBalanceSnapshot> {
        let mut snapshots: Vec<StoredSnapshot> = self
            .snapshots
            .get(owner)
            .map(|stored| stored.iter().filter(|s| !s.invalidated).cloned().collect())
            .unwrap_or_default();
        snapshots.sort_by(|a, b| a.snapshot.at.cmp(&b.snapshot.at).then(a.seq.cmp(&b.seq)));
        snapshots.into_iter().map(|s| s.snapshot).collect()
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }
}

#[async_trait]
impl GrantRepo for MemoryStore {
    async fn create_grant(
        &self,
        owner: &OwnerRef,
        input: &CreateGrantInput,
        expires_at: DateTime<Utc>,
    ) -> CreditResult<Grant> {
        let grant = Grant {
            id: Uuid::new_v4().to_string(),
            owner: owner.clone(),
            amount: input.amount,
            priority: input.priority,
            effective_at: input.effective_at,
            expiration: input.expiration,
            expires_at,
            voided_at: None,
            deleted_at: None,
            recurrence: input.recurrence,
            reset_min_rollover: input.reset_min_rollover,
            reset_max_rollover: input.reset_max_rollover,
            metadata: input.metadata.clone(),
            created_at: Utc::now(),
        };
        self.grants
            .entry(owner.clone())
            .or_default()
            .push(grant.clone());
        Ok(grant)
    }

    async fn get_grant(&self, owner: &OwnerRef, grant_id: &str) -> CreditResult<Grant> {
        self.grants
            .get(owner)
            .and_then(|grants| grants.iter().find(|g| g.id == grant_id).cloned())
            .ok_or_else(|| CreditError::not_found("grant", grant_id))
    }

    async fn void_grant(
        &self,
        owner: &OwnerRef,
        grant_id: &str,
        voided_at: DateTime<Utc>,
    ) -> CreditResult<Grant> {
        let mut grants = self
            .grants
            .get_mut(owner)
            .ok_or_else(|| CreditError::not_found("grant", grant_id))?;
        let grant = grants
            .iter_mut()
            .find(|g| g.id == grant_id)
            .ok_or_else(|| CreditError::not_found("grant", grant_id))?;
        grant.voided_at = Some(voided_at);
        Ok(grant.clone())
    }

    async fn list_active_grants_between(
        &self,
        owner: &OwnerRef,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> CreditResult<Vec<Grant>> {
        let alive_after = |end: Option<DateTime<Utc>>| end.map_or(true, |end| end > from);
        Ok(self
            .grants
            .get(owner)
            .map(|grants| {
                grants
                    .iter()
                    .filter(|g| {
                        g.effective_at <= to
                            && g.expires_at > from
                            && alive_after(g.voided_at)
                            && alive_after(g.deleted_at)
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[async_trait]
impl BalanceSnapshotRepo for MemoryStore {
    async fn save(&self, owner: &OwnerRef, snapshots: &[GrantBalanceSnapshot]) -> CreditResult<()> {
        let stored: Vec<StoredSnapshot> = snapshots
            .iter()
            .map(|snapshot| StoredSnapshot {
                seq: self.next_seq(),
                snapshot: snapshot.clone(),
                invalidated: false,
            })
            .collect();
        self.snapshots
            .entry(owner.clone())
            .or_default()
            .extend(stored);
        Ok(())
    }

    async fn latest_valid_at(
        &self,
        owner: &OwnerRef,
        at: DateTime<Utc>,
    ) -> CreditResult<Option<GrantBalanceSnapshot>> {
        Ok(self.snapshots.get(owner).and_then(|stored| {
            stored
                .iter()
                .filter(|s| !s.invalidated && s.snapshot.at <= at)
                .max_by(|a, b| a.snapshot.at.cmp(&b.snapshot.at).then(a.seq.cmp(&b.seq)))
                .map(|s| s.snapshot.clone())
        }))
    }

    async fn invalidate_after(&self, owner: &OwnerRef, at: DateTime<Utc>) -> CreditResult<()> {
        if let Some(mut stored) = self.snapshots.get_mut(owner) {
            for snapshot in stored.iter_mut().filter(|s| s.snapshot.at > at) {
                snapshot.invalidated = true;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl EntitlementRepo for MemoryStore {
    async fn get_entitlement(&self, namespace: &str, id: &str) -> CreditResult<Entitlement> {
        self.entitlements
            .get(&(namespace.to_string(), id.to_string()))
            .map(|entitlement| entitlement.clone())
            .ok_or_else(|| CreditError::not_found("entitlement", id))
    }

    async fn list_affected_by_meters(
        &self,
        namespace: &str,
        subject_key: &str,
        meter_slugs: &[String],
    ) -> CreditResult<Vec<Entitlement>> {
        let now = Utc::now();
        let mut affected: Vec<Entitlement> = self
            .entitlements
            .iter()
            .filter(|entry| {
                let entitlement = entry.value();
                entitlement.namespace == namespace
                    && entitlement.subject_key == subject_key
                    && !entitlement.is_deleted_at(now)
            })
            .map(|entry| entry.value().clone())
            .collect();
        affected.retain(|entitlement| {
            self.features
                .get(&(namespace.to_string(), entitlement.feature_id.clone()))
                .and_then(|feature| feature.meter_slug.clone())
                .map_or(false, |slug| meter_slugs.contains(&slug))
        });
        affected.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(affected)
    }

    async fn list_entitlements(
        &self,
        namespace: &str,
        deleted_after: DateTime<Utc>,
    ) -> CreditResult<Vec<Entitlement>> {
        let mut entitlements: Vec<Entitlement> = self
            .entitlements
            .iter()
            .filter(|entry| {
                let entitlement = entry.value();
                entitlement.namespace == namespace
                    && entitlement
                        .deleted_at
                        .map_or(true, |deleted| deleted > deleted_after)
            })
            .map(|entry| entry.value().clone())
            .collect();
        entitlements.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(entitlements)
    }

    async fn record_reset(
        &self,
        namespace: &str,
        id: &str,
        reset_at: DateTime<Utc>,
    ) -> CreditResult<()> {
        let mut entitlement = self
            .entitlements
            .get_mut(&(namespace.to_string(), id.to_string()))
            .ok_or_else(|| CreditError::not_found("entitlement", id))?;
        entitlement.last_reset = Some(reset_at);
        Ok(())
    }
}

#[async_trait]
impl FeatureRepo for MemoryStore {
    async fn get_feature(&self, namespace: &str, id: &str) -> CreditResult<Feature> {
        self.features
            .get(&(namespace.to_string(), id.to_string()))
            .map(|feature| feature.clone())
            .ok_or_else(|| CreditError::not_found("feature", id))
    }
}

#[async_trait]
impl SubjectResolver for MemoryStore {
    async fn subject_id(&self, namespace: &str, subject_key: &str) -> CreditResult<Option<String>> {
        Ok(self
            .subjects
            .get(&(namespace.to_string(), subject_key.to_string()))
            .map(|id| id.clone()))
    }
}

#[async_trait]
impl MeterUsage for MemoryStore {
    async fn usage(
        &self,
        namespace: &str,
        meter_slug: &str,
        subject_key: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> CreditResult<f64> {
        let key = (
            namespace.to_string(),
            meter_slug.to_string(),
            subject_key.to_string(),
        );
        Ok(self
            .usage
            .get(&key)
            .map(|events| {
                events
                    .iter()
                    .filter(|event| from <= event.at && event.at < to)
                    .map(|event| event.value)
                    .sum()
            })
            .unwrap_or(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    use crate::credit::balance::BalanceMap;
    use crate::credit::grant::{ExpirationDuration, ExpirationPeriod};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).single().unwrap()
    }

    fn snapshot(at: DateTime<Utc>, balance: f64) -> GrantBalanceSnapshot {
        GrantBalanceSnapshot {
            balances: BalanceMap::from_iter([("g".to_string(), balance)]),
            overage: 0.0,
            at,
        }
    }

    #[tokio::test]
    async fn invalidated_snapshots_are_never_returned() {
        let store = MemoryStore::new();
        let owner = OwnerRef::new("ns", "ent");
        store
            .save(
                &owner,
                &[snapshot(t0(), 10.0), snapshot(t0() + Duration::hours(2), 5.0)],
            )
            .await
            .unwrap();

        let latest = store
            .latest_valid_at(&owner, t0() + Duration::hours(3))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.at, t0() + Duration::hours(2));

        store
            .invalidate_after(&owner, t0() + Duration::hours(1))
            .await
            .unwrap();
        let latest = store
            .latest_valid_at(&owner, t0() + Duration::hours(3))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.at, t0());
        assert!(store
            .latest_valid_at(&owner, t0() - Duration::seconds(1))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn grant_listing_includes_grants_that_expire_inside_the_window() {
        let store = MemoryStore::new();
        let owner = OwnerRef::new("ns", "ent");
        let expiration = ExpirationPeriod::new(ExpirationDuration::Day, 1);
        let input = CreateGrantInput::new(10.0, t0(), expiration);
        let grant = store
            .create_grant(&owner, &input, expiration.expires_at(t0()))
            .await
            .unwrap();

        let window = store
            .list_active_grants_between(&owner, t0() + Duration::hours(12), t0() + Duration::days(3))
            .await
            .unwrap();
        assert_eq!(window.len(), 1);

        let later = store
            .list_active_grants_between(&owner, t0() + Duration::days(1), t0() + Duration::days(3))
            .await
            .unwrap();
        assert!(later.is_empty());

        store
            .void_grant(&owner, &grant.id, t0() + Duration::hours(1))
            .await
            .unwrap();
        let after_void = store
            .list_active_grants_between(&owner, t0() + Duration::hours(2), t0() + Duration::days(3))
            .await
            .unwrap();
        assert!(after_void.is_empty());
    }

    #[tokio::test]
    async fn usage_is_summed_over_a_half_open_window() {
        let store = MemoryStore::new();
        store.record_usage("ns", "tokens", "customer-1", t0(), 5.0);
        store.record_usage("ns", "tokens", "customer-1", t0() + Duration::hours(1), 7.0);
        store.record_usage("ns", "tokens", "customer-2", t0(), 100.0);

        let usage = store
            .usage("ns", "tokens", "customer-1", t0(), t0() + Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(usage, 5.0);
    }
}
