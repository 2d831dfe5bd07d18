use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::balance::GrantBalanceSnapshot;
use super::grant::{CreateGrantInput, Grant, OwnerRef};
use crate::error::CreditResult;

/// key: credit-grant-repo -> grant persistence keyed by owner
#[async_trait]
pub trait GrantRepo: Send + Sync {
    async fn create_grant(
        &self,
        owner: &OwnerRef,
        input: &CreateGrantInput,
        expires_at: DateTime<Utc>,
    ) -> CreditResult<Grant>;

    async fn get_grant(&self, owner: &OwnerRef, grant_id: &str) -> CreditResult<Grant>;

    async fn void_grant(
        &self,
        owner: &OwnerRef,
        grant_id: &str,
        voided_at: DateTime<Utc>,
    ) -> CreditResult<Grant>;

    /// Grants that are active at any instant of `[from, to]`, voided and deleted ones included.
    async fn list_active_grants_between(
        &self,
        owner: &OwnerRef,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> CreditResult<Vec<Grant>>;
}

/// key: credit-snapshot-repo -> checkpoint persistence keyed by owner
#[async_trait]
pub trait BalanceSnapshotRepo: Send + Sync {
    async fn save(&self, owner: &OwnerRef, snapshots: &[GrantBalanceSnapshot]) -> CreditResult<()>;

    /// Most recent non-invalidated snapshot taken at or before `at`.
    async fn latest_valid_at(
        &self,
        owner: &OwnerRef,
        at: DateTime<Utc>,
    ) -> CreditResult<Option<GrantBalanceSnapshot>>;

    /// Soft-deletes every snapshot strictly after `at`.
    async fn invalidate_after(&self, owner: &OwnerRef, at: DateTime<Utc>) -> CreditResult<()>;
}
