use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::grant::OwnerRef;
use crate::error::CreditResult;

#[derive(Debug, Clone, PartialEq)]
pub struct OwnerMeta {
    pub owner: OwnerRef,
    pub subject_key: String,
    /// Balances are replayed from here when no snapshot exists.
    pub start_of_measurement: DateTime<Utc>,
    pub last_reset: Option<DateTime<Utc>>,
}

/// Whatever holds the grants: the credit connector only needs these answers from it.
#[async_trait]
pub trait OwnerConnector: Send + Sync {
    async fn describe_owner(&self, owner: &OwnerRef) -> CreditResult<OwnerMeta>;

    async fn usage_between(
        &self,
        owner: &OwnerRef,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> CreditResult<f64>;

    async fn end_current_usage_period(
        &self,
        owner: &OwnerRef,
        at: DateTime<Utc>,
    ) -> CreditResult<()>;
}
