use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::models::{Entitlement, EntitlementKind, EntitlementValue};
use crate::credit::connector::CreditConnector;
use crate::credit::owner::OwnerConnector;
use crate::error::CreditResult;

#[async_trait]
pub trait ValueCalculator: Send + Sync {
    async fn value_at(
        &self,
        entitlement: &Entitlement,
        at: DateTime<Utc>,
    ) -> CreditResult<EntitlementValue>;
}

/// key: entitlement-value -> balance, usage and access of one entitlement
pub struct EntitlementValueResolver {
    credit: Arc<CreditConnector>,
    owners: Arc<dyn OwnerConnector>,
}

impl EntitlementValueResolver {
    pub fn new(credit: Arc<CreditConnector>, owners: Arc<dyn OwnerConnector>) -> Self {
        Self { credit, owners }
    }

    async fn metered_value(
        &self,
        entitlement: &Entitlement,
        at: DateTime<Utc>,
    ) -> CreditResult<EntitlementValue> {
        let owner = entitlement.owner();
        let snapshot = self.credit.get_balance_of_owner(&owner, at).await?;

        let usage_from = match entitlement.current_usage_period(at) {
            Some(period) => period.from,
            None => entitlement.last_reset.unwrap_or(entitlement.measure_usage_from),
        }
        .max(entitlement.measure_usage_from);
        let usage = if usage_from < at {
            self.owners.usage_between(&owner, usage_from, at).await?
        } else {
            0.0
        };

        let balance = snapshot.balance();
        Ok(EntitlementValue::Metered {
            balance,
            usage,
            overage: snapshot.overage,
            has_access: balance > 0.0 || entitlement.is_soft_limit,
        })
    }
}

#[async_trait]
impl ValueCalculator for EntitlementValueResolver {
    async fn value_at(
        &self,
        entitlement: &Entitlement,
        at: DateTime<Utc>,
    ) -> CreditResult<EntitlementValue> {
        match entitlement.kind {
            EntitlementKind::Metered => self.metered_value(entitlement, at).await,
            EntitlementKind::Static => Ok(EntitlementValue::Static {
                config: entitlement.config.clone(),
            }),
            EntitlementKind::Boolean => Ok(EntitlementValue::Boolean),
        }
    }
}
