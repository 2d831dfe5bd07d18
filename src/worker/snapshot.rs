use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::entitlement::models::{Entitlement, Feature};
use crate::entitlement::value::ValueCalculator;
use crate::error::CreditResult;
use crate::events::{EntitlementSnapshotEvent, SnapshotOperation, SnapshotSubject, SnapshotValue};

/// Builds the `entitlement.v1.snapshot` payloads shared by the worker and the recalculator.
/// Callers resolve the feature and subject id, each with their own lookup strategy.
#[derive(Clone)]
pub struct SnapshotBuilder {
    values: Arc<dyn ValueCalculator>,
}

impl SnapshotBuilder {
    pub fn new(values: Arc<dyn ValueCalculator>) -> Self {
        Self { values }
    }

    pub async fn update(
        &self,
        entitlement: &Entitlement,
        feature: Feature,
        subject_id: Option<String>,
        at: DateTime<Utc>,
    ) -> CreditResult<EntitlementSnapshotEvent> {
        let value = self.values.value_at(entitlement, at).await?;
        Ok(EntitlementSnapshotEvent {
            entitlement: entitlement.clone(),
            namespace: entitlement.namespace.clone(),
            subject: SnapshotSubject {
                key: entitlement.subject_key.clone(),
                id: subject_id,
            },
            feature,
            operation: SnapshotOperation::Update,
            calculated_at: Some(at),
            value: Some(SnapshotValue::from(&value)),
            current_usage_period: entitlement.current_usage_period(at),
        })
    }

    pub fn delete(
        entitlement: &Entitlement,
        feature: Feature,
        subject_id: Option<String>,
        at: DateTime<Utc>,
    ) -> EntitlementSnapshotEvent {
        EntitlementSnapshotEvent {
            entitlement: entitlement.clone(),
            namespace: entitlement.namespace.clone(),
            subject: SnapshotSubject {
                key: entitlement.subject_key.clone(),
                id: subject_id,
            },
            feature,
            operation: SnapshotOperation::Delete,
            calculated_at: Some(at),
            value: None,
            current_usage_period: None,
        }
    }
}
