use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::credit::grant::Grant;
use crate::credit::period::Period;
use crate::entitlement::models::{Entitlement, EntitlementValue, Feature};
use crate::error::{CreditError, CreditResult};

/// `subsystem.vN.name`, e.g. `credit.v1.grant.created`.
static EVENT_NAME_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z][a-z0-9_-]*\.v[0-9]+\.[a-z][a-z0-9_-]*(\.[a-z][a-z0-9_-]*)*$")
        .expect("event name pattern must compile")
});

pub fn is_valid_event_name(name: &str) -> bool {
    EVENT_NAME_PATTERN.is_match(name)
}

/// key: events-envelope -> versioned, namespaced transport unit
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    pub name: String,
    /// Routing key; events for the same subject share it.
    pub subject: String,
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    pub payload: Value,
}

impl Envelope {
    pub fn new<E: DomainEvent>(event: &E) -> CreditResult<Self> {
        event.validate()?;
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            name: E::event_name(),
            subject: event.subject(),
            time: Utc::now(),
            metadata: BTreeMap::new(),
            payload: serde_json::to_value(event)?,
        })
    }

    /// Decodes and validates the payload. A malformed payload is a permanent failure.
    pub fn decode<E: DomainEvent>(&self) -> CreditResult<E> {
        let expected = E::event_name();
        if self.name != expected {
            return Err(CreditError::validation(format!(
                "envelope `{}` cannot be decoded as `{expected}`",
                self.name
            )));
        }
        let event: E = serde_json::from_value(self.payload.clone())?;
        event.validate()?;
        Ok(event)
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn metadata_counter(&self, key: &str) -> u32 {
        self.metadata
            .get(key)
            .and_then(|value| value.parse().ok())
            .unwrap_or(0)
    }
}

pub trait DomainEvent: Serialize + DeserializeOwned + Send + Sync {
    const SUBSYSTEM: &'static str;
    const VERSION: u32;
    const NAME: &'static str;

    fn event_name() -> String {
        format!("{}.v{}.{}", Self::SUBSYSTEM, Self::VERSION, Self::NAME)
    }

    fn subject(&self) -> String;

    fn validate(&self) -> CreditResult<()> {
        Ok(())
    }
}

fn subject_route(namespace: &str, subject_key: &str) -> String {
    format!("/namespace/{namespace}/subject/{subject_key}")
}

fn require(field: &str, value: &str) -> CreditResult<()> {
    if value.trim().is_empty() {
        return Err(CreditError::validation(format!("{field} must not be empty")));
    }
    Ok(())
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitlementCreatedEvent {
    pub entitlement: Entitlement,
}

impl DomainEvent for EntitlementCreatedEvent {
    const SUBSYSTEM: &'static str = "entitlement";
    const VERSION: u32 = 1;
    const NAME: &'static str = "entitlement.created";

    fn subject(&self) -> String {
        subject_route(&self.entitlement.namespace, &self.entitlement.subject_key)
    }

    fn validate(&self) -> CreditResult<()> {
        require("entitlement.id", &self.entitlement.id)?;
        require("entitlement.namespace", &self.entitlement.namespace)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitlementDeletedEvent {
    pub entitlement: Entitlement,
}

impl DomainEvent for EntitlementDeletedEvent {
    const SUBSYSTEM: &'static str = "entitlement";
    const VERSION: u32 = 1;
    const NAME: &'static str = "entitlement.deleted";

    fn subject(&self) -> String {
        subject_route(&self.entitlement.namespace, &self.entitlement.subject_key)
    }

    fn validate(&self) -> CreditResult<()> {
        require("entitlement.id", &self.entitlement.id)?;
        require("entitlement.namespace", &self.entitlement.namespace)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitlementResetEvent {
    pub entitlement_id: String,
    pub namespace: String,
    pub subject_key: String,
    pub reset_at: DateTime<Utc>,
}

impl DomainEvent for EntitlementResetEvent {
    const SUBSYSTEM: &'static str = "entitlement";
    const VERSION: u32 = 1;
    const NAME: &'static str = "usage.reset";

    fn subject(&self) -> String {
        subject_route(&self.namespace, &self.subject_key)
    }

    fn validate(&self) -> CreditResult<()> {
        require("entitlementId", &self.entitlement_id)?;
        require("namespace", &self.namespace)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrantCreatedEvent {
    pub grant: Grant,
}

impl DomainEvent for GrantCreatedEvent {
    const SUBSYSTEM: &'static str = "credit";
    const VERSION: u32 = 1;
    const NAME: &'static str = "grant.created";

    fn subject(&self) -> String {
        format!(
            "/namespace/{}/owner/{}",
            self.grant.owner.namespace, self.grant.owner.id
        )
    }

    fn validate(&self) -> CreditResult<()> {
        require("grant.owner.namespace", &self.grant.owner.namespace)?;
        require("grant.owner.id", &self.grant.owner.id)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrantVoidedEvent {
    pub grant: Grant,
}

impl DomainEvent for GrantVoidedEvent {
    const SUBSYSTEM: &'static str = "credit";
    const VERSION: u32 = 1;
    const NAME: &'static str = "grant.voided";

    fn subject(&self) -> String {
        format!(
            "/namespace/{}/owner/{}",
            self.grant.owner.namespace, self.grant.owner.id
        )
    }

    fn validate(&self) -> CreditResult<()> {
        require("grant.owner.namespace", &self.grant.owner.namespace)?;
        require("grant.owner.id", &self.grant.owner.id)?;
        if self.grant.voided_at.is_none() {
            return Err(CreditError::validation("voided grant carries no voidedAt"));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestedSubjectMeters {
    pub subject_key: String,
    pub meter_slugs: Vec<String>,
}

/// Batch of subjects whose meters received new usage.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestEventsFlushed {
    pub namespace: String,
    pub entries: Vec<IngestedSubjectMeters>,
}

impl DomainEvent for IngestEventsFlushed {
    const SUBSYSTEM: &'static str = "ingest";
    const VERSION: u32 = 1;
    const NAME: &'static str = "events.flushed";

    fn subject(&self) -> String {
        format!("/namespace/{}", self.namespace)
    }

    fn validate(&self) -> CreditResult<()> {
        require("namespace", &self.namespace)?;
        if self.entries.is_empty() {
            return Err(CreditError::validation("ingest batch carries no entries"));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotOperation {
    Update,
    Delete,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotSubject {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

/// Public value shape: only the fields meaningful for the entitlement kind are present.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotValue {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub balance: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overage: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_access: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
}

impl From<&EntitlementValue> for SnapshotValue {
    fn from(value: &EntitlementValue) -> Self {
        match value {
            EntitlementValue::Metered {
                balance,
                usage,
                overage,
                has_access,
            } => SnapshotValue {
                balance: Some(*balance),
                usage: Some(*usage),
                overage: Some(*overage),
                has_access: Some(*has_access),
                config: None,
            },
            EntitlementValue::Static { config } => SnapshotValue {
                has_access: Some(true),
                config: config.clone(),
                ..SnapshotValue::default()
            },
            EntitlementValue::Boolean => SnapshotValue {
                has_access: Some(true),
                ..SnapshotValue::default()
            },
        }
    }
}

/// key: events-snapshot -> published downstream on every balance change
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitlementSnapshotEvent {
    pub entitlement: Entitlement,
    pub namespace: String,
    pub subject: SnapshotSubject,
    pub feature: Feature,
    pub operation: SnapshotOperation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub calculated_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<SnapshotValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_usage_period: Option<Period>,
}

impl DomainEvent for EntitlementSnapshotEvent {
    const SUBSYSTEM: &'static str = "entitlement";
    const VERSION: u32 = 1;
    const NAME: &'static str = "snapshot";

    fn subject(&self) -> String {
        subject_route(&self.namespace, &self.subject.key)
    }

    fn validate(&self) -> CreditResult<()> {
        require("namespace", &self.namespace)?;
        match self.operation {
            SnapshotOperation::Update if self.value.is_none() => Err(CreditError::validation(
                "update snapshot must carry a value",
            )),
            SnapshotOperation::Delete if self.value.is_some() => Err(CreditError::validation(
                "delete snapshot must not carry a value",
            )),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_names_follow_the_versioned_pattern() {
        for name in [
            EntitlementCreatedEvent::event_name(),
            EntitlementDeletedEvent::event_name(),
            EntitlementResetEvent::event_name(),
            GrantCreatedEvent::event_name(),
            GrantVoidedEvent::event_name(),
            IngestEventsFlushed::event_name(),
            EntitlementSnapshotEvent::event_name(),
        ] {
            assert!(is_valid_event_name(&name), "{name} should be valid");
        }
        assert_eq!(GrantCreatedEvent::event_name(), "credit.v1.grant.created");
        assert!(!is_valid_event_name("credit.grant.created"));
        assert!(!is_valid_event_name("Credit.v1.grant"));
    }

    #[test]
    fn envelope_rejects_mismatched_and_malformed_payloads() {
        let event = IngestEventsFlushed {
            namespace: "ns".into(),
            entries: vec![IngestedSubjectMeters {
                subject_key: "customer-1".into(),
                meter_slugs: vec!["tokens".into()],
            }],
        };
        let envelope = Envelope::new(&event).unwrap();
        assert_eq!(envelope.subject, "/namespace/ns");
        assert_eq!(envelope.decode::<IngestEventsFlushed>().unwrap(), event);

        let err = envelope.decode::<EntitlementResetEvent>().unwrap_err();
        assert!(!err.is_retryable());

        let mut broken = envelope.clone();
        broken.payload = serde_json::json!({ "namespace": "ns" });
        assert!(!broken.decode::<IngestEventsFlushed>().unwrap_err().is_retryable());

        let empty = IngestEventsFlushed {
            namespace: "ns".into(),
            entries: Vec::new(),
        };
        assert!(Envelope::new(&empty).is_err());
    }

    #[test]
    fn metered_value_maps_to_the_public_shape() {
        let value = SnapshotValue::from(&EntitlementValue::Metered {
            balance: 30.0,
            usage: 120.0,
            overage: 0.0,
            has_access: true,
        });
        let json = serde_json::to_value(&value).unwrap();
        assert_eq!(json["hasAccess"], true);
        assert_eq!(json["balance"], 30.0);
        assert!(json.get("config").is_none());

        let boolean = serde_json::to_value(SnapshotValue::from(&EntitlementValue::Boolean)).unwrap();
        assert_eq!(boolean, serde_json::json!({ "hasAccess": true }));
    }
}
