use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::credit::grant::OwnerRef;
use crate::credit::period::{Period, Recurrence};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EntitlementKind {
    Metered,
    Static,
    Boolean,
}

impl EntitlementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntitlementKind::Metered => "metered",
            EntitlementKind::Static => "static",
            EntitlementKind::Boolean => "boolean",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "metered" => Some(Self::Metered),
            "static" => Some(Self::Static),
            "boolean" => Some(Self::Boolean),
            _ => None,
        }
    }
}

/// key: entitlement-model -> subject-facing right to a feature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entitlement {
    pub id: String,
    pub namespace: String,
    pub subject_key: String,
    pub feature_id: String,
    pub feature_key: String,
    pub kind: EntitlementKind,
    pub measure_usage_from: DateTime<Utc>,
    pub usage_period: Option<Recurrence>,
    pub last_reset: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_soft_limit: bool,
    pub config: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Entitlement {
    /// Grants of a metered entitlement are owned by the entitlement itself.
    pub fn owner(&self) -> OwnerRef {
        OwnerRef::new(self.namespace.clone(), self.id.clone())
    }

    pub fn is_deleted_at(&self, at: DateTime<Utc>) -> bool {
        matches!(self.deleted_at, Some(deleted) if deleted <= at)
    }

    /// Usage period containing `at`, cut short by a manual reset inside it.
    pub fn current_usage_period(&self, at: DateTime<Utc>) -> Option<Period> {
        let mut period = self.usage_period?.period_containing(at);
        if let Some(reset) = self.last_reset {
            if period.from < reset && reset <= at {
                period.from = reset;
            }
        }
        Some(period)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Feature {
    pub id: String,
    pub namespace: String,
    pub key: String,
    pub name: String,
    pub meter_slug: Option<String>,
}

/// Computed state of an entitlement at one instant.
#[derive(Debug, Clone, PartialEq)]
pub enum EntitlementValue {
    Metered {
        balance: f64,
        usage: f64,
        overage: f64,
        has_access: bool,
    },
    Static {
        config: Option<Value>,
    },
    Boolean,
}

impl EntitlementValue {
    pub fn has_access(&self) -> bool {
        match self {
            EntitlementValue::Metered { has_access, .. } => *has_access,
            EntitlementValue::Static { .. } | EntitlementValue::Boolean => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credit::period::RecurrenceInterval;
    use chrono::{Duration, TimeZone};

    #[test]
    fn reset_shortens_the_current_usage_period() {
        let anchor = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap();
        let reset = anchor + Duration::days(10);
        let entitlement = Entitlement {
            id: "ent".into(),
            namespace: "ns".into(),
            subject_key: "customer-1".into(),
            feature_id: "feat".into(),
            feature_key: "tokens".into(),
            kind: EntitlementKind::Metered,
            measure_usage_from: anchor,
            usage_period: Some(Recurrence::new(RecurrenceInterval::Month, anchor)),
            last_reset: Some(reset),
            is_soft_limit: false,
            config: None,
            created_at: anchor,
            deleted_at: None,
        };

        let period = entitlement
            .current_usage_period(anchor + Duration::days(15))
            .unwrap();
        assert_eq!(period.from, reset);
        assert_eq!(period.to, Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).single().unwrap());

        let next = entitlement
            .current_usage_period(anchor + Duration::days(40))
            .unwrap();
        assert_eq!(next.from, Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).single().unwrap());
    }
}
