use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::credit::balance::{BalanceMap, GrantBalanceSnapshot};
use crate::credit::grant::{
    CreateGrantInput, ExpirationDuration, ExpirationPeriod, Grant, OwnerRef,
};
use crate::credit::period::{Recurrence, RecurrenceInterval};
use crate::credit::repository::{BalanceSnapshotRepo, GrantRepo};
use crate::entitlement::models::{Entitlement, EntitlementKind, Feature};
use crate::entitlement::repository::{EntitlementRepo, FeatureRepo, MeterUsage, SubjectResolver};
use crate::error::{CreditError, CreditResult};

const GRANT_COLUMNS: &str = "id, namespace, owner_id, amount, priority, effective_at, \
    expiration_duration, expiration_count, expires_at, voided_at, deleted_at, \
    recurrence_interval, recurrence_anchor, reset_min_rollover, reset_max_rollover, \
    metadata, created_at";

const ENTITLEMENT_COLUMNS: &str = "e.namespace, e.id, e.subject_key, e.feature_id, \
    e.feature_key, e.kind, e.measure_usage_from, e.usage_period_interval, \
    e.usage_period_anchor, e.last_reset, e.is_soft_limit, e.config, e.created_at, e.deleted_at";

#[derive(Debug, FromRow)]
struct GrantRow {
    id: Uuid,
    namespace: String,
    owner_id: String,
    amount: f64,
    priority: i16,
    effective_at: DateTime<Utc>,
    expiration_duration: String,
    expiration_count: i32,
    expires_at: DateTime<Utc>,
    voided_at: Option<DateTime<Utc>>,
    deleted_at: Option<DateTime<Utc>>,
    recurrence_interval: Option<String>,
    recurrence_anchor: Option<DateTime<Utc>>,
    reset_min_rollover: f64,
    reset_max_rollover: f64,
    metadata: Json<BTreeMap<String, String>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<GrantRow> for Grant {
    type Error = CreditError;

    fn try_from(row: GrantRow) -> CreditResult<Self> {
        let duration = ExpirationDuration::from_str(&row.expiration_duration).ok_or_else(|| {
            CreditError::validation(format!(
                "unknown expiration duration `{}`",
                row.expiration_duration
            ))
        })?;
        let count = u32::try_from(row.expiration_count)
            .map_err(|_| CreditError::validation("negative expiration count"))?;
        let priority = u8::try_from(row.priority)
            .map_err(|_| CreditError::validation(format!("priority {} out of range", row.priority)))?;

        Ok(Grant {
            id: row.id.to_string(),
            owner: OwnerRef::new(row.namespace, row.owner_id),
            amount: row.amount,
            priority,
            effective_at: row.effective_at,
            expiration: ExpirationPeriod::new(duration, count),
            expires_at: row.expires_at,
            voided_at: row.voided_at,
            deleted_at: row.deleted_at,
            recurrence: recurrence(row.recurrence_interval, row.recurrence_anchor)?,
            reset_min_rollover: row.reset_min_rollover,
            reset_max_rollover: row.reset_max_rollover,
            metadata: row.metadata.0,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct EntitlementRow {
    namespace: String,
    id: String,
    subject_key: String,
    feature_id: String,
    feature_key: String,
    kind: String,
    measure_usage_from: DateTime<Utc>,
    usage_period_interval: Option<String>,
    usage_period_anchor: Option<DateTime<Utc>>,
    last_reset: Option<DateTime<Utc>>,
    is_soft_limit: bool,
    config: Option<Value>,
    created_at: DateTime<Utc>,
    deleted_at: Option<DateTime<Utc>>,
}

impl TryFrom<EntitlementRow> for Entitlement {
    type Error = CreditError;

    fn try_from(row: EntitlementRow) -> CreditResult<Self> {
        let kind = EntitlementKind::from_str(&row.kind).ok_or_else(|| {
            CreditError::validation(format!("unknown entitlement kind `{}`", row.kind))
        })?;
        Ok(Entitlement {
            id: row.id,
            namespace: row.namespace,
            subject_key: row.subject_key,
            feature_id: row.feature_id,
            feature_key: row.feature_key,
            kind,
            measure_usage_from: row.measure_usage_from,
            usage_period: recurrence(row.usage_period_interval, row.usage_period_anchor)?,
            last_reset: row.last_reset,
            is_soft_limit: row.is_soft_limit,
            config: row.config,
            created_at: row.created_at,
            deleted_at: row.deleted_at,
        })
    }
}

#[derive(Debug, FromRow)]
struct FeatureRow {
    namespace: String,
    id: String,
    key: String,
    name: String,
    meter_slug: Option<String>,
}

#[derive(Debug, FromRow)]
struct SnapshotRow {
    at: DateTime<Utc>,
    balances: Json<BalanceMap>,
    overage: f64,
}

fn recurrence(
    interval: Option<String>,
    anchor: Option<DateTime<Utc>>,
) -> CreditResult<Option<Recurrence>> {
    match (interval, anchor) {
        (Some(interval), Some(anchor)) => {
            let interval = RecurrenceInterval::from_str(&interval).ok_or_else(|| {
                CreditError::validation(format!("unknown recurrence interval `{interval}`"))
            })?;
            Ok(Some(Recurrence::new(interval, anchor)))
        }
        _ => Ok(None),
    }
}

fn parse_grant_id(grant_id: &str) -> CreditResult<Uuid> {
    Uuid::parse_str(grant_id).map_err(|_| CreditError::not_found("grant", grant_id))
}

/// key: store-postgres -> sqlx-backed repositories
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn upsert_feature(&self, feature: &Feature) -> CreditResult<()> {
        sqlx::query(
            r#"
            INSERT INTO features (namespace, id, key, name, meter_slug)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (namespace, id)
            DO UPDATE SET key = EXCLUDED.key, name = EXCLUDED.name, meter_slug = EXCLUDED.meter_slug
            "#,
        )
        .bind(&feature.namespace)
        .bind(&feature.id)
        .bind(&feature.key)
        .bind(&feature.name)
        .bind(&feature.meter_slug)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn insert_entitlement(&self, entitlement: &Entitlement) -> CreditResult<()> {
        sqlx::query(
            r#"
            INSERT INTO entitlements (
                namespace, id, subject_key, feature_id, feature_key, kind, measure_usage_from,
                usage_period_interval, usage_period_anchor, last_reset, is_soft_limit, config,
                created_at, deleted_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(&entitlement.namespace)
        .bind(&entitlement.id)
        .bind(&entitlement.subject_key)
        .bind(&entitlement.feature_id)
        .bind(&entitlement.feature_key)
        .bind(entitlement.kind.as_str())
        .bind(entitlement.measure_usage_from)
        .bind(entitlement.usage_period.map(|p| p.interval.as_str()))
        .bind(entitlement.usage_period.map(|p| p.anchor))
        .bind(entitlement.last_reset)
        .bind(entitlement.is_soft_limit)
        .bind(&entitlement.config)
        .bind(entitlement.created_at)
        .bind(entitlement.deleted_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_entitlement(
        &self,
        namespace: &str,
        id: &str,
        at: DateTime<Utc>,
    ) -> CreditResult<()> {
        let result = sqlx::query(
            "UPDATE entitlements SET deleted_at = $3 WHERE namespace = $1 AND id = $2 AND deleted_at IS NULL",
        )
        .bind(namespace)
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(CreditError::not_found("entitlement", id));
        }
        Ok(())
    }

    pub async fn upsert_subject(&self, namespace: &str, key: &str, id: &str) -> CreditResult<()> {
        sqlx::query(
            r#"
            INSERT INTO subjects (namespace, key, id) VALUES ($1, $2, $3)
            ON CONFLICT (namespace, key) DO UPDATE SET id = EXCLUDED.id
            "#,
        )
        .bind(namespace)
        .bind(key)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn record_usage(
        &self,
        namespace: &str,
        meter_slug: &str,
        subject_key: &str,
        at: DateTime<Utc>,
        value: f64,
    ) -> CreditResult<()> {
        sqlx::query(
            "INSERT INTO usage_events (namespace, meter_slug, subject_key, occurred_at, value) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(namespace)
        .bind(meter_slug)
        .bind(subject_key)
        .bind(at)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl GrantRepo for PgStore {
    async fn create_grant(
        &self,
        owner: &OwnerRef,
        input: &CreateGrantInput,
        expires_at: DateTime<Utc>,
    ) -> CreditResult<Grant> {
        let sql = format!(
            r#"
            INSERT INTO credit_grants (
                id, namespace, owner_id, amount, priority, effective_at, expiration_duration,
                expiration_count, expires_at, recurrence_interval, recurrence_anchor,
                reset_min_rollover, reset_max_rollover, metadata
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            RETURNING {GRANT_COLUMNS}
            "#
        );
        let count = i32::try_from(input.expiration.count)
            .map_err(|_| CreditError::validation("expiration count too large"))?;
        let row = sqlx::query_as::<_, GrantRow>(&sql)
            .bind(Uuid::new_v4())
            .bind(&owner.namespace)
            .bind(&owner.id)
            .bind(input.amount)
            .bind(i16::from(input.priority))
            .bind(input.effective_at)
            .bind(input.expiration.duration.as_str())
            .bind(count)
            .bind(expires_at)
            .bind(input.recurrence.map(|r| r.interval.as_str()))
            .bind(input.recurrence.map(|r| r.anchor))
            .bind(input.reset_min_rollover)
            .bind(input.reset_max_rollover)
            .bind(Json(&input.metadata))
            .fetch_one(&self.pool)
            .await?;
        row.try_into()
    }

    async fn get_grant(&self, owner: &OwnerRef, grant_id: &str) -> CreditResult<Grant> {
        let id = parse_grant_id(grant_id)?;
        let sql = format!(
            "SELECT {GRANT_COLUMNS} FROM credit_grants WHERE namespace = $1 AND owner_id = $2 AND id = $3"
        );
        sqlx::query_as::<_, GrantRow>(&sql)
            .bind(&owner.namespace)
            .bind(&owner.id)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| CreditError::not_found("grant", grant_id))?
            .try_into()
    }

    async fn void_grant(
        &self,
        owner: &OwnerRef,
        grant_id: &str,
        voided_at: DateTime<Utc>,
    ) -> CreditResult<Grant> {
        let id = parse_grant_id(grant_id)?;
        let sql = format!(
            r#"
            UPDATE credit_grants SET voided_at = $4
            WHERE namespace = $1 AND owner_id = $2 AND id = $3
            RETURNING {GRANT_COLUMNS}
            "#
        );
        sqlx::query_as::<_, GrantRow>(&sql)
            .bind(&owner.namespace)
            .bind(&owner.id)
            .bind(id)
            .bind(voided_at)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| CreditError::not_found("grant", grant_id))?
            .try_into()
    }

    async fn list_active_grants_between(
        &self,
        owner: &OwnerRef,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> CreditResult<Vec<Grant>> {
        let sql = format!(
            r#"
            SELECT {GRANT_COLUMNS} FROM credit_grants
            WHERE namespace = $1
              AND owner_id = $2
              AND effective_at <= $4
              AND expires_at > $3
              AND (voided_at IS NULL OR voided_at > $3)
              AND (deleted_at IS NULL OR deleted_at > $3)
            ORDER BY effective_at, created_at
            "#
        );
        sqlx::query_as::<_, GrantRow>(&sql)
            .bind(&owner.namespace)
            .bind(&owner.id)
            .bind(from)
            .bind(to)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Grant::try_from)
            .collect()
    }
}

#[async_trait]
impl BalanceSnapshotRepo for PgStore {
    async fn save(&self, owner: &OwnerRef, snapshots: &[GrantBalanceSnapshot]) -> CreditResult<()> {
        let mut tx = self.pool.begin().await?;
        for snapshot in snapshots {
            sqlx::query(
                "INSERT INTO balance_snapshots (namespace, owner_id, at, balances, overage) VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(&owner.namespace)
            .bind(&owner.id)
            .bind(snapshot.at)
            .bind(Json(&snapshot.balances))
            .bind(snapshot.overage)
            .execute(&mut tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn latest_valid_at(
        &self,
        owner: &OwnerRef,
        at: DateTime<Utc>,
    ) -> CreditResult<Option<GrantBalanceSnapshot>> {
        let row = sqlx::query_as::<_, SnapshotRow>(
            r#"
            SELECT at, balances, overage FROM balance_snapshots
            WHERE namespace = $1 AND owner_id = $2 AND at <= $3 AND deleted_at IS NULL
            ORDER BY at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(&owner.namespace)
        .bind(&owner.id)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| GrantBalanceSnapshot {
            balances: row.balances.0,
            overage: row.overage,
            at: row.at,
        }))
    }

    async fn invalidate_after(&self, owner: &OwnerRef, at: DateTime<Utc>) -> CreditResult<()> {
        sqlx::query(
            r#"
            UPDATE balance_snapshots SET deleted_at = NOW()
            WHERE namespace = $1 AND owner_id = $2 AND at > $3 AND deleted_at IS NULL
            "#,
        )
        .bind(&owner.namespace)
        .bind(&owner.id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl EntitlementRepo for PgStore {
    async fn get_entitlement(&self, namespace: &str, id: &str) -> CreditResult<Entitlement> {
        let sql = format!(
            "SELECT {ENTITLEMENT_COLUMNS} FROM entitlements e WHERE e.namespace = $1 AND e.id = $2"
        );
        sqlx::query_as::<_, EntitlementRow>(&sql)
            .bind(namespace)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| CreditError::not_found("entitlement", id))?
            .try_into()
    }

    async fn list_affected_by_meters(
        &self,
        namespace: &str,
        subject_key: &str,
        meter_slugs: &[String],
    ) -> CreditResult<Vec<Entitlement>> {
        let sql = format!(
            r#"
            SELECT {ENTITLEMENT_COLUMNS}
            FROM entitlements e
            JOIN features f ON f.namespace = e.namespace AND f.id = e.feature_id
            WHERE e.namespace = $1
              AND e.subject_key = $2
              AND f.meter_slug = ANY($3)
              AND (e.deleted_at IS NULL OR e.deleted_at > NOW())
            ORDER BY e.id
            "#
        );
        sqlx::query_as::<_, EntitlementRow>(&sql)
            .bind(namespace)
            .bind(subject_key)
            .bind(meter_slugs.to_vec())
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Entitlement::try_from)
            .collect()
    }

    async fn list_entitlements(
        &self,
        namespace: &str,
        deleted_after: DateTime<Utc>,
    ) -> CreditResult<Vec<Entitlement>> {
        let sql = format!(
            r#"
            SELECT {ENTITLEMENT_COLUMNS}
            FROM entitlements e
            WHERE e.namespace = $1 AND (e.deleted_at IS NULL OR e.deleted_at > $2)
            ORDER BY e.id
            "#
        );
        sqlx::query_as::<_, EntitlementRow>(&sql)
            .bind(namespace)
            .bind(deleted_after)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Entitlement::try_from)
            .collect()
    }

    async fn record_reset(
        &self,
        namespace: &str,
        id: &str,
        reset_at: DateTime<Utc>,
    ) -> CreditResult<()> {
        let result = sqlx::query("UPDATE entitlements SET last_reset = $3 WHERE namespace = $1 AND id = $2")
            .bind(namespace)
            .bind(id)
            .bind(reset_at)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CreditError::not_found("entitlement", id));
        }
        Ok(())
    }
}

#[async_trait]
impl FeatureRepo for PgStore {
    async fn get_feature(&self, namespace: &str, id: &str) -> CreditResult<Feature> {
        let row = sqlx::query_as::<_, FeatureRow>(
            "SELECT namespace, id, key, name, meter_slug FROM features WHERE namespace = $1 AND id = $2",
        )
        .bind(namespace)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| CreditError::not_found("feature", id))?;

        Ok(Feature {
            id: row.id,
            namespace: row.namespace,
            key: row.key,
            name: row.name,
            meter_slug: row.meter_slug,
        })
    }
}

#[async_trait]
impl SubjectResolver for PgStore {
    async fn subject_id(&self, namespace: &str, subject_key: &str) -> CreditResult<Option<String>> {
        let id = sqlx::query_scalar::<_, String>(
            "SELECT id FROM subjects WHERE namespace = $1 AND key = $2",
        )
        .bind(namespace)
        .bind(subject_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }
}

#[async_trait]
impl MeterUsage for PgStore {
    async fn usage(
        &self,
        namespace: &str,
        meter_slug: &str,
        subject_key: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> CreditResult<f64> {
        let usage = sqlx::query_scalar::<_, f64>(
            r#"
            SELECT COALESCE(SUM(value), 0)::DOUBLE PRECISION FROM usage_events
            WHERE namespace = $1 AND meter_slug = $2 AND subject_key = $3
              AND occurred_at >= $4 AND occurred_at < $5
            "#,
        )
        .bind(namespace)
        .bind(meter_slug)
        .bind(subject_key)
        .bind(from)
        .bind(to)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| CreditError::UsageQuery(err.to_string()))?;
        Ok(usage)
    }
}
