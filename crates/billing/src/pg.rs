//! PostgreSQL implementations of the engine's stores.
//!
//! The audit insert and the high-water-mark raise are single atomic
//! statements: idempotency and monotonicity live in the database, not in
//! read-then-write sequences.

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use seatledger_shared::{BillingModel, BillingPeriod, EntityId, UserId};

use crate::audit::{
    NewSeatChange, SeatChangeInsert, SeatChangeLogEntry, SeatChangeStore, SeatChangeTotals,
    SeatChangeType,
};
use crate::config::{BillingConfigStore, BillingConfiguration};
use crate::error::{BillingError, BillingResult};
use crate::flags::FeatureFlagStore;
use crate::roster::RosterStore;

// =============================================================================
// Billing configuration store
// =============================================================================

/// Row type for billing configurations
#[derive(Debug, sqlx::FromRow)]
struct BillingConfigRow {
    entity_id: i64,
    billing_model: String,
    billing_period: Option<String>,
    subscription_id: String,
    subscription_item_id: Option<String>,
    customer_id: String,
    paid_seats: Option<i64>,
    high_water_mark: Option<i64>,
    high_water_mark_period_start: Option<OffsetDateTime>,
    subscription_start: Option<OffsetDateTime>,
    trial_end: Option<OffsetDateTime>,
    price_per_seat_cents: Option<i64>,
}

impl BillingConfigRow {
    fn into_config(self) -> BillingResult<BillingConfiguration> {
        let billing_model = BillingModel::parse(&self.billing_model).ok_or_else(|| {
            BillingError::Database(format!("unknown billing model: {}", self.billing_model))
        })?;
        Ok(BillingConfiguration {
            entity_id: EntityId(self.entity_id),
            billing_model,
            // Unknown period strings fall back to "no recurring period".
            billing_period: self.billing_period.as_deref().and_then(BillingPeriod::parse),
            subscription_id: self.subscription_id,
            subscription_item_id: self.subscription_item_id,
            customer_id: self.customer_id,
            paid_seats: self.paid_seats,
            high_water_mark: self.high_water_mark,
            high_water_mark_period_start: self.high_water_mark_period_start,
            subscription_start: self.subscription_start,
            trial_end: self.trial_end,
            price_per_seat_cents: self.price_per_seat_cents,
        })
    }
}

const CONFIG_COLUMNS: &str = "entity_id, billing_model, billing_period, subscription_id, \
     subscription_item_id, customer_id, paid_seats, high_water_mark, \
     high_water_mark_period_start, subscription_start, trial_end, price_per_seat_cents";

/// Postgres-backed `BillingConfigStore`.
pub struct PgBillingConfigStore {
    pool: PgPool,
}

impl PgBillingConfigStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BillingConfigStore for PgBillingConfigStore {
    async fn find_by_entity(
        &self,
        entity_id: EntityId,
    ) -> BillingResult<Option<BillingConfiguration>> {
        let row: Option<BillingConfigRow> = sqlx::query_as(&format!(
            "SELECT {CONFIG_COLUMNS} FROM billing_configurations WHERE entity_id = $1"
        ))
        .bind(entity_id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(BillingConfigRow::into_config).transpose()
    }

    async fn find_by_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<BillingConfiguration>> {
        let row: Option<BillingConfigRow> = sqlx::query_as(&format!(
            "SELECT {CONFIG_COLUMNS} FROM billing_configurations WHERE subscription_id = $1"
        ))
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(BillingConfigRow::into_config).transpose()
    }

    async fn insert(&self, config: &BillingConfiguration) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO billing_configurations
                (entity_id, billing_model, billing_period, subscription_id,
                 subscription_item_id, customer_id, paid_seats, high_water_mark,
                 high_water_mark_period_start, subscription_start, trial_end,
                 price_per_seat_cents)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (entity_id) DO UPDATE SET
                billing_model = EXCLUDED.billing_model,
                billing_period = EXCLUDED.billing_period,
                subscription_id = EXCLUDED.subscription_id,
                subscription_item_id = EXCLUDED.subscription_item_id,
                customer_id = EXCLUDED.customer_id,
                paid_seats = EXCLUDED.paid_seats,
                high_water_mark = EXCLUDED.high_water_mark,
                high_water_mark_period_start = EXCLUDED.high_water_mark_period_start,
                subscription_start = EXCLUDED.subscription_start,
                trial_end = EXCLUDED.trial_end,
                price_per_seat_cents = EXCLUDED.price_per_seat_cents,
                updated_at = NOW()
            "#,
        )
        .bind(config.entity_id.0)
        .bind(config.billing_model.as_str())
        .bind(config.billing_period.map(|p| p.as_str()))
        .bind(&config.subscription_id)
        .bind(&config.subscription_item_id)
        .bind(&config.customer_id)
        .bind(config.paid_seats)
        .bind(config.high_water_mark)
        .bind(config.high_water_mark_period_start)
        .bind(config.subscription_start)
        .bind(config.trial_end)
        .bind(config.price_per_seat_cents)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn set_high_water_mark(
        &self,
        entity_id: EntityId,
        value: i64,
        period_start: Option<OffsetDateTime>,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE billing_configurations
            SET high_water_mark = $2,
                high_water_mark_period_start = $3,
                updated_at = NOW()
            WHERE entity_id = $1
            "#,
        )
        .bind(entity_id.0)
        .bind(value)
        .bind(period_start)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn raise_high_water_mark(
        &self,
        entity_id: EntityId,
        value: i64,
    ) -> BillingResult<bool> {
        // Guarded single-row update: concurrent raises converge on the max.
        let raised: Option<(i64,)> = sqlx::query_as(
            r#"
            UPDATE billing_configurations
            SET high_water_mark = $2, updated_at = NOW()
            WHERE entity_id = $1
              AND (high_water_mark IS NULL OR high_water_mark < $2)
            RETURNING entity_id
            "#,
        )
        .bind(entity_id.0)
        .bind(value)
        .fetch_optional(&self.pool)
        .await?;

        Ok(raised.is_some())
    }

    async fn set_paid_seats(&self, entity_id: EntityId, value: i64) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE billing_configurations
            SET paid_seats = $2, updated_at = NOW()
            WHERE entity_id = $1
            "#,
        )
        .bind(entity_id.0)
        .bind(value)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

// =============================================================================
// Seat change store
// =============================================================================

/// Row type for seat change log entries
#[derive(Debug, sqlx::FromRow)]
struct SeatChangeRow {
    id: Uuid,
    entity_id: i64,
    change_type: String,
    seat_count: i64,
    actor_user_id: Option<i64>,
    subject_user_id: Option<i64>,
    month_key: String,
    operation_id: Option<String>,
    processed: bool,
    proration_id: Option<String>,
    created_at: OffsetDateTime,
}

impl SeatChangeRow {
    fn into_entry(self) -> BillingResult<SeatChangeLogEntry> {
        let change_type = SeatChangeType::parse(&self.change_type).ok_or_else(|| {
            BillingError::Database(format!("unknown seat change type: {}", self.change_type))
        })?;
        Ok(SeatChangeLogEntry {
            id: self.id,
            entity_id: EntityId(self.entity_id),
            change_type,
            seat_count: self.seat_count,
            actor_user_id: self.actor_user_id.map(UserId),
            subject_user_id: self.subject_user_id.map(UserId),
            month_key: self.month_key,
            operation_id: self.operation_id,
            processed: self.processed,
            proration_id: self.proration_id,
            created_at: self.created_at,
        })
    }
}

const SEAT_CHANGE_COLUMNS: &str = "id, entity_id, change_type, seat_count, actor_user_id, \
     subject_user_id, month_key, operation_id, processed, proration_id, created_at";

/// Postgres-backed `SeatChangeStore`.
pub struct PgSeatChangeStore {
    pool: PgPool,
}

impl PgSeatChangeStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SeatChangeStore for PgSeatChangeStore {
    async fn insert(&self, change: NewSeatChange) -> BillingResult<SeatChangeInsert> {
        // Insert-or-detect-conflict: the partial unique index on
        // (entity_id, operation_id) is the idempotency guarantee, so two
        // retries racing here cannot both create a row.
        let inserted: Option<SeatChangeRow> = sqlx::query_as(&format!(
            r#"
            INSERT INTO seat_change_log
                (id, entity_id, change_type, seat_count, actor_user_id,
                 subject_user_id, month_key, operation_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (entity_id, operation_id) WHERE operation_id IS NOT NULL
                DO NOTHING
            RETURNING {SEAT_CHANGE_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(change.entity_id.0)
        .bind(change.change_type.as_str())
        .bind(change.seat_count)
        .bind(change.actor_user_id.map(|u| u.0))
        .bind(change.subject_user_id.map(|u| u.0))
        .bind(&change.month_key)
        .bind(&change.operation_id)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = inserted {
            return Ok(SeatChangeInsert::Inserted(row.into_entry()?));
        }

        // Conflict: another call with the same operation id won the insert.
        let existing: SeatChangeRow = sqlx::query_as(&format!(
            "SELECT {SEAT_CHANGE_COLUMNS} FROM seat_change_log \
             WHERE entity_id = $1 AND operation_id = $2"
        ))
        .bind(change.entity_id.0)
        .bind(&change.operation_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| {
            BillingError::Internal("seat change row missing after insert conflict".to_string())
        })?;

        Ok(SeatChangeInsert::Duplicate(existing.into_entry()?))
    }

    async fn monthly_totals(
        &self,
        entity_id: EntityId,
        month_key: &str,
    ) -> BillingResult<SeatChangeTotals> {
        let (additions, removals): (i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COALESCE(SUM(seat_count) FILTER (WHERE change_type = 'ADDITION'), 0)::BIGINT,
                COALESCE(SUM(seat_count) FILTER (WHERE change_type = 'REMOVAL'), 0)::BIGINT
            FROM seat_change_log
            WHERE entity_id = $1 AND month_key = $2
            "#,
        )
        .bind(entity_id.0)
        .bind(month_key)
        .fetch_one(&self.pool)
        .await?;

        Ok(SeatChangeTotals {
            additions,
            removals,
        })
    }

    async fn unprocessed(&self, entity_id: EntityId) -> BillingResult<Vec<SeatChangeLogEntry>> {
        let rows: Vec<SeatChangeRow> = sqlx::query_as(&format!(
            "SELECT {SEAT_CHANGE_COLUMNS} FROM seat_change_log \
             WHERE entity_id = $1 AND NOT processed \
             ORDER BY created_at"
        ))
        .bind(entity_id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(SeatChangeRow::into_entry).collect()
    }

    async fn mark_processed(
        &self,
        entity_id: EntityId,
        month_key: &str,
        proration_id: &str,
    ) -> BillingResult<u64> {
        // The NOT processed guard makes overlapping batch runs claim
        // disjoint row sets.
        let result = sqlx::query(
            r#"
            UPDATE seat_change_log
            SET processed = TRUE, proration_id = $3
            WHERE entity_id = $1 AND month_key = $2 AND NOT processed
            "#,
        )
        .bind(entity_id.0)
        .bind(month_key)
        .bind(proration_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

// =============================================================================
// Roster store
// =============================================================================

/// Postgres-backed `RosterStore` over the product's team tables.
pub struct PgRosterStore {
    pool: PgPool,
}

impl PgRosterStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RosterStore for PgRosterStore {
    async fn member_count(&self, entity_id: EntityId) -> BillingResult<Option<i64>> {
        // The outer existence check distinguishes "unknown entity" (no row,
        // None) from "entity with an empty roster" (Some(0)).
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT (
                SELECT COUNT(*) FROM memberships m
                WHERE m.team_id = t.id AND m.accepted
            )
            FROM teams t
            WHERE t.id = $1
            "#,
        )
        .bind(entity_id.0)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(count,)| count))
    }

    async fn parent_organization(
        &self,
        entity_id: EntityId,
    ) -> BillingResult<Option<EntityId>> {
        let row: Option<(Option<i64>,)> = sqlx::query_as(
            "SELECT parent_id FROM teams WHERE id = $1",
        )
        .bind(entity_id.0)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.and_then(|(parent,)| parent).map(EntityId))
    }
}

// =============================================================================
// Feature flag store
// =============================================================================

/// Postgres-backed `FeatureFlagStore`. An absent flag row is disabled.
pub struct PgFeatureFlagStore {
    pool: PgPool,
}

impl PgFeatureFlagStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl FeatureFlagStore for PgFeatureFlagStore {
    async fn is_globally_enabled(&self, flag: &str) -> BillingResult<bool> {
        let row: Option<(bool,)> = sqlx::query_as(
            "SELECT enabled FROM feature_flags WHERE slug = $1",
        )
        .bind(flag)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(enabled,)| enabled).unwrap_or(false))
    }
}
