//! Seat change audit log.
//!
//! Append-only record of seat additions and removals, keyed for idempotent
//! replay. The audit insert is the unit of truth for a seat mutation:
//! provider sync and peak tracking both hang off it and neither may undo or
//! block it.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use seatledger_shared::{EntityId, UserId};

use crate::config::{BillingConfigStore, BillingConfiguration};
use crate::error::BillingResult;
use crate::hwm::HighWaterMarkTracker;
use crate::roster::RosterStore;

/// Direction of a seat change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SeatChangeType {
    Addition,
    Removal,
}

impl SeatChangeType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Addition => "ADDITION",
            Self::Removal => "REMOVAL",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ADDITION" => Some(Self::Addition),
            "REMOVAL" => Some(Self::Removal),
            _ => None,
        }
    }
}

/// One committed audit row. Immutable except for the proration-consumption
/// fields, which are set exactly once by `mark_processed`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeatChangeLogEntry {
    pub id: Uuid,
    pub entity_id: EntityId,
    pub change_type: SeatChangeType,
    pub seat_count: i64,
    pub actor_user_id: Option<UserId>,
    pub subject_user_id: Option<UserId>,
    /// UTC calendar month the change belongs to, e.g. "2026-01".
    pub month_key: String,
    /// Caller-supplied idempotency key.
    pub operation_id: Option<String>,
    pub processed: bool,
    pub proration_id: Option<String>,
    pub created_at: OffsetDateTime,
}

/// Insert payload for a new audit row.
#[derive(Debug, Clone)]
pub struct NewSeatChange {
    pub entity_id: EntityId,
    pub change_type: SeatChangeType,
    pub seat_count: i64,
    pub actor_user_id: Option<UserId>,
    pub subject_user_id: Option<UserId>,
    pub month_key: String,
    pub operation_id: Option<String>,
}

/// Outcome of an idempotent audit insert.
#[derive(Debug, Clone)]
pub enum SeatChangeInsert {
    Inserted(SeatChangeLogEntry),
    /// A row with the same `(entity_id, operation_id)` already existed;
    /// carries the existing row.
    Duplicate(SeatChangeLogEntry),
}

impl SeatChangeInsert {
    /// The committed row, whether new or pre-existing.
    #[must_use]
    pub fn into_entry(self) -> SeatChangeLogEntry {
        match self {
            Self::Inserted(entry) | Self::Duplicate(entry) => entry,
        }
    }
}

/// Per-month addition/removal totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeatChangeTotals {
    pub additions: i64,
    pub removals: i64,
}

/// Monthly summary handed to the proration batch and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MonthlySeatChanges {
    pub additions: i64,
    pub removals: i64,
    /// Never negative: a month with more removals than additions nets to
    /// zero, not a credit.
    pub net_change: i64,
}

/// Persistence for audit rows.
///
/// `insert` must be insert-or-detect-conflict on `(entity_id,
/// operation_id)`, not a read-then-write.
#[async_trait]
pub trait SeatChangeStore: Send + Sync {
    async fn insert(&self, change: NewSeatChange) -> BillingResult<SeatChangeInsert>;

    async fn monthly_totals(
        &self,
        entity_id: EntityId,
        month_key: &str,
    ) -> BillingResult<SeatChangeTotals>;

    /// Rows not yet attached to a proration invoice, oldest first.
    async fn unprocessed(&self, entity_id: EntityId) -> BillingResult<Vec<SeatChangeLogEntry>>;

    /// Atomically claim a month's unprocessed rows for a proration invoice.
    /// Returns the number of rows claimed, so overlapping batch runs cannot
    /// double-bill.
    async fn mark_processed(
        &self,
        entity_id: EntityId,
        month_key: &str,
        proration_id: &str,
    ) -> BillingResult<u64>;
}

/// The UTC calendar-month bucket for a timestamp.
#[must_use]
pub fn month_key(timestamp: OffsetDateTime) -> String {
    let utc = timestamp.to_offset(time::UtcOffset::UTC);
    format!("{:04}-{:02}", utc.year(), utc.month() as u8)
}

/// Parameters for logging a seat change.
#[derive(Debug, Clone, Default)]
pub struct SeatChangeParams {
    pub entity_id: EntityId,
    pub subject_user_id: Option<UserId>,
    pub actor_user_id: Option<UserId>,
    pub seat_count: i64,
    pub operation_id: Option<String>,
}

/// Seat change tracking service.
///
/// Resolves which billing owner (the entity itself or its parent
/// organization) a change rolls up to, writes the idempotent audit row, and
/// feeds additions into peak tracking.
#[derive(Clone)]
pub struct SeatChangeTracker {
    configs: Arc<dyn BillingConfigStore>,
    changes: Arc<dyn SeatChangeStore>,
    roster: Arc<dyn RosterStore>,
    hwm: HighWaterMarkTracker,
}

impl SeatChangeTracker {
    #[must_use]
    pub fn new(
        configs: Arc<dyn BillingConfigStore>,
        changes: Arc<dyn SeatChangeStore>,
        roster: Arc<dyn RosterStore>,
        hwm: HighWaterMarkTracker,
    ) -> Self {
        Self {
            configs,
            changes,
            roster,
            hwm,
        }
    }

    /// Log a seat addition and update peak tracking.
    pub async fn log_addition(
        &self,
        params: SeatChangeParams,
    ) -> BillingResult<SeatChangeLogEntry> {
        let (owner, owner_config) = self.resolve_billing_owner(params.entity_id).await?;
        let entry = self
            .write_entry(owner, SeatChangeType::Addition, &params)
            .await?;

        // The audit write above is committed; a peak-tracking failure must
        // not undo or fail it.
        let anchor = owner_config.as_ref().and_then(|c| c.hwm_period_anchor());
        if let Err(err) = self.hwm.update_on_addition(owner, anchor).await {
            tracing::error!(
                entity_id = %owner,
                error = %err,
                "High-water-mark update failed after committed audit write"
            );
        }

        Ok(entry)
    }

    /// Log a seat removal. Removals never touch the high-water-mark.
    pub async fn log_removal(
        &self,
        params: SeatChangeParams,
    ) -> BillingResult<SeatChangeLogEntry> {
        let (owner, _) = self.resolve_billing_owner(params.entity_id).await?;
        self.write_entry(owner, SeatChangeType::Removal, &params)
            .await
    }

    /// Addition/removal totals for one calendar month.
    pub async fn monthly_changes(
        &self,
        entity_id: EntityId,
        month: &str,
    ) -> BillingResult<MonthlySeatChanges> {
        let totals = self.changes.monthly_totals(entity_id, month).await?;
        Ok(MonthlySeatChanges {
            additions: totals.additions,
            removals: totals.removals,
            net_change: (totals.additions - totals.removals).max(0),
        })
    }

    /// Rows awaiting the external monthly proration batch.
    pub async fn unprocessed_changes(
        &self,
        entity_id: EntityId,
    ) -> BillingResult<Vec<SeatChangeLogEntry>> {
        self.changes.unprocessed(entity_id).await
    }

    /// Attach a month's unprocessed rows to a proration invoice.
    pub async fn mark_as_processed(
        &self,
        entity_id: EntityId,
        month: &str,
        proration_id: &str,
    ) -> BillingResult<u64> {
        let claimed = self
            .changes
            .mark_processed(entity_id, month, proration_id)
            .await?;
        tracing::info!(
            entity_id = %entity_id,
            month_key = %month,
            proration_id = %proration_id,
            rows = claimed,
            "Marked seat changes as processed"
        );
        Ok(claimed)
    }

    async fn write_entry(
        &self,
        owner: EntityId,
        change_type: SeatChangeType,
        params: &SeatChangeParams,
    ) -> BillingResult<SeatChangeLogEntry> {
        let change = NewSeatChange {
            entity_id: owner,
            change_type,
            seat_count: params.seat_count,
            actor_user_id: params.actor_user_id,
            subject_user_id: params.subject_user_id,
            month_key: month_key(OffsetDateTime::now_utc()),
            operation_id: params.operation_id.clone(),
        };

        match self.changes.insert(change).await? {
            SeatChangeInsert::Inserted(entry) => {
                tracing::info!(
                    entity_id = %owner,
                    change_type = change_type.as_str(),
                    seat_count = params.seat_count,
                    operation_id = ?params.operation_id,
                    "Logged seat change"
                );
                Ok(entry)
            }
            SeatChangeInsert::Duplicate(entry) => {
                tracing::debug!(
                    entity_id = %owner,
                    operation_id = ?params.operation_id,
                    "Seat change already logged for this operation, reusing entry"
                );
                Ok(entry)
            }
        }
    }

    /// Which billing record the entity's seats roll up to: its own
    /// configuration when present, otherwise the parent organization's.
    /// With no configuration anywhere the entity keeps its own changes so
    /// analytics retain them.
    async fn resolve_billing_owner(
        &self,
        entity_id: EntityId,
    ) -> BillingResult<(EntityId, Option<BillingConfiguration>)> {
        if let Some(config) = self.configs.find_by_entity(entity_id).await? {
            return Ok((entity_id, Some(config)));
        }

        if let Some(parent) = self.roster.parent_organization(entity_id).await? {
            if let Some(config) = self.configs.find_by_entity(parent).await? {
                return Ok((parent, Some(config)));
            }
        }

        Ok((entity_id, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BillingError;
    use crate::flags::FeatureFlagStore;
    use crate::testing::{
        monthly_seats_config, InMemoryBillingConfigStore, InMemoryFeatureFlags,
        InMemoryRosterStore, InMemorySeatChangeStore,
    };
    use time::macros::datetime;

    const TEAM: EntityId = EntityId(7);
    const ORG: EntityId = EntityId(70);

    /// Flag store that fails every lookup, for failure-isolation tests.
    struct FailingFlags;

    #[async_trait]
    impl FeatureFlagStore for FailingFlags {
        async fn is_globally_enabled(&self, _flag: &str) -> BillingResult<bool> {
            Err(BillingError::Database("flag store offline".to_string()))
        }
    }

    struct Harness {
        configs: Arc<InMemoryBillingConfigStore>,
        changes: Arc<InMemorySeatChangeStore>,
        roster: Arc<InMemoryRosterStore>,
        tracker: SeatChangeTracker,
    }

    fn build(flags: Arc<dyn FeatureFlagStore>) -> Harness {
        let configs = Arc::new(InMemoryBillingConfigStore::new());
        let changes = Arc::new(InMemorySeatChangeStore::new());
        let roster = Arc::new(InMemoryRosterStore::new());
        let hwm = HighWaterMarkTracker::new(configs.clone(), roster.clone(), flags, None);
        let tracker = SeatChangeTracker::new(configs.clone(), changes.clone(), roster.clone(), hwm);
        Harness {
            configs,
            changes,
            roster,
            tracker,
        }
    }

    async fn harness() -> Harness {
        let flags = Arc::new(InMemoryFeatureFlags::new());
        build(flags)
    }

    fn addition(entity: EntityId, operation_id: Option<&str>) -> SeatChangeParams {
        SeatChangeParams {
            entity_id: entity,
            subject_user_id: Some(UserId(1)),
            actor_user_id: Some(UserId(2)),
            seat_count: 1,
            operation_id: operation_id.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn repeated_operation_id_creates_exactly_one_row() {
        let h = harness().await;

        let first = h
            .tracker
            .log_addition(addition(TEAM, Some("op-1")))
            .await
            .unwrap();
        let second = h
            .tracker
            .log_addition(addition(TEAM, Some("op-1")))
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(h.changes.entries().await.len(), 1);
    }

    #[tokio::test]
    async fn distinct_operation_ids_create_distinct_rows() {
        let h = harness().await;

        h.tracker
            .log_addition(addition(TEAM, Some("op-1")))
            .await
            .unwrap();
        h.tracker
            .log_addition(addition(TEAM, Some("op-2")))
            .await
            .unwrap();
        // No operation id: always a fresh row.
        h.tracker.log_addition(addition(TEAM, None)).await.unwrap();
        h.tracker.log_addition(addition(TEAM, None)).await.unwrap();

        assert_eq!(h.changes.entries().await.len(), 4);
    }

    #[tokio::test]
    async fn net_change_is_never_negative() {
        let h = harness().await;
        let month = month_key(OffsetDateTime::now_utc());

        h.tracker.log_addition(addition(TEAM, None)).await.unwrap();
        for _ in 0..3 {
            h.tracker
                .log_removal(SeatChangeParams {
                    entity_id: TEAM,
                    seat_count: 1,
                    ..SeatChangeParams::default()
                })
                .await
                .unwrap();
        }

        let summary = h.tracker.monthly_changes(TEAM, &month).await.unwrap();
        assert_eq!(summary.additions, 1);
        assert_eq!(summary.removals, 3);
        assert_eq!(summary.net_change, 0);
    }

    #[tokio::test]
    async fn monthly_changes_reports_additions_minus_removals() {
        let h = harness().await;
        let month = month_key(OffsetDateTime::now_utc());

        for _ in 0..3 {
            h.tracker.log_addition(addition(TEAM, None)).await.unwrap();
        }
        h.tracker
            .log_removal(SeatChangeParams {
                entity_id: TEAM,
                seat_count: 1,
                ..SeatChangeParams::default()
            })
            .await
            .unwrap();

        let summary = h.tracker.monthly_changes(TEAM, &month).await.unwrap();
        assert_eq!(summary.additions, 3);
        assert_eq!(summary.removals, 1);
        assert_eq!(summary.net_change, 2);
    }

    #[tokio::test]
    async fn changes_roll_up_to_the_parent_organization_billing_record() {
        let h = harness().await;
        h.roster.set_parent_organization(TEAM, ORG).await;
        h.configs
            .insert(&monthly_seats_config(ORG, "sub_org"))
            .await
            .unwrap();
        h.roster.set_member_count(ORG, 12).await;

        let entry = h.tracker.log_addition(addition(TEAM, None)).await.unwrap();

        assert_eq!(entry.entity_id, ORG);
    }

    #[tokio::test]
    async fn entity_without_any_configuration_keeps_its_own_changes() {
        let h = harness().await;

        let entry = h.tracker.log_addition(addition(TEAM, None)).await.unwrap();

        assert_eq!(entry.entity_id, TEAM);
    }

    #[tokio::test]
    async fn hwm_failure_does_not_fail_the_audit_write() {
        let h = build(Arc::new(FailingFlags));
        h.configs
            .insert(&monthly_seats_config(TEAM, "sub_team"))
            .await
            .unwrap();
        h.roster.set_member_count(TEAM, 4).await;

        let entry = h.tracker.log_addition(addition(TEAM, None)).await;

        assert!(entry.is_ok());
        assert_eq!(h.changes.entries().await.len(), 1);
    }

    #[tokio::test]
    async fn mark_as_processed_claims_each_row_once() {
        let h = harness().await;
        let month = month_key(OffsetDateTime::now_utc());

        h.tracker.log_addition(addition(TEAM, None)).await.unwrap();
        h.tracker.log_addition(addition(TEAM, None)).await.unwrap();

        let claimed = h
            .tracker
            .mark_as_processed(TEAM, &month, "pi_123")
            .await
            .unwrap();
        assert_eq!(claimed, 2);
        assert!(h.tracker.unprocessed_changes(TEAM).await.unwrap().is_empty());

        // Overlapping batch run: nothing left to claim.
        let again = h
            .tracker
            .mark_as_processed(TEAM, &month, "pi_456")
            .await
            .unwrap();
        assert_eq!(again, 0);

        let entries = h.changes.entries().await;
        assert!(entries
            .iter()
            .all(|e| e.processed && e.proration_id.as_deref() == Some("pi_123")));
    }

    #[test]
    fn month_key_is_utc_calendar_month() {
        assert_eq!(month_key(datetime!(2026-01-31 23:59 UTC)), "2026-01");
        assert_eq!(month_key(datetime!(2026-12-01 00:00 UTC)), "2026-12");
        // An eastern-offset timestamp still buckets by its UTC month.
        assert_eq!(month_key(datetime!(2026-02-01 01:30 +2)), "2026-01");
    }
}
