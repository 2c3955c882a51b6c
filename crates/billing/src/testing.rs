//! In-memory store implementations and a recording provider gateway.
//!
//! Compiled for this crate's tests and, behind the `test-support` feature,
//! for downstream integration tests. Not part of production builds.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use seatledger_shared::{BillingModel, BillingPeriod, EntityId};

use crate::audit::{
    NewSeatChange, SeatChangeInsert, SeatChangeLogEntry, SeatChangeStore, SeatChangeTotals,
    SeatChangeType,
};
use crate::config::{BillingConfigStore, BillingConfiguration};
use crate::error::{BillingError, BillingResult};
use crate::flags::FeatureFlagStore;
use crate::gateway::{BillingProviderGateway, ProviderSubscription, SubscriptionQuantityUpdate};
use crate::roster::RosterStore;

/// A monthly SEATS configuration with provider identifiers filled in and
/// all tracking state unset.
#[must_use]
pub fn monthly_seats_config(entity_id: EntityId, subscription_id: &str) -> BillingConfiguration {
    BillingConfiguration {
        entity_id,
        billing_model: BillingModel::Seats,
        billing_period: Some(BillingPeriod::Monthly),
        subscription_id: subscription_id.to_string(),
        subscription_item_id: Some(format!("si_{entity_id}")),
        customer_id: format!("cus_{entity_id}"),
        paid_seats: None,
        high_water_mark: None,
        high_water_mark_period_start: None,
        subscription_start: Some(OffsetDateTime::UNIX_EPOCH),
        trial_end: None,
        price_per_seat_cents: Some(1200),
    }
}

// =============================================================================
// Billing configuration store
// =============================================================================

/// In-memory `BillingConfigStore`.
#[derive(Default)]
pub struct InMemoryBillingConfigStore {
    rows: Mutex<HashMap<i64, BillingConfiguration>>,
}

impl InMemoryBillingConfigStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch a stored configuration for assertions.
    pub async fn get(&self, entity_id: EntityId) -> Option<BillingConfiguration> {
        self.rows.lock().await.get(&entity_id.0).cloned()
    }
}

#[async_trait]
impl BillingConfigStore for InMemoryBillingConfigStore {
    async fn find_by_entity(
        &self,
        entity_id: EntityId,
    ) -> BillingResult<Option<BillingConfiguration>> {
        Ok(self.rows.lock().await.get(&entity_id.0).cloned())
    }

    async fn find_by_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<BillingConfiguration>> {
        Ok(self
            .rows
            .lock()
            .await
            .values()
            .find(|c| c.subscription_id == subscription_id)
            .cloned())
    }

    async fn insert(&self, config: &BillingConfiguration) -> BillingResult<()> {
        self.rows
            .lock()
            .await
            .insert(config.entity_id.0, config.clone());
        Ok(())
    }

    async fn set_high_water_mark(
        &self,
        entity_id: EntityId,
        value: i64,
        period_start: Option<OffsetDateTime>,
    ) -> BillingResult<()> {
        if let Some(row) = self.rows.lock().await.get_mut(&entity_id.0) {
            row.high_water_mark = Some(value);
            row.high_water_mark_period_start = period_start;
        }
        Ok(())
    }

    async fn raise_high_water_mark(
        &self,
        entity_id: EntityId,
        value: i64,
    ) -> BillingResult<bool> {
        let mut rows = self.rows.lock().await;
        let Some(row) = rows.get_mut(&entity_id.0) else {
            return Ok(false);
        };
        match row.high_water_mark {
            Some(current) if current >= value => Ok(false),
            _ => {
                row.high_water_mark = Some(value);
                Ok(true)
            }
        }
    }

    async fn set_paid_seats(&self, entity_id: EntityId, value: i64) -> BillingResult<()> {
        if let Some(row) = self.rows.lock().await.get_mut(&entity_id.0) {
            row.paid_seats = Some(value);
        }
        Ok(())
    }
}

// =============================================================================
// Seat change store
// =============================================================================

/// In-memory append-only `SeatChangeStore`.
#[derive(Default)]
pub struct InMemorySeatChangeStore {
    rows: Mutex<Vec<SeatChangeLogEntry>>,
}

impl InMemorySeatChangeStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All rows in insertion order, for assertions.
    pub async fn entries(&self) -> Vec<SeatChangeLogEntry> {
        self.rows.lock().await.clone()
    }
}

#[async_trait]
impl SeatChangeStore for InMemorySeatChangeStore {
    async fn insert(&self, change: NewSeatChange) -> BillingResult<SeatChangeInsert> {
        let mut rows = self.rows.lock().await;

        if let Some(operation_id) = change.operation_id.as_deref() {
            if let Some(existing) = rows.iter().find(|row| {
                row.entity_id == change.entity_id
                    && row.operation_id.as_deref() == Some(operation_id)
            }) {
                return Ok(SeatChangeInsert::Duplicate(existing.clone()));
            }
        }

        let entry = SeatChangeLogEntry {
            id: Uuid::new_v4(),
            entity_id: change.entity_id,
            change_type: change.change_type,
            seat_count: change.seat_count,
            actor_user_id: change.actor_user_id,
            subject_user_id: change.subject_user_id,
            month_key: change.month_key,
            operation_id: change.operation_id,
            processed: false,
            proration_id: None,
            created_at: OffsetDateTime::now_utc(),
        };
        rows.push(entry.clone());
        Ok(SeatChangeInsert::Inserted(entry))
    }

    async fn monthly_totals(
        &self,
        entity_id: EntityId,
        month_key: &str,
    ) -> BillingResult<SeatChangeTotals> {
        let rows = self.rows.lock().await;
        let mut totals = SeatChangeTotals {
            additions: 0,
            removals: 0,
        };
        for row in rows
            .iter()
            .filter(|r| r.entity_id == entity_id && r.month_key == month_key)
        {
            match row.change_type {
                SeatChangeType::Addition => totals.additions += row.seat_count,
                SeatChangeType::Removal => totals.removals += row.seat_count,
            }
        }
        Ok(totals)
    }

    async fn unprocessed(&self, entity_id: EntityId) -> BillingResult<Vec<SeatChangeLogEntry>> {
        Ok(self
            .rows
            .lock()
            .await
            .iter()
            .filter(|r| r.entity_id == entity_id && !r.processed)
            .cloned()
            .collect())
    }

    async fn mark_processed(
        &self,
        entity_id: EntityId,
        month_key: &str,
        proration_id: &str,
    ) -> BillingResult<u64> {
        let mut rows = self.rows.lock().await;
        let mut claimed = 0;
        for row in rows.iter_mut().filter(|r| {
            r.entity_id == entity_id && r.month_key == month_key && !r.processed
        }) {
            row.processed = true;
            row.proration_id = Some(proration_id.to_string());
            claimed += 1;
        }
        Ok(claimed)
    }
}

// =============================================================================
// Roster store
// =============================================================================

/// In-memory `RosterStore`.
#[derive(Default)]
pub struct InMemoryRosterStore {
    counts: Mutex<HashMap<i64, i64>>,
    parents: Mutex<HashMap<i64, i64>>,
}

impl InMemoryRosterStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_member_count(&self, entity_id: EntityId, count: i64) {
        self.counts.lock().await.insert(entity_id.0, count);
    }

    pub async fn set_parent_organization(&self, child: EntityId, parent: EntityId) {
        self.parents.lock().await.insert(child.0, parent.0);
    }
}

#[async_trait]
impl RosterStore for InMemoryRosterStore {
    async fn member_count(&self, entity_id: EntityId) -> BillingResult<Option<i64>> {
        Ok(self.counts.lock().await.get(&entity_id.0).copied())
    }

    async fn parent_organization(
        &self,
        entity_id: EntityId,
    ) -> BillingResult<Option<EntityId>> {
        Ok(self
            .parents
            .lock()
            .await
            .get(&entity_id.0)
            .copied()
            .map(EntityId))
    }
}

// =============================================================================
// Feature flags
// =============================================================================

/// In-memory `FeatureFlagStore`. Flags default to disabled.
#[derive(Default)]
pub struct InMemoryFeatureFlags {
    enabled: Mutex<HashSet<String>>,
}

impl InMemoryFeatureFlags {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn enable(&self, flag: &str) {
        self.enabled.lock().await.insert(flag.to_string());
    }

    pub async fn disable(&self, flag: &str) {
        self.enabled.lock().await.remove(flag);
    }
}

#[async_trait]
impl FeatureFlagStore for InMemoryFeatureFlags {
    async fn is_globally_enabled(&self, flag: &str) -> BillingResult<bool> {
        Ok(self.enabled.lock().await.contains(flag))
    }
}

// =============================================================================
// Recording gateway
// =============================================================================

/// Provider gateway double: serves seeded subscription reads, records every
/// quantity update, and can be switched into a failing mode.
#[derive(Default)]
pub struct RecordingGateway {
    subscriptions: Mutex<HashMap<String, ProviderSubscription>>,
    updates: Mutex<Vec<SubscriptionQuantityUpdate>>,
    fail_updates: AtomicBool,
}

impl RecordingGateway {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the live view of a subscription.
    pub async fn set_subscription(&self, subscription: ProviderSubscription) {
        self.subscriptions
            .lock()
            .await
            .insert(subscription.id.clone(), subscription);
    }

    /// Seed just a quantity for a subscription id.
    pub async fn set_subscription_quantity(&self, subscription_id: &str, quantity: u64) {
        self.set_subscription(ProviderSubscription {
            id: subscription_id.to_string(),
            item_id: Some("si_live".to_string()),
            quantity: Some(quantity),
            current_period_start: None,
        })
        .await;
    }

    /// Every quantity update received, in order.
    pub async fn updates(&self) -> Vec<SubscriptionQuantityUpdate> {
        self.updates.lock().await.clone()
    }

    /// Make subsequent quantity updates fail like a provider outage.
    pub async fn fail_updates(&self, fail: bool) {
        self.fail_updates.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl BillingProviderGateway for RecordingGateway {
    async fn get_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<ProviderSubscription> {
        self.subscriptions
            .lock()
            .await
            .get(subscription_id)
            .cloned()
            .ok_or_else(|| {
                BillingError::StripeApi(format!("no such subscription: {subscription_id}"))
            })
    }

    async fn update_subscription_quantity(
        &self,
        update: SubscriptionQuantityUpdate,
    ) -> BillingResult<()> {
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(BillingError::StripeApi(
                "simulated provider outage".to_string(),
            ));
        }

        let mut subscriptions = self.subscriptions.lock().await;
        if let Some(subscription) = subscriptions.get_mut(&update.subscription_id) {
            subscription.quantity = Some(update.membership_count);
        }
        drop(subscriptions);

        self.updates.lock().await.push(update);
        Ok(())
    }
}
