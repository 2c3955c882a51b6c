//! Reconciliation strategy resolution and the three strategy variants.
//!
//! A billing configuration maps to exactly one strategy:
//! active-user billing is reconciled by the usage-metering path and only
//! keeps an analytics audit trail here; monthly seat billing runs the
//! high-water-mark protocol; every other seat configuration defers to the
//! monthly proration batch. Strategies are cheap value dispatch built per
//! call from the stored configuration — never cached, since configuration
//! can change between calls.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use time::OffsetDateTime;

use seatledger_shared::{BillingModel, BillingPeriod, EntityId};

use crate::audit::{SeatChangeParams, SeatChangeTracker};
use crate::config::BillingConfigStore;
use crate::error::BillingResult;
use crate::flags::{FeatureFlagStore, MONTHLY_SEAT_PRORATION};
use crate::gateway::{BillingProviderGateway, ProrationBehavior, SubscriptionQuantityUpdate};
use crate::hwm::HighWaterMarkTracker;
use crate::roster::RosterStore;

/// The three reconciliation behaviors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StrategyKind {
    ActiveUsers,
    HighWaterMark,
    Proration,
}

impl StrategyKind {
    /// Total, deterministic mapping from stored configuration to strategy.
    #[must_use]
    pub fn for_config(model: BillingModel, period: Option<BillingPeriod>) -> Self {
        match (model, period) {
            (BillingModel::ActiveUsers, _) => Self::ActiveUsers,
            (BillingModel::Seats, Some(BillingPeriod::Monthly)) => Self::HighWaterMark,
            (BillingModel::Seats, _) => Self::Proration,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ActiveUsers => "active_users",
            Self::HighWaterMark => "high_water_mark",
            Self::Proration => "proration",
        }
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of the pre-renewal quantity adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InvoiceUpcomingOutcome {
    /// Whether the provider quantity was actually changed.
    pub applied: bool,
}

/// Result of the post-renewal reset.
///
/// Never surfaced as an `Err`: the webhook caller must not fail a whole
/// delivery for one tenant's billing error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenewalResetOutcome {
    pub success: bool,
    pub updated: bool,
    pub error: Option<String>,
}

impl RenewalResetOutcome {
    #[must_use]
    pub fn completed(updated: bool) -> Self {
        Self {
            success: true,
            updated,
            error: None,
        }
    }

    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            updated: false,
            error: Some(message.into()),
        }
    }
}

/// One reconciliation strategy.
///
/// No method lets a provider-side failure escape: the renewal reset reports
/// it in the outcome, the other paths log and degrade. Audit writes happen
/// before provider calls and survive their failure.
#[async_trait]
pub trait ReconciliationStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// The provider is about to generate the renewal invoice; adjust the
    /// billed quantity first if this strategy does that.
    async fn handle_invoice_upcoming(
        &self,
        subscription_id: &str,
    ) -> BillingResult<InvoiceUpcomingOutcome>;

    /// A renewal payment succeeded; reset peak-tracking state for the new
    /// period if this strategy tracks one.
    async fn handle_post_renewal_reset(
        &self,
        subscription_id: &str,
        period_start_epoch: i64,
    ) -> RenewalResetOutcome;

    /// A seat was added to the roster.
    async fn handle_member_addition(&self, change: SeatChangeParams) -> BillingResult<()>;

    /// A seat was removed from the roster.
    async fn handle_member_removal(&self, change: SeatChangeParams) -> BillingResult<()>;

    /// Reconcile the provider quantity without writing an audit entry
    /// (the caller already logged the change).
    async fn sync_billing_quantity(&self, entity_id: EntityId) -> BillingResult<()>;
}

// =============================================================================
// ActiveUsersStrategy
// =============================================================================

/// Active-user billing: quantities come from a separate usage-metering
/// path. Seat changes are logged for analytics only.
pub struct ActiveUsersStrategy {
    tracker: SeatChangeTracker,
}

impl ActiveUsersStrategy {
    #[must_use]
    pub fn new(tracker: SeatChangeTracker) -> Self {
        Self { tracker }
    }
}

#[async_trait]
impl ReconciliationStrategy for ActiveUsersStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::ActiveUsers
    }

    async fn handle_invoice_upcoming(
        &self,
        subscription_id: &str,
    ) -> BillingResult<InvoiceUpcomingOutcome> {
        tracing::debug!(
            subscription_id = %subscription_id,
            "Active-user billing is metered elsewhere, no pre-invoice adjustment"
        );
        Ok(InvoiceUpcomingOutcome { applied: false })
    }

    async fn handle_post_renewal_reset(
        &self,
        _subscription_id: &str,
        _period_start_epoch: i64,
    ) -> RenewalResetOutcome {
        RenewalResetOutcome::completed(false)
    }

    async fn handle_member_addition(&self, change: SeatChangeParams) -> BillingResult<()> {
        self.tracker.log_addition(change).await?;
        Ok(())
    }

    async fn handle_member_removal(&self, change: SeatChangeParams) -> BillingResult<()> {
        self.tracker.log_removal(change).await?;
        Ok(())
    }

    async fn sync_billing_quantity(&self, _entity_id: EntityId) -> BillingResult<()> {
        Ok(())
    }
}

// =============================================================================
// HwmStrategy
// =============================================================================

/// Monthly seat billing with high-water-mark peak tracking.
pub struct HwmStrategy {
    tracker: SeatChangeTracker,
    hwm: HighWaterMarkTracker,
    configs: Arc<dyn BillingConfigStore>,
    roster: Arc<dyn RosterStore>,
    gateway: Option<Arc<dyn BillingProviderGateway>>,
}

impl HwmStrategy {
    #[must_use]
    pub fn new(
        tracker: SeatChangeTracker,
        hwm: HighWaterMarkTracker,
        configs: Arc<dyn BillingConfigStore>,
        roster: Arc<dyn RosterStore>,
        gateway: Option<Arc<dyn BillingProviderGateway>>,
    ) -> Self {
        Self {
            tracker,
            hwm,
            configs,
            roster,
            gateway,
        }
    }

    /// Best-effort quantity sync after a committed audit write. Never fails
    /// the caller: the member mutation already succeeded and the next
    /// renewal cycle heals any drift.
    async fn sync_after_change(&self, entity_id: EntityId) {
        if let Err(err) = self.sync_billing_quantity(entity_id).await {
            tracing::error!(
                entity_id = %entity_id,
                error = %err,
                "Seat quantity sync failed, will be corrected at next renewal"
            );
        }
    }
}

#[async_trait]
impl ReconciliationStrategy for HwmStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::HighWaterMark
    }

    async fn handle_invoice_upcoming(
        &self,
        subscription_id: &str,
    ) -> BillingResult<InvoiceUpcomingOutcome> {
        match self.hwm.apply_to_subscription(subscription_id).await {
            Ok(applied) => Ok(InvoiceUpcomingOutcome { applied }),
            Err(err) if err.is_provider_failure() => {
                tracing::error!(
                    subscription_id = %subscription_id,
                    error = %err,
                    "Provider rejected pre-invoice peak application"
                );
                Ok(InvoiceUpcomingOutcome { applied: false })
            }
            Err(err) => Err(err),
        }
    }

    async fn handle_post_renewal_reset(
        &self,
        subscription_id: &str,
        period_start_epoch: i64,
    ) -> RenewalResetOutcome {
        let period_start = match OffsetDateTime::from_unix_timestamp(period_start_epoch) {
            Ok(ts) => ts,
            Err(_) => {
                tracing::error!(
                    subscription_id = %subscription_id,
                    period_start_epoch,
                    "Renewal event carried an invalid period start"
                );
                return RenewalResetOutcome::failed(format!(
                    "invalid unix timestamp: {period_start_epoch}"
                ));
            }
        };

        match self
            .hwm
            .reset_after_renewal(subscription_id, period_start)
            .await
        {
            Ok(updated) => RenewalResetOutcome::completed(updated),
            Err(err) => {
                tracing::error!(
                    subscription_id = %subscription_id,
                    error = %err,
                    "Post-renewal reset failed"
                );
                RenewalResetOutcome::failed(err.to_string())
            }
        }
    }

    async fn handle_member_addition(&self, change: SeatChangeParams) -> BillingResult<()> {
        let entry = self.tracker.log_addition(change).await?;
        // Sync against the resolved billing owner, which may be the parent
        // organization rather than the entity the member joined.
        self.sync_after_change(entry.entity_id).await;
        Ok(())
    }

    async fn handle_member_removal(&self, change: SeatChangeParams) -> BillingResult<()> {
        let entry = self.tracker.log_removal(change).await?;
        self.sync_after_change(entry.entity_id).await;
        Ok(())
    }

    async fn sync_billing_quantity(&self, entity_id: EntityId) -> BillingResult<()> {
        let Some(config) = self.configs.find_by_entity(entity_id).await? else {
            tracing::debug!(entity_id = %entity_id, "No billing configuration, nothing to sync");
            return Ok(());
        };

        let Some(current_count) = self.roster.member_count(entity_id).await? else {
            tracing::warn!(entity_id = %entity_id, "Member count unavailable, skipping quantity sync");
            return Ok(());
        };

        // Drive the provider toward the tracked peak, never toward a lower
        // instantaneous count. The local paid-seats copy is only moved by
        // the invoice-upcoming apply and the post-renewal reset.
        let target = current_count.max(config.high_water_mark.unwrap_or(current_count));

        let Some(gateway) = self.gateway.as_ref() else {
            tracing::warn!(entity_id = %entity_id, "No provider gateway configured, skipping quantity sync");
            return Ok(());
        };

        match gateway
            .update_subscription_quantity(SubscriptionQuantityUpdate {
                subscription_id: config.subscription_id.clone(),
                subscription_item_id: config.subscription_item_id.clone(),
                membership_count: target.max(0) as u64,
                proration_behavior: ProrationBehavior::None,
            })
            .await
        {
            Ok(()) => {
                tracing::info!(
                    entity_id = %entity_id,
                    subscription_id = %config.subscription_id,
                    quantity = target,
                    "Synced subscription quantity to tracked peak"
                );
            }
            Err(err) => {
                // Best effort: the audit trail is authoritative and the
                // renewal cycle re-converges the provider.
                tracing::error!(
                    entity_id = %entity_id,
                    subscription_id = %config.subscription_id,
                    error = %err,
                    "Provider quantity sync failed"
                );
            }
        }

        Ok(())
    }
}

// =============================================================================
// ProrationStrategy
// =============================================================================

/// Annual (or period-less) seat billing: mid-cycle changes are collected in
/// the audit log and invoiced by the external monthly proration batch.
/// Touching the base subscription quantity here would double-charge.
pub struct ProrationStrategy {
    tracker: SeatChangeTracker,
    flags: Arc<dyn FeatureFlagStore>,
}

impl ProrationStrategy {
    #[must_use]
    pub fn new(tracker: SeatChangeTracker, flags: Arc<dyn FeatureFlagStore>) -> Self {
        Self { tracker, flags }
    }

    async fn proration_enabled(&self) -> BillingResult<bool> {
        self.flags.is_globally_enabled(MONTHLY_SEAT_PRORATION).await
    }
}

#[async_trait]
impl ReconciliationStrategy for ProrationStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Proration
    }

    async fn handle_invoice_upcoming(
        &self,
        subscription_id: &str,
    ) -> BillingResult<InvoiceUpcomingOutcome> {
        tracing::debug!(
            subscription_id = %subscription_id,
            "Quantity changes are deferred to the monthly proration batch"
        );
        Ok(InvoiceUpcomingOutcome { applied: false })
    }

    async fn handle_post_renewal_reset(
        &self,
        _subscription_id: &str,
        _period_start_epoch: i64,
    ) -> RenewalResetOutcome {
        RenewalResetOutcome::completed(false)
    }

    async fn handle_member_addition(&self, change: SeatChangeParams) -> BillingResult<()> {
        if !self.proration_enabled().await? {
            tracing::debug!(
                entity_id = %change.entity_id,
                "Monthly proration disabled, seat addition not logged"
            );
            return Ok(());
        }
        self.tracker.log_addition(change).await?;
        Ok(())
    }

    async fn handle_member_removal(&self, change: SeatChangeParams) -> BillingResult<()> {
        if !self.proration_enabled().await? {
            tracing::debug!(
                entity_id = %change.entity_id,
                "Monthly proration disabled, seat removal not logged"
            );
            return Ok(());
        }
        self.tracker.log_removal(change).await?;
        Ok(())
    }

    async fn sync_billing_quantity(&self, entity_id: EntityId) -> BillingResult<()> {
        tracing::debug!(
            entity_id = %entity_id,
            "Quantity sync skipped: seat changes are invoiced by the monthly proration batch"
        );
        Ok(())
    }
}

// =============================================================================
// Resolver
// =============================================================================

/// Strategy resolved for one call, together with the configuration facts
/// that picked it. Never cached across calls.
pub struct StrategyLookupResult {
    pub strategy: Arc<dyn ReconciliationStrategy>,
    pub billing_model: BillingModel,
    pub billing_period: Option<BillingPeriod>,
}

/// Resolves the reconciliation strategy for an entity or a subscription.
///
/// Pure lookup and dispatch: no side effects. "Not found" is an explicit
/// `None`, meaning "nothing to reconcile", never a fault.
#[derive(Clone)]
pub struct StrategyResolver {
    configs: Arc<dyn BillingConfigStore>,
    roster: Arc<dyn RosterStore>,
    flags: Arc<dyn FeatureFlagStore>,
    gateway: Option<Arc<dyn BillingProviderGateway>>,
    tracker: SeatChangeTracker,
    hwm: HighWaterMarkTracker,
}

impl StrategyResolver {
    #[must_use]
    pub fn new(
        configs: Arc<dyn BillingConfigStore>,
        roster: Arc<dyn RosterStore>,
        flags: Arc<dyn FeatureFlagStore>,
        gateway: Option<Arc<dyn BillingProviderGateway>>,
        tracker: SeatChangeTracker,
        hwm: HighWaterMarkTracker,
    ) -> Self {
        Self {
            configs,
            roster,
            flags,
            gateway,
            tracker,
            hwm,
        }
    }

    /// Resolve by billable entity id.
    pub async fn resolve_for_entity(
        &self,
        entity_id: EntityId,
    ) -> BillingResult<Option<StrategyLookupResult>> {
        let Some(config) = self.configs.find_by_entity(entity_id).await? else {
            tracing::debug!(entity_id = %entity_id, "No billing configuration, nothing to reconcile");
            return Ok(None);
        };
        Ok(Some(self.build(config.billing_model, config.billing_period)))
    }

    /// Resolve by provider subscription id.
    pub async fn resolve_for_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<StrategyLookupResult>> {
        let Some(config) = self.configs.find_by_subscription(subscription_id).await? else {
            tracing::debug!(
                subscription_id = %subscription_id,
                "No billing configuration, nothing to reconcile"
            );
            return Ok(None);
        };
        Ok(Some(self.build(config.billing_model, config.billing_period)))
    }

    /// Construct the strategy for a configuration. Strategies are stateless
    /// behavior over shared collaborators, so per-call construction is a
    /// handful of `Arc` clones.
    fn build(
        &self,
        billing_model: BillingModel,
        billing_period: Option<BillingPeriod>,
    ) -> StrategyLookupResult {
        let strategy: Arc<dyn ReconciliationStrategy> =
            match StrategyKind::for_config(billing_model, billing_period) {
                StrategyKind::ActiveUsers => {
                    Arc::new(ActiveUsersStrategy::new(self.tracker.clone()))
                }
                StrategyKind::HighWaterMark => Arc::new(HwmStrategy::new(
                    self.tracker.clone(),
                    self.hwm.clone(),
                    self.configs.clone(),
                    self.roster.clone(),
                    self.gateway.clone(),
                )),
                StrategyKind::Proration => Arc::new(ProrationStrategy::new(
                    self.tracker.clone(),
                    self.flags.clone(),
                )),
            };

        StrategyLookupResult {
            strategy,
            billing_model,
            billing_period,
        }
    }
}
