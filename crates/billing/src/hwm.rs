//! High-water-mark tracking for monthly seat billing.
//!
//! Tracks the peak seat count observed within the current billing period
//! and drives the provider toward that peak. Mid-cycle seat reductions must
//! not dodge the charge for peak usage, while mid-cycle additions are
//! captured without per-addition invoicing. The two-phase protocol —
//! apply the peak before the renewal invoice, reset to the live count after
//! the renewal payment — charges for the max and then re-baselines.

use std::sync::Arc;

use time::OffsetDateTime;

use seatledger_shared::EntityId;

use crate::config::{BillingConfigStore, BillingConfiguration};
use crate::error::{BillingError, BillingResult};
use crate::flags::{FeatureFlagStore, HWM_SEAT_BILLING};
use crate::gateway::{BillingProviderGateway, ProrationBehavior, SubscriptionQuantityUpdate};
use crate::roster::RosterStore;

/// Tracks and applies per-period peak seat counts.
#[derive(Clone)]
pub struct HighWaterMarkTracker {
    configs: Arc<dyn BillingConfigStore>,
    roster: Arc<dyn RosterStore>,
    flags: Arc<dyn FeatureFlagStore>,
    gateway: Option<Arc<dyn BillingProviderGateway>>,
}

impl HighWaterMarkTracker {
    #[must_use]
    pub fn new(
        configs: Arc<dyn BillingConfigStore>,
        roster: Arc<dyn RosterStore>,
        flags: Arc<dyn FeatureFlagStore>,
        gateway: Option<Arc<dyn BillingProviderGateway>>,
    ) -> Self {
        Self {
            configs,
            roster,
            flags,
            gateway,
        }
    }

    /// Record a seat addition against the current period's peak.
    ///
    /// Only monthly seat configurations participate. Removals never go
    /// through here: the peak is monotonically non-decreasing within a
    /// period.
    pub async fn update_on_addition(
        &self,
        entity_id: EntityId,
        current_period_start: Option<OffsetDateTime>,
    ) -> BillingResult<()> {
        if !self.flags.is_globally_enabled(HWM_SEAT_BILLING).await? {
            tracing::debug!(entity_id = %entity_id, "HWM billing disabled, skipping peak update");
            return Ok(());
        }

        let Some(config) = self.configs.find_by_entity(entity_id).await? else {
            tracing::debug!(entity_id = %entity_id, "No billing configuration, skipping peak update");
            return Ok(());
        };

        if !config.is_monthly_seats() {
            return Ok(());
        }

        let Some(current_count) = self.roster.member_count(entity_id).await? else {
            tracing::warn!(entity_id = %entity_id, "Member count unavailable, skipping peak update");
            return Ok(());
        };

        let same_period = config.high_water_mark_period_start.is_some()
            && config.high_water_mark_period_start == current_period_start;

        match config.high_water_mark {
            Some(hwm) if same_period => {
                if current_count > hwm {
                    let raised = self
                        .configs
                        .raise_high_water_mark(entity_id, current_count)
                        .await?;
                    if raised {
                        tracing::info!(
                            entity_id = %entity_id,
                            previous = hwm,
                            high_water_mark = current_count,
                            "Raised high-water-mark"
                        );
                    }
                }
            }
            _ => {
                // New period (or never tracked): the current count becomes
                // the peak, anchored at the caller's period start.
                self.configs
                    .set_high_water_mark(entity_id, current_count, current_period_start)
                    .await?;
                tracing::info!(
                    entity_id = %entity_id,
                    high_water_mark = current_count,
                    period_start = ?current_period_start,
                    "Started high-water-mark period"
                );
            }
        }

        Ok(())
    }

    /// Push the tracked peak to the provider ahead of the renewal invoice.
    ///
    /// Returns `true` iff the provider quantity was actually changed.
    pub async fn apply_to_subscription(&self, subscription_id: &str) -> BillingResult<bool> {
        if !self.flags.is_globally_enabled(HWM_SEAT_BILLING).await? {
            tracing::debug!(subscription_id = %subscription_id, "HWM billing disabled, skipping apply");
            return Ok(false);
        }

        let gateway = self.require_gateway()?;

        let Some(config) = self.configs.find_by_subscription(subscription_id).await? else {
            tracing::debug!(subscription_id = %subscription_id, "No billing configuration, nothing to apply");
            return Ok(false);
        };

        if !config.is_monthly_seats() {
            tracing::debug!(
                subscription_id = %subscription_id,
                billing_period = ?config.billing_period,
                "Not a monthly seat subscription, skipping apply"
            );
            return Ok(false);
        }

        let entity_id = config.entity_id;

        let high_water_mark = match config.high_water_mark {
            Some(hwm) => hwm,
            None => match self.initialize_high_water_mark(&config).await? {
                Some(hwm) => hwm,
                None => return Ok(false),
            },
        };

        let paid_seats = match config.paid_seats {
            Some(paid) => paid,
            None => {
                // Local copy never synced; trust the provider's live quantity.
                let live = gateway.get_subscription(subscription_id).await?;
                let Some(quantity) = live.quantity else {
                    tracing::warn!(
                        subscription_id = %subscription_id,
                        "Provider subscription has no quantity, cannot sync paid seats"
                    );
                    return Ok(false);
                };
                let quantity = quantity as i64;
                self.configs.set_paid_seats(entity_id, quantity).await?;
                quantity
            }
        };

        if high_water_mark == paid_seats {
            tracing::debug!(
                entity_id = %entity_id,
                paid_seats,
                "Peak already billed, no change needed"
            );
            return Ok(false);
        }

        // Direction only matters for the log line; the update is symmetric.
        let direction = if high_water_mark > paid_seats {
            "scale-up"
        } else {
            "scale-down"
        };

        gateway
            .update_subscription_quantity(SubscriptionQuantityUpdate {
                subscription_id: config.subscription_id.clone(),
                subscription_item_id: config.subscription_item_id.clone(),
                membership_count: high_water_mark.max(0) as u64,
                proration_behavior: ProrationBehavior::None,
            })
            .await?;

        self.configs
            .set_paid_seats(entity_id, high_water_mark)
            .await?;

        tracing::info!(
            entity_id = %entity_id,
            subscription_id = %subscription_id,
            previous_paid_seats = paid_seats,
            paid_seats = high_water_mark,
            direction,
            "Applied high-water-mark to subscription"
        );

        Ok(true)
    }

    /// Re-baseline after a successful renewal payment.
    ///
    /// The period just ended was charged at its peak; going forward the
    /// billed quantity drops (or rises) to the live roster count and the
    /// peak-tracking window restarts at `new_period_start`. Returns `true`
    /// iff the provider quantity was changed.
    pub async fn reset_after_renewal(
        &self,
        subscription_id: &str,
        new_period_start: OffsetDateTime,
    ) -> BillingResult<bool> {
        if !self.flags.is_globally_enabled(HWM_SEAT_BILLING).await? {
            tracing::debug!(subscription_id = %subscription_id, "HWM billing disabled, skipping reset");
            return Ok(false);
        }

        let gateway = self.require_gateway()?;

        let Some(config) = self.configs.find_by_subscription(subscription_id).await? else {
            tracing::debug!(subscription_id = %subscription_id, "No billing configuration, nothing to reset");
            return Ok(false);
        };

        if !config.is_monthly_seats() {
            return Ok(false);
        }

        let entity_id = config.entity_id;

        let Some(current_count) = self.roster.member_count(entity_id).await? else {
            tracing::warn!(entity_id = %entity_id, "Member count unavailable, skipping renewal reset");
            return Ok(false);
        };

        if config.paid_seats == Some(current_count) {
            // Even a no-op renewal restarts the peak-tracking window.
            self.configs
                .set_high_water_mark(entity_id, current_count, Some(new_period_start))
                .await?;
            tracing::debug!(
                entity_id = %entity_id,
                paid_seats = current_count,
                "Renewal quantity unchanged, re-anchored peak window"
            );
            return Ok(false);
        }

        gateway
            .update_subscription_quantity(SubscriptionQuantityUpdate {
                subscription_id: config.subscription_id.clone(),
                subscription_item_id: config.subscription_item_id.clone(),
                membership_count: current_count.max(0) as u64,
                proration_behavior: ProrationBehavior::None,
            })
            .await?;

        self.configs
            .set_high_water_mark(entity_id, current_count, Some(new_period_start))
            .await?;
        self.configs.set_paid_seats(entity_id, current_count).await?;

        tracing::info!(
            entity_id = %entity_id,
            subscription_id = %subscription_id,
            previous_paid_seats = ?config.paid_seats,
            paid_seats = current_count,
            new_period_start = %new_period_start,
            "Reset subscription quantity for new billing period"
        );

        Ok(true)
    }

    /// Seed the peak from the live roster when it was never tracked.
    ///
    /// Picks the instantaneous count as the initial peak, which can
    /// under-count a peak that came and went before first initialization;
    /// that is accepted behavior.
    async fn initialize_high_water_mark(
        &self,
        config: &BillingConfiguration,
    ) -> BillingResult<Option<i64>> {
        let entity_id = config.entity_id;

        let Some(current_count) = self.roster.member_count(entity_id).await? else {
            tracing::warn!(entity_id = %entity_id, "Member count unavailable, cannot seed high-water-mark");
            return Ok(None);
        };

        let Some(anchor) = config.hwm_period_anchor() else {
            tracing::warn!(
                entity_id = %entity_id,
                "No period start or subscription start known, cannot seed high-water-mark"
            );
            return Ok(None);
        };

        self.configs
            .set_high_water_mark(entity_id, current_count, Some(anchor))
            .await?;

        tracing::info!(
            entity_id = %entity_id,
            high_water_mark = current_count,
            period_start = %anchor,
            "Seeded high-water-mark from current roster"
        );

        Ok(Some(current_count))
    }

    fn require_gateway(&self) -> BillingResult<&Arc<dyn BillingProviderGateway>> {
        self.gateway
            .as_ref()
            .ok_or(BillingError::GatewayNotConfigured)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        monthly_seats_config, InMemoryBillingConfigStore, InMemoryFeatureFlags,
        InMemoryRosterStore, RecordingGateway,
    };
    use seatledger_shared::{BillingModel, BillingPeriod};
    use time::macros::datetime;

    const ENTITY: EntityId = EntityId(101);
    const SUB: &str = "sub_hwm";

    struct Harness {
        configs: Arc<InMemoryBillingConfigStore>,
        roster: Arc<InMemoryRosterStore>,
        flags: Arc<InMemoryFeatureFlags>,
        gateway: Arc<RecordingGateway>,
        tracker: HighWaterMarkTracker,
    }

    async fn harness() -> Harness {
        let configs = Arc::new(InMemoryBillingConfigStore::new());
        let roster = Arc::new(InMemoryRosterStore::new());
        let flags = Arc::new(InMemoryFeatureFlags::new());
        let gateway = Arc::new(RecordingGateway::new());

        flags.enable(HWM_SEAT_BILLING).await;

        let tracker = HighWaterMarkTracker::new(
            configs.clone(),
            roster.clone(),
            flags.clone(),
            Some(gateway.clone()),
        );

        Harness {
            configs,
            roster,
            flags,
            gateway,
            tracker,
        }
    }

    #[tokio::test]
    async fn additions_track_the_maximum_roster_size() {
        let h = harness().await;
        let anchor = datetime!(2026-01-01 00:00 UTC);
        let mut config = monthly_seats_config(ENTITY, SUB);
        config.high_water_mark = Some(2);
        config.high_water_mark_period_start = Some(anchor);
        h.configs.insert(&config).await.unwrap();

        for count in [3, 5, 4] {
            h.roster.set_member_count(ENTITY, count).await;
            h.tracker
                .update_on_addition(ENTITY, Some(anchor))
                .await
                .unwrap();
        }

        let stored = h.configs.get(ENTITY).await.unwrap();
        assert_eq!(stored.high_water_mark, Some(5));
        assert_eq!(stored.high_water_mark_period_start, Some(anchor));
    }

    #[tokio::test]
    async fn new_period_start_resets_the_peak_unconditionally() {
        let h = harness().await;
        let old_anchor = datetime!(2026-01-01 00:00 UTC);
        let new_anchor = datetime!(2026-02-01 00:00 UTC);
        let mut config = monthly_seats_config(ENTITY, SUB);
        config.high_water_mark = Some(9);
        config.high_water_mark_period_start = Some(old_anchor);
        h.configs.insert(&config).await.unwrap();

        h.roster.set_member_count(ENTITY, 3).await;
        h.tracker
            .update_on_addition(ENTITY, Some(new_anchor))
            .await
            .unwrap();

        let stored = h.configs.get(ENTITY).await.unwrap();
        assert_eq!(stored.high_water_mark, Some(3));
        assert_eq!(stored.high_water_mark_period_start, Some(new_anchor));
    }

    #[tokio::test]
    async fn disabled_flag_skips_peak_updates() {
        let h = harness().await;
        h.flags.disable(HWM_SEAT_BILLING).await;
        let config = monthly_seats_config(ENTITY, SUB);
        h.configs.insert(&config).await.unwrap();
        h.roster.set_member_count(ENTITY, 10).await;

        h.tracker.update_on_addition(ENTITY, None).await.unwrap();

        assert_eq!(h.configs.get(ENTITY).await.unwrap().high_water_mark, None);
    }

    #[tokio::test]
    async fn non_monthly_configurations_never_track_peaks() {
        let h = harness().await;
        let mut config = monthly_seats_config(ENTITY, SUB);
        config.billing_period = Some(BillingPeriod::Annually);
        h.configs.insert(&config).await.unwrap();
        h.roster.set_member_count(ENTITY, 10).await;

        h.tracker.update_on_addition(ENTITY, None).await.unwrap();

        assert_eq!(h.configs.get(ENTITY).await.unwrap().high_water_mark, None);
    }

    #[tokio::test]
    async fn active_users_configurations_never_track_peaks() {
        let h = harness().await;
        let mut config = monthly_seats_config(ENTITY, SUB);
        config.billing_model = BillingModel::ActiveUsers;
        h.configs.insert(&config).await.unwrap();
        h.roster.set_member_count(ENTITY, 10).await;

        h.tracker.update_on_addition(ENTITY, None).await.unwrap();

        assert_eq!(h.configs.get(ENTITY).await.unwrap().high_water_mark, None);
    }

    #[tokio::test]
    async fn apply_pushes_peak_and_records_paid_seats() {
        let h = harness().await;
        let mut config = monthly_seats_config(ENTITY, SUB);
        config.high_water_mark = Some(4);
        config.high_water_mark_period_start = Some(datetime!(2026-01-01 00:00 UTC));
        config.paid_seats = Some(1);
        h.configs.insert(&config).await.unwrap();

        let applied = h.tracker.apply_to_subscription(SUB).await.unwrap();

        assert!(applied);
        let updates = h.gateway.updates().await;
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].membership_count, 4);
        assert_eq!(updates[0].proration_behavior, ProrationBehavior::None);
        assert_eq!(h.configs.get(ENTITY).await.unwrap().paid_seats, Some(4));
    }

    #[tokio::test]
    async fn apply_is_idempotent_at_the_result_level() {
        let h = harness().await;
        let mut config = monthly_seats_config(ENTITY, SUB);
        config.high_water_mark = Some(4);
        config.high_water_mark_period_start = Some(datetime!(2026-01-01 00:00 UTC));
        config.paid_seats = Some(1);
        h.configs.insert(&config).await.unwrap();

        assert!(h.tracker.apply_to_subscription(SUB).await.unwrap());
        assert!(!h.tracker.apply_to_subscription(SUB).await.unwrap());

        // Second call was a no-op: exactly one provider call in total.
        assert_eq!(h.gateway.updates().await.len(), 1);
    }

    #[tokio::test]
    async fn apply_scales_down_when_paid_exceeds_peak() {
        let h = harness().await;
        let mut config = monthly_seats_config(ENTITY, SUB);
        config.high_water_mark = Some(3);
        config.high_water_mark_period_start = Some(datetime!(2026-01-01 00:00 UTC));
        config.paid_seats = Some(8);
        h.configs.insert(&config).await.unwrap();

        assert!(h.tracker.apply_to_subscription(SUB).await.unwrap());
        assert_eq!(h.gateway.updates().await[0].membership_count, 3);
    }

    #[tokio::test]
    async fn apply_seeds_missing_peak_from_roster() {
        let h = harness().await;
        let mut config = monthly_seats_config(ENTITY, SUB);
        config.paid_seats = Some(2);
        config.subscription_start = Some(datetime!(2026-01-15 00:00 UTC));
        h.configs.insert(&config).await.unwrap();
        h.roster.set_member_count(ENTITY, 5).await;

        let applied = h.tracker.apply_to_subscription(SUB).await.unwrap();

        assert!(applied);
        let stored = h.configs.get(ENTITY).await.unwrap();
        assert_eq!(stored.high_water_mark, Some(5));
        assert_eq!(
            stored.high_water_mark_period_start,
            Some(datetime!(2026-01-15 00:00 UTC))
        );
        assert_eq!(stored.paid_seats, Some(5));
    }

    #[tokio::test]
    async fn apply_without_any_period_anchor_is_a_soft_failure() {
        let h = harness().await;
        let mut config = monthly_seats_config(ENTITY, SUB);
        config.paid_seats = Some(2);
        config.subscription_start = None;
        h.configs.insert(&config).await.unwrap();
        h.roster.set_member_count(ENTITY, 5).await;

        assert!(!h.tracker.apply_to_subscription(SUB).await.unwrap());
        assert!(h.gateway.updates().await.is_empty());
    }

    #[tokio::test]
    async fn apply_lazily_syncs_paid_seats_from_provider() {
        let h = harness().await;
        let mut config = monthly_seats_config(ENTITY, SUB);
        config.high_water_mark = Some(6);
        config.high_water_mark_period_start = Some(datetime!(2026-01-01 00:00 UTC));
        config.paid_seats = None;
        h.configs.insert(&config).await.unwrap();
        h.gateway.set_subscription_quantity(SUB, 6).await;

        // Live quantity already matches the peak: sync only, no update call.
        assert!(!h.tracker.apply_to_subscription(SUB).await.unwrap());
        assert!(h.gateway.updates().await.is_empty());
        assert_eq!(h.configs.get(ENTITY).await.unwrap().paid_seats, Some(6));
    }

    #[tokio::test]
    async fn apply_without_gateway_is_an_error() {
        let h = harness().await;
        let tracker = HighWaterMarkTracker::new(
            h.configs.clone(),
            h.roster.clone(),
            h.flags.clone(),
            None,
        );
        h.configs
            .insert(&monthly_seats_config(ENTITY, SUB))
            .await
            .unwrap();

        let err = tracker.apply_to_subscription(SUB).await;
        assert!(matches!(err, Err(BillingError::GatewayNotConfigured)));
    }

    #[tokio::test]
    async fn reset_with_unchanged_count_reanchors_without_provider_call() {
        let h = harness().await;
        let mut config = monthly_seats_config(ENTITY, SUB);
        config.high_water_mark = Some(7);
        config.high_water_mark_period_start = Some(datetime!(2026-01-01 00:00 UTC));
        config.paid_seats = Some(3);
        h.configs.insert(&config).await.unwrap();
        h.roster.set_member_count(ENTITY, 3).await;

        let new_start = datetime!(2026-02-01 00:00 UTC);
        let updated = h.tracker.reset_after_renewal(SUB, new_start).await.unwrap();

        assert!(!updated);
        assert!(h.gateway.updates().await.is_empty());
        let stored = h.configs.get(ENTITY).await.unwrap();
        assert_eq!(stored.high_water_mark, Some(3));
        assert_eq!(stored.high_water_mark_period_start, Some(new_start));
    }

    #[tokio::test]
    async fn reset_scales_down_to_live_count_after_peak_period() {
        let h = harness().await;
        let mut config = monthly_seats_config(ENTITY, SUB);
        config.high_water_mark = Some(7);
        config.high_water_mark_period_start = Some(datetime!(2026-01-01 00:00 UTC));
        config.paid_seats = Some(7);
        h.configs.insert(&config).await.unwrap();
        h.roster.set_member_count(ENTITY, 4).await;

        let new_start = datetime!(2026-02-01 00:00 UTC);
        let updated = h.tracker.reset_after_renewal(SUB, new_start).await.unwrap();

        assert!(updated);
        let updates = h.gateway.updates().await;
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].membership_count, 4);
        let stored = h.configs.get(ENTITY).await.unwrap();
        assert_eq!(stored.paid_seats, Some(4));
        assert_eq!(stored.high_water_mark, Some(4));
        assert_eq!(stored.high_water_mark_period_start, Some(new_start));
    }

    #[tokio::test]
    async fn reset_with_unknown_roster_is_a_soft_failure() {
        let h = harness().await;
        h.configs
            .insert(&monthly_seats_config(ENTITY, SUB))
            .await
            .unwrap();

        let updated = h
            .tracker
            .reset_after_renewal(SUB, datetime!(2026-02-01 00:00 UTC))
            .await
            .unwrap();

        assert!(!updated);
        assert!(h.gateway.updates().await.is_empty());
    }
}
