//! Strategy dispatch entry points for provider webhook events.
//!
//! Signature verification, event parsing, and delivery-level idempotency
//! belong to the surrounding webhook transport; this dispatcher is what it
//! mounts for the two renewal-cycle events. A tenant without a billing
//! configuration is a logged no-op, never a failed delivery.

use crate::error::BillingResult;
use crate::strategy::{InvoiceUpcomingOutcome, RenewalResetOutcome, StrategyResolver};

/// Routes renewal-cycle webhook events to the resolved strategy.
#[derive(Clone)]
pub struct WebhookDispatcher {
    resolver: StrategyResolver,
}

impl WebhookDispatcher {
    #[must_use]
    pub fn new(resolver: StrategyResolver) -> Self {
        Self { resolver }
    }

    /// `invoice.upcoming`: the provider is about to generate the renewal
    /// invoice; give the strategy a chance to adjust the billed quantity.
    pub async fn handle_invoice_upcoming(
        &self,
        subscription_id: &str,
    ) -> BillingResult<InvoiceUpcomingOutcome> {
        let Some(lookup) = self.resolver.resolve_for_subscription(subscription_id).await? else {
            return Ok(InvoiceUpcomingOutcome { applied: false });
        };

        tracing::info!(
            subscription_id = %subscription_id,
            strategy = %lookup.strategy.kind(),
            "Dispatching invoice.upcoming"
        );

        lookup.strategy.handle_invoice_upcoming(subscription_id).await
    }

    /// Renewal payment succeeded: reset peak-tracking state for the period
    /// starting at `period_start_epoch` (unix seconds from the event).
    pub async fn handle_renewal_success(
        &self,
        subscription_id: &str,
        period_start_epoch: i64,
    ) -> BillingResult<RenewalResetOutcome> {
        let Some(lookup) = self.resolver.resolve_for_subscription(subscription_id).await? else {
            return Ok(RenewalResetOutcome::completed(false));
        };

        tracing::info!(
            subscription_id = %subscription_id,
            strategy = %lookup.strategy.kind(),
            period_start_epoch,
            "Dispatching renewal success"
        );

        Ok(lookup
            .strategy
            .handle_post_renewal_reset(subscription_id, period_start_epoch)
            .await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::SeatChangeTracker;
    use crate::config::BillingConfigStore;
    use crate::flags::HWM_SEAT_BILLING;
    use crate::hwm::HighWaterMarkTracker;
    use crate::testing::{
        monthly_seats_config, InMemoryBillingConfigStore, InMemoryFeatureFlags,
        InMemoryRosterStore, InMemorySeatChangeStore, RecordingGateway,
    };
    use seatledger_shared::EntityId;
    use std::sync::Arc;

    const ENTITY: EntityId = EntityId(31);
    const SUB: &str = "sub_webhook";

    struct Harness {
        configs: Arc<InMemoryBillingConfigStore>,
        roster: Arc<InMemoryRosterStore>,
        gateway: Arc<RecordingGateway>,
        dispatcher: WebhookDispatcher,
    }

    async fn harness() -> Harness {
        let configs = Arc::new(InMemoryBillingConfigStore::new());
        let changes = Arc::new(InMemorySeatChangeStore::new());
        let roster = Arc::new(InMemoryRosterStore::new());
        let flags = Arc::new(InMemoryFeatureFlags::new());
        let gateway = Arc::new(RecordingGateway::new());

        flags.enable(HWM_SEAT_BILLING).await;

        let hwm = HighWaterMarkTracker::new(
            configs.clone(),
            roster.clone(),
            flags.clone(),
            Some(gateway.clone()),
        );
        let tracker =
            SeatChangeTracker::new(configs.clone(), changes, roster.clone(), hwm.clone());
        let resolver = StrategyResolver::new(
            configs.clone(),
            roster.clone(),
            flags,
            Some(gateway.clone()),
            tracker,
            hwm,
        );

        Harness {
            configs,
            roster,
            gateway,
            dispatcher: WebhookDispatcher::new(resolver),
        }
    }

    #[tokio::test]
    async fn unknown_subscription_is_a_noop_for_both_events() {
        let h = harness().await;

        let upcoming = h
            .dispatcher
            .handle_invoice_upcoming("sub_unknown")
            .await
            .unwrap();
        assert!(!upcoming.applied);

        let reset = h
            .dispatcher
            .handle_renewal_success("sub_unknown", 1_767_225_600)
            .await
            .unwrap();
        assert!(reset.success);
        assert!(!reset.updated);
    }

    #[tokio::test]
    async fn invoice_upcoming_routes_to_the_hwm_strategy() {
        let h = harness().await;
        let mut config = monthly_seats_config(ENTITY, SUB);
        config.high_water_mark = Some(6);
        config.high_water_mark_period_start = config.subscription_start;
        config.paid_seats = Some(2);
        h.configs.insert(&config).await.unwrap();

        let outcome = h.dispatcher.handle_invoice_upcoming(SUB).await.unwrap();

        assert!(outcome.applied);
        let updates = h.gateway.updates().await;
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].membership_count, 6);
    }

    #[tokio::test]
    async fn renewal_success_resets_to_the_live_count() {
        let h = harness().await;
        let mut config = monthly_seats_config(ENTITY, SUB);
        config.high_water_mark = Some(6);
        config.high_water_mark_period_start = config.subscription_start;
        config.paid_seats = Some(6);
        h.configs.insert(&config).await.unwrap();
        h.roster.set_member_count(ENTITY, 3).await;

        let outcome = h
            .dispatcher
            .handle_renewal_success(SUB, 1_767_225_600)
            .await
            .unwrap();

        assert!(outcome.success);
        assert!(outcome.updated);
        assert_eq!(h.configs.get(ENTITY).await.unwrap().paid_seats, Some(3));
    }
}
