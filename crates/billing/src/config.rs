//! Billing configuration records and their store.
//!
//! One `BillingConfiguration` exists per billable entity (a team or an
//! organization — mutually exclusive owners). The high-water-mark fields
//! live directly on the configuration row so they can be read and written
//! transactionally with the rest of the billing state.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use seatledger_shared::{BillingModel, BillingPeriod, EntityId};

use crate::error::BillingResult;

/// Billing configuration for one billable entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingConfiguration {
    pub entity_id: EntityId,
    pub billing_model: BillingModel,
    /// `None` for subscriptions without a recurring period.
    pub billing_period: Option<BillingPeriod>,

    /// Provider-side identifiers.
    pub subscription_id: String,
    pub subscription_item_id: Option<String>,
    pub customer_id: String,

    /// Last known quantity charged by the provider.
    pub paid_seats: Option<i64>,

    /// Peak seat count observed within the current billing period.
    /// Mutated only through the high-water-mark tracker.
    pub high_water_mark: Option<i64>,
    pub high_water_mark_period_start: Option<OffsetDateTime>,

    pub subscription_start: Option<OffsetDateTime>,
    pub trial_end: Option<OffsetDateTime>,
    pub price_per_seat_cents: Option<i64>,
}

impl BillingConfiguration {
    /// The period anchor used for high-water-mark tracking: the stored
    /// period start, falling back to the subscription start.
    #[must_use]
    pub fn hwm_period_anchor(&self) -> Option<OffsetDateTime> {
        self.high_water_mark_period_start.or(self.subscription_start)
    }

    /// Whether this configuration bills seats on a monthly period.
    #[must_use]
    pub fn is_monthly_seats(&self) -> bool {
        self.billing_model == BillingModel::Seats
            && self.billing_period == Some(BillingPeriod::Monthly)
    }

    /// Whether the entity is currently in its trial window.
    #[must_use]
    pub fn is_trialing(&self, now: OffsetDateTime) -> bool {
        self.trial_end.is_some_and(|end| end > now)
    }
}

/// Persistence operations for billing configurations.
///
/// Implementations must make `raise_high_water_mark` atomic (a guarded
/// single-row update), so concurrent seat additions racing on the same row
/// resolve to the maximum rather than the last writer's value.
#[async_trait]
pub trait BillingConfigStore: Send + Sync {
    /// Load the configuration owned by an entity.
    async fn find_by_entity(&self, entity_id: EntityId)
        -> BillingResult<Option<BillingConfiguration>>;

    /// Load the configuration holding a provider subscription.
    /// A subscription id identifies at most one configuration.
    async fn find_by_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<BillingConfiguration>>;

    /// Create or replace a configuration (subscription provisioning).
    async fn insert(&self, config: &BillingConfiguration) -> BillingResult<()>;

    /// Unconditionally set the high-water-mark and re-anchor its period.
    async fn set_high_water_mark(
        &self,
        entity_id: EntityId,
        value: i64,
        period_start: Option<OffsetDateTime>,
    ) -> BillingResult<()>;

    /// Raise the high-water-mark to `value` if it is currently lower (or
    /// unset). Returns whether the stored value changed.
    async fn raise_high_water_mark(&self, entity_id: EntityId, value: i64)
        -> BillingResult<bool>;

    /// Record the quantity last charged by the provider.
    async fn set_paid_seats(&self, entity_id: EntityId, value: i64) -> BillingResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn config() -> BillingConfiguration {
        BillingConfiguration {
            entity_id: EntityId(1),
            billing_model: BillingModel::Seats,
            billing_period: Some(BillingPeriod::Monthly),
            subscription_id: "sub_1".into(),
            subscription_item_id: Some("si_1".into()),
            customer_id: "cus_1".into(),
            paid_seats: None,
            high_water_mark: None,
            high_water_mark_period_start: None,
            subscription_start: Some(datetime!(2026-01-15 00:00 UTC)),
            trial_end: None,
            price_per_seat_cents: Some(1500),
        }
    }

    #[test]
    fn anchor_falls_back_to_subscription_start() {
        let mut cfg = config();
        assert_eq!(cfg.hwm_period_anchor(), cfg.subscription_start);

        cfg.high_water_mark_period_start = Some(datetime!(2026-02-15 00:00 UTC));
        assert_eq!(
            cfg.hwm_period_anchor(),
            Some(datetime!(2026-02-15 00:00 UTC))
        );
    }

    #[test]
    fn monthly_seats_requires_both_model_and_period() {
        let mut cfg = config();
        assert!(cfg.is_monthly_seats());

        cfg.billing_period = Some(BillingPeriod::Annually);
        assert!(!cfg.is_monthly_seats());

        cfg.billing_period = None;
        assert!(!cfg.is_monthly_seats());

        cfg.billing_model = BillingModel::ActiveUsers;
        cfg.billing_period = Some(BillingPeriod::Monthly);
        assert!(!cfg.is_monthly_seats());
    }

    #[test]
    fn trialing_window_is_exclusive_of_past_ends() {
        let mut cfg = config();
        let now = datetime!(2026-03-01 12:00 UTC);
        assert!(!cfg.is_trialing(now));

        cfg.trial_end = Some(datetime!(2026-03-02 00:00 UTC));
        assert!(cfg.is_trialing(now));

        cfg.trial_end = Some(datetime!(2026-02-01 00:00 UTC));
        assert!(!cfg.is_trialing(now));
    }
}
