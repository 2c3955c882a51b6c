//! Feature flag store seam.
//!
//! The two billing flags gate strategy behavior at call time, never at
//! resolution time: an operation that cannot apply because its flag is off
//! returns a valid no-op result, not an error.

use async_trait::async_trait;

use crate::error::BillingResult;

/// High-water-mark seat billing for monthly seat plans.
pub const HWM_SEAT_BILLING: &str = "hwm-seat-billing";

/// Deferred monthly proration invoicing for annual seat plans.
pub const MONTHLY_SEAT_PRORATION: &str = "monthly-seat-proration";

/// Global feature flag lookup.
#[async_trait]
pub trait FeatureFlagStore: Send + Sync {
    /// Whether a flag is enabled for the whole installation.
    async fn is_globally_enabled(&self, flag: &str) -> BillingResult<bool>;
}
