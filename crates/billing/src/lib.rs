// Billing crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::too_many_arguments)] // Some store operations require many parameters
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Seatledger Billing Module
//!
//! Reconciles roster seat counts against the external subscription
//! provider without over- or under-charging, despite asynchronous webhook
//! delivery, concurrent membership mutations, and provider-call failures.
//!
//! ## Features
//!
//! - **Strategy Resolution**: Per-call mapping of a billing configuration
//!   to one of three reconciliation strategies
//! - **High-Water-Mark Tracking**: Charge monthly seat plans for the peak
//!   count observed in each period, then re-baseline at renewal
//! - **Seat Change Audit Log**: Append-only, idempotent on caller-supplied
//!   operation ids, consumed by the monthly proration batch
//! - **Webhook Dispatch**: `invoice.upcoming` and renewal-success entry
//!   points for the external webhook transport

pub mod audit;
pub mod config;
pub mod error;
pub mod flags;
pub mod gateway;
pub mod hwm;
pub mod pg;
pub mod roster;
pub mod strategy;
pub mod webhooks;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;


// Audit
pub use audit::{
    month_key, MonthlySeatChanges, NewSeatChange, SeatChangeInsert, SeatChangeLogEntry,
    SeatChangeParams, SeatChangeStore, SeatChangeTotals, SeatChangeTracker, SeatChangeType,
};

// Config
pub use config::{BillingConfigStore, BillingConfiguration};

// Error
pub use error::{BillingError, BillingResult};

// Flags
pub use flags::{FeatureFlagStore, HWM_SEAT_BILLING, MONTHLY_SEAT_PRORATION};

// Gateway
pub use gateway::{
    BillingProviderGateway, ProrationBehavior, ProviderSubscription, StripeSeatGateway,
    SubscriptionQuantityUpdate,
};

// HWM
pub use hwm::HighWaterMarkTracker;

// Postgres stores
pub use pg::{PgBillingConfigStore, PgFeatureFlagStore, PgRosterStore, PgSeatChangeStore};

// Roster
pub use roster::RosterStore;

// Strategy
pub use strategy::{
    ActiveUsersStrategy, HwmStrategy, InvoiceUpcomingOutcome, ProrationStrategy,
    ReconciliationStrategy, RenewalResetOutcome, StrategyKind, StrategyLookupResult,
    StrategyResolver,
};

// Webhooks
pub use webhooks::WebhookDispatcher;

use std::sync::Arc;

use sqlx::PgPool;

/// Main seat billing service wiring the Postgres stores and a provider
/// gateway into the tracker, resolver, and webhook dispatcher.
pub struct SeatBillingService {
    pub tracker: SeatChangeTracker,
    pub hwm: HighWaterMarkTracker,
    pub resolver: StrategyResolver,
    pub webhooks: WebhookDispatcher,
}

impl SeatBillingService {
    /// Create the service with the Stripe gateway configured from
    /// environment variables.
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let gateway: Arc<dyn BillingProviderGateway> = Arc::new(StripeSeatGateway::from_env()?);
        Ok(Self::new(pool, Some(gateway)))
    }

    /// Create the service with an explicit gateway (or none: peak tracking
    /// and audit logging keep working, provider-driving operations error).
    #[must_use]
    pub fn new(pool: PgPool, gateway: Option<Arc<dyn BillingProviderGateway>>) -> Self {
        let configs: Arc<dyn BillingConfigStore> =
            Arc::new(PgBillingConfigStore::new(pool.clone()));
        let changes: Arc<dyn SeatChangeStore> = Arc::new(PgSeatChangeStore::new(pool.clone()));
        let roster: Arc<dyn RosterStore> = Arc::new(PgRosterStore::new(pool.clone()));
        let flags: Arc<dyn FeatureFlagStore> = Arc::new(PgFeatureFlagStore::new(pool));

        let hwm = HighWaterMarkTracker::new(
            configs.clone(),
            roster.clone(),
            flags.clone(),
            gateway.clone(),
        );
        let tracker =
            SeatChangeTracker::new(configs.clone(), changes, roster.clone(), hwm.clone());
        let resolver = StrategyResolver::new(
            configs,
            roster,
            flags,
            gateway,
            tracker.clone(),
            hwm.clone(),
        );
        let webhooks = WebhookDispatcher::new(resolver.clone());

        Self {
            tracker,
            hwm,
            resolver,
            webhooks,
        }
    }
}
