//! Billing provider gateway.
//!
//! The only seam that talks to the payment provider. Everything above it
//! deals in `ProviderSubscription` snapshots and quantity updates, so tests
//! can substitute a recording double and production wires in Stripe.

use async_trait::async_trait;
use stripe::{Subscription, SubscriptionId, UpdateSubscription, UpdateSubscriptionItems};
// The proration behavior enum lives in the subscription module (not subscription_item)
use stripe::generated::billing::subscription::SubscriptionProrationBehavior;
use time::OffsetDateTime;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::error::{BillingError, BillingResult};

/// How the provider should treat mid-cycle quantity changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProrationBehavior {
    /// No proration. The high-water-mark mechanism is itself the proration
    /// strategy; the provider must not also prorate.
    None,
    CreateProrations,
    AlwaysInvoice,
}

impl ProrationBehavior {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::CreateProrations => "create_prorations",
            Self::AlwaysInvoice => "always_invoice",
        }
    }
}

/// Snapshot of the provider's view of a subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderSubscription {
    pub id: String,
    /// First subscription item, which carries the seat quantity.
    pub item_id: Option<String>,
    pub quantity: Option<u64>,
    pub current_period_start: Option<OffsetDateTime>,
}

/// Parameters for driving the provider's subscription quantity.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionQuantityUpdate {
    pub subscription_id: String,
    /// When absent, implementations resolve the first subscription item.
    pub subscription_item_id: Option<String>,
    pub membership_count: u64,
    pub proration_behavior: ProrationBehavior,
}

/// Gateway to the external payment provider.
///
/// Calls may block on network I/O; callers must not hold locks across them.
/// Timeouts are owned by the implementation and surface as ordinary
/// provider failures.
#[async_trait]
pub trait BillingProviderGateway: Send + Sync {
    /// Fetch the live subscription state.
    async fn get_subscription(&self, subscription_id: &str)
        -> BillingResult<ProviderSubscription>;

    /// Set the subscription's seat quantity.
    async fn update_subscription_quantity(
        &self,
        update: SubscriptionQuantityUpdate,
    ) -> BillingResult<()>;
}

// =============================================================================
// Stripe implementation
// =============================================================================

/// Stripe-backed gateway.
pub struct StripeSeatGateway {
    client: stripe::Client,
}

impl StripeSeatGateway {
    #[must_use]
    pub fn new(secret_key: &str) -> Self {
        Self {
            client: stripe::Client::new(secret_key),
        }
    }

    /// Build the gateway from `STRIPE_SECRET_KEY`.
    pub fn from_env() -> BillingResult<Self> {
        dotenvy::dotenv().ok();
        let key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY is not set".to_string()))?;
        Ok(Self::new(&key))
    }

    fn parse_subscription_id(subscription_id: &str) -> BillingResult<SubscriptionId> {
        subscription_id
            .parse::<SubscriptionId>()
            .map_err(|e| BillingError::StripeApi(format!("invalid subscription id: {e}")))
    }

    fn retry_strategy() -> impl Iterator<Item = std::time::Duration> {
        ExponentialBackoff::from_millis(200).map(jitter).take(3)
    }
}

/// Retry only transient failures: rate limits, server errors, timeouts.
fn is_retryable(error: &stripe::StripeError) -> bool {
    match error {
        stripe::StripeError::Stripe(request_error) => {
            let status = request_error.http_status;
            status == 429 || (500..600).contains(&status)
        }
        stripe::StripeError::Timeout => true,
        _ => false,
    }
}

#[async_trait]
impl BillingProviderGateway for StripeSeatGateway {
    async fn get_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<ProviderSubscription> {
        let sub_id = Self::parse_subscription_id(subscription_id)?;

        let subscription = RetryIf::spawn(
            Self::retry_strategy(),
            || Subscription::retrieve(&self.client, &sub_id, &[]),
            is_retryable,
        )
        .await?;

        Ok(map_subscription(subscription))
    }

    async fn update_subscription_quantity(
        &self,
        update: SubscriptionQuantityUpdate,
    ) -> BillingResult<()> {
        let sub_id = Self::parse_subscription_id(&update.subscription_id)?;

        let item_id = match update.subscription_item_id.clone() {
            Some(id) => id,
            None => {
                // Older configurations predate the stored item id; resolve it
                // from the live subscription.
                let current = Subscription::retrieve(&self.client, &sub_id, &[]).await?;
                current
                    .items
                    .data
                    .first()
                    .map(|item| item.id.to_string())
                    .ok_or_else(|| {
                        BillingError::Internal("No subscription items found".to_string())
                    })?
            }
        };

        let params = UpdateSubscription {
            items: Some(vec![UpdateSubscriptionItems {
                id: Some(item_id),
                quantity: Some(update.membership_count),
                ..Default::default()
            }]),
            proration_behavior: Some(match update.proration_behavior {
                ProrationBehavior::None => SubscriptionProrationBehavior::None,
                ProrationBehavior::CreateProrations => {
                    SubscriptionProrationBehavior::CreateProrations
                }
                ProrationBehavior::AlwaysInvoice => SubscriptionProrationBehavior::AlwaysInvoice,
            }),
            ..Default::default()
        };

        RetryIf::spawn(
            Self::retry_strategy(),
            || Subscription::update(&self.client, &sub_id, params.clone()),
            is_retryable,
        )
        .await?;

        tracing::info!(
            subscription_id = %update.subscription_id,
            quantity = update.membership_count,
            proration_behavior = update.proration_behavior.as_str(),
            "Updated provider subscription quantity"
        );

        Ok(())
    }
}

fn map_subscription(subscription: Subscription) -> ProviderSubscription {
    let first_item = subscription.items.data.first();
    ProviderSubscription {
        id: subscription.id.to_string(),
        item_id: first_item.map(|item| item.id.to_string()),
        quantity: first_item.and_then(|item| item.quantity),
        current_period_start: OffsetDateTime::from_unix_timestamp(
            subscription.current_period_start,
        )
        .ok(),
    }
}
