//! Billing error types

use thiserror::Error;

/// Result alias used throughout the billing crate.
pub type BillingResult<T> = Result<T, BillingError>;

/// Errors produced by the seat billing engine.
///
/// A missing billing configuration is deliberately NOT an error: lookups
/// return `Option` and callers treat `None` as "nothing to reconcile".
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("database error: {0}")]
    Database(String),

    #[error("stripe api error: {0}")]
    StripeApi(String),

    #[error("billing provider gateway is not configured")]
    GatewayNotConfigured,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid unix timestamp: {0}")]
    InvalidTimestamp(i64),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(err: stripe::StripeError) -> Self {
        Self::StripeApi(err.to_string())
    }
}

impl BillingError {
    /// Whether this error came from the billing provider side.
    ///
    /// Provider failures are caught at strategy boundaries and converted to
    /// degraded results; everything else may propagate to the caller.
    #[must_use]
    pub fn is_provider_failure(&self) -> bool {
        matches!(self, Self::StripeApi(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_failures_are_classified() {
        assert!(BillingError::StripeApi("rate limited".into()).is_provider_failure());
        assert!(!BillingError::Database("connection reset".into()).is_provider_failure());
        assert!(!BillingError::GatewayNotConfigured.is_provider_failure());
    }
}
