//! Common types used across Seatledger

use serde::{Deserialize, Serialize};

// =============================================================================
// ID Wrappers
// =============================================================================

/// Billable entity ID wrapper (a team or an organization; never both)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub i64);

impl From<i64> for EntityId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// User ID wrapper
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl From<i64> for UserId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Billing model / period
// =============================================================================

/// How an entity's subscription is billed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BillingModel {
    /// Charged per seat on the roster.
    Seats,
    /// Charged per active user via usage metering.
    ActiveUsers,
}

impl BillingModel {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Seats => "SEATS",
            Self::ActiveUsers => "ACTIVE_USERS",
        }
    }

    /// Parse from the stored string form. Unknown values map to `None`.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "SEATS" => Some(Self::Seats),
            "ACTIVE_USERS" => Some(Self::ActiveUsers),
            _ => None,
        }
    }
}

impl std::fmt::Display for BillingModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Recurrence of the external subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BillingPeriod {
    Monthly,
    Annually,
}

impl BillingPeriod {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Monthly => "MONTHLY",
            Self::Annually => "ANNUALLY",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "MONTHLY" => Some(Self::Monthly),
            "ANNUALLY" => Some(Self::Annually),
            _ => None,
        }
    }
}

impl std::fmt::Display for BillingPeriod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn billing_model_round_trips_through_strings() {
        for model in [BillingModel::Seats, BillingModel::ActiveUsers] {
            assert_eq!(BillingModel::parse(model.as_str()), Some(model));
        }
        assert_eq!(BillingModel::parse("TIERED"), None);
    }

    #[test]
    fn billing_period_round_trips_through_strings() {
        for period in [BillingPeriod::Monthly, BillingPeriod::Annually] {
            assert_eq!(BillingPeriod::parse(period.as_str()), Some(period));
        }
        assert_eq!(BillingPeriod::parse("WEEKLY"), None);
    }

    #[test]
    fn entity_id_displays_raw_value() {
        assert_eq!(EntityId(42).to_string(), "42");
        assert_eq!(UserId(7).to_string(), "7");
    }
}
