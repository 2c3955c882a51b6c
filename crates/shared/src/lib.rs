//! Common types shared across Seatledger crates.

pub mod types;

pub use types::{BillingModel, BillingPeriod, EntityId, UserId};
