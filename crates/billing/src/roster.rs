//! Roster/membership store seam.

use async_trait::async_trait;

use seatledger_shared::EntityId;

use crate::error::BillingResult;

/// Read-only view of the membership roster.
///
/// The roster is owned by the surrounding product; this engine only reads
/// counts and the team-to-organization ownership edge.
#[async_trait]
pub trait RosterStore: Send + Sync {
    /// Current accepted member count for an entity.
    ///
    /// `None` means the entity is unknown, which is distinct from an empty
    /// roster of zero members.
    async fn member_count(&self, entity_id: EntityId) -> BillingResult<Option<i64>>;

    /// The parent organization a team's seats roll up to, if any.
    async fn parent_organization(&self, entity_id: EntityId)
        -> BillingResult<Option<EntityId>>;
}
