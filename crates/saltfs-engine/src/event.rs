//! Events emitted by the synchronizer. Front-ends subscribe to surface
//! conflict renames and to remap handles held on placeholder accesses.

use saltfs_core::EntityId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// A placeholder was registered on the server; readers holding the old
    /// access id should switch to the resolved one.
    PlaceholderResolved {
        placeholder: EntityId,
        resolved: EntityId,
    },
    /// A concurrent change lost a same-name merge and was kept under a new
    /// name next to the winner.
    ConflictRenamed {
        entry: EntityId,
        original_name: String,
        renamed_to: String,
    },
}
