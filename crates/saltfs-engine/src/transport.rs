//! The injected remote capability.
//!
//! The engine is generic over this trait; mapping a concrete wire protocol
//! onto it is out of scope here. All methods speak ciphertext only; keys
//! never cross this boundary.
//!
//! Error mapping contract: unreachable server → `FsError::NotAvailable`,
//! bad token / missing entity → `FsError::Forbidden`, stale upload version →
//! `FsError::Concurrency`.

use saltfs_core::{EntityId, FsResult};
use uuid::Uuid;

#[allow(async_fn_in_trait)]
pub trait Transport {
    /// Register a new vlob holding `ciphertext` at version 1.
    /// Returns `(id, read_token, write_token)`.
    async fn vlob_create(&self, ciphertext: Vec<u8>) -> FsResult<(EntityId, Uuid, Uuid)>;

    /// Upload `version` of an existing vlob. `FsError::Concurrency` means
    /// the server already holds a version >= `version`.
    async fn vlob_update(
        &self,
        id: EntityId,
        write_token: Uuid,
        version: u32,
        ciphertext: Vec<u8>,
    ) -> FsResult<()>;

    /// Read a vlob at `version`, or its head when `None`.
    /// Returns `(version, ciphertext)`.
    async fn vlob_read(
        &self,
        id: EntityId,
        read_token: Uuid,
        version: Option<u32>,
    ) -> FsResult<(u32, Vec<u8>)>;

    /// Store one immutable content block.
    async fn block_create(&self, id: EntityId, ciphertext: Vec<u8>) -> FsResult<()>;

    /// Fetch one content block.
    async fn block_read(&self, id: EntityId) -> FsResult<Vec<u8>>;
}
