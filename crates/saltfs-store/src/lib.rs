//! saltfs-store: local persistence for encrypted manifests and blocks.
//!
//! An engine owns two [`Store`] instances rooted in its workdir:
//!
//!   - **dirty**: must-not-lose data (unsynced manifests, flushed-but-not-
//!     uploaded blocks). Never evicts.
//!   - **clean**: a re-fetchable cache of server state. Block entries are
//!     LRU-evicted once the count exceeds `max_cache_size / block_size`.
//!
//! Layout per store: `{root}/index.json` (manifest ciphertext + block
//! metadata, flushed atomically via temp+rename) and `{root}/blocks/{id}`
//! (sealed block bytes). A crash may leave an orphan block file with no
//! index entry; orphans are reclaimed on the next open sweep. The reverse
//! case, an index entry pointing at a missing file, is reported as
//! corruption.
//!
//! Single-writer discipline: two engines must never open the same root.

mod store;

pub use store::{BlockMeta, Store};

use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The entry is simply not there. Always distinguishable from
    /// corruption: a failed decrypt never turns into `Missing`.
    #[error("entry not found in store")]
    Missing,

    #[error("corrupted store entry: {0}")]
    Corrupt(String),

    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
