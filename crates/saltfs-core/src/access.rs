//! Access descriptors: the opaque handles identifying remote-storable
//! entities (manifests) and content blocks.
//!
//! An access starts life as a [`Access::Placeholder`] (local id + key, no
//! server identity) and is promoted to [`Access::Vlob`] exactly once, on the
//! first successful server registration. After promotion the id and tokens
//! never change.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use saltfs_crypto::SecretKey;

pub type EntityId = Uuid;

/// Server-registered access: id and tokens are immutable, the key is the
/// symmetric secret the vlob ciphertext is sealed with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VlobAccess {
    pub id: EntityId,
    pub key: SecretKey,
    pub read_token: Uuid,
    pub write_token: Uuid,
}

/// An opaque descriptor identifying a stored manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Access {
    /// Exists only locally; no server identity yet.
    Placeholder { id: EntityId, key: SecretKey },
    /// Registered on the server.
    Vlob(VlobAccess),
}

impl Access {
    /// Allocate a fresh placeholder with a random id and key.
    pub fn new_placeholder() -> Self {
        Access::Placeholder {
            id: saltfs_crypto::fresh_id(),
            key: SecretKey::generate(),
        }
    }

    pub fn id(&self) -> EntityId {
        match self {
            Access::Placeholder { id, .. } => *id,
            Access::Vlob(v) => v.id,
        }
    }

    pub fn key(&self) -> &SecretKey {
        match self {
            Access::Placeholder { key, .. } => key,
            Access::Vlob(v) => &v.key,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self, Access::Placeholder { .. })
    }

    /// The vlob view of this access, if promoted.
    pub fn as_vlob(&self) -> Option<&VlobAccess> {
        match self {
            Access::Placeholder { .. } => None,
            Access::Vlob(v) => Some(v),
        }
    }
}

impl From<VlobAccess> for Access {
    fn from(v: VlobAccess) -> Self {
        Access::Vlob(v)
    }
}

/// One immutable encrypted content block on the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockAccess {
    pub id: EntityId,
    pub key: SecretKey,
    /// Offset of this block's plaintext within the file.
    pub offset: u64,
    /// Plaintext size in bytes.
    pub size: u64,
    /// BLAKE3 hex digest of the plaintext, verified on fetch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

impl BlockAccess {
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// A locally persisted, not-yet-uploaded chunk of file content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirtyBlockAccess {
    pub id: EntityId,
    pub key: SecretKey,
    pub offset: u64,
    pub size: u64,
}

impl DirtyBlockAccess {
    pub fn new(offset: u64, size: u64) -> Self {
        Self {
            id: saltfs_crypto::fresh_id(),
            key: SecretKey::generate(),
            offset,
            size,
        }
    }

    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}
