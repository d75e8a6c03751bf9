//! Manifests: the metadata of users, folders and files.
//!
//! Local manifests carry `base_version` (last version fetched from the
//! server) and `need_sync`; remote manifests carry `version` and are what
//! actually gets encrypted into a vlob. Children of a remote folder are
//! always vlob accesses; a placeholder must never leave the machine.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::access::{Access, BlockAccess, DirtyBlockAccess, EntityId, VlobAccess};
use crate::time::Timestamp;

/// Returned when converting a local folder holding placeholder children to
/// its remote form. The synchronizer strips such children instead.
#[derive(Debug, Error)]
#[error("placeholder child `{0}` cannot appear in a remote manifest")]
pub struct PlaceholderChild(pub String);

/// Name → access map of a folder-shaped manifest.
pub type Children = BTreeMap<String, Access>;

// ── File manifests ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalFileManifest {
    pub author: String,
    pub created: Timestamp,
    pub updated: Timestamp,
    pub base_version: u32,
    pub need_sync: bool,
    pub size: u64,
    /// Synced content: non-overlapping, sorted by offset, concatenation
    /// reproduces the file at `base_version`.
    pub blocks: Vec<BlockAccess>,
    /// Locally flushed overlays added since `base_version`. May overlap.
    pub dirty_blocks: Vec<DirtyBlockAccess>,
}

impl LocalFileManifest {
    /// Brand-new empty file (placeholder-side state).
    pub fn new(author: impl Into<String>, now: Timestamp) -> Self {
        Self {
            author: author.into(),
            created: now,
            updated: now,
            base_version: 0,
            need_sync: true,
            size: 0,
            blocks: Vec::new(),
            dirty_blocks: Vec::new(),
        }
    }

    /// Clip block references to a truncate point: references wholly past
    /// `cap` are dropped, straddling ones keep their visible prefix (the
    /// stored payload stays full-length; only the referenced window
    /// shrinks). Returns the ids of dropped dirty blocks so the caller can
    /// reclaim their store entries.
    pub fn clip_blocks(&mut self, cap: u64) -> Vec<EntityId> {
        self.blocks.retain_mut(|b| {
            if b.offset >= cap {
                return false;
            }
            b.size = b.size.min(cap - b.offset);
            true
        });
        let mut dropped = Vec::new();
        self.dirty_blocks.retain_mut(|d| {
            if d.offset >= cap {
                dropped.push(d.id);
                return false;
            }
            d.size = d.size.min(cap - d.offset);
            true
        });
        dropped
    }

    /// Remote form at upload time. Dirty blocks must already have been
    /// turned into proper blocks by the synchronizer.
    pub fn to_remote(&self, version: u32) -> RemoteFileManifest {
        RemoteFileManifest {
            author: self.author.clone(),
            created: self.created,
            updated: self.updated,
            version,
            size: self.size,
            blocks: self.blocks.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFileManifest {
    pub author: String,
    pub created: Timestamp,
    pub updated: Timestamp,
    pub version: u32,
    pub size: u64,
    pub blocks: Vec<BlockAccess>,
}

impl RemoteFileManifest {
    pub fn into_local(self) -> LocalFileManifest {
        LocalFileManifest {
            author: self.author,
            created: self.created,
            updated: self.updated,
            base_version: self.version,
            need_sync: false,
            size: self.size,
            blocks: self.blocks,
            dirty_blocks: Vec::new(),
        }
    }
}

// ── Folder manifests ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalFolderManifest {
    pub author: String,
    pub created: Timestamp,
    pub updated: Timestamp,
    pub base_version: u32,
    pub need_sync: bool,
    /// Name → access. Names are byte-compared and unique within the folder.
    pub children: Children,
}

impl LocalFolderManifest {
    pub fn new(author: impl Into<String>, now: Timestamp) -> Self {
        Self {
            author: author.into(),
            created: now,
            updated: now,
            base_version: 0,
            need_sync: true,
            children: BTreeMap::new(),
        }
    }

    /// Strict remote form: fails on the first placeholder child.
    pub fn to_remote(&self, version: u32) -> Result<RemoteFolderManifest, PlaceholderChild> {
        let mut children = BTreeMap::new();
        for (name, access) in &self.children {
            match access.as_vlob() {
                Some(v) => {
                    children.insert(name.clone(), v.clone());
                }
                None => return Err(PlaceholderChild(name.clone())),
            }
        }
        Ok(RemoteFolderManifest {
            author: self.author.clone(),
            created: self.created,
            updated: self.updated,
            version,
            children,
        })
    }

    /// Remote form with still-placeholder children stripped (they get their
    /// own sync pass first). Returns the manifest and whether anything was
    /// stripped.
    pub fn to_remote_stripped(&self, version: u32) -> (RemoteFolderManifest, bool) {
        let mut children = BTreeMap::new();
        let mut stripped = false;
        for (name, access) in &self.children {
            match access.as_vlob() {
                Some(v) => {
                    children.insert(name.clone(), v.clone());
                }
                None => stripped = true,
            }
        }
        (
            RemoteFolderManifest {
                author: self.author.clone(),
                created: self.created,
                updated: self.updated,
                version,
                children,
            },
            stripped,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFolderManifest {
    pub author: String,
    pub created: Timestamp,
    pub updated: Timestamp,
    pub version: u32,
    pub children: BTreeMap<String, VlobAccess>,
}

impl RemoteFolderManifest {
    pub fn into_local(self) -> LocalFolderManifest {
        LocalFolderManifest {
            author: self.author,
            created: self.created,
            updated: self.updated,
            base_version: self.version,
            need_sync: false,
            children: self
                .children
                .into_iter()
                .map(|(name, v)| (name, Access::Vlob(v)))
                .collect(),
        }
    }
}

// ── User (root) manifest ─────────────────────────────────────────────────────

/// The root of a user's tree. Folder shape plus the message cursor; there is
/// exactly one per user and it has no containing parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalUserManifest {
    #[serde(flatten)]
    pub folder: LocalFolderManifest,
    pub last_processed_message: u64,
}

impl LocalUserManifest {
    pub fn new(author: impl Into<String>, now: Timestamp) -> Self {
        Self {
            folder: LocalFolderManifest::new(author, now),
            last_processed_message: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteUserManifest {
    #[serde(flatten)]
    pub folder: RemoteFolderManifest,
    pub last_processed_message: u64,
}

impl RemoteUserManifest {
    pub fn into_local(self) -> LocalUserManifest {
        LocalUserManifest {
            folder: self.folder.into_local(),
            last_processed_message: self.last_processed_message,
        }
    }
}

// ── Enum wrappers ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LocalManifest {
    File(LocalFileManifest),
    Folder(LocalFolderManifest),
    User(LocalUserManifest),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RemoteManifest {
    File(RemoteFileManifest),
    Folder(RemoteFolderManifest),
    User(RemoteUserManifest),
}

impl LocalManifest {
    pub fn base_version(&self) -> u32 {
        match self {
            LocalManifest::File(m) => m.base_version,
            LocalManifest::Folder(m) => m.base_version,
            LocalManifest::User(m) => m.folder.base_version,
        }
    }

    pub fn set_base_version(&mut self, version: u32) {
        match self {
            LocalManifest::File(m) => m.base_version = version,
            LocalManifest::Folder(m) => m.base_version = version,
            LocalManifest::User(m) => m.folder.base_version = version,
        }
    }

    pub fn need_sync(&self) -> bool {
        match self {
            LocalManifest::File(m) => m.need_sync,
            LocalManifest::Folder(m) => m.need_sync,
            LocalManifest::User(m) => m.folder.need_sync,
        }
    }

    pub fn set_need_sync(&mut self, value: bool) {
        match self {
            LocalManifest::File(m) => m.need_sync = value,
            LocalManifest::Folder(m) => m.need_sync = value,
            LocalManifest::User(m) => m.folder.need_sync = value,
        }
    }

    pub fn updated(&self) -> Timestamp {
        match self {
            LocalManifest::File(m) => m.updated,
            LocalManifest::Folder(m) => m.updated,
            LocalManifest::User(m) => m.folder.updated,
        }
    }

    pub fn set_updated(&mut self, now: Timestamp) {
        match self {
            LocalManifest::File(m) => m.updated = now,
            LocalManifest::Folder(m) => m.updated = now,
            LocalManifest::User(m) => m.folder.updated = now,
        }
    }

    pub fn is_file(&self) -> bool {
        matches!(self, LocalManifest::File(_))
    }

    /// Children map for folder-shaped manifests (folder and user).
    pub fn children(&self) -> Option<&Children> {
        match self {
            LocalManifest::File(_) => None,
            LocalManifest::Folder(m) => Some(&m.children),
            LocalManifest::User(m) => Some(&m.folder.children),
        }
    }

    pub fn children_mut(&mut self) -> Option<&mut Children> {
        match self {
            LocalManifest::File(_) => None,
            LocalManifest::Folder(m) => Some(&mut m.children),
            LocalManifest::User(m) => Some(&mut m.folder.children),
        }
    }

    pub fn as_file(&self) -> Option<&LocalFileManifest> {
        match self {
            LocalManifest::File(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_file_mut(&mut self) -> Option<&mut LocalFileManifest> {
        match self {
            LocalManifest::File(m) => Some(m),
            _ => None,
        }
    }

    /// Folder view of a folder-shaped manifest (user root included).
    pub fn folder_view(&self) -> Option<&LocalFolderManifest> {
        match self {
            LocalManifest::File(_) => None,
            LocalManifest::Folder(m) => Some(m),
            LocalManifest::User(m) => Some(&m.folder),
        }
    }
}

impl RemoteManifest {
    pub fn version(&self) -> u32 {
        match self {
            RemoteManifest::File(m) => m.version,
            RemoteManifest::Folder(m) => m.version,
            RemoteManifest::User(m) => m.folder.version,
        }
    }

    pub fn into_local(self) -> LocalManifest {
        match self {
            RemoteManifest::File(m) => LocalManifest::File(m.into_local()),
            RemoteManifest::Folder(m) => LocalManifest::Folder(m.into_local()),
            RemoteManifest::User(m) => LocalManifest::User(m.into_local()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use saltfs_crypto::SecretKey;
    use uuid::Uuid;

    fn vlob() -> VlobAccess {
        VlobAccess {
            id: Uuid::new_v4(),
            key: SecretKey::generate(),
            read_token: Uuid::new_v4(),
            write_token: Uuid::new_v4(),
        }
    }

    #[test]
    fn new_file_is_dirty_placeholder_state() {
        let m = LocalFileManifest::new("alice@laptop", 1000);
        assert_eq!(m.base_version, 0);
        assert!(m.need_sync);
        assert_eq!(m.size, 0);
        assert!(m.blocks.is_empty());
    }

    #[test]
    fn file_remote_roundtrip_identity_modulo_versioning() {
        let mut local = LocalFileManifest::new("alice@laptop", 1000);
        local.size = 42;
        local.blocks.push(BlockAccess {
            id: Uuid::new_v4(),
            key: SecretKey::generate(),
            offset: 0,
            size: 42,
            digest: Some("d".repeat(64)),
        });
        local.need_sync = true;

        let remote = local.to_remote(7);
        let back = remote.into_local();

        assert_eq!(back.author, local.author);
        assert_eq!(back.created, local.created);
        assert_eq!(back.updated, local.updated);
        assert_eq!(back.size, local.size);
        assert_eq!(back.blocks, local.blocks);
        // Rebased fields
        assert_eq!(back.base_version, 7);
        assert!(!back.need_sync);
        assert!(back.dirty_blocks.is_empty());
    }

    #[test]
    fn clip_blocks_trims_to_the_cap() {
        let mut m = LocalFileManifest::new("alice@laptop", 1000);
        m.size = 12;
        m.blocks.push(BlockAccess {
            id: Uuid::new_v4(),
            key: SecretKey::generate(),
            offset: 0,
            size: 6,
            digest: None,
        });
        m.blocks.push(BlockAccess {
            id: Uuid::new_v4(),
            key: SecretKey::generate(),
            offset: 6,
            size: 6,
            digest: None,
        });
        let past = DirtyBlockAccess::new(8, 4);
        m.dirty_blocks.push(DirtyBlockAccess::new(2, 4));
        m.dirty_blocks.push(past.clone());

        let dropped = m.clip_blocks(4);
        assert_eq!(dropped, vec![past.id]);
        // First block keeps its [0,4) prefix, the second is gone
        assert_eq!(m.blocks.len(), 1);
        assert_eq!((m.blocks[0].offset, m.blocks[0].size), (0, 4));
        // Straddling dirty block shrinks to [2,4)
        assert_eq!(m.dirty_blocks.len(), 1);
        assert_eq!((m.dirty_blocks[0].offset, m.dirty_blocks[0].size), (2, 2));
    }

    #[test]
    fn folder_roundtrip_on_vlob_only_children() {
        let mut local = LocalFolderManifest::new("alice@laptop", 1000);
        local.children.insert("a".into(), Access::Vlob(vlob()));
        local.children.insert("b".into(), Access::Vlob(vlob()));

        let remote = local.to_remote(3).unwrap();
        let back = remote.into_local();

        assert_eq!(back.children, local.children);
        assert_eq!(back.base_version, 3);
        assert!(!back.need_sync);
    }

    #[test]
    fn folder_to_remote_rejects_placeholder_children() {
        let mut local = LocalFolderManifest::new("alice@laptop", 1000);
        local
            .children
            .insert("draft".into(), Access::new_placeholder());

        let err = local.to_remote(1).unwrap_err();
        assert!(err.to_string().contains("draft"));

        let (stripped, any) = local.to_remote_stripped(1);
        assert!(any);
        assert!(stripped.children.is_empty());
    }

    #[test]
    fn user_manifest_carries_message_cursor() {
        let mut user = LocalUserManifest::new("alice@laptop", 1000);
        user.last_processed_message = 12;
        user.folder.children.insert("w".into(), Access::Vlob(vlob()));

        let json = serde_json::to_string(&LocalManifest::User(user.clone())).unwrap();
        let back: LocalManifest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, LocalManifest::User(user));
    }

    #[test]
    fn enum_serde_tags() {
        let m = LocalManifest::File(LocalFileManifest::new("a@b", 0));
        let json = serde_json::to_string(&m).unwrap();
        assert!(json.contains("\"type\":\"file\""));
    }
}
