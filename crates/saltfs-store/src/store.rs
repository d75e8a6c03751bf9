use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use saltfs_core::EntityId;
use saltfs_crypto::SecretKey;

use crate::{StoreError, StoreResult};

/// Metadata for one stored block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockMeta {
    /// Plaintext size in bytes (the on-disk file is compressed + sealed).
    pub size: u64,
    /// Logical access clock; higher means more recently read or written.
    pub accessed_on: u64,
    /// Block file path, relative to the store root.
    pub file_path: PathBuf,
}

/// On-disk index: manifest ciphertext (base64) plus block metadata.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Index {
    manifests: HashMap<Uuid, String>,
    blocks: HashMap<Uuid, BlockMeta>,
    /// Monotonic counter backing `accessed_on`.
    clock: u64,
}

/// One logical store (clean or dirty).
///
/// The index is loaded whole on open and flushed atomically (temp+rename).
/// Pending index changes are flushed on [`Store::flush`] and on drop.
pub struct Store {
    root: PathBuf,
    index: Index,
    dirty: bool,
    /// Block-count bound; `None` means never evict (the dirty store).
    evict_limit: Option<u64>,
}

impl Store {
    /// Open or create a store rooted at `root`. Orphan block files (present
    /// on disk but absent from the index, e.g. after a crash mid-write) are
    /// swept away.
    pub fn open(root: &Path, evict_limit: Option<u64>) -> StoreResult<Self> {
        std::fs::create_dir_all(root.join("blocks"))?;

        let index_path = root.join("index.json");
        let index = if index_path.exists() {
            let content = std::fs::read_to_string(&index_path)?;
            serde_json::from_str(&content)
                .map_err(|e| StoreError::Corrupt(format!("store index: {e}")))?
        } else {
            Index::default()
        };

        let mut store = Store {
            root: root.to_path_buf(),
            index,
            dirty: false,
            evict_limit,
        };
        store.sweep_orphans()?;
        Ok(store)
    }

    // ── Manifests ────────────────────────────────────────────────────────────

    /// Fetch and decrypt a manifest blob.
    pub fn get_manifest(&self, id: EntityId, key: &SecretKey) -> StoreResult<Vec<u8>> {
        let b64 = self.index.manifests.get(&id).ok_or(StoreError::Missing)?;
        let ciphertext = decode_b64(b64)?;
        saltfs_crypto::decrypt(key, &ciphertext)
            .map_err(|e| StoreError::Corrupt(format!("manifest {id}: {e}")))
    }

    /// Encrypt and store a manifest blob.
    pub fn set_manifest(&mut self, id: EntityId, key: &SecretKey, plaintext: &[u8]) -> StoreResult<()> {
        let ciphertext = saltfs_crypto::encrypt(key, plaintext)?;
        self.index.manifests.insert(id, encode_b64(&ciphertext));
        self.dirty = true;
        self.flush()
    }

    pub fn clear_manifest(&mut self, id: EntityId) -> StoreResult<()> {
        if self.index.manifests.remove(&id).is_none() {
            return Err(StoreError::Missing);
        }
        self.dirty = true;
        self.flush()
    }

    pub fn has_manifest(&self, id: EntityId) -> bool {
        self.index.manifests.contains_key(&id)
    }

    // ── Blocks ───────────────────────────────────────────────────────────────

    /// Fetch, unseal and return a block's plaintext. Bumps `accessed_on`.
    pub fn get_block(&mut self, id: EntityId, key: &SecretKey) -> StoreResult<Vec<u8>> {
        let meta = self.index.blocks.get(&id).ok_or(StoreError::Missing)?;
        let path = self.root.join(&meta.file_path);
        let sealed = std::fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                // Index points at a missing file: broken commit, not a miss.
                StoreError::Corrupt(format!("block {id}: file vanished"))
            } else {
                StoreError::Io(e)
            }
        })?;
        let plaintext = saltfs_crypto::open_block(key, &sealed)
            .map_err(|e| StoreError::Corrupt(format!("block {id}: {e}")))?;

        self.index.clock += 1;
        let clock = self.index.clock;
        if let Some(meta) = self.index.blocks.get_mut(&id) {
            meta.accessed_on = clock;
        }
        self.dirty = true;
        Ok(plaintext)
    }

    /// Seal and store a block, then evict LRU clean blocks past the limit.
    ///
    /// The block file lands on disk before the index entry is committed, so
    /// a crash in between leaves only a reclaimable orphan file.
    pub fn set_block(&mut self, id: EntityId, key: &SecretKey, plaintext: &[u8]) -> StoreResult<()> {
        let rel = PathBuf::from("blocks").join(id.to_string());
        let path = self.root.join(&rel);
        let sealed = saltfs_crypto::seal_block(key, plaintext)?;

        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, &sealed)?;
        std::fs::rename(&tmp, &path)?;

        self.index.clock += 1;
        self.index.blocks.insert(
            id,
            BlockMeta {
                size: plaintext.len() as u64,
                accessed_on: self.index.clock,
                file_path: rel,
            },
        );
        self.dirty = true;
        self.evict_if_needed();
        self.flush()
    }

    pub fn clear_block(&mut self, id: EntityId) -> StoreResult<()> {
        let meta = self.index.blocks.remove(&id).ok_or(StoreError::Missing)?;
        let _ = std::fs::remove_file(self.root.join(&meta.file_path));
        self.dirty = true;
        self.flush()
    }

    pub fn has_block(&self, id: EntityId) -> bool {
        self.index.blocks.contains_key(&id)
    }

    pub fn block_count(&self) -> u64 {
        self.index.blocks.len() as u64
    }

    /// Sum of the plaintext `size` column over all blocks.
    pub fn cache_size(&self) -> u64 {
        self.index.blocks.values().map(|m| m.size).sum()
    }

    // ── Maintenance ──────────────────────────────────────────────────────────

    /// Evict least-recently-accessed blocks until `count <= limit`.
    fn evict_if_needed(&mut self) {
        let Some(limit) = self.evict_limit else {
            return;
        };
        if self.block_count() <= limit {
            return;
        }

        let mut by_age: Vec<(Uuid, u64)> = self
            .index
            .blocks
            .iter()
            .map(|(id, meta)| (*id, meta.accessed_on))
            .collect();
        by_age.sort_by_key(|(_, accessed_on)| *accessed_on);

        for (id, _) in by_age {
            if self.block_count() <= limit {
                break;
            }
            if let Some(meta) = self.index.blocks.remove(&id) {
                let _ = std::fs::remove_file(self.root.join(&meta.file_path));
                debug!(block = %id, "evicted clean block (LRU)");
            }
        }
    }

    /// Delete block files with no index entry.
    fn sweep_orphans(&mut self) -> StoreResult<()> {
        let blocks_dir = self.root.join("blocks");
        for entry in std::fs::read_dir(&blocks_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let known = name
                .parse::<Uuid>()
                .map(|id| self.index.blocks.contains_key(&id))
                .unwrap_or(false);
            if !known {
                debug!(file = %name, "sweeping orphan block file");
                let _ = std::fs::remove_file(entry.path());
            }
        }
        Ok(())
    }

    /// Flush pending index changes atomically (write temp, then rename).
    pub fn flush(&mut self) -> StoreResult<()> {
        if !self.dirty {
            return Ok(());
        }
        let json = serde_json::to_string(&self.index)
            .map_err(|e| StoreError::Corrupt(format!("serializing index: {e}")))?;
        let path = self.root.join("index.json");
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, &json)?;
        std::fs::rename(&tmp, &path)?;
        self.dirty = false;
        Ok(())
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if self.dirty {
            if let Err(e) = self.flush() {
                warn!("failed to flush store index on drop: {e}");
            }
        }
    }
}

fn encode_b64(data: &[u8]) -> String {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    STANDARD.encode(data)
}

fn decode_b64(s: &str) -> StoreResult<Vec<u8>> {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    STANDARD
        .decode(s)
        .map_err(|e| StoreError::Corrupt(format!("base64 index column: {e}")))
}
