//! Plumbing between the manifest cache, the two persistent stores and the
//! remote transport: (de)serialization, encryption at the store and wire
//! boundaries, and placeholder promotion bookkeeping.

use tracing::{debug, warn};

use saltfs_core::{
    Access, BlockAccess, DirtyBlockAccess, EntityId, FsError, FsResult, LocalManifest,
    RemoteManifest, VlobAccess,
};
use saltfs_crypto::SecretKey;
use saltfs_store::StoreError;

use crate::engine::FsEngine;
use crate::event::EngineEvent;
use crate::transport::Transport;

/// Store failures seen by callers that already ruled `Missing` out.
pub(crate) fn store_err(e: StoreError) -> FsError {
    match e {
        StoreError::Missing => FsError::Corrupt("store entry vanished".into()),
        StoreError::Corrupt(msg) => FsError::Corrupt(msg),
        StoreError::Io(e) => FsError::NotAvailable(format!("local store i/o: {e}")),
        StoreError::Other(e) => FsError::Other(e),
    }
}

/// Run `op`, retrying once when it fails with `NotAvailable`. A transient
/// store hiccup gets one second chance before surfacing.
pub(crate) fn retry_once<T>(mut op: impl FnMut() -> FsResult<T>) -> FsResult<T> {
    match op() {
        Err(FsError::NotAvailable(msg)) => {
            warn!(%msg, "transient failure, retrying once");
            op()
        }
        other => other,
    }
}

impl<T: Transport> FsEngine<T> {
    // ── Manifests ────────────────────────────────────────────────────────────

    /// Local lookup only: dirty store first (it holds the newer state when
    /// both have a copy), then clean.
    pub(crate) fn load_local_manifest(&self, access: &Access) -> FsResult<Option<LocalManifest>> {
        let id = self.tree.resolve(access.id());
        let key = access.key();
        for store in [&self.dirty, &self.clean] {
            match store.get_manifest(id, key) {
                Ok(bytes) => {
                    let manifest = serde_json::from_slice(&bytes)
                        .map_err(|e| FsError::Corrupt(format!("manifest {id}: {e}")))?;
                    return Ok(Some(manifest));
                }
                Err(StoreError::Missing) => continue,
                Err(e) => return Err(store_err(e)),
            }
        }
        Ok(None)
    }

    /// Cache, then local stores, then the backend. A placeholder with no
    /// local state is corruption: it cannot exist anywhere else.
    pub(crate) async fn get_manifest(&mut self, access: &Access) -> FsResult<LocalManifest> {
        let id = self.tree.resolve(access.id());
        if let Some(manifest) = self.tree.get(id) {
            return Ok(manifest.clone());
        }
        if let Some(manifest) = self.load_local_manifest(access)? {
            self.tree.insert(id, manifest.clone());
            return Ok(manifest);
        }
        match access.as_vlob() {
            Some(vlob) => {
                let (_, remote) = self.fetch_manifest_from_backend(vlob, None).await?;
                let local = remote.into_local();
                self.commit_entry(id, access.key(), &local)?;
                self.tree.insert(id, local.clone());
                Ok(local)
            }
            None => Err(FsError::Corrupt(format!(
                "placeholder {id} has no local manifest"
            ))),
        }
    }

    pub(crate) async fn fetch_manifest_from_backend(
        &self,
        vlob: &VlobAccess,
        version: Option<u32>,
    ) -> FsResult<(u32, RemoteManifest)> {
        let (version, ciphertext) = self
            .transport
            .vlob_read(vlob.id, vlob.read_token, version)
            .await?;
        let bytes = saltfs_crypto::decrypt(&vlob.key, &ciphertext)
            .map_err(|e| FsError::Corrupt(format!("vlob {}: {e}", vlob.id)))?;
        let remote = serde_json::from_slice(&bytes)
            .map_err(|e| FsError::Corrupt(format!("vlob {}: {e}", vlob.id)))?;
        Ok((version, remote))
    }

    /// Write a manifest to the store matching its sync state: dirty when
    /// `need_sync`, clean otherwise. The other store's copy is dropped so a
    /// reopened engine never resurrects stale state.
    pub(crate) fn commit_entry(
        &mut self,
        id: EntityId,
        key: &SecretKey,
        manifest: &LocalManifest,
    ) -> FsResult<()> {
        let bytes = serde_json::to_vec(manifest)
            .map_err(|e| FsError::Corrupt(format!("serializing manifest {id}: {e}")))?;
        let (target, other) = if manifest.need_sync() {
            (&mut self.dirty, &mut self.clean)
        } else {
            (&mut self.clean, &mut self.dirty)
        };
        target.set_manifest(id, key, &bytes).map_err(store_err)?;
        if other.has_manifest(id) {
            other.clear_manifest(id).map_err(store_err)?;
        }
        Ok(())
    }

    pub(crate) fn seal_remote_manifest(
        &self,
        key: &SecretKey,
        remote: &RemoteManifest,
    ) -> FsResult<Vec<u8>> {
        let bytes = serde_json::to_vec(remote)
            .map_err(|e| FsError::Corrupt(format!("serializing remote manifest: {e}")))?;
        Ok(saltfs_crypto::encrypt(key, &bytes)?)
    }

    // ── Blocks ───────────────────────────────────────────────────────────────

    /// A dirty block referenced by a manifest must be in the dirty store;
    /// it is never evicted, so absence is corruption.
    pub(crate) fn get_dirty_block(&mut self, access: &DirtyBlockAccess) -> FsResult<Vec<u8>> {
        self.dirty.get_block(access.id, &access.key).map_err(|e| match e {
            StoreError::Missing => FsError::Corrupt(format!("dirty block {} missing", access.id)),
            e => store_err(e),
        })
    }

    /// Clean cache first, then the backend (verifying the digest when the
    /// access carries one) and re-cache.
    pub(crate) async fn fetch_block(&mut self, access: &BlockAccess) -> FsResult<Vec<u8>> {
        match self.clean.get_block(access.id, &access.key) {
            Ok(data) => return Ok(data),
            Err(StoreError::Missing) => {}
            Err(e) => return Err(store_err(e)),
        }
        let sealed = self.transport.block_read(access.id).await?;
        let data = saltfs_crypto::open_block(&access.key, &sealed)
            .map_err(|e| FsError::Corrupt(format!("block {}: {e}", access.id)))?;
        if let Some(expected) = &access.digest {
            let actual = saltfs_crypto::digest(&data);
            if actual != *expected {
                return Err(FsError::Corrupt(format!(
                    "block {}: digest mismatch",
                    access.id
                )));
            }
        }
        self.clean
            .set_block(access.id, &access.key, &data)
            .map_err(store_err)?;
        debug!(block = %access.id, size = data.len(), "fetched and cached block");
        Ok(data)
    }

    /// Seal `data` under a fresh id and key and push it to the backend.
    pub(crate) async fn upload_block(&self, offset: u64, data: &[u8]) -> FsResult<BlockAccess> {
        let access = BlockAccess {
            id: saltfs_crypto::fresh_id(),
            key: SecretKey::generate(),
            offset,
            size: data.len() as u64,
            digest: Some(saltfs_crypto::digest(data)),
        };
        let sealed = saltfs_crypto::seal_block(&access.key, data)?;
        self.transport.block_create(access.id, sealed).await?;
        Ok(access)
    }

    // ── Placeholder promotion ────────────────────────────────────────────────

    /// Re-key every per-entry structure from the placeholder id to the
    /// server-assigned one. The caller re-commits the manifest under the new
    /// id afterwards.
    pub(crate) fn promote(&mut self, placeholder: EntityId, vlob: VlobAccess) -> Access {
        let resolved = vlob.id;
        if let Some(file) = self.files.remove(&placeholder) {
            self.files.insert(resolved, file);
        }
        self.tree.record_promotion(placeholder, resolved);
        if self.dirty.has_manifest(placeholder) {
            let _ = self.dirty.clear_manifest(placeholder);
        }
        if self.clean.has_manifest(placeholder) {
            let _ = self.clean.clear_manifest(placeholder);
        }
        if self.root_access.id() == placeholder {
            self.root_access = Access::Vlob(vlob.clone());
        }
        debug!(placeholder = %placeholder, vlob = %resolved, "placeholder promoted");
        self.emit(EngineEvent::PlaceholderResolved {
            placeholder,
            resolved,
        });
        Access::Vlob(vlob)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_once_gives_not_available_a_second_chance() {
        let mut calls = 0;
        let result: FsResult<u32> = retry_once(|| {
            calls += 1;
            if calls == 1 {
                Err(FsError::NotAvailable("busy".into()))
            } else {
                Ok(7)
            }
        });
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls, 2);
    }

    #[test]
    fn retry_once_surfaces_persistent_unavailability() {
        let mut calls = 0;
        let result: FsResult<()> = retry_once(|| {
            calls += 1;
            Err(FsError::NotAvailable("still down".into()))
        });
        assert!(matches!(result, Err(FsError::NotAvailable(_))));
        assert_eq!(calls, 2);
    }

    #[test]
    fn retry_once_passes_other_errors_through() {
        let mut calls = 0;
        let result: FsResult<()> = retry_once(|| {
            calls += 1;
            Err(FsError::Corrupt("bad".into()))
        });
        assert!(matches!(result, Err(FsError::Corrupt(_))));
        assert_eq!(calls, 1);
    }
}
