//! In-memory vlob/block server with monotonic version enforcement.
//!
//! Backs the test suites and offline demos. Shared via `Arc<Mutex<..>>` so
//! several engines (several simulated devices) can hit the same server, the
//! way the multi-machine scenarios exercise sync.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;
use uuid::Uuid;

use saltfs_core::{EntityId, FsError, FsResult};

use crate::transport::Transport;

#[derive(Debug, Default)]
struct ServerState {
    /// id → (read_token, write_token, versions[0] = version 1 ciphertext)
    vlobs: HashMap<EntityId, (Uuid, Uuid, Vec<Vec<u8>>)>,
    blocks: HashMap<EntityId, Vec<u8>>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    state: Arc<Mutex<ServerState>>,
    offline: Arc<AtomicBool>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with `NotAvailable` until switched back.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> FsResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(FsError::NotAvailable("server offline".into()));
        }
        Ok(())
    }

    /// Current head version of a vlob (test observability).
    pub fn vlob_version(&self, id: EntityId) -> Option<u32> {
        let state = self.state.lock().unwrap();
        state.vlobs.get(&id).map(|(_, _, versions)| versions.len() as u32)
    }

    pub fn block_count(&self) -> usize {
        self.state.lock().unwrap().blocks.len()
    }
}

impl Transport for MemoryTransport {
    async fn vlob_create(&self, ciphertext: Vec<u8>) -> FsResult<(EntityId, Uuid, Uuid)> {
        self.check_online()?;
        let id = saltfs_crypto::fresh_id();
        let read_token = Uuid::new_v4();
        let write_token = Uuid::new_v4();
        let mut state = self.state.lock().unwrap();
        state
            .vlobs
            .insert(id, (read_token, write_token, vec![ciphertext]));
        debug!(vlob = %id, "vlob created");
        Ok((id, read_token, write_token))
    }

    async fn vlob_update(
        &self,
        id: EntityId,
        write_token: Uuid,
        version: u32,
        ciphertext: Vec<u8>,
    ) -> FsResult<()> {
        self.check_online()?;
        let mut state = self.state.lock().unwrap();
        let (_, expected_token, versions) = state
            .vlobs
            .get_mut(&id)
            .ok_or_else(|| FsError::Forbidden(format!("unknown vlob {id}")))?;
        if write_token != *expected_token {
            return Err(FsError::Forbidden(format!("bad write token for {id}")));
        }
        if version != versions.len() as u32 + 1 {
            debug!(vlob = %id, head = versions.len(), attempted = version, "concurrent update");
            return Err(FsError::Concurrency);
        }
        versions.push(ciphertext);
        Ok(())
    }

    async fn vlob_read(
        &self,
        id: EntityId,
        read_token: Uuid,
        version: Option<u32>,
    ) -> FsResult<(u32, Vec<u8>)> {
        self.check_online()?;
        let state = self.state.lock().unwrap();
        let (expected_token, _, versions) = state
            .vlobs
            .get(&id)
            .ok_or_else(|| FsError::Forbidden(format!("unknown vlob {id}")))?;
        if read_token != *expected_token {
            return Err(FsError::Forbidden(format!("bad read token for {id}")));
        }
        let version = version.unwrap_or(versions.len() as u32);
        let idx = version
            .checked_sub(1)
            .map(|v| v as usize)
            .filter(|v| *v < versions.len())
            .ok_or_else(|| FsError::Forbidden(format!("vlob {id} has no version {version}")))?;
        Ok((version, versions[idx].clone()))
    }

    async fn block_create(&self, id: EntityId, ciphertext: Vec<u8>) -> FsResult<()> {
        self.check_online()?;
        self.state.lock().unwrap().blocks.insert(id, ciphertext);
        Ok(())
    }

    async fn block_read(&self, id: EntityId) -> FsResult<Vec<u8>> {
        self.check_online()?;
        let state = self.state.lock().unwrap();
        state
            .blocks
            .get(&id)
            .cloned()
            .ok_or_else(|| FsError::Forbidden(format!("unknown block {id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_then_read() {
        let server = MemoryTransport::new();
        let (id, read_token, _) = server.vlob_create(b"v1".to_vec()).await.unwrap();

        let (version, data) = server.vlob_read(id, read_token, None).await.unwrap();
        assert_eq!(version, 1);
        assert_eq!(data, b"v1");
    }

    #[tokio::test]
    async fn update_enforces_monotonic_versions() {
        let server = MemoryTransport::new();
        let (id, read_token, write_token) = server.vlob_create(b"v1".to_vec()).await.unwrap();

        server.vlob_update(id, write_token, 2, b"v2".to_vec()).await.unwrap();
        // Re-uploading version 2 is a concurrency error
        let err = server.vlob_update(id, write_token, 2, b"v2b".to_vec()).await.unwrap_err();
        assert!(matches!(err, FsError::Concurrency));
        // Skipping versions is too
        let err = server.vlob_update(id, write_token, 4, b"v4".to_vec()).await.unwrap_err();
        assert!(matches!(err, FsError::Concurrency));

        let (version, data) = server.vlob_read(id, read_token, Some(2)).await.unwrap();
        assert_eq!((version, data.as_slice()), (2, b"v2".as_slice()));
    }

    #[tokio::test]
    async fn bad_tokens_are_forbidden() {
        let server = MemoryTransport::new();
        let (id, _, _) = server.vlob_create(b"v1".to_vec()).await.unwrap();

        let err = server.vlob_read(id, Uuid::new_v4(), None).await.unwrap_err();
        assert!(matches!(err, FsError::Forbidden(_)));
        let err = server
            .vlob_update(id, Uuid::new_v4(), 2, b"x".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, FsError::Forbidden(_)));
    }

    #[tokio::test]
    async fn offline_mode() {
        let server = MemoryTransport::new();
        server.set_offline(true);
        let err = server.vlob_create(b"v1".to_vec()).await.unwrap_err();
        assert!(matches!(err, FsError::NotAvailable(_)));
        server.set_offline(false);
        assert!(server.vlob_create(b"v1".to_vec()).await.is_ok());
    }
}
