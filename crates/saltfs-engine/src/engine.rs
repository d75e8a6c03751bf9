//! The engine proper: two persistent stores, the manifest cache, the table
//! of opened files and the remote transport, behind path-based operations.
//!
//! One engine instance is single-task: operations are async but never run
//! concurrently with each other, so manifest reads and children-map updates
//! between awaits need no locks.

use std::collections::HashMap;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info};

use saltfs_core::{
    config::EngineConfig, now_ts, Access, EntityId, FsError, FsResult, LocalFileManifest,
    LocalFolderManifest, LocalManifest, LocalUserManifest, Timestamp,
};
use saltfs_store::Store;

use crate::event::EngineEvent;
use crate::file::{OpenedFile, Payload};
use crate::path::FsPath;
use crate::transport::Transport;
use crate::tree::LocalTree;

/// `stat` summary of one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryStat {
    File {
        id: EntityId,
        created: Timestamp,
        updated: Timestamp,
        base_version: u32,
        is_placeholder: bool,
        need_sync: bool,
        /// Opened with staged writes not yet flushed to dirty blocks.
        need_flush: bool,
        size: u64,
    },
    Folder {
        id: EntityId,
        created: Timestamp,
        updated: Timestamp,
        base_version: u32,
        is_placeholder: bool,
        need_sync: bool,
        children: Vec<String>,
    },
}

pub struct FsEngine<T: Transport> {
    pub(crate) device_id: String,
    pub(crate) block_size: u64,
    pub(crate) sync_cfg: saltfs_core::config::SyncConfig,
    pub(crate) transport: T,
    pub(crate) clean: Store,
    pub(crate) dirty: Store,
    pub(crate) tree: LocalTree,
    pub(crate) files: HashMap<EntityId, OpenedFile>,
    pub(crate) root_access: Access,
    pub(crate) events: Option<mpsc::UnboundedSender<EngineEvent>>,
    /// Entry ids visited by the current sync pass; a second encounter means
    /// the entry is aliased under two parents, which is not permitted.
    pub(crate) sync_visited: std::collections::HashSet<EntityId>,
}

impl<T: Transport> FsEngine<T> {
    /// Open both stores and hydrate the root manifest: local dirty copy
    /// first, then local clean, then the backend, and for a never-synced
    /// root a fresh empty user manifest.
    pub async fn start(config: &EngineConfig, root_access: Access, transport: T) -> FsResult<Self> {
        let workdir = &config.storage.workdir;
        let clean = Store::open(&workdir.join("clean"), Some(config.storage.block_limit()))
            .map_err(crate::manager::store_err)?;
        let dirty = Store::open(&workdir.join("dirty"), None).map_err(crate::manager::store_err)?;

        let mut engine = FsEngine {
            device_id: config.device_id.clone(),
            block_size: config.storage.block_size,
            sync_cfg: config.sync.clone(),
            transport,
            clean,
            dirty,
            tree: LocalTree::new(root_access.id()),
            files: HashMap::new(),
            root_access,
            events: None,
            sync_visited: std::collections::HashSet::new(),
        };

        let root_access = engine.root_access.clone();
        let manifest = match engine.load_local_manifest(&root_access)? {
            Some(manifest) => manifest,
            None => match root_access.as_vlob() {
                Some(vlob) => {
                    let (_, remote) = engine.fetch_manifest_from_backend(vlob, None).await?;
                    let local = remote.into_local();
                    engine.commit_entry(root_access.id(), root_access.key(), &local)?;
                    local
                }
                None => {
                    info!(device = %engine.device_id, "initializing fresh root manifest");
                    let local = LocalManifest::User(LocalUserManifest::new(
                        engine.device_id.clone(),
                        now_ts(),
                    ));
                    engine.commit_entry(root_access.id(), root_access.key(), &local)?;
                    local
                }
            },
        };
        engine.tree.insert(root_access.id(), manifest);
        Ok(engine)
    }

    /// Subscribe to synchronizer events. Only the last subscriber receives.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<EngineEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.events = Some(tx);
        rx
    }

    pub fn root_access(&self) -> &Access {
        &self.root_access
    }

    /// Files currently holding staged commands or an upload marker.
    pub fn open_file_count(&self) -> usize {
        self.files.len()
    }

    /// Walk the tree from the root, hydrating manifests from store or
    /// backend as needed. Fails with `InvalidPath` on a missing child or on
    /// traversal through a file.
    pub async fn retrieve_entry(&mut self, path: &FsPath) -> FsResult<(Access, LocalManifest)> {
        let mut access = self.root_access.clone();
        let mut manifest = self.get_manifest(&access).await?;
        for part in path.parts() {
            let children = manifest
                .children()
                .ok_or_else(|| FsError::InvalidPath(format!("`{path}`: not a folder")))?;
            access = children
                .get(part)
                .ok_or_else(|| FsError::InvalidPath(format!("`{path}`: no entry `{part}`")))?
                .clone();
            manifest = self.get_manifest(&access).await?;
        }
        Ok((access, manifest))
    }

    /// Resolve a batch of paths as one consistent snapshot: a first pass
    /// hydrates whatever is missing (suspending on store or backend), then
    /// a second pass reads everything from the warm cache with no
    /// suspension point in between.
    pub async fn retrieve_entries(
        &mut self,
        paths: &[FsPath],
    ) -> FsResult<Vec<(Access, LocalManifest)>> {
        if let Some(snapshot) = self.try_retrieve_entries_sync(paths)? {
            return Ok(snapshot);
        }
        for path in paths {
            self.retrieve_entry(path).await?;
        }
        self.try_retrieve_entries_sync(paths)?
            .ok_or_else(|| FsError::NotAvailable("cache churned during batch resolution".into()))
    }

    /// Cache-only walk for all `paths`; `None` when any manifest is cold.
    fn try_retrieve_entries_sync(
        &self,
        paths: &[FsPath],
    ) -> FsResult<Option<Vec<(Access, LocalManifest)>>> {
        let mut out = Vec::with_capacity(paths.len());
        for path in paths {
            let mut access = self.root_access.clone();
            let Some(mut manifest) = self.tree.get(access.id()) else {
                return Ok(None);
            };
            for part in path.parts() {
                let children = manifest
                    .children()
                    .ok_or_else(|| FsError::InvalidPath(format!("`{path}`: not a folder")))?;
                access = children
                    .get(part)
                    .ok_or_else(|| FsError::InvalidPath(format!("`{path}`: no entry `{part}`")))?
                    .clone();
                match self.tree.get(access.id()) {
                    Some(m) => manifest = m,
                    None => return Ok(None),
                }
            }
            out.push((access, manifest.clone()));
        }
        Ok(Some(out))
    }

    // ── Create ───────────────────────────────────────────────────────────────

    pub async fn file_create(&mut self, path: &FsPath) -> FsResult<()> {
        let now = now_ts();
        let manifest = LocalManifest::File(LocalFileManifest::new(self.device_id.clone(), now));
        self.create_entry(path, manifest).await
    }

    pub async fn folder_create(&mut self, path: &FsPath) -> FsResult<()> {
        let now = now_ts();
        let manifest = LocalManifest::Folder(LocalFolderManifest::new(self.device_id.clone(), now));
        self.create_entry(path, manifest).await
    }

    async fn create_entry(&mut self, path: &FsPath, manifest: LocalManifest) -> FsResult<()> {
        let name = path
            .name()
            .ok_or_else(|| FsError::InvalidPath("cannot create `/`".into()))?
            .to_string();
        let parent_path = path.parent().expect("non-root path has a parent");
        let (parent_access, mut parent) = self.retrieve_entry(&parent_path).await?;

        let children = parent
            .children_mut()
            .ok_or_else(|| FsError::InvalidPath(format!("`{parent_path}`: not a folder")))?;
        if children.contains_key(&name) {
            return Err(FsError::InvalidPath(format!("`{path}` already exists")));
        }

        let access = Access::new_placeholder();
        children.insert(name, access.clone());
        parent.set_updated(now_ts());
        parent.set_need_sync(true);

        self.commit_entry(access.id(), access.key(), &manifest)?;
        self.tree.insert(access.id(), manifest);
        self.commit_entry(parent_access.id(), parent_access.key(), &parent)?;
        self.tree.insert(parent_access.id(), parent);
        debug!(path = %path, entry = %access.id(), "created entry");
        Ok(())
    }

    // ── File data ────────────────────────────────────────────────────────────

    pub async fn file_read(&mut self, path: &FsPath, size: u64, offset: u64) -> FsResult<Vec<u8>> {
        let (access, manifest) = self.retrieve_entry(path).await?;
        let manifest = as_file(path, &manifest)?;
        let id = self.tree.resolve(access.id());

        // Reads keep no handle open; a file without staged commands is
        // served through a transient view
        let (file_size, map) = match self.files.get(&id) {
            Some(file) => (file.size(), file.read_map(size, offset)),
            None => {
                let view = OpenedFile::new(manifest.clone());
                (view.size(), view.read_map(size, offset))
            }
        };

        // Sized from the clamped request window, not the resolved spaces:
        // a truncate-growth hole has no backing slice but still reads as
        // zeros
        let total = if offset >= file_size {
            0
        } else {
            size.min(file_size - offset)
        };
        let mut out = vec![0u8; total as usize];
        for space in &map.spaces {
            for slice in &space.slices {
                let src_off = slice.buffer_offset() as usize;
                let len = slice.size() as usize;
                let dst = (slice.start - offset) as usize;
                match &slice.buffer.data {
                    Payload::Ram(bytes) => {
                        out[dst..dst + len].copy_from_slice(&bytes[src_off..src_off + len]);
                    }
                    Payload::Dirty(d) => {
                        let data = self.get_dirty_block(d)?;
                        out[dst..dst + len].copy_from_slice(&data[src_off..src_off + len]);
                    }
                    Payload::Clean(b) => {
                        let data = self.fetch_block(b).await?;
                        out[dst..dst + len].copy_from_slice(&data[src_off..src_off + len]);
                    }
                }
            }
        }
        Ok(out)
    }

    pub async fn file_write(&mut self, path: &FsPath, data: &[u8], offset: Option<u64>) -> FsResult<()> {
        let (access, manifest) = self.retrieve_entry(path).await?;
        let manifest = as_file(path, &manifest)?;
        let id = self.tree.resolve(access.id());
        self.opened(id, manifest)
            .write(Bytes::copy_from_slice(data), offset, now_ts());
        Ok(())
    }

    pub async fn file_truncate(&mut self, path: &FsPath, length: u64) -> FsResult<()> {
        let (access, manifest) = self.retrieve_entry(path).await?;
        let manifest = as_file(path, &manifest)?;
        let id = self.tree.resolve(access.id());
        self.opened(id, manifest).truncate(length, now_ts());
        Ok(())
    }

    /// Persist staged writes as dirty blocks and close the file. A no-op on
    /// folders and on files with nothing staged. Store writes failing with
    /// `NotAvailable` are retried once before surfacing.
    pub async fn file_flush(&mut self, path: &FsPath) -> FsResult<()> {
        let (access, manifest) = self.retrieve_entry(path).await?;
        if !manifest.is_file() {
            return Ok(());
        }
        let id = self.tree.resolve(access.id());
        let Some(file) = self.files.get(&id) else {
            return Ok(());
        };
        if !file.has_pending_data() {
            self.files.remove(&id);
            return Ok(());
        }

        let (new_size, buffers) = file.flush_map();
        let cap = file.truncate_cap();
        let updated = file.latest_ts().unwrap_or_else(now_ts);

        let mut staged = Vec::with_capacity(buffers.len());
        for buffer in &buffers {
            let dirty = saltfs_core::DirtyBlockAccess::new(buffer.start, buffer.size());
            crate::manager::retry_once(|| {
                self.dirty
                    .set_block(dirty.id, &dirty.key, &buffer.data)
                    .map_err(crate::manager::store_err)
            })?;
            staged.push(dirty);
        }

        let mut manifest = manifest.clone();
        let dropped = {
            let m = manifest.as_file_mut().expect("checked is_file above");
            // A truncate below the open size invalidates persisted layers
            // past the cut even when later growth restored the size
            let dropped = m.clip_blocks(cap);
            m.dirty_blocks.extend(staged);
            m.size = new_size;
            m.updated = updated;
            m.need_sync = true;
            dropped
        };
        crate::manager::retry_once(|| self.commit_entry(id, access.key(), &manifest))?;
        self.tree.insert(id, manifest);
        self.files.remove(&id);
        for block in dropped {
            if self.dirty.has_block(block) {
                let _ = self.dirty.clear_block(block);
            }
        }
        debug!(path = %path, size = new_size, "flushed file");
        Ok(())
    }

    // ── Tree shape ───────────────────────────────────────────────────────────

    pub async fn move_entry(&mut self, src: &FsPath, dst: &FsPath) -> FsResult<()> {
        if src == dst {
            return Ok(());
        }
        if dst.starts_with(src) {
            return Err(FsError::InvalidPath(format!(
                "cannot move `{src}` under itself (`{dst}`)"
            )));
        }
        let src_name = src
            .name()
            .ok_or_else(|| FsError::InvalidPath("cannot move `/`".into()))?
            .to_string();
        let dst_name = dst
            .name()
            .ok_or_else(|| FsError::InvalidPath("cannot move onto `/`".into()))?
            .to_string();
        let src_parent_path = src.parent().expect("non-root path has a parent");
        let dst_parent_path = dst.parent().expect("non-root path has a parent");
        let now = now_ts();

        if src_parent_path == dst_parent_path {
            let (parent_access, mut parent) = self.retrieve_entry(&src_parent_path).await?;
            let children = parent
                .children_mut()
                .ok_or_else(|| FsError::InvalidPath(format!("`{src_parent_path}`: not a folder")))?;
            if children.contains_key(&dst_name) {
                return Err(FsError::InvalidPath(format!("`{dst}` already exists")));
            }
            let moved = children
                .remove(&src_name)
                .ok_or_else(|| FsError::InvalidPath(format!("`{src}` does not exist")))?;
            children.insert(dst_name, moved);
            parent.set_updated(now);
            parent.set_need_sync(true);
            self.commit_entry(parent_access.id(), parent_access.key(), &parent)?;
            self.tree.insert(parent_access.id(), parent);
            return Ok(());
        }

        let (src_parent_access, mut src_parent) = self.retrieve_entry(&src_parent_path).await?;
        let (dst_parent_access, mut dst_parent) = self.retrieve_entry(&dst_parent_path).await?;

        let dst_children = dst_parent
            .children_mut()
            .ok_or_else(|| FsError::InvalidPath(format!("`{dst_parent_path}`: not a folder")))?;
        if dst_children.contains_key(&dst_name) {
            return Err(FsError::InvalidPath(format!("`{dst}` already exists")));
        }
        let moved = src_parent
            .children_mut()
            .ok_or_else(|| FsError::InvalidPath(format!("`{src_parent_path}`: not a folder")))?
            .remove(&src_name)
            .ok_or_else(|| FsError::InvalidPath(format!("`{src}` does not exist")))?;
        dst_parent
            .children_mut()
            .expect("checked above")
            .insert(dst_name, moved);

        src_parent.set_updated(now);
        src_parent.set_need_sync(true);
        dst_parent.set_updated(now);
        dst_parent.set_need_sync(true);
        self.commit_entry(src_parent_access.id(), src_parent_access.key(), &src_parent)?;
        self.tree.insert(src_parent_access.id(), src_parent);
        self.commit_entry(dst_parent_access.id(), dst_parent_access.key(), &dst_parent)?;
        self.tree.insert(dst_parent_access.id(), dst_parent);
        Ok(())
    }

    /// Remove `path` from its parent. A non-empty folder is allowed; its
    /// children are abandoned to the next store sweep.
    pub async fn delete(&mut self, path: &FsPath) -> FsResult<()> {
        let name = path
            .name()
            .ok_or_else(|| FsError::InvalidPath("cannot delete `/`".into()))?
            .to_string();
        let parent_path = path.parent().expect("non-root path has a parent");
        let (parent_access, mut parent) = self.retrieve_entry(&parent_path).await?;

        let removed = parent
            .children_mut()
            .ok_or_else(|| FsError::InvalidPath(format!("`{parent_path}`: not a folder")))?
            .remove(&name)
            .ok_or_else(|| FsError::InvalidPath(format!("`{path}` does not exist")))?;
        parent.set_updated(now_ts());
        parent.set_need_sync(true);
        self.commit_entry(parent_access.id(), parent_access.key(), &parent)?;
        self.tree.insert(parent_access.id(), parent);

        let id = self.tree.resolve(removed.id());
        self.files.remove(&id);
        self.tree.remove(id);
        // Store copies are dropped eagerly when present; block files are
        // left for the orphan sweep
        if self.dirty.has_manifest(id) {
            let _ = self.dirty.clear_manifest(id);
        }
        if self.clean.has_manifest(id) {
            let _ = self.clean.clear_manifest(id);
        }
        debug!(path = %path, entry = %id, "deleted entry");
        Ok(())
    }

    pub async fn stat(&mut self, path: &FsPath) -> FsResult<EntryStat> {
        let (access, manifest) = self.retrieve_entry(path).await?;
        let id = self.tree.resolve(access.id());
        let stat = match &manifest {
            LocalManifest::File(m) => {
                let opened = self.files.get(&id);
                EntryStat::File {
                    id,
                    created: m.created,
                    updated: m.updated,
                    base_version: m.base_version,
                    is_placeholder: access.is_placeholder(),
                    need_sync: m.need_sync,
                    need_flush: opened.is_some_and(|f| f.has_pending_data()),
                    size: opened.map_or(m.size, |f| f.size()),
                }
            }
            _ => {
                let folder = manifest.folder_view().expect("non-file is folder-shaped");
                EntryStat::Folder {
                    id,
                    created: folder.created,
                    updated: folder.updated,
                    base_version: folder.base_version,
                    is_placeholder: access.is_placeholder(),
                    need_sync: folder.need_sync,
                    children: folder.children.keys().cloned().collect(),
                }
            }
        };
        Ok(stat)
    }

    // ── Opened files ─────────────────────────────────────────────────────────

    pub(crate) fn opened(&mut self, id: EntityId, manifest: &LocalFileManifest) -> &mut OpenedFile {
        self.files
            .entry(id)
            .or_insert_with(|| OpenedFile::new(manifest.clone()))
    }

    pub(crate) fn emit(&self, event: EngineEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

fn as_file<'m>(path: &FsPath, manifest: &'m LocalManifest) -> FsResult<&'m LocalFileManifest> {
    manifest
        .as_file()
        .ok_or_else(|| FsError::InvalidPath(format!("`{path}` is not a file")))
}
