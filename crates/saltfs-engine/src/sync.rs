//! Recursive synchronizer: snapshot, recurse into children, upload, merge
//! on concurrent server changes, reintegrate.
//!
//! Internal signals never escape [`FsEngine::sync`]: a stale upload surfaces
//! as `Concurrency` from the transport and is consumed by a folder merge
//! retry, or escalates to `SyncConflict` for files, which the parent folder
//! resolves by renaming the diverged local copy next to the server's
//! version.

use std::future::Future;
use std::pin::Pin;

use anyhow::anyhow;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use saltfs_buffer::BufferSlice;
use saltfs_core::{
    now_ts, Access, Children, EntityId, FsError, FsResult, LocalManifest, RemoteFileManifest,
    RemoteFolderManifest, RemoteManifest, RemoteUserManifest, VlobAccess,
};

use crate::engine::FsEngine;
use crate::event::EngineEvent;
use crate::file::{OpenedFile, Payload};
use crate::merge::{conflict_name, merge_children};
use crate::path::FsPath;
use crate::transport::Transport;

fn remote_folder_view(remote: &RemoteManifest) -> FsResult<&RemoteFolderManifest> {
    match remote {
        RemoteManifest::Folder(m) => Ok(m),
        RemoteManifest::User(m) => Ok(&m.folder),
        RemoteManifest::File(_) => Err(FsError::Corrupt(
            "entry changed type between folder and file".into(),
        )),
    }
}

fn remote_children(remote: &RemoteManifest) -> FsResult<Children> {
    Ok(remote_folder_view(remote)?
        .children
        .iter()
        .map(|(name, vlob)| (name.clone(), Access::Vlob(vlob.clone())))
        .collect())
}

fn to_remote_folder(manifest: &LocalManifest, version: u32) -> FsResult<(RemoteManifest, bool)> {
    match manifest {
        LocalManifest::Folder(m) => {
            let (remote, stripped) = m.to_remote_stripped(version);
            Ok((RemoteManifest::Folder(remote), stripped))
        }
        LocalManifest::User(m) => {
            let (folder, stripped) = m.folder.to_remote_stripped(version);
            Ok((
                RemoteManifest::User(RemoteUserManifest {
                    folder,
                    last_processed_message: m.last_processed_message,
                }),
                stripped,
            ))
        }
        LocalManifest::File(_) => Err(FsError::Corrupt("file manifest in folder sync".into())),
    }
}

fn children_match(local: &Children, uploaded: &RemoteFolderManifest) -> bool {
    local.len() == uploaded.children.len()
        && local.iter().all(|(name, access)| {
            uploaded
                .children
                .get(name)
                .is_some_and(|v| v.id == access.id())
        })
}

impl<T: Transport> FsEngine<T> {
    /// Synchronize the whole tree. Only the root path is accepted for now;
    /// subtree-rooted sync is not implemented.
    pub async fn sync(&mut self, path: &FsPath) -> FsResult<()> {
        if !path.is_root() {
            return Err(FsError::InvalidPath(format!(
                "sync currently accepts `/` only, got `{path}`"
            )));
        }
        let root = self.root_access.clone();
        self.sync_visited.clear();
        self.sync_visited.insert(self.tree.resolve(root.id()));
        match self.sync_entry(root).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_internal() => {
                Err(FsError::Other(anyhow!("sync signal escaped the root: {e}")))
            }
            Err(e) => Err(e),
        }
    }

    async fn sync_entry(&mut self, access: Access) -> FsResult<Access> {
        let manifest = self.get_manifest(&access).await?;
        if manifest.is_file() {
            self.sync_file(access).await
        } else {
            self.sync_folder(access).await
        }
    }

    /// `async fn` recursion needs one boxing point.
    fn sync_entry_boxed(
        &mut self,
        access: Access,
    ) -> Pin<Box<dyn Future<Output = FsResult<Access>> + '_>> {
        Box::pin(self.sync_entry(access))
    }

    // ── Folders ──────────────────────────────────────────────────────────────

    async fn sync_folder(&mut self, access: Access) -> FsResult<Access> {
        let manifest = self.get_manifest(&access).await?;
        let snapshot: Vec<(String, Access)> = manifest
            .children()
            .ok_or_else(|| FsError::Corrupt("folder sync on a file manifest".into()))?
            .iter()
            .map(|(name, child)| (name.clone(), child.clone()))
            .collect();

        for (name, child) in snapshot {
            // An entry reachable from two parents violates the tree shape;
            // the second encounter is logged and skipped
            if !self.sync_visited.insert(self.tree.resolve(child.id())) {
                warn!(child = %name, entry = %child.id(), "aliased entry, skipping");
                continue;
            }
            let result = if child.is_placeholder() {
                self.sync_placeholder(&access, &name, &child).await
            } else {
                self.sync_entry_boxed(child.clone()).await.map(|_| ())
            };
            match result {
                Ok(()) => {}
                Err(FsError::SyncConflict) => {
                    self.handle_file_conflict(&access, &name, &child)?;
                }
                // A child that cannot be synced right now does not block its
                // siblings; it stays dirty for the next pass
                Err(FsError::NotAvailable(msg)) => {
                    warn!(child = %name, %msg, "child sync skipped: backend unavailable");
                }
                Err(FsError::Forbidden(msg)) => {
                    warn!(child = %name, %msg, "child sync skipped: access denied");
                }
                Err(e) => return Err(e),
            }
        }

        // Children sync may have promoted placeholders and rewritten us
        let current = self.get_manifest(&access).await?;
        if !current.need_sync() && !access.is_placeholder() {
            return Ok(access);
        }
        self.upload_folder(access).await
    }

    async fn upload_folder(&mut self, access: Access) -> FsResult<Access> {
        let id = self.tree.resolve(access.id());
        let key = access.key().clone();
        let mut version = self.get_manifest(&access).await?.base_version() + 1;
        let mut attempts = 0u32;
        let mut backoff = self.sync_cfg.backoff_ms;

        loop {
            let current = self.get_manifest(&access).await?;
            let (remote, stripped) = to_remote_folder(&current, version)?;
            let ciphertext = self.seal_remote_manifest(&key, &remote)?;

            match access.as_vlob() {
                None => {
                    let (vlob_id, read_token, write_token) =
                        self.transport.vlob_create(ciphertext).await?;
                    let new_access = self.promote(
                        id,
                        VlobAccess {
                            id: vlob_id,
                            key: key.clone(),
                            read_token,
                            write_token,
                        },
                    );
                    return self.reintegrate_folder(new_access, &remote, stripped, version);
                }
                Some(vlob) => {
                    match self
                        .transport
                        .vlob_update(vlob.id, vlob.write_token, version, ciphertext)
                        .await
                    {
                        Ok(()) => {
                            return self.reintegrate_folder(access.clone(), &remote, stripped, version)
                        }
                        Err(FsError::Concurrency) => {
                            attempts += 1;
                            if attempts > self.sync_cfg.max_retries {
                                return Err(FsError::Other(anyhow!(
                                    "folder sync for {id}: retries exhausted"
                                )));
                            }
                            if self.merge_folder_with_server(&access, vlob, &current).await? {
                                // Merged state equals the server's; nothing
                                // left to upload
                                return Ok(access.clone());
                            }
                            version = self.get_manifest(&access).await?.base_version() + 1;
                            debug!(entry = %id, version, attempts, "folder merged, retrying upload");
                            sleep(Duration::from_millis(backoff)).await;
                            backoff *= 2;
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }
    }

    /// Three-way merge of our children map against the server head after a
    /// stale upload. Returns true when the merge resolved to the server's
    /// state exactly (no re-upload needed).
    async fn merge_folder_with_server(
        &mut self,
        access: &Access,
        vlob: &VlobAccess,
        current: &LocalManifest,
    ) -> FsResult<bool> {
        let id = self.tree.resolve(access.id());
        let base_children = match current.base_version() {
            0 => Children::new(),
            base_version => {
                let (_, base) = self
                    .fetch_manifest_from_backend(vlob, Some(base_version))
                    .await?;
                remote_children(&base)?
            }
        };
        let (target_version, target) = self.fetch_manifest_from_backend(vlob, None).await?;
        let target_children = remote_children(&target)?;
        let local_children = current
            .children()
            .ok_or_else(|| FsError::Corrupt("folder sync on a file manifest".into()))?
            .clone();

        let now = now_ts();
        let (merged, modified) = merge_children(&base_children, &local_children, &target_children, now);

        // Entries that lost a same-name conflict survived under a new name
        for (name, child) in &local_children {
            if merged.get(name).is_some_and(|a| a.id() == child.id()) {
                continue;
            }
            if let Some((renamed, _)) = merged.iter().find(|(n, a)| a.id() == child.id() && *n != name)
            {
                warn!(entry = %child.id(), from = %name, to = %renamed, "conflict rename in folder merge");
                self.emit(EngineEvent::ConflictRenamed {
                    entry: child.id(),
                    original_name: name.clone(),
                    renamed_to: renamed.clone(),
                });
            }
        }

        // The message cursor advances on either side and never regresses
        let local_cursor = match current {
            LocalManifest::User(m) => Some(m.last_processed_message),
            _ => None,
        };

        if !modified {
            let mut local = target.into_local();
            if let (LocalManifest::User(m), Some(cursor)) = (&mut local, local_cursor) {
                m.last_processed_message = m.last_processed_message.max(cursor);
            }
            self.commit_entry(id, &vlob.key, &local)?;
            self.tree.insert(id, local);
            return Ok(true);
        }

        let mut updated = self.get_manifest(access).await?;
        *updated
            .children_mut()
            .ok_or_else(|| FsError::Corrupt("folder sync on a file manifest".into()))? = merged;
        if let (LocalManifest::User(m), RemoteManifest::User(t)) = (&mut updated, &target) {
            m.last_processed_message = m.last_processed_message.max(t.last_processed_message);
        }
        updated.set_updated(now);
        updated.set_need_sync(true);
        updated.set_base_version(target_version);
        self.commit_entry(id, &vlob.key, &updated)?;
        self.tree.insert(id, updated);
        Ok(false)
    }

    /// Install the post-upload authoritative state, keeping the live
    /// children map (it may have changed during the upload await, and
    /// stripped placeholder children are still only local).
    fn reintegrate_folder(
        &mut self,
        access: Access,
        uploaded: &RemoteManifest,
        stripped: bool,
        version: u32,
    ) -> FsResult<Access> {
        let id = self.tree.resolve(access.id());
        let mut current = self
            .tree
            .get(id)
            .cloned()
            .ok_or_else(|| FsError::Corrupt(format!("entry {id} vanished during sync")))?;
        let uploaded = remote_folder_view(uploaded)?;
        let clean = !stripped
            && current
                .children()
                .is_some_and(|children| children_match(children, uploaded));
        current.set_base_version(version);
        current.set_need_sync(!clean);
        self.commit_entry(id, access.key(), &current)?;
        self.tree.insert(id, current);
        info!(entry = %id, version, clean, "folder synced");
        Ok(access)
    }

    /// Sync a placeholder child, then swap the resolved access into the
    /// parent's children map if the name still points at it.
    async fn sync_placeholder(
        &mut self,
        parent_access: &Access,
        name: &str,
        child: &Access,
    ) -> FsResult<()> {
        let new_access = self.sync_entry_boxed(child.clone()).await?;
        let parent_id = self.tree.resolve(parent_access.id());
        let Some(parent) = self.tree.get(parent_id) else {
            return Ok(());
        };
        let mut parent = parent.clone();
        let children = parent
            .children_mut()
            .ok_or_else(|| FsError::Corrupt("placeholder parent is not a folder".into()))?;
        match children.get(name) {
            Some(existing) if existing.id() == child.id() => {
                children.insert(name.to_string(), new_access);
                parent.set_need_sync(true);
                self.commit_entry(parent_id, parent_access.key(), &parent)?;
                self.tree.insert(parent_id, parent);
            }
            // Moved or removed while the child was syncing: the entry that
            // now holds it will pick the resolved access up on its own pass
            _ => debug!(child = %child.id(), name, "placeholder left its slot during sync"),
        }
        Ok(())
    }

    /// A file lost to a concurrent remote change: keep the server's version
    /// under the original name and our diverged copy under a conflict name.
    fn handle_file_conflict(
        &mut self,
        parent_access: &Access,
        name: &str,
        child: &Access,
    ) -> FsResult<()> {
        let child_id = self.tree.resolve(child.id());
        let Some(new_access) = self.tree.detach_as_placeholder(child_id) else {
            return Ok(());
        };
        if let Some(file) = self.files.remove(&child_id) {
            self.files.insert(new_access.id(), file);
        }
        let detached = self
            .tree
            .get(new_access.id())
            .cloned()
            .ok_or_else(|| FsError::Corrupt("detached entry vanished".into()))?;
        self.commit_entry(new_access.id(), new_access.key(), &detached)?;
        // Drop local copies under the old id so the server's version is
        // refetched as truth
        if self.dirty.has_manifest(child_id) {
            let _ = self.dirty.clear_manifest(child_id);
        }
        if self.clean.has_manifest(child_id) {
            let _ = self.clean.clear_manifest(child_id);
        }

        let parent_id = self.tree.resolve(parent_access.id());
        let mut parent = self
            .tree
            .get(parent_id)
            .cloned()
            .ok_or_else(|| FsError::Corrupt("conflict parent vanished".into()))?;
        let now = now_ts();
        let children = parent
            .children_mut()
            .ok_or_else(|| FsError::Corrupt("conflict parent is not a folder".into()))?;
        let renamed = conflict_name(children, name, now);
        children.insert(renamed.clone(), new_access.clone());
        parent.set_updated(now);
        parent.set_need_sync(true);
        self.commit_entry(parent_id, parent_access.key(), &parent)?;
        self.tree.insert(parent_id, parent);

        warn!(entry = %child_id, from = %name, to = %renamed, "file conflict: local copy renamed");
        self.emit(EngineEvent::ConflictRenamed {
            entry: new_access.id(),
            original_name: name.to_string(),
            renamed_to: renamed,
        });
        Ok(())
    }

    // ── Files ────────────────────────────────────────────────────────────────

    async fn sync_file(&mut self, access: Access) -> FsResult<Access> {
        let id = self.tree.resolve(access.id());
        let manifest = match self.get_manifest(&access).await? {
            LocalManifest::File(m) => m,
            _ => return Err(FsError::Corrupt("file sync on a folder manifest".into())),
        };
        let pending = self.files.get(&id).is_some_and(|f| f.has_pending_data());

        if !manifest.need_sync && !pending {
            let Some(vlob) = access.as_vlob() else {
                // A placeholder is always need_sync; nothing to do otherwise
                return Ok(access);
            };
            let (head, remote) = self.fetch_manifest_from_backend(vlob, None).await?;
            if head == manifest.base_version {
                return Ok(access);
            }
            let RemoteManifest::File(remote) = remote else {
                return Err(FsError::Corrupt(
                    "entry changed type between folder and file".into(),
                ));
            };
            // Clean local state: fast-forward to the server head
            let local = remote.into_local();
            if let Some(file) = self.files.get_mut(&id) {
                file.rebase(local.clone());
            }
            self.commit_entry(id, access.key(), &LocalManifest::File(local.clone()))?;
            self.tree.insert(id, LocalManifest::File(local));
            info!(entry = %id, version = head, "file fast-forwarded");
            return Ok(access);
        }

        self.upload_file(access, id, manifest).await
    }

    async fn upload_file(
        &mut self,
        access: Access,
        id: EntityId,
        manifest: saltfs_core::LocalFileManifest,
    ) -> FsResult<Access> {
        let block_size = self.block_size;
        let file = self
            .files
            .entry(id)
            .or_insert_with(|| OpenedFile::new(manifest.clone()));
        let marker = file.create_marker();
        let size = file.size();
        let updated = file.latest_ts().unwrap_or(manifest.updated);
        let slices: Vec<BufferSlice<Payload>> = file
            .sync_map(block_size)
            .spaces
            .iter()
            .flat_map(|space| space.slices.iter().cloned())
            .collect();

        let mut blocks = Vec::new();
        let mut start = 0u64;
        while start < size {
            let end = (start + block_size).min(size);
            let window: Vec<&BufferSlice<Payload>> = slices
                .iter()
                .filter(|s| s.start < end && s.end > start)
                .collect();

            // A window backed by exactly one untrimmed clean block that
            // spans it is reused as-is
            let reusable = match window.as_slice() {
                [slice] if slice.start == start && slice.end == end => match &slice.buffer.data {
                    Payload::Clean(b) if b.offset == start && b.size == end - start => {
                        Some(b.clone())
                    }
                    _ => None,
                },
                _ => None,
            };

            match reusable {
                Some(block) => blocks.push(block),
                None => {
                    // Holes within the window stay zero
                    let mut data = vec![0u8; (end - start) as usize];
                    for slice in &window {
                        let lo = slice.start.max(start);
                        let hi = slice.end.min(end);
                        let src = (slice.buffer_offset() + (lo - slice.start)) as usize;
                        let len = (hi - lo) as usize;
                        let dst = (lo - start) as usize;
                        match &slice.buffer.data {
                            Payload::Ram(bytes) => {
                                data[dst..dst + len].copy_from_slice(&bytes[src..src + len]);
                            }
                            Payload::Dirty(d) => {
                                let bytes = self.get_dirty_block(d)?;
                                data[dst..dst + len].copy_from_slice(&bytes[src..src + len]);
                            }
                            Payload::Clean(b) => {
                                let bytes = self.fetch_block(b).await?;
                                data[dst..dst + len].copy_from_slice(&bytes[src..src + len]);
                            }
                        }
                    }
                    blocks.push(self.upload_block(start, &data).await?);
                }
            }
            start = end;
        }

        let version = manifest.base_version + 1;
        let remote = RemoteFileManifest {
            author: self.device_id.clone(),
            created: manifest.created,
            updated,
            version,
            size,
            blocks,
        };
        let ciphertext =
            self.seal_remote_manifest(access.key(), &RemoteManifest::File(remote.clone()))?;

        let new_access = match access.as_vlob() {
            None => {
                let (vlob_id, read_token, write_token) =
                    self.transport.vlob_create(ciphertext).await?;
                self.promote(
                    id,
                    VlobAccess {
                        id: vlob_id,
                        key: access.key().clone(),
                        read_token,
                        write_token,
                    },
                )
            }
            Some(vlob) => {
                match self
                    .transport
                    .vlob_update(vlob.id, vlob.write_token, version, ciphertext)
                    .await
                {
                    Ok(()) => access.clone(),
                    Err(FsError::Concurrency) => {
                        debug!(entry = %id, version, "file diverged from server head");
                        return Err(FsError::SyncConflict);
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        let new_id = self.tree.resolve(new_access.id());
        let consumed: Vec<EntityId> = manifest.dirty_blocks.iter().map(|d| d.id).collect();
        let local = remote.into_local();
        if let Some(file) = self.files.get_mut(&new_id) {
            file.drop_until_marker(marker);
            file.rebase(local.clone());
            if !file.has_pending_data() {
                self.files.remove(&new_id);
            }
        }
        self.commit_entry(new_id, new_access.key(), &LocalManifest::File(local.clone()))?;
        self.tree.insert(new_id, LocalManifest::File(local));
        for block in consumed {
            if self.dirty.has_block(block) {
                let _ = self.dirty.clear_block(block);
            }
        }
        info!(entry = %new_id, version, size, "file synced");
        Ok(new_access)
    }
}
