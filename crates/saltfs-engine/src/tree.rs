//! In-RAM cache of the manifests the engine is currently working with,
//! keyed by access id.
//!
//! When a placeholder gets promoted its entry is re-keyed under the server
//! id, and the old id is kept in a resolution map so handles taken before
//! the promotion keep working. Resolutions chain (a placeholder may be
//! renamed into a conflict placeholder that is itself promoted later).

use std::collections::HashMap;

use saltfs_core::{Access, EntityId, LocalManifest};

#[derive(Debug)]
pub struct LocalTree {
    root_id: EntityId,
    entries: HashMap<EntityId, LocalManifest>,
    /// Old id → id it was promoted or renamed to.
    resolutions: HashMap<EntityId, EntityId>,
}

impl LocalTree {
    pub fn new(root_id: EntityId) -> Self {
        Self {
            root_id,
            entries: HashMap::new(),
            resolutions: HashMap::new(),
        }
    }

    pub fn root_id(&self) -> EntityId {
        self.resolve(self.root_id)
    }

    /// Follow the resolution chain to the id currently holding the entry.
    pub fn resolve(&self, id: EntityId) -> EntityId {
        let mut id = id;
        while let Some(next) = self.resolutions.get(&id) {
            id = *next;
        }
        id
    }

    pub fn get(&self, id: EntityId) -> Option<&LocalManifest> {
        self.entries.get(&self.resolve(id))
    }

    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut LocalManifest> {
        let id = self.resolve(id);
        self.entries.get_mut(&id)
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.entries.contains_key(&self.resolve(id))
    }

    /// Insert or replace the entry under `id` (resolution applied).
    pub fn insert(&mut self, id: EntityId, manifest: LocalManifest) {
        self.entries.insert(self.resolve(id), manifest);
    }

    pub fn remove(&mut self, id: EntityId) -> Option<LocalManifest> {
        let id = self.resolve(id);
        self.entries.remove(&id)
    }

    /// Record a promotion: the entry cached under `placeholder` now lives
    /// under `vlob_id`.
    pub fn record_promotion(&mut self, placeholder: EntityId, vlob_id: EntityId) {
        let placeholder = self.resolve(placeholder);
        if placeholder == vlob_id {
            return;
        }
        if let Some(manifest) = self.entries.remove(&placeholder) {
            self.entries.insert(vlob_id, manifest);
        }
        self.resolutions.insert(placeholder, vlob_id);
    }

    /// Detach the entry under `id` as a brand-new placeholder (conflict
    /// rename path). The entry keeps its content but forgets its server
    /// identity: fresh id and key, `base_version` 0, `need_sync` true.
    /// No resolution is recorded: the old id must go back to resolving the
    /// server's version of the entry, not the detached copy.
    /// Returns the new access, or `None` when the entry is not cached.
    pub fn detach_as_placeholder(&mut self, id: EntityId) -> Option<Access> {
        let id = self.resolve(id);
        let mut manifest = self.entries.remove(&id)?;
        match &mut manifest {
            LocalManifest::File(m) => {
                m.base_version = 0;
                m.need_sync = true;
            }
            LocalManifest::Folder(m) => {
                m.base_version = 0;
                m.need_sync = true;
            }
            LocalManifest::User(m) => {
                m.folder.base_version = 0;
                m.folder.need_sync = true;
            }
        }
        let access = Access::new_placeholder();
        self.entries.insert(access.id(), manifest);
        Some(access)
    }
}
