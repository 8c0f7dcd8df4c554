//! Local/remote id translation per entity kind.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::db::LocalStore;
use crate::models::{EntityKind, LocalRecord};
use crate::Result;

#[derive(Debug, Default)]
struct Bindings {
    to_remote: HashMap<i64, i64>,
    to_local: HashMap<i64, i64>,
}

impl Bindings {
    fn bind(&mut self, local_id: i64, remote_id: i64) {
        if let Some(previous) = self.to_remote.insert(local_id, remote_id) {
            self.to_local.remove(&previous);
        }
        if let Some(previous) = self.to_local.insert(remote_id, local_id) {
            if previous != local_id {
                self.to_remote.remove(&previous);
            }
        }
    }

    fn unbind_local(&mut self, local_id: i64) {
        if let Some(remote_id) = self.to_remote.remove(&local_id) {
            self.to_local.remove(&remote_id);
        }
    }
}

/// Bidirectional local/remote id table.
///
/// Lookups returning `None` mean "not yet": the caller defers the record
/// to a later cycle. Every binding mirrors a `remote_id` committed to the
/// local store, so the map can always be rebuilt from it.
#[derive(Debug, Default)]
pub struct IdentityMap {
    kinds: RwLock<HashMap<EntityKind, Bindings>>,
}

impl IdentityMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a map from the current contents of the local store.
    pub async fn hydrate(store: &LocalStore) -> Result<Self> {
        let map = Self::new();
        map.load(store, EntityKind::ALL).await?;
        Ok(map)
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<EntityKind, Bindings>> {
        self.kinds.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<EntityKind, Bindings>> {
        self.kinds.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn local_to_remote(&self, kind: EntityKind, local_id: i64) -> Option<i64> {
        self.read()
            .get(&kind)
            .and_then(|bindings| bindings.to_remote.get(&local_id).copied())
    }

    pub fn remote_to_local(&self, kind: EntityKind, remote_id: i64) -> Option<i64> {
        self.read()
            .get(&kind)
            .and_then(|bindings| bindings.to_local.get(&remote_id).copied())
    }

    /// Record that a local record is backed by a remote row.
    pub fn bind(&self, kind: EntityKind, local_id: i64, remote_id: i64) {
        self.write().entry(kind).or_default().bind(local_id, remote_id);
    }

    /// Forget the binding of a purged local record.
    pub fn unbind_local(&self, kind: EntityKind, local_id: i64) {
        if let Some(bindings) = self.write().get_mut(&kind) {
            bindings.unbind_local(local_id);
        }
    }

    /// Replace the bindings of a kind with those of a local snapshot.
    pub fn absorb(&self, kind: EntityKind, records: &[LocalRecord]) {
        let mut bindings = Bindings::default();
        for record in records {
            if let Some(remote_id) = record.remote_id {
                bindings.bind(record.local_id, remote_id);
            }
        }
        self.write().insert(kind, bindings);
    }

    /// Rebuild the bindings of the given kinds from the local store.
    pub async fn load(
        &self,
        store: &LocalStore,
        kinds: impl IntoIterator<Item = EntityKind>,
    ) -> Result<()> {
        for kind in kinds {
            let records = store.get_all(kind).await?;
            self.absorb(kind, &records);
        }
        Ok(())
    }

    /// Number of bindings held for a kind.
    pub fn len(&self, kind: EntityKind) -> usize {
        self.read()
            .get(&kind)
            .map_or(0, |bindings| bindings.to_remote.len())
    }

    pub fn is_empty(&self, kind: EntityKind) -> bool {
        self.len(kind) == 0
    }
}
