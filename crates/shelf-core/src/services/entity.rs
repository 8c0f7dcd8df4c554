//! Per-kind CRUD surface used by the UI layer.

use crate::db::{LocalStore, Subscription};
use crate::models::{EntityKind, EntitySpec, Fields, LocalRecord, NewRecord, RecordPatch};
use crate::remote::RemoteStore;
use crate::sync::SyncOrchestrator;
use crate::util::now_millis;
use crate::{Error, Result};

/// Local mutations of one entity kind, each followed by a background sync.
///
/// Callers never wait on the network: every method returns as soon as the
/// local store has committed.
pub struct EntityService<R: RemoteStore + 'static> {
    kind: EntityKind,
    store: LocalStore,
    orchestrator: SyncOrchestrator<R>,
}

impl<R: RemoteStore + 'static> Clone for EntityService<R> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            store: self.store.clone(),
            orchestrator: self.orchestrator.clone(),
        }
    }
}

impl<R: RemoteStore + 'static> EntityService<R> {
    pub fn new(kind: EntityKind, orchestrator: SyncOrchestrator<R>) -> Self {
        Self {
            kind,
            store: orchestrator.local().clone(),
            orchestrator,
        }
    }

    pub const fn kind(&self) -> EntityKind {
        self.kind
    }

    fn spec(&self) -> &'static EntitySpec {
        self.kind.spec()
    }

    /// Create a record and return its local id.
    pub async fn add(&self, fields: Fields, parent_local_id: Option<i64>) -> Result<i64> {
        let spec = self.spec();
        spec.validate_fields(&fields)?;
        self.check_parent(parent_local_id).await?;

        let local_id = self
            .store
            .add(
                self.kind,
                NewRecord::new(fields).with_parent(parent_local_id),
            )
            .await?;
        tracing::debug!("Added {} #{local_id}", self.kind);
        self.orchestrator.sync();
        Ok(local_id)
    }

    /// Merge the given fields into a record.
    pub async fn update(&self, local_id: i64, fields: Fields) -> Result<()> {
        self.spec().validate_fields(&fields)?;
        let record = self.live(local_id).await?;

        let mut merged = record.fields.clone();
        merged.extend(fields);
        self.store
            .update(
                self.kind,
                local_id,
                RecordPatch::default()
                    .fields(merged)
                    .updated_at(next_updated_at(&record))
                    .version(record.version + 1),
            )
            .await?;
        self.orchestrator.sync();
        Ok(())
    }

    /// Tombstone a record; the deletion reaches the remote store on sync.
    pub async fn delete(&self, local_id: i64) -> Result<()> {
        let record = self.live(local_id).await?;
        self.store
            .update(
                self.kind,
                local_id,
                RecordPatch::default()
                    .is_deleted(true)
                    .updated_at(next_updated_at(&record))
                    .version(record.version + 1),
            )
            .await?;
        tracing::debug!("Deleted {} #{local_id}", self.kind);
        self.orchestrator.sync();
        Ok(())
    }

    /// A live record by local id.
    pub async fn get(&self, local_id: i64) -> Result<Option<LocalRecord>> {
        Ok(self
            .store
            .get(self.kind, local_id)
            .await?
            .filter(|record| !record.is_deleted))
    }

    /// All live records.
    pub async fn list(&self) -> Result<Vec<LocalRecord>> {
        self.store.list_live(self.kind).await
    }

    /// Live records owned by the given parent.
    pub async fn list_for_parent(&self, parent_local_id: i64) -> Result<Vec<LocalRecord>> {
        let mut records = self.list().await?;
        records.retain(|record| record.parent_local_id == Some(parent_local_id));
        Ok(records)
    }

    /// Snapshots of this kind, tombstones included.
    pub fn subscribe(&self) -> Subscription {
        self.store.subscribe(self.kind)
    }

    async fn live(&self, local_id: i64) -> Result<LocalRecord> {
        self.get(local_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("{} #{local_id}", self.kind)))
    }

    async fn check_parent(&self, parent_local_id: Option<i64>) -> Result<()> {
        match (self.spec().parent, parent_local_id) {
            (None, None) => Ok(()),
            (None, Some(_)) => Err(Error::InvalidInput(format!(
                "{} records have no parent",
                self.kind
            ))),
            (Some(link), None) if link.required => Err(Error::InvalidInput(format!(
                "{} requires a {}",
                self.kind, link.kind
            ))),
            (Some(_), None) => Ok(()),
            (Some(link), Some(parent_id)) => {
                let parent = self.store.get(link.kind, parent_id).await?;
                if parent.is_some_and(|parent| !parent.is_deleted) {
                    Ok(())
                } else {
                    Err(Error::NotFound(format!("{} #{parent_id}", link.kind)))
                }
            }
        }
    }
}

/// A strictly later `updated_at`, even if the clock went backwards.
fn next_updated_at(record: &LocalRecord) -> i64 {
    now_millis().max(record.updated_at + 1)
}
