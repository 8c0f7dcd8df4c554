//! Device-local record store with change subscriptions

use std::path::PathBuf;
use std::sync::Arc;

use libsql::{Row, Value};
use tokio::sync::{broadcast, Mutex};

use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::models::{EntityKind, Fields, LocalRecord, NewRecord, RecordPatch};

use super::Database;

const COLUMNS: &str = "local_id, remote_id, parent_local_id, fields, created_at, updated_at, \
                       last_synced_at, is_deleted, version";

const CHANGE_CAPACITY: usize = 256;

/// Durable on-device storage, one table per entity kind.
///
/// Cloning is cheap; all clones share the connection and the change feed.
#[derive(Clone)]
pub struct LocalStore {
    db: Arc<Mutex<Database>>,
    changes: broadcast::Sender<EntityKind>,
}

impl LocalStore {
    /// Wrap an opened database.
    pub fn new(db: Database) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            db: Arc::new(Mutex::new(db)),
            changes,
        }
    }

    /// Open a store at the given filesystem path.
    pub async fn open(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self::new(Database::open(&db_path).await?))
    }

    /// Open an in-memory store (primarily for tests).
    pub async fn open_in_memory() -> Result<Self> {
        Ok(Self::new(Database::open_in_memory().await?))
    }

    /// Open the store described by the host configuration.
    pub async fn from_config(config: &StoreConfig) -> Result<Self> {
        match &config.db_path {
            Some(path) => Self::open(path.clone()).await,
            None => {
                tracing::info!("No database path configured; keeping local store in memory");
                Self::open_in_memory().await
            }
        }
    }

    /// Every record of a kind, tombstones included.
    pub async fn get_all(&self, kind: EntityKind) -> Result<Vec<LocalRecord>> {
        let db = self.db.lock().await;
        let mut rows = db
            .connection()
            .query(
                &format!("SELECT {COLUMNS} FROM {} ORDER BY local_id", kind.table()),
                (),
            )
            .await?;

        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(parse_record(kind, &row)?);
        }
        Ok(records)
    }

    /// Records of a kind that are not soft-deleted.
    pub async fn list_live(&self, kind: EntityKind) -> Result<Vec<LocalRecord>> {
        let mut records = self.get_all(kind).await?;
        records.retain(|record| !record.is_deleted);
        Ok(records)
    }

    /// Fetch a record by local id, tombstones included.
    pub async fn get(&self, kind: EntityKind, local_id: i64) -> Result<Option<LocalRecord>> {
        let db = self.db.lock().await;
        Self::fetch(&db, kind, local_id).await
    }

    /// Insert a record and return its new local id.
    pub async fn add(&self, kind: EntityKind, record: NewRecord) -> Result<i64> {
        let fields = serde_json::to_string(&record.fields)?;
        let local_id = {
            let db = self.db.lock().await;
            let conn = db.connection();
            conn.execute(
                &format!(
                    "INSERT INTO {} (remote_id, parent_local_id, fields, created_at, updated_at, \
                     last_synced_at, is_deleted, version) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    kind.table()
                ),
                libsql::params![
                    nullable(record.remote_id),
                    nullable(record.parent_local_id),
                    fields,
                    record.created_at,
                    record.updated_at.max(record.created_at),
                    nullable(record.last_synced_at),
                    i32::from(record.is_deleted),
                    record.version
                ],
            )
            .await?;
            conn.last_insert_rowid()
        };

        self.notify(kind);
        Ok(local_id)
    }

    /// Apply a partial update to a record.
    ///
    /// Returns `false`, writing nothing, when the patch is guarded by an
    /// `updated_at` the record no longer has.
    pub async fn update(
        &self,
        kind: EntityKind,
        local_id: i64,
        patch: RecordPatch,
    ) -> Result<bool> {
        if patch.is_empty() {
            return Ok(true);
        }

        let applied = {
            let db = self.db.lock().await;
            let mut record = Self::fetch(&db, kind, local_id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("{kind} #{local_id}")))?;
            let expected = patch.expected_updated_at;
            if expected.is_some_and(|updated_at| updated_at != record.updated_at) {
                return Ok(false);
            }
            apply_patch(&mut record, patch);

            let affected = db
                .connection()
                .execute(
                    &format!(
                        "UPDATE {} SET remote_id = ?1, parent_local_id = ?2, fields = ?3, \
                         updated_at = ?4, last_synced_at = ?5, is_deleted = ?6, version = ?7 \
                         WHERE local_id = ?8 AND (?9 IS NULL OR updated_at = ?9)",
                        kind.table()
                    ),
                    libsql::params![
                        nullable(record.remote_id),
                        nullable(record.parent_local_id),
                        serde_json::to_string(&record.fields)?,
                        record.updated_at,
                        nullable(record.last_synced_at),
                        i32::from(record.is_deleted),
                        record.version,
                        local_id,
                        nullable(expected)
                    ],
                )
                .await?;
            affected > 0
        };

        if applied {
            self.notify(kind);
        }
        Ok(applied)
    }

    /// Hard-delete a record.
    pub async fn delete(&self, kind: EntityKind, local_id: i64) -> Result<()> {
        let affected = {
            let db = self.db.lock().await;
            db.connection()
                .execute(
                    &format!("DELETE FROM {} WHERE local_id = ?1", kind.table()),
                    libsql::params![local_id],
                )
                .await?
        };

        if affected == 0 {
            return Err(Error::NotFound(format!("{kind} #{local_id}")));
        }

        self.notify(kind);
        Ok(())
    }

    /// Hard-delete a record unless it was modified after `updated_at`.
    ///
    /// Returns whether a row was removed.
    pub async fn delete_if_unchanged(
        &self,
        kind: EntityKind,
        local_id: i64,
        updated_at: i64,
    ) -> Result<bool> {
        let affected = {
            let db = self.db.lock().await;
            db.connection()
                .execute(
                    &format!(
                        "DELETE FROM {} WHERE local_id = ?1 AND updated_at = ?2",
                        kind.table()
                    ),
                    libsql::params![local_id, updated_at],
                )
                .await?
        };

        if affected == 0 {
            return Ok(false);
        }

        self.notify(kind);
        Ok(true)
    }

    /// Number of records that still have to be pushed.
    pub async fn pending_count(&self, kind: EntityKind) -> Result<usize> {
        let db = self.db.lock().await;
        let mut rows = db
            .connection()
            .query(
                &format!(
                    "SELECT COUNT(*) FROM {}
                     WHERE remote_id IS NULL
                        OR last_synced_at IS NULL
                        OR updated_at > last_synced_at",
                    kind.table()
                ),
                (),
            )
            .await?;

        let count = match rows.next().await? {
            Some(row) => row.get::<i64>(0)?,
            None => 0,
        };
        usize::try_from(count).map_err(|error| Error::Storage(error.to_string()))
    }

    /// Subscribe to snapshots of a kind.
    ///
    /// The first call to [`Subscription::next`] yields the current snapshot;
    /// each later call waits for a committed mutation and yields a fresh one.
    pub fn subscribe(&self, kind: EntityKind) -> Subscription {
        Subscription {
            store: self.clone(),
            kind,
            changes: self.changes.subscribe(),
            primed: false,
        }
    }

    fn notify(&self, kind: EntityKind) {
        // Ignore send errors (no subscribers)
        let _ = self.changes.send(kind);
    }

    async fn fetch(db: &Database, kind: EntityKind, local_id: i64) -> Result<Option<LocalRecord>> {
        let mut rows = db
            .connection()
            .query(
                &format!("SELECT {COLUMNS} FROM {} WHERE local_id = ?1", kind.table()),
                libsql::params![local_id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => parse_record(kind, &row).map(Some),
            None => Ok(None),
        }
    }
}

/// A lazy, restartable sequence of snapshots of one entity kind.
///
/// Dropping the subscription unsubscribes.
pub struct Subscription {
    store: LocalStore,
    kind: EntityKind,
    changes: broadcast::Receiver<EntityKind>,
    primed: bool,
}

impl Subscription {
    /// Kind this subscription follows.
    pub const fn kind(&self) -> EntityKind {
        self.kind
    }

    /// Wait for the next snapshot.
    ///
    /// Returns `None` once the store's change feed is closed.
    pub async fn next(&mut self) -> Option<Result<Vec<LocalRecord>>> {
        if self.primed {
            loop {
                match self.changes.recv().await {
                    Ok(kind) if kind == self.kind => break,
                    Ok(_) => {}
                    // Missed notifications collapse into one re-read
                    Err(broadcast::error::RecvError::Lagged(_)) => break,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
            // Coalesce a burst of commits into a single snapshot
            while self.changes.try_recv().is_ok() {}
        }

        self.primed = true;
        Some(self.store.get_all(self.kind).await)
    }

    /// Restart from the current snapshot on the next call to `next`.
    pub fn restart(&mut self) {
        self.changes = self.changes.resubscribe();
        self.primed = false;
    }

    /// Stop receiving snapshots.
    pub fn unsubscribe(self) {}
}

fn nullable(value: Option<i64>) -> Value {
    value.map_or(Value::Null, Value::Integer)
}

fn optional_i64(row: &Row, idx: i32) -> Result<Option<i64>> {
    match row.get_value(idx)? {
        Value::Null => Ok(None),
        Value::Integer(value) => Ok(Some(value)),
        other => Err(Error::Storage(format!(
            "expected integer in column {idx}, found {other:?}"
        ))),
    }
}

fn parse_record(kind: EntityKind, row: &Row) -> Result<LocalRecord> {
    let fields: String = row.get(3)?;
    let fields: Fields = serde_json::from_str(&fields)?;
    Ok(LocalRecord {
        local_id: row.get(0)?,
        kind,
        remote_id: optional_i64(row, 1)?,
        parent_local_id: optional_i64(row, 2)?,
        fields,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
        last_synced_at: optional_i64(row, 6)?,
        is_deleted: row.get::<i32>(7)? != 0,
        version: row.get(8)?,
    })
}

fn apply_patch(record: &mut LocalRecord, patch: RecordPatch) {
    if let Some(remote_id) = patch.remote_id {
        record.remote_id = Some(remote_id);
    }
    if let Some(parent_local_id) = patch.parent_local_id {
        record.parent_local_id = parent_local_id;
    }
    if let Some(fields) = patch.fields {
        record.fields = fields;
    }
    if let Some(updated_at) = patch.updated_at {
        record.updated_at = updated_at;
    }
    if let Some(last_synced_at) = patch.last_synced_at {
        record.last_synced_at = Some(last_synced_at);
    }
    if let Some(is_deleted) = patch.is_deleted {
        record.is_deleted = is_deleted;
    }
    if let Some(version) = patch.version {
        record.version = version;
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn fields(value: serde_json::Value) -> Fields {
        match value {
            serde_json::Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    async fn setup() -> LocalStore {
        LocalStore::open_in_memory().await.unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_add_and_get() {
        let store = setup().await;
        let new = NewRecord::new(fields(json!({ "name": "Crunchyroll" })));

        let local_id = store.add(EntityKind::WatchSource, new.clone()).await.unwrap();
        let fetched = store
            .get(EntityKind::WatchSource, local_id)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(fetched.local_id, local_id);
        assert_eq!(fetched.kind, EntityKind::WatchSource);
        assert_eq!(fetched.remote_id, None);
        assert_eq!(fetched.last_synced_at, None);
        assert_eq!(fetched.fields, new.fields);
        assert_eq!(fetched.text("name"), Some("Crunchyroll"));
        assert!(!fetched.is_deleted);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_kinds_are_isolated() {
        let store = setup().await;
        store
            .add(EntityKind::Category, NewRecord::new(Fields::new()))
            .await
            .unwrap();

        assert_eq!(store.get_all(EntityKind::Category).await.unwrap().len(), 1);
        assert!(store.get_all(EntityKind::Review).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_update_applies_only_patched_columns() {
        let store = setup().await;
        let local_id = store
            .add(
                EntityKind::WatchSource,
                NewRecord::new(fields(json!({ "name": "Netflix" }))).with_timestamps(10, 20),
            )
            .await
            .unwrap();

        store
            .update(
                EntityKind::WatchSource,
                local_id,
                RecordPatch::default().remote_id(101).last_synced_at(30),
            )
            .await
            .unwrap();

        let record = store
            .get(EntityKind::WatchSource, local_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.remote_id, Some(101));
        assert_eq!(record.last_synced_at, Some(30));
        assert_eq!(record.updated_at, 20);
        assert_eq!(record.text("name"), Some("Netflix"));
        assert_eq!(record.version, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_update_missing_record_is_not_found() {
        let store = setup().await;
        let err = store
            .update(
                EntityKind::Run,
                42,
                RecordPatch::default().is_deleted(true),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_guarded_update_skips_newer_records() {
        let store = setup().await;
        let local_id = store
            .add(
                EntityKind::Category,
                NewRecord::new(fields(json!({ "name": "Anime" }))).with_timestamps(10, 20),
            )
            .await
            .unwrap();

        let stale = store
            .update(
                EntityKind::Category,
                local_id,
                RecordPatch::default().last_synced_at(99).if_updated_at(15),
            )
            .await
            .unwrap();
        assert!(!stale);
        let record = store.get(EntityKind::Category, local_id).await.unwrap().unwrap();
        assert_eq!(record.last_synced_at, None);

        let current = store
            .update(
                EntityKind::Category,
                local_id,
                RecordPatch::default().last_synced_at(99).if_updated_at(20),
            )
            .await
            .unwrap();
        assert!(current);
        let record = store.get(EntityKind::Category, local_id).await.unwrap().unwrap();
        assert_eq!(record.last_synced_at, Some(99));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_guarded_delete_keeps_edited_records() {
        let store = setup().await;
        let local_id = store
            .add(
                EntityKind::Run,
                NewRecord::new(Fields::new()).with_timestamps(10, 20),
            )
            .await
            .unwrap();

        assert!(!store
            .delete_if_unchanged(EntityKind::Run, local_id, 10)
            .await
            .unwrap());
        assert_eq!(store.get_all(EntityKind::Run).await.unwrap().len(), 1);

        assert!(store
            .delete_if_unchanged(EntityKind::Run, local_id, 20)
            .await
            .unwrap());
        assert!(store.get_all(EntityKind::Run).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_delete_is_hard() {
        let store = setup().await;
        let local_id = store
            .add(EntityKind::Review, NewRecord::new(Fields::new()).deleted())
            .await
            .unwrap();

        assert_eq!(store.list_live(EntityKind::Review).await.unwrap().len(), 0);
        assert_eq!(store.get_all(EntityKind::Review).await.unwrap().len(), 1);

        store.delete(EntityKind::Review, local_id).await.unwrap();
        assert!(store.get_all(EntityKind::Review).await.unwrap().is_empty());
        assert!(matches!(
            store.delete(EntityKind::Review, local_id).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_pending_count_tracks_watermark() {
        let store = setup().await;
        let synced = NewRecord::new(Fields::new())
            .with_remote_id(7)
            .with_timestamps(1, 5)
            .synced_at(5);
        let dirty = NewRecord::new(Fields::new())
            .with_remote_id(8)
            .with_timestamps(1, 9)
            .synced_at(5);

        store.add(EntityKind::Category, synced).await.unwrap();
        store.add(EntityKind::Category, dirty).await.unwrap();
        store
            .add(EntityKind::Category, NewRecord::new(Fields::new()))
            .await
            .unwrap();

        assert_eq!(store.pending_count(EntityKind::Category).await.unwrap(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_subscription_replays_then_follows_commits() {
        let store = setup().await;
        store
            .add(EntityKind::MediaItem, NewRecord::new(Fields::new()))
            .await
            .unwrap();

        let mut subscription = store.subscribe(EntityKind::MediaItem);
        let first = subscription.next().await.unwrap().unwrap();
        assert_eq!(first.len(), 1);

        store
            .add(EntityKind::Category, NewRecord::new(Fields::new()))
            .await
            .unwrap();
        store
            .add(EntityKind::MediaItem, NewRecord::new(Fields::new()))
            .await
            .unwrap();

        let second = subscription.next().await.unwrap().unwrap();
        assert_eq!(second.len(), 2);
        assert!(second
            .iter()
            .all(|record| record.kind == EntityKind::MediaItem));

        subscription.restart();
        let replay = subscription.next().await.unwrap().unwrap();
        assert_eq!(replay.len(), 2);
        subscription.unsubscribe();
    }
}
