//! In-process remote store, used by tests and offline demos.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{RemoteError, RemoteResult};
use crate::util::{format_timestamp, now_millis};

use super::{RemoteFilter, RemoteRow, RemoteStore, RowPayload};

const FIRST_ID: i64 = 101;

/// Number of writes the store has accepted through the `RemoteStore` API.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteCounts {
    pub inserts: usize,
    pub updates: usize,
    pub deletes: usize,
}

impl WriteCounts {
    pub const fn total(&self) -> usize {
        self.inserts + self.updates + self.deletes
    }
}

#[derive(Debug)]
struct MemoryState {
    tables: HashMap<String, BTreeMap<i64, RemoteRow>>,
    next_id: i64,
    writes: WriteCounts,
    failing_reads: HashMap<String, RemoteError>,
    failing_writes: HashMap<String, RemoteError>,
}

impl Default for MemoryState {
    fn default() -> Self {
        Self {
            tables: HashMap::new(),
            next_id: FIRST_ID,
            writes: WriteCounts::default(),
            failing_reads: HashMap::new(),
            failing_writes: HashMap::new(),
        }
    }
}

/// A remote store held in process memory.
///
/// Ids are assigned from 101 upward, shared across tables. Rows seeded or
/// edited through the inherent helpers simulate another device and are not
/// counted as writes.
#[derive(Debug, Default)]
pub struct InMemoryRemoteStore {
    state: Mutex<MemoryState>,
}

impl InMemoryRemoteStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a row as if another client had written it.
    pub fn seed(&self, table: &str, payload: RowPayload) -> RemoteRow {
        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;
        let row = build_row(id, payload);
        state
            .tables
            .entry(table.to_string())
            .or_default()
            .insert(id, row.clone());
        row
    }

    /// Overwrite columns of a row as if another client had edited it.
    pub fn edit(&self, table: &str, remote_id: i64, payload: RowPayload) -> Option<RemoteRow> {
        let mut state = self.lock();
        let existing = state.tables.get_mut(table)?.get_mut(&remote_id)?;
        merge_row(existing, payload);
        Some(existing.clone())
    }

    /// Remove a row as if another client had deleted it.
    pub fn remove(&self, table: &str, remote_id: i64) -> Option<RemoteRow> {
        self.lock().tables.get_mut(table)?.remove(&remote_id)
    }

    /// Current rows of a table, ordered by id.
    pub fn rows(&self, table: &str) -> Vec<RemoteRow> {
        self.lock()
            .tables
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// A single row by id.
    pub fn row(&self, table: &str, remote_id: i64) -> Option<RemoteRow> {
        self.lock().tables.get(table)?.get(&remote_id).cloned()
    }

    /// Writes accepted so far.
    pub fn writes(&self) -> WriteCounts {
        self.lock().writes
    }

    /// Make every `select` on the table fail with the given error.
    pub fn fail_reads(&self, table: &str, error: RemoteError) {
        self.lock().failing_reads.insert(table.to_string(), error);
    }

    /// Make every insert/update/delete on the table fail with the given error.
    pub fn fail_writes(&self, table: &str, error: RemoteError) {
        self.lock().failing_writes.insert(table.to_string(), error);
    }

    /// Remove all injected failures.
    pub fn clear_failures(&self) {
        let mut state = self.lock();
        state.failing_reads.clear();
        state.failing_writes.clear();
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemoteStore {
    async fn select(&self, table: &str, filter: &RemoteFilter) -> RemoteResult<Vec<RemoteRow>> {
        let state = self.lock();
        if let Some(error) = state.failing_reads.get(table) {
            return Err(error.clone());
        }
        Ok(state
            .tables
            .get(table)
            .map(|rows| {
                rows.values()
                    .filter(|row| filter.matches(row))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn insert(&self, table: &str, row: RowPayload) -> RemoteResult<RemoteRow> {
        let mut state = self.lock();
        if let Some(error) = state.failing_writes.get(table) {
            return Err(error.clone());
        }
        let id = state.next_id;
        state.next_id += 1;
        let row = build_row(id, row);
        state
            .tables
            .entry(table.to_string())
            .or_default()
            .insert(id, row.clone());
        state.writes.inserts += 1;
        Ok(row)
    }

    async fn update(
        &self,
        table: &str,
        remote_id: i64,
        fields: RowPayload,
    ) -> RemoteResult<RemoteRow> {
        let mut state = self.lock();
        if let Some(error) = state.failing_writes.get(table) {
            return Err(error.clone());
        }
        let existing = state
            .tables
            .get_mut(table)
            .and_then(|rows| rows.get_mut(&remote_id))
            .ok_or_else(|| RemoteError::Validation(format!("{table} row {remote_id} not found")))?;
        merge_row(existing, fields);
        let updated = existing.clone();
        state.writes.updates += 1;
        Ok(updated)
    }

    async fn delete(&self, table: &str, remote_id: i64) -> RemoteResult<()> {
        let mut state = self.lock();
        if let Some(error) = state.failing_writes.get(table) {
            return Err(error.clone());
        }
        if let Some(rows) = state.tables.get_mut(table) {
            rows.remove(&remote_id);
        }
        state.writes.deletes += 1;
        Ok(())
    }
}

fn take_string(payload: &mut RowPayload, key: &str) -> Option<String> {
    match payload.remove(key) {
        Some(Value::String(value)) => Some(value),
        _ => None,
    }
}

fn build_row(id: i64, mut payload: RowPayload) -> RemoteRow {
    let stamp = format_timestamp(now_millis());
    payload.remove("id");
    let created_at = take_string(&mut payload, "created_at").unwrap_or_else(|| stamp.clone());
    let updated_at = take_string(&mut payload, "updated_at").unwrap_or(stamp);
    let is_deleted = payload
        .remove("is_deleted")
        .and_then(|value| value.as_bool())
        .unwrap_or(false);

    RemoteRow {
        id,
        created_at,
        updated_at,
        is_deleted,
        columns: payload,
    }
}

fn merge_row(row: &mut RemoteRow, mut payload: RowPayload) {
    payload.remove("id");
    payload.remove("created_at");
    row.updated_at = take_string(&mut payload, "updated_at")
        .unwrap_or_else(|| format_timestamp(now_millis()));
    if let Some(is_deleted) = payload.remove("is_deleted").and_then(|value| value.as_bool()) {
        row.is_deleted = is_deleted;
    }
    row.columns.extend(payload);
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn payload(value: Value) -> RowPayload {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {other}"),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn insert_assigns_ids_from_101() {
        let store = InMemoryRemoteStore::new();
        let first = store
            .insert("watch_sources", payload(json!({ "name": "Crunchyroll" })))
            .await
            .unwrap();
        let second = store
            .insert("categories", payload(json!({ "name": "Shonen" })))
            .await
            .unwrap();

        assert_eq!(first.id, 101);
        assert_eq!(second.id, 102);
        assert_eq!(store.writes().inserts, 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn update_merges_columns_and_honours_timestamp() {
        let store = InMemoryRemoteStore::new();
        let row = store.seed(
            "reviews",
            payload(json!({ "rating": 3.0, "body": "ok", "media_item_id": 101 })),
        );

        let updated = store
            .update(
                "reviews",
                row.id,
                payload(json!({ "rating": 4.5, "updated_at": "2030-01-01T00:00:00.000Z" })),
            )
            .await
            .unwrap();

        assert_eq!(updated.columns.get("rating"), Some(&json!(4.5)));
        assert_eq!(updated.columns.get("body"), Some(&json!("ok")));
        assert_eq!(updated.updated_at, "2030-01-01T00:00:00.000Z");
        assert_eq!(store.writes(), WriteCounts { inserts: 0, updates: 1, deletes: 0 });
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn update_of_missing_row_is_a_validation_error() {
        let store = InMemoryRemoteStore::new();
        let err = store
            .update("runs", 999, RowPayload::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::Validation(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn injected_failures_apply_per_table() {
        let store = InMemoryRemoteStore::new();
        store.fail_writes("runs", RemoteError::Network("offline".to_string()));

        assert!(store.insert("runs", RowPayload::new()).await.is_err());
        assert!(store.insert("reviews", RowPayload::new()).await.is_ok());
        assert!(store.select("runs", &RemoteFilter::all()).await.is_ok());

        store.clear_failures();
        assert!(store.insert("runs", RowPayload::new()).await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn helpers_simulate_other_devices_without_counting_writes() {
        let store = InMemoryRemoteStore::new();
        let row = store.seed("categories", payload(json!({ "name": "Seinen" })));
        store.edit("categories", row.id, payload(json!({ "name": "Josei" })));

        assert_eq!(
            store.row("categories", row.id).unwrap().columns.get("name"),
            Some(&json!("Josei"))
        );
        assert!(store.remove("categories", row.id).is_some());
        assert!(store.rows("categories").is_empty());
        assert_eq!(store.writes().total(), 0);
    }
}
