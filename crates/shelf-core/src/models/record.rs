//! Synchronizable record model

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::util::now_millis;

use super::entity::EntityKind;

/// Mirrored field set of a record, keyed by local field names.
pub type Fields = Map<String, Value>;

/// A record as persisted in the local store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalRecord {
    /// Identity in the local store
    pub local_id: i64,
    pub kind: EntityKind,
    /// Identity in the remote store, `None` until first successful push
    pub remote_id: Option<i64>,
    /// Local id of the owning record, if any
    pub parent_local_id: Option<i64>,
    pub fields: Fields,
    /// Creation timestamp (Unix ms)
    pub created_at: i64,
    /// Last mutation timestamp (Unix ms)
    pub updated_at: i64,
    /// Watermark: last time this record matched the remote side (Unix ms)
    pub last_synced_at: Option<i64>,
    /// Soft delete flag for sync
    pub is_deleted: bool,
    /// Local revision counter
    pub version: i64,
}

impl LocalRecord {
    /// Whether the record changed since it was last reconciled.
    pub fn changed_since_sync(&self) -> bool {
        self.last_synced_at
            .map_or(true, |watermark| self.updated_at > watermark)
    }

    /// Text value of a field.
    pub fn text(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(Value::as_str)
    }
}

/// Values for a record about to be inserted into the local store.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRecord {
    pub remote_id: Option<i64>,
    pub parent_local_id: Option<i64>,
    pub fields: Fields,
    pub created_at: i64,
    pub updated_at: i64,
    pub last_synced_at: Option<i64>,
    pub is_deleted: bool,
    pub version: i64,
}

impl NewRecord {
    /// A fresh, never-synced record stamped with the current time.
    #[must_use]
    pub fn new(fields: Fields) -> Self {
        let now = now_millis();
        Self {
            remote_id: None,
            parent_local_id: None,
            fields,
            created_at: now,
            updated_at: now,
            last_synced_at: None,
            is_deleted: false,
            version: 1,
        }
    }

    #[must_use]
    pub const fn with_parent(mut self, parent_local_id: Option<i64>) -> Self {
        self.parent_local_id = parent_local_id;
        self
    }

    #[must_use]
    pub const fn with_remote_id(mut self, remote_id: i64) -> Self {
        self.remote_id = Some(remote_id);
        self
    }

    #[must_use]
    pub const fn with_timestamps(mut self, created_at: i64, updated_at: i64) -> Self {
        self.created_at = created_at;
        self.updated_at = updated_at;
        self
    }

    #[must_use]
    pub const fn synced_at(mut self, last_synced_at: i64) -> Self {
        self.last_synced_at = Some(last_synced_at);
        self
    }

    #[must_use]
    pub const fn deleted(mut self) -> Self {
        self.is_deleted = true;
        self
    }
}

/// Partial update of a local record; `None` leaves a column untouched.
///
/// A patch carrying `expected_updated_at` only applies while the stored
/// record still has that `updated_at`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordPatch {
    pub expected_updated_at: Option<i64>,
    pub remote_id: Option<i64>,
    pub parent_local_id: Option<Option<i64>>,
    pub fields: Option<Fields>,
    pub updated_at: Option<i64>,
    pub last_synced_at: Option<i64>,
    pub is_deleted: Option<bool>,
    pub version: Option<i64>,
}

impl RecordPatch {
    /// Apply only if the record was not modified since it was read.
    #[must_use]
    pub const fn if_updated_at(mut self, updated_at: i64) -> Self {
        self.expected_updated_at = Some(updated_at);
        self
    }

    #[must_use]
    pub const fn remote_id(mut self, remote_id: i64) -> Self {
        self.remote_id = Some(remote_id);
        self
    }

    #[must_use]
    pub const fn parent_local_id(mut self, parent_local_id: Option<i64>) -> Self {
        self.parent_local_id = Some(parent_local_id);
        self
    }

    #[must_use]
    pub fn fields(mut self, fields: Fields) -> Self {
        self.fields = Some(fields);
        self
    }

    #[must_use]
    pub const fn updated_at(mut self, updated_at: i64) -> Self {
        self.updated_at = Some(updated_at);
        self
    }

    #[must_use]
    pub const fn last_synced_at(mut self, last_synced_at: i64) -> Self {
        self.last_synced_at = Some(last_synced_at);
        self
    }

    #[must_use]
    pub const fn is_deleted(mut self, is_deleted: bool) -> Self {
        self.is_deleted = Some(is_deleted);
        self
    }

    #[must_use]
    pub const fn version(mut self, version: i64) -> Self {
        self.version = Some(version);
        self
    }

    /// Whether the patch changes nothing. The guard is not a change.
    pub const fn is_empty(&self) -> bool {
        self.remote_id.is_none()
            && self.parent_local_id.is_none()
            && self.fields.is_none()
            && self.updated_at.is_none()
            && self.last_synced_at.is_none()
            && self.is_deleted.is_none()
            && self.version.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(updated_at: i64, last_synced_at: Option<i64>) -> LocalRecord {
        LocalRecord {
            local_id: 1,
            kind: EntityKind::WatchSource,
            remote_id: None,
            parent_local_id: None,
            fields: Fields::new(),
            created_at: 0,
            updated_at,
            last_synced_at,
            is_deleted: false,
            version: 1,
        }
    }

    #[test]
    fn never_synced_record_counts_as_changed() {
        assert!(record(10, None).changed_since_sync());
    }

    #[test]
    fn watermark_at_or_after_update_is_converged() {
        assert!(!record(10, Some(10)).changed_since_sync());
        assert!(!record(10, Some(11)).changed_since_sync());
        assert!(record(12, Some(11)).changed_since_sync());
    }

    #[test]
    fn new_record_starts_unsynced() {
        let new = NewRecord::new(Fields::new());
        assert_eq!(new.remote_id, None);
        assert_eq!(new.last_synced_at, None);
        assert_eq!(new.created_at, new.updated_at);
        assert_eq!(new.version, 1);
        assert!(!new.is_deleted);
    }

    #[test]
    fn empty_patch_is_detected() {
        assert!(RecordPatch::default().is_empty());
        assert!(!RecordPatch::default().last_synced_at(5).is_empty());
        assert!(RecordPatch::default().if_updated_at(5).is_empty());
    }
}
