//! Canonical backend abstraction
//!
//! Every call is an independent round trip. There is no cross-row
//! transactionality: callers must tolerate partially applied cycles.

mod memory;
mod supabase;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::RemoteResult;
use crate::util::parse_timestamp;

pub use memory::{InMemoryRemoteStore, WriteCounts};
pub use supabase::SupabaseRemoteStore;

/// Column values sent with an insert or update.
pub type RowPayload = Map<String, Value>;

/// A row as returned by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRow {
    /// Remote-assigned primary key
    pub id: i64,
    /// ISO-8601 creation timestamp
    pub created_at: String,
    /// ISO-8601 timestamp bumped on every remote mutation
    pub updated_at: String,
    #[serde(default)]
    pub is_deleted: bool,
    /// Entity-specific and foreign-key columns
    #[serde(flatten)]
    pub columns: Map<String, Value>,
}

impl RemoteRow {
    /// `updated_at` as Unix milliseconds.
    pub fn updated_at_millis(&self) -> Option<i64> {
        parse_timestamp(&self.updated_at)
    }

    /// `created_at` as Unix milliseconds.
    pub fn created_at_millis(&self) -> Option<i64> {
        parse_timestamp(&self.created_at)
    }

    /// Integer value of a foreign-key column.
    pub fn foreign_key(&self, column: &str) -> Option<i64> {
        self.columns.get(column).and_then(Value::as_i64)
    }
}

/// Equality conditions applied to a `select`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteFilter {
    conditions: Vec<(String, Value)>,
}

impl RemoteFilter {
    /// Match every row.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Require `column == value`.
    #[must_use]
    pub fn eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.push((column.into(), value.into()));
        self
    }

    pub fn conditions(&self) -> &[(String, Value)] {
        &self.conditions
    }

    /// Whether a row satisfies every condition.
    pub fn matches(&self, row: &RemoteRow) -> bool {
        self.conditions.iter().all(|(column, expected)| {
            let actual = match column.as_str() {
                "id" => Value::from(row.id),
                "is_deleted" => Value::Bool(row.is_deleted),
                "created_at" => Value::String(row.created_at.clone()),
                "updated_at" => Value::String(row.updated_at.clone()),
                other => row.columns.get(other).cloned().unwrap_or(Value::Null),
            };
            &actual == expected
        })
    }

    /// PostgREST query pairs (`column=eq.value`).
    pub(crate) fn query_pairs(&self) -> Vec<(String, String)> {
        self.conditions
            .iter()
            .map(|(column, value)| {
                let operand = match value {
                    Value::Null => "is.null".to_string(),
                    Value::String(text) => format!("eq.{text}"),
                    other => format!("eq.{other}"),
                };
                (column.clone(), operand)
            })
            .collect()
    }
}

/// Table-like access to the canonical backend.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Fetch the rows of a table matching the filter.
    async fn select(&self, table: &str, filter: &RemoteFilter) -> RemoteResult<Vec<RemoteRow>>;

    /// Insert a row and return it with its server-assigned id.
    async fn insert(&self, table: &str, row: RowPayload) -> RemoteResult<RemoteRow>;

    /// Update columns of one row and return the stored row.
    async fn update(
        &self,
        table: &str,
        remote_id: i64,
        fields: RowPayload,
    ) -> RemoteResult<RemoteRow>;

    /// Hard-delete one row.
    async fn delete(&self, table: &str, remote_id: i64) -> RemoteResult<()>;
}
