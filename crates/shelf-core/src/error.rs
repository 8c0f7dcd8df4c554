//! Error types for shelf-core

use thiserror::Error;

use crate::models::EntityKind;

/// Result type alias using shelf-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in shelf-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Local storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// libSQL error
    #[error("libSQL error: {0}")]
    LibSql(#[from] libsql::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Record not found
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Remote store call failed
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

/// Failures of a single remote round trip.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Transport failure, timeout or server-side fault
    #[error("Network error: {0}")]
    Network(String),

    /// The caller is not allowed to touch the row or table
    #[error("Permission denied: {0}")]
    Permission(String),

    /// The backend rejected the payload or the row does not exist
    #[error("Validation failed: {0}")]
    Validation(String),
}

impl From<reqwest::Error> for RemoteError {
    fn from(error: reqwest::Error) -> Self {
        Self::Network(error.to_string())
    }
}

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// Soft signals that postpone a record to the next cycle.
///
/// These are never surfaced as errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDeferral {
    /// A local parent has no remote id yet, so the child cannot be pushed.
    MappingUnresolved { parent: EntityKind, local_id: i64 },
    /// A remote parent has not been materialised locally yet.
    DependencyNotReady { parent: EntityKind, remote_id: i64 },
    /// The record was edited locally while its sync was in flight.
    LocalEditPending { kind: EntityKind, local_id: i64 },
}

impl std::fmt::Display for SyncDeferral {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MappingUnresolved { parent, local_id } => {
                write!(f, "{parent} #{local_id} has no remote id yet")
            }
            Self::DependencyNotReady { parent, remote_id } => {
                write!(f, "{parent} remote #{remote_id} is not present locally yet")
            }
            Self::LocalEditPending { kind, local_id } => {
                write!(f, "{kind} #{local_id} changed during sync")
            }
        }
    }
}
