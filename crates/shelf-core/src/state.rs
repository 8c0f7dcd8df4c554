//! Shared cross-platform state types.

/// Unified sync state published by the orchestrator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    Offline,
    Syncing,
    Synced,
    Error,
}

/// Authentication state as reported by the hosting application.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthState {
    SignedOut,
    SignedIn,
}
