//! Outcome counters of sync runs.

use std::fmt;
use std::ops::AddAssign;

use crate::models::EntityKind;

/// What one reconciliation cycle did for one entity kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdapterReport {
    /// Local records inserted remotely
    pub inserted: usize,
    /// Remote rows overwritten by a newer local record
    pub updated_remote: usize,
    /// Remote rows deleted after a local tombstone won
    pub deleted_remote: usize,
    /// Local records overwritten by a newer remote row
    pub applied_local: usize,
    /// Remote rows materialised locally
    pub pulled: usize,
    /// Local records purged
    pub purged: usize,
    /// Records whose watermark advanced without any data change
    pub converged: usize,
    pub deferred: usize,
    pub failed: usize,
}

impl AdapterReport {
    /// Writes issued against the remote store.
    pub const fn remote_writes(&self) -> usize {
        self.inserted + self.updated_remote + self.deleted_remote
    }

    /// Writes committed to the local store.
    pub const fn local_writes(&self) -> usize {
        self.inserted
            + self.updated_remote
            + self.deleted_remote
            + self.applied_local
            + self.pulled
            + self.purged
            + self.converged
    }
}

impl AddAssign for AdapterReport {
    fn add_assign(&mut self, other: Self) {
        self.inserted += other.inserted;
        self.updated_remote += other.updated_remote;
        self.deleted_remote += other.deleted_remote;
        self.applied_local += other.applied_local;
        self.pulled += other.pulled;
        self.purged += other.purged;
        self.converged += other.converged;
        self.deferred += other.deferred;
        self.failed += other.failed;
    }
}

impl fmt::Display for AdapterReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} pushed, {} updated, {} deleted remotely, {} applied, {} pulled, {} purged, \
             {} deferred, {} failed",
            self.inserted,
            self.updated_remote,
            self.deleted_remote,
            self.applied_local,
            self.pulled,
            self.purged,
            self.deferred,
            self.failed
        )
    }
}

/// Outcome of one orchestration run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Completed adapters, in the order they ran
    pub adapters: Vec<(EntityKind, AdapterReport)>,
    /// Adapters that could not fetch their snapshots
    pub aborted: Vec<EntityKind>,
    /// The run was skipped because nobody is signed in
    pub skipped: bool,
}

impl SyncReport {
    pub(crate) fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }

    /// Report of one kind, if its adapter completed.
    pub fn get(&self, kind: EntityKind) -> Option<&AdapterReport> {
        self.adapters
            .iter()
            .find(|(adapter_kind, _)| *adapter_kind == kind)
            .map(|(_, report)| report)
    }

    /// Counters summed over every completed adapter.
    pub fn total(&self) -> AdapterReport {
        let mut total = AdapterReport::default();
        for (_, report) in &self.adapters {
            total += *report;
        }
        total
    }

    /// Whether any adapter aborted or any record failed.
    pub fn has_failures(&self) -> bool {
        !self.aborted.is_empty() || self.adapters.iter().any(|(_, report)| report.failed > 0)
    }
}
