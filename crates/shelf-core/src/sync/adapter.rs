//! Reconciliation of one entity kind between the local and remote store.
//!
//! A cycle fetches both snapshots, runs the push pass over every local
//! record, then the pull pass over remote rows nobody claimed locally.
//! Conflicts resolve last-writer-wins on `updated_at`, gated by the
//! record's watermark (`last_synced_at`). Record-level failures are logged
//! and counted; the cycle carries on with the remaining records.
//!
//! Every local write made here is guarded by the snapshot's `updated_at`.
//! A record edited by the user while its sync is in flight is left alone
//! and deferred, so the edit is reconciled by the next cycle.

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use crate::db::LocalStore;
use crate::error::{Error, RemoteError, SyncDeferral};
use crate::models::{EntityKind, EntitySpec, LocalRecord, NewRecord, RecordPatch};
use crate::remote::{RemoteFilter, RemoteRow, RemoteStore, RowPayload};
use crate::util::{format_timestamp, now_millis};
use crate::Result;

use super::{AdapterReport, IdentityMap};

/// What reconciling a single record did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Inserted,
    UpdatedRemote,
    DeletedRemote,
    AppliedLocal,
    Pulled,
    Purged,
    Converged,
    Unchanged,
    Deferred(SyncDeferral),
}

/// Remote foreign key of a local record.
enum RemoteParent {
    Unlinked,
    Resolved {
        column: &'static str,
        remote_id: Option<i64>,
    },
    Deferred(SyncDeferral),
}

/// Local parent of a remote row.
enum LocalParent {
    Resolved(Option<i64>),
    Deferred(SyncDeferral),
}

/// Push/pull reconciler for one entity kind.
pub struct EntitySyncAdapter<'a, R: RemoteStore + ?Sized> {
    spec: &'a EntitySpec,
    local: &'a LocalStore,
    remote: &'a R,
    identity: &'a IdentityMap,
}

impl<'a, R: RemoteStore + ?Sized> EntitySyncAdapter<'a, R> {
    pub const fn new(
        spec: &'a EntitySpec,
        local: &'a LocalStore,
        remote: &'a R,
        identity: &'a IdentityMap,
    ) -> Self {
        Self {
            spec,
            local,
            remote,
            identity,
        }
    }

    pub const fn kind(&self) -> EntityKind {
        self.spec.kind
    }

    /// Run one full cycle.
    ///
    /// Fails only when a snapshot cannot be fetched.
    pub async fn reconcile(&self) -> Result<AdapterReport> {
        let kind = self.kind();
        let local = self.local.get_all(kind).await?;
        let remote = self
            .remote
            .select(self.spec.table, &RemoteFilter::all())
            .await?;
        self.identity.absorb(kind, &local);

        let mut report = AdapterReport::default();
        let remote_by_id: HashMap<i64, &RemoteRow> =
            remote.iter().map(|row| (row.id, row)).collect();

        for record in &local {
            let row = record
                .remote_id
                .and_then(|remote_id| remote_by_id.get(&remote_id).copied());
            let outcome = self.push_record(record, row).await;
            self.tally(&mut report, &format!("#{}", record.local_id), outcome);
        }

        let claimed: HashSet<i64> = local.iter().filter_map(|record| record.remote_id).collect();
        for row in remote.iter().filter(|row| !claimed.contains(&row.id)) {
            let outcome = self.pull_row(row).await;
            self.tally(&mut report, &format!("row {}", row.id), outcome);
        }

        tracing::debug!("Reconciled {kind}: {report}");
        Ok(report)
    }

    fn tally(&self, report: &mut AdapterReport, subject: &str, outcome: Result<Step>) {
        let kind = self.kind();
        match outcome {
            Ok(Step::Inserted) => report.inserted += 1,
            Ok(Step::UpdatedRemote) => report.updated_remote += 1,
            Ok(Step::DeletedRemote) => report.deleted_remote += 1,
            Ok(Step::AppliedLocal) => report.applied_local += 1,
            Ok(Step::Pulled) => report.pulled += 1,
            Ok(Step::Purged) => report.purged += 1,
            Ok(Step::Converged) => report.converged += 1,
            Ok(Step::Unchanged) => {}
            Ok(Step::Deferred(deferral)) => {
                tracing::debug!("Deferring {kind} {subject}: {deferral}");
                report.deferred += 1;
            }
            Err(error) => {
                tracing::warn!("Skipping {kind} {subject}: {error}");
                report.failed += 1;
            }
        }
    }

    async fn push_record(&self, record: &LocalRecord, row: Option<&RemoteRow>) -> Result<Step> {
        if record.remote_id.is_none() {
            if record.is_deleted {
                // Never reached the remote store
                return self.purge(record).await;
            }
            return self.insert_remote(record).await;
        }

        let Some(row) = row else {
            // A missing remote row is a hard delete and always wins
            return self.purge(record).await;
        };

        let remote_updated = updated_millis(row)?;
        let local_changed = record.changed_since_sync();
        let remote_changed = record
            .last_synced_at
            .map_or(true, |watermark| remote_updated > watermark);

        if record.updated_at > remote_updated && local_changed {
            self.push_local(record, row, remote_updated).await
        } else if remote_updated > record.updated_at && remote_changed {
            self.apply_remote(record, row, remote_updated).await
        } else {
            Ok(Step::Unchanged)
        }
    }

    async fn insert_remote(&self, record: &LocalRecord) -> Result<Step> {
        let parent = match self.remote_parent(record)? {
            RemoteParent::Deferred(deferral) => return Ok(Step::Deferred(deferral)),
            parent => parent,
        };

        let mut payload = self.payload(record, &parent);
        payload.insert(
            "created_at".to_string(),
            Value::String(format_timestamp(record.created_at)),
        );
        let row = self.remote.insert(self.spec.table, payload).await?;

        let stored_updated = row.updated_at_millis().unwrap_or(record.updated_at);
        let synced = self
            .local
            .update(
                self.kind(),
                record.local_id,
                RecordPatch::default()
                    .remote_id(row.id)
                    .last_synced_at(watermark(&[record.updated_at, stored_updated]))
                    .if_updated_at(record.updated_at),
            )
            .await?;
        if !synced {
            // The row exists remotely either way; keep the edit pending
            self.local
                .update(
                    self.kind(),
                    record.local_id,
                    RecordPatch::default().remote_id(row.id),
                )
                .await?;
        }
        self.identity.bind(self.kind(), record.local_id, row.id);
        tracing::debug!("Pushed {} #{} as row {}", self.kind(), record.local_id, row.id);
        Ok(Step::Inserted)
    }

    async fn push_local(
        &self,
        record: &LocalRecord,
        row: &RemoteRow,
        remote_updated: i64,
    ) -> Result<Step> {
        if record.is_deleted {
            self.remote.delete(self.spec.table, row.id).await?;
            return Ok(match self.purge(record).await? {
                Step::Purged => Step::DeletedRemote,
                step => step,
            });
        }

        let parent = match self.remote_parent(record)? {
            RemoteParent::Deferred(deferral) => return Ok(Step::Deferred(deferral)),
            parent => parent,
        };

        if self.matches_row(record, row, &parent) {
            return self
                .mark_synced(
                    record,
                    watermark(&[record.updated_at, remote_updated]),
                    Step::Converged,
                )
                .await;
        }

        let stored = self
            .remote
            .update(self.spec.table, row.id, self.payload(record, &parent))
            .await?;
        let stored_updated = stored.updated_at_millis().unwrap_or(record.updated_at);
        self.mark_synced(
            record,
            watermark(&[record.updated_at, remote_updated, stored_updated]),
            Step::UpdatedRemote,
        )
        .await
    }

    async fn apply_remote(
        &self,
        record: &LocalRecord,
        row: &RemoteRow,
        remote_updated: i64,
    ) -> Result<Step> {
        if row.is_deleted {
            return self.purge(record).await;
        }

        let parent_local_id = match self.local_parent(row)? {
            LocalParent::Resolved(parent_local_id) => parent_local_id,
            LocalParent::Deferred(deferral) => return Ok(Step::Deferred(deferral)),
        };

        let patch = RecordPatch::default()
            .fields(self.spec.fields_from_columns(&row.columns))
            .parent_local_id(parent_local_id)
            .updated_at(remote_updated)
            .is_deleted(false)
            .last_synced_at(watermark(&[remote_updated]))
            .if_updated_at(record.updated_at);
        if self
            .local
            .update(self.kind(), record.local_id, patch)
            .await?
        {
            Ok(Step::AppliedLocal)
        } else {
            Ok(self.edited_during_sync(record))
        }
    }

    async fn pull_row(&self, row: &RemoteRow) -> Result<Step> {
        if row.is_deleted {
            return Ok(Step::Unchanged);
        }

        let parent_local_id = match self.local_parent(row)? {
            LocalParent::Resolved(parent_local_id) => parent_local_id,
            LocalParent::Deferred(deferral) => return Ok(Step::Deferred(deferral)),
        };

        let updated_at = updated_millis(row)?;
        let created_at = row
            .created_at_millis()
            .map_or(updated_at, |created_at| created_at.min(updated_at));
        let record = NewRecord::new(self.spec.fields_from_columns(&row.columns))
            .with_parent(parent_local_id)
            .with_remote_id(row.id)
            .with_timestamps(created_at, updated_at)
            .synced_at(watermark(&[updated_at]));

        let local_id = self.local.add(self.kind(), record).await?;
        self.identity.bind(self.kind(), local_id, row.id);
        tracing::debug!("Pulled {} row {} as #{local_id}", self.kind(), row.id);
        Ok(Step::Pulled)
    }

    async fn purge(&self, record: &LocalRecord) -> Result<Step> {
        let purged = self
            .local
            .delete_if_unchanged(self.kind(), record.local_id, record.updated_at)
            .await?;
        if !purged {
            return Ok(self.edited_during_sync(record));
        }
        self.identity.unbind_local(self.kind(), record.local_id);
        tracing::debug!("Purged {} #{}", self.kind(), record.local_id);
        Ok(Step::Purged)
    }

    /// Advance the watermark, unless the record moved on since the snapshot.
    async fn mark_synced(
        &self,
        record: &LocalRecord,
        last_synced_at: i64,
        step: Step,
    ) -> Result<Step> {
        let synced = self
            .local
            .update(
                self.kind(),
                record.local_id,
                RecordPatch::default()
                    .last_synced_at(last_synced_at)
                    .if_updated_at(record.updated_at),
            )
            .await?;
        Ok(if synced {
            step
        } else {
            self.edited_during_sync(record)
        })
    }

    fn edited_during_sync(&self, record: &LocalRecord) -> Step {
        Step::Deferred(SyncDeferral::LocalEditPending {
            kind: self.kind(),
            local_id: record.local_id,
        })
    }

    fn remote_parent(&self, record: &LocalRecord) -> Result<RemoteParent> {
        let Some(link) = self.spec.parent else {
            return Ok(RemoteParent::Unlinked);
        };

        match record.parent_local_id {
            Some(parent_id) => Ok(self.identity.local_to_remote(link.kind, parent_id).map_or(
                RemoteParent::Deferred(SyncDeferral::MappingUnresolved {
                    parent: link.kind,
                    local_id: parent_id,
                }),
                |remote_id| RemoteParent::Resolved {
                    column: link.column,
                    remote_id: Some(remote_id),
                },
            )),
            None if link.required => Err(Error::InvalidInput(format!(
                "{} #{} has no {}",
                self.kind(),
                record.local_id,
                link.kind
            ))),
            None => Ok(RemoteParent::Resolved {
                column: link.column,
                remote_id: None,
            }),
        }
    }

    fn local_parent(&self, row: &RemoteRow) -> Result<LocalParent> {
        let Some(link) = self.spec.parent else {
            return Ok(LocalParent::Resolved(None));
        };

        match row.foreign_key(link.column) {
            Some(remote_id) => Ok(self.identity.remote_to_local(link.kind, remote_id).map_or(
                LocalParent::Deferred(SyncDeferral::DependencyNotReady {
                    parent: link.kind,
                    remote_id,
                }),
                |local_id| LocalParent::Resolved(Some(local_id)),
            )),
            None if link.required => Err(Error::InvalidInput(format!(
                "{} row {} has no {}",
                self.kind(),
                row.id,
                link.column
            ))),
            None => Ok(LocalParent::Resolved(None)),
        }
    }

    /// Columns written to the remote store for a local record.
    fn payload(&self, record: &LocalRecord, parent: &RemoteParent) -> RowPayload {
        let mut payload = self.spec.columns_from_fields(&record.fields);
        if let RemoteParent::Resolved { column, remote_id } = parent {
            payload.insert(
                (*column).to_string(),
                remote_id.map_or(Value::Null, Value::from),
            );
        }
        payload.insert("is_deleted".to_string(), Value::Bool(record.is_deleted));
        payload.insert(
            "updated_at".to_string(),
            Value::String(format_timestamp(record.updated_at)),
        );
        payload
    }

    /// Whether the remote row already carries the record's data.
    fn matches_row(&self, record: &LocalRecord, row: &RemoteRow, parent: &RemoteParent) -> bool {
        let parent_matches = match parent {
            RemoteParent::Resolved { column, remote_id } => row.foreign_key(column) == *remote_id,
            RemoteParent::Unlinked | RemoteParent::Deferred(_) => true,
        };
        parent_matches
            && row.is_deleted == record.is_deleted
            && self.spec.local_view(&record.fields) == self.spec.fields_from_columns(&row.columns)
    }
}

fn updated_millis(row: &RemoteRow) -> Result<i64> {
    row.updated_at_millis().ok_or_else(|| {
        Error::Remote(RemoteError::Validation(format!(
            "row {} has an unreadable updated_at `{}`",
            row.id, row.updated_at
        )))
    })
}

/// Watermark that is never behind the clock or any of the given stamps.
fn watermark(stamps: &[i64]) -> i64 {
    stamps.iter().copied().fold(now_millis(), i64::max)
}
