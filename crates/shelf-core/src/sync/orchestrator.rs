//! Ordered, single-flight execution of every entity adapter.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, Mutex};

use crate::config::StoreConfig;
use crate::db::LocalStore;
use crate::models::{catalog, EntityKind, EntitySpec};
use crate::remote::RemoteStore;
use crate::state::{AuthState, SyncState};
use crate::{Error, Result};

use super::{EntitySyncAdapter, IdentityMap, SyncReport};

struct Inner<R: RemoteStore> {
    local: LocalStore,
    remote: Arc<R>,
    identity: Arc<IdentityMap>,
    order: Vec<EntitySpec>,
    running: Mutex<()>,
    rerun: AtomicBool,
    signed_in: AtomicBool,
    state: watch::Sender<SyncState>,
}

/// Drives sync runs over all registered entity kinds.
///
/// Runs never overlap. A trigger arriving while a run is in flight makes
/// that run repeat once it finishes, so the latest local mutation is always
/// covered by a later pass.
pub struct SyncOrchestrator<R: RemoteStore + 'static> {
    inner: Arc<Inner<R>>,
}

impl<R: RemoteStore + 'static> Clone for SyncOrchestrator<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: RemoteStore + 'static> SyncOrchestrator<R> {
    /// Build an orchestrator over the given entity specs.
    ///
    /// Starts signed out; see [`SyncOrchestrator::on_auth_changed`].
    pub fn new(
        local: LocalStore,
        remote: Arc<R>,
        identity: Arc<IdentityMap>,
        specs: &[EntitySpec],
    ) -> Result<Self> {
        let order = topological_order(specs)?;
        let (state, _) = watch::channel(SyncState::Offline);
        Ok(Self {
            inner: Arc::new(Inner {
                local,
                remote,
                identity,
                order,
                running: Mutex::new(()),
                rerun: AtomicBool::new(false),
                signed_in: AtomicBool::new(false),
                state,
            }),
        })
    }

    /// Open the configured local store and build an orchestrator over the
    /// full entity catalog, with ids restored from previous sessions.
    pub async fn open(config: &StoreConfig, remote: Arc<R>) -> Result<Self> {
        let local = LocalStore::from_config(config).await?;
        let identity = IdentityMap::hydrate(&local).await?;
        let restored: usize = EntityKind::ALL.iter().map(|kind| identity.len(*kind)).sum();
        tracing::debug!("Restored {restored} remote id bindings");
        Self::new(local, remote, Arc::new(identity), &catalog())
    }

    /// Set the initial auth state without triggering a run.
    #[must_use]
    pub fn with_auth(self, auth: AuthState) -> Self {
        self.inner
            .signed_in
            .store(auth == AuthState::SignedIn, Ordering::SeqCst);
        self
    }

    /// Entity kinds in the order adapters run.
    pub fn order(&self) -> Vec<EntityKind> {
        self.inner.order.iter().map(|spec| spec.kind).collect()
    }

    pub fn local(&self) -> &LocalStore {
        &self.inner.local
    }

    pub fn identity(&self) -> &IdentityMap {
        &self.inner.identity
    }

    /// Follow the published sync state.
    pub fn state(&self) -> watch::Receiver<SyncState> {
        self.inner.state.subscribe()
    }

    pub fn current_state(&self) -> SyncState {
        *self.inner.state.borrow()
    }

    /// Process start trigger.
    pub fn on_start(&self) {
        self.sync();
    }

    /// Auth transition trigger; syncs when a user signs in.
    pub fn on_auth_changed(&self, auth: AuthState) {
        let signed_in = auth == AuthState::SignedIn;
        let was_signed_in = self.inner.signed_in.swap(signed_in, Ordering::SeqCst);

        if signed_in && !was_signed_in {
            tracing::info!("Signed in; starting sync");
            self.sync();
        } else if !signed_in {
            self.inner.state.send_replace(SyncState::Offline);
        }
    }

    /// Request a run without waiting for it.
    ///
    /// When a run is already in flight it is asked to repeat instead.
    pub fn sync(&self) {
        self.inner.rerun.store(true, Ordering::SeqCst);
        if self.inner.running.try_lock().is_err() {
            tracing::debug!("Sync already running; queued a follow-up pass");
            return;
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("No async runtime available; sync request dropped");
            return;
        };
        let orchestrator = self.clone();
        handle.spawn(async move {
            orchestrator.run().await;
        });
    }

    /// Run every adapter and wait for the result.
    ///
    /// Repeats while triggers keep arriving mid-run and returns the report
    /// of the last pass.
    pub async fn run(&self) -> SyncReport {
        loop {
            let guard = self.inner.running.lock().await;
            self.inner.rerun.store(false, Ordering::SeqCst);
            let report = self.run_once().await;
            drop(guard);

            if !self.inner.rerun.load(Ordering::SeqCst) {
                return report;
            }
            tracing::debug!("Sync requested during run; running again");
        }
    }

    async fn run_once(&self) -> SyncReport {
        let inner = &self.inner;
        if !inner.signed_in.load(Ordering::SeqCst) {
            tracing::debug!("Skipping sync while signed out");
            inner.state.send_replace(SyncState::Offline);
            return SyncReport::skipped();
        }

        inner.state.send_replace(SyncState::Syncing);
        let mut report = SyncReport::default();

        for spec in &inner.order {
            let adapter =
                EntitySyncAdapter::new(spec, &inner.local, inner.remote.as_ref(), &inner.identity);
            match adapter.reconcile().await {
                Ok(adapter_report) => report.adapters.push((spec.kind, adapter_report)),
                Err(error) => {
                    tracing::warn!("Sync of {} aborted: {error}", spec.kind);
                    report.aborted.push(spec.kind);
                }
            }
        }

        let total = report.total();
        tracing::info!("Sync finished: {total}");
        inner.state.send_replace(if report.has_failures() {
            SyncState::Error
        } else {
            SyncState::Synced
        });
        report
    }
}

/// Order specs so that every parent kind precedes its children.
///
/// Ties keep the given order. Unknown parents and cycles are rejected.
pub fn topological_order(specs: &[EntitySpec]) -> Result<Vec<EntitySpec>> {
    let position: HashMap<EntityKind, usize> = specs
        .iter()
        .enumerate()
        .map(|(index, spec)| (spec.kind, index))
        .collect();
    if position.len() != specs.len() {
        return Err(Error::InvalidInput(
            "Entity kinds must be registered once".to_string(),
        ));
    }

    let mut blocked = vec![0usize; specs.len()];
    let mut children: Vec<Vec<usize>> = vec![Vec::new(); specs.len()];
    for (index, spec) in specs.iter().enumerate() {
        if let Some(link) = spec.parent {
            let parent = *position.get(&link.kind).ok_or_else(|| {
                Error::InvalidInput(format!(
                    "{} depends on unregistered {}",
                    spec.kind, link.kind
                ))
            })?;
            blocked[index] += 1;
            children[parent].push(index);
        }
    }

    let mut ready: BTreeSet<usize> = (0..specs.len()).filter(|&i| blocked[i] == 0).collect();
    let mut order = Vec::with_capacity(specs.len());
    while let Some(index) = ready.pop_first() {
        order.push(specs[index]);
        for &child in &children[index] {
            blocked[child] -= 1;
            if blocked[child] == 0 {
                ready.insert(child);
            }
        }
    }

    if order.len() == specs.len() {
        Ok(order)
    } else {
        Err(Error::InvalidInput(
            "Entity parent links form a cycle".to_string(),
        ))
    }
}
