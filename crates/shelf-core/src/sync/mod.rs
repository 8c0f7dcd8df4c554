//! Offline-first synchronization engine
//!
//! One [`EntitySyncAdapter`] per entity kind reconciles the local store
//! with the remote store; the [`SyncOrchestrator`] runs them parent-first
//! and shares an [`IdentityMap`] between them.

mod adapter;
mod identity;
mod orchestrator;
mod report;

pub use adapter::EntitySyncAdapter;
pub use identity::IdentityMap;
pub use orchestrator::{topological_order, SyncOrchestrator};
pub use report::{AdapterReport, SyncReport};
