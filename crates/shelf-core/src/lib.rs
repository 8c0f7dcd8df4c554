//! shelf-core - Offline-first sync engine for Shelf
//!
//! Media tracking records live in an on-device libSQL store and are
//! reconciled with a Supabase backend whenever the app starts, the user
//! signs in, or a local mutation commits.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod remote;
pub mod services;
pub mod state;
pub mod sync;
pub mod util;

pub use error::{Error, Result};
pub use models::{EntityKind, Fields, LocalRecord};
