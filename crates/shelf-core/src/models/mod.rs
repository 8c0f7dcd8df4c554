//! Data models for Shelf

mod entity;
mod record;

pub use entity::{catalog, EntityKind, EntitySpec, FieldKind, FieldSpec, ParentLink};
pub use record::{Fields, LocalRecord, NewRecord, RecordPatch};
