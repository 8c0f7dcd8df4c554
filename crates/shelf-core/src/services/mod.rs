//! Services consumed by the application layer

mod entity;

pub use entity::EntityService;
