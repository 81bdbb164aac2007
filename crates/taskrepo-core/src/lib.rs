//! TaskRepo Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Git or any other transport
//! - The filesystem
//! - Runtime specifics
//!
//! All types here represent the task records that TaskRepo keeps in
//! version-controlled repositories.

pub mod error;
pub mod ids;
pub mod record;
pub mod set;
pub mod status;

// Re-export commonly used types
pub use error::CoreError;
pub use ids::{DisplayId, TaskUuid};
pub use record::{Due, TaskRecord};
pub use set::OrderedSet;
pub use status::{Priority, Status};
