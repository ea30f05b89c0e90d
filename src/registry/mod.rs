//! Model registry: versions, stages and the promotion state machine.

pub mod domain;
pub mod memory;
pub mod repo_sqlite;
pub mod service;

pub use domain::{ModelRegistry, PromotionResult, RegistryEntry, Stage};
pub use memory::MemoryRegistry;
pub use repo_sqlite::SqliteRegistry;
