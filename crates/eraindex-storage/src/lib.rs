//! eraindex-storage: durable backends for the eraindex [`IndexStore`].
//!
//! Backends:
//! - [`MemoryStore`]: in-memory (dev/testing, no persistence), from `eraindex-core`
//! - [`sqlite`]: SQLite via `sqlx` (embedded, single-file persistence)

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use eraindex_core::store::{IndexStore, MemoryStore};

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorage;
