//! eraindex-sync: the async half of eraindex.
//!
//! One [`ChainSyncer`] per chain walks blocks and submits them to the
//! [`EngineWorker`], which owns the correlation engine, commits every block
//! and sweep through the store, and broadcasts the resulting domain events.
//! [`IndexerBuilder`] wires it all together.

pub mod builder;
pub mod syncer;
pub mod worker;

pub use builder::{Indexer, IndexerBuilder};
pub use syncer::ChainSyncer;
pub use worker::{run_sweeper, EngineCommand, EngineHandle, EngineWorker};
