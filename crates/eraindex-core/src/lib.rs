//! eraindex-core: era/session correlation for a Relay Chain + Asset Hub pair.
//!
//! # Architecture
//!
//! ```text
//! ChainSyncer(RC) ─┐                       ┌── WarningDetector (missing / unexpected / timing / election)
//!                  ├─ mpsc ─▶ CorrelationEngine ──┤
//! ChainSyncer(AH) ─┘          ▲            └── ExpectationSet (BTreeMap, clock-driven sweep)
//!                    Sweeper ─┘
//!                                  │ one transaction per block / sweep
//!                                  ▼
//!                       IndexStore (memory / SQLite) ──▶ broadcast<DomainEvent>
//! ```
//!
//! This crate holds the pure parts: types, the event filter, the engine, the
//! detector, and the store/RPC traits. The async tasks live in `eraindex-sync`.

pub mod config;
pub mod detector;
pub mod domain;
pub mod engine;
pub mod error;
pub mod expectation;
pub mod filter;
pub mod indexer;
pub mod logging;
pub mod retry;
pub mod rpc;
pub mod signal;
pub mod store;
pub mod types;

pub use config::{ChainConfig, DeadlineSpec, EngineConfig, IndexerConfig, Threshold, TimingConfig};
pub use detector::WarningDetector;
pub use domain::DomainEvent;
pub use engine::{BlockBatch, CorrelationEngine, EngineSnapshot};
pub use error::IndexerError;
pub use expectation::{Clock, CorrelationKey, ManualClock, PendingExpectation, SystemClock};
pub use filter::EventFilter;
pub use indexer::IndexerState;
pub use retry::{RetryConfig, RetryPolicy};
pub use rpc::{BlockEvents, ChainRpc, RawEvent};
pub use store::{BlockChangeset, IndexStore, MemoryStore, SweepChangeset};
pub use types::{Block, Chain, ChainEvent, Era, EventId, Session, Severity, Warning, WarningType};
