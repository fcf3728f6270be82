//! Fluent builder API for assembling and starting an indexer.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use eraindex_core::{DeadlineSpec, MemoryStore};
//! use eraindex_sync::IndexerBuilder;
//! # async fn demo(rpc: Arc<dyn eraindex_core::ChainRpc>) -> Result<(), eraindex_core::IndexerError> {
//! let indexer = IndexerBuilder::new()
//!     .backfill_depth(2_000)
//!     .session_report_deadline(DeadlineSpec::Blocks(30))
//!     .sweep_interval_ms(2_000)
//!     .rpc(rpc)
//!     .store(Arc::new(MemoryStore::new()))
//!     .start()
//!     .await?;
//! let mut events = indexer.subscribe();
//! # let _ = events.recv().await;
//! indexer.shutdown().await?;
//! # Ok(()) }
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use eraindex_core::config::{ChainConfig, DeadlineSpec, IndexerConfig, Threshold};
use eraindex_core::domain::DomainEvent;
use eraindex_core::engine::{CorrelationEngine, EngineSnapshot, ERA_CACHE_SIZE};
use eraindex_core::error::IndexerError;
use eraindex_core::expectation::{Clock, SystemClock};
use eraindex_core::filter::EventFilter;
use eraindex_core::indexer::IndexerState;
use eraindex_core::rpc::ChainRpc;
use eraindex_core::store::IndexStore;
use eraindex_core::types::Chain;

use crate::syncer::ChainSyncer;
use crate::worker::{run_sweeper, EngineWorker};

/// Fluent builder for an [`Indexer`].
pub struct IndexerBuilder {
    config: IndexerConfig,
    rpc: Option<Arc<dyn ChainRpc>>,
    store: Option<Arc<dyn IndexStore>>,
    clock: Arc<dyn Clock>,
    filter: EventFilter,
}

impl Default for IndexerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexerBuilder {
    pub fn new() -> Self {
        Self {
            config: IndexerConfig::default(),
            rpc: None,
            store: None,
            clock: Arc::new(SystemClock),
            filter: EventFilter::staking(),
        }
    }

    /// Start from an existing configuration (e.g. loaded from JSON).
    pub fn with_config(mut self, config: IndexerConfig) -> Self {
        self.config = config;
        self
    }

    /// RPC endpoints for one chain.
    pub fn rpc_urls<I, S>(mut self, chain: Chain, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.chain_mut(chain).rpc_urls = urls.into_iter().map(Into::into).collect();
        self
    }

    /// Cold-start backfill depth for both chains.
    pub fn backfill_depth(mut self, blocks: u64) -> Self {
        for chain in Chain::ALL {
            self.config.chain_mut(chain).backfill_depth = blocks;
        }
        self
    }

    /// Replace the syncer settings of one chain.
    pub fn chain_config(mut self, chain: Chain, config: ChainConfig) -> Self {
        *self.config.chain_mut(chain) = config;
        self
    }

    /// Poll interval once caught up, for both chains.
    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        for chain in Chain::ALL {
            self.config.chain_mut(chain).poll_interval_ms = ms;
        }
        self
    }

    pub fn session_report_deadline(mut self, deadline: DeadlineSpec) -> Self {
        self.config.engine.expectations.session_report = deadline;
        self
    }

    pub fn era_activation_deadline(mut self, deadline: DeadlineSpec) -> Self {
        self.config.engine.expectations.era_activation = deadline;
        self
    }

    pub fn session_report_threshold(mut self, threshold: Threshold) -> Self {
        self.config.engine.timing.session_report_ms = threshold;
        self
    }

    pub fn era_activation_threshold(mut self, threshold: Threshold) -> Self {
        self.config.engine.timing.era_activation_ms = threshold;
        self
    }

    pub fn election_threshold(mut self, threshold: Threshold) -> Self {
        self.config.engine.timing.election_blocks = threshold;
        self
    }

    pub fn sweep_interval_ms(mut self, ms: u64) -> Self {
        self.config.sweep_interval_ms = ms;
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    pub fn broadcast_capacity(mut self, capacity: usize) -> Self {
        self.config.broadcast_capacity = capacity;
        self
    }

    /// Which events are tracked. Defaults to [`EventFilter::staking`].
    pub fn filter(mut self, filter: EventFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn rpc(mut self, rpc: Arc<dyn ChainRpc>) -> Self {
        self.rpc = Some(rpc);
        self
    }

    pub fn store(mut self, store: Arc<dyn IndexStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Time source for sweeps and warning timestamps. Defaults to the wall clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Build the `IndexerConfig` without starting anything.
    pub fn build_config(self) -> IndexerConfig {
        self.config
    }

    /// Hydrate the engine from the store and spawn the pipeline tasks.
    pub async fn start(self) -> Result<Indexer, IndexerError> {
        self.config.validate()?;
        let rpc = self
            .rpc
            .ok_or_else(|| IndexerError::Config("no ChainRpc configured".into()))?;
        let store = self
            .store
            .ok_or_else(|| IndexerError::Config("no IndexStore configured".into()))?;
        let config = self.config;

        let mut engine = CorrelationEngine::new(config.engine.clone());
        engine.restore(hydrate(store.as_ref(), config.engine.session_cache_size).await?);

        let (events, _) = broadcast::channel(config.broadcast_capacity);
        let (mut worker, handle) = EngineWorker::new(
            engine,
            store.clone(),
            events.clone(),
            self.clock.clone(),
            config.queue_capacity,
        );

        let cancel = CancellationToken::new();
        let filter = Arc::new(self.filter);
        let mut progress = HashMap::new();
        let mut tasks = Vec::new();
        for chain in Chain::ALL {
            let (syncer, rx) = ChainSyncer::new(
                chain,
                config.chain(chain).clone(),
                rpc.clone(),
                store.clone(),
                filter.clone(),
                handle.clone(),
            );
            worker.watch_chain(chain, rx.clone());
            progress.insert(chain, rx);
            tasks.push(tokio::spawn(syncer.run(cancel.child_token())));
        }
        tasks.push(tokio::spawn(run_sweeper(
            handle,
            self.clock,
            config.sweep_interval(),
            cancel.child_token(),
        )));
        // runs until the syncers and the sweeper drop their handles
        let worker = tokio::spawn(worker.run());

        info!(
            sweep_interval_ms = config.sweep_interval_ms,
            tracked = filter.len(),
            "indexer started"
        );
        Ok(Indexer {
            events,
            progress,
            store,
            cancel,
            tasks,
            worker,
        })
    }
}

/// Load what the engine needs to resume where the previous run stopped.
async fn hydrate(store: &dyn IndexStore, session_cap: usize) -> Result<EngineSnapshot, IndexerError> {
    Ok(EngineSnapshot {
        eras: store.get_recent_eras(ERA_CACHE_SIZE).await?,
        sessions: store.get_recent_sessions(session_cap).await?,
        expectations: store.load_pending_expectations().await?,
        states: store.get_current_state().await?,
    })
}

/// A running indexer: two chain syncers, the engine worker and the sweeper.
pub struct Indexer {
    events: broadcast::Sender<DomainEvent>,
    progress: HashMap<Chain, watch::Receiver<IndexerState>>,
    store: Arc<dyn IndexStore>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    worker: JoinHandle<()>,
}

impl Indexer {
    /// Receive domain events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.events.subscribe()
    }

    /// Latest published sync state of `chain`.
    pub fn state(&self, chain: Chain) -> Option<IndexerState> {
        self.progress.get(&chain).map(|rx| rx.borrow().clone())
    }

    /// Watch `chain`'s sync state.
    pub fn watch(&self, chain: Chain) -> Option<watch::Receiver<IndexerState>> {
        self.progress.get(&chain).cloned()
    }

    pub fn store(&self) -> Arc<dyn IndexStore> {
        self.store.clone()
    }

    /// Token that stops every task when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop all tasks, wait for them, and close the store.
    pub async fn shutdown(self) -> Result<(), IndexerError> {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "indexer task ended abnormally");
            }
        }
        self.worker
            .await
            .map_err(|e| IndexerError::Other(format!("engine worker: {e}")))?;
        self.store.close().await?;
        info!("indexer stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eraindex_core::store::MemoryStore;

    #[test]
    fn builder_defaults() {
        let cfg = IndexerBuilder::new().build_config();
        assert_eq!(cfg.relay_chain.backfill_depth, 1_000);
        assert_eq!(cfg.engine.expectations.session_report, DeadlineSpec::Blocks(20));
        assert_eq!(cfg.sweep_interval_ms, 5_000);
    }

    #[test]
    fn builder_custom() {
        let cfg = IndexerBuilder::new()
            .rpc_urls(Chain::AssetHub, ["wss://ah.example"])
            .backfill_depth(50)
            .era_activation_deadline(DeadlineSpec::Blocks(600))
            .election_threshold(Threshold::new(500, 0))
            .queue_capacity(16)
            .build_config();

        assert_eq!(cfg.asset_hub.rpc_urls, vec!["wss://ah.example".to_string()]);
        assert!(cfg.relay_chain.rpc_urls.is_empty());
        assert_eq!(cfg.asset_hub.backfill_depth, 50);
        assert_eq!(cfg.relay_chain.backfill_depth, 50);
        assert_eq!(cfg.engine.expectations.era_activation, DeadlineSpec::Blocks(600));
        assert_eq!(cfg.engine.timing.election_blocks.limit, 500);
        assert_eq!(cfg.queue_capacity, 16);
    }

    #[tokio::test]
    async fn start_requires_rpc_and_store() {
        let err = IndexerBuilder::new()
            .store(Arc::new(MemoryStore::new()))
            .start()
            .await
            .err();
        assert!(matches!(err, Some(IndexerError::Config(_))));
    }

    #[tokio::test]
    async fn start_rejects_invalid_config() {
        let err = IndexerBuilder::new()
            .sweep_interval_ms(0)
            .store(Arc::new(MemoryStore::new()))
            .start()
            .await
            .err();
        assert!(matches!(err, Some(IndexerError::Config(_))));
    }
}
