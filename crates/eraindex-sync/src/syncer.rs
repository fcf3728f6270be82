//! Chain syncer: walks one chain block by block and feeds the engine.
//!
//! # Cycle
//! 1. Refresh the chain tip (`currentHeight`, `targetBlock`, `isSyncing`).
//! 2. For each block after the cursor: fetch events → split/filter → submit
//!    to the engine worker → wait for the commit.
//! 3. Advance the cursor to the committed state returned by the worker.
//!
//! Every RPC call is bounded by a timeout and retried with backoff. When
//! retries run out the syncer degrades (`isSyncing=false`, `lastError` set),
//! persists that, and tries again after the degraded interval. It never exits
//! on its own; only cancellation or a closed engine stops it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use eraindex_core::config::ChainConfig;
use eraindex_core::engine::BlockBatch;
use eraindex_core::error::IndexerError;
use eraindex_core::filter::{self, EventFilter};
use eraindex_core::indexer::IndexerState;
use eraindex_core::retry::RetryPolicy;
use eraindex_core::rpc::{BlockEvents, ChainRpc};
use eraindex_core::store::IndexStore;
use eraindex_core::types::{Block, Chain};

use crate::worker::EngineHandle;

pub struct ChainSyncer {
    chain: Chain,
    config: ChainConfig,
    rpc: Arc<dyn ChainRpc>,
    store: Arc<dyn IndexStore>,
    filter: Arc<EventFilter>,
    engine: EngineHandle,
    retry: RetryPolicy,
    progress: watch::Sender<IndexerState>,
}

impl ChainSyncer {
    /// Returns the syncer and a receiver for its published state.
    pub fn new(
        chain: Chain,
        config: ChainConfig,
        rpc: Arc<dyn ChainRpc>,
        store: Arc<dyn IndexStore>,
        filter: Arc<EventFilter>,
        engine: EngineHandle,
    ) -> (Self, watch::Receiver<IndexerState>) {
        let (progress, rx) = watch::channel(IndexerState::unknown(chain));
        let retry = RetryPolicy::new(config.retry.clone());
        let syncer = Self {
            chain,
            config,
            rpc,
            store,
            filter,
            engine,
            retry,
            progress,
        };
        (syncer, rx)
    }

    pub fn chain(&self) -> Chain {
        self.chain
    }

    /// Run until `cancel` fires or the engine worker goes away.
    pub async fn run(self, cancel: CancellationToken) {
        let chain = self.chain;
        info!(%chain, "chain syncer started");

        let mut state = loop {
            match self.bootstrap(&cancel).await {
                Ok(state) => break state,
                Err(IndexerError::Aborted { .. }) => return,
                Err(e) => {
                    let mut placeholder = self.progress.borrow().clone();
                    placeholder.degrade(&e);
                    warn!(%chain, error = %e, "cannot determine start block, retrying later");
                    self.progress.send_replace(placeholder);
                    if !pause(self.config.degraded_interval(), &cancel).await {
                        return;
                    }
                }
            }
        };
        self.progress.send_replace(state.clone());

        loop {
            if cancel.is_cancelled() {
                break;
            }
            let wait = match self.cycle(&mut state, &cancel).await {
                Ok(()) => {
                    if state.clear_error() {
                        self.persist(&state).await;
                        self.progress.send_replace(state.clone());
                    }
                    self.config.poll_interval()
                }
                Err(IndexerError::Aborted { reason }) => {
                    debug!(%chain, %reason, "cycle aborted");
                    break;
                }
                Err(IndexerError::EngineClosed) => {
                    warn!(%chain, "engine worker closed, stopping syncer");
                    break;
                }
                Err(e @ IndexerError::Storage(_)) => {
                    state.record_error(&e);
                    warn!(%chain, block = state.last_processed_block + 1, error = %e, "block not committed, will retry");
                    self.persist(&state).await;
                    self.progress.send_replace(state.clone());
                    self.config.poll_interval()
                }
                Err(e) => {
                    state.degrade(&e);
                    warn!(
                        %chain,
                        error = %e,
                        error_count = state.error_count,
                        "rpc retries exhausted, degrading"
                    );
                    self.persist(&state).await;
                    self.progress.send_replace(state.clone());
                    self.config.degraded_interval()
                }
            };
            if !pause(wait, &cancel).await {
                break;
            }
        }
        info!(%chain, last_processed_block = state.last_processed_block, "chain syncer stopped");
    }

    /// Resume from persisted state, or cold-start `backfill_depth` behind the tip.
    async fn bootstrap(&self, cancel: &CancellationToken) -> Result<IndexerState, IndexerError> {
        if let Some(state) = self.store.get_indexer_state(self.chain).await? {
            info!(chain = %self.chain, block = state.last_processed_block, "resuming from persisted cursor");
            return Ok(state);
        }
        let height = tokio::select! {
            _ = cancel.cancelled() => return Err(aborted("cancelled during cold start")),
            height = self.fetch_height() => height?,
        };
        let state = IndexerState::cold_start(self.chain, height, self.config.backfill_depth);
        info!(
            chain = %self.chain,
            height,
            start = state.last_processed_block,
            "cold start"
        );
        self.store.save_indexer_state(&state).await?;
        Ok(state)
    }

    /// Catch up with the tip. Cancellation between blocks ends the cycle
    /// normally; cancellation mid-fetch aborts it.
    async fn cycle(&self, state: &mut IndexerState, cancel: &CancellationToken) -> Result<(), IndexerError> {
        let height = tokio::select! {
            _ = cancel.cancelled() => return Err(aborted("cancelled while fetching height")),
            height = self.fetch_height() => height?,
        };
        state.refresh(height);
        self.progress.send_replace(state.clone());
        debug!(chain = %self.chain, height, cursor = state.last_processed_block, "tip refreshed");

        while state.last_processed_block < state.target_block {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let number = state.last_processed_block + 1;
            let fetched = tokio::select! {
                _ = cancel.cancelled() => return Err(aborted("cancelled while fetching block")),
                fetched = self.fetch_block(number) => fetched?,
            };
            let batch = self.batch(number, fetched, state);
            *state = self.engine.submit_block(batch).await?;
            self.progress.send_replace(state.clone());
        }
        Ok(())
    }

    async fn fetch_height(&self) -> Result<u64, IndexerError> {
        self.retry
            .run("get_current_height", self.config.rpc_timeout(), || {
                self.rpc.get_current_height(self.chain)
            })
            .await
    }

    async fn fetch_block(&self, number: u64) -> Result<BlockEvents, IndexerError> {
        self.retry
            .run("get_block_events", self.config.rpc_timeout(), || {
                self.rpc.get_block_events(self.chain, number)
            })
            .await
    }

    /// Keep the tracked events of a fetched block, in order. Malformed event
    /// types are logged and skipped without affecting the rest of the block.
    fn batch(&self, number: u64, fetched: BlockEvents, state: &IndexerState) -> BlockBatch {
        let chain = self.chain;
        let block = Block {
            chain,
            number,
            timestamp: fetched.timestamp,
        };
        let mut events = Vec::new();
        for raw in fetched.events {
            if let Err(e) = filter::split(&raw.event_type) {
                warn!(%chain, block = number, index = raw.index, error = %e, "skipping malformed event");
                continue;
            }
            if self.filter.should_track(chain, &raw.event_type) {
                events.push(raw.into_chain_event(chain, number));
            }
        }
        if !events.is_empty() {
            debug!(%chain, block = number, tracked = events.len(), "tracked events");
        }
        BlockBatch {
            block,
            events,
            state: state.clone(),
        }
    }

    async fn persist(&self, state: &IndexerState) {
        if let Err(e) = self.store.save_indexer_state(state).await {
            warn!(chain = %self.chain, error = %e, "failed to persist sync state");
        }
    }
}

fn aborted(reason: &str) -> IndexerError {
    IndexerError::Aborted {
        reason: reason.to_string(),
    }
}

/// Sleep for `d` unless cancelled first. Returns `false` on cancellation.
async fn pause(d: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(d) => true,
    }
}
