//! The engine worker: single owner of the correlation engine.
//!
//! Both chain syncers and the sweeper talk to it through one bounded queue.
//! For every command the worker computes a transition, commits it, and only
//! then applies it and publishes the resulting domain events.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use eraindex_core::domain::DomainEvent;
use eraindex_core::engine::{BlockBatch, CorrelationEngine};
use eraindex_core::error::IndexerError;
use eraindex_core::expectation::Clock;
use eraindex_core::indexer::IndexerState;
use eraindex_core::store::IndexStore;
use eraindex_core::types::Chain;

/// A request for the engine worker.
#[derive(Debug)]
pub enum EngineCommand {
    /// Process and commit one block. Replies with the committed sync state.
    Block {
        batch: BlockBatch,
        reply: oneshot::Sender<Result<IndexerState, IndexerError>>,
    },
    /// Expire overdue expectations. Replies with the number of warnings raised.
    Sweep {
        now_ms: i64,
        reply: oneshot::Sender<Result<usize, IndexerError>>,
    },
}

/// Cloneable sender side of the engine queue.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineCommand>,
}

impl EngineHandle {
    pub fn new(tx: mpsc::Sender<EngineCommand>) -> Self {
        Self { tx }
    }

    /// Submit a block and wait until it is durably committed.
    pub async fn submit_block(&self, batch: BlockBatch) -> Result<IndexerState, IndexerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineCommand::Block { batch, reply })
            .await
            .map_err(|_| IndexerError::EngineClosed)?;
        rx.await.map_err(|_| IndexerError::EngineClosed)?
    }

    /// Run a deadline sweep as of `now_ms`.
    pub async fn sweep(&self, now_ms: i64) -> Result<usize, IndexerError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineCommand::Sweep { now_ms, reply })
            .await
            .map_err(|_| IndexerError::EngineClosed)?;
        rx.await.map_err(|_| IndexerError::EngineClosed)?
    }
}

pub struct EngineWorker {
    engine: CorrelationEngine,
    store: Arc<dyn IndexStore>,
    rx: mpsc::Receiver<EngineCommand>,
    events: broadcast::Sender<DomainEvent>,
    clock: Arc<dyn Clock>,
    progress: HashMap<Chain, watch::Receiver<IndexerState>>,
}

impl EngineWorker {
    /// Create the worker and the handle used to feed it.
    pub fn new(
        engine: CorrelationEngine,
        store: Arc<dyn IndexStore>,
        events: broadcast::Sender<DomainEvent>,
        clock: Arc<dyn Clock>,
        queue_capacity: usize,
    ) -> (Self, EngineHandle) {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let worker = Self {
            engine,
            store,
            rx,
            events,
            clock,
            progress: HashMap::new(),
        };
        (worker, EngineHandle::new(tx))
    }

    /// Observe a chain syncer's published state, used to defer wall-clock
    /// deadlines while that chain is catching up.
    pub fn watch_chain(&mut self, chain: Chain, rx: watch::Receiver<IndexerState>) {
        self.progress.insert(chain, rx);
    }

    /// Serve commands until every handle is dropped.
    pub async fn run(mut self) {
        info!("engine worker started");
        while let Some(cmd) = self.rx.recv().await {
            match cmd {
                EngineCommand::Block { batch, reply } => {
                    let result = self.handle_block(batch).await;
                    // the syncer may have been cancelled while waiting
                    let _ = reply.send(result);
                }
                EngineCommand::Sweep { now_ms, reply } => {
                    let result = self.handle_sweep(now_ms).await;
                    let _ = reply.send(result);
                }
            }
        }
        info!("engine worker stopped");
    }

    async fn handle_block(&mut self, batch: BlockBatch) -> Result<IndexerState, IndexerError> {
        let chain = batch.block.chain;
        let number = batch.block.number;

        let mut known = HashSet::new();
        for event in &batch.events {
            if self.store.event_exists(event.chain, &event.id).await? {
                known.insert(event.id);
            }
        }

        let transition = self.engine.process_block(&batch, &known, self.clock.now_ms());
        if let Err(e) = self.store.commit_block(&transition.changeset).await {
            warn!(%chain, block = number, error = %e, "block commit failed, engine state unchanged");
            return Err(e);
        }
        debug!(
            %chain,
            block = number,
            events = transition.changeset.events.len(),
            warnings = transition.changeset.warnings.len(),
            "block committed"
        );

        let state = transition.changeset.state.clone();
        let events = self.engine.apply_block(transition);
        self.publish(events);
        Ok(state)
    }

    async fn handle_sweep(&mut self, now_ms: i64) -> Result<usize, IndexerError> {
        let transition = self.engine.sweep(now_ms, |chain| self.is_syncing(chain));
        if transition.changeset.is_empty() {
            return Ok(0);
        }
        self.store.commit_sweep(&transition.changeset).await?;
        let raised = transition.changeset.warnings.len();
        let events = self.engine.apply_sweep(transition);
        self.publish(events);
        Ok(raised)
    }

    fn is_syncing(&self, chain: Chain) -> bool {
        self.progress
            .get(&chain)
            .is_some_and(|rx| rx.borrow().is_syncing)
    }

    fn publish(&self, events: Vec<DomainEvent>) {
        for event in events {
            if self.events.send(event).is_err() {
                // no subscribers right now
                break;
            }
        }
    }
}

/// Periodically ask the worker to expire overdue expectations.
///
/// Sweeps go through the same queue as blocks, so they never interleave with
/// a block commit.
pub async fn run_sweeper(
    handle: EngineHandle,
    clock: Arc<dyn Clock>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        match handle.sweep(clock.now_ms()).await {
            Ok(0) => {}
            Ok(raised) => info!(raised, "deadline sweep raised warnings"),
            Err(IndexerError::EngineClosed) => break,
            Err(e) => warn!(error = %e, "deadline sweep failed, retrying next tick"),
        }
    }
    debug!("sweeper stopped");
}
