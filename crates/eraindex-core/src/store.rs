//! Persistence interface and the in-memory backend.
//!
//! Every block the engine processes is written as one [`BlockChangeset`] in a
//! single transaction; deadline sweeps write a [`SweepChangeset`]. Backends
//! must make both all-or-nothing.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use crate::error::IndexerError;
use crate::expectation::{CorrelationKey, PendingExpectation};
use crate::indexer::IndexerState;
use crate::types::{Block, Chain, ChainEvent, Era, EraId, EventId, Session, SessionId, Warning};

// ─── Changesets ───────────────────────────────────────────────────────────────

/// Everything one block changes, committed atomically.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockChangeset {
    pub block: Block,
    /// New tracked events. Backends ignore `(chain, id)` duplicates.
    pub events: Vec<ChainEvent>,
    pub sessions: Vec<Session>,
    pub eras: Vec<Era>,
    /// Backends ignore content-key duplicates.
    pub warnings: Vec<Warning>,
    /// Sync progress after this block.
    pub state: IndexerState,
    /// New or re-anchored expectations (upsert by key).
    pub register: Vec<PendingExpectation>,
    /// Expectations fulfilled by this block.
    pub resolve: Vec<CorrelationKey>,
}

impl BlockChangeset {
    pub fn new(block: Block, state: IndexerState) -> Self {
        Self {
            block,
            events: vec![],
            sessions: vec![],
            eras: vec![],
            warnings: vec![],
            state,
            register: vec![],
            resolve: vec![],
        }
    }
}

/// Result of a deadline sweep.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepChangeset {
    pub warnings: Vec<Warning>,
    pub resolve: Vec<CorrelationKey>,
}

impl SweepChangeset {
    pub fn is_empty(&self) -> bool {
        self.warnings.is_empty() && self.resolve.is_empty()
    }
}

// ─── Trait ────────────────────────────────────────────────────────────────────

/// Durable store for blocks, events, the era/session timeline, warnings,
/// per-chain sync state, and pending expectations.
///
/// Implementations: [`MemoryStore`] here, `SqliteStorage` in `eraindex-storage`.
#[async_trait]
pub trait IndexStore: Send + Sync {
    /// Apply a block's changeset in one transaction.
    ///
    /// Eras are upserted without ever overwriting a stored `session_end`;
    /// sessions only gain fields; the sync cursor never moves backwards.
    async fn commit_block(&self, changeset: &BlockChangeset) -> Result<(), IndexerError>;

    /// Apply a sweep's warnings and removals in one transaction.
    async fn commit_sweep(&self, changeset: &SweepChangeset) -> Result<(), IndexerError>;

    /// Persist sync state outside a block commit (e.g. after a failed cycle).
    async fn save_indexer_state(&self, state: &IndexerState) -> Result<(), IndexerError>;

    async fn event_exists(&self, chain: Chain, id: &EventId) -> Result<bool, IndexerError>;

    /// Sync state of every chain seen so far.
    async fn get_current_state(&self) -> Result<Vec<IndexerState>, IndexerError>;

    async fn get_indexer_state(&self, chain: Chain) -> Result<Option<IndexerState>, IndexerError>;

    /// Newest first.
    async fn get_recent_warnings(&self, limit: usize) -> Result<Vec<Warning>, IndexerError>;

    /// Highest era first.
    async fn get_recent_eras(&self, limit: usize) -> Result<Vec<Era>, IndexerError>;

    /// Highest session first.
    async fn get_recent_sessions(&self, limit: usize) -> Result<Vec<Session>, IndexerError>;

    async fn load_pending_expectations(&self) -> Result<Vec<PendingExpectation>, IndexerError>;

    /// Flush and release resources. Further calls may fail.
    async fn close(&self) -> Result<(), IndexerError>;
}

// ─── Merge rules shared by backends ───────────────────────────────────────────

/// Upsert rule for eras: a stored `session_end` is never revised.
pub fn merge_era(stored: &Era, incoming: &Era) -> Era {
    Era {
        session_end: stored.session_end.or(incoming.session_end),
        ..stored.clone()
    }
}

/// Upsert rule for indexer state: everything is replaced except the cursor,
/// which only moves forward.
pub fn merge_state(stored: &IndexerState, incoming: &IndexerState) -> IndexerState {
    IndexerState {
        last_processed_block: stored.last_processed_block.max(incoming.last_processed_block),
        ..incoming.clone()
    }
}

// ─── In-memory backend ────────────────────────────────────────────────────────

#[derive(Default)]
struct Inner {
    blocks: HashMap<(Chain, u64), Block>,
    events: HashMap<(Chain, EventId), ChainEvent>,
    sessions: BTreeMap<SessionId, Session>,
    eras: BTreeMap<EraId, Era>,
    warnings: Vec<Warning>,
    warning_keys: HashSet<String>,
    states: BTreeMap<Chain, IndexerState>,
    expectations: BTreeMap<CorrelationKey, PendingExpectation>,
    /// Remaining commits to fail (failure injection).
    fail_commits: usize,
}

impl Inner {
    fn take_failure(&mut self) -> Result<(), IndexerError> {
        if self.fail_commits > 0 {
            self.fail_commits -= 1;
            return Err(IndexerError::Storage("injected commit failure".into()));
        }
        Ok(())
    }

    fn insert_warning(&mut self, warning: &Warning) {
        if self.warning_keys.insert(warning.content_key()) {
            self.warnings.push(warning.clone());
        }
    }

    fn save_state(&mut self, state: &IndexerState) {
        let merged = match self.states.get(&state.chain) {
            Some(stored) => merge_state(stored, state),
            None => state.clone(),
        };
        self.states.insert(state.chain, merged);
    }
}

/// Mutex-guarded maps. All data is lost when the process exits.
///
/// Commits are applied under one lock, so they are atomic with respect to
/// readers.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` calls to `commit_block`/`commit_sweep` fail with a
    /// storage error, leaving the store untouched.
    pub fn fail_next_commits(&self, n: usize) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.fail_commits = n;
        }
    }

    pub fn event_count(&self) -> usize {
        self.inner.lock().map(|i| i.events.len()).unwrap_or(0)
    }

    pub fn block_count(&self) -> usize {
        self.inner.lock().map(|i| i.blocks.len()).unwrap_or(0)
    }

    /// Stored events ordered by chain, block and index.
    pub fn events(&self) -> Vec<ChainEvent> {
        let mut events: Vec<ChainEvent> = self
            .inner
            .lock()
            .map(|i| i.events.values().cloned().collect())
            .unwrap_or_default();
        events.sort_by_key(|e| (e.chain, e.id));
        events
    }

    /// All warnings in insertion order.
    pub fn warnings(&self) -> Vec<Warning> {
        self.inner.lock().map(|i| i.warnings.clone()).unwrap_or_default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, IndexerError> {
        self.inner
            .lock()
            .map_err(|_| IndexerError::Storage("memory store lock poisoned".into()))
    }
}

#[async_trait]
impl IndexStore for MemoryStore {
    async fn commit_block(&self, cs: &BlockChangeset) -> Result<(), IndexerError> {
        let mut inner = self.lock()?;
        inner.take_failure()?;

        inner
            .blocks
            .entry((cs.block.chain, cs.block.number))
            .or_insert_with(|| cs.block.clone());
        for ev in &cs.events {
            inner.events.entry((ev.chain, ev.id)).or_insert_with(|| ev.clone());
        }
        for session in &cs.sessions {
            inner
                .sessions
                .entry(session.session_id)
                .and_modify(|stored| {
                    stored.fill_from(session);
                })
                .or_insert_with(|| session.clone());
        }
        for era in &cs.eras {
            let merged = match inner.eras.get(&era.era_id) {
                Some(stored) => merge_era(stored, era),
                None => era.clone(),
            };
            inner.eras.insert(era.era_id, merged);
        }
        for w in &cs.warnings {
            inner.insert_warning(w);
        }
        inner.save_state(&cs.state);
        for exp in &cs.register {
            inner.expectations.insert(exp.key, exp.clone());
        }
        for key in &cs.resolve {
            inner.expectations.remove(key);
        }
        Ok(())
    }

    async fn commit_sweep(&self, cs: &SweepChangeset) -> Result<(), IndexerError> {
        let mut inner = self.lock()?;
        inner.take_failure()?;
        for w in &cs.warnings {
            inner.insert_warning(w);
        }
        for key in &cs.resolve {
            inner.expectations.remove(key);
        }
        Ok(())
    }

    async fn save_indexer_state(&self, state: &IndexerState) -> Result<(), IndexerError> {
        self.lock()?.save_state(state);
        Ok(())
    }

    async fn event_exists(&self, chain: Chain, id: &EventId) -> Result<bool, IndexerError> {
        Ok(self.lock()?.events.contains_key(&(chain, *id)))
    }

    async fn get_current_state(&self) -> Result<Vec<IndexerState>, IndexerError> {
        Ok(self.lock()?.states.values().cloned().collect())
    }

    async fn get_indexer_state(&self, chain: Chain) -> Result<Option<IndexerState>, IndexerError> {
        Ok(self.lock()?.states.get(&chain).cloned())
    }

    async fn get_recent_warnings(&self, limit: usize) -> Result<Vec<Warning>, IndexerError> {
        Ok(self.lock()?.warnings.iter().rev().take(limit).cloned().collect())
    }

    async fn get_recent_eras(&self, limit: usize) -> Result<Vec<Era>, IndexerError> {
        Ok(self.lock()?.eras.values().rev().take(limit).cloned().collect())
    }

    async fn get_recent_sessions(&self, limit: usize) -> Result<Vec<Session>, IndexerError> {
        Ok(self.lock()?.sessions.values().rev().take(limit).cloned().collect())
    }

    async fn load_pending_expectations(&self) -> Result<Vec<PendingExpectation>, IndexerError> {
        Ok(self.lock()?.expectations.values().cloned().collect())
    }

    async fn close(&self) -> Result<(), IndexerError> {
        Ok(())
    }
}
