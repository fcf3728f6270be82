//! Correlation engine: the era/session state machine.
//!
//! The engine never mutates itself while looking at a block. It computes a
//! [`BlockTransition`] (the changeset to persist plus the successor state),
//! the caller commits the changeset, and only then calls
//! [`CorrelationEngine::apply_block`]. A failed commit leaves the engine
//! exactly as it was, so the same block can be offered again.
//!
//! ```text
//! RC session.NewSession ───────────────┐   register SessionReport(i-1)
//! RC stakingAhClient.ValidatorSetRecv ─┤   register EraActivation(id)
//!                                      ▼
//!                              ExpectationSet ◀── sweep(now) ──▶ missing_event
//!                                      ▲
//! AH stakingRcClient.SessionReportRecv ┤   resolve + timing
//! AH staking.SessionRotated ───────────┘   resolve + era start/close
//! ```

use std::collections::{BTreeMap, HashSet};

use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::detector::{Anchor, TimingMetric, WarningDetector};
use crate::domain::DomainEvent;
use crate::expectation::{
    ChainView, CorrelationKey, Deadline, ExpectationKind, ExpectationSet, PendingExpectation,
};
use crate::indexer::IndexerState;
use crate::signal::{Signal, PHASE_EMERGENCY, PHASE_OFF};
use crate::store::{BlockChangeset, SweepChangeset};
use crate::types::{Block, Chain, ChainEvent, Era, EraId, EventId, Session, SessionId, Warning};

/// Eras kept in the working set.
pub const ERA_CACHE_SIZE: usize = 128;

// ─── State ────────────────────────────────────────────────────────────────────

/// Last observed multi-block election phase.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ElectionTracker {
    /// `None` until a transition has been seen (e.g. right after a restart).
    pub phase: Option<String>,
    /// AH block at which the running election left `Off`.
    pub started_at: Option<u64>,
}

impl ElectionTracker {
    /// `None` when the phase is unknown.
    pub fn in_progress(&self) -> Option<bool> {
        self.phase.as_deref().map(|p| p != PHASE_OFF)
    }
}

#[derive(Debug, Clone, Default)]
struct EngineState {
    eras: BTreeMap<EraId, Era>,
    sessions: BTreeMap<SessionId, Session>,
    expectations: ExpectationSet,
    election: ElectionTracker,
    /// Latest applied block per chain.
    heads: BTreeMap<Chain, u64>,
    /// AH block timestamp of every session report seen, for reports that
    /// arrive before the RC trigger is processed.
    reports_seen: BTreeMap<SessionId, i64>,
}

impl EngineState {
    fn open_era(&self) -> Option<&Era> {
        self.eras.values().rev().find(|e| e.is_open())
    }

    fn latest_era(&self) -> Option<&Era> {
        self.eras.values().next_back()
    }

    fn current_era_id(&self) -> Option<EraId> {
        self.open_era().or_else(|| self.latest_era()).map(|e| e.era_id)
    }

    fn last_session(&self) -> Option<SessionId> {
        self.sessions.keys().next_back().copied()
    }

    /// Highest session an AH rotation has reported.
    fn last_confirmed_session(&self) -> Option<SessionId> {
        self.sessions
            .values()
            .rev()
            .find(|s| s.active_era_id.is_some())
            .map(|s| s.session_id)
    }

    /// Era owning `session`. An open era only claims sessions up to the last
    /// confirmed rotation; later ones may belong to an era not yet seen.
    fn era_of_session(&self, session: SessionId) -> Option<EraId> {
        if let Some(era) = self.sessions.get(&session).and_then(|s| s.era_id) {
            return Some(era);
        }
        let confirmed = self.last_confirmed_session();
        self.eras
            .values()
            .rev()
            .find(|e| e.contains_session(session))
            .filter(|e| !e.is_open() || confirmed.is_some_and(|c| session <= c))
            .map(|e| e.era_id)
    }

    fn view(&self, chain: Chain, is_syncing: bool) -> ChainView {
        ChainView {
            head: self.heads.get(&chain).copied(),
            is_syncing,
        }
    }

    fn evict(&mut self, session_cap: usize) {
        while self.sessions.len() > session_cap {
            self.sessions.pop_first();
        }
        while self.reports_seen.len() > session_cap {
            self.reports_seen.pop_first();
        }
        while self.eras.len() > ERA_CACHE_SIZE {
            self.eras.pop_first();
        }
    }
}

/// Persisted records used to rebuild the engine after a restart.
#[derive(Debug, Clone, Default)]
pub struct EngineSnapshot {
    pub eras: Vec<Era>,
    pub sessions: Vec<Session>,
    pub expectations: Vec<PendingExpectation>,
    pub states: Vec<IndexerState>,
}

// ─── Transitions ──────────────────────────────────────────────────────────────

/// One block offered by a chain syncer.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockBatch {
    pub block: Block,
    /// Tracked events in block order.
    pub events: Vec<ChainEvent>,
    /// The syncer's state before this block.
    pub state: IndexerState,
}

/// Outcome of a block, to be committed before it is applied.
#[derive(Debug)]
pub struct BlockTransition {
    pub changeset: BlockChangeset,
    /// Published once the changeset is committed.
    pub events: Vec<DomainEvent>,
    next: EngineState,
}

/// Outcome of a deadline sweep, to be committed before it is applied.
#[derive(Debug)]
pub struct SweepTransition {
    pub changeset: SweepChangeset,
    pub events: Vec<DomainEvent>,
    next: EngineState,
}

// ─── Engine ───────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct CorrelationEngine {
    config: EngineConfig,
    detector: WarningDetector,
    state: EngineState,
}

impl CorrelationEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            detector: WarningDetector::new(config.timing.clone()),
            config,
            state: EngineState::default(),
        }
    }

    /// Replace the working set with persisted records.
    pub fn restore(&mut self, snapshot: EngineSnapshot) {
        let mut state = EngineState {
            eras: snapshot.eras.into_iter().map(|e| (e.era_id, e)).collect(),
            sessions: snapshot.sessions.into_iter().map(|s| (s.session_id, s)).collect(),
            expectations: snapshot.expectations.into_iter().collect(),
            election: ElectionTracker::default(),
            heads: snapshot
                .states
                .iter()
                .map(|s| (s.chain, s.last_processed_block))
                .collect(),
            reports_seen: BTreeMap::new(),
        };
        state.evict(self.session_cap());
        info!(
            eras = state.eras.len(),
            sessions = state.sessions.len(),
            pending = state.expectations.len(),
            "correlation engine restored"
        );
        self.state = state;
    }

    /// Compute the effects of `batch`. Events whose id is in `known` were
    /// already stored and are skipped, as are repeats inside the batch.
    pub fn process_block(
        &self,
        batch: &BlockBatch,
        known: &HashSet<EventId>,
        now_ms: i64,
    ) -> BlockTransition {
        let block = &batch.block;
        let mut pass = Pass::new(self, block, now_ms);
        let mut fresh = Vec::new();
        let mut seen = HashSet::new();

        for event in &batch.events {
            if known.contains(&event.id) || !seen.insert(event.id) {
                debug!(chain = %block.chain, block = block.number, event_id = %event.id, "duplicate event skipped");
                continue;
            }
            match Signal::parse(event) {
                Ok(signal) => pass.apply(signal),
                Err(reason) => warn!(
                    chain = %block.chain,
                    block = block.number,
                    event_type = %event.event_type,
                    %reason,
                    "unreadable payload, event stored without effect"
                ),
            }
            fresh.push(event.clone());
        }

        let head = pass.next.heads.entry(block.chain).or_insert(block.number);
        *head = (*head).max(block.number);
        let head = *head;
        for exp in pass.next.expectations.anchor(block.chain, head) {
            debug!(key = %exp.key, deadline = %exp.deadline, "expectation anchored");
        }

        let mut state = batch.state.advanced_to(block.number);
        state.current_era = pass.next.current_era_id();
        state.current_session = pass.next.last_session();

        pass.finish_block(&self.state, fresh, state, self.session_cap())
    }

    /// Expire pending expectations whose deadline has passed.
    ///
    /// `is_syncing` reports whether a chain's syncer is catching up; its
    /// wall-clock deadlines wait until it is not.
    pub fn sweep<F>(&self, now_ms: i64, is_syncing: F) -> SweepTransition
    where
        F: Fn(Chain) -> bool,
    {
        let mut next = self.state.clone();
        let expired = next
            .expectations
            .expired(now_ms, |chain| next.view(chain, is_syncing(chain)));

        let mut changeset = SweepChangeset::default();
        for exp in expired {
            next.expectations.remove(&exp.key);
            let era = exp.key.session_id().and_then(|s| next.era_of_session(s));
            let warning = self.detector.missing_event(&exp, era, now_ms);
            warn!(key = %exp.key, expected = %exp.expected_event, deadline = %exp.deadline, "expectation expired");
            changeset.resolve.push(exp.key);
            changeset.warnings.push(warning);
        }
        let events = changeset
            .warnings
            .iter()
            .cloned()
            .map(DomainEvent::NewWarning)
            .collect();
        SweepTransition {
            changeset,
            events,
            next,
        }
    }

    /// Adopt a committed block transition. Returns the events to publish.
    pub fn apply_block(&mut self, transition: BlockTransition) -> Vec<DomainEvent> {
        self.state = transition.next;
        transition.events
    }

    /// Adopt a committed sweep transition. Returns the events to publish.
    pub fn apply_sweep(&mut self, transition: SweepTransition) -> Vec<DomainEvent> {
        self.state = transition.next;
        transition.events
    }

    // ─── Read access ──────────────────────────────────────────────────────────

    pub fn open_era(&self) -> Option<&Era> {
        self.state.open_era()
    }

    pub fn era(&self, era_id: EraId) -> Option<&Era> {
        self.state.eras.get(&era_id)
    }

    pub fn session(&self, session_id: SessionId) -> Option<&Session> {
        self.state.sessions.get(&session_id)
    }

    pub fn pending(&self) -> &ExpectationSet {
        &self.state.expectations
    }

    pub fn election(&self) -> &ElectionTracker {
        &self.state.election
    }

    pub fn head(&self, chain: Chain) -> Option<u64> {
        self.state.heads.get(&chain).copied()
    }

    fn session_cap(&self) -> usize {
        self.config.session_cache_size.max(1)
    }
}

// ─── One block's worth of work ────────────────────────────────────────────────

struct Pass<'a> {
    engine: &'a CorrelationEngine,
    block: &'a Block,
    now_ms: i64,
    next: EngineState,
    warnings: Vec<Warning>,
    warning_keys: HashSet<String>,
    phase_changes: Vec<DomainEvent>,
}

impl<'a> Pass<'a> {
    fn new(engine: &'a CorrelationEngine, block: &'a Block, now_ms: i64) -> Self {
        Self {
            engine,
            block,
            now_ms,
            next: engine.state.clone(),
            warnings: vec![],
            warning_keys: HashSet::new(),
            phase_changes: vec![],
        }
    }

    fn apply(&mut self, signal: Signal) {
        match signal {
            Signal::NewSession { session } => self.new_session(session),
            Signal::ValidatorSetReceived { era } => self.validator_set_received(era),
            Signal::ValidatorSetDropped { event } => {
                let anchor = self.current_anchor();
                self.push(self.engine.detector.election_issue(
                    anchor,
                    format!("{event}: validator set from AH was dropped"),
                    self.now_ms,
                ));
            }
            Signal::PalletUnexpected { event_type, detail } => {
                let anchor = self.current_anchor();
                self.push(self.engine.detector.unexpected_event(
                    anchor,
                    format!("{event_type} reported by pallet: {detail}"),
                    self.now_ms,
                ));
            }
            Signal::SessionRotated {
                starting_session,
                active_era,
                planned_era,
            } => self.session_rotated(starting_session, active_era, planned_era),
            Signal::EraPaid { era } => self.era_paid(era),
            Signal::PagedElectionProceeded { page, failed } => {
                if failed {
                    let page = page.map_or_else(|| "?".to_string(), |p| p.to_string());
                    self.election_failure(format!("paged election failed at page {page}"));
                }
            }
            Signal::SessionReportReceived {
                end_index,
                validator_points,
            } => self.session_report(end_index, validator_points),
            Signal::PhaseTransitioned { from, to } => self.phase_transitioned(from, to),
            Signal::VerificationFailed { detail } => {
                self.election_failure(format!("verifier rejected solution: {detail}"));
            }
            Signal::Stored => {}
        }
    }

    // ─── RC signals ───────────────────────────────────────────────────────────

    fn new_session(&mut self, session: SessionId) {
        let mut row = Session::new(session, self.block);
        row.era_id = self.next.era_of_session(session);
        self.upsert_session(row);

        let Some(reported) = session.checked_sub(1) else {
            return;
        };
        let key = CorrelationKey::Session(reported);
        if self.next.expectations.contains(&key) {
            return;
        }
        if let Some(&reported_at) = self.next.reports_seen.get(&reported) {
            let anchor = Anchor::block(self.block.number)
                .era(self.next.era_of_session(reported))
                .session(Some(reported));
            self.timing(TimingMetric::SessionReport, reported_at - self.block.timestamp, anchor);
            return;
        }
        self.register(key, ExpectationKind::SessionReport);
    }

    fn validator_set_received(&mut self, era: EraId) {
        let key = CorrelationKey::Era(era);
        if self.next.expectations.contains(&key) {
            return;
        }
        if self.next.latest_era().is_some_and(|e| e.era_id >= era) {
            if let Some(started) = self.next.eras.get(&era).map(|e| e.start_time) {
                let anchor = Anchor::block(self.block.number).era(Some(era));
                self.timing(TimingMetric::EraActivation, started - self.block.timestamp, anchor);
            }
            return;
        }
        self.register(key, ExpectationKind::EraActivation);
    }

    fn register(&mut self, key: CorrelationKey, kind: ExpectationKind) {
        let spec = match kind {
            ExpectationKind::SessionReport => self.engine.config.expectations.session_report,
            ExpectationKind::EraActivation => self.engine.config.expectations.era_activation,
        };
        let expected_head = self.next.heads.get(&kind.expected_chain()).copied();
        let deadline = Deadline::from_spec(spec, expected_head, self.block.timestamp);
        debug!(%key, kind = kind.as_str(), %deadline, "expectation registered");
        self.next.expectations.insert(PendingExpectation::new(
            key,
            kind,
            self.block.number,
            self.block.timestamp,
            deadline,
        ));
    }

    // ─── AH signals ───────────────────────────────────────────────────────────

    fn session_rotated(&mut self, starting_session: SessionId, active_era: EraId, planned_era: Option<EraId>) {
        let latest = self.next.latest_era().map(|e| e.era_id);
        if latest.map_or(true, |l| active_era > l) {
            self.start_era(active_era, starting_session);
        } else if let Some(open) = self.next.open_era().map(|e| e.era_id) {
            if active_era < open {
                let anchor = Anchor::block(self.block.number)
                    .era(Some(open))
                    .session(Some(starting_session));
                self.push(self.engine.detector.unexpected_event(
                    anchor,
                    format!("SessionRotated reports active era {active_era} below open era {open}"),
                    self.now_ms,
                ));
            }
        }

        let mut row = Session::new(starting_session, self.block);
        row.era_id = Some(active_era);
        row.active_era_id = Some(active_era);
        row.planned_era_id = planned_era;
        self.upsert_session(row);

        for key in self.next.expectations.eras_up_to(active_era) {
            let Some(exp) = self.next.expectations.remove(&key) else {
                continue;
            };
            let anchor = Anchor::block(self.block.number)
                .era(key.era_id())
                .session(Some(starting_session));
            self.timing(
                TimingMetric::EraActivation,
                self.block.timestamp - exp.registered_at,
                anchor,
            );
        }
    }

    /// Open `era_id` at `session_start`, closing the previous open era.
    fn start_era(&mut self, era_id: EraId, session_start: SessionId) {
        let open = self.next.open_era().map(|e| (e.era_id, e.session_start));
        match open {
            Some((open_id, open_start)) => {
                let end = match session_start.checked_sub(1) {
                    Some(end) if end >= open_start => end,
                    _ => {
                        let anchor = Anchor::block(self.block.number)
                            .era(Some(open_id))
                            .session(Some(session_start));
                        self.push(self.engine.detector.unexpected_event(
                            anchor,
                            format!(
                                "era {era_id} starts at session {session_start}, not after era {open_id} start {open_start}"
                            ),
                            self.now_ms,
                        ));
                        open_start
                    }
                };
                if let Some(era) = self.next.eras.get_mut(&open_id) {
                    era.session_end = Some(end);
                }
                info!(era = open_id, session_end = end, "era closed");
            }
            None if !self.next.eras.is_empty() => {
                let anchor = Anchor::block(self.block.number)
                    .era(Some(era_id))
                    .session(Some(session_start));
                self.push(self.engine.detector.unexpected_event(
                    anchor,
                    format!("era {era_id} started with no open era to close"),
                    self.now_ms,
                ));
            }
            None => {}
        }

        self.next.eras.insert(
            era_id,
            Era {
                era_id,
                session_start,
                session_end: None,
                start_time: self.block.timestamp,
            },
        );
        for session in self.next.sessions.range_mut(session_start..).map(|(_, s)| s) {
            session.era_id.get_or_insert(era_id);
        }
        info!(era = era_id, session = session_start, block = self.block.number, "era started");
    }

    fn era_paid(&mut self, era: EraId) {
        let open = self.next.open_era().map(|e| e.era_id);
        let latest = self.next.latest_era().map(|e| e.era_id);
        match (open, latest) {
            (Some(open), _) if open == era => debug!(era, "era paid"),
            (Some(open), _) => {
                let anchor = self.current_anchor().era(Some(open));
                self.push(self.engine.detector.unexpected_event(
                    anchor,
                    format!("EraPaid for era {era} while era {open} is open"),
                    self.now_ms,
                ));
            }
            (None, None) => debug!(era, "era paid before any era start observed"),
            (None, Some(latest)) => {
                let anchor = self.current_anchor().era(Some(era));
                self.push(self.engine.detector.unexpected_event(
                    anchor,
                    format!("EraPaid for era {era} with no open era"),
                    self.now_ms,
                ));
                let synthetic = era.max(latest.saturating_add(1));
                let after_latest = self
                    .next
                    .eras
                    .get(&latest)
                    .and_then(|e| e.session_end)
                    .map_or(0, |end| end.saturating_add(1));
                let session_start = self.next.last_session().unwrap_or(0).max(after_latest);
                warn!(era = synthetic, session = session_start, "materializing synthetic open era");
                self.next.eras.insert(
                    synthetic,
                    Era {
                        era_id: synthetic,
                        session_start,
                        session_end: None,
                        start_time: self.block.timestamp,
                    },
                );
            }
        }
    }

    fn session_report(&mut self, end_index: SessionId, validator_points: Option<u64>) {
        self.next.reports_seen.insert(end_index, self.block.timestamp);
        if let Some(points) = validator_points {
            if let Some(session) = self.next.sessions.get_mut(&end_index) {
                session.validator_points_total.get_or_insert(points);
            }
        }
        let key = CorrelationKey::Session(end_index);
        if let Some(exp) = self.next.expectations.remove(&key) {
            let anchor = Anchor::block(self.block.number)
                .era(self.next.era_of_session(end_index))
                .session(Some(end_index));
            self.timing(
                TimingMetric::SessionReport,
                self.block.timestamp - exp.registered_at,
                anchor,
            );
        }
    }

    fn phase_transitioned(&mut self, from: String, to: String) {
        if let Some(known) = self.next.election.phase.as_deref() {
            if known != from {
                debug!(known, %from, "phase transition does not start from the tracked phase");
            }
        }
        info!(%from, %to, block = self.block.number, "election phase changed");

        if from == PHASE_OFF && to != PHASE_OFF {
            self.next.election.started_at = Some(self.block.number);
        }
        if to == PHASE_OFF {
            if let Some(started) = self.next.election.started_at.take() {
                let anchor = self.current_anchor();
                let elapsed = self.block.number.saturating_sub(started);
                self.timing(TimingMetric::Election, i64::try_from(elapsed).unwrap_or(i64::MAX), anchor);
            }
        }
        if to == PHASE_EMERGENCY {
            let anchor = self.current_anchor();
            self.push(self.engine.detector.election_issue(
                anchor,
                format!("election entered {PHASE_EMERGENCY} phase from {from}"),
                self.now_ms,
            ));
        }

        self.phase_changes.push(DomainEvent::ElectionPhaseChange {
            from,
            to: to.clone(),
            block_number: self.block.number,
        });
        self.next.election.phase = Some(to);
    }

    /// An election failure signal; also unexpected when no election runs.
    fn election_failure(&mut self, message: String) {
        let anchor = self.current_anchor();
        if self.next.election.in_progress() == Some(false) {
            self.push(self.engine.detector.unexpected_event(
                anchor,
                format!("{message} while no election is in progress"),
                self.now_ms,
            ));
        }
        self.push(self.engine.detector.election_issue(anchor, message, self.now_ms));
    }

    // ─── Helpers ──────────────────────────────────────────────────────────────

    fn current_anchor(&self) -> Anchor {
        Anchor::block(self.block.number)
            .era(self.next.current_era_id())
            .session(self.next.last_session())
    }

    fn upsert_session(&mut self, row: Session) {
        match self.next.sessions.get_mut(&row.session_id) {
            Some(existing) => {
                existing.fill_from(&row);
            }
            None => {
                debug!(session = row.session_id, chain = %self.block.chain, "session observed");
                self.next.sessions.insert(row.session_id, row);
            }
        }
    }

    fn timing(&mut self, metric: TimingMetric, elapsed: i64, anchor: Anchor) {
        if let Some(w) = self.engine.detector.timing(metric, elapsed, anchor, self.now_ms) {
            self.push(w);
        }
    }

    fn push(&mut self, warning: Warning) {
        if !self.warning_keys.insert(warning.content_key()) {
            return;
        }
        warn!(
            kind = warning.kind.as_str(),
            severity = warning.severity.as_str(),
            era = ?warning.era_id,
            session = ?warning.session_id,
            block = warning.block_number,
            message = %warning.message,
            "warning raised"
        );
        self.warnings.push(warning);
    }

    /// Diff the successor state against `prev` and build the transition.
    fn finish_block(
        self,
        prev: &EngineState,
        fresh: Vec<ChainEvent>,
        state: IndexerState,
        session_cap: usize,
    ) -> BlockTransition {
        let Pass {
            block,
            mut next,
            warnings,
            phase_changes,
            ..
        } = self;

        let mut changeset = BlockChangeset::new(block.clone(), state);
        changeset.events = fresh;
        changeset.sessions = next
            .sessions
            .values()
            .filter(|s| prev.sessions.get(&s.session_id) != Some(*s))
            .cloned()
            .collect();
        changeset.eras = next
            .eras
            .values()
            .filter(|e| prev.eras.get(&e.era_id) != Some(*e))
            .cloned()
            .collect();
        changeset.register = next
            .expectations
            .iter()
            .filter(|e| prev.expectations.get(&e.key) != Some(*e))
            .cloned()
            .collect();
        changeset.resolve = prev
            .expectations
            .iter()
            .filter(|e| !next.expectations.contains(&e.key))
            .map(|e| e.key)
            .collect();
        changeset.warnings = warnings;

        let mut events: Vec<DomainEvent> = Vec::new();
        events.extend(changeset.eras.iter().cloned().map(DomainEvent::EraUpdate));
        events.extend(changeset.sessions.iter().cloned().map(DomainEvent::SessionUpdate));
        events.extend(phase_changes);
        events.extend(changeset.warnings.iter().cloned().map(DomainEvent::NewWarning));
        events.push(DomainEvent::BlockUpdate(changeset.state.clone()));

        next.evict(session_cap);
        BlockTransition {
            changeset,
            events,
            next,
        }
    }
}
