//! Pending cross-chain expectations and the clock that expires them.
//!
//! An RC event can promise that a matching AH event will follow. The promise
//! is recorded as a [`PendingExpectation`] keyed by era or session, and a
//! periodic sweep checks every entry against its [`Deadline`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

use crate::config::DeadlineSpec;
use crate::types::{Chain, EraId, SessionId};

// ─── Keys ─────────────────────────────────────────────────────────────────────

/// What an expectation is correlated on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrelationKey {
    Era(EraId),
    Session(SessionId),
}

impl CorrelationKey {
    /// `(kind, id)` pair used by storage backends.
    pub fn to_parts(&self) -> (&'static str, u32) {
        match *self {
            Self::Era(id) => ("era", id),
            Self::Session(id) => ("session", id),
        }
    }

    pub fn from_parts(kind: &str, id: u32) -> Option<Self> {
        match kind {
            "era" => Some(Self::Era(id)),
            "session" => Some(Self::Session(id)),
            _ => None,
        }
    }

    pub fn era_id(&self) -> Option<EraId> {
        match *self {
            Self::Era(id) => Some(id),
            Self::Session(_) => None,
        }
    }

    pub fn session_id(&self) -> Option<SessionId> {
        match *self {
            Self::Session(id) => Some(id),
            Self::Era(_) => None,
        }
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Era(id) => write!(f, "era {id}"),
            Self::Session(id) => write!(f, "session {id}"),
        }
    }
}

/// The two kinds of cross-chain promise the engine tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpectationKind {
    /// RC session change → AH receives the session report.
    SessionReport,
    /// RC receives a validator set → AH activates the era.
    EraActivation,
}

impl ExpectationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SessionReport => "session_report",
            Self::EraActivation => "era_activation",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "session_report" => Some(Self::SessionReport),
            "era_activation" => Some(Self::EraActivation),
            _ => None,
        }
    }

    /// `pallet.eventName` that fulfils the expectation.
    pub fn expected_event(&self) -> &'static str {
        match self {
            Self::SessionReport => "stakingRcClient.SessionReportReceived",
            Self::EraActivation => "staking.SessionRotated",
        }
    }

    /// Chain the fulfilling event is emitted on.
    pub fn expected_chain(&self) -> Chain {
        Chain::AssetHub
    }
}

// ─── Deadlines ────────────────────────────────────────────────────────────────

/// When a pending expectation gives up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Deadline {
    /// Expires once the expected chain has processed a block past this one.
    AtBlock(u64),
    /// Block budget not yet anchored: the expected chain's head was unknown at
    /// registration. Anchored at the first observed block of that chain.
    AfterBlocks(u64),
    /// Expires once the clock passes this unix-ms instant.
    AtMillis(i64),
}

impl Deadline {
    /// Resolve a configured deadline at registration time.
    pub fn from_spec(spec: DeadlineSpec, expected_head: Option<u64>, trigger_ts: i64) -> Self {
        match (spec, expected_head) {
            (DeadlineSpec::Blocks(n), Some(head)) => Self::AtBlock(head.saturating_add(n)),
            (DeadlineSpec::Blocks(n), None) => Self::AfterBlocks(n),
            (DeadlineSpec::Millis(ms), _) => {
                Self::AtMillis(trigger_ts.saturating_add(i64::try_from(ms).unwrap_or(i64::MAX)))
            }
        }
    }

    /// `(kind, value)` pair used by storage backends.
    pub fn to_parts(&self) -> (&'static str, i64) {
        match *self {
            Self::AtBlock(b) => ("at_block", b as i64),
            Self::AfterBlocks(n) => ("after_blocks", n as i64),
            Self::AtMillis(ms) => ("at_millis", ms),
        }
    }

    pub fn from_parts(kind: &str, value: i64) -> Option<Self> {
        match kind {
            "at_block" => Some(Self::AtBlock(value.max(0) as u64)),
            "after_blocks" => Some(Self::AfterBlocks(value.max(0) as u64)),
            "at_millis" => Some(Self::AtMillis(value)),
            _ => None,
        }
    }
}

impl fmt::Display for Deadline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AtBlock(b) => write!(f, "block {b}"),
            Self::AfterBlocks(n) => write!(f, "{n} blocks"),
            Self::AtMillis(ms) => write!(f, "{ms}ms"),
        }
    }
}

/// What the sweep knows about the chain an expectation waits on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChainView {
    /// Latest block whose effects the engine has applied.
    pub head: Option<u64>,
    /// The chain's syncer is still catching up on a backlog.
    pub is_syncing: bool,
}

// ─── Pending expectation ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingExpectation {
    pub key: CorrelationKey,
    pub kind: ExpectationKind,
    pub expected_chain: Chain,
    /// `pallet.eventName` awaited on `expected_chain`.
    pub expected_event: String,
    /// Trigger block on the registering chain.
    pub registered_block: u64,
    /// Unix ms of the trigger block.
    pub registered_at: i64,
    pub deadline: Deadline,
}

impl PendingExpectation {
    pub fn new(
        key: CorrelationKey,
        kind: ExpectationKind,
        registered_block: u64,
        registered_at: i64,
        deadline: Deadline,
    ) -> Self {
        Self {
            key,
            kind,
            expected_chain: kind.expected_chain(),
            expected_event: kind.expected_event().to_string(),
            registered_block,
            registered_at,
            deadline,
        }
    }

    /// Has the deadline passed?
    ///
    /// Wall-clock deadlines are deferred while the expected chain is syncing.
    /// Unanchored block budgets never expire.
    pub fn is_expired(&self, now_ms: i64, view: ChainView) -> bool {
        match self.deadline {
            Deadline::AtBlock(b) => view.head.is_some_and(|h| h > b),
            Deadline::AfterBlocks(_) => false,
            Deadline::AtMillis(t) => !view.is_syncing && now_ms > t,
        }
    }
}

// ─── Expectation set ──────────────────────────────────────────────────────────

/// Pending expectations indexed by correlation key. The first registration
/// for a key wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpectationSet {
    pending: BTreeMap<CorrelationKey, PendingExpectation>,
}

impl ExpectationSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `exp` unless its key is already pending. Returns `true` if inserted.
    pub fn insert(&mut self, exp: PendingExpectation) -> bool {
        if self.pending.contains_key(&exp.key) {
            return false;
        }
        self.pending.insert(exp.key, exp);
        true
    }

    pub fn get(&self, key: &CorrelationKey) -> Option<&PendingExpectation> {
        self.pending.get(key)
    }

    pub fn contains(&self, key: &CorrelationKey) -> bool {
        self.pending.contains_key(key)
    }

    pub fn remove(&mut self, key: &CorrelationKey) -> Option<PendingExpectation> {
        self.pending.remove(key)
    }

    /// Pending era keys up to and including `era`.
    pub fn eras_up_to(&self, era: EraId) -> Vec<CorrelationKey> {
        self.pending
            .range(CorrelationKey::Era(0)..=CorrelationKey::Era(era))
            .map(|(k, _)| *k)
            .collect()
    }

    /// Anchor unanchored block budgets waiting on `chain` at `head`.
    /// Returns the updated entries.
    pub fn anchor(&mut self, chain: Chain, head: u64) -> Vec<PendingExpectation> {
        let mut anchored = Vec::new();
        for exp in self.pending.values_mut() {
            if exp.expected_chain != chain {
                continue;
            }
            if let Deadline::AfterBlocks(n) = exp.deadline {
                exp.deadline = Deadline::AtBlock(head.saturating_add(n));
                anchored.push(exp.clone());
            }
        }
        anchored
    }

    /// Entries whose deadline has passed, in key order.
    pub fn expired<F>(&self, now_ms: i64, view: F) -> Vec<PendingExpectation>
    where
        F: Fn(Chain) -> ChainView,
    {
        self.pending
            .values()
            .filter(|e| e.is_expired(now_ms, view(e.expected_chain)))
            .cloned()
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PendingExpectation> {
        self.pending.values()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl FromIterator<PendingExpectation> for ExpectationSet {
    fn from_iter<I: IntoIterator<Item = PendingExpectation>>(iter: I) -> Self {
        let mut set = Self::new();
        for exp in iter {
            set.insert(exp);
        }
        set
    }
}

// ─── Clock ────────────────────────────────────────────────────────────────────

/// Source of "now" for deadline sweeps and warning timestamps.
pub trait Clock: Send + Sync {
    /// Current unix time in milliseconds.
    fn now_ms(&self) -> i64;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Hand-driven clock for tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(now_ms: i64) -> Self {
        Self {
            now: AtomicI64::new(now_ms),
        }
    }

    pub fn set(&self, now_ms: i64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, ms: i64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}
