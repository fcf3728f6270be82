//! Shared record types for the indexing pipeline.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Era index as reported by the staking pallet.
pub type EraId = u32;
/// Session index as reported by the session pallet.
pub type SessionId = u32;

// ─── Chain ────────────────────────────────────────────────────────────────────

/// The two fixed chain roles this indexer follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Chain {
    /// Base chain hosting the session pallet and the AH staking client.
    RelayChain,
    /// Dependent chain hosting staking and the multi-block election pallets.
    AssetHub,
}

impl Chain {
    pub const ALL: [Chain; 2] = [Chain::RelayChain, Chain::AssetHub];

    /// Stable slug used for storage keys and log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RelayChain => "relay_chain",
            Self::AssetHub => "asset_hub",
        }
    }

    /// Parse a slug produced by [`Chain::as_str`].
    pub fn from_slug(slug: &str) -> Option<Self> {
        match slug {
            "relay_chain" => Some(Self::RelayChain),
            "asset_hub" => Some(Self::AssetHub),
            _ => None,
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RelayChain => write!(f, "RC"),
            Self::AssetHub => write!(f, "AH"),
        }
    }
}

// ─── Block / Event ────────────────────────────────────────────────────────────

/// An ingested block. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub chain: Chain,
    pub number: u64,
    /// Unix timestamp in milliseconds (from the timestamp pallet).
    pub timestamp: i64,
}

/// Unique event identifier: block number plus position inside the block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId {
    pub block_number: u64,
    pub index: u32,
}

impl EventId {
    pub fn new(block_number: u64, index: u32) -> Self {
        Self { block_number, index }
    }

    /// Parse the `"{block}-{index}"` form.
    pub fn parse(s: &str) -> Option<Self> {
        let (block, index) = s.split_once('-')?;
        Some(Self {
            block_number: block.parse().ok()?,
            index: index.parse().ok()?,
        })
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.block_number, self.index)
    }
}

/// A tracked on-chain event. `(chain, id)` is the idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainEvent {
    pub chain: Chain,
    pub block_number: u64,
    pub id: EventId,
    /// `pallet.eventName`, e.g. `"staking.SessionRotated"`.
    pub event_type: String,
    /// Event payload as delivered by the RPC collaborator.
    pub data: serde_json::Value,
}

// ─── Era / Session ────────────────────────────────────────────────────────────

/// A staking era. Open while `session_end` is `None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Era {
    pub era_id: EraId,
    pub session_start: SessionId,
    /// Last session of the era. Never revised once set.
    pub session_end: Option<SessionId>,
    /// Unix ms of the block that opened the era.
    pub start_time: i64,
}

impl Era {
    pub fn is_open(&self) -> bool {
        self.session_end.is_none()
    }

    /// Returns `true` if `session` falls inside this era's known range.
    pub fn contains_session(&self, session: SessionId) -> bool {
        session >= self.session_start && self.session_end.map_or(true, |end| session <= end)
    }
}

/// A validator-rotation session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: SessionId,
    /// Block in which the session boundary was observed.
    pub block_number: u64,
    /// Unix ms of that block.
    pub activation_timestamp: i64,
    pub era_id: Option<EraId>,
    pub active_era_id: Option<EraId>,
    pub planned_era_id: Option<EraId>,
    pub validator_points_total: Option<u64>,
}

impl Session {
    pub fn new(session_id: SessionId, block: &Block) -> Self {
        Self {
            session_id,
            block_number: block.number,
            activation_timestamp: block.timestamp,
            era_id: None,
            active_era_id: None,
            planned_era_id: None,
            validator_points_total: None,
        }
    }

    /// Copy every field that is still `None` here from `other`.
    /// Returns `true` if anything changed.
    pub fn fill_from(&mut self, other: &Session) -> bool {
        let before = self.clone();
        self.era_id = self.era_id.or(other.era_id);
        self.active_era_id = self.active_era_id.or(other.active_era_id);
        self.planned_era_id = self.planned_era_id.or(other.planned_era_id);
        self.validator_points_total = self.validator_points_total.or(other.validator_points_total);
        *self != before
    }
}

// ─── Warning ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningType {
    Timing,
    MissingEvent,
    UnexpectedEvent,
    ElectionIssue,
}

impl WarningType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timing => "timing",
            Self::MissingEvent => "missing_event",
            Self::UnexpectedEvent => "unexpected_event",
            Self::ElectionIssue => "election_issue",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "timing" => Some(Self::Timing),
            "missing_event" => Some(Self::MissingEvent),
            "unexpected_event" => Some(Self::UnexpectedEvent),
            "election_issue" => Some(Self::ElectionIssue),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "info" => Some(Self::Info),
            "warning" => Some(Self::Warning),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// An append-only anomaly record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Warning {
    pub era_id: Option<EraId>,
    pub session_id: Option<SessionId>,
    pub block_number: u64,
    #[serde(rename = "type")]
    pub kind: WarningType,
    pub severity: Severity,
    pub message: String,
    /// Unix ms at detection time. Not part of the content key.
    pub timestamp: i64,
}

impl Warning {
    /// Idempotency key: every field except the detection timestamp.
    pub fn content_key(&self) -> String {
        fn opt(v: Option<u32>) -> String {
            v.map(|v| v.to_string()).unwrap_or_else(|| "-".into())
        }
        format!(
            "{}:{}:{}:{}:{}:{}",
            self.kind.as_str(),
            self.severity.as_str(),
            opt(self.era_id),
            opt(self.session_id),
            self.block_number,
            self.message
        )
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
