//! Outbound domain events for the serving layer.

use serde::{Deserialize, Serialize};

use crate::indexer::IndexerState;
use crate::types::{Era, Session, Warning};

/// Published on the broadcast channel after the matching commit succeeded.
///
/// Serialized as `{"type": "...", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum DomainEvent {
    EraUpdate(Era),
    SessionUpdate(Session),
    ElectionPhaseChange {
        from: String,
        to: String,
        block_number: u64,
    },
    NewWarning(Warning),
    /// A chain committed a block; carries that chain's sync state.
    BlockUpdate(IndexerState),
}

impl DomainEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::EraUpdate(_) => "era_update",
            Self::SessionUpdate(_) => "session_update",
            Self::ElectionPhaseChange { .. } => "election_phase_change",
            Self::NewWarning(_) => "new_warning",
            Self::BlockUpdate(_) => "block_update",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adjacently_tagged_wire_format() {
        let ev = DomainEvent::EraUpdate(Era {
            era_id: 100,
            session_start: 500,
            session_end: Some(509),
            start_time: 1,
        });
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "era_update");
        assert_eq!(v["data"]["session_end"], 509);
        assert_eq!(ev.kind(), "era_update");

        let phase = DomainEvent::ElectionPhaseChange {
            from: "Off".into(),
            to: "Snapshot".into(),
            block_number: 9,
        };
        let v = serde_json::to_value(&phase).unwrap();
        assert_eq!(v["type"], "election_phase_change");
        assert_eq!(v["data"]["to"], "Snapshot");
    }
}
