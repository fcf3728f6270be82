//! Typed view of the tracked events the correlation engine reacts to.
//!
//! Payloads arrive as JSON. Field names are accepted in camelCase or
//! snake_case; positional arrays are accepted too. Integers may be JSON
//! numbers or strings (with or without thousands separators).

use std::borrow::Cow;

use serde_json::Value;

use crate::types::{Chain, ChainEvent, EraId, SessionId};

/// Election phase name meaning "no election running".
pub const PHASE_OFF: &str = "Off";
/// Election phase name for the governance fallback.
pub const PHASE_EMERGENCY: &str = "Emergency";

/// Pallets the engine reacts to, in their on-chain spelling.
const PALLETS: [&str; 6] = [
    "session",
    "staking",
    "stakingAhClient",
    "stakingRcClient",
    "multiBlockElection",
    "multiBlockElectionVerifier",
];

/// An event the engine acts on. Anything else tracked is stored only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    /// RC `session.NewSession`.
    NewSession { session: SessionId },
    /// RC `stakingAhClient.ValidatorSetReceived`.
    ValidatorSetReceived { era: EraId },
    /// RC `stakingAhClient.CouldNotMergeAndDropped` / `SetTooSmallAndDropped`.
    ValidatorSetDropped { event: String },
    /// `*.Unexpected` from one of the staking pallets.
    PalletUnexpected { event_type: String, detail: String },
    /// AH `staking.SessionRotated`.
    SessionRotated {
        starting_session: SessionId,
        active_era: EraId,
        planned_era: Option<EraId>,
    },
    /// AH `staking.EraPaid`.
    EraPaid { era: EraId },
    /// AH `staking.PagedElectionProceeded`.
    PagedElectionProceeded { page: Option<u32>, failed: bool },
    /// AH `stakingRcClient.SessionReportReceived`.
    SessionReportReceived {
        end_index: SessionId,
        validator_points: Option<u64>,
    },
    /// AH `multiBlockElection.PhaseTransitioned`.
    PhaseTransitioned { from: String, to: String },
    /// AH `multiBlockElectionVerifier.VerificationFailed`.
    VerificationFailed { detail: String },
    /// Tracked but no engine effect.
    Stored,
}

impl Signal {
    /// Classify `event`. Returns `Err` with a reason when a recognised event
    /// carries a payload the engine cannot read.
    pub fn parse(event: &ChainEvent) -> Result<Self, String> {
        let data = &event.data;
        let event_type = canonical_type(&event.event_type);
        let signal = match (event.chain, event_type.as_ref()) {
            (Chain::RelayChain, "session.NewSession") => Self::NewSession {
                session: required(data, &["sessionIndex", "session_index"], 0)?,
            },
            (Chain::RelayChain, "stakingAhClient.ValidatorSetReceived") => {
                Self::ValidatorSetReceived {
                    era: required(data, &["id"], 0)?,
                }
            }
            (
                Chain::RelayChain,
                "stakingAhClient.CouldNotMergeAndDropped" | "stakingAhClient.SetTooSmallAndDropped",
            ) => Self::ValidatorSetDropped {
                event: event_type.to_string(),
            },
            (
                _,
                "stakingAhClient.Unexpected" | "stakingRcClient.Unexpected" | "staking.Unexpected",
            ) => Self::PalletUnexpected {
                event_type: event_type.to_string(),
                detail: describe(data),
            },
            (Chain::AssetHub, "staking.SessionRotated") => Self::SessionRotated {
                starting_session: required(data, &["startingSession", "starting_session"], 0)?,
                active_era: required(data, &["activeEra", "active_era"], 1)?,
                planned_era: optional(data, &["plannedEra", "planned_era"], 2),
            },
            (Chain::AssetHub, "staking.EraPaid") => Self::EraPaid {
                era: required(data, &["eraIndex", "era_index"], 0)?,
            },
            (Chain::AssetHub, "staking.PagedElectionProceeded") => Self::PagedElectionProceeded {
                page: optional(data, &["page"], 0),
                failed: field(data, &["result"], 1).is_some_and(is_err_result),
            },
            (Chain::AssetHub, "stakingRcClient.SessionReportReceived") => {
                Self::SessionReportReceived {
                    end_index: required(data, &["endIndex", "end_index"], 0)?,
                    validator_points: field(
                        data,
                        &["validatorPointsCounts", "validator_points_counts"],
                        2,
                    )
                    .and_then(points_total),
                }
            }
            (Chain::AssetHub, "multiBlockElection.PhaseTransitioned") => {
                let from = field(data, &["from"], 0).and_then(phase_name);
                let to = field(data, &["to"], 1).and_then(phase_name);
                match (from, to) {
                    (Some(from), Some(to)) => Self::PhaseTransitioned { from, to },
                    _ => return Err("missing or unreadable phase".into()),
                }
            }
            (Chain::AssetHub, "multiBlockElectionVerifier.VerificationFailed") => {
                Self::VerificationFailed {
                    detail: describe(data),
                }
            }
            _ => Self::Stored,
        };
        Ok(signal)
    }
}

/// Rewrite a known pallet name, matched case-insensitively, to its canonical
/// spelling. The event name is left as is.
fn canonical_type(event_type: &str) -> Cow<'_, str> {
    let Some((pallet, name)) = event_type.split_once('.') else {
        return Cow::Borrowed(event_type);
    };
    match PALLETS.iter().find(|p| p.eq_ignore_ascii_case(pallet)) {
        Some(p) if *p != pallet => Cow::Owned(format!("{p}.{name}")),
        _ => Cow::Borrowed(event_type),
    }
}

// ─── Payload helpers ──────────────────────────────────────────────────────────

/// Look up a field by any of `names`, falling back to `position` in an array.
fn field<'a>(data: &'a Value, names: &[&str], position: usize) -> Option<&'a Value> {
    match data {
        Value::Object(map) => names.iter().find_map(|n| map.get(*n)),
        Value::Array(items) => items.get(position),
        _ => None,
    }
}

fn as_u64(v: &Value) -> Option<u64> {
    match v {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.replace(',', "").trim().parse().ok(),
        _ => None,
    }
}

fn optional<T: TryFrom<u64>>(data: &Value, names: &[&str], position: usize) -> Option<T> {
    field(data, names, position)
        .and_then(as_u64)
        .and_then(|n| T::try_from(n).ok())
}

fn required<T: TryFrom<u64>>(data: &Value, names: &[&str], position: usize) -> Result<T, String> {
    optional(data, names, position).ok_or_else(|| format!("missing or invalid field '{}'", names[0]))
}

/// `Err` results come through as `{"Err": ..}`, `{"err": ..}` or a bare `"Err"` string.
fn is_err_result(v: &Value) -> bool {
    match v {
        Value::Object(map) => map.keys().any(|k| k.eq_ignore_ascii_case("err")),
        Value::String(s) => s.to_ascii_lowercase().starts_with("err"),
        _ => false,
    }
}

/// Phase variants are either a bare name or a single-key object carrying a
/// round number. Names are normalised to start with an upper-case letter.
fn phase_name(v: &Value) -> Option<String> {
    let raw = match v {
        Value::String(s) => s.as_str(),
        Value::Object(map) if map.len() == 1 => map.keys().next()?.as_str(),
        _ => return None,
    };
    let mut chars = raw.chars();
    let first = chars.next()?;
    Some(first.to_ascii_uppercase().to_string() + chars.as_str())
}

/// A single count, or a list of counts / `[who, points]` pairs to sum.
fn points_total(v: &Value) -> Option<u64> {
    match v {
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::Array(pair) => pair.get(1).and_then(as_u64),
                other => as_u64(other),
            })
            .sum(),
        other => as_u64(other),
    }
}

fn describe(data: &Value) -> String {
    match data {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EventId;
    use serde_json::json;

    fn ev(chain: Chain, event_type: &str, data: Value) -> ChainEvent {
        ChainEvent {
            chain,
            block_number: 10,
            id: EventId::new(10, 0),
            event_type: event_type.into(),
            data,
        }
    }

    #[test]
    fn pallet_name_case_is_ignored() {
        let e = ev(Chain::RelayChain, "StakingAhClient.ValidatorSetReceived", json!({"id": 7}));
        assert_eq!(Signal::parse(&e).unwrap(), Signal::ValidatorSetReceived { era: 7 });

        let e = ev(Chain::AssetHub, "Staking.Unexpected", json!("UnknownValidatorActivation"));
        assert!(matches!(
            Signal::parse(&e).unwrap(),
            Signal::PalletUnexpected { event_type, .. } if event_type == "staking.Unexpected"
        ));

        // event names stay exact
        let e = ev(Chain::RelayChain, "session.newsession", json!({"sessionIndex": 3}));
        assert_eq!(Signal::parse(&e).unwrap(), Signal::Stored);
    }

    #[test]
    fn camel_and_snake_case_fields() {
        let a = ev(
            Chain::AssetHub,
            "staking.SessionRotated",
            json!({"startingSession": 510, "activeEra": 101, "plannedEra": 102}),
        );
        let b = ev(
            Chain::AssetHub,
            "staking.SessionRotated",
            json!({"starting_session": "510", "active_era": 101}),
        );
        assert_eq!(
            Signal::parse(&a).unwrap(),
            Signal::SessionRotated {
                starting_session: 510,
                active_era: 101,
                planned_era: Some(102)
            }
        );
        assert_eq!(
            Signal::parse(&b).unwrap(),
            Signal::SessionRotated {
                starting_session: 510,
                active_era: 101,
                planned_era: None
            }
        );
    }

    #[test]
    fn positional_payload_and_formatted_numbers() {
        let e = ev(Chain::RelayChain, "session.NewSession", json!(["1,234"]));
        assert_eq!(Signal::parse(&e).unwrap(), Signal::NewSession { session: 1_234 });
    }

    #[test]
    fn chain_role_matters() {
        let e = ev(Chain::AssetHub, "session.NewSession", json!({"sessionIndex": 1}));
        assert_eq!(Signal::parse(&e).unwrap(), Signal::Stored);
    }

    #[test]
    fn missing_required_field_is_reported() {
        let e = ev(Chain::AssetHub, "staking.EraPaid", json!({"validatorPayout": 1}));
        assert!(Signal::parse(&e).unwrap_err().contains("eraIndex"));
    }

    #[test]
    fn election_result_error_detection() {
        let failed = ev(
            Chain::AssetHub,
            "staking.PagedElectionProceeded",
            json!({"page": 2, "result": {"Err": 0}}),
        );
        let ok = ev(
            Chain::AssetHub,
            "staking.PagedElectionProceeded",
            json!({"page": 2, "result": {"Ok": 120}}),
        );
        assert_eq!(
            Signal::parse(&failed).unwrap(),
            Signal::PagedElectionProceeded { page: Some(2), failed: true }
        );
        assert_eq!(
            Signal::parse(&ok).unwrap(),
            Signal::PagedElectionProceeded { page: Some(2), failed: false }
        );
    }

    #[test]
    fn phase_names_are_normalised() {
        let e = ev(
            Chain::AssetHub,
            "multiBlockElection.PhaseTransitioned",
            json!({"from": "off", "to": {"snapshot": 32}}),
        );
        assert_eq!(
            Signal::parse(&e).unwrap(),
            Signal::PhaseTransitioned { from: "Off".into(), to: "Snapshot".into() }
        );
    }

    #[test]
    fn session_report_points_summed() {
        let e = ev(
            Chain::AssetHub,
            "stakingRcClient.SessionReportReceived",
            json!({"endIndex": 41, "validatorPointsCounts": [["alice", 20], ["bob", 40]]}),
        );
        assert_eq!(
            Signal::parse(&e).unwrap(),
            Signal::SessionReportReceived { end_index: 41, validator_points: Some(60) }
        );
    }
}
