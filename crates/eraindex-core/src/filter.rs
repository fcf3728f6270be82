//! Event filter: decides which `pallet.eventName` strings are worth indexing.
//!
//! The allow-list is immutable once built. [`EventFilter::staking`] returns the
//! fixed list for the two chain roles; share it behind an `Arc`.

use std::collections::{HashMap, HashSet};

use crate::error::IndexerError;
use crate::types::Chain;

/// Event-name prefixes tracked for the AH `staking` pallet regardless of the
/// explicit allow-list.
pub const AH_STAKING_PREFIXES: &[&str] = &["Offence", "Slash"];

/// Split `pallet.eventName` into its two halves.
///
/// Fails unless the string contains exactly one `.`.
pub fn split(event_type: &str) -> Result<(&str, &str), IndexerError> {
    let mut parts = event_type.split('.');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(pallet), Some(event), None) => Ok((pallet, event)),
        _ => Err(IndexerError::Format {
            event_type: event_type.to_string(),
        }),
    }
}

/// What is tracked for one pallet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PalletRule {
    /// Every event emitted by the pallet.
    All,
    /// Only the listed event names (case-sensitive).
    Events(HashSet<String>),
}

impl PalletRule {
    fn allows(&self, event: &str) -> bool {
        match self {
            Self::All => true,
            Self::Events(names) => names.contains(event),
        }
    }

    fn merge(&mut self, other: PalletRule) {
        match (self, other) {
            (Self::All, _) => {}
            (this, Self::All) => *this = Self::All,
            (Self::Events(a), Self::Events(b)) => a.extend(b),
        }
    }
}

/// Static allow-list keyed by chain and lower-cased pallet name.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    rules: HashMap<(Chain, String), PalletRule>,
}

impl EventFilter {
    /// An empty filter that tracks nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// The fixed allow-list for Relay Chain + Asset Hub staking monitoring.
    pub fn staking() -> Self {
        Self::new()
            .allow(Chain::RelayChain, "session", ["NewSession"])
            .allow_all(Chain::RelayChain, "stakingAhClient")
            .allow(
                Chain::AssetHub,
                "staking",
                [
                    "EraPaid",
                    "SessionRotated",
                    "PagedElectionProceeded",
                    "ForceEra",
                    "Unexpected",
                ],
            )
            .allow_all(Chain::AssetHub, "stakingRcClient")
            .allow_all(Chain::AssetHub, "multiBlockElection")
            .allow_all(Chain::AssetHub, "multiBlockElectionVerifier")
            .allow(
                Chain::AssetHub,
                "multiBlockElectionSigned",
                ["Registered", "Rewarded", "Slashed", "Discarded"],
            )
    }

    /// Track the listed events of `pallet` on `chain`. Rules accumulate.
    pub fn allow<I, S>(mut self, chain: Chain, pallet: &str, events: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let rule = PalletRule::Events(events.into_iter().map(Into::into).collect());
        self.insert(chain, pallet, rule);
        self
    }

    /// Track every event of `pallet` on `chain`.
    pub fn allow_all(mut self, chain: Chain, pallet: &str) -> Self {
        self.insert(chain, pallet, PalletRule::All);
        self
    }

    fn insert(&mut self, chain: Chain, pallet: &str, rule: PalletRule) {
        let key = (chain, pallet.to_ascii_lowercase());
        match self.rules.get_mut(&key) {
            Some(existing) => existing.merge(rule),
            None => {
                self.rules.insert(key, rule);
            }
        }
    }

    /// Returns `true` if `event_type` on `chain` should be indexed.
    ///
    /// Malformed event types are never tracked.
    pub fn should_track(&self, chain: Chain, event_type: &str) -> bool {
        let Ok((pallet, event)) = split(event_type) else {
            return false;
        };
        let pallet = pallet.to_ascii_lowercase();

        let listed = self
            .rules
            .get(&(chain, pallet.clone()))
            .is_some_and(|rule| rule.allows(event));

        let prefixed = chain == Chain::AssetHub
            && pallet == "staking"
            && AH_STAKING_PREFIXES.iter().any(|p| event.starts_with(p));

        listed || prefixed
    }

    /// Number of (chain, pallet) rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
