//! Indexer configuration.
//!
//! Everything operator-tunable lives here: RPC endpoints, backfill depth,
//! cross-chain expectation deadlines and timing thresholds. Every field has a
//! serde default so a partial JSON document is a valid config.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::IndexerError;
use crate::logging::LogConfig;
use crate::retry::RetryConfig;
use crate::types::Chain;

/// Per-chain syncer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    /// RPC endpoints, handed to the RPC collaborator (which owns failover).
    pub rpc_urls: Vec<String>,
    /// On cold start, begin this many blocks behind the tip.
    pub backfill_depth: u64,
    /// Pause between sync cycles once caught up.
    pub poll_interval_ms: u64,
    /// Pause between cycles after retries were exhausted.
    pub degraded_interval_ms: u64,
    /// Upper bound for a single RPC call.
    pub rpc_timeout_ms: u64,
    pub retry: RetryConfig,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            rpc_urls: vec![],
            backfill_depth: 1_000,
            poll_interval_ms: 6_000,
            degraded_interval_ms: 60_000,
            rpc_timeout_ms: 10_000,
            retry: RetryConfig::default(),
        }
    }
}

impl ChainConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn degraded_interval(&self) -> Duration {
        Duration::from_millis(self.degraded_interval_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}

/// How long to wait for the expected event of a cross-chain expectation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadlineSpec {
    /// Blocks of the expected chain, counted from its head at registration.
    Blocks(u64),
    /// Wall-clock milliseconds after the trigger block's timestamp.
    Millis(u64),
}

/// Deadlines for each cross-chain expectation kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpectationConfig {
    /// RC `session.NewSession` → AH `stakingRcClient.SessionReportReceived`.
    pub session_report: DeadlineSpec,
    /// RC `stakingAhClient.ValidatorSetReceived` → AH `staking.SessionRotated`.
    pub era_activation: DeadlineSpec,
}

impl Default for ExpectationConfig {
    fn default() -> Self {
        Self {
            session_report: DeadlineSpec::Blocks(20),
            era_activation: DeadlineSpec::Millis(2 * 60 * 60 * 1_000),
        }
    }
}

/// A timing threshold with a soft margin above it.
///
/// `elapsed <= limit` is fine; `limit < elapsed <= limit + soft_margin` is
/// reported as `info`; anything beyond is a `warning`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Threshold {
    pub limit: u64,
    #[serde(default)]
    pub soft_margin: u64,
}

impl Threshold {
    pub const fn new(limit: u64, soft_margin: u64) -> Self {
        Self { limit, soft_margin }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Trigger-to-report latency for session reports (ms).
    pub session_report_ms: Threshold,
    /// Validator set receipt to era activation (ms).
    pub era_activation_ms: Threshold,
    /// Election start to election end on AH (blocks).
    pub election_blocks: Threshold,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            session_report_ms: Threshold::new(60_000, 30_000),
            era_activation_ms: Threshold::new(60 * 60 * 1_000, 10 * 60 * 1_000),
            election_blocks: Threshold::new(1_000, 200),
        }
    }
}

/// Settings consumed by the correlation engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub expectations: ExpectationConfig,
    pub timing: TimingConfig,
    /// Number of most recent sessions kept in the engine's working set.
    pub session_cache_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            expectations: ExpectationConfig::default(),
            timing: TimingConfig::default(),
            session_cache_size: 512,
        }
    }
}

/// Top-level configuration for an indexer process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    pub relay_chain: ChainConfig,
    pub asset_hub: ChainConfig,
    /// `expectations`, `timing` and `session_cache_size` sit at the top level.
    #[serde(flatten)]
    pub engine: EngineConfig,
    /// How often pending expectations are checked against their deadlines.
    pub sweep_interval_ms: u64,
    /// Capacity of the inbound engine queue shared by both syncers.
    pub queue_capacity: usize,
    /// Capacity of the outbound domain-event broadcast channel.
    pub broadcast_capacity: usize,
    pub log: LogConfig,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            relay_chain: ChainConfig::default(),
            asset_hub: ChainConfig::default(),
            engine: EngineConfig::default(),
            sweep_interval_ms: 5_000,
            queue_capacity: 256,
            broadcast_capacity: 1_024,
            log: LogConfig::default(),
        }
    }
}

impl IndexerConfig {
    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json(s: &str) -> Result<Self, IndexerError> {
        let config: Self =
            serde_json::from_str(s).map_err(|e| IndexerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn chain(&self, chain: Chain) -> &ChainConfig {
        match chain {
            Chain::RelayChain => &self.relay_chain,
            Chain::AssetHub => &self.asset_hub,
        }
    }

    pub fn chain_mut(&mut self, chain: Chain) -> &mut ChainConfig {
        match chain {
            Chain::RelayChain => &mut self.relay_chain,
            Chain::AssetHub => &mut self.asset_hub,
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Reject values that would stall or spin the pipeline.
    pub fn validate(&self) -> Result<(), IndexerError> {
        for chain in Chain::ALL {
            let c = self.chain(chain);
            if c.rpc_timeout_ms == 0 {
                return Err(IndexerError::Config(format!("{chain}: rpc_timeout_ms must be > 0")));
            }
            if c.poll_interval_ms == 0 || c.degraded_interval_ms == 0 {
                return Err(IndexerError::Config(format!(
                    "{chain}: poll and degraded intervals must be > 0"
                )));
            }
        }
        if self.sweep_interval_ms == 0 {
            return Err(IndexerError::Config("sweep_interval_ms must be > 0".into()));
        }
        if self.queue_capacity == 0 || self.broadcast_capacity == 0 {
            return Err(IndexerError::Config("channel capacities must be > 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let cfg = IndexerConfig::from_json("{}").unwrap();
        assert_eq!(cfg, IndexerConfig::default());
        assert_eq!(cfg.engine.session_cache_size, 512);
        assert_eq!(cfg.asset_hub.backfill_depth, 1_000);
    }

    #[test]
    fn partial_document_overrides() {
        let cfg = IndexerConfig::from_json(
            r#"{
                "asset_hub": { "rpc_urls": ["wss://ah.example"], "backfill_depth": 50 },
                "expectations": { "session_report": { "millis": 90000 } },
                "timing": { "election_blocks": { "limit": 300 } },
                "session_cache_size": 64
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.asset_hub.rpc_urls, vec!["wss://ah.example".to_string()]);
        assert_eq!(cfg.asset_hub.backfill_depth, 50);
        assert_eq!(cfg.asset_hub.rpc_timeout_ms, 10_000);
        assert_eq!(cfg.engine.expectations.session_report, DeadlineSpec::Millis(90_000));
        assert_eq!(
            cfg.engine.expectations.era_activation,
            ExpectationConfig::default().era_activation
        );
        assert_eq!(cfg.engine.timing.election_blocks, Threshold::new(300, 0));
        assert_eq!(cfg.engine.session_cache_size, 64);
    }

    #[test]
    fn serialized_config_reloads() {
        let json = serde_json::to_string_pretty(&IndexerConfig::default()).unwrap();
        assert!(json.contains("\"session_report\""));
        assert_eq!(IndexerConfig::from_json(&json).unwrap(), IndexerConfig::default());
    }

    #[test]
    fn zero_timeout_rejected() {
        let err = IndexerConfig::from_json(r#"{ "relay_chain": { "rpc_timeout_ms": 0 } }"#)
            .unwrap_err();
        assert!(matches!(err, IndexerError::Config(_)));
    }
}
