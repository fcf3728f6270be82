//! Error types for the eraindex pipeline.

use thiserror::Error;

/// Errors that can occur during indexing.
#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("RPC call timed out after {ms}ms")]
    Timeout { ms: u64 },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Malformed event type '{event_type}': expected exactly one '.' separator")]
    Format { event_type: String },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Correlation engine is no longer accepting work")]
    EngineClosed,

    #[error("Indexer aborted: {reason}")]
    Aborted { reason: String },

    #[error("{0}")]
    Other(String),
}

impl IndexerError {
    /// Returns `true` if retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Rpc(_) | Self::Timeout { .. } | Self::Storage(_))
    }

    /// Returns `true` for a malformed `pallet.eventName` string.
    pub fn is_format(&self) -> bool {
        matches!(self, Self::Format { .. })
    }
}

impl From<serde_json::Error> for IndexerError {
    fn from(e: serde_json::Error) -> Self {
        Self::Other(format!("serialization: {e}"))
    }
}
