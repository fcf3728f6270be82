//! Chain RPC interface.
//!
//! The concrete client (WebSocket/HTTP, endpoint failover, reconnects) lives
//! outside this crate; the syncer only sees [`ChainRpc`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::IndexerError;
use crate::types::{Chain, ChainEvent, EventId};

/// One event as delivered by the node, before filtering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    /// Position inside the block.
    pub index: u32,
    /// `pallet.eventName`.
    pub event_type: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// A block's timestamp and its events in emission order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockEvents {
    pub number: u64,
    /// Unix ms.
    pub timestamp: i64,
    pub events: Vec<RawEvent>,
}

impl RawEvent {
    pub fn into_chain_event(self, chain: Chain, block_number: u64) -> ChainEvent {
        ChainEvent {
            chain,
            block_number,
            id: EventId::new(block_number, self.index),
            event_type: self.event_type,
            data: self.data,
        }
    }
}

#[async_trait]
pub trait ChainRpc: Send + Sync {
    /// Current best block number of `chain`.
    async fn get_current_height(&self, chain: Chain) -> Result<u64, IndexerError>;

    /// Timestamp and ordered events of block `number` on `chain`.
    async fn get_block_events(&self, chain: Chain, number: u64) -> Result<BlockEvents, IndexerError>;
}
