//! Per-chain sync progress.

use serde::{Deserialize, Serialize};

use crate::types::{Chain, EraId, SessionId};

/// Sync progress of one chain's syncer. One row per chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexerState {
    pub chain: Chain,
    /// Last block whose effects were durably committed.
    pub last_processed_block: u64,
    /// Chain tip at the last refresh.
    pub current_height: u64,
    /// Block the current cycle walks to.
    pub target_block: u64,
    pub is_syncing: bool,
    pub current_era: Option<EraId>,
    pub current_session: Option<SessionId>,
    /// Cumulative count of failed cycles.
    pub error_count: u64,
    pub last_error: Option<String>,
    /// Unix ms of the last mutation.
    pub updated_at: i64,
}

impl IndexerState {
    /// Placeholder published before the chain has been contacted. Reported as
    /// syncing so nothing is judged against a chain we have not caught up with.
    pub fn unknown(chain: Chain) -> Self {
        Self {
            chain,
            last_processed_block: 0,
            current_height: 0,
            target_block: 0,
            is_syncing: true,
            current_era: None,
            current_session: None,
            error_count: 0,
            last_error: None,
            updated_at: now_ms(),
        }
    }

    /// Fresh state for a chain seen for the first time.
    ///
    /// The cursor starts `backfill_depth` blocks behind `height`, saturating at zero.
    pub fn cold_start(chain: Chain, height: u64, backfill_depth: u64) -> Self {
        let cursor = height.saturating_sub(backfill_depth);
        Self {
            chain,
            last_processed_block: cursor,
            current_height: height,
            target_block: height,
            is_syncing: cursor < height,
            current_era: None,
            current_session: None,
            error_count: 0,
            last_error: None,
            updated_at: now_ms(),
        }
    }

    /// Record a fresh chain tip. Never lowers `target_block`.
    pub fn refresh(&mut self, height: u64) {
        self.current_height = height;
        self.target_block = self.target_block.max(height);
        self.is_syncing = self.last_processed_block < height;
        self.updated_at = now_ms();
    }

    /// The state to commit alongside `block`. Clears `last_error`.
    ///
    /// The cursor never moves backwards.
    pub fn advanced_to(&self, block: u64) -> Self {
        let mut next = self.clone();
        next.last_processed_block = self.last_processed_block.max(block);
        next.is_syncing = next.last_processed_block < next.current_height;
        next.last_error = None;
        next.updated_at = now_ms();
        next
    }

    /// Forget the last error after a clean cycle. Returns `true` if there was one.
    pub fn clear_error(&mut self) -> bool {
        let had = self.last_error.take().is_some();
        if had {
            self.updated_at = now_ms();
        }
        had
    }

    /// Mark a failed cycle. The cursor is left untouched.
    pub fn record_error(&mut self, error: impl ToString) {
        self.error_count += 1;
        self.last_error = Some(error.to_string());
        self.updated_at = now_ms();
    }

    /// Retries were exhausted: stop claiming to sync until the next good refresh.
    pub fn degrade(&mut self, error: impl ToString) {
        self.record_error(error);
        self.is_syncing = false;
    }

    /// Blocks between the cursor and the tip.
    pub fn lag(&self) -> u64 {
        self.current_height.saturating_sub(self.last_processed_block)
    }
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cold_start_backfills_and_saturates() {
        let s = IndexerState::cold_start(Chain::AssetHub, 5_000, 1_000);
        assert_eq!(s.last_processed_block, 4_000);
        assert!(s.is_syncing);
        assert_eq!(s.lag(), 1_000);

        let s = IndexerState::cold_start(Chain::RelayChain, 300, 1_000);
        assert_eq!(s.last_processed_block, 0);
    }

    #[test]
    fn advance_never_moves_backwards() {
        let s = IndexerState::cold_start(Chain::RelayChain, 100, 10);
        let a = s.advanced_to(95);
        assert_eq!(a.last_processed_block, 95);
        let b = a.advanced_to(93);
        assert_eq!(b.last_processed_block, 95);
        let done = b.advanced_to(100);
        assert!(!done.is_syncing);
    }

    #[test]
    fn errors_accumulate_and_success_clears_last_error() {
        let mut s = IndexerState::cold_start(Chain::AssetHub, 100, 10);
        s.record_error("rpc down");
        s.degrade("rpc still down");
        assert_eq!(s.error_count, 2);
        assert!(!s.is_syncing);
        assert_eq!(s.last_error.as_deref(), Some("rpc still down"));

        s.refresh(120);
        assert!(s.is_syncing);
        assert_eq!(s.target_block, 120);
        let next = s.advanced_to(91);
        assert_eq!(next.last_error, None);
        assert_eq!(next.error_count, 2);
    }

    #[test]
    fn refresh_never_lowers_target() {
        let mut s = IndexerState::cold_start(Chain::AssetHub, 100, 10);
        s.refresh(90);
        assert_eq!(s.target_block, 100);
        assert_eq!(s.current_height, 90);
    }
}
