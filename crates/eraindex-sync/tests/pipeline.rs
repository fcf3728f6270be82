//! End-to-end pipeline tests: scripted RPC → syncers → engine worker → store.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use eraindex_core::config::ChainConfig;
use eraindex_core::expectation::ManualClock;
use eraindex_core::retry::RetryConfig;
use eraindex_core::{
    BlockEvents, Chain, ChainRpc, DomainEvent, IndexStore, IndexerError, IndexerState, MemoryStore,
    RawEvent, Warning, WarningType,
};
use eraindex_sync::{Indexer, IndexerBuilder};

// ─── Scripted RPC ─────────────────────────────────────────────────────────────

#[derive(Default)]
struct Script {
    height: u64,
    blocks: BTreeMap<u64, Vec<RawEvent>>,
    down: bool,
}

#[derive(Default)]
struct MockRpc {
    chains: Mutex<HashMap<Chain, Script>>,
}

impl MockRpc {
    fn set_height(&self, chain: Chain, height: u64) {
        self.chains.lock().unwrap().entry(chain).or_default().height = height;
    }

    fn set_down(&self, chain: Chain, down: bool) {
        self.chains.lock().unwrap().entry(chain).or_default().down = down;
    }

    fn push(&self, chain: Chain, number: u64, event_type: &str, data: Value) {
        let mut chains = self.chains.lock().unwrap();
        let events = chains.entry(chain).or_default().blocks.entry(number).or_default();
        let index = events.len() as u32;
        events.push(RawEvent {
            index,
            event_type: event_type.into(),
            data,
        });
    }

    /// Deliver an event twice under the same index.
    fn push_duplicate(&self, chain: Chain, number: u64) {
        let mut chains = self.chains.lock().unwrap();
        let events = chains.entry(chain).or_default().blocks.entry(number).or_default();
        let last = events.last().cloned().unwrap();
        events.push(last);
    }
}

#[async_trait]
impl ChainRpc for MockRpc {
    async fn get_current_height(&self, chain: Chain) -> Result<u64, IndexerError> {
        let chains = self.chains.lock().unwrap();
        match chains.get(&chain) {
            Some(s) if s.down => Err(IndexerError::Rpc(format!("{chain} unreachable"))),
            Some(s) => Ok(s.height),
            None => Ok(0),
        }
    }

    async fn get_block_events(&self, chain: Chain, number: u64) -> Result<BlockEvents, IndexerError> {
        let chains = self.chains.lock().unwrap();
        let script = chains.get(&chain);
        if script.is_some_and(|s| s.down) {
            return Err(IndexerError::Rpc(format!("{chain} unreachable")));
        }
        Ok(BlockEvents {
            number,
            timestamp: number as i64 * 6_000,
            events: script
                .and_then(|s| s.blocks.get(&number).cloned())
                .unwrap_or_default(),
        })
    }
}

// ─── Helpers ──────────────────────────────────────────────────────────────────

fn fast_chain() -> ChainConfig {
    ChainConfig {
        rpc_urls: vec![],
        backfill_depth: 1_000,
        poll_interval_ms: 10,
        degraded_interval_ms: 20,
        rpc_timeout_ms: 500,
        retry: RetryConfig {
            max_retries: 1,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            multiplier: 2.0,
        },
    }
}

async fn start(rpc: &Arc<MockRpc>, store: &Arc<MemoryStore>, clock: &Arc<ManualClock>) -> Indexer {
    IndexerBuilder::new()
        .chain_config(Chain::RelayChain, fast_chain())
        .chain_config(Chain::AssetHub, fast_chain())
        .sweep_interval_ms(10)
        .rpc(rpc.clone())
        .store(store.clone())
        .clock(clock.clone())
        .start()
        .await
        .unwrap()
}

async fn wait_state<F>(indexer: &Indexer, chain: Chain, mut pred: F) -> IndexerState
where
    F: FnMut(&IndexerState) -> bool,
{
    let mut rx = indexer.watch(chain).unwrap();
    let state = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| pred(s)))
        .await
        .expect("timed out waiting for sync state")
        .expect("syncer stopped")
        .clone();
    state
}

async fn wait_until<F: FnMut() -> bool>(mut pred: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !pred() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn missing(store: &MemoryStore) -> Vec<Warning> {
    store
        .warnings()
        .into_iter()
        .filter(|w| w.kind == WarningType::MissingEvent)
        .collect()
}

fn rotated(session: u32, active: u32) -> Value {
    json!({"startingSession": session, "activeEra": active, "plannedEra": active + 1})
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn era_closes_when_next_era_starts() {
    let rpc = Arc::new(MockRpc::default());
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(0));
    rpc.push(Chain::AssetHub, 5, "staking.SessionRotated", rotated(500, 100));
    rpc.push(Chain::AssetHub, 8, "staking.SessionRotated", rotated(505, 100));
    rpc.push(Chain::AssetHub, 11, "staking.SessionRotated", rotated(510, 101));

    let indexer = start(&rpc, &store, &clock).await;
    let mut events = indexer.subscribe();
    wait_state(&indexer, Chain::AssetHub, |s| !s.is_syncing && s.last_error.is_none()).await;
    rpc.set_height(Chain::AssetHub, 13);

    let state = wait_state(&indexer, Chain::AssetHub, |s| s.last_processed_block >= 13).await;
    assert_eq!(state.current_era, Some(101));
    assert_eq!(state.current_session, Some(510));

    let eras = store.get_recent_eras(5).await.unwrap();
    assert_eq!(eras.len(), 2);
    assert_eq!(eras[0].era_id, 101);
    assert!(eras[0].is_open());
    assert_eq!(eras[0].session_start, 510);
    assert_eq!(eras[1].era_id, 100);
    assert_eq!(eras[1].session_start, 500);
    assert_eq!(eras[1].session_end, Some(509));

    let mut closed = false;
    while let Ok(event) = events.try_recv() {
        if let DomainEvent::EraUpdate(era) = event {
            closed |= era.era_id == 100 && era.session_end == Some(509);
        }
    }
    assert!(closed, "no EraUpdate for the closed era was published");
    assert!(store.warnings().is_empty());

    indexer.shutdown().await.unwrap();
}

#[tokio::test]
async fn duplicate_event_is_stored_once() {
    let rpc = Arc::new(MockRpc::default());
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(0));
    rpc.push(Chain::RelayChain, 3, "session.NewSession", json!({"sessionIndex": 42}));
    rpc.push_duplicate(Chain::RelayChain, 3);
    rpc.set_height(Chain::RelayChain, 4);

    let indexer = start(&rpc, &store, &clock).await;
    wait_state(&indexer, Chain::RelayChain, |s| s.last_processed_block >= 4).await;

    assert_eq!(store.event_count(), 1);
    let sessions = store.get_recent_sessions(10).await.unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].session_id, 42);
    assert_eq!(sessions[0].block_number, 3);

    indexer.shutdown().await.unwrap();
}

#[tokio::test]
async fn missing_event_is_raised_exactly_once() {
    let rpc = Arc::new(MockRpc::default());
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(0));
    rpc.push(
        Chain::RelayChain,
        2,
        "stakingAhClient.ValidatorSetReceived",
        json!({"id": 7}),
    );
    rpc.set_height(Chain::RelayChain, 3);
    rpc.set_height(Chain::AssetHub, 5);

    let indexer = start(&rpc, &store, &clock).await;
    wait_state(&indexer, Chain::RelayChain, |s| s.last_processed_block >= 3).await;
    wait_state(&indexer, Chain::AssetHub, |s| s.last_processed_block >= 5 && !s.is_syncing).await;
    assert_eq!(store.load_pending_expectations().await.unwrap().len(), 1);
    assert!(store.warnings().is_empty());

    // past the 2h era activation deadline
    clock.set(12_000 + 7_200_000 + 1);
    wait_until(|| !missing(&store).is_empty()).await;

    // several more sweep ticks
    clock.advance(60_000);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let warnings = missing(&store);
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].era_id, Some(7));
    assert_eq!(warnings[0].block_number, 2);
    assert!(store.load_pending_expectations().await.unwrap().is_empty());

    indexer.shutdown().await.unwrap();
}

#[tokio::test]
async fn malformed_and_untracked_events_do_not_affect_the_block() {
    let rpc = Arc::new(MockRpc::default());
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(0));
    rpc.push(Chain::RelayChain, 3, "staking.Slash.Reported", json!({}));
    rpc.push(Chain::RelayChain, 3, "balances.Transfer", json!({"amount": 10}));
    rpc.push(Chain::RelayChain, 3, "session.NewSession", json!({"sessionIndex": 42}));
    rpc.push(Chain::RelayChain, 3, "nopallet", json!(null));
    rpc.set_height(Chain::RelayChain, 5);

    let indexer = start(&rpc, &store, &clock).await;
    let state = wait_state(&indexer, Chain::RelayChain, |s| s.last_processed_block >= 5).await;
    assert_eq!(state.last_error, None);
    assert_eq!(state.error_count, 0);
    assert_eq!(state.current_session, Some(42));

    let events = store.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, "session.NewSession");
    assert_eq!(events[0].block_number, 3);
    assert_eq!(events[0].id.index, 2);
    assert!(store.warnings().is_empty());

    indexer.shutdown().await.unwrap();
}

#[tokio::test]
async fn cursor_survives_restart_and_never_decreases() {
    let rpc = Arc::new(MockRpc::default());
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(0));
    rpc.push(Chain::AssetHub, 12, "staking.SessionRotated", rotated(500, 100));
    rpc.set_height(Chain::AssetHub, 20);

    let indexer = start(&rpc, &store, &clock).await;
    wait_state(&indexer, Chain::AssetHub, |s| s.last_processed_block >= 20).await;
    indexer.shutdown().await.unwrap();
    let blocks_before = store.block_count();

    // the node now reports a lower tip
    rpc.set_height(Chain::AssetHub, 15);
    let indexer = start(&rpc, &store, &clock).await;
    let state = wait_state(&indexer, Chain::AssetHub, |s| s.current_height == 15).await;
    assert_eq!(state.last_processed_block, 20);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let persisted = store.get_indexer_state(Chain::AssetHub).await.unwrap().unwrap();
    assert_eq!(persisted.last_processed_block, 20);
    assert_eq!(persisted.current_era, Some(100));
    assert_eq!(store.block_count(), blocks_before);
    assert_eq!(store.event_count(), 1);

    rpc.set_height(Chain::AssetHub, 22);
    wait_state(&indexer, Chain::AssetHub, |s| s.last_processed_block >= 22).await;
    assert_eq!(store.event_count(), 1);

    indexer.shutdown().await.unwrap();
}

#[tokio::test]
async fn asset_hub_outage_does_not_stall_relay_chain() {
    let rpc = Arc::new(MockRpc::default());
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(0));
    rpc.set_down(Chain::AssetHub, true);
    rpc.set_height(Chain::AssetHub, 5);
    rpc.push(Chain::RelayChain, 3, "session.NewSession", json!({"sessionIndex": 9}));
    rpc.set_height(Chain::RelayChain, 10);

    let indexer = start(&rpc, &store, &clock).await;
    let ah = wait_state(&indexer, Chain::AssetHub, |s| s.last_error.is_some()).await;
    assert!(!ah.is_syncing);
    assert!(ah.error_count >= 1);

    let rc = wait_state(&indexer, Chain::RelayChain, |s| s.last_processed_block >= 10).await;
    assert_eq!(rc.last_error, None);
    assert_eq!(rc.error_count, 0);
    assert_eq!(rc.current_session, Some(9));

    rpc.set_down(Chain::AssetHub, false);
    let ah = wait_state(&indexer, Chain::AssetHub, |s| {
        s.last_processed_block >= 5 && s.last_error.is_none()
    })
    .await;
    assert!(!ah.is_syncing);

    indexer.shutdown().await.unwrap();
}
