//! SQLite storage backend for eraindex.
//!
//! Persists blocks, tracked events, the era/session timeline, warnings,
//! per-chain sync state and pending expectations to a single SQLite file.
//! Uses `sqlx` with WAL mode; every block and every sweep is one transaction.
//!
//! # Usage
//! ```rust,no_run
//! use eraindex_storage::sqlite::SqliteStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteStorage::open("./eraindex.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteStorage::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnection, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::{debug, warn};

use eraindex_core::error::IndexerError;
use eraindex_core::expectation::{CorrelationKey, Deadline, ExpectationKind, PendingExpectation};
use eraindex_core::indexer::IndexerState;
use eraindex_core::store::{merge_era, merge_state, BlockChangeset, IndexStore, SweepChangeset};
use eraindex_core::types::{Chain, ChainEvent, Era, EventId, Session, Severity, Warning, WarningType};

fn db(e: sqlx::Error) -> IndexerError {
    IndexerError::Storage(e.to_string())
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS blocks (
        chain        TEXT    NOT NULL,
        block_number INTEGER NOT NULL,
        timestamp    INTEGER NOT NULL,
        PRIMARY KEY (chain, block_number)
    );",
    "CREATE TABLE IF NOT EXISTS events (
        chain        TEXT    NOT NULL,
        block_number INTEGER NOT NULL,
        event_index  INTEGER NOT NULL,
        event_type   TEXT    NOT NULL,
        data_json    TEXT    NOT NULL,
        PRIMARY KEY (chain, block_number, event_index)
    );",
    "CREATE TABLE IF NOT EXISTS sessions (
        session_id             INTEGER PRIMARY KEY,
        block_number           INTEGER NOT NULL,
        activation_timestamp   INTEGER NOT NULL,
        era_id                 INTEGER,
        active_era_id          INTEGER,
        planned_era_id         INTEGER,
        validator_points_total INTEGER
    );",
    "CREATE TABLE IF NOT EXISTS eras (
        era_id        INTEGER PRIMARY KEY,
        session_start INTEGER NOT NULL,
        session_end   INTEGER,
        start_time    INTEGER NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS warnings (
        id           INTEGER PRIMARY KEY AUTOINCREMENT,
        content_key  TEXT    NOT NULL UNIQUE,
        era_id       INTEGER,
        session_id   INTEGER,
        block_number INTEGER NOT NULL,
        kind         TEXT    NOT NULL,
        severity     TEXT    NOT NULL,
        message      TEXT    NOT NULL,
        timestamp    INTEGER NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS indexer_state (
        chain                TEXT    PRIMARY KEY,
        last_processed_block INTEGER NOT NULL,
        current_height       INTEGER NOT NULL,
        target_block         INTEGER NOT NULL,
        is_syncing           INTEGER NOT NULL,
        current_era          INTEGER,
        current_session      INTEGER,
        error_count          INTEGER NOT NULL,
        last_error           TEXT,
        updated_at           INTEGER NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS expectations (
        key_kind         TEXT    NOT NULL,
        key_id           INTEGER NOT NULL,
        kind             TEXT    NOT NULL,
        expected_chain   TEXT    NOT NULL,
        expected_event   TEXT    NOT NULL,
        registered_block INTEGER NOT NULL,
        registered_at    INTEGER NOT NULL,
        deadline_kind    TEXT    NOT NULL,
        deadline_value   INTEGER NOT NULL,
        PRIMARY KEY (key_kind, key_id)
    );",
    "CREATE INDEX IF NOT EXISTS idx_events_type ON events (event_type);",
    "CREATE INDEX IF NOT EXISTS idx_warnings_era ON warnings (era_id);",
];

/// SQLite-backed [`IndexStore`].
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./eraindex.db"`) or a full
    /// SQLite URL (`"sqlite:./eraindex.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, IndexerError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };
        let pool = SqlitePool::connect(&url).await.map_err(db)?;
        let storage = Self { pool };
        storage.init_schema().await?;
        debug!(url = %url, "sqlite storage opened");
        Ok(storage)
    }

    /// Open an in-memory SQLite database.
    ///
    /// Every pooled connection would get its own private database, so the
    /// pool is pinned to a single connection.
    pub async fn in_memory() -> Result<Self, IndexerError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(db)?;
        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Create tables and enable WAL mode.
    async fn init_schema(&self) -> Result<(), IndexerError> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await
            .map_err(db)?;
        for stmt in SCHEMA {
            sqlx::query(stmt).execute(&self.pool).await.map_err(db)?;
        }
        Ok(())
    }

    /// Total number of stored events across both chains.
    pub async fn event_count(&self) -> Result<u64, IndexerError> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM events")
            .fetch_one(&self.pool)
            .await
            .map_err(db)?;
        Ok(row.get::<i64, _>("cnt") as u64)
    }

    /// Stored events of one type, in chain order.
    pub async fn events_by_type(&self, event_type: &str) -> Result<Vec<ChainEvent>, IndexerError> {
        let rows = sqlx::query(
            "SELECT chain, block_number, event_index, event_type, data_json
             FROM events WHERE event_type = ? ORDER BY chain, block_number, event_index",
        )
        .bind(event_type)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?;
        rows.iter().map(event_from_row).collect()
    }
}

// ─── Transaction steps ───────────────────────────────────────────────────────

async fn insert_warning(conn: &mut SqliteConnection, w: &Warning) -> Result<(), IndexerError> {
    sqlx::query(
        "INSERT OR IGNORE INTO warnings
         (content_key, era_id, session_id, block_number, kind, severity, message, timestamp)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(w.content_key())
    .bind(w.era_id.map(i64::from))
    .bind(w.session_id.map(i64::from))
    .bind(w.block_number as i64)
    .bind(w.kind.as_str())
    .bind(w.severity.as_str())
    .bind(&w.message)
    .bind(w.timestamp)
    .execute(&mut *conn)
    .await
    .map_err(db)?;
    Ok(())
}

async fn delete_expectation(conn: &mut SqliteConnection, key: &CorrelationKey) -> Result<(), IndexerError> {
    let (kind, id) = key.to_parts();
    sqlx::query("DELETE FROM expectations WHERE key_kind = ? AND key_id = ?")
        .bind(kind)
        .bind(i64::from(id))
        .execute(&mut *conn)
        .await
        .map_err(db)?;
    Ok(())
}

async fn upsert_expectation(conn: &mut SqliteConnection, exp: &PendingExpectation) -> Result<(), IndexerError> {
    let (key_kind, key_id) = exp.key.to_parts();
    let (deadline_kind, deadline_value) = exp.deadline.to_parts();
    sqlx::query(
        "INSERT OR REPLACE INTO expectations
         (key_kind, key_id, kind, expected_chain, expected_event, registered_block,
          registered_at, deadline_kind, deadline_value)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(key_kind)
    .bind(i64::from(key_id))
    .bind(exp.kind.as_str())
    .bind(exp.expected_chain.as_str())
    .bind(&exp.expected_event)
    .bind(exp.registered_block as i64)
    .bind(exp.registered_at)
    .bind(deadline_kind)
    .bind(deadline_value)
    .execute(&mut *conn)
    .await
    .map_err(db)?;
    Ok(())
}

async fn upsert_era(conn: &mut SqliteConnection, era: &Era) -> Result<(), IndexerError> {
    let stored = sqlx::query("SELECT era_id, session_start, session_end, start_time FROM eras WHERE era_id = ?")
        .bind(i64::from(era.era_id))
        .fetch_optional(&mut *conn)
        .await
        .map_err(db)?;
    let merged = match stored {
        Some(row) => merge_era(&era_from_row(&row), era),
        None => era.clone(),
    };
    sqlx::query(
        "INSERT OR REPLACE INTO eras (era_id, session_start, session_end, start_time)
         VALUES (?, ?, ?, ?)",
    )
    .bind(i64::from(merged.era_id))
    .bind(i64::from(merged.session_start))
    .bind(merged.session_end.map(i64::from))
    .bind(merged.start_time)
    .execute(&mut *conn)
    .await
    .map_err(db)?;
    Ok(())
}

async fn upsert_session(conn: &mut SqliteConnection, session: &Session) -> Result<(), IndexerError> {
    let stored = sqlx::query(
        "SELECT session_id, block_number, activation_timestamp, era_id, active_era_id,
                planned_era_id, validator_points_total
         FROM sessions WHERE session_id = ?",
    )
    .bind(i64::from(session.session_id))
    .fetch_optional(&mut *conn)
    .await
    .map_err(db)?;
    let merged = match stored {
        Some(row) => {
            let mut stored = session_from_row(&row);
            if !stored.fill_from(session) {
                return Ok(());
            }
            stored
        }
        None => session.clone(),
    };
    sqlx::query(
        "INSERT OR REPLACE INTO sessions
         (session_id, block_number, activation_timestamp, era_id, active_era_id,
          planned_era_id, validator_points_total)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(i64::from(merged.session_id))
    .bind(merged.block_number as i64)
    .bind(merged.activation_timestamp)
    .bind(merged.era_id.map(i64::from))
    .bind(merged.active_era_id.map(i64::from))
    .bind(merged.planned_era_id.map(i64::from))
    .bind(merged.validator_points_total.map(|v| v as i64))
    .execute(&mut *conn)
    .await
    .map_err(db)?;
    Ok(())
}

async fn upsert_state(conn: &mut SqliteConnection, state: &IndexerState) -> Result<(), IndexerError> {
    let stored = sqlx::query("SELECT * FROM indexer_state WHERE chain = ?")
        .bind(state.chain.as_str())
        .fetch_optional(&mut *conn)
        .await
        .map_err(db)?;
    let merged = match stored {
        Some(row) => merge_state(&state_from_row(&row)?, state),
        None => state.clone(),
    };
    sqlx::query(
        "INSERT OR REPLACE INTO indexer_state
         (chain, last_processed_block, current_height, target_block, is_syncing,
          current_era, current_session, error_count, last_error, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(merged.chain.as_str())
    .bind(merged.last_processed_block as i64)
    .bind(merged.current_height as i64)
    .bind(merged.target_block as i64)
    .bind(merged.is_syncing)
    .bind(merged.current_era.map(i64::from))
    .bind(merged.current_session.map(i64::from))
    .bind(merged.error_count as i64)
    .bind(merged.last_error.as_deref())
    .bind(merged.updated_at)
    .execute(&mut *conn)
    .await
    .map_err(db)?;
    Ok(())
}

// ─── Row decoding ────────────────────────────────────────────────────────────

fn chain_of(slug: &str) -> Result<Chain, IndexerError> {
    Chain::from_slug(slug).ok_or_else(|| IndexerError::Storage(format!("unknown chain '{slug}' in store")))
}

fn opt_u32(row: &SqliteRow, col: &str) -> Option<u32> {
    row.get::<Option<i64>, _>(col).map(|v| v as u32)
}

fn event_from_row(row: &SqliteRow) -> Result<ChainEvent, IndexerError> {
    let block_number = row.get::<i64, _>("block_number") as u64;
    let data: String = row.get("data_json");
    Ok(ChainEvent {
        chain: chain_of(row.get("chain"))?,
        block_number,
        id: EventId::new(block_number, row.get::<i64, _>("event_index") as u32),
        event_type: row.get("event_type"),
        data: serde_json::from_str(&data).unwrap_or(serde_json::Value::Null),
    })
}

fn era_from_row(row: &SqliteRow) -> Era {
    Era {
        era_id: row.get::<i64, _>("era_id") as u32,
        session_start: row.get::<i64, _>("session_start") as u32,
        session_end: opt_u32(row, "session_end"),
        start_time: row.get("start_time"),
    }
}

fn session_from_row(row: &SqliteRow) -> Session {
    Session {
        session_id: row.get::<i64, _>("session_id") as u32,
        block_number: row.get::<i64, _>("block_number") as u64,
        activation_timestamp: row.get("activation_timestamp"),
        era_id: opt_u32(row, "era_id"),
        active_era_id: opt_u32(row, "active_era_id"),
        planned_era_id: opt_u32(row, "planned_era_id"),
        validator_points_total: row
            .get::<Option<i64>, _>("validator_points_total")
            .map(|v| v as u64),
    }
}

fn warning_from_row(row: &SqliteRow) -> Result<Warning, IndexerError> {
    let kind: String = row.get("kind");
    let severity: String = row.get("severity");
    Ok(Warning {
        era_id: opt_u32(row, "era_id"),
        session_id: opt_u32(row, "session_id"),
        block_number: row.get::<i64, _>("block_number") as u64,
        kind: WarningType::from_str_opt(&kind)
            .ok_or_else(|| IndexerError::Storage(format!("unknown warning type '{kind}'")))?,
        severity: Severity::from_str_opt(&severity)
            .ok_or_else(|| IndexerError::Storage(format!("unknown severity '{severity}'")))?,
        message: row.get("message"),
        timestamp: row.get("timestamp"),
    })
}

fn state_from_row(row: &SqliteRow) -> Result<IndexerState, IndexerError> {
    Ok(IndexerState {
        chain: chain_of(row.get("chain"))?,
        last_processed_block: row.get::<i64, _>("last_processed_block") as u64,
        current_height: row.get::<i64, _>("current_height") as u64,
        target_block: row.get::<i64, _>("target_block") as u64,
        is_syncing: row.get("is_syncing"),
        current_era: opt_u32(row, "current_era"),
        current_session: opt_u32(row, "current_session"),
        error_count: row.get::<i64, _>("error_count") as u64,
        last_error: row.get("last_error"),
        updated_at: row.get("updated_at"),
    })
}

fn expectation_from_row(row: &SqliteRow) -> Option<PendingExpectation> {
    let key_kind: String = row.get("key_kind");
    let kind: String = row.get("kind");
    let deadline_kind: String = row.get("deadline_kind");
    let key = CorrelationKey::from_parts(&key_kind, row.get::<i64, _>("key_id") as u32)?;
    let kind = ExpectationKind::from_str_opt(&kind)?;
    let deadline = Deadline::from_parts(&deadline_kind, row.get("deadline_value"))?;
    let expected_chain: String = row.get("expected_chain");
    Some(PendingExpectation {
        key,
        kind,
        expected_chain: Chain::from_slug(&expected_chain)?,
        expected_event: row.get("expected_event"),
        registered_block: row.get::<i64, _>("registered_block") as u64,
        registered_at: row.get("registered_at"),
        deadline,
    })
}

// ─── IndexStore impl ─────────────────────────────────────────────────────────

#[async_trait]
impl IndexStore for SqliteStorage {
    async fn commit_block(&self, cs: &BlockChangeset) -> Result<(), IndexerError> {
        let mut tx = self.pool.begin().await.map_err(db)?;

        sqlx::query("INSERT OR IGNORE INTO blocks (chain, block_number, timestamp) VALUES (?, ?, ?)")
            .bind(cs.block.chain.as_str())
            .bind(cs.block.number as i64)
            .bind(cs.block.timestamp)
            .execute(&mut *tx)
            .await
            .map_err(db)?;

        for ev in &cs.events {
            sqlx::query(
                "INSERT OR IGNORE INTO events (chain, block_number, event_index, event_type, data_json)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(ev.chain.as_str())
            .bind(ev.block_number as i64)
            .bind(i64::from(ev.id.index))
            .bind(&ev.event_type)
            .bind(ev.data.to_string())
            .execute(&mut *tx)
            .await
            .map_err(db)?;
        }
        for session in &cs.sessions {
            upsert_session(&mut tx, session).await?;
        }
        for era in &cs.eras {
            upsert_era(&mut tx, era).await?;
        }
        for w in &cs.warnings {
            insert_warning(&mut tx, w).await?;
        }
        upsert_state(&mut tx, &cs.state).await?;
        for exp in &cs.register {
            upsert_expectation(&mut tx, exp).await?;
        }
        for key in &cs.resolve {
            delete_expectation(&mut tx, key).await?;
        }

        tx.commit().await.map_err(db)?;
        debug!(
            chain = %cs.block.chain,
            block = cs.block.number,
            events = cs.events.len(),
            "block committed"
        );
        Ok(())
    }

    async fn commit_sweep(&self, cs: &SweepChangeset) -> Result<(), IndexerError> {
        let mut tx = self.pool.begin().await.map_err(db)?;
        for w in &cs.warnings {
            insert_warning(&mut tx, w).await?;
        }
        for key in &cs.resolve {
            delete_expectation(&mut tx, key).await?;
        }
        tx.commit().await.map_err(db)?;
        Ok(())
    }

    async fn save_indexer_state(&self, state: &IndexerState) -> Result<(), IndexerError> {
        let mut conn = self.pool.acquire().await.map_err(db)?;
        upsert_state(&mut conn, state).await
    }

    async fn event_exists(&self, chain: Chain, id: &EventId) -> Result<bool, IndexerError> {
        let row = sqlx::query(
            "SELECT 1 FROM events WHERE chain = ? AND block_number = ? AND event_index = ?",
        )
        .bind(chain.as_str())
        .bind(id.block_number as i64)
        .bind(i64::from(id.index))
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?;
        Ok(row.is_some())
    }

    async fn get_current_state(&self) -> Result<Vec<IndexerState>, IndexerError> {
        let rows = sqlx::query("SELECT * FROM indexer_state ORDER BY chain")
            .fetch_all(&self.pool)
            .await
            .map_err(db)?;
        rows.iter().map(state_from_row).collect()
    }

    async fn get_indexer_state(&self, chain: Chain) -> Result<Option<IndexerState>, IndexerError> {
        let row = sqlx::query("SELECT * FROM indexer_state WHERE chain = ?")
            .bind(chain.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(db)?;
        row.as_ref().map(state_from_row).transpose()
    }

    async fn get_recent_warnings(&self, limit: usize) -> Result<Vec<Warning>, IndexerError> {
        let rows = sqlx::query("SELECT * FROM warnings ORDER BY id DESC LIMIT ?")
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(db)?;
        rows.iter().map(warning_from_row).collect()
    }

    async fn get_recent_eras(&self, limit: usize) -> Result<Vec<Era>, IndexerError> {
        let rows = sqlx::query("SELECT * FROM eras ORDER BY era_id DESC LIMIT ?")
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(db)?;
        Ok(rows.iter().map(era_from_row).collect())
    }

    async fn get_recent_sessions(&self, limit: usize) -> Result<Vec<Session>, IndexerError> {
        let rows = sqlx::query("SELECT * FROM sessions ORDER BY session_id DESC LIMIT ?")
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(db)?;
        Ok(rows.iter().map(session_from_row).collect())
    }

    async fn load_pending_expectations(&self) -> Result<Vec<PendingExpectation>, IndexerError> {
        let rows = sqlx::query("SELECT * FROM expectations ORDER BY key_kind, key_id")
            .fetch_all(&self.pool)
            .await
            .map_err(db)?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            match expectation_from_row(row) {
                Some(exp) => out.push(exp),
                None => warn!("skipping unreadable expectation row"),
            }
        }
        Ok(out)
    }

    async fn close(&self) -> Result<(), IndexerError> {
        self.pool.close().await;
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use eraindex_core::types::Block;
    use serde_json::json;

    fn block(chain: Chain, number: u64) -> Block {
        Block {
            chain,
            number,
            timestamp: number as i64 * 6_000,
        }
    }

    fn changeset(chain: Chain, number: u64) -> BlockChangeset {
        let state = IndexerState::cold_start(chain, number + 10, 10).advanced_to(number);
        BlockChangeset::new(block(chain, number), state)
    }

    fn event(chain: Chain, number: u64, index: u32, ty: &str) -> ChainEvent {
        ChainEvent {
            chain,
            block_number: number,
            id: EventId::new(number, index),
            event_type: ty.into(),
            data: json!({"sessionIndex": 42}),
        }
    }

    fn warning(msg: &str, ts: i64) -> Warning {
        Warning {
            era_id: Some(100),
            session_id: Some(500),
            block_number: 7,
            kind: WarningType::MissingEvent,
            severity: Severity::Error,
            message: msg.into(),
            timestamp: ts,
        }
    }

    fn expectation(era: u32) -> PendingExpectation {
        PendingExpectation::new(
            CorrelationKey::Era(era),
            ExpectationKind::EraActivation,
            7,
            42_000,
            Deadline::AtMillis(7_242_000),
        )
    }

    // ── Block commits ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn events_are_idempotent_per_chain() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let mut cs = changeset(Chain::RelayChain, 3);
        cs.events.push(event(Chain::RelayChain, 3, 0, "session.NewSession"));
        store.commit_block(&cs).await.unwrap();
        store.commit_block(&cs).await.unwrap();

        let mut ah = changeset(Chain::AssetHub, 3);
        ah.events.push(event(Chain::AssetHub, 3, 0, "staking.EraPaid"));
        store.commit_block(&ah).await.unwrap();

        assert_eq!(store.event_count().await.unwrap(), 2);
        assert!(store.event_exists(Chain::RelayChain, &EventId::new(3, 0)).await.unwrap());
        assert!(!store.event_exists(Chain::RelayChain, &EventId::new(3, 1)).await.unwrap());

        let loaded = store.events_by_type("session.NewSession").await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].data["sessionIndex"], 42);
    }

    #[tokio::test]
    async fn era_end_is_never_revised() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let mut cs = changeset(Chain::AssetHub, 1);
        cs.eras.push(Era {
            era_id: 100,
            session_start: 500,
            session_end: None,
            start_time: 6_000,
        });
        store.commit_block(&cs).await.unwrap();

        let mut cs = changeset(Chain::AssetHub, 2);
        cs.eras.push(Era {
            era_id: 100,
            session_start: 500,
            session_end: Some(509),
            start_time: 6_000,
        });
        store.commit_block(&cs).await.unwrap();

        let mut cs = changeset(Chain::AssetHub, 3);
        cs.eras.push(Era {
            era_id: 100,
            session_start: 500,
            session_end: Some(511),
            start_time: 6_000,
        });
        store.commit_block(&cs).await.unwrap();

        let eras = store.get_recent_eras(10).await.unwrap();
        assert_eq!(eras.len(), 1);
        assert_eq!(eras[0].session_end, Some(509));
    }

    #[tokio::test]
    async fn sessions_only_gain_fields() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let b = block(Chain::RelayChain, 1);
        let mut cs = changeset(Chain::RelayChain, 1);
        cs.sessions.push(Session::new(500, &b));
        store.commit_block(&cs).await.unwrap();

        let mut later = Session::new(500, &block(Chain::AssetHub, 9));
        later.era_id = Some(100);
        later.validator_points_total = Some(300);
        let mut cs = changeset(Chain::AssetHub, 9);
        cs.sessions.push(later);
        store.commit_block(&cs).await.unwrap();

        let sessions = store.get_recent_sessions(5).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].block_number, 1);
        assert_eq!(sessions[0].era_id, Some(100));
        assert_eq!(sessions[0].validator_points_total, Some(300));
    }

    #[tokio::test]
    async fn cursor_never_moves_backwards() {
        let store = SqliteStorage::in_memory().await.unwrap();
        store.commit_block(&changeset(Chain::AssetHub, 50)).await.unwrap();

        let mut stale = IndexerState::cold_start(Chain::AssetHub, 60, 30);
        stale.record_error("rpc down");
        store.save_indexer_state(&stale).await.unwrap();

        let state = store.get_indexer_state(Chain::AssetHub).await.unwrap().unwrap();
        assert_eq!(state.last_processed_block, 50);
        assert_eq!(state.error_count, 1);
        assert_eq!(state.last_error.as_deref(), Some("rpc down"));
        assert!(store.get_indexer_state(Chain::RelayChain).await.unwrap().is_none());
        assert_eq!(store.get_current_state().await.unwrap().len(), 1);
    }

    // ── Warnings ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn warnings_dedupe_on_content_and_list_newest_first() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let mut cs = changeset(Chain::RelayChain, 7);
        cs.warnings.push(warning("first", 1));
        store.commit_block(&cs).await.unwrap();

        let sweep = SweepChangeset {
            warnings: vec![warning("first", 99), warning("second", 2)],
            resolve: vec![],
        };
        store.commit_sweep(&sweep).await.unwrap();

        let recent = store.get_recent_warnings(10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].message, "second");
        assert_eq!(recent[1].message, "first");
        assert_eq!(recent[1].timestamp, 1);
        assert_eq!(store.get_recent_warnings(1).await.unwrap().len(), 1);
    }

    // ── Expectations ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn expectations_register_resolve_and_reload() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let mut cs = changeset(Chain::RelayChain, 7);
        cs.register.push(expectation(100));
        cs.register.push(PendingExpectation::new(
            CorrelationKey::Session(499),
            ExpectationKind::SessionReport,
            7,
            42_000,
            Deadline::AfterBlocks(20),
        ));
        store.commit_block(&cs).await.unwrap();

        let loaded = store.load_pending_expectations().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(loaded.contains(&expectation(100)));
        let session = loaded
            .iter()
            .find(|e| e.key == CorrelationKey::Session(499))
            .unwrap();
        assert_eq!(session.deadline, Deadline::AfterBlocks(20));
        assert_eq!(session.expected_chain, Chain::AssetHub);

        let sweep = SweepChangeset {
            warnings: vec![warning("missing", 1)],
            resolve: vec![CorrelationKey::Era(100)],
        };
        store.commit_sweep(&sweep).await.unwrap();
        let loaded = store.load_pending_expectations().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].key, CorrelationKey::Session(499));
    }

    #[tokio::test]
    async fn reanchored_expectation_replaces_row() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let mut exp = expectation(5);
        exp.deadline = Deadline::AfterBlocks(20);
        let mut cs = changeset(Chain::RelayChain, 1);
        cs.register.push(exp.clone());
        store.commit_block(&cs).await.unwrap();

        exp.deadline = Deadline::AtBlock(120);
        let mut cs = changeset(Chain::AssetHub, 100);
        cs.register.push(exp);
        store.commit_block(&cs).await.unwrap();

        let loaded = store.load_pending_expectations().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].deadline, Deadline::AtBlock(120));
    }

    // ── Atomicity ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn failed_statement_rolls_back_whole_block() {
        let store = SqliteStorage::in_memory().await.unwrap();
        sqlx::query("DROP TABLE expectations")
            .execute(&store.pool)
            .await
            .unwrap();

        let mut cs = changeset(Chain::RelayChain, 7);
        cs.events.push(event(Chain::RelayChain, 7, 0, "stakingAhClient.ValidatorSetReceived"));
        cs.register.push(expectation(5));
        assert!(store.commit_block(&cs).await.is_err());

        assert_eq!(store.event_count().await.unwrap(), 0);
        assert!(store.get_indexer_state(Chain::RelayChain).await.unwrap().is_none());
    }
}
