//! Optimizer state persistence
//!
//! A single JSON blob keyed by a fixed id. No schema versioning: a blob that
//! fails to decode is reported as `PersistenceCorrupt` and the optimizer
//! starts from defaults.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags};
use tracing::{info, warn};

use super::OptimizerState;
use crate::errors::{EngineError, EngineResult};

/// Fixed key of the optimizer blob
pub const OPTIMIZER_STATE_KEY: &str = "strategy_optimizer";

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS optimizer_state (
    key TEXT PRIMARY KEY,
    state_json TEXT NOT NULL,
    cycle INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
) WITHOUT ROWID;
"#;

pub trait OptimizerStore: Send + Sync {
    /// `Ok(None)` when nothing has been saved yet
    fn load(&self) -> EngineResult<Option<OptimizerState>>;

    fn save(&self, state: &OptimizerState) -> Result<()>;

    /// Cheap liveness probe used by preflight
    fn health_check(&self) -> Result<()>;
}

fn decode(json: &str) -> EngineResult<OptimizerState> {
    serde_json::from_str(json).map_err(|e| EngineError::PersistenceCorrupt(e.to_string()))
}

pub struct SqliteOptimizerStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteOptimizerStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open optimizer database at {}", db_path))?;

        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize optimizer schema")?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if journal_mode.to_lowercase() != "wal" {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        info!("💾 Optimizer store initialized at: {}", db_path);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn load_raw(&self) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare_cached("SELECT state_json FROM optimizer_state WHERE key = ?1")?;
        let mut rows = stmt.query([OPTIMIZER_STATE_KEY])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        Ok(Some(row.get(0)?))
    }

    #[cfg(test)]
    fn write_raw(&self, json: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO optimizer_state (key, state_json, cycle, updated_at) VALUES (?1, ?2, 0, 0) \
             ON CONFLICT(key) DO UPDATE SET state_json=excluded.state_json",
            params![OPTIMIZER_STATE_KEY, json],
        )?;
        Ok(())
    }
}

impl OptimizerStore for SqliteOptimizerStore {
    fn load(&self) -> EngineResult<Option<OptimizerState>> {
        let raw = self
            .load_raw()
            .map_err(|e| EngineError::unavailable(format!("optimizer store read failed: {:#}", e)))?;
        raw.map(|json| decode(&json)).transpose()
    }

    fn save(&self, state: &OptimizerState) -> Result<()> {
        let json = serde_json::to_string(state).context("serialize optimizer state")?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO optimizer_state (key, state_json, cycle, updated_at) VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(key) DO UPDATE SET state_json=excluded.state_json, cycle=excluded.cycle, updated_at=excluded.updated_at",
            params![
                OPTIMIZER_STATE_KEY,
                json,
                state.cycle as i64,
                Utc::now().timestamp()
            ],
        )
        .context("write optimizer state")?;
        Ok(())
    }

    fn health_check(&self) -> Result<()> {
        let conn = self.conn.lock();
        let one: i64 = conn.query_row("SELECT 1", [], |row| row.get(0))?;
        anyhow::ensure!(one == 1, "unexpected probe result {}", one);
        Ok(())
    }
}

/// Process-local store. Holds the serialized blob so decode failures behave
/// the same as on disk.
#[derive(Default)]
pub struct MemoryOptimizerStore {
    blob: Mutex<Option<String>>,
}

impl MemoryOptimizerStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_raw(&self, json: impl Into<String>) {
        *self.blob.lock() = Some(json.into());
    }
}

impl OptimizerStore for MemoryOptimizerStore {
    fn load(&self) -> EngineResult<Option<OptimizerState>> {
        self.blob.lock().as_deref().map(decode).transpose()
    }

    fn save(&self, state: &OptimizerState) -> Result<()> {
        let json = serde_json::to_string(state).context("serialize optimizer state")?;
        *self.blob.lock() = Some(json);
        Ok(())
    }

    fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::{Optimizer, StrategyWeights};
    use tempfile::NamedTempFile;

    #[test]
    fn test_sqlite_roundtrip_and_upsert() {
        let tmp = NamedTempFile::new().unwrap();
        let store = SqliteOptimizerStore::new(tmp.path().to_str().unwrap()).unwrap();
        assert!(store.load().unwrap().is_none());
        store.health_check().unwrap();

        let mut state = OptimizerState::new(0.05);
        state.cycle = 7;
        store.save(&state).unwrap();
        state.cycle = 8;
        store.save(&state).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.cycle, 8);
        assert_eq!(loaded.weights, StrategyWeights::default());
    }

    #[test]
    fn test_sqlite_survives_reopen() {
        let tmp = NamedTempFile::new().unwrap();
        let path = tmp.path().to_str().unwrap().to_string();
        {
            let store = Arc::new(SqliteOptimizerStore::new(&path).unwrap());
            let mut opt = Optimizer::load(store, 0.05, 1_500);
            opt.optimize_cycle(&Default::default());
            opt.pending_save().commit().unwrap();
        }
        let store = SqliteOptimizerStore::new(&path).unwrap();
        assert_eq!(store.load().unwrap().unwrap().cycle, 1);
    }

    #[test]
    fn test_corrupt_blob_reports_and_falls_back() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(SqliteOptimizerStore::new(tmp.path().to_str().unwrap()).unwrap());
        store.write_raw("{not json").unwrap();

        assert!(matches!(store.load(), Err(EngineError::PersistenceCorrupt(_))));

        let opt = Optimizer::load(store, 0.05, 1_500);
        assert_eq!(opt.state().cycle, 0);
    }

    #[test]
    fn test_memory_store_corrupt_blob() {
        let store = MemoryOptimizerStore::new();
        store.put_raw("[]");
        assert!(matches!(store.load(), Err(EngineError::PersistenceCorrupt(_))));
    }
}
