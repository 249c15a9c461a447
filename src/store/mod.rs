// =============================================================================
// Durable Store — SQLite-backed repositories, single writer
// =============================================================================
//
// One connection in WAL mode behind a mutex; the engine process is the only
// writer. External readers never touch this file — they consume the JSON
// exports instead, which is what lets the engine keep an exclusive writer
// lock without starving the REST façade.
//
// Schema creation is idempotent and versioned through `schema_version`.
// Every repository is a thin typed wrapper sharing the same handle, so a
// batch written through one repo is immediately visible to reads through any
// other.
// =============================================================================

pub mod alerts;
pub mod scans;
pub mod snapshots;
pub mod state;

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::Connection;
use thiserror::Error;
use tracing::info;

pub use alerts::{AlertRepo, CooldownRepo, DailyCountRepo};
pub use scans::ScanRepo;
pub use snapshots::{ChainSnapshotRepo, FeatureSnapshotRepo, IvHistoryRepo};
pub use state::SchedulerStateRepo;

/// Current schema version; bump together with a new migration step.
const SCHEMA_VERSION: i64 = 1;

/// Base schema, applied idempotently.
const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS scans (
    scan_id         TEXT PRIMARY KEY,
    config_hash     TEXT NOT NULL,
    status          TEXT NOT NULL,
    started_at      TEXT NOT NULL,
    finished_at     TEXT,
    tickers_scanned INTEGER NOT NULL DEFAULT 0,
    tickers_skipped INTEGER NOT NULL DEFAULT 0,
    alerts_count    INTEGER NOT NULL DEFAULT 0,
    runtime_secs    REAL,
    error           TEXT
);

CREATE INDEX IF NOT EXISTS idx_scans_started
    ON scans(started_at DESC);

CREATE TABLE IF NOT EXISTS alerts (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    scan_id          TEXT NOT NULL,
    ticker           TEXT NOT NULL,
    detector         TEXT NOT NULL,
    raw_score        REAL NOT NULL,
    final_score      REAL NOT NULL,
    metrics_json     TEXT NOT NULL,
    explanation_json TEXT NOT NULL,
    strategies_json  TEXT NOT NULL,
    created_at       TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_alerts_ticker_created
    ON alerts(ticker, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_alerts_detector_created
    ON alerts(detector, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_alerts_scan
    ON alerts(scan_id);
CREATE INDEX IF NOT EXISTS idx_alerts_created
    ON alerts(created_at DESC);

CREATE TABLE IF NOT EXISTS cooldowns (
    ticker        TEXT PRIMARY KEY,
    last_alert_ts TEXT NOT NULL,
    last_score    REAL NOT NULL
);

CREATE TABLE IF NOT EXISTS daily_alert_counts (
    utc_date TEXT PRIMARY KEY,
    count    INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS feature_snapshots (
    scan_id       TEXT NOT NULL,
    ticker        TEXT NOT NULL,
    features_json TEXT NOT NULL,
    created_at    TEXT NOT NULL,
    PRIMARY KEY (scan_id, ticker)
);

CREATE INDEX IF NOT EXISTS idx_features_ticker_created
    ON feature_snapshots(ticker, created_at DESC);

CREATE TABLE IF NOT EXISTS chain_snapshots (
    scan_id       TEXT NOT NULL,
    ticker        TEXT NOT NULL,
    snapshot_json TEXT NOT NULL,
    captured_at   TEXT NOT NULL,
    PRIMARY KEY (scan_id, ticker)
);

CREATE INDEX IF NOT EXISTS idx_chains_ticker_captured
    ON chain_snapshots(ticker, captured_at DESC);

CREATE TABLE IF NOT EXISTS iv_history (
    ticker   TEXT NOT NULL,
    date     TEXT NOT NULL,
    atm_iv   REAL NOT NULL,
    skew_25d REAL,
    PRIMARY KEY (ticker, date)
);

CREATE TABLE IF NOT EXISTS scheduler_state (
    id         INTEGER PRIMARY KEY CHECK (id = 1),
    state_json TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

/// Store-layer error.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("serialisation error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Shared SQLite handle. Cloning is cheap; all clones serialise through the
/// same mutex.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the database at `path` and bring the schema current.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        let store = Self { conn: Arc::new(Mutex::new(conn)) };
        store.migrate()?;
        info!(path = %path.display(), version = SCHEMA_VERSION, "store opened");
        Ok(store)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn: Arc::new(Mutex::new(conn)) };
        store.migrate()?;
        Ok(store)
    }

    /// Apply the idempotent schema and stamp the version row.
    fn migrate(&self) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.execute_batch(SCHEMA_SQL)?;

        let version: Option<i64> = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
            .ok();
        match version {
            None => {
                conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [SCHEMA_VERSION])?;
            }
            Some(v) if v < SCHEMA_VERSION => {
                // Future migration steps slot in here, gated on `v`.
                conn.execute("UPDATE schema_version SET version = ?1", [SCHEMA_VERSION])?;
            }
            Some(_) => {}
        }
        Ok(())
    }

    /// Current schema version.
    pub fn schema_version(&self) -> StoreResult<i64> {
        let conn = self.conn.lock();
        let v = conn.query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))?;
        Ok(v)
    }

    pub(crate) fn handle(&self) -> Arc<Mutex<Connection>> {
        self.conn.clone()
    }

    // ── Repositories ────────────────────────────────────────────────────

    pub fn scans(&self) -> ScanRepo {
        ScanRepo::new(self.handle())
    }

    pub fn alerts(&self) -> AlertRepo {
        AlertRepo::new(self.handle())
    }

    pub fn cooldowns(&self) -> CooldownRepo {
        CooldownRepo::new(self.handle())
    }

    pub fn daily_counts(&self) -> DailyCountRepo {
        DailyCountRepo::new(self.handle())
    }

    pub fn feature_snapshots(&self) -> FeatureSnapshotRepo {
        FeatureSnapshotRepo::new(self.handle())
    }

    pub fn chain_snapshots(&self) -> ChainSnapshotRepo {
        ChainSnapshotRepo::new(self.handle())
    }

    pub fn iv_history(&self) -> IvHistoryRepo {
        IvHistoryRepo::new(self.handle())
    }

    pub fn scheduler_state(&self) -> SchedulerStateRepo {
        SchedulerStateRepo::new(self.handle())
    }

    /// Record an admitted alert's throttle side effects in one transaction:
    /// cooldown upsert plus the daily-counter increment.
    pub fn record_admission(
        &self,
        ticker: &crate::types::Ticker,
        ts: chrono::DateTime<chrono::Utc>,
        score: f64,
    ) -> StoreResult<u32> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO cooldowns (ticker, last_alert_ts, last_score) VALUES (?1, ?2, ?3)
             ON CONFLICT(ticker) DO UPDATE SET last_alert_ts = ?2, last_score = ?3",
            rusqlite::params![ticker.as_str(), ts.to_rfc3339(), score],
        )?;
        let date = ts.date_naive().to_string();
        tx.execute(
            "INSERT INTO daily_alert_counts (utc_date, count) VALUES (?1, 1)
             ON CONFLICT(utc_date) DO UPDATE SET count = count + 1",
            rusqlite::params![date],
        )?;
        let count: u32 = tx.query_row(
            "SELECT count FROM daily_alert_counts WHERE utc_date = ?1",
            rusqlite::params![date],
            |row| row.get(0),
        )?;
        tx.commit()?;
        Ok(count)
    }
}

// =============================================================================
// Shared row helpers
// =============================================================================

/// Parse an RFC 3339 column back into a UTC instant.
pub(crate) fn parse_ts(raw: &str) -> StoreResult<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp {raw:?}: {e}")))
}
