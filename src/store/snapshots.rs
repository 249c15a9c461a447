// =============================================================================
// Historisation Repositories — feature snapshots, chain snapshots, IV history
// =============================================================================
//
// Features and chains are persisted as opaque JSON blobs keyed by
// (scan_id, ticker); the IV history keeps one row per trading day and is
// idempotent by date so re-runs within a day never duplicate samples.
// =============================================================================

use std::sync::Arc;

use chrono::NaiveDate;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::features::FeatureSet;
use crate::store::{StoreError, StoreResult};
use crate::types::{ChainSnapshot, IvSample, Ticker};

// =============================================================================
// FeatureSnapshotRepo
// =============================================================================

#[derive(Clone)]
pub struct FeatureSnapshotRepo {
    conn: Arc<Mutex<Connection>>,
}

impl FeatureSnapshotRepo {
    pub(crate) fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    pub fn save(&self, scan_id: &str, ticker: &Ticker, features: &FeatureSet) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO feature_snapshots (scan_id, ticker, features_json, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(scan_id, ticker) DO UPDATE SET features_json = ?3, created_at = ?4",
            params![
                scan_id,
                ticker.as_str(),
                serde_json::to_string(features)?,
                features.computed_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// The most recently computed feature set for `ticker`.
    pub fn get_latest(&self, ticker: &Ticker) -> StoreResult<Option<FeatureSet>> {
        let conn = self.conn.lock();
        let json: Option<String> = conn
            .query_row(
                "SELECT features_json FROM feature_snapshots
                 WHERE ticker = ?1 ORDER BY created_at DESC LIMIT 1",
                params![ticker.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        json.map(|j| serde_json::from_str(&j).map_err(StoreError::from)).transpose()
    }
}

// =============================================================================
// ChainSnapshotRepo
// =============================================================================

#[derive(Clone)]
pub struct ChainSnapshotRepo {
    conn: Arc<Mutex<Connection>>,
}

impl ChainSnapshotRepo {
    pub(crate) fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    pub fn save(&self, scan_id: &str, snapshot: &ChainSnapshot) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO chain_snapshots (scan_id, ticker, snapshot_json, captured_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(scan_id, ticker) DO UPDATE SET snapshot_json = ?3, captured_at = ?4",
            params![
                scan_id,
                snapshot.ticker.as_str(),
                serde_json::to_string(snapshot)?,
                snapshot.captured_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// The most recently captured chain for `ticker`.
    pub fn latest(&self, ticker: &Ticker) -> StoreResult<Option<ChainSnapshot>> {
        let conn = self.conn.lock();
        let json: Option<String> = conn
            .query_row(
                "SELECT snapshot_json FROM chain_snapshots
                 WHERE ticker = ?1 ORDER BY captured_at DESC LIMIT 1",
                params![ticker.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        json.map(|j| serde_json::from_str(&j).map_err(StoreError::from)).transpose()
    }
}

// =============================================================================
// IvHistoryRepo
// =============================================================================

#[derive(Clone)]
pub struct IvHistoryRepo {
    conn: Arc<Mutex<Connection>>,
}

impl IvHistoryRepo {
    pub(crate) fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// Append one trading day's ATM IV (and skew). Idempotent by date: a
    /// second append for the same `(ticker, date)` is a no-op.
    pub fn append(
        &self,
        ticker: &Ticker,
        date: NaiveDate,
        atm_iv: f64,
        skew_25d: Option<f64>,
    ) -> StoreResult<bool> {
        let conn = self.conn.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO iv_history (ticker, date, atm_iv, skew_25d)
             VALUES (?1, ?2, ?3, ?4)",
            params![ticker.as_str(), date.to_string(), atm_iv, skew_25d],
        )?;
        Ok(inserted > 0)
    }

    /// The trailing `days` samples for `ticker`, oldest first.
    pub fn window(&self, ticker: &Ticker, days: u32) -> StoreResult<Vec<IvSample>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT date, atm_iv, skew_25d FROM iv_history
             WHERE ticker = ?1 ORDER BY date DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![ticker.as_str(), days], |row| {
            let date: String = row.get(0)?;
            let atm_iv: f64 = row.get(1)?;
            let skew: Option<f64> = row.get(2)?;
            Ok((date, atm_iv, skew))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (date, atm_iv, skew_25d) = row?;
            let date = date
                .parse::<NaiveDate>()
                .map_err(|e| StoreError::Corrupt(format!("bad date {date:?}: {e}")))?;
            out.push(IvSample { date, atm_iv, skew_25d });
        }
        out.reverse();
        Ok(out)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use crate::types::{ExpirationSlice, OptionContract};
    use chrono::{DateTime, TimeZone, Utc};

    fn ticker() -> Ticker {
        Ticker::new("AAPL").unwrap()
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 8, 1, 20, 15, 0).unwrap()
    }

    fn chain(captured_at: DateTime<Utc>) -> ChainSnapshot {
        ChainSnapshot {
            ticker: ticker(),
            captured_at,
            underlying_price: 190.0,
            by_expiration: vec![ExpirationSlice {
                expiration: NaiveDate::from_ymd_opt(2025, 8, 15).unwrap(),
                calls: vec![OptionContract {
                    strike: 190.0,
                    bid: Some(4.0),
                    ask: Some(4.2),
                    last: Some(4.1),
                    volume: 100,
                    open_interest: 1000,
                    implied_volatility: Some(0.25),
                    delta: Some(0.5),
                    gamma: None,
                    vega: None,
                    theta: None,
                    rho: None,
                }],
                puts: vec![],
            }],
        }
    }

    #[test]
    fn feature_snapshot_round_trip() {
        let store = Store::open_in_memory().unwrap();
        let repo = store.feature_snapshots();
        let mut fs = FeatureSet::empty(ticker(), now());
        fs.iv_percentile = Some(12.0);
        fs.atm_iv_front = Some(0.25);
        repo.save("scan-1", &ticker(), &fs).unwrap();

        let loaded = repo.get_latest(&ticker()).unwrap().unwrap();
        assert_eq!(loaded, fs);
    }

    #[test]
    fn feature_snapshot_latest_wins() {
        let store = Store::open_in_memory().unwrap();
        let repo = store.feature_snapshots();
        let mut older = FeatureSet::empty(ticker(), now() - chrono::Duration::hours(1));
        older.iv_percentile = Some(40.0);
        let mut newer = FeatureSet::empty(ticker(), now());
        newer.iv_percentile = Some(12.0);
        repo.save("scan-1", &ticker(), &older).unwrap();
        repo.save("scan-2", &ticker(), &newer).unwrap();
        let loaded = repo.get_latest(&ticker()).unwrap().unwrap();
        assert_eq!(loaded.iv_percentile, Some(12.0));
    }

    #[test]
    fn chain_snapshot_round_trip() {
        let store = Store::open_in_memory().unwrap();
        let repo = store.chain_snapshots();
        let snap = chain(now());
        repo.save("scan-1", &snap).unwrap();
        let loaded = repo.latest(&ticker()).unwrap().unwrap();
        assert_eq!(loaded.underlying_price, snap.underlying_price);
        assert_eq!(loaded.by_expiration.len(), 1);
        assert_eq!(loaded.captured_at, snap.captured_at);
    }

    #[test]
    fn iv_history_append_is_idempotent_by_date() {
        let store = Store::open_in_memory().unwrap();
        let repo = store.iv_history();
        let date = NaiveDate::from_ymd_opt(2025, 8, 1).unwrap();
        assert!(repo.append(&ticker(), date, 0.25, Some(0.03)).unwrap());
        // Second write for the same day is ignored.
        assert!(!repo.append(&ticker(), date, 0.99, None).unwrap());

        let window = repo.window(&ticker(), 252).unwrap();
        assert_eq!(window.len(), 1);
        assert!((window[0].atm_iv - 0.25).abs() < 1e-12);
        assert_eq!(window[0].skew_25d, Some(0.03));
    }

    #[test]
    fn iv_history_window_is_oldest_first_and_bounded() {
        let store = Store::open_in_memory().unwrap();
        let repo = store.iv_history();
        for i in 0..10 {
            let date = NaiveDate::from_ymd_opt(2025, 7, 1).unwrap() + chrono::Duration::days(i);
            repo.append(&ticker(), date, 0.20 + i as f64 * 0.01, None).unwrap();
        }
        let window = repo.window(&ticker(), 5).unwrap();
        assert_eq!(window.len(), 5);
        // The most recent five, oldest first.
        assert!(window.windows(2).all(|w| w[0].date < w[1].date));
        assert!((window[0].atm_iv - 0.25).abs() < 1e-12);
        assert!((window[4].atm_iv - 0.29).abs() < 1e-12);
    }
}
