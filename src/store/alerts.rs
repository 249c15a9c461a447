// =============================================================================
// Alert, Cooldown & Daily-Count Repositories
// =============================================================================
//
// Alerts are immutable once written; batch saves commit as a single
// transaction and roll back together. Cooldowns and the daily counter are
// derived summaries mutated only by the throttler.
// =============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::store::{parse_ts, StoreError, StoreResult};
use crate::types::{Alert, CooldownRecord, DetectorKind, Explanation, Ticker};

// =============================================================================
// AlertRepo
// =============================================================================

#[derive(Clone)]
pub struct AlertRepo {
    conn: Arc<Mutex<Connection>>,
}

impl AlertRepo {
    pub(crate) fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// Persist one alert, returning its row id.
    pub fn save(&self, alert: &Alert) -> StoreResult<i64> {
        let conn = self.conn.lock();
        insert_alert(&conn, alert)?;
        Ok(conn.last_insert_rowid())
    }

    /// Persist a batch atomically: either every alert lands or none do.
    pub fn save_batch(&self, alerts: &[Alert]) -> StoreResult<Vec<i64>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut ids = Vec::with_capacity(alerts.len());
        for alert in alerts {
            insert_alert(&tx, alert)?;
            ids.push(tx.last_insert_rowid());
        }
        tx.commit()?;
        Ok(ids)
    }

    /// Most recent alerts, newest first.
    pub fn latest(&self, limit: u32) -> StoreResult<Vec<Alert>> {
        self.query_alerts(
            "SELECT id, scan_id, ticker, detector, raw_score, final_score,
                    metrics_json, explanation_json, strategies_json, created_at
             FROM alerts ORDER BY created_at DESC, id DESC LIMIT ?1",
            params![limit],
        )
    }

    pub fn by_ticker(&self, ticker: &Ticker, limit: u32) -> StoreResult<Vec<Alert>> {
        self.query_alerts(
            "SELECT id, scan_id, ticker, detector, raw_score, final_score,
                    metrics_json, explanation_json, strategies_json, created_at
             FROM alerts WHERE ticker = ?1 ORDER BY created_at DESC, id DESC LIMIT ?2",
            params![ticker.as_str(), limit],
        )
    }

    pub fn by_detector(&self, detector: DetectorKind, limit: u32) -> StoreResult<Vec<Alert>> {
        self.query_alerts(
            "SELECT id, scan_id, ticker, detector, raw_score, final_score,
                    metrics_json, explanation_json, strategies_json, created_at
             FROM alerts WHERE detector = ?1 ORDER BY created_at DESC, id DESC LIMIT ?2",
            params![detector.as_str(), limit],
        )
    }

    /// All alerts for one scan, in insertion order.
    pub fn by_scan(&self, scan_id: &str) -> StoreResult<Vec<Alert>> {
        self.query_alerts(
            "SELECT id, scan_id, ticker, detector, raw_score, final_score,
                    metrics_json, explanation_json, strategies_json, created_at
             FROM alerts WHERE scan_id = ?1 ORDER BY id ASC",
            params![scan_id],
        )
    }

    /// Alerts created on the UTC date of `now`.
    pub fn count_today(&self, now: DateTime<Utc>) -> StoreResult<u32> {
        let prefix = format!("{}%", now.date_naive());
        let conn = self.conn.lock();
        let count: u32 = conn.query_row(
            "SELECT COUNT(*) FROM alerts WHERE created_at LIKE ?1",
            params![prefix],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn query_alerts(
        &self,
        sql: &str,
        args: impl rusqlite::Params,
    ) -> StoreResult<Vec<Alert>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(args, row_to_raw)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(finish_alert(row?)?);
        }
        Ok(out)
    }
}

fn insert_alert(conn: &Connection, alert: &Alert) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO alerts (scan_id, ticker, detector, raw_score, final_score,
                             metrics_json, explanation_json, strategies_json, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            alert.scan_id,
            alert.ticker.as_str(),
            alert.detector.as_str(),
            alert.raw_score,
            alert.final_score,
            serde_json::to_string(&alert.metrics)?,
            serde_json::to_string(&alert.explanation)?,
            serde_json::to_string(&alert.strategies)?,
            alert.created_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

struct RawAlert {
    id: i64,
    scan_id: String,
    ticker: String,
    detector: String,
    raw_score: f64,
    final_score: f64,
    metrics_json: String,
    explanation_json: String,
    strategies_json: String,
    created_at: String,
}

fn row_to_raw(row: &Row<'_>) -> rusqlite::Result<RawAlert> {
    Ok(RawAlert {
        id: row.get(0)?,
        scan_id: row.get(1)?,
        ticker: row.get(2)?,
        detector: row.get(3)?,
        raw_score: row.get(4)?,
        final_score: row.get(5)?,
        metrics_json: row.get(6)?,
        explanation_json: row.get(7)?,
        strategies_json: row.get(8)?,
        created_at: row.get(9)?,
    })
}

fn finish_alert(raw: RawAlert) -> StoreResult<Alert> {
    let ticker = Ticker::new(&raw.ticker)
        .ok_or_else(|| StoreError::Corrupt(format!("bad ticker {:?}", raw.ticker)))?;
    let detector = DetectorKind::from_str(&raw.detector)
        .ok_or_else(|| StoreError::Corrupt(format!("bad detector {:?}", raw.detector)))?;
    let metrics: BTreeMap<String, f64> = serde_json::from_str(&raw.metrics_json)?;
    let explanation: Explanation = serde_json::from_str(&raw.explanation_json)?;
    let strategies: Vec<String> = serde_json::from_str(&raw.strategies_json)?;
    Ok(Alert {
        id: raw.id,
        scan_id: raw.scan_id,
        ticker,
        detector,
        raw_score: raw.raw_score,
        final_score: raw.final_score,
        explanation,
        strategies,
        metrics,
        created_at: parse_ts(&raw.created_at)?,
    })
}

// =============================================================================
// CooldownRepo
// =============================================================================

#[derive(Clone)]
pub struct CooldownRepo {
    conn: Arc<Mutex<Connection>>,
}

impl CooldownRepo {
    pub(crate) fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    pub fn get(&self, ticker: &Ticker) -> StoreResult<Option<CooldownRecord>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT last_alert_ts, last_score FROM cooldowns WHERE ticker = ?1",
                params![ticker.as_str()],
                |row| {
                    let ts: String = row.get(0)?;
                    let score: f64 = row.get(1)?;
                    Ok((ts, score))
                },
            )
            .optional()?;
        row.map(|(ts, score)| {
            Ok(CooldownRecord {
                ticker: ticker.clone(),
                last_alert_ts: parse_ts(&ts)?,
                last_score: score,
            })
        })
        .transpose()
    }

    pub fn upsert(&self, ticker: &Ticker, ts: DateTime<Utc>, score: f64) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO cooldowns (ticker, last_alert_ts, last_score) VALUES (?1, ?2, ?3)
             ON CONFLICT(ticker) DO UPDATE SET last_alert_ts = ?2, last_score = ?3",
            params![ticker.as_str(), ts.to_rfc3339(), score],
        )?;
        Ok(())
    }

    /// Cooldown decision for a fresh candidate.
    ///
    /// Suppressed iff the last alert is younger than `hours` AND
    /// `candidate_score < last_score + min_improvement`. Returns
    /// `(suppressed, remaining_hours)`; `cooldown_hours = 0` disables the
    /// check entirely.
    pub fn in_cooldown(
        &self,
        ticker: &Ticker,
        hours: f64,
        min_improvement: f64,
        candidate_score: f64,
        now: DateTime<Utc>,
    ) -> StoreResult<(bool, Option<f64>)> {
        if hours <= 0.0 {
            return Ok((false, None));
        }
        let Some(record) = self.get(ticker)? else {
            return Ok((false, None));
        };

        let elapsed_hours = (now - record.last_alert_ts).num_milliseconds() as f64 / 3_600_000.0;
        if elapsed_hours >= hours {
            return Ok((false, None));
        }

        let remaining = hours - elapsed_hours;
        if candidate_score >= record.last_score + min_improvement {
            // Improvement override: the window is still open but the new
            // signal is materially stronger.
            return Ok((false, Some(remaining)));
        }
        Ok((true, Some(remaining)))
    }
}

// =============================================================================
// DailyCountRepo
// =============================================================================

#[derive(Clone)]
pub struct DailyCountRepo {
    conn: Arc<Mutex<Connection>>,
}

impl DailyCountRepo {
    pub(crate) fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// Published-alert count for the UTC date of `now`; zero before the first
    /// increment of the day.
    pub fn get_today(&self, now: DateTime<Utc>) -> StoreResult<u32> {
        let conn = self.conn.lock();
        let count: Option<u32> = conn
            .query_row(
                "SELECT count FROM daily_alert_counts WHERE utc_date = ?1",
                params![now.date_naive().to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(count.unwrap_or(0))
    }

    /// Atomic increment; the first call of a UTC day initialises the row to 1.
    pub fn increment_today(&self, now: DateTime<Utc>) -> StoreResult<u32> {
        let date = now.date_naive().to_string();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO daily_alert_counts (utc_date, count) VALUES (?1, 1)
             ON CONFLICT(utc_date) DO UPDATE SET count = count + 1",
            params![date],
        )?;
        let count: u32 = conn.query_row(
            "SELECT count FROM daily_alert_counts WHERE utc_date = ?1",
            params![date],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use crate::types::{DirectionalBias, Rationale};
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 8, 1, 20, 15, 0).unwrap()
    }

    fn alert(ticker: &str, score: f64, created_at: DateTime<Utc>) -> Alert {
        let mut metrics = BTreeMap::new();
        metrics.insert("iv_percentile".to_string(), 12.0);
        Alert {
            id: 0,
            scan_id: "scan-1".to_string(),
            ticker: Ticker::new(ticker).unwrap(),
            detector: DetectorKind::LowIv,
            raw_score: score,
            final_score: score,
            explanation: Explanation {
                summary: "test".to_string(),
                rationale: Rationale::IvDiscount,
                key_metrics: vec![],
                directional_bias: DirectionalBias::Neutral,
                risk_factors: vec![],
                opportunities: vec!["long_straddle".to_string()],
                timeframe: "2-6 weeks".to_string(),
                next_monitoring_points: vec![],
                timestamp: created_at,
            },
            strategies: vec!["long_straddle".to_string()],
            metrics,
            created_at,
        }
    }

    #[test]
    fn save_and_read_back() {
        let store = Store::open_in_memory().unwrap();
        let repo = store.alerts();
        let id = repo.save(&alert("AAPL", 52.0, now())).unwrap();
        assert!(id > 0);
        let latest = repo.latest(10).unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].id, id);
        assert_eq!(latest[0].ticker.as_str(), "AAPL");
        assert_eq!(latest[0].detector, DetectorKind::LowIv);
        assert_eq!(latest[0].metrics.get("iv_percentile"), Some(&12.0));
        assert_eq!(latest[0].strategies, vec!["long_straddle"]);
    }

    #[test]
    fn batch_save_preserves_order_and_created_at_monotone() {
        let store = Store::open_in_memory().unwrap();
        let repo = store.alerts();
        let batch: Vec<Alert> = (0..5)
            .map(|i| alert("MSFT", 50.0 + i as f64, now() + chrono::Duration::seconds(i)))
            .collect();
        let ids = repo.save_batch(&batch).unwrap();
        assert_eq!(ids.len(), 5);

        let read = repo.by_scan("scan-1").unwrap();
        assert_eq!(read.len(), 5);
        for pair in read.windows(2) {
            assert!(pair[0].created_at <= pair[1].created_at);
        }
        for (i, a) in read.iter().enumerate() {
            assert!((a.final_score - (50.0 + i as f64)).abs() < 1e-12);
        }
    }

    #[test]
    fn queries_by_ticker_and_detector() {
        let store = Store::open_in_memory().unwrap();
        let repo = store.alerts();
        repo.save(&alert("AAPL", 52.0, now())).unwrap();
        repo.save(&alert("MSFT", 60.0, now())).unwrap();

        let aapl = repo.by_ticker(&Ticker::new("AAPL").unwrap(), 10).unwrap();
        assert_eq!(aapl.len(), 1);

        let low_iv = repo.by_detector(DetectorKind::LowIv, 10).unwrap();
        assert_eq!(low_iv.len(), 2);
        assert!(repo.by_detector(DetectorKind::TermKink, 10).unwrap().is_empty());
    }

    #[test]
    fn count_today_is_date_scoped() {
        let store = Store::open_in_memory().unwrap();
        let repo = store.alerts();
        repo.save(&alert("AAPL", 52.0, now())).unwrap();
        repo.save(&alert("AAPL", 52.0, now() - chrono::Duration::days(1))).unwrap();
        assert_eq!(repo.count_today(now()).unwrap(), 1);
    }

    // ---- cooldowns -------------------------------------------------------

    #[test]
    fn cooldown_upsert_and_get() {
        let store = Store::open_in_memory().unwrap();
        let repo = store.cooldowns();
        let ticker = Ticker::new("AAPL").unwrap();
        assert!(repo.get(&ticker).unwrap().is_none());
        repo.upsert(&ticker, now(), 80.0).unwrap();
        let rec = repo.get(&ticker).unwrap().unwrap();
        assert_eq!(rec.last_alert_ts, now());
        assert!((rec.last_score - 80.0).abs() < 1e-12);
    }

    #[test]
    fn cooldown_suppresses_within_window() {
        let store = Store::open_in_memory().unwrap();
        let repo = store.cooldowns();
        let ticker = Ticker::new("AAPL").unwrap();
        repo.upsert(&ticker, now() - chrono::Duration::minutes(30), 80.0).unwrap();

        // Score 75 < 80 + 0.1 within a 1h window: suppressed, ~30min left.
        let (suppressed, remaining) =
            repo.in_cooldown(&ticker, 1.0, 0.1, 75.0, now()).unwrap();
        assert!(suppressed);
        let rem = remaining.unwrap();
        assert!((rem - 0.5).abs() < 0.01, "remaining {rem}");
    }

    #[test]
    fn cooldown_override_by_improvement() {
        let store = Store::open_in_memory().unwrap();
        let repo = store.cooldowns();
        let ticker = Ticker::new("AAPL").unwrap();
        repo.upsert(&ticker, now() - chrono::Duration::minutes(30), 80.0).unwrap();

        let (suppressed, _) = repo.in_cooldown(&ticker, 1.0, 0.1, 90.0, now()).unwrap();
        assert!(!suppressed);
    }

    #[test]
    fn cooldown_expired_window_admits() {
        let store = Store::open_in_memory().unwrap();
        let repo = store.cooldowns();
        let ticker = Ticker::new("AAPL").unwrap();
        repo.upsert(&ticker, now() - chrono::Duration::hours(2), 80.0).unwrap();
        let (suppressed, remaining) =
            repo.in_cooldown(&ticker, 1.0, 0.1, 10.0, now()).unwrap();
        assert!(!suppressed);
        assert!(remaining.is_none());
    }

    #[test]
    fn zero_cooldown_hours_disables_check() {
        let store = Store::open_in_memory().unwrap();
        let repo = store.cooldowns();
        let ticker = Ticker::new("AAPL").unwrap();
        repo.upsert(&ticker, now(), 99.0).unwrap();
        let (suppressed, _) = repo.in_cooldown(&ticker, 0.0, 0.1, 1.0, now()).unwrap();
        assert!(!suppressed);
    }

    // ---- daily counts ----------------------------------------------------

    #[test]
    fn daily_count_initialises_then_increments() {
        let store = Store::open_in_memory().unwrap();
        let repo = store.daily_counts();
        assert_eq!(repo.get_today(now()).unwrap(), 0);
        assert_eq!(repo.increment_today(now()).unwrap(), 1);
        assert_eq!(repo.increment_today(now()).unwrap(), 2);
        assert_eq!(repo.get_today(now()).unwrap(), 2);
        // A different UTC date has its own row.
        let tomorrow = now() + chrono::Duration::days(1);
        assert_eq!(repo.get_today(tomorrow).unwrap(), 0);
    }
}
