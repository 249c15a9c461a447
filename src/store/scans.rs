// =============================================================================
// Scan Repository — lifecycle rows for every collection cycle
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::store::{parse_ts, StoreResult};
use crate::types::{ScanRecord, ScanStatus};

/// Typed operations over the `scans` table.
#[derive(Clone)]
pub struct ScanRepo {
    conn: Arc<Mutex<Connection>>,
}

impl ScanRepo {
    pub(crate) fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// Insert a new scan in `pending` status and return its id.
    pub fn create(&self, config_hash: &str, now: DateTime<Utc>) -> StoreResult<String> {
        let scan_id = Uuid::new_v4().to_string();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO scans (scan_id, config_hash, status, started_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![scan_id, config_hash, ScanStatus::Pending.as_str(), now.to_rfc3339()],
        )?;
        Ok(scan_id)
    }

    /// Update a scan's lifecycle fields.
    #[allow(clippy::too_many_arguments)]
    pub fn update(
        &self,
        scan_id: &str,
        status: ScanStatus,
        tickers_scanned: u32,
        tickers_skipped: u32,
        alerts_count: u32,
        runtime_secs: Option<f64>,
        error: Option<&str>,
        finished_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE scans SET status = ?2, tickers_scanned = ?3, tickers_skipped = ?4,
                              alerts_count = ?5, runtime_secs = ?6, error = ?7, finished_at = ?8
             WHERE scan_id = ?1",
            params![
                scan_id,
                status.as_str(),
                tickers_scanned,
                tickers_skipped,
                alerts_count,
                runtime_secs,
                error,
                finished_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    /// The most recently started scan.
    pub fn latest(&self) -> StoreResult<Option<ScanRecord>> {
        let conn = self.conn.lock();
        let record = conn
            .query_row(
                "SELECT scan_id, config_hash, status, started_at, finished_at,
                        tickers_scanned, tickers_skipped, alerts_count, runtime_secs, error
                 FROM scans ORDER BY started_at DESC LIMIT 1",
                [],
                row_to_record,
            )
            .optional()?;
        record.map(finish_record).transpose()
    }

    pub fn get(&self, scan_id: &str) -> StoreResult<Option<ScanRecord>> {
        let conn = self.conn.lock();
        let record = conn
            .query_row(
                "SELECT scan_id, config_hash, status, started_at, finished_at,
                        tickers_scanned, tickers_skipped, alerts_count, runtime_secs, error
                 FROM scans WHERE scan_id = ?1",
                params![scan_id],
                row_to_record,
            )
            .optional()?;
        record.map(finish_record).transpose()
    }

    /// Scans started within the last `days`, newest first.
    pub fn history(
        &self,
        days: u32,
        limit: u32,
        offset: u32,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<ScanRecord>> {
        let cutoff = (now - chrono::Duration::days(days as i64)).to_rfc3339();
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT scan_id, config_hash, status, started_at, finished_at,
                    tickers_scanned, tickers_skipped, alerts_count, runtime_secs, error
             FROM scans WHERE started_at >= ?1
             ORDER BY started_at DESC LIMIT ?2 OFFSET ?3",
        )?;
        let rows = stmt.query_map(params![cutoff, limit, offset], row_to_record)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(finish_record(row?)?);
        }
        Ok(out)
    }
}

/// Raw row before timestamp parsing.
struct RawScan {
    scan_id: String,
    config_hash: String,
    status: String,
    started_at: String,
    finished_at: Option<String>,
    tickers_scanned: u32,
    tickers_skipped: u32,
    alerts_count: u32,
    runtime_secs: Option<f64>,
    error: Option<String>,
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<RawScan> {
    Ok(RawScan {
        scan_id: row.get(0)?,
        config_hash: row.get(1)?,
        status: row.get(2)?,
        started_at: row.get(3)?,
        finished_at: row.get(4)?,
        tickers_scanned: row.get(5)?,
        tickers_skipped: row.get(6)?,
        alerts_count: row.get(7)?,
        runtime_secs: row.get(8)?,
        error: row.get(9)?,
    })
}

fn finish_record(raw: RawScan) -> StoreResult<ScanRecord> {
    let status = ScanStatus::from_str(&raw.status)
        .ok_or_else(|| crate::store::StoreError::Corrupt(format!("bad status {:?}", raw.status)))?;
    Ok(ScanRecord {
        scan_id: raw.scan_id,
        config_hash: raw.config_hash,
        status,
        started_at: parse_ts(&raw.started_at)?,
        finished_at: raw.finished_at.as_deref().map(parse_ts).transpose()?,
        tickers_scanned: raw.tickers_scanned,
        tickers_skipped: raw.tickers_skipped,
        alerts_count: raw.alerts_count,
        runtime_secs: raw.runtime_secs,
        error: raw.error,
    })
}
