// =============================================================================
// Exporter — atomic JSON mirror of engine state for external readers
// =============================================================================
//
// The REST façade never touches the durable store; it reads these documents.
// Every file is written atomically: serialise to a temp file in the same
// directory, fsync, then rename over the destination. Readers therefore see
// either the previous version or the new one, never a torn write. The
// previous version is copied into `archive/` with a timestamp suffix first.
//
// Layout:
//   <export_dir>/alerts.json    {export_timestamp, alert_count, alerts: [...]}
//   <export_dir>/chains.json    {export_timestamp, chains: [...]}
//   <export_dir>/scans.json     {export_timestamp, scans: [...]}
//   <export_dir>/features.json  {export_timestamp, features: [...]}
//   <export_dir>/status.json    {export_timestamp, status: {...}}
//   <export_dir>/archive/alerts_YYYYMMDD_HHMMSS.json
// =============================================================================

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};

use crate::features::FeatureSet;
use crate::store::Store;
use crate::types::{Alert, ChainSnapshot, ScanRecord, Ticker};

/// Maximum alerts mirrored into the export.
const EXPORT_ALERT_LIMIT: u32 = 500;
/// Scan history horizon mirrored into the export.
const EXPORT_SCAN_DAYS: u32 = 7;
const EXPORT_SCAN_LIMIT: u32 = 200;

#[derive(Debug, Serialize)]
struct AlertsDoc<'a> {
    export_timestamp: DateTime<Utc>,
    alert_count: usize,
    alerts: &'a [Alert],
}

#[derive(Debug, Serialize)]
struct ChainsDoc<'a> {
    export_timestamp: DateTime<Utc>,
    chains: &'a [ChainSnapshot],
}

#[derive(Debug, Serialize)]
struct ScansDoc<'a> {
    export_timestamp: DateTime<Utc>,
    scans: &'a [ScanRecord],
}

#[derive(Debug, Serialize)]
struct FeatureEntry<'a> {
    ticker: &'a Ticker,
    features: &'a FeatureSet,
}

#[derive(Debug, Serialize)]
struct FeaturesDoc<'a> {
    export_timestamp: DateTime<Utc>,
    features: Vec<FeatureEntry<'a>>,
}

#[derive(Debug, Serialize)]
struct StatusDoc<S: Serialize> {
    export_timestamp: DateTime<Utc>,
    status: S,
}

pub struct Exporter {
    export_dir: PathBuf,
}

impl Exporter {
    pub fn new(export_dir: impl Into<PathBuf>) -> Self {
        Self { export_dir: export_dir.into() }
    }

    pub fn export_dir(&self) -> &Path {
        &self.export_dir
    }

    /// Mirror the store into the five export documents.
    pub fn export_all<S: Serialize>(
        &self,
        store: &Store,
        watchlist: &[Ticker],
        status: S,
        now: DateTime<Utc>,
    ) -> Result<()> {
        fs::create_dir_all(self.export_dir.join("archive"))
            .with_context(|| format!("failed to create {}", self.export_dir.display()))?;

        let alerts = store.alerts().latest(EXPORT_ALERT_LIMIT)?;
        self.write_doc(
            "alerts.json",
            &AlertsDoc { export_timestamp: now, alert_count: alerts.len(), alerts: &alerts },
            now,
        )?;

        let mut chains = Vec::new();
        for ticker in watchlist {
            if let Some(chain) = store.chain_snapshots().latest(ticker)? {
                chains.push(chain);
            }
        }
        self.write_doc("chains.json", &ChainsDoc { export_timestamp: now, chains: &chains }, now)?;

        let scans = store.scans().history(EXPORT_SCAN_DAYS, EXPORT_SCAN_LIMIT, 0, now)?;
        self.write_doc("scans.json", &ScansDoc { export_timestamp: now, scans: &scans }, now)?;

        let mut feature_sets: Vec<(Ticker, FeatureSet)> = Vec::new();
        for ticker in watchlist {
            if let Some(fs) = store.feature_snapshots().get_latest(ticker)? {
                feature_sets.push((ticker.clone(), fs));
            }
        }
        let features: Vec<FeatureEntry<'_>> = feature_sets
            .iter()
            .map(|(ticker, features)| FeatureEntry { ticker, features })
            .collect();
        self.write_doc(
            "features.json",
            &FeaturesDoc { export_timestamp: now, features },
            now,
        )?;

        self.write_doc("status.json", &StatusDoc { export_timestamp: now, status }, now)?;

        info!(
            dir = %self.export_dir.display(),
            alerts = alerts.len(),
            chains = chains.len(),
            scans = scans.len(),
            "export complete"
        );
        Ok(())
    }

    /// Serialise one document and land it atomically, archiving the previous
    /// version.
    fn write_doc<T: Serialize>(&self, name: &str, doc: &T, now: DateTime<Utc>) -> Result<()> {
        let dest = self.export_dir.join(name);
        let json = serde_json::to_vec_pretty(doc).context("failed to serialise export doc")?;

        self.archive_previous(&dest, name, now)?;

        let tmp = self.export_dir.join(format!("{name}.tmp"));
        {
            let mut file = fs::File::create(&tmp)
                .with_context(|| format!("failed to create {}", tmp.display()))?;
            file.write_all(&json)
                .with_context(|| format!("failed to write {}", tmp.display()))?;
            file.sync_all()
                .with_context(|| format!("failed to fsync {}", tmp.display()))?;
        }
        fs::rename(&tmp, &dest)
            .with_context(|| format!("failed to rename {} into place", tmp.display()))?;

        debug!(file = name, bytes = json.len(), "export document written");
        Ok(())
    }

    fn archive_previous(&self, dest: &Path, name: &str, now: DateTime<Utc>) -> Result<()> {
        if !dest.exists() {
            return Ok(());
        }
        let stem = name.strip_suffix(".json").unwrap_or(name);
        let archived = self
            .export_dir
            .join("archive")
            .join(format!("{stem}_{}.json", now.format("%Y%m%d_%H%M%S")));
        fs::copy(dest, &archived)
            .with_context(|| format!("failed to archive {}", dest.display()))?;
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::BTreeMap;

    use crate::types::{DetectorKind, DirectionalBias, Explanation, Rationale};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 8, 1, 20, 15, 0).unwrap()
    }

    fn ticker() -> Ticker {
        Ticker::new("AAPL").unwrap()
    }

    fn alert() -> Alert {
        Alert {
            id: 0,
            scan_id: "scan-1".into(),
            ticker: ticker(),
            detector: DetectorKind::LowIv,
            raw_score: 52.0,
            final_score: 52.0,
            explanation: Explanation {
                summary: "test".into(),
                rationale: Rationale::IvDiscount,
                key_metrics: vec![],
                directional_bias: DirectionalBias::Neutral,
                risk_factors: vec![],
                opportunities: vec![],
                timeframe: "2-6 weeks".into(),
                next_monitoring_points: vec![],
                timestamp: now(),
            },
            strategies: vec![],
            metrics: BTreeMap::new(),
            created_at: now(),
        }
    }

    #[derive(Serialize)]
    struct TestStatus {
        state: &'static str,
    }

    #[test]
    fn export_writes_all_five_documents() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_in_memory().unwrap();
        store.alerts().save(&alert()).unwrap();
        let scan = store.scans().create("h1", now()).unwrap();
        assert!(!scan.is_empty());

        let exporter = Exporter::new(dir.path());
        exporter
            .export_all(&store, &[ticker()], TestStatus { state: "WAITING" }, now())
            .unwrap();

        for name in ["alerts.json", "chains.json", "scans.json", "features.json", "status.json"] {
            assert!(dir.path().join(name).exists(), "{name} missing");
        }

        let parsed: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(dir.path().join("alerts.json")).unwrap())
                .unwrap();
        assert_eq!(parsed["alert_count"], 1);
        assert_eq!(parsed["alerts"][0]["ticker"], "AAPL");
        // UTC ISO-8601 with a trailing Z offset.
        let ts = parsed["export_timestamp"].as_str().unwrap();
        assert!(ts.starts_with("2025-08-01T20:15:00"));

        let status: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(dir.path().join("status.json")).unwrap())
                .unwrap();
        assert_eq!(status["status"]["state"], "WAITING");
    }

    #[test]
    fn export_mirrors_store_content_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_in_memory().unwrap();
        store.alerts().save(&alert()).unwrap();

        let exporter = Exporter::new(dir.path());
        exporter.export_all(&store, &[], TestStatus { state: "IDLE" }, now()).unwrap();

        let parsed: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(dir.path().join("alerts.json")).unwrap())
                .unwrap();
        let reloaded: Vec<Alert> =
            serde_json::from_value(parsed["alerts"].clone()).unwrap();
        let in_store = store.alerts().latest(500).unwrap();
        assert_eq!(
            serde_json::to_string(&reloaded).unwrap(),
            serde_json::to_string(&in_store).unwrap()
        );
    }

    #[test]
    fn second_export_archives_the_previous_version() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_in_memory().unwrap();
        let exporter = Exporter::new(dir.path());

        exporter.export_all(&store, &[], TestStatus { state: "IDLE" }, now()).unwrap();
        exporter
            .export_all(
                &store,
                &[],
                TestStatus { state: "WAITING" },
                now() + chrono::Duration::seconds(300),
            )
            .unwrap();

        let archive: Vec<_> = fs::read_dir(dir.path().join("archive"))
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert!(archive.iter().any(|n| n.starts_with("alerts_20250801_202000")));
        assert!(archive.iter().any(|n| n.starts_with("status_")));
    }

    #[test]
    fn no_tmp_files_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_in_memory().unwrap();
        Exporter::new(dir.path())
            .export_all(&store, &[], TestStatus { state: "IDLE" }, now())
            .unwrap();
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .filter(|n| n.ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty(), "tmp files left: {leftovers:?}");
    }
}
