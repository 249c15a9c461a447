// =============================================================================
// Alert pipeline scenarios — detector → scorer → throttler → store
// =============================================================================

use chrono::{DateTime, TimeZone, Utc};

use vegawatch::config::{AlertsConfig, DetectorsConfig, RiskConfig, ScoringConfig};
use vegawatch::detectors::DetectorRegistry;
use vegawatch::features::FeatureSet;
use vegawatch::scoring::Scorer;
use vegawatch::store::Store;
use vegawatch::throttle::Throttler;
use vegawatch::types::{DetectorKind, Ticker};

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 8, 1, 20, 15, 0).unwrap()
}

fn aapl() -> Ticker {
    Ticker::new("AAPL").unwrap()
}

/// A feature set rich enough for the LowIv detector.
fn low_iv_features(percentile: f64) -> FeatureSet {
    let mut fs = FeatureSet::empty(aapl(), now());
    fs.iv_percentile = Some(percentile);
    fs.iv_rank = Some(percentile);
    fs.atm_iv_front = Some(0.22);
    fs
}

fn pipeline() -> (DetectorRegistry, Scorer, Throttler, Store) {
    let store = Store::open_in_memory().unwrap();
    let registry = DetectorRegistry::from_config(&DetectorsConfig::default());
    let scorer = Scorer::new(ScoringConfig::default());
    let throttler = Throttler::new(store.clone(), AlertsConfig::default(), RiskConfig::default());
    (registry, scorer, throttler, store)
}

#[test]
fn nominal_low_iv_scan_publishes_one_alert() {
    let (registry, scorer, throttler, store) = pipeline();
    let features = low_iv_features(12.0);

    let candidates = registry.run_all(&features);
    assert_eq!(candidates.len(), 1, "only LowIv should fire");
    let candidate = &candidates[0];
    assert_eq!(candidate.detector, DetectorKind::LowIv);
    // raw = 100 · (25 − 12) / 25 = 52.
    assert!((candidate.raw_score - 52.0).abs() < 1e-10);

    let scored = scorer.score(candidate, &features, now());
    // Default modifiers are all 1.0.
    assert!((scored.final_score - 52.0).abs() < 1e-10);

    let decision = throttler.decide(&scored, now()).unwrap();
    assert!(decision.admit);
    throttler
        .record_admission(&candidate.ticker, scored.final_score, now())
        .unwrap();

    // Cooldown is set and the daily counter reads 1.
    let cooldown = store.cooldowns().get(&aapl()).unwrap().unwrap();
    assert_eq!(cooldown.last_alert_ts, now());
    assert!((cooldown.last_score - 52.0).abs() < 1e-10);
    assert_eq!(store.daily_counts().get_today(now()).unwrap(), 1);
}

#[test]
fn cooldown_suppresses_weaker_repeat() {
    let (registry, scorer, throttler, store) = pipeline();

    // Preload: an alert 30 minutes ago at score 80.
    store
        .cooldowns()
        .upsert(&aapl(), now() - chrono::Duration::minutes(30), 80.0)
        .unwrap();

    // A fresh LowIv detection scoring below 80 + 0.1.
    let features = low_iv_features(6.25); // raw = 75
    let candidates = registry.run_all(&features);
    let scored = scorer.score(&candidates[0], &features, now());
    assert!((scored.final_score - 75.0).abs() < 1e-10);

    let decision = throttler.decide(&scored, now()).unwrap();
    assert!(!decision.admit);
    assert!(decision.reason.unwrap().contains("cooldown"));

    // Nothing was written: counter unchanged, cooldown untouched.
    assert_eq!(store.daily_counts().get_today(now()).unwrap(), 0);
    let cooldown = store.cooldowns().get(&aapl()).unwrap().unwrap();
    assert!((cooldown.last_score - 80.0).abs() < 1e-12);
}

#[test]
fn cooldown_overridden_by_material_improvement() {
    let (registry, scorer, throttler, store) = pipeline();

    store
        .cooldowns()
        .upsert(&aapl(), now() - chrono::Duration::minutes(30), 80.0)
        .unwrap();

    // percentile 2.5 → raw = 90 ≥ 80 + 0.1.
    let features = low_iv_features(2.5);
    let candidates = registry.run_all(&features);
    let scored = scorer.score(&candidates[0], &features, now());
    assert!((scored.final_score - 90.0).abs() < 1e-10);

    let decision = throttler.decide(&scored, now()).unwrap();
    assert!(decision.admit);
    throttler
        .record_admission(&aapl(), scored.final_score, now())
        .unwrap();

    let cooldown = store.cooldowns().get(&aapl()).unwrap().unwrap();
    assert_eq!(cooldown.last_alert_ts, now());
    assert!((cooldown.last_score - 90.0).abs() < 1e-12);
}

#[test]
fn detectors_are_idempotent_over_a_feature_set() {
    let (registry, _, _, _) = pipeline();
    let features = low_iv_features(12.0);
    let a = registry.run_all(&features);
    let b = registry.run_all(&features);
    assert_eq!(
        serde_json::to_string(&a).unwrap(),
        serde_json::to_string(&b).unwrap()
    );
}

#[test]
fn batch_write_then_read_by_scan_round_trips() {
    let (registry, scorer, throttler, store) = pipeline();
    let mut alerts = Vec::new();

    // Three tickers, three admitted alerts in one cycle.
    for (i, sym) in ["AAPL", "MSFT", "NVDA"].iter().enumerate() {
        let ticker = Ticker::new(sym).unwrap();
        let mut features = low_iv_features(12.0);
        features.ticker = ticker.clone();
        let candidates = registry.run_all(&features);
        let scored = scorer.score(&candidates[0], &features, now());
        let decision = throttler.decide(&scored, now()).unwrap();
        assert!(decision.admit);
        throttler
            .record_admission(&ticker, scored.final_score, now())
            .unwrap();

        let created_at = now() + chrono::Duration::seconds(i as i64);
        alerts.push(vegawatch::types::Alert {
            id: 0,
            scan_id: "scan-42".into(),
            ticker,
            detector: scored.candidate.detector,
            raw_score: scored.candidate.raw_score,
            final_score: scored.final_score,
            explanation: scored.explanation.clone(),
            strategies: scored.strategies.clone(),
            metrics: scored
                .candidate
                .metrics
                .to_pairs()
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
            created_at,
        });
    }

    let ids = store.alerts().save_batch(&alerts).unwrap();
    assert_eq!(ids.len(), 3);

    let read = store.alerts().by_scan("scan-42").unwrap();
    assert_eq!(read.len(), 3);
    for pair in read.windows(2) {
        assert!(pair[0].created_at <= pair[1].created_at);
    }
    assert_eq!(store.daily_counts().get_today(now()).unwrap(), 3);
    assert_eq!(store.alerts().count_today(now()).unwrap(), 3);
}
