// =============================================================================
// Low-IV Detector — implied volatility trading at the cheap end of its range
// =============================================================================
//
// Fires when `iv_percentile <= percentile_max`.
//
//   raw_score = 100 · (percentile_max − iv_percentile) / percentile_max
//
// clipped to [0, 100]: a percentile at the threshold scores 0 and a
// percentile of 0 scores 100.
// =============================================================================

use crate::config::LowIvConfig;
use crate::detectors::Detector;
use crate::features::FeatureSet;
use crate::types::{AlertCandidate, CandidateMetrics, DetectorKind, Rationale};

pub struct LowIvDetector {
    percentile_max: f64,
}

impl LowIvDetector {
    pub fn new(config: &LowIvConfig) -> Self {
        Self { percentile_max: config.percentile_max }
    }
}

impl Detector for LowIvDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::LowIv
    }

    fn detect(&self, features: &FeatureSet) -> Option<AlertCandidate> {
        if self.percentile_max <= 0.0 {
            return None;
        }
        let percentile = features.iv_percentile?;
        let atm_iv = features.atm_iv_front?;

        if percentile > self.percentile_max {
            return None;
        }

        let raw_score =
            (100.0 * (self.percentile_max - percentile) / self.percentile_max).clamp(0.0, 100.0);

        Some(AlertCandidate {
            detector: self.kind(),
            ticker: features.ticker.clone(),
            raw_score,
            metrics: CandidateMetrics::LowIv { iv_percentile: percentile, atm_iv },
            rationale: Rationale::IvDiscount,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    use crate::types::Ticker;

    fn features(percentile: Option<f64>, atm_iv: Option<f64>) -> FeatureSet {
        let mut fs = FeatureSet::empty(
            Ticker::new("AAPL").unwrap(),
            Utc.with_ymd_and_hms(2025, 8, 1, 20, 0, 0).unwrap(),
        );
        fs.iv_percentile = percentile;
        fs.atm_iv_front = atm_iv;
        fs
    }

    fn detector(max: f64) -> LowIvDetector {
        LowIvDetector::new(&LowIvConfig { enabled: true, percentile_max: max })
    }

    #[test]
    fn fires_below_threshold_with_linear_score() {
        // 100 · (25 − 12) / 25 = 52.
        let candidate = detector(25.0).detect(&features(Some(12.0), Some(0.22))).unwrap();
        assert_eq!(candidate.detector, DetectorKind::LowIv);
        assert!((candidate.raw_score - 52.0).abs() < 1e-10);
        match candidate.metrics {
            CandidateMetrics::LowIv { iv_percentile, .. } => {
                assert!((iv_percentile - 12.0).abs() < 1e-12)
            }
            other => panic!("wrong metrics: {other:?}"),
        }
    }

    #[test]
    fn fires_at_threshold_with_zero_score() {
        let candidate = detector(25.0).detect(&features(Some(25.0), Some(0.22))).unwrap();
        assert!(candidate.raw_score.abs() < 1e-12);
    }

    #[test]
    fn zero_percentile_scores_100() {
        let candidate = detector(25.0).detect(&features(Some(0.0), Some(0.22))).unwrap();
        assert!((candidate.raw_score - 100.0).abs() < 1e-12);
    }

    #[test]
    fn silent_above_threshold() {
        assert!(detector(25.0).detect(&features(Some(26.0), Some(0.22))).is_none());
    }

    #[test]
    fn silent_without_percentile() {
        assert!(detector(25.0).detect(&features(None, Some(0.22))).is_none());
        assert!(detector(25.0).detect(&features(Some(12.0), None)).is_none());
    }

    #[test]
    fn degenerate_threshold_never_fires() {
        assert!(detector(0.0).detect(&features(Some(0.0), Some(0.22))).is_none());
    }
}
