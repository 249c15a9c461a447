// =============================================================================
// Earnings-Crush Detector — elevated IV into an imminent earnings report
// =============================================================================
//
// Fires when `days_to_earnings ∈ [1, 7]` and `iv_rank >= iv_rank_min`.
//
//   proximity = (8 − days_to_earnings) / 7        (1/7 at 7 days, 1 at 1 day)
//   raw_score = iv_rank · proximity, clipped to [0, 100]
// =============================================================================

use crate::config::EarningsCrushConfig;
use crate::detectors::Detector;
use crate::features::FeatureSet;
use crate::types::{AlertCandidate, CandidateMetrics, DetectorKind, Rationale};

pub struct EarningsCrushDetector {
    iv_rank_min: f64,
}

impl EarningsCrushDetector {
    pub fn new(config: &EarningsCrushConfig) -> Self {
        Self { iv_rank_min: config.iv_rank_min }
    }
}

impl Detector for EarningsCrushDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::EarningsCrush
    }

    fn detect(&self, features: &FeatureSet) -> Option<AlertCandidate> {
        let days = features.days_to_earnings?;
        let iv_rank = features.iv_rank?;

        if !(1.0..=7.0).contains(&days) || iv_rank < self.iv_rank_min {
            return None;
        }

        let proximity = (8.0 - days) / 7.0;
        let raw_score = (iv_rank * proximity).clamp(0.0, 100.0);

        Some(AlertCandidate {
            detector: self.kind(),
            ticker: features.ticker.clone(),
            raw_score,
            metrics: CandidateMetrics::EarningsCrush { days_to_earnings: days, iv_rank },
            rationale: Rationale::EarningsCrush,
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

    fn features(days: Option<f64>, iv_rank: Option<f64>) -> FeatureSet {
        let mut fs = FeatureSet::empty(
            Ticker::new("AMZN").unwrap(),
            Utc.with_ymd_and_hms(2025, 8, 1, 20, 0, 0).unwrap(),
        );
        fs.days_to_earnings = days;
        fs.iv_rank = iv_rank;
        fs
    }

    fn detector() -> EarningsCrushDetector {
        EarningsCrushDetector::new(&EarningsCrushConfig { enabled: true, iv_rank_min: 70.0 })
    }

    #[test]
    fn fires_in_window_with_high_rank() {
        let candidate = detector().detect(&features(Some(1.0), Some(80.0))).unwrap();
        // Full proximity at one day out: score equals the rank.
        assert!((candidate.raw_score - 80.0).abs() < 1e-10);
        assert_eq!(candidate.rationale, Rationale::EarningsCrush);
    }

    #[test]
    fn score_decays_with_distance_to_earnings() {
        let near = detector().detect(&features(Some(2.0), Some(80.0))).unwrap();
        let far = detector().detect(&features(Some(7.0), Some(80.0))).unwrap();
        assert!(near.raw_score > far.raw_score);
        // 80 · 1/7 at the far edge.
        assert!((far.raw_score - 80.0 / 7.0).abs() < 1e-10);
    }

    #[test]
    fn silent_outside_window() {
        assert!(detector().detect(&features(Some(0.0), Some(90.0))).is_none());
        assert!(detector().detect(&features(Some(8.0), Some(90.0))).is_none());
    }

    #[test]
    fn silent_below_rank_threshold() {
        assert!(detector().detect(&features(Some(3.0), Some(69.9))).is_none());
    }

    #[test]
    fn silent_without_earnings_date() {
        assert!(detector().detect(&features(None, Some(90.0))).is_none());
        assert!(detector().detect(&features(Some(3.0), None)).is_none());
    }
}
