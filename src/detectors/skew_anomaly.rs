// =============================================================================
// Skew-Anomaly Detector — 25-delta skew dislocated from its rolling range
// =============================================================================
//
// Fires when `|skew_25d|` exceeds its rolling 60-day mean by at least
// `zscore_threshold` standard deviations.
//
//   z         = (|skew_25d| − mean_60d) / std_60d
//   raw_score = 25 · z, clipped to [0, 100]
//
// A z-score at the default threshold of 2 scores 50; z = 4 saturates.
// =============================================================================

use crate::config::SkewAnomalyConfig;
use crate::detectors::Detector;
use crate::features::FeatureSet;
use crate::types::{AlertCandidate, CandidateMetrics, DetectorKind, Rationale};

/// Standard deviations below this are treated as a degenerate (flat) window.
const MIN_STD: f64 = 1e-9;

pub struct SkewAnomalyDetector {
    zscore_threshold: f64,
}

impl SkewAnomalyDetector {
    pub fn new(config: &SkewAnomalyConfig) -> Self {
        Self { zscore_threshold: config.zscore_threshold }
    }
}

impl Detector for SkewAnomalyDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::SkewAnomaly
    }

    fn detect(&self, features: &FeatureSet) -> Option<AlertCandidate> {
        if self.zscore_threshold <= 0.0 {
            return None;
        }
        let skew = features.skew_25d?;
        let mean = features.skew_mean_60d?;
        let std = features.skew_std_60d?;

        if std < MIN_STD {
            return None;
        }

        let zscore = (skew.abs() - mean) / std;
        if !zscore.is_finite() || zscore < self.zscore_threshold {
            return None;
        }

        let raw_score = (25.0 * zscore).clamp(0.0, 100.0);

        Some(AlertCandidate {
            detector: self.kind(),
            ticker: features.ticker.clone(),
            raw_score,
            metrics: CandidateMetrics::SkewAnomaly { skew_25d: skew, zscore },
            rationale: Rationale::SkewDislocation,
        })
    }
}
