// =============================================================================
// Rich-Premium Detector — implied volatility at the expensive end of its range
// =============================================================================
//
// Fires when `iv_percentile >= percentile_min`.
//
//   raw_score = 100 · (iv_percentile − percentile_min) / (100 − percentile_min)
//
// clipped to [0, 100]: a percentile at the threshold scores 0 and a
// percentile of 100 scores 100.
// =============================================================================

use crate::config::RichPremiumConfig;
use crate::detectors::Detector;
use crate::features::FeatureSet;
use crate::types::{AlertCandidate, CandidateMetrics, DetectorKind, Rationale};

pub struct RichPremiumDetector {
    percentile_min: f64,
}

impl RichPremiumDetector {
    pub fn new(config: &RichPremiumConfig) -> Self {
        Self { percentile_min: config.percentile_min }
    }
}

impl Detector for RichPremiumDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::RichPremium
    }

    fn detect(&self, features: &FeatureSet) -> Option<AlertCandidate> {
        if self.percentile_min >= 100.0 {
            return None;
        }
        let percentile = features.iv_percentile?;
        let atm_iv = features.atm_iv_front?;

        if percentile < self.percentile_min {
            return None;
        }

        let raw_score = (100.0 * (percentile - self.percentile_min)
            / (100.0 - self.percentile_min))
            .clamp(0.0, 100.0);

        Some(AlertCandidate {
            detector: self.kind(),
            ticker: features.ticker.clone(),
            raw_score,
            metrics: CandidateMetrics::RichPremium { iv_percentile: percentile, atm_iv },
            rationale: Rationale::IvPremium,
        })
    }
}
