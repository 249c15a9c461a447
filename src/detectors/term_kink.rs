// =============================================================================
// Term-Kink Detector — unusually steep or inverted IV term structure
// =============================================================================
//
// Fires when `|term_slope| >= slope_threshold`.
//
//   raw_score = 50 · |term_slope| / slope_threshold, clipped to [0, 100]
//
// A slope exactly at the threshold scores 50; twice the threshold saturates.
// =============================================================================

use crate::config::TermKinkConfig;
use crate::detectors::Detector;
use crate::features::FeatureSet;
use crate::types::{AlertCandidate, CandidateMetrics, DetectorKind, Rationale};

pub struct TermKinkDetector {
    slope_threshold: f64,
}

impl TermKinkDetector {
    pub fn new(config: &TermKinkConfig) -> Self {
        Self { slope_threshold: config.slope_threshold }
    }
}

impl Detector for TermKinkDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::TermKink
    }

    fn detect(&self, features: &FeatureSet) -> Option<AlertCandidate> {
        if self.slope_threshold <= 0.0 {
            return None;
        }
        let slope = features.term_slope?;
        let front = features.atm_iv_front?;
        let back = features.atm_iv_back?;

        if slope.abs() < self.slope_threshold {
            return None;
        }

        let raw_score = (50.0 * slope.abs() / self.slope_threshold).clamp(0.0, 100.0);

        Some(AlertCandidate {
            detector: self.kind(),
            ticker: features.ticker.clone(),
            raw_score,
            metrics: CandidateMetrics::TermKink {
                term_slope: slope,
                atm_iv_front: front,
                atm_iv_back: back,
            },
            rationale: Rationale::TermStructureKink,
        })
    }
}
