// =============================================================================
// Detector Registry — pluggable pattern detectors over a FeatureSet
// =============================================================================
//
// A detector is a named pure function `FeatureSet -> Option<AlertCandidate>`.
// The registry is an explicit list assembled at engine construction from the
// config's enabled flags; there is no process-wide mutable registration.
//
// A detector that panics is caught at the registry boundary, logged, and
// treated as having emitted no candidate; it never aborts the scan.
// =============================================================================

pub mod earnings_crush;
pub mod low_iv;
pub mod regime_shift;
pub mod rich_premium;
pub mod skew_anomaly;
pub mod term_kink;

use std::panic::AssertUnwindSafe;

use tracing::{debug, error};

use crate::config::DetectorsConfig;
use crate::features::FeatureSet;
use crate::types::{AlertCandidate, DetectorKind};

pub use earnings_crush::EarningsCrushDetector;
pub use low_iv::LowIvDetector;
pub use regime_shift::RegimeShiftDetector;
pub use rich_premium::RichPremiumDetector;
pub use skew_anomaly::SkewAnomalyDetector;
pub use term_kink::TermKinkDetector;

/// One pattern detector. Implementations are idempotent and hold no mutable
/// state.
pub trait Detector: Send + Sync {
    fn kind(&self) -> DetectorKind;
    fn detect(&self, features: &FeatureSet) -> Option<AlertCandidate>;
}

/// Ordered list of enabled detectors, owned by the engine.
pub struct DetectorRegistry {
    detectors: Vec<Box<dyn Detector>>,
}

impl DetectorRegistry {
    /// Assemble the built-in detectors that are enabled in `config`.
    pub fn from_config(config: &DetectorsConfig) -> Self {
        let mut detectors: Vec<Box<dyn Detector>> = Vec::new();
        if config.low_iv.enabled {
            detectors.push(Box::new(LowIvDetector::new(&config.low_iv)));
        }
        if config.rich_premium.enabled {
            detectors.push(Box::new(RichPremiumDetector::new(&config.rich_premium)));
        }
        if config.earnings_crush.enabled {
            detectors.push(Box::new(EarningsCrushDetector::new(&config.earnings_crush)));
        }
        if config.term_kink.enabled {
            detectors.push(Box::new(TermKinkDetector::new(&config.term_kink)));
        }
        if config.skew_anomaly.enabled {
            detectors.push(Box::new(SkewAnomalyDetector::new(&config.skew_anomaly)));
        }
        if config.regime_shift.enabled {
            detectors.push(Box::new(RegimeShiftDetector::new(&config.regime_shift)));
        }
        Self { detectors }
    }

    /// Build a registry from explicit detector instances (test hook).
    pub fn from_detectors(detectors: Vec<Box<dyn Detector>>) -> Self {
        Self { detectors }
    }

    pub fn len(&self) -> usize {
        self.detectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detectors.is_empty()
    }

    /// Registered detector names, in run order.
    pub fn names(&self) -> Vec<&'static str> {
        self.detectors.iter().map(|d| d.kind().as_str()).collect()
    }

    /// Run every detector against `features`, collecting candidates in run
    /// order. A panicking detector contributes nothing.
    pub fn run_all(&self, features: &FeatureSet) -> Vec<AlertCandidate> {
        let mut candidates = Vec::new();
        for detector in &self.detectors {
            let kind = detector.kind();
            match std::panic::catch_unwind(AssertUnwindSafe(|| detector.detect(features))) {
                Ok(Some(candidate)) => {
                    debug!(
                        detector = %kind,
                        ticker = %candidate.ticker,
                        raw_score = candidate.raw_score,
                        "detector fired"
                    );
                    candidates.push(candidate);
                }
                Ok(None) => {}
                Err(_) => {
                    error!(detector = %kind, ticker = %features.ticker, "detector panicked — skipped");
                }
            }
        }
        candidates
    }
}
