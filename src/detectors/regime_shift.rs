// =============================================================================
// Regime-Shift Detector — SMA crossover or RSI threshold cross
// =============================================================================
//
// Fires on either trigger:
//
//   1. An SMA-50/SMA-200 crossover within the last 3 sessions.
//        magnitude  = |SMA50 − SMA200| / SMA200 · 100   (percent separation)
//        raw_score  = 50 + 10 · magnitude, clipped to [0, 100]
//
//   2. RSI(14) crossing the oversold or overbought threshold since the prior
//      session.
//        magnitude  = depth of the cross beyond the threshold
//        raw_score  = 40 + 4 · magnitude, clipped to [0, 100]
//
// The SMA trigger wins when both fire in the same scan.
// =============================================================================

use crate::config::RegimeShiftConfig;
use crate::detectors::Detector;
use crate::features::FeatureSet;
use crate::types::{AlertCandidate, CandidateMetrics, DetectorKind, Rationale};

/// Sessions within which a crossover counts as fresh.
const MAX_CROSS_AGE: f64 = 3.0;

pub struct RegimeShiftDetector {
    rsi_oversold: f64,
    rsi_overbought: f64,
}

impl RegimeShiftDetector {
    pub fn new(config: &RegimeShiftConfig) -> Self {
        Self {
            rsi_oversold: config.rsi_oversold,
            rsi_overbought: config.rsi_overbought,
        }
    }

    fn sma_trigger(&self, features: &FeatureSet) -> Option<(f64, f64)> {
        let dir = features.sma_cross_dir?;
        let age = features.sma_cross_age?;
        if age > MAX_CROSS_AGE {
            return None;
        }
        let sma_50 = features.sma_50?;
        let sma_200 = features.sma_200?;
        if sma_200 == 0.0 {
            return None;
        }
        let magnitude = ((sma_50 - sma_200) / sma_200 * 100.0).abs();
        magnitude.is_finite().then_some((dir, magnitude))
    }

    fn rsi_trigger(&self, features: &FeatureSet) -> Option<(f64, f64)> {
        let rsi = features.rsi_14?;
        let prev = features.rsi_14_prev?;

        if prev >= self.rsi_oversold && rsi < self.rsi_oversold {
            // Momentum broke down through the oversold line.
            return Some((-1.0, self.rsi_oversold - rsi));
        }
        if prev <= self.rsi_overbought && rsi > self.rsi_overbought {
            return Some((1.0, rsi - self.rsi_overbought));
        }
        None
    }
}

impl Detector for RegimeShiftDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::RegimeShift
    }

    fn detect(&self, features: &FeatureSet) -> Option<AlertCandidate> {
        let rsi = features.rsi_14.unwrap_or(50.0);

        let (direction, magnitude, raw_score) = if let Some((dir, mag)) = self.sma_trigger(features)
        {
            (dir, mag, (50.0 + 10.0 * mag).clamp(0.0, 100.0))
        } else if let Some((dir, mag)) = self.rsi_trigger(features) {
            (dir, mag, (40.0 + 4.0 * mag).clamp(0.0, 100.0))
        } else {
            return None;
        };

        Some(AlertCandidate {
            detector: self.kind(),
            ticker: features.ticker.clone(),
            raw_score,
            metrics: CandidateMetrics::RegimeShift {
                rsi_14: rsi,
                cross_direction: direction,
                magnitude,
            },
            rationale: Rationale::TrendReversal,
        })
    }
}
