// =============================================================================
// Scorer & Explanation — modifier stack over raw detector scores
// =============================================================================
//
//   final_score = clip(raw_score · Π modifiers, 0, 100)
//
// Modifiers are multiplicative, each defaulting to 1.0 (no-op) and clamped to
// [0.5, 1.5] at config load:
//
//   thesis      applies when the ticker carries a thesis document
//   liquidity   applies when the near-ATM mean spread exceeds the threshold
//   earnings    applies within 7 days of earnings; inverted for LowIv
//   technical   configured value when detector direction aligns with the SMA
//               trend, inverted when opposed
//   volatility  inverted for short-vol detectors in extreme-high HV20,
//               configured value for long-vol detectors in low HV20
//
// The explanation record is a deterministic function of the detector name and
// a small set of key features; no external calls, no randomness.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::config::ScoringConfig;
use crate::features::FeatureSet;
use crate::types::{
    AlertCandidate, CandidateMetrics, DetectorKind, DirectionalBias, Explanation, KeyMetric,
    VolStance,
};

/// Annualised HV20 at or above this counts as extreme-high.
const HV_EXTREME_HIGH: f64 = 0.60;
/// Annualised HV20 at or below this counts as low.
const HV_LOW: f64 = 0.15;
/// Days-to-earnings window in which the earnings modifier applies.
const EARNINGS_WINDOW_DAYS: f64 = 7.0;

/// A candidate after the modifier stack has been applied.
#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    pub candidate: AlertCandidate,
    pub final_score: f64,
    pub explanation: Explanation,
    /// Playbook names, best fit first.
    pub strategies: Vec<String>,
    /// The applied modifiers, for the audit log.
    pub modifiers: Vec<AppliedModifier>,
}

/// One named multiplier that participated in the final score.
#[derive(Debug, Clone, Serialize)]
pub struct AppliedModifier {
    pub name: &'static str,
    pub value: f64,
}

pub struct Scorer {
    config: ScoringConfig,
}

impl Scorer {
    pub fn new(config: ScoringConfig) -> Self {
        Self { config }
    }

    /// Apply the modifier stack and build the explanation.
    pub fn score(
        &self,
        candidate: &AlertCandidate,
        features: &FeatureSet,
        now: DateTime<Utc>,
    ) -> ScoredCandidate {
        let modifiers = self.collect_modifiers(candidate, features);
        let product: f64 = modifiers.iter().map(|m| m.value).product();
        let final_score = (candidate.raw_score * product).clamp(0.0, 100.0);

        debug!(
            detector = %candidate.detector,
            ticker = %candidate.ticker,
            raw_score = candidate.raw_score,
            final_score,
            "candidate scored"
        );

        let explanation = build_explanation(candidate, features, final_score, now);
        let strategies = playbooks(candidate.detector)
            .iter()
            .map(|s| s.to_string())
            .collect();

        ScoredCandidate {
            candidate: candidate.clone(),
            final_score,
            explanation,
            strategies,
            modifiers,
        }
    }

    fn collect_modifiers(
        &self,
        candidate: &AlertCandidate,
        features: &FeatureSet,
    ) -> Vec<AppliedModifier> {
        let mut out = Vec::with_capacity(5);
        let cfg = &self.config;

        // Thesis: boosts tickers with an active thesis document.
        let thesis = if cfg.thesis_tickers.iter().any(|t| t == candidate.ticker.as_str()) {
            cfg.thesis
        } else {
            1.0
        };
        out.push(AppliedModifier { name: "thesis", value: thesis });

        // Liquidity: penalises wide near-ATM markets.
        let liquidity = match features.mean_spread_pct {
            Some(spread) if spread > cfg.max_spread_pct => cfg.liquidity,
            _ => 1.0,
        };
        out.push(AppliedModifier { name: "liquidity", value: liquidity });

        // Earnings: boosts event-driven setups, damps LowIv (cheap vol into a
        // known catalyst is usually cheap for a reason).
        let earnings = match features.days_to_earnings {
            Some(days) if days <= EARNINGS_WINDOW_DAYS => {
                if candidate.detector == DetectorKind::LowIv {
                    invert(cfg.earnings)
                } else {
                    cfg.earnings
                }
            }
            _ => 1.0,
        };
        out.push(AppliedModifier { name: "earnings", value: earnings });

        // Technical: configured value when the detector direction agrees with
        // the SMA trend, inverted when it fights it.
        let technical = match features.trend_aligned_with(candidate_bias(candidate)) {
            Some(true) => cfg.technical,
            Some(false) => invert(cfg.technical),
            None => 1.0,
        };
        out.push(AppliedModifier { name: "technical", value: technical });

        // Volatility: realised-vol context per the detector's vol stance.
        let volatility = match (features.hv_20, candidate.detector.vol_stance()) {
            (Some(hv), VolStance::ShortVol) if hv >= HV_EXTREME_HIGH => invert(cfg.volatility),
            (Some(hv), VolStance::LongVol) if hv <= HV_LOW => cfg.volatility,
            _ => 1.0,
        };
        out.push(AppliedModifier { name: "volatility", value: volatility });

        out
    }
}

/// Mirror a configured boost into a damp (and vice versa), staying in band.
fn invert(modifier: f64) -> f64 {
    (2.0 - modifier).clamp(0.5, 1.5)
}

/// Directional read implied by the candidate itself.
fn candidate_bias(candidate: &AlertCandidate) -> DirectionalBias {
    match &candidate.metrics {
        CandidateMetrics::RegimeShift { cross_direction, .. } => {
            if *cross_direction > 0.0 {
                DirectionalBias::Bullish
            } else {
                DirectionalBias::Bearish
            }
        }
        CandidateMetrics::SkewAnomaly { skew_25d, .. } => {
            // Rich put skew reads as downside fear.
            if *skew_25d > 0.0 {
                DirectionalBias::Bearish
            } else {
                DirectionalBias::Bullish
            }
        }
        _ => DirectionalBias::Neutral,
    }
}

// =============================================================================
// Explanation templates
// =============================================================================

/// Ordered playbooks per detector, best fit first.
pub fn playbooks(detector: DetectorKind) -> &'static [&'static str] {
    match detector {
        DetectorKind::LowIv => &["long_straddle", "calendar_spread", "protective_puts"],
        DetectorKind::RichPremium => &["iron_condor", "credit_spread", "covered_call"],
        DetectorKind::EarningsCrush => &["post_earnings_iv_crush", "short_strangle"],
        DetectorKind::TermKink => &["calendar_spread", "diagonal_spread"],
        DetectorKind::SkewAnomaly => &["risk_reversal", "put_spread"],
        DetectorKind::RegimeShift => &["trend_following", "momentum_breakout"],
    }
}

fn timeframe(detector: DetectorKind) -> &'static str {
    match detector {
        DetectorKind::LowIv | DetectorKind::RichPremium => "2-6 weeks",
        DetectorKind::EarningsCrush => "through the earnings report",
        DetectorKind::TermKink => "until front expiration",
        DetectorKind::SkewAnomaly => "1-3 weeks",
        DetectorKind::RegimeShift => "1-2 months",
    }
}

fn metric_unit(name: &str) -> &'static str {
    match name {
        "iv_percentile" | "iv_rank" => "pctile",
        "atm_iv" | "atm_iv_front" | "atm_iv_back" | "term_slope" | "skew_25d" => "vol",
        "days_to_earnings" => "days",
        "rsi_14" => "index",
        "zscore" | "cross_direction" | "magnitude" => "ratio",
        _ => "",
    }
}

fn summary(candidate: &AlertCandidate) -> String {
    let t = &candidate.ticker;
    match &candidate.metrics {
        CandidateMetrics::LowIv { iv_percentile, .. } => format!(
            "{t} implied volatility sits in the {iv_percentile:.0}th percentile of its one-year range."
        ),
        CandidateMetrics::RichPremium { iv_percentile, .. } => format!(
            "{t} implied volatility is rich at the {iv_percentile:.0}th percentile of its one-year range."
        ),
        CandidateMetrics::EarningsCrush { days_to_earnings, iv_rank } => format!(
            "{t} reports earnings in {days_to_earnings:.0} day(s) with IV rank {iv_rank:.0}."
        ),
        CandidateMetrics::TermKink { term_slope, .. } => format!(
            "{t} term structure is kinked: back-month minus front-month IV is {term_slope:.3}."
        ),
        CandidateMetrics::SkewAnomaly { skew_25d, zscore } => format!(
            "{t} 25-delta skew of {skew_25d:.3} is {zscore:.1} standard deviations from its 60-day norm."
        ),
        CandidateMetrics::RegimeShift { cross_direction, .. } => {
            let side = if *cross_direction > 0.0 { "bullish" } else { "bearish" };
            format!("{t} technical regime shifted {side} on a moving-average or momentum cross.")
        }
    }
}

fn risk_factors(candidate: &AlertCandidate, features: &FeatureSet) -> Vec<String> {
    let mut out: Vec<String> = match candidate.detector {
        DetectorKind::LowIv => vec![
            "cheap volatility can stay cheap for extended stretches".to_string(),
            "long premium decays while waiting for expansion".to_string(),
        ],
        DetectorKind::RichPremium => vec![
            "short premium carries open-ended tail risk".to_string(),
            "elevated IV often precedes realised moves".to_string(),
        ],
        DetectorKind::EarningsCrush => vec![
            "the post-earnings gap can exceed the implied move".to_string(),
        ],
        DetectorKind::TermKink => vec![
            "term structure kinks resolve in either direction".to_string(),
        ],
        DetectorKind::SkewAnomaly => vec![
            "skew dislocations can reflect real positioning, not mispricing".to_string(),
        ],
        DetectorKind::RegimeShift => vec![
            "crossover signals whipsaw in range-bound markets".to_string(),
        ],
    };

    if let Some(days) = features.days_to_earnings {
        if days <= EARNINGS_WINDOW_DAYS && candidate.detector != DetectorKind::EarningsCrush {
            out.push(format!("earnings report expected within {days:.0} day(s)"));
        }
    }
    if let Some(spread) = features.mean_spread_pct {
        if spread > 10.0 {
            out.push(format!("near-ATM spreads average {spread:.1}% of mid"));
        }
    }
    out
}

fn monitoring_points(candidate: &AlertCandidate) -> Vec<String> {
    match candidate.detector {
        DetectorKind::LowIv => vec![
            "daily ATM IV versus the 252-day window".to_string(),
            "IV percentile re-crossing the entry threshold".to_string(),
        ],
        DetectorKind::RichPremium => vec![
            "IV percentile mean-reverting below the entry threshold".to_string(),
        ],
        DetectorKind::EarningsCrush => vec![
            "confirmed earnings date and time".to_string(),
            "front-expiration IV into the print".to_string(),
        ],
        DetectorKind::TermKink => vec!["front/back ATM IV convergence".to_string()],
        DetectorKind::SkewAnomaly => vec!["25-delta skew versus its 60-day mean".to_string()],
        DetectorKind::RegimeShift => vec![
            "SMA-50/SMA-200 separation".to_string(),
            "RSI(14) follow-through".to_string(),
        ],
    }
}

fn build_explanation(
    candidate: &AlertCandidate,
    features: &FeatureSet,
    _final_score: f64,
    now: DateTime<Utc>,
) -> Explanation {
    let key_metrics = candidate
        .metrics
        .to_pairs()
        .into_iter()
        .map(|(name, value)| KeyMetric {
            name: name.to_string(),
            value,
            unit: metric_unit(name).to_string(),
        })
        .collect();

    // The published bias prefers what the candidate itself implies and falls
    // back to the technical trend.
    let directional_bias = match candidate_bias(candidate) {
        DirectionalBias::Neutral => features.directional_bias(),
        bias => bias,
    };

    Explanation {
        summary: summary(candidate),
        rationale: candidate.rationale,
        key_metrics,
        directional_bias,
        risk_factors: risk_factors(candidate, features),
        opportunities: playbooks(candidate.detector)
            .iter()
            .map(|s| s.to_string())
            .collect(),
        timeframe: timeframe(candidate.detector).to_string(),
        next_monitoring_points: monitoring_points(candidate),
        timestamp: now,
    }
}
