// =============================================================================
// Throttler & Risk Gate — publish/suppress decision for scored candidates
// =============================================================================
//
// Decision order for every scored candidate:
//
//   1. Daily cap      — published alerts for the UTC day vs max_alerts_per_day.
//   2. Cooldown       — per-ticker window; a materially improved score
//                       overrides it.
//   3. Risk gate      — margin, cash, and concentration checks against the
//                       externally supplied account snapshot. No account
//                       configured → permit with a warning.
//
// A rejection is a recorded decision, not an error. Only admitted alerts
// update the cooldown record and the daily counter.
// =============================================================================

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::config::{AlertsConfig, RiskConfig};
use crate::scoring::ScoredCandidate;
use crate::store::{Store, StoreResult};
use crate::types::{Ticker, VolStance};

/// Outcome of the gate.
#[derive(Debug, Clone)]
pub struct GateDecision {
    pub admit: bool,
    pub reason: Option<String>,
}

impl GateDecision {
    fn admit() -> Self {
        Self { admit: true, reason: None }
    }

    fn suppress(reason: String) -> Self {
        Self { admit: false, reason: Some(reason) }
    }
}

pub struct Throttler {
    store: Store,
    alerts: AlertsConfig,
    risk: RiskConfig,
}

impl Throttler {
    pub fn new(store: Store, alerts: AlertsConfig, risk: RiskConfig) -> Self {
        Self { store, alerts, risk }
    }

    /// Run the full decision procedure. Does not mutate any state.
    pub fn decide(&self, scored: &ScoredCandidate, now: DateTime<Utc>) -> StoreResult<GateDecision> {
        let ticker = &scored.candidate.ticker;

        // 1. Daily cap.
        let today = self.store.daily_counts().get_today(now)?;
        if today >= self.alerts.max_alerts_per_day {
            debug!(%ticker, today, cap = self.alerts.max_alerts_per_day, "suppressed: daily cap");
            return Ok(GateDecision::suppress(format!(
                "daily alert cap reached ({today}/{})",
                self.alerts.max_alerts_per_day
            )));
        }

        // 2. Cooldown.
        let (suppressed, remaining) = self.store.cooldowns().in_cooldown(
            ticker,
            self.alerts.cooldown_hours,
            self.alerts.min_score_improvement,
            scored.final_score,
            now,
        )?;
        if suppressed {
            let remaining = remaining.unwrap_or(0.0);
            debug!(%ticker, remaining_hours = remaining, "suppressed: cooldown");
            return Ok(GateDecision::suppress(format!(
                "cooldown active for another {remaining:.2}h without sufficient score improvement"
            )));
        }

        // 3. Portfolio risk gate.
        if let Some(reason) = self.risk_reason(scored) {
            debug!(%ticker, reason, "suppressed: risk gate");
            return Ok(GateDecision::suppress(reason));
        }

        Ok(GateDecision::admit())
    }

    /// Record the throttle side effects of an admitted alert: cooldown upsert
    /// plus the daily counter, in one transaction. Returns the day's count.
    pub fn record_admission(
        &self,
        ticker: &Ticker,
        final_score: f64,
        now: DateTime<Utc>,
    ) -> StoreResult<u32> {
        self.store.record_admission(ticker, now, final_score)
    }

    /// Risk-gate rejection reason, or `None` when the alert may pass.
    fn risk_reason(&self, scored: &ScoredCandidate) -> Option<String> {
        let Some(account) = &self.risk.account else {
            warn!(
                ticker = %scored.candidate.ticker,
                "no account configured — risk gate permits by default"
            );
            return None;
        };

        let notional = self.risk.notional_per_alert;

        // Short-premium playbooks consume margin; long-premium and neutral
        // structures consume cash.
        let (required_margin, required_cash) =
            match scored.candidate.detector.vol_stance() {
                VolStance::ShortVol => (notional, 0.0),
                VolStance::LongVol | VolStance::Neutral => (0.0, notional),
            };

        let margin_limit = self.risk.margin_gate_threshold_pct / 100.0 * account.margin_available;
        if required_margin > margin_limit {
            return Some(format!(
                "required margin {required_margin:.0} exceeds {:.0}% of available margin",
                self.risk.margin_gate_threshold_pct
            ));
        }

        let cash_limit = self.risk.cash_gate_threshold_pct / 100.0 * account.cash_available;
        if required_cash > cash_limit {
            return Some(format!(
                "required cash {required_cash:.0} exceeds {:.0}% of available cash",
                self.risk.cash_gate_threshold_pct
            ));
        }

        // Concentration: existing exposure plus this alert's notional against
        // total portfolio value (cash + positions).
        let total_value: f64 =
            account.cash_available + account.positions.iter().map(|p| p.value).sum::<f64>();
        if total_value > 0.0 {
            let existing: f64 = account
                .positions
                .iter()
                .filter(|p| p.ticker == scored.candidate.ticker)
                .map(|p| p.value)
                .sum();
            let concentration_pct = (existing + notional) / total_value * 100.0;
            if concentration_pct > self.risk.max_concentration_pct {
                return Some(format!(
                    "position would be {concentration_pct:.1}% of portfolio (max {:.1}%)",
                    self.risk.max_concentration_pct
                ));
            }
        }

        None
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    use crate::types::{
        AccountState, AlertCandidate, CandidateMetrics, DetectorKind, DirectionalBias,
        Explanation, Position, Rationale,
    };

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 8, 1, 20, 15, 0).unwrap()
    }

    fn scored(detector: DetectorKind, final_score: f64) -> ScoredCandidate {
        let metrics = match detector {
            DetectorKind::RichPremium => {
                CandidateMetrics::RichPremium { iv_percentile: 90.0, atm_iv: 0.5 }
            }
            _ => CandidateMetrics::LowIv { iv_percentile: 12.0, atm_iv: 0.22 },
        };
        ScoredCandidate {
            candidate: AlertCandidate {
                detector,
                ticker: Ticker::new("AAPL").unwrap(),
                raw_score: final_score,
                metrics,
                rationale: Rationale::IvDiscount,
            },
            final_score,
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
            modifiers: vec![],
        }
    }

    fn throttler_with(alerts: AlertsConfig, risk: RiskConfig) -> (Throttler, Store) {
        let store = Store::open_in_memory().unwrap();
        (Throttler::new(store.clone(), alerts, risk), store)
    }

    fn default_throttler() -> (Throttler, Store) {
        throttler_with(AlertsConfig::default(), RiskConfig::default())
    }

    #[test]
    fn clean_candidate_is_admitted() {
        let (throttler, _) = default_throttler();
        let decision = throttler.decide(&scored(DetectorKind::LowIv, 52.0), now()).unwrap();
        assert!(decision.admit);
        assert!(decision.reason.is_none());
    }

    #[test]
    fn daily_cap_suppresses() {
        let (throttler, store) = default_throttler();
        for _ in 0..5 {
            store.daily_counts().increment_today(now()).unwrap();
        }
        let decision = throttler.decide(&scored(DetectorKind::LowIv, 52.0), now()).unwrap();
        assert!(!decision.admit);
        assert!(decision.reason.unwrap().contains("daily alert cap"));
    }

    #[test]
    fn zero_cap_suppresses_everything() {
        let mut alerts = AlertsConfig::default();
        alerts.max_alerts_per_day = 0;
        let (throttler, _) = throttler_with(alerts, RiskConfig::default());
        let decision = throttler.decide(&scored(DetectorKind::LowIv, 99.0), now()).unwrap();
        assert!(!decision.admit);
    }

    #[test]
    fn cooldown_suppresses_without_improvement() {
        let (throttler, store) = default_throttler();
        store
            .cooldowns()
            .upsert(
                &Ticker::new("AAPL").unwrap(),
                now() - chrono::Duration::minutes(30),
                80.0,
            )
            .unwrap();
        let decision = throttler.decide(&scored(DetectorKind::LowIv, 75.0), now()).unwrap();
        assert!(!decision.admit);
        assert!(decision.reason.unwrap().contains("cooldown"));
    }

    #[test]
    fn cooldown_overridden_by_improvement() {
        let (throttler, store) = default_throttler();
        store
            .cooldowns()
            .upsert(
                &Ticker::new("AAPL").unwrap(),
                now() - chrono::Duration::minutes(30),
                80.0,
            )
            .unwrap();
        let decision = throttler.decide(&scored(DetectorKind::LowIv, 90.0), now()).unwrap();
        assert!(decision.admit);
    }

    #[test]
    fn no_account_permits_with_warning() {
        let (throttler, _) = default_throttler();
        assert!(throttler.decide(&scored(DetectorKind::RichPremium, 60.0), now()).unwrap().admit);
    }

    fn account(margin: f64, cash: f64, positions: Vec<Position>) -> RiskConfig {
        let mut risk = RiskConfig::default();
        risk.account = Some(AccountState {
            margin_available: margin,
            cash_available: cash,
            positions,
        });
        risk
    }

    #[test]
    fn margin_gate_rejects_short_vol_when_thin() {
        // Short-vol needs 10k margin; 50% of 15k available = 7.5k limit.
        let (throttler, _) = throttler_with(AlertsConfig::default(), account(15_000.0, 1e6, vec![]));
        let decision = throttler.decide(&scored(DetectorKind::RichPremium, 60.0), now()).unwrap();
        assert!(!decision.admit);
        assert!(decision.reason.unwrap().contains("margin"));
    }

    #[test]
    fn cash_gate_rejects_long_vol_when_thin() {
        let (throttler, _) = throttler_with(AlertsConfig::default(), account(1e6, 15_000.0, vec![]));
        let decision = throttler.decide(&scored(DetectorKind::LowIv, 60.0), now()).unwrap();
        assert!(!decision.admit);
        assert!(decision.reason.unwrap().contains("cash"));
    }

    #[test]
    fn concentration_gate_counts_existing_exposure() {
        // Portfolio: 400k cash + 100k positions (60k already in AAPL).
        // New 10k notional → 70k / 500k = 14% > 5%.
        let positions = vec![
            Position { ticker: Ticker::new("AAPL").unwrap(), value: 60_000.0 },
            Position { ticker: Ticker::new("MSFT").unwrap(), value: 40_000.0 },
        ];
        let (throttler, _) =
            throttler_with(AlertsConfig::default(), account(1e6, 400_000.0, positions));
        let decision = throttler.decide(&scored(DetectorKind::LowIv, 60.0), now()).unwrap();
        assert!(!decision.admit);
        assert!(decision.reason.unwrap().contains("portfolio"));
    }

    #[test]
    fn well_capitalised_account_admits() {
        let (throttler, _) = throttler_with(AlertsConfig::default(), account(1e6, 1e6, vec![]));
        assert!(throttler.decide(&scored(DetectorKind::RichPremium, 60.0), now()).unwrap().admit);
        assert!(throttler.decide(&scored(DetectorKind::LowIv, 60.0), now()).unwrap().admit);
    }

    #[test]
    fn admission_updates_cooldown_and_counter() {
        let (throttler, store) = default_throttler();
        let ticker = Ticker::new("AAPL").unwrap();
        let count = throttler.record_admission(&ticker, 52.0, now()).unwrap();
        assert_eq!(count, 1);
        assert_eq!(store.daily_counts().get_today(now()).unwrap(), 1);
        let cd = store.cooldowns().get(&ticker).unwrap().unwrap();
        assert!((cd.last_score - 52.0).abs() < 1e-12);
        assert_eq!(cd.last_alert_ts, now());
    }

    #[test]
    fn rejected_candidate_leaves_cooldown_untouched() {
        let mut alerts = AlertsConfig::default();
        alerts.max_alerts_per_day = 0;
        let (throttler, store) = throttler_with(alerts, RiskConfig::default());
        let decision = throttler.decide(&scored(DetectorKind::LowIv, 99.0), now()).unwrap();
        assert!(!decision.admit);
        // decide() never mutates; only record_admission does.
        assert!(store.cooldowns().get(&Ticker::new("AAPL").unwrap()).unwrap().is_none());
        assert_eq!(store.daily_counts().get_today(now()).unwrap(), 0);
    }
}
