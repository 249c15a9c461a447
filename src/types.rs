// =============================================================================
// Shared types used across the Vegawatch engine
// =============================================================================

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// Ticker
// =============================================================================

/// Opaque uppercase equity symbol, 1–8 characters.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ticker(String);

impl Ticker {
    /// Construct a ticker, normalising to uppercase. Returns `None` when the
    /// symbol is empty, longer than 8 characters, or not ASCII-alphanumeric.
    pub fn new(symbol: &str) -> Option<Self> {
        let s = symbol.trim().to_uppercase();
        if s.is_empty() || s.len() > 8 || !s.chars().all(|c| c.is_ascii_alphanumeric() || c == '.') {
            return None;
        }
        Some(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Ticker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Option chain
// =============================================================================

/// Call or put side of a contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptionType {
    Call,
    Put,
}

impl std::fmt::Display for OptionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Call => write!(f, "call"),
            Self::Put => write!(f, "put"),
        }
    }
}

/// One listed contract row. Quote fields are optional because providers omit
/// them for illiquid strikes; Greeks are optional because not every provider
/// computes them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionContract {
    pub strike: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bid: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ask: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last: Option<f64>,
    #[serde(default)]
    pub volume: u64,
    #[serde(default)]
    pub open_interest: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub implied_volatility: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gamma: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vega: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub theta: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rho: Option<f64>,
}

impl OptionContract {
    /// Mid price when both sides of the quote are present.
    pub fn mid(&self) -> Option<f64> {
        match (self.bid, self.ask) {
            (Some(b), Some(a)) if a > 0.0 => Some((b + a) / 2.0),
            _ => None,
        }
    }

    /// Check the ranges every well-formed chain row satisfies: `bid ≤ last ≤
    /// ask` when all three quotes are present, delta in [0, 1] for calls and
    /// [−1, 0] for puts, and a finite non-negative implied volatility.
    ///
    /// Returns a description of the first violated range, or `None` for a
    /// clean row. Absent fields are not violations.
    pub fn invariant_violation(&self, side: OptionType) -> Option<String> {
        if let (Some(bid), Some(last), Some(ask)) = (self.bid, self.last, self.ask) {
            if !(bid <= last && last <= ask) {
                return Some(format!("quote out of order: bid {bid}, last {last}, ask {ask}"));
            }
        }
        if let Some(delta) = self.delta {
            let in_range = match side {
                OptionType::Call => (0.0..=1.0).contains(&delta),
                OptionType::Put => (-1.0..=0.0).contains(&delta),
            };
            if !in_range {
                return Some(format!("{side} delta {delta} out of range"));
            }
        }
        if let Some(iv) = self.implied_volatility {
            if !iv.is_finite() || iv < 0.0 {
                return Some(format!("implied volatility {iv} is not a valid vol"));
            }
        }
        None
    }
}

/// All calls and puts for a single expiration, strikes ascending.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpirationSlice {
    pub expiration: NaiveDate,
    pub calls: Vec<OptionContract>,
    pub puts: Vec<OptionContract>,
}

/// A full option chain captured at one instant. Created atomically by a scan
/// and never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainSnapshot {
    pub ticker: Ticker,
    pub captured_at: DateTime<Utc>,
    pub underlying_price: f64,
    /// Ordered by expiration ascending.
    pub by_expiration: Vec<ExpirationSlice>,
}

// =============================================================================
// Price history
// =============================================================================

/// One daily OHLCV bar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceBar {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

/// Static provider metadata for a ticker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TickerInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sector: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub market_cap: Option<f64>,
    /// Next scheduled earnings date, when the provider knows it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_earnings: Option<NaiveDate>,
}

/// One daily ATM-IV observation used for percentile/rank windows. The 25-delta
/// skew rides along so skew anomaly statistics can be derived from the same
/// history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IvSample {
    pub date: NaiveDate,
    pub atm_iv: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skew_25d: Option<f64>,
}

// =============================================================================
// Detectors & alerts
// =============================================================================

/// The six built-in pattern detectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DetectorKind {
    LowIv,
    RichPremium,
    EarningsCrush,
    TermKink,
    SkewAnomaly,
    RegimeShift,
}

impl DetectorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LowIv => "low_iv",
            Self::RichPremium => "rich_premium",
            Self::EarningsCrush => "earnings_crush",
            Self::TermKink => "term_kink",
            Self::SkewAnomaly => "skew_anomaly",
            Self::RegimeShift => "regime_shift",
        }
    }

    /// Parse the storage name back into a kind.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "low_iv" => Some(Self::LowIv),
            "rich_premium" => Some(Self::RichPremium),
            "earnings_crush" => Some(Self::EarningsCrush),
            "term_kink" => Some(Self::TermKink),
            "skew_anomaly" => Some(Self::SkewAnomaly),
            "regime_shift" => Some(Self::RegimeShift),
            _ => None,
        }
    }

    /// Whether the detector's playbooks are net long or short volatility.
    pub fn vol_stance(&self) -> VolStance {
        match self {
            Self::LowIv => VolStance::LongVol,
            Self::RichPremium | Self::EarningsCrush => VolStance::ShortVol,
            Self::TermKink | Self::SkewAnomaly | Self::RegimeShift => VolStance::Neutral,
        }
    }
}

impl std::fmt::Display for DetectorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Volatility stance of a detector's playbooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolStance {
    LongVol,
    ShortVol,
    Neutral,
}

/// Rationale template key, one per detector family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Rationale {
    IvDiscount,
    IvPremium,
    EarningsCrush,
    TermStructureKink,
    SkewDislocation,
    TrendReversal,
}

/// Typed metric payload, one variant per detector. The string-keyed form is
/// produced only at the persistence and explanation boundaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CandidateMetrics {
    LowIv {
        iv_percentile: f64,
        atm_iv: f64,
    },
    RichPremium {
        iv_percentile: f64,
        atm_iv: f64,
    },
    EarningsCrush {
        days_to_earnings: f64,
        iv_rank: f64,
    },
    TermKink {
        term_slope: f64,
        atm_iv_front: f64,
        atm_iv_back: f64,
    },
    SkewAnomaly {
        skew_25d: f64,
        zscore: f64,
    },
    RegimeShift {
        rsi_14: f64,
        cross_direction: f64,
        magnitude: f64,
    },
}

impl CandidateMetrics {
    /// Flatten into `(name, value)` pairs for persistence and explanations.
    pub fn to_pairs(&self) -> Vec<(&'static str, f64)> {
        match *self {
            Self::LowIv { iv_percentile, atm_iv } => {
                vec![("iv_percentile", iv_percentile), ("atm_iv", atm_iv)]
            }
            Self::RichPremium { iv_percentile, atm_iv } => {
                vec![("iv_percentile", iv_percentile), ("atm_iv", atm_iv)]
            }
            Self::EarningsCrush { days_to_earnings, iv_rank } => vec![
                ("days_to_earnings", days_to_earnings),
                ("iv_rank", iv_rank),
            ],
            Self::TermKink { term_slope, atm_iv_front, atm_iv_back } => vec![
                ("term_slope", term_slope),
                ("atm_iv_front", atm_iv_front),
                ("atm_iv_back", atm_iv_back),
            ],
            Self::SkewAnomaly { skew_25d, zscore } => {
                vec![("skew_25d", skew_25d), ("zscore", zscore)]
            }
            Self::RegimeShift { rsi_14, cross_direction, magnitude } => vec![
                ("rsi_14", rsi_14),
                ("cross_direction", cross_direction),
                ("magnitude", magnitude),
            ],
        }
    }
}

/// Output of a single detector invocation, before scoring and gating.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertCandidate {
    pub detector: DetectorKind,
    pub ticker: Ticker,
    /// Raw detector score in [0, 100].
    pub raw_score: f64,
    pub metrics: CandidateMetrics,
    pub rationale: Rationale,
}

/// Directional read derived from the technical section of a feature set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DirectionalBias {
    Bullish,
    Bearish,
    Neutral,
}

impl std::fmt::Display for DirectionalBias {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bullish => write!(f, "bullish"),
            Self::Bearish => write!(f, "bearish"),
            Self::Neutral => write!(f, "neutral"),
        }
    }
}

/// A single named metric inside an explanation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyMetric {
    pub name: String,
    pub value: f64,
    pub unit: String,
}

/// Deterministic explanation record attached to every published alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Explanation {
    pub summary: String,
    pub rationale: Rationale,
    pub key_metrics: Vec<KeyMetric>,
    pub directional_bias: DirectionalBias,
    pub risk_factors: Vec<String>,
    /// Playbook names, best fit first.
    pub opportunities: Vec<String>,
    pub timeframe: String,
    pub next_monitoring_points: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

/// A persisted alert: a scored candidate that passed the throttle and risk
/// gates. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    /// Store-assigned row id (0 until persisted).
    #[serde(default)]
    pub id: i64,
    pub scan_id: String,
    pub ticker: Ticker,
    pub detector: DetectorKind,
    pub raw_score: f64,
    pub final_score: f64,
    pub explanation: Explanation,
    pub strategies: Vec<String>,
    /// String-keyed metric bag, used only at the persistence boundary.
    pub metrics: BTreeMap<String, f64>,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Throttling & portfolio risk
// =============================================================================

/// Per-ticker throttle summary. Mutated only by the throttler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CooldownRecord {
    pub ticker: Ticker,
    pub last_alert_ts: DateTime<Utc>,
    pub last_score: f64,
}

/// One open position in the external account snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub ticker: Ticker,
    /// Current mark value of the position in account currency.
    pub value: f64,
}

/// Externally supplied portfolio state consulted by the risk gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountState {
    pub margin_available: f64,
    pub cash_available: f64,
    pub positions: Vec<Position>,
}

/// Scan lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Partial,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Partial => "partial",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "partial" => Some(Self::Partial),
            _ => None,
        }
    }
}

impl std::fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One scan row as read back from the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanRecord {
    pub scan_id: String,
    pub config_hash: String,
    pub status: ScanStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub tickers_scanned: u32,
    pub tickers_skipped: u32,
    pub alerts_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runtime_secs: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// =============================================================================
// Scheduler state
// =============================================================================

/// Position of the scheduler's finite state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SchedulerPhase {
    Idle,
    Waiting,
    Collecting,
    Flushing,
    BackingOff,
}

impl std::fmt::Display for SchedulerPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "IDLE"),
            Self::Waiting => write!(f, "WAITING"),
            Self::Collecting => write!(f, "COLLECTING"),
            Self::Flushing => write!(f, "FLUSHING"),
            Self::BackingOff => write!(f, "BACKING_OFF"),
        }
    }
}

/// Serialised scheduler state, written after every transition and counter
/// update so a restart can resume mid-day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerState {
    pub current_state: SchedulerPhase,
    pub api_calls_today: u32,
    pub api_calls_this_hour: u32,
    pub hour_window_start: DateTime<Utc>,
    pub day_window_start: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_collection_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff_until: Option<DateTime<Utc>>,
    pub write_buffer_count: u32,
    pub updated_at: DateTime<Utc>,
}

impl SchedulerState {
    /// Fresh state with zeroed counters, stamped at `now`.
    pub fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            current_state: SchedulerPhase::Idle,
            api_calls_today: 0,
            api_calls_this_hour: 0,
            hour_window_start: now,
            day_window_start: now,
            next_collection_at: None,
            consecutive_failures: 0,
            backoff_until: None,
            write_buffer_count: 0,
            updated_at: now,
        }
    }
}
