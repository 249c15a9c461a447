// =============================================================================
// Engine Configuration — immutable snapshot of every operational parameter
// =============================================================================
//
// A config is an immutable snapshot: hot-reload means building a fresh one
// and handing it to the engine, never mutating in place. On disk it is a
// JSON document where every field is optional — old files keep loading after
// new knobs are added — and writes go through a scratch file that is renamed
// into place, so a crash can never leave a torn document behind.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::info;

use crate::types::AccountState;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_watchlist() -> Vec<String> {
    vec![
        "AAPL".to_string(),
        "MSFT".to_string(),
        "NVDA".to_string(),
        "AMZN".to_string(),
        "SPY".to_string(),
    ]
}

fn default_demo_seed() -> u64 {
    20240214
}

fn default_db_path() -> String {
    "vegawatch.db".to_string()
}

fn default_export_dir() -> String {
    "export".to_string()
}

fn default_collection_times_et() -> Vec<String> {
    vec!["16:15".to_string()]
}

fn default_max_calls_per_hour() -> u32 {
    250
}

fn default_max_calls_per_day() -> u32 {
    2000
}

fn default_flush_threshold() -> usize {
    50
}

fn default_check_interval_sec() -> u64 {
    10
}

fn default_export_interval_sec() -> u64 {
    300
}

fn default_cache_max_mb() -> u64 {
    100
}

fn default_ttl_current_price() -> u64 {
    60
}

fn default_ttl_options_chain() -> u64 {
    300
}

fn default_ttl_price_history() -> u64 {
    3600
}

fn default_ttl_ticker_info() -> u64 {
    86_400
}

fn default_ttl_expirations() -> u64 {
    1800
}

fn default_low_iv_percentile_max() -> f64 {
    25.0
}

fn default_rich_premium_percentile_min() -> f64 {
    75.0
}

fn default_earnings_iv_rank_min() -> f64 {
    70.0
}

fn default_term_slope_threshold() -> f64 {
    0.04
}

fn default_skew_zscore_threshold() -> f64 {
    2.0
}

fn default_rsi_oversold() -> f64 {
    30.0
}

fn default_rsi_overbought() -> f64 {
    70.0
}

fn default_cooldown_hours() -> f64 {
    1.0
}

fn default_min_score_improvement() -> f64 {
    0.1
}

fn default_max_alerts_per_day() -> u32 {
    5
}

fn default_margin_gate_threshold_pct() -> f64 {
    50.0
}

fn default_cash_gate_threshold_pct() -> f64 {
    50.0
}

fn default_max_concentration_pct() -> f64 {
    5.0
}

fn default_modifier() -> f64 {
    1.0
}

fn default_max_spread_pct() -> f64 {
    8.0
}

fn default_notional_per_alert() -> f64 {
    10_000.0
}

// =============================================================================
// Sections
// =============================================================================

/// Scheduler pacing and rate budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Wall-clock collection times in America/New_York, "HH:MM".
    #[serde(default = "default_collection_times_et")]
    pub collection_times_et: Vec<String>,

    #[serde(default = "default_max_calls_per_hour")]
    pub max_calls_per_hour: u32,

    #[serde(default = "default_max_calls_per_day")]
    pub max_calls_per_day: u32,

    /// Alert buffer size that triggers a FLUSHING transition.
    #[serde(default = "default_flush_threshold")]
    pub flush_threshold: usize,

    /// Tick interval of the scheduler loop in seconds.
    #[serde(default = "default_check_interval_sec")]
    pub check_interval_sec: u64,

    /// Periodic export interval in seconds.
    #[serde(default = "default_export_interval_sec")]
    pub export_interval_sec: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            collection_times_et: default_collection_times_et(),
            max_calls_per_hour: default_max_calls_per_hour(),
            max_calls_per_day: default_max_calls_per_day(),
            flush_threshold: default_flush_threshold(),
            check_interval_sec: default_check_interval_sec(),
            export_interval_sec: default_export_interval_sec(),
        }
    }
}

/// TTL cache sizing and per-endpoint lifetimes (seconds).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_max_mb")]
    pub max_mb: u64,

    #[serde(default = "default_ttl_current_price")]
    pub ttl_current_price_sec: u64,

    #[serde(default = "default_ttl_options_chain")]
    pub ttl_options_chain_sec: u64,

    #[serde(default = "default_ttl_price_history")]
    pub ttl_price_history_sec: u64,

    #[serde(default = "default_ttl_ticker_info")]
    pub ttl_ticker_info_sec: u64,

    #[serde(default = "default_ttl_expirations")]
    pub ttl_expirations_sec: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_mb: default_cache_max_mb(),
            ttl_current_price_sec: default_ttl_current_price(),
            ttl_options_chain_sec: default_ttl_options_chain(),
            ttl_price_history_sec: default_ttl_price_history(),
            ttl_ticker_info_sec: default_ttl_ticker_info(),
            ttl_expirations_sec: default_ttl_expirations(),
        }
    }
}

/// Failure threshold and recovery timeout for one endpoint breaker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BreakerParams {
    pub failure_threshold: u32,
    pub recovery_timeout_sec: u64,
}

/// Per-endpoint breaker tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakersConfig {
    #[serde(default = "BreakersConfig::default_current_price")]
    pub current_price: BreakerParams,
    #[serde(default = "BreakersConfig::default_price_history")]
    pub price_history: BreakerParams,
    #[serde(default = "BreakersConfig::default_options_chain")]
    pub options_chain: BreakerParams,
    #[serde(default = "BreakersConfig::default_ticker_info")]
    pub ticker_info: BreakerParams,
    #[serde(default = "BreakersConfig::default_expirations")]
    pub expirations: BreakerParams,
}

impl BreakersConfig {
    fn default_current_price() -> BreakerParams {
        BreakerParams { failure_threshold: 5, recovery_timeout_sec: 60 }
    }
    fn default_price_history() -> BreakerParams {
        BreakerParams { failure_threshold: 5, recovery_timeout_sec: 60 }
    }
    fn default_options_chain() -> BreakerParams {
        BreakerParams { failure_threshold: 3, recovery_timeout_sec: 90 }
    }
    fn default_ticker_info() -> BreakerParams {
        BreakerParams { failure_threshold: 5, recovery_timeout_sec: 60 }
    }
    fn default_expirations() -> BreakerParams {
        BreakerParams { failure_threshold: 4, recovery_timeout_sec: 75 }
    }
}

impl Default for BreakersConfig {
    fn default() -> Self {
        Self {
            current_price: Self::default_current_price(),
            price_history: Self::default_price_history(),
            options_chain: Self::default_options_chain(),
            ticker_info: Self::default_ticker_info(),
            expirations: Self::default_expirations(),
        }
    }
}

/// Low-IV detector thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LowIvConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Fires when iv_percentile is at or below this value.
    #[serde(default = "default_low_iv_percentile_max")]
    pub percentile_max: f64,
}

impl Default for LowIvConfig {
    fn default() -> Self {
        Self { enabled: true, percentile_max: default_low_iv_percentile_max() }
    }
}

/// Rich-premium detector thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RichPremiumConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Fires when iv_percentile is at or above this value.
    #[serde(default = "default_rich_premium_percentile_min")]
    pub percentile_min: f64,
}

impl Default for RichPremiumConfig {
    fn default() -> Self {
        Self { enabled: true, percentile_min: default_rich_premium_percentile_min() }
    }
}

/// Earnings-crush detector thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EarningsCrushConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Minimum IV rank required alongside an earnings date 1–7 days out.
    #[serde(default = "default_earnings_iv_rank_min")]
    pub iv_rank_min: f64,
}

impl Default for EarningsCrushConfig {
    fn default() -> Self {
        Self { enabled: true, iv_rank_min: default_earnings_iv_rank_min() }
    }
}

/// Term-kink detector thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TermKinkConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Absolute term slope (back IV − front IV) that triggers a signal.
    #[serde(default = "default_term_slope_threshold")]
    pub slope_threshold: f64,
}

impl Default for TermKinkConfig {
    fn default() -> Self {
        Self { enabled: true, slope_threshold: default_term_slope_threshold() }
    }
}

/// Skew-anomaly detector thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkewAnomalyConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Number of standard deviations above the rolling 60-day mean.
    #[serde(default = "default_skew_zscore_threshold")]
    pub zscore_threshold: f64,
}

impl Default for SkewAnomalyConfig {
    fn default() -> Self {
        Self { enabled: true, zscore_threshold: default_skew_zscore_threshold() }
    }
}

/// Regime-shift detector thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeShiftConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_rsi_oversold")]
    pub rsi_oversold: f64,
    #[serde(default = "default_rsi_overbought")]
    pub rsi_overbought: f64,
}

impl Default for RegimeShiftConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rsi_oversold: default_rsi_oversold(),
            rsi_overbought: default_rsi_overbought(),
        }
    }
}

/// All detector sections.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetectorsConfig {
    #[serde(default)]
    pub low_iv: LowIvConfig,
    #[serde(default)]
    pub rich_premium: RichPremiumConfig,
    #[serde(default)]
    pub earnings_crush: EarningsCrushConfig,
    #[serde(default)]
    pub term_kink: TermKinkConfig,
    #[serde(default)]
    pub skew_anomaly: SkewAnomalyConfig,
    #[serde(default)]
    pub regime_shift: RegimeShiftConfig,
}

/// Alert throttling knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertsConfig {
    #[serde(default = "default_cooldown_hours")]
    pub cooldown_hours: f64,

    /// Minimum final-score improvement required to override a cooldown.
    #[serde(default = "default_min_score_improvement")]
    pub min_score_improvement: f64,

    #[serde(default = "default_max_alerts_per_day")]
    pub max_alerts_per_day: u32,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            cooldown_hours: default_cooldown_hours(),
            min_score_improvement: default_min_score_improvement(),
            max_alerts_per_day: default_max_alerts_per_day(),
        }
    }
}

/// Portfolio risk gate thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    #[serde(default = "default_margin_gate_threshold_pct")]
    pub margin_gate_threshold_pct: f64,

    #[serde(default = "default_cash_gate_threshold_pct")]
    pub cash_gate_threshold_pct: f64,

    #[serde(default = "default_max_concentration_pct")]
    pub max_concentration_pct: f64,

    /// Assumed notional committed per published alert, used to estimate
    /// margin/cash requirements from candidate metrics.
    #[serde(default = "default_notional_per_alert")]
    pub notional_per_alert: f64,

    /// External account snapshot; absent means the gate permits with a warning.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account: Option<AccountState>,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            margin_gate_threshold_pct: default_margin_gate_threshold_pct(),
            cash_gate_threshold_pct: default_cash_gate_threshold_pct(),
            max_concentration_pct: default_max_concentration_pct(),
            notional_per_alert: default_notional_per_alert(),
            account: None,
        }
    }
}

/// Multiplicative score modifiers, each clamped to [0.5, 1.5] on load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    #[serde(default = "default_modifier")]
    pub thesis: f64,
    #[serde(default = "default_modifier")]
    pub liquidity: f64,
    #[serde(default = "default_modifier")]
    pub earnings: f64,
    #[serde(default = "default_modifier")]
    pub technical: f64,
    #[serde(default = "default_modifier")]
    pub volatility: f64,

    /// Near-ATM mean spread (percent of mid) above which the liquidity
    /// modifier applies.
    #[serde(default = "default_max_spread_pct")]
    pub max_spread_pct: f64,

    /// Tickers with an active thesis document; the thesis modifier applies to
    /// these only.
    #[serde(default)]
    pub thesis_tickers: Vec<String>,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            thesis: 1.0,
            liquidity: 1.0,
            earnings: 1.0,
            technical: 1.0,
            volatility: 1.0,
            max_spread_pct: default_max_spread_pct(),
            thesis_tickers: Vec::new(),
        }
    }
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Top-level configuration snapshot for the Vegawatch engine.
///
/// Every field has a serde default so that older JSON files missing new fields
/// will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Tickers to scan each cycle.
    #[serde(default = "default_watchlist")]
    pub watchlist: Vec<String>,

    /// Select the synthetic provider instead of a live one.
    #[serde(default = "default_true")]
    pub demo_mode: bool,

    /// Seed for the synthetic provider's RNG.
    #[serde(default = "default_demo_seed")]
    pub demo_seed: u64,

    #[serde(default = "default_db_path")]
    pub db_path: String,

    #[serde(default = "default_export_dir")]
    pub export_dir: String,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub breakers: BreakersConfig,

    #[serde(default)]
    pub detectors: DetectorsConfig,

    #[serde(default)]
    pub alerts: AlertsConfig,

    #[serde(default)]
    pub risk: RiskConfig,

    #[serde(default)]
    pub scoring: ScoringConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            watchlist: default_watchlist(),
            demo_mode: true,
            demo_seed: default_demo_seed(),
            db_path: default_db_path(),
            export_dir: default_export_dir(),
            scheduler: SchedulerConfig::default(),
            cache: CacheConfig::default(),
            breakers: BreakersConfig::default(),
            detectors: DetectorsConfig::default(),
            alerts: AlertsConfig::default(),
            risk: RiskConfig::default(),
            scoring: ScoringConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Read a configuration snapshot from the JSON document at `path`.
    ///
    /// A missing file is an error — the caller decides whether defaults are
    /// an acceptable substitute. Fields absent from an older document fall
    /// back to their defaults during deserialisation.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)
            .with_context(|| format!("no readable config at {}", path.display()))?;
        let mut config: Self = serde_json::from_reader(std::io::BufReader::new(file))
            .with_context(|| format!("{} is not a valid config document", path.display()))?;
        config.normalise();

        info!(
            path = %path.display(),
            watchlist = ?config.watchlist,
            demo_mode = config.demo_mode,
            "engine config loaded"
        );

        Ok(config)
    }

    /// Write the snapshot to `path` without ever exposing a half-written
    /// document: the JSON is streamed into a scratch file in the destination
    /// directory, then renamed over the target in one step.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };

        let mut scratch = NamedTempFile::new_in(dir)
            .with_context(|| format!("could not create a scratch file in {}", dir.display()))?;
        serde_json::to_writer_pretty(&mut scratch, self)
            .context("config snapshot does not serialise")?;
        scratch
            .persist(path)
            .with_context(|| format!("could not move the scratch config into {}", path.display()))?;

        info!(path = %path.display(), "engine config written");
        Ok(())
    }

    /// Apply the `VEGAWATCH_WATCHLIST` env override (comma-separated symbols).
    pub fn apply_env_overrides(&mut self) {
        if let Ok(syms) = std::env::var("VEGAWATCH_WATCHLIST") {
            let parsed: Vec<String> = syms
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
            if !parsed.is_empty() {
                self.watchlist = parsed;
            }
        }
        if self.watchlist.is_empty() {
            self.watchlist = default_watchlist();
        }
    }

    /// Clamp scoring modifiers into their allowed band and upper-case the
    /// watchlist. Called after every load.
    pub fn normalise(&mut self) {
        for m in [
            &mut self.scoring.thesis,
            &mut self.scoring.liquidity,
            &mut self.scoring.earnings,
            &mut self.scoring.technical,
            &mut self.scoring.volatility,
        ] {
            *m = m.clamp(0.5, 1.5);
        }
        for t in &mut self.watchlist {
            *t = t.trim().to_uppercase();
        }
        self.watchlist.retain(|t| !t.is_empty());
    }

    /// Stable hash of the configuration, stored on each scan row so a scan can
    /// be tied to the exact settings it ran under.
    pub fn config_hash(&self) -> String {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let json = serde_json::to_string(self).unwrap_or_default();
        let mut hasher = DefaultHasher::new();
        json.hash(&mut hasher);
        format!("{:016x}", hasher.finish())
    }
}
