// =============================================================================
// Feature Engine — deterministic FeatureSet from a chain snapshot + history
// =============================================================================
//
// `compute` is a pure function: no I/O, no clock reads beyond the supplied
// `now`, no mutation of its inputs. Every output field is either a finite
// number or absent; an undefined intermediate (divide-by-zero, empty window,
// non-finite input) yields an absent feature, never NaN or ±∞, and never
// aborts the computation.
// =============================================================================

pub mod greeks;
pub mod iv_metrics;
pub mod technicals;
pub mod volatility;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ChainSnapshot, DirectionalBias, IvSample, PriceBar, Ticker};

/// Risk-free rate used when recomputing Greeks from contract IVs.
pub const RISK_FREE_RATE: f64 = 0.04;

/// Strikes within this fraction of spot count as near-the-money for the
/// liquidity section.
const NEAR_MONEY_BAND: f64 = 0.05;

/// Inputs to one feature computation. All data is captured within the same
/// scan cycle; nothing here is fetched lazily.
pub struct FeatureInputs<'a> {
    pub chain: &'a ChainSnapshot,
    pub history: &'a [PriceBar],
    /// Trailing daily ATM-IV (and skew) samples, oldest first, at most 252.
    pub iv_window: &'a [IvSample],
    /// Calendar days until the next earnings report, when known.
    pub days_to_earnings: Option<i64>,
    pub now: DateTime<Utc>,
}

/// Dense per-ticker feature record. Absent values are omitted from the
/// serialised form rather than written as null.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSet {
    pub ticker: Ticker,
    pub computed_at: DateTime<Utc>,

    // ── Underlying ──────────────────────────────────────────────────────
    #[serde(skip_serializing_if = "Option::is_none")]
    pub underlying_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contract_count: Option<f64>,

    // ── Technicals ──────────────────────────────────────────────────────
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sma_20: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sma_50: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sma_200: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ema_12: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ema_26: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price_to_sma20_pct: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price_to_sma50_pct: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price_to_sma200_pct: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rsi_14: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rsi_14_prev: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub macd_line: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub macd_signal: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub macd_hist: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub atr_14: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub atr_14_pct: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ret_1d_pct: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ret_5d_pct: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ret_20d_pct: Option<f64>,
    /// +1 for a golden cross, −1 for a death cross.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sma_cross_dir: Option<f64>,
    /// Sessions since the most recent SMA-50/200 crossover.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sma_cross_age: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avg_volume_20d: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_ratio: Option<f64>,

    // ── Volatility ──────────────────────────────────────────────────────
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hv_10: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hv_20: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hv_60: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parkinson_20: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub garman_klass_20: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub daily_range_pct: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weekly_range_pct: Option<f64>,

    // ── IV metrics ──────────────────────────────────────────────────────
    #[serde(skip_serializing_if = "Option::is_none")]
    pub atm_iv_front: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub atm_iv_back: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dte_front: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dte_back: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub term_slope: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skew_25d: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skew_mean_60d: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skew_std_60d: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iv_percentile: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iv_rank: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iv_hv_spread: Option<f64>,

    // ── Liquidity ───────────────────────────────────────────────────────
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mean_spread_pct: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_oi_calls: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_oi_puts: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub put_call_oi_ratio: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_volume_calls: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_volume_puts: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub put_call_volume_ratio: Option<f64>,

    // ── Event ───────────────────────────────────────────────────────────
    #[serde(skip_serializing_if = "Option::is_none")]
    pub days_to_earnings: Option<f64>,
}

impl FeatureSet {
    /// An all-absent record for `ticker` stamped at `now`.
    pub fn empty(ticker: Ticker, now: DateTime<Utc>) -> Self {
        Self {
            ticker,
            computed_at: now,
            underlying_price: None,
            contract_count: None,
            sma_20: None,
            sma_50: None,
            sma_200: None,
            ema_12: None,
            ema_26: None,
            price_to_sma20_pct: None,
            price_to_sma50_pct: None,
            price_to_sma200_pct: None,
            rsi_14: None,
            rsi_14_prev: None,
            macd_line: None,
            macd_signal: None,
            macd_hist: None,
            atr_14: None,
            atr_14_pct: None,
            ret_1d_pct: None,
            ret_5d_pct: None,
            ret_20d_pct: None,
            sma_cross_dir: None,
            sma_cross_age: None,
            avg_volume_20d: None,
            volume_ratio: None,
            hv_10: None,
            hv_20: None,
            hv_60: None,
            parkinson_20: None,
            garman_klass_20: None,
            daily_range_pct: None,
            weekly_range_pct: None,
            atm_iv_front: None,
            atm_iv_back: None,
            dte_front: None,
            dte_back: None,
            term_slope: None,
            skew_25d: None,
            skew_mean_60d: None,
            skew_std_60d: None,
            iv_percentile: None,
            iv_rank: None,
            iv_hv_spread: None,
            mean_spread_pct: None,
            total_oi_calls: None,
            total_oi_puts: None,
            put_call_oi_ratio: None,
            total_volume_calls: None,
            total_volume_puts: None,
            put_call_volume_ratio: None,
            days_to_earnings: None,
        }
    }

    /// Directional read from the technical section: price above both key SMAs
    /// (or a fresh golden cross) is bullish, below both (or a death cross) is
    /// bearish, anything mixed is neutral.
    pub fn directional_bias(&self) -> DirectionalBias {
        if let (Some(dir), Some(age)) = (self.sma_cross_dir, self.sma_cross_age) {
            if age <= 3.0 {
                return if dir > 0.0 {
                    DirectionalBias::Bullish
                } else {
                    DirectionalBias::Bearish
                };
            }
        }
        match (self.price_to_sma50_pct, self.price_to_sma200_pct) {
            (Some(a), Some(b)) if a > 0.0 && b > 0.0 => DirectionalBias::Bullish,
            (Some(a), Some(b)) if a < 0.0 && b < 0.0 => DirectionalBias::Bearish,
            _ => DirectionalBias::Neutral,
        }
    }

    /// True when the SMA trend and `bias` point the same way.
    pub fn trend_aligned_with(&self, bias: DirectionalBias) -> Option<bool> {
        let trend = self.directional_bias();
        if trend == DirectionalBias::Neutral || bias == DirectionalBias::Neutral {
            return None;
        }
        Some(trend == bias)
    }
}

/// Keep only finite values.
fn finite(v: Option<f64>) -> Option<f64> {
    v.filter(|x| x.is_finite())
}

/// Compute the full feature set for one ticker.
pub fn compute(ticker: &Ticker, inputs: &FeatureInputs<'_>) -> FeatureSet {
    let chain = inputs.chain;
    let history = inputs.history;
    let today = inputs.now.date_naive();
    let spot = chain.underlying_price;

    let closes: Vec<f64> = history.iter().map(|b| b.close).collect();
    let volumes: Vec<f64> = history.iter().map(|b| b.volume as f64).collect();

    let mut out = FeatureSet::empty(ticker.clone(), inputs.now);

    out.underlying_price = finite(Some(spot)).filter(|v| *v > 0.0);
    out.contract_count = Some(
        chain
            .by_expiration
            .iter()
            .map(|s| s.calls.len() + s.puts.len())
            .sum::<usize>() as f64,
    );

    // ── Technicals ──────────────────────────────────────────────────────
    out.sma_20 = technicals::sma(&closes, 20);
    out.sma_50 = technicals::sma(&closes, 50);
    out.sma_200 = technicals::sma(&closes, 200);
    out.ema_12 = technicals::ema(&closes, 12);
    out.ema_26 = technicals::ema(&closes, 26);

    let dist_pct = |sma: Option<f64>| -> Option<f64> {
        let sma = sma?;
        if sma == 0.0 || spot <= 0.0 {
            return None;
        }
        finite(Some((spot / sma - 1.0) * 100.0))
    };
    out.price_to_sma20_pct = dist_pct(out.sma_20);
    out.price_to_sma50_pct = dist_pct(out.sma_50);
    out.price_to_sma200_pct = dist_pct(out.sma_200);

    let rsi_series = technicals::rsi_series(&closes, 14);
    out.rsi_14 = rsi_series.last().copied();
    out.rsi_14_prev = rsi_series
        .len()
        .checked_sub(2)
        .and_then(|i| rsi_series.get(i))
        .copied();

    if let Some((line, signal, hist)) = technicals::macd(&closes) {
        out.macd_line = finite(Some(line));
        out.macd_signal = finite(Some(signal));
        out.macd_hist = finite(Some(hist));
    }

    out.atr_14 = technicals::atr(history, 14);
    out.atr_14_pct = out.atr_14.and_then(|atr| {
        if spot <= 0.0 {
            return None;
        }
        finite(Some(atr / spot * 100.0))
    });

    out.ret_1d_pct = technicals::realised_return_pct(&closes, 1);
    out.ret_5d_pct = technicals::realised_return_pct(&closes, 5);
    out.ret_20d_pct = technicals::realised_return_pct(&closes, 20);

    if let Some((dir, age)) = technicals::sma_cross(&closes) {
        out.sma_cross_dir = Some(dir);
        out.sma_cross_age = Some(age as f64);
    }

    out.avg_volume_20d = technicals::sma(&volumes, 20);
    out.volume_ratio = match (volumes.last(), out.avg_volume_20d) {
        (Some(&last), Some(avg)) if avg > 0.0 => finite(Some(last / avg)),
        _ => None,
    };

    // ── Volatility ──────────────────────────────────────────────────────
    out.hv_10 = volatility::historical_vol(&closes, 10);
    out.hv_20 = volatility::historical_vol(&closes, 20);
    out.hv_60 = volatility::historical_vol(&closes, 60);
    out.parkinson_20 = volatility::parkinson(history, 20);
    out.garman_klass_20 = volatility::garman_klass(history, 20);
    out.daily_range_pct = volatility::daily_range_pct(history);
    out.weekly_range_pct = volatility::weekly_range_pct(history);

    // ── IV metrics ──────────────────────────────────────────────────────
    if let Some((front, front_dte, back, back_dte)) = iv_metrics::front_back(chain, today) {
        out.atm_iv_front = iv_metrics::atm_iv(front, spot);
        out.dte_front = Some(front_dte as f64);
        if back_dte != front_dte {
            out.atm_iv_back = iv_metrics::atm_iv(back, spot);
            out.dte_back = Some(back_dte as f64);
        }
    }
    out.term_slope = iv_metrics::term_slope(chain, today);
    out.skew_25d = iv_metrics::skew_25d(chain, today, RISK_FREE_RATE);

    let iv_samples: Vec<f64> = inputs.iv_window.iter().map(|s| s.atm_iv).collect();
    if let Some(today_iv) = out.atm_iv_front {
        out.iv_percentile = iv_metrics::iv_percentile(&iv_samples, today_iv);
        out.iv_rank = iv_metrics::iv_rank(&iv_samples, today_iv);
    }

    let skew_samples: Vec<f64> = inputs
        .iv_window
        .iter()
        .filter_map(|s| s.skew_25d)
        .collect();
    if let Some((mean, sd)) = iv_metrics::skew_stats(&skew_samples) {
        out.skew_mean_60d = Some(mean);
        out.skew_std_60d = Some(sd);
    }

    out.iv_hv_spread = match (out.atm_iv_front, out.hv_20) {
        (Some(iv), Some(hv)) => finite(Some(iv - hv)),
        _ => None,
    };

    // ── Liquidity ───────────────────────────────────────────────────────
    compute_liquidity(&mut out, chain, spot);

    // ── Event ───────────────────────────────────────────────────────────
    out.days_to_earnings = inputs
        .days_to_earnings
        .filter(|d| *d >= 0)
        .map(|d| d as f64);

    out
}

fn compute_liquidity(out: &mut FeatureSet, chain: &ChainSnapshot, spot: f64) {
    let mut oi_calls = 0u64;
    let mut oi_puts = 0u64;
    let mut vol_calls = 0u64;
    let mut vol_puts = 0u64;
    let mut spreads: Vec<f64> = Vec::new();

    for slice in &chain.by_expiration {
        for c in &slice.calls {
            oi_calls += c.open_interest;
            vol_calls += c.volume;
        }
        for p in &slice.puts {
            oi_puts += p.open_interest;
            vol_puts += p.volume;
        }
        for c in slice.calls.iter().chain(slice.puts.iter()) {
            if spot > 0.0 && (c.strike - spot).abs() / spot <= NEAR_MONEY_BAND {
                if let (Some(bid), Some(ask), Some(mid)) = (c.bid, c.ask, c.mid()) {
                    if mid > 0.0 && ask >= bid {
                        let s = (ask - bid) / mid * 100.0;
                        if s.is_finite() {
                            spreads.push(s);
                        }
                    }
                }
            }
        }
    }

    out.total_oi_calls = Some(oi_calls as f64);
    out.total_oi_puts = Some(oi_puts as f64);
    out.put_call_oi_ratio = (oi_calls > 0).then(|| oi_puts as f64 / oi_calls as f64);
    out.total_volume_calls = Some(vol_calls as f64);
    out.total_volume_puts = Some(vol_puts as f64);
    out.put_call_volume_ratio = (vol_calls > 0).then(|| vol_puts as f64 / vol_calls as f64);

    if !spreads.is_empty() {
        let mean = spreads.iter().sum::<f64>() / spreads.len() as f64;
        out.mean_spread_pct = finite(Some(mean));
    }
}
