// =============================================================================
// IV Metrics — ATM vol, term structure, 25-delta skew, percentile & rank
// =============================================================================
//
// Definitions:
//   atm_iv        — IV at the strike closest to spot (call/put averaged when
//                   both sides quote an IV).
//   term_slope    — atm_iv(back) − atm_iv(front) over the nearest two
//                   expirations with DTE ≥ 7.
//   skew_25d      — iv(25Δ put) − iv(25Δ call) at the front expiration.
//   iv_percentile — 100 · (count of samples ≤ today) / n over the trailing
//                   252 daily ATM-IV samples.
//   iv_rank       — (today − min) / (max − min) · 100, clipped to [0, 100].
// =============================================================================

use chrono::NaiveDate;

use crate::features::greeks;
use crate::types::{ChainSnapshot, ExpirationSlice, OptionContract, OptionType};

/// Minimum days-to-expiration for the front/back pair.
const MIN_DTE: i64 = 7;
/// Maximum |delta − 0.25| accepted when picking the skew contracts.
const MAX_DELTA_DIST: f64 = 0.15;
/// Minimum sample count for the rolling skew statistics.
const MIN_SKEW_SAMPLES: usize = 20;

/// IV at the strike closest to `spot` within one expiration slice.
///
/// When both the call and the put at that strike carry an IV, the two are
/// averaged; otherwise whichever side quotes one is used.
pub fn atm_iv(slice: &ExpirationSlice, spot: f64) -> Option<f64> {
    if spot <= 0.0 {
        return None;
    }
    let call = closest_by_strike(&slice.calls, spot);
    let put = closest_by_strike(&slice.puts, spot);

    let call_iv = call.and_then(|c| c.implied_volatility).filter(|v| v.is_finite() && *v > 0.0);
    let put_iv = put.and_then(|p| p.implied_volatility).filter(|v| v.is_finite() && *v > 0.0);

    match (call_iv, put_iv) {
        (Some(c), Some(p)) => Some((c + p) / 2.0),
        (Some(c), None) => Some(c),
        (None, Some(p)) => Some(p),
        (None, None) => None,
    }
}

fn closest_by_strike(contracts: &[OptionContract], spot: f64) -> Option<&OptionContract> {
    contracts
        .iter()
        .filter(|c| c.strike > 0.0)
        .min_by(|a, b| {
            let da = (a.strike - spot).abs();
            let db = (b.strike - spot).abs();
            da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
        })
}

/// The nearest two expirations with DTE ≥ 7, front first, with their DTEs.
pub fn front_back<'a>(
    chain: &'a ChainSnapshot,
    today: NaiveDate,
) -> Option<(&'a ExpirationSlice, i64, &'a ExpirationSlice, i64)> {
    let mut eligible = chain
        .by_expiration
        .iter()
        .filter_map(|s| {
            let dte = (s.expiration - today).num_days();
            (dte >= MIN_DTE).then_some((s, dte))
        })
        .collect::<Vec<_>>();
    eligible.sort_by_key(|&(_, dte)| dte);

    match eligible.as_slice() {
        [] => None,
        [(front, fd)] => Some((front, *fd, front, *fd)),
        [(front, fd), (back, bd), ..] => Some((front, *fd, back, *bd)),
    }
}

/// `atm_iv(back) − atm_iv(front)`; `None` unless two distinct eligible
/// expirations quote an ATM IV.
pub fn term_slope(chain: &ChainSnapshot, today: NaiveDate) -> Option<f64> {
    let (front, front_dte, back, back_dte) = front_back(chain, today)?;
    if front_dte == back_dte {
        return None;
    }
    let f = atm_iv(front, chain.underlying_price)?;
    let b = atm_iv(back, chain.underlying_price)?;
    let slope = b - f;
    slope.is_finite().then_some(slope)
}

/// 25-delta skew at the front expiration: `iv(25Δ put) − iv(25Δ call)`.
///
/// Contract deltas come from the provider when present and are otherwise
/// recomputed from the contract's own IV. Contracts further than 0.15 in
/// |delta| from the 25-delta target are not considered representative.
pub fn skew_25d(chain: &ChainSnapshot, today: NaiveDate, risk_free_rate: f64) -> Option<f64> {
    let (front, front_dte, _, _) = front_back(chain, today)?;
    let spot = chain.underlying_price;
    let t = front_dte as f64 / 365.0;

    let call = pick_by_delta(&front.calls, OptionType::Call, 0.25, spot, t, risk_free_rate)?;
    let put = pick_by_delta(&front.puts, OptionType::Put, -0.25, spot, t, risk_free_rate)?;

    let skew = put.implied_volatility? - call.implied_volatility?;
    skew.is_finite().then_some(skew)
}

fn pick_by_delta<'a>(
    contracts: &'a [OptionContract],
    opt: OptionType,
    target: f64,
    spot: f64,
    t: f64,
    r: f64,
) -> Option<&'a OptionContract> {
    let mut best: Option<(&OptionContract, f64)> = None;
    for c in contracts {
        let iv = match c.implied_volatility {
            Some(v) if v.is_finite() && v > 0.0 => v,
            _ => continue,
        };
        let delta = match c.delta {
            Some(d) if d.is_finite() => d,
            _ => match greeks::bs_greeks(opt, spot, c.strike, t, r, iv) {
                Some(g) => g.delta,
                None => continue,
            },
        };
        let dist = (delta - target).abs();
        if best.map(|(_, d)| dist < d).unwrap_or(true) {
            best = Some((c, dist));
        }
    }
    best.and_then(|(c, dist)| (dist <= MAX_DELTA_DIST).then_some(c))
}

/// Percentile of `today` within `samples`: 100 · count(≤ today) / n.
pub fn iv_percentile(samples: &[f64], today: f64) -> Option<f64> {
    if samples.len() < 2 || !today.is_finite() {
        return None;
    }
    let n = samples.iter().filter(|v| v.is_finite()).count();
    if n < 2 {
        return None;
    }
    let below = samples
        .iter()
        .filter(|v| v.is_finite() && **v <= today)
        .count();
    Some(below as f64 / n as f64 * 100.0)
}

/// Rank of `today` between the window's min and max, clipped to [0, 100].
pub fn iv_rank(samples: &[f64], today: f64) -> Option<f64> {
    if samples.len() < 2 || !today.is_finite() {
        return None;
    }
    let finite: Vec<f64> = samples.iter().copied().filter(|v| v.is_finite()).collect();
    if finite.len() < 2 {
        return None;
    }
    let min = finite.iter().copied().fold(f64::MAX, f64::min);
    let max = finite.iter().copied().fold(f64::MIN, f64::max);
    if max <= min {
        return None;
    }
    Some(((today - min) / (max - min) * 100.0).clamp(0.0, 100.0))
}

/// Mean and sample stdev of |skew| over the most recent 60 samples.
///
/// Returns `None` with fewer than 20 usable samples.
pub fn skew_stats(skews: &[f64]) -> Option<(f64, f64)> {
    let tail_start = skews.len().saturating_sub(60);
    let abs: Vec<f64> = skews[tail_start..]
        .iter()
        .filter(|v| v.is_finite())
        .map(|v| v.abs())
        .collect();
    if abs.len() < MIN_SKEW_SAMPLES {
        return None;
    }
    let mean = abs.iter().sum::<f64>() / abs.len() as f64;
    let sd = crate::features::volatility::stdev(&abs)?;
    (mean.is_finite() && sd.is_finite()).then_some((mean, sd))
}
