// =============================================================================
// Technical Features — moving averages, RSI, MACD, ATR, realised returns
// =============================================================================
//
// Pure, side-effect-free calculations over daily close/OHLC series. Every
// public function returns `Option<T>` or a possibly-empty series so callers
// are forced to handle insufficient-data and numerical-edge-case scenarios.
//
// RSI and ATR use Wilder's smoothing:
//   avg_t = (avg_{t-1} * (period - 1) + x_t) / period
// seeded with the SMA of the first `period` inputs.
// =============================================================================

use crate::types::PriceBar;

/// Simple moving average of the last `period` values.
pub fn sma(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    let out = values[values.len() - period..].iter().sum::<f64>() / period as f64;
    out.is_finite().then_some(out)
}

/// Full SMA series; element `i` covers `values[i .. i + period]`.
pub fn sma_series(values: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || values.len() < period {
        return Vec::new();
    }
    values
        .windows(period)
        .map(|w| w.iter().sum::<f64>() / period as f64)
        .filter(|v| v.is_finite())
        .collect()
}

/// Compute the EMA series for the given `values` slice and look-back `period`.
///
/// The first output is the SMA of the first `period` values; subsequent
/// outputs apply the standard multiplier `2 / (period + 1)`.
///
/// # Edge cases
/// - `period == 0` => empty vec
/// - `values.len() < period` => empty vec
/// - A non-finite intermediate stops the series.
pub fn ema_series(values: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || values.len() < period {
        return Vec::new();
    }

    let multiplier = 2.0 / (period + 1) as f64;

    let seed: f64 = values[..period].iter().sum::<f64>() / period as f64;
    if !seed.is_finite() {
        return Vec::new();
    }

    let mut result = Vec::with_capacity(values.len() - period + 1);
    result.push(seed);

    let mut prev = seed;
    for &v in &values[period..] {
        let ema = v * multiplier + prev * (1.0 - multiplier);
        if !ema.is_finite() {
            break;
        }
        result.push(ema);
        prev = ema;
    }

    result
}

/// Most recent EMA value.
pub fn ema(values: &[f64], period: usize) -> Option<f64> {
    ema_series(values, period).last().copied()
}

/// Compute the full RSI series for the given `closes` and `period` using
/// Wilder's smoothing.
///
/// # Edge cases
/// - `period == 0` => empty vec
/// - `closes.len() < period + 1` => empty vec (need at least `period` deltas)
/// - If average loss is zero (no down moves), RSI is clamped to 100.0.
/// - Non-finite results stop the series.
pub fn rsi_series(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() < period + 1 {
        return Vec::new();
    }

    let deltas: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();

    let (sum_gain, sum_loss) = deltas[..period]
        .iter()
        .fold((0.0_f64, 0.0_f64), |(g, l), &d| {
            if d > 0.0 {
                (g + d, l)
            } else {
                (g, l + d.abs())
            }
        });

    let period_f = period as f64;
    let mut avg_gain = sum_gain / period_f;
    let mut avg_loss = sum_loss / period_f;

    let mut result = Vec::with_capacity(deltas.len() - period + 1);
    match rsi_from_averages(avg_gain, avg_loss) {
        Some(v) => result.push(v),
        None => return Vec::new(),
    }

    for &delta in &deltas[period..] {
        let gain = if delta > 0.0 { delta } else { 0.0 };
        let loss = if delta < 0.0 { delta.abs() } else { 0.0 };

        avg_gain = (avg_gain * (period_f - 1.0) + gain) / period_f;
        avg_loss = (avg_loss * (period_f - 1.0) + loss) / period_f;

        match rsi_from_averages(avg_gain, avg_loss) {
            Some(v) => result.push(v),
            None => break,
        }
    }

    result
}

/// Most recent RSI value.
pub fn rsi(closes: &[f64], period: usize) -> Option<f64> {
    rsi_series(closes, period).last().copied()
}

fn rsi_from_averages(avg_gain: f64, avg_loss: f64) -> Option<f64> {
    let rsi = if avg_loss == 0.0 && avg_gain == 0.0 {
        50.0
    } else if avg_loss == 0.0 {
        100.0
    } else {
        let rs = avg_gain / avg_loss;
        100.0 - 100.0 / (1.0 + rs)
    };
    rsi.is_finite().then_some(rsi)
}

/// MACD(12, 26, 9): returns `(line, signal, histogram)` for the latest close.
///
/// Needs at least 26 + 9 closes for a signal line.
pub fn macd(closes: &[f64]) -> Option<(f64, f64, f64)> {
    const FAST: usize = 12;
    const SLOW: usize = 26;
    const SIGNAL: usize = 9;

    if closes.len() < SLOW + SIGNAL {
        return None;
    }

    let fast = ema_series(closes, FAST);
    let slow = ema_series(closes, SLOW);
    if slow.is_empty() {
        return None;
    }

    // Align: fast[i] covers close index i + FAST - 1; slow starts SLOW - FAST
    // elements later.
    let offset = SLOW - FAST;
    if fast.len() <= offset {
        return None;
    }
    let line_series: Vec<f64> = fast[offset..]
        .iter()
        .zip(slow.iter())
        .map(|(f, s)| f - s)
        .collect();

    let signal_series = ema_series(&line_series, SIGNAL);
    let line = *line_series.last()?;
    let signal = *signal_series.last()?;
    let hist = line - signal;
    (line.is_finite() && signal.is_finite()).then_some((line, signal, hist))
}

/// Average True Range over `period` bars using Wilder's smoothing.
///
/// True Range for each bar: `max(H − L, |H − prevClose|, |L − prevClose|)`.
///
/// Returns `None` when `period` is zero, when there are fewer than
/// `period + 1` bars, or when any intermediate value is non-finite.
pub fn atr(bars: &[PriceBar], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < period + 1 {
        return None;
    }

    let mut tr_values: Vec<f64> = Vec::with_capacity(bars.len() - 1);
    for i in 1..bars.len() {
        let high = bars[i].high;
        let low = bars[i].low;
        let prev_close = bars[i - 1].close;

        let hl = high - low;
        let hc = (high - prev_close).abs();
        let lc = (low - prev_close).abs();

        tr_values.push(hl.max(hc).max(lc));
    }

    if tr_values.len() < period {
        return None;
    }

    let seed: f64 = tr_values[..period].iter().sum::<f64>() / period as f64;
    if !seed.is_finite() {
        return None;
    }

    let period_f = period as f64;
    let mut atr = seed;
    for &tr in &tr_values[period..] {
        atr = (atr * (period_f - 1.0) + tr) / period_f;
        if !atr.is_finite() {
            return None;
        }
    }

    atr.is_finite().then_some(atr)
}

/// Realised return over the last `days` sessions, in percent.
pub fn realised_return_pct(closes: &[f64], days: usize) -> Option<f64> {
    if days == 0 || closes.len() < days + 1 {
        return None;
    }
    let latest = *closes.last()?;
    let base = closes[closes.len() - 1 - days];
    if base == 0.0 {
        return None;
    }
    let out = (latest / base - 1.0) * 100.0;
    out.is_finite().then_some(out)
}

/// Most recent SMA-50 / SMA-200 crossover.
///
/// Returns `(direction, sessions_ago)` where direction is `+1.0` for a golden
/// cross (50 rising above 200) and `-1.0` for a death cross. `None` when no
/// crossover exists in the available history.
pub fn sma_cross(closes: &[f64]) -> Option<(f64, usize)> {
    const FAST: usize = 50;
    const SLOW: usize = 200;

    if closes.len() < SLOW + 1 {
        return None;
    }

    let fast = sma_series(closes, FAST);
    let slow = sma_series(closes, SLOW);
    // Align the tails: both series end at the latest close.
    let n = slow.len().min(fast.len());
    if n < 2 {
        return None;
    }
    let fast_tail = &fast[fast.len() - n..];
    let slow_tail = &slow[slow.len() - n..];

    let spread: Vec<f64> = fast_tail
        .iter()
        .zip(slow_tail.iter())
        .map(|(f, s)| f - s)
        .collect();

    for back in 1..spread.len() {
        let idx = spread.len() - back;
        let prev = spread[idx - 1];
        let curr = spread[idx];
        if prev <= 0.0 && curr > 0.0 {
            return Some((1.0, back - 1));
        }
        if prev >= 0.0 && curr < 0.0 {
            return Some((-1.0, back - 1));
        }
    }
    None
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn bar(open: f64, high: f64, low: f64, close: f64) -> PriceBar {
        PriceBar {
            date: NaiveDate::from_ymd_opt(2025, 1, 2).unwrap(),
            open,
            high,
            low,
            close,
            volume: 1000,
        }
    }

    fn ascending(n: usize) -> Vec<f64> {
        (1..=n).map(|i| i as f64).collect()
    }

    // ---- sma -------------------------------------------------------------

    #[test]
    fn sma_insufficient_data() {
        assert!(sma(&[1.0, 2.0], 5).is_none());
        assert!(sma(&[1.0, 2.0], 0).is_none());
    }

    #[test]
    fn sma_known_value() {
        let v = sma(&[1.0, 2.0, 3.0, 4.0], 2).unwrap();
        assert!((v - 3.5).abs() < 1e-12);
    }

    #[test]
    fn sma_series_window_count() {
        let s = sma_series(&ascending(10), 3);
        assert_eq!(s.len(), 8);
        assert!((s[0] - 2.0).abs() < 1e-12);
        assert!((s[7] - 9.0).abs() < 1e-12);
    }

    // ---- ema -------------------------------------------------------------

    #[test]
    fn ema_empty_and_zero_period() {
        assert!(ema_series(&[], 5).is_empty());
        assert!(ema_series(&[1.0, 2.0, 3.0], 0).is_empty());
    }

    #[test]
    fn ema_seeded_with_sma() {
        let closes = vec![2.0, 4.0, 6.0];
        let series = ema_series(&closes, 3);
        assert_eq!(series.len(), 1);
        assert!((series[0] - 4.0).abs() < 1e-10);
    }

    #[test]
    fn ema_known_values() {
        let closes: Vec<f64> = (1..=10).map(|x| x as f64).collect();
        let series = ema_series(&closes, 5);
        assert_eq!(series.len(), 6);

        let mult = 2.0 / 6.0;
        let mut expected = 3.0;
        for (i, &c) in closes[5..].iter().enumerate() {
            expected = c * mult + expected * (1.0 - mult);
            assert!((series[i + 1] - expected).abs() < 1e-10);
        }
    }

    // ---- rsi -------------------------------------------------------------

    #[test]
    fn rsi_insufficient_data() {
        assert!(rsi_series(&ascending(14), 14).is_empty());
    }

    #[test]
    fn rsi_all_gains_is_100() {
        let series = rsi_series(&ascending(30), 14);
        assert!(!series.is_empty());
        for &v in &series {
            assert!((v - 100.0).abs() < 1e-10);
        }
    }

    #[test]
    fn rsi_all_losses_is_0() {
        let closes: Vec<f64> = (1..=30).rev().map(|x| x as f64).collect();
        for &v in &rsi_series(&closes, 14) {
            assert!(v.abs() < 1e-10);
        }
    }

    #[test]
    fn rsi_flat_is_50() {
        let closes = vec![100.0; 30];
        for &v in &rsi_series(&closes, 14) {
            assert!((v - 50.0).abs() < 1e-10);
        }
    }

    #[test]
    fn rsi_stays_in_range() {
        let closes = vec![
            44.34, 44.09, 44.15, 43.61, 44.33, 44.83, 45.10, 45.42, 45.84, 46.08, 45.89, 46.03,
            44.18, 44.22, 44.57, 43.42, 42.66, 43.13,
        ];
        for &v in &rsi_series(&closes, 14) {
            assert!((0.0..=100.0).contains(&v));
        }
    }

    // ---- macd ------------------------------------------------------------

    #[test]
    fn macd_insufficient_data() {
        assert!(macd(&ascending(30)).is_none());
    }

    #[test]
    fn macd_positive_in_uptrend() {
        let (line, signal, hist) = macd(&ascending(60)).unwrap();
        // In a steady uptrend the fast EMA sits above the slow EMA.
        assert!(line > 0.0);
        assert!(signal > 0.0);
        assert!(hist.is_finite());
    }

    #[test]
    fn macd_flat_is_zero() {
        let closes = vec![50.0; 60];
        let (line, signal, hist) = macd(&closes).unwrap();
        assert!(line.abs() < 1e-10);
        assert!(signal.abs() < 1e-10);
        assert!(hist.abs() < 1e-10);
    }

    // ---- atr -------------------------------------------------------------

    #[test]
    fn atr_insufficient_data() {
        let bars = vec![bar(100.0, 105.0, 95.0, 102.0); 10];
        assert!(atr(&bars, 14).is_none());
        assert!(atr(&bars, 0).is_none());
    }

    #[test]
    fn atr_constant_range_converges() {
        let mut bars = Vec::new();
        for i in 0..30 {
            let base = 100.0 + i as f64 * 0.1;
            bars.push(bar(base, base + 5.0, base - 5.0, base));
        }
        let v = atr(&bars, 14).unwrap();
        assert!((v - 10.0).abs() < 1.0, "expected ATR near 10.0, got {v}");
    }

    #[test]
    fn atr_true_range_uses_prev_close() {
        // Gap up: |H − prevClose| dominates H − L.
        let bars = vec![
            bar(100.0, 105.0, 95.0, 95.0),
            bar(110.0, 115.0, 108.0, 112.0),
            bar(112.0, 118.0, 110.0, 115.0),
            bar(115.0, 120.0, 113.0, 118.0),
        ];
        let v = atr(&bars, 3).unwrap();
        assert!(v > 7.0, "ATR should reflect the gap, got {v}");
    }

    #[test]
    fn atr_nan_returns_none() {
        let bars = vec![
            bar(100.0, 105.0, 95.0, 100.0),
            bar(100.0, f64::NAN, 95.0, 100.0),
            bar(100.0, 105.0, 95.0, 100.0),
            bar(100.0, 105.0, 95.0, 100.0),
        ];
        assert!(atr(&bars, 3).is_none());
    }

    // ---- realised returns ------------------------------------------------

    #[test]
    fn realised_return_known_value() {
        let closes = vec![100.0, 101.0, 102.0, 110.0];
        let v = realised_return_pct(&closes, 1).unwrap();
        assert!((v - (110.0 / 102.0 - 1.0) * 100.0).abs() < 1e-10);
    }

    #[test]
    fn realised_return_zero_base_is_none() {
        assert!(realised_return_pct(&[0.0, 1.0], 1).is_none());
        assert!(realised_return_pct(&[1.0, 2.0], 5).is_none());
    }

    // ---- sma cross -------------------------------------------------------

    #[test]
    fn sma_cross_needs_enough_history() {
        assert!(sma_cross(&ascending(150)).is_none());
    }

    #[test]
    fn sma_cross_detects_recent_golden_cross() {
        // Long flat stretch, then a sharp rally: the 50-day SMA rises above
        // the 200-day SMA near the end of the series.
        let mut closes = vec![100.0; 260];
        for (i, c) in closes.iter_mut().enumerate().skip(210) {
            *c = 100.0 + (i - 210) as f64 * 2.0;
        }
        let (dir, age) = sma_cross(&closes).unwrap();
        assert!(dir > 0.0);
        assert!(age < 60);
    }

    #[test]
    fn sma_cross_detects_death_cross() {
        let mut closes = vec![100.0; 260];
        for (i, c) in closes.iter_mut().enumerate().skip(210) {
            *c = 100.0 - (i - 210) as f64 * 2.0;
        }
        let (dir, _age) = sma_cross(&closes).unwrap();
        assert!(dir < 0.0);
    }
}
