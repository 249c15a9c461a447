// =============================================================================
// Volatility Features — close-to-close, Parkinson, Garman-Klass estimators
// =============================================================================
//
// All estimators are annualised with √252 and expressed as decimal vol
// (0.25 = 25%).
//
//   HV(w)          = √252 · stdev(log returns over the last w sessions)
//   Parkinson(w)   = √(252 / (4·ln2) · mean(ln(H/L)²))
//   Garman-Klass(w)= √(252 · mean(½·ln(H/L)² − (2·ln2 − 1)·ln(C/O)²))
// =============================================================================

use crate::types::PriceBar;

/// Natural-log returns of consecutive closes. Pairs with a non-positive price
/// are skipped.
pub fn log_returns(closes: &[f64]) -> Vec<f64> {
    closes
        .windows(2)
        .filter(|w| w[0] > 0.0 && w[1] > 0.0)
        .map(|w| (w[1] / w[0]).ln())
        .filter(|r| r.is_finite())
        .collect()
}

/// Sample standard deviation (n − 1 denominator).
pub fn stdev(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    let sd = var.sqrt();
    sd.is_finite().then_some(sd)
}

/// Annualised close-to-close historical volatility over the last `window`
/// sessions. Needs `window + 1` closes.
pub fn historical_vol(closes: &[f64], window: usize) -> Option<f64> {
    if window < 2 || closes.len() < window + 1 {
        return None;
    }
    let returns = log_returns(&closes[closes.len() - window - 1..]);
    if returns.len() < window {
        return None;
    }
    let sd = stdev(&returns)?;
    let hv = sd * (252.0_f64).sqrt();
    hv.is_finite().then_some(hv)
}

/// Annualised Parkinson estimator over the last `window` bars.
pub fn parkinson(bars: &[PriceBar], window: usize) -> Option<f64> {
    if window < 2 || bars.len() < window {
        return None;
    }
    let tail = &bars[bars.len() - window..];
    let mut sum = 0.0;
    let mut n = 0usize;
    for b in tail {
        if b.high > 0.0 && b.low > 0.0 && b.high >= b.low {
            let r = (b.high / b.low).ln();
            if r.is_finite() {
                sum += r * r;
                n += 1;
            }
        }
    }
    if n < window {
        return None;
    }
    let v = (252.0 / (4.0 * std::f64::consts::LN_2) * sum / n as f64).sqrt();
    v.is_finite().then_some(v)
}

/// Annualised Garman-Klass estimator over the last `window` bars.
pub fn garman_klass(bars: &[PriceBar], window: usize) -> Option<f64> {
    if window < 2 || bars.len() < window {
        return None;
    }
    let tail = &bars[bars.len() - window..];
    let k = 2.0 * std::f64::consts::LN_2 - 1.0;
    let mut sum = 0.0;
    let mut n = 0usize;
    for b in tail {
        if b.high > 0.0 && b.low > 0.0 && b.open > 0.0 && b.close > 0.0 && b.high >= b.low {
            let hl = (b.high / b.low).ln();
            let co = (b.close / b.open).ln();
            let term = 0.5 * hl * hl - k * co * co;
            if term.is_finite() {
                sum += term;
                n += 1;
            }
        }
    }
    if n < window {
        return None;
    }
    let mean = sum / n as f64;
    // Negative means can occur on pathological bars; there is no real vol to
    // report in that case.
    if mean <= 0.0 {
        return None;
    }
    let v = (252.0 * mean).sqrt();
    v.is_finite().then_some(v)
}

/// High-low range of the most recent bar, as a percent of its close.
pub fn daily_range_pct(bars: &[PriceBar]) -> Option<f64> {
    let b = bars.last()?;
    if b.close <= 0.0 || b.high < b.low {
        return None;
    }
    let out = (b.high - b.low) / b.close * 100.0;
    out.is_finite().then_some(out)
}

/// Range of the last five sessions (max high − min low) as a percent of the
/// latest close.
pub fn weekly_range_pct(bars: &[PriceBar]) -> Option<f64> {
    if bars.len() < 5 {
        return None;
    }
    let tail = &bars[bars.len() - 5..];
    let close = tail.last()?.close;
    if close <= 0.0 {
        return None;
    }
    let high = tail.iter().map(|b| b.high).fold(f64::MIN, f64::max);
    let low = tail.iter().map(|b| b.low).fold(f64::MAX, f64::min);
    if high < low {
        return None;
    }
    let out = (high - low) / close * 100.0;
    out.is_finite().then_some(out)
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

    #[test]
    fn log_returns_skips_non_positive() {
        let r = log_returns(&[100.0, 0.0, 105.0, 110.0]);
        // Only the 105 -> 110 pair survives.
        assert_eq!(r.len(), 1);
        assert!((r[0] - (110.0_f64 / 105.0).ln()).abs() < 1e-12);
    }

    #[test]
    fn stdev_needs_two_values() {
        assert!(stdev(&[1.0]).is_none());
        assert!((stdev(&[1.0, 3.0]).unwrap() - std::f64::consts::SQRT_2).abs() < 1e-12);
    }

    #[test]
    fn hv_constant_prices_is_zero() {
        let closes = vec![100.0; 30];
        let hv = historical_vol(&closes, 20).unwrap();
        assert!(hv.abs() < 1e-12);
    }

    #[test]
    fn hv_insufficient_data() {
        assert!(historical_vol(&[100.0; 20], 20).is_none());
    }

    #[test]
    fn hv_alternating_series_is_positive() {
        let closes: Vec<f64> = (0..40)
            .map(|i| if i % 2 == 0 { 100.0 } else { 102.0 })
            .collect();
        let hv = historical_vol(&closes, 20).unwrap();
        assert!(hv > 0.1);
    }

    #[test]
    fn parkinson_flat_bars_is_zero() {
        let bars = vec![bar(100.0, 100.0, 100.0, 100.0); 25];
        let v = parkinson(&bars, 20).unwrap();
        assert!(v.abs() < 1e-12);
    }

    #[test]
    fn parkinson_wider_ranges_mean_higher_vol() {
        let narrow = vec![bar(100.0, 101.0, 99.0, 100.0); 25];
        let wide = vec![bar(100.0, 105.0, 95.0, 100.0); 25];
        let vn = parkinson(&narrow, 20).unwrap();
        let vw = parkinson(&wide, 20).unwrap();
        assert!(vw > vn);
    }

    #[test]
    fn garman_klass_positive_for_ranging_bars() {
        let bars = vec![bar(100.0, 103.0, 97.0, 100.5); 25];
        let v = garman_klass(&bars, 20).unwrap();
        assert!(v > 0.0);
        assert!(v.is_finite());
    }

    #[test]
    fn garman_klass_insufficient_data() {
        let bars = vec![bar(100.0, 103.0, 97.0, 100.5); 10];
        assert!(garman_klass(&bars, 20).is_none());
    }

    #[test]
    fn range_pcts() {
        let mut bars = vec![bar(100.0, 102.0, 98.0, 100.0); 6];
        bars[5] = bar(100.0, 110.0, 95.0, 100.0);
        let d = daily_range_pct(&bars).unwrap();
        assert!((d - 15.0).abs() < 1e-12);
        let w = weekly_range_pct(&bars).unwrap();
        assert!((w - 15.0).abs() < 1e-12);
    }

    #[test]
    fn weekly_range_needs_five_bars() {
        let bars = vec![bar(100.0, 102.0, 98.0, 100.0); 4];
        assert!(weekly_range_pct(&bars).is_none());
    }
}
