// =============================================================================
// Black-Scholes Greeks & Implied-Volatility Solver
// =============================================================================
//
// Standard European model:
//   d1 = (ln(S/K) + (r + σ²/2)·T) / (σ·√T)
//   d2 = d1 − σ·√T
//
// Conventions for reported Greeks:
//   delta  — raw (calls in [0, 1], puts in [−1, 0])
//   gamma  — raw, per unit of underlying
//   vega   — per vol point (1% change in σ)
//   theta  — per calendar day
//   rho    — per rate point (1% change in r)
//
// The IV solver runs Brent's method on `price(σ) − market_price` over
// σ ∈ [1e-4, 5.0] with tolerance 1e-6 and at most 64 iterations; failures
// return `None` rather than a sentinel value.
// =============================================================================

use crate::types::OptionType;

/// Lower bound of the IV search bracket.
const IV_LO: f64 = 1e-4;
/// Upper bound of the IV search bracket.
const IV_HI: f64 = 5.0;
/// Convergence tolerance of the IV solver.
const IV_TOL: f64 = 1e-6;
/// Iteration cap of the IV solver.
const IV_MAX_ITER: usize = 64;

/// Full sensitivity set for one contract.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Greeks {
    pub delta: f64,
    pub gamma: f64,
    pub vega: f64,
    pub theta: f64,
    pub rho: f64,
}

/// Standard normal probability density.
pub fn norm_pdf(x: f64) -> f64 {
    (-0.5 * x * x).exp() / (2.0 * std::f64::consts::PI).sqrt()
}

/// Standard normal cumulative distribution (Abramowitz-Stegun 7.1.26,
/// |error| < 7.5e-8).
pub fn norm_cdf(x: f64) -> f64 {
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs() / std::f64::consts::SQRT_2;

    const A1: f64 = 0.254829592;
    const A2: f64 = -0.284496736;
    const A3: f64 = 1.421413741;
    const A4: f64 = -1.453152027;
    const A5: f64 = 1.061405429;
    const P: f64 = 0.3275911;

    let t = 1.0 / (1.0 + P * x);
    let y = 1.0 - (((((A5 * t + A4) * t) + A3) * t + A2) * t + A1) * t * (-x * x).exp();

    0.5 * (1.0 + sign * y)
}

fn d1_d2(s: f64, k: f64, t: f64, r: f64, sigma: f64) -> Option<(f64, f64)> {
    if s <= 0.0 || k <= 0.0 || t <= 0.0 || sigma <= 0.0 {
        return None;
    }
    let sqrt_t = t.sqrt();
    let d1 = ((s / k).ln() + (r + 0.5 * sigma * sigma) * t) / (sigma * sqrt_t);
    let d2 = d1 - sigma * sqrt_t;
    (d1.is_finite() && d2.is_finite()).then_some((d1, d2))
}

/// European Black-Scholes price. `t` is time to expiry in years.
pub fn bs_price(opt: OptionType, s: f64, k: f64, t: f64, r: f64, sigma: f64) -> Option<f64> {
    let (d1, d2) = d1_d2(s, k, t, r, sigma)?;
    let df = (-r * t).exp();
    let price = match opt {
        OptionType::Call => s * norm_cdf(d1) - k * df * norm_cdf(d2),
        OptionType::Put => k * df * norm_cdf(-d2) - s * norm_cdf(-d1),
    };
    (price.is_finite() && price >= 0.0).then_some(price)
}

/// Full Greek set for a European contract.
pub fn bs_greeks(opt: OptionType, s: f64, k: f64, t: f64, r: f64, sigma: f64) -> Option<Greeks> {
    let (d1, d2) = d1_d2(s, k, t, r, sigma)?;
    let sqrt_t = t.sqrt();
    let df = (-r * t).exp();
    let pdf_d1 = norm_pdf(d1);

    let delta = match opt {
        OptionType::Call => norm_cdf(d1),
        OptionType::Put => norm_cdf(d1) - 1.0,
    };
    let gamma = pdf_d1 / (s * sigma * sqrt_t);
    let vega = s * pdf_d1 * sqrt_t / 100.0;

    let theta_annual = match opt {
        OptionType::Call => {
            -(s * pdf_d1 * sigma) / (2.0 * sqrt_t) - r * k * df * norm_cdf(d2)
        }
        OptionType::Put => {
            -(s * pdf_d1 * sigma) / (2.0 * sqrt_t) + r * k * df * norm_cdf(-d2)
        }
    };
    let theta = theta_annual / 365.0;

    let rho = match opt {
        OptionType::Call => k * t * df * norm_cdf(d2) / 100.0,
        OptionType::Put => -k * t * df * norm_cdf(-d2) / 100.0,
    };

    let g = Greeks { delta, gamma, vega, theta, rho };
    [g.delta, g.gamma, g.vega, g.theta, g.rho]
        .iter()
        .all(|v| v.is_finite())
        .then_some(g)
}

/// Implied volatility via Brent's method.
///
/// Returns `None` when the market price lies outside the prices attainable in
/// the σ ∈ [1e-4, 5.0] bracket or when the solver fails to converge.
pub fn implied_vol(
    opt: OptionType,
    market_price: f64,
    s: f64,
    k: f64,
    t: f64,
    r: f64,
) -> Option<f64> {
    if market_price <= 0.0 || s <= 0.0 || k <= 0.0 || t <= 0.0 {
        return None;
    }
    let objective = |sigma: f64| bs_price(opt, s, k, t, r, sigma).map(|p| p - market_price);
    brent(objective, IV_LO, IV_HI, IV_TOL, IV_MAX_ITER)
}

/// Brent root finder over [a, b]. Returns `None` when the root is not
/// bracketed, the objective is undefined at an endpoint, or the iteration cap
/// is reached without convergence.
fn brent<F>(f: F, a: f64, b: f64, tol: f64, max_iter: usize) -> Option<f64>
where
    F: Fn(f64) -> Option<f64>,
{
    let mut a = a;
    let mut b = b;
    let mut fa = f(a)?;
    let mut fb = f(b)?;

    if fa * fb > 0.0 {
        return None;
    }
    if fa.abs() < fb.abs() {
        std::mem::swap(&mut a, &mut b);
        std::mem::swap(&mut fa, &mut fb);
    }

    let mut c = a;
    let mut fc = fa;
    let mut d = b - a;
    let mut mflag = true;

    for _ in 0..max_iter {
        if fb.abs() < tol || (b - a).abs() < tol {
            return Some(b);
        }

        let s = if fa != fc && fb != fc {
            // Inverse quadratic interpolation.
            a * fb * fc / ((fa - fb) * (fa - fc))
                + b * fa * fc / ((fb - fa) * (fb - fc))
                + c * fa * fb / ((fc - fa) * (fc - fb))
        } else {
            // Secant step.
            b - fb * (b - a) / (fb - fa)
        };

        let cond_range = {
            let lo = (3.0 * a + b) / 4.0;
            let (lo, hi) = if lo < b { (lo, b) } else { (b, lo) };
            s < lo || s > hi
        };
        let cond_mflag = mflag && (s - b).abs() >= (b - c).abs() / 2.0;
        let cond_prev = !mflag && (s - b).abs() >= (c - d).abs() / 2.0;
        let cond_tol_m = mflag && (b - c).abs() < tol;
        let cond_tol_p = !mflag && (c - d).abs() < tol;

        let s = if cond_range || cond_mflag || cond_prev || cond_tol_m || cond_tol_p {
            mflag = true;
            (a + b) / 2.0
        } else {
            mflag = false;
            s
        };

        let fs = f(s)?;
        d = c;
        c = b;
        fc = fb;

        if fa * fs < 0.0 {
            b = s;
            fb = fs;
        } else {
            a = s;
            fa = fs;
        }

        if fa.abs() < fb.abs() {
            std::mem::swap(&mut a, &mut b);
            std::mem::swap(&mut fa, &mut fb);
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

    #[test]
    fn norm_cdf_known_points() {
        assert!((norm_cdf(0.0) - 0.5).abs() < 1e-7);
        assert!((norm_cdf(1.96) - 0.975).abs() < 1e-3);
        assert!((norm_cdf(-1.96) - 0.025).abs() < 1e-3);
        assert!(norm_cdf(8.0) > 0.999999);
    }

    #[test]
    fn bs_price_known_value() {
        // Classic textbook case: S=100, K=100, T=1y, r=5%, σ=20%.
        // Call ≈ 10.4506, Put ≈ 5.5735.
        let call = bs_price(OptionType::Call, 100.0, 100.0, 1.0, 0.05, 0.2).unwrap();
        let put = bs_price(OptionType::Put, 100.0, 100.0, 1.0, 0.05, 0.2).unwrap();
        assert!((call - 10.4506).abs() < 1e-3, "call {call}");
        assert!((put - 5.5735).abs() < 1e-3, "put {put}");
    }

    #[test]
    fn put_call_parity_holds() {
        let (s, k, t, r, sigma) = (105.0, 95.0, 0.5, 0.03, 0.35);
        let call = bs_price(OptionType::Call, s, k, t, r, sigma).unwrap();
        let put = bs_price(OptionType::Put, s, k, t, r, sigma).unwrap();
        let parity = call - put - (s - k * (-r * t).exp());
        assert!(parity.abs() < 1e-9, "parity residual {parity}");
    }

    #[test]
    fn bs_price_rejects_degenerate_inputs() {
        assert!(bs_price(OptionType::Call, 0.0, 100.0, 1.0, 0.05, 0.2).is_none());
        assert!(bs_price(OptionType::Call, 100.0, 100.0, 0.0, 0.05, 0.2).is_none());
        assert!(bs_price(OptionType::Call, 100.0, 100.0, 1.0, 0.05, 0.0).is_none());
    }

    #[test]
    fn delta_ranges_by_type() {
        let g_call = bs_greeks(OptionType::Call, 100.0, 100.0, 0.25, 0.04, 0.3).unwrap();
        let g_put = bs_greeks(OptionType::Put, 100.0, 100.0, 0.25, 0.04, 0.3).unwrap();
        assert!((0.0..=1.0).contains(&g_call.delta));
        assert!((-1.0..=0.0).contains(&g_put.delta));
        // Same strike, same vol: gammas and vegas match.
        assert!((g_call.gamma - g_put.gamma).abs() < 1e-12);
        assert!((g_call.vega - g_put.vega).abs() < 1e-12);
    }

    #[test]
    fn deep_itm_call_delta_near_one() {
        let g = bs_greeks(OptionType::Call, 200.0, 100.0, 0.25, 0.04, 0.3).unwrap();
        assert!(g.delta > 0.97);
    }

    #[test]
    fn theta_is_negative_for_long_options() {
        let g = bs_greeks(OptionType::Call, 100.0, 100.0, 0.25, 0.04, 0.3).unwrap();
        assert!(g.theta < 0.0);
    }

    #[test]
    fn implied_vol_round_trips_price() {
        let (s, k, t, r) = (100.0, 110.0, 0.4, 0.04);
        for &sigma in &[0.12, 0.25, 0.6, 1.2] {
            let price = bs_price(OptionType::Call, s, k, t, r, sigma).unwrap();
            let solved = implied_vol(OptionType::Call, price, s, k, t, r).unwrap();
            assert!(
                (solved - sigma).abs() < 1e-4,
                "σ={sigma}: solved {solved}"
            );
        }
    }

    #[test]
    fn implied_vol_put_round_trip() {
        let (s, k, t, r) = (50.0, 45.0, 0.1, 0.02);
        let price = bs_price(OptionType::Put, s, k, t, r, 0.45).unwrap();
        let solved = implied_vol(OptionType::Put, price, s, k, t, r).unwrap();
        assert!((solved - 0.45).abs() < 1e-4);
    }

    #[test]
    fn implied_vol_unattainable_price_is_none() {
        // A call can never be worth more than the spot.
        assert!(implied_vol(OptionType::Call, 150.0, 100.0, 100.0, 0.5, 0.04).is_none());
        assert!(implied_vol(OptionType::Call, -1.0, 100.0, 100.0, 0.5, 0.04).is_none());
        assert!(implied_vol(OptionType::Call, 5.0, 100.0, 100.0, 0.0, 0.04).is_none());
    }
}
