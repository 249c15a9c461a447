// =============================================================================
// Demo Provider — deterministic synthetic market data from a seeded RNG
// =============================================================================
//
// Selected when `demo_mode = true`. Every answer is a pure function of
// (seed, ticker, calendar date): history bars replay identically across
// calls, and a chain requested twice in the same day is byte-identical.
// ChaCha8 keeps the streams reproducible across platforms.
//
// The synthetic IV level follows a slow seasonal cycle so percentile and
// rank drift through their range as history accumulates.
// =============================================================================

use async_trait::async_trait;
use chrono::{Datelike, Duration, NaiveDate, Utc, Weekday};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::calendar;
use crate::features::greeks;
use crate::market_data::provider::{MarketDataProvider, ProviderError};
use crate::types::{
    ChainSnapshot, ExpirationSlice, OptionContract, OptionType, PriceBar, Ticker, TickerInfo,
};

/// First synthetic trading day; all RNG streams are anchored here.
fn anchor() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 2).expect("valid anchor date")
}

const SECTORS: &[&str] = &[
    "Technology",
    "Healthcare",
    "Financials",
    "Consumer Discretionary",
    "Industrials",
    "Energy",
    "Communication Services",
];

const RISK_FREE_RATE: f64 = 0.04;

pub struct DemoProvider {
    seed: u64,
}

impl DemoProvider {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    fn ticker_hash(ticker: &Ticker) -> u64 {
        // FNV-1a over the symbol bytes.
        ticker
            .as_str()
            .bytes()
            .fold(0xcbf2_9ce4_8422_2325_u64, |h, b| {
                (h ^ b as u64).wrapping_mul(0x0000_0100_0000_01b3)
            })
    }

    fn base_price(&self, ticker: &Ticker) -> f64 {
        let h = Self::ticker_hash(ticker);
        20.0 + (h % 480) as f64 + (h >> 16 & 0xff) as f64 / 256.0
    }

    fn daily_vol(&self, ticker: &Ticker) -> f64 {
        let h = Self::ticker_hash(ticker);
        0.010 + (h % 7) as f64 * 0.004
    }

    /// Annualised base IV for the ticker, before the seasonal cycle.
    fn base_iv(&self, ticker: &Ticker) -> f64 {
        let h = Self::ticker_hash(ticker);
        0.18 + (h % 100) as f64 / 400.0
    }

    /// The IV level for a given calendar date: base IV modulated by a slow
    /// sinusoid whose phase is per-ticker.
    fn iv_level(&self, ticker: &Ticker, date: NaiveDate) -> f64 {
        let h = Self::ticker_hash(ticker);
        let phase = (h % 360) as f64 / 360.0 * std::f64::consts::TAU;
        let t = (date - anchor()).num_days() as f64 / 180.0 * std::f64::consts::TAU;
        self.base_iv(ticker) * (1.0 + 0.35 * (t + phase).sin())
    }

    /// All synthetic bars from the anchor through `end`, oldest first.
    ///
    /// The RNG stream is anchored, so the bar for any given date never
    /// changes as `end` advances.
    fn bars_through(&self, ticker: &Ticker, end: NaiveDate) -> Vec<PriceBar> {
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed ^ Self::ticker_hash(ticker));
        let vol = self.daily_vol(ticker);
        let mut close = self.base_price(ticker);

        let mut bars = Vec::new();
        let mut date = anchor();
        while date <= end {
            if calendar::is_trading_day(date) {
                // Irwin-Hall approximation of a standard normal draw.
                let z: f64 = (0..12).map(|_| rng.gen::<f64>()).sum::<f64>() - 6.0;
                let ret = z * vol;
                let open = close;
                close = (close * (1.0 + ret)).max(1.0);
                let hi_span: f64 = rng.gen::<f64>() * vol * close;
                let lo_span: f64 = rng.gen::<f64>() * vol * close;
                let high = open.max(close) + hi_span;
                let low = (open.min(close) - lo_span).max(0.5);
                let volume = 500_000 + (rng.gen::<u64>() % 5_000_000);
                bars.push(PriceBar { date, open, high, low, close, volume });
            }
            date += Duration::days(1);
        }
        bars
    }

    fn spot_on(&self, ticker: &Ticker, date: NaiveDate) -> f64 {
        self.bars_through(ticker, date)
            .last()
            .map(|b| b.close)
            .unwrap_or_else(|| self.base_price(ticker))
    }

    /// Listed expirations as of `today`: the next six Fridays with DTE ≥ 1.
    fn expirations_on(&self, today: NaiveDate) -> Vec<NaiveDate> {
        let mut out = Vec::with_capacity(6);
        let mut date = today + Duration::days(1);
        while out.len() < 6 {
            if date.weekday() == Weekday::Fri {
                out.push(date);
                date += Duration::days(7);
            } else {
                date += Duration::days(1);
            }
        }
        out
    }

    fn build_slice(
        &self,
        ticker: &Ticker,
        spot: f64,
        today: NaiveDate,
        expiration: NaiveDate,
        rng: &mut ChaCha8Rng,
    ) -> ExpirationSlice {
        let dte = (expiration - today).num_days().max(1);
        let t = dte as f64 / 365.0;
        let iv_today = self.iv_level(ticker, today);

        let step = (spot * 0.025).max(0.5);
        let step = if step >= 5.0 { step.round() } else { (step * 2.0).round() / 2.0 };

        let mut calls = Vec::new();
        let mut puts = Vec::new();
        let mut strike = (spot * 0.75 / step).floor() * step;
        while strike <= spot * 1.25 {
            let m = strike / spot - 1.0;
            // Smile plus put-side skew plus a gently rising term structure.
            let mut iv = iv_today * (1.0 + 1.5 * m * m);
            iv += iv_today * 0.25 * (-m).max(0.0);
            iv *= 1.0 + 0.10 * t.sqrt();
            let iv = iv.clamp(0.03, 4.0);

            for opt in [OptionType::Call, OptionType::Put] {
                let mid = greeks::bs_price(opt, spot, strike, t, RISK_FREE_RATE, iv)
                    .unwrap_or(0.01)
                    .max(0.01);
                let spread = (mid * 0.04).max(0.02);
                let bid = (mid - spread / 2.0).max(0.0);
                let ask = mid + spread / 2.0;
                let g = greeks::bs_greeks(opt, spot, strike, t, RISK_FREE_RATE, iv);

                // Liquidity concentrates near the money.
                let atm_weight = (1.0 - m.abs() * 3.0).max(0.05);
                let volume = (rng.gen::<u64>() % 2_000) as f64 * atm_weight;
                let open_interest = (rng.gen::<u64>() % 20_000) as f64 * atm_weight;

                let contract = OptionContract {
                    strike,
                    bid: Some(bid),
                    ask: Some(ask),
                    last: Some(mid),
                    volume: volume as u64,
                    open_interest: open_interest as u64,
                    implied_volatility: Some(iv),
                    delta: g.map(|g| g.delta),
                    gamma: g.map(|g| g.gamma),
                    vega: g.map(|g| g.vega),
                    theta: g.map(|g| g.theta),
                    rho: g.map(|g| g.rho),
                };
                match opt {
                    OptionType::Call => calls.push(contract),
                    OptionType::Put => puts.push(contract),
                }
            }
            strike += step;
        }

        ExpirationSlice { expiration, calls, puts }
    }
}

#[async_trait]
impl MarketDataProvider for DemoProvider {
    async fn current_price(&self, ticker: &Ticker) -> Result<f64, ProviderError> {
        let today = Utc::now().date_naive();
        Ok(self.spot_on(ticker, today))
    }

    async fn price_history(
        &self,
        ticker: &Ticker,
        days: u32,
    ) -> Result<Vec<PriceBar>, ProviderError> {
        let today = Utc::now().date_naive();
        let bars = self.bars_through(ticker, today);
        let start = bars.len().saturating_sub(days as usize);
        Ok(bars[start..].to_vec())
    }

    async fn option_chain(
        &self,
        ticker: &Ticker,
        expiration: Option<NaiveDate>,
    ) -> Result<ChainSnapshot, ProviderError> {
        let now = Utc::now();
        let today = now.date_naive();
        let spot = self.spot_on(ticker, today);

        let day_num = (today - anchor()).num_days() as u64;
        let mut rng = ChaCha8Rng::seed_from_u64(
            self.seed ^ Self::ticker_hash(ticker) ^ day_num.wrapping_mul(0x9e37_79b9),
        );

        let expirations = self.expirations_on(today);
        let selected: Vec<NaiveDate> = match expiration {
            Some(exp) => {
                if !expirations.contains(&exp) {
                    return Err(ProviderError::NotFound);
                }
                vec![exp]
            }
            None => expirations,
        };

        let by_expiration = selected
            .into_iter()
            .map(|exp| self.build_slice(ticker, spot, today, exp, &mut rng))
            .collect();

        Ok(ChainSnapshot {
            ticker: ticker.clone(),
            captured_at: now,
            underlying_price: spot,
            by_expiration,
        })
    }

    async fn expirations(&self, _ticker: &Ticker) -> Result<Vec<NaiveDate>, ProviderError> {
        Ok(self.expirations_on(Utc::now().date_naive()))
    }

    async fn ticker_info(&self, ticker: &Ticker) -> Result<TickerInfo, ProviderError> {
        let h = Self::ticker_hash(ticker);
        let today = Utc::now().date_naive();

        // Quarterly earnings cycle anchored per ticker.
        let offset = (h % 91) as i64;
        let mut next_earnings = anchor() + Duration::days(offset);
        while next_earnings <= today {
            next_earnings += Duration::days(91);
        }

        Ok(TickerInfo {
            name: Some(format!("{} Holdings", ticker.as_str())),
            sector: Some(SECTORS[(h % SECTORS.len() as u64) as usize].to_string()),
            market_cap: Some(self.base_price(ticker) * 1.0e9),
            next_earnings: Some(next_earnings),
        })
    }
}
