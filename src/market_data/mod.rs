// =============================================================================
// Market-Data Façade — calendar gate → TTL cache → circuit breaker → provider
// =============================================================================
//
// Every read follows the same path:
//
//   1. While the market is closed, a stale-but-authoritative cached answer is
//      served for the real-time endpoint rather than burning a provider call.
//   2. The TTL cache is consulted under a canonical key
//      ("<op>|<ticker>|<params>"); hits return immediately.
//   3. On a miss, the endpoint's circuit breaker wraps the provider call
//      (with a hard 30 s timeout); successes are cached with the endpoint's
//      TTL. The rate budget is charged before the call and refunded when the
//      breaker rejects without invoking the provider.
//
// `CircuitOpen` is surfaced unchanged so the scheduler can back off;
// everything else maps to `Unavailable` and skips the ticker for the cycle.
// =============================================================================

pub mod budget;
pub mod demo;
pub mod provider;

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use parking_lot::RwLock;
use thiserror::Error;
use tracing::{debug, warn};

use crate::breaker::{BreakerError, BreakerRegistry};
use crate::cache::{CacheValue, TtlCache};
use crate::calendar::{self, Session};
use crate::config::{BreakerParams, BreakersConfig, CacheConfig};
use crate::types::{ChainSnapshot, OptionType, PriceBar, Ticker, TickerInfo};

pub use budget::RateBudget;
pub use demo::DemoProvider;
pub use provider::{MarketDataProvider, ProviderError};

/// Hard timeout on any single provider call.
pub const PROVIDER_TIMEOUT: Duration = Duration::from_secs(30);

/// Fraction of a chain's contracts allowed to violate the quote/Greek ranges
/// before the whole payload is rejected as malformed.
const MAX_BAD_CONTRACT_RATIO: f64 = 0.25;

/// The five façade endpoints, named consistently across cache keys, breaker
/// names, and TTL configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    CurrentPrice,
    PriceHistory,
    OptionsChain,
    TickerInfo,
    Expirations,
}

impl Endpoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CurrentPrice => "current_price",
            Self::PriceHistory => "price_history",
            Self::OptionsChain => "options_chain",
            Self::TickerInfo => "ticker_info",
            Self::Expirations => "expirations",
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Façade failure surfaced to the scheduler.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("circuit open on {endpoint}; next probe in {retry_in_secs}s")]
    CircuitOpen { endpoint: String, retry_in_secs: u64 },
    #[error("{ticker}: data unavailable ({reason})")]
    Unavailable { ticker: Ticker, reason: ProviderError },
}

impl DataError {
    /// True for failures that should short-circuit the remaining ticker loop.
    pub fn is_backoff_worthy(&self) -> bool {
        matches!(
            self,
            Self::CircuitOpen { .. }
                | Self::Unavailable { reason: ProviderError::RateLimited, .. }
        )
    }
}

/// Provider-agnostic reads with caching, breaking, and budget accounting.
pub struct MarketData {
    provider: RwLock<Arc<dyn MarketDataProvider>>,
    cache: Arc<TtlCache>,
    breakers: Arc<BreakerRegistry>,
    budget: Arc<RateBudget>,
    cache_config: CacheConfig,
    breaker_config: BreakersConfig,
}

impl MarketData {
    pub fn new(
        provider: Arc<dyn MarketDataProvider>,
        cache: Arc<TtlCache>,
        breakers: Arc<BreakerRegistry>,
        budget: Arc<RateBudget>,
        cache_config: CacheConfig,
        breaker_config: BreakersConfig,
    ) -> Self {
        Self {
            provider: RwLock::new(provider),
            cache,
            breakers,
            budget,
            cache_config,
            breaker_config,
        }
    }

    /// Swap the underlying provider (demo-mode hot switch). Takes effect on
    /// the next call; an in-flight cycle finishes on the provider it started
    /// with.
    pub fn swap_provider(&self, provider: Arc<dyn MarketDataProvider>) {
        *self.provider.write() = provider;
    }

    fn current_provider(&self) -> Arc<dyn MarketDataProvider> {
        self.provider.read().clone()
    }

    fn ttl(&self, endpoint: Endpoint) -> Duration {
        let secs = match endpoint {
            Endpoint::CurrentPrice => self.cache_config.ttl_current_price_sec,
            Endpoint::PriceHistory => self.cache_config.ttl_price_history_sec,
            Endpoint::OptionsChain => self.cache_config.ttl_options_chain_sec,
            Endpoint::TickerInfo => self.cache_config.ttl_ticker_info_sec,
            Endpoint::Expirations => self.cache_config.ttl_expirations_sec,
        };
        Duration::from_secs(secs)
    }

    fn breaker_params(&self, endpoint: Endpoint) -> BreakerParams {
        match endpoint {
            Endpoint::CurrentPrice => self.breaker_config.current_price,
            Endpoint::PriceHistory => self.breaker_config.price_history,
            Endpoint::OptionsChain => self.breaker_config.options_chain,
            Endpoint::TickerInfo => self.breaker_config.ticker_info,
            Endpoint::Expirations => self.breaker_config.expirations,
        }
    }

    /// Run one guarded provider call: budget spend, 30 s timeout, breaker.
    async fn guarded<T, Fut>(
        &self,
        endpoint: Endpoint,
        ticker: &Ticker,
        fut: Fut,
    ) -> Result<T, DataError>
    where
        Fut: std::future::Future<Output = Result<T, ProviderError>>,
    {
        let breaker = self
            .breakers
            .get_or_register(endpoint.as_str(), self.breaker_params(endpoint));

        // The local budget binds every outbound call, not just cycle starts.
        let now = calendar::now_utc();
        if !self.budget.can_call(now) {
            return Err(DataError::Unavailable {
                ticker: ticker.clone(),
                reason: ProviderError::RateLimited,
            });
        }
        // Spend before the call completes; refunded on breaker rejection.
        self.budget.record_call(now);

        let timed = async {
            match tokio::time::timeout(PROVIDER_TIMEOUT, fut).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Transport(format!(
                    "timeout after {}s",
                    PROVIDER_TIMEOUT.as_secs()
                ))),
            }
        };

        match breaker.call(timed).await {
            Ok(value) => Ok(value),
            Err(BreakerError::Open { retry_in }) => {
                self.budget.refund();
                Err(DataError::CircuitOpen {
                    endpoint: endpoint.as_str().to_string(),
                    retry_in_secs: retry_in.as_secs(),
                })
            }
            Err(BreakerError::Inner(reason)) => Err(DataError::Unavailable {
                ticker: ticker.clone(),
                reason,
            }),
        }
    }

    /// Serve a stale real-time answer while the market is closed, when the
    /// entry was captured after (or within one TTL of) the last close.
    fn closed_market_answer(&self, key: &str, endpoint: Endpoint) -> Option<CacheValue> {
        let now = calendar::now_utc();
        if calendar::session_of(now) != Session::Closed {
            return None;
        }
        let (value, age) = self.cache.get_stale(key)?;
        let closed_for = (now - calendar::last_regular_close(now))
            .to_std()
            .unwrap_or_default();
        if age <= closed_for + self.ttl(endpoint) {
            debug!(key, age_secs = age.as_secs(), "serving cached answer (market closed)");
            Some(value)
        } else {
            None
        }
    }

    // ── Endpoints ───────────────────────────────────────────────────────

    pub async fn get_current_price(&self, ticker: &Ticker) -> Result<f64, DataError> {
        let key = format!("current_price|{ticker}");

        if let Some(CacheValue::Price(p)) = self.closed_market_answer(&key, Endpoint::CurrentPrice)
        {
            return Ok(p);
        }
        if let Some(CacheValue::Price(p)) = self.cache.get(&key) {
            return Ok(p);
        }

        let provider = self.current_provider();
        let price = self
            .guarded(Endpoint::CurrentPrice, ticker, async {
                provider.current_price(ticker).await
            })
            .await?;
        self.cache
            .set(&key, CacheValue::Price(price), self.ttl(Endpoint::CurrentPrice));
        Ok(price)
    }

    pub async fn get_price_history(
        &self,
        ticker: &Ticker,
        days: u32,
    ) -> Result<Vec<PriceBar>, DataError> {
        let key = format!("price_history|{ticker}|{days}");
        if let Some(CacheValue::History(bars)) = self.cache.get(&key) {
            return Ok(bars);
        }

        let provider = self.current_provider();
        let bars = self
            .guarded(Endpoint::PriceHistory, ticker, async {
                provider.price_history(ticker, days).await
            })
            .await?;
        self.cache.set(
            &key,
            CacheValue::History(bars.clone()),
            self.ttl(Endpoint::PriceHistory),
        );
        Ok(bars)
    }

    pub async fn get_option_chain(
        &self,
        ticker: &Ticker,
        expiration: Option<NaiveDate>,
    ) -> Result<ChainSnapshot, DataError> {
        let key = match expiration {
            Some(exp) => format!("options_chain|{ticker}|{exp}"),
            None => format!("options_chain|{ticker}|all"),
        };
        if let Some(CacheValue::Chain(chain)) = self.cache.get(&key) {
            return Ok(chain);
        }

        let provider = self.current_provider();
        let chain = self
            .guarded(Endpoint::OptionsChain, ticker, async {
                provider.option_chain(ticker, expiration).await
            })
            .await?;

        // Nothing downstream re-checks quote or Greek ranges, so a malformed
        // contract is flagged here, at the only door a chain comes through.
        let (violations, total) = audit_chain(&chain);
        if total > 0 && violations as f64 > total as f64 * MAX_BAD_CONTRACT_RATIO {
            return Err(DataError::Unavailable {
                ticker: ticker.clone(),
                reason: ProviderError::Malformed(format!(
                    "{violations} of {total} contracts violate quote invariants"
                )),
            });
        }

        self.cache.set(
            &key,
            CacheValue::Chain(chain.clone()),
            self.ttl(Endpoint::OptionsChain),
        );
        Ok(chain)
    }

    pub async fn get_expirations(&self, ticker: &Ticker) -> Result<Vec<NaiveDate>, DataError> {
        let key = format!("expirations|{ticker}");
        if let Some(CacheValue::Expirations(dates)) = self.cache.get(&key) {
            return Ok(dates);
        }

        let provider = self.current_provider();
        let dates = self
            .guarded(Endpoint::Expirations, ticker, async {
                provider.expirations(ticker).await
            })
            .await?;
        self.cache.set(
            &key,
            CacheValue::Expirations(dates.clone()),
            self.ttl(Endpoint::Expirations),
        );
        Ok(dates)
    }

    pub async fn get_ticker_info(&self, ticker: &Ticker) -> Result<TickerInfo, DataError> {
        let key = format!("ticker_info|{ticker}");
        if let Some(CacheValue::Info(info)) = self.cache.get(&key) {
            return Ok(info);
        }

        let provider = self.current_provider();
        let info = self
            .guarded(Endpoint::TickerInfo, ticker, async {
                provider.ticker_info(ticker).await
            })
            .await?;
        self.cache.set(
            &key,
            CacheValue::Info(info.clone()),
            self.ttl(Endpoint::TickerInfo),
        );
        Ok(info)
    }
}

/// Walk every contract in a provider chain against the quote/Greek ranges.
///
/// Each violation is logged with enough context to identify the row; the
/// caller gets `(violations, total)` and decides whether the payload is
/// usable at all.
fn audit_chain(chain: &ChainSnapshot) -> (usize, usize) {
    let mut violations = 0usize;
    let mut total = 0usize;
    for slice in &chain.by_expiration {
        let sides = [
            (OptionType::Call, &slice.calls),
            (OptionType::Put, &slice.puts),
        ];
        for (side, contracts) in sides {
            for contract in contracts {
                total += 1;
                if let Some(problem) = contract.invariant_violation(side) {
                    violations += 1;
                    warn!(
                        ticker = %chain.ticker,
                        expiration = %slice.expiration,
                        strike = contract.strike,
                        %side,
                        problem = %problem,
                        "contract violates chain invariants"
                    );
                }
            }
        }
    }
    (violations, total)
}
