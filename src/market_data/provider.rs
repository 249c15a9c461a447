// =============================================================================
// Provider Capability — the interface any market-data backend must fulfil
// =============================================================================
//
// Concrete providers are injected at engine construction; the engine never
// speaks a vendor wire protocol itself. Errors are classified into the four
// kinds the scheduler knows how to react to.
// =============================================================================

use async_trait::async_trait;
use chrono::NaiveDate;
use thiserror::Error;

use crate::types::{ChainSnapshot, PriceBar, Ticker, TickerInfo};

/// Provider failure classification.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("rate limited by provider")]
    RateLimited,
    #[error("ticker not found")]
    NotFound,
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Provider-agnostic market-data reads.
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// Latest trade or mark price for the underlying.
    async fn current_price(&self, ticker: &Ticker) -> Result<f64, ProviderError>;

    /// Daily bars for the trailing `days` sessions, oldest first.
    async fn price_history(&self, ticker: &Ticker, days: u32)
        -> Result<Vec<PriceBar>, ProviderError>;

    /// Full chain, or a single expiration when `expiration` is given.
    async fn option_chain(
        &self,
        ticker: &Ticker,
        expiration: Option<NaiveDate>,
    ) -> Result<ChainSnapshot, ProviderError>;

    /// Listed expiration dates, ascending.
    async fn expirations(&self, ticker: &Ticker) -> Result<Vec<NaiveDate>, ProviderError>;

    /// Static metadata (name, sector, next earnings date when known).
    async fn ticker_info(&self, ticker: &Ticker) -> Result<TickerInfo, ProviderError>;
}
