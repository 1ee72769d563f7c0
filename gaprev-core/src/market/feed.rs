//! Market data feed seam

use super::types::{Bar, Quote, Symbol, SymbolSpec, Timeframe};
use async_trait::async_trait;
use thiserror::Error;

/// Feed failure taxonomy. Transient failures skip the pair for one cycle;
/// fatal failures (or enough consecutive transient ones) halt new entries
/// while open positions keep being managed.
#[derive(Error, Debug)]
pub enum FeedError {
    #[error("no closed bar available for {symbol} {timeframe}")]
    NoBar { symbol: Symbol, timeframe: Timeframe },

    #[error("no quote available for {0}")]
    NoQuote(Symbol),

    #[error("unknown symbol: {0}")]
    UnknownSymbol(Symbol),

    #[error("feed request timed out")]
    Timeout,

    #[error("feed disconnected: {0}")]
    Disconnected(String),
}

impl FeedError {
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Disconnected(_) | Self::UnknownSymbol(_))
    }
}

/// Source of closed bars and quotes. Implementations must deliver bars in
/// non-decreasing timestamp order per (symbol, timeframe) pair.
#[async_trait]
pub trait MarketDataFeed: Send + Sync {
    /// Most recently *closed* bar for the pair.
    async fn latest_closed_bar(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
    ) -> Result<Bar, FeedError>;

    /// Current top-of-book quote.
    async fn latest_quote(&self, symbol: &Symbol) -> Result<Quote, FeedError>;

    /// Broker contract data for the instrument.
    async fn symbol_spec(&self, symbol: &Symbol) -> Result<SymbolSpec, FeedError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        let stale = FeedError::NoBar {
            symbol: Symbol::new("EURUSD"),
            timeframe: Timeframe::M5,
        };
        assert!(stale.is_transient());
        assert!(FeedError::Timeout.is_transient());
        assert!(!FeedError::Disconnected("socket closed".into()).is_transient());
        assert!(!FeedError::UnknownSymbol(Symbol::new("XXX")).is_transient());
    }
}
