//! Market data model and the feed seam

pub mod feed;
pub mod types;

pub use feed::{FeedError, MarketDataFeed};
pub use types::{
    Bar, Direction, InstrumentClass, Magic, Quote, Symbol, SymbolSpec, Timeframe,
};
