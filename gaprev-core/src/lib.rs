//! Gap mean-reversion trading engine
//!
//! Decision and risk-control core: streaming bars feed per-pair indicator
//! state, indicator snapshots feed the gap mean-reversion entry rule,
//! candidate signals are sized under fixed-dollar risk and account-level
//! limits, and open positions run a multi-stage trailing-stop state machine
//! behind a session calendar. The market-data feed and execution gateway
//! are trait seams; the crate performs no broker I/O of its own.

pub mod config;
pub mod engine;
pub mod gateway;
pub mod indicators;
pub mod journal;
pub mod market;
pub mod positions;
pub mod risk;
pub mod session;
pub mod signals;

// Re-export main types for easy access
pub use config::{ConfigError, EngineConfig, RiskConfig, SessionConfig, StrategyConfig};
pub use engine::{EngineStatistics, TradingEngine};
pub use gateway::{BrokerPosition, ExecutionGateway, GatewayError, LimitOrderRequest, OrderId};
pub use indicators::{IndicatorEngine, IndicatorSnapshot};
pub use journal::{CsvTradeJournal, NullJournal, TradeJournal, TradeRecord};
pub use market::{
    Bar, Direction, FeedError, InstrumentClass, Magic, MarketDataFeed, Quote, Symbol, SymbolSpec,
    Timeframe,
};
pub use positions::{CloseReason, Position, PositionAction, PositionManager, PositionStage};
pub use risk::{HaltReason, RiskManager, RiskRejection, RiskStateSnapshot};
pub use session::SessionScheduler;
pub use signals::{Signal, SignalGenerator};
