//! Execution gateway seam

use crate::market::{Direction, Magic, Symbol, Timeframe};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Broker-side order ticket.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderId(pub u64);

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Fully risk-sized limit order intent, ready for submission. Idempotent
/// with respect to `magic`: the engine suppresses re-submission while an
/// order or position for the same magic is live.
#[derive(Clone, Debug, PartialEq)]
pub struct LimitOrderRequest {
    pub symbol: Symbol,
    pub timeframe: Timeframe,
    pub direction: Direction,
    pub volume: f64,
    pub price: f64,
    pub stop: f64,
    pub target: f64,
    pub magic: Magic,
    pub expires_at: DateTime<Utc>,
    pub comment: String,
}

/// Position as reported by the broker, used for fill/close reconciliation.
#[derive(Clone, Debug, PartialEq)]
pub struct BrokerPosition {
    pub magic: Magic,
    pub symbol: Symbol,
    pub direction: Direction,
    pub volume: f64,
    pub entry_price: f64,
    pub profit: f64,
    pub opened_at: DateTime<Utc>,
}

#[derive(Error, Debug)]
pub enum GatewayError {
    /// Broker-side rejection. Logged and re-evaluated next cycle, never
    /// blindly retried with the identical intent.
    #[error("order rejected: {reason}")]
    Rejected { reason: String },

    #[error("unknown order {0}")]
    UnknownOrder(OrderId),

    #[error("gateway request timed out")]
    Timeout,

    #[error("gateway connection failed: {0}")]
    Connection(String),
}

impl GatewayError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::Connection(_))
    }
}

/// Order submission and account state boundary.
#[async_trait]
pub trait ExecutionGateway: Send + Sync {
    async fn place_limit_order(&self, request: &LimitOrderRequest)
        -> Result<OrderId, GatewayError>;

    async fn modify_order(
        &self,
        id: OrderId,
        stop: Option<f64>,
        target: Option<f64>,
    ) -> Result<(), GatewayError>;

    async fn cancel_order(&self, id: OrderId) -> Result<(), GatewayError>;

    /// Close the open position carrying this magic at market.
    async fn close_position(&self, magic: Magic) -> Result<(), GatewayError>;

    async fn account_equity(&self) -> Result<f64, GatewayError>;

    async fn open_positions(&self) -> Result<Vec<BrokerPosition>, GatewayError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(GatewayError::Timeout.is_transient());
        assert!(GatewayError::Connection("reset".into()).is_transient());
        assert!(!GatewayError::Rejected { reason: "no money".into() }.is_transient());
        assert!(!GatewayError::UnknownOrder(OrderId(7)).is_transient());
    }
}
