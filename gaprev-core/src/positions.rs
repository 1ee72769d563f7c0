//! Position ownership and the trailing-stop state machine
//!
//! Positions live in one table keyed by magic and are mutated only through
//! the transition methods here. The stage is a tagged variant, so a position
//! cannot trail before it fills and cannot expire after it opens.

use crate::config::{EngineConfig, SymbolSettings};
use crate::gateway::{LimitOrderRequest, OrderId};
use crate::market::{Direction, InstrumentClass, Magic, Symbol, Timeframe};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use tracing::warn;

/// Why a position left the book.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    StopHit,
    TargetHit,
    Manual,
}

/// Lifecycle stage. `Trailing(n)` means the stop has locked in n multiples
/// of the initial risk distance.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum PositionStage {
    Pending { expires_at: DateTime<Utc> },
    Open,
    Trailing(u32),
    Closed(CloseReason),
    Expired,
}

impl PositionStage {
    /// Pending, open or trailing; anything that still occupies a cap slot.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Pending { .. } | Self::Open | Self::Trailing(_))
    }
}

#[derive(Clone, Debug)]
pub struct Position {
    pub magic: Magic,
    pub order_id: OrderId,
    pub symbol: Symbol,
    pub timeframe: Timeframe,
    pub direction: Direction,
    pub volume: f64,
    /// Limit price until fill, actual fill price afterwards.
    pub entry_price: f64,
    pub stop: f64,
    pub target: f64,
    /// Entry-to-stop distance at placement; the trailing stage unit.
    pub initial_risk: f64,
    pub stage: PositionStage,
    pub opened_at: Option<DateTime<Utc>>,
}

/// What the engine should do for a position this cycle.
#[derive(Clone, Debug, PartialEq)]
pub enum PositionAction {
    Hold,
    ModifyStop { stop: f64 },
    Close(CloseReason),
    Expire,
}

pub struct PositionManager {
    positions: DashMap<Magic, Position>,
    settings: HashMap<Symbol, (InstrumentClass, SymbolSettings)>,
}

impl PositionManager {
    pub fn new(config: &EngineConfig) -> Self {
        let settings = config
            .symbols
            .iter()
            .map(|s| (Symbol::new(&s.name), (s.class, s.settings.clone())))
            .collect();
        Self {
            positions: DashMap::new(),
            settings,
        }
    }

    /// Start tracking a freshly accepted limit order.
    pub fn track_pending(&self, request: &LimitOrderRequest, order_id: OrderId) {
        let position = Position {
            magic: request.magic,
            order_id,
            symbol: request.symbol.clone(),
            timeframe: request.timeframe,
            direction: request.direction,
            volume: request.volume,
            entry_price: request.price,
            stop: request.stop,
            target: request.target,
            initial_risk: (request.price - request.stop).abs(),
            stage: PositionStage::Pending {
                expires_at: request.expires_at,
            },
            opened_at: None,
        };
        self.positions.insert(request.magic, position);
    }

    /// Pending order filled into a live position.
    pub fn on_fill(&self, magic: Magic, fill_price: f64, at: DateTime<Utc>) {
        if let Some(mut position) = self.positions.get_mut(&magic) {
            match position.stage {
                PositionStage::Pending { .. } => {
                    position.entry_price = fill_price;
                    position.opened_at = Some(at);
                    position.stage = PositionStage::Open;
                }
                other => warn!(%magic, stage = ?other, "fill for a non-pending position ignored"),
            }
        }
    }

    /// Position closed at the broker; removed from the table and returned
    /// for journaling.
    pub fn on_closed(&self, magic: Magic, reason: CloseReason) -> Option<Position> {
        self.positions.remove(&magic).map(|(_, mut position)| {
            position.stage = PositionStage::Closed(reason);
            position
        })
    }

    /// Pending order cancelled or lapsed without filling.
    pub fn on_cancelled(&self, magic: Magic) -> Option<Position> {
        self.positions.remove(&magic).map(|(_, mut position)| {
            position.stage = PositionStage::Expired;
            position
        })
    }

    /// One management step for one position.
    ///
    /// Stop proposals are monotonic: emitted only when strictly more
    /// favorable than the current stop and strictly on the safe side of the
    /// current price, so transient volatility can never walk a stop
    /// backwards. The proposal is not committed here; the caller applies it
    /// with [`commit_stop`](Self::commit_stop) once the gateway acknowledges
    /// the modification, so a rejected modify is simply re-proposed on the
    /// next cycle.
    pub fn advance(
        &self,
        magic: Magic,
        price: f64,
        atr: Option<f64>,
        now: DateTime<Utc>,
    ) -> PositionAction {
        let position = match self.positions.get(&magic) {
            Some(p) => p,
            None => return PositionAction::Hold,
        };

        match position.stage {
            PositionStage::Pending { expires_at } => {
                if now >= expires_at {
                    return PositionAction::Expire;
                }
                return PositionAction::Hold;
            }
            PositionStage::Open | PositionStage::Trailing(_) => {}
            PositionStage::Closed(_) | PositionStage::Expired => return PositionAction::Hold,
        }

        let sign = position.direction.sign();

        // Exits first: the working stop or target may already be crossed
        // without the broker-side exit having reported yet.
        if sign * (price - position.stop) <= 0.0 {
            return PositionAction::Close(CloseReason::StopHit);
        }
        if sign * (price - position.target) >= 0.0 {
            return PositionAction::Close(CloseReason::TargetHit);
        }

        if position.initial_risk <= 0.0 {
            return PositionAction::Hold;
        }
        let excursion = sign * (price - position.entry_price);
        let units = (excursion / position.initial_risk).floor();
        if units < 1.0 {
            return PositionAction::Hold;
        }
        let units = units as u32;

        // Profit-lock stage stop at n risk units past entry.
        let mut candidate = position.entry_price + sign * units as f64 * position.initial_risk;

        // Commodities also trail an ATR distance off the current price and
        // take whichever stop is more favorable.
        let (class, settings) = self
            .settings
            .get(&position.symbol)
            .cloned()
            .unwrap_or((InstrumentClass::Forex, SymbolSettings::default()));
        if class == InstrumentClass::Commodity {
            if let Some(atr) = atr {
                let atr_stop = price - sign * settings.trailing_atr_factor * atr;
                candidate = if sign * (atr_stop - candidate) > 0.0 {
                    atr_stop
                } else {
                    candidate
                };
            }
        }

        let improves = sign * (candidate - position.stop) > 0.0;
        let safe_side = sign * (price - candidate) > 0.0;
        if improves && safe_side {
            return PositionAction::ModifyStop { stop: candidate };
        }

        PositionAction::Hold
    }

    /// Apply an acknowledged stop modification. The monotonic guard runs
    /// again so a stale acknowledgement can never regress the stop.
    pub fn commit_stop(&self, magic: Magic, stop: f64) {
        let mut position = match self.positions.get_mut(&magic) {
            Some(p) => p,
            None => return,
        };
        match position.stage {
            PositionStage::Open | PositionStage::Trailing(_) => {}
            _ => return,
        }
        let sign = position.direction.sign();
        if sign * (stop - position.stop) <= 0.0 {
            return;
        }
        position.stop = stop;
        if position.initial_risk > 0.0 {
            let units = (sign * (stop - position.entry_price) / position.initial_risk).floor();
            if units >= 1.0 {
                let units = units as u32;
                let current = match position.stage {
                    PositionStage::Trailing(n) => n,
                    _ => 0,
                };
                if units > current {
                    position.stage = PositionStage::Trailing(units);
                }
            }
        }
    }

    pub fn get(&self, magic: Magic) -> Option<Position> {
        self.positions.get(&magic).map(|p| p.clone())
    }

    /// All tracked (pending or open) positions.
    pub fn live_positions(&self) -> Vec<Position> {
        self.positions.iter().map(|e| e.value().clone()).collect()
    }

    pub fn is_live(&self, magic: Magic) -> bool {
        self.positions
            .get(&magic)
            .map(|p| p.stage.is_live())
            .unwrap_or(false)
    }
}
