//! Market data types

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Trading symbol
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Symbol(pub String);

impl Symbol {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Bar timeframe
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    M1,
    M5,
    M15,
    M30,
    H1,
    H4,
    D1,
}

impl Timeframe {
    pub fn minutes(&self) -> i64 {
        match self {
            Timeframe::M1 => 1,
            Timeframe::M5 => 5,
            Timeframe::M15 => 15,
            Timeframe::M30 => 30,
            Timeframe::H1 => 60,
            Timeframe::H4 => 240,
            Timeframe::D1 => 1440,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::minutes(self.minutes())
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Timeframe::M1 => write!(f, "M1"),
            Timeframe::M5 => write!(f, "M5"),
            Timeframe::M15 => write!(f, "M15"),
            Timeframe::M30 => write!(f, "M30"),
            Timeframe::H1 => write!(f, "H1"),
            Timeframe::H4 => write!(f, "H4"),
            Timeframe::D1 => write!(f, "D1"),
        }
    }
}

/// Trade direction
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// +1 for long, -1 for short; lets price arithmetic stay branch-free.
    pub fn sign(&self) -> f64 {
        match self {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
        }
    }

    pub fn opposite(&self) -> Direction {
        match self {
            Direction::Long => Direction::Short,
            Direction::Short => Direction::Long,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Long => write!(f, "BUY"),
            Direction::Short => write!(f, "SELL"),
        }
    }
}

/// Instrument class, used for class-specific trailing behavior
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstrumentClass {
    Forex,
    Index,
    Crypto,
    Commodity,
}

/// A closed OHLCV bar. Immutable once produced by the feed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub symbol: Symbol,
    pub timeframe: Timeframe,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// Exchange close time of the bar, UTC.
    pub timestamp: DateTime<Utc>,
}

/// Top-of-book quote snapshot
#[derive(Clone, Debug, PartialEq)]
pub struct Quote {
    pub symbol: Symbol,
    pub bid: f64,
    pub ask: f64,
    pub timestamp: DateTime<Utc>,
}

impl Quote {
    pub fn spread(&self) -> f64 {
        self.ask - self.bid
    }

    pub fn mid(&self) -> f64 {
        (self.ask + self.bid) / 2.0
    }

    /// Price the market would fill an entry in the given direction.
    pub fn entry_side(&self, direction: Direction) -> f64 {
        match direction {
            Direction::Long => self.ask,
            Direction::Short => self.bid,
        }
    }

    /// Price relevant for exiting a position in the given direction.
    pub fn exit_side(&self, direction: Direction) -> f64 {
        match direction {
            Direction::Long => self.bid,
            Direction::Short => self.ask,
        }
    }
}

/// Broker contract data for one instrument
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SymbolSpec {
    pub symbol: Symbol,
    /// Smallest price increment.
    pub point: f64,
    /// Account-currency value of a one-point move for one lot.
    pub point_value_per_lot: f64,
    pub lot_step: f64,
    pub min_lot: f64,
    pub max_lot: f64,
    pub class: InstrumentClass,
}

impl SymbolSpec {
    /// Account-currency loss of `volume` lots over `distance` price units.
    pub fn risk_of(&self, volume: f64, distance: f64) -> f64 {
        volume * (distance / self.point) * self.point_value_per_lot
    }
}

/// Strategy-instance tag binding orders and positions to one
/// (symbol, timeframe, direction) slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Magic(pub u64);

impl Magic {
    /// `base + symbol_index*1000 + timeframe_index*10 + direction_index`.
    pub fn derive(base: u64, symbol_index: usize, timeframe_index: usize, direction: Direction) -> Self {
        let dir = match direction {
            Direction::Long => 0,
            Direction::Short => 1,
        };
        Magic(base + symbol_index as u64 * 1000 + timeframe_index as u64 * 10 + dir)
    }
}

impl fmt::Display for Magic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeframe_durations() {
        assert_eq!(Timeframe::M5.duration(), Duration::minutes(5));
        assert_eq!(Timeframe::H4.duration(), Duration::minutes(240));
        assert!(Timeframe::M5 < Timeframe::M30);
    }

    #[test]
    fn quote_sides() {
        let q = Quote {
            symbol: Symbol::new("EURUSD"),
            bid: 1.1000,
            ask: 1.1002,
            timestamp: Utc::now(),
        };
        assert!((q.spread() - 0.0002).abs() < 1e-12);
        assert_eq!(q.entry_side(Direction::Long), 1.1002);
        assert_eq!(q.exit_side(Direction::Long), 1.1000);
        assert_eq!(q.entry_side(Direction::Short), 1.1000);
    }

    #[test]
    fn magic_unique_per_slot() {
        let a = Magic::derive(10000, 0, 0, Direction::Long);
        let b = Magic::derive(10000, 0, 0, Direction::Short);
        let c = Magic::derive(10000, 0, 1, Direction::Long);
        let d = Magic::derive(10000, 1, 0, Direction::Long);
        assert_eq!(a, Magic(10000));
        assert_eq!(b, Magic(10001));
        assert_eq!(c, Magic(10010));
        assert_eq!(d, Magic(11000));
    }

    #[test]
    fn spec_risk_arithmetic() {
        let spec = SymbolSpec {
            symbol: Symbol::new("EURUSD"),
            point: 0.0001,
            point_value_per_lot: 100.0,
            lot_step: 0.01,
            min_lot: 0.01,
            max_lot: 1.0,
            class: InstrumentClass::Forex,
        };
        // 0.02 lots across a 20-point stop at $100/point/lot = $40.
        assert!((spec.risk_of(0.02, 0.0020) - 40.0).abs() < 1e-9);
    }
}
