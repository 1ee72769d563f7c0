//! Gap mean-reversion signal generation
//!
//! Signals are pure functions of the indicator snapshot plus the per-pair
//! cooldown table; evaluation has no side effect other than stamping the
//! cooldown when a signal is actually emitted.

use crate::config::{EngineConfig, StrategyConfig, SymbolSettings};
use crate::indicators::{gap_percent, IndicatorSnapshot};
use crate::market::{Direction, Symbol, Timeframe};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use tracing::debug;

/// Candidate trade entry. Transient: consumed by risk sizing within the
/// cycle that produced it, or discarded.
#[derive(Clone, Debug, PartialEq)]
pub struct Signal {
    pub symbol: Symbol,
    pub timeframe: Timeframe,
    pub direction: Direction,
    pub reference_price: f64,
    pub stop_distance: f64,
    pub generated_at: DateTime<Utc>,
}

pub struct SignalGenerator {
    strategy: StrategyConfig,
    settings: HashMap<Symbol, SymbolSettings>,
    last_signal: DashMap<(Symbol, Timeframe), DateTime<Utc>>,
}

impl SignalGenerator {
    pub fn new(config: &EngineConfig) -> Self {
        let settings = config
            .symbols
            .iter()
            .map(|s| (Symbol::new(&s.name), s.settings.clone()))
            .collect();
        Self {
            strategy: config.strategy.clone(),
            settings,
            last_signal: DashMap::new(),
        }
    }

    /// Evaluate the entry rule against one snapshot.
    ///
    /// A long fires when price is stretched below the slow mean by at least
    /// the symbol's minimum gap while holding above the fast mean, with the
    /// oscillator turning down outside its upper band and volatility
    /// contracting; a short is the mirror. The spread filter and the
    /// per-pair cooldown run first; the cooldown tie-break rejects the newer
    /// signal, it never queues.
    pub fn evaluate(&self, snapshot: &IndicatorSnapshot, current_spread: f64) -> Option<Signal> {
        let settings = self
            .settings
            .get(&snapshot.symbol)
            .cloned()
            .unwrap_or_default();

        // No spread baseline yet means no way to judge liquidity; reject.
        let avg_spread = match snapshot.avg_spread {
            Some(avg) => avg,
            None => {
                debug!(symbol = %snapshot.symbol, "no spread baseline, skipping evaluation");
                return None;
            }
        };
        if current_spread > avg_spread * self.strategy.max_spread_multiplier {
            debug!(
                symbol = %snapshot.symbol,
                spread = current_spread,
                limit = avg_spread * self.strategy.max_spread_multiplier,
                "spread above threshold"
            );
            return None;
        }

        // Volatility contraction filter.
        if snapshot.fast_range >= snapshot.slow_range {
            return None;
        }

        let gap = gap_percent(snapshot);
        let osc = snapshot.oscillator;
        let osc_prev = snapshot.oscillator_prev;

        let long = self.strategy.allow_long
            && gap <= -settings.min_gap_pct
            && snapshot.close > snapshot.fast_ma
            && osc_prev > osc
            && osc < settings.osc_upper;
        let short = self.strategy.allow_short
            && gap >= settings.min_gap_pct
            && snapshot.close < snapshot.fast_ma
            && osc_prev < osc
            && osc > settings.osc_lower;

        let direction = match (long, short) {
            (true, _) => Direction::Long,
            (_, true) => Direction::Short,
            _ => return None,
        };

        let key = (snapshot.symbol.clone(), snapshot.timeframe);
        let min_spacing =
            snapshot.timeframe.duration() * self.strategy.min_bars_between_trades as i32;
        if let Some(last) = self.last_signal.get(&key) {
            if snapshot.timestamp - *last < min_spacing {
                debug!(
                    symbol = %snapshot.symbol,
                    timeframe = %snapshot.timeframe,
                    "signal inside cooldown window, rejected"
                );
                return None;
            }
        }
        self.last_signal.insert(key, snapshot.timestamp);

        Some(Signal {
            symbol: snapshot.symbol.clone(),
            timeframe: snapshot.timeframe,
            direction,
            reference_price: snapshot.close,
            stop_distance: settings.stop_atr_factor * snapshot.fast_range,
            generated_at: snapshot.timestamp,
        })
    }
}
