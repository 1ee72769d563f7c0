//! Account-level risk control
//!
//! `RiskManager` owns the single `RiskState` entity behind one lock; every
//! other component reads it through a snapshot accessor and mutates it only
//! through the notification methods here. Sizing either returns a fully
//! bounded order request or a typed rejection naming the rule that blocked
//! the trade; rejections are decision outcomes, not errors.

use crate::config::EngineConfig;
use crate::gateway::LimitOrderRequest;
use crate::market::{Magic, Quote, Symbol, SymbolSpec, Timeframe};
use crate::signals::Signal;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use thiserror::Error;
use tracing::{info, warn};

/// Why a candidate trade was not sized.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RiskRejection {
    #[error("global trade cap reached ({open}/{cap})")]
    GlobalCapReached { open: usize, cap: usize },

    #[error("per-pair trade cap reached for {symbol} {timeframe}")]
    PairCapReached { symbol: Symbol, timeframe: Timeframe },

    #[error("daily loss limit breached")]
    DailyLossBreached,

    #[error("drawdown limit breached")]
    DrawdownBreached,

    #[error("minimum bars between trades not elapsed")]
    TradeSpacing,

    #[error("stop distance must be positive")]
    InvalidStopDistance,

    #[error("sized volume below minimum lot")]
    VolumeBelowMinimum,

    #[error("implied risk {implied:.2} exceeds budget {budget:.2}")]
    RiskExceedsBudget { implied: f64, budget: f64 },
}

/// What latched the entry halt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HaltReason {
    DailyLoss,
    Drawdown,
}

/// Read-only view of the risk state for observers.
#[derive(Clone, Debug, PartialEq)]
pub struct RiskStateSnapshot {
    pub day_start_equity: f64,
    pub equity: f64,
    pub peak_equity: f64,
    /// Equity change since the day baseline (realized plus unrealized).
    pub daily_pnl: f64,
    pub realized_daily_pnl: f64,
    pub drawdown_pct: f64,
    pub open_global: usize,
    pub halted: Option<HaltReason>,
}

struct RiskState {
    day_start_equity: f64,
    equity: f64,
    peak_equity: f64,
    realized_daily_pnl: f64,
    open_per_pair: HashMap<(Symbol, Timeframe), usize>,
    last_entry: HashMap<(Symbol, Timeframe), DateTime<Utc>>,
    /// Sticky for the rest of the trading day once set.
    daily_loss_latched: bool,
}

impl RiskState {
    fn new(initial_equity: f64) -> Self {
        Self {
            day_start_equity: initial_equity,
            equity: initial_equity,
            peak_equity: initial_equity,
            realized_daily_pnl: 0.0,
            open_per_pair: HashMap::new(),
            last_entry: HashMap::new(),
            daily_loss_latched: false,
        }
    }

    fn open_global(&self) -> usize {
        self.open_per_pair.values().sum()
    }

    fn daily_pnl(&self) -> f64 {
        self.equity - self.day_start_equity
    }

    fn drawdown_pct(&self) -> f64 {
        if self.peak_equity <= 0.0 {
            return 0.0;
        }
        (self.peak_equity - self.equity) / self.peak_equity * 100.0
    }
}

pub struct RiskManager {
    config: EngineConfig,
    state: RwLock<RiskState>,
}

impl RiskManager {
    pub fn new(config: &EngineConfig, initial_equity: f64) -> Self {
        Self {
            config: config.clone(),
            state: RwLock::new(RiskState::new(initial_equity)),
        }
    }

    /// Current halt, if any. Daily-loss breaches stay latched until the
    /// daily reset; drawdown is re-evaluated against live equity.
    pub fn halted(&self) -> Option<HaltReason> {
        let state = self.state.read();
        self.halted_inner(&state)
    }

    fn halted_inner(&self, state: &RiskState) -> Option<HaltReason> {
        if state.daily_loss_latched {
            return Some(HaltReason::DailyLoss);
        }
        let floor = state.peak_equity * (1.0 - self.config.risk.max_drawdown_percent / 100.0);
        if state.equity <= floor {
            return Some(HaltReason::Drawdown);
        }
        None
    }

    pub fn snapshot(&self) -> RiskStateSnapshot {
        let state = self.state.read();
        RiskStateSnapshot {
            day_start_equity: state.day_start_equity,
            equity: state.equity,
            peak_equity: state.peak_equity,
            daily_pnl: state.daily_pnl(),
            realized_daily_pnl: state.realized_daily_pnl,
            drawdown_pct: state.drawdown_pct(),
            open_global: state.open_global(),
            halted: self.halted_inner(&state),
        }
    }

    /// Size a candidate signal into a bounded limit order request.
    ///
    /// The volume is derived so the loss at the stop equals the configured
    /// per-trade risk, floored to the broker lot step and clamped to the
    /// allowed lot range; a clamp that would overshoot the risk budget past
    /// the rounding tolerance is rejected rather than over-risked.
    pub fn size_position(
        &self,
        signal: &Signal,
        quote: &Quote,
        spec: &SymbolSpec,
        magic: Magic,
    ) -> Result<LimitOrderRequest, RiskRejection> {
        let state = self.state.read();

        match self.halted_inner(&state) {
            Some(HaltReason::DailyLoss) => return Err(RiskRejection::DailyLossBreached),
            Some(HaltReason::Drawdown) => return Err(RiskRejection::DrawdownBreached),
            None => {}
        }

        let open = state.open_global();
        let cap = self.config.risk.max_global_trades;
        if open >= cap {
            return Err(RiskRejection::GlobalCapReached { open, cap });
        }

        let key = (signal.symbol.clone(), signal.timeframe);
        let pair_open = state.open_per_pair.get(&key).copied().unwrap_or(0);
        if pair_open >= self.config.risk.max_trades_per_pair {
            return Err(RiskRejection::PairCapReached {
                symbol: signal.symbol.clone(),
                timeframe: signal.timeframe,
            });
        }

        let min_spacing = signal.timeframe.duration()
            * self.config.strategy.min_bars_between_trades as i32;
        if let Some(last) = state.last_entry.get(&key) {
            if signal.generated_at - *last < min_spacing {
                return Err(RiskRejection::TradeSpacing);
            }
        }
        drop(state);

        if signal.stop_distance <= 0.0 {
            return Err(RiskRejection::InvalidStopDistance);
        }

        let risk_budget = self.config.risk.risk_per_trade;
        let risk_per_lot = spec.risk_of(1.0, signal.stop_distance);
        let raw = risk_budget / risk_per_lot;

        let min_lot = spec.min_lot.max(self.config.risk.min_lot);
        let max_lot = spec.max_lot.min(self.config.risk.max_allowed_lot);
        let clamped = raw.clamp(min_lot, max_lot);

        // Floor to the lot step; never round a volume up.
        let steps = (clamped / spec.lot_step + 1e-9).floor();
        let volume = steps * spec.lot_step;
        if volume < min_lot - 1e-9 {
            return Err(RiskRejection::VolumeBelowMinimum);
        }

        let implied = spec.risk_of(volume, signal.stop_distance);
        let tolerance = 1.0 + self.config.risk.risk_tolerance_pct / 100.0;
        if implied > risk_budget * tolerance {
            return Err(RiskRejection::RiskExceedsBudget {
                implied,
                budget: risk_budget,
            });
        }

        let sign = signal.direction.sign();
        let offset = self.config.strategy.limit_order_offset_points * spec.point;
        let price = quote.entry_side(signal.direction) - sign * offset;
        let stop = price - sign * signal.stop_distance;
        let target = price + sign * signal.stop_distance * self.config.risk.risk_reward_ratio;
        let expires_at = signal.generated_at
            + signal.timeframe.duration() * self.config.strategy.order_expiration_bars as i32;

        Ok(LimitOrderRequest {
            symbol: signal.symbol.clone(),
            timeframe: signal.timeframe,
            direction: signal.direction,
            volume,
            price,
            stop,
            target,
            magic,
            expires_at,
            comment: self.config.journal.comment.clone(),
        })
    }

    /// A working order was accepted by the gateway: counts toward the caps
    /// and stamps the pair's trade-spacing clock.
    pub fn on_order_submitted(&self, symbol: &Symbol, timeframe: Timeframe, at: DateTime<Utc>) {
        let mut state = self.state.write();
        *state
            .open_per_pair
            .entry((symbol.clone(), timeframe))
            .or_insert(0) += 1;
        state.last_entry.insert((symbol.clone(), timeframe), at);
    }

    /// A pending order left the book unfilled (cancelled or expired).
    pub fn on_order_cancelled(&self, symbol: &Symbol, timeframe: Timeframe) {
        let mut state = self.state.write();
        if let Some(count) = state.open_per_pair.get_mut(&(symbol.clone(), timeframe)) {
            *count = count.saturating_sub(1);
        }
    }

    /// A pending order filled into a position. The slot keeps counting
    /// toward the caps, so only the transition is recorded.
    pub fn on_fill(&self, magic: Magic, fill_price: f64) {
        info!(%magic, fill_price, "order filled");
    }

    /// A position closed with the given realized profit.
    pub fn on_close(&self, symbol: &Symbol, timeframe: Timeframe, profit: f64) {
        let mut state = self.state.write();
        if let Some(count) = state.open_per_pair.get_mut(&(symbol.clone(), timeframe)) {
            *count = count.saturating_sub(1);
        }
        state.realized_daily_pnl += profit;
    }

    /// Per-cycle equity mark: tracks the peak and latches the daily-loss
    /// halt as soon as the day's equity drop crosses the limit.
    pub fn on_tick(&self, equity: f64) {
        let mut state = self.state.write();
        state.equity = equity;
        if equity > state.peak_equity {
            state.peak_equity = equity;
        }
        let daily_limit =
            state.day_start_equity * self.config.risk.daily_loss_percent / 100.0;
        if !state.daily_loss_latched && state.daily_pnl() <= -daily_limit {
            state.daily_loss_latched = true;
            warn!(
                daily_pnl = state.daily_pnl(),
                limit = -daily_limit,
                "daily loss limit breached, entries halted for the day"
            );
        }
    }

    /// Re-baseline at the session-day boundary: the daily counter clears
    /// and day-start equity becomes current equity, regardless of prior
    /// state.
    pub fn on_new_day(&self) {
        let mut state = self.state.write();
        state.day_start_equity = state.equity;
        state.realized_daily_pnl = 0.0;
        state.daily_loss_latched = false;
        info!(day_start_equity = state.day_start_equity, "daily risk counters reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::{Direction, InstrumentClass};
    use chrono::TimeZone;

    fn config() -> EngineConfig {
        EngineConfig::from_toml_str(
            r#"
                timeframes = ["M5", "M15"]

                [[symbols]]
                name = "EURUSD"
            "#,
        )
        .unwrap()
    }

    fn spec() -> SymbolSpec {
        SymbolSpec {
            symbol: Symbol::new("EURUSD"),
            point: 0.0001,
            point_value_per_lot: 100.0,
            lot_step: 0.01,
            min_lot: 0.01,
            max_lot: 1.0,
            class: InstrumentClass::Forex,
        }
    }

    fn signal(stop_distance: f64) -> Signal {
        Signal {
            symbol: Symbol::new("EURUSD"),
            timeframe: Timeframe::M5,
            direction: Direction::Long,
            reference_price: 1.1000,
            stop_distance,
            generated_at: Utc.with_ymd_and_hms(2024, 6, 3, 12, 0, 0).unwrap(),
        }
    }

    fn quote() -> Quote {
        Quote {
            symbol: Symbol::new("EURUSD"),
            bid: 1.1000,
            ask: 1.1002,
            timestamp: Utc.with_ymd_and_hms(2024, 6, 3, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn fixed_dollar_sizing_floors_to_lot_step() {
        // $50 risk over a 20-point stop at $100/point/lot: raw 0.025 lots,
        // floored to the 0.01 step.
        let manager = RiskManager::new(&config(), 10_000.0);
        let request = manager
            .size_position(&signal(0.0020), &quote(), &spec(), Magic(10_000))
            .unwrap();
        assert!((request.volume - 0.02).abs() < 1e-9);

        // Entry 20 points under the ask, stop one stop-distance below,
        // target at 5x the stop distance.
        assert!((request.price - 1.0982).abs() < 1e-9);
        assert!((request.stop - 1.0962).abs() < 1e-9);
        assert!((request.target - 1.1082).abs() < 1e-9);
        assert_eq!(
            request.expires_at,
            signal(0.0020).generated_at + chrono::Duration::minutes(25)
        );
    }

    #[test]
    fn sized_risk_never_exceeds_budget_with_tolerance() {
        let manager = RiskManager::new(&config(), 10_000.0);
        let spec = spec();
        for stop in [0.0005, 0.0013, 0.0020, 0.0047, 0.0100] {
            match manager.size_position(&signal(stop), &quote(), &spec, Magic(10_000)) {
                Ok(request) => {
                    let implied = spec.risk_of(request.volume, stop);
                    assert!(implied <= 50.0 * 1.1 + 1e-9, "risk {implied} for stop {stop}");
                    let steps = request.volume / spec.lot_step;
                    assert!((steps - steps.round()).abs() < 1e-6, "volume off step");
                    assert!(request.volume >= spec.min_lot - 1e-9);
                    assert!(request.volume <= spec.max_lot + 1e-9);
                }
                Err(RiskRejection::RiskExceedsBudget { .. }) => {}
                Err(other) => panic!("unexpected rejection: {other}"),
            }
        }
    }

    #[test]
    fn min_lot_clamp_that_over_risks_is_rejected() {
        // A huge stop distance forces the raw volume under the minimum lot;
        // the clamp up to 0.01 would imply far more than $50(1+10%).
        let manager = RiskManager::new(&config(), 10_000.0);
        let err = manager
            .size_position(&signal(1.0), &quote(), &spec(), Magic(10_000))
            .unwrap_err();
        assert!(matches!(err, RiskRejection::RiskExceedsBudget { .. }));
    }

    #[test]
    fn global_cap_blocks_sizing() {
        let manager = RiskManager::new(&config(), 10_000.0);
        let at = Utc.with_ymd_and_hms(2024, 6, 3, 11, 0, 0).unwrap();
        for i in 0..15 {
            manager.on_order_submitted(&Symbol::new(format!("SYM{i}")), Timeframe::M5, at);
        }
        let err = manager
            .size_position(&signal(0.0020), &quote(), &spec(), Magic(10_000))
            .unwrap_err();
        assert_eq!(err, RiskRejection::GlobalCapReached { open: 15, cap: 15 });
    }

    #[test]
    fn pair_cap_blocks_second_entry() {
        let manager = RiskManager::new(&config(), 10_000.0);
        let at = Utc.with_ymd_and_hms(2024, 6, 2, 12, 0, 0).unwrap();
        manager.on_order_submitted(&Symbol::new("EURUSD"), Timeframe::M5, at);
        let err = manager
            .size_position(&signal(0.0020), &quote(), &spec(), Magic(10_000))
            .unwrap_err();
        assert!(matches!(err, RiskRejection::PairCapReached { .. }));
    }

    #[test]
    fn trade_spacing_blocks_rapid_reentry() {
        let manager = RiskManager::new(&config(), 10_000.0);
        let symbol = Symbol::new("EURUSD");
        // Recent entry, then the slot frees up via close; spacing still binds.
        let at = Utc.with_ymd_and_hms(2024, 6, 3, 11, 50, 0).unwrap();
        manager.on_order_submitted(&symbol, Timeframe::M5, at);
        manager.on_close(&symbol, Timeframe::M5, -10.0);
        let err = manager
            .size_position(&signal(0.0020), &quote(), &spec(), Magic(10_000))
            .unwrap_err();
        assert_eq!(err, RiskRejection::TradeSpacing);
    }

    #[test]
    fn daily_loss_latches_until_new_day() {
        let manager = RiskManager::new(&config(), 10_000.0);
        // 5% daily loss on a 10k day start.
        manager.on_tick(9_500.0);
        assert_eq!(manager.halted(), Some(HaltReason::DailyLoss));
        let err = manager
            .size_position(&signal(0.0020), &quote(), &spec(), Magic(10_000))
            .unwrap_err();
        assert_eq!(err, RiskRejection::DailyLossBreached);

        // Recovery within the same day does not unlatch.
        manager.on_tick(9_900.0);
        assert_eq!(manager.halted(), Some(HaltReason::DailyLoss));

        manager.on_new_day();
        assert_eq!(manager.halted(), None);
        let snapshot = manager.snapshot();
        assert_eq!(snapshot.day_start_equity, 9_900.0);
        assert_eq!(snapshot.daily_pnl, 0.0);
        assert_eq!(snapshot.realized_daily_pnl, 0.0);
    }

    #[test]
    fn drawdown_halts_exactly_at_limit() {
        let manager = RiskManager::new(&config(), 10_000.0);
        manager.on_tick(12_000.0); // new peak
        // Bleed down across several days so each day stays inside the 5%
        // daily limit while the drawdown from the peak accumulates.
        for equity in [11_500.0, 11_100.0, 10_800.0] {
            manager.on_new_day();
            manager.on_tick(equity);
        }
        // Exactly 10% off the 12k peak.
        assert_eq!(manager.halted(), Some(HaltReason::Drawdown));
        let err = manager
            .size_position(&signal(0.0020), &quote(), &spec(), Magic(10_000))
            .unwrap_err();
        assert_eq!(err, RiskRejection::DrawdownBreached);

        // Equity recovering above the floor releases the drawdown halt.
        manager.on_new_day();
        manager.on_tick(11_000.0);
        assert_eq!(manager.halted(), None);
    }

    #[test]
    fn close_updates_realized_pnl_and_counts() {
        let manager = RiskManager::new(&config(), 10_000.0);
        let symbol = Symbol::new("EURUSD");
        let at = Utc.with_ymd_and_hms(2024, 6, 3, 9, 0, 0).unwrap();
        manager.on_order_submitted(&symbol, Timeframe::M5, at);
        assert_eq!(manager.snapshot().open_global, 1);
        manager.on_close(&symbol, Timeframe::M5, 125.0);
        let snapshot = manager.snapshot();
        assert_eq!(snapshot.open_global, 0);
        assert_eq!(snapshot.realized_daily_pnl, 125.0);
    }

    #[test]
    fn short_request_mirrors_prices() {
        let manager = RiskManager::new(&config(), 10_000.0);
        let mut sig = signal(0.0020);
        sig.direction = Direction::Short;
        let request = manager
            .size_position(&sig, &quote(), &spec(), Magic(10_001))
            .unwrap();
        // Entry 20 points above the bid.
        assert!((request.price - 1.1020).abs() < 1e-9);
        assert!((request.stop - 1.1040).abs() < 1e-9);
        assert!((request.target - 1.0920).abs() < 1e-9);
    }
}
