//! Engine configuration
//!
//! One immutable `EngineConfig` is loaded from TOML at startup, validated
//! once, and passed into every component by reference. Nothing reads
//! configuration after construction.

use crate::market::{InstrumentClass, Timeframe};
use chrono::Weekday;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

fn ensure(cond: bool, message: impl Into<String>) -> Result<(), ConfigError> {
    if cond {
        Ok(())
    } else {
        Err(ConfigError::Invalid(message.into()))
    }
}

/// Per-symbol strategy overrides. Every field has a global default, so a
/// symbol entry only needs the values it changes.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SymbolSettings {
    pub stop_atr_factor: f64,
    pub min_gap_pct: f64,
    pub fast_range_period: usize,
    pub slow_range_period: usize,
    pub osc_upper: f64,
    pub osc_lower: f64,
    pub trailing_atr_factor: f64,
}

impl Default for SymbolSettings {
    fn default() -> Self {
        Self {
            stop_atr_factor: 1.5,
            min_gap_pct: 0.6,
            fast_range_period: 10,
            slow_range_period: 20,
            osc_upper: 70.0,
            osc_lower: 30.0,
            trailing_atr_factor: 1.0,
        }
    }
}

fn default_class() -> InstrumentClass {
    InstrumentClass::Forex
}

/// One tradable instrument.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SymbolConfig {
    pub name: String,
    #[serde(default = "default_class")]
    pub class: InstrumentClass,
    #[serde(flatten)]
    pub settings: SymbolSettings,
}

/// Entry-rule and order-placement parameters shared across symbols.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    pub slow_ma_period: usize,
    pub fast_ma_period: usize,
    pub osc_period: usize,
    pub allow_long: bool,
    pub allow_short: bool,
    pub min_bars_between_trades: u32,
    /// Limit entry offset from the touch price, in points.
    pub limit_order_offset_points: f64,
    pub order_expiration_bars: u32,
    pub max_spread_multiplier: f64,
    /// Smoothing period of the rolling average-spread estimate.
    pub spread_avg_period: usize,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            slow_ma_period: 360,
            fast_ma_period: 20,
            osc_period: 20,
            allow_long: true,
            allow_short: true,
            min_bars_between_trades: 5,
            limit_order_offset_points: 20.0,
            order_expiration_bars: 5,
            max_spread_multiplier: 3.0,
            spread_avg_period: 50,
        }
    }
}

/// Capital-preservation limits.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Fixed account-currency risk per trade.
    pub risk_per_trade: f64,
    pub risk_reward_ratio: f64,
    pub max_global_trades: usize,
    pub max_trades_per_pair: usize,
    pub daily_loss_percent: f64,
    pub max_drawdown_percent: f64,
    pub min_lot: f64,
    pub max_allowed_lot: f64,
    /// Tolerated overshoot of the per-trade risk after lot rounding, in
    /// percent of `risk_per_trade`.
    pub risk_tolerance_pct: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            risk_per_trade: 50.0,
            risk_reward_ratio: 5.0,
            max_global_trades: 15,
            max_trades_per_pair: 1,
            daily_loss_percent: 5.0,
            max_drawdown_percent: 10.0,
            min_lot: 0.01,
            max_allowed_lot: 1.0,
            risk_tolerance_pct: 10.0,
        }
    }
}

/// Weekly trading window in a fixed reference timezone.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub enabled: bool,
    /// IANA timezone name, e.g. "Africa/Lagos".
    pub timezone: String,
    pub open_weekday: String,
    pub open_hour: u32,
    pub open_minute: u32,
    pub close_weekday: String,
    pub close_hour: u32,
    pub close_minute: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            timezone: "Africa/Lagos".to_string(),
            open_weekday: "sunday".to_string(),
            open_hour: 22,
            open_minute: 15,
            close_weekday: "friday".to_string(),
            close_hour: 21,
            close_minute: 45,
        }
    }
}

impl SessionConfig {
    pub fn open_weekday(&self) -> Result<Weekday, ConfigError> {
        Weekday::from_str(&self.open_weekday)
            .map_err(|_| ConfigError::Invalid(format!("bad open weekday: {}", self.open_weekday)))
    }

    pub fn close_weekday(&self) -> Result<Weekday, ConfigError> {
        Weekday::from_str(&self.close_weekday)
            .map_err(|_| ConfigError::Invalid(format!("bad close weekday: {}", self.close_weekday)))
    }
}

/// Trade journal sink.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalConfig {
    pub enabled: bool,
    pub path: String,
    /// Free-text comment attached to every order.
    pub comment: String,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: "TradeJournal.csv".to_string(),
            comment: "gaprev gap mean reversion".to_string(),
        }
    }
}

/// Root configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_base_magic")]
    pub base_magic: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Per-external-call timeout; a stalled feed or gateway call must not
    /// block bookkeeping for other pairs.
    #[serde(default = "default_call_timeout")]
    pub call_timeout_ms: u64,
    /// Consecutive feed failures before new entries are halted.
    #[serde(default = "default_feed_fatal")]
    pub feed_fatal_after: u32,
    pub symbols: Vec<SymbolConfig>,
    pub timeframes: Vec<Timeframe>,
    #[serde(default)]
    pub strategy: StrategyConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub journal: JournalConfig,
}

fn default_base_magic() -> u64 {
    10_000
}

fn default_poll_interval() -> u64 {
    5
}

fn default_call_timeout() -> u64 {
    2_000
}

fn default_feed_fatal() -> u32 {
    20
}

impl EngineConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn settings_for(&self, symbol: &str) -> Option<&SymbolConfig> {
        self.symbols.iter().find(|s| s.name == symbol)
    }

    /// Every check fails fast with the offending field named; nothing is
    /// silently defaulted past this point.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure(!self.symbols.is_empty(), "symbols list is empty")?;
        ensure(!self.timeframes.is_empty(), "timeframes list is empty")?;
        ensure(self.poll_interval_secs > 0, "poll_interval_secs must be positive")?;
        ensure(self.call_timeout_ms > 0, "call_timeout_ms must be positive")?;
        ensure(self.feed_fatal_after > 0, "feed_fatal_after must be positive")?;

        for sym in &self.symbols {
            ensure(!sym.name.is_empty(), "symbol name is empty")?;
            ensure(
                self.symbols.iter().filter(|s| s.name == sym.name).count() == 1,
                format!("duplicate symbol entry: {}", sym.name),
            )?;
            let s = &sym.settings;
            ensure(
                s.stop_atr_factor > 0.0,
                format!("{}: stop_atr_factor must be positive", sym.name),
            )?;
            ensure(
                s.trailing_atr_factor > 0.0,
                format!("{}: trailing_atr_factor must be positive", sym.name),
            )?;
            ensure(
                s.min_gap_pct > 0.0,
                format!("{}: min_gap_pct must be positive", sym.name),
            )?;
            ensure(
                s.fast_range_period > 0 && s.slow_range_period > 0,
                format!("{}: range periods must be positive", sym.name),
            )?;
            ensure(
                s.osc_lower < s.osc_upper,
                format!("{}: osc_lower must be below osc_upper", sym.name),
            )?;
        }

        let st = &self.strategy;
        ensure(
            st.slow_ma_period > st.fast_ma_period,
            "slow_ma_period must exceed fast_ma_period",
        )?;
        ensure(st.fast_ma_period > 0, "fast_ma_period must be positive")?;
        ensure(st.osc_period > 0, "osc_period must be positive")?;
        ensure(st.spread_avg_period > 0, "spread_avg_period must be positive")?;
        ensure(st.order_expiration_bars > 0, "order_expiration_bars must be positive")?;
        ensure(st.max_spread_multiplier > 0.0, "max_spread_multiplier must be positive")?;
        ensure(
            st.allow_long || st.allow_short,
            "at least one of allow_long/allow_short must be enabled",
        )?;

        let r = &self.risk;
        ensure(r.risk_per_trade > 0.0, "risk_per_trade must be positive")?;
        ensure(r.risk_reward_ratio > 0.0, "risk_reward_ratio must be positive")?;
        ensure(r.max_global_trades > 0, "max_global_trades must be positive")?;
        ensure(r.max_trades_per_pair > 0, "max_trades_per_pair must be positive")?;
        ensure(
            r.daily_loss_percent > 0.0 && r.daily_loss_percent < 100.0,
            "daily_loss_percent must be in (0, 100)",
        )?;
        ensure(
            r.max_drawdown_percent > 0.0 && r.max_drawdown_percent < 100.0,
            "max_drawdown_percent must be in (0, 100)",
        )?;
        ensure(r.min_lot > 0.0, "min_lot must be positive")?;
        ensure(
            r.max_allowed_lot >= r.min_lot,
            "max_allowed_lot must be at least min_lot",
        )?;
        ensure(r.risk_tolerance_pct >= 0.0, "risk_tolerance_pct must not be negative")?;

        let se = &self.session;
        ensure(
            se.timezone.parse::<chrono_tz::Tz>().is_ok(),
            format!("unknown timezone: {}", se.timezone),
        )?;
        se.open_weekday()?;
        se.close_weekday()?;
        ensure(
            se.open_hour < 24 && se.close_hour < 24,
            "session hours must be below 24",
        )?;
        ensure(
            se.open_minute < 60 && se.close_minute < 60,
            "session minutes must be below 60",
        )?;

        if self.journal.enabled {
            ensure(!self.journal.path.is_empty(), "journal path is empty")?;
        }
        Ok(())
    }
}
