//! Polling-cycle orchestrator
//!
//! One cycle runs to completion before the next begins: equity mark, daily
//! reset, fill/close reconciliation, position management, then the gated
//! entry scan. The engine itself carries no strategy logic; it dispatches
//! between the components and emits order intents. Every external call is
//! bounded by a timeout and a timed-out call is a transient failure for that
//! pair only.

use crate::config::EngineConfig;
use crate::gateway::{BrokerPosition, ExecutionGateway, GatewayError, LimitOrderRequest};
use crate::indicators::IndicatorEngine;
use crate::journal::{TradeJournal, TradeRecord};
use crate::market::{Direction, MarketDataFeed, Magic, Symbol, SymbolSpec, Timeframe};
use crate::positions::{CloseReason, PositionAction, PositionManager, PositionStage};
use crate::risk::RiskManager;
use crate::session::SessionScheduler;
use crate::signals::SignalGenerator;
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Per-engine counters, cheap to clone out for observers.
#[derive(Default, Clone, Debug)]
pub struct EngineStatistics {
    pub cycles: u64,
    pub bars_processed: u64,
    pub signals_emitted: u64,
    pub orders_placed: u64,
    pub risk_rejections: u64,
    pub gateway_rejections: u64,
    pub feed_errors: u64,
    pub fills: u64,
    pub closes: u64,
    pub expiries: u64,
}

/// One (symbol, timeframe) processing slot with its config indices.
struct PairSlot {
    symbol: Symbol,
    timeframe: Timeframe,
}

pub struct TradingEngine {
    config: EngineConfig,
    feed: Arc<dyn MarketDataFeed>,
    gateway: Arc<dyn ExecutionGateway>,
    journal: Arc<dyn TradeJournal>,
    indicators: IndicatorEngine,
    signals: SignalGenerator,
    risk: RiskManager,
    positions: PositionManager,
    session: SessionScheduler,
    /// Scan order: shortest timeframe first, then config order. This is the
    /// deterministic tie-break when several timeframes of one symbol fire in
    /// the same cycle and the global cap admits only some of them.
    pairs: Vec<PairSlot>,
    magics: HashMap<(Symbol, Timeframe, Direction), Magic>,
    specs: DashMap<Symbol, SymbolSpec>,
    /// Close intents in flight, keyed by magic; suppresses duplicates until
    /// the close is confirmed by reconciliation.
    pending_closes: DashMap<Magic, CloseReason>,
    /// Last broker-reported floating profit per magic, used when a position
    /// disappears between cycles.
    last_profits: DashMap<Magic, f64>,
    last_trading_day: Mutex<Option<NaiveDate>>,
    feed_failures: AtomicU32,
    running: AtomicBool,
    stats: RwLock<EngineStatistics>,
    call_timeout: Duration,
}

impl TradingEngine {
    pub async fn new(
        config: EngineConfig,
        feed: Arc<dyn MarketDataFeed>,
        gateway: Arc<dyn ExecutionGateway>,
        journal: Arc<dyn TradeJournal>,
    ) -> Result<Self> {
        config.validate()?;
        let session = SessionScheduler::new(&config.session)?;
        let call_timeout = Duration::from_millis(config.call_timeout_ms);

        let equity = tokio::time::timeout(call_timeout, gateway.account_equity())
            .await
            .context("account equity query timed out at startup")?
            .context("account equity query failed at startup")?;
        info!(equity, "connected to execution gateway");

        let mut pairs = Vec::new();
        let mut magics = HashMap::new();
        for (symbol_index, symbol_config) in config.symbols.iter().enumerate() {
            for (timeframe_index, &timeframe) in config.timeframes.iter().enumerate() {
                let symbol = Symbol::new(&symbol_config.name);
                pairs.push(PairSlot {
                    symbol: symbol.clone(),
                    timeframe,
                });
                for direction in [Direction::Long, Direction::Short] {
                    magics.insert(
                        (symbol.clone(), timeframe, direction),
                        Magic::derive(config.base_magic, symbol_index, timeframe_index, direction),
                    );
                }
            }
        }
        pairs.sort_by_key(|slot| slot.timeframe.minutes());

        Ok(Self {
            indicators: IndicatorEngine::new(&config),
            signals: SignalGenerator::new(&config),
            risk: RiskManager::new(&config, equity),
            positions: PositionManager::new(&config),
            session,
            config,
            feed,
            gateway,
            journal,
            pairs,
            magics,
            specs: DashMap::new(),
            pending_closes: DashMap::new(),
            last_profits: DashMap::new(),
            last_trading_day: Mutex::new(None),
            feed_failures: AtomicU32::new(0),
            running: AtomicBool::new(false),
            stats: RwLock::new(EngineStatistics::default()),
            call_timeout,
        })
    }

    /// Run the polling loop until [`stop`](Self::stop) is called.
    pub async fn run(&self) {
        self.running.store(true, Ordering::SeqCst);
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.poll_interval_secs));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(pairs = self.pairs.len(), "trading engine started");

        while self.running.load(Ordering::SeqCst) {
            ticker.tick().await;
            self.run_cycle(Utc::now()).await;
        }
        info!("trading engine stopped");
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn stats(&self) -> EngineStatistics {
        self.stats.read().clone()
    }

    pub fn risk(&self) -> &RiskManager {
        &self.risk
    }

    pub fn positions(&self) -> &PositionManager {
        &self.positions
    }

    /// New entries are halted after too many consecutive feed failures;
    /// open positions keep being managed.
    pub fn feed_halted(&self) -> bool {
        self.feed_failures.load(Ordering::Relaxed) >= self.config.feed_fatal_after
    }

    /// One complete polling cycle. Cycles never overlap; the caller awaits
    /// completion before starting the next.
    pub async fn run_cycle(&self, now: DateTime<Utc>) {
        self.stats.write().cycles += 1;

        let equity = match self.call(self.gateway.account_equity()).await {
            Some(Ok(equity)) => equity,
            Some(Err(e)) => {
                warn!(error = %e, "equity query failed, skipping cycle");
                return;
            }
            None => {
                warn!("equity query timed out, skipping cycle");
                return;
            }
        };
        self.risk.on_tick(equity);

        if let Some(day) = self.session.trading_day(now) {
            let mut last = self.last_trading_day.lock();
            if *last != Some(day) {
                *last = Some(day);
                drop(last);
                self.risk.on_new_day();
            }
        }

        self.reconcile(now).await;
        self.manage_positions(now).await;
        self.scan_entries(now).await;
    }

    /// Compare the local position table against the broker's to detect
    /// fills and closes that happened between cycles.
    async fn reconcile(&self, now: DateTime<Utc>) {
        let broker = match self.call(self.gateway.open_positions()).await {
            Some(Ok(list)) => list,
            Some(Err(e)) => {
                warn!(error = %e, "open positions query failed");
                return;
            }
            None => {
                warn!("open positions query timed out");
                return;
            }
        };
        let by_magic: HashMap<Magic, &BrokerPosition> =
            broker.iter().map(|p| (p.magic, p)).collect();

        for position in self.positions.live_positions() {
            let magic = position.magic;
            match position.stage {
                PositionStage::Pending { .. } => {
                    if let Some(broker_position) = by_magic.get(&magic) {
                        self.positions
                            .on_fill(magic, broker_position.entry_price, broker_position.opened_at);
                        self.risk.on_fill(magic, broker_position.entry_price);
                        self.last_profits.insert(magic, broker_position.profit);
                        self.stats.write().fills += 1;
                        if let Some(filled) = self.positions.get(magic) {
                            self.journal_append(TradeRecord::fill(
                                &filled,
                                broker_position.opened_at,
                                &self.config.journal.comment,
                            ));
                        }
                        info!(%magic, price = broker_position.entry_price, "pending order filled");
                    }
                }
                PositionStage::Open | PositionStage::Trailing(_) => {
                    match by_magic.get(&magic) {
                        Some(broker_position) => {
                            self.last_profits.insert(magic, broker_position.profit);
                        }
                        None => {
                            let profit = self
                                .last_profits
                                .remove(&magic)
                                .map(|(_, p)| p)
                                .unwrap_or(0.0);
                            let reason = self
                                .pending_closes
                                .remove(&magic)
                                .map(|(_, r)| r)
                                .unwrap_or(CloseReason::Manual);
                            if let Some(closed) = self.positions.on_closed(magic, reason) {
                                self.risk
                                    .on_close(&closed.symbol, closed.timeframe, profit);
                                self.stats.write().closes += 1;
                                self.journal_append(TradeRecord::close(
                                    &closed,
                                    now,
                                    profit,
                                    &self.config.journal.comment,
                                ));
                                info!(%magic, profit, reason = ?reason, "position closed");
                            }
                        }
                    }
                }
                _ => {}
            }
        }
    }

    /// Advance every tracked position and emit the resulting intents.
    async fn manage_positions(&self, now: DateTime<Utc>) {
        for position in self.positions.live_positions() {
            let magic = position.magic;
            let quote = match self.call(self.feed.latest_quote(&position.symbol)).await {
                Some(Ok(quote)) => quote,
                Some(Err(e)) => {
                    debug!(symbol = %position.symbol, error = %e, "no quote for position");
                    continue;
                }
                None => continue,
            };
            self.indicators.observe_quote(&quote);

            let price = quote.exit_side(position.direction);
            let atr = self
                .indicators
                .current_range(&position.symbol, position.timeframe);

            match self.positions.advance(magic, price, atr, now) {
                PositionAction::Hold => {}
                PositionAction::ModifyStop { stop } => {
                    match self
                        .call(self.gateway.modify_order(position.order_id, Some(stop), None))
                        .await
                    {
                        Some(Ok(())) => {
                            self.positions.commit_stop(magic, stop);
                            info!(%magic, stop, "trailing stop advanced");
                        }
                        Some(Err(e)) => {
                            self.note_gateway_error(&e, "stop modification");
                        }
                        None => warn!(%magic, "stop modification timed out"),
                    }
                }
                PositionAction::Close(reason) => {
                    if self.pending_closes.contains_key(&magic) {
                        continue;
                    }
                    match self.call(self.gateway.close_position(magic)).await {
                        Some(Ok(())) => {
                            self.pending_closes.insert(magic, reason);
                            info!(%magic, reason = ?reason, "close requested");
                        }
                        Some(Err(e)) => self.note_gateway_error(&e, "position close"),
                        None => warn!(%magic, "position close timed out"),
                    }
                }
                PositionAction::Expire => {
                    let gone = match self.call(self.gateway.cancel_order(position.order_id)).await
                    {
                        Some(Ok(())) => true,
                        // Already lapsed at the broker; clean up locally.
                        Some(Err(GatewayError::UnknownOrder(_))) => true,
                        Some(Err(e)) => {
                            self.note_gateway_error(&e, "order cancel");
                            false
                        }
                        None => {
                            warn!(%magic, "order cancel timed out");
                            false
                        }
                    };
                    if gone {
                        self.positions.on_cancelled(magic);
                        self.risk
                            .on_order_cancelled(&position.symbol, position.timeframe);
                        self.stats.write().expiries += 1;
                        info!(%magic, order = %position.order_id, "pending order expired");
                    }
                }
            }
        }
    }

    /// Pull new bars, advance indicators and, when every gate is open, turn
    /// signals into risk-sized limit orders.
    async fn scan_entries(&self, now: DateTime<Utc>) {
        let session_open = self.session.is_trading_permitted(now);
        let risk_halt = self.risk.halted();

        for slot in &self.pairs {
            let bar = match self
                .call(self.feed.latest_closed_bar(&slot.symbol, slot.timeframe))
                .await
            {
                Some(Ok(bar)) => {
                    self.feed_failures.store(0, Ordering::Relaxed);
                    bar
                }
                Some(Err(e)) if e.is_transient() => {
                    self.note_feed_failure();
                    debug!(symbol = %slot.symbol, timeframe = %slot.timeframe, error = %e, "bar unavailable");
                    continue;
                }
                Some(Err(e)) => {
                    self.note_feed_failure();
                    warn!(symbol = %slot.symbol, timeframe = %slot.timeframe, error = %e, "feed error");
                    continue;
                }
                None => {
                    self.note_feed_failure();
                    continue;
                }
            };

            // Indicators advance on every new bar, even while entries are
            // gated, so warm state is ready the moment trading resumes.
            let snapshot = match self.indicators.update(&bar) {
                Some(snapshot) => snapshot,
                None => continue,
            };
            self.stats.write().bars_processed += 1;

            if !session_open {
                continue;
            }
            if let Some(reason) = risk_halt {
                debug!(reason = ?reason, "entries halted by risk state");
                continue;
            }
            if self.feed_halted() {
                warn!("entries halted after repeated feed failures");
                continue;
            }

            let quote = match self.call(self.feed.latest_quote(&slot.symbol)).await {
                Some(Ok(quote)) => quote,
                _ => continue,
            };
            self.indicators.observe_quote(&quote);

            let signal = match self.signals.evaluate(&snapshot, quote.spread()) {
                Some(signal) => signal,
                None => continue,
            };
            self.stats.write().signals_emitted += 1;

            let magic = self.magics[&(slot.symbol.clone(), slot.timeframe, signal.direction)];
            // Idempotence gate: one live order or position per magic.
            if self.positions.is_live(magic) || self.pending_closes.contains_key(&magic) {
                debug!(%magic, "intent suppressed, slot already in flight");
                continue;
            }

            let spec = match self.spec_for(&slot.symbol).await {
                Some(spec) => spec,
                None => continue,
            };

            let request = match self.risk.size_position(&signal, &quote, &spec, magic) {
                Ok(request) => request,
                Err(rejection) => {
                    info!(symbol = %slot.symbol, timeframe = %slot.timeframe, %rejection, "trade rejected");
                    self.stats.write().risk_rejections += 1;
                    continue;
                }
            };

            self.submit_entry(request, now).await;
        }
    }

    async fn submit_entry(&self, request: LimitOrderRequest, now: DateTime<Utc>) {
        match self.call(self.gateway.place_limit_order(&request)).await {
            Some(Ok(order_id)) => {
                self.positions.track_pending(&request, order_id);
                self.risk
                    .on_order_submitted(&request.symbol, request.timeframe, now);
                self.stats.write().orders_placed += 1;
                info!(
                    symbol = %request.symbol,
                    timeframe = %request.timeframe,
                    direction = %request.direction,
                    volume = request.volume,
                    price = request.price,
                    magic = %request.magic,
                    order = %order_id,
                    "limit order placed"
                );
            }
            Some(Err(e)) => self.note_gateway_error(&e, "order placement"),
            None => warn!(symbol = %request.symbol, "order placement timed out"),
        }
    }

    async fn spec_for(&self, symbol: &Symbol) -> Option<SymbolSpec> {
        if let Some(spec) = self.specs.get(symbol) {
            return Some(spec.clone());
        }
        match self.call(self.feed.symbol_spec(symbol)).await {
            Some(Ok(spec)) => {
                self.specs.insert(symbol.clone(), spec.clone());
                Some(spec)
            }
            Some(Err(e)) => {
                warn!(%symbol, error = %e, "symbol spec unavailable");
                None
            }
            None => None,
        }
    }

    fn note_feed_failure(&self) {
        let failures = self.feed_failures.fetch_add(1, Ordering::Relaxed) + 1;
        self.stats.write().feed_errors += 1;
        if failures == self.config.feed_fatal_after {
            warn!(failures, "feed considered down, halting new entries");
        }
    }

    fn note_gateway_error(&self, error: &GatewayError, what: &str) {
        if error.is_transient() {
            warn!(error = %error, "{what} failed, retrying next cycle");
        } else {
            warn!(error = %error, "{what} rejected");
            self.stats.write().gateway_rejections += 1;
        }
    }

    fn journal_append(&self, record: TradeRecord) {
        if let Err(e) = self.journal.append(&record) {
            warn!(error = %e, "journal append failed");
        }
    }

    async fn call<T>(&self, future: impl Future<Output = T>) -> Option<T> {
        tokio::time::timeout(self.call_timeout, future).await.ok()
    }
}
