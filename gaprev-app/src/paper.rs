//! In-process paper feed and gateway
//!
//! Stands in for the brokerage when no live adapter is wired up. Prices are
//! a deterministic function of wall-clock bar index per symbol, so dry runs
//! are reproducible; order handling mirrors a broker's limit/stop/target
//! mechanics closely enough to exercise the whole engine.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use gaprev_core::{
    Bar, BrokerPosition, Direction, ExecutionGateway, FeedError, GatewayError, InstrumentClass,
    LimitOrderRequest, Magic, MarketDataFeed, OrderId, Quote, Symbol, SymbolSpec, Timeframe,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

fn mix(symbol: &Symbol, n: i64) -> u64 {
    // splitmix64 over the symbol hash and bar index.
    let mut x = n as u64 ^ symbol
        .as_str()
        .bytes()
        .fold(0xcbf2_9ce4_8422_2325u64, |h, b| {
            (h ^ b as u64).wrapping_mul(0x100_0000_01b3)
        });
    x = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}

/// Deterministic synthetic price feed: a slow triangle drift around a base
/// price with per-bar jitter.
pub struct PaperFeed {
    base_price: f64,
}

impl PaperFeed {
    pub fn new(base_price: f64) -> Self {
        Self { base_price }
    }

    fn close_at(&self, symbol: &Symbol, index: i64) -> f64 {
        let phase = (index.rem_euclid(240) - 120).abs() as f64 / 120.0; // 0..1 triangle
        let jitter = (mix(symbol, index) % 2000) as f64 / 1000.0 - 1.0; // -1..1
        self.base_price * (1.0 - 0.012 * phase + 0.0004 * jitter)
    }

    fn bar_index(&self, timeframe: Timeframe, now: DateTime<Utc>) -> i64 {
        // Last *closed* bar.
        now.timestamp() / (timeframe.minutes() * 60) - 1
    }

    fn quote_at(&self, symbol: &Symbol, now: DateTime<Utc>) -> Quote {
        let index = now.timestamp() / 60;
        let mid = self.close_at(symbol, index);
        let half_spread = self.base_price * 0.00005;
        Quote {
            symbol: symbol.clone(),
            bid: mid - half_spread,
            ask: mid + half_spread,
            timestamp: now,
        }
    }
}

#[async_trait]
impl MarketDataFeed for PaperFeed {
    async fn latest_closed_bar(
        &self,
        symbol: &Symbol,
        timeframe: Timeframe,
    ) -> Result<Bar, FeedError> {
        let now = Utc::now();
        let index = self.bar_index(timeframe, now);
        let close = self.close_at(symbol, index);
        let open = self.close_at(symbol, index - 1);
        let range = self.base_price * 0.0006;
        Ok(Bar {
            symbol: symbol.clone(),
            timeframe,
            open,
            high: open.max(close) + range,
            low: open.min(close) - range,
            close,
            volume: 1_000.0,
            timestamp: Utc
                .timestamp_opt((index + 1) * timeframe.minutes() * 60, 0)
                .single()
                .unwrap_or(now),
        })
    }

    async fn latest_quote(&self, symbol: &Symbol) -> Result<Quote, FeedError> {
        Ok(self.quote_at(symbol, Utc::now()))
    }

    async fn symbol_spec(&self, symbol: &Symbol) -> Result<SymbolSpec, FeedError> {
        Ok(SymbolSpec {
            symbol: symbol.clone(),
            point: self.base_price * 1e-5,
            point_value_per_lot: 1.0,
            lot_step: 0.01,
            min_lot: 0.01,
            max_lot: 5.0,
            class: InstrumentClass::Forex,
        })
    }
}

struct PaperOrder {
    id: OrderId,
    request: LimitOrderRequest,
}

struct PaperPosition {
    magic: Magic,
    order_id: OrderId,
    symbol: Symbol,
    direction: Direction,
    volume: f64,
    entry_price: f64,
    stop: f64,
    target: f64,
    point: f64,
    point_value_per_lot: f64,
    opened_at: DateTime<Utc>,
}

impl PaperPosition {
    fn profit_at(&self, exit_price: f64) -> f64 {
        let sign = self.direction.sign();
        sign * (exit_price - self.entry_price) / self.point * self.point_value_per_lot
            * self.volume
    }
}

/// Paper execution gateway: fills limit orders when the touch price crosses
/// them and closes positions on stop/target crossings, marking equity to
/// market from the paper feed.
pub struct PaperGateway {
    feed: Arc<PaperFeed>,
    balance: Mutex<f64>,
    orders: DashMap<Magic, PaperOrder>,
    positions: DashMap<Magic, PaperPosition>,
    next_id: AtomicU64,
}

impl PaperGateway {
    pub fn new(feed: Arc<PaperFeed>, starting_balance: f64) -> Self {
        Self {
            feed,
            balance: Mutex::new(starting_balance),
            orders: DashMap::new(),
            positions: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    fn realize(&self, position: &PaperPosition, exit_price: f64) {
        *self.balance.lock() += position.profit_at(exit_price);
    }

    /// Fill crossed limit orders and run broker-side stop/target exits.
    fn settle(&self, now: DateTime<Utc>) {
        let mut fills = Vec::new();
        for entry in self.orders.iter() {
            let request = &entry.value().request;
            let quote = self.feed.quote_at(&request.symbol, now);
            let crossed = match request.direction {
                Direction::Long => quote.ask <= request.price,
                Direction::Short => quote.bid >= request.price,
            };
            if crossed {
                fills.push(request.magic);
            } else if now >= request.expires_at {
                fills.push(request.magic); // lapse silently, engine cancels too
            }
        }
        for magic in fills {
            if let Some((_, order)) = self.orders.remove(&magic) {
                let request = order.request;
                let quote = self.feed.quote_at(&request.symbol, now);
                let crossed = match request.direction {
                    Direction::Long => quote.ask <= request.price,
                    Direction::Short => quote.bid >= request.price,
                };
                if !crossed {
                    continue; // expired unfilled
                }
                let spec_point = self.feed.base_price * 1e-5;
                self.positions.insert(
                    magic,
                    PaperPosition {
                        magic,
                        order_id: order.id,
                        symbol: request.symbol.clone(),
                        direction: request.direction,
                        volume: request.volume,
                        entry_price: request.price,
                        stop: request.stop,
                        target: request.target,
                        point: spec_point,
                        point_value_per_lot: 1.0,
                        opened_at: now,
                    },
                );
            }
        }

        let mut exits = Vec::new();
        for entry in self.positions.iter() {
            let position = entry.value();
            let quote = self.feed.quote_at(&position.symbol, now);
            let price = quote.exit_side(position.direction);
            let sign = position.direction.sign();
            if sign * (price - position.stop) <= 0.0 || sign * (price - position.target) >= 0.0 {
                exits.push((position.magic, price));
            }
        }
        for (magic, price) in exits {
            if let Some((_, position)) = self.positions.remove(&magic) {
                self.realize(&position, price);
            }
        }
    }
}

#[async_trait]
impl ExecutionGateway for PaperGateway {
    async fn place_limit_order(
        &self,
        request: &LimitOrderRequest,
    ) -> Result<OrderId, GatewayError> {
        if self.orders.contains_key(&request.magic) || self.positions.contains_key(&request.magic)
        {
            return Err(GatewayError::Rejected {
                reason: format!("magic {} already in use", request.magic),
            });
        }
        let id = OrderId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.orders.insert(
            request.magic,
            PaperOrder {
                id,
                request: request.clone(),
            },
        );
        Ok(id)
    }

    async fn modify_order(
        &self,
        id: OrderId,
        stop: Option<f64>,
        target: Option<f64>,
    ) -> Result<(), GatewayError> {
        for mut entry in self.positions.iter_mut() {
            if entry.value().order_id != id {
                continue;
            }
            let position = entry.value_mut();
            if let Some(stop) = stop {
                position.stop = stop;
            }
            if let Some(target) = target {
                position.target = target;
            }
            return Ok(());
        }
        for mut entry in self.orders.iter_mut() {
            if entry.value().id != id {
                continue;
            }
            let request = &mut entry.value_mut().request;
            if let Some(stop) = stop {
                request.stop = stop;
            }
            if let Some(target) = target {
                request.target = target;
            }
            return Ok(());
        }
        Err(GatewayError::UnknownOrder(id))
    }

    async fn cancel_order(&self, id: OrderId) -> Result<(), GatewayError> {
        let magic = self
            .orders
            .iter()
            .find(|entry| entry.value().id == id)
            .map(|entry| *entry.key());
        match magic {
            Some(magic) => {
                self.orders.remove(&magic);
                Ok(())
            }
            None => Err(GatewayError::UnknownOrder(id)),
        }
    }

    async fn close_position(&self, magic: Magic) -> Result<(), GatewayError> {
        let now = Utc::now();
        if let Some((_, position)) = self.positions.remove(&magic) {
            let quote = self.feed.quote_at(&position.symbol, now);
            let price = quote.exit_side(position.direction);
            self.realize(&position, price);
        }
        Ok(())
    }

    async fn account_equity(&self) -> Result<f64, GatewayError> {
        let now = Utc::now();
        self.settle(now);
        let mut equity = *self.balance.lock();
        for entry in self.positions.iter() {
            let position = entry.value();
            let quote = self.feed.quote_at(&position.symbol, now);
            equity += position.profit_at(quote.exit_side(position.direction));
        }
        Ok(equity)
    }

    async fn open_positions(&self) -> Result<Vec<BrokerPosition>, GatewayError> {
        let now = Utc::now();
        self.settle(now);
        Ok(self
            .positions
            .iter()
            .map(|entry| {
                let position = entry.value();
                let quote = self.feed.quote_at(&position.symbol, now);
                BrokerPosition {
                    magic: position.magic,
                    symbol: position.symbol.clone(),
                    direction: position.direction,
                    volume: position.volume,
                    entry_price: position.entry_price,
                    profit: position.profit_at(quote.exit_side(position.direction)),
                    opened_at: position.opened_at,
                }
            })
            .collect())
    }
}
