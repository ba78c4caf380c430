//! Interactive Brokers gateway (TWS / IB Gateway)
//!
//! The ibapi client is synchronous and its subscriptions borrow the client,
//! so every stream runs on its own thread holding an `Arc<Client>`. Ticks
//! land in the shared `PriceCache`, order status in the shared `FillBook`.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use ibapi::contracts::tick_types::TickType;
use ibapi::contracts::Contract;
use ibapi::market_data::historical::{BarSize, ToDuration, WhatToShow};
use ibapi::market_data::realtime::TickTypes;
use ibapi::orders::{order_builder, Action, Order, PlaceOrder};
use ibapi::Client;

use super::config::{IbConfig, TradingConfig};
use super::fills::{FillBook, FillOutcome};
use super::gateway::{BrokerGateway, HistoricalBar, HistoryRequest};
use super::order::{Fill, OrderKind, OrderSpec, OrderStatus};
use super::price_cache::PriceCache;
use crate::vision::Direction;

const FILL_POLL_FLOOR: Duration = Duration::from_millis(10);

pub fn stock_contract(symbol: &str) -> Contract {
    Contract::stock(symbol)
}

fn ib_action(direction: Direction) -> Action {
    match direction {
        Direction::Buy => Action::Buy,
        Direction::Sell => Action::Sell,
    }
}

fn ib_order(spec: &OrderSpec) -> Order {
    let quantity = spec.quantity as f64;
    let mut order = match (spec.kind, spec.limit_price) {
        (OrderKind::Limit, Some(price)) => order_builder::limit_order(ib_action(spec.action), quantity, price),
        _ => order_builder::market_order(ib_action(spec.action), quantity),
    };
    order.tif = spec.time_in_force.clone();
    order.outside_rth = spec.outside_rth;
    order
}

/// Last prints always update the cache; close only until a trade prints
fn takes_price(tick_type: &TickType, have_last: &mut bool) -> bool {
    match tick_type {
        TickType::Last | TickType::DelayedLast => {
            *have_last = true;
            true
        }
        TickType::Close | TickType::DelayedClose => !*have_last,
        _ => false,
    }
}

fn bar_size(minutes: u32) -> BarSize {
    match minutes {
        0 | 1 => BarSize::Min,
        2 => BarSize::Min2,
        3 => BarSize::Min3,
        4 | 5 => BarSize::Min5,
        6..=15 => BarSize::Min15,
        16..=20 => BarSize::Min20,
        21..=30 => BarSize::Min30,
        _ => BarSize::Hour,
    }
}

pub struct IbGateway {
    client: Arc<Client>,
    prices: PriceCache,
    fills: FillBook,
    config: TradingConfig,
    streaming: Mutex<HashSet<String>>,
    shutdown: Arc<AtomicBool>,
}

impl IbGateway {
    /// Connect to TWS / IB Gateway, bounded by `ib.connect_timeout`
    pub async fn connect(ib: IbConfig, prices: PriceCache, config: TradingConfig) -> Result<Self> {
        let address = ib.address();
        let client_id = ib.client_id;
        info!("Connecting to IB at {} (client id {})...", address, client_id);

        let connecting = tokio::task::spawn_blocking(move || Client::connect(&address, client_id));
        let client = tokio::time::timeout(ib.connect_timeout, connecting)
            .await
            .map_err(|_| anyhow!("IB connection timed out after {:?}", ib.connect_timeout))?
            .context("IB connect task panicked")?
            .context("Failed to connect to IB TWS/Gateway. Make sure TWS or IB Gateway is running.")?;

        info!("Connected to IB");
        Ok(Self {
            client: Arc::new(client),
            prices,
            fills: FillBook::new(),
            config,
            streaming: Mutex::new(HashSet::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn price_cache(&self) -> &PriceCache {
        &self.prices
    }

    fn start_stream(&self, symbol: &str) -> Result<()> {
        let client = Arc::clone(&self.client);
        let prices = self.prices.clone();
        let shutdown = Arc::clone(&self.shutdown);
        let symbol = symbol.to_string();

        std::thread::Builder::new()
            .name(format!("ib-ticks-{}", symbol))
            .spawn(move || {
                let contract = stock_contract(&symbol);
                let subscription = match client.market_data(&contract, &[], false, false) {
                    Ok(subscription) => subscription,
                    Err(e) => {
                        error!(symbol = %symbol, error = %e, "market data subscription failed");
                        return;
                    }
                };
                info!(symbol = %symbol, "streaming market data");

                let mut have_last = false;
                for tick in subscription {
                    if shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    let TickTypes::Price(tick) = tick else {
                        continue;
                    };
                    if takes_price(&tick.tick_type, &mut have_last) {
                        prices.set(&symbol, tick.price);
                    }
                }
                debug!(symbol = %symbol, "market data stream ended");
            })
            .context("Failed to spawn market data thread")?;
        Ok(())
    }

    /// Place the order on a dedicated thread that then follows its status
    /// updates into the fill book.
    async fn place(&self, order_id: i32, symbol: &str, spec: &OrderSpec) -> Result<()> {
        let client = Arc::clone(&self.client);
        let fills = self.fills.clone();
        let contract = stock_contract(symbol);
        let order = ib_order(spec);
        let symbol = symbol.to_string();
        let (placed_tx, placed_rx) = oneshot::channel::<Result<()>>();

        std::thread::Builder::new()
            .name(format!("ib-order-{}", order_id))
            .spawn(move || {
                let subscription = match client.place_order(order_id, &contract, &order) {
                    Ok(subscription) => {
                        let _ = placed_tx.send(Ok(()));
                        subscription
                    }
                    Err(e) => {
                        let _ = placed_tx.send(Err(anyhow!("place_order failed: {}", e)));
                        return;
                    }
                };

                for event in subscription {
                    let PlaceOrder::OrderStatus(update) = event else {
                        continue;
                    };
                    let status = OrderStatus::parse(&update.status);
                    debug!(order_id, symbol = %symbol, %status, filled = update.filled, remaining = update.remaining, "order status");
                    if status == OrderStatus::Filled && update.filled > 0.0 {
                        fills.record_fill(
                            order_id,
                            Fill {
                                filled_quantity: update.filled,
                                avg_fill_price: update.average_fill_price,
                                last_fill_price: update.last_fill_price,
                                fill_time: Utc::now(),
                                status,
                            },
                        );
                        break;
                    }
                    let terminal = status.is_rejection();
                    fills.record_status(order_id, status);
                    if terminal {
                        break;
                    }
                }
                fills.settle(order_id);
            })
            .context("Failed to spawn order thread")?;

        placed_rx.await.context("order thread exited before placing")?
    }
}

#[async_trait]
impl BrokerGateway for IbGateway {
    fn name(&self) -> &'static str {
        "ib"
    }

    async fn subscribe_price_stream(&self, symbols: &[String]) -> Result<()> {
        for symbol in symbols {
            let fresh = match self.streaming.lock() {
                Ok(mut streaming) => streaming.insert(symbol.clone()),
                Err(_) => bail!("stream registry poisoned"),
            };
            if fresh {
                self.start_stream(symbol)?;
            }
        }
        Ok(())
    }

    fn cached_price(&self, symbol: &str) -> Option<f64> {
        self.prices.get(symbol)
    }

    async fn fetch_recent_bars(&self, symbol: &str, request: HistoryRequest) -> Result<Vec<HistoricalBar>> {
        let client = Arc::clone(&self.client);
        let contract = stock_contract(symbol);
        let use_rth = !request.extended_hours;
        let days = request.days.max(1) as i32;
        let size = bar_size(request.bar_minutes);

        let fetching = tokio::task::spawn_blocking(move || {
            client
                .historical_data(&contract, None, days.days(), size, WhatToShow::Trades, use_rth)
                .map(|data| {
                    data.bars
                        .iter()
                        .map(|bar| HistoricalBar {
                            timestamp: DateTime::from_timestamp(bar.date.unix_timestamp(), bar.date.nanosecond())
                                .unwrap_or_else(Utc::now),
                            open: bar.open,
                            high: bar.high,
                            low: bar.low,
                            close: bar.close,
                            volume: bar.volume,
                        })
                        .collect::<Vec<_>>()
                })
        });

        let bars = tokio::time::timeout(self.config.history_timeout, fetching)
            .await
            .map_err(|_| anyhow!("historical data for {} timed out", symbol))?
            .context("historical data task panicked")?
            .map_err(|e| anyhow!("historical data for {} failed: {}", symbol, e))?;
        debug!(symbol, count = bars.len(), "historical bars");
        Ok(bars)
    }

    async fn submit_order(&self, symbol: &str, order: &OrderSpec) -> Result<i32> {
        let order_id = self.client.next_order_id();
        self.fills.record_status(order_id, OrderStatus::PendingSubmit);
        info!(order_id, symbol, %order, "submitting order");
        if let Err(e) = self.place(order_id, symbol, order).await {
            self.fills.forget(order_id);
            return Err(e);
        }
        Ok(order_id)
    }

    async fn await_fill(&self, order_id: i32, timeout: Duration) -> FillOutcome {
        let interval = self.config.fill_poll_interval.max(FILL_POLL_FLOOR);
        let outcome = self.fills.wait(order_id, timeout, interval).await;
        if outcome == FillOutcome::TimedOut {
            warn!(order_id, status = ?self.fills.status(order_id), "fill wait timed out");
        }
        self.fills.release(order_id);
        outcome
    }

    async fn disconnect(&self) -> Result<()> {
        self.shutdown.store(true, Ordering::Relaxed);
        info!("IB gateway disconnecting");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ib_order_mapping() {
        let limit = ib_order(&OrderSpec::limit(Direction::Sell, 3, 99.123));
        assert!(matches!(limit.action, Action::Sell));
        assert_eq!(limit.total_quantity, 3.0);
        assert_eq!(limit.limit_price, Some(99.12));
        assert_eq!(limit.tif, "DAY");
        assert!(limit.outside_rth);

        let market = ib_order(&OrderSpec::market(Direction::Buy, 5));
        assert!(matches!(market.action, Action::Buy));
        assert_eq!(market.order_type, "MKT");
        assert!(!market.outside_rth);
    }

    #[test]
    fn test_close_only_until_last_prints() {
        let mut have_last = false;
        assert!(takes_price(&TickType::DelayedClose, &mut have_last));
        assert!(!takes_price(&TickType::Bid, &mut have_last));
        assert!(takes_price(&TickType::Last, &mut have_last));
        assert!(have_last);
        assert!(!takes_price(&TickType::Close, &mut have_last));
        assert!(takes_price(&TickType::DelayedLast, &mut have_last));
    }

    #[test]
    fn test_bar_size_mapping() {
        assert!(matches!(bar_size(5), BarSize::Min5));
        assert!(matches!(bar_size(1), BarSize::Min));
        assert!(matches!(bar_size(120), BarSize::Hour));
    }

    #[test]
    fn test_stock_contract() {
        let contract = stock_contract("AAPL");
        assert_eq!(contract.symbol, "AAPL");
        assert_eq!(contract.exchange, "SMART");
        assert_eq!(contract.currency, "USD");
    }
}
