//! In-process broker gateway
//!
//! Fills orders instantly at the limit price (or the cached price for market
//! orders). The fill mode can be switched to never fill or to reject, and
//! every submission is recorded for inspection.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, Ordering};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info};

use super::fills::{FillBook, FillOutcome};
use super::gateway::{BrokerGateway, HistoricalBar, HistoryRequest};
use super::order::{Fill, OrderSpec, OrderStatus};
use super::price_cache::PriceCache;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FillMode {
    Immediate = 0,
    /// Orders stay working forever
    Never = 1,
    Reject = 2,
}

impl FillMode {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Never,
            2 => Self::Reject,
            _ => Self::Immediate,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubmittedOrder {
    pub order_id: i32,
    pub symbol: String,
    pub order: OrderSpec,
}

pub struct SimulatedGateway {
    prices: PriceCache,
    fills: FillBook,
    next_order_id: AtomicI32,
    fill_mode: AtomicU8,
    fail_submissions: AtomicBool,
    bars: DashMap<String, Vec<HistoricalBar>>,
    submitted: DashMap<i32, SubmittedOrder>,
    poll_interval: Duration,
}

impl SimulatedGateway {
    pub fn new(prices: PriceCache) -> Self {
        Self {
            prices,
            fills: FillBook::new(),
            next_order_id: AtomicI32::new(1),
            fill_mode: AtomicU8::new(FillMode::Immediate as u8),
            fail_submissions: AtomicBool::new(false),
            bars: DashMap::new(),
            submitted: DashMap::new(),
            poll_interval: Duration::from_millis(5),
        }
    }

    pub fn price_cache(&self) -> &PriceCache {
        &self.prices
    }

    pub fn set_price(&self, symbol: &str, price: f64) {
        self.prices.set(symbol, price);
    }

    pub fn set_fill_mode(&self, mode: FillMode) {
        self.fill_mode.store(mode as u8, Ordering::SeqCst);
    }

    pub fn fill_mode(&self) -> FillMode {
        FillMode::from_u8(self.fill_mode.load(Ordering::SeqCst))
    }

    /// Make every subsequent submission fail at the transport level
    pub fn set_fail_submissions(&self, fail: bool) {
        self.fail_submissions.store(fail, Ordering::SeqCst);
    }

    pub fn set_bars(&self, symbol: &str, bars: Vec<HistoricalBar>) {
        self.bars.insert(symbol.to_string(), bars);
    }

    /// Submitted orders in submission order
    pub fn submitted(&self) -> Vec<SubmittedOrder> {
        let mut orders: Vec<SubmittedOrder> = self.submitted.iter().map(|o| o.value().clone()).collect();
        orders.sort_by_key(|o| o.order_id);
        orders
    }
}

#[async_trait]
impl BrokerGateway for SimulatedGateway {
    fn name(&self) -> &'static str {
        "simulated"
    }

    async fn subscribe_price_stream(&self, symbols: &[String]) -> Result<()> {
        debug!(count = symbols.len(), "simulated price stream: prices come from set_price");
        Ok(())
    }

    fn cached_price(&self, symbol: &str) -> Option<f64> {
        self.prices.get(symbol)
    }

    async fn fetch_recent_bars(&self, symbol: &str, _request: HistoryRequest) -> Result<Vec<HistoricalBar>> {
        Ok(self.bars.get(symbol).map(|b| b.clone()).unwrap_or_default())
    }

    async fn submit_order(&self, symbol: &str, order: &OrderSpec) -> Result<i32> {
        if self.fail_submissions.load(Ordering::SeqCst) {
            bail!("simulated submission failure for {}", symbol);
        }

        let order_id = self.next_order_id.fetch_add(1, Ordering::SeqCst);
        self.submitted.insert(
            order_id,
            SubmittedOrder {
                order_id,
                symbol: symbol.to_string(),
                order: order.clone(),
            },
        );
        self.fills.record_status(order_id, OrderStatus::Submitted);

        match self.fill_mode() {
            FillMode::Immediate => {
                let price = order.limit_price.or_else(|| self.prices.get(symbol));
                match price {
                    Some(price) => self.fills.record_fill(order_id, Fill::at(price, order.quantity as f64)),
                    None => debug!(order_id, symbol, "no price to fill market order"),
                }
            }
            FillMode::Never => {}
            FillMode::Reject => self.fills.record_status(order_id, OrderStatus::Rejected),
        }
        self.fills.settle(order_id);

        info!(order_id, symbol, %order, "simulated order submitted");
        Ok(order_id)
    }

    async fn await_fill(&self, order_id: i32, timeout: Duration) -> FillOutcome {
        let outcome = self.fills.wait(order_id, timeout, self.poll_interval).await;
        self.fills.release(order_id);
        outcome
    }

    async fn disconnect(&self) -> Result<()> {
        info!("simulated gateway disconnected");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vision::Direction;

    #[tokio::test]
    async fn test_market_fills_at_cached_price() {
        let gw = SimulatedGateway::new(PriceCache::new());
        gw.set_price("AAPL", 190.0);
        let id = gw.submit_order("AAPL", &OrderSpec::market(Direction::Buy, 2)).await.unwrap();
        let outcome = gw.await_fill(id, Duration::from_millis(100)).await;
        assert_eq!(outcome.fill().map(|f| f.avg_fill_price), Some(190.0));
        assert_eq!(gw.submitted().len(), 1);
    }

    #[tokio::test]
    async fn test_limit_fills_at_limit() {
        let gw = SimulatedGateway::new(PriceCache::new());
        let id = gw.submit_order("AAPL", &OrderSpec::limit(Direction::Sell, 2, 99.5)).await.unwrap();
        let outcome = gw.await_fill(id, Duration::from_millis(100)).await;
        assert_eq!(outcome.fill().map(|f| f.avg_fill_price), Some(99.5));
    }

    #[tokio::test]
    async fn test_fill_modes() {
        let gw = SimulatedGateway::new(PriceCache::new());
        gw.set_price("MSFT", 400.0);

        gw.set_fill_mode(FillMode::Never);
        let id = gw.submit_order("MSFT", &OrderSpec::market(Direction::Buy, 1)).await.unwrap();
        assert_eq!(gw.await_fill(id, Duration::from_millis(30)).await, FillOutcome::TimedOut);

        gw.set_fill_mode(FillMode::Reject);
        let id = gw.submit_order("MSFT", &OrderSpec::market(Direction::Buy, 1)).await.unwrap();
        assert_eq!(
            gw.await_fill(id, Duration::from_millis(30)).await,
            FillOutcome::Rejected(OrderStatus::Rejected)
        );

        gw.set_fail_submissions(true);
        assert!(gw.submit_order("MSFT", &OrderSpec::market(Direction::Buy, 1)).await.is_err());
        assert_eq!(gw.submitted().len(), 2);
        // timed-out and rejected orders leave no state behind
        assert!(gw.fills.is_empty());
    }
}
