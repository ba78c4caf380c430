//! Narrow broker interface used by the lifecycle manager

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::fills::FillOutcome;
use super::order::OrderSpec;

/// One historical OHLCV bar
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistoricalBar {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// How much history to request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRequest {
    pub days: u32,
    pub bar_minutes: u32,
    /// Include pre/post-market bars
    pub extended_hours: bool,
}

impl Default for HistoryRequest {
    fn default() -> Self {
        Self {
            days: 1,
            bar_minutes: 5,
            extended_hours: true,
        }
    }
}

/// Broker operations the lifecycle manager depends on.
///
/// Implementations publish prices into a shared `PriceCache` and order
/// progress into a shared `FillBook`; the manager only ever polls.
#[async_trait]
pub trait BrokerGateway: Send + Sync {
    fn name(&self) -> &'static str;

    /// Start streaming prices; results surface only through the price cache
    async fn subscribe_price_stream(&self, symbols: &[String]) -> Result<()>;

    fn cached_price(&self, symbol: &str) -> Option<f64>;

    /// Ordered oldest first, bounded by the gateway's history timeout
    async fn fetch_recent_bars(&self, symbol: &str, request: HistoryRequest) -> Result<Vec<HistoricalBar>>;

    /// Submit a stock order, returning the broker order id
    async fn submit_order(&self, symbol: &str, order: &OrderSpec) -> Result<i32>;

    async fn await_fill(&self, order_id: i32, timeout: Duration) -> FillOutcome;

    async fn disconnect(&self) -> Result<()>;
}
