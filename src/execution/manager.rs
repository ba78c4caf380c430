//! Position & order lifecycle manager
//!
//! Per-symbol two-state machine (Flat / Open) driven by aligned chart
//! signals, TP/SL crossings on the live price cache, and the daily
//! close-out.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

use super::config::TradingConfig;
use super::fills::FillOutcome;
use super::gateway::{BrokerGateway, HistoryRequest};
use super::ledger::{LedgerRow, TradeLedger};
use super::order::OrderSpec;
use super::position::{ClosedTrade, ExitReason, Position, PositionBook};
use super::risk::{fibonacci_levels, LookbackRange};
use crate::session::{Clock, MarketSession};
use crate::vision::{align, Direction, SignalSet};

/// Events emitted by the lifecycle manager
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    PositionOpened {
        trade_id: String,
        symbol: String,
        direction: Direction,
        entry_price: f64,
        shares: u32,
    },
    PositionClosed {
        trade_id: String,
        symbol: String,
        exit_price: f64,
        pnl_dollar: f64,
        reason: String,
    },
    /// Fill wait timed out; the reference price was recorded instead
    EstimatedFill {
        symbol: String,
        order_id: i32,
        price: f64,
    },
    OrderRejected {
        symbol: String,
        order_id: i32,
        status: String,
    },
    Error {
        symbol: String,
        message: String,
    },
}

/// What `on_signal` did with an analysed frame
#[derive(Debug, Clone, PartialEq)]
pub enum SignalDecision {
    /// Symbol is not in the tracked set
    Untracked,
    NotAligned,
    /// Aligned but no cached price to trade on
    NoPrice,
    /// A position in the same direction is already open
    AlreadyPositioned,
    Entered(Position),
}

/// Fill price actually used for an order, plus whether it was estimated
struct ResolvedFill {
    price: f64,
    estimated: bool,
}

pub struct LifecycleManager {
    config: TradingConfig,
    gateway: Arc<dyn BrokerGateway>,
    book: Mutex<PositionBook>,
    ledger: TradeLedger,
    session: MarketSession,
    clock: Arc<dyn Clock>,
    history: HistoryRequest,
    tracked: HashSet<String>,
    /// Per-process sequence making trade ids unique within one second
    trade_seq: AtomicU64,
    event_tx: broadcast::Sender<ExecutionEvent>,
}

impl LifecycleManager {
    pub fn new(
        config: TradingConfig,
        gateway: Arc<dyn BrokerGateway>,
        ledger: TradeLedger,
        session: MarketSession,
        clock: Arc<dyn Clock>,
        symbols: impl IntoIterator<Item = String>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(1000);
        Self {
            book: Mutex::new(PositionBook::new(config.initial_capital)),
            config,
            gateway,
            ledger,
            session,
            clock,
            history: HistoryRequest::default(),
            tracked: symbols.into_iter().map(|s| s.to_uppercase()).collect(),
            trade_seq: AtomicU64::new(1),
            event_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.event_tx.subscribe()
    }

    pub fn config(&self) -> &TradingConfig {
        &self.config
    }

    pub fn session(&self) -> &MarketSession {
        &self.session
    }

    pub fn gateway(&self) -> &Arc<dyn BrokerGateway> {
        &self.gateway
    }

    pub fn is_tracked(&self, symbol: &str) -> bool {
        self.tracked.contains(symbol)
    }

    pub fn tracked_symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.tracked.iter().cloned().collect();
        symbols.sort();
        symbols
    }

    pub async fn position(&self, symbol: &str) -> Option<Position> {
        self.book.lock().await.get(symbol).cloned()
    }

    pub async fn is_flat(&self, symbol: &str) -> bool {
        self.book.lock().await.is_flat(symbol)
    }

    pub async fn capital(&self) -> f64 {
        self.book.lock().await.capital()
    }

    pub async fn open_symbols(&self) -> Vec<String> {
        self.book.lock().await.open_symbols()
    }

    pub async fn stats_summary(&self) -> String {
        self.book.lock().await.stats_summary()
    }

    fn emit(&self, event: ExecutionEvent) {
        let _ = self.event_tx.send(event);
    }

    /// `TRADE_<yyyymmdd_hhmmss>_<SYMBOL>_<seq>`
    fn new_trade_id(&self, symbol: &str) -> String {
        let now = MarketSession::eastern(self.clock.now());
        let seq = self.trade_seq.fetch_add(1, Ordering::Relaxed);
        format!("TRADE_{}_{}_{:04}", now.format("%Y%m%d_%H%M%S"), symbol, seq)
    }

    /// Submit and wait. Rejections and submission errors are returned as
    /// errors; a timeout falls back to `reference_price`.
    async fn execute(&self, symbol: &str, order: &OrderSpec, reference_price: f64) -> Result<(i32, ResolvedFill)> {
        let order_id = self
            .gateway
            .submit_order(symbol, order)
            .await
            .with_context(|| format!("Failed to submit {} for {}", order, symbol))?;

        info!(order_id, symbol, %order, "waiting for fill");
        match self.gateway.await_fill(order_id, self.config.fill_timeout).await {
            FillOutcome::Filled(fill) if fill.avg_fill_price > 0.0 => {
                info!(order_id, symbol, price = fill.avg_fill_price, "order filled");
                Ok((order_id, ResolvedFill { price: fill.avg_fill_price, estimated: false }))
            }
            FillOutcome::Filled(_) | FillOutcome::TimedOut => {
                warn!(
                    order_id,
                    symbol,
                    price = reference_price,
                    timeout_secs = self.config.fill_timeout.as_secs_f64(),
                    "no fill confirmation, recording estimated price"
                );
                self.emit(ExecutionEvent::EstimatedFill {
                    symbol: symbol.to_string(),
                    order_id,
                    price: reference_price,
                });
                Ok((order_id, ResolvedFill { price: reference_price, estimated: true }))
            }
            FillOutcome::Rejected(status) => {
                error!(order_id, symbol, %status, "order not filled");
                self.emit(ExecutionEvent::OrderRejected {
                    symbol: symbol.to_string(),
                    order_id,
                    status: status.to_string(),
                });
                bail!("order {} for {} was {}", order_id, symbol, status)
            }
        }
    }

    async fn lookback_range(&self, symbol: &str) -> Option<LookbackRange> {
        let request = self.gateway.fetch_recent_bars(symbol, self.history);
        match tokio::time::timeout(self.config.history_timeout, request).await {
            Ok(Ok(bars)) => {
                let range = LookbackRange::from_bars(&bars, self.config.lookback_bars);
                if range.is_none() {
                    warn!(symbol, "no historical bars");
                }
                range
            }
            Ok(Err(e)) => {
                warn!(symbol, error = %e, "historical bar request failed");
                None
            }
            Err(_) => {
                warn!(symbol, "historical bar request timed out");
                None
            }
        }
    }

    /// Flat -> Open.
    ///
    /// Refused when `symbol` already has a position or an order in flight.
    /// On broker rejection or submission failure the symbol stays Flat.
    pub async fn place_order(
        &self,
        symbol: &str,
        direction: Direction,
        reference_price: f64,
        signals: SignalSet,
        confidence: Option<f64>,
    ) -> Result<Position> {
        if !(reference_price.is_finite() && reference_price > 0.0) {
            bail!("invalid reference price {} for {}", reference_price, symbol);
        }

        let capital = {
            let mut book = self.book.lock().await;
            book.begin_entry(symbol)?;
            book.capital()
        };

        let shares = self.config.position_size(capital, reference_price);
        let entry_time = self.clock.now();
        let regular = self.session.is_regular_hours(entry_time);
        let order = OrderSpec::for_session(direction, shares, reference_price, regular, self.config.limit_offset);
        info!(symbol, %direction, shares, reference_price, regular_hours = regular, "placing entry order");

        let (order_id, fill) = match self.execute(symbol, &order, reference_price).await {
            Ok(result) => result,
            Err(e) => {
                self.book.lock().await.abandon(symbol);
                error!(symbol, error = %e, "entry abandoned");
                self.emit(ExecutionEvent::Error {
                    symbol: symbol.to_string(),
                    message: e.to_string(),
                });
                return Err(e);
            }
        };

        let range = self.lookback_range(symbol).await;
        let levels = fibonacci_levels(fill.price, direction, range, confidence);

        let position = Position {
            trade_id: self.new_trade_id(symbol),
            symbol: symbol.to_string(),
            direction,
            entry_price: fill.price,
            shares,
            take_profit: levels.take_profit,
            stop_loss: levels.stop_loss,
            entry_time,
            order_id,
            order_type: order.label(),
            is_market_hours: regular,
            signals,
            reserved_capital: shares as f64 * reference_price * self.config.capital_fraction,
            estimated_fill: fill.estimated,
        };

        self.book.lock().await.open(position.clone());
        if let Err(e) = self.ledger.append(&LedgerRow::entry(&position)).await {
            error!(symbol, trade_id = %position.trade_id, error = %e, "failed to record entry");
        }

        info!(
            symbol,
            trade_id = %position.trade_id,
            %direction,
            shares,
            entry = position.entry_price,
            tp = position.take_profit,
            sl = position.stop_loss,
            "position opened"
        );
        self.emit(ExecutionEvent::PositionOpened {
            trade_id: position.trade_id.clone(),
            symbol: symbol.to_string(),
            direction,
            entry_price: position.entry_price,
            shares,
        });
        Ok(position)
    }

    /// Open -> Flat.
    ///
    /// `Ok(None)` when already flat, busy, or no cached price is available;
    /// the position then stays as it was and the call can simply be retried.
    pub async fn close_position(&self, symbol: &str, reason: ExitReason) -> Result<Option<ClosedTrade>> {
        let Some(position) = self.book.lock().await.begin_exit(symbol) else {
            debug!(symbol, "no position to close");
            return Ok(None);
        };

        let Some(price) = self.gateway.cached_price(symbol) else {
            warn!(symbol, %reason, "no cached price, position left open");
            self.book.lock().await.abandon(symbol);
            return Ok(None);
        };

        let regular = self.session.is_regular_hours(self.clock.now());
        let order = OrderSpec::for_session(
            position.direction.opposite(),
            position.shares,
            price,
            regular,
            self.config.limit_offset,
        );
        info!(symbol, %reason, %order, "closing position");

        let (_, fill) = match self.execute(symbol, &order, price).await {
            Ok(result) => result,
            Err(e) => {
                self.book.lock().await.abandon(symbol);
                error!(symbol, error = %e, "exit abandoned, position still open");
                self.emit(ExecutionEvent::Error {
                    symbol: symbol.to_string(),
                    message: e.to_string(),
                });
                return Err(e);
            }
        };

        let trade = position.close(fill.price, self.clock.now(), reason, order.label(), fill.estimated);
        self.book.lock().await.close(trade.clone());
        if let Err(e) = self.ledger.append(&LedgerRow::exit(&trade)).await {
            error!(symbol, trade_id = %trade.position.trade_id, error = %e, "failed to record exit");
        }

        info!(
            symbol,
            trade_id = %trade.position.trade_id,
            exit = trade.exit_price,
            pnl = trade.pnl_dollar,
            pnl_pct = trade.pnl_percent,
            reason = %trade.reason,
            "position closed"
        );
        self.emit(ExecutionEvent::PositionClosed {
            trade_id: trade.position.trade_id.clone(),
            symbol: symbol.to_string(),
            exit_price: trade.exit_price,
            pnl_dollar: trade.pnl_dollar,
            reason: trade.reason.to_string(),
        });
        Ok(Some(trade))
    }

    /// Close every position whose TP or SL the cached price has crossed.
    /// Symbols without a cached price are skipped this round.
    pub async fn check_exit_conditions(&self) -> Vec<ClosedTrade> {
        let open: Vec<Position> = {
            let book = self.book.lock().await;
            book.open_symbols()
                .iter()
                .filter_map(|s| book.get(s).cloned())
                .collect()
        };

        let mut closed = Vec::new();
        for position in open {
            let Some(price) = self.gateway.cached_price(&position.symbol) else {
                debug!(symbol = %position.symbol, "exit check skipped, no price");
                continue;
            };
            let Some(reason) = position.exit_trigger(price) else {
                continue;
            };
            info!(symbol = %position.symbol, price, %reason, "exit triggered");
            match self.close_position(&position.symbol, reason).await {
                Ok(Some(trade)) => closed.push(trade),
                Ok(None) => {}
                Err(e) => error!(symbol = %position.symbol, error = %e, "exit failed"),
            }
        }
        closed
    }

    /// Close the open position if it points the other way
    pub async fn handle_opposite_signal(&self, symbol: &str, new_direction: Direction) -> Result<Option<ClosedTrade>> {
        let current = match self.book.lock().await.get(symbol) {
            Some(position) => position.direction,
            None => return Ok(None),
        };
        if current == new_direction {
            return Ok(None);
        }
        self.close_position(symbol, ExitReason::OppositeSignal(new_direction)).await
    }

    /// Close everything, e.g. at the daily close-out
    pub async fn close_all_positions(&self, reason: ExitReason) -> Vec<ClosedTrade> {
        let symbols = self.open_symbols().await;
        info!(count = symbols.len(), %reason, "closing all positions");
        let mut closed = Vec::new();
        for symbol in symbols {
            match self.close_position(&symbol, reason.clone()).await {
                Ok(Some(trade)) => closed.push(trade),
                Ok(None) => {}
                Err(e) => error!(symbol, error = %e, "close failed"),
            }
        }
        closed
    }

    /// Act on one analysed frame: align, flip an opposite position, then
    /// enter unless already positioned the same way.
    pub async fn on_signal(&self, symbol: &str, signals: SignalSet) -> Result<SignalDecision> {
        if !self.is_tracked(symbol) {
            debug!(symbol, "untracked symbol");
            return Ok(SignalDecision::Untracked);
        }
        let Some(alignment) = align(&signals) else {
            return Ok(SignalDecision::NotAligned);
        };
        info!(
            symbol,
            direction = %alignment.direction,
            confidence = alignment.confidence,
            "aligned signal"
        );

        let Some(price) = self.gateway.cached_price(symbol) else {
            warn!(symbol, "aligned signal but no cached price");
            return Ok(SignalDecision::NoPrice);
        };

        if let Err(e) = self.handle_opposite_signal(symbol, alignment.direction).await {
            error!(symbol, error = %e, "could not close opposite position");
        }

        if let Some(current) = self.position(symbol).await {
            if current.direction == alignment.direction {
                debug!(symbol, "already positioned in signal direction");
                return Ok(SignalDecision::AlreadyPositioned);
            }
        }

        let position = self
            .place_order(symbol, alignment.direction, price, signals, Some(alignment.confidence))
            .await?;
        Ok(SignalDecision::Entered(position))
    }

    pub async fn disconnect(&self) -> Result<()> {
        info!("{}", self.stats_summary().await);
        self.gateway.disconnect().await
    }
}
