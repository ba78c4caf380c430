//! Per-symbol positions, capital reservation and closed-trade history

use std::collections::{HashMap, HashSet, VecDeque};

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::vision::{Direction, SignalSet};

/// Why a position was closed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    /// Price reached the take-profit level
    TakeProfit,
    /// Price reached the stop-loss level
    StopLoss,
    /// Carries the direction of the new signal
    OppositeSignal(Direction),
    /// End-of-day flatten
    DailyClose,
    /// Free-form reason, written to the ledger as given
    Manual(String),
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TakeProfit => write!(f, "TAKE PROFIT"),
            Self::StopLoss => write!(f, "STOP LOSS"),
            Self::OppositeSignal(d) => write!(f, "OPPOSITE SIGNAL ({})", d),
            Self::DailyClose => write!(f, "DAILY CLOSE"),
            Self::Manual(reason) => write!(f, "{}", reason),
        }
    }
}

/// An open position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Correlates the ENTRY and EXIT ledger rows
    pub trade_id: String,
    pub symbol: String,
    /// Long for buy, short for sell
    pub direction: Direction,
    /// Actual fill price, or the reference price when the fill timed out
    pub entry_price: f64,
    /// Whole shares, at least one
    pub shares: u32,
    /// Take-profit price
    pub take_profit: f64,
    /// Stop-loss price
    pub stop_loss: f64,
    /// Time of the entry decision
    pub entry_time: DateTime<Utc>,
    /// Broker order id of the entry order
    pub order_id: i32,
    /// `Market` or `Limit @ $x.xx`
    pub order_type: String,
    /// Entered during regular hours
    pub is_market_hours: bool,
    /// Indicator readings that triggered the entry
    pub signals: SignalSet,
    /// Capital held back from sizing while this position is open
    pub reserved_capital: f64,
    /// Entry fill was not confirmed before the timeout
    pub estimated_fill: bool,
}

impl Position {
    /// TP/SL crossing at `price`, take profit checked first
    pub fn exit_trigger(&self, price: f64) -> Option<ExitReason> {
        match self.direction {
            Direction::Buy if price >= self.take_profit => Some(ExitReason::TakeProfit),
            Direction::Buy if price <= self.stop_loss => Some(ExitReason::StopLoss),
            Direction::Sell if price <= self.take_profit => Some(ExitReason::TakeProfit),
            Direction::Sell if price >= self.stop_loss => Some(ExitReason::StopLoss),
            _ => None,
        }
    }

    /// Realized (dollar, percent) P&L at `exit_price`
    pub fn pnl_at(&self, exit_price: f64) -> (f64, f64) {
        let diff = exit_price - self.entry_price;
        let signed = match self.direction {
            Direction::Buy => diff,
            Direction::Sell => -diff,
        };
        let pct = if self.entry_price != 0.0 {
            signed / self.entry_price * 100.0
        } else {
            0.0
        };
        (signed * self.shares as f64, pct)
    }

    /// Turn into a closed trade at `exit_price`
    pub fn close(
        self,
        exit_price: f64,
        exit_time: DateTime<Utc>,
        reason: ExitReason,
        exit_order_type: String,
        estimated_fill: bool,
    ) -> ClosedTrade {
        let (pnl_dollar, pnl_percent) = self.pnl_at(exit_price);
        let duration_minutes = (exit_time - self.entry_time).num_milliseconds() as f64 / 60_000.0;
        ClosedTrade {
            position: self,
            exit_price,
            exit_time,
            pnl_dollar,
            pnl_percent,
            duration_minutes,
            reason,
            exit_order_type,
            estimated_fill,
        }
    }
}

/// A position after its exit fill
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedTrade {
    /// The position as it was while open
    pub position: Position,
    /// Exit fill price, or the cached price when the fill timed out
    pub exit_price: f64,
    pub exit_time: DateTime<Utc>,
    /// Signed dollar P&L over all shares
    pub pnl_dollar: f64,
    /// Signed P&L relative to the entry price
    pub pnl_percent: f64,
    /// Holding time
    pub duration_minutes: f64,
    pub reason: ExitReason,
    /// `Market` or `Limit @ $x.xx` for the closing order
    pub exit_order_type: String,
    /// Exit fill was not confirmed before the timeout
    pub estimated_fill: bool,
}

/// Session statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionPnL {
    /// Sum of realized P&L
    pub gross_pnl: f64,
    /// Closed trades
    pub trade_count: u32,
    /// Trades closed with positive P&L
    pub wins: u32,
    /// Trades closed flat or negative
    pub losses: u32,
    /// Best single trade
    pub largest_win: f64,
    /// Worst single trade (negative)
    pub largest_loss: f64,
}

/// Owns every open position plus capital accounting.
///
/// At most one position per symbol. A symbol with an order in flight is
/// marked busy so a racing entry or exit for it is refused.
#[derive(Debug)]
pub struct PositionBook {
    /// Open positions by symbol
    positions: HashMap<String, Position>,
    /// Symbols with an entry or exit order in flight
    busy: HashSet<String>,
    /// Capital available for sizing
    capital: f64,
    /// Capital at construction
    starting_capital: f64,
    /// Recent closed trades, oldest first
    history: VecDeque<ClosedTrade>,
    /// Session statistics
    session: SessionPnL,
    /// Maximum history size
    max_history: usize,
}

impl PositionBook {
    pub fn new(starting_capital: f64) -> Self {
        Self {
            positions: HashMap::new(),
            busy: HashSet::new(),
            capital: starting_capital,
            starting_capital,
            history: VecDeque::new(),
            session: SessionPnL::default(),
            max_history: 1000,
        }
    }

    /// Capital available for sizing
    pub fn capital(&self) -> f64 {
        self.capital
    }

    /// Capital the book started with
    pub fn starting_capital(&self) -> f64 {
        self.starting_capital
    }

    /// Open position for `symbol`, if any
    pub fn get(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    /// No open position for `symbol`
    pub fn is_flat(&self, symbol: &str) -> bool {
        !self.positions.contains_key(symbol)
    }

    /// Symbols with an open position, sorted
    pub fn open_symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.positions.keys().cloned().collect();
        symbols.sort();
        symbols
    }

    /// Number of open positions
    pub fn open_count(&self) -> usize {
        self.positions.len()
    }

    /// Claim `symbol` for a new entry. Fails if it is open or already busy.
    pub fn begin_entry(&mut self, symbol: &str) -> Result<()> {
        if self.positions.contains_key(symbol) {
            bail!("{} already has an open position", symbol);
        }
        if !self.busy.insert(symbol.to_string()) {
            bail!("{} has an order in flight", symbol);
        }
        Ok(())
    }

    /// Claim an open `symbol` for exit and return a snapshot of it.
    /// None when flat or busy.
    pub fn begin_exit(&mut self, symbol: &str) -> Option<Position> {
        let position = self.positions.get(symbol)?.clone();
        if !self.busy.insert(symbol.to_string()) {
            return None;
        }
        Some(position)
    }

    /// Release a claim without changing state
    pub fn abandon(&mut self, symbol: &str) {
        self.busy.remove(symbol);
    }

    /// Record a filled entry, reserving its capital
    pub fn open(&mut self, position: Position) {
        self.busy.remove(&position.symbol);
        self.capital -= position.reserved_capital;
        self.positions.insert(position.symbol.clone(), position);
    }

    /// Record a filled exit, releasing the reserved capital
    pub fn close(&mut self, trade: ClosedTrade) {
        let symbol = &trade.position.symbol;
        self.busy.remove(symbol);
        self.positions.remove(symbol);
        self.capital += trade.position.reserved_capital;

        let pnl = trade.pnl_dollar;
        self.session.gross_pnl += pnl;
        self.session.trade_count += 1;
        if pnl > 0.0 {
            self.session.wins += 1;
            if pnl > self.session.largest_win {
                self.session.largest_win = pnl;
            }
        } else {
            self.session.losses += 1;
            if pnl < self.session.largest_loss {
                self.session.largest_loss = pnl;
            }
        }

        self.history.push_back(trade);
        if self.history.len() > self.max_history {
            self.history.pop_front();
        }
    }

    /// Recent closed trades
    pub fn history(&self) -> &VecDeque<ClosedTrade> {
        &self.history
    }

    /// Session statistics
    pub fn session(&self) -> &SessionPnL {
        &self.session
    }

    /// Wins over closed trades, 0 with none
    pub fn win_rate(&self) -> f64 {
        if self.session.trade_count == 0 {
            0.0
        } else {
            self.session.wins as f64 / self.session.trade_count as f64
        }
    }

    pub fn stats_summary(&self) -> String {
        format!(
            "Capital: ${:.2} | Open: {} | Session P&L: ${:.2} | Trades: {} | WR: {:.1}%",
            self.capital,
            self.positions.len(),
            self.session.gross_pnl,
            self.session.trade_count,
            self.win_rate() * 100.0
        )
    }
}

#[cfg(test)]
pub(crate) fn sample_position(symbol: &str, direction: Direction, entry: f64, shares: u32) -> Position {
    Position {
        trade_id: format!("TRADE_20250102_100000_{}_{:04}", symbol, shares),
        symbol: symbol.to_string(),
        direction,
        entry_price: entry,
        shares,
        take_profit: match direction {
            Direction::Buy => entry * 1.01,
            Direction::Sell => entry * 0.99,
        },
        stop_loss: match direction {
            Direction::Buy => entry * 0.995,
            Direction::Sell => entry * 1.005,
        },
        entry_time: Utc::now(),
        order_id: 1,
        order_type: "Market".to_string(),
        is_market_hours: true,
        signals: SignalSet::default(),
        reserved_capital: entry * shares as f64 * 0.1,
        estimated_fill: false,
    }
}
