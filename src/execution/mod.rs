//! Position and order lifecycle
//!
//! Turns aligned chart signals into IB stock orders, tracks one position per
//! symbol with Fibonacci TP/SL levels, and records every entry and exit in
//! the CSV trade ledger.

mod config;
mod fills;
mod gateway;
mod ib;
mod ledger;
mod manager;
mod order;
mod position;
mod price_cache;
mod risk;
mod simulated;

pub use config::{ExecutionMode, IbConfig, TradingConfig};
pub use fills::{FillBook, FillOutcome};
pub use gateway::{BrokerGateway, HistoricalBar, HistoryRequest};
pub use ib::{stock_contract, IbGateway};
pub use ledger::{load_rows, GroupStats, LedgerAction, LedgerRow, LedgerSummary, TradeLedger, COLUMNS};
pub use manager::{ExecutionEvent, LifecycleManager, SignalDecision};
pub use order::{round_to_cents, Fill, OrderKind, OrderSpec, OrderStatus};
pub use position::{ClosedTrade, ExitReason, Position, PositionBook, SessionPnL};
pub use price_cache::{CachedPrice, PriceCache};
pub use risk::{fallback_levels, fibonacci_levels, LevelSource, LookbackRange, RiskLevels, DEFAULT_CONFIDENCE};
pub use simulated::{FillMode, SimulatedGateway, SubmittedOrder};
