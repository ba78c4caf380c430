//! Chart-screenshot signal extraction and automated IB equities execution

pub mod capture;
pub mod execution;
pub mod monitor;
pub mod session;
pub mod vision;

pub use execution::{ExecutionMode, LifecycleManager, TradingConfig};
pub use vision::{ChartAnalyzer, Direction, Signal, SignalSet};
