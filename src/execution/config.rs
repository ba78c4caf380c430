//! Configuration for the lifecycle manager and broker gateways

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Execution mode determines which broker gateway receives orders
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// In-process gateway, nothing leaves the machine
    #[default]
    Simulation,
    /// IB paper account via IB Gateway
    Paper,
    /// IB live account via IB Gateway
    Live,
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Simulation => write!(f, "Simulation"),
            Self::Paper => write!(f, "Paper"),
            Self::Live => write!(f, "Live"),
        }
    }
}

/// Sizing, order, fill-wait and risk parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    /// Which gateway receives orders
    pub mode: ExecutionMode,

    /// Starting capital used for position sizing
    pub initial_capital: f64,

    /// Fraction of current capital committed per position
    pub capital_fraction: f64,

    /// Limit-order offset from the reference price outside regular hours
    pub limit_offset: f64,

    /// How long to wait for a broker fill before falling back to the
    /// reference price
    pub fill_timeout: Duration,

    /// How often a fill wait re-checks the order state
    pub fill_poll_interval: Duration,

    /// Upper bound on a historical-bar request
    pub history_timeout: Duration,

    /// Number of most recent 5-minute bars forming the Fibonacci range
    pub lookback_bars: usize,

    /// Trade ledger CSV
    pub ledger_path: PathBuf,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Simulation,
            initial_capital: 4000.0,
            capital_fraction: 0.10,
            limit_offset: 0.005,
            fill_timeout: Duration::from_secs(30),
            fill_poll_interval: Duration::from_millis(50),
            history_timeout: Duration::from_secs(6),
            lookback_bars: 33,
            ledger_path: PathBuf::from("trading_records.csv"),
        }
    }
}

impl TradingConfig {
    /// Shares for a new position: floor(fraction * capital / price), at least 1
    pub fn position_size(&self, capital: f64, price: f64) -> u32 {
        if !(price > 0.0) || !price.is_finite() {
            return 1;
        }
        let shares = (self.capital_fraction * capital / price).floor();
        if shares >= 1.0 {
            shares as u32
        } else {
            1
        }
    }
}

/// IB Gateway connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IbConfig {
    /// IB Gateway host
    pub host: String,
    /// IB Gateway port (paper: 4002, live: 4001)
    pub port: u16,
    /// Client ID (must be unique per connection)
    pub client_id: i32,
    /// Upper bound on the initial connection
    pub connect_timeout: Duration,
}

/// Default IB Gateway port for paper accounts
pub const PAPER_PORT: u16 = 4002;
/// Default IB Gateway port for live accounts
pub const LIVE_PORT: u16 = 4001;

impl Default for IbConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: PAPER_PORT,
            client_id: 1,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl IbConfig {
    /// Defaults with the gateway port matching `mode`
    pub fn for_mode(mode: ExecutionMode) -> Self {
        let port = match mode {
            ExecutionMode::Live => LIVE_PORT,
            _ => PAPER_PORT,
        };
        Self {
            port,
            ..Default::default()
        }
    }

    /// `host:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
