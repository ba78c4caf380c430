//! Order requests, broker order status and fills

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::vision::Direction;

/// Order type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind {
    Market,
    Limit,
}

impl std::fmt::Display for OrderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Market => write!(f, "MKT"),
            Self::Limit => write!(f, "LMT"),
        }
    }
}

/// Broker-side order request, immutable once submitted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSpec {
    pub action: Direction,
    pub kind: OrderKind,
    pub quantity: u32,
    /// Set for limit orders, rounded to cents
    pub limit_price: Option<f64>,
    pub time_in_force: String,
    pub outside_rth: bool,
}

pub fn round_to_cents(price: f64) -> f64 {
    (price * 100.0).round() / 100.0
}

impl OrderSpec {
    /// Day market order
    pub fn market(action: Direction, quantity: u32) -> Self {
        Self {
            action,
            kind: OrderKind::Market,
            quantity,
            limit_price: None,
            time_in_force: "DAY".to_string(),
            outside_rth: false,
        }
    }

    /// Day limit order allowed to fill outside regular hours
    pub fn limit(action: Direction, quantity: u32, limit_price: f64) -> Self {
        Self {
            action,
            kind: OrderKind::Limit,
            quantity,
            limit_price: Some(round_to_cents(limit_price)),
            time_in_force: "DAY".to_string(),
            outside_rth: true,
        }
    }

    /// Market order during regular hours, otherwise a limit order `offset`
    /// through the reference price (above it to buy, below it to sell)
    pub fn for_session(
        action: Direction,
        quantity: u32,
        reference_price: f64,
        regular_hours: bool,
        offset: f64,
    ) -> Self {
        if regular_hours {
            return Self::market(action, quantity);
        }
        let price = match action {
            Direction::Buy => reference_price * (1.0 + offset),
            Direction::Sell => reference_price * (1.0 - offset),
        };
        Self::limit(action, quantity, price)
    }

    /// Ledger label: `Market` or `Limit @ $x.xx`
    pub fn label(&self) -> String {
        match (self.kind, self.limit_price) {
            (OrderKind::Limit, Some(price)) => format!("Limit @ ${:.2}", price),
            _ => "Market".to_string(),
        }
    }
}

impl std::fmt::Display for OrderSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.limit_price {
            Some(price) => write!(f, "{} {} {} @ {:.2} {}", self.action, self.quantity, self.kind, price, self.time_in_force),
            None => write!(f, "{} {} {} {}", self.action, self.quantity, self.kind, self.time_in_force),
        }
    }
}

/// Broker order status, as reported by the gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    PendingSubmit,
    PreSubmitted,
    Submitted,
    Filled,
    Cancelled,
    ApiCancelled,
    Rejected,
    Inactive,
    Other(String),
}

impl OrderStatus {
    pub fn parse(status: &str) -> Self {
        match status {
            "PendingSubmit" => Self::PendingSubmit,
            "PreSubmitted" => Self::PreSubmitted,
            "Submitted" => Self::Submitted,
            "Filled" => Self::Filled,
            "Cancelled" => Self::Cancelled,
            "ApiCancelled" => Self::ApiCancelled,
            "Rejected" => Self::Rejected,
            "Inactive" => Self::Inactive,
            other => Self::Other(other.to_string()),
        }
    }

    /// Terminal without a fill
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::Cancelled | Self::ApiCancelled | Self::Rejected | Self::Inactive
        )
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PendingSubmit => write!(f, "PendingSubmit"),
            Self::PreSubmitted => write!(f, "PreSubmitted"),
            Self::Submitted => write!(f, "Submitted"),
            Self::Filled => write!(f, "Filled"),
            Self::Cancelled => write!(f, "Cancelled"),
            Self::ApiCancelled => write!(f, "ApiCancelled"),
            Self::Rejected => write!(f, "Rejected"),
            Self::Inactive => write!(f, "Inactive"),
            Self::Other(s) => write!(f, "{}", s),
        }
    }
}

/// Broker confirmation that an order executed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub filled_quantity: f64,
    pub avg_fill_price: f64,
    pub last_fill_price: f64,
    pub fill_time: DateTime<Utc>,
    pub status: OrderStatus,
}

impl Fill {
    pub fn at(price: f64, quantity: f64) -> Self {
        Self {
            filled_quantity: quantity,
            avg_fill_price: price,
            last_fill_price: price,
            fill_time: Utc::now(),
            status: OrderStatus::Filled,
        }
    }
}
