//! Signal Aggregator
//!
//! Turns the three indicator readings into a trade direction with a
//! confidence weight.

use serde::{Deserialize, Serialize};

/// Reading of a single indicator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Signal {
    Buy,
    Sell,
    #[default]
    None,
}

impl Signal {
    pub fn direction(self) -> Option<Direction> {
        match self {
            Self::Buy => Some(Direction::Buy),
            Self::Sell => Some(Direction::Sell),
            Self::None => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
            Self::None => "none",
        }
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Signal {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "buy" => Ok(Self::Buy),
            "sell" => Ok(Self::Sell),
            "none" | "" => Ok(Self::None),
            other => anyhow::bail!("unknown signal: {}", other),
        }
    }
}

/// Trade direction of an aligned signal or an open position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Buy,
    Sell,
}

impl Direction {
    pub fn opposite(&self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    pub fn as_signal(self) -> Signal {
        match self {
            Self::Buy => Signal::Buy,
            Self::Sell => Signal::Sell,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

impl std::str::FromStr for Direction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "buy" => Ok(Self::Buy),
            "sell" => Ok(Self::Sell),
            other => anyhow::bail!("unknown direction: {}", other),
        }
    }
}

/// The three indicator readings of one analysis pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SignalSet {
    #[serde(rename = "STM")]
    pub stm: Signal,
    #[serde(rename = "TD")]
    pub td: Signal,
    #[serde(rename = "Zigzag")]
    pub zigzag: Signal,
}

impl SignalSet {
    pub fn new(stm: Signal, td: Signal, zigzag: Signal) -> Self {
        Self { stm, td, zigzag }
    }
}

/// An aligned reading: direction plus confidence in [0, 1]
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Alignment {
    pub direction: Direction,
    pub confidence: f64,
}

/// Confidence when all three indicators agree
pub const FULL_CONFIDENCE: f64 = 1.0;
/// Confidence when STM and Zigzag agree and TD does not
pub const PARTIAL_CONFIDENCE: f64 = 0.5;

/// Alignment policy.
///
/// All three agree on a direction: confidence 1.0. STM and Zigzag agree
/// while TD says something else: confidence 0.5. Anything else is not
/// aligned.
///
/// NOTE: a stricter variant of this policy trades only on the full
/// three-way match; callers wanting that can filter on
/// `confidence == FULL_CONFIDENCE`.
pub fn align(signals: &SignalSet) -> Option<Alignment> {
    let direction = signals.stm.direction()?;
    if signals.zigzag != signals.stm {
        return None;
    }
    let confidence = if signals.td == signals.stm {
        FULL_CONFIDENCE
    } else {
        PARTIAL_CONFIDENCE
    };
    Some(Alignment {
        direction,
        confidence,
    })
}

/// True iff both readings are directions and they differ
pub fn is_opposite(current: Signal, new: Signal) -> bool {
    match (current.direction(), new.direction()) {
        (Some(a), Some(b)) => a != b,
        _ => false,
    }
}
