//! Fibonacci take-profit / stop-loss calculator

use serde::Serialize;
use tracing::{info, warn};

use super::gateway::HistoricalBar;
use crate::vision::Direction;

const SL_BASE: f64 = 0.382;
const SL_WIDE: f64 = 0.618;
const TP_BASE: f64 = 1.382;
const TP_WIDE: f64 = 1.618;

/// Minimum risk as a fraction of entry
const MIN_RISK_FRACTION: f64 = 0.005;

/// Levels used when no lookback range is available
const FALLBACK_TP: f64 = 0.01;
const FALLBACK_SL: f64 = 0.005;

pub const DEFAULT_CONFIDENCE: f64 = 0.5;

/// Recent [low, high] price range
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LookbackRange {
    pub low: f64,
    pub high: f64,
}

impl LookbackRange {
    pub fn new(low: f64, high: f64) -> Self {
        Self {
            low: low.min(high),
            high: low.max(high),
        }
    }

    /// Range over the last `lookback` bars, None when there are none
    pub fn from_bars(bars: &[HistoricalBar], lookback: usize) -> Option<Self> {
        let start = bars.len().saturating_sub(lookback);
        let recent = &bars[start..];
        if recent.is_empty() {
            return None;
        }
        let low = recent.iter().map(|b| b.low).fold(f64::INFINITY, f64::min);
        let high = recent.iter().map(|b| b.high).fold(f64::NEG_INFINITY, f64::max);
        if !low.is_finite() || !high.is_finite() {
            return None;
        }
        Some(Self::new(low, high))
    }

    pub fn span(&self) -> f64 {
        self.high - self.low
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LevelSource {
    Fibonacci,
    /// Fixed percentages, no lookback data
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RiskLevels {
    pub take_profit: f64,
    pub stop_loss: f64,
    pub source: LevelSource,
    /// The directional-sanity guard rewrote the raw levels
    pub adjusted: bool,
}

impl RiskLevels {
    /// buy: tp > entry > sl; sell: sl > entry > tp
    pub fn is_directionally_sane(&self, entry: f64, direction: Direction) -> bool {
        match direction {
            Direction::Buy => self.take_profit > entry && entry > self.stop_loss,
            Direction::Sell => self.stop_loss > entry && entry > self.take_profit,
        }
    }
}

/// +1% / -0.5% for a buy, mirrored for a sell
pub fn fallback_levels(entry: f64, direction: Direction) -> RiskLevels {
    let (take_profit, stop_loss) = match direction {
        Direction::Buy => (entry * (1.0 + FALLBACK_TP), entry * (1.0 - FALLBACK_SL)),
        Direction::Sell => (entry * (1.0 - FALLBACK_TP), entry * (1.0 + FALLBACK_SL)),
    };
    RiskLevels {
        take_profit,
        stop_loss,
        source: LevelSource::Fallback,
        adjusted: false,
    }
}

/// Compute TP/SL for a position entered at `entry`.
///
/// Higher confidence tightens the stop and widens the target. Without a
/// range the fixed fallback applies.
pub fn fibonacci_levels(
    entry: f64,
    direction: Direction,
    range: Option<LookbackRange>,
    confidence: Option<f64>,
) -> RiskLevels {
    let Some(range) = range else {
        let levels = fallback_levels(entry, direction);
        info!(
            entry,
            tp = levels.take_profit,
            sl = levels.stop_loss,
            "no lookback range, using fixed TP/SL"
        );
        return levels;
    };

    let confidence = match confidence {
        Some(c) if c.is_finite() => c.clamp(0.0, 1.0),
        _ => DEFAULT_CONFIDENCE,
    };
    let sl_frac = SL_BASE + (1.0 - confidence) * (SL_WIDE - SL_BASE);
    let tp_frac = TP_BASE + confidence * (TP_WIDE - TP_BASE);
    let floor_risk = range.span().max(entry * MIN_RISK_FRACTION);

    let raw_risk = match direction {
        Direction::Buy => entry - range.low,
        Direction::Sell => range.high - entry,
    };
    let risk = if raw_risk > 0.0 { raw_risk } else { floor_risk };

    let levels = match direction {
        Direction::Buy => RiskLevels {
            take_profit: entry + risk * tp_frac,
            stop_loss: entry - risk * sl_frac * 2.0,
            source: LevelSource::Fibonacci,
            adjusted: false,
        },
        Direction::Sell => RiskLevels {
            take_profit: entry - risk * tp_frac,
            stop_loss: entry + risk * sl_frac * 2.0,
            source: LevelSource::Fibonacci,
            adjusted: false,
        },
    };

    let levels = enforce_direction(entry, direction, range, tp_frac, levels);

    info!(
        %direction,
        entry,
        sl_frac,
        tp_frac,
        tp = levels.take_profit,
        sl = levels.stop_loss,
        "fibonacci levels"
    );
    levels
}

/// Directional-sanity guard. Levels on the wrong side of `entry` get the
/// stop moved to the recent extreme (at least 0.5% away) and the target
/// recomputed from the resulting risk.
fn enforce_direction(
    entry: f64,
    direction: Direction,
    range: LookbackRange,
    tp_frac: f64,
    mut levels: RiskLevels,
) -> RiskLevels {
    if levels.is_directionally_sane(entry, direction) {
        return levels;
    }
    warn!(
        %direction,
        entry,
        tp = levels.take_profit,
        sl = levels.stop_loss,
        low = range.low,
        high = range.high,
        "TP/SL violate direction, clamping stop to recent extreme"
    );
    let floor_risk = range.span().max(entry * MIN_RISK_FRACTION);
    match direction {
        Direction::Buy => {
            let stop_loss = range.low.min(entry * (1.0 - MIN_RISK_FRACTION));
            let risk = (entry - stop_loss).max(floor_risk);
            levels.stop_loss = stop_loss;
            levels.take_profit = entry + risk * tp_frac;
        }
        Direction::Sell => {
            let stop_loss = range.high.max(entry * (1.0 + MIN_RISK_FRACTION));
            let risk = (stop_loss - entry).max(floor_risk);
            levels.stop_loss = stop_loss;
            levels.take_profit = entry - risk * tp_frac;
        }
    }
    levels.adjusted = true;
    levels
}
