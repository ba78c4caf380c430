//! Chart signal extraction
//!
//! Reads candle positions and three indicator states (STM, TD, Zigzag) from
//! a cropped chart screenshot using hand-tuned color rules.

pub mod analyzer;
pub mod candles;
pub mod color;
mod error;
pub mod scanner;
pub mod signals;

pub use analyzer::{load_rgb, ChartAnalysis, ChartAnalyzer, IndicatorScan, ScanConfig, DEFAULT_LINE_SPAN};
pub use candles::{locate_candles, CandleColor, CandleDetection, CandleSegment};
pub use color::{classify, ColorCategory, ColorRule};
pub use error::AnalysisError;
pub use scanner::{directional_scan, reference_x, validate_horizontal_line, validated_scan, ScanRange};
pub use signals::{align, is_opposite, Alignment, Direction, Signal, SignalSet};
