use std::path::PathBuf;

use thiserror::Error;

/// Perception failures, reported per symbol
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("image has no pixels")]
    EmptyImage,

    #[error("no candles detected")]
    NoCandles,

    #[error("insufficient candles: need at least 2, found {found}")]
    InsufficientCandles { found: usize },

    #[error("failed to load image {path}")]
    ImageLoad {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}
