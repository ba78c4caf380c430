//! Signal Scanner
//!
//! Reads indicator colors along the vertical line through the reference
//! candle. Priority between categories is always an explicit ordered slice.

use std::ops::Range;

use image::RgbImage;
use serde::{Deserialize, Serialize};

use super::candles::CandleSegment;
use super::color::{classify_rgb, ColorCategory};
use super::error::AnalysisError;

/// Vertical extent of a scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanRange {
    /// Rows height/2 .. height
    LowerHalf,
    /// Rows 0 .. height/2
    UpperHalf,
    Full,
}

impl ScanRange {
    pub fn rows(self, height: u32) -> Range<u32> {
        match self {
            Self::LowerHalf => height / 2..height,
            Self::UpperHalf => 0..height / 2,
            Self::Full => 0..height,
        }
    }
}

/// Center of the second-rightmost candle.
///
/// The rightmost candle may still be forming, so the one before it anchors
/// every indicator scan.
pub fn reference_x(candles: &[CandleSegment]) -> Result<u32, AnalysisError> {
    if candles.len() < 2 {
        return Err(AnalysisError::InsufficientCandles {
            found: candles.len(),
        });
    }
    let mut centers: Vec<u32> = candles.iter().map(|c| c.center).collect();
    centers.sort_unstable_by(|a, b| b.cmp(a));
    Ok(centers[1])
}

fn matches_at(image: &RgbImage, category: ColorCategory, x: u32, y: u32) -> bool {
    x < image.width() && y < image.height() && classify_rgb(category, image.get_pixel(x, y).0)
}

/// First category in `priority` present anywhere in the column range.
pub fn directional_scan(
    image: &RgbImage,
    x: u32,
    range: ScanRange,
    priority: &[ColorCategory],
) -> Option<ColorCategory> {
    if x >= image.width() {
        return None;
    }
    let rows = range.rows(image.height());
    priority
        .iter()
        .copied()
        .find(|&category| rows.clone().any(|y| matches_at(image, category, x, y)))
}

/// Does `category` hold at every pixel exactly 1..=span columns to each side
/// of (x, y)? A window running off either edge never validates.
pub fn validate_horizontal_line(
    image: &RgbImage,
    category: ColorCategory,
    x: u32,
    y: u32,
    span: u32,
) -> bool {
    if y >= image.height() || x < span || x.saturating_add(span) >= image.width() {
        return false;
    }
    (1..=span).all(|dx| {
        matches_at(image, category, x - dx, y) && matches_at(image, category, x + dx, y)
    })
}

/// Like [`directional_scan`] but a hit only counts once its row carries a
/// validated horizontal band of the same category. Returns the category and
/// the row of the first validated hit.
pub fn validated_scan(
    image: &RgbImage,
    x: u32,
    range: ScanRange,
    priority: &[ColorCategory],
    span: u32,
) -> Option<(ColorCategory, u32)> {
    if x >= image.width() {
        return None;
    }
    let rows = range.rows(image.height());
    priority.iter().copied().find_map(|category| {
        rows.clone()
            .find(|&y| {
                matches_at(image, category, x, y)
                    && validate_horizontal_line(image, category, x, y, span)
            })
            .map(|y| (category, y))
    })
}
