//! Candle Locator
//!
//! Finds candle bodies in a cropped chart strip by horizontal continuity:
//! every column is tagged red, green or nothing, adjacent columns of the same
//! tag collapse into segments, and the modal segment width is taken as the
//! candle width for this image.

use image::RgbImage;
use rayon::prelude::*;
use serde::Serialize;
use tracing::debug;

use super::color::{classify_rgb, ColorCategory};

/// Attempts below this many candles trigger the widened retry
const MIN_CANDLES: usize = 5;
/// A retry width is accepted outright once it yields this many candles
const GOOD_CANDLES: usize = 8;
/// How many of the most frequent widths the retry tries
const RETRY_WIDTHS: usize = 3;

/// Body color of a candle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CandleColor {
    Red,
    Green,
}

/// A maximal run of same-colored adjacent columns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CandleSegment {
    pub left: u32,
    pub right: u32,
    pub center: u32,
    pub width: u32,
    pub color: CandleColor,
}

impl CandleSegment {
    fn new(left: u32, right: u32, color: CandleColor) -> Self {
        Self {
            left,
            right,
            center: (left + right) / 2,
            width: right - left + 1,
            color,
        }
    }
}

/// Result of one locator pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CandleDetection {
    /// Every segment, left to right
    pub segments: Vec<CandleSegment>,
    /// Segments accepted as candles, left to right
    pub candles: Vec<CandleSegment>,
    /// Width the candles were selected around (0 when nothing was found)
    pub candle_width: u32,
}

impl CandleDetection {
    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }
}

/// Red wins when a column holds both colors.
fn column_color(image: &RgbImage, x: u32) -> Option<CandleColor> {
    let mut has_red = false;
    let mut has_green = false;
    for y in 0..image.height() {
        let px = image.get_pixel(x, y).0;
        if !has_red && classify_rgb(ColorCategory::Red, px) {
            has_red = true;
        }
        if !has_green && classify_rgb(ColorCategory::Green, px) {
            has_green = true;
        }
        if has_red && has_green {
            break;
        }
    }

    if has_red {
        Some(CandleColor::Red)
    } else if has_green {
        Some(CandleColor::Green)
    } else {
        None
    }
}

fn build_segments(columns: &[Option<CandleColor>]) -> Vec<CandleSegment> {
    let mut segments = Vec::new();
    let mut current: Option<(u32, u32, CandleColor)> = None;

    for (x, color) in columns.iter().enumerate() {
        let Some(color) = *color else { continue };
        let x = x as u32;
        current = match current {
            Some((left, right, c)) if c == color && x == right + 1 => Some((left, x, c)),
            Some((left, right, c)) => {
                segments.push(CandleSegment::new(left, right, c));
                Some((x, x, color))
            }
            None => Some((x, x, color)),
        };
    }
    if let Some((left, right, c)) = current {
        segments.push(CandleSegment::new(left, right, c));
    }
    segments
}

/// (width, count) pairs in order of first appearance
fn width_histogram(segments: &[CandleSegment]) -> Vec<(u32, usize)> {
    let mut hist: Vec<(u32, usize)> = Vec::new();
    for seg in segments {
        match hist.iter_mut().find(|(w, _)| *w == seg.width) {
            Some((_, count)) => *count += 1,
            None => hist.push((seg.width, 1)),
        }
    }
    hist
}

fn select(segments: &[CandleSegment], width: u32, tolerance: u32) -> Vec<CandleSegment> {
    segments
        .iter()
        .filter(|s| s.width.abs_diff(width) <= tolerance)
        .copied()
        .collect()
}

/// Locate candles in `image`.
///
/// Never fails: an empty image or one with no red/green columns yields an
/// empty detection and the caller decides how to report it.
pub fn locate_candles(image: &RgbImage) -> CandleDetection {
    if image.width() == 0 || image.height() == 0 {
        return CandleDetection::default();
    }

    let columns: Vec<Option<CandleColor>> = (0..image.width())
        .into_par_iter()
        .map(|x| column_color(image, x))
        .collect();

    let segments = build_segments(&columns);
    if segments.is_empty() {
        return CandleDetection::default();
    }

    let hist = width_histogram(&segments);

    // first-seen width wins a tie
    let mut mode = hist[0];
    for &(w, count) in &hist[1..] {
        if count > mode.1 {
            mode = (w, count);
        }
    }
    let mode_width = mode.0;

    let mut candles = select(&segments, mode_width, (mode_width / 4).max(1));
    let mut candle_width = mode_width;

    if candles.len() < MIN_CANDLES {
        debug!(found = candles.len(), mode_width, "few candles at modal width, retrying");

        // stable sort keeps first-seen order among equal counts
        let mut ranked = hist.clone();
        ranked.sort_by(|a, b| b.1.cmp(&a.1));

        for &(w, _) in ranked.iter().take(RETRY_WIDTHS) {
            let tolerance = (w / 3).max(2);
            let attempt = select(&segments, w, tolerance);
            debug!(width = w, tolerance, found = attempt.len(), "candle width attempt");
            if attempt.len() >= GOOD_CANDLES {
                candles = attempt;
                candle_width = w;
                break;
            }
            if attempt.len() > candles.len() {
                candles = attempt;
                candle_width = w;
            }
        }
    }

    debug!(
        segments = segments.len(),
        candles = candles.len(),
        candle_width,
        "candle detection complete"
    );

    CandleDetection {
        segments,
        candles,
        candle_width,
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use image::{Rgb, RgbImage};

    pub const WHITE: Rgb<u8> = Rgb([255, 255, 255]);
    pub const RED: Rgb<u8> = Rgb([234, 67, 53]);
    pub const GREEN: Rgb<u8> = Rgb([8, 153, 129]);

    pub fn blank(width: u32, height: u32) -> RgbImage {
        RgbImage::from_pixel(width, height, WHITE)
    }

    /// Paint columns `left..=right` over rows `top..bottom`
    pub fn paint(img: &mut RgbImage, left: u32, right: u32, top: u32, bottom: u32, color: Rgb<u8>) {
        for x in left..=right {
            for y in top..bottom {
                img.put_pixel(x, y, color);
            }
        }
    }
}
