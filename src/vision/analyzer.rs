//! One full perception pass over a cropped chart strip

use std::path::Path;

use image::RgbImage;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::candles::locate_candles;
use super::color::ColorCategory;
use super::error::AnalysisError;
use super::scanner::{directional_scan, reference_x, validated_scan, ScanRange};
use super::signals::{Signal, SignalSet};

/// Default half-width of the horizontal band a Zigzag hit must sit on
pub const DEFAULT_LINE_SPAN: u32 = 45;

/// How one indicator is read off the reference column
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorScan {
    pub range: ScanRange,
    /// Require a validated horizontal band around each hit
    pub validated: bool,
    /// Categories in priority order and the signal each one means
    pub priority: Vec<(ColorCategory, Signal)>,
}

impl IndicatorScan {
    fn categories(&self) -> Vec<ColorCategory> {
        self.priority.iter().map(|(c, _)| *c).collect()
    }

    fn signal_for(&self, category: ColorCategory) -> Signal {
        self.priority
            .iter()
            .find(|(c, _)| *c == category)
            .map(|(_, s)| *s)
            .unwrap_or(Signal::None)
    }

    /// Read this indicator at column `x`
    pub fn read(&self, image: &RgbImage, x: u32, line_span: u32) -> Signal {
        let categories = self.categories();
        let hit = if self.validated {
            validated_scan(image, x, self.range, &categories, line_span).map(|(c, y)| {
                debug!(category = %c, x, y, "validated horizontal band");
                c
            })
        } else {
            directional_scan(image, x, self.range, &categories)
        };
        hit.map(|c| self.signal_for(c)).unwrap_or(Signal::None)
    }
}

/// Scanner configuration for the three indicators
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Pixels each side of a Zigzag hit that must share its color
    pub line_span: u32,
    pub stm: IndicatorScan,
    pub td: IndicatorScan,
    pub zigzag: IndicatorScan,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            line_span: DEFAULT_LINE_SPAN,
            stm: IndicatorScan {
                range: ScanRange::LowerHalf,
                validated: false,
                priority: vec![
                    (ColorCategory::Orange, Signal::Buy),
                    (ColorCategory::Purple, Signal::Sell),
                ],
            },
            td: IndicatorScan {
                range: ScanRange::Full,
                validated: false,
                priority: vec![
                    (ColorCategory::Yellow, Signal::Buy),
                    (ColorCategory::Blue, Signal::Sell),
                ],
            },
            zigzag: IndicatorScan {
                range: ScanRange::Full,
                validated: true,
                priority: vec![
                    (ColorCategory::Fuchsia, Signal::Buy),
                    (ColorCategory::Aqua, Signal::Sell),
                ],
            },
        }
    }
}

impl ScanConfig {
    pub fn with_line_span(mut self, line_span: u32) -> Self {
        self.line_span = line_span;
        self
    }
}

/// Result of analysing one chart
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ChartAnalysis {
    #[serde(flatten)]
    pub signals: SignalSet,
    pub reference_x: u32,
    pub candle_count: usize,
    pub candle_width: u32,
}

/// Runs candle location and the three indicator scans
#[derive(Debug, Clone, Default)]
pub struct ChartAnalyzer {
    config: ScanConfig,
}

impl ChartAnalyzer {
    pub fn new(config: ScanConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    pub fn analyze(&self, image: &RgbImage) -> Result<ChartAnalysis, AnalysisError> {
        if image.width() == 0 || image.height() == 0 {
            return Err(AnalysisError::EmptyImage);
        }

        let detection = locate_candles(image);
        if detection.is_empty() {
            return Err(AnalysisError::NoCandles);
        }
        let x = reference_x(&detection.candles)?;

        let span = self.config.line_span;
        let signals = SignalSet {
            stm: self.config.stm.read(image, x, span),
            td: self.config.td.read(image, x, span),
            zigzag: self.config.zigzag.read(image, x, span),
        };

        info!(
            stm = %signals.stm,
            td = %signals.td,
            zigzag = %signals.zigzag,
            reference_x = x,
            candles = detection.candles.len(),
            "chart analysed"
        );

        Ok(ChartAnalysis {
            signals,
            reference_x: x,
            candle_count: detection.candles.len(),
            candle_width: detection.candle_width,
        })
    }

    pub fn analyze_file(&self, path: &Path) -> Result<ChartAnalysis, AnalysisError> {
        let image = load_rgb(path)?;
        self.analyze(&image)
    }
}

/// Decode an image file to RGB, dropping any alpha channel
pub fn load_rgb(path: &Path) -> Result<RgbImage, AnalysisError> {
    image::open(path)
        .map(|img| img.to_rgb8())
        .map_err(|source| AnalysisError::ImageLoad {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vision::candles::test_support::*;
    use image::Rgb;

    // darker than the classifier's yellow threshold so TD stays clean
    const ORANGE: Rgb<u8> = Rgb([160, 100, 20]);
    const BLUE: Rgb<u8> = Rgb([41, 98, 255]);
    const FUCHSIA: Rgb<u8> = Rgb([224, 64, 251]);
    const AQUA: Rgb<u8> = Rgb([0, 188, 212]);

    /// Candles at x=[10,17], [30,37], [50,57] in the top band; reference x=33
    fn chart() -> RgbImage {
        let mut img = blank(100, 80);
        paint(&mut img, 10, 17, 2, 20, RED);
        paint(&mut img, 30, 37, 5, 22, RED);
        paint(&mut img, 50, 57, 4, 18, GREEN);
        img
    }

    #[test]
    fn test_analyze_reads_all_three() {
        let mut img = chart();
        paint(&mut img, 33, 33, 60, 64, ORANGE);
        paint(&mut img, 33, 33, 25, 27, BLUE);
        paint(&mut img, 13, 53, 30, 31, AQUA);

        let analyzer = ChartAnalyzer::new(ScanConfig::default().with_line_span(20));
        let analysis = analyzer.analyze(&img).unwrap();
        assert_eq!(analysis.reference_x, 33);
        assert_eq!(analysis.candle_count, 3);
        assert_eq!(analysis.signals, SignalSet::new(Signal::Buy, Signal::Sell, Signal::Sell));
    }

    #[test]
    fn test_stm_ignores_upper_half() {
        let mut img = chart();
        paint(&mut img, 33, 33, 24, 28, ORANGE);
        let analysis = ChartAnalyzer::default().analyze(&img).unwrap();
        assert_eq!(analysis.signals.stm, Signal::None);
    }

    #[test]
    fn test_short_band_is_not_a_zigzag() {
        let mut img = chart();
        paint(&mut img, 23, 43, 40, 41, FUCHSIA);
        let analyzer = ChartAnalyzer::new(ScanConfig::default().with_line_span(20));
        assert_eq!(analyzer.analyze(&img).unwrap().signals.zigzag, Signal::None);

        let analyzer = ChartAnalyzer::new(ScanConfig::default().with_line_span(10));
        assert_eq!(analyzer.analyze(&img).unwrap().signals.zigzag, Signal::Buy);
    }

    #[test]
    fn test_failures() {
        let analyzer = ChartAnalyzer::default();
        assert!(matches!(analyzer.analyze(&RgbImage::new(0, 0)), Err(AnalysisError::EmptyImage)));
        assert!(matches!(analyzer.analyze(&blank(40, 40)), Err(AnalysisError::NoCandles)));

        let mut one = blank(40, 40);
        paint(&mut one, 5, 12, 2, 10, RED);
        assert!(matches!(
            analyzer.analyze(&one),
            Err(AnalysisError::InsufficientCandles { found: 1 })
        ));
    }

    #[test]
    fn test_json_output() {
        let analysis = ChartAnalyzer::default().analyze(&chart()).unwrap();
        let json = serde_json::to_value(analysis).unwrap();
        assert_eq!(json["STM"], "none");
        assert_eq!(json["TD"], "none");
        assert_eq!(json["Zigzag"], "none");
        assert_eq!(json["reference_x"], 33);
    }

    #[test]
    fn test_load_rgb_drops_alpha() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aapl_chart.png");
        let rgba = image::RgbaImage::from_pixel(4, 3, image::Rgba([234, 67, 53, 128]));
        rgba.save(&path).unwrap();

        let rgb = load_rgb(&path).unwrap();
        assert_eq!(rgb.dimensions(), (4, 3));
        assert_eq!(rgb.get_pixel(0, 0).0, [234, 67, 53]);

        let missing = load_rgb(&dir.path().join("nope.png"));
        assert!(matches!(missing, Err(AnalysisError::ImageLoad { .. })));
    }
}
