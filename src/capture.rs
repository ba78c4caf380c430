//! Screenshot capture boundary
//!
//! Browser automation and ticker OCR live outside this crate; whatever
//! produces the cropped chart strips hands them over as `CapturedFrame`s.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

use anyhow::{Context, Result};
use image::RgbImage;
use tracing::{debug, warn};

use crate::vision::load_rgb;

/// One cropped chart strip for one symbol
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub symbol: String,
    pub image: RgbImage,
    /// Where the frame came from, for logging
    pub source: String,
}

/// Produces the frames for one capture cycle
pub trait FrameSource: Send + Sync {
    fn capture(&self) -> Result<Vec<CapturedFrame>>;
}

/// `AAPL_20250312_1005.png` -> `AAPL`
pub fn symbol_from_path(path: &Path) -> Option<String> {
    let stem = path.file_stem()?.to_str()?;
    let symbol = stem.split('_').next()?.trim();
    if symbol.is_empty() {
        None
    } else {
        Some(symbol.to_uppercase())
    }
}

/// Reads `*.png` frames dropped into a directory by an external capturer.
/// A file is only handed out again after it has been rewritten.
pub struct DirectoryFrameSource {
    dir: PathBuf,
    seen: Mutex<HashMap<PathBuf, SystemTime>>,
}

impl DirectoryFrameSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            seen: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn is_fresh(&self, path: &Path, modified: SystemTime) -> bool {
        let Ok(mut seen) = self.seen.lock() else {
            return true;
        };
        match seen.get(path) {
            Some(previous) if *previous >= modified => false,
            _ => {
                seen.insert(path.to_path_buf(), modified);
                true
            }
        }
    }
}

impl FrameSource for DirectoryFrameSource {
    fn capture(&self) -> Result<Vec<CapturedFrame>> {
        let entries = std::fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to read frame directory {}", self.dir.display()))?;

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| e.eq_ignore_ascii_case("png"))
            })
            .collect();
        paths.sort();

        let mut frames = Vec::new();
        for path in paths {
            let Some(symbol) = symbol_from_path(&path) else {
                warn!(path = %path.display(), "cannot derive symbol from file name");
                continue;
            };
            let modified = std::fs::metadata(&path)
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            if !self.is_fresh(&path, modified) {
                debug!(path = %path.display(), "frame unchanged, skipping");
                continue;
            }
            match load_rgb(&path) {
                Ok(image) => frames.push(CapturedFrame {
                    symbol,
                    image,
                    source: path.display().to_string(),
                }),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable frame"),
            }
        }
        debug!(dir = %self.dir.display(), count = frames.len(), "captured frames");
        Ok(frames)
    }
}
