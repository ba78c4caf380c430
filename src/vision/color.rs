//! Pixel color classification
//!
//! Each color category is a fixed list of threshold predicates over an
//! (r, g, b) triple. A pixel belongs to a category iff every predicate holds.
//! Categories are independent: one pixel may satisfy several of them, and
//! callers decide the priority order.

use serde::{Deserialize, Serialize};

/// A single threshold predicate over (r, g, b)
pub type Predicate = fn(i32, i32, i32) -> bool;

/// Named color categories read off the chart
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorCategory {
    Red,
    Green,
    Orange,
    Purple,
    Yellow,
    Blue,
    Aqua,
    Fuchsia,
}

impl ColorCategory {
    pub const ALL: [ColorCategory; 8] = [
        Self::Red,
        Self::Green,
        Self::Orange,
        Self::Purple,
        Self::Yellow,
        Self::Blue,
        Self::Aqua,
        Self::Fuchsia,
    ];

    /// The rule for this category
    pub fn rule(self) -> &'static ColorRule {
        &RULES[self as usize]
    }
}

impl std::fmt::Display for ColorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.rule().name)
    }
}

/// Ordered conjunction of predicates for one category
#[derive(Debug)]
pub struct ColorRule {
    pub category: ColorCategory,
    pub name: &'static str,
    pub predicates: &'static [Predicate],
}

impl ColorRule {
    /// Short-circuit AND over the predicate list
    pub fn matches(&self, r: i32, g: i32, b: i32) -> bool {
        self.predicates.iter().all(|p| p(r, g, b))
    }
}

fn spread(r: i32, g: i32, b: i32) -> i32 {
    r.max(g).max(b) - r.min(g).min(b)
}

static RED: &[Predicate] = &[
    |r, g, b| r as f64 > g.max(b) as f64 * 1.2,
    |r, _, _| r > 100,
    // keeps orange bodies out of red
    |r, g, _| (g as f64) < r as f64 * 0.6,
    |r, _, b| (b as f64) < r as f64 * 0.6,
    |r, g, _| r - g > 50,
    |r, g, b| spread(r, g, b) > 40,
];

static GREEN: &[Predicate] = &[
    |r, g, b| g > r.max(b),
    |_, g, _| g > 50,
    |r, g, b| g - r.max(b) > 10,
    |r, g, b| spread(r, g, b) > 15,
    |r, g, b| g > 80 || (g as f64 > r as f64 * 1.5 && g as f64 > b as f64 * 0.8),
];

static ORANGE: &[Predicate] = &[
    |r, g, b| r > g && g > b,
    |r, _, _| r > 80,
    |r, g, _| g > 30 && (g as f64) < r as f64 * 0.8,
    |r, g, b| (b as f64) < r.min(g) as f64 * 0.5,
    |r, g, b| spread(r, g, b) > 25,
];

static PURPLE: &[Predicate] = &[
    |r, g, b| b as f64 >= r.max(g) as f64 * 0.7,
    |r, g, b| g < r && g < b,
    |r, g, b| spread(r, g, b) > 20,
    |r, _, _| r > 20,
    |_, _, b| b > 30,
];

static YELLOW: &[Predicate] = &[
    |r, g, _| r > 100 && g > 100,
    |r, g, b| (b as f64) < r.min(g) as f64 * 0.6,
    |r, g, b| spread(r, g, b) > 20,
    |r, g, _| r > 50 && g > 50,
];

static BLUE: &[Predicate] = &[
    |r, g, b| b as f64 > r.max(g) as f64 * 1.2,
    |r, g, b| spread(r, g, b) > 15,
    |_, _, b| b > 40,
];

static AQUA: &[Predicate] = &[
    |_, g, b| g > 100 && b > 100,
    |r, g, b| (r as f64) < g.min(b) as f64 * 0.6,
    |_, g, b| (g - b).abs() < 80,
    |r, g, b| spread(r, g, b) > 40,
];

static FUCHSIA: &[Predicate] = &[
    |r, _, b| r > 100 && b > 100,
    |r, g, b| (g as f64) < r.min(b) as f64 * 0.6,
    |r, _, b| (r - b).abs() < 80,
    |r, g, b| spread(r, g, b) > 40,
];

/// Lookup table indexed by `ColorCategory as usize`
static RULES: [ColorRule; 8] = [
    ColorRule { category: ColorCategory::Red, name: "red", predicates: RED },
    ColorRule { category: ColorCategory::Green, name: "green", predicates: GREEN },
    ColorRule { category: ColorCategory::Orange, name: "orange", predicates: ORANGE },
    ColorRule { category: ColorCategory::Purple, name: "purple", predicates: PURPLE },
    ColorRule { category: ColorCategory::Yellow, name: "yellow", predicates: YELLOW },
    ColorRule { category: ColorCategory::Blue, name: "blue", predicates: BLUE },
    ColorRule { category: ColorCategory::Aqua, name: "aqua", predicates: AQUA },
    ColorRule { category: ColorCategory::Fuchsia, name: "fuchsia", predicates: FUCHSIA },
];

/// Does (r, g, b) belong to `category`?
pub fn classify(category: ColorCategory, r: i32, g: i32, b: i32) -> bool {
    category.rule().matches(r, g, b)
}

/// Convenience over an 8-bit pixel
pub fn classify_rgb(category: ColorCategory, rgb: [u8; 3]) -> bool {
    classify(category, rgb[0] as i32, rgb[1] as i32, rgb[2] as i32)
}
