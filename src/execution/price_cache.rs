//! Shared last-price cache
//!
//! Written by market-data callbacks, read by the lifecycle manager. Every
//! operation is a single atomic get or set per symbol; nothing composes a
//! read-modify-write across calls.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CachedPrice {
    pub price: f64,
    pub updated_at: DateTime<Utc>,
}

/// symbol -> last tradable price. Cloning shares the same map.
#[derive(Debug, Clone, Default)]
pub struct PriceCache {
    prices: Arc<DashMap<String, CachedPrice>>,
}

impl PriceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a price; non-positive or non-finite values are ignored
    pub fn set(&self, symbol: &str, price: f64) {
        if price.is_finite() && price > 0.0 {
            self.prices.insert(
                symbol.to_string(),
                CachedPrice {
                    price,
                    updated_at: Utc::now(),
                },
            );
        }
    }

    pub fn get(&self, symbol: &str) -> Option<f64> {
        self.entry(symbol).map(|c| c.price)
    }

    pub fn entry(&self, symbol: &str) -> Option<CachedPrice> {
        self.prices.get(symbol).map(|c| *c)
    }

    pub fn remove(&self, symbol: &str) {
        self.prices.remove(symbol);
    }

    pub fn len(&self) -> usize {
        self.prices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get() {
        let cache = PriceCache::new();
        assert_eq!(cache.get("AAPL"), None);
        cache.set("AAPL", 190.25);
        assert_eq!(cache.get("AAPL"), Some(190.25));
        cache.set("AAPL", 191.0);
        assert_eq!(cache.get("AAPL"), Some(191.0));
    }

    #[test]
    fn test_rejects_bad_prices() {
        let cache = PriceCache::new();
        cache.set("TSLA", 0.0);
        cache.set("TSLA", -1.0);
        cache.set("TSLA", f64::NAN);
        assert!(cache.is_empty());
        cache.set("TSLA", 250.0);
        cache.set("TSLA", -1.0);
        assert_eq!(cache.get("TSLA"), Some(250.0));
    }

    #[test]
    fn test_clones_share_state() {
        let writer = PriceCache::new();
        let reader = writer.clone();
        let handle = std::thread::spawn(move || writer.set("NVDA", 120.5));
        handle.join().unwrap();
        assert_eq!(reader.get("NVDA"), Some(120.5));
        reader.remove("NVDA");
        assert_eq!(reader.len(), 0);
    }
}
