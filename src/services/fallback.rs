use crate::types::{
    display_name, round_to_precision, InstrumentClass, MarketPrice, PriceSource,
};
use dashmap::DashMap;
use rand::Rng;
use std::time::Duration;
use tracing::debug;

/// How long a last-known live price stays usable for synthetic continuation.
const LAST_KNOWN_MAX_AGE: Duration = Duration::from_secs(60);

/// Fraction of drift retained per tick; the remainder reverts toward zero so
/// synthetic prices never wander unboundedly from the anchor.
const DRIFT_RETENTION: f64 = 0.9;

/// Approximate real-world rates used when no live anchor exists.
const BASE_RATES: &[(&str, f64)] = &[
    ("EURUSD", 1.0850),
    ("GBPUSD", 1.2700),
    ("USDJPY", 149.50),
    ("USDCHF", 0.8800),
    ("AUDUSD", 0.6550),
    ("USDCAD", 1.3600),
    ("NZDUSD", 0.6100),
    ("EURGBP", 0.8550),
    ("EURJPY", 162.20),
    ("GBPJPY", 189.90),
    ("XAUUSD", 2035.00),
    ("XAGUSD", 23.10),
    ("WTIUSD", 78.50),
    ("BTCUSD", 43500.0),
    ("ETHUSD", 2280.0),
    ("US30", 38500.0),
    ("NAS100", 17200.0),
    ("SPX500", 4890.0),
];

/// Fallback used for entirely unknown symbols.
const DEFAULT_BASE_RATE: f64 = 1.0;

#[derive(Debug, Clone, Copy)]
struct LastKnown {
    price: f64,
    recorded_at: std::time::Instant,
}

/// Produces a plausible price when live data is unavailable.
///
/// Two paths: a mean-reverting random walk continuing the last known live
/// price (source = `synthetic`), or a bootstrap from the static base-rate
/// table when no recent anchor exists (source = `fallback`).
pub struct FallbackPriceProvider {
    last_known: DashMap<String, LastKnown>,
    /// Per-symbol drift carried between synthetic ticks.
    drift: DashMap<String, f64>,
}

impl FallbackPriceProvider {
    pub fn new() -> Self {
        Self {
            last_known: DashMap::new(),
            drift: DashMap::new(),
        }
    }

    /// Record a live price so the synthetic path stays anchored to reality.
    /// Called by the market-data service on every successful fetch.
    pub fn update_last_known(&self, symbol: &str, price: f64) {
        self.last_known.insert(
            symbol.to_string(),
            LastKnown {
                price,
                recorded_at: std::time::Instant::now(),
            },
        );
        // A fresh anchor resets accumulated drift.
        self.drift.remove(symbol);
    }

    /// Produce a price for `symbol`, synthetic if a fresh anchor exists,
    /// otherwise bootstrapped from the base-rate table.
    pub fn get_price(&self, symbol: &str) -> MarketPrice {
        let anchor = self.last_known.get(symbol).and_then(|entry| {
            if entry.recorded_at.elapsed() <= LAST_KNOWN_MAX_AGE {
                Some(entry.price)
            } else {
                None
            }
        });

        match anchor {
            Some(price) => self.synthetic_continuation(symbol, price),
            None => self.bootstrap(symbol),
        }
    }

    fn synthetic_continuation(&self, symbol: &str, anchor: f64) -> MarketPrice {
        let class = InstrumentClass::of(symbol);
        let volatility = class.volatility();

        let mut rng = rand::thread_rng();
        let step = (rng.gen::<f64>() - 0.5) * volatility;

        let mut drift = self.drift.entry(symbol.to_string()).or_insert(0.0);
        *drift = *drift * DRIFT_RETENTION + step;
        let applied_drift = *drift;
        drop(drift);

        let price = anchor * (1.0 + applied_drift);
        debug!("synthetic continuation for {}: {:.6}", symbol, price);
        self.build_price(symbol, class, price, anchor, PriceSource::Synthetic)
    }

    fn bootstrap(&self, symbol: &str) -> MarketPrice {
        let class = InstrumentClass::of(symbol);
        let base = BASE_RATES
            .iter()
            .find(|(s, _)| *s == symbol)
            .map(|(_, rate)| *rate)
            .unwrap_or(DEFAULT_BASE_RATE);

        let mut rng = rand::thread_rng();
        let noise = (rng.gen::<f64>() - 0.5) * 2.0 * class.volatility();
        let price = base * (1.0 + noise);

        debug!("base-rate bootstrap for {}: {:.6}", symbol, price);
        self.build_price(symbol, class, price, base, PriceSource::Fallback)
    }

    fn build_price(
        &self,
        symbol: &str,
        class: InstrumentClass,
        raw_price: f64,
        open: f64,
        source: PriceSource,
    ) -> MarketPrice {
        let decimals = class.decimals();
        let price = round_to_precision(raw_price.max(f64::MIN_POSITIVE), decimals);
        let half_spread = price * class.spread() / 2.0;

        let bid = round_to_precision(price - half_spread, decimals);
        let ask = round_to_precision(price + half_spread, decimals);

        let change = price - open;
        let change_percent = if open != 0.0 { change / open * 100.0 } else { 0.0 };

        let mut rng = rand::thread_rng();
        let wiggle = price * class.volatility();
        let high = round_to_precision(price.max(open) + rng.gen::<f64>() * wiggle, decimals);
        let low = round_to_precision((price.min(open) - rng.gen::<f64>() * wiggle).max(0.0), decimals);
        let volume = (rng.gen::<f64>() * 9000.0 + 1000.0).round();

        MarketPrice {
            symbol: symbol.to_string(),
            name: display_name(symbol),
            price,
            bid,
            ask,
            change,
            change_percent,
            high,
            low,
            volume,
            timestamp: chrono::Utc::now().timestamp_millis(),
            category: class.category(),
            source,
        }
    }
}

impl Default for FallbackPriceProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bootstrap_without_anchor() {
        let provider = FallbackPriceProvider::new();
        let price = provider.get_price("EURUSD");
        assert_eq!(price.source, PriceSource::Fallback);
        // Bounded noise keeps the bootstrap near the base rate.
        assert!((price.price - 1.085).abs() / 1.085 < 0.01);
    }

    #[test]
    fn test_synthetic_with_fresh_anchor() {
        let provider = FallbackPriceProvider::new();
        provider.update_last_known("EURUSD", 1.1);
        let price = provider.get_price("EURUSD");
        assert_eq!(price.source, PriceSource::Synthetic);
        assert!((price.price - 1.1).abs() / 1.1 < 0.01);
    }

    #[test]
    fn test_bid_ask_ordering() {
        let provider = FallbackPriceProvider::new();
        for (symbol, _) in crate::types::SYMBOLS {
            let price = provider.get_price(symbol);
            assert!(price.price > 0.0, "{} price not positive", symbol);
            assert!(price.bid <= price.price, "{} bid above mid", symbol);
            assert!(price.price <= price.ask, "{} ask below mid", symbol);
            assert!(price.high >= price.low, "{} high below low", symbol);
        }
    }

    #[test]
    fn test_unknown_symbol_still_prices() {
        let provider = FallbackPriceProvider::new();
        let price = provider.get_price("ZZZXYZ");
        assert_eq!(price.source, PriceSource::Fallback);
        assert!(price.price > 0.0);
        assert!(price.price.is_finite());
        assert!(price.bid.is_finite() && price.ask.is_finite());
        assert!(price.change_percent.is_finite());
    }

    #[test]
    fn test_jpy_precision() {
        let provider = FallbackPriceProvider::new();
        provider.update_last_known("USDJPY", 149.5);
        let price = provider.get_price("USDJPY");
        // 3 decimals for JPY pairs
        let scaled = price.price * 1000.0;
        assert!((scaled - scaled.round()).abs() < 1e-6);
    }

    #[test]
    fn test_mean_reversion_keeps_walk_bounded() {
        let provider = FallbackPriceProvider::new();
        provider.update_last_known("EURUSD", 1.1);
        // Many consecutive synthetic ticks must stay near the anchor: with 10%
        // of drift shed per tick, total drift is bounded by ~10x one step.
        for _ in 0..200 {
            let price = provider.get_price("EURUSD");
            assert!((price.price - 1.1).abs() / 1.1 < 0.05);
        }
    }

    #[test]
    fn test_anchor_resets_drift() {
        let provider = FallbackPriceProvider::new();
        provider.update_last_known("EURUSD", 1.1);
        for _ in 0..50 {
            provider.get_price("EURUSD");
        }
        provider.update_last_known("EURUSD", 1.2);
        let price = provider.get_price("EURUSD");
        assert!((price.price - 1.2).abs() / 1.2 < 0.01);
    }
}
