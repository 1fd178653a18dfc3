use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a price came from. Downstream consumers use this to decide how much
/// to trust a quote: live provider data feeds subscription callbacks,
/// synthetic/fallback data only fills gaps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceSource {
    /// Fetched from the upstream candle provider.
    Oanda,
    /// Random-walk continuation of a recent live price.
    Synthetic,
    /// Bootstrapped from the static base-rate table.
    Fallback,
}

impl PriceSource {
    /// True for prices backed by a real upstream fetch.
    pub fn is_live(&self) -> bool {
        matches!(self, PriceSource::Oanda)
    }
}

impl fmt::Display for PriceSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PriceSource::Oanda => write!(f, "oanda"),
            PriceSource::Synthetic => write!(f, "synthetic"),
            PriceSource::Fallback => write!(f, "fallback"),
        }
    }
}

/// Instrument category shown to consumers (grouping for watchlists).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SymbolCategory {
    Forex,
    Metals,
    Energy,
    Indices,
    Crypto,
}

/// Instrument class used for pricing math: volatility of the synthetic walk,
/// bid/ask spread width, and quote decimal precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstrumentClass {
    Major,
    JpyPair,
    Gold,
    Silver,
    Energy,
    Index,
    Crypto,
}

impl InstrumentClass {
    /// Classify an internal symbol like `EURUSD` or `XAUUSD`.
    pub fn of(symbol: &str) -> Self {
        if symbol.starts_with("XAU") {
            InstrumentClass::Gold
        } else if symbol.starts_with("XAG") {
            InstrumentClass::Silver
        } else if symbol.ends_with("JPY") {
            InstrumentClass::JpyPair
        } else if matches!(symbol, "BTCUSD" | "ETHUSD") {
            InstrumentClass::Crypto
        } else if matches!(symbol, "WTIUSD" | "BCOUSD") {
            InstrumentClass::Energy
        } else if matches!(symbol, "US30" | "NAS100" | "SPX500" | "DE30") {
            InstrumentClass::Index
        } else {
            InstrumentClass::Major
        }
    }

    /// Per-tick volatility for the synthetic random walk, as a fraction of
    /// price. Crypto > metals > JPY pairs > energy > default FX.
    pub fn volatility(&self) -> f64 {
        match self {
            InstrumentClass::Crypto => 0.0025,
            InstrumentClass::Energy => 0.0015,
            InstrumentClass::Gold | InstrumentClass::Silver => 0.0012,
            InstrumentClass::Index => 0.0010,
            InstrumentClass::JpyPair => 0.0008,
            InstrumentClass::Major => 0.0005,
        }
    }

    /// Bid/ask spread as a fraction of the mid price.
    pub fn spread(&self) -> f64 {
        match self {
            InstrumentClass::Crypto => 0.0005,
            InstrumentClass::Energy => 0.0005,
            InstrumentClass::Silver => 0.0004,
            InstrumentClass::Gold => 0.0002,
            InstrumentClass::JpyPair => 0.00015,
            InstrumentClass::Major => 0.00012,
            InstrumentClass::Index => 0.0001,
        }
    }

    /// Quote decimal precision.
    pub fn decimals(&self) -> u32 {
        match self {
            InstrumentClass::JpyPair => 3,
            InstrumentClass::Gold => 2,
            InstrumentClass::Silver => 3,
            InstrumentClass::Index => 1,
            InstrumentClass::Crypto => 2,
            InstrumentClass::Energy => 3,
            InstrumentClass::Major => 5,
        }
    }

    pub fn category(&self) -> SymbolCategory {
        match self {
            InstrumentClass::Major | InstrumentClass::JpyPair => SymbolCategory::Forex,
            InstrumentClass::Gold | InstrumentClass::Silver => SymbolCategory::Metals,
            InstrumentClass::Energy => SymbolCategory::Energy,
            InstrumentClass::Index => SymbolCategory::Indices,
            InstrumentClass::Crypto => SymbolCategory::Crypto,
        }
    }
}

/// Supported instruments (symbol -> display name).
pub const SYMBOLS: &[(&str, &str)] = &[
    ("EURUSD", "Euro / US Dollar"),
    ("GBPUSD", "British Pound / US Dollar"),
    ("USDJPY", "US Dollar / Japanese Yen"),
    ("USDCHF", "US Dollar / Swiss Franc"),
    ("AUDUSD", "Australian Dollar / US Dollar"),
    ("USDCAD", "US Dollar / Canadian Dollar"),
    ("NZDUSD", "New Zealand Dollar / US Dollar"),
    ("EURGBP", "Euro / British Pound"),
    ("EURJPY", "Euro / Japanese Yen"),
    ("GBPJPY", "British Pound / Japanese Yen"),
    ("XAUUSD", "Gold / US Dollar"),
    ("XAGUSD", "Silver / US Dollar"),
    ("WTIUSD", "WTI Crude Oil"),
    ("BTCUSD", "Bitcoin / US Dollar"),
    ("ETHUSD", "Ethereum / US Dollar"),
    ("US30", "Dow Jones 30"),
    ("NAS100", "Nasdaq 100"),
    ("SPX500", "S&P 500"),
];

/// Whether a symbol is in the supported set.
pub fn is_supported_symbol(symbol: &str) -> bool {
    SYMBOLS.iter().any(|(s, _)| *s == symbol)
}

/// Display name for a symbol, falling back to the symbol itself.
pub fn display_name(symbol: &str) -> String {
    SYMBOLS
        .iter()
        .find(|(s, _)| *s == symbol)
        .map(|(_, name)| (*name).to_string())
        .unwrap_or_else(|| symbol.to_string())
}

/// Round a price to the class precision.
pub fn round_to_precision(price: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (price * factor).round() / factor
}

/// A point-in-time quote for a single instrument.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketPrice {
    /// Internal symbol, e.g. "EURUSD".
    pub symbol: String,
    /// Display name, e.g. "Euro / US Dollar".
    pub name: String,
    /// Mid price.
    pub price: f64,
    pub bid: f64,
    pub ask: f64,
    /// Absolute change from session open.
    pub change: f64,
    pub change_percent: f64,
    pub high: f64,
    pub low: f64,
    pub volume: f64,
    /// Quote time (epoch ms).
    pub timestamp: i64,
    pub category: SymbolCategory,
    /// Provenance tag.
    pub source: PriceSource,
}

/// One OHLC candle from the upstream provider.
#[derive(Debug, Clone, Copy)]
pub struct Quote {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// Candle time (epoch ms).
    pub timestamp: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instrument_class_of() {
        assert_eq!(InstrumentClass::of("EURUSD"), InstrumentClass::Major);
        assert_eq!(InstrumentClass::of("USDJPY"), InstrumentClass::JpyPair);
        assert_eq!(InstrumentClass::of("EURJPY"), InstrumentClass::JpyPair);
        assert_eq!(InstrumentClass::of("XAUUSD"), InstrumentClass::Gold);
        assert_eq!(InstrumentClass::of("XAGUSD"), InstrumentClass::Silver);
        assert_eq!(InstrumentClass::of("BTCUSD"), InstrumentClass::Crypto);
        assert_eq!(InstrumentClass::of("WTIUSD"), InstrumentClass::Energy);
        assert_eq!(InstrumentClass::of("NAS100"), InstrumentClass::Index);
    }

    #[test]
    fn test_volatility_ordering() {
        assert!(InstrumentClass::Crypto.volatility() > InstrumentClass::Gold.volatility());
        assert!(InstrumentClass::Gold.volatility() > InstrumentClass::JpyPair.volatility());
        assert!(InstrumentClass::JpyPair.volatility() > InstrumentClass::Major.volatility());
    }

    #[test]
    fn test_decimals() {
        assert_eq!(InstrumentClass::JpyPair.decimals(), 3);
        assert_eq!(InstrumentClass::Gold.decimals(), 2);
        assert_eq!(InstrumentClass::Silver.decimals(), 3);
        assert_eq!(InstrumentClass::Index.decimals(), 1);
        assert_eq!(InstrumentClass::Major.decimals(), 5);
    }

    #[test]
    fn test_round_to_precision() {
        assert_eq!(round_to_precision(1.234567, 5), 1.23457);
        assert_eq!(round_to_precision(149.123456, 3), 149.123);
    }

    #[test]
    fn test_symbol_directory() {
        assert!(is_supported_symbol("EURUSD"));
        assert!(!is_supported_symbol("ZZZXYZ"));
        assert_eq!(display_name("EURUSD"), "Euro / US Dollar");
        assert_eq!(display_name("ZZZXYZ"), "ZZZXYZ");
    }

    #[test]
    fn test_symbols_uppercase() {
        for (symbol, _) in SYMBOLS {
            assert_eq!(*symbol, symbol.to_uppercase());
        }
    }

    #[test]
    fn test_price_source_serialization() {
        assert_eq!(serde_json::to_string(&PriceSource::Oanda).unwrap(), "\"oanda\"");
        assert_eq!(serde_json::to_string(&PriceSource::Synthetic).unwrap(), "\"synthetic\"");
        assert_eq!(serde_json::to_string(&PriceSource::Fallback).unwrap(), "\"fallback\"");
    }

    #[test]
    fn test_price_source_is_live() {
        assert!(PriceSource::Oanda.is_live());
        assert!(!PriceSource::Synthetic.is_live());
        assert!(!PriceSource::Fallback.is_live());
    }

    #[test]
    fn test_market_price_camel_case() {
        let price = MarketPrice {
            symbol: "EURUSD".to_string(),
            name: "Euro / US Dollar".to_string(),
            price: 1.085,
            bid: 1.08493,
            ask: 1.08507,
            change: 0.001,
            change_percent: 0.09,
            high: 1.086,
            low: 1.084,
            volume: 12000.0,
            timestamp: 1_700_000_000_000,
            category: SymbolCategory::Forex,
            source: PriceSource::Oanda,
        };
        let json = serde_json::to_string(&price).unwrap();
        assert!(json.contains("\"changePercent\""));
        assert!(json.contains("\"category\":\"forex\""));
    }
}
