//! Undertow - Forex market data acquisition and trade accounting engine
//!
//! Two halves share one crate: a market-data pipeline (cache, rate limiter,
//! request batcher, fallback pricing and a polling subscription service over
//! an OANDA candle source) and a trading engine (validation, execution,
//! revaluation, stop/take-profit triggers, margin enforcement and overnight
//! swap accrual) backed by SQLite.

pub mod config;
pub mod services;
pub mod sources;
pub mod types;

pub use config::Config;
pub use services::{
    DataCache, FallbackPriceProvider, MarketDataConfig, MarketDataService, RateLimiter,
    RequestBatcher, SqliteStore, SwapManager, TradingEngine,
};
pub use sources::{OandaClient, QuoteProvider};
pub use types::*;
