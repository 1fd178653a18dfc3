pub mod batcher;
pub mod cache;
pub mod fallback;
pub mod market_data;
pub mod rate_limiter;
pub mod sqlite_store;
pub mod swap;
pub mod trading;

pub use batcher::{BatchError, BatchFn, RequestBatcher};
pub use cache::DataCache;
pub use fallback::FallbackPriceProvider;
pub use market_data::{MarketDataConfig, MarketDataService, PriceCallback, Subscription};
pub use rate_limiter::RateLimiter;
pub use sqlite_store::{SqliteStore, StoreError};
pub use swap::SwapManager;
pub use trading::TradingEngine;
