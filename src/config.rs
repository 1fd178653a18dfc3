use std::env;

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// OANDA API key (optional, practice endpoints work without for demos).
    pub oanda_api_key: Option<String>,
    /// OANDA REST base URL.
    pub oanda_base_url: String,
    /// Price cache freshness window (ms).
    pub cache_freshness_ms: u64,
    /// Upstream request ceiling per symbol per second.
    pub max_requests_per_second: usize,
    /// Debounce window for request batching (ms).
    pub batch_delay_ms: u64,
    /// Subscription polling interval (ms).
    pub poll_interval_ms: u64,
    /// Random jitter added to each poll sleep (ms).
    pub poll_jitter_ms: u64,
    /// SQLite database path.
    pub database_path: String,
}

impl Config {
    /// Load configuration from environment variables, reading a `.env` file
    /// first when one exists.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        Self {
            oanda_api_key: env::var("OANDA_API_KEY").ok(),
            oanda_base_url: env::var("OANDA_BASE_URL")
                .unwrap_or_else(|_| "https://api-fxpractice.oanda.com/v3".to_string()),
            cache_freshness_ms: env::var("CACHE_FRESHNESS_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10_000),
            max_requests_per_second: env::var("MAX_REQUESTS_PER_SECOND")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(2),
            batch_delay_ms: env::var("BATCH_DELAY_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(100),
            poll_interval_ms: env::var("POLL_INTERVAL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(2_000),
            poll_jitter_ms: env::var("POLL_JITTER_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(250),
            database_path: env::var("DATABASE_PATH").unwrap_or_else(|_| "undertow.db".to_string()),
        }
    }

    /// Market-data tuning derived from this configuration.
    pub fn market_data_config(&self) -> crate::services::MarketDataConfig {
        crate::services::MarketDataConfig {
            cache_freshness: std::time::Duration::from_millis(self.cache_freshness_ms),
            max_requests_per_second: self.max_requests_per_second,
            batch_delay: std::time::Duration::from_millis(self.batch_delay_ms),
            poll_interval: std::time::Duration::from_millis(self.poll_interval_ms),
            poll_jitter: std::time::Duration::from_millis(self.poll_jitter_ms),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            oanda_api_key: None,
            oanda_base_url: "https://api-fxpractice.oanda.com/v3".to_string(),
            cache_freshness_ms: 10_000,
            max_requests_per_second: 2,
            batch_delay_ms: 100,
            poll_interval_ms: 2_000,
            poll_jitter_ms: 250,
            database_path: "undertow.db".to_string(),
        }
    }
}
