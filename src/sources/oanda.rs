use crate::types::Quote;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::warn;

const DEFAULT_BASE_URL: &str = "https://api-fxpractice.oanda.com/v3";

/// Hard ceiling on a single candle fetch.
const FETCH_TIMEOUT: Duration = Duration::from_secs(15);

/// Symbol mapping (internal symbol -> provider instrument).
pub const PROVIDER_PAIRS: &[(&str, &str)] = &[
    ("EURUSD", "EUR_USD"),
    ("GBPUSD", "GBP_USD"),
    ("USDJPY", "USD_JPY"),
    ("USDCHF", "USD_CHF"),
    ("AUDUSD", "AUD_USD"),
    ("USDCAD", "USD_CAD"),
    ("NZDUSD", "NZD_USD"),
    ("EURGBP", "EUR_GBP"),
    ("EURJPY", "EUR_JPY"),
    ("GBPJPY", "GBP_JPY"),
    ("XAUUSD", "XAU_USD"),
    ("XAGUSD", "XAG_USD"),
    ("WTIUSD", "WTICO_USD"),
    ("BTCUSD", "BTC_USD"),
    ("ETHUSD", "ETH_USD"),
    ("US30", "US30_USD"),
    ("NAS100", "NAS100_USD"),
    ("SPX500", "SPX500_USD"),
];

/// Candle endpoint response.
#[derive(Debug, Deserialize)]
struct CandlesResponse {
    candles: Vec<Candle>,
}

#[derive(Debug, Deserialize)]
struct Candle {
    mid: CandleMid,
    volume: f64,
    time: String,
}

#[derive(Debug, Deserialize)]
struct CandleMid {
    o: String,
    h: String,
    l: String,
    c: String,
}

/// Truncate a provider error body for logging. Char-based so multi-byte
/// payloads never split mid-character.
fn body_preview(text: &str) -> String {
    text.chars().take(200).collect()
}

/// Boundary for fetching one recent candle per instrument. The market-data
/// service depends on this trait so tests can script quotes without a network.
#[async_trait]
pub trait QuoteProvider: Send + Sync {
    /// Fetch the latest candle for an internal symbol like "EURUSD".
    async fn fetch_quote(&self, symbol: &str) -> anyhow::Result<Quote>;
}

/// OANDA REST candle client.
#[derive(Clone)]
pub struct OandaClient {
    client: Client,
    api_key: Option<String>,
    base_url: String,
}

impl OandaClient {
    pub fn new(api_key: Option<String>) -> Self {
        Self::with_base_url(api_key, DEFAULT_BASE_URL.to_string())
    }

    pub fn with_base_url(api_key: Option<String>, base_url: String) -> Self {
        let client = Client::builder()
            .user_agent("Undertow/1.0")
            .timeout(FETCH_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            client,
            api_key,
            base_url,
        }
    }

    /// Map an internal symbol to the provider instrument name.
    pub fn provider_symbol(symbol: &str) -> Option<&'static str> {
        PROVIDER_PAIRS
            .iter()
            .find(|(s, _)| *s == symbol)
            .map(|(_, p)| *p)
    }

    fn parse_candle(symbol: &str, candle: &Candle) -> anyhow::Result<Quote> {
        let parse = |field: &str, value: &str| -> anyhow::Result<f64> {
            let n: f64 = value
                .parse()
                .map_err(|_| anyhow::anyhow!("non-numeric {} for {}: {}", field, symbol, value))?;
            if !n.is_finite() || n <= 0.0 {
                return Err(anyhow::anyhow!("invalid {} for {}: {}", field, symbol, n));
            }
            Ok(n)
        };

        let timestamp = chrono::DateTime::parse_from_rfc3339(&candle.time)
            .map(|t| t.timestamp_millis())
            .unwrap_or_else(|_| chrono::Utc::now().timestamp_millis());

        Ok(Quote {
            open: parse("open", &candle.mid.o)?,
            high: parse("high", &candle.mid.h)?,
            low: parse("low", &candle.mid.l)?,
            close: parse("close", &candle.mid.c)?,
            volume: candle.volume,
            timestamp,
        })
    }
}

#[async_trait]
impl QuoteProvider for OandaClient {
    async fn fetch_quote(&self, symbol: &str) -> anyhow::Result<Quote> {
        let instrument = Self::provider_symbol(symbol)
            .ok_or_else(|| anyhow::anyhow!("no provider mapping for {}", symbol))?;

        let url = format!(
            "{}/instruments/{}/candles?granularity=M1&count=1&price=M",
            self.base_url, instrument
        );

        let mut request = self.client.get(&url);
        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            warn!(
                "quote provider returned {} for {}: {}",
                status,
                symbol,
                body_preview(&text)
            );
            return Err(anyhow::anyhow!("provider error for {}: {}", symbol, status));
        }

        let body: CandlesResponse = response.json().await?;
        let candle = body
            .candles
            .last()
            .ok_or_else(|| anyhow::anyhow!("no candles returned for {}", symbol))?;

        Self::parse_candle(symbol, candle)
    }
}
