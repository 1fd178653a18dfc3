use crate::services::{DataCache, FallbackPriceProvider, RateLimiter, RequestBatcher};
use crate::sources::QuoteProvider;
use crate::types::{
    display_name, is_supported_symbol, round_to_precision, InstrumentClass, MarketPrice,
    PriceSource, Quote,
};
use dashmap::DashMap;
use futures_util::future::join_all;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Callback invoked with live price updates.
pub type PriceCallback = Arc<dyn Fn(MarketPrice) + Send + Sync>;

/// Tuning for the market-data pipeline.
#[derive(Debug, Clone)]
pub struct MarketDataConfig {
    /// How long a cached quote stays fresh.
    pub cache_freshness: Duration,
    /// Upstream request ceiling per symbol per second.
    pub max_requests_per_second: usize,
    /// Debounce window for coalescing concurrent requests.
    pub batch_delay: Duration,
    /// Subscription polling interval.
    pub poll_interval: Duration,
    /// Random jitter added to each poll sleep.
    pub poll_jitter: Duration,
}

impl Default for MarketDataConfig {
    fn default() -> Self {
        Self {
            cache_freshness: Duration::from_secs(10),
            max_requests_per_second: 2,
            batch_delay: Duration::from_millis(100),
            poll_interval: Duration::from_secs(2),
            poll_jitter: Duration::from_millis(250),
        }
    }
}

/// State shared between the query path and the batch processor.
struct FetchState {
    cache: DataCache<MarketPrice>,
    limiter: RateLimiter,
    fallback: FallbackPriceProvider,
    client: Arc<dyn QuoteProvider>,
}

impl FetchState {
    /// Fetch one symbol, re-checking cache and rate limit to handle races
    /// from concurrent enqueue. Always yields a price.
    async fn fetch_one(&self, symbol: &str) -> MarketPrice {
        if let Some(cached) = self.cache.get(symbol) {
            return cached;
        }

        if !self.limiter.can_make_request(symbol) {
            debug!(
                "rate limited inside batch for {} (wait {}ms)",
                symbol,
                self.limiter.get_wait_time(symbol)
            );
            return self.fallback.get_price(symbol);
        }
        self.limiter.record_request(symbol);

        match self.client.fetch_quote(symbol).await {
            Ok(quote) => {
                let price = market_price_from_quote(symbol, &quote);
                self.cache.set(symbol, price.clone());
                self.fallback.update_last_known(symbol, price.price);
                price
            }
            Err(e) => {
                warn!("live fetch failed for {}: {}", symbol, e);
                self.fallback.get_price(symbol)
            }
        }
    }
}

/// Build a quote-derived market price: mid from the candle close, bid/ask
/// from the class spread table, change from open vs close.
fn market_price_from_quote(symbol: &str, quote: &Quote) -> MarketPrice {
    let class = InstrumentClass::of(symbol);
    let decimals = class.decimals();
    let price = round_to_precision(quote.close, decimals);
    let half_spread = price * class.spread() / 2.0;

    let change = quote.close - quote.open;
    let change_percent = if quote.open != 0.0 {
        change / quote.open * 100.0
    } else {
        0.0
    };

    MarketPrice {
        symbol: symbol.to_string(),
        name: display_name(symbol),
        price,
        bid: round_to_precision(price - half_spread, decimals),
        ask: round_to_precision(price + half_spread, decimals),
        change,
        change_percent,
        high: quote.high,
        low: quote.low,
        volume: quote.volume,
        timestamp: quote.timestamp,
        category: class.category(),
        source: PriceSource::Oanda,
    }
}

struct SymbolSubscription {
    listeners: HashMap<u64, PriceCallback>,
    poller: JoinHandle<()>,
}

/// Orchestrates cache, rate limiter, batcher and fallback provider to answer
/// price queries, and fans live updates out to polling subscribers.
///
/// Price queries never fail: every path resolves to some `MarketPrice`, with
/// the `source` tag recording how trustworthy it is.
pub struct MarketDataService {
    state: Arc<FetchState>,
    batcher: Arc<RequestBatcher<MarketPrice>>,
    subscriptions: DashMap<String, SymbolSubscription>,
    next_listener_id: AtomicU64,
    config: MarketDataConfig,
}

impl MarketDataService {
    pub fn new(config: MarketDataConfig, client: Arc<dyn QuoteProvider>) -> Arc<Self> {
        let state = Arc::new(FetchState {
            cache: DataCache::new(config.cache_freshness),
            limiter: RateLimiter::new(config.max_requests_per_second),
            fallback: FallbackPriceProvider::new(),
            client,
        });

        let batch_state = Arc::clone(&state);
        let batcher = RequestBatcher::new(
            config.batch_delay,
            Arc::new(move |symbols: Vec<String>| {
                let state = Arc::clone(&batch_state);
                Box::pin(async move {
                    let fetches = symbols.iter().map(|s| state.fetch_one(s));
                    let prices = join_all(fetches).await;
                    Ok(symbols.into_iter().zip(prices).collect())
                })
            }),
        );

        Arc::new(Self {
            state,
            batcher,
            subscriptions: DashMap::new(),
            next_listener_id: AtomicU64::new(1),
            config,
        })
    }

    /// Get a price for one symbol. Never fails; falls back through cache,
    /// rate-limit and fetch-failure paths to a synthetic or bootstrap price.
    pub async fn get_market_price(&self, symbol: &str) -> MarketPrice {
        if !is_supported_symbol(symbol) {
            debug!("unsupported symbol {}, serving fallback", symbol);
            return self.state.fallback.get_price(symbol);
        }

        if let Some(cached) = self.state.cache.get(symbol) {
            return cached;
        }

        if !self.state.limiter.can_make_request(symbol) {
            debug!(
                "rate limited for {}, serving fallback (wait {}ms)",
                symbol,
                self.state.limiter.get_wait_time(symbol)
            );
            return self.state.fallback.get_price(symbol);
        }

        match self.batcher.request(symbol).await {
            Ok(price) => price,
            Err(e) => {
                warn!("batch request failed for {}: {}", symbol, e);
                self.state.fallback.get_price(symbol)
            }
        }
    }

    /// Fetch several symbols concurrently. Order matches the input.
    pub async fn get_multiple_market_prices(&self, symbols: &[String]) -> Vec<MarketPrice> {
        join_all(symbols.iter().map(|s| self.get_market_price(s))).await
    }

    /// Age of the cached entry for diagnostics; None when never fetched.
    pub fn cached_age(&self, symbol: &str) -> Option<Duration> {
        self.state.cache.get_with_age(symbol).map(|(_, age)| age)
    }

    /// Register `callback` for live updates on `symbols`. Each symbol gets at
    /// most one polling loop regardless of listener count; the returned handle
    /// tears listeners down, stopping a loop when its last listener leaves.
    pub fn subscribe_to_real_time_updates(
        self: &Arc<Self>,
        symbols: &[String],
        callback: PriceCallback,
    ) -> Subscription {
        let mut entries = Vec::with_capacity(symbols.len());

        for symbol in symbols {
            let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
            let mut entry = self
                .subscriptions
                .entry(symbol.clone())
                .or_insert_with(|| SymbolSubscription {
                    listeners: HashMap::new(),
                    poller: self.spawn_poller(symbol.clone()),
                });
            entry.listeners.insert(id, Arc::clone(&callback));
            entries.push((symbol.clone(), id));
        }

        info!("subscribed to {} symbols", entries.len());
        Subscription {
            service: Arc::downgrade(self),
            entries,
        }
    }

    /// Number of active listeners for a symbol.
    pub fn listener_count(&self, symbol: &str) -> usize {
        self.subscriptions
            .get(symbol)
            .map(|s| s.listeners.len())
            .unwrap_or(0)
    }

    fn spawn_poller(self: &Arc<Self>, symbol: String) -> JoinHandle<()> {
        let service = Arc::downgrade(self);
        let interval = self.config.poll_interval;
        let jitter = self.config.poll_jitter;

        tokio::spawn(async move {
            loop {
                let sleep_for = interval
                    + Duration::from_millis(
                        rand::thread_rng().gen_range(0..=jitter.as_millis().max(1) as u64),
                    );
                tokio::time::sleep(sleep_for).await;

                let Some(service) = service.upgrade() else {
                    break;
                };

                let price = service.get_market_price(&symbol).await;

                // Fallback noise is suppressed: subscribers already hold a
                // displayable value and only want genuine live updates.
                if !price.source.is_live() {
                    continue;
                }

                let listeners: Vec<PriceCallback> = match service.subscriptions.get(&symbol) {
                    Some(entry) => entry.listeners.values().cloned().collect(),
                    None => break,
                };
                for listener in listeners {
                    listener(price.clone());
                }
            }
        })
    }

    fn remove_listener(&self, symbol: &str, id: u64) {
        let mut teardown = false;
        if let Some(mut entry) = self.subscriptions.get_mut(symbol) {
            entry.listeners.remove(&id);
            teardown = entry.listeners.is_empty();
        }
        if teardown {
            if let Some((_, entry)) = self.subscriptions.remove(symbol) {
                entry.poller.abort();
                debug!("last listener left {}, polling stopped", symbol);
            }
        }
    }
}

/// Handle returned by `subscribe_to_real_time_updates`. Unsubscribes on drop.
pub struct Subscription {
    service: Weak<MarketDataService>,
    entries: Vec<(String, u64)>,
}

impl Subscription {
    /// Remove this subscription's listeners, tearing down polling loops whose
    /// last listener left.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(service) = self.service.upgrade() {
            for (symbol, id) in self.entries.drain(..) {
                service.remove_listener(&symbol, id);
            }
        } else {
            self.entries.clear();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}
