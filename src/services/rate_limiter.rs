use dashmap::DashMap;
use std::time::{Duration, Instant};

/// Per-key sliding-window request admission control.
///
/// Advisory only: callers consult `can_make_request` and branch to a fallback
/// path instead of blocking, so sustained overload never builds a wait chain.
/// The check-then-act gap between `can_make_request` and `record_request`
/// across an await point can over-admit by one request; that costs at most one
/// extra upstream call and is accepted.
pub struct RateLimiter {
    requests: DashMap<String, Vec<Instant>>,
    max_requests: usize,
    window: Duration,
}

impl RateLimiter {
    /// Create a limiter allowing `max_requests` per key per trailing second.
    pub fn new(max_requests: usize) -> Self {
        Self::with_window(max_requests, Duration::from_millis(1000))
    }

    pub fn with_window(max_requests: usize, window: Duration) -> Self {
        Self {
            requests: DashMap::new(),
            max_requests,
            window,
        }
    }

    /// True iff fewer than the ceiling of requests fall in the trailing window.
    pub fn can_make_request(&self, key: &str) -> bool {
        let cutoff = Instant::now() - self.window;
        match self.requests.get(key) {
            Some(timestamps) => {
                timestamps.iter().filter(|t| **t > cutoff).count() < self.max_requests
            }
            None => true,
        }
    }

    /// Record a request now, pruning entries older than the window.
    pub fn record_request(&self, key: &str) {
        let now = Instant::now();
        let cutoff = now - self.window;
        let mut entry = self.requests.entry(key.to_string()).or_default();
        entry.retain(|t| *t > cutoff);
        entry.push(now);
    }

    /// Milliseconds until the oldest in-window request ages out, 0 if a
    /// request is already permitted.
    pub fn get_wait_time(&self, key: &str) -> u64 {
        let now = Instant::now();
        let cutoff = now - self.window;
        let entry = match self.requests.get(key) {
            Some(e) => e,
            None => return 0,
        };

        let in_window: Vec<&Instant> = entry.iter().filter(|t| **t > cutoff).collect();
        if in_window.len() < self.max_requests {
            return 0;
        }

        match in_window.iter().min() {
            Some(oldest) => {
                let expires = **oldest + self.window;
                expires.saturating_duration_since(now).as_millis() as u64
            }
            None => 0,
        }
    }
}
