//! Per-host request throttling.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// One token per `1 / per_second` seconds, no burst beyond a single request.
    pub fn per_second(per_second: f64) -> Self {
        Self::new(1, Duration::from_secs_f64(1.0 / per_second))
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if !self.refill_every.is_zero() && elapsed >= self.refill_every {
                let refills = (elapsed.as_nanos() / self.refill_every.as_nanos()) as u32;
                state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                state.last_refill += self.refill_every.saturating_mul(refills);
            }

            if state.tokens > 0 || self.refill_every.is_zero() {
                state.tokens = state.tokens.saturating_sub(1);
                return;
            }

            let wait = self.refill_every.saturating_sub(state.last_refill.elapsed());
            drop(state);
            tokio::time::sleep(wait).await;
        }
    }
}

/// Lazily creates one token bucket per host; a non-positive rate disables throttling.
#[derive(Debug)]
pub struct HostRateLimiter {
    per_second: f64,
    buckets: Mutex<HashMap<String, Arc<TokenBucket>>>,
}

impl HostRateLimiter {
    pub fn new(per_second: f64) -> Self {
        Self {
            per_second,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.per_second.is_finite() && self.per_second > 0.0
    }

    async fn bucket_for(&self, host: &str) -> Arc<TokenBucket> {
        let mut map = self.buckets.lock().await;
        map.entry(host.to_ascii_lowercase())
            .or_insert_with(|| Arc::new(TokenBucket::per_second(self.per_second)))
            .clone()
    }

    pub async fn acquire(&self, host: &str) {
        if !self.is_enabled() {
            return;
        }
        let bucket = self.bucket_for(host).await;
        bucket.take().await;
    }
}
