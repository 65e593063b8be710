//! Per-provider token-bucket rate limiting for outbound marketplace calls.
//!
//! One bucket per adapter tag, built at startup and shared process-wide.
//! Tokens refill continuously at the configured rate; `acquire` suspends
//! until a token is available, so adapters stay safe to call concurrently.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            capacity: capacity.max(1) as f64,
            refill_per_sec: refill_per_sec.max(0.01),
            state: Mutex::new(BucketState {
                tokens: capacity.max(1) as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let elapsed = state.last_refill.elapsed().as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = Instant::now();
    }

    /// Takes a token if one is available right now.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        self.refill(&mut state);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Suspends until a token is available, then takes it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock();
                self.refill(&mut state);
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                let deficit = 1.0 - state.tokens;
                Duration::from_secs_f64(deficit / self.refill_per_sec)
            };
            debug!(wait_ms = wait.as_millis() as u64, "rate limiter backoff");
            tokio::time::sleep(wait).await;
        }
    }
}

/// Process-wide per-provider limiter registry with explicit lifecycle hooks.
pub struct Limiters {
    buckets: HashMap<String, Arc<TokenBucket>>,
}

impl Limiters {
    /// Builds one bucket per enabled adapter tag.
    pub fn init(adapter_tags: &[String]) -> Self {
        let buckets = adapter_tags
            .iter()
            .map(|tag| (tag.clone(), Arc::new(TokenBucket::new(5, 2.0))))
            .collect();
        info!(providers = adapter_tags.len(), "rate limiters initialized");
        Self { buckets }
    }

    pub fn for_tag(&self, tag: &str) -> Arc<TokenBucket> {
        self.buckets
            .get(tag)
            .cloned()
            .unwrap_or_else(|| Arc::new(TokenBucket::new(5, 2.0)))
    }

    pub fn shutdown(&self) {
        info!("rate limiters shut down");
    }
}
