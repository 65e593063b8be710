//! Retry policy for provider-facing steps: bounded attempts, exponential
//! backoff with jitter, transient-to-permanent collapse after exhaustion.

use crate::error::AppError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff_factor: f64,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_ms: u64, backoff_factor: f64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::from_millis(base_ms),
            backoff_factor: backoff_factor.max(1.0),
        }
    }

    /// Delay before the given retry (attempt is 1-based), with up to 20%
    /// additive jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.backoff_factor.powi(attempt.saturating_sub(1) as i32);
        let base = self.base_delay.as_millis() as f64 * exp;
        let jitter = rand::thread_rng().gen_range(0.0..0.2) * base;
        Duration::from_millis((base + jitter).min(60_000.0) as u64)
    }
}

/// Runs `op` until it succeeds, fails permanently, or attempts run out.
/// Non-transient errors short-circuit; exhausted transients are collapsed
/// into their permanent form.
pub async fn retry<T, F, Fut>(policy: RetryPolicy, step: &str, mut op: F) -> Result<T, AppError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AppError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                debug!(
                    step,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient failure, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) if err.is_transient() => {
                warn!(step, attempts = attempt, error = %err, "retries exhausted");
                return Err(err.into_permanent());
            }
            Err(err) => return Err(err),
        }
    }
}
