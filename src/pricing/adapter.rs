//! Marketplace adapter contract and the parallel fan-out over the enabled
//! adapter set.

use crate::error::AppError;
use crate::models::Comp;
use crate::retry::{retry, RetryPolicy};
use async_trait::async_trait;
use futures_util::future::join_all;
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Search terms derived from a card's descriptors.
#[derive(Debug, Clone, Default)]
pub struct CompQuery {
    pub name: String,
    pub set: Option<String>,
    pub number: Option<String>,
    pub rarity: Option<String>,
}

impl CompQuery {
    /// Full-text search string the marketplaces understand.
    pub fn search_terms(&self) -> String {
        let mut terms = vec![self.name.clone()];
        if let Some(set) = &self.set {
            terms.push(set.clone());
        }
        if let Some(number) = &self.number {
            terms.push(format!("#{number}"));
        }
        if let Some(rarity) = &self.rarity {
            terms.push(rarity.clone());
        }
        terms.join(" ")
    }
}

#[async_trait]
pub trait PricingAdapter: Send + Sync {
    /// Normalized provider identifier used in snapshot `sources`.
    fn tag(&self) -> &'static str;

    /// Fetches comparable sales inside the window. Implementations classify
    /// provider responses into transient vs permanent failures.
    async fn fetch_comps(&self, query: &CompQuery, window_days: u32)
        -> Result<Vec<Comp>, AppError>;
}

/// Per-adapter outcome of one fan-out round.
#[derive(Debug, Clone)]
pub enum AdapterOutcome {
    Ok(usize),
    Empty,
    Failed(String),
}

impl AdapterOutcome {
    pub fn returned_data(&self) -> bool {
        matches!(self, AdapterOutcome::Ok(_))
    }

    pub fn failed(&self) -> bool {
        matches!(self, AdapterOutcome::Failed(_))
    }
}

/// Maps an HTTP status from a marketplace into the retry taxonomy.
pub fn classify_status(status: StatusCode, provider: &str) -> AppError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        AppError::RateLimited
    } else if status.is_server_error() {
        AppError::ProviderTransient(format!("{provider} returned {status}"))
    } else {
        AppError::ProviderPermanent(format!("{provider} returned {status}"))
    }
}

pub struct FanoutResult {
    pub comps: Vec<Comp>,
    pub outcomes: Vec<(String, AdapterOutcome)>,
}

impl FanoutResult {
    pub fn adapters_queried(&self) -> usize {
        self.outcomes.len()
    }

    pub fn adapters_with_data(&self) -> usize {
        self.outcomes.iter().filter(|(_, o)| o.returned_data()).count()
    }

    pub fn all_failed(&self) -> bool {
        !self.outcomes.is_empty() && self.outcomes.iter().all(|(_, o)| o.failed())
    }
}

/// Queries every adapter concurrently with a per-call timeout and retry
/// policy. One adapter's failure never aborts the round.
pub async fn fan_out(
    adapters: &[Arc<dyn PricingAdapter>],
    query: &CompQuery,
    window_days: u32,
    per_call_timeout: Duration,
    policy: RetryPolicy,
) -> FanoutResult {
    let calls = adapters.iter().map(|adapter| {
        let adapter = adapter.clone();
        let query = query.clone();
        async move {
            let tag = adapter.tag().to_string();
            let attempt = retry(policy, adapter.tag(), || {
                let adapter = adapter.clone();
                let query = query.clone();
                async move {
                    tokio::time::timeout(per_call_timeout, adapter.fetch_comps(&query, window_days))
                        .await
                        .map_err(|_| {
                            AppError::Timeout(format!("pricing adapter {}", adapter.tag()))
                        })?
                }
            })
            .await;

            match attempt {
                Ok(comps) if comps.is_empty() => {
                    debug!(adapter = %tag, "adapter returned no comps");
                    (tag, AdapterOutcome::Empty, Vec::new())
                }
                Ok(comps) => {
                    info!(adapter = %tag, comps = comps.len(), "adapter returned comps");
                    (tag.clone(), AdapterOutcome::Ok(comps.len()), comps)
                }
                Err(err) => {
                    warn!(adapter = %tag, error = %err, "adapter failed");
                    (tag, AdapterOutcome::Failed(err.to_string()), Vec::new())
                }
            }
        }
    });

    let mut comps = Vec::new();
    let mut outcomes = Vec::new();
    for (tag, outcome, mut adapter_comps) in join_all(calls).await {
        comps.append(&mut adapter_comps);
        outcomes.push((tag, outcome));
    }
    FanoutResult { comps, outcomes }
}
