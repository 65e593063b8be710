//! The valuation state machine.
//!
//! Extract -> Parallel{Pricing, Authenticity} -> Aggregate, with per-step
//! retries, branch-level fallbacks, cancellation at every suspension point,
//! and a whole-execution hard deadline. Terminal failures land in the
//! execution-record table and on the dead-letter channel.

pub mod aggregate;

use crate::authenticity::{
    compute_signals, overall, AuthenticityReasoner, ReferenceStore, FALLBACK_RATIONALE,
};
use crate::error::AppError;
use crate::events::EventBus;
use crate::models::{
    AuthenticitySignals, AuthenticityVerdict, Card, ExecutionState, PricingSummary, Subject,
};
use crate::pricing::{fan_out, CompQuery, FxTable, PricingAdapter};
use crate::retry::{retry, RetryPolicy};
use crate::storage::Store;
use crate::vision::FeatureExtractor;
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Soft deadline for the extraction step, retries included.
const EXTRACT_SOFT_DEADLINE: Duration = Duration::from_secs(60);

/// Soft deadline for the reasoner step, retries included. The provider's
/// per-request timeout alone would let a slow-but-live endpoint stretch the
/// branch across the retry budget.
const REASONER_SOFT_DEADLINE: Duration = Duration::from_secs(30);

/// Soft deadline for the aggregation write group.
const AGGREGATE_SOFT_DEADLINE: Duration = Duration::from_secs(5);

/// Copy of a failed execution pushed onto the dead-letter channel.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub execution_id: Uuid,
    pub card_id: Uuid,
    pub subject: Subject,
    pub state: ExecutionState,
    pub error: String,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub retry_policy: RetryPolicy,
    pub adapter_timeout: Duration,
    pub hard_deadline: Duration,
    pub flag_threshold: f64,
}

/// One revalue request handed to the state machine.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub execution_id: Uuid,
    pub card: Card,
    pub window_days: u32,
}

pub struct Pipeline {
    store: Arc<Store>,
    extractor: Arc<FeatureExtractor>,
    references: Arc<ReferenceStore>,
    reasoner: Arc<AuthenticityReasoner>,
    adapters: Vec<Arc<dyn PricingAdapter>>,
    fx: FxTable,
    bus: EventBus,
    dead_letters: mpsc::Sender<DeadLetter>,
    config: PipelineConfig,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        extractor: Arc<FeatureExtractor>,
        references: Arc<ReferenceStore>,
        reasoner: Arc<AuthenticityReasoner>,
        adapters: Vec<Arc<dyn PricingAdapter>>,
        fx: FxTable,
        bus: EventBus,
        dead_letters: mpsc::Sender<DeadLetter>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            extractor,
            references,
            reasoner,
            adapters,
            fx,
            bus,
            dead_letters,
            config,
        }
    }

    /// Drives one execution to Done or Error. The caller holds the cancel
    /// sender; flipping it aborts in-flight work at the next suspension
    /// point. The hard deadline is enforced here regardless of step state.
    pub async fn run(&self, request: ExecutionRequest, cancel: watch::Receiver<bool>) {
        let execution_id = request.execution_id;
        let card_id = request.card.card_id;
        let subject = request.card.subject.clone();

        let outcome = tokio::time::timeout(
            self.config.hard_deadline,
            self.run_inner(&request, cancel),
        )
        .await
        .unwrap_or_else(|_| {
            Err((
                ExecutionState::Error,
                AppError::Timeout("execution hard deadline exceeded".to_string()),
            ))
        });

        match outcome {
            Ok(()) => {
                let _ = self.store.update_execution(
                    execution_id,
                    ExecutionState::Done,
                    Some(Utc::now()),
                    None,
                );
                info!(execution_id = %execution_id, card_id = %card_id, "execution done");
            }
            Err((state, err)) => {
                error!(
                    execution_id = %execution_id,
                    card_id = %card_id,
                    state = state.as_str(),
                    error = %err,
                    "execution failed"
                );
                let _ = self.store.update_execution(
                    execution_id,
                    ExecutionState::Error,
                    Some(Utc::now()),
                    Some(&err.to_string()),
                );
                let _ = self
                    .dead_letters
                    .try_send(DeadLetter {
                        execution_id,
                        card_id,
                        subject,
                        state,
                        error: err.to_string(),
                    })
                    .map_err(|e| warn!(error = %e, "dead-letter channel full, dropping"));
            }
        }
    }

    async fn run_inner(
        &self,
        request: &ExecutionRequest,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<(), (ExecutionState, AppError)> {
        let card = &request.card;

        // ---- Extract ----
        self.transition(request.execution_id, ExecutionState::Extracting)
            .map_err(|e| (ExecutionState::Extracting, e))?;

        let envelope = cancellable(&mut cancel, async {
            tokio::time::timeout(
                EXTRACT_SOFT_DEADLINE,
                retry(self.config.retry_policy, "extract", || {
                    self.extractor
                        .extract(&card.front_key, card.back_key.as_deref())
                }),
            )
            .await
            .unwrap_or_else(|_| Err(AppError::Timeout("feature extraction".to_string())))
        })
        .await
        .map_err(|e| (ExecutionState::Extracting, e))?;

        // ---- Parallel{Pricing, Authenticity} ----
        self.transition(request.execution_id, ExecutionState::Scoring)
            .map_err(|e| (ExecutionState::Scoring, e))?;

        let pricing_branch = self.pricing_branch(card, request.window_days);
        let authenticity_branch = self.authenticity_branch(card, &envelope);

        let ((pricing, pricing_all_failed, pricing_fell_back), (signals, verdict)) =
            cancellable_pair(&mut cancel, pricing_branch, authenticity_branch)
                .await
                .map_err(|e| (ExecutionState::Scoring, e))?;

        // Both branches on fallback with every adapter down means there is
        // nothing trustworthy to aggregate.
        if pricing_fell_back && verdict.degraded && pricing_all_failed {
            return Err((
                ExecutionState::Scoring,
                AppError::ProviderPermanent(
                    "both scoring branches degraded and all pricing adapters failed".to_string(),
                ),
            ));
        }

        // ---- Aggregate (no retries: failures here are data-layer) ----
        self.transition(request.execution_id, ExecutionState::Aggregating)
            .map_err(|e| (ExecutionState::Aggregating, e))?;

        if *cancel.borrow() {
            return Err((
                ExecutionState::Aggregating,
                AppError::Timeout("execution cancelled".to_string()),
            ));
        }

        let snapshot = aggregate::build_snapshot(
            card.subject.clone(),
            card.card_id,
            &pricing,
            signals,
            &verdict,
            Utc::now(),
        )
        .map_err(|e| (ExecutionState::Aggregating, e))?;

        // The write group is a blocking SQLite call; run it off the async
        // workers so the step deadline can actually fire.
        let store = self.store.clone();
        let bus = self.bus.clone();
        let threshold = self.config.flag_threshold;
        let write = tokio::task::spawn_blocking(move || {
            aggregate::aggregate(&store, &bus, &snapshot, threshold)
        });
        match tokio::time::timeout(AGGREGATE_SOFT_DEADLINE, write).await {
            Ok(Ok(result)) => result.map_err(|e| (ExecutionState::Aggregating, e))?,
            Ok(Err(join_err)) => {
                return Err((
                    ExecutionState::Aggregating,
                    AppError::DataLayer(format!("aggregation task: {join_err}")),
                ))
            }
            Err(_) => {
                return Err((
                    ExecutionState::Aggregating,
                    AppError::Timeout("aggregation".to_string()),
                ))
            }
        }

        Ok(())
    }

    /// Pricing branch: fan out, fuse; terminal failure settles as the
    /// no-data fallback instead of failing the step.
    async fn pricing_branch(
        &self,
        card: &Card,
        window_days: u32,
    ) -> (PricingSummary, bool, bool) {
        let query = CompQuery {
            name: card.descriptors.name.clone().unwrap_or_default(),
            set: card.descriptors.set.clone(),
            number: card.descriptors.number.clone(),
            rarity: card.descriptors.rarity.clone(),
        };

        let mut attempt = 1;
        loop {
            let result = fan_out(
                &self.adapters,
                &query,
                window_days,
                self.config.adapter_timeout,
                self.config.retry_policy,
            )
            .await;

            let usable = !result.comps.is_empty()
                || result.outcomes.iter().all(|(_, o)| !o.failed());
            if usable {
                let queried = result.adapters_queried();
                let with_data = result.adapters_with_data();
                let all_failed = result.all_failed();
                let summary =
                    crate::pricing::fuse(result.comps, queried, with_data, window_days, &self.fx);
                return (summary, all_failed, false);
            }

            // Nothing usable and at least one adapter down.
            if attempt >= self.config.retry_policy.max_attempts {
                warn!(attempts = attempt, "pricing branch fell back to no-data");
                return (
                    PricingSummary::no_data(window_days),
                    result.all_failed(),
                    true,
                );
            }
            tokio::time::sleep(self.config.retry_policy.delay_for(attempt)).await;
            attempt += 1;
        }
    }

    /// Authenticity branch: references -> signals -> reasoner. Reference
    /// loading is retried; the reasoner embeds its own fallback. References
    /// are loaded once and reused for the whole execution.
    async fn authenticity_branch(
        &self,
        card: &Card,
        envelope: &crate::models::FeatureEnvelope,
    ) -> (AuthenticitySignals, AuthenticityVerdict) {
        let card_name = card.descriptors.name.as_deref().unwrap_or_default();
        let references = if card_name.is_empty() {
            Vec::new()
        } else {
            retry(self.config.retry_policy, "references", || {
                self.references.load(card_name)
            })
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "reference load failed, scoring without references");
                Vec::new()
            })
        };

        let signals = compute_signals(envelope, Some(&card.descriptors), &references);
        let verdict = match tokio::time::timeout(
            REASONER_SOFT_DEADLINE,
            self.reasoner.score(envelope, &signals, Some(&card.descriptors)),
        )
        .await
        {
            Ok(verdict) => verdict,
            Err(_) => {
                warn!("reasoner exceeded step deadline, falling back to signals");
                AuthenticityVerdict {
                    authenticity_score: overall(&signals),
                    rationale: FALLBACK_RATIONALE.to_string(),
                    degraded: true,
                }
            }
        };
        (signals, verdict)
    }

    fn transition(&self, execution_id: Uuid, state: ExecutionState) -> Result<(), AppError> {
        self.store.update_execution(execution_id, state, None, None)
    }
}

async fn wait_cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow() {
            return;
        }
        if cancel.changed().await.is_err() {
            // Sender gone: cancellation can never arrive.
            std::future::pending::<()>().await;
        }
    }
}

/// Races a step against the cancellation signal.
async fn cancellable<T>(
    cancel: &mut watch::Receiver<bool>,
    fut: impl Future<Output = Result<T, AppError>>,
) -> Result<T, AppError> {
    tokio::select! {
        _ = wait_cancelled(cancel) => Err(AppError::Timeout("execution cancelled".to_string())),
        result = fut => result,
    }
}

/// Runs both parallel branches to settlement unless cancelled first.
async fn cancellable_pair<A, B>(
    cancel: &mut watch::Receiver<bool>,
    a: impl Future<Output = A>,
    b: impl Future<Output = B>,
) -> Result<(A, B), AppError> {
    tokio::select! {
        _ = wait_cancelled(cancel) => Err(AppError::Timeout("execution cancelled".to_string())),
        pair = async { tokio::join!(a, b) } => Ok(pair),
    }
}
