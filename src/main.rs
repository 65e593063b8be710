//! CollectIQ backend: card identification, valuation, and authenticity
//! scoring behind an HTTP gateway.

use collectiq_backend::api::{self, AppState};
use collectiq_backend::auth::JwtHandler;
use collectiq_backend::authenticity::{
    self, AuthenticityReasoner, HttpReasoningProvider, ReferenceStore,
};
use collectiq_backend::events::EventBus;
use collectiq_backend::models::Config;
use collectiq_backend::objectstore::FsObjectStore;
use collectiq_backend::pipeline::{DeadLetter, Pipeline, PipelineConfig};
use collectiq_backend::pricing::{self, FxTable, Limiters};
use collectiq_backend::retry::RetryPolicy;
use collectiq_backend::storage::Store;
use collectiq_backend::vision::{self, FeatureExtractor, HttpVisionProvider, VisionProvider};
use anyhow::{Context, Result};
use dotenv::dotenv;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    let config = Arc::new(Config::from_env());
    info!(
        adapters = config.pricing_adapters_enabled.len(),
        window_days = config.revalue_window_days,
        "CollectIQ backend starting"
    );

    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .context("Failed to build HTTP client")?;

    let db_path = resolve_data_path(Some(config.database_path.clone()), "collectiq.db");
    let store = Arc::new(Store::new(&db_path)?);

    let object_root = resolve_data_path(Some(config.object_store_root.clone()), "collectiq-objects");
    let objects = Arc::new(FsObjectStore::new(
        object_root,
        config.object_store_secret.clone(),
        config.object_store_public_url.clone(),
    ));

    let jwt = Arc::new(JwtHandler::new(config.jwt_secret.clone()));

    // Process-wide provider rate limiters (init/shutdown lifecycle).
    let limiters = Arc::new(Limiters::init(&config.pricing_adapters_enabled));
    let adapters = pricing::build_adapters(&config, &http_client, &limiters);
    info!(count = adapters.len(), "pricing adapters enabled");

    let vision_provider: Arc<dyn VisionProvider> = match &config.vision_api_url {
        Some(url) => Arc::new(HttpVisionProvider::new(
            http_client.clone(),
            url.clone(),
            config.vision_api_key.clone(),
        )),
        None => {
            warn!("VISION_API_URL not set; feature extraction disabled");
            Arc::new(vision::DisabledVisionProvider)
        }
    };

    let retry_policy = RetryPolicy::new(
        config.retry_max_attempts,
        config.retry_base_ms,
        config.retry_backoff_factor,
    );

    let reasoner_provider: Arc<dyn authenticity::ReasoningProvider> =
        match &config.reasoning_api_url {
            Some(url) => Arc::new(HttpReasoningProvider::new(
                http_client.clone(),
                url.clone(),
                config.reasoning_api_key.clone(),
                config.reasoning_model.clone(),
                Duration::from_secs(30),
            )),
            None => {
                warn!("REASONING_API_URL not set; authenticity scores fall back to signals");
                Arc::new(authenticity::reasoner::DisabledReasoningProvider)
            }
        };

    let extractor = Arc::new(FeatureExtractor::new(objects.clone(), vision_provider));
    let references = Arc::new(ReferenceStore::new(objects.clone()));
    let reasoner = Arc::new(AuthenticityReasoner::new(reasoner_provider, retry_policy));

    let bus = EventBus::new(1024);
    spawn_event_logger(&bus);

    let (dead_letter_tx, dead_letter_rx) = mpsc::channel::<DeadLetter>(256);
    spawn_dead_letter_drain(dead_letter_rx);

    let pipeline = Arc::new(Pipeline::new(
        store.clone(),
        extractor,
        references,
        reasoner,
        adapters,
        FxTable::from_pairs(&config.exchange_rates),
        bus.clone(),
        dead_letter_tx,
        PipelineConfig {
            retry_policy,
            adapter_timeout: Duration::from_millis(config.pricing_adapter_timeout_ms),
            hard_deadline: Duration::from_millis(config.execution_hard_deadline_ms),
            flag_threshold: config.authenticity_flag_threshold,
        },
    ));

    // Expired idempotency tokens are swept in the background; reads already
    // treat them as absent.
    spawn_token_sweeper(store.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let app_state = AppState {
        config: config.clone(),
        store,
        objects,
        pipeline,
        shutdown: shutdown_rx,
    };

    let app = api::routes::router(app_state, jwt);

    let listener = TcpListener::bind(&config.bind_addr).await?;
    info!(addr = %config.bind_addr, "API server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received; cancelling in-flight executions");
            let _ = shutdown_tx.send(true);
        })
        .await
        .context("Server error")?;

    limiters.shutdown();
    Ok(())
}

fn spawn_event_logger(bus: &EventBus) {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => info!(?event, "domain event"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "event logger lagged")
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

fn spawn_dead_letter_drain(mut rx: mpsc::Receiver<DeadLetter>) {
    tokio::spawn(async move {
        while let Some(letter) = rx.recv().await {
            warn!(
                execution_id = %letter.execution_id,
                card_id = %letter.card_id,
                subject = %letter.subject,
                state = letter.state.as_str(),
                error = %letter.error,
                "dead-lettered execution"
            );
        }
    });
}

fn spawn_token_sweeper(store: Arc<Store>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            ticker.tick().await;
            match store.sweep_expired_tokens() {
                Ok(0) => {}
                Ok(n) => info!(swept = n, "expired idempotency tokens removed"),
                Err(e) => warn!(error = %e, "token sweep failed"),
            }
        }
    });
}

/// Initialize tracing with env-filter overrides.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "collectiq_backend=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn default_data_path(filename: &str) -> String {
    // Anchor defaults to the crate directory so running from elsewhere does
    // not scatter databases across working directories.
    let base = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    base.join(filename).to_string_lossy().to_string()
}

fn resolve_data_path(env_value: Option<String>, default_filename: &str) -> String {
    let base = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let Some(raw) = env_value.filter(|v| !v.trim().is_empty()) else {
        return default_data_path(default_filename);
    };

    let p = PathBuf::from(raw);
    if p.is_absolute() {
        return p.to_string_lossy().to_string();
    }

    base.join(p).to_string_lossy().to_string()
}

fn load_env() {
    // Standard dotenv search (cwd + parents), then the crate directory.
    let _ = dotenv();

    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    let candidate = manifest_dir.join(".env");
    if candidate.exists() {
        let _ = dotenv::from_path(&candidate);
    }
}
