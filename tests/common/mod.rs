//! Shared fixtures: scripted providers, a wired application harness, and
//! image helpers.

#![allow(dead_code)]

use async_trait::async_trait;
use axum::Router;
use collectiq_backend::api::{routes, AppState};
use collectiq_backend::auth::JwtHandler;
use collectiq_backend::authenticity::{AuthenticityReasoner, ReasoningProvider, ReferenceStore};
use collectiq_backend::error::AppError;
use collectiq_backend::events::{DomainEvent, EventBus};
use collectiq_backend::models::{
    Borders, BoundingBox, Comp, Config, FontMetrics, ImageMeta, ImageQuality, OcrBlock, Subject,
};
use collectiq_backend::objectstore::FsObjectStore;
use collectiq_backend::pipeline::{DeadLetter, Pipeline, PipelineConfig};
use collectiq_backend::pricing::{CompQuery, FxTable, PricingAdapter};
use collectiq_backend::retry::RetryPolicy;
use collectiq_backend::storage::Store;
use collectiq_backend::vision::{FeatureExtractor, VisionFeatures, VisionProvider};
use chrono::{Duration as ChronoDuration, Utc};
use image::{ImageOutputFormat, Rgb, RgbImage};
use std::io::Cursor;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{broadcast, mpsc, watch};

pub const JWT_SECRET: &str = "integration-test-secret-0123456789abcdef";

// ---- Image fixtures -------------------------------------------------------

pub fn png_bytes() -> Vec<u8> {
    let img = RgbImage::from_fn(96, 132, |x, y| {
        Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
    });
    let mut buf = Vec::new();
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut buf), ImageOutputFormat::Png)
        .unwrap();
    buf
}

// ---- Scripted vision ------------------------------------------------------

/// Fixed, plausible front-of-card features: tidy borders, holo surface,
/// clean typography, OCR carrying the watermark set and the card name.
pub struct ScriptedVision;

#[async_trait]
impl VisionProvider for ScriptedVision {
    async fn detect_text(&self, _image: &[u8]) -> Result<Vec<OcrBlock>, AppError> {
        Ok(vec![
            OcrBlock {
                text: "Charizard HP 120".to_string(),
                confidence: 0.96,
                bounding_box: BoundingBox::default(),
            },
            OcrBlock {
                text: "Weakness  ©1999 Wizards  Illus. Mitsuhiro Arita".to_string(),
                confidence: 0.9,
                bounding_box: BoundingBox::default(),
            },
        ])
    }

    async fn detect_features(&self, _image: &[u8]) -> Result<VisionFeatures, AppError> {
        Ok(VisionFeatures {
            borders: Borders {
                top: 0.15,
                bottom: 0.15,
                left: 0.15,
                right: 0.15,
                symmetry: 0.95,
            },
            holo_variance: 0.6,
            font_metrics: FontMetrics {
                kerning: vec![1.0, 1.02, 0.98],
                alignment: 0.95,
                font_size_variance: 5.0,
            },
            quality: ImageQuality {
                blur: 0.1,
                glare: 0.05,
            },
            image_meta: ImageMeta {
                width: 96,
                height: 132,
            },
        })
    }
}

// ---- Scripted reasoner ----------------------------------------------------

#[derive(Clone)]
pub enum ReasonerScript {
    /// Always returns a valid verdict with this score.
    Score(f64),
    /// Always returns unparseable output.
    Malformed,
    /// Always fails at the transport level.
    Unavailable,
}

pub struct ScriptedReasoner {
    pub script: ReasonerScript,
    pub calls: AtomicU32,
}

impl ScriptedReasoner {
    pub fn new(script: ReasonerScript) -> Arc<Self> {
        Arc::new(Self {
            script,
            calls: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl ReasoningProvider for ScriptedReasoner {
    async fn complete(&self, _system: &str, _user: &str) -> Result<String, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.script {
            ReasonerScript::Score(score) => Ok(format!(
                r#"{{"score": {score}, "rationale": "matches reference print"}}"#
            )),
            ReasonerScript::Malformed => Ok("I think this card looks authentic!".to_string()),
            ReasonerScript::Unavailable => {
                Err(AppError::ProviderTransient("reasoner down".to_string()))
            }
        }
    }
}

// ---- Scripted pricing adapters --------------------------------------------

#[derive(Clone)]
pub enum AdapterScript {
    /// Returns one USD comp per price, spaced one day apart.
    Comps(Vec<f64>),
    Empty,
    /// Permanent failure on every call.
    Fail,
    /// Transient failures for the first `n` calls, then comps.
    FlakyThenComps(u32, Vec<f64>),
    /// Never returns; exercises timeouts and cancellation.
    Hang,
}

pub struct ScriptedAdapter {
    tag: &'static str,
    script: AdapterScript,
    pub calls: AtomicU32,
}

impl ScriptedAdapter {
    pub fn new(tag: &'static str, script: AdapterScript) -> Arc<Self> {
        Arc::new(Self {
            tag,
            script,
            calls: AtomicU32::new(0),
        })
    }

    fn comps_from(&self, prices: &[f64]) -> Vec<Comp> {
        prices
            .iter()
            .enumerate()
            .map(|(i, price)| Comp {
                price: *price,
                currency: "USD".to_string(),
                condition: Some("Near Mint".to_string()),
                sold_at: Utc::now() - ChronoDuration::days(i as i64 + 1),
                source_tag: self.tag.to_string(),
                url: None,
            })
            .collect()
    }
}

#[async_trait]
impl PricingAdapter for ScriptedAdapter {
    fn tag(&self) -> &'static str {
        self.tag
    }

    async fn fetch_comps(
        &self,
        _query: &CompQuery,
        _window_days: u32,
    ) -> Result<Vec<Comp>, AppError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.script {
            AdapterScript::Comps(prices) => Ok(self.comps_from(prices)),
            AdapterScript::Empty => Ok(Vec::new()),
            AdapterScript::Fail => Err(AppError::ProviderPermanent(format!(
                "{} unavailable",
                self.tag
            ))),
            AdapterScript::FlakyThenComps(n, prices) => {
                if call < *n {
                    Err(AppError::ProviderTransient(format!("{} 503", self.tag)))
                } else {
                    Ok(self.comps_from(prices))
                }
            }
            AdapterScript::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(Vec::new())
            }
        }
    }
}

// ---- Harness --------------------------------------------------------------

pub struct Harness {
    pub router: Router,
    pub state: AppState,
    pub store: Arc<Store>,
    pub objects: Arc<FsObjectStore>,
    pub pipeline: Arc<Pipeline>,
    pub jwt: Arc<JwtHandler>,
    pub events: broadcast::Receiver<DomainEvent>,
    pub dead_letters: mpsc::Receiver<DeadLetter>,
    pub shutdown_tx: watch::Sender<bool>,
    _dir: TempDir,
}

pub fn test_config(dir: &std::path::Path) -> Config {
    Config {
        bind_addr: "127.0.0.1:0".to_string(),
        database_path: ":memory:".to_string(),
        jwt_secret: JWT_SECRET.to_string(),
        object_store_root: dir.to_string_lossy().to_string(),
        object_store_secret: "test-presign-secret".to_string(),
        object_store_public_url: "http://localhost:3000/uploads".to_string(),
        max_upload_bytes: 12 * 1024 * 1024,
        allowed_mime_types: vec![
            "image/jpeg".to_string(),
            "image/png".to_string(),
            "image/webp".to_string(),
        ],
        presign_ttl_seconds: 900,
        idempotency_ttl_seconds: 600,
        revalue_window_days: 30,
        authenticity_flag_threshold: 0.5,
        pricing_adapter_timeout_ms: 500,
        pricing_adapters_enabled: vec!["a".to_string(), "b".to_string(), "c".to_string()],
        execution_hard_deadline_ms: 5_000,
        retry_max_attempts: 3,
        retry_base_ms: 1,
        retry_backoff_factor: 2.0,
        vision_api_url: None,
        vision_api_key: None,
        reasoning_api_url: None,
        reasoning_api_key: None,
        reasoning_model: "test".to_string(),
        exchange_rates: vec![("EUR".to_string(), 1.08)],
    }
}

pub fn build_harness(
    adapters: Vec<Arc<dyn PricingAdapter>>,
    reasoner_provider: Arc<dyn ReasoningProvider>,
    tweak: impl FnOnce(&mut Config),
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    tweak(&mut config);
    let config = Arc::new(config);

    let store = Arc::new(Store::in_memory().unwrap());
    let objects = Arc::new(FsObjectStore::new(
        dir.path(),
        config.object_store_secret.clone(),
        config.object_store_public_url.clone(),
    ));
    let jwt = Arc::new(JwtHandler::new(config.jwt_secret.clone()));

    let retry_policy = RetryPolicy::new(
        config.retry_max_attempts,
        config.retry_base_ms,
        config.retry_backoff_factor,
    );

    let extractor = Arc::new(FeatureExtractor::new(objects.clone(), Arc::new(ScriptedVision)));
    let references = Arc::new(ReferenceStore::new(objects.clone()));
    let reasoner = Arc::new(AuthenticityReasoner::new(reasoner_provider, retry_policy));

    let bus = EventBus::new(64);
    let events = bus.subscribe();
    let (dead_letter_tx, dead_letters) = mpsc::channel(64);

    let pipeline = Arc::new(Pipeline::new(
        store.clone(),
        extractor,
        references,
        reasoner,
        adapters,
        FxTable::from_pairs(&config.exchange_rates),
        bus,
        dead_letter_tx,
        PipelineConfig {
            retry_policy,
            adapter_timeout: Duration::from_millis(config.pricing_adapter_timeout_ms),
            hard_deadline: Duration::from_millis(config.execution_hard_deadline_ms),
            flag_threshold: config.authenticity_flag_threshold,
        },
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let state = AppState {
        config,
        store: store.clone(),
        objects: objects.clone(),
        pipeline: pipeline.clone(),
        shutdown: shutdown_rx,
    };
    let router = routes::router(state.clone(), jwt.clone());

    Harness {
        router,
        state,
        store,
        objects,
        pipeline,
        jwt,
        events,
        dead_letters,
        shutdown_tx,
        _dir: dir,
    }
}

impl Harness {
    pub fn token(&self, subject: &str) -> String {
        self.jwt.issue_token(subject, 1).unwrap()
    }

    pub async fn seed_front(&self, subject: &str) -> String {
        let key = format!("uploads/{subject}/front.png");
        self.objects.put(&key, &png_bytes()).await.unwrap();
        key
    }
}

pub fn subject(s: &str) -> Subject {
    Subject(s.to_string())
}
