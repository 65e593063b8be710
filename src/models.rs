//! Core domain types shared across the valuation pipeline, the HTTP
//! surface, and the persistence layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Verified principal owning all data. Established by the auth middleware
/// from a validated bearer token, never from request bodies.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Subject(pub String);

impl Subject {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Subject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Optional descriptive fields supplied at card creation or by owner edits.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardDescriptors {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub set: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rarity: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub card_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition_estimate: Option<String>,
}

impl CardDescriptors {
    /// True when the named rarity indicates a holographic printing.
    pub fn expects_holo(&self) -> bool {
        self.rarity
            .as_deref()
            .map(|r| r.to_ascii_lowercase().contains("holo"))
            .unwrap_or(false)
    }
}

/// A user's card. Mutated only by the aggregator or owner-initiated edits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Card {
    pub card_id: Uuid,
    pub subject: Subject,
    pub front_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub back_key: Option<String>,
    #[serde(flatten)]
    pub descriptors: CardDescriptors,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_low: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_median: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_high: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authenticity_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authenticity_signals: Option<AuthenticitySignals>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Card {
    pub fn new(
        subject: Subject,
        front_key: String,
        back_key: Option<String>,
        descriptors: CardDescriptors,
    ) -> Self {
        let now = Utc::now();
        Self {
            card_id: Uuid::new_v4(),
            subject,
            front_key,
            back_key,
            descriptors,
            value_low: None,
            value_median: None,
            value_high: None,
            authenticity_score: None,
            authenticity_signals: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Immutable, time-stamped valuation + authenticity record for a card.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValuationSnapshot {
    pub subject: Subject,
    pub card_id: Uuid,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_low: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_median: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_high: Option<f64>,
    pub comps_count: usize,
    pub window_days: u32,
    pub confidence: f64,
    pub authenticity_score: f64,
    pub authenticity_signals: AuthenticitySignals,
    pub sources: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    /// Set when a fallback path produced part of this snapshot.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub degraded: bool,
}

/// One OCR text block normalized from the vision provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OcrBlock {
    pub text: String,
    pub confidence: f64,
    pub bounding_box: BoundingBox,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// Border widths as fractions of the card dimensions, plus symmetry in [0,1].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Borders {
    pub top: f64,
    pub bottom: f64,
    pub left: f64,
    pub right: f64,
    pub symmetry: f64,
}

impl Borders {
    pub fn ratios(&self) -> [f64; 4] {
        [self.top, self.bottom, self.left, self.right]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FontMetrics {
    pub kerning: Vec<f64>,
    pub alignment: f64,
    pub font_size_variance: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageQuality {
    pub blur: f64,
    pub glare: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageMeta {
    pub width: u32,
    pub height: u32,
}

/// Canonical, provider-independent container for extracted visual features.
/// Passed between orchestration steps; never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureEnvelope {
    pub ocr: Vec<OcrBlock>,
    pub borders: Borders,
    pub holo_variance: f64,
    pub font_metrics: FontMetrics,
    pub quality: ImageQuality,
    pub image_meta: ImageMeta,
    pub front_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub back_hash: Option<String>,
}

fn is_hex16(s: &str) -> bool {
    s.len() == 16 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

impl FeatureEnvelope {
    /// Checks the envelope invariants. Returns the first violation found.
    pub fn validate(&self) -> Result<(), String> {
        fn unit(name: &str, v: f64) -> Result<(), String> {
            if !v.is_finite() || !(0.0..=1.0).contains(&v) {
                return Err(format!("{name} out of [0,1]: {v}"));
            }
            Ok(())
        }

        for (i, block) in self.ocr.iter().enumerate() {
            unit(&format!("ocr[{i}].confidence"), block.confidence)?;
        }
        unit("borders.symmetry", self.borders.symmetry)?;
        unit("holoVariance", self.holo_variance)?;
        unit("fontMetrics.alignment", self.font_metrics.alignment)?;
        if self.image_meta.width == 0 || self.image_meta.height == 0 {
            return Err("imageMeta has zero dimension".to_string());
        }
        if !is_hex16(&self.front_hash) {
            return Err("frontHash is not 16 hex chars".to_string());
        }
        if let Some(back) = &self.back_hash {
            if !is_hex16(back) {
                return Err("backHash is not 16 hex chars".to_string());
            }
        }
        Ok(())
    }
}

/// Explainable authenticity sub-scores, each in [0,1].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticitySignals {
    pub visual_hash_confidence: f64,
    pub text_match_confidence: f64,
    pub holo_pattern_confidence: f64,
    pub border_consistency: f64,
    pub font_validation: f64,
}

/// One comparable sale normalized from a pricing marketplace.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comp {
    pub price: f64,
    pub currency: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    pub sold_at: DateTime<Utc>,
    pub source_tag: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Deterministic reconciliation of comps into a valuation band.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PricingSummary {
    pub value_low: Option<f64>,
    pub value_median: Option<f64>,
    pub value_high: Option<f64>,
    pub comps_count: usize,
    pub window_days: u32,
    pub confidence: f64,
    pub sources: Vec<String>,
}

impl PricingSummary {
    /// The no-data result: zero confidence, null band.
    pub fn no_data(window_days: u32) -> Self {
        Self {
            value_low: None,
            value_median: None,
            value_high: None,
            comps_count: 0,
            window_days,
            confidence: 0.0,
            sources: Vec::new(),
        }
    }
}

/// Reasoner output attached to a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticityVerdict {
    pub authenticity_score: f64,
    pub rationale: String,
    pub degraded: bool,
}

/// State of a pipeline execution, persisted on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionState {
    Queued,
    Extracting,
    Scoring,
    Aggregating,
    Done,
    Error,
}

impl ExecutionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionState::Queued => "QUEUED",
            ExecutionState::Extracting => "EXTRACTING",
            ExecutionState::Scoring => "SCORING",
            ExecutionState::Aggregating => "AGGREGATING",
            ExecutionState::Done => "DONE",
            ExecutionState::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "QUEUED" => Some(Self::Queued),
            "EXTRACTING" => Some(Self::Extracting),
            "SCORING" => Some(Self::Scoring),
            "AGGREGATING" => Some(Self::Aggregating),
            "DONE" => Some(Self::Done),
            "ERROR" => Some(Self::Error),
            _ => None,
        }
    }
}

/// Durable trace of a single pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    pub execution_id: Uuid,
    pub card_id: Uuid,
    pub subject: Subject,
    pub state: ExecutionState,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Application configuration, loaded once at startup and immutable after.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub database_path: String,
    pub jwt_secret: String,
    pub object_store_root: String,
    pub object_store_secret: String,
    pub object_store_public_url: String,
    pub max_upload_bytes: u64,
    pub allowed_mime_types: Vec<String>,
    pub presign_ttl_seconds: u64,
    pub idempotency_ttl_seconds: i64,
    pub revalue_window_days: u32,
    pub authenticity_flag_threshold: f64,
    pub pricing_adapter_timeout_ms: u64,
    pub pricing_adapters_enabled: Vec<String>,
    pub execution_hard_deadline_ms: u64,
    pub retry_max_attempts: u32,
    pub retry_base_ms: u64,
    pub retry_backoff_factor: f64,
    pub vision_api_url: Option<String>,
    pub vision_api_key: Option<String>,
    pub reasoning_api_url: Option<String>,
    pub reasoning_api_key: Option<String>,
    pub reasoning_model: String,
    /// Units of canonical currency (USD) per one unit of the keyed currency.
    pub exchange_rates: Vec<(String, f64)>,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_list(key: &str, default: &str) -> Vec<String> {
    std::env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl Config {
    pub fn from_env() -> Self {
        let exchange_rates = std::env::var("EXCHANGE_RATES")
            .unwrap_or_else(|_| "EUR:1.08,GBP:1.27,CAD:0.73".to_string())
            .split(',')
            .filter_map(|pair| {
                let (code, rate) = pair.split_once(':')?;
                let rate: f64 = rate.trim().parse().ok()?;
                (rate > 0.0).then(|| (code.trim().to_ascii_uppercase(), rate))
            })
            .collect();

        Self {
            bind_addr: std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
            database_path: std::env::var("DB_PATH").unwrap_or_else(|_| "collectiq.db".to_string()),
            jwt_secret: std::env::var("JWT_SECRET").unwrap_or_else(|_| {
                "dev-secret-change-in-production-minimum-32-characters".to_string()
            }),
            object_store_root: std::env::var("OBJECT_STORE_ROOT")
                .unwrap_or_else(|_| "collectiq-objects".to_string()),
            object_store_secret: std::env::var("OBJECT_STORE_SECRET")
                .unwrap_or_else(|_| "dev-presign-secret".to_string()),
            object_store_public_url: std::env::var("OBJECT_STORE_PUBLIC_URL")
                .unwrap_or_else(|_| "http://localhost:3000/uploads".to_string()),
            max_upload_bytes: env_or("MAX_UPLOAD_BYTES", 12 * 1024 * 1024),
            allowed_mime_types: env_list("ALLOWED_MIME_TYPES", "image/jpeg,image/png,image/webp"),
            presign_ttl_seconds: env_or("PRESIGN_TTL_SECONDS", 900),
            idempotency_ttl_seconds: env_or("IDEMPOTENCY_TTL_SECONDS", 600),
            revalue_window_days: env_or("REVALUE_WINDOW_DAYS", 30),
            authenticity_flag_threshold: env_or("AUTHENTICITY_FLAG_THRESHOLD", 0.5),
            pricing_adapter_timeout_ms: env_or("PRICING_ADAPTER_TIMEOUT_MS", 10_000),
            pricing_adapters_enabled: env_list(
                "PRICING_ADAPTERS_ENABLED",
                "ebay,tcgplayer,cardmarket",
            ),
            execution_hard_deadline_ms: env_or("EXECUTION_HARD_DEADLINE_MS", 180_000),
            retry_max_attempts: env_or("RETRY_MAX_ATTEMPTS", 3),
            retry_base_ms: env_or("RETRY_BASE_MS", 2_000),
            retry_backoff_factor: env_or("RETRY_BACKOFF_FACTOR", 2.0),
            vision_api_url: std::env::var("VISION_API_URL")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            vision_api_key: std::env::var("VISION_API_KEY")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            reasoning_api_url: std::env::var("REASONING_API_URL")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            reasoning_api_key: std::env::var("REASONING_API_KEY")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            reasoning_model: std::env::var("REASONING_MODEL")
                .unwrap_or_else(|_| "anthropic/claude-3-haiku".to_string()),
            exchange_rates,
        }
    }

    pub fn exchange_rate(&self, currency: &str) -> Option<f64> {
        if currency.eq_ignore_ascii_case("USD") {
            return Some(1.0);
        }
        self.exchange_rates
            .iter()
            .find(|(code, _)| code.eq_ignore_ascii_case(currency))
            .map(|(_, rate)| *rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope() -> FeatureEnvelope {
        FeatureEnvelope {
            ocr: vec![OcrBlock {
                text: "Charizard HP 120".to_string(),
                confidence: 0.96,
                bounding_box: BoundingBox::default(),
            }],
            borders: Borders {
                top: 0.15,
                bottom: 0.15,
                left: 0.14,
                right: 0.16,
                symmetry: 0.9,
            },
            holo_variance: 0.55,
            font_metrics: FontMetrics {
                kerning: vec![1.0, 1.1, 0.95],
                alignment: 0.9,
                font_size_variance: 12.0,
            },
            quality: ImageQuality {
                blur: 0.1,
                glare: 0.05,
            },
            image_meta: ImageMeta {
                width: 800,
                height: 1100,
            },
            front_hash: "a1b2c3d4e5f60718".to_string(),
            back_hash: None,
        }
    }

    #[test]
    fn valid_envelope_passes() {
        assert!(envelope().validate().is_ok());
    }

    #[test]
    fn bad_confidence_rejected() {
        let mut env = envelope();
        env.ocr[0].confidence = 1.4;
        assert!(env.validate().is_err());
    }

    #[test]
    fn bad_hash_rejected() {
        let mut env = envelope();
        env.front_hash = "not-a-hash".to_string();
        assert!(env.validate().is_err());
    }

    #[test]
    fn holo_expectation_from_rarity() {
        let descriptors = CardDescriptors {
            rarity: Some("Holo Rare".to_string()),
            ..Default::default()
        };
        assert!(descriptors.expects_holo());
        assert!(!CardDescriptors::default().expects_holo());
    }

    #[test]
    fn execution_state_round_trip() {
        for state in [
            ExecutionState::Queued,
            ExecutionState::Extracting,
            ExecutionState::Scoring,
            ExecutionState::Aggregating,
            ExecutionState::Done,
            ExecutionState::Error,
        ] {
            assert_eq!(ExecutionState::parse(state.as_str()), Some(state));
        }
    }

    #[test]
    fn exchange_rate_lookup() {
        let config = Config::from_env();
        assert_eq!(config.exchange_rate("USD"), Some(1.0));
        assert!(config.exchange_rate("EUR").is_some());
        assert_eq!(config.exchange_rate("XYZ"), None);
    }
}
