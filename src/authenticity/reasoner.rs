//! Authenticity reasoning over computed signals.
//!
//! The prompt is deterministic: only fixed-precision numbers and canonical
//! OCR text go in. Malformed provider output is retried; exhaustion falls
//! back to the signal roll-up with a degraded marker.

use crate::authenticity::signals::overall;
use crate::error::AppError;
use crate::models::{AuthenticitySignals, AuthenticityVerdict, CardDescriptors, FeatureEnvelope};
use crate::retry::{retry, RetryPolicy};
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

pub const FALLBACK_RATIONALE: &str = "computed from signals; reasoning unavailable";

const SYSTEM_PROMPT: &str = "You are an expert trading-card authenticator. \
You receive numeric authenticity signals and OCR text extracted from a card \
photo. Respond with a single JSON object: \
{\"score\": <number in [0,1]>, \"rationale\": <short string>}. No other text.";

/// Narrow interface over the reasoning service.
#[async_trait]
pub trait ReasoningProvider: Send + Sync {
    async fn complete(&self, system: &str, user: &str) -> Result<String, AppError>;
}

pub struct AuthenticityReasoner {
    provider: Arc<dyn ReasoningProvider>,
    policy: RetryPolicy,
}

impl AuthenticityReasoner {
    pub fn new(provider: Arc<dyn ReasoningProvider>, policy: RetryPolicy) -> Self {
        Self { provider, policy }
    }

    /// Scores the card. Never fails: after the retry budget the result is
    /// the signal roll-up with `degraded` set.
    pub async fn score(
        &self,
        envelope: &FeatureEnvelope,
        signals: &AuthenticitySignals,
        expected: Option<&CardDescriptors>,
    ) -> AuthenticityVerdict {
        let user = build_prompt(envelope, signals, expected);

        let attempt = retry(self.policy, "reasoner", || {
            let user = user.clone();
            async move {
                let raw = self.provider.complete(SYSTEM_PROMPT, &user).await?;
                parse_verdict(&raw)
            }
        })
        .await;

        match attempt {
            Ok((score, rationale)) => {
                info!(score, "reasoner verdict");
                AuthenticityVerdict {
                    authenticity_score: score,
                    rationale,
                    degraded: false,
                }
            }
            Err(err) => {
                warn!(error = %err, "reasoner unavailable, falling back to signals");
                AuthenticityVerdict {
                    authenticity_score: overall(signals),
                    rationale: FALLBACK_RATIONALE.to_string(),
                    degraded: true,
                }
            }
        }
    }
}

fn build_prompt(
    envelope: &FeatureEnvelope,
    signals: &AuthenticitySignals,
    expected: Option<&CardDescriptors>,
) -> String {
    let mut lines = vec![
        format!("visualHashConfidence: {:.4}", signals.visual_hash_confidence),
        format!("textMatchConfidence: {:.4}", signals.text_match_confidence),
        format!("holoPatternConfidence: {:.4}", signals.holo_pattern_confidence),
        format!("borderConsistency: {:.4}", signals.border_consistency),
        format!("fontValidation: {:.4}", signals.font_validation),
        format!("holoVariance: {:.4}", envelope.holo_variance),
        format!("borderSymmetry: {:.4}", envelope.borders.symmetry),
    ];
    if let Some(descriptors) = expected {
        if let Some(name) = &descriptors.name {
            lines.push(format!("expectedName: {name}"));
        }
        if let Some(set) = &descriptors.set {
            lines.push(format!("expectedSet: {set}"));
        }
        if let Some(rarity) = &descriptors.rarity {
            lines.push(format!("expectedRarity: {rarity}"));
        }
    }
    lines.push("ocrText:".to_string());
    for block in &envelope.ocr {
        lines.push(format!("  {}", block.text));
    }
    lines.join("\n")
}

/// Parses `{"score": .., "rationale": ..}` out of the raw completion.
/// Malformed output is a transient failure so the retry budget applies.
fn parse_verdict(raw: &str) -> Result<(f64, String), AppError> {
    #[derive(Deserialize)]
    struct Verdict {
        score: f64,
        rationale: String,
    }

    // Tolerate providers that wrap the object in prose or code fences.
    let start = raw.find('{');
    let end = raw.rfind('}');
    let json = match (start, end) {
        (Some(s), Some(e)) if e > s => &raw[s..=e],
        _ => {
            return Err(AppError::ProviderTransient(
                "reasoner output contains no JSON object".to_string(),
            ))
        }
    };

    let verdict: Verdict = serde_json::from_str(json)
        .map_err(|e| AppError::ProviderTransient(format!("reasoner output malformed: {e}")))?;
    if !verdict.score.is_finite() || !(0.0..=1.0).contains(&verdict.score) {
        return Err(AppError::ProviderTransient(format!(
            "reasoner score out of range: {}",
            verdict.score
        )));
    }
    Ok((verdict.score, verdict.rationale))
}

/// Stand-in used when no reasoning endpoint is configured; scoring falls
/// back to the signal roll-up.
pub struct DisabledReasoningProvider;

#[async_trait]
impl ReasoningProvider for DisabledReasoningProvider {
    async fn complete(&self, _system: &str, _user: &str) -> Result<String, AppError> {
        Err(AppError::ProviderPermanent(
            "reasoning provider not configured".to_string(),
        ))
    }
}

/// Chat-completions client for the hosted reasoning endpoint.
pub struct HttpReasoningProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    timeout: Duration,
}

impl HttpReasoningProvider {
    pub fn new(
        client: reqwest::Client,
        base_url: String,
        api_key: Option<String>,
        model: String,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
            timeout,
        }
    }
}

#[async_trait]
impl ReasoningProvider for HttpReasoningProvider {
    async fn complete(&self, system: &str, user: &str) -> Result<String, AppError> {
        let start = Instant::now();
        let req = ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user.to_string(),
                },
            ],
            temperature: Some(0.0),
            max_tokens: Some(300),
        };

        let mut http_req = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .timeout(self.timeout)
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        if let Some(key) = &self.api_key {
            http_req = http_req.bearer_auth(key);
        }

        let resp = http_req
            .json(&req)
            .send()
            .await
            .map_err(|e| AppError::ProviderTransient(format!("reasoner request: {e}")))?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            let snippet: String = body.chars().take(400).collect();
            return Err(AppError::ProviderTransient(format!(
                "reasoner {}: {snippet}",
                status.as_u16()
            )));
        }
        if !status.is_success() {
            let snippet: String = body.chars().take(400).collect();
            return Err(AppError::ProviderPermanent(format!(
                "reasoner {}: {snippet}",
                status.as_u16()
            )));
        }

        let parsed: ChatCompletionResponse = serde_json::from_str(&body)
            .context("reasoner json parse")
            .map_err(|e| AppError::ProviderTransient(e.to_string()))?;
        let content = parsed
            .choices
            .first()
            .and_then(|c| c.message.as_ref())
            .map(|m| m.content.clone())
            .ok_or_else(|| anyhow!("reasoner returned no choices"))
            .map_err(|e| AppError::ProviderTransient(e.to_string()))?;

        tracing::debug!(
            latency_ms = start.elapsed().as_millis() as u64,
            "reasoner completion"
        );
        Ok(content)
    }
}

#[derive(Debug, Clone, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatChoice {
    message: Option<ChatMessageOut>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatMessageOut {
    content: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Borders, BoundingBox, FontMetrics, ImageMeta, ImageQuality, OcrBlock};
    use parking_lot::Mutex;

    fn envelope() -> FeatureEnvelope {
        FeatureEnvelope {
            ocr: vec![OcrBlock {
                text: "Charizard HP 120".to_string(),
                confidence: 0.9,
                bounding_box: BoundingBox::default(),
            }],
            borders: Borders {
                top: 0.15,
                bottom: 0.15,
                left: 0.15,
                right: 0.15,
                symmetry: 0.95,
            },
            holo_variance: 0.6,
            font_metrics: FontMetrics {
                kerning: vec![1.0],
                alignment: 0.9,
                font_size_variance: 5.0,
            },
            quality: ImageQuality { blur: 0.1, glare: 0.0 },
            image_meta: ImageMeta { width: 800, height: 1100 },
            front_hash: "a1b2c3d4e5f60718".to_string(),
            back_hash: None,
        }
    }

    fn signals() -> AuthenticitySignals {
        AuthenticitySignals {
            visual_hash_confidence: 0.9,
            text_match_confidence: 0.8,
            holo_pattern_confidence: 1.0,
            border_consistency: 1.0,
            font_validation: 0.9,
        }
    }

    struct ScriptedProvider {
        responses: Mutex<Vec<Result<String, AppError>>>,
    }

    #[async_trait]
    impl ReasoningProvider for ScriptedProvider {
        async fn complete(&self, _system: &str, _user: &str) -> Result<String, AppError> {
            self.responses
                .lock()
                .pop()
                .unwrap_or_else(|| Err(AppError::ProviderTransient("exhausted".into())))
        }
    }

    fn reasoner(responses: Vec<Result<String, AppError>>) -> AuthenticityReasoner {
        AuthenticityReasoner::new(
            Arc::new(ScriptedProvider {
                responses: Mutex::new(responses),
            }),
            RetryPolicy::new(3, 1, 2.0),
        )
    }

    #[test]
    fn parse_plain_json() {
        let (score, rationale) =
            parse_verdict(r#"{"score": 0.92, "rationale": "strong hash match"}"#).unwrap();
        assert!((score - 0.92).abs() < 1e-12);
        assert_eq!(rationale, "strong hash match");
    }

    #[test]
    fn parse_fenced_json() {
        let raw = "Here you go:\n```json\n{\"score\": 0.8, \"rationale\": \"ok\"}\n```";
        assert!(parse_verdict(raw).is_ok());
    }

    #[test]
    fn parse_rejects_out_of_range_score() {
        assert!(parse_verdict(r#"{"score": 1.4, "rationale": "x"}"#).is_err());
        assert!(parse_verdict("no json here").is_err());
    }

    #[test]
    fn prompt_is_deterministic() {
        let env = envelope();
        let sig = signals();
        assert_eq!(build_prompt(&env, &sig, None), build_prompt(&env, &sig, None));
        assert!(build_prompt(&env, &sig, None).contains("visualHashConfidence: 0.9000"));
    }

    #[tokio::test]
    async fn verdict_from_provider() {
        let r = reasoner(vec![Ok(
            r#"{"score": 0.92, "rationale": "matches reference print"}"#.to_string(),
        )]);
        let verdict = r.score(&envelope(), &signals(), None).await;
        assert!((verdict.authenticity_score - 0.92).abs() < 1e-12);
        assert!(!verdict.degraded);
    }

    #[tokio::test]
    async fn malformed_three_times_falls_back_degraded() {
        let r = reasoner(vec![
            Ok("garbage".to_string()),
            Ok("also garbage".to_string()),
            Ok("still garbage".to_string()),
        ]);
        let sig = signals();
        let verdict = r.score(&envelope(), &sig, None).await;
        assert!(verdict.degraded);
        assert_eq!(verdict.rationale, FALLBACK_RATIONALE);
        assert!((verdict.authenticity_score - overall(&sig)).abs() < 1e-12);
    }
}
