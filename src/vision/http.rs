//! HTTP vision provider. Frames go up as base64 JSON; the wire schema is
//! adapted here and nowhere else.

use crate::error::AppError;
use crate::models::{Borders, BoundingBox, FontMetrics, ImageMeta, ImageQuality, OcrBlock};
use crate::vision::{VisionFeatures, VisionProvider};
use anyhow::Context;
use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use serde::{Deserialize, Serialize};

pub struct HttpVisionProvider {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpVisionProvider {
    pub fn new(client: Client, base_url: String, api_key: Option<String>) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    async fn post<Req: Serialize, Resp: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &Req,
    ) -> Result<Resp, AppError> {
        let mut request = self.client.post(format!("{}/{path}", self.base_url));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .json(body)
            .send()
            .await
            .map_err(|e| AppError::ProviderTransient(format!("vision request: {e}")))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(AppError::ProviderTransient(format!("vision returned {status}")));
        }
        if !status.is_success() {
            return Err(AppError::ProviderPermanent(format!("vision returned {status}")));
        }

        response
            .json()
            .await
            .context("vision response parse")
            .map_err(|e| AppError::ProviderPermanent(e.to_string()))
    }
}

fn clamp01(v: f64) -> f64 {
    if v.is_finite() {
        v.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

#[async_trait]
impl VisionProvider for HttpVisionProvider {
    async fn detect_text(&self, image: &[u8]) -> Result<Vec<OcrBlock>, AppError> {
        let body = FrameRequest {
            image_base64: base64::engine::general_purpose::STANDARD.encode(image),
        };
        let resp: TextDetectResponse = self.post("text:detect", &body).await?;
        Ok(resp
            .blocks
            .into_iter()
            .map(|b| OcrBlock {
                text: b.text,
                confidence: clamp01(b.confidence),
                bounding_box: BoundingBox {
                    x: b.bounding_box.x,
                    y: b.bounding_box.y,
                    width: b.bounding_box.width,
                    height: b.bounding_box.height,
                },
            })
            .collect())
    }

    async fn detect_features(&self, image: &[u8]) -> Result<VisionFeatures, AppError> {
        let body = FrameRequest {
            image_base64: base64::engine::general_purpose::STANDARD.encode(image),
        };
        let resp: FeatureDetectResponse = self.post("labels:detect", &body).await?;

        Ok(VisionFeatures {
            borders: Borders {
                top: resp.borders.top,
                bottom: resp.borders.bottom,
                left: resp.borders.left,
                right: resp.borders.right,
                symmetry: clamp01(resp.borders.symmetry),
            },
            holo_variance: clamp01(resp.holo_variance),
            font_metrics: FontMetrics {
                kerning: resp.font_metrics.kerning,
                alignment: clamp01(resp.font_metrics.alignment),
                font_size_variance: resp.font_metrics.font_size_variance.max(0.0),
            },
            quality: ImageQuality {
                blur: resp.quality.blur,
                glare: resp.quality.glare,
            },
            image_meta: ImageMeta {
                width: resp.image.width,
                height: resp.image.height,
            },
        })
    }
}

#[derive(Debug, Serialize)]
struct FrameRequest {
    #[serde(rename = "imageBase64")]
    image_base64: String,
}

#[derive(Debug, Deserialize)]
struct TextDetectResponse {
    #[serde(default)]
    blocks: Vec<TextBlock>,
}

#[derive(Debug, Deserialize)]
struct TextBlock {
    text: String,
    #[serde(default)]
    confidence: f64,
    #[serde(rename = "boundingBox", default)]
    bounding_box: WireBox,
}

#[derive(Debug, Default, Deserialize)]
struct WireBox {
    #[serde(default)]
    x: f64,
    #[serde(default)]
    y: f64,
    #[serde(default)]
    width: f64,
    #[serde(default)]
    height: f64,
}

#[derive(Debug, Deserialize)]
struct FeatureDetectResponse {
    borders: WireBorders,
    #[serde(rename = "holoVariance", default)]
    holo_variance: f64,
    #[serde(rename = "fontMetrics")]
    font_metrics: WireFontMetrics,
    quality: WireQuality,
    image: WireImage,
}

#[derive(Debug, Deserialize)]
struct WireBorders {
    top: f64,
    bottom: f64,
    left: f64,
    right: f64,
    #[serde(default)]
    symmetry: f64,
}

#[derive(Debug, Deserialize)]
struct WireFontMetrics {
    #[serde(default)]
    kerning: Vec<f64>,
    #[serde(default)]
    alignment: f64,
    #[serde(rename = "fontSizeVariance", default)]
    font_size_variance: f64,
}

#[derive(Debug, Deserialize)]
struct WireQuality {
    #[serde(default)]
    blur: f64,
    #[serde(default)]
    glare: f64,
}

#[derive(Debug, Deserialize)]
struct WireImage {
    width: u32,
    height: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feature_response_parses() {
        let raw = r#"{
            "borders": {"top": 0.15, "bottom": 0.14, "left": 0.15, "right": 0.16, "symmetry": 0.93},
            "holoVariance": 0.61,
            "fontMetrics": {"kerning": [1.0, 1.1], "alignment": 0.88, "fontSizeVariance": 9.5},
            "quality": {"blur": 0.2, "glare": 0.1},
            "image": {"width": 800, "height": 1100}
        }"#;
        let parsed: FeatureDetectResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.image.width, 800);
        assert!((parsed.holo_variance - 0.61).abs() < 1e-9);
    }

    #[test]
    fn text_response_tolerates_missing_fields() {
        let raw = r#"{"blocks": [{"text": "HP 120"}]}"#;
        let parsed: TextDetectResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.blocks[0].text, "HP 120");
        assert_eq!(parsed.blocks[0].confidence, 0.0);
    }

    #[test]
    fn clamp_guards_out_of_range_provider_values() {
        assert_eq!(clamp01(1.7), 1.0);
        assert_eq!(clamp01(-0.2), 0.0);
        assert_eq!(clamp01(f64::NAN), 0.0);
    }
}
