//! Feature extraction: object fetch, perceptual hashing, and vision-provider
//! normalization into the canonical [`FeatureEnvelope`].

pub mod http;
pub use http::HttpVisionProvider;

use crate::error::AppError;
use crate::models::{Borders, FeatureEnvelope, FontMetrics, ImageMeta, ImageQuality, OcrBlock};
use crate::objectstore::ObjectStore;
use crate::phash;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

/// Provider-independent label/measurement output of the vision service.
#[derive(Debug, Clone)]
pub struct VisionFeatures {
    pub borders: Borders,
    pub holo_variance: f64,
    pub font_metrics: FontMetrics,
    pub quality: ImageQuality,
    pub image_meta: ImageMeta,
}

/// Narrow interface over the computer-vision service. Implementations adapt
/// provider-specific schemas; downstream code never sees them.
#[async_trait]
pub trait VisionProvider: Send + Sync {
    async fn detect_text(&self, image: &[u8]) -> Result<Vec<OcrBlock>, AppError>;
    async fn detect_features(&self, image: &[u8]) -> Result<VisionFeatures, AppError>;
}

/// Stand-in used when no vision endpoint is configured. Every execution
/// that reaches extraction fails fast instead of hanging.
pub struct DisabledVisionProvider;

#[async_trait]
impl VisionProvider for DisabledVisionProvider {
    async fn detect_text(&self, _image: &[u8]) -> Result<Vec<OcrBlock>, AppError> {
        Err(AppError::ProviderPermanent(
            "vision provider not configured".to_string(),
        ))
    }

    async fn detect_features(&self, _image: &[u8]) -> Result<VisionFeatures, AppError> {
        Err(AppError::ProviderPermanent(
            "vision provider not configured".to_string(),
        ))
    }
}

/// Builds a [`FeatureEnvelope`] from stored card images.
pub struct FeatureExtractor {
    objects: Arc<dyn ObjectStore>,
    vision: Arc<dyn VisionProvider>,
}

impl FeatureExtractor {
    pub fn new(objects: Arc<dyn ObjectStore>, vision: Arc<dyn VisionProvider>) -> Self {
        Self { objects, vision }
    }

    pub async fn extract(
        &self,
        front_key: &str,
        back_key: Option<&str>,
    ) -> Result<FeatureEnvelope, AppError> {
        let front_bytes = self
            .objects
            .get(front_key)
            .await?
            // The upload may still be propagating; the step-level retry
            // covers that window.
            .ok_or_else(|| AppError::ProviderTransient(format!("front image missing: {front_key}")))?;

        let back_bytes = match back_key {
            Some(key) => self.objects.get(key).await?,
            None => None,
        };

        let front_hash = phash::hash_image(&front_bytes)
            .map_err(|e| AppError::ProviderPermanent(format!("front image: {e}")))?
            .to_hex();
        let back_hash = match &back_bytes {
            Some(bytes) => Some(
                phash::hash_image(bytes)
                    .map_err(|e| AppError::ProviderPermanent(format!("back image: {e}")))?
                    .to_hex(),
            ),
            None => None,
        };
        debug!(front_hash = %front_hash, "perceptual hashes computed");

        let (ocr, features) = tokio::join!(
            self.vision.detect_text(&front_bytes),
            self.vision.detect_features(&front_bytes),
        );
        let (ocr, features) = (ocr?, features?);

        let envelope = FeatureEnvelope {
            ocr,
            borders: features.borders,
            holo_variance: features.holo_variance,
            font_metrics: features.font_metrics,
            quality: features.quality,
            image_meta: features.image_meta,
            front_hash,
            back_hash,
        };

        envelope
            .validate()
            .map_err(|v| AppError::ProviderPermanent(format!("invalid envelope: {v}")))?;

        info!(
            ocr_blocks = envelope.ocr.len(),
            holo_variance = envelope.holo_variance,
            "feature envelope extracted"
        );
        Ok(envelope)
    }
}
