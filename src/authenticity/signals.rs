//! Authenticity sub-score computation. Pure functions over the feature
//! envelope, expected card attributes, and loaded reference hashes.

use crate::authenticity::references::ReferenceHash;
use crate::models::{AuthenticitySignals, CardDescriptors, FeatureEnvelope};
use crate::phash;
use tracing::debug;

/// Watermark and layout text every genuine print carries somewhere.
const TEXT_PATTERNS: &[&str] = &["HP", "©", "Illus.", "Weakness"];

/// Score emitted when no reference hashes exist for the card.
const NEUTRAL_VISUAL_SCORE: f64 = 0.5;

fn clamp01(v: f64) -> f64 {
    if v.is_finite() {
        v.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

fn variance(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64
}

/// Maximum pHash similarity of the front image against the reference set,
/// or the neutral score when no references exist.
pub fn visual_hash_confidence(front_hash: &str, references: &[ReferenceHash]) -> f64 {
    let mut best: Option<f64> = None;
    for reference in references {
        match phash::hamming_distance(front_hash, &reference.hash) {
            Ok(distance) => {
                let sim = phash::similarity(distance, 64);
                best = Some(best.map_or(sim, |b: f64| b.max(sim)));
            }
            Err(e) => {
                debug!(reference = %reference.hash, error = %e, "skipping malformed reference hash");
            }
        }
    }
    clamp01(best.unwrap_or(NEUTRAL_VISUAL_SCORE))
}

/// Weighted blend of pattern coverage and mean OCR confidence.
pub fn text_match_confidence(envelope: &FeatureEnvelope, expected_name: Option<&str>) -> f64 {
    let haystack = envelope
        .ocr
        .iter()
        .map(|b| b.text.as_str())
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();

    let mut patterns: Vec<String> = TEXT_PATTERNS.iter().map(|p| p.to_lowercase()).collect();
    if let Some(name) = expected_name {
        patterns.push(name.to_lowercase());
    }

    let detected = patterns
        .iter()
        .filter(|p| haystack.contains(p.as_str()))
        .count();
    let p = detected as f64 / patterns.len() as f64;

    let c = if envelope.ocr.is_empty() {
        0.0
    } else {
        envelope.ocr.iter().map(|b| b.confidence).sum::<f64>() / envelope.ocr.len() as f64
    };

    clamp01(0.7 * p + 0.3 * c)
}

/// Holographic-surface plausibility given the expected printing.
pub fn holo_pattern_confidence(holo_variance: f64, expects_holo: bool) -> f64 {
    let v = holo_variance;
    let score = if !expects_holo {
        if v < 0.2 {
            1.0
        } else if v < 0.4 {
            0.7
        } else {
            0.3
        }
    } else if v < 0.3 {
        0.3 + (v / 0.3) * 0.2
    } else if v > 0.9 {
        (0.5 - (v - 0.9)).max(0.2)
    } else {
        (1.0 - (v - 0.6).abs() / 0.3).max(0.5)
    };
    clamp01(score)
}

/// Border geometry score. Genuine prints run close to a 0.15 border ratio
/// with low spread and high left/right symmetry.
pub fn border_consistency(envelope: &FeatureEnvelope) -> f64 {
    let ratios = envelope.borders.ratios();
    let spread = clamp01(1.0 - 10.0 * variance(&ratios));

    let mean = ratios.iter().sum::<f64>() / ratios.len() as f64;
    let deviation = (mean - 0.15).abs();
    let ratio_confidence = if deviation <= 0.10 {
        1.0
    } else {
        clamp01(1.0 - (deviation - 0.10) / 0.20)
    };

    clamp01(0.4 * envelope.borders.symmetry + 0.3 * spread + 0.3 * ratio_confidence)
}

/// Typography score from alignment, kerning spread, and size variance.
pub fn font_validation(envelope: &FeatureEnvelope) -> f64 {
    let metrics = &envelope.font_metrics;
    let alignment = clamp01(metrics.alignment);
    let kerning = clamp01(1.0 - variance(&metrics.kerning) / 0.05);
    let sizing = clamp01(1.0 - metrics.font_size_variance / 50.0);
    clamp01(0.4 * alignment + 0.3 * kerning + 0.3 * sizing)
}

/// Computes the full signal set for one execution.
pub fn compute_signals(
    envelope: &FeatureEnvelope,
    expected: Option<&CardDescriptors>,
    references: &[ReferenceHash],
) -> AuthenticitySignals {
    let expected_name = expected.and_then(|d| d.name.as_deref());
    let expects_holo = expected.map(|d| d.expects_holo()).unwrap_or(false);

    AuthenticitySignals {
        visual_hash_confidence: visual_hash_confidence(&envelope.front_hash, references),
        text_match_confidence: text_match_confidence(envelope, expected_name),
        holo_pattern_confidence: holo_pattern_confidence(envelope.holo_variance, expects_holo),
        border_consistency: border_consistency(envelope),
        font_validation: font_validation(envelope),
    }
}

/// Fixed-weight roll-up of the sub-scores.
pub fn overall(signals: &AuthenticitySignals) -> f64 {
    clamp01(
        0.30 * signals.visual_hash_confidence
            + 0.25 * signals.text_match_confidence
            + 0.20 * signals.holo_pattern_confidence
            + 0.15 * signals.border_consistency
            + 0.10 * signals.font_validation,
    )
}
