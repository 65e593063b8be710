//! Final aggregation: merge pricing and authenticity into an immutable
//! snapshot, persist it atomically with the card's cached-latest fields,
//! and emit domain events.

use crate::error::AppError;
use crate::events::{DomainEvent, EventBus};
use crate::models::{
    AuthenticitySignals, AuthenticityVerdict, PricingSummary, Subject, ValuationSnapshot,
};
use crate::storage::Store;
use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

/// Builds the snapshot and checks the data-model invariants before any
/// write happens.
pub fn build_snapshot(
    subject: Subject,
    card_id: Uuid,
    pricing: &PricingSummary,
    signals: AuthenticitySignals,
    verdict: &AuthenticityVerdict,
    timestamp: DateTime<Utc>,
) -> Result<ValuationSnapshot, AppError> {
    if pricing.window_days < 1 {
        return Err(AppError::Validation(format!(
            "windowDays must be >= 1, got {}",
            pricing.window_days
        )));
    }
    if let (Some(low), Some(median), Some(high)) =
        (pricing.value_low, pricing.value_median, pricing.value_high)
    {
        if !(low <= median && median <= high) {
            return Err(AppError::Validation(format!(
                "valuation band out of order: {low} / {median} / {high}"
            )));
        }
    }
    for (name, score) in [
        ("confidence", pricing.confidence),
        ("authenticityScore", verdict.authenticity_score),
        ("visualHashConfidence", signals.visual_hash_confidence),
        ("textMatchConfidence", signals.text_match_confidence),
        ("holoPatternConfidence", signals.holo_pattern_confidence),
        ("borderConsistency", signals.border_consistency),
        ("fontValidation", signals.font_validation),
    ] {
        if !score.is_finite() || !(0.0..=1.0).contains(&score) {
            return Err(AppError::Validation(format!("{name} out of [0,1]: {score}")));
        }
    }

    Ok(ValuationSnapshot {
        subject,
        card_id,
        timestamp,
        value_low: pricing.value_low,
        value_median: pricing.value_median,
        value_high: pricing.value_high,
        comps_count: pricing.comps_count,
        window_days: pricing.window_days,
        confidence: pricing.confidence,
        authenticity_score: verdict.authenticity_score,
        authenticity_signals: signals,
        sources: pricing.sources.clone(),
        rationale: Some(verdict.rationale.clone()),
        degraded: verdict.degraded,
    })
}

/// Persists the snapshot + card cache in one write group and emits events.
/// Event emission failure is logged inside the bus and never fails the run.
pub fn aggregate(
    store: &Store,
    bus: &EventBus,
    snapshot: &ValuationSnapshot,
    flag_threshold: f64,
) -> Result<(), AppError> {
    store.write_snapshot_and_update_card(snapshot)?;

    bus.emit(DomainEvent::CardValuationUpdated {
        subject: snapshot.subject.clone(),
        card_id: snapshot.card_id,
        timestamp: snapshot.timestamp,
        value_median: snapshot.value_median,
        value_low: snapshot.value_low,
        value_high: snapshot.value_high,
        confidence: snapshot.confidence,
        sources: snapshot.sources.clone(),
    });

    if snapshot.authenticity_score < flag_threshold {
        bus.emit(DomainEvent::AuthenticityFlagged {
            subject: snapshot.subject.clone(),
            card_id: snapshot.card_id,
            timestamp: snapshot.timestamp,
            authenticity_score: snapshot.authenticity_score,
            rationale: snapshot.rationale.clone().unwrap_or_default(),
        });
    }

    info!(
        card_id = %snapshot.card_id,
        median = ?snapshot.value_median,
        authenticity = snapshot.authenticity_score,
        degraded = snapshot.degraded,
        "snapshot aggregated"
    );
    Ok(())
}
