//! Domain event bus. Events ride a broadcast channel; emission is
//! fire-and-forget and never fails the emitting pipeline.

use crate::models::Subject;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "PascalCase")]
pub enum DomainEvent {
    #[serde(rename_all = "camelCase")]
    CardValuationUpdated {
        subject: Subject,
        card_id: Uuid,
        timestamp: DateTime<Utc>,
        value_median: Option<f64>,
        value_low: Option<f64>,
        value_high: Option<f64>,
        confidence: f64,
        sources: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    AuthenticityFlagged {
        subject: Subject,
        card_id: Uuid,
        timestamp: DateTime<Utc>,
        authenticity_score: f64,
        rationale: String,
    },
}

/// Thin wrapper so emitters never observe send failures as errors.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DomainEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.tx.subscribe()
    }

    /// Emits an event. A lagging or absent consumer is not a failure.
    pub fn emit(&self, event: DomainEvent) {
        if self.tx.send(event.clone()).is_err() {
            debug!(?event, "event emitted with no active subscribers");
        }
    }
}
