//! Authenticity scoring: reference hashes, signal computation, reasoning.

pub mod reasoner;
pub mod references;
pub mod signals;

pub use reasoner::{AuthenticityReasoner, HttpReasoningProvider, ReasoningProvider, FALLBACK_RATIONALE};
pub use references::{ReferenceHash, ReferenceStore};
pub use signals::{compute_signals, overall};
