//! HTTP gateway: shared state, routes, handlers, idempotency.

pub mod handlers;
pub mod idempotency;
pub mod routes;

use crate::models::Config;
use crate::objectstore::ObjectStore;
use crate::pipeline::Pipeline;
use crate::storage::Store;
use std::sync::Arc;
use tokio::sync::watch;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<Store>,
    pub objects: Arc<dyn ObjectStore>,
    pub pipeline: Arc<Pipeline>,
    /// Flipped on shutdown; in-flight executions abort at the next
    /// suspension point.
    pub shutdown: watch::Receiver<bool>,
}
