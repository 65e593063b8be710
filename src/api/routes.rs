//! Route table. Everything except the health probe sits behind the
//! bearer-token middleware.

use crate::api::{handlers, AppState};
use crate::auth::{auth_middleware, JwtHandler};
use crate::middleware::{request_context, request_logging};
use axum::{
    middleware as axum_mw,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

pub fn router(state: AppState, jwt: Arc<JwtHandler>) -> Router {
    let protected = Router::new()
        .route("/upload/presign", post(handlers::presign_upload))
        .route(
            "/cards",
            post(handlers::create_card).get(handlers::list_cards),
        )
        .route(
            "/cards/:id",
            get(handlers::get_card)
                .patch(handlers::update_card)
                .delete(handlers::delete_card),
        )
        .route("/cards/:id/revalue", post(handlers::revalue))
        .route("/cards/:id/snapshots", get(handlers::list_snapshots))
        .route("/executions/:id", get(handlers::get_execution))
        .route("/analytics/sets", get(handlers::analytics_sets))
        .route_layer(axum_mw::from_fn_with_state(jwt, auth_middleware))
        .with_state(state.clone());

    let public = Router::new()
        .route("/healthz", get(handlers::health))
        .with_state(state);

    Router::new()
        .merge(public)
        .merge(protected)
        .layer(CorsLayer::permissive())
        .layer(axum_mw::from_fn(request_logging))
        .layer(axum_mw::from_fn(request_context))
}
