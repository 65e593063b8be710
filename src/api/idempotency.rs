//! Storage-backed idempotency for mutating POSTs.
//!
//! A caller-supplied `Idempotency-Key` binds `(subject, key)` to the first
//! outcome: completed tokens replay the stored status and body verbatim,
//! in-progress tokens conflict, and non-2xx outcomes release the key so the
//! caller may retry with it.

use crate::error::AppError;
use crate::models::Subject;
use crate::storage::{Store, TokenBegin};
use axum::{
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use std::future::Future;
use tracing::warn;

pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

fn json_response(status: StatusCode, body: String) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response()
}

/// Wraps a mutating handler with the token protocol. The handler returns
/// the response status and its rendered JSON body; the body is stored
/// byte-for-byte so replays are identical.
pub async fn with_idempotency<F, Fut>(
    store: &Store,
    subject: &Subject,
    headers: &HeaderMap,
    operation: &str,
    ttl_seconds: i64,
    handler: F,
) -> Response
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<(StatusCode, String), AppError>>,
{
    let key = match headers
        .get(IDEMPOTENCY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        Some(k) => k.to_string(),
        None => {
            return AppError::Validation(format!("{IDEMPOTENCY_HEADER} header required"))
                .into_response()
        }
    };

    match store.try_begin_token(subject, &key, operation, ttl_seconds) {
        Ok(TokenBegin::Completed { status, body }) => {
            json_response(StatusCode::from_u16(status).unwrap_or(StatusCode::OK), body)
        }
        Ok(TokenBegin::InProgress) => AppError::InProgress.into_response(),
        Ok(TokenBegin::Created) => match handler().await {
            Ok((status, body)) => {
                if status.is_success() {
                    if let Err(e) =
                        store.complete_token(subject, &key, operation, status.as_u16(), &body)
                    {
                        warn!(error = %e, "failed to persist idempotency result");
                    }
                } else {
                    let _ = store.delete_token(subject, &key);
                }
                json_response(status, body)
            }
            Err(err) => {
                let _ = store.delete_token(subject, &key);
                err.into_response()
            }
        },
        Err(err) => err.into_response(),
    }
}
