//! Typed error kinds and their HTTP Problem-Details mapping.
//!
//! Every operation either returns its typed success value or fails with one
//! of these kinds; handlers surface them as `application/problem+json`
//! bodies carrying the request id.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum AppError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("authentication required")]
    AuthenticationRequired,
    #[error("not permitted")]
    AuthorizationDenied,
    #[error("{0} not found")]
    NotFound(String),
    #[error("payload exceeds the configured upload limit")]
    PayloadTooLarge,
    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("operation already in progress")]
    InProgress,
    #[error("rate limited")]
    RateLimited,
    #[error("transient provider failure: {0}")]
    ProviderTransient(String),
    #[error("permanent provider failure: {0}")]
    ProviderPermanent(String),
    #[error("data layer failure: {0}")]
    DataLayer(String),
    #[error("timed out: {0}")]
    Timeout(String),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::AuthenticationRequired => StatusCode::UNAUTHORIZED,
            AppError::AuthorizationDenied => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            AppError::Conflict(_) | AppError::InProgress => StatusCode::CONFLICT,
            AppError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            AppError::ProviderTransient(_)
            | AppError::ProviderPermanent(_)
            | AppError::DataLayer(_) => StatusCode::BAD_GATEWAY,
            AppError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Stable problem-type slug used in the `type` field.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "validation",
            AppError::AuthenticationRequired => "authentication-required",
            AppError::AuthorizationDenied => "authorization-denied",
            AppError::NotFound(_) => "not-found",
            AppError::PayloadTooLarge => "payload-too-large",
            AppError::UnsupportedMediaType(_) => "unsupported-media-type",
            AppError::Conflict(_) => "conflict",
            AppError::InProgress => "conflict/in-progress",
            AppError::RateLimited => "rate-limited",
            AppError::ProviderTransient(_) => "provider-transient",
            AppError::ProviderPermanent(_) => "provider-permanent",
            AppError::DataLayer(_) => "data-layer",
            AppError::Timeout(_) => "timeout",
        }
    }

    /// Whether a retry with backoff is worthwhile.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AppError::ProviderTransient(_) | AppError::RateLimited | AppError::Timeout(_)
        )
    }

    /// Collapses a retry-exhausted transient failure into its permanent form.
    pub fn into_permanent(self) -> Self {
        match self {
            AppError::ProviderTransient(msg) => AppError::ProviderPermanent(msg),
            AppError::Timeout(msg) => AppError::ProviderPermanent(format!("timeout: {msg}")),
            AppError::RateLimited => AppError::ProviderPermanent("rate limited".to_string()),
            other => other,
        }
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(e: rusqlite::Error) -> Self {
        AppError::DataLayer(e.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::DataLayer(format!("serialization: {e}"))
    }
}

/// RFC-9457 style error body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub problem_type: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    pub instance: String,
    pub request_id: String,
}

impl ProblemDetails {
    pub fn from_error(err: &AppError, instance: &str, request_id: &str) -> Self {
        Self {
            problem_type: format!("https://collectiq.dev/problems/{}", err.kind()),
            title: err
                .status()
                .canonical_reason()
                .unwrap_or("Error")
                .to_string(),
            status: err.status().as_u16(),
            detail: err.to_string(),
            instance: instance.to_string(),
            request_id: request_id.to_string(),
        }
    }
}

/// Minimal response carrying the error in an extension; the problem-details
/// middleware rewrites it with the request id and instance path.
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ProblemDetails::from_error(&self, "", "");
        let mut resp = (status, Json(body)).into_response();
        resp.extensions_mut().insert(self);
        resp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(
            AppError::Validation("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::NotFound("card".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(AppError::InProgress.status(), StatusCode::CONFLICT);
        assert_eq!(AppError::PayloadTooLarge.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(
            AppError::UnsupportedMediaType("text/plain".into()).status(),
            StatusCode::UNSUPPORTED_MEDIA_TYPE
        );
    }

    #[test]
    fn transient_collapse() {
        let err = AppError::ProviderTransient("503".into());
        assert!(err.is_transient());
        assert!(matches!(
            err.into_permanent(),
            AppError::ProviderPermanent(_)
        ));

        let err = AppError::Validation("bad".into());
        assert!(!err.is_transient());
    }

    #[test]
    fn in_progress_kind_is_scoped() {
        assert_eq!(AppError::InProgress.kind(), "conflict/in-progress");
    }
}
