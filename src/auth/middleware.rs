//! Authentication middleware: validates the bearer token and installs the
//! verified [`Subject`] into request extensions. The subject is never read
//! from request bodies.

use crate::auth::jwt::JwtHandler;
use crate::error::AppError;
use crate::models::Subject;
use async_trait::async_trait;
use axum::{
    extract::{FromRequestParts, Request, State},
    http::request::Parts,
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

pub async fn auth_middleware(
    State(jwt): State<Arc<JwtHandler>>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = req
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .ok_or(AppError::AuthenticationRequired)?;

    let subject = jwt
        .validate_token(token)
        .map_err(|_| AppError::AuthenticationRequired)?;

    req.extensions_mut().insert(subject);
    Ok(next.run(req).await)
}

/// Extractor for the verified subject installed by [`auth_middleware`].
#[async_trait]
impl<S> FromRequestParts<S> for Subject
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Subject>()
            .cloned()
            .ok_or(AppError::AuthenticationRequired)
    }
}
