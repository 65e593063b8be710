//! Request-id middleware and Problem-Details finalization.
//!
//! Installs a request id on the way in, echoes it as `X-Request-Id` on the
//! way out, and rewrites error responses (marked by an [`AppError`]
//! extension) into complete Problem-Details bodies carrying the id and the
//! request path.

use crate::error::{AppError, ProblemDetails};
use axum::{
    extract::Request,
    http::HeaderValue,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use uuid::Uuid;

/// Request id visible to handlers via `Extension<RequestId>`.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

pub async fn request_context(mut req: Request, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();
    let path = req.uri().path().to_string();
    req.extensions_mut().insert(RequestId(request_id.clone()));

    let resp = next.run(req).await;

    let mut resp = match resp.extensions().get::<AppError>().cloned() {
        Some(err) => {
            let body = ProblemDetails::from_error(&err, &path, &request_id);
            (err.status(), Json(body)).into_response()
        }
        None => resp,
    };

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        resp.headers_mut().insert("X-Request-Id", value);
    }
    resp
}
