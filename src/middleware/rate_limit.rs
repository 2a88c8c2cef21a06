//! Request rate limiting applied ahead of the query pipeline.
//!
//! The per-user window needs the caller identity, which for query requests
//! lives in the JSON body; the middleware buffers the body, peeks at
//! `context.user_id`, and reconstructs the request before passing it on.
//! Rejections return 429 with a `retry_after` hint immediately.

use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;

use crate::services::RateLimiter;

const MAX_BODY_BYTES: usize = 1024 * 1024;

#[derive(Clone)]
pub struct RateLimitState {
    pub limiter: Arc<RateLimiter>,
}

pub async fn rate_limit_middleware(
    State(state): State<RateLimitState>,
    request: Request,
    next: Next,
) -> Response {
    let (parts, body) = request.into_parts();

    let bytes = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return (StatusCode::PAYLOAD_TOO_LARGE, "request body too large").into_response();
        }
    };

    let user_id = serde_json::from_slice::<serde_json::Value>(&bytes)
        .ok()
        .and_then(|value| {
            value
                .get("context")
                .and_then(|context| context.get("user_id"))
                .and_then(|user_id| user_id.as_str())
                .map(String::from)
        });

    let result = state.limiter.check_and_record(user_id.as_deref());
    if !result.allowed {
        tracing::warn!(
            "Rate limit rejection for {}: {}",
            user_id.as_deref().unwrap_or("anonymous"),
            result.message
        );
        let body = json!({
            "status": "error",
            "error": result.message,
            "retry_after": result.retry_after_secs,
        });
        return (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
    }

    let request = Request::from_parts(parts, Body::from(bytes));
    next.run(request).await
}
