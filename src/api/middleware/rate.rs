//! Per-client sliding-window rate limiting.
//!
//! Runs outermost so an unauthenticated flood is rejected before it ever
//! reaches signature verification.

use axum::http::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::api::error::ApiError;
use crate::api::types::ApiContext;

fn rate_key(req: &Request<axum::body::Body>) -> String {
    if let Some(key) = req
        .headers()
        .get("X-Api-Key")
        .and_then(|v| v.to_str().ok())
    {
        let prefix: String = key.chars().take(12).collect();
        return format!("key:{prefix}");
    }
    req.headers()
        .get("X-Device-Id")
        .and_then(|v| v.to_str().ok())
        .map(|id| format!("device:{id}"))
        .unwrap_or_else(|| "anonymous".to_string())
}

pub async fn limit(req: Request<axum::body::Body>, next: Next) -> Response {
    match limit_inner(req, next).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn limit_inner(req: Request<axum::body::Body>, next: Next) -> Result<Response, ApiError> {
    let ctx: ApiContext = req
        .extensions()
        .get::<ApiContext>()
        .cloned()
        .ok_or(ApiError::Internal("missing API context".into()))?;

    let key = rate_key(&req);

    {
        let mut limiter = ctx
            .rate_limiter
            .lock()
            .map_err(|_| ApiError::Internal("rate limiter lock".into()))?;

        limiter
            .check(&key)
            .map_err(|retry_after| ApiError::RateLimited { retry_after })?;
    }

    Ok(next.run(req).await)
}
