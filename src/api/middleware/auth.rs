//! Control API authentication: an operator-scoped `X-Api-Key`, or an
//! HMAC signature using the same scheme the device uses to talk to the
//! cloud (for cloud-originated control calls).
//!
//! The request body has to be buffered to verify the HMAC signature, so
//! this layer reads it fully, verifies, and hands a fresh body of the
//! same bytes to the handler.

use axum::body::{to_bytes, Body};
use axum::http::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use subtle::ConstantTimeEq;

use crate::api::error::ApiError;
use crate::api::types::{ApiContext, ClientIdentity};

/// Caps the buffered body size for signature verification — the control
/// API never needs a request body larger than this.
const MAX_BODY_BYTES: usize = 1024 * 1024;

pub async fn require_auth(req: Request<Body>, next: Next) -> Response {
    match require_auth_inner(req, next).await {
        Ok(resp) => resp,
        Err(err) => err.into_response(),
    }
}

async fn require_auth_inner(req: Request<Body>, next: Next) -> Result<Response, ApiError> {
    let ctx: ApiContext = req
        .extensions()
        .get::<ApiContext>()
        .cloned()
        .ok_or(ApiError::Internal("missing API context".into()))?;

    let (mut parts, body) = req.into_parts();
    let bytes = to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| ApiError::BadRequest(format!("body too large or unreadable: {e}")))?;

    let identity = if let Some(key) = parts
        .headers
        .get("X-Api-Key")
        .and_then(|v| v.to_str().ok())
    {
        let configured = ctx.config.read().await.control_api_key.clone();
        match configured {
            Some(expected) if key.as_bytes().ct_eq(expected.as_bytes()).unwrap_u8() == 1 => {
                "api-key".to_string()
            }
            _ => return Err(ApiError::Unauthorized),
        }
    } else {
        let device_id = header_str(&parts, "X-Device-Id").ok_or(ApiError::Unauthorized)?;
        let timestamp: i64 = header_str(&parts, "X-Timestamp")
            .and_then(|v| v.parse().ok())
            .ok_or(ApiError::Unauthorized)?;
        let signature = header_str(&parts, "X-Signature").ok_or(ApiError::Unauthorized)?;

        ctx.auth
            .validate(&device_id, timestamp, &signature, &bytes)
            .map_err(|_| ApiError::Unauthorized)?;
        device_id
    };

    parts.extensions.insert(ClientIdentity(identity));
    let req = Request::from_parts(parts, Body::from(bytes));

    Ok(next.run(req).await)
}

fn header_str(parts: &axum::http::request::Parts, name: &str) -> Option<String> {
    parts
        .headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}
