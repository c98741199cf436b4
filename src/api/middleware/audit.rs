//! Audit logging: every authenticated request is logged with the
//! resolved client identity, method, path, and response status. Runs
//! innermost so it can see what the auth layer injected.

use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;

use crate::api::types::ClientIdentity;

pub async fn log_access(req: Request<axum::body::Body>, next: Next) -> Response {
    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let identity = req
        .extensions()
        .get::<ClientIdentity>()
        .map(|c| c.0.clone())
        .unwrap_or_else(|| "unknown".to_string());

    let response = next.run(req).await;

    tracing::info!(
        client = %identity,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        "control API request"
    );

    response
}
