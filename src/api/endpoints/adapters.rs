//! Adapter inventory and lifecycle: list/inspect registered adapters,
//! enable/disable them, and hand pushed bodies to whichever one the
//! hardware is POSTing to.

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::Json;

use crate::api::error::ApiError;
use crate::api::types::ApiContext;

pub async fn list_adapters(State(ctx): State<ApiContext>) -> impl IntoResponse {
    Json(ctx.registry.list().await)
}

pub async fn get_adapter(
    State(ctx): State<ApiContext>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let status = ctx
        .registry
        .status(&name)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("adapter '{name}'")))?;
    Ok(Json(status))
}

pub async fn enable_adapter(
    State(ctx): State<ApiContext>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    ctx.registry.enable(&name).await?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

pub async fn disable_adapter(
    State(ctx): State<ApiContext>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    ctx.registry.disable(&name).await?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

/// Hand a raw pushed body to `name`. The signature header convention is
/// adapter-specific (each push-style adapter defines its own), so this
/// just forwards whatever `X-Signature` arrived, if any.
pub async fn push_event(
    State(ctx): State<ApiContext>,
    Path(name): Path<String>,
    headers: axum::http::HeaderMap,
    body: axum::body::Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let signature = headers
        .get("X-Signature")
        .and_then(|v| v.to_str().ok());

    let accepted = ctx.registry.push(&name, &body, signature).await?;
    Ok(Json(serde_json::json!({ "accepted": accepted })))
}
