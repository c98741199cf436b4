//! Direct door commands: unlock, lock, and a capability-aware status
//! check. All three act on `adapter` if given, else `config.primary_adapter`.

use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::api::error::ApiError;
use crate::api::types::ApiContext;

async fn resolve_adapter(ctx: &ApiContext, requested: Option<String>) -> Result<String, ApiError> {
    if let Some(name) = requested {
        return Ok(name);
    }
    ctx.config
        .read()
        .await
        .primary_adapter
        .clone()
        .ok_or_else(|| {
            ApiError::BadRequest("no adapter specified and no primary_adapter configured".into())
        })
}

#[derive(Debug, Deserialize)]
pub struct AdapterQuery {
    pub adapter: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UnlockRequest {
    pub adapter: Option<String>,
    pub duration_ms: Option<u64>,
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DoorStatusResponse {
    pub adapter: String,
    pub capabilities: crate::adapter::AdapterCapabilities,
    pub status: Option<crate::model::AdapterStatus>,
}

pub async fn unlock(
    State(ctx): State<ApiContext>,
    Json(request): Json<UnlockRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let adapter = resolve_adapter(&ctx, request.adapter).await?;
    let duration_ms = request
        .duration_ms
        .unwrap_or(ctx.config.read().await.unlock_duration_ms);

    ctx.registry.unlock(&adapter, duration_ms).await?;
    tracing::info!(
        adapter = %adapter,
        duration_ms,
        reason = request.reason.as_deref().unwrap_or(""),
        "door unlock requested via control API"
    );
    Ok(axum::http::StatusCode::NO_CONTENT)
}

/// "Lock" is just an immediate relock — an unlock pulse of zero duration.
pub async fn lock(
    State(ctx): State<ApiContext>,
    Json(request): Json<AdapterQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let adapter = resolve_adapter(&ctx, request.adapter).await?;
    ctx.registry.unlock(&adapter, 0).await?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

pub async fn door_status(
    State(ctx): State<ApiContext>,
    Query(query): Query<AdapterQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let adapter = resolve_adapter(&ctx, query.adapter).await?;
    let capabilities = ctx
        .registry
        .capabilities(&adapter)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("adapter '{adapter}'")))?;
    let status = ctx.registry.status(&adapter).await;

    Ok(Json(DoorStatusResponse {
        adapter,
        capabilities,
        status,
    }))
}
