//! `GET /health` — the one unauthenticated route, so a load balancer or
//! a systemd watchdog can check liveness without a key.

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;

use crate::api::types::ApiContext;

pub async fn health(State(ctx): State<ApiContext>) -> impl IntoResponse {
    Json(ctx.health.snapshot().await)
}
