//! `GET /status` and `GET /metrics` — operator-facing introspection.
//!
//! `/status` gives a structured snapshot for tooling; `/metrics` gives
//! the same numbers in Prometheus exposition format for anything that
//! already scrapes the gym's other infrastructure.

use std::fmt::Write as _;

use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use crate::api::types::ApiContext;
use crate::processor::ProcessorStats;

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub paired: bool,
    pub device_id: Option<String>,
    pub health: crate::health::HealthSnapshot,
    pub processor: ProcessorStats,
}

pub async fn status(State(ctx): State<ApiContext>) -> impl IntoResponse {
    let response = StatusResponse {
        paired: ctx.auth.is_authenticated(),
        device_id: ctx.auth.device_id(),
        health: ctx.health.snapshot().await,
        processor: ctx.processor.stats().await,
    };
    Json(response)
}

pub async fn metrics(State(ctx): State<ApiContext>) -> impl IntoResponse {
    let snapshot = ctx.health.snapshot().await;
    let stats = ctx.processor.stats().await;

    let mut body = String::new();
    let _ = writeln!(body, "# HELP bridge_queue_pending Events waiting to be submitted.");
    let _ = writeln!(body, "# TYPE bridge_queue_pending gauge");
    let _ = writeln!(body, "bridge_queue_pending {}", snapshot.queue.pending);

    let _ = writeln!(body, "# HELP bridge_queue_parked Events parked after exceeding the retry ceiling.");
    let _ = writeln!(body, "# TYPE bridge_queue_parked gauge");
    let _ = writeln!(body, "bridge_queue_parked {}", snapshot.queue.parked);

    let _ = writeln!(body, "# HELP bridge_events_processed_total Events accepted by the processor.");
    let _ = writeln!(body, "# TYPE bridge_events_processed_total counter");
    let _ = writeln!(body, "bridge_events_processed_total {}", stats.total_processed);

    let _ = writeln!(body, "# HELP bridge_events_duplicate_total Events rejected as duplicates.");
    let _ = writeln!(body, "# TYPE bridge_events_duplicate_total counter");
    let _ = writeln!(body, "bridge_events_duplicate_total {}", stats.total_duplicates);

    let _ = writeln!(body, "# HELP bridge_events_invalid_total Events rejected as malformed.");
    let _ = writeln!(body, "# TYPE bridge_events_invalid_total counter");
    let _ = writeln!(body, "bridge_events_invalid_total {}", stats.total_invalid);

    let _ = writeln!(body, "# HELP bridge_paired Whether the device is paired with the cloud control plane.");
    let _ = writeln!(body, "# TYPE bridge_paired gauge");
    let _ = writeln!(body, "bridge_paired {}", if snapshot.paired { 1 } else { 0 });

    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}
