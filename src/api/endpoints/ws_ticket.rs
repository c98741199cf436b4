//! `POST /ws/ticket` — issue a one-time ticket for the streaming
//! endpoint, so the WebSocket upgrade itself doesn't need to carry an
//! API key or HMAC headers.

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;

use crate::api::error::ApiError;
use crate::api::types::ApiContext;

#[derive(Debug, Serialize)]
pub struct TicketResponse {
    pub ticket: String,
    pub expires_in_secs: u64,
}

pub async fn issue_ticket(State(ctx): State<ApiContext>) -> Result<impl IntoResponse, ApiError> {
    let ticket = ctx
        .ws_tickets
        .lock()
        .map_err(|_| ApiError::Internal("ticket store lock poisoned".into()))?
        .issue();

    Ok(Json(TicketResponse {
        ticket,
        expires_in_secs: 30,
    }))
}
