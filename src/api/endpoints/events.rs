//! `GET /events` — paginated, filtered read of the event history.

use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::api::error::ApiError;
use crate::api::types::ApiContext;
use crate::model::EventKind;
use crate::queue::EventFilter;

fn default_limit() -> usize {
    100
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    #[serde(rename = "type")]
    pub event_kind: Option<String>,
    pub user: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

pub async fn list_events(
    State(ctx): State<ApiContext>,
    Query(query): Query<EventsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let event_kind = match query.event_kind {
        Some(raw) => Some(
            EventKind::parse(&raw)
                .ok_or_else(|| ApiError::BadRequest(format!("unrecognized event type '{raw}'")))?,
        ),
        None => None,
    };

    let filter = EventFilter {
        start: query.start,
        end: query.end,
        event_kind,
        external_user_id: query.user,
        limit: query.limit.min(1000).max(1),
        offset: query.offset,
    };

    let events = ctx.queue.query_events(&filter)?;
    Ok(Json(events))
}
