//! Real-time event streaming over WebSocket.
//!
//! Handles the WebSocket upgrade, heartbeat (30s), session max (1h),
//! and per-connection rate limiting (10 incoming messages/sec) for
//! clients watching the door-event firehose live.
//!
//! Connection lifecycle:
//! 1. Client calls `POST /api/v1/ws/ticket` to get a one-time ticket
//! 2. Client opens `GET /ws/stream?ticket=xxx` — ticket validated, WS upgraded
//! 3. Server sends Welcome, then streams every accepted event as it happens
//! 4. Heartbeat every 30s — 3 missed = disconnect
//! 5. Session max 1h — warning at 59 min, close at 60 min

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

use crate::api::error::ApiError;
use crate::api::types::ApiContext;
use crate::model::StandardEvent;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const SESSION_MAX: Duration = Duration::from_secs(3600);
const EXPIRY_WARNING: Duration = Duration::from_secs(60);
const MAX_MISSED_HEARTBEATS: u32 = 3;
const MAX_INCOMING_PER_SECOND: u32 = 10;

#[derive(Deserialize)]
pub struct WsAuthQuery {
    ticket: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WsOutgoing {
    Welcome { session_id: String },
    Event(StandardEvent),
    Heartbeat { server_time: String },
    SessionExpiring { seconds_remaining: u32 },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WsIncoming {
    Pong {},
    Ready {},
}

#[derive(Debug, PartialEq)]
enum HeartbeatAction {
    SendHeartbeat,
    SendExpiryWarning { seconds_remaining: u32 },
    SessionExpired,
    HeartbeatTimeout,
}

/// Testable WebSocket session state, decoupled from the live socket so
/// the heartbeat and session-timeout logic can be unit tested directly.
struct WsSessionState {
    session_start: Instant,
    missed_heartbeats: u32,
    expiry_warned: bool,
    incoming_times: VecDeque<Instant>,
}

impl WsSessionState {
    fn new() -> Self {
        Self {
            session_start: Instant::now(),
            missed_heartbeats: 0,
            expiry_warned: false,
            incoming_times: VecDeque::new(),
        }
    }

    #[cfg(test)]
    fn with_start(start: Instant) -> Self {
        Self {
            session_start: start,
            missed_heartbeats: 0,
            expiry_warned: false,
            incoming_times: VecDeque::new(),
        }
    }

    fn on_pong(&mut self) {
        self.missed_heartbeats = 0;
    }

    fn on_heartbeat_tick(&mut self) -> HeartbeatAction {
        let elapsed = self.session_start.elapsed();

        if elapsed >= SESSION_MAX {
            return HeartbeatAction::SessionExpired;
        }

        if !self.expiry_warned && elapsed >= SESSION_MAX - EXPIRY_WARNING {
            let remaining = (SESSION_MAX - elapsed).as_secs() as u32;
            self.expiry_warned = true;
            return HeartbeatAction::SendExpiryWarning {
                seconds_remaining: remaining,
            };
        }

        if self.missed_heartbeats >= MAX_MISSED_HEARTBEATS {
            return HeartbeatAction::HeartbeatTimeout;
        }

        self.missed_heartbeats += 1;
        HeartbeatAction::SendHeartbeat
    }

    fn check_rate(&mut self) -> bool {
        check_incoming_rate(&mut self.incoming_times)
    }
}

/// WebSocket upgrade handler. Validates the one-time ticket obtained
/// from `POST /api/v1/ws/ticket` before upgrading the connection.
pub async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(ctx): State<ApiContext>,
    Query(query): Query<WsAuthQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let valid = ctx
        .ws_tickets
        .lock()
        .map_err(|_| ApiError::Internal("ticket lock poisoned".into()))?
        .consume(&query.ticket);

    if !valid {
        return Err(ApiError::Unauthorized);
    }

    let events = ctx.processor.subscribe();
    Ok(ws.on_upgrade(move |socket| handle_ws(socket, events)))
}

async fn handle_ws(socket: WebSocket, mut events: broadcast::Receiver<StandardEvent>) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<WsOutgoing>(64);

    let sender_handle = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(j) => j,
                Err(_) => continue,
            };
            if ws_sink.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
        let _ = ws_sink.close().await;
    });

    let session_id = uuid::Uuid::new_v4().to_string();
    let _ = tx.send(WsOutgoing::Welcome { session_id }).await;

    let mut session = WsSessionState::new();
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Ok(event) => {
                        if tx.send(WsOutgoing::Event(event)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "WebSocket client lagged, dropped events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            incoming = ws_stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(ref text))) => {
                        if !session.check_rate() {
                            continue;
                        }
                        if let Ok(parsed) = serde_json::from_str::<WsIncoming>(text) {
                            match parsed {
                                WsIncoming::Pong {} => session.on_pong(),
                                WsIncoming::Ready {} => {}
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
            _ = heartbeat.tick() => {
                match session.on_heartbeat_tick() {
                    HeartbeatAction::SessionExpired => {
                        let _ = tx.send(WsOutgoing::SessionExpiring { seconds_remaining: 0 }).await;
                        break;
                    }
                    HeartbeatAction::SendExpiryWarning { seconds_remaining } => {
                        let _ = tx.send(WsOutgoing::SessionExpiring { seconds_remaining }).await;
                    }
                    HeartbeatAction::HeartbeatTimeout => {
                        tracing::info!("{MAX_MISSED_HEARTBEATS} missed heartbeats, disconnecting WS client");
                        break;
                    }
                    HeartbeatAction::SendHeartbeat => {
                        let _ = tx.send(WsOutgoing::Heartbeat {
                            server_time: chrono::Utc::now().to_rfc3339(),
                        }).await;
                    }
                }
            }
        }
    }

    drop(tx);
    let _ = sender_handle.await;
    tracing::info!("WebSocket client disconnected");
}

fn check_incoming_rate(timestamps: &mut VecDeque<Instant>) -> bool {
    let now = Instant::now();
    let one_sec_ago = now - Duration::from_secs(1);

    while let Some(&front) = timestamps.front() {
        if front < one_sec_ago {
            timestamps.pop_front();
        } else {
            break;
        }
    }

    if timestamps.len() as u32 >= MAX_INCOMING_PER_SECOND {
        return false;
    }

    timestamps.push_back(now);
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_session_sends_heartbeat() {
        let mut session = WsSessionState::new();
        assert_eq!(session.on_heartbeat_tick(), HeartbeatAction::SendHeartbeat);
    }

    #[test]
    fn missed_heartbeats_trigger_timeout() {
        let mut session = WsSessionState::new();
        for _ in 0..MAX_MISSED_HEARTBEATS {
            session.on_heartbeat_tick();
        }
        assert_eq!(session.on_heartbeat_tick(), HeartbeatAction::HeartbeatTimeout);
    }

    #[test]
    fn pong_resets_missed_heartbeats() {
        let mut session = WsSessionState::new();
        session.on_heartbeat_tick();
        session.on_heartbeat_tick();
        session.on_pong();
        assert_eq!(session.on_heartbeat_tick(), HeartbeatAction::SendHeartbeat);
    }

    #[test]
    fn session_near_expiry_warns_once() {
        let start = Instant::now() - (SESSION_MAX - EXPIRY_WARNING + Duration::from_secs(1));
        let mut session = WsSessionState::with_start(start);
        assert!(matches!(
            session.on_heartbeat_tick(),
            HeartbeatAction::SendExpiryWarning { .. }
        ));
    }

    #[test]
    fn session_past_max_expires() {
        let start = Instant::now() - (SESSION_MAX + Duration::from_secs(1));
        let mut session = WsSessionState::with_start(start);
        assert_eq!(session.on_heartbeat_tick(), HeartbeatAction::SessionExpired);
    }

    #[test]
    fn rate_limit_blocks_after_ceiling() {
        let mut timestamps = VecDeque::new();
        for _ in 0..MAX_INCOMING_PER_SECOND {
            assert!(check_incoming_rate(&mut timestamps));
        }
        assert!(!check_incoming_rate(&mut timestamps));
    }
}
