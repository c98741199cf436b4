//! Realtime streaming adapter.
//!
//! For controllers that proactively push a continuous JSON-lines feed
//! over a long-lived TCP socket rather than waiting to be polled.
//! One JSON object per line, already shaped close to
//! [`RawHardwareEvent`] — this adapter is mostly a framing and
//! reconnect layer.

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tokio::sync::watch;

use crate::model::RawHardwareEvent;

use super::sink::EventSink;
use super::tcp_line;
use super::{Adapter, AdapterConfig, AdapterError};

#[derive(Debug, Deserialize)]
struct RealtimeSettings {
    addr: String,
}

#[derive(Debug, Deserialize)]
struct RealtimeMessage {
    external_user_id: Option<String>,
    event_kind: String,
}

pub struct RealtimeAdapter {
    name: String,
    settings: RealtimeSettings,
}

impl RealtimeAdapter {
    pub fn from_config(config: &AdapterConfig) -> Result<Self, AdapterError> {
        let settings: RealtimeSettings =
            serde_json::from_value(serde_json::Value::Object(config.settings.clone())).map_err(
                |e| AdapterError::InvalidConfig {
                    name: config.name.clone(),
                    reason: e.to_string(),
                },
            )?;

        Ok(Self {
            name: config.name.clone(),
            settings,
        })
    }

    fn parse_line(&self, line: &str) -> Option<RawHardwareEvent> {
        let message: RealtimeMessage = serde_json::from_str(line).ok()?;
        Some(RawHardwareEvent {
            adapter_name: self.name.clone(),
            external_user_id: message.external_user_id,
            device_timestamp: Utc::now(),
            event_kind: message.event_kind,
            is_simulated: false,
            raw_payload: line.as_bytes().to_vec(),
        })
    }
}

#[async_trait]
impl Adapter for RealtimeAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(
        &self,
        events: EventSink,
        cancel: watch::Receiver<bool>,
    ) -> Result<(), AdapterError> {
        tcp_line::run_reconnecting(&self.name, &self.settings.addr, events, cancel, |line| {
            self.parse_line(line)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> RealtimeAdapter {
        RealtimeAdapter::from_config(&AdapterConfig {
            kind: "realtime".to_string(),
            name: "back-gate-realtime".to_string(),
            settings: serde_json::json!({"addr": "127.0.0.1:9999"})
                .as_object()
                .cloned()
                .unwrap(),
        })
        .unwrap()
    }

    #[test]
    fn parses_json_line() {
        let adapter = adapter();
        let event = adapter
            .parse_line(r#"{"external_user_id":"member-9","event_kind":"exit"}"#)
            .unwrap();
        assert_eq!(event.external_user_id.as_deref(), Some("member-9"));
        assert_eq!(event.event_kind, "exit");
    }

    #[test]
    fn rejects_invalid_json() {
        let adapter = adapter();
        assert!(adapter.parse_line("not json").is_none());
    }
}
