//! Generic RFID reader adapter.
//!
//! Targets serial-to-Ethernet RFID bridges that speak a simple
//! line protocol: `TAG,<card_id>,<entry|exit>`. Maintains a persistent
//! TCP connection and reconnects with backoff on drop.

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tokio::sync::watch;

use crate::model::RawHardwareEvent;

use super::sink::EventSink;
use super::tcp_line;
use super::{Adapter, AdapterConfig, AdapterError};

#[derive(Debug, Deserialize)]
struct RfidSettings {
    addr: String,
    #[serde(default = "default_device_id")]
    device_id: String,
}

fn default_device_id() -> String {
    "rfid-reader".to_string()
}

pub struct RfidAdapter {
    name: String,
    settings: RfidSettings,
}

impl RfidAdapter {
    pub fn from_config(config: &AdapterConfig) -> Result<Self, AdapterError> {
        let settings: RfidSettings =
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
        let mut parts = line.trim().splitn(3, ',');
        let tag = parts.next()?;
        if tag != "TAG" {
            return None;
        }
        let card_id = parts.next()?;
        let kind = parts.next()?;

        Some(RawHardwareEvent {
            adapter_name: self.name.clone(),
            external_user_id: Some(card_id.to_string()),
            device_timestamp: Utc::now(),
            event_kind: kind.to_string(),
            is_simulated: false,
            raw_payload: line.as_bytes().to_vec(),
        })
    }
}

#[async_trait]
impl Adapter for RfidAdapter {
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

    fn adapter() -> RfidAdapter {
        RfidAdapter::from_config(&AdapterConfig {
            kind: "rfid".to_string(),
            name: "front-door-rfid".to_string(),
            settings: serde_json::json!({"addr": "127.0.0.1:9999"})
                .as_object()
                .cloned()
                .unwrap(),
        })
        .unwrap()
    }

    #[test]
    fn parses_well_formed_tag_line() {
        let adapter = adapter();
        let event = adapter.parse_line("TAG,card-42,entry").unwrap();
        assert_eq!(event.external_user_id.as_deref(), Some("card-42"));
        assert_eq!(event.event_kind, "entry");
        assert!(!event.is_simulated);
    }

    #[test]
    fn ignores_lines_with_wrong_prefix() {
        let adapter = adapter();
        assert!(adapter.parse_line("HEARTBEAT").is_none());
    }

    #[test]
    fn ignores_malformed_lines() {
        let adapter = adapter();
        assert!(adapter.parse_line("TAG,card-42").is_none());
    }
}
