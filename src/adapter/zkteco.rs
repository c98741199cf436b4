//! ZKTeco ADMS push-protocol adapter.
//!
//! ZKTeco terminals configured for "cloud" mode POST attendance
//! records to `iclock/cdata` as tab-separated lines:
//! `<pin>\t<time>\t<status>\t<verify_mode>\t...`. `status` 0/4 map to
//! entry, 1/5 to exit; anything else is treated as denied.

use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use serde::Deserialize;
use tokio::sync::watch;

use crate::model::RawHardwareEvent;

use super::push::PushSource;
use super::sink::EventSink;
use super::{Adapter, AdapterConfig, AdapterError};

#[derive(Debug, Deserialize)]
struct ZktecoSettings {
    #[serde(default = "default_channel_capacity")]
    channel_capacity: usize,
}

fn default_channel_capacity() -> usize {
    256
}

pub struct ZktecoAdapter {
    name: String,
    source: PushSource,
}

impl ZktecoAdapter {
    pub fn from_config(config: &AdapterConfig) -> Result<Self, AdapterError> {
        let settings: ZktecoSettings =
            serde_json::from_value(serde_json::Value::Object(config.settings.clone())).map_err(
                |e| AdapterError::InvalidConfig {
                    name: config.name.clone(),
                    reason: e.to_string(),
                },
            )?;

        Ok(Self {
            name: config.name.clone(),
            source: PushSource::new(settings.channel_capacity),
        })
    }

    /// Parse one ADMS `cdata` body (one record per line) and push each
    /// parsed record onto the adapter's channel. Called by the control
    /// API's ADMS endpoint handler.
    pub async fn ingest(&self, body: &str) -> usize {
        let sender = self.source.sender();
        let mut accepted = 0;
        for line in body.lines() {
            if let Some(event) = parse_record(&self.name, line) {
                if sender.send(event).await.is_ok() {
                    accepted += 1;
                }
            }
        }
        accepted
    }
}

fn parse_record(adapter_name: &str, line: &str) -> Option<RawHardwareEvent> {
    let mut fields = line.trim().split('\t');
    let pin = fields.next()?;
    let time_raw = fields.next()?;
    let status: u8 = fields.next()?.parse().ok()?;

    let device_timestamp = NaiveDateTime::parse_from_str(time_raw, "%Y-%m-%d %H:%M:%S")
        .map(|naive| naive.and_utc())
        .unwrap_or_else(|_| Utc::now());

    let event_kind = match status {
        0 | 4 => "entry",
        1 | 5 => "exit",
        _ => "denied",
    };

    Some(RawHardwareEvent {
        adapter_name: adapter_name.to_string(),
        external_user_id: Some(pin.to_string()),
        device_timestamp,
        event_kind: event_kind.to_string(),
        is_simulated: false,
        raw_payload: line.as_bytes().to_vec(),
    })
}

#[async_trait]
impl Adapter for ZktecoAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(
        &self,
        events: EventSink,
        cancel: watch::Receiver<bool>,
    ) -> Result<(), AdapterError> {
        self.source.drain(&self.name, events, cancel).await
    }

    async fn push(&self, body: &[u8], _signature: Option<&str>) -> Result<usize, AdapterError> {
        let text = std::str::from_utf8(body).map_err(|e| {
            AdapterError::PushRejected(self.name.clone(), format!("body is not UTF-8: {e}"))
        })?;
        Ok(self.ingest(text).await)
    }
}
