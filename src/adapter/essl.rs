//! eSSL push-protocol adapter.
//!
//! eSSL terminals in "server push" mode POST comma-separated records:
//! `<employee_code>,<punch_time>,<punch_state>`, where `punch_state` is
//! the literal string `IN`, `OUT`, or `DENIED`.

use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use serde::Deserialize;
use tokio::sync::watch;

use crate::model::RawHardwareEvent;

use super::push::PushSource;
use super::sink::EventSink;
use super::{Adapter, AdapterConfig, AdapterError};

#[derive(Debug, Deserialize)]
struct EsslSettings {
    #[serde(default = "default_channel_capacity")]
    channel_capacity: usize,
}

fn default_channel_capacity() -> usize {
    256
}

pub struct EsslAdapter {
    name: String,
    source: PushSource,
}

impl EsslAdapter {
    pub fn from_config(config: &AdapterConfig) -> Result<Self, AdapterError> {
        let settings: EsslSettings =
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
    let mut fields = line.trim().split(',');
    let employee_code = fields.next()?;
    let time_raw = fields.next()?;
    let punch_state = fields.next()?;

    let device_timestamp = NaiveDateTime::parse_from_str(time_raw, "%Y-%m-%d %H:%M:%S")
        .map(|naive| naive.and_utc())
        .unwrap_or_else(|_| Utc::now());

    let event_kind = match punch_state.to_ascii_uppercase().as_str() {
        "IN" => "entry",
        "OUT" => "exit",
        _ => "denied",
    };

    Some(RawHardwareEvent {
        adapter_name: adapter_name.to_string(),
        external_user_id: Some(employee_code.to_string()),
        device_timestamp,
        event_kind: event_kind.to_string(),
        is_simulated: false,
        raw_payload: line.as_bytes().to_vec(),
    })
}

#[async_trait]
impl Adapter for EsslAdapter {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_in_as_entry() {
        let event = parse_record("essl", "E100,2024-01-15 08:30:00,IN").unwrap();
        assert_eq!(event.event_kind, "entry");
        assert_eq!(event.external_user_id.as_deref(), Some("E100"));
    }

    #[test]
    fn parses_out_as_exit() {
        let event = parse_record("essl", "E100,2024-01-15 18:30:00,OUT").unwrap();
        assert_eq!(event.event_kind, "exit");
    }

    #[test]
    fn unrecognized_punch_state_is_denied() {
        let event = parse_record("essl", "E100,2024-01-15 18:30:00,LOCKOUT").unwrap();
        assert_eq!(event.event_kind, "denied");
    }

    #[tokio::test]
    async fn ingest_accepts_multiple_records() {
        let adapter = std::sync::Arc::new(
            EsslAdapter::from_config(&AdapterConfig {
                kind: "essl".to_string(),
                name: "warehouse-essl".to_string(),
                settings: Default::default(),
            })
            .unwrap(),
        );
        let (sink, source) = super::sink::channel(8);
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let handle = tokio::spawn({
            let adapter = adapter.clone();
            async move { adapter.run(sink, cancel_rx).await }
        });

        let accepted = adapter
            .ingest("E100,2024-01-15 08:30:00,IN\nE101,2024-01-15 08:31:00,OUT")
            .await;
        assert_eq!(accepted, 2);
        source.recv().await;
        source.recv().await;

        cancel_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }
}
