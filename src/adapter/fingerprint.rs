//! Generic fingerprint terminal adapter.
//!
//! Targets terminals that speak a pipe-delimited line protocol over a
//! persistent TCP connection: `<user_id>|<entry|exit|denied>|<unix_ms>`.
//! Distinct vendor protocols (ZKTeco, eSSL) get their own adapters;
//! this one covers terminals a site-specific integrator already
//! normalized to this shape upstream.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::watch;

use crate::model::RawHardwareEvent;

use super::sink::EventSink;
use super::tcp_line;
use super::{Adapter, AdapterConfig, AdapterError};

#[derive(Debug, Deserialize)]
struct FingerprintSettings {
    addr: String,
}

pub struct FingerprintAdapter {
    name: String,
    settings: FingerprintSettings,
}

impl FingerprintAdapter {
    pub fn from_config(config: &AdapterConfig) -> Result<Self, AdapterError> {
        let settings: FingerprintSettings =
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
        let mut parts = line.trim().split('|');
        let user_id = parts.next()?;
        let kind = parts.next()?;
        let timestamp_ms: i64 = parts.next()?.parse().ok()?;

        let device_timestamp = DateTime::from_timestamp_millis(timestamp_ms).unwrap_or_else(Utc::now);

        Some(RawHardwareEvent {
            adapter_name: self.name.clone(),
            external_user_id: Some(user_id.to_string()),
            device_timestamp,
            event_kind: kind.to_string(),
            is_simulated: false,
            raw_payload: line.as_bytes().to_vec(),
        })
    }
}

#[async_trait]
impl Adapter for FingerprintAdapter {
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
