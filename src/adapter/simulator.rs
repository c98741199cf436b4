//! Synthetic event source for demos and integration tests.
//!
//! Either generates a repeating cycle of entry/exit events on a fixed
//! interval, or — when `scripted_file` is set — replays a newline-
//! delimited JSON event script, one [`RawHardwareEvent`] per line, at
//! the cadence recorded in each line's `delay_ms` field. The latter is
//! how integration tests drive deterministic event sequences.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;

use crate::model::RawHardwareEvent;

use super::sink::EventSink;
use super::{Adapter, AdapterConfig, AdapterError};

#[derive(Debug, Deserialize)]
struct SimulatorSettings {
    #[serde(default = "default_interval_ms")]
    interval_ms: u64,
    #[serde(default)]
    scripted_file: Option<PathBuf>,
    #[serde(default = "default_user_ids")]
    user_ids: Vec<String>,
    #[serde(default = "default_device_id")]
    device_id: String,
}

fn default_interval_ms() -> u64 {
    5_000
}

fn default_user_ids() -> Vec<String> {
    vec!["member-001".to_string(), "member-002".to_string()]
}

fn default_device_id() -> String {
    "simulated-door".to_string()
}

#[derive(Debug, Deserialize)]
struct ScriptedLine {
    delay_ms: u64,
    external_user_id: Option<String>,
    event_kind: String,
}

pub struct SimulatorAdapter {
    name: String,
    settings: SimulatorSettings,
}

impl SimulatorAdapter {
    pub fn from_config(config: &AdapterConfig) -> Result<Self, AdapterError> {
        let settings: SimulatorSettings =
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
}

#[async_trait]
impl Adapter for SimulatorAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(
        &self,
        events: EventSink,
        cancel: watch::Receiver<bool>,
    ) -> Result<(), AdapterError> {
        match &self.settings.scripted_file {
            Some(path) => self.run_scripted(path, events, cancel).await,
            None => self.run_generated(events, cancel).await,
        }
    }
}

impl SimulatorAdapter {
    async fn run_generated(
        &self,
        events: EventSink,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<(), AdapterError> {
        let mut interval = tokio::time::interval(Duration::from_millis(self.settings.interval_ms));
        let mut index = 0usize;
        let kinds = ["entry", "exit"];

        loop {
            tokio::select! {
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        return Ok(());
                    }
                }
                _ = interval.tick() => {
                    let user_id = &self.settings.user_ids[index % self.settings.user_ids.len()];
                    let kind = kinds[index % kinds.len()];
                    index += 1;

                    let event = RawHardwareEvent {
                        adapter_name: self.name.clone(),
                        external_user_id: Some(user_id.clone()),
                        device_timestamp: Utc::now(),
                        event_kind: kind.to_string(),
                        is_simulated: true,
                        raw_payload: format!("{{\"device_id\":\"{}\"}}", self.settings.device_id)
                            .into_bytes(),
                    };

                    events.push(event).await;
                }
            }
        }
    }

    async fn run_scripted(
        &self,
        path: &PathBuf,
        events: EventSink,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<(), AdapterError> {
        let file = tokio::fs::File::open(path).await?;
        let mut lines = BufReader::new(file).lines();

        loop {
            let next = tokio::select! {
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        return Ok(());
                    }
                    continue;
                }
                line = lines.next_line() => line?,
            };

            let Some(raw_line) = next else {
                return Ok(());
            };
            if raw_line.trim().is_empty() {
                continue;
            }

            let scripted: ScriptedLine =
                serde_json::from_str(&raw_line).map_err(|e| AdapterError::StartFailed {
                    name: self.name.clone(),
                    reason: format!("malformed scripted event line: {e}"),
                })?;

            tokio::time::sleep(Duration::from_millis(scripted.delay_ms)).await;

            let event = RawHardwareEvent {
                adapter_name: self.name.clone(),
                external_user_id: scripted.external_user_id,
                device_timestamp: Utc::now(),
                event_kind: scripted.event_kind,
                is_simulated: true,
                raw_payload: raw_line.into_bytes(),
            };

            events.push(event).await;
        }
    }
}
