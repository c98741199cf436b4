//! Periodic signed heartbeat to the cloud: proves the device is alive
//! even when the event queue is empty, and carries the health snapshot
//! so the dashboard doesn't need to poll separately.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

use crate::auth::Auth;
use crate::health::{Health, HealthSnapshot};

#[derive(Debug, Serialize)]
struct HeartbeatPayload {
    status: String,
    tier: String,
    queue_depth: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_event_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_info: Option<SystemInfo>,
}

#[derive(Debug, Serialize)]
struct SystemInfo {
    cpu_usage_percent: f64,
    memory_usage_percent: f64,
}

impl HeartbeatPayload {
    fn from_snapshot(s: &HealthSnapshot, system_info: Option<SystemInfo>) -> Self {
        Self {
            status: format!("{:?}", s.level).to_lowercase(),
            tier: s.tier.to_string(),
            queue_depth: s.queue.pending,
            last_event_time: s.queue.last_sent_at,
            system_info,
        }
    }
}

pub struct Heartbeat {
    health: Arc<Health>,
    auth: Arc<Auth>,
    http: reqwest::Client,
    server_url: String,
    interval: Duration,
}

impl Heartbeat {
    pub fn new(health: Arc<Health>, auth: Arc<Auth>, server_url: String, interval: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .expect("reqwest client builds with default TLS backend");

        Self {
            health,
            auth,
            http,
            server_url,
            interval,
        }
    }

    pub async fn run(&self, mut cancel: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        return;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.send_once().await {
                        tracing::warn!(error = %e, "heartbeat failed");
                    }
                }
            }
        }
    }

    async fn send_once(&self) -> Result<(), String> {
        if !self.auth.is_authenticated() {
            return Ok(());
        }

        let snapshot = self.health.snapshot().await;
        let resources = self.health.resource_usage();
        let system_info = Some(SystemInfo {
            cpu_usage_percent: resources.cpu * 100.0,
            memory_usage_percent: resources.memory * 100.0,
        });
        let payload = HeartbeatPayload::from_snapshot(&snapshot, system_info);
        let body = serde_json::to_vec(&payload).map_err(|e| e.to_string())?;
        let signed = self.auth.sign(&body).map_err(|e| e.to_string())?;

        self.http
            .post(format!("{}/api/v1/devices/heartbeat", self.server_url))
            .header("X-Device-Id", &signed.device_id)
            .header("X-Timestamp", signed.timestamp.to_string())
            .header("X-Signature", &signed.signature)
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        Ok(())
    }
}
