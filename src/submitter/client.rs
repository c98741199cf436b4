//! Thin HTTP wrapper around the cloud ingestion endpoint. All outbound
//! calls carry the HMAC signature headers `Auth::sign` produces.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::auth::Auth;
use crate::model::StandardEvent;

use super::SubmitterError;

#[derive(Debug, Serialize)]
struct SubmitBatchRequest<'a> {
    events: &'a [StandardEvent],
}

#[derive(Debug, Deserialize)]
pub struct SubmitBatchResponse {
    /// event_ids the cloud has durably recorded this call. The cloud
    /// acks per event, not per batch, so a partial batch can fail while
    /// the rest are durably stored — only these ids are safe to mark
    /// sent.
    pub accepted_event_ids: Vec<String>,
}

/// Body of a `401 key_rotated` response: the cloud signals that the
/// device's key has been rotated server-side and hands back the new one.
#[derive(Debug, Deserialize)]
pub struct KeyRotatedResponse {
    pub reason: String,
    pub new_key: Option<String>,
}

pub struct CloudClient {
    http: reqwest::Client,
    server_url: String,
    auth: Arc<Auth>,
}

impl CloudClient {
    pub fn new(server_url: String, auth: Arc<Auth>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("reqwest client builds with default TLS backend");

        Self {
            http,
            server_url,
            auth,
        }
    }

    pub async fn submit_batch(
        &self,
        events: &[StandardEvent],
    ) -> Result<SubmitBatchResponse, SubmitterError> {
        let body = serde_json::to_vec(&SubmitBatchRequest { events })
            .map_err(|e| SubmitterError::Cloud(e.to_string()))?;
        let signed = self.auth.sign(&body)?;

        let response = self
            .http
            .post(format!("{}/api/v1/events", self.server_url))
            .header("X-Device-Id", &signed.device_id)
            .header("X-Timestamp", signed.timestamp.to_string())
            .header("X-Signature", &signed.signature)
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| SubmitterError::Network(e.to_string()))?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED
            || response.status() == reqwest::StatusCode::FORBIDDEN
        {
            let rotated_key = response
                .json::<KeyRotatedResponse>()
                .await
                .ok()
                .and_then(|r| r.new_key)
                .and_then(|k| hex::decode(k).ok());
            return Err(SubmitterError::Unauthorized { rotated_key });
        }

        if !response.status().is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(SubmitterError::Cloud(text));
        }

        response
            .json()
            .await
            .map_err(|e| SubmitterError::Cloud(e.to_string()))
    }

    /// Lightweight reachability probe, used before declaring the cloud
    /// link down in health reporting.
    pub async fn probe_connectivity(&self) -> bool {
        self.http
            .get(format!("{}/api/v1/ping", self.server_url))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    /// Fetch remote config overrides the cloud wants applied to this
    /// device (`GET /api/v1/devices/config`).
    pub async fn fetch_device_config(&self) -> Result<HashMap<String, JsonValue>, SubmitterError> {
        let signed = self.auth.sign(b"")?;

        let response = self
            .http
            .get(format!("{}/api/v1/devices/config", self.server_url))
            .header("X-Device-Id", &signed.device_id)
            .header("X-Timestamp", signed.timestamp.to_string())
            .header("X-Signature", &signed.signature)
            .send()
            .await
            .map_err(|e| SubmitterError::Network(e.to_string()))?;

        if !response.status().is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(SubmitterError::Cloud(text));
        }

        response
            .json()
            .await
            .map_err(|e| SubmitterError::Cloud(e.to_string()))
    }
}
