//! Generic inbound-HTTP adapter.
//!
//! Some door controllers push events to a local HTTP endpoint rather
//! than exposing one to poll. The control API's `/adapters/{name}/push`
//! route hands parsed bodies to [`WebhookAdapter::sender`]; `run` just
//! drains that channel into the shared adapter event stream. An
//! optional shared secret lets the push endpoint reject forged posts
//! before they ever reach here.
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tokio::sync::{mpsc, watch};

use crate::model::RawHardwareEvent;

use super::push::PushSource;
use super::sink::EventSink;
use super::{Adapter, AdapterConfig, AdapterError};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Deserialize)]
struct WebhookEventBody {
    external_user_id: Option<String>,
    event_kind: String,
    #[serde(default)]
    device_timestamp: Option<chrono::DateTime<Utc>>,
    #[serde(default)]
    is_simulated: bool,
}

#[derive(Debug, Deserialize)]
struct WebhookSettings {
    shared_secret: Option<String>,
    #[serde(default = "default_channel_capacity")]
    channel_capacity: usize,
}

fn default_channel_capacity() -> usize {
    256
}

pub struct WebhookAdapter {
    name: String,
    shared_secret: Option<String>,
    source: PushSource,
}

impl WebhookAdapter {
    pub fn from_config(config: &AdapterConfig) -> Result<Self, AdapterError> {
        let settings: WebhookSettings =
            serde_json::from_value(serde_json::Value::Object(config.settings.clone())).map_err(
                |e| AdapterError::InvalidConfig {
                    name: config.name.clone(),
                    reason: e.to_string(),
                },
            )?;

        Ok(Self {
            name: config.name.clone(),
            shared_secret: settings.shared_secret,
            source: PushSource::new(settings.channel_capacity),
        })
    }

    /// Clone of the sender the control API's push endpoint feeds.
    pub fn sender(&self) -> mpsc::Sender<RawHardwareEvent> {
        self.source.sender()
    }

    /// Verify a push request's `X-Webhook-Signature` header (HMAC-SHA256
    /// hex digest over the raw body), if a shared secret is configured.
    /// Adapters with no configured secret accept any sender — the
    /// operator opted out of verification.
    pub fn verify_signature(&self, body: &[u8], signature_hex: &str) -> bool {
        let Some(secret) = &self.shared_secret else {
            return true;
        };

        let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
            return false;
        };
        mac.update(body);
        let expected = mac.finalize().into_bytes();

        let Ok(provided) = hex::decode(signature_hex) else {
            return false;
        };

        expected.as_slice().ct_eq(&provided).unwrap_u8() == 1
    }
}

#[async_trait]
impl Adapter for WebhookAdapter {
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

    async fn push(&self, body: &[u8], signature: Option<&str>) -> Result<usize, AdapterError> {
        if !self.verify_signature(body, signature.unwrap_or("")) {
            return Err(AdapterError::PushRejected(
                self.name.clone(),
                "signature verification failed".to_string(),
            ));
        }

        let parsed: WebhookEventBody = serde_json::from_slice(body).map_err(|e| {
            AdapterError::PushRejected(self.name.clone(), format!("invalid event body: {e}"))
        })?;

        let event = RawHardwareEvent {
            adapter_name: self.name.clone(),
            external_user_id: parsed.external_user_id,
            device_timestamp: parsed.device_timestamp.unwrap_or_else(Utc::now),
            event_kind: parsed.event_kind,
            is_simulated: parsed.is_simulated,
            raw_payload: body.to_vec(),
        };

        self.source
            .sender()
            .send(event)
            .await
            .map_err(|_| AdapterError::PushRejected(self.name.clone(), "adapter stopped".to_string()))?;

        Ok(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn config(settings: serde_json::Value) -> AdapterConfig {
        AdapterConfig {
            kind: "webhook".to_string(),
            name: "front-door-webhook".to_string(),
            settings: settings.as_object().cloned().unwrap_or_default(),
        }
    }

    fn sample_event() -> RawHardwareEvent {
        RawHardwareEvent {
            adapter_name: "front-door-webhook".to_string(),
            external_user_id: Some("member-1".to_string()),
            device_timestamp: Utc::now(),
            event_kind: "entry".to_string(),
            is_simulated: false,
            raw_payload: b"{}".to_vec(),
        }
    }

    #[tokio::test]
    async fn pushed_events_are_forwarded() {
        let adapter = WebhookAdapter::from_config(&config(serde_json::json!({}))).unwrap();
        let sender = adapter.sender();

        let (sink, source) = super::sink::channel(8);
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let handle = tokio::spawn(async move { adapter.run(sink, cancel_rx).await });

        sender.send(sample_event()).await.unwrap();
        let received = source.recv().await;
        assert_eq!(received.external_user_id.as_deref(), Some("member-1"));

        cancel_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[test]
    fn verify_signature_accepts_any_sender_without_secret() {
        let adapter = WebhookAdapter::from_config(&config(serde_json::json!({}))).unwrap();
        assert!(adapter.verify_signature(b"body", "not-a-real-signature"));
    }

    #[test]
    fn verify_signature_checks_hmac_with_secret() {
        let adapter = WebhookAdapter::from_config(&config(serde_json::json!({
            "shared_secret": "topsecret",
        })))
        .unwrap();

        let mut mac = HmacSha256::new_from_slice(b"topsecret").unwrap();
        mac.update(b"body");
        let signature = hex::encode(mac.finalize().into_bytes());

        assert!(adapter.verify_signature(b"body", &signature));
        assert!(!adapter.verify_signature(b"tampered", &signature));
    }

    #[tokio::test]
    async fn push_rejects_bad_signature_and_accepts_good_one() {
        let adapter = WebhookAdapter::from_config(&config(serde_json::json!({
            "shared_secret": "topsecret",
        })))
        .unwrap();

        let body = br#"{"external_user_id":"member-1","event_kind":"entry"}"#;
        let rejected = adapter.push(body, Some("not-a-real-signature")).await;
        assert!(matches!(rejected, Err(AdapterError::PushRejected(_, _))));

        let mut mac = HmacSha256::new_from_slice(b"topsecret").unwrap();
        mac.update(body);
        let signature = hex::encode(mac.finalize().into_bytes());

        let accepted = adapter.push(body, Some(&signature)).await.unwrap();
        assert_eq!(accepted, 1);
    }

    #[tokio::test]
    async fn running_twice_fails() {
        let adapter = std::sync::Arc::new(
            WebhookAdapter::from_config(&config(serde_json::json!({}))).unwrap(),
        );
        let (sink1, _source1) = super::sink::channel(8);
        let (cancel_tx, cancel_rx1) = watch::channel(false);

        let first = {
            let adapter = adapter.clone();
            tokio::spawn(async move { adapter.run(sink1, cancel_rx1).await })
        };
        tokio::task::yield_now().await;

        let (sink2, _source2) = super::sink::channel(8);
        let (_cancel_tx2, cancel_rx2) = watch::channel(false);
        let result = adapter.run(sink2, cancel_rx2).await;
        assert!(matches!(result, Err(AdapterError::StartFailed { .. })));

        cancel_tx.send(true).unwrap();
        first.await.unwrap().unwrap();
    }
}
