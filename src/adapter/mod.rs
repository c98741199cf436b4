//! Hardware adapters — one per door-controller protocol.
//!
//! An adapter's only job is to turn whatever a physical device speaks
//! (webhook POSTs, a vendor TCP protocol, a serial line, a scripted
//! test file) into [`RawHardwareEvent`]s on a channel. Adapters never
//! touch the queue, dedup, or the cloud directly — that's the
//! processor's and submitter's job.

pub mod essl;
pub mod fingerprint;
pub mod push;
pub mod registry;
pub mod realtime;
pub mod rfid;
pub mod simulator;
pub mod sink;
pub mod tcp_line;
pub mod webhook;
pub mod zkteco;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;

pub use sink::{EventSink, EventSource};

#[derive(Error, Debug)]
pub enum AdapterError {
    #[error("adapter '{0}' is not registered")]
    Unknown(String),

    #[error("adapter '{name}' failed to start: {reason}")]
    StartFailed { name: String, reason: String },

    #[error("adapter '{name}' configuration is invalid: {reason}")]
    InvalidConfig { name: String, reason: String },

    #[error("adapter '{0}' does not support unlock commands")]
    UnlockUnsupported(String),

    #[error("adapter '{0}' does not accept pushed events")]
    PushUnsupported(String),

    #[error("adapter '{0}' rejected a pushed event: {1}")]
    PushRejected(String, String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Capability handshake for the command side of an adapter: not every
/// piece of hardware can be told to unlock a door remotely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct AdapterCapabilities {
    pub remote_unlock: bool,
}

/// A running hardware integration.
///
/// `run` owns the adapter's event loop: it should push every observed
/// event onto `events` and return only when `cancel` fires or it hits
/// an unrecoverable error. The registry restarts adapters that return
/// `Err` with backoff; returning `Ok(())` is treated as a clean,
/// permanent stop.
#[async_trait]
pub trait Adapter: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            remote_unlock: false,
        }
    }

    async fn run(
        &self,
        events: EventSink,
        cancel: watch::Receiver<bool>,
    ) -> Result<(), AdapterError>;

    /// Issue a remote unlock. Default implementation rejects — only
    /// adapters whose hardware actually supports it should override.
    async fn unlock(&self, _duration_ms: u64) -> Result<(), AdapterError> {
        Err(AdapterError::UnlockUnsupported(self.name().to_string()))
    }

    /// Accept an out-of-band pushed event body (the control API's
    /// `/adapters/{name}/push` route), for adapters whose hardware POSTs
    /// to us rather than being polled. `signature` carries whatever
    /// per-request signature header the caller supplied, if any.
    /// Returns the number of events accepted from the body.
    async fn push(&self, _body: &[u8], _signature: Option<&str>) -> Result<usize, AdapterError> {
        Err(AdapterError::PushUnsupported(self.name().to_string()))
    }
}

/// Per-instance adapter configuration as loaded from `Config`.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct AdapterConfig {
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub settings: serde_json::Map<String, serde_json::Value>,
}

/// Build a boxed adapter instance from its config. A closed table —
/// no dynamic loading — so an unknown `kind` is a config error caught
/// at startup, never at runtime.
pub fn build(config: &AdapterConfig) -> Result<Box<dyn Adapter>, AdapterError> {
    match config.kind.as_str() {
        "simulator" => simulator::SimulatorAdapter::from_config(config).map(|a| Box::new(a) as _),
        "webhook" => webhook::WebhookAdapter::from_config(config).map(|a| Box::new(a) as _),
        "rfid" => rfid::RfidAdapter::from_config(config).map(|a| Box::new(a) as _),
        "fingerprint" => {
            fingerprint::FingerprintAdapter::from_config(config).map(|a| Box::new(a) as _)
        }
        "zkteco" => zkteco::ZktecoAdapter::from_config(config).map(|a| Box::new(a) as _),
        "essl" => essl::EsslAdapter::from_config(config).map(|a| Box::new(a) as _),
        "realtime" => realtime::RealtimeAdapter::from_config(config).map(|a| Box::new(a) as _),
        other => Err(AdapterError::InvalidConfig {
            name: config.name.clone(),
            reason: format!("unknown adapter kind '{other}'"),
        }),
    }
}
