//! Shared plumbing for push-style adapters (webhook, ZKTeco ADMS,
//! eSSL): the control API hands them raw bytes as they arrive, this
//! channel carries already-parsed events through to `run`.

use std::sync::Mutex;

use tokio::sync::{mpsc, watch};

use crate::model::RawHardwareEvent;

use super::sink::EventSink;
use super::AdapterError;

pub struct PushSource {
    tx: mpsc::Sender<RawHardwareEvent>,
    rx: Mutex<Option<mpsc::Receiver<RawHardwareEvent>>>,
}

impl PushSource {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    pub fn sender(&self) -> mpsc::Sender<RawHardwareEvent> {
        self.tx.clone()
    }

    /// Drains pushed events into `events` until `cancel` fires. Can only
    /// be called once per adapter instance — the receiver is moved out
    /// on first call.
    pub async fn drain(
        &self,
        adapter_name: &str,
        events: EventSink,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<(), AdapterError> {
        let mut inbound = self
            .rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| AdapterError::StartFailed {
                name: adapter_name.to_string(),
                reason: "adapter already running".to_string(),
            })?;

        loop {
            tokio::select! {
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        return Ok(());
                    }
                }
                received = inbound.recv() => {
                    match received {
                        Some(event) => events.push(event).await,
                        None => return Ok(()),
                    }
                }
            }
        }
    }
}
