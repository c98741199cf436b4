//! Drains the queue to the cloud: batches pending events, submits
//! them, retries with jittered backoff, and parks events that have
//! exhausted their retry ceiling for operator review.

pub mod client;

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::sync::watch;

use crate::auth::{Auth, AuthError};
use crate::queue::{Queue, QueueError};

pub use client::CloudClient;

#[derive(Error, Debug)]
pub enum SubmitterError {
    #[error("network error: {0}")]
    Network(String),

    #[error("cloud rejected the batch: {0}")]
    Cloud(String),

    #[error("device credentials were rejected by the cloud")]
    Unauthorized { rotated_key: Option<Vec<u8>> },

    #[error("auth error: {0}")]
    Auth(#[from] AuthError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

const MAX_BACKOFF: Duration = Duration::from_secs(60);
/// How long submission stays paused after a 401/403 with no rotated key
/// before trying again, pending operator intervention.
const AUTH_PAUSE: Duration = Duration::from_secs(60);

pub struct Submitter {
    queue: Arc<Queue>,
    client: CloudClient,
    auth: Arc<Auth>,
    batch_size: usize,
    retry_ceiling: u32,
    poll_interval: Duration,
}

impl Submitter {
    pub fn new(
        queue: Arc<Queue>,
        client: CloudClient,
        auth: Arc<Auth>,
        batch_size: usize,
        retry_ceiling: u32,
        poll_interval: Duration,
    ) -> Self {
        Self {
            queue,
            client,
            auth,
            batch_size,
            retry_ceiling,
            poll_interval,
        }
    }

    /// Increment an item's retry count and park it once it has exceeded
    /// the retry ceiling.
    fn record_retry(&self, queue_row_id: i64, retry_count: u32, event_id: &str) {
        if let Err(e) = self.queue.mark_failed(queue_row_id) {
            tracing::error!(error = %e, "failed to record retry");
            return;
        }
        if retry_count + 1 >= self.retry_ceiling {
            tracing::warn!(
                event_id = %event_id,
                retry_count = retry_count + 1,
                "retry ceiling reached, parking event"
            );
            if let Err(e) = self.queue.park(queue_row_id) {
                tracing::error!(error = %e, "failed to park event");
            }
        }
    }

    /// Runs until `cancel` fires. Intended to be spawned as its own
    /// task by `Lifecycle`.
    pub async fn run(&self, mut cancel: watch::Receiver<bool>) {
        let mut backoff = Duration::from_secs(1);

        loop {
            if *cancel.borrow() {
                return;
            }

            let pending = match self.queue.get_pending(self.batch_size) {
                Ok(p) => p,
                Err(e) => {
                    tracing::error!(error = %e, "failed to read pending events from queue");
                    if sleep_or_cancel(backoff, &mut cancel).await {
                        return;
                    }
                    continue;
                }
            };

            if pending.is_empty() {
                if sleep_or_cancel(self.poll_interval, &mut cancel).await {
                    return;
                }
                continue;
            }

            let events: Vec<_> = pending.iter().map(|q| q.event.clone()).collect();

            match self.client.submit_batch(&events).await {
                Ok(response) => {
                    let acked: std::collections::HashSet<&str> = response
                        .accepted_event_ids
                        .iter()
                        .map(String::as_str)
                        .collect();

                    let sent_ids: Vec<i64> = pending
                        .iter()
                        .filter(|q| acked.contains(q.event.event_id.as_str()))
                        .map(|q| q.queue_row_id)
                        .collect();
                    if let Err(e) = self.queue.mark_sent(&sent_ids) {
                        tracing::error!(error = %e, "failed to mark batch as sent");
                    }

                    let unacked: Vec<_> = pending
                        .iter()
                        .filter(|q| !acked.contains(q.event.event_id.as_str()))
                        .collect();
                    if !unacked.is_empty() {
                        tracing::warn!(
                            acked = sent_ids.len(),
                            unacked = unacked.len(),
                            "batch partially acknowledged, retrying unacked events"
                        );
                        for item in unacked {
                            self.record_retry(item.queue_row_id, item.retry_count, &item.event.event_id);
                        }
                    }

                    backoff = Duration::from_secs(1);
                }
                Err(SubmitterError::Unauthorized { rotated_key: Some(new_key) }) => {
                    tracing::warn!("cloud rotated device key, rotating credentials and resuming");
                    if let Err(e) = self.auth.rotate(new_key) {
                        tracing::error!(error = %e, "failed to adopt rotated device key");
                    }
                    backoff = Duration::from_secs(1);
                }
                Err(SubmitterError::Unauthorized { rotated_key: None }) => {
                    tracing::error!("cloud rejected device credentials, pausing submission");
                    if sleep_or_cancel(AUTH_PAUSE, &mut cancel).await {
                        return;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, batch_size = pending.len(), "submission failed");

                    for item in &pending {
                        self.record_retry(item.queue_row_id, item.retry_count, &item.event.event_id);
                    }

                    if sleep_or_cancel(jittered(backoff), &mut cancel).await {
                        return;
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }
}

fn jittered(base: Duration) -> Duration {
    let jitter_ms = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 4 + 1);
    base + Duration::from_millis(jitter_ms)
}

async fn sleep_or_cancel(duration: Duration, cancel: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = cancel.changed() => *cancel.borrow(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Auth, FileVault};
    use crate::crypto::EncryptionKey;
    use crate::queue::Queue;

    #[test]
    fn jittered_backoff_never_shrinks_base() {
        for _ in 0..20 {
            let base = Duration::from_secs(4);
            assert!(jittered(base) >= base);
        }
    }

    fn test_submitter(dir: &std::path::Path, retry_ceiling: u32) -> Submitter {
        let queue = Arc::new(Queue::open_in_memory(100).unwrap());
        let key = EncryptionKey::from_bytes([9u8; 32]);
        let auth = Arc::new(Auth::new(Box::new(FileVault::new(dir.join("vault.enc"), key))));
        let client = CloudClient::new("https://cloud.example.test".to_string(), auth.clone());
        Submitter::new(queue, client, auth, 10, retry_ceiling, Duration::from_secs(1))
    }

    #[test]
    fn record_retry_parks_event_past_ceiling() {
        let dir = tempfile::tempdir().unwrap();
        let submitter = test_submitter(dir.path(), 2);
        let event = crate::model::StandardEvent {
            event_id: "evt-1".to_string(),
            external_user_id: "member-1".to_string(),
            internal_user_id: None,
            device_id: "front-door".to_string(),
            timestamp: chrono::Utc::now(),
            event_kind: crate::model::EventKind::Entry,
            is_simulated: false,
            raw_payload: b"raw".to_vec(),
        };
        let id = submitter.queue.enqueue(&event).unwrap();

        submitter.record_retry(id, 0, "evt-1");
        assert_eq!(submitter.queue.count_parked().unwrap(), 0);

        submitter.record_retry(id, 1, "evt-1");
        assert_eq!(submitter.queue.count_parked().unwrap(), 1);
    }
}
