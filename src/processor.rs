//! Normalizes adapter output into [`StandardEvent`]s, de-duplicates
//! repeat swipes, resolves external user IDs to internal ones, and
//! hands the result to the queue.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};

use crate::model::{EventKind, ExternalUserMapping, RawHardwareEvent, StandardEvent};
use crate::queue::{Queue, QueueError};

/// Events within this many seconds of each other for the same device
/// and external user collapse to a single dedup fingerprint — covers a
/// card reader firing twice for one tap.
const FINGERPRINT_BUCKET_SECS: i64 = 5;

/// A `device_timestamp` further than this from wall-clock time is
/// treated as bad reader data, not a real event.
const MAX_CLOCK_SKEW: chrono::Duration = chrono::Duration::hours(24);

#[derive(Error, Debug)]
pub enum ProcessorError {
    #[error("event has no external_user_id and cannot be processed")]
    MissingExternalUserId,

    #[error("event_kind '{0}' is not recognized")]
    UnrecognizedEventKind(String),

    #[error("device_timestamp is too far from wall-clock time")]
    TimestampOutOfRange,

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Outcome of a single `process` call, distinguishing the three ways a
/// raw event can resolve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Accepted { event_id: String },
    Duplicate { event_id: String },
}

#[derive(Debug, Clone, Default)]
pub struct ProcessorStats {
    pub total_processed: u64,
    pub total_duplicates: u64,
    pub total_invalid: u64,
    pub last_processed_at: Option<DateTime<Utc>>,
}

/// Resolves external_user_id → internal_user_id. Held separately from
/// the queue so the processor can be tested without a live mapping
/// table.
pub trait UserMappingSource: Send + Sync {
    fn resolve(&self, external_user_id: &str) -> Option<ExternalUserMapping>;
}

struct AtomicStats {
    total_processed: AtomicU64,
    total_duplicates: AtomicU64,
    total_invalid: AtomicU64,
    last_processed_at: RwLock<Option<DateTime<Utc>>>,
}

impl Default for AtomicStats {
    fn default() -> Self {
        Self {
            total_processed: AtomicU64::new(0),
            total_duplicates: AtomicU64::new(0),
            total_invalid: AtomicU64::new(0),
            last_processed_at: RwLock::new(None),
        }
    }
}

pub struct Processor {
    queue: Arc<Queue>,
    user_mappings: Option<Arc<dyn UserMappingSource>>,
    stats: AtomicStats,
    live_events: broadcast::Sender<StandardEvent>,
    dedup_window_secs: i64,
}

impl Processor {
    pub fn new(
        queue: Arc<Queue>,
        user_mappings: Option<Arc<dyn UserMappingSource>>,
        dedup_window_secs: u64,
    ) -> Self {
        let (live_events, _) = broadcast::channel(256);
        Self {
            queue,
            user_mappings,
            stats: AtomicStats::default(),
            live_events,
            dedup_window_secs: dedup_window_secs as i64,
        }
    }

    /// Subscribes to accepted events as they're processed, for the
    /// control API's real-time streaming endpoint. Lagging subscribers
    /// miss events rather than block the processor.
    pub fn subscribe(&self) -> broadcast::Receiver<StandardEvent> {
        self.live_events.subscribe()
    }

    pub async fn stats(&self) -> ProcessorStats {
        ProcessorStats {
            total_processed: self.stats.total_processed.load(Ordering::Relaxed),
            total_duplicates: self.stats.total_duplicates.load(Ordering::Relaxed),
            total_invalid: self.stats.total_invalid.load(Ordering::Relaxed),
            last_processed_at: *self.stats.last_processed_at.read().await,
        }
    }

    /// Validate, fingerprint, dedup, resolve, and enqueue one raw
    /// event. Invalid events are counted and dropped silently — a
    /// malformed reader shouldn't be able to wedge the pipeline.
    pub async fn process(&self, raw: RawHardwareEvent) -> Result<ProcessOutcome, ProcessorError> {
        let external_user_id = match raw.external_user_id {
            Some(id) if !id.is_empty() => id,
            _ => {
                self.stats.total_invalid.fetch_add(1, Ordering::Relaxed);
                return Err(ProcessorError::MissingExternalUserId);
            }
        };

        let event_kind = match EventKind::parse(&raw.event_kind) {
            Some(kind) => kind,
            None => {
                self.stats.total_invalid.fetch_add(1, Ordering::Relaxed);
                return Err(ProcessorError::UnrecognizedEventKind(raw.event_kind));
            }
        };

        if (Utc::now() - raw.device_timestamp).abs() > MAX_CLOCK_SKEW {
            self.stats.total_invalid.fetch_add(1, Ordering::Relaxed);
            return Err(ProcessorError::TimestampOutOfRange);
        }

        let event_id = fingerprint(
            &raw.adapter_name,
            &external_user_id,
            event_kind,
            raw.device_timestamp,
        );

        if self.queue.has_similar(&event_id)? {
            self.stats.total_duplicates.fetch_add(1, Ordering::Relaxed);
            return Ok(ProcessOutcome::Duplicate { event_id });
        }

        if self.queue.has_similar_in_window(
            &external_user_id,
            event_kind,
            raw.device_timestamp,
            self.dedup_window_secs,
        )? {
            self.stats.total_duplicates.fetch_add(1, Ordering::Relaxed);
            return Ok(ProcessOutcome::Duplicate { event_id });
        }

        let internal_user_id = self
            .user_mappings
            .as_ref()
            .and_then(|source| source.resolve(&external_user_id))
            .map(|mapping| mapping.internal_user_id);

        let event = StandardEvent {
            event_id: event_id.clone(),
            external_user_id,
            internal_user_id,
            device_id: raw.adapter_name,
            timestamp: raw.device_timestamp,
            event_kind,
            is_simulated: raw.is_simulated,
            raw_payload: raw.raw_payload,
        };

        match self.queue.enqueue(&event) {
            Ok(_) => {}
            Err(QueueError::Duplicate { .. }) => {
                self.stats.total_duplicates.fetch_add(1, Ordering::Relaxed);
                return Ok(ProcessOutcome::Duplicate { event_id });
            }
            Err(e) => return Err(e.into()),
        }

        self.stats.total_processed.fetch_add(1, Ordering::Relaxed);
        *self.stats.last_processed_at.write().await = Some(Utc::now());
        let _ = self.live_events.send(event);

        Ok(ProcessOutcome::Accepted { event_id })
    }
}

/// Deterministic event fingerprint: `sha256(device||user||kind||floor(t/window))`,
/// truncated to 16 bytes hex. Two swipes of the same card at the same
/// reader within the dedup window collapse to the same ID; the cloud
/// also uses this ID as an idempotency key on its side.
fn fingerprint(
    device_id: &str,
    external_user_id: &str,
    event_kind: EventKind,
    timestamp: DateTime<Utc>,
) -> String {
    let bucket = timestamp.timestamp() / FINGERPRINT_BUCKET_SECS;
    let input = format!("{device_id}|{external_user_id}|{}|{bucket}", event_kind.as_str());
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(&digest[..16])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_event(user_id: &str, kind: &str, ts: DateTime<Utc>) -> RawHardwareEvent {
        RawHardwareEvent {
            adapter_name: "front-door".to_string(),
            external_user_id: Some(user_id.to_string()),
            device_timestamp: ts,
            event_kind: kind.to_string(),
            is_simulated: false,
            raw_payload: b"raw".to_vec(),
        }
    }

    fn processor() -> Processor {
        let queue = Arc::new(Queue::open_in_memory(100).unwrap());
        Processor::new(queue, None, 5)
    }

    #[tokio::test]
    async fn accepts_a_fresh_event() {
        let processor = processor();
        let outcome = processor
            .process(raw_event("member-1", "entry", Utc::now()))
            .await
            .unwrap();
        assert!(matches!(outcome, ProcessOutcome::Accepted { .. }));
    }

    #[tokio::test]
    async fn rejects_event_without_external_user_id() {
        let processor = processor();
        let mut raw = raw_event("member-1", "entry", Utc::now());
        raw.external_user_id = None;
        let result = processor.process(raw).await;
        assert!(matches!(result, Err(ProcessorError::MissingExternalUserId)));
    }

    #[tokio::test]
    async fn rejects_unrecognized_event_kind() {
        let processor = processor();
        let result = processor
            .process(raw_event("member-1", "loiter", Utc::now()))
            .await;
        assert!(matches!(
            result,
            Err(ProcessorError::UnrecognizedEventKind(_))
        ));
    }

    #[tokio::test]
    async fn second_swipe_within_window_is_duplicate() {
        let processor = processor();
        let ts = Utc::now();
        processor.process(raw_event("member-1", "entry", ts)).await.unwrap();

        let outcome = processor
            .process(raw_event("member-1", "entry", ts + chrono::Duration::seconds(1)))
            .await
            .unwrap();
        assert!(matches!(outcome, ProcessOutcome::Duplicate { .. }));
    }

    #[tokio::test]
    async fn swipe_outside_window_is_accepted_again() {
        let processor = processor();
        let ts = Utc::now();
        processor.process(raw_event("member-1", "entry", ts)).await.unwrap();

        let outcome = processor
            .process(raw_event(
                "member-1",
                "entry",
                ts + chrono::Duration::seconds(6),
            ))
            .await
            .unwrap();
        assert!(matches!(outcome, ProcessOutcome::Accepted { .. }));
    }

    #[tokio::test]
    async fn range_query_catches_dedup_window_straddle() {
        // Use a wider dedup window than the fingerprint bucket so two
        // swipes that land in different fingerprint buckets (and so get
        // different event_ids) are still caught by the range-query
        // fallback.
        let queue = Arc::new(Queue::open_in_memory(100).unwrap());
        let processor = Processor::new(queue, None, 30);
        let ts = Utc::now();
        processor.process(raw_event("member-1", "entry", ts)).await.unwrap();

        let outcome = processor
            .process(raw_event(
                "member-1",
                "entry",
                ts + chrono::Duration::seconds(20),
            ))
            .await
            .unwrap();
        assert!(matches!(outcome, ProcessOutcome::Duplicate { .. }));
    }

    #[tokio::test]
    async fn event_too_far_from_wall_clock_is_rejected() {
        let processor = processor();
        let result = processor
            .process(raw_event(
                "member-1",
                "entry",
                Utc::now() - chrono::Duration::hours(48),
            ))
            .await;
        assert!(matches!(result, Err(ProcessorError::TimestampOutOfRange)));
    }

    #[tokio::test]
    async fn stats_reflect_accepted_duplicate_and_invalid() {
        let processor = processor();
        let ts = Utc::now();
        processor.process(raw_event("member-1", "entry", ts)).await.unwrap();
        processor.process(raw_event("member-1", "entry", ts)).await.unwrap();
        let _ = processor.process(raw_event("member-1", "bogus", ts)).await;

        let stats = processor.stats().await;
        assert_eq!(stats.total_processed, 1);
        assert_eq!(stats.total_duplicates, 1);
        assert_eq!(stats.total_invalid, 1);
        assert!(stats.last_processed_at.is_some());
    }

    struct StaticMapping(ExternalUserMapping);
    impl UserMappingSource for StaticMapping {
        fn resolve(&self, external_user_id: &str) -> Option<ExternalUserMapping> {
            if external_user_id == self.0.external_user_id {
                Some(self.0.clone())
            } else {
                None
            }
        }
    }

    #[tokio::test]
    async fn resolves_internal_user_id_when_mapping_present() {
        let queue = Arc::new(Queue::open_in_memory(100).unwrap());
        let mapping = ExternalUserMapping {
            external_user_id: "member-1".to_string(),
            internal_user_id: "usr_abc123".to_string(),
            display_name: None,
            notes: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let processor = Processor::new(queue.clone(), Some(Arc::new(StaticMapping(mapping))), 5);

        processor
            .process(raw_event("member-1", "entry", Utc::now()))
            .await
            .unwrap();

        let pending = queue.get_pending(10).unwrap();
        assert_eq!(pending[0].event.internal_user_id.as_deref(), Some("usr_abc123"));
    }
}
