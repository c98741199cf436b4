//! Bounded, non-blocking handoff from an adapter's hardware read loop to
//! the processor. A full sink drops the oldest queued event rather than
//! blocking the caller — a slow processor should never stall a reader
//! mid-poll, and a dropped event is visible (via [`EventSink::dropped_count`])
//! rather than silently backing up a bounded channel forever.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};

use crate::model::RawHardwareEvent;

struct Inner {
    queue: Mutex<VecDeque<RawHardwareEvent>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
}

/// The write side: cheap to clone, handed to every running adapter.
#[derive(Clone)]
pub struct EventSink {
    inner: Arc<Inner>,
}

/// The read side: owned by the ingest loop that feeds the processor.
pub struct EventSource {
    inner: Arc<Inner>,
}

pub fn channel(capacity: usize) -> (EventSink, EventSource) {
    let inner = Arc::new(Inner {
        queue: Mutex::new(VecDeque::with_capacity(capacity)),
        notify: Notify::new(),
        capacity,
        dropped: AtomicU64::new(0),
    });
    (
        EventSink {
            inner: inner.clone(),
        },
        EventSource { inner },
    )
}

impl EventSink {
    /// Enqueue an event without blocking. If the sink is already at
    /// capacity the oldest queued event is evicted to make room.
    pub async fn push(&self, event: RawHardwareEvent) {
        let mut queue = self.inner.queue.lock().await;
        if queue.len() >= self.inner.capacity {
            queue.pop_front();
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
        }
        queue.push_back(event);
        drop(queue);
        self.inner.notify.notify_one();
    }

    /// Total events evicted to make room since this sink was created.
    pub fn dropped_count(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

impl EventSource {
    /// Waits for and returns the next queued event. Never returns
    /// `None` — callers that need to stop waiting should race this
    /// against a cancellation signal.
    pub async fn recv(&self) -> RawHardwareEvent {
        loop {
            let mut queue = self.inner.queue.lock().await;
            if let Some(event) = queue.pop_front() {
                return event;
            }
            drop(queue);
            self.inner.notify.notified().await;
        }
    }
}
