//! Durable, encrypted-payload event queue.
//!
//! Events accepted from adapters are appended here before the submitter
//! ever sees them, so a crash or a cloud outage never loses an event
//! between capture and acknowledgment.

pub mod sqlite;

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

use crate::crypto::{CryptoError, EncryptedData, EncryptionKey};
use crate::model::{EventKind, QueuedEvent, StandardEvent};

/// Device-config keys whose values must never be persisted in plaintext.
pub const SENSITIVE_DEVICE_CONFIG_KEYS: &[&str] =
    &["device_key", "api_secret", "hmac_key", "encryption_key"];

/// Minimum gap between "queue overflow, events evicted" alerts, so a
/// sustained overflow doesn't spam the health log once per enqueue.
const EVICTION_ALERT_INTERVAL: chrono::Duration = chrono::Duration::seconds(60);

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("queue database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("migration failed at version {version}: {reason}")]
    MigrationFailed { version: i64, reason: String },

    #[error("event {event_id} already present in queue")]
    Duplicate { event_id: String },

    #[error("queue row {id} not found")]
    NotFound { id: i64 },

    #[error("device config crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

/// Append-only event store backed by SQLite.
///
/// One connection per agent process, serialized behind a mutex — event
/// volume at a single gym door never approaches a point where this
/// becomes a bottleneck.
pub struct Queue {
    conn: Mutex<Connection>,
    max_size: usize,
    last_eviction_alert: Mutex<Option<DateTime<Utc>>>,
}

impl Queue {
    /// Open (or create) the queue database at `path`.
    ///
    /// `wal` should be true for `normal`/`full` tiers, false for `lite`.
    pub fn open(path: &Path, wal: bool, max_size: usize) -> Result<Self, QueueError> {
        let conn = sqlite::open_database(path, wal)?;
        Ok(Self {
            conn: Mutex::new(conn),
            max_size,
            last_eviction_alert: Mutex::new(None),
        })
    }

    /// Open an in-memory queue (for tests).
    pub fn open_in_memory(max_size: usize) -> Result<Self, QueueError> {
        let conn = sqlite::open_memory_database()?;
        Ok(Self {
            conn: Mutex::new(conn),
            max_size,
            last_eviction_alert: Mutex::new(None),
        })
    }

    /// Returns true if an event with this `event_id` is already queued
    /// or has already been sent. Processor calls this before generating
    /// a duplicate submission for the same physical swipe.
    pub fn has_similar(&self, event_id: &str) -> Result<bool, QueueError> {
        let conn = self.conn.lock().unwrap();
        let found: Option<i64> = conn
            .query_row(
                "SELECT id FROM events WHERE event_id = ?1",
                params![event_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Fallback dedup lookup for window-boundary straddles and clock
    /// jitter that the deterministic `event_id` fingerprint can miss:
    /// true if any event for this user and kind already sits within
    /// `window_secs` of `around`.
    pub fn has_similar_in_window(
        &self,
        external_user_id: &str,
        kind: EventKind,
        around: DateTime<Utc>,
        window_secs: i64,
    ) -> Result<bool, QueueError> {
        let conn = self.conn.lock().unwrap();
        let lower = (around - chrono::Duration::seconds(window_secs)).to_rfc3339();
        let upper = (around + chrono::Duration::seconds(window_secs)).to_rfc3339();
        let found: Option<i64> = conn
            .query_row(
                "SELECT id FROM events
                 WHERE external_user_id = ?1 AND event_kind = ?2
                   AND occurred_at BETWEEN ?3 AND ?4
                 LIMIT 1",
                params![external_user_id, kind.as_str(), lower, upper],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Append a new event, evicting the oldest unsent rows first if the
    /// queue is at capacity. Fails with `Duplicate` if `event_id`
    /// collides with a row still present after eviction.
    pub fn enqueue(&self, event: &StandardEvent) -> Result<i64, QueueError> {
        let conn = self.conn.lock().unwrap();

        let pending: i64 = conn.query_row(
            "SELECT COUNT(*) FROM events WHERE sent_at IS NULL AND parked_at IS NULL",
            [],
            |row| row.get(0),
        )?;
        if pending as usize >= self.max_size {
            let overflow = pending as usize - self.max_size + 1;
            let evicted = conn.execute(
                "DELETE FROM events WHERE id IN (
                    SELECT id FROM events
                    WHERE sent_at IS NULL AND parked_at IS NULL
                    ORDER BY occurred_at ASC, id ASC
                    LIMIT ?1
                )",
                params![overflow as i64],
            )?;
            if evicted > 0 {
                self.alert_queue_overflow(evicted);
            }
        }

        let now = Utc::now();
        let result = conn.execute(
            "INSERT INTO events (
                event_id, external_user_id, internal_user_id, device_id,
                event_kind, occurred_at, is_simulated, raw_payload, created_at, retry_count
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0)",
            params![
                event.event_id,
                event.external_user_id,
                event.internal_user_id,
                event.device_id,
                event.event_kind.as_str(),
                event.timestamp.to_rfc3339(),
                event.is_simulated,
                event.raw_payload,
                now.to_rfc3339(),
            ],
        );

        match result {
            Ok(_) => Ok(conn.last_insert_rowid()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(QueueError::Duplicate {
                    event_id: event.event_id.clone(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Fetch up to `limit` unsent events, oldest first.
    pub fn get_pending(&self, limit: usize) -> Result<Vec<QueuedEvent>, QueueError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, event_id, external_user_id, internal_user_id, device_id,
                    event_kind, occurred_at, is_simulated, raw_payload, created_at, retry_count, sent_at
             FROM events
             WHERE sent_at IS NULL AND parked_at IS NULL
             ORDER BY id ASC
             LIMIT ?1",
        )?;

        let rows = stmt.query_map(params![limit as i64], row_to_queued_event)?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
    }

    /// Mark a batch of rows as successfully submitted.
    pub fn mark_sent(&self, queue_row_ids: &[i64]) -> Result<(), QueueError> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        for id in queue_row_ids {
            conn.execute(
                "UPDATE events SET sent_at = ?1 WHERE id = ?2",
                params![now, id],
            )?;
        }
        Ok(())
    }

    /// Record a failed submission attempt, incrementing the retry count.
    pub fn mark_failed(&self, queue_row_id: i64) -> Result<(), QueueError> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE events SET retry_count = retry_count + 1 WHERE id = ?1",
            params![queue_row_id],
        )?;
        if changed == 0 {
            return Err(QueueError::NotFound { id: queue_row_id });
        }
        Ok(())
    }

    /// Delete sent events older than `older_than`. Returns rows removed.
    pub fn cleanup(&self, older_than: chrono::Duration) -> Result<usize, QueueError> {
        let conn = self.conn.lock().unwrap();
        let cutoff = (Utc::now() - older_than).to_rfc3339();
        let removed = conn.execute(
            "DELETE FROM events WHERE sent_at IS NOT NULL AND sent_at < ?1",
            params![cutoff],
        )?;
        Ok(removed)
    }

    /// Set a row aside after it exceeds the submitter's retry ceiling.
    /// Parked rows stay in the database for operator inspection but are
    /// excluded from `get_pending` — they no longer compete for queue
    /// capacity or submission attempts.
    pub fn park(&self, queue_row_id: i64) -> Result<(), QueueError> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now().to_rfc3339();
        let changed = conn.execute(
            "UPDATE events SET parked_at = ?1 WHERE id = ?2",
            params![now, queue_row_id],
        )?;
        if changed == 0 {
            return Err(QueueError::NotFound { id: queue_row_id });
        }
        Ok(())
    }

    pub fn count_pending(&self) -> Result<usize, QueueError> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM events WHERE sent_at IS NULL AND parked_at IS NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn count_parked(&self) -> Result<usize, QueueError> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM events WHERE parked_at IS NOT NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn is_full(&self) -> Result<bool, QueueError> {
        Ok(self.count_pending()? >= self.max_size)
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Most recent `sent_at` timestamp across all events, if any.
    pub fn last_sent_at(&self) -> Result<Option<DateTime<Utc>>, QueueError> {
        let conn = self.conn.lock().unwrap();
        let raw: Option<String> = conn
            .query_row("SELECT MAX(sent_at) FROM events", [], |row| row.get(0))
            .optional()?
            .flatten();
        Ok(raw.and_then(|s| DateTime::parse_from_rfc3339(&s).ok().map(|d| d.with_timezone(&Utc))))
    }

    /// Paginated, filtered read of queue rows for the control API's
    /// `/events` endpoint. Sent, pending, and parked rows are all
    /// eligible — this is a history view, not a work queue read.
    pub fn query_events(&self, filter: &EventFilter) -> Result<Vec<QueuedEvent>, QueueError> {
        let conn = self.conn.lock().unwrap();

        let mut clauses = Vec::new();
        let mut bound: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(start) = filter.start {
            clauses.push("occurred_at >= ?".to_string());
            bound.push(Box::new(start.to_rfc3339()));
        }
        if let Some(end) = filter.end {
            clauses.push("occurred_at <= ?".to_string());
            bound.push(Box::new(end.to_rfc3339()));
        }
        if let Some(kind) = filter.event_kind {
            clauses.push("event_kind = ?".to_string());
            bound.push(Box::new(kind.as_str().to_string()));
        }
        if let Some(ref user) = filter.external_user_id {
            clauses.push("external_user_id = ?".to_string());
            bound.push(Box::new(user.clone()));
        }

        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };

        let sql = format!(
            "SELECT id, event_id, external_user_id, internal_user_id, device_id,
                    event_kind, occurred_at, is_simulated, raw_payload, created_at, retry_count, sent_at
             FROM events
             {where_clause}
             ORDER BY id DESC
             LIMIT ? OFFSET ?"
        );

        bound.push(Box::new(filter.limit as i64));
        bound.push(Box::new(filter.offset as i64));

        let mut stmt = conn.prepare(&sql)?;
        let params: Vec<&dyn rusqlite::ToSql> = bound.iter().map(|b| b.as_ref()).collect();
        let rows = stmt.query_map(params.as_slice(), row_to_queued_event)?;

        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
    }

    /// Log a "queue overflow, events evicted" alert, rate-limited to at
    /// most once per `EVICTION_ALERT_INTERVAL` so a sustained overflow
    /// doesn't produce one alert per enqueue.
    fn alert_queue_overflow(&self, evicted: usize) {
        let mut last = self.last_eviction_alert.lock().unwrap();
        let now = Utc::now();
        let should_alert = match *last {
            Some(prev) => now - prev >= EVICTION_ALERT_INTERVAL,
            None => true,
        };
        if should_alert {
            tracing::warn!(evicted, max_size = self.max_size, "queue overflow, events evicted");
            *last = Some(now);
        }
    }

    /// Set a device-config value, encrypting it first if `key` is one of
    /// the fixed sensitive keys (`device_key`, `api_secret`, `hmac_key`,
    /// `encryption_key`).
    pub fn set_device_config(
        &self,
        key: &str,
        value: &str,
        encryption_key: &EncryptionKey,
    ) -> Result<(), QueueError> {
        let sensitive = SENSITIVE_DEVICE_CONFIG_KEYS.contains(&key);
        let stored = if sensitive {
            encryption_key.encrypt(value.as_bytes())?.to_bytes()
        } else {
            value.as_bytes().to_vec()
        };

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO device_config (key, value, encrypted, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value, encrypted = excluded.encrypted, updated_at = excluded.updated_at",
            params![key, stored, sensitive as i64, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Read a device-config value back, decrypting it if it was stored
    /// encrypted. Returns `None` if `key` has never been set.
    pub fn get_device_config(
        &self,
        key: &str,
        encryption_key: &EncryptionKey,
    ) -> Result<Option<String>, QueueError> {
        let conn = self.conn.lock().unwrap();
        let row: Option<(Vec<u8>, i64)> = conn
            .query_row(
                "SELECT value, encrypted FROM device_config WHERE key = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        drop(conn);

        let Some((bytes, encrypted)) = row else {
            return Ok(None);
        };
        let plaintext = if encrypted != 0 {
            let data = EncryptedData::from_bytes(&bytes)?;
            encryption_key.decrypt(&data)?
        } else {
            bytes
        };
        Ok(Some(String::from_utf8_lossy(&plaintext).into_owned()))
    }
}

/// Filter criteria for `Queue::query_events`.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub event_kind: Option<EventKind>,
    pub external_user_id: Option<String>,
    pub limit: usize,
    pub offset: usize,
}

fn row_to_queued_event(row: &rusqlite::Row) -> rusqlite::Result<QueuedEvent> {
    let event_kind_raw: String = row.get(5)?;
    let event_kind = EventKind::parse(&event_kind_raw).unwrap_or(EventKind::Denied);

    let occurred_at_raw: String = row.get(6)?;
    let timestamp = DateTime::parse_from_rfc3339(&occurred_at_raw)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());

    let created_at_raw: String = row.get(9)?;
    let created_at = DateTime::parse_from_rfc3339(&created_at_raw)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());

    let sent_at_raw: Option<String> = row.get(11)?;
    let sent_at = sent_at_raw
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok().map(|d| d.with_timezone(&Utc)));

    Ok(QueuedEvent {
        queue_row_id: row.get(0)?,
        event: StandardEvent {
            event_id: row.get(1)?,
            external_user_id: row.get(2)?,
            internal_user_id: row.get(3)?,
            device_id: row.get(4)?,
            timestamp,
            event_kind,
            is_simulated: row.get(7)?,
            raw_payload: row.get(8)?,
        },
        created_at,
        sent_at,
        retry_count: row.get(10)?,
    })
}
