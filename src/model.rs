//! Shared data model for the ingestion pipeline.
//!
//! `RawHardwareEvent` is produced by adapters, normalized into a
//! `StandardEvent` by the processor, and persisted as a `QueuedEvent` by
//! the queue. See §3 of the design for field-level invariants.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One of the three outcomes a door-access device can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Entry,
    Exit,
    Denied,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Entry => "entry",
            EventKind::Exit => "exit",
            EventKind::Denied => "denied",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "entry" => Some(EventKind::Entry),
            "exit" => Some(EventKind::Exit),
            "denied" => Some(EventKind::Denied),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Adapter output — consumed by the processor, discarded once accepted or
/// rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawHardwareEvent {
    pub adapter_name: String,
    pub external_user_id: Option<String>,
    pub device_timestamp: DateTime<Utc>,
    pub event_kind: String,
    pub is_simulated: bool,
    pub raw_payload: Vec<u8>,
}

/// Processor output / queue input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StandardEvent {
    pub event_id: String,
    pub external_user_id: String,
    pub internal_user_id: Option<String>,
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_kind: EventKind,
    pub is_simulated: bool,
    pub raw_payload: Vec<u8>,
}

/// `StandardEvent` plus queue bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedEvent {
    pub queue_row_id: i64,
    pub event: StandardEvent,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
}

/// State machine for an adapter instance, persisted by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterState {
    Initializing,
    Active,
    Error,
    Disabled,
}

impl std::fmt::Display for AdapterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AdapterState::Initializing => "initializing",
            AdapterState::Active => "active",
            AdapterState::Error => "error",
            AdapterState::Disabled => "disabled",
        };
        write!(f, "{s}")
    }
}

/// Observable status of a registered adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterStatus {
    pub name: String,
    pub state: AdapterState,
    pub last_event_at: Option<DateTime<Utc>>,
    pub last_error_message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl AdapterStatus {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: AdapterState::Initializing,
            last_event_at: None,
            last_error_message: None,
            updated_at: Utc::now(),
        }
    }
}

/// Mapping from an adapter-reported external user ID to the cloud's
/// internal user ID. A missing mapping is non-fatal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalUserMapping {
    pub external_user_id: String,
    pub internal_user_id: String,
    pub display_name: Option<String>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_kind_round_trips_through_str() {
        for kind in [EventKind::Entry, EventKind::Exit, EventKind::Denied] {
            assert_eq!(EventKind::parse(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn event_kind_rejects_unknown() {
        assert_eq!(EventKind::parse("loiter"), None);
    }
}
