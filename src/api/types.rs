//! Shared types for the local control API: the per-request context plus
//! the anti-replay and rate-limiting caches the middleware stack reads
//! and writes.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::adapter::registry::AdapterRegistry;
use crate::auth::Auth;
use crate::config::Config;
use crate::health::Health;
use crate::processor::Processor;
use crate::queue::Queue;

/// Shared state for every control API route and middleware layer.
#[derive(Clone)]
pub struct ApiContext {
    pub queue: Arc<Queue>,
    pub auth: Arc<Auth>,
    pub processor: Arc<Processor>,
    pub registry: Arc<AdapterRegistry>,
    pub health: Arc<Health>,
    pub config: Arc<RwLock<Config>>,
    /// Path `config` was loaded from, so `POST /config/reload` has
    /// somewhere to re-read from.
    pub config_path: Arc<PathBuf>,
    pub nonce_cache: Arc<Mutex<NonceCache>>,
    pub rate_limiter: Arc<Mutex<RateLimiter>>,
    pub ws_tickets: Arc<Mutex<WsTicketStore>>,
}

impl ApiContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<Queue>,
        auth: Arc<Auth>,
        processor: Arc<Processor>,
        registry: Arc<AdapterRegistry>,
        health: Arc<Health>,
        config: Arc<RwLock<Config>>,
        config_path: PathBuf,
    ) -> Self {
        Self {
            queue,
            auth,
            processor,
            registry,
            health,
            config,
            config_path: Arc::new(config_path),
            nonce_cache: Arc::new(Mutex::new(NonceCache::new())),
            rate_limiter: Arc::new(Mutex::new(RateLimiter::new())),
            ws_tickets: Arc::new(Mutex::new(WsTicketStore::new())),
        }
    }
}

/// Resolved client identity, injected into request extensions by the
/// auth middleware for the audit logger to read.
#[derive(Debug, Clone)]
pub struct ClientIdentity(pub String);

/// In-memory nonce cache with TTL for anti-replay protection on the
/// authenticated endpoints. Nonces older than `ttl` are swept out
/// periodically rather than on every insert.
pub struct NonceCache {
    seen: HashMap<String, Instant>,
    ttl: Duration,
}

impl NonceCache {
    pub fn new() -> Self {
        Self {
            seen: HashMap::new(),
            ttl: Duration::from_secs(60),
        }
    }

    /// Returns `true` if `nonce` hasn't been seen within the TTL window,
    /// recording it either way so a second use is rejected as a replay.
    pub fn check_and_insert(&mut self, nonce: &str) -> bool {
        if self.seen.len() > 1000 {
            self.cleanup();
        }

        if self.seen.contains_key(nonce) {
            return false;
        }

        self.seen.insert(nonce.to_string(), Instant::now());
        true
    }

    fn cleanup(&mut self) {
        let now = Instant::now();
        self.seen.retain(|_, ts| now.duration_since(*ts) < self.ttl);
    }
}

impl Default for NonceCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-client sliding-window rate limiter: a per-minute burst limit and
/// a per-hour ceiling.
pub struct RateLimiter {
    windows: HashMap<String, Vec<Instant>>,
    per_minute: u32,
    per_hour: u32,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            windows: HashMap::new(),
            per_minute: 100,
            per_hour: 1000,
        }
    }

    /// `Ok(())` if `client_key` is within limits, else `Err(retry_after_secs)`.
    pub fn check(&mut self, client_key: &str) -> Result<(), u64> {
        let now = Instant::now();
        let entries = self.windows.entry(client_key.to_string()).or_default();

        entries.retain(|ts| now.duration_since(*ts) < Duration::from_secs(3600));

        let last_minute = entries
            .iter()
            .filter(|ts| now.duration_since(**ts) < Duration::from_secs(60))
            .count() as u32;
        if last_minute >= self.per_minute {
            return Err(60);
        }

        if entries.len() as u32 >= self.per_hour {
            return Err(3600);
        }

        entries.push(now);
        Ok(())
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

struct WsTicket {
    expires_at: Instant,
}

/// One-time tickets for the streaming endpoint: a client authenticates
/// normally against `GET /ws/ticket`, then upgrades the WebSocket with
/// the ticket in the query string instead of exposing the real API key
/// or HMAC headers to whatever handles the upgrade.
pub struct WsTicketStore {
    tickets: HashMap<String, WsTicket>,
}

impl WsTicketStore {
    pub fn new() -> Self {
        Self {
            tickets: HashMap::new(),
        }
    }

    pub fn issue(&mut self) -> String {
        self.cleanup();
        let ticket = uuid::Uuid::new_v4().to_string();
        self.tickets.insert(
            ticket.clone(),
            WsTicket {
                expires_at: Instant::now() + Duration::from_secs(30),
            },
        );
        ticket
    }

    /// One-time use: consuming a valid ticket removes it.
    pub fn consume(&mut self, ticket: &str) -> bool {
        match self.tickets.remove(ticket) {
            Some(t) => Instant::now() <= t.expires_at,
            None => false,
        }
    }

    fn cleanup(&mut self) {
        let now = Instant::now();
        self.tickets.retain(|_, t| now < t.expires_at);
    }
}

impl Default for WsTicketStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonce_cache_rejects_replay() {
        let mut cache = NonceCache::new();
        assert!(cache.check_and_insert("n1"));
        assert!(!cache.check_and_insert("n1"));
    }

    #[test]
    fn nonce_cache_accepts_distinct_nonces() {
        let mut cache = NonceCache::new();
        assert!(cache.check_and_insert("n1"));
        assert!(cache.check_and_insert("n2"));
    }

    #[test]
    fn rate_limiter_isolates_clients() {
        let mut limiter = RateLimiter {
            windows: HashMap::new(),
            per_minute: 1,
            per_hour: 1000,
        };
        assert!(limiter.check("client-a").is_ok());
        assert!(limiter.check("client-b").is_ok());
        assert_eq!(limiter.check("client-a"), Err(60));
    }

    #[test]
    fn rate_limiter_enforces_per_hour_ceiling() {
        let mut limiter = RateLimiter {
            windows: HashMap::new(),
            per_minute: 1000,
            per_hour: 1,
        };
        assert!(limiter.check("client-a").is_ok());
        assert_eq!(limiter.check("client-a"), Err(3600));
    }

    #[test]
    fn ws_ticket_is_one_time_use() {
        let mut store = WsTicketStore::new();
        let ticket = store.issue();
        assert!(store.consume(&ticket));
        assert!(!store.consume(&ticket));
    }

    #[test]
    fn ws_ticket_unknown_is_rejected() {
        let mut store = WsTicketStore::new();
        assert!(!store.consume("not-a-real-ticket"));
    }

    #[test]
    fn ws_ticket_expired_is_rejected() {
        let mut store = WsTicketStore::new();
        let ticket = uuid::Uuid::new_v4().to_string();
        store.tickets.insert(
            ticket.clone(),
            WsTicket {
                expires_at: Instant::now() - Duration::from_secs(1),
            },
        );
        assert!(!store.consume(&ticket));
    }
}
