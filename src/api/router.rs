//! Local control API router.
//!
//! Routes are nested under `/api/v1` and protected by a middleware
//! stack applied outermost to innermost: Rate Limit → Nonce → Auth →
//! Audit → Handler. `/health` is the one unauthenticated route.

use axum::middleware::from_fn;
use axum::routing::{get, post};
use axum::{Extension, Router};

use super::endpoints::{adapters, config, door, events, health, status, ws_ticket};
use super::middleware::{audit, auth, nonce, rate};
use super::types::ApiContext;
use super::websocket;

pub fn control_api_router(ctx: ApiContext) -> Router {
    let unprotected = Router::new()
        .route("/health", get(health::health))
        .with_state(ctx.clone())
        .layer(from_fn(rate::limit));

    let protected = Router::new()
        .route("/status", get(status::status))
        .route("/metrics", get(status::metrics))
        .route("/config", get(config::get_config).put(config::put_config))
        .route("/config/reload", post(config::reload_config))
        .route("/events", get(events::list_events))
        .route("/adapters", get(adapters::list_adapters))
        .route("/adapters/:name", get(adapters::get_adapter))
        .route("/adapters/:name/enable", post(adapters::enable_adapter))
        .route("/adapters/:name/disable", post(adapters::disable_adapter))
        .route("/adapters/:name/push", post(adapters::push_event))
        .route("/door/unlock", post(door::unlock))
        .route("/door/lock", post(door::lock))
        .route("/door/status", get(door::door_status))
        .route("/ws/ticket", post(ws_ticket::issue_ticket))
        .with_state(ctx.clone())
        .layer(from_fn(audit::log_access))
        .layer(from_fn(auth::require_auth))
        .layer(from_fn(nonce::verify_nonce))
        .layer(from_fn(rate::limit));

    // The streaming upgrade authenticates via a one-time ticket inside
    // the handler rather than the header-based middleware stack, since
    // browser WebSocket clients can't set custom headers on the
    // upgrade request.
    let ws_routes = Router::new()
        .route("/ws/stream", get(websocket::ws_upgrade))
        .with_state(ctx.clone())
        .layer(from_fn(rate::limit));

    Router::new()
        .nest("/api/v1", protected)
        .nest("/api/v1", unprotected)
        .merge(ws_routes)
        .layer(Extension(ctx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::registry::AdapterRegistry;
    use crate::auth::{Auth, FileVault};
    use crate::crypto::EncryptionKey;
    use crate::health::{Health, TierDetector};
    use crate::processor::Processor;
    use crate::queue::Queue;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::sync::Arc;
    use tokio::sync::{watch, RwLock};
    use tower::ServiceExt;

    fn test_config(dir: &std::path::Path) -> crate::config::Config {
        crate::config::Config {
            device_id: None,
            device_key: None,
            server_url: "https://cloud.example.test".to_string(),
            tier: None,
            queue_max_size: 100,
            heartbeat_interval_s: 60,
            unlock_duration_ms: 5000,
            batch_size: 10,
            retry_ceiling: 5,
            dedup_window_secs: 300,
            database_path: dir.join("bridge.sqlite3"),
            log_level: "info".to_string(),
            enabled_adapters: vec![],
            adapter_configs: Default::default(),
            updates_enabled: false,
            update_manifest_url: None,
            update_public_key: None,
            control_api_bind: "127.0.0.1:8787".to_string(),
            control_api_key: Some("test-key-123".to_string()),
            primary_adapter: None,
        }
    }

    async fn test_context(dir: &std::path::Path) -> ApiContext {
        let queue = Arc::new(Queue::open_in_memory(100).unwrap());
        let key = EncryptionKey::from_bytes([3u8; 32]);
        let auth = Arc::new(Auth::new(Box::new(FileVault::new(dir.join("vault.enc"), key))));
        let processor = Arc::new(Processor::new(queue.clone(), None, 300));
        let (events_sink, _events_source) = crate::adapter::sink::channel(8);
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let registry = Arc::new(AdapterRegistry::new(events_sink, cancel_rx));
        let health = Arc::new(Health::new(
            queue.clone(),
            registry.clone(),
            Arc::new(TierDetector::new(Some(crate::health::tier::Tier::Full))),
            Arc::new(|| true),
        ));
        let config_path = dir.join("config.yaml");
        let config = Arc::new(RwLock::new(test_config(dir)));
        ApiContext::new(queue, auth, processor, registry, health, config, config_path)
    }

    #[tokio::test]
    async fn health_is_reachable_without_auth() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path()).await;
        let app = control_api_router(ctx);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn protected_route_without_credentials_is_unauthorized() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path()).await;
        let app = control_api_router(ctx);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn protected_route_with_api_key_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path()).await;
        let app = control_api_router(ctx);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/status")
                    .header("X-Api-Key", "test-key-123")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn protected_route_with_wrong_api_key_is_unauthorized() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path()).await;
        let app = control_api_router(ctx);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/status")
                    .header("X-Api-Key", "wrong-key")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
