//! Control API server lifecycle — starts/stops the axum HTTP server
//! that serves the local control API.
//!
//! Unlike a LAN-discovery service, this binds to a fixed address from
//! config (`127.0.0.1:8787` by default) — the control API is meant for
//! same-host tooling and the cloud's local-network push path, not for
//! discovery by unknown devices.

use std::net::SocketAddr;

use tokio::sync::oneshot;

use crate::api::router::control_api_router;
use crate::api::types::ApiContext;

/// Handle to a running control API server.
pub struct ApiServer {
    pub addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl ApiServer {
    /// Shut down the server gracefully. Safe to call more than once.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
            tracing::info!("control API shutdown signal sent");
        }
    }
}

/// Bind `bind_addr` and start serving the control API in a background
/// task. Returns once the listener is bound, before the server is
/// necessarily accepting its first connection.
pub async fn start_control_api_server(
    ctx: ApiContext,
    bind_addr: &str,
) -> Result<ApiServer, String> {
    let addr: SocketAddr = bind_addr
        .parse()
        .map_err(|e| format!("invalid control_api_bind '{bind_addr}': {e}"))?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("failed to bind control API on {addr}: {e}"))?;

    let bound_addr = listener
        .local_addr()
        .map_err(|e| format!("failed to read bound address: {e}"))?;

    let app = control_api_router(ctx);
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        let shutdown_signal = async move {
            let _ = shutdown_rx.await;
            tracing::info!("control API received shutdown signal");
        };

        tracing::info!(addr = %bound_addr, "control API listening");

        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
        {
            tracing::error!(error = %e, "control API server error");
        }

        tracing::info!("control API stopped");
    });

    Ok(ApiServer {
        addr: bound_addr,
        shutdown_tx: Some(shutdown_tx),
    })
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
    use std::sync::Arc;
    use tokio::sync::{watch, RwLock};

    async fn test_context(dir: &std::path::Path) -> ApiContext {
        let queue = Arc::new(Queue::open_in_memory(100).unwrap());
        let key = EncryptionKey::from_bytes([5u8; 32]);
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
        let config = Arc::new(RwLock::new(crate::config::Config {
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
            control_api_bind: "127.0.0.1:0".to_string(),
            control_api_key: None,
            primary_adapter: None,
        }));
        ApiContext::new(queue, auth, processor, registry, health, config, dir.join("config.yaml"))
    }

    #[tokio::test]
    async fn starts_and_binds_an_ephemeral_port() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path()).await;
        let mut server = start_control_api_server(ctx, "127.0.0.1:0")
            .await
            .expect("server should start");

        assert!(server.addr.port() > 0);

        let url = format!("http://{}/api/v1/health", server.addr);
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK);

        server.shutdown();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path()).await;
        let mut server = start_control_api_server(ctx, "127.0.0.1:0")
            .await
            .expect("server should start");

        server.shutdown();
        server.shutdown();
    }

    #[tokio::test]
    async fn invalid_bind_address_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path()).await;
        let result = start_control_api_server(ctx, "not-an-address").await;
        assert!(result.is_err());
    }
}
