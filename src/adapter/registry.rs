//! Supervises every configured adapter: spawns its run loop, restarts
//! it with backoff on failure, and tracks the status each reports to
//! the health aggregator and the control API.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;

use crate::model::{AdapterState, AdapterStatus};

use super::sink::EventSink;
use super::{Adapter, AdapterError};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

struct RegisteredAdapter {
    adapter: Arc<dyn Adapter>,
    cancel_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Owns the set of running adapters. Cheap to clone — internals are
/// all `Arc`-backed — so the control API and the health aggregator
/// can each hold their own handle.
#[derive(Clone)]
pub struct AdapterRegistry {
    adapters: Arc<RwLock<HashMap<String, RegisteredAdapter>>>,
    statuses: Arc<RwLock<HashMap<String, AdapterStatus>>>,
    events_sink: EventSink,
    global_cancel: watch::Receiver<bool>,
}

impl AdapterRegistry {
    pub fn new(events_sink: EventSink, global_cancel: watch::Receiver<bool>) -> Self {
        Self {
            adapters: Arc::new(RwLock::new(HashMap::new())),
            statuses: Arc::new(RwLock::new(HashMap::new())),
            events_sink,
            global_cancel,
        }
    }

    /// Total raw events dropped across every adapter because the shared
    /// delivery sink was at capacity — surfaced through health so an
    /// operator can see a processor that's falling behind.
    pub fn dropped_event_count(&self) -> u64 {
        self.events_sink.dropped_count()
    }

    /// Register and start an adapter. Replaces any prior adapter
    /// registered under the same name, stopping it first.
    pub async fn register(&self, name: String, adapter: Box<dyn Adapter>) {
        self.unregister(&name).await;

        let adapter: Arc<dyn Adapter> = Arc::from(adapter);
        self.statuses
            .write()
            .await
            .insert(name.clone(), AdapterStatus::new(name.clone()));

        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.spawn_forward(cancel_tx.clone());

        let handle = self.spawn_run_loop(name.clone(), adapter.clone(), cancel_rx);

        self.adapters.write().await.insert(
            name,
            RegisteredAdapter {
                adapter,
                cancel_tx,
                handle,
            },
        );
    }

    /// Stop and drop an adapter. No-op if it isn't registered.
    pub async fn unregister(&self, name: &str) {
        if let Some(registered) = self.adapters.write().await.remove(name) {
            let _ = registered.cancel_tx.send(true);
            registered.handle.abort();
        }
        self.statuses.write().await.remove(name);
    }

    /// Disable a running adapter without removing its registration —
    /// `enable` restarts it from the same config.
    pub async fn disable(&self, name: &str) -> Result<(), AdapterError> {
        let adapters = self.adapters.read().await;
        let registered = adapters
            .get(name)
            .ok_or_else(|| AdapterError::Unknown(name.to_string()))?;
        let _ = registered.cancel_tx.send(true);
        drop(adapters);

        self.set_state(name, AdapterState::Disabled, None).await;
        Ok(())
    }

    pub async fn enable(&self, name: &str) -> Result<(), AdapterError> {
        let adapter = {
            let adapters = self.adapters.read().await;
            adapters
                .get(name)
                .map(|r| r.adapter.clone())
                .ok_or_else(|| AdapterError::Unknown(name.to_string()))?
        };

        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.spawn_forward(cancel_tx.clone());
        let handle = self.spawn_run_loop(name.to_string(), adapter.clone(), cancel_rx);

        self.adapters.write().await.insert(
            name.to_string(),
            RegisteredAdapter {
                adapter,
                cancel_tx,
                handle,
            },
        );
        Ok(())
    }

    pub async fn status(&self, name: &str) -> Option<AdapterStatus> {
        self.statuses.read().await.get(name).cloned()
    }

    pub async fn capabilities(&self, name: &str) -> Option<super::AdapterCapabilities> {
        let adapters = self.adapters.read().await;
        adapters.get(name).map(|r| r.adapter.capabilities())
    }

    pub async fn list(&self) -> Vec<AdapterStatus> {
        self.statuses.read().await.values().cloned().collect()
    }

    pub async fn unlock(&self, name: &str, duration_ms: u64) -> Result<(), AdapterError> {
        let adapter = {
            let adapters = self.adapters.read().await;
            adapters
                .get(name)
                .map(|r| r.adapter.clone())
                .ok_or_else(|| AdapterError::Unknown(name.to_string()))?
        };
        adapter.unlock(duration_ms).await
    }

    /// Hand a pushed request body to a named adapter, for hardware that
    /// POSTs events to us rather than being polled.
    pub async fn push(
        &self,
        name: &str,
        body: &[u8],
        signature: Option<&str>,
    ) -> Result<usize, AdapterError> {
        let adapter = {
            let adapters = self.adapters.read().await;
            adapters
                .get(name)
                .map(|r| r.adapter.clone())
                .ok_or_else(|| AdapterError::Unknown(name.to_string()))?
        };
        adapter.push(body, signature).await
    }

    /// Forwards the registry-wide shutdown signal into a per-adapter
    /// channel, so disabling one adapter doesn't require tearing down
    /// the others' cancellation wiring.
    fn spawn_forward(&self, child_tx: watch::Sender<bool>) {
        let mut global = self.global_cancel.clone();
        tokio::spawn(async move {
            loop {
                if global.changed().await.is_err() {
                    return;
                }
                if *global.borrow() {
                    let _ = child_tx.send(true);
                    return;
                }
            }
        });
    }

    fn spawn_run_loop(
        &self,
        name: String,
        adapter: Arc<dyn Adapter>,
        mut cancel_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let events_sink = self.events_sink.clone();
        let statuses = self.statuses.clone();

        tokio::spawn(async move {
            let mut backoff = INITIAL_BACKOFF;

            loop {
                if *cancel_rx.borrow() {
                    break;
                }

                set_state(&statuses, &name, AdapterState::Active, None).await;

                match adapter.run(events_sink.clone(), cancel_rx.clone()).await {
                    Ok(()) => break,
                    Err(e) => {
                        tracing::warn!(adapter = %name, error = %e, backoff_ms = backoff.as_millis(), "adapter stopped, restarting");
                        set_state(&statuses, &name, AdapterState::Error, Some(e.to_string())).await;

                        if sleep_or_cancel(backoff, &mut cancel_rx).await {
                            break;
                        }
                        backoff = (backoff * 2).min(MAX_BACKOFF);
                    }
                }
            }

            set_state(&statuses, &name, AdapterState::Disabled, None).await;
        })
    }

    fn set_state<'a>(
        &'a self,
        name: &'a str,
        state: AdapterState,
        error: Option<String>,
    ) -> impl std::future::Future<Output = ()> + 'a {
        set_state(&self.statuses, name, state, error)
    }
}

async fn set_state(
    statuses: &Arc<RwLock<HashMap<String, AdapterStatus>>>,
    name: &str,
    state: AdapterState,
    error: Option<String>,
) {
    let mut guard = statuses.write().await;
    if let Some(status) = guard.get_mut(name) {
        status.state = state;
        status.last_error_message = error;
        status.updated_at = chrono::Utc::now();
    }
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
    use crate::adapter::{AdapterCapabilities};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyAdapter {
        name: String,
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl Adapter for FlakyAdapter {
        fn name(&self) -> &str {
            &self.name
        }

        fn capabilities(&self) -> AdapterCapabilities {
            AdapterCapabilities {
                remote_unlock: false,
            }
        }

        async fn run(
            &self,
            _events: EventSink,
            _cancel: watch::Receiver<bool>,
        ) -> Result<(), AdapterError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt == 0 {
                Err(AdapterError::StartFailed {
                    name: self.name.clone(),
                    reason: "simulated failure".to_string(),
                })
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn register_starts_adapter_and_reports_status() {
        let (sink, _source) = super::sink::channel(8);
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let registry = AdapterRegistry::new(sink, cancel_rx);

        registry
            .register(
                "flaky".to_string(),
                Box::new(FlakyAdapter {
                    name: "flaky".to_string(),
                    attempts: AtomicUsize::new(1),
                }),
            )
            .await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        let status = registry.status("flaky").await.unwrap();
        assert_eq!(status.name, "flaky");
    }

    #[tokio::test]
    async fn unregister_removes_status() {
        let (sink, _source) = super::sink::channel(8);
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let registry = AdapterRegistry::new(sink, cancel_rx);

        registry
            .register(
                "flaky".to_string(),
                Box::new(FlakyAdapter {
                    name: "flaky".to_string(),
                    attempts: AtomicUsize::new(1),
                }),
            )
            .await;

        registry.unregister("flaky").await;
        assert!(registry.status("flaky").await.is_none());
    }

    #[tokio::test]
    async fn unknown_adapter_operations_error() {
        let (sink, _source) = super::sink::channel(8);
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let registry = AdapterRegistry::new(sink, cancel_rx);

        assert!(matches!(
            registry.disable("ghost").await,
            Err(AdapterError::Unknown(_))
        ));
        assert!(matches!(
            registry.unlock("ghost", 1000).await,
            Err(AdapterError::Unknown(_))
        ));
    }
}
