//! Process-wide startup and shutdown orchestration.
//!
//! Boots every subsystem in dependency order — config, auth, queue,
//! processor, adapters, submitter, health, heartbeat, control API,
//! and (if enabled) the updater — and tears them all down from a
//! single cancellation signal within a bounded grace period.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use rand::RngCore;
use thiserror::Error;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;

use crate::adapter::registry::AdapterRegistry;
use crate::adapter::{self, AdapterConfig, AdapterError};
use crate::api::{start_control_api_server, ApiContext, ApiServer};
use crate::auth::{Auth, AuthError, FileVault};
use crate::config::{Config, ConfigError};
use crate::crypto::EncryptionKey;
use crate::health::heartbeat::Heartbeat;
use crate::health::tier::TierDetector;
use crate::health::Health;
use crate::processor::{Processor, ProcessorError};
use crate::queue::{Queue, QueueError};
use crate::submitter::{CloudClient, Submitter};
use crate::updater::{Updater, UpdaterError};

/// How long `shutdown` waits for background tasks to notice the
/// cancellation signal and exit cleanly before abandoning them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);
const SUBMITTER_POLL_INTERVAL: Duration = Duration::from_secs(5);
const UPDATE_CHECK_INTERVAL: Duration = Duration::from_secs(3600);
const CONFIG_REFRESH_INTERVAL: Duration = Duration::from_secs(300);
const VAULT_KEY_FILENAME: &str = "vault.key";
const VAULT_FILENAME: &str = "vault.enc";

#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("auth error: {0}")]
    Auth(#[from] AuthError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("control API failed to start: {0}")]
    ControlApi(String),

    #[error("updater error: {0}")]
    Updater(#[from] UpdaterError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A fully started agent: every subsystem is running, and the handle
/// can be used to inspect live state (e.g. from a CLI subcommand) or
/// to shut everything down.
pub struct Lifecycle {
    pub config: Arc<RwLock<Config>>,
    pub auth: Arc<Auth>,
    pub queue: Arc<Queue>,
    pub processor: Arc<Processor>,
    pub registry: Arc<AdapterRegistry>,
    pub health: Arc<Health>,
    api_server: Option<ApiServer>,
    cancel_tx: watch::Sender<bool>,
    restart_requested_rx: watch::Receiver<bool>,
    background: Vec<JoinHandle<()>>,
}

impl Lifecycle {
    /// Load configuration from `config_path` and construct, then start,
    /// every subsystem. Returns once the control API is listening.
    pub async fn bootstrap(config_path: PathBuf) -> Result<Self, LifecycleError> {
        let config = Config::load(&config_path)?;
        let auth = build_auth(&config)?;

        let data_dir = config
            .database_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(crate::config::default_app_data_dir);
        let device_config_key = Arc::new(load_or_create_vault_key(
            &data_dir.join(VAULT_KEY_FILENAME),
        )?);

        let tier_detector = Arc::new(TierDetector::new(config.tier));
        let tier = tier_detector.detect();
        tracing::info!(tier = %tier, "resolved resource tier");

        let queue = Arc::new(Queue::open(
            &config.database_path,
            tier.wal(),
            config.queue_max_size,
        )?);
        let processor = Arc::new(Processor::new(queue.clone(), None, config.dedup_window_secs));

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (restart_requested_tx, restart_requested_rx) = watch::channel(false);
        let (raw_events_sink, raw_events_source) = adapter::sink::channel(256);
        let registry = Arc::new(AdapterRegistry::new(raw_events_sink, cancel_rx.clone()));

        for name in &config.enabled_adapters {
            match adapter_config_for(&config, name) {
                Ok(adapter_config) => match adapter::build(&adapter_config) {
                    Ok(built) => registry.register(name.clone(), built).await,
                    Err(e) => {
                        tracing::error!(adapter = %name, error = %e, "failed to build adapter, skipping")
                    }
                },
                Err(e) => {
                    tracing::error!(adapter = %name, error = %e, "invalid adapter config, skipping")
                }
            }
        }

        let mut background = Vec::new();

        let ingest_processor = processor.clone();
        let mut ingest_cancel = cancel_rx.clone();
        background.push(tokio::spawn(async move {
            loop {
                let raw = tokio::select! {
                    _ = ingest_cancel.changed() => {
                        if *ingest_cancel.borrow() {
                            return;
                        }
                        continue;
                    }
                    raw = raw_events_source.recv() => raw,
                };

                match ingest_processor.process(raw).await {
                    Ok(_) | Err(ProcessorError::MissingExternalUserId) => {}
                    Err(e) => tracing::warn!(error = %e, "failed to process raw hardware event"),
                }
            }
        }));

        let paired_auth = auth.clone();
        let health = Arc::new(Health::new(
            queue.clone(),
            registry.clone(),
            tier_detector.clone(),
            Arc::new(move || paired_auth.is_authenticated()),
        ));

        let submitter_client = CloudClient::new(config.server_url.clone(), auth.clone());
        let submitter = Submitter::new(
            queue.clone(),
            submitter_client,
            auth.clone(),
            config.batch_size,
            config.retry_ceiling,
            SUBMITTER_POLL_INTERVAL,
        );
        let submitter_cancel = cancel_rx.clone();
        background.push(tokio::spawn(async move {
            submitter.run(submitter_cancel).await;
        }));

        let heartbeat = Heartbeat::new(
            health.clone(),
            auth.clone(),
            config.server_url.clone(),
            Duration::from_secs(config.heartbeat_interval_s),
        );
        let heartbeat_cancel = cancel_rx.clone();
        background.push(tokio::spawn(async move {
            heartbeat.run(heartbeat_cancel).await;
        }));

        if config.updates_enabled {
            let data_dir = config
                .database_path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(crate::config::default_app_data_dir);

            match (&config.update_manifest_url, &config.update_public_key) {
                (Some(manifest_url), Some(public_key_b64)) => {
                    match build_updater(manifest_url, public_key_b64, &data_dir) {
                        Ok(updater) => {
                            let updater_cancel = cancel_rx.clone();
                            let device_id = config.device_id.clone();
                            let restart_requested_tx = restart_requested_tx.clone();
                            background.push(tokio::spawn(async move {
                                run_update_loop(updater, device_id, updater_cancel, restart_requested_tx).await;
                            }));
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "failed to initialize updater, updates disabled this run")
                        }
                    }
                }
                _ => tracing::warn!("updates_enabled but manifest URL or public key missing"),
            }
        }

        let config_cell = Arc::new(RwLock::new(config.clone()));

        let config_client = CloudClient::new(config.server_url.clone(), auth.clone());
        let config_refresh_queue = queue.clone();
        let config_refresh_cell = config_cell.clone();
        let config_refresh_cancel = cancel_rx.clone();
        background.push(tokio::spawn(async move {
            run_config_refresh_loop(
                config_client,
                config_refresh_queue,
                config_refresh_cell,
                device_config_key,
                config_refresh_cancel,
            )
            .await;
        }));

        let api_ctx = ApiContext::new(
            queue.clone(),
            auth.clone(),
            processor.clone(),
            registry.clone(),
            health.clone(),
            config_cell.clone(),
            config_path,
        );
        let api_server = start_control_api_server(api_ctx, &config.control_api_bind)
            .await
            .map_err(LifecycleError::ControlApi)?;

        Ok(Self {
            config: config_cell,
            auth,
            queue,
            processor,
            registry,
            health,
            api_server: Some(api_server),
            cancel_tx,
            restart_requested_rx,
            background,
        })
    }

    /// Bound address of the local control API, once it's started.
    pub fn control_api_addr(&self) -> Option<std::net::SocketAddr> {
        self.api_server.as_ref().map(|s| s.addr)
    }

    /// Resolves once the updater has staged an update and written a
    /// restart marker — the caller should shut down and exit so the
    /// process supervisor can restart into the staged version.
    pub async fn wait_for_restart_request(&mut self) {
        loop {
            if *self.restart_requested_rx.borrow() {
                return;
            }
            if self.restart_requested_rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Signal every background task to stop, stop the control API, and
    /// wait up to the shutdown grace period for them to exit.
    pub async fn shutdown(&mut self) {
        let _ = self.cancel_tx.send(true);

        if let Some(mut server) = self.api_server.take() {
            server.shutdown();
        }

        let deadline = tokio::time::sleep(SHUTDOWN_GRACE);
        tokio::pin!(deadline);

        for handle in self.background.drain(..) {
            tokio::select! {
                _ = handle => {}
                _ = &mut deadline => {
                    tracing::warn!("shutdown grace period elapsed, abandoning remaining background tasks");
                    break;
                }
            }
        }
    }
}

/// Build the device's [`Auth`] handle from its config alone, without
/// starting the rest of the agent. Used both by `bootstrap` and by
/// CLI subcommands (`pair`, `unpair`, `status`) that only need to talk
/// to the credential vault.
pub fn build_auth(config: &Config) -> Result<Arc<Auth>, LifecycleError> {
    let data_dir = config
        .database_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(crate::config::default_app_data_dir);

    let vault_key = load_or_create_vault_key(&data_dir.join(VAULT_KEY_FILENAME))?;
    let vault = FileVault::new(data_dir.join(VAULT_FILENAME), vault_key);
    let auth = Arc::new(Auth::new(Box::new(vault)));
    auth.initialize()?;
    Ok(auth)
}

/// Resolve the `AdapterConfig` for an entry in `enabled_adapters`.
///
/// `adapter_configs[name]` is a free-form JSON object; `kind` defaults
/// to the adapter's own name, so a single-instance adapter (the common
/// case) doesn't need to repeat it.
fn adapter_config_for(config: &Config, name: &str) -> Result<AdapterConfig, LifecycleError> {
    #[derive(Debug, serde::Deserialize, Default)]
    struct Entry {
        kind: Option<String>,
        #[serde(default)]
        settings: serde_json::Map<String, serde_json::Value>,
    }

    let entry: Entry = match config.adapter_configs.get(name) {
        Some(raw) => serde_json::from_value(raw.clone()).map_err(|e| {
            LifecycleError::Config(ConfigError::Invalid(format!(
                "adapter '{name}' config is malformed: {e}"
            )))
        })?,
        None => Entry::default(),
    };

    Ok(AdapterConfig {
        kind: entry.kind.unwrap_or_else(|| name.to_string()),
        name: name.to_string(),
        settings: entry.settings,
    })
}

/// The local control plane's credential vault is encrypted at rest with
/// a key that never leaves this host. First boot generates one and
/// writes it with owner-only permissions; every later boot reuses it.
fn load_or_create_vault_key(path: &Path) -> Result<EncryptionKey, LifecycleError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    if path.exists() {
        let bytes = std::fs::read(path)?;
        let key_bytes: [u8; 32] = bytes.try_into().map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("vault key at {} is not 32 bytes", path.display()),
            )
        })?;
        return Ok(EncryptionKey::from_bytes(key_bytes));
    }

    let mut key_bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut key_bytes);
    std::fs::write(path, key_bytes)?;
    restrict_permissions(path)?;
    Ok(EncryptionKey::from_bytes(key_bytes))
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(0o600);
    std::fs::set_permissions(path, perms)
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

fn build_updater(
    manifest_url: &str,
    public_key_b64: &str,
    data_dir: &Path,
) -> Result<Updater, LifecycleError> {
    let key_bytes = base64::engine::general_purpose::STANDARD
        .decode(public_key_b64)
        .map_err(|e| LifecycleError::Updater(UpdaterError::BadPublicKey(e.to_string())))?;
    let key_array: [u8; 32] = key_bytes.try_into().map_err(|_| {
        LifecycleError::Updater(UpdaterError::BadPublicKey(
            "update_public_key must decode to 32 bytes".to_string(),
        ))
    })?;

    Updater::new(&key_array, manifest_url.to_string(), data_dir.join("updates"))
        .map_err(LifecycleError::Updater)
}

/// Periodically pulls remote config overrides from the cloud, persists
/// them to the device-config table, and applies them to the live
/// config so a restart isn't needed to pick them up.
async fn run_config_refresh_loop(
    client: CloudClient,
    queue: Arc<Queue>,
    config_cell: Arc<RwLock<Config>>,
    encryption_key: Arc<EncryptionKey>,
    mut cancel: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(CONFIG_REFRESH_INTERVAL);

    loop {
        tokio::select! {
            _ = cancel.changed() => {
                if *cancel.borrow() {
                    return;
                }
            }
            _ = ticker.tick() => {
                match client.fetch_device_config().await {
                    Ok(overrides) if !overrides.is_empty() => {
                        apply_and_persist_overrides(&queue, &config_cell, &encryption_key, overrides).await;
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "failed to fetch remote device config"),
                }
            }
        }
    }
}

async fn apply_and_persist_overrides(
    queue: &Queue,
    config_cell: &RwLock<Config>,
    encryption_key: &EncryptionKey,
    overrides: HashMap<String, serde_json::Value>,
) {
    for (key, value) in &overrides {
        let stored = match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        if let Err(e) = queue.set_device_config(key, &stored, encryption_key) {
            tracing::warn!(error = %e, key = %key, "failed to persist remote config override");
        }
    }

    config_cell.write().await.apply_overrides(&overrides);
    tracing::info!(count = overrides.len(), "applied remote config overrides");
}

/// Periodically checks for and stages an eligible update. Actually
/// swapping the running binary is left to the process supervisor that
/// watches the restart marker — this agent never execs over itself.
async fn run_update_loop(
    updater: Updater,
    device_id: Option<String>,
    mut cancel: watch::Receiver<bool>,
    restart_requested_tx: watch::Sender<bool>,
) {
    let Some(device_id) = device_id else {
        tracing::warn!("updates_enabled but device is not yet paired, skipping update checks");
        return;
    };

    let mut ticker = tokio::time::interval(UPDATE_CHECK_INTERVAL);

    loop {
        tokio::select! {
            _ = cancel.changed() => {
                if *cancel.borrow() {
                    return;
                }
            }
            _ = ticker.tick() => {
                match updater.fetch_manifest().await {
                    Ok(manifest) if updater.is_eligible(&manifest, &device_id) => {
                        tracing::info!(version = %manifest.version, "update available, staging");
                        stage_and_mark(&updater, &manifest, &restart_requested_tx).await;
                    }
                    Ok(manifest) => {
                        tracing::debug!(version = %manifest.version, "update available but this device is not in rollout");
                    }
                    Err(e) => tracing::warn!(error = %e, "failed to fetch update manifest"),
                }
            }
        }
    }
}

async fn stage_and_mark(
    updater: &Updater,
    manifest: &crate::updater::UpdateManifest,
    restart_requested_tx: &watch::Sender<bool>,
) {
    match updater.stage(manifest).await {
        Ok(staged) => {
            if let Err(e) = updater
                .write_restart_marker(&staged, Duration::from_secs(600))
                .await
            {
                tracing::error!(error = %e, "failed to write restart marker");
                return;
            }
            tracing::info!(path = %staged.staged_path.display(), "update staged, awaiting supervised restart");
            let _ = restart_requested_tx.send(true);
        }
        Err(e) => tracing::error!(error = %e, "failed to stage update"),
    }
}
