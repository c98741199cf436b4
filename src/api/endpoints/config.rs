//! Runtime configuration inspection and editing.
//!
//! `GET /config` returns the live config with secrets redacted to a
//! boolean "is one configured" flag. `PUT /config` merges a partial
//! patch into the in-memory config, validates it, and persists the
//! result back to the file it was loaded from. `POST /config/reload`
//! discards in-memory edits and re-reads that file from disk.

use std::collections::HashMap;
use std::path::PathBuf;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::api::error::ApiError;
use crate::api::types::ApiContext;
use crate::config::Config;
use crate::health::tier::Tier;

/// `Config` with every secret field collapsed to "is one set", never
/// the value itself.
#[derive(Debug, Serialize)]
pub struct SanitizedConfig {
    pub device_id: Option<String>,
    pub device_key_configured: bool,
    pub server_url: String,
    pub tier: Option<Tier>,
    pub queue_max_size: usize,
    pub heartbeat_interval_s: u64,
    pub unlock_duration_ms: u64,
    pub batch_size: usize,
    pub retry_ceiling: u32,
    pub database_path: PathBuf,
    pub log_level: String,
    pub enabled_adapters: Vec<String>,
    pub updates_enabled: bool,
    pub update_manifest_url: Option<String>,
    pub control_api_bind: String,
    pub control_api_key_configured: bool,
    pub primary_adapter: Option<String>,
}

impl From<&Config> for SanitizedConfig {
    fn from(config: &Config) -> Self {
        Self {
            device_id: config.device_id.clone(),
            device_key_configured: config.device_key.is_some(),
            server_url: config.server_url.clone(),
            tier: config.tier,
            queue_max_size: config.queue_max_size,
            heartbeat_interval_s: config.heartbeat_interval_s,
            unlock_duration_ms: config.unlock_duration_ms,
            batch_size: config.batch_size,
            retry_ceiling: config.retry_ceiling,
            database_path: config.database_path.clone(),
            log_level: config.log_level.clone(),
            enabled_adapters: config.enabled_adapters.clone(),
            updates_enabled: config.updates_enabled,
            update_manifest_url: config.update_manifest_url.clone(),
            control_api_bind: config.control_api_bind.clone(),
            control_api_key_configured: config.control_api_key.is_some(),
            primary_adapter: config.primary_adapter.clone(),
        }
    }
}

pub async fn get_config(State(ctx): State<ApiContext>) -> impl IntoResponse {
    let config = ctx.config.read().await;
    Json(SanitizedConfig::from(&*config))
}

/// Fields an operator may adjust at runtime without a restart. Anything
/// affecting how adapters or the submitter were constructed (e.g.
/// `server_url`, `database_path`) still requires a process restart.
#[derive(Debug, Deserialize)]
pub struct ConfigPatch {
    pub queue_max_size: Option<usize>,
    pub heartbeat_interval_s: Option<u64>,
    pub unlock_duration_ms: Option<u64>,
    pub batch_size: Option<usize>,
    pub retry_ceiling: Option<u32>,
    pub log_level: Option<String>,
    pub enabled_adapters: Option<Vec<String>>,
    pub adapter_configs: Option<HashMap<String, JsonValue>>,
    pub control_api_key: Option<String>,
    pub primary_adapter: Option<String>,
}

pub async fn put_config(
    State(ctx): State<ApiContext>,
    Json(patch): Json<ConfigPatch>,
) -> Result<impl IntoResponse, ApiError> {
    let mut guard = ctx.config.write().await;
    let mut updated = guard.clone();

    if let Some(v) = patch.queue_max_size {
        updated.queue_max_size = v;
    }
    if let Some(v) = patch.heartbeat_interval_s {
        updated.heartbeat_interval_s = v;
    }
    if let Some(v) = patch.unlock_duration_ms {
        updated.unlock_duration_ms = v;
    }
    if let Some(v) = patch.batch_size {
        updated.batch_size = v;
    }
    if let Some(v) = patch.retry_ceiling {
        updated.retry_ceiling = v;
    }
    if let Some(v) = patch.log_level {
        updated.log_level = v;
    }
    if let Some(v) = patch.enabled_adapters {
        updated.enabled_adapters = v;
    }
    if let Some(v) = patch.adapter_configs {
        updated.adapter_configs = v;
    }
    if let Some(v) = patch.control_api_key {
        updated.control_api_key = Some(v);
    }
    if let Some(v) = patch.primary_adapter {
        updated.primary_adapter = Some(v);
    }

    updated.validate()?;

    let yaml = serde_yaml::to_string(&updated)
        .map_err(|e| ApiError::Internal(format!("failed to serialize config: {e}")))?;
    std::fs::write(ctx.config_path.as_path(), yaml)
        .map_err(|e| ApiError::Internal(format!("failed to persist config: {e}")))?;

    *guard = updated;
    Ok(Json(SanitizedConfig::from(&*guard)))
}

pub async fn reload_config(State(ctx): State<ApiContext>) -> Result<impl IntoResponse, ApiError> {
    let reloaded = Config::load(ctx.config_path.as_path())?;
    let mut guard = ctx.config.write().await;
    *guard = reloaded;
    Ok(Json(SanitizedConfig::from(&*guard)))
}
