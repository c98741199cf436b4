//! Typed configuration: loaded from a YAML file, overlaid with
//! `BRIDGE_*`-prefixed environment variables, validated before any
//! subsystem is constructed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::health::tier::Tier;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

fn default_queue_max_size() -> usize {
    10_000
}

fn default_heartbeat_interval_s() -> u64 {
    60
}

fn default_unlock_duration_ms() -> u64 {
    5_000
}

fn default_database_path() -> PathBuf {
    default_app_data_dir().join("bridge.sqlite3")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_batch_size() -> usize {
    50
}

fn default_retry_ceiling() -> u32 {
    12
}

fn default_dedup_window_secs() -> u64 {
    300
}

/// `~/.bridge-agent/` — the one user-visible application data
/// directory, analogous to the teacher's single app-data root.
pub fn default_app_data_dir() -> PathBuf {
    let home = dirs::home_dir().expect("cannot determine home directory");
    home.join(".bridge-agent")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub device_id: Option<String>,
    #[serde(default)]
    pub device_key: Option<String>,
    pub server_url: String,

    pub tier: Option<Tier>,

    #[serde(default = "default_queue_max_size")]
    pub queue_max_size: usize,
    #[serde(default = "default_heartbeat_interval_s")]
    pub heartbeat_interval_s: u64,
    #[serde(default = "default_unlock_duration_ms")]
    pub unlock_duration_ms: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_retry_ceiling")]
    pub retry_ceiling: u32,
    /// Window, in seconds, within which two events for the same user and
    /// kind are considered the same physical swipe.
    #[serde(default = "default_dedup_window_secs")]
    pub dedup_window_secs: u64,

    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub enabled_adapters: Vec<String>,
    #[serde(default)]
    pub adapter_configs: HashMap<String, JsonValue>,

    #[serde(default)]
    pub updates_enabled: bool,
    pub update_manifest_url: Option<String>,
    pub update_public_key: Option<String>,

    #[serde(default = "default_control_api_bind")]
    pub control_api_bind: String,
    /// Scoped API key accepted by the local control API alongside HMAC
    /// signatures. `None` disables key-based auth entirely.
    #[serde(default)]
    pub control_api_key: Option<String>,
    /// Adapter the `/door/*` endpoints act on when the request doesn't
    /// name one explicitly.
    #[serde(default)]
    pub primary_adapter: Option<String>,
}

fn default_control_api_bind() -> String {
    "127.0.0.1:8787".to_string()
}

impl Config {
    /// Loads from `path`, then overlays any `BRIDGE_*` environment
    /// variables, then validates required fields.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let mut config: Config =
            serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("BRIDGE_SERVER_URL") {
            self.server_url = v;
        }
        if let Ok(v) = std::env::var("BRIDGE_DEVICE_ID") {
            self.device_id = Some(v);
        }
        if let Ok(v) = std::env::var("BRIDGE_LOG_LEVEL") {
            self.log_level = v;
        }
        if let Ok(v) = std::env::var("BRIDGE_DATABASE_PATH") {
            self.database_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("BRIDGE_QUEUE_MAX_SIZE") {
            if let Ok(n) = v.parse() {
                self.queue_max_size = n;
            }
        }
        if let Ok(v) = std::env::var("BRIDGE_HEARTBEAT_INTERVAL_S") {
            if let Ok(n) = v.parse() {
                self.heartbeat_interval_s = n;
            }
        }
        if let Ok(v) = std::env::var("BRIDGE_CONTROL_API_BIND") {
            self.control_api_bind = v;
        }
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.server_url.trim().is_empty() {
            return Err(ConfigError::Invalid("server_url must not be empty".into()));
        }
        if !self.server_url.starts_with("http://") && !self.server_url.starts_with("https://") {
            return Err(ConfigError::Invalid(
                "server_url must be an http(s) URL".into(),
            ));
        }
        if self.queue_max_size == 0 {
            return Err(ConfigError::Invalid("queue_max_size must be > 0".into()));
        }
        if self.heartbeat_interval_s == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat_interval_s must be > 0".into(),
            ));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be > 0".into()));
        }
        if self.updates_enabled
            && (self.update_manifest_url.is_none() || self.update_public_key.is_none())
        {
            return Err(ConfigError::Invalid(
                "updates_enabled requires update_manifest_url and update_public_key".into(),
            ));
        }
        Ok(())
    }

    pub fn is_paired(&self) -> bool {
        self.device_id.is_some() && self.device_key.is_some()
    }

    /// Apply remote config overrides fetched from the cloud. Only the
    /// fields an operator can safely change at runtime are recognized;
    /// anything else is logged and ignored rather than rejected, so a
    /// newer cloud schema doesn't break older agents.
    pub fn apply_overrides(&mut self, overrides: &HashMap<String, JsonValue>) {
        for (key, value) in overrides {
            match key.as_str() {
                "log_level" => {
                    if let Some(v) = value.as_str() {
                        self.log_level = v.to_string();
                    }
                }
                "queue_max_size" => {
                    if let Some(v) = value.as_u64() {
                        self.queue_max_size = v as usize;
                    }
                }
                "heartbeat_interval_s" => {
                    if let Some(v) = value.as_u64() {
                        self.heartbeat_interval_s = v;
                    }
                }
                "unlock_duration_ms" => {
                    if let Some(v) = value.as_u64() {
                        self.unlock_duration_ms = v;
                    }
                }
                "batch_size" => {
                    if let Some(v) = value.as_u64() {
                        self.batch_size = v as usize;
                    }
                }
                "retry_ceiling" => {
                    if let Some(v) = value.as_u64() {
                        self.retry_ceiling = v as u32;
                    }
                }
                "dedup_window_secs" => {
                    if let Some(v) = value.as_u64() {
                        self.dedup_window_secs = v;
                    }
                }
                other => {
                    tracing::debug!(key = other, "ignoring unrecognized remote config override");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml() -> &'static str {
        "server_url: https://cloud.example.test\n"
    }

    fn write_config(dir: &std::path::Path, contents: &str) -> PathBuf {
        let path = dir.join("config.yaml");
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn loads_minimal_config_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), minimal_yaml());

        let config = Config::load(&path).unwrap();
        assert_eq!(config.server_url, "https://cloud.example.test");
        assert_eq!(config.queue_max_size, 10_000);
        assert_eq!(config.heartbeat_interval_s, 60);
        assert!(!config.updates_enabled);
        assert!(!config.is_paired());
    }

    #[test]
    fn rejects_missing_server_url() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), "queue_max_size: 100\n");

        assert!(matches!(Config::load(&path), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn rejects_non_http_server_url() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), "server_url: ftp://cloud.example.test\n");

        assert!(matches!(Config::load(&path), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn rejects_updates_enabled_without_manifest_url() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            "server_url: https://cloud.example.test\nupdates_enabled: true\n",
        );

        assert!(matches!(Config::load(&path), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn env_override_wins_over_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), minimal_yaml());

        std::env::set_var("BRIDGE_SERVER_URL", "https://override.example.test");
        let config = Config::load(&path).unwrap();
        std::env::remove_var("BRIDGE_SERVER_URL");

        assert_eq!(config.server_url, "https://override.example.test");
    }

    #[test]
    fn apply_overrides_updates_known_fields_and_ignores_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), minimal_yaml());
        let mut config = Config::load(&path).unwrap();

        let mut overrides = HashMap::new();
        overrides.insert("log_level".to_string(), serde_json::json!("debug"));
        overrides.insert("batch_size".to_string(), serde_json::json!(25));
        overrides.insert("something_future".to_string(), serde_json::json!("ignored"));

        config.apply_overrides(&overrides);

        assert_eq!(config.log_level, "debug");
        assert_eq!(config.batch_size, 25);
    }

    #[test]
    fn paired_requires_both_device_id_and_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            dir.path(),
            "server_url: https://cloud.example.test\ndevice_id: bridge-001\n",
        );

        let config = Config::load(&path).unwrap();
        assert!(!config.is_paired());
    }
}
