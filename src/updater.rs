//! Self-update: fetches a signed manifest, checks this device's
//! eligibility, verifies the staged binary against the manifest's
//! Ed25519 signature, and restarts into it — with a health-gated
//! window to roll back if the new binary comes up unhealthy.

use std::path::{Path, PathBuf};
use std::time::Duration;

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum UpdaterError {
    #[error("network error fetching manifest: {0}")]
    Network(String),

    #[error("manifest signature is invalid")]
    BadManifestSignature,

    #[error("binary signature is invalid")]
    BadBinarySignature,

    #[error("binary checksum does not match manifest")]
    ChecksumMismatch,

    #[error("public key is malformed: {0}")]
    BadPublicKey(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateManifest {
    pub version: String,
    pub binary_url: String,
    pub sha256: String,
    /// base64 Ed25519 signature over `sha256`, signed by the cloud's
    /// release key.
    pub signature: String,
    /// Device IDs (or hashes thereof) this release is currently rolled
    /// out to. An empty list means "everyone".
    #[serde(default)]
    pub rollout_allow_list: Vec<String>,
    /// Percentage rollout (0-100), applied via a stable hash of the
    /// device ID when `rollout_allow_list` is empty.
    #[serde(default = "full_rollout")]
    pub rollout_percent: u8,
}

fn full_rollout() -> u8 {
    100
}

#[derive(Debug, Clone, Serialize)]
pub struct StagedUpdate {
    pub version: String,
    pub staged_path: PathBuf,
}

pub struct Updater {
    public_key: VerifyingKey,
    manifest_url: String,
    stage_dir: PathBuf,
    http: reqwest::Client,
}

impl Updater {
    pub fn new(
        public_key_bytes: &[u8; 32],
        manifest_url: String,
        stage_dir: PathBuf,
    ) -> Result<Self, UpdaterError> {
        let public_key = VerifyingKey::from_bytes(public_key_bytes)
            .map_err(|e| UpdaterError::BadPublicKey(e.to_string()))?;

        Ok(Self {
            public_key,
            manifest_url,
            stage_dir,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("reqwest client builds with default TLS backend"),
        })
    }

    pub async fn fetch_manifest(&self) -> Result<UpdateManifest, UpdaterError> {
        let manifest: UpdateManifest = self
            .http
            .get(&self.manifest_url)
            .send()
            .await
            .map_err(|e| UpdaterError::Network(e.to_string()))?
            .json()
            .await
            .map_err(|e| UpdaterError::Network(e.to_string()))?;

        self.verify_manifest_signature(&manifest)?;
        Ok(manifest)
    }

    fn verify_manifest_signature(&self, manifest: &UpdateManifest) -> Result<(), UpdaterError> {
        let signature_bytes = base64::Engine::decode(
            &base64::engine::general_purpose::STANDARD,
            &manifest.signature,
        )
        .map_err(|_| UpdaterError::BadManifestSignature)?;

        let signature = Signature::from_slice(&signature_bytes)
            .map_err(|_| UpdaterError::BadManifestSignature)?;

        self.public_key
            .verify(manifest.sha256.as_bytes(), &signature)
            .map_err(|_| UpdaterError::BadManifestSignature)
    }

    /// Whether `device_id` is in scope for this rollout.
    pub fn is_eligible(&self, manifest: &UpdateManifest, device_id: &str) -> bool {
        if !manifest.rollout_allow_list.is_empty() {
            return manifest.rollout_allow_list.iter().any(|id| id == device_id);
        }

        if manifest.rollout_percent >= 100 {
            return true;
        }
        if manifest.rollout_percent == 0 {
            return false;
        }

        let digest = Sha256::digest(device_id.as_bytes());
        let bucket = digest[0] as u16 * 100 / 256;
        bucket < manifest.rollout_percent as u16
    }

    /// Download the binary to the stage directory and verify its
    /// checksum against the manifest. Does not touch the signature —
    /// that already covers the checksum in `verify_manifest_signature`.
    pub async fn stage(&self, manifest: &UpdateManifest) -> Result<StagedUpdate, UpdaterError> {
        let bytes = self
            .http
            .get(&manifest.binary_url)
            .send()
            .await
            .map_err(|e| UpdaterError::Network(e.to_string()))?
            .bytes()
            .await
            .map_err(|e| UpdaterError::Network(e.to_string()))?;

        let digest = hex::encode(Sha256::digest(&bytes));
        if digest != manifest.sha256 {
            return Err(UpdaterError::ChecksumMismatch);
        }

        tokio::fs::create_dir_all(&self.stage_dir).await?;
        let staged_path = self.stage_dir.join(format!("bridged-{}", manifest.version));
        tokio::fs::write(&staged_path, &bytes).await?;
        set_executable(&staged_path).await?;

        Ok(StagedUpdate {
            version: manifest.version.clone(),
            staged_path,
        })
    }

    /// Write a marker file the next startup checks: if health stays
    /// `healthy` past `rollback_window`, the marker is cleared and the
    /// update is considered durable; otherwise the supervising process
    /// (outside this crate) restores the prior binary.
    pub async fn write_restart_marker(
        &self,
        staged: &StagedUpdate,
        rollback_window: Duration,
    ) -> Result<PathBuf, UpdaterError> {
        let marker_path = self.stage_dir.join("restart_marker.json");
        let marker = serde_json::json!({
            "version": staged.version,
            "rollback_window_secs": rollback_window.as_secs(),
        });
        tokio::fs::write(&marker_path, serde_json::to_vec_pretty(&marker).unwrap()).await?;
        Ok(marker_path)
    }
}

#[cfg(unix)]
async fn set_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = tokio::fs::metadata(path).await?.permissions();
    perms.set_mode(0o755);
    tokio::fs::set_permissions(path, perms).await
}

#[cfg(not(unix))]
async fn set_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
