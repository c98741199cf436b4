//! Credential storage.
//!
//! The OS-native vault (Keychain / Secret Service / Credential Manager)
//! is the preferred backend and is expected to be wired in by the
//! platform packaging layer as an external contract; this module ships
//! the file-based fallback, encrypted at rest with the same AES-GCM
//! primitives used for the queue payloads.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::{EncryptedData, EncryptionKey};

use super::AuthError;

/// Paired device credentials, as issued by the cloud control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub device_id: String,
    pub device_key: Vec<u8>,
    pub paired_at: DateTime<Utc>,
}

/// Storage backend for device credentials.
///
/// Implementations must never hand back plaintext credentials except
/// through `load`, and must treat `clear` as irreversible.
pub trait CredentialVault: Send + Sync {
    fn store(&self, credentials: &Credentials) -> Result<(), AuthError>;
    fn load(&self) -> Result<Option<Credentials>, AuthError>;
    fn clear(&self) -> Result<(), AuthError>;
}

/// File-based vault: credentials serialized as JSON, then AES-256-GCM
/// encrypted with a key derived from the host machine's on-disk key
/// material (provisioned by `Config`).
pub struct FileVault {
    path: PathBuf,
    key: EncryptionKey,
}

impl FileVault {
    pub fn new(path: impl AsRef<Path>, key: EncryptionKey) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            key,
        }
    }
}

impl CredentialVault for FileVault {
    fn store(&self, credentials: &Credentials) -> Result<(), AuthError> {
        let json = serde_json::to_vec(credentials)
            .map_err(|e| AuthError::VaultUnavailable(e.to_string()))?;
        let encrypted = self
            .key
            .encrypt(&json)
            .map_err(|e| AuthError::VaultUnavailable(e.to_string()))?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, encrypted.to_bytes())?;
        Ok(())
    }

    fn load(&self) -> Result<Option<Credentials>, AuthError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(&self.path)?;
        let encrypted = EncryptedData::from_bytes(&bytes)
            .map_err(|e| AuthError::VaultUnavailable(e.to_string()))?;
        let json = self
            .key
            .decrypt(&encrypted)
            .map_err(|e| AuthError::VaultUnavailable(e.to_string()))?;
        let credentials = serde_json::from_slice(&json)
            .map_err(|e| AuthError::VaultUnavailable(e.to_string()))?;
        Ok(Some(credentials))
    }

    fn clear(&self) -> Result<(), AuthError> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_vault() -> (tempfile::TempDir, FileVault) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.enc");
        let key = EncryptionKey::from_bytes([9u8; 32]);
        let vault = FileVault::new(&path, key);
        (dir, vault)
    }

    fn sample_credentials() -> Credentials {
        Credentials {
            device_id: "bridge-001".to_string(),
            device_key: vec![1, 2, 3, 4],
            paired_at: Utc::now(),
        }
    }

    #[test]
    fn load_before_store_returns_none() {
        let (_dir, vault) = test_vault();
        assert!(vault.load().unwrap().is_none());
    }

    #[test]
    fn store_then_load_round_trips() {
        let (_dir, vault) = test_vault();
        let creds = sample_credentials();
        vault.store(&creds).unwrap();

        let loaded = vault.load().unwrap().unwrap();
        assert_eq!(loaded.device_id, creds.device_id);
        assert_eq!(loaded.device_key, creds.device_key);
    }

    #[test]
    fn clear_removes_stored_credentials() {
        let (_dir, vault) = test_vault();
        vault.store(&sample_credentials()).unwrap();
        vault.clear().unwrap();
        assert!(vault.load().unwrap().is_none());
    }

    #[test]
    fn stored_file_is_not_plaintext_json() {
        let (dir, vault) = test_vault();
        vault.store(&sample_credentials()).unwrap();
        let raw = std::fs::read(dir.path().join("credentials.enc")).unwrap();
        let as_string = String::from_utf8_lossy(&raw);
        assert!(!as_string.contains("bridge-001"));
    }
}
