//! Device identity and request signing.
//!
//! Wraps a [`CredentialVault`] with the in-memory state and HMAC signing
//! logic the rest of the agent needs to talk to the cloud control plane
//! as an authenticated, paired device.

pub mod vault;

use std::sync::RwLock;

use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

pub use vault::{Credentials, CredentialVault, FileVault};

use crate::crypto::CryptoError;

type HmacSha256 = Hmac<Sha256>;

/// Signed requests are rejected outside this window to bound replay risk.
pub const TIMESTAMP_WINDOW_SECS: i64 = 300;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("device is not paired")]
    NotAuthenticated,

    #[error("credential vault unavailable: {0}")]
    VaultUnavailable(String),

    #[error("signature does not match")]
    SignatureMismatch,

    #[error("request timestamp outside the {TIMESTAMP_WINDOW_SECS}s acceptance window")]
    TimestampOutOfWindow,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

/// A signed outbound request envelope, ready to become HTTP headers.
#[derive(Debug, Clone)]
pub struct SignedRequest {
    pub device_id: String,
    pub timestamp: i64,
    pub signature: String,
}

/// Device authentication state: holds the paired credentials (if any)
/// and signs/validates HMAC-SHA256 requests against the cloud.
pub struct Auth {
    vault: Box<dyn CredentialVault>,
    credentials: RwLock<Option<Credentials>>,
}

impl Auth {
    pub fn new(vault: Box<dyn CredentialVault>) -> Self {
        Self {
            vault,
            credentials: RwLock::new(None),
        }
    }

    /// Load any previously paired credentials from the vault into memory.
    /// Safe to call repeatedly; idempotent.
    pub fn initialize(&self) -> Result<(), AuthError> {
        let loaded = self.vault.load()?;
        *self.credentials.write().unwrap() = loaded;
        Ok(())
    }

    pub fn is_authenticated(&self) -> bool {
        self.credentials.read().unwrap().is_some()
    }

    pub fn device_id(&self) -> Option<String> {
        self.credentials
            .read()
            .unwrap()
            .as_ref()
            .map(|c| c.device_id.clone())
    }

    /// Persist new credentials (pairing, or a key rotation) and adopt
    /// them in memory.
    pub fn set_credentials(&self, credentials: Credentials) -> Result<(), AuthError> {
        self.vault.store(&credentials)?;
        *self.credentials.write().unwrap() = Some(credentials);
        Ok(())
    }

    /// Replace the device key without changing `device_id`, e.g. on a
    /// cloud-initiated key rotation.
    pub fn rotate(&self, new_device_key: Vec<u8>) -> Result<(), AuthError> {
        let device_id = self
            .credentials
            .read()
            .unwrap()
            .as_ref()
            .ok_or(AuthError::NotAuthenticated)?
            .device_id
            .clone();

        self.set_credentials(Credentials {
            device_id,
            device_key: new_device_key,
            paired_at: Utc::now(),
        })
    }

    /// Unpair: wipe credentials from the vault and memory.
    pub fn clear(&self) -> Result<(), AuthError> {
        self.vault.clear()?;
        *self.credentials.write().unwrap() = None;
        Ok(())
    }

    /// Sign a request payload with `HMAC-SHA256(device_key, body ||
    /// decimal(timestamp) || device_id)`, hex-lowercase.
    pub fn sign(&self, payload: &[u8]) -> Result<SignedRequest, AuthError> {
        let guard = self.credentials.read().unwrap();
        let creds = guard.as_ref().ok_or(AuthError::NotAuthenticated)?;

        let timestamp = Utc::now().timestamp();
        let mut mac = HmacSha256::new_from_slice(&creds.device_key)
            .expect("HMAC accepts a key of any length");
        mac.update(payload);
        mac.update(timestamp.to_string().as_bytes());
        mac.update(creds.device_id.as_bytes());
        let signature = hex::encode(mac.finalize().into_bytes());

        Ok(SignedRequest {
            device_id: creds.device_id.clone(),
            timestamp,
            signature,
        })
    }

    /// Validate a signature presented against the currently paired
    /// device key (used to authenticate cloud-originated callbacks and
    /// locally-issued control-API requests using the same secret).
    pub fn validate(
        &self,
        device_id: &str,
        timestamp: i64,
        signature: &str,
        payload: &[u8],
    ) -> Result<(), AuthError> {
        let guard = self.credentials.read().unwrap();
        let creds = guard.as_ref().ok_or(AuthError::NotAuthenticated)?;

        if creds.device_id != device_id {
            return Err(AuthError::SignatureMismatch);
        }

        let now = Utc::now().timestamp();
        if (now - timestamp).abs() > TIMESTAMP_WINDOW_SECS {
            return Err(AuthError::TimestampOutOfWindow);
        }

        let mut mac = HmacSha256::new_from_slice(&creds.device_key)
            .expect("HMAC accepts a key of any length");
        mac.update(payload);
        mac.update(timestamp.to_string().as_bytes());
        mac.update(device_id.as_bytes());
        let expected = mac.finalize().into_bytes();

        let provided = hex::decode(signature).map_err(|_| AuthError::SignatureMismatch)?;

        if expected.as_slice().ct_eq(&provided).unwrap_u8() == 1 {
            Ok(())
        } else {
            Err(AuthError::SignatureMismatch)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct MemoryVault {
        stored: Mutex<Option<Credentials>>,
    }

    impl MemoryVault {
        fn empty() -> Self {
            Self {
                stored: Mutex::new(None),
            }
        }
    }

    impl CredentialVault for MemoryVault {
        fn store(&self, credentials: &Credentials) -> Result<(), AuthError> {
            *self.stored.lock().unwrap() = Some(credentials.clone());
            Ok(())
        }

        fn load(&self) -> Result<Option<Credentials>, AuthError> {
            Ok(self.stored.lock().unwrap().clone())
        }

        fn clear(&self) -> Result<(), AuthError> {
            *self.stored.lock().unwrap() = None;
            Ok(())
        }
    }

    fn paired_auth() -> Auth {
        let auth = Auth::new(Box::new(MemoryVault::empty()));
        auth.set_credentials(Credentials {
            device_id: "bridge-001".to_string(),
            device_key: b"supersecretkey".to_vec(),
            paired_at: Utc::now(),
        })
        .unwrap();
        auth
    }

    #[test]
    fn unpaired_auth_is_not_authenticated() {
        let auth = Auth::new(Box::new(MemoryVault::empty()));
        assert!(!auth.is_authenticated());
        assert!(matches!(auth.sign(b"payload"), Err(AuthError::NotAuthenticated)));
    }

    #[test]
    fn paired_auth_signs_and_validates() {
        let auth = paired_auth();
        let signed = auth.sign(b"payload").unwrap();

        auth.validate(
            &signed.device_id,
            signed.timestamp,
            &signed.signature,
            b"payload",
        )
        .unwrap();
    }

    #[test]
    fn validate_rejects_tampered_payload() {
        let auth = paired_auth();
        let signed = auth.sign(b"payload").unwrap();

        let result = auth.validate(
            &signed.device_id,
            signed.timestamp,
            &signed.signature,
            b"different payload",
        );
        assert!(matches!(result, Err(AuthError::SignatureMismatch)));
    }

    #[test]
    fn validate_rejects_stale_timestamp() {
        let auth = paired_auth();
        let signed = auth.sign(b"payload").unwrap();

        let result = auth.validate(
            &signed.device_id,
            signed.timestamp - TIMESTAMP_WINDOW_SECS - 10,
            &signed.signature,
            b"payload",
        );
        assert!(matches!(result, Err(AuthError::TimestampOutOfWindow)));
    }

    #[test]
    fn rotate_changes_key_but_not_device_id() {
        let auth = paired_auth();
        let before = auth.device_id().unwrap();
        auth.rotate(b"newkey".to_vec()).unwrap();
        assert_eq!(auth.device_id().unwrap(), before);

        let signed = auth.sign(b"payload").unwrap();
        auth.validate(
            &signed.device_id,
            signed.timestamp,
            &signed.signature,
            b"payload",
        )
        .unwrap();
    }

    #[test]
    fn clear_revokes_authentication() {
        let auth = paired_auth();
        auth.clear().unwrap();
        assert!(!auth.is_authenticated());
    }

    #[test]
    fn initialize_restores_from_vault() {
        let vault = std::sync::Arc::new(MemoryVault::empty());
        vault
            .store(&Credentials {
                device_id: "bridge-002".to_string(),
                device_key: b"key".to_vec(),
                paired_at: Utc::now(),
            })
            .unwrap();

        // Auth owns its vault, so reconstruct a fresh Auth over a vault
        // that already has credentials on disk/in-memory.
        struct Wrapper(std::sync::Arc<MemoryVault>);
        impl CredentialVault for Wrapper {
            fn store(&self, c: &Credentials) -> Result<(), AuthError> {
                self.0.store(c)
            }
            fn load(&self) -> Result<Option<Credentials>, AuthError> {
                self.0.load()
            }
            fn clear(&self) -> Result<(), AuthError> {
                self.0.clear()
            }
        }

        let auth = Auth::new(Box::new(Wrapper(vault)));
        assert!(!auth.is_authenticated());
        auth.initialize().unwrap();
        assert!(auth.is_authenticated());
        assert_eq!(auth.device_id().unwrap(), "bridge-002");
    }
}
