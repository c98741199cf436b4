//! Device pairing against the cloud control plane.
//!
//! A fresh install ships unpaired: the operator enters a short-lived
//! pair code (generated in the cloud dashboard) which this module
//! exchanges for long-lived device credentials over a single HTTPS
//! call. Everything after that uses [`crate::auth::Auth`] signing.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::auth::{Auth, Credentials};

#[derive(Error, Debug)]
pub enum PairingError {
    #[error("device is already paired")]
    AlreadyPaired,

    #[error("device is not paired")]
    NotPaired,

    #[error("pair code was rejected by the control plane")]
    InvalidPairCode,

    #[error("pairing request timed out")]
    Timeout,

    #[error("network error contacting control plane: {0}")]
    Network(String),

    #[error("control plane returned an error: {0}")]
    Cloud(String),

    #[error("auth error: {0}")]
    Auth(#[from] crate::auth::AuthError),
}

#[derive(Debug, Serialize)]
struct PairRequest<'a> {
    pair_code: &'a str,
    device_name: String,
}

#[derive(Debug, Deserialize)]
struct PairResponse {
    device_id: String,
    device_key: String,
}

/// Exchanges an operator-entered pair code for device credentials.
pub struct Pairing {
    auth: Arc<Auth>,
    http: reqwest::Client,
    server_url: String,
}

impl Pairing {
    pub fn new(auth: Arc<Auth>, server_url: String) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("reqwest client builds with default TLS backend");

        Self {
            auth,
            http,
            server_url,
        }
    }

    pub fn is_paired(&self) -> bool {
        self.auth.is_authenticated()
    }

    /// Pair this device using `pair_code`, aborting if the cloud hasn't
    /// responded by `deadline`.
    pub async fn pair(&self, pair_code: &str, deadline: Duration) -> Result<(), PairingError> {
        if self.auth.is_authenticated() {
            return Err(PairingError::AlreadyPaired);
        }

        let device_name = hostname_fallback();
        let request = PairRequest {
            pair_code,
            device_name,
        };

        let response = tokio::time::timeout(
            deadline,
            self.http
                .post(format!("{}/api/v1/devices/pair", self.server_url))
                .json(&request)
                .send(),
        )
        .await
        .map_err(|_| PairingError::Timeout)?
        .map_err(|e| PairingError::Network(e.to_string()))?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED
            || response.status() == reqwest::StatusCode::NOT_FOUND
        {
            return Err(PairingError::InvalidPairCode);
        }

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PairingError::Cloud(body));
        }

        let parsed: PairResponse = response
            .json()
            .await
            .map_err(|e| PairingError::Cloud(e.to_string()))?;

        let device_key = BASE64
            .decode(parsed.device_key)
            .map_err(|e| PairingError::Cloud(format!("invalid device_key encoding: {e}")))?;

        self.auth.set_credentials(Credentials {
            device_id: parsed.device_id,
            device_key,
            paired_at: Utc::now(),
        })?;

        Ok(())
    }

    /// Revoke local credentials. Best-effort notifies the cloud so it
    /// can retire the device record; a failed or unreachable cloud call
    /// is logged but never blocks clearing local state, since an
    /// operator unpairing a stolen device should not depend on network
    /// access.
    pub async fn unpair(&self) -> Result<(), PairingError> {
        let device_id = self
            .auth
            .device_id()
            .ok_or(PairingError::NotPaired)?;

        if let Err(e) = self.notify_cloud_unpair(&device_id).await {
            tracing::warn!(error = %e, "cloud unpair notification failed, clearing local credentials anyway");
        }

        self.auth.clear()?;
        Ok(())
    }

    async fn notify_cloud_unpair(&self, device_id: &str) -> Result<(), PairingError> {
        let signed = self.auth.sign(b"")?;

        let response = self
            .http
            .post(format!("{}/api/v1/devices/unpair", self.server_url))
            .header("X-Device-Id", &signed.device_id)
            .header("X-Timestamp", signed.timestamp.to_string())
            .header("X-Signature", &signed.signature)
            .json(&serde_json::json!({ "device_id": device_id }))
            .send()
            .await
            .map_err(|e| PairingError::Network(e.to_string()))?;

        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PairingError::Cloud(body));
        }

        Ok(())
    }
}

fn hostname_fallback() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "bridge-agent".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::vault::CredentialVault;
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
        fn store(&self, credentials: &Credentials) -> Result<(), crate::auth::AuthError> {
            *self.stored.lock().unwrap() = Some(credentials.clone());
            Ok(())
        }
        fn load(&self) -> Result<Option<Credentials>, crate::auth::AuthError> {
            Ok(self.stored.lock().unwrap().clone())
        }
        fn clear(&self) -> Result<(), crate::auth::AuthError> {
            *self.stored.lock().unwrap() = None;
            Ok(())
        }
    }

    fn pairing_with(auth: Arc<Auth>) -> Pairing {
        Pairing::new(auth, "https://cloud.example.test".to_string())
    }

    #[tokio::test]
    async fn pair_rejects_when_already_paired() {
        let auth = Arc::new(Auth::new(Box::new(MemoryVault::empty())));
        auth.set_credentials(Credentials {
            device_id: "bridge-001".to_string(),
            device_key: vec![1, 2, 3],
            paired_at: Utc::now(),
        })
        .unwrap();

        let pairing = pairing_with(auth);
        let result = pairing.pair("ABC123", Duration::from_secs(1)).await;
        assert!(matches!(result, Err(PairingError::AlreadyPaired)));
    }

    #[tokio::test]
    async fn unpair_rejects_when_not_paired() {
        let auth = Arc::new(Auth::new(Box::new(MemoryVault::empty())));
        let pairing = pairing_with(auth);
        assert!(matches!(pairing.unpair().await, Err(PairingError::NotPaired)));
    }

    #[tokio::test]
    async fn unpair_clears_credentials_even_when_cloud_is_unreachable() {
        let auth = Arc::new(Auth::new(Box::new(MemoryVault::empty())));
        auth.set_credentials(Credentials {
            device_id: "bridge-001".to_string(),
            device_key: vec![1, 2, 3],
            paired_at: Utc::now(),
        })
        .unwrap();

        // server_url points nowhere — the cloud notification will fail,
        // but local credentials must still be cleared.
        let pairing = pairing_with(auth.clone());
        pairing.unpair().await.unwrap();
        assert!(!auth.is_authenticated());
    }
}
