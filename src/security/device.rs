//! Device identity and signed handshakes
//!
//! Devices authenticate with an Ed25519 keypair. The device id is a
//! truncated SHA-256 of the public key; the handshake signature covers
//! `"{device_id}:{signed_at}"` and is only valid within a small clock skew.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use base64::Engine as _;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{Error, Result};

/// Device id length in hex characters (128 bits)
const DEVICE_ID_LENGTH: usize = 32;

/// Accepted skew between `signed_at` and server time
const HANDSHAKE_SKEW_SECS: i64 = 60;

/// A device identity: keypair plus metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Truncated SHA-256 of the public key, hex
    pub device_id: String,
    /// Ed25519 public key, base64
    pub public_key: String,
    /// Ed25519 private key, base64; absent on shared copies
    #[serde(skip_serializing_if = "Option::is_none")]
    secret_key: Option<String>,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl DeviceIdentity {
    /// Generate a fresh identity
    #[must_use]
    pub fn generate(name: &str) -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();
        let public_key_bytes = verifying_key.as_bytes();

        Self {
            device_id: compute_device_id(public_key_bytes),
            public_key: b64(public_key_bytes),
            secret_key: Some(b64(signing_key.as_bytes())),
            name: name.to_string(),
            created_at: Utc::now(),
        }
    }

    /// Public-only identity from parts presented by a remote device
    #[must_use]
    pub fn from_public(device_id: &str, public_key: &str, name: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            public_key: public_key.to_string(),
            secret_key: None,
            name: name.to_string(),
            created_at: Utc::now(),
        }
    }

    /// Sign a handshake payload for `signed_at`.
    ///
    /// # Errors
    ///
    /// Returns an error when the identity carries no secret key.
    pub fn sign_handshake(&self, signed_at: DateTime<Utc>) -> Result<String> {
        let secret = self
            .secret_key
            .as_ref()
            .ok_or_else(|| Error::Unauthorized("identity has no secret key".to_string()))?;
        let key_bytes = b64d(secret)?;
        let signing_key = SigningKey::try_from(key_bytes.as_slice())
            .map_err(|e| Error::Unauthorized(format!("invalid secret key: {e}")))?;
        let payload = handshake_payload(&self.device_id, signed_at);
        Ok(b64(&signing_key.sign(payload.as_bytes()).to_bytes()))
    }

    /// Public-only copy for sharing
    #[must_use]
    pub fn public_only(&self) -> Self {
        Self {
            device_id: self.device_id.clone(),
            public_key: self.public_key.clone(),
            secret_key: None,
            name: self.name.clone(),
            created_at: self.created_at,
        }
    }
}

/// Handshake credentials presented in a `hello` frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceAuth {
    pub id: String,
    pub public_key: String,
    pub signature: String,
    pub signed_at: DateTime<Utc>,
}

/// Verify a device handshake: key-id binding, skew window, signature.
///
/// # Errors
///
/// Returns [`Error::Unauthorized`] on any verification failure; the message
/// never reveals which step failed.
pub fn verify_handshake(auth: &DeviceAuth, now: DateTime<Utc>) -> Result<()> {
    let fail = || Error::Unauthorized("device handshake rejected".to_string());

    // Device id must be derived from the presented key
    let key_bytes = b64d(&auth.public_key).map_err(|_| fail())?;
    if compute_device_id(&key_bytes) != auth.id {
        return Err(fail());
    }

    let skew = (now - auth.signed_at).num_seconds().abs();
    if skew > HANDSHAKE_SKEW_SECS {
        return Err(fail());
    }

    let verifying_key = VerifyingKey::try_from(key_bytes.as_slice()).map_err(|_| fail())?;
    let sig_bytes = b64d(&auth.signature).map_err(|_| fail())?;
    let signature = Signature::try_from(sig_bytes.as_slice()).map_err(|_| fail())?;

    let payload = handshake_payload(&auth.id, auth.signed_at);
    verifying_key
        .verify(payload.as_bytes(), &signature)
        .map_err(|_| fail())
}

/// Registry of devices trusted through pairing
pub struct DeviceRegistry {
    path: PathBuf,
    devices: Mutex<HashMap<String, DeviceIdentity>>,
}

impl DeviceRegistry {
    /// Open the registry file (missing file is an empty registry).
    ///
    /// # Errors
    ///
    /// Returns an error when an existing file cannot be parsed.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let devices = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str(&raw)?
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            devices: Mutex::new(devices),
        })
    }

    /// Trust a device (post-pairing)
    ///
    /// # Errors
    ///
    /// Returns an error when persistence fails.
    pub fn trust(&self, identity: DeviceIdentity) -> Result<()> {
        let mut guard = self.lock()?;
        guard.insert(identity.device_id.clone(), identity.public_only());
        self.persist(&guard)
    }

    /// Remove a trusted device
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for unknown devices.
    pub fn revoke(&self, device_id: &str) -> Result<()> {
        let mut guard = self.lock()?;
        if guard.remove(device_id).is_none() {
            return Err(Error::NotFound(format!("device {device_id}")));
        }
        self.persist(&guard)
    }

    /// Is this device trusted?
    #[must_use]
    pub fn is_trusted(&self, device_id: &str) -> bool {
        self.lock().map(|g| g.contains_key(device_id)).unwrap_or(false)
    }

    /// Is this device trusted under exactly this public key? Trust pins the
    /// key, so a stolen device id with a fresh keypair stays out.
    #[must_use]
    pub fn is_trusted_key(&self, device_id: &str, public_key: &str) -> bool {
        self.lock()
            .map(|g| {
                g.get(device_id)
                    .is_some_and(|d| super::constant_time_eq(
                        d.public_key.as_bytes(),
                        public_key.as_bytes(),
                    ))
            })
            .unwrap_or(false)
    }

    /// All trusted devices
    ///
    /// # Errors
    ///
    /// Returns an error when the registry lock is poisoned.
    pub fn list(&self) -> Result<Vec<DeviceIdentity>> {
        Ok(self.lock()?.values().cloned().collect())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, DeviceIdentity>>> {
        self.devices
            .lock()
            .map_err(|_| Error::Internal("device registry lock poisoned".to_string()))
    }

    fn persist(&self, devices: &HashMap<String, DeviceIdentity>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(devices)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn handshake_payload(device_id: &str, signed_at: DateTime<Utc>) -> String {
    format!("{device_id}:{}", signed_at.timestamp())
}

fn compute_device_id(public_key: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(public_key);
    hex::encode(&hasher.finalize()[..DEVICE_ID_LENGTH / 2])
}

fn b64(data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(data)
}

fn b64d(data: &str) -> Result<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|e| Error::Unauthorized(format!("invalid base64: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth_for(identity: &DeviceIdentity, signed_at: DateTime<Utc>) -> DeviceAuth {
        DeviceAuth {
            id: identity.device_id.clone(),
            public_key: identity.public_key.clone(),
            signature: identity.sign_handshake(signed_at).unwrap(),
            signed_at,
        }
    }

    #[test]
    fn handshake_round_trip() {
        let identity = DeviceIdentity::generate("laptop");
        let now = Utc::now();
        let auth = auth_for(&identity, now);
        assert!(verify_handshake(&auth, now).is_ok());
    }

    #[test]
    fn stale_handshake_is_rejected() {
        let identity = DeviceIdentity::generate("laptop");
        let signed_at = Utc::now() - chrono::Duration::minutes(5);
        let auth = auth_for(&identity, signed_at);
        assert!(verify_handshake(&auth, Utc::now()).is_err());
    }

    #[test]
    fn mismatched_device_id_is_rejected() {
        let identity = DeviceIdentity::generate("laptop");
        let other = DeviceIdentity::generate("phone");
        let now = Utc::now();
        let mut auth = auth_for(&identity, now);
        auth.id = other.device_id;
        assert!(verify_handshake(&auth, now).is_err());
    }

    #[test]
    fn tampered_signature_is_rejected() {
        let identity = DeviceIdentity::generate("laptop");
        let now = Utc::now();
        let mut auth = auth_for(&identity, now);
        auth.signature = b64(&[0u8; 64]);
        assert!(verify_handshake(&auth, now).is_err());
    }

    #[test]
    fn registry_trust_and_revoke() {
        let dir = tempfile::tempdir().unwrap();
        let registry = DeviceRegistry::open(dir.path().join("devices.json")).unwrap();
        let identity = DeviceIdentity::generate("laptop");
        registry.trust(identity.clone()).unwrap();
        assert!(registry.is_trusted(&identity.device_id));
        registry.revoke(&identity.device_id).unwrap();
        assert!(!registry.is_trusted(&identity.device_id));
        assert!(registry.revoke(&identity.device_id).is_err());
    }

    #[test]
    fn registry_persists_public_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devices.json");
        {
            let registry = DeviceRegistry::open(&path).unwrap();
            registry.trust(DeviceIdentity::generate("laptop")).unwrap();
        }
        let registry = DeviceRegistry::open(&path).unwrap();
        let devices = registry.list().unwrap();
        assert_eq!(devices.len(), 1);
        assert!(devices[0].secret_key.is_none());
    }
}
