//! DM pairing
//!
//! Under the `pairing` DM policy an unknown peer receives a short-lived
//! numeric code; replying with the code pairs the peer for that channel.
//! Paired peers persist across restarts.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

use super::constant_time_eq;

/// Pairing code length, digits only for easy entry
const PAIRING_CODE_LENGTH: usize = 6;

/// Pairing code validity window
const PAIRING_CODE_EXPIRY_MINUTES: i64 = 10;

/// A peer admitted through pairing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairedPeer {
    pub peer: String,
    pub channel: String,
    pub paired_at: DateTime<Utc>,
}

/// Outstanding pairing challenge
#[derive(Debug, Clone)]
struct PendingPairing {
    code: String,
    expires_at: DateTime<Utc>,
}

/// Tracks paired peers and outstanding codes
pub struct PairingManager {
    path: PathBuf,
    paired: Mutex<Vec<PairedPeer>>,
    pending: Mutex<HashMap<(String, String), PendingPairing>>,
}

impl PairingManager {
    /// Open the manager, loading paired peers from disk.
    ///
    /// # Errors
    ///
    /// Returns an error when an existing file cannot be parsed.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let paired = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str(&raw)?
        } else {
            Vec::new()
        };
        Ok(Self {
            path,
            paired: Mutex::new(paired),
            pending: Mutex::new(HashMap::new()),
        })
    }

    /// Is this peer already paired on the channel?
    #[must_use]
    pub fn is_paired(&self, channel: &str, peer: &str) -> bool {
        self.paired
            .lock()
            .map(|g| g.iter().any(|p| p.channel == channel && p.peer == peer))
            .unwrap_or(false)
    }

    /// Issue (or reuse) a pairing code for an unknown peer. Returns `None`
    /// when the peer is already paired.
    ///
    /// # Errors
    ///
    /// Returns an error when internal locks are poisoned.
    pub fn begin(&self, channel: &str, peer: &str) -> Result<Option<String>> {
        if self.is_paired(channel, peer) {
            return Ok(None);
        }
        let mut pending = self.lock_pending()?;
        let key = (channel.to_string(), peer.to_string());
        let now = Utc::now();

        if let Some(existing) = pending.get(&key) {
            if existing.expires_at > now {
                return Ok(Some(existing.code.clone()));
            }
        }

        let code = generate_code(PAIRING_CODE_LENGTH);
        pending.insert(
            key,
            PendingPairing {
                code: code.clone(),
                expires_at: now + Duration::minutes(PAIRING_CODE_EXPIRY_MINUTES),
            },
        );
        tracing::info!(channel, peer, "pairing code issued");
        Ok(Some(code))
    }

    /// Try to redeem a pairing code. Constant-time compare; expired codes
    /// never match.
    ///
    /// # Errors
    ///
    /// Returns an error when persistence fails.
    pub fn verify(&self, channel: &str, peer: &str, code: &str) -> Result<bool> {
        let key = (channel.to_string(), peer.to_string());
        let now = Utc::now();

        let matched = {
            let mut pending = self.lock_pending()?;
            match pending.get(&key) {
                Some(p) if p.expires_at > now
                    && constant_time_eq(p.code.as_bytes(), code.trim().as_bytes()) =>
                {
                    pending.remove(&key);
                    true
                }
                _ => false,
            }
        };

        if matched {
            let mut paired = self.lock_paired()?;
            paired.push(PairedPeer {
                peer: peer.to_string(),
                channel: channel.to_string(),
                paired_at: now,
            });
            self.persist(&paired)?;
            tracing::info!(channel, peer, "peer paired");
        }
        Ok(matched)
    }

    /// Drop a paired peer
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] when the peer is not paired.
    pub fn unpair(&self, channel: &str, peer: &str) -> Result<()> {
        let mut paired = self.lock_paired()?;
        let before = paired.len();
        paired.retain(|p| !(p.channel == channel && p.peer == peer));
        if paired.len() == before {
            return Err(Error::NotFound(format!("pairing {channel}/{peer}")));
        }
        self.persist(&paired)
    }

    /// All paired peers
    ///
    /// # Errors
    ///
    /// Returns an error when internal locks are poisoned.
    pub fn list(&self) -> Result<Vec<PairedPeer>> {
        Ok(self.lock_paired()?.clone())
    }

    fn lock_paired(&self) -> Result<std::sync::MutexGuard<'_, Vec<PairedPeer>>> {
        self.paired
            .lock()
            .map_err(|_| Error::Internal("pairing lock poisoned".to_string()))
    }

    fn lock_pending(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<(String, String), PendingPairing>>> {
        self.pending
            .lock()
            .map_err(|_| Error::Internal("pairing lock poisoned".to_string()))
    }

    fn persist(&self, paired: &[PairedPeer]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(paired)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// Random numeric code
fn generate_code(length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length).map(|_| rng.gen_range(0..10).to_string()).collect()
}
