//! Content-addressed media store
//!
//! Attachments are stored under their SHA-256 hash with a JSON sidecar
//! carrying content type, size and TTL. Writes are idempotent; a sweep
//! removes entries whose TTL has lapsed.

pub mod fetch;

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::MediaConfig;
use crate::{Error, Result};

/// Reference to a stored attachment, carried inside envelopes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    /// SHA-256 of the content, hex
    pub hash: String,
    pub content_type: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

/// Sidecar metadata persisted next to each blob
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Sidecar {
    content_type: String,
    size: u64,
    created_at: DateTime<Utc>,
    ttl_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    filename: Option<String>,
}

/// Content-addressed attachment storage
pub struct MediaStore {
    root: PathBuf,
    config: MediaConfig,
}

impl MediaStore {
    /// Open (creating if needed) a store rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns an error when the directory cannot be created.
    pub fn open(root: impl Into<PathBuf>, config: MediaConfig) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root, config })
    }

    /// Store a blob, returning its reference. Re-storing identical content
    /// is a no-op apart from refreshing the sidecar timestamp.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure.
    pub fn put(
        &self,
        data: &[u8],
        content_type: &str,
        filename: Option<&str>,
    ) -> Result<MediaRef> {
        let hash = content_hash(data);
        let blob_path = self.blob_path(&hash);

        if !blob_path.exists() {
            let tmp = blob_path.with_extension("tmp");
            std::fs::write(&tmp, data)?;
            std::fs::rename(&tmp, &blob_path)?;
        }

        let sidecar = Sidecar {
            content_type: content_type.to_string(),
            size: data.len() as u64,
            created_at: Utc::now(),
            ttl_secs: self.config.ttl_secs,
            filename: filename.map(String::from),
        };
        let tmp = self.sidecar_path(&hash).with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec(&sidecar)?)?;
        std::fs::rename(&tmp, self.sidecar_path(&hash))?;

        tracing::debug!(hash = %hash, size = data.len(), "media stored");

        Ok(MediaRef {
            hash,
            content_type: content_type.to_string(),
            size: data.len() as u64,
            filename: filename.map(String::from),
        })
    }

    /// Read a blob back by hash.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for unknown or expired entries.
    pub fn get(&self, hash: &str) -> Result<(Vec<u8>, MediaRef)> {
        let sidecar = self.read_sidecar(hash)?;
        let data = std::fs::read(self.blob_path(hash))
            .map_err(|_| Error::NotFound(format!("media {hash}")))?;
        Ok((
            data,
            MediaRef {
                hash: hash.to_string(),
                content_type: sidecar.content_type,
                size: sidecar.size,
                filename: sidecar.filename,
            },
        ))
    }

    /// Whether a blob with this hash exists
    #[must_use]
    pub fn contains(&self, hash: &str) -> bool {
        self.blob_path(hash).exists()
    }

    /// Remove entries whose TTL has elapsed; returns the number removed.
    ///
    /// # Errors
    ///
    /// Returns an error when the store directory cannot be listed.
    pub fn sweep_expired(&self) -> Result<usize> {
        let now = Utc::now();
        let mut removed = 0;
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(hash) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let Ok(sidecar) = self.read_sidecar(hash) else {
                continue;
            };
            let age = now - sidecar.created_at;
            if age.num_seconds() >= 0 && (age.num_seconds() as u64) >= sidecar.ttl_secs {
                let _ = std::fs::remove_file(self.blob_path(hash));
                let _ = std::fs::remove_file(self.sidecar_path(hash));
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!(removed, "media sweep removed expired entries");
        }
        Ok(removed)
    }

    /// Store configuration
    #[must_use]
    pub const fn config(&self) -> &MediaConfig {
        &self.config
    }

    fn read_sidecar(&self, hash: &str) -> Result<Sidecar> {
        let raw = std::fs::read_to_string(self.sidecar_path(hash))
            .map_err(|_| Error::NotFound(format!("media {hash}")))?;
        Ok(serde_json::from_str(&raw)?)
    }

    fn blob_path(&self, hash: &str) -> PathBuf {
        self.root.join(hash)
    }

    fn sidecar_path(&self, hash: &str) -> PathBuf {
        self.root.join(format!("{hash}.json"))
    }
}

/// SHA-256 of content, hex-encoded
#[must_use]
pub fn content_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Validate a hex content hash before using it as a file name
#[must_use]
pub fn is_valid_hash(hash: &str) -> bool {
    hash.len() == 64 && hash.chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, MediaStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = MediaStore::open(dir.path(), MediaConfig::default()).unwrap();
        (dir, store)
    }

    #[test]
    fn put_get_round_trip() {
        let (_dir, store) = store();
        let r = store.put(b"hello", "text/plain", Some("hi.txt")).unwrap();
        assert!(is_valid_hash(&r.hash));
        let (data, meta) = store.get(&r.hash).unwrap();
        assert_eq!(data, b"hello");
        assert_eq!(meta.content_type, "text/plain");
        assert_eq!(meta.filename.as_deref(), Some("hi.txt"));
    }

    #[test]
    fn put_is_idempotent() {
        let (_dir, store) = store();
        let a = store.put(b"same", "text/plain", None).unwrap();
        let b = store.put(b"same", "text/plain", None).unwrap();
        assert_eq!(a.hash, b.hash);
    }

    #[test]
    fn get_unknown_is_not_found() {
        let (_dir, store) = store();
        let missing = "0".repeat(64);
        assert!(matches!(store.get(&missing), Err(Error::NotFound(_))));
    }

    #[test]
    fn sweep_removes_expired_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = MediaStore::open(
            dir.path(),
            MediaConfig {
                ttl_secs: 0,
                ..Default::default()
            },
        )
        .unwrap();
        let r = store.put(b"old", "text/plain", None).unwrap();
        let removed = store.sweep_expired().unwrap();
        assert_eq!(removed, 1);
        assert!(!store.contains(&r.hash));
    }

    #[test]
    fn hash_is_stable() {
        assert_eq!(content_hash(b"abc"), content_hash(b"abc"));
        assert_ne!(content_hash(b"abc"), content_hash(b"abd"));
    }
}
