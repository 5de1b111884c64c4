//! Session store
//!
//! Owns the session index (one JSON mapping file, rewritten atomically) and
//! a transcript file per session. Transcripts outlive session records: a
//! delete removes the index entry but keeps the file unless purged.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ThinkingLevel;
use crate::{Error, Result};

use super::transcript::{Transcript, TranscriptEvent};
use super::SessionKey;

/// Per-session overrides applied on top of the agent defaults
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<ThinkingLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_profile: Option<String>,
}

impl SessionOverrides {
    /// Merge `other` into `self`, with `other` winning where set
    pub fn merge(&mut self, other: &Self) {
        if other.model.is_some() {
            self.model.clone_from(&other.model);
        }
        if other.thinking.is_some() {
            self.thinking = other.thinking;
        }
        if other.auth_profile.is_some() {
            self.auth_profile.clone_from(&other.auth_profile);
        }
    }
}

/// Metadata tracked per session in the index
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMeta {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Events before this sequence are outside the live context window
    #[serde(default)]
    pub context_start_seq: u64,
    #[serde(default)]
    pub overrides: SessionOverrides,
    /// Display label for interactive clients
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl SessionMeta {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            created_at: now,
            updated_at: now,
            context_start_seq: 0,
            overrides: SessionOverrides::default(),
            label: None,
        }
    }
}

/// Summary row returned by listings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub key: SessionKey,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub overrides: SessionOverrides,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// Session index + transcript files under one data directory
pub struct SessionStore {
    root: PathBuf,
    index: Mutex<HashMap<String, SessionMeta>>,
}

impl SessionStore {
    /// Open the store, loading the index if present.
    ///
    /// # Errors
    ///
    /// Returns an error when the directory cannot be created or the index
    /// file is unreadable.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join("transcripts"))?;

        let index_path = root.join("sessions.json");
        let index = if index_path.exists() {
            let raw = std::fs::read_to_string(&index_path)?;
            serde_json::from_str(&raw)?
        } else {
            HashMap::new()
        };

        Ok(Self {
            root,
            index: Mutex::new(index),
        })
    }

    /// Fetch metadata, creating the session lazily when absent.
    ///
    /// # Errors
    ///
    /// Returns an error when the index cannot be persisted.
    pub fn get_or_create(&self, key: &SessionKey) -> Result<SessionMeta> {
        let mut guard = self.lock_index()?;
        if let Some(meta) = guard.get(&key.to_string()) {
            return Ok(meta.clone());
        }
        let meta = SessionMeta::new();
        guard.insert(key.to_string(), meta.clone());
        self.persist_index(&guard)?;
        tracing::debug!(session = %key, "session created");
        Ok(meta)
    }

    /// Metadata for an existing session
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for unknown sessions.
    pub fn get(&self, key: &SessionKey) -> Result<SessionMeta> {
        self.lock_index()?
            .get(&key.to_string())
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("session {key}")))
    }

    /// All sessions, most recently updated first
    ///
    /// # Errors
    ///
    /// Returns an error when the index lock is poisoned.
    pub fn list(&self) -> Result<Vec<SessionSummary>> {
        let guard = self.lock_index()?;
        let mut rows: Vec<SessionSummary> = guard
            .iter()
            .filter_map(|(raw, meta)| {
                SessionKey::parse(raw).ok().map(|key| SessionSummary {
                    key,
                    created_at: meta.created_at,
                    updated_at: meta.updated_at,
                    overrides: meta.overrides.clone(),
                    label: meta.label.clone(),
                })
            })
            .collect();
        rows.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(rows)
    }

    /// Merge overrides / label into a session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for unknown sessions.
    pub fn patch(
        &self,
        key: &SessionKey,
        overrides: &SessionOverrides,
        label: Option<String>,
    ) -> Result<SessionMeta> {
        let mut guard = self.lock_index()?;
        let meta = guard
            .get_mut(&key.to_string())
            .ok_or_else(|| Error::NotFound(format!("session {key}")))?;
        meta.overrides.merge(overrides);
        if label.is_some() {
            meta.label = label;
        }
        meta.updated_at = Utc::now();
        let out = meta.clone();
        self.persist_index(&guard)?;
        Ok(out)
    }

    /// Mark session activity and optionally advance the context start
    ///
    /// # Errors
    ///
    /// Returns an error when the index cannot be persisted.
    pub fn touch(&self, key: &SessionKey, context_start_seq: Option<u64>) -> Result<()> {
        let mut guard = self.lock_index()?;
        if let Some(meta) = guard.get_mut(&key.to_string()) {
            meta.updated_at = Utc::now();
            if let Some(seq) = context_start_seq {
                meta.context_start_seq = seq;
            }
            self.persist_index(&guard)?;
        }
        Ok(())
    }

    /// Delete the session record. The transcript file is retained unless
    /// `purge` is set.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for unknown sessions.
    pub fn delete(&self, key: &SessionKey, purge: bool) -> Result<()> {
        let mut guard = self.lock_index()?;
        if guard.remove(&key.to_string()).is_none() {
            return Err(Error::NotFound(format!("session {key}")));
        }
        self.persist_index(&guard)?;
        drop(guard);
        if purge {
            let _ = std::fs::remove_file(self.transcript_path(key));
        }
        tracing::info!(session = %key, purge, "session deleted");
        Ok(())
    }

    /// Start a fresh conversational context: appends a reset note and moves
    /// the context start past it.
    ///
    /// # Errors
    ///
    /// Returns an error when the transcript cannot be appended.
    pub fn reset(&self, key: &SessionKey, reason: &str) -> Result<()> {
        self.get_or_create(key)?;
        let mut transcript = self.open_transcript(key)?;
        transcript.append(super::transcript::TranscriptKind::SystemNote {
            text: format!("conversation reset: {reason}"),
        })?;
        self.touch(key, Some(transcript.next_seq()))?;
        tracing::info!(session = %key, reason, "session reset");
        Ok(())
    }

    /// Open the session's transcript for appending. The lane scheduler
    /// guarantees at most one writer per session.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be opened.
    pub fn open_transcript(&self, key: &SessionKey) -> Result<Transcript> {
        Transcript::open(self.transcript_path(key))
    }

    /// Shared read of the transcript without taking the write path
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be read.
    pub fn read_transcript(&self, key: &SessionKey) -> Result<Vec<TranscriptEvent>> {
        super::transcript::read_events(&self.transcript_path(key))
    }

    /// Last `limit` events, for previews
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be read.
    pub fn preview(&self, key: &SessionKey, limit: usize) -> Result<Vec<TranscriptEvent>> {
        let mut events = self.read_transcript(key)?;
        if events.len() > limit {
            events.drain(..events.len() - limit);
        }
        Ok(events)
    }

    /// Path of the transcript file for a key
    #[must_use]
    pub fn transcript_path(&self, key: &SessionKey) -> PathBuf {
        self.root
            .join("transcripts")
            .join(format!("{}.jsonl", key.file_stem()))
    }

    fn lock_index(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, SessionMeta>>> {
        self.index
            .lock()
            .map_err(|_| Error::Internal("session index lock poisoned".to_string()))
    }

    fn persist_index(&self, index: &HashMap<String, SessionMeta>) -> Result<()> {
        let path = self.root.join("sessions.json");
        let tmp = self.root.join("sessions.json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(index)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::transcript::TranscriptKind;

    fn store() -> (tempfile::TempDir, SessionStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open(dir.path()).unwrap();
        (dir, store)
    }

    fn key() -> SessionKey {
        SessionKey::peer("a1", "x", "acc", "u1")
    }

    #[test]
    fn create_is_lazy_and_idempotent() {
        let (_dir, store) = store();
        let a = store.get_or_create(&key()).unwrap();
        let b = store.get_or_create(&key()).unwrap();
        assert_eq!(a.created_at, b.created_at);
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn index_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = SessionStore::open(dir.path()).unwrap();
            store.get_or_create(&key()).unwrap();
        }
        let store = SessionStore::open(dir.path()).unwrap();
        assert!(store.get(&key()).is_ok());
    }

    #[test]
    fn patch_merges_overrides() {
        let (_dir, store) = store();
        store.get_or_create(&key()).unwrap();
        store
            .patch(
                &key(),
                &SessionOverrides {
                    model: Some("anthropic/claude-haiku-4".to_string()),
                    ..Default::default()
                },
                None,
            )
            .unwrap();
        let meta = store
            .patch(
                &key(),
                &SessionOverrides {
                    thinking: Some(ThinkingLevel::High),
                    ..Default::default()
                },
                Some("support chat".to_string()),
            )
            .unwrap();
        assert_eq!(meta.overrides.model.as_deref(), Some("anthropic/claude-haiku-4"));
        assert_eq!(meta.overrides.thinking, Some(ThinkingLevel::High));
        assert_eq!(meta.label.as_deref(), Some("support chat"));
    }

    #[test]
    fn delete_keeps_transcript_unless_purged() {
        let (_dir, store) = store();
        store.get_or_create(&key()).unwrap();
        let mut t = store.open_transcript(&key()).unwrap();
        t.append(TranscriptKind::UserMessage {
            text: "hi".to_string(),
            from: None,
            attachments: Vec::new(),
        })
        .unwrap();
        let path = store.transcript_path(&key());

        store.delete(&key(), false).unwrap();
        assert!(path.exists());
        assert!(store.get(&key()).is_err());

        store.get_or_create(&key()).unwrap();
        store.delete(&key(), true).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn reset_advances_context_start() {
        let (_dir, store) = store();
        let mut t = store.open_transcript(&key()).unwrap();
        t.append(TranscriptKind::UserMessage {
            text: "old".to_string(),
            from: None,
            attachments: Vec::new(),
        })
        .unwrap();
        drop(t);
        store.reset(&key(), "manual").unwrap();
        let meta = store.get(&key()).unwrap();
        assert_eq!(meta.context_start_seq, 2);
        let events = store.read_transcript(&key()).unwrap();
        assert!(matches!(
            events.last().unwrap().kind,
            TranscriptKind::SystemNote { .. }
        ));
    }

    #[test]
    fn preview_returns_tail() {
        let (_dir, store) = store();
        let mut t = store.open_transcript(&key()).unwrap();
        for i in 0..10 {
            t.append(TranscriptKind::UserMessage {
                text: format!("m{i}"),
                from: None,
                attachments: Vec::new(),
            })
            .unwrap();
        }
        let tail = store.preview(&key(), 3).unwrap();
        assert_eq!(tail.len(), 3);
        assert_eq!(tail[0].seq, 7);
    }
}
