//! Append-only session transcripts
//!
//! One newline-delimited JSON file per session. Every line is a complete
//! event `{seq, ts, kind, ...}`; a torn tail left by a crash is discarded on
//! open by truncating to the last complete line. Full rewrites (compaction)
//! go through a temp file, fsync and rename.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// One transcript event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEvent {
    pub seq: u64,
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: TranscriptKind,
}

/// Typed transcript entries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TranscriptKind {
    UserMessage {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        attachments: Vec<crate::media::MediaRef>,
    },
    AssistantMessage {
        text: String,
    },
    ToolCall {
        call_id: String,
        tool: String,
        params: serde_json::Value,
    },
    ToolResult {
        call_id: String,
        ok: bool,
        content: String,
    },
    SystemNote {
        text: String,
    },
    CompactionMarker {
        summary: String,
        replaced_events: u64,
    },
}

impl TranscriptKind {
    /// Rough token estimate for context budgeting (4 chars ≈ 1 token)
    #[must_use]
    pub fn estimated_tokens(&self) -> usize {
        let chars = match self {
            Self::UserMessage { text, .. }
            | Self::AssistantMessage { text }
            | Self::SystemNote { text } => text.len(),
            Self::ToolCall { params, .. } => params.to_string().len() + 32,
            Self::ToolResult { content, .. } => content.len() + 16,
            Self::CompactionMarker { summary, .. } => summary.len(),
        };
        chars.div_ceil(4)
    }
}

/// Handle to one session's transcript file
pub struct Transcript {
    path: PathBuf,
    next_seq: u64,
}

impl Transcript {
    /// Open a transcript, recovering from a torn tail if present.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be created or truncated.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let next_seq = if path.exists() {
            recover(&path)?
        } else {
            0
        };

        Ok(Self { path, next_seq })
    }

    /// Sequence number the next appended event will receive
    #[must_use]
    pub const fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Append one event, assigning the next sequence number. The line is
    /// flushed and fsynced before returning.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure; the transcript is unchanged in that
    /// case apart from a possibly-torn tail, which the next open discards.
    pub fn append(&mut self, kind: TranscriptKind) -> Result<TranscriptEvent> {
        let event = TranscriptEvent {
            seq: self.next_seq,
            ts: Utc::now(),
            kind,
        };
        let mut line = serde_json::to_string(&event)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.sync_data()?;

        self.next_seq += 1;
        Ok(event)
    }

    /// Append several events as one logical delta
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure; events before the failure point are
    /// durable.
    pub fn append_all(&mut self, kinds: Vec<TranscriptKind>) -> Result<Vec<TranscriptEvent>> {
        let mut out = Vec::with_capacity(kinds.len());
        for kind in kinds {
            out.push(self.append(kind)?);
        }
        Ok(out)
    }

    /// Read every event in order
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be read.
    pub fn read_all(&self) -> Result<Vec<TranscriptEvent>> {
        read_events(&self.path)
    }

    /// Replace the whole transcript atomically (temp file, fsync, rename).
    /// Sequence numbers are reassigned contiguously from zero.
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure; the previous content stays intact
    /// until the rename.
    pub fn rewrite(&mut self, kinds: Vec<TranscriptKind>) -> Result<Vec<TranscriptEvent>> {
        let tmp = self.path.with_extension("jsonl.tmp");
        let mut file = File::create(&tmp)?;
        let mut events = Vec::with_capacity(kinds.len());
        for (seq, kind) in kinds.into_iter().enumerate() {
            let event = TranscriptEvent {
                seq: seq as u64,
                ts: Utc::now(),
                kind,
            };
            let mut line = serde_json::to_string(&event)?;
            line.push('\n');
            file.write_all(line.as_bytes())?;
            events.push(event);
        }
        file.sync_all()?;
        drop(file);
        std::fs::rename(&tmp, &self.path)?;

        self.next_seq = events.len() as u64;
        Ok(events)
    }

    /// Total estimated tokens across the transcript
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be read.
    pub fn estimated_tokens(&self) -> Result<usize> {
        Ok(self
            .read_all()?
            .iter()
            .map(|e| e.kind.estimated_tokens())
            .sum())
    }

    /// Path of the backing file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Scan the file, truncate a torn tail, and return the next sequence number
fn recover(path: &Path) -> Result<u64> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    let mut good_end: u64 = 0;
    let mut next_seq: u64 = 0;
    let mut buf = String::new();
    loop {
        buf.clear();
        let read = reader.read_line(&mut buf)?;
        if read == 0 {
            break;
        }
        if !buf.ends_with('\n') {
            // Torn tail: crash mid-append
            break;
        }
        match serde_json::from_str::<TranscriptEvent>(buf.trim_end()) {
            Ok(event) => {
                good_end += read as u64;
                next_seq = event.seq + 1;
            }
            Err(_) => break,
        }
    }

    let len = std::fs::metadata(path)?.len();
    if good_end < len {
        tracing::warn!(
            path = %path.display(),
            discarded = len - good_end,
            "truncating torn transcript tail"
        );
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(good_end)?;
        let mut file = file;
        file.seek(SeekFrom::End(0))?;
        file.sync_all()?;
    }

    Ok(next_seq)
}

/// Read all events from a transcript file without opening it for writes
///
/// # Errors
///
/// Returns an error when the file cannot be read.
pub fn read_events(path: &Path) -> Result<Vec<TranscriptEvent>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut events = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<TranscriptEvent>(&line) {
            Ok(event) => events.push(event),
            // Unparseable trailing line: treat like a torn tail
            Err(_) => break,
        }
    }
    Ok(events)
}

/// Verify transcript ordering: sequence numbers strictly increasing
///
/// # Errors
///
/// Returns [`Error::Internal`] on an ordering violation.
pub fn check_order(events: &[TranscriptEvent]) -> Result<()> {
    for pair in events.windows(2) {
        if pair[1].seq <= pair[0].seq {
            return Err(Error::Internal(format!(
                "transcript order violation: {} then {}",
                pair[0].seq, pair[1].seq
            )));
        }
    }
    Ok(())
}
