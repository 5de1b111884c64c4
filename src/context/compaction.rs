//! Transcript compaction
//!
//! When a session's token estimate exceeds its threshold, the transcript
//! head is split into ratio-sized chunks, each chunk is summarized through
//! the same provider path as runs, and the head is replaced by compaction
//! markers. The preserved tail always contains the last user turn and the
//! last assistant turn verbatim.

use async_trait::async_trait;

use crate::session::transcript::{TranscriptEvent, TranscriptKind};
use crate::{Error, Result};

/// Trigger multiplier over the context window
pub const TRIGGER_RATIO: f64 = 1.2;

/// Preferred chunk share of the remaining head
pub const BASE_CHUNK_RATIO: f64 = 0.4;

/// Floor on chunk share of the total
pub const MIN_CHUNK_RATIO: f64 = 0.15;

/// Summarizes one chunk of conversation; implemented over the live
/// provider/profile selection.
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Produce a compact summary preserving tool outputs that influenced
    /// state, unresolved questions, and open plans.
    async fn summarize(&self, text: &str) -> Result<String>;
}

/// Should this transcript be compacted before the next model call?
#[must_use]
pub fn needs_compaction(estimated_tokens: usize, context_window_tokens: usize) -> bool {
    (estimated_tokens as f64) >= (context_window_tokens as f64) * TRIGGER_RATIO
}

/// Result of a compaction pass
#[derive(Debug)]
pub struct CompactionOutcome {
    /// Replacement transcript events
    pub events: Vec<TranscriptKind>,
    pub tokens_before: usize,
    pub tokens_after: usize,
    pub chunks_summarized: usize,
}

/// Compact a transcript.
///
/// # Errors
///
/// Returns [`Error::CompactionIneffective`] when the rewritten transcript
/// does not reduce the token estimate, and propagates summarizer failures.
pub async fn compact(
    session: &str,
    events: &[TranscriptEvent],
    summarizer: &dyn Summarizer,
) -> Result<CompactionOutcome> {
    let tokens_before: usize = events.iter().map(|e| e.kind.estimated_tokens()).sum();

    let tail_start = preserved_tail_start(events);
    if tail_start == 0 {
        return Err(Error::CompactionIneffective(session.to_string()));
    }
    let (head, tail) = events.split_at(tail_start);

    // Ratio-sized chunks over the head
    let head_tokens: usize = head.iter().map(|e| e.kind.estimated_tokens()).sum();
    let min_chunk = ((tokens_before as f64) * MIN_CHUNK_RATIO) as usize;
    let chunks = chunk_head(head, head_tokens, min_chunk);

    let mut replacement: Vec<TranscriptKind> = Vec::new();
    let mut chunks_summarized = 0;
    for chunk in &chunks {
        let text = render_chunk(chunk);
        let summary = summarizer.summarize(&text).await?;
        replacement.push(TranscriptKind::CompactionMarker {
            summary,
            replaced_events: chunk.len() as u64,
        });
        chunks_summarized += 1;
    }
    replacement.extend(tail.iter().map(|e| e.kind.clone()));

    let tokens_after: usize = replacement.iter().map(TranscriptKind::estimated_tokens).sum();
    if tokens_after >= tokens_before {
        return Err(Error::CompactionIneffective(session.to_string()));
    }

    tracing::info!(
        session,
        tokens_before,
        tokens_after,
        chunks_summarized,
        "transcript compacted"
    );

    Ok(CompactionOutcome {
        events: replacement,
        tokens_before,
        tokens_after,
        chunks_summarized,
    })
}

/// Index where the preserved tail begins: from the last user turn onward,
/// and never past the last assistant turn.
fn preserved_tail_start(events: &[TranscriptEvent]) -> usize {
    let last_user = events
        .iter()
        .rposition(|e| matches!(e.kind, TranscriptKind::UserMessage { .. }));
    let last_assistant = events
        .iter()
        .rposition(|e| matches!(e.kind, TranscriptKind::AssistantMessage { .. }));

    match (last_user, last_assistant) {
        (Some(u), Some(a)) => u.min(a),
        (Some(i), None) | (None, Some(i)) => i,
        (None, None) => 0,
    }
}

/// Split the head into chunks of roughly `BASE_CHUNK_RATIO × remaining`
/// tokens, never below `min_chunk` except for the final remainder.
fn chunk_head<'a>(
    head: &'a [TranscriptEvent],
    head_tokens: usize,
    min_chunk: usize,
) -> Vec<&'a [TranscriptEvent]> {
    let mut chunks = Vec::new();
    let mut start = 0;
    let mut remaining_tokens = head_tokens;

    while start < head.len() {
        let target = (((remaining_tokens as f64) * BASE_CHUNK_RATIO) as usize).max(min_chunk);
        let mut acc = 0;
        let mut end = start;
        while end < head.len() && (acc < target || end == start) {
            acc += head[end].kind.estimated_tokens();
            end += 1;
        }
        chunks.push(&head[start..end]);
        remaining_tokens = remaining_tokens.saturating_sub(acc);
        start = end;
    }

    chunks
}

/// Flatten a chunk into text for the summarizer
fn render_chunk(chunk: &[TranscriptEvent]) -> String {
    chunk
        .iter()
        .map(|e| match &e.kind {
            TranscriptKind::UserMessage { text, from, .. } => {
                format!("user({}): {text}", from.as_deref().unwrap_or("-"))
            }
            TranscriptKind::AssistantMessage { text } => format!("assistant: {text}"),
            TranscriptKind::ToolCall { tool, params, .. } => {
                format!("tool_call {tool}: {params}")
            }
            TranscriptKind::ToolResult { ok, content, .. } => {
                format!("tool_result(ok={ok}): {content}")
            }
            TranscriptKind::SystemNote { text } => format!("note: {text}"),
            TranscriptKind::CompactionMarker { summary, .. } => {
                format!("earlier summary: {summary}")
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}
