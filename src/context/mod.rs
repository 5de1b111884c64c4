//! Prompt assembly
//!
//! Builds the layered system prompt, formats the normalized envelope header
//! and converts transcript history into model messages with a token budget.

pub mod compaction;

use crate::llm::{ChatMessage, Role};
use crate::routing::Envelope;
use crate::session::transcript::{TranscriptEvent, TranscriptKind};

/// Layered system prompt: global base, domain overlay, agent persona,
/// active skill instructions. Empty layers are skipped.
#[must_use]
pub fn assemble_system_prompt(
    base: &str,
    overlay: &str,
    persona: &str,
    skills: &[String],
) -> String {
    let mut layers: Vec<&str> = Vec::new();
    if !base.trim().is_empty() {
        layers.push(base.trim());
    }
    if !overlay.trim().is_empty() {
        layers.push(overlay.trim());
    }
    if !persona.trim().is_empty() {
        layers.push(persona.trim());
    }
    let skills_joined;
    if !skills.is_empty() {
        skills_joined = skills.join("\n\n");
        layers.push(&skills_joined);
    }
    layers.join("\n\n")
}

/// Normalized envelope header prepended to the user text:
/// `[{channel} {from} {timestamp}] {body}`
#[must_use]
pub fn format_envelope(envelope: &Envelope) -> String {
    format!(
        "[{} {} {}] {}",
        envelope.channel,
        envelope.from_display,
        envelope.timestamp.format("%Y-%m-%d %H:%M"),
        envelope.text
    )
}

/// Convert transcript history (from `context_start_seq` on) into model
/// messages. Tool calls and results are replayed so the model sees its own
/// prior actions; system notes become system messages.
#[must_use]
pub fn history_messages(events: &[TranscriptEvent], context_start_seq: u64) -> Vec<ChatMessage> {
    let mut messages = Vec::new();
    for event in events.iter().filter(|e| e.seq >= context_start_seq) {
        match &event.kind {
            TranscriptKind::UserMessage { text, from, .. } => {
                let content = match from {
                    Some(from) => format!("[{from}] {text}"),
                    None => text.clone(),
                };
                messages.push(ChatMessage::text(Role::User, content));
            }
            TranscriptKind::AssistantMessage { text } => {
                messages.push(ChatMessage::text(Role::Assistant, text.clone()));
            }
            TranscriptKind::ToolCall {
                call_id,
                tool,
                params,
            } => {
                let mut msg = ChatMessage::text(Role::Assistant, String::new());
                msg.tool_calls.push(crate::llm::ToolCallRequest {
                    id: call_id.clone(),
                    name: tool.clone(),
                    params: params.clone(),
                });
                messages.push(msg);
            }
            TranscriptKind::ToolResult {
                call_id, content, ..
            } => {
                messages.push(ChatMessage::tool_result(call_id.clone(), content.clone()));
            }
            TranscriptKind::SystemNote { text }
            | TranscriptKind::CompactionMarker { summary: text, .. } => {
                messages.push(ChatMessage::text(Role::System, text.clone()));
            }
        }
    }
    messages
}

/// Token estimate over a set of events
#[must_use]
pub fn estimate_tokens(events: &[TranscriptEvent]) -> usize {
    events.iter().map(|e| e.kind.estimated_tokens()).sum()
}
