//! Run event stream
//!
//! Each run emits a finite sequence of events with strictly monotonic,
//! contiguous sequence numbers. Text deltas are coalesced so at most one
//! delta every 150 ms reaches subscribers.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::ErrorBody;
use crate::events::{EventBus, GatewayEvent};
use crate::session::SessionKey;

/// Minimum spacing between text-delta emissions per run
pub const DELTA_COALESCE_INTERVAL: Duration = Duration::from_millis(150);

/// Typed run event payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEventKind {
    /// Phase transition (`started`, `compacting`, `calling_model`, ...)
    Lifecycle { phase: String },
    /// Extended-thinking fragment
    Thought { text: String },
    /// Coalesced assistant text fragment
    TextDelta { text: String },
    /// Tool dispatch; `approval_id` set when gated
    ToolCall {
        call_id: String,
        tool: String,
        params: serde_json::Value,
        needs_approval: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        approval_id: Option<Uuid>,
    },
    /// Tool completion
    ToolResult {
        call_id: String,
        ok: bool,
        content: String,
    },
    /// Run failed; `partial` marks already-streamed output
    Error { error: ErrorBody, partial: bool },
    /// Run finished
    Final { reason: String, text: String },
}

impl RunEventKind {
    /// Critical events are never dropped under backpressure
    #[must_use]
    pub const fn is_critical(&self) -> bool {
        matches!(
            self,
            Self::Lifecycle { .. } | Self::Error { .. } | Self::Final { .. }
        )
    }
}

/// One sequenced run event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    pub run_id: Uuid,
    pub session_key: SessionKey,
    pub seq: u64,
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: RunEventKind,
}

/// Per-run event emitter: assigns sequence numbers, coalesces deltas, and
/// publishes to the bus.
pub struct RunEventSink {
    run_id: Uuid,
    session_key: SessionKey,
    bus: Arc<EventBus>,
    next_seq: u64,
    pending_delta: String,
    last_delta_flush: Instant,
    terminal_emitted: bool,
}

impl RunEventSink {
    /// Sink for one run
    #[must_use]
    pub fn new(run_id: Uuid, session_key: SessionKey, bus: Arc<EventBus>) -> Self {
        Self {
            run_id,
            session_key,
            bus,
            next_seq: 0,
            pending_delta: String::new(),
            last_delta_flush: Instant::now()
                .checked_sub(DELTA_COALESCE_INTERVAL)
                .unwrap_or_else(Instant::now),
            terminal_emitted: false,
        }
    }

    /// Emit a non-delta event, flushing any pending delta first so ordering
    /// is preserved.
    pub fn emit(&mut self, kind: RunEventKind) {
        if self.terminal_emitted {
            tracing::debug!(run = %self.run_id, "event after terminal suppressed");
            return;
        }
        self.flush_delta();
        if matches!(kind, RunEventKind::Final { .. } | RunEventKind::Error { .. }) {
            self.terminal_emitted = true;
        }
        self.publish(kind);
    }

    /// Buffer a text delta; emits at most once per coalescing interval
    pub fn push_delta(&mut self, text: &str) {
        if self.terminal_emitted {
            return;
        }
        self.pending_delta.push_str(text);
        if self.last_delta_flush.elapsed() >= DELTA_COALESCE_INTERVAL {
            self.flush_delta();
        }
    }

    /// Force any buffered delta out
    pub fn flush_delta(&mut self) {
        if self.pending_delta.is_empty() {
            return;
        }
        let text = std::mem::take(&mut self.pending_delta);
        self.last_delta_flush = Instant::now();
        self.publish(RunEventKind::TextDelta { text });
    }

    /// Sequence number the next event will carry
    #[must_use]
    pub const fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Whether a terminal event has been emitted
    #[must_use]
    pub const fn is_terminated(&self) -> bool {
        self.terminal_emitted
    }

    fn publish(&mut self, kind: RunEventKind) {
        let event = RunEvent {
            run_id: self.run_id,
            session_key: self.session_key.clone(),
            seq: self.next_seq,
            ts: Utc::now(),
            kind,
        };
        self.next_seq += 1;
        self.bus.publish(GatewayEvent::Agent(event));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::ScopeSet;

    fn sink_with_sub() -> (RunEventSink, crate::events::Subscription) {
        let bus = Arc::new(EventBus::new());
        let sub = bus.subscribe("c1", ScopeSet::admin(), 1024 * 1024);
        let sink = RunEventSink::new(
            Uuid::new_v4(),
            SessionKey::peer("a1", "x", "acc", "u1"),
            bus,
        );
        (sink, sub)
    }

    fn drain(sub: &crate::events::Subscription) -> Vec<GatewayEvent> {
        let mut out = Vec::new();
        while let Some(e) = sub.try_next() {
            out.push(e.event);
        }
        out
    }

    #[tokio::test]
    async fn seq_is_contiguous_and_monotonic() {
        let (mut sink, sub) = sink_with_sub();
        sink.emit(RunEventKind::Lifecycle {
            phase: "started".to_string(),
        });
        sink.push_delta("hello");
        sink.flush_delta();
        sink.emit(RunEventKind::Final {
            reason: "completed".to_string(),
            text: "hello".to_string(),
        });

        let seqs: Vec<u64> = drain(&sub)
            .into_iter()
            .filter_map(|e| match e {
                GatewayEvent::Agent(e) => Some(e.seq),
                _ => None,
            })
            .collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn deltas_are_coalesced_within_interval() {
        let (mut sink, sub) = sink_with_sub();
        // First delta flushes immediately (interval already elapsed)
        sink.push_delta("a");
        // These land in the same window and stay buffered
        sink.push_delta("b");
        sink.push_delta("c");
        sink.flush_delta();

        let texts: Vec<String> = drain(&sub)
            .into_iter()
            .filter_map(|e| match e {
                GatewayEvent::Agent(RunEvent {
                    kind: RunEventKind::TextDelta { text },
                    ..
                }) => Some(text),
                _ => None,
            })
            .collect();
        assert_eq!(texts, vec!["a".to_string(), "bc".to_string()]);
    }

    #[tokio::test]
    async fn nothing_after_terminal() {
        let (mut sink, sub) = sink_with_sub();
        sink.emit(RunEventKind::Final {
            reason: "completed".to_string(),
            text: String::new(),
        });
        sink.emit(RunEventKind::Lifecycle {
            phase: "late".to_string(),
        });
        sink.push_delta("late");
        sink.flush_delta();

        assert_eq!(drain(&sub).len(), 1);
        assert!(sink.is_terminated());
    }

    #[test]
    fn critical_classification() {
        assert!(RunEventKind::Final {
            reason: "completed".to_string(),
            text: String::new()
        }
        .is_critical());
        assert!(!RunEventKind::TextDelta {
            text: "x".to_string()
        }
        .is_critical());
    }
}
