//! Lane state
//!
//! One lane per session key: a FIFO queue of envelopes plus at most one
//! active run. The state machine is `idle → queued → running → aborting`
//! with eviction after an idle window.

use std::collections::VecDeque;
use std::time::Instant;

use tokio::sync::watch;
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::routing::Envelope;

/// Lane lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaneState {
    Idle,
    Queued,
    Running,
    Aborting,
}

/// An envelope waiting in a lane
#[derive(Debug, Clone)]
pub struct QueuedEnvelope {
    pub envelope: Envelope,
    pub enqueued_at: Instant,
}

/// The run a lane currently owns
pub struct ActiveRun {
    pub run_id: Uuid,
    pub cancel: CancelToken,
    /// Resolves to true when the run finishes
    pub done_rx: watch::Receiver<bool>,
    pub done_tx: watch::Sender<bool>,
}

impl ActiveRun {
    /// Fresh active-run record
    #[must_use]
    pub fn new(run_id: Uuid) -> Self {
        let (done_tx, done_rx) = watch::channel(false);
        Self {
            run_id,
            cancel: CancelToken::new(),
            done_rx,
            done_tx,
        }
    }
}

/// One session's scheduling record
pub struct Lane {
    pub state: LaneState,
    pub queue: VecDeque<QueuedEnvelope>,
    pub active: Option<ActiveRun>,
    pub last_activity: Instant,
    /// Debounce buffer: envelopes coalescing until the window closes
    pub debouncing: Option<Envelope>,
}

impl Lane {
    /// New idle lane
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: LaneState::Idle,
            queue: VecDeque::new(),
            active: None,
            last_activity: Instant::now(),
            debouncing: None,
        }
    }

    /// Append an envelope, updating the state machine
    pub fn enqueue(&mut self, envelope: Envelope) {
        self.queue.push_back(QueuedEnvelope {
            envelope,
            enqueued_at: Instant::now(),
        });
        self.last_activity = Instant::now();
        if self.state == LaneState::Idle {
            self.state = LaneState::Queued;
        }
    }

    /// Arrival time of the oldest queued envelope, for fair dispatch
    #[must_use]
    pub fn oldest_waiting(&self) -> Option<Instant> {
        self.queue.front().map(|q| q.enqueued_at)
    }

    /// Ready for dispatch: queued work and no active run
    #[must_use]
    pub fn is_dispatchable(&self) -> bool {
        matches!(self.state, LaneState::Idle | LaneState::Queued)
            && !self.queue.is_empty()
            && self.active.is_none()
    }

    /// Take the next envelope and mark the lane running
    pub fn begin_run(&mut self, run_id: Uuid) -> Option<(Envelope, CancelToken)> {
        if !self.is_dispatchable() {
            return None;
        }
        let queued = self.queue.pop_front()?;
        let active = ActiveRun::new(run_id);
        let cancel = active.cancel.clone();
        self.active = Some(active);
        self.state = LaneState::Running;
        self.last_activity = Instant::now();
        Some((queued.envelope, cancel))
    }

    /// Finish the active run; returns to `queued` or `idle`
    pub fn complete_run(&mut self) {
        if let Some(active) = self.active.take() {
            let _ = active.done_tx.send(true);
        }
        self.state = if self.queue.is_empty() {
            LaneState::Idle
        } else {
            LaneState::Queued
        };
        self.last_activity = Instant::now();
    }

    /// Request cancellation of the active run. Idempotent; only the current
    /// run is affected unless `drop_pending` clears the queue too.
    /// Returns a receiver resolving when the run drains, when one is active.
    pub fn abort(&mut self, drop_pending: bool) -> Option<watch::Receiver<bool>> {
        if drop_pending {
            self.queue.clear();
        }
        self.last_activity = Instant::now();
        match &self.active {
            Some(active) => {
                active.cancel.cancel();
                self.state = LaneState::Aborting;
                Some(active.done_rx.clone())
            }
            None => {
                self.state = if self.queue.is_empty() {
                    LaneState::Idle
                } else {
                    LaneState::Queued
                };
                None
            }
        }
    }

    /// Idle long enough to evict the record
    #[must_use]
    pub fn is_evictable(&self, idle_window: std::time::Duration) -> bool {
        self.state == LaneState::Idle
            && self.queue.is_empty()
            && self.active.is_none()
            && self.debouncing.is_none()
            && self.last_activity.elapsed() >= idle_window
    }
}

impl Default for Lane {
    fn default() -> Self {
        Self::new()
    }
}

/// Coalesce a newly arrived envelope into a debounce buffer: text is
/// concatenated, attachments merge with content-hash dedup, latest metadata
/// wins.
pub fn merge_envelopes(buffer: &mut Envelope, incoming: Envelope) {
    if !incoming.text.is_empty() {
        if !buffer.text.is_empty() {
            buffer.text.push('\n');
        }
        buffer.text.push_str(&incoming.text);
    }
    for attachment in incoming.attachments {
        if !buffer.attachments.iter().any(|a| a.hash == attachment.hash) {
            buffer.attachments.push(attachment);
        }
    }
    buffer.timestamp = incoming.timestamp;
    buffer.from_display = incoming.from_display;
    if incoming.reply_to.is_some() {
        buffer.reply_to = incoming.reply_to;
    }
    for mention in incoming.mentions {
        if !buffer.mentions.contains(&mention) {
            buffer.mentions.push(mention);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MediaRef;
    use crate::routing::ChatKind;
    use chrono::Utc;

    fn envelope(text: &str) -> Envelope {
        Envelope {
            channel: "x".to_string(),
            account: "acc".to_string(),
            peer: "u1".to_string(),
            chat_kind: ChatKind::Dm,
            group: None,
            from_display: "u1".to_string(),
            timestamp: Utc::now(),
            text: text.to_string(),
            attachments: Vec::new(),
            reply_to: None,
            mentions: Vec::new(),
        }
    }

    #[test]
    fn state_machine_walk() {
        let mut lane = Lane::new();
        assert_eq!(lane.state, LaneState::Idle);

        lane.enqueue(envelope("1"));
        assert_eq!(lane.state, LaneState::Queued);
        assert!(lane.is_dispatchable());

        let (env, _cancel) = lane.begin_run(Uuid::new_v4()).unwrap();
        assert_eq!(env.text, "1");
        assert_eq!(lane.state, LaneState::Running);
        assert!(!lane.is_dispatchable());

        // Enqueue while running appends
        lane.enqueue(envelope("2"));
        assert_eq!(lane.state, LaneState::Running);

        lane.complete_run();
        assert_eq!(lane.state, LaneState::Queued);
        assert_eq!(lane.queue.len(), 1);

        let _ = lane.begin_run(Uuid::new_v4()).unwrap();
        lane.complete_run();
        assert_eq!(lane.state, LaneState::Idle);
    }

    #[test]
    fn begin_run_requires_dispatchable() {
        let mut lane = Lane::new();
        assert!(lane.begin_run(Uuid::new_v4()).is_none());
        lane.enqueue(envelope("1"));
        let _ = lane.begin_run(Uuid::new_v4()).unwrap();
        // Second begin while running fails
        lane.enqueue(envelope("2"));
        assert!(lane.begin_run(Uuid::new_v4()).is_none());
    }

    #[test]
    fn abort_cancels_only_current_run() {
        let mut lane = Lane::new();
        lane.enqueue(envelope("1"));
        lane.enqueue(envelope("2"));
        let (_env, cancel) = lane.begin_run(Uuid::new_v4()).unwrap();

        let rx = lane.abort(false).unwrap();
        assert!(cancel.is_cancelled());
        assert_eq!(lane.state, LaneState::Aborting);
        assert_eq!(lane.queue.len(), 1);
        assert!(!*rx.borrow());

        lane.complete_run();
        assert_eq!(lane.state, LaneState::Queued);
    }

    #[test]
    fn abort_with_drop_pending_clears_queue() {
        let mut lane = Lane::new();
        lane.enqueue(envelope("1"));
        lane.enqueue(envelope("2"));
        let _ = lane.begin_run(Uuid::new_v4()).unwrap();
        lane.abort(true);
        assert!(lane.queue.is_empty());
    }

    #[test]
    fn abort_idle_lane_is_noop() {
        let mut lane = Lane::new();
        assert!(lane.abort(false).is_none());
        assert_eq!(lane.state, LaneState::Idle);
    }

    #[test]
    fn eviction_requires_idle_and_age() {
        let mut lane = Lane::new();
        assert!(!lane.is_evictable(std::time::Duration::from_secs(60)));
        assert!(lane.is_evictable(std::time::Duration::ZERO));
        lane.enqueue(envelope("1"));
        assert!(!lane.is_evictable(std::time::Duration::ZERO));
    }

    #[test]
    fn merge_concatenates_and_dedups() {
        let mut buffer = envelope("first");
        buffer.attachments.push(MediaRef {
            hash: "h1".to_string(),
            content_type: "image/png".to_string(),
            size: 10,
            filename: None,
        });

        let mut incoming = envelope("second");
        incoming.attachments.push(MediaRef {
            hash: "h1".to_string(),
            content_type: "image/png".to_string(),
            size: 10,
            filename: None,
        });
        incoming.attachments.push(MediaRef {
            hash: "h2".to_string(),
            content_type: "image/jpeg".to_string(),
            size: 20,
            filename: None,
        });
        incoming.reply_to = Some("m9".to_string());

        merge_envelopes(&mut buffer, incoming);
        assert_eq!(buffer.text, "first\nsecond");
        assert_eq!(buffer.attachments.len(), 2);
        assert_eq!(buffer.reply_to.as_deref(), Some("m9"));
    }
}
