//! Event bus
//!
//! Server-to-client events fan out to every subscribed connection. Each
//! subscription has its own sequence counter and a byte-bounded queue: when
//! the budget is exceeded the oldest non-critical events are dropped and a
//! gap marker tells the client what it missed. Critical events (lifecycle,
//! final, error, shutdown) are never dropped.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::agent::events::RunEvent;
use crate::security::{Scope, ScopeSet};

/// Events published to connected clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GatewayEvent {
    /// Streaming run event keyed by run id
    Agent(RunEvent),
    /// Inbound / outbound chat notification
    Chat {
        session_key: crate::session::SessionKey,
        direction: ChatDirection,
        text: String,
    },
    /// Periodic heartbeat
    Tick { now: chrono::DateTime<chrono::Utc> },
    /// Server is going away; clients should reconnect
    Shutdown { restart_expected_ms: Option<u64> },
    /// Initial state snapshot after the handshake
    Snapshot { payload: serde_json::Value },
    /// Events were dropped under backpressure
    Gap { dropped: u64 },
}

/// Direction of a chat notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatDirection {
    Inbound,
    Outbound,
}

impl GatewayEvent {
    /// Critical events survive backpressure
    #[must_use]
    pub fn is_critical(&self) -> bool {
        match self {
            Self::Agent(e) => e.kind.is_critical(),
            Self::Shutdown { .. } | Self::Snapshot { .. } | Self::Gap { .. } => true,
            Self::Chat { .. } | Self::Tick { .. } => false,
        }
    }

    /// Scope required to see this event. Everything currently needs `read`;
    /// the hook exists so future event kinds can demand more.
    #[must_use]
    pub const fn required_scope(&self) -> Scope {
        Scope::Read
    }

    /// Approximate wire size, for the byte budget
    #[must_use]
    pub fn approx_bytes(&self) -> usize {
        serde_json::to_string(self).map_or(256, |s| s.len())
    }
}

/// An event as seen by one connection. The per-connection `seq` is distinct
/// from any per-run sequence inside the event itself.
#[derive(Debug, Clone)]
pub struct SequencedEvent {
    pub seq: u64,
    pub event: GatewayEvent,
}

struct SubscriptionInner {
    conn_id: String,
    scopes: ScopeSet,
    max_buffered: usize,
    notify: Notify,
    state: Mutex<SubscriptionState>,
}

struct SubscriptionState {
    queue: VecDeque<SequencedEvent>,
    buffered_bytes: usize,
    next_seq: u64,
    dropped_since_gap: u64,
    closed: bool,
}

/// A connection's view of the bus
#[derive(Clone)]
pub struct Subscription {
    inner: Arc<SubscriptionInner>,
}

impl Subscription {
    /// Pop the next event without waiting
    #[must_use]
    pub fn try_next(&self) -> Option<SequencedEvent> {
        let mut state = self.inner.state.lock().ok()?;
        let event = state.queue.pop_front()?;
        state.buffered_bytes = state
            .buffered_bytes
            .saturating_sub(event.event.approx_bytes());
        Some(event)
    }

    /// Wait for the next event; `None` once closed and drained
    pub async fn next(&self) -> Option<SequencedEvent> {
        loop {
            // Register for wakeups before checking the queue so a publish
            // landing between the check and the await is not lost
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.inner.state.lock().ok()?;
                if let Some(event) = state.queue.pop_front() {
                    state.buffered_bytes = state
                        .buffered_bytes
                        .saturating_sub(event.event.approx_bytes());
                    return Some(event);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Connection id this subscription belongs to
    #[must_use]
    pub fn conn_id(&self) -> &str {
        &self.inner.conn_id
    }
}

/// Fan-out hub for gateway events
#[derive(Default)]
pub struct EventBus {
    subscriptions: Mutex<Vec<Arc<SubscriptionInner>>>,
}

impl EventBus {
    /// Empty bus
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection with its scope set and buffer budget
    #[must_use]
    pub fn subscribe(
        &self,
        conn_id: impl Into<String>,
        scopes: ScopeSet,
        max_buffered: usize,
    ) -> Subscription {
        let inner = Arc::new(SubscriptionInner {
            conn_id: conn_id.into(),
            scopes,
            max_buffered,
            notify: Notify::new(),
            state: Mutex::new(SubscriptionState {
                queue: VecDeque::new(),
                buffered_bytes: 0,
                next_seq: 0,
                dropped_since_gap: 0,
                closed: false,
            }),
        });
        if let Ok(mut subs) = self.subscriptions.lock() {
            subs.push(Arc::clone(&inner));
        }
        Subscription { inner }
    }

    /// Remove a connection's subscription
    pub fn unsubscribe(&self, conn_id: &str) {
        if let Ok(mut subs) = self.subscriptions.lock() {
            for sub in subs.iter().filter(|s| s.conn_id == conn_id) {
                if let Ok(mut state) = sub.state.lock() {
                    state.closed = true;
                }
                sub.notify.notify_waiters();
            }
            subs.retain(|s| s.conn_id != conn_id);
        }
    }

    /// Publish an event to every subscription allowed to see it
    pub fn publish(&self, event: GatewayEvent) {
        let Ok(subs) = self.subscriptions.lock() else {
            return;
        };
        for sub in subs.iter() {
            if !sub.scopes.allows(event.required_scope()) {
                continue;
            }
            enqueue(sub, event.clone());
        }
    }

    /// Publish to a single connection (handshake snapshots)
    pub fn publish_to(&self, conn_id: &str, event: GatewayEvent) {
        let Ok(subs) = self.subscriptions.lock() else {
            return;
        };
        for sub in subs.iter().filter(|s| s.conn_id == conn_id) {
            if sub.scopes.allows(event.required_scope()) {
                enqueue(sub, event.clone());
            }
        }
    }

    /// Number of live subscriptions
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscriptions.lock().map(|s| s.len()).unwrap_or(0)
    }
}

/// Queue one event, applying the drop-oldest-non-critical policy
fn enqueue(sub: &SubscriptionInner, event: GatewayEvent) {
    let Ok(mut state) = sub.state.lock() else {
        return;
    };
    if state.closed {
        return;
    }

    let size = event.approx_bytes();

    // Over budget: shed the oldest non-critical events first
    while state.buffered_bytes + size > sub.max_buffered {
        let victim = state
            .queue
            .iter()
            .position(|queued| !queued.event.is_critical());
        match victim {
            Some(index) => {
                if let Some(dropped) = state.queue.remove(index) {
                    state.buffered_bytes = state
                        .buffered_bytes
                        .saturating_sub(dropped.event.approx_bytes());
                    state.dropped_since_gap += 1;
                }
            }
            // Only critical events left; accept the overshoot
            None => break,
        }
    }

    // Tell the client what it missed before the next event
    if state.dropped_since_gap > 0 && event.is_critical() {
        let gap = GatewayEvent::Gap {
            dropped: state.dropped_since_gap,
        };
        state.dropped_since_gap = 0;
        let seq = state.next_seq;
        state.next_seq += 1;
        state.buffered_bytes += gap.approx_bytes();
        state.queue.push_back(SequencedEvent { seq, event: gap });
    }

    let seq = state.next_seq;
    state.next_seq += 1;
    state.buffered_bytes += size;
    state.queue.push_back(SequencedEvent { seq, event });
    drop(state);
    sub.notify.notify_waiters();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::events::RunEventKind;
    use crate::session::SessionKey;
    use uuid::Uuid;

    fn agent_event(kind: RunEventKind, seq: u64) -> GatewayEvent {
        GatewayEvent::Agent(RunEvent {
            run_id: Uuid::nil(),
            session_key: SessionKey::peer("a1", "x", "acc", "u1"),
            seq,
            ts: chrono::Utc::now(),
            kind,
        })
    }

    fn delta(text: &str) -> GatewayEvent {
        agent_event(
            RunEventKind::TextDelta {
                text: text.to_string(),
            },
            0,
        )
    }

    #[test]
    fn per_connection_seq_increments() {
        let bus = EventBus::new();
        let sub = bus.subscribe("c1", ScopeSet::admin(), 1024 * 1024);
        bus.publish(GatewayEvent::Tick {
            now: chrono::Utc::now(),
        });
        bus.publish(GatewayEvent::Tick {
            now: chrono::Utc::now(),
        });
        assert_eq!(sub.try_next().unwrap().seq, 0);
        assert_eq!(sub.try_next().unwrap().seq, 1);
    }

    #[test]
    fn scope_filtering_hides_events() {
        let bus = EventBus::new();
        let sub = bus.subscribe("c1", ScopeSet::new(vec![]), 1024 * 1024);
        bus.publish(delta("x"));
        assert!(sub.try_next().is_none());
    }

    #[test]
    fn backpressure_drops_deltas_and_marks_gap() {
        let bus = EventBus::new();
        // Budget fits roughly two small events
        let sub = bus.subscribe("c1", ScopeSet::admin(), 700);

        for i in 0..10 {
            bus.publish(delta(&format!("delta {i}")));
        }
        // Critical event triggers the gap marker and must survive
        bus.publish(agent_event(
            RunEventKind::Final {
                reason: "completed".to_string(),
                text: String::new(),
            },
            9,
        ));

        let mut saw_gap = false;
        let mut saw_final = false;
        while let Some(event) = sub.try_next() {
            match event.event {
                GatewayEvent::Gap { dropped } => {
                    saw_gap = true;
                    assert!(dropped > 0);
                }
                GatewayEvent::Agent(RunEvent {
                    kind: RunEventKind::Final { .. },
                    ..
                }) => saw_final = true,
                _ => {}
            }
        }
        assert!(saw_gap, "expected a gap marker");
        assert!(saw_final, "final event must never be dropped");
    }

    #[test]
    fn multicast_reaches_all_subscribers() {
        let bus = EventBus::new();
        let a = bus.subscribe("a", ScopeSet::admin(), 1024 * 1024);
        let b = bus.subscribe("b", ScopeSet::admin(), 1024 * 1024);
        bus.publish(delta("x"));
        assert!(a.try_next().is_some());
        assert!(b.try_next().is_some());
    }

    #[tokio::test]
    async fn unsubscribe_closes_next() {
        let bus = EventBus::new();
        let sub = bus.subscribe("c1", ScopeSet::admin(), 1024);
        bus.unsubscribe("c1");
        assert!(sub.next().await.is_none());
        assert_eq!(bus.subscriber_count(), 0);
    }
}
