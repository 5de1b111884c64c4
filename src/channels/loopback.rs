//! Loopback channel
//!
//! An in-process transport used by the dev CLI and tests: inbound envelopes
//! are injected programmatically and outbound messages are recorded. It
//! doubles as the reference implementation of the plugin contract.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;

use crate::routing::{ChatKind, Envelope};
use crate::Result;

use super::{
    ActionsAdapter, Capability, ChannelPlugin, InboundSink, LifecycleAdapter, OutboundAdapter,
    OutboundPayload, OutboundTarget, SecurityAdapter,
};

/// One recorded outbound message
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub target: OutboundTarget,
    pub text: String,
    pub media_count: usize,
    pub message_id: String,
}

/// Shared mutable state behind the adapters
#[derive(Default)]
struct LoopbackState {
    sent: Vec<SentMessage>,
    reactions: Vec<(String, String)>,
    typing_count: usize,
    linked: bool,
    sink: Option<InboundSink>,
}

/// In-process channel for development and tests
pub struct LoopbackChannel {
    id: String,
    state: Arc<Mutex<LoopbackState>>,
    text_limit: usize,
}

impl LoopbackChannel {
    /// New loopback channel with the default text limit
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: Arc::new(Mutex::new(LoopbackState::default())),
            text_limit: 4000,
        }
    }

    /// Override the per-message text limit (exercises chunking)
    #[must_use]
    pub fn with_text_limit(mut self, limit: usize) -> Self {
        self.text_limit = limit;
        self
    }

    /// Inject an inbound DM as if a peer had sent it
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::ChannelNotLinked`] before `start`.
    pub async fn inject_dm(&self, account: &str, peer: &str, text: &str) -> Result<()> {
        let sink = self
            .state
            .lock()
            .ok()
            .and_then(|s| s.sink.clone())
            .ok_or_else(|| crate::Error::ChannelNotLinked(self.id.clone()))?;
        let envelope = Envelope {
            channel: self.id.clone(),
            account: account.to_string(),
            peer: peer.to_string(),
            chat_kind: ChatKind::Dm,
            group: None,
            from_display: peer.to_string(),
            timestamp: Utc::now(),
            text: text.to_string(),
            attachments: Vec::new(),
            reply_to: None,
            mentions: Vec::new(),
        };
        sink.send(envelope)
            .await
            .map_err(|_| crate::Error::Channel("inbound sink closed".to_string()))
    }

    /// Messages sent so far
    #[must_use]
    pub fn sent(&self) -> Vec<SentMessage> {
        self.state.lock().map(|s| s.sent.clone()).unwrap_or_default()
    }

    /// Reactions applied so far, `(message_id, emoji)`
    #[must_use]
    pub fn reactions(&self) -> Vec<(String, String)> {
        self.state
            .lock()
            .map(|s| s.reactions.clone())
            .unwrap_or_default()
    }

    /// Typing indicator count
    #[must_use]
    pub fn typing_count(&self) -> usize {
        self.state.lock().map(|s| s.typing_count).unwrap_or(0)
    }
}

#[async_trait]
impl OutboundAdapter for LoopbackChannel {
    async fn send(&self, target: &OutboundTarget, payload: OutboundPayload) -> Result<String> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| crate::Error::Channel("loopback lock poisoned".to_string()))?;
        if !state.linked {
            return Err(crate::Error::ChannelNotLinked(self.id.clone()));
        }
        let message_id = format!("loop-{}", state.sent.len() + 1);
        state.sent.push(SentMessage {
            target: target.clone(),
            text: payload.text,
            media_count: payload.media.len(),
            message_id: message_id.clone(),
        });
        Ok(message_id)
    }

    fn text_limit(&self) -> usize {
        self.text_limit
    }
}

#[async_trait]
impl LifecycleAdapter for LoopbackChannel {
    async fn start(&self, sink: InboundSink) -> Result<()> {
        if let Ok(mut state) = self.state.lock() {
            state.sink = Some(sink);
            state.linked = true;
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if let Ok(mut state) = self.state.lock() {
            state.sink = None;
            state.linked = false;
        }
        Ok(())
    }

    fn is_linked(&self) -> bool {
        self.state.lock().map(|s| s.linked).unwrap_or(false)
    }
}

impl SecurityAdapter for LoopbackChannel {}

#[async_trait]
impl ActionsAdapter for LoopbackChannel {
    async fn react(&self, _target: &OutboundTarget, message_id: &str, emoji: &str) -> Result<()> {
        if let Ok(mut state) = self.state.lock() {
            state
                .reactions
                .push((message_id.to_string(), emoji.to_string()));
        }
        Ok(())
    }

    async fn unreact(&self, _target: &OutboundTarget, message_id: &str, emoji: &str) -> Result<()> {
        if let Ok(mut state) = self.state.lock() {
            state
                .reactions
                .retain(|(id, e)| !(id == message_id && e == emoji));
        }
        Ok(())
    }

    async fn typing(&self, _target: &OutboundTarget) -> Result<()> {
        if let Ok(mut state) = self.state.lock() {
            state.typing_count += 1;
        }
        Ok(())
    }
}

impl ChannelPlugin for LoopbackChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> &[Capability] {
        &[
            Capability::Dm,
            Capability::Media,
            Capability::Reactions,
            Capability::BlockStreaming,
        ]
    }

    fn outbound(&self) -> &dyn OutboundAdapter {
        self
    }

    fn lifecycle(&self) -> Option<&dyn LifecycleAdapter> {
        Some(self)
    }

    fn security(&self) -> Option<&dyn SecurityAdapter> {
        Some(self)
    }

    fn actions(&self) -> Option<&dyn ActionsAdapter> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn send_before_start_is_not_linked() {
        let channel = LoopbackChannel::new("loop");
        let target = OutboundTarget {
            account: "acc".to_string(),
            target: "u1".to_string(),
        };
        let err = channel
            .send(&target, OutboundPayload::default())
            .await
            .unwrap_err();
        assert!(matches!(err, crate::Error::ChannelNotLinked(_)));
    }

    #[tokio::test]
    async fn inbound_and_outbound_flow() {
        let channel = LoopbackChannel::new("loop");
        let (tx, mut rx) = mpsc::channel(8);
        channel.start(tx).await.unwrap();
        assert!(channel.is_linked());

        channel.inject_dm("acc", "u1", "hello").await.unwrap();
        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.peer, "u1");
        assert_eq!(envelope.text, "hello");

        let target = OutboundTarget {
            account: "acc".to_string(),
            target: "u1".to_string(),
        };
        let id = channel
            .send(
                &target,
                OutboundPayload {
                    text: "hi back".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(channel.sent().len(), 1);
        assert_eq!(channel.sent()[0].message_id, id);
    }

    #[tokio::test]
    async fn reactions_are_recorded_and_removed() {
        let channel = LoopbackChannel::new("loop");
        let target = OutboundTarget {
            account: "acc".to_string(),
            target: "u1".to_string(),
        };
        channel.react(&target, "m1", "👀").await.unwrap();
        assert_eq!(channel.reactions().len(), 1);
        channel.unreact(&target, "m1", "👀").await.unwrap();
        assert!(channel.reactions().is_empty());
    }
}
