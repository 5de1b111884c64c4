//! Channel plugin substrate
//!
//! Transports plug into the gateway through [`ChannelPlugin`]: a required
//! outbound adapter plus typed optional capability adapters. The registry
//! checks that every advertised capability is backed by the adapter that
//! implements it, so a plugin cannot claim reactions without providing the
//! actions adapter.

pub mod loopback;
pub mod registry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::media::MediaRef;
use crate::routing::Envelope;
use crate::Result;

pub use registry::ChannelRegistry;

/// Feature a channel may support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Dm,
    Group,
    Channel,
    Thread,
    Reactions,
    Edits,
    Polls,
    Media,
    Threads,
    BlockStreaming,
    NativeCommands,
    Effects,
}

/// Sink channels use to hand normalized envelopes to the gateway
pub type InboundSink = mpsc::Sender<Envelope>;

/// Outbound message content
#[derive(Debug, Clone, Default)]
pub struct OutboundPayload {
    pub text: String,
    pub media: Vec<MediaRef>,
    pub reply_to: Option<String>,
    pub thread_id: Option<String>,
}

/// Delivery destination within a channel
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OutboundTarget {
    pub account: String,
    /// Peer or group id the message goes to
    pub target: String,
}

/// Required adapter: sending messages
#[async_trait]
pub trait OutboundAdapter: Send + Sync {
    /// Send one message, returning the platform message id when known.
    async fn send(&self, target: &OutboundTarget, payload: OutboundPayload) -> Result<String>;

    /// Hard cap on text length per message; chunking respects this
    fn text_limit(&self) -> usize {
        4000
    }

    /// Cap on attached media bytes, when the channel supports media
    fn media_size_limit(&self) -> u64 {
        16 * 1024 * 1024
    }
}

/// Optional adapter: process lifecycle (connect, pump inbound, disconnect)
#[async_trait]
pub trait LifecycleAdapter: Send + Sync {
    /// Connect and begin delivering inbound envelopes to `sink`
    async fn start(&self, sink: InboundSink) -> Result<()>;

    /// Disconnect and stop the inbound pump
    async fn stop(&self) -> Result<()>;

    /// Is the transport currently linked?
    fn is_linked(&self) -> bool;
}

/// Optional adapter: id normalization and self-identification
pub trait SecurityAdapter: Send + Sync {
    /// Canonical form of a peer id (e.g. E.164 for phone channels)
    fn normalize_peer(&self, raw: &str) -> String {
        raw.trim().to_string()
    }

    /// Is this peer the gateway's own account (echo suppression)?
    fn is_self(&self, peer: &str) -> bool {
        let _ = peer;
        false
    }
}

/// Optional adapter: display-name lookup
#[async_trait]
pub trait DirectoryAdapter: Send + Sync {
    /// Human-readable name for a peer id
    async fn display_name(&self, account: &str, peer: &str) -> Result<String>;
}

/// Optional adapter: mention semantics for group chats
pub trait MentionsAdapter: Send + Sync {
    /// Remove mention markers addressed at the gateway from the text
    fn strip_mentions(&self, text: &str) -> String;

    /// Did this envelope mention the gateway account?
    fn was_mentioned(&self, envelope: &Envelope) -> bool;
}

/// Optional adapter: thread targeting
pub trait ThreadsAdapter: Send + Sync {
    /// Thread id replies should attach to, when the platform threads them
    fn reply_thread(&self, envelope: &Envelope) -> Option<String>;
}

/// Optional adapter: reactions, typing indicators and other side effects
#[async_trait]
pub trait ActionsAdapter: Send + Sync {
    /// Add or replace an ack reaction on a message
    async fn react(&self, target: &OutboundTarget, message_id: &str, emoji: &str) -> Result<()>;

    /// Remove a previously added reaction
    async fn unreact(&self, target: &OutboundTarget, message_id: &str, emoji: &str) -> Result<()>;

    /// Show a typing indicator
    async fn typing(&self, target: &OutboundTarget) -> Result<()>;
}

/// A transport plugged into the gateway
pub trait ChannelPlugin: Send + Sync {
    /// Stable channel id, e.g. `"telegram"`
    fn id(&self) -> &str;

    /// Capabilities this channel advertises
    fn capabilities(&self) -> &[Capability];

    /// Sending is mandatory for every channel
    fn outbound(&self) -> &dyn OutboundAdapter;

    /// Lifecycle control, for connection-oriented transports
    fn lifecycle(&self) -> Option<&dyn LifecycleAdapter> {
        None
    }

    /// Id normalization and echo suppression
    fn security(&self) -> Option<&dyn SecurityAdapter> {
        None
    }

    /// Display-name resolution
    fn directory(&self) -> Option<&dyn DirectoryAdapter> {
        None
    }

    /// Mention handling for group capability
    fn mentions(&self) -> Option<&dyn MentionsAdapter> {
        None
    }

    /// Thread targeting for thread capabilities
    fn threads(&self) -> Option<&dyn ThreadsAdapter> {
        None
    }

    /// Reactions / typing side effects
    fn actions(&self) -> Option<&dyn ActionsAdapter> {
        None
    }

    /// Convenience capability test
    fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_serializes_snake_case() {
        let json = serde_json::to_string(&Capability::BlockStreaming).unwrap();
        assert_eq!(json, "\"block_streaming\"");
        let back: Capability = serde_json::from_str("\"native_commands\"").unwrap();
        assert_eq!(back, Capability::NativeCommands);
    }

    #[test]
    fn default_security_adapter_trims() {
        struct Plain;
        impl SecurityAdapter for Plain {}
        assert_eq!(Plain.normalize_peer("  u1 "), "u1");
        assert!(!Plain.is_self("u1"));
    }
}
