//! Outbound delivery
//!
//! Takes finished assistant messages and pushes them through the owning
//! channel: chunking against the channel's text limit, block streaming with
//! an in-progress ack reaction, media packaging with textual fallback, and
//! idempotent delivery keys so retries never duplicate a user-visible
//! message. Sends are serialized per `(channel, account, target)`.

pub mod chunking;

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;

use crate::channels::{
    ActionsAdapter as _, Capability, ChannelPlugin, ChannelRegistry, OutboundAdapter as _,
    OutboundPayload, OutboundTarget,
};
use crate::media::MediaRef;
use crate::{Error, Result};

pub use chunking::chunk_message;

/// Emoji shown while more blocks are coming
const IN_PROGRESS_REACTION: &str = "⏳";

/// Retained delivery keys before the oldest are forgotten
const DELIVERY_KEY_CAPACITY: usize = 4096;

/// One delivery request
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    pub channel: String,
    pub account: String,
    pub target: String,
    pub text: String,
    pub media: Vec<MediaRef>,
    /// Platform message id to attach the ack reaction to
    pub reply_to: Option<String>,
    /// Idempotency key, typically `"{run_id}:{block_index}"`
    pub delivery_key: String,
}

/// Result of a completed delivery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub message_ids: Vec<String>,
    pub chunks: usize,
}

/// Serialized, idempotent deliverer over the channel registry
pub struct OutboundDeliverer {
    channels: ChannelRegistry,
    send_timeout: Duration,
    seen: Mutex<SeenKeys>,
    /// Per-destination ordering locks
    targets: AsyncMutex<HashMap<(String, String, String), Arc<AsyncMutex<()>>>>,
}

/// Bounded map of already-delivered keys
struct SeenKeys {
    order: VecDeque<String>,
    receipts: HashMap<String, DeliveryReceipt>,
}

impl OutboundDeliverer {
    /// New deliverer over the given registry
    #[must_use]
    pub fn new(channels: ChannelRegistry, send_timeout: Duration) -> Self {
        Self {
            channels,
            send_timeout,
            seen: Mutex::new(SeenKeys {
                order: VecDeque::new(),
                receipts: HashMap::new(),
            }),
            targets: AsyncMutex::new(HashMap::new()),
        }
    }

    /// Deliver a message. Retrying with the same `delivery_key` returns the
    /// original receipt without sending anything.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChannelNotLinked`] for unknown channels, or the
    /// first send failure.
    pub async fn deliver(&self, request: DeliveryRequest) -> Result<DeliveryReceipt> {
        if let Some(receipt) = self.check_seen(&request.delivery_key) {
            tracing::debug!(key = %request.delivery_key, "duplicate delivery suppressed");
            return Ok(receipt);
        }

        let channel = self
            .channels
            .get(&request.channel)
            .ok_or_else(|| Error::ChannelNotLinked(request.channel.clone()))?;

        // Serialize sends per destination
        let target_lock = self
            .target_lock(&request.channel, &request.account, &request.target)
            .await;
        let _guard = target_lock.lock().await;

        // Re-check under the lock: a concurrent retry may have finished
        if let Some(receipt) = self.check_seen(&request.delivery_key) {
            return Ok(receipt);
        }

        let target = OutboundTarget {
            account: request.account.clone(),
            target: request.target.clone(),
        };

        let limit = channel.outbound().text_limit();
        let chunks = chunk_message(&request.text, limit);
        let chunks = if chunks.is_empty() && !request.media.is_empty() {
            vec![String::new()]
        } else {
            chunks
        };

        let block_streaming = channel.has_capability(Capability::BlockStreaming);
        let media_ok = channel.has_capability(Capability::Media);

        // In-progress ack while more blocks follow
        let mut ack_applied = false;
        if block_streaming && chunks.len() > 1 {
            if let (Some(actions), Some(reply_to)) = (channel.actions(), &request.reply_to) {
                if actions
                    .react(&target, reply_to, IN_PROGRESS_REACTION)
                    .await
                    .is_ok()
                {
                    ack_applied = true;
                }
            }
        }

        let mut message_ids = Vec::with_capacity(chunks.len());
        let total = chunks.len();
        for (index, chunk) in chunks.into_iter().enumerate() {
            let mut payload = OutboundPayload {
                text: chunk,
                media: Vec::new(),
                reply_to: if index == 0 { request.reply_to.clone() } else { None },
                thread_id: None,
            };
            // Media rides on the first block; anything the channel cannot
            // carry natively degrades to a textual description
            if index == 0 && !request.media.is_empty() {
                let cap = channel.outbound().media_size_limit();
                let (kept, skipped): (Vec<MediaRef>, Vec<MediaRef>) = request
                    .media
                    .iter()
                    .cloned()
                    .partition(|m| media_ok && m.size <= cap);
                payload.media = kept;
                if !skipped.is_empty() {
                    if !payload.text.is_empty() {
                        payload.text.push_str("\n\n");
                    }
                    payload.text.push_str(&describe_media(&skipped));
                }
            }

            let send = channel.outbound().send(&target, payload);
            let id = tokio::time::timeout(self.send_timeout, send)
                .await
                .map_err(|_| {
                    Error::Channel(format!(
                        "send to {}/{} timed out",
                        request.channel, request.target
                    ))
                })??;
            message_ids.push(id);

            tracing::trace!(
                channel = %request.channel,
                block = index + 1,
                of = total,
                "block delivered"
            );
        }

        if ack_applied {
            if let (Some(actions), Some(reply_to)) = (channel.actions(), &request.reply_to) {
                let _ = actions.unreact(&target, reply_to, IN_PROGRESS_REACTION).await;
            }
        }

        let receipt = DeliveryReceipt {
            chunks: message_ids.len(),
            message_ids,
        };
        self.record_seen(&request.delivery_key, receipt.clone());
        Ok(receipt)
    }

    /// Show a typing indicator on channels that support it
    pub async fn typing(&self, channel: &str, account: &str, target: &str) {
        if let Some(ch) = self.channels.get(channel) {
            if let Some(actions) = ch.actions() {
                let target = OutboundTarget {
                    account: account.to_string(),
                    target: target.to_string(),
                };
                if let Err(e) = actions.typing(&target).await {
                    tracing::debug!(channel, error = %e, "typing indicator failed");
                }
            }
        }
    }

    /// Acknowledge receipt of an inbound message with a reaction
    pub async fn ack_reaction(
        &self,
        channel: &str,
        account: &str,
        target: &str,
        message_id: &str,
        emoji: &str,
    ) {
        if let Some(ch) = self.channels.get(channel) {
            if let Some(actions) = ch.actions() {
                let target = OutboundTarget {
                    account: account.to_string(),
                    target: target.to_string(),
                };
                if let Err(e) = actions.react(&target, message_id, emoji).await {
                    tracing::debug!(channel, error = %e, "ack reaction failed");
                }
            }
        }
    }

    fn check_seen(&self, key: &str) -> Option<DeliveryReceipt> {
        self.seen
            .lock()
            .ok()
            .and_then(|seen| seen.receipts.get(key).cloned())
    }

    fn record_seen(&self, key: &str, receipt: DeliveryReceipt) {
        if let Ok(mut seen) = self.seen.lock() {
            if seen.receipts.len() >= DELIVERY_KEY_CAPACITY {
                if let Some(oldest) = seen.order.pop_front() {
                    seen.receipts.remove(&oldest);
                }
            }
            seen.order.push_back(key.to_string());
            seen.receipts.insert(key.to_string(), receipt);
        }
    }

    async fn target_lock(
        &self,
        channel: &str,
        account: &str,
        target: &str,
    ) -> Arc<AsyncMutex<()>> {
        let mut targets = self.targets.lock().await;
        targets
            .entry((
                channel.to_string(),
                account.to_string(),
                target.to_string(),
            ))
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

}

/// Textual fallback for media that could not be sent natively
fn describe_media(media: &[MediaRef]) -> String {
    media
        .iter()
        .map(|m| {
            let name = m.filename.as_deref().unwrap_or("attachment");
            format!("[{name}: {} ({} bytes)]", m.content_type, m.size)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::loopback::LoopbackChannel;

    async fn deliverer_with_loopback(limit: usize) -> (Arc<LoopbackChannel>, OutboundDeliverer) {
        let channel = Arc::new(LoopbackChannel::new("loop").with_text_limit(limit));
        let (tx, _rx) = tokio::sync::mpsc::channel(8);
        use crate::channels::LifecycleAdapter as _;
        channel.start(tx).await.unwrap();

        let mut registry = ChannelRegistry::new();
        registry.register(channel.clone()).unwrap();
        (channel, OutboundDeliverer::new(registry, Duration::from_secs(5)))
    }

    fn request(text: &str, key: &str) -> DeliveryRequest {
        DeliveryRequest {
            channel: "loop".to_string(),
            account: "acc".to_string(),
            target: "u1".to_string(),
            text: text.to_string(),
            media: Vec::new(),
            reply_to: Some("m0".to_string()),
            delivery_key: key.to_string(),
        }
    }

    #[tokio::test]
    async fn short_message_is_one_send() {
        let (channel, deliverer) = deliverer_with_loopback(4000).await;
        let receipt = deliverer.deliver(request("hello", "r1:0")).await.unwrap();
        assert_eq!(receipt.chunks, 1);
        assert_eq!(channel.sent().len(), 1);
    }

    #[tokio::test]
    async fn long_message_is_chunked_in_order() {
        let (channel, deliverer) = deliverer_with_loopback(20).await;
        let text = "First paragraph.\n\nSecond paragraph.\n\nThird paragraph.";
        let receipt = deliverer.deliver(request(text, "r1:0")).await.unwrap();
        assert!(receipt.chunks > 1);
        let sent = channel.sent();
        assert_eq!(sent.len(), receipt.chunks);
        assert!(sent[0].text.contains("First"));
        assert!(sent.last().unwrap().text.contains("Third"));
    }

    #[tokio::test]
    async fn duplicate_delivery_key_sends_once() {
        let (channel, deliverer) = deliverer_with_loopback(4000).await;
        let a = deliverer.deliver(request("hello", "r1:0")).await.unwrap();
        let b = deliverer.deliver(request("hello", "r1:0")).await.unwrap();
        assert_eq!(a.message_ids, b.message_ids);
        assert_eq!(channel.sent().len(), 1);
    }

    #[tokio::test]
    async fn block_streaming_ack_is_removed_after_last_block() {
        let (channel, deliverer) = deliverer_with_loopback(20).await;
        let text = "First paragraph.\n\nSecond paragraph.\n\nThird paragraph.";
        deliverer.deliver(request(text, "r1:0")).await.unwrap();
        // The in-progress reaction was applied and then removed
        assert!(channel.reactions().is_empty());
    }

    #[tokio::test]
    async fn unknown_channel_is_not_linked() {
        let (_channel, deliverer) = deliverer_with_loopback(4000).await;
        let mut req = request("hi", "r1:0");
        req.channel = "ghost".to_string();
        assert!(matches!(
            deliverer.deliver(req).await,
            Err(Error::ChannelNotLinked(_))
        ));
    }

    #[tokio::test]
    async fn oversized_media_falls_back_to_description() {
        let (channel, deliverer) = deliverer_with_loopback(4000).await;
        let mut req = request("here you go", "r1:0");
        req.media = vec![MediaRef {
            hash: "0".repeat(64),
            content_type: "video/mp4".to_string(),
            size: 64 * 1024 * 1024 * 1024,
            filename: Some("huge.mp4".to_string()),
        }];
        deliverer.deliver(req).await.unwrap();
        let sent = channel.sent();
        assert_eq!(sent[0].media_count, 0);
        assert!(sent[0].text.contains("huge.mp4"));
    }
}
