//! Channel registry
//!
//! Owns every registered channel plugin, validates that advertised
//! capabilities are backed by the right adapters, and exposes the
//! capability map plus lifecycle fan-out.

use std::collections::HashMap;
use std::sync::Arc;

use crate::{Error, Result};

use super::{Capability, ChannelPlugin, InboundSink, LifecycleAdapter};

/// Registry of channel plugins by id
#[derive(Default, Clone)]
pub struct ChannelRegistry {
    channels: HashMap<String, Arc<dyn ChannelPlugin>>,
}

impl ChannelRegistry {
    /// Empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel after validating its capability/adapter coherence.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the id is taken or a capability is
    /// advertised without its backing adapter.
    pub fn register(&mut self, channel: Arc<dyn ChannelPlugin>) -> Result<()> {
        let id = channel.id().to_string();
        if self.channels.contains_key(&id) {
            return Err(Error::Config(format!("duplicate channel id: {id}")));
        }
        validate_capabilities(channel.as_ref())?;
        tracing::info!(channel = %id, capabilities = ?channel.capabilities(), "channel registered");
        self.channels.insert(id, channel);
        Ok(())
    }

    /// Channel lookup
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<dyn ChannelPlugin>> {
        self.channels.get(id).cloned()
    }

    /// Channel ids in sorted order
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.channels.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Capability map for status reporting
    #[must_use]
    pub fn capability_map(&self) -> HashMap<String, Vec<Capability>> {
        self.channels
            .iter()
            .map(|(id, ch)| (id.clone(), ch.capabilities().to_vec()))
            .collect()
    }

    /// Start every channel that has a lifecycle adapter
    ///
    /// # Errors
    ///
    /// Returns the first start failure; channels already started stay up.
    pub async fn start_all(&self, sink: &InboundSink) -> Result<()> {
        for (id, channel) in &self.channels {
            if let Some(lifecycle) = channel.lifecycle() {
                tracing::info!(channel = %id, "starting channel");
                lifecycle.start(sink.clone()).await?;
            }
        }
        Ok(())
    }

    /// Stop every channel; failures are logged, not propagated
    pub async fn stop_all(&self) {
        for (id, channel) in &self.channels {
            if let Some(lifecycle) = channel.lifecycle() {
                if let Err(e) = lifecycle.stop().await {
                    tracing::warn!(channel = %id, error = %e, "channel stop failed");
                }
            }
        }
    }

    /// Link status per channel: id → connected
    #[must_use]
    pub fn link_status(&self) -> HashMap<String, bool> {
        self.channels
            .iter()
            .map(|(id, ch)| {
                let linked = ch.lifecycle().is_none_or(super::LifecycleAdapter::is_linked);
                (id.clone(), linked)
            })
            .collect()
    }
}

/// Capability → adapter coherence rules
fn validate_capabilities(channel: &dyn ChannelPlugin) -> Result<()> {
    let id = channel.id();
    for capability in channel.capabilities() {
        let satisfied = match capability {
            Capability::Reactions | Capability::Effects | Capability::Polls => {
                channel.actions().is_some()
            }
            Capability::Thread | Capability::Threads => channel.threads().is_some(),
            Capability::Group | Capability::Channel => channel.mentions().is_some(),
            // Backed by the mandatory outbound adapter
            Capability::Dm
            | Capability::Media
            | Capability::Edits
            | Capability::BlockStreaming
            | Capability::NativeCommands => true,
        };
        if !satisfied {
            return Err(Error::Config(format!(
                "channel {id} advertises {capability:?} without the backing adapter"
            )));
        }
    }
    Ok(())
}
