//! Inbound routing
//!
//! [`resolve`] maps a normalized envelope to an agent and session key. It is
//! a pure function over the envelope and one config snapshot: no I/O, no
//! clock, no randomness, so identical inputs always produce identical keys.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{Config, DmPolicy, GroupPolicy, SessionScopePolicy};
use crate::media::MediaRef;
use crate::session::SessionKey;

/// What kind of conversation an envelope arrived in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    Dm,
    Group,
    Channel,
    Thread,
}

/// Normalized inbound message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub channel: String,
    pub account: String,
    pub peer: String,
    pub chat_kind: ChatKind,
    /// Group or channel id for non-DM kinds
    #[serde(default)]
    pub group: Option<String>,
    pub from_display: String,
    pub timestamp: DateTime<Utc>,
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<MediaRef>,
    #[serde(default)]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub mentions: Vec<String>,
}

impl Envelope {
    /// Was the given account or agent mentioned?
    #[must_use]
    pub fn mentions_any(&self, names: &[&str]) -> bool {
        self.mentions
            .iter()
            .any(|m| names.iter().any(|n| m == n))
    }
}

/// Why an envelope was not admitted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    /// Channel is disabled in config
    ChannelDisabled,
    /// DM policy is `disabled`
    DmDisabled,
    /// Allowlist policy and the peer is not listed
    NotAllowlisted,
    /// Group policy denies, or mention required and absent
    GroupPolicy,
    /// No binding matched and no default agent is configured
    NoAgent,
}

/// Effective delivery policy for the resolved route
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutePolicy {
    pub dm: DmPolicy,
    pub group: GroupPolicy,
    /// Set when the policy denies the envelope; the caller discards it
    /// silently with a diagnostic event
    pub blocked: Option<BlockReason>,
}

/// Result of route resolution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteDecision {
    pub agent_id: String,
    pub session_key: SessionKey,
    pub policy: RoutePolicy,
}

/// Resolve an envelope against a config snapshot.
///
/// Binding order: explicit selectors (concrete peer/group values) win over
/// wildcards; within each class, declaration order decides. When nothing
/// matches, the default agent takes the envelope; with no default agent the
/// decision is blocked with [`BlockReason::NoAgent`].
#[must_use]
pub fn resolve(envelope: &Envelope, config: &Config) -> RouteDecision {
    let channel_cfg = config.channel(&envelope.channel);

    let agent_id = match_binding(envelope, config)
        .or_else(|| config.default_agent.clone())
        .unwrap_or_default();

    let blocked = admission_block(envelope, config, &agent_id);

    let effective_agent = if agent_id.is_empty() {
        // Keys still need a stable shape for diagnostics
        "-".to_string()
    } else {
        agent_id
    };

    let session_key = derive_session_key(envelope, &effective_agent, channel_cfg.session_scope);

    RouteDecision {
        agent_id: effective_agent,
        session_key,
        policy: RoutePolicy {
            dm: channel_cfg.dm_policy,
            group: channel_cfg.group_policy,
            blocked,
        },
    }
}

/// First matching binding, explicit selectors before wildcards
fn match_binding(envelope: &Envelope, config: &Config) -> Option<String> {
    let explicit = config
        .bindings
        .iter()
        .find(|b| selector_matches(envelope, b, false));
    if let Some(binding) = explicit {
        return Some(binding.agent.clone());
    }
    config
        .bindings
        .iter()
        .find(|b| selector_matches(envelope, b, true))
        .map(|b| b.agent.clone())
}

/// Whether one binding selector matches the envelope.
///
/// `allow_wildcards` false restricts the peer/group fields to concrete
/// values, implementing explicit-over-wildcard precedence.
fn selector_matches(
    envelope: &Envelope,
    binding: &crate::config::BindingConfig,
    allow_wildcards: bool,
) -> bool {
    let sel = &binding.selector;
    if sel.channel != "*" && sel.channel != envelope.channel {
        return false;
    }
    if let Some(ref account) = sel.account {
        if account != "*" && account != &envelope.account {
            return false;
        }
    }
    match (&sel.peer, &sel.group) {
        (Some(peer), _) => {
            if peer == "*" {
                allow_wildcards
            } else {
                peer == &envelope.peer
            }
        }
        (None, Some(group)) => {
            let Some(ref env_group) = envelope.group else {
                return false;
            };
            if group == "*" {
                allow_wildcards
            } else {
                group == env_group
            }
        }
        // Selector with neither peer nor group matches any conversation,
        // which counts as a wildcard
        (None, None) => allow_wildcards,
    }
}

/// Pure admission check against config-visible policy
fn admission_block(envelope: &Envelope, config: &Config, agent_id: &str) -> Option<BlockReason> {
    let channel_cfg = config.channel(&envelope.channel);

    if !channel_cfg.enabled {
        return Some(BlockReason::ChannelDisabled);
    }
    if agent_id.is_empty() {
        return Some(BlockReason::NoAgent);
    }

    match envelope.chat_kind {
        ChatKind::Dm => match channel_cfg.dm_policy {
            DmPolicy::Disabled => Some(BlockReason::DmDisabled),
            DmPolicy::Allowlist => {
                if channel_cfg.allowlist.iter().any(|p| p == &envelope.peer) {
                    None
                } else {
                    Some(BlockReason::NotAllowlisted)
                }
            }
            // Pairing admission needs pairing state; the ingest path owns it
            DmPolicy::Open | DmPolicy::Pairing => None,
        },
        ChatKind::Group | ChatKind::Channel | ChatKind::Thread => {
            match channel_cfg.group_policy {
                GroupPolicy::Disabled => Some(BlockReason::GroupPolicy),
                GroupPolicy::MentionOnly => {
                    if envelope.mentions_any(&[&envelope.account, agent_id]) {
                        None
                    } else {
                        Some(BlockReason::GroupPolicy)
                    }
                }
                GroupPolicy::All => None,
            }
        }
    }
}

/// Derive the session key from the route and the channel's scope rule
fn derive_session_key(
    envelope: &Envelope,
    agent_id: &str,
    scope: SessionScopePolicy,
) -> SessionKey {
    match envelope.chat_kind {
        ChatKind::Dm => SessionKey::peer(agent_id, &envelope.channel, &envelope.account, {
            match scope {
                SessionScopePolicy::PerPeer => &envelope.peer,
                SessionScopePolicy::PerAgent => "shared",
            }
        }),
        ChatKind::Group | ChatKind::Channel => {
            let group = envelope.group.as_deref().unwrap_or(&envelope.peer);
            let peer = match scope {
                SessionScopePolicy::PerPeer => Some(envelope.peer.as_str()),
                SessionScopePolicy::PerAgent => None,
            };
            SessionKey::group(agent_id, &envelope.channel, &envelope.account, group, peer)
        }
        ChatKind::Thread => {
            let thread = envelope.group.as_deref().unwrap_or(&envelope.peer);
            SessionKey::main_thread(agent_id, thread)
        }
    }
}
