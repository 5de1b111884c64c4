//! Configuration for the gateway
//!
//! Configuration is loaded from a TOML file plus environment overrides and
//! published as an immutable snapshot. Readers hold an `Arc<Config>`;
//! reloads swap the pointer atomically, so in-flight runs keep the snapshot
//! they started with while new routing decisions observe the new one.

pub mod file;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::security::Scope;
use crate::{Error, Result};

/// How much extended thinking an agent requests from the model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThinkingLevel {
    Off,
    #[default]
    Minimal,
    Low,
    Medium,
    High,
    Xhigh,
}

/// Session granularity for a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionScopePolicy {
    /// One session per remote peer
    #[default]
    PerPeer,
    /// One shared session per agent
    PerAgent,
}

/// DM admission policy for a channel+account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DmPolicy {
    #[default]
    Open,
    Allowlist,
    Pairing,
    Disabled,
}

impl std::fmt::Display for DmPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Allowlist => write!(f, "allowlist"),
            Self::Pairing => write!(f, "pairing"),
            Self::Disabled => write!(f, "disabled"),
        }
    }
}

/// Group-chat engagement policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupPolicy {
    /// Respond only when mentioned
    #[default]
    MentionOnly,
    /// Respond to every message
    All,
    /// Never respond in groups
    Disabled,
}

/// One configured agent persona
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub id: String,
    /// Primary model reference, `provider/model`
    pub model: String,
    /// Fallback chain tried in order after the primary
    #[serde(default)]
    pub fallback_models: Vec<String>,
    #[serde(default)]
    pub thinking: ThinkingLevel,
    /// System prompt overlay for this agent
    #[serde(default)]
    pub persona: String,
    /// Domain overlay layered between the base prompt and the persona
    #[serde(default)]
    pub overlay: String,
    /// Workspace directory handed to tools
    #[serde(default)]
    pub workspace: Option<PathBuf>,
    /// Tool policy overrides, tool name → policy class
    #[serde(default)]
    pub tool_policies: HashMap<String, crate::tools::ToolPolicyClass>,
    /// Per-agent max steps per run (tool rounds)
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
}

const fn default_max_steps() -> u32 {
    24
}

/// Selector half of a binding; absent fields match any value
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BindingSelector {
    pub channel: String,
    #[serde(default)]
    pub account: Option<String>,
    /// Peer id or `*`
    #[serde(default)]
    pub peer: Option<String>,
    /// Group id or `*`
    #[serde(default)]
    pub group: Option<String>,
}

/// Configuration rule mapping inbound tuples to an agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindingConfig {
    #[serde(flatten)]
    pub selector: BindingSelector,
    pub agent: String,
}

/// Per-channel behavior knobs consumed by the core
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub dm_policy: DmPolicy,
    #[serde(default)]
    pub group_policy: GroupPolicy,
    #[serde(default)]
    pub session_scope: SessionScopePolicy,
    /// Peers always admitted under the allowlist policy
    #[serde(default)]
    pub allowlist: Vec<String>,
    /// Coalescing window for bursts of inbound messages, 0 disables
    #[serde(default)]
    pub debounce_ms: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dm_policy: DmPolicy::default(),
            group_policy: GroupPolicy::default(),
            session_scope: SessionScopePolicy::default(),
            allowlist: Vec::new(),
            debounce_ms: 0,
        }
    }
}

/// One credential for one LLM provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderProfileConfig {
    /// Profile id, unique across the pool
    pub id: String,
    /// Provider name, e.g. `anthropic`
    pub provider: String,
    /// API key, or `env:VAR_NAME` to read from the environment
    pub api_key: String,
    /// Base URL override for self-hosted endpoints
    #[serde(default)]
    pub base_url: Option<String>,
}

/// Client token and the scopes it grants
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    pub token: String,
    pub scopes: Vec<Scope>,
}

/// Run-pool and lane limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Global cap on concurrently executing runs
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight_runs: usize,
    /// Idle window before a lane record is evicted, seconds
    #[serde(default = "default_lane_idle_secs")]
    pub lane_idle_eviction_secs: u64,
    /// Grace given to in-flight tool calls on abort, seconds
    #[serde(default = "default_abort_grace_secs")]
    pub abort_grace_secs: u64,
    /// Session reset after this much idle time, seconds; 0 disables
    #[serde(default)]
    pub session_reset_idle_secs: u64,
    /// Reset sessions at a daily local-time boundary `HH:MM`
    #[serde(default)]
    pub session_reset_daily_at: Option<String>,
    /// Model context window used for compaction triggering
    #[serde(default = "default_context_window")]
    pub context_window_tokens: usize,
    /// LLM call timeout, seconds
    #[serde(default = "default_llm_timeout")]
    pub llm_timeout_secs: u64,
    /// Channel send timeout, seconds
    #[serde(default = "default_send_timeout")]
    pub channel_send_timeout_secs: u64,
}

const fn default_max_in_flight() -> usize {
    8
}
const fn default_lane_idle_secs() -> u64 {
    900
}
const fn default_abort_grace_secs() -> u64 {
    5
}
const fn default_context_window() -> usize {
    200_000
}
const fn default_llm_timeout() -> u64 {
    120
}
const fn default_send_timeout() -> u64 {
    15
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_in_flight_runs: default_max_in_flight(),
            lane_idle_eviction_secs: default_lane_idle_secs(),
            abort_grace_secs: default_abort_grace_secs(),
            session_reset_idle_secs: 0,
            session_reset_daily_at: None,
            context_window_tokens: default_context_window(),
            llm_timeout_secs: default_llm_timeout(),
            channel_send_timeout_secs: default_send_timeout(),
        }
    }
}

/// Per-connection RPC policy advertised in the handshake
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcPolicyConfig {
    #[serde(default = "default_rpc_port")]
    pub port: u16,
    /// Max frame payload in bytes
    #[serde(default = "default_max_payload")]
    pub max_payload: usize,
    /// Outbound buffer budget per connection in bytes
    #[serde(default = "default_max_buffered")]
    pub max_buffered: usize,
    /// Heartbeat tick interval in milliseconds
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,
}

const fn default_rpc_port() -> u16 {
    18999
}
const fn default_max_payload() -> usize {
    16 * 1024 * 1024
}
const fn default_max_buffered() -> usize {
    1024 * 1024
}
const fn default_tick_interval() -> u64 {
    30_000
}

impl Default for RpcPolicyConfig {
    fn default() -> Self {
        Self {
            port: default_rpc_port(),
            max_payload: default_max_payload(),
            max_buffered: default_max_buffered(),
            tick_interval_ms: default_tick_interval(),
        }
    }
}

/// Media store knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    /// Time-to-live for stored attachments, seconds
    #[serde(default = "default_media_ttl")]
    pub ttl_secs: u64,
    /// Max bytes fetched per attachment
    #[serde(default = "default_media_max_bytes")]
    pub max_fetch_bytes: u64,
    /// Fetch timeout, seconds
    #[serde(default = "default_media_timeout")]
    pub fetch_timeout_secs: u64,
    /// Allow fetches that resolve to private address ranges
    #[serde(default)]
    pub allow_private_networks: bool,
}

const fn default_media_ttl() -> u64 {
    7 * 24 * 3600
}
const fn default_media_max_bytes() -> u64 {
    32 * 1024 * 1024
}
const fn default_media_timeout() -> u64 {
    30
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_media_ttl(),
            max_fetch_bytes: default_media_max_bytes(),
            fetch_timeout_secs: default_media_timeout(),
            allow_private_networks: false,
        }
    }
}

/// Root gateway configuration snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Data directory for transcripts, profiles, media
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Base system prompt layered under every agent
    #[serde(default)]
    pub base_prompt: String,
    /// Agent used when no binding matches; absent means routing fails
    #[serde(default)]
    pub default_agent: Option<String>,
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
    /// Walked in declaration order; first match wins
    #[serde(default)]
    pub bindings: Vec<BindingConfig>,
    #[serde(default)]
    pub channels: HashMap<String, ChannelConfig>,
    #[serde(default)]
    pub providers: Vec<ProviderProfileConfig>,
    #[serde(default)]
    pub tokens: Vec<TokenConfig>,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub rpc: RpcPolicyConfig,
    #[serde(default)]
    pub media: MediaConfig,
    /// Skill manifest directories
    #[serde(default)]
    pub skill_dirs: Vec<PathBuf>,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./switchboard-data")
}

impl Config {
    /// Look up an agent by id
    #[must_use]
    pub fn agent(&self, id: &str) -> Option<&AgentConfig> {
        self.agents.iter().find(|a| a.id == id)
    }

    /// Channel config, falling back to defaults for unknown channels
    #[must_use]
    pub fn channel(&self, id: &str) -> ChannelConfig {
        self.channels.get(id).cloned().unwrap_or_default()
    }

    /// Validate cross-references before publishing a snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when a binding or default points at an
    /// unknown agent, or agent ids collide.
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for agent in &self.agents {
            if !seen.insert(agent.id.as_str()) {
                return Err(Error::Config(format!("duplicate agent id: {}", agent.id)));
            }
        }
        for binding in &self.bindings {
            if self.agent(&binding.agent).is_none() {
                return Err(Error::Config(format!(
                    "binding references unknown agent: {}",
                    binding.agent
                )));
            }
        }
        if let Some(ref default) = self.default_agent {
            if self.agent(default).is_none() {
                return Err(Error::Config(format!(
                    "default_agent references unknown agent: {default}"
                )));
            }
        }
        Ok(())
    }
}

/// Copy-on-write handle to the live configuration
#[derive(Clone)]
pub struct ConfigHandle {
    inner: Arc<RwLock<Arc<Config>>>,
}

impl ConfigHandle {
    /// Wrap a validated config as the initial snapshot
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    /// Current snapshot; callers keep it for the duration of one decision
    #[must_use]
    pub fn snapshot(&self) -> Arc<Config> {
        self.inner
            .read()
            .map(|guard| Arc::clone(&guard))
            .unwrap_or_default()
    }

    /// Atomically publish a new snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when validation fails; the previous
    /// snapshot stays live.
    pub fn replace(&self, config: Config) -> Result<()> {
        config.validate()?;
        if let Ok(mut guard) = self.inner.write() {
            *guard = Arc::new(config);
        }
        Ok(())
    }
}
