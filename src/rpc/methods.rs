//! Method table and dispatch
//!
//! Every method declares a required scope; the scope check runs before any
//! handler code. Handlers are thin delegations into the owning components
//! and translate internal errors at this boundary only.

use std::time::Duration;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::channels::{ChannelPlugin as _, LifecycleAdapter as _};
use crate::config::Config;
use crate::routing::{ChatKind, Envelope};
use crate::security::{Scope, ScopeSet};
use crate::session::store::SessionOverrides;
use crate::session::{SessionKey, SessionScope};
use crate::{Error, Result};

use super::GatewayState;

/// Retry backoff for transient persistence failures on `sessions.*`
const STORE_RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// The complete method table: name → required scope
const METHODS: &[(&str, Scope)] = &[
    ("sessions.list", Scope::Read),
    ("sessions.preview", Scope::Read),
    ("sessions.patch", Scope::Write),
    ("sessions.delete", Scope::Write),
    ("sessions.reset", Scope::Write),
    ("sessions.compact", Scope::Write),
    ("sessions.resolve", Scope::Read),
    ("chat.send", Scope::Write),
    ("chat.history", Scope::Read),
    ("chat.abort", Scope::Write),
    ("chat.inject", Scope::Write),
    ("agent", Scope::Write),
    ("agent.wait", Scope::Write),
    ("agent.identity", Scope::Read),
    ("approvals.resolve", Scope::Approvals),
    ("channels.status", Scope::Read),
    ("channels.logout", Scope::Write),
    ("config.get", Scope::Read),
    ("config.set", Scope::Admin),
    ("config.patch", Scope::Admin),
    ("config.apply", Scope::Admin),
    ("config.schema", Scope::Read),
    ("cron.list", Scope::Read),
    ("cron.add", Scope::Write),
    ("cron.update", Scope::Write),
    ("cron.remove", Scope::Write),
    ("cron.run", Scope::Write),
    ("models.list", Scope::Read),
    ("skills.status", Scope::Read),
    ("nodes.list", Scope::Read),
    ("nodes.describe", Scope::Read),
    ("nodes.invoke", Scope::Write),
    ("nodes.pair.begin", Scope::Pairing),
    ("nodes.pair.confirm", Scope::Pairing),
    ("nodes.pair.revoke", Scope::Pairing),
    ("health", Scope::Read),
    ("logs.tail", Scope::Read),
];

/// All method names, for the handshake feature list
#[must_use]
pub fn method_names() -> Vec<String> {
    METHODS.iter().map(|(name, _)| (*name).to_string()).collect()
}

/// Scope a method requires; `None` for unknown methods
#[must_use]
pub fn required_scope(method: &str) -> Option<Scope> {
    METHODS
        .iter()
        .find(|(name, _)| *name == method)
        .map(|(_, scope)| *scope)
}

/// Dispatch one request. The scope check happens before any handler runs.
///
/// # Errors
///
/// Returns typed errors translated to the wire shape by the caller.
pub async fn dispatch(
    state: &GatewayState,
    scopes: &ScopeSet,
    method: &str,
    params: Option<Value>,
) -> Result<Value> {
    let Some(required) = required_scope(method) else {
        return Err(Error::Invalid {
            message: format!("unknown method {method}"),
            field: Some("method".to_string()),
        });
    };
    if !scopes.allows(required) {
        return Err(Error::Forbidden(format!("method {method}")));
    }

    let params = params.unwrap_or_else(|| json!({}));
    match method {
        // Persistence-backed session methods retry one transient failure
        "sessions.list" => with_store_retry(|| sessions_list(state)).await,
        "sessions.preview" => with_store_retry(|| sessions_preview(state, &params)).await,
        "sessions.patch" => with_store_retry(|| sessions_patch(state, &params)).await,
        "sessions.delete" => with_store_retry(|| sessions_delete(state, &params)).await,
        "sessions.reset" => with_store_retry(|| sessions_reset(state, &params)).await,
        "sessions.compact" => sessions_compact(state, &params).await,
        "sessions.resolve" => sessions_resolve(state, &params),
        "chat.send" => chat_send(state, &params),
        "chat.history" => chat_history(state, &params),
        "chat.abort" => chat_abort(state, &params).await,
        "chat.inject" => chat_inject(state, &params),
        "agent" => agent_start(state, &params),
        "agent.wait" => agent_wait(state, &params).await,
        "agent.identity" => agent_identity(state, &params),
        "approvals.resolve" => approvals_resolve(state, &params),
        "channels.status" => channels_status(state),
        "channels.logout" => channels_logout(state, &params).await,
        "config.get" => config_get(state),
        "config.set" => config_set(state, &params),
        "config.patch" => config_patch(state, &params),
        "config.apply" => config_apply(state),
        "config.schema" => Ok(config_schema()),
        "cron.list" => Ok(json!({"jobs": state.cron.list()?})),
        "cron.add" => cron_add(state, &params),
        "cron.update" => cron_update(state, &params),
        "cron.remove" => cron_remove(state, &params),
        "cron.run" => cron_run(state, &params),
        "models.list" => models_list(state),
        "skills.status" => Ok(json!({"skills": state.skills.status()})),
        "nodes.list" => Ok(json!({"nodes": state.nodes.list()?})),
        "nodes.describe" => nodes_describe(state, &params),
        "nodes.invoke" => nodes_invoke(state, &params).await,
        "nodes.pair.begin" => nodes_pair_begin(state, &params),
        "nodes.pair.confirm" => nodes_pair_confirm(state, &params),
        "nodes.pair.revoke" => nodes_pair_revoke(state, &params),
        "health" => health(state),
        "logs.tail" => logs_tail(state, &params),
        _ => unreachable!("method table covers dispatch"),
    }
}

// -- Param helpers --

fn param<T: DeserializeOwned>(params: &Value, field: &str) -> Result<T> {
    let value = params.get(field).ok_or_else(|| Error::Invalid {
        message: format!("missing field {field}"),
        field: Some(field.to_string()),
    })?;
    serde_json::from_value(value.clone()).map_err(|e| Error::Invalid {
        message: format!("bad field {field}: {e}"),
        field: Some(field.to_string()),
    })
}

fn opt_param<T: DeserializeOwned>(params: &Value, field: &str) -> Result<Option<T>> {
    match params.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value.clone())
            .map(Some)
            .map_err(|e| Error::Invalid {
                message: format!("bad field {field}: {e}"),
                field: Some(field.to_string()),
            }),
    }
}

fn session_key_param(params: &Value) -> Result<SessionKey> {
    let raw: String = param(params, "session_key")?;
    SessionKey::parse(&raw)
}

/// Retry a store operation once on transient failure
async fn with_store_retry<T>(mut op: impl FnMut() -> Result<T>) -> Result<T> {
    match op() {
        Err(Error::Io(_) | Error::StoreUnavailable(_)) => {
            tokio::time::sleep(STORE_RETRY_BACKOFF).await;
            op().map_err(|e| match e {
                Error::Io(io) => Error::StoreUnavailable(io.to_string()),
                other => other,
            })
        }
        other => other,
    }
}

/// Mutating a transcript outside a run requires the lane to be quiet, so
/// the lane's exclusive write ownership is never violated.
fn ensure_lane_quiet(state: &GatewayState, key: &SessionKey) -> Result<()> {
    let status = state.scheduler.lane_status();
    let busy = status
        .get(&key.to_string())
        .is_some_and(|(lane_state, depth)| lane_state != "idle" || *depth > 0);
    if busy {
        return Err(Error::Conflict(format!("session {key} has an active run")));
    }
    Ok(())
}

// -- Session methods --

fn sessions_list(state: &GatewayState) -> Result<Value> {
    Ok(json!({"sessions": state.sessions.list()?}))
}

fn sessions_preview(state: &GatewayState, params: &Value) -> Result<Value> {
    let key = session_key_param(params)?;
    let limit: usize = opt_param(params, "limit")?.unwrap_or(20);
    let events = state.sessions.preview(&key, limit)?;
    Ok(json!({"session_key": key, "events": events}))
}

fn sessions_patch(state: &GatewayState, params: &Value) -> Result<Value> {
    let key = session_key_param(params)?;
    let overrides: SessionOverrides = opt_param(params, "overrides")?.unwrap_or_default();
    let label: Option<String> = opt_param(params, "label")?;
    let meta = state.sessions.patch(&key, &overrides, label)?;
    Ok(json!({"session_key": key, "meta": meta}))
}

fn sessions_delete(state: &GatewayState, params: &Value) -> Result<Value> {
    let key = session_key_param(params)?;
    let purge: bool = opt_param(params, "purge")?.unwrap_or(false);
    ensure_lane_quiet(state, &key)?;
    state.sessions.delete(&key, purge)?;
    Ok(json!({"deleted": key}))
}

fn sessions_reset(state: &GatewayState, params: &Value) -> Result<Value> {
    let key = session_key_param(params)?;
    ensure_lane_quiet(state, &key)?;
    state.sessions.reset(&key, "requested by client")?;
    Ok(json!({"reset": key}))
}

/// Compact a session on demand through the same provider path runs use
async fn sessions_compact(state: &GatewayState, params: &Value) -> Result<Value> {
    let key = session_key_param(params)?;
    ensure_lane_quiet(state, &key)?;

    let config = state.config.snapshot();
    let agent = config
        .agent(&key.agent_id)
        .ok_or_else(|| Error::NotFound(format!("agent {}", key.agent_id)))?;

    let events = state.sessions.read_transcript(&key)?;
    let summarizer = crate::agent::runner::PoolSummarizer {
        pool: std::sync::Arc::clone(&state.pool),
        providers: state.providers.clone(),
        model_ref: agent.model.clone(),
    };
    let outcome =
        crate::context::compaction::compact(&key.to_string(), &events, &summarizer).await?;

    let mut transcript = state.sessions.open_transcript(&key)?;
    transcript.rewrite(outcome.events)?;
    state.sessions.touch(&key, Some(0))?;

    Ok(json!({
        "session_key": key,
        "tokens_before": outcome.tokens_before,
        "tokens_after": outcome.tokens_after,
        "chunks_summarized": outcome.chunks_summarized,
    }))
}

fn sessions_resolve(state: &GatewayState, params: &Value) -> Result<Value> {
    let channel: String = param(params, "channel")?;
    let account: String = opt_param(params, "account")?.unwrap_or_else(|| "default".to_string());
    let peer: String = param(params, "peer")?;
    let chat_kind: ChatKind = opt_param(params, "chat_kind")?.unwrap_or(ChatKind::Dm);

    let envelope = Envelope {
        channel,
        account,
        peer,
        chat_kind,
        group: opt_param(params, "group")?,
        from_display: String::new(),
        timestamp: Utc::now(),
        text: String::new(),
        attachments: Vec::new(),
        reply_to: None,
        mentions: Vec::new(),
    };
    let decision = crate::routing::resolve(&envelope, &state.config.snapshot());
    Ok(serde_json::to_value(decision)?)
}

// -- Chat methods --

fn chat_send(state: &GatewayState, params: &Value) -> Result<Value> {
    let text: String = param(params, "text")?;
    if text.trim().is_empty() {
        return Err(Error::Invalid {
            message: "text must not be empty".to_string(),
            field: Some("text".to_string()),
        });
    }

    let key = if params.get("session_key").is_some() {
        let key = session_key_param(params)?;
        if state.config.snapshot().agent(&key.agent_id).is_none() {
            return Err(Error::NotFound(format!("agent {}", key.agent_id)));
        }
        key
    } else {
        // Route a raw tuple through the resolver
        let channel: String = param(params, "channel")?;
        let account: String =
            opt_param(params, "account")?.unwrap_or_else(|| "default".to_string());
        let peer: String = param(params, "peer")?;
        let envelope = Envelope {
            channel,
            account,
            peer,
            chat_kind: ChatKind::Dm,
            group: None,
            from_display: "client".to_string(),
            timestamp: Utc::now(),
            text: text.clone(),
            attachments: Vec::new(),
            reply_to: None,
            mentions: Vec::new(),
        };
        let decision = crate::routing::resolve(&envelope, &state.config.snapshot());
        if let Some(reason) = decision.policy.blocked {
            return Err(Error::NotFound(format!("no route: {reason:?}")));
        }
        decision.session_key
    };

    let envelope = envelope_for_key(&key, &text);
    state.scheduler.enqueue(&key, envelope)?;
    Ok(json!({"queued": true, "session_key": key}))
}

fn chat_history(state: &GatewayState, params: &Value) -> Result<Value> {
    let key = session_key_param(params)?;
    let limit: usize = opt_param(params, "limit")?.unwrap_or(50);
    Ok(json!({"session_key": key, "events": state.sessions.preview(&key, limit)?}))
}

async fn chat_abort(state: &GatewayState, params: &Value) -> Result<Value> {
    let drop_pending: bool = opt_param(params, "drop_pending")?.unwrap_or(false);

    if let Some(run_id) = opt_param::<Uuid>(params, "run_id")? {
        state.scheduler.abort_run(run_id, drop_pending).await?;
        return Ok(json!({"aborted": run_id}));
    }

    let key = session_key_param(params)?;
    let aborted = state.scheduler.abort(&key, drop_pending).await;
    Ok(json!({"aborted": aborted, "session_key": key}))
}

fn chat_inject(state: &GatewayState, params: &Value) -> Result<Value> {
    let key = session_key_param(params)?;
    let text: String = param(params, "text")?;
    ensure_lane_quiet(state, &key)?;
    state.sessions.get_or_create(&key)?;
    let mut transcript = state.sessions.open_transcript(&key)?;
    let event = transcript.append(crate::session::transcript::TranscriptKind::SystemNote {
        text,
    })?;
    Ok(json!({"session_key": key, "seq": event.seq}))
}

// -- Agent methods --

fn agent_start(state: &GatewayState, params: &Value) -> Result<Value> {
    let agent_id: String = param(params, "agent_id")?;
    let text: String = param(params, "text")?;
    if state.config.snapshot().agent(&agent_id).is_none() {
        return Err(Error::NotFound(format!("agent {agent_id}")));
    }

    let key = match opt_param::<String>(params, "session_key")? {
        Some(raw) => SessionKey::parse(&raw)?,
        None => SessionKey::main_thread(&agent_id, &Uuid::new_v4().to_string()),
    };

    let envelope = envelope_for_key(&key, &text);
    state.scheduler.enqueue(&key, envelope)?;
    Ok(json!({"session_key": key}))
}

async fn agent_wait(state: &GatewayState, params: &Value) -> Result<Value> {
    let key = session_key_param(params)?;
    let timeout_ms: u64 = opt_param(params, "timeout_ms")?.unwrap_or(60_000);
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);

    loop {
        let status = state.scheduler.lane_status();
        let busy = status
            .get(&key.to_string())
            .is_some_and(|(s, depth)| s != "idle" || *depth > 0);
        if !busy {
            return Ok(json!({"session_key": key, "idle": true}));
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(Error::AgentTimeout(format!("session {key} still busy")));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn agent_identity(state: &GatewayState, params: &Value) -> Result<Value> {
    let agent_id: String = param(params, "agent_id")?;
    let config = state.config.snapshot();
    let agent = config
        .agent(&agent_id)
        .ok_or_else(|| Error::NotFound(format!("agent {agent_id}")))?;
    Ok(json!({
        "id": agent.id,
        "model": agent.model,
        "fallback_models": agent.fallback_models,
        "thinking": agent.thinking,
        "max_steps": agent.max_steps,
    }))
}

fn approvals_resolve(state: &GatewayState, params: &Value) -> Result<Value> {
    let approval_id: Uuid = param(params, "approval_id")?;
    let approve: bool = param(params, "approve")?;
    let resolved = state.approvals.resolve(approval_id, approve);
    if !resolved {
        return Err(Error::NotFound(format!("approval {approval_id}")));
    }
    Ok(json!({"resolved": approval_id, "approved": approve}))
}

// -- Channel methods --

fn channels_status(state: &GatewayState) -> Result<Value> {
    Ok(json!({
        "channels": state.channels.capability_map(),
        "linked": state.channels.link_status(),
    }))
}

async fn channels_logout(state: &GatewayState, params: &Value) -> Result<Value> {
    let channel: String = param(params, "channel")?;
    let plugin = state
        .channels
        .get(&channel)
        .ok_or_else(|| Error::NotFound(format!("channel {channel}")))?;
    match plugin.lifecycle() {
        Some(lifecycle) => {
            lifecycle.stop().await?;
            Ok(json!({"channel": channel, "linked": false}))
        }
        None => Err(Error::ChannelNotLinked(channel)),
    }
}

// -- Config methods --

fn config_get(state: &GatewayState) -> Result<Value> {
    let mut value = serde_json::to_value(&*state.config.snapshot())?;
    redact_config(&mut value);
    Ok(value)
}

fn config_set(state: &GatewayState, params: &Value) -> Result<Value> {
    let config_value = params.get("config").ok_or_else(|| Error::Invalid {
        message: "missing field config".to_string(),
        field: Some("config".to_string()),
    })?;
    let config: Config = serde_json::from_value(config_value.clone())?;
    state.config.replace(config)?;
    state.logs.push("config replaced via rpc");
    Ok(json!({"applied": true}))
}

fn config_patch(state: &GatewayState, params: &Value) -> Result<Value> {
    let patch = params.get("patch").ok_or_else(|| Error::Invalid {
        message: "missing field patch".to_string(),
        field: Some("patch".to_string()),
    })?;
    let mut current = serde_json::to_value(&*state.config.snapshot())?;
    merge_json(&mut current, patch);
    let config: Config = serde_json::from_value(current)?;
    state.config.replace(config)?;
    state.logs.push("config patched via rpc");
    Ok(json!({"applied": true}))
}

fn config_apply(state: &GatewayState) -> Result<Value> {
    let path = state
        .config_path
        .as_deref()
        .ok_or_else(|| Error::NotFound("no config file to reload".to_string()))?;
    let config = crate::config::file::load(Some(path))?;
    state.config.replace(config)?;
    state.logs.push("config reloaded from file");
    Ok(json!({"applied": true}))
}

fn config_schema() -> Value {
    json!({
        "sections": {
            "agents": "agent personas: id, model, fallback_models, thinking, persona, tool_policies",
            "bindings": "first-match routing rules: channel, account?, peer?|group?, agent",
            "channels": "per-channel policy: dm_policy, group_policy, session_scope, debounce_ms",
            "providers": "auth profiles: id, provider, api_key, base_url?",
            "tokens": "client tokens and their scopes",
            "limits": "run pool, timeouts, reset and compaction windows",
            "rpc": "listener port and per-connection policy",
            "media": "attachment TTL and fetch bounds",
        }
    })
}

/// Blank out credentials before the config leaves the process
fn redact_config(value: &mut Value) {
    if let Some(providers) = value.get_mut("providers").and_then(Value::as_array_mut) {
        for profile in providers {
            if let Some(key) = profile.get_mut("api_key") {
                *key = json!("<redacted>");
            }
        }
    }
    if let Some(tokens) = value.get_mut("tokens").and_then(Value::as_array_mut) {
        for token in tokens {
            if let Some(secret) = token.get_mut("token") {
                *secret = json!("<redacted>");
            }
        }
    }
}

/// Recursive JSON merge: objects merge, everything else replaces
fn merge_json(base: &mut Value, patch: &Value) {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            for (key, patch_value) in patch_map {
                match base_map.get_mut(key) {
                    Some(base_value) => merge_json(base_value, patch_value),
                    None => {
                        base_map.insert(key.clone(), patch_value.clone());
                    }
                }
            }
        }
        (base_slot, patch_value) => *base_slot = patch_value.clone(),
    }
}

// -- Cron methods --

fn cron_add(state: &GatewayState, params: &Value) -> Result<Value> {
    let schedule = param(params, "schedule")?;
    let agent_id: String = param(params, "agent_id")?;
    let text: String = param(params, "text")?;
    if state.config.snapshot().agent(&agent_id).is_none() {
        return Err(Error::NotFound(format!("agent {agent_id}")));
    }
    Ok(json!({"job": state.cron.add(schedule, &agent_id, &text)?}))
}

fn cron_update(state: &GatewayState, params: &Value) -> Result<Value> {
    let id: Uuid = param(params, "id")?;
    let job = state.cron.update(
        id,
        opt_param(params, "schedule")?,
        opt_param(params, "text")?,
        opt_param(params, "enabled")?,
    )?;
    Ok(json!({"job": job}))
}

fn cron_remove(state: &GatewayState, params: &Value) -> Result<Value> {
    let id: Uuid = param(params, "id")?;
    state.cron.remove(id)?;
    Ok(json!({"removed": id}))
}

fn cron_run(state: &GatewayState, params: &Value) -> Result<Value> {
    let id: Uuid = param(params, "id")?;
    state.cron.run_now(id, &state.scheduler)?;
    Ok(json!({"fired": id}))
}

// -- Misc methods --

fn models_list(state: &GatewayState) -> Result<Value> {
    let config = state.config.snapshot();
    let mut models: Vec<String> = config.agents.iter().map(|a| a.model.clone()).collect();
    for agent in &config.agents {
        models.extend(agent.fallback_models.iter().cloned());
    }
    models.sort();
    models.dedup();
    Ok(json!({
        "providers": state.providers.names(),
        "models": models,
    }))
}

fn nodes_describe(state: &GatewayState, params: &Value) -> Result<Value> {
    let node_id: String = param(params, "node_id")?;
    Ok(json!({"node": state.nodes.describe(&node_id)?}))
}

async fn nodes_invoke(state: &GatewayState, params: &Value) -> Result<Value> {
    let node_id: String = param(params, "node_id")?;
    let command: String = param(params, "command")?;
    let invoke_params = params.get("params").cloned().unwrap_or_else(|| json!({}));
    let result = state.nodes.invoke(&node_id, &command, invoke_params).await?;
    Ok(serde_json::to_value(result)?)
}

fn nodes_pair_begin(state: &GatewayState, params: &Value) -> Result<Value> {
    let node_id: String = param(params, "node_id")?;
    match state.nodes.pair_begin(&node_id)? {
        Some(code) => Ok(json!({"node_id": node_id, "code": code})),
        None => Err(Error::Conflict(format!("node {node_id} already paired"))),
    }
}

fn nodes_pair_confirm(state: &GatewayState, params: &Value) -> Result<Value> {
    let node_id: String = param(params, "node_id")?;
    let code: String = param(params, "code")?;
    let name: String = param(params, "name")?;
    let public_key: String = param(params, "public_key")?;
    let commands = opt_param(params, "commands")?.unwrap_or_default();
    let record = state
        .nodes
        .pair_confirm(&node_id, &code, &name, &public_key, commands)?;
    // A paired node's identity is also a trusted device for the handshake
    state.devices.trust(
        crate::security::device::DeviceIdentity::from_public(&node_id, &public_key, &name),
    )?;
    Ok(json!({"node": record}))
}

fn nodes_pair_revoke(state: &GatewayState, params: &Value) -> Result<Value> {
    let node_id: String = param(params, "node_id")?;
    state.nodes.pair_revoke(&node_id)?;
    let _ = state.devices.revoke(&node_id);
    Ok(json!({"revoked": node_id}))
}

fn health(state: &GatewayState) -> Result<Value> {
    let uptime = (Utc::now() - state.started_at).num_seconds();
    Ok(json!({
        "ok": true,
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": uptime,
        "active_runs": state.scheduler.active_run_ids().len(),
        "channels": state.channels.link_status(),
        "subscribers": state.bus.subscriber_count(),
    }))
}

fn logs_tail(state: &GatewayState, params: &Value) -> Result<Value> {
    let limit: usize = opt_param(params, "limit")?.unwrap_or(100);
    let lines: Vec<Value> = state
        .logs
        .tail(limit)
        .into_iter()
        .map(|(ts, line)| json!({"ts": ts, "line": line}))
        .collect();
    Ok(json!({"lines": lines}))
}

/// Synthesize the envelope for a client-originated message on `key`
fn envelope_for_key(key: &SessionKey, text: &str) -> Envelope {
    let (channel, account, peer, chat_kind, group) = match &key.scope {
        SessionScope::Peer {
            channel,
            account,
            peer,
        } => (
            channel.clone(),
            account.clone(),
            peer.clone(),
            ChatKind::Dm,
            None,
        ),
        SessionScope::Group {
            channel,
            account,
            group,
            peer,
        } => (
            channel.clone(),
            account.clone(),
            peer.clone().unwrap_or_else(|| "client".to_string()),
            ChatKind::Group,
            Some(group.clone()),
        ),
        SessionScope::MainThread { thread_id } => (
            "main".to_string(),
            "rpc".to_string(),
            thread_id.clone(),
            ChatKind::Thread,
            Some(thread_id.clone()),
        ),
        SessionScope::MainTopic { topic_id } => (
            "main".to_string(),
            "rpc".to_string(),
            topic_id.clone(),
            ChatKind::Dm,
            None,
        ),
        SessionScope::Subagent {
            parent_run_id,
            subagent_id,
        } => (
            "main".to_string(),
            parent_run_id.clone(),
            subagent_id.clone(),
            ChatKind::Dm,
            None,
        ),
    };

    Envelope {
        channel,
        account,
        peer,
        chat_kind,
        group,
        from_display: "client".to_string(),
        timestamp: Utc::now(),
        text: text.to_string(),
        attachments: Vec::new(),
        reply_to: None,
        mentions: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_method_declares_a_scope() {
        assert!(required_scope("sessions.list").is_some());
        assert!(required_scope("nodes.pair.begin").is_some());
        assert!(required_scope("nope.method").is_none());
        assert_eq!(method_names().len(), METHODS.len());
    }

    #[test]
    fn scope_assignments_match_categories() {
        assert_eq!(required_scope("sessions.list"), Some(Scope::Read));
        assert_eq!(required_scope("chat.send"), Some(Scope::Write));
        assert_eq!(required_scope("approvals.resolve"), Some(Scope::Approvals));
        assert_eq!(required_scope("nodes.pair.confirm"), Some(Scope::Pairing));
        assert_eq!(required_scope("config.set"), Some(Scope::Admin));
    }

    #[test]
    fn merge_json_merges_objects_and_replaces_scalars() {
        let mut base = json!({"a": {"b": 1, "c": 2}, "d": 3});
        merge_json(&mut base, &json!({"a": {"b": 9}, "e": 4}));
        assert_eq!(base, json!({"a": {"b": 9, "c": 2}, "d": 3, "e": 4}));
    }

    #[test]
    fn redaction_hides_secrets() {
        let mut value = json!({
            "providers": [{"id": "p1", "api_key": "sk-real"}],
            "tokens": [{"token": "secret", "scopes": ["read"]}],
        });
        redact_config(&mut value);
        assert_eq!(value["providers"][0]["api_key"], json!("<redacted>"));
        assert_eq!(value["tokens"][0]["token"], json!("<redacted>"));
    }

    #[test]
    fn envelope_for_peer_key_restores_tuple() {
        let key = SessionKey::peer("a1", "x", "acc", "u1");
        let envelope = envelope_for_key(&key, "hi");
        assert_eq!(envelope.channel, "x");
        assert_eq!(envelope.account, "acc");
        assert_eq!(envelope.peer, "u1");
        assert_eq!(envelope.chat_kind, ChatKind::Dm);
    }
}
