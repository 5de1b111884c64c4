//! RPC dispatch: scope enforcement and method behavior

use std::sync::Arc;

use serde_json::json;
use switchboard::channels::loopback::LoopbackChannel;
use switchboard::channels::ChannelRegistry;
use switchboard::config::Config;
use switchboard::rpc::methods;
use switchboard::rpc::GatewayState;
use switchboard::security::{Scope, ScopeSet};
use switchboard::tools::ToolRegistry;
use switchboard::{Error, Gateway};

fn test_config(dir: &std::path::Path) -> Config {
    let mut config: Config = toml::from_str(
        r#"
        default_agent = "a1"

        [[agents]]
        id = "a1"
        model = "anthropic/claude-sonnet-4"

        [[tokens]]
        token = "admin-token"
        scopes = ["admin"]
        "#,
    )
    .unwrap();
    config.data_dir = dir.to_path_buf();
    config
}

fn build_state(dir: &std::path::Path) -> Arc<GatewayState> {
    let mut channels = ChannelRegistry::new();
    channels
        .register(Arc::new(LoopbackChannel::new("loop")))
        .unwrap();
    let gateway = Gateway::new(
        test_config(dir),
        None,
        channels,
        ToolRegistry::with_builtins(),
    )
    .unwrap();
    gateway.state()
}

/// Property 5: a token without the required scope gets a typed rejection
/// and the handler never runs.
#[tokio::test]
async fn missing_scope_is_rejected_without_side_effects() {
    let dir = tempfile::tempdir().unwrap();
    let state = build_state(dir.path());
    let read_only = ScopeSet::new(vec![Scope::Read]);

    let result = methods::dispatch(
        &state,
        &read_only,
        "chat.send",
        Some(json!({"channel": "loop", "peer": "u1", "text": "hi"})),
    )
    .await;
    assert!(matches!(result, Err(Error::Forbidden(_))));

    // No lane picked it up, no session appeared
    assert!(state.scheduler.lane_status().is_empty());
    assert!(state.sessions.list().unwrap().is_empty());
}

#[tokio::test]
async fn every_write_method_requires_write_scope() {
    let dir = tempfile::tempdir().unwrap();
    let state = build_state(dir.path());
    let read_only = ScopeSet::new(vec![Scope::Read]);

    for method in [
        "sessions.patch",
        "sessions.delete",
        "chat.send",
        "chat.abort",
        "agent",
        "cron.add",
        "nodes.invoke",
    ] {
        let result = methods::dispatch(&state, &read_only, method, None).await;
        assert!(
            matches!(result, Err(Error::Forbidden(_))),
            "{method} did not enforce its scope"
        );
    }
}

#[tokio::test]
async fn admin_implies_every_scope() {
    let dir = tempfile::tempdir().unwrap();
    let state = build_state(dir.path());
    let admin = ScopeSet::admin();

    // One method from each scope category
    assert!(methods::dispatch(&state, &admin, "sessions.list", None)
        .await
        .is_ok());
    assert!(methods::dispatch(&state, &admin, "health", None).await.is_ok());
    assert!(methods::dispatch(&state, &admin, "skills.status", None)
        .await
        .is_ok());
    assert!(methods::dispatch(&state, &admin, "config.get", None)
        .await
        .is_ok());
}

#[tokio::test]
async fn unknown_method_is_invalid_request() {
    let dir = tempfile::tempdir().unwrap();
    let state = build_state(dir.path());
    let result = methods::dispatch(&state, &ScopeSet::admin(), "nope.nothing", None).await;
    assert!(matches!(result, Err(Error::Invalid { .. })));
}

#[tokio::test]
async fn config_get_redacts_credentials() {
    let dir = tempfile::tempdir().unwrap();
    let state = build_state(dir.path());
    let payload = methods::dispatch(&state, &ScopeSet::admin(), "config.get", None)
        .await
        .unwrap();
    let tokens = payload["tokens"].as_array().unwrap();
    assert_eq!(tokens[0]["token"], json!("<redacted>"));
}

#[tokio::test]
async fn sessions_resolve_returns_deterministic_key() {
    let dir = tempfile::tempdir().unwrap();
    let state = build_state(dir.path());
    let params = json!({"channel": "loop", "account": "acc", "peer": "u1"});

    let a = methods::dispatch(
        &state,
        &ScopeSet::new(vec![Scope::Read]),
        "sessions.resolve",
        Some(params.clone()),
    )
    .await
    .unwrap();
    let b = methods::dispatch(
        &state,
        &ScopeSet::new(vec![Scope::Read]),
        "sessions.resolve",
        Some(params),
    )
    .await
    .unwrap();
    assert_eq!(a["session_key"], b["session_key"]);
    assert_eq!(a["agent_id"], json!("a1"));
}

#[tokio::test]
async fn chat_inject_appends_a_note() {
    let dir = tempfile::tempdir().unwrap();
    let state = build_state(dir.path());
    let admin = ScopeSet::admin();

    let key = "agent:a1:peer:loop:acc:u1";
    let payload = methods::dispatch(
        &state,
        &admin,
        "chat.inject",
        Some(json!({"session_key": key, "text": "operator note"})),
    )
    .await
    .unwrap();
    assert_eq!(payload["seq"], json!(0));

    let history = methods::dispatch(
        &state,
        &admin,
        "chat.history",
        Some(json!({"session_key": key})),
    )
    .await
    .unwrap();
    let events = history["events"].as_array().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["kind"], json!("system_note"));
}

#[tokio::test]
async fn health_reports_channels() {
    let dir = tempfile::tempdir().unwrap();
    let state = build_state(dir.path());
    let payload = methods::dispatch(&state, &ScopeSet::admin(), "health", None)
        .await
        .unwrap();
    assert_eq!(payload["ok"], json!(true));
    assert!(payload["channels"].get("loop").is_some());
}

#[tokio::test]
async fn cron_crud_through_rpc() {
    let dir = tempfile::tempdir().unwrap();
    let state = build_state(dir.path());
    let admin = ScopeSet::admin();

    let added = methods::dispatch(
        &state,
        &admin,
        "cron.add",
        Some(json!({
            "schedule": {"kind": "interval", "secs": 3600},
            "agent_id": "a1",
            "text": "hourly check",
        })),
    )
    .await
    .unwrap();
    let id = added["job"]["id"].clone();

    let listed = methods::dispatch(&state, &admin, "cron.list", None).await.unwrap();
    assert_eq!(listed["jobs"].as_array().unwrap().len(), 1);

    methods::dispatch(
        &state,
        &admin,
        "cron.remove",
        Some(json!({"id": id})),
    )
    .await
    .unwrap();
    let listed = methods::dispatch(&state, &admin, "cron.list", None).await.unwrap();
    assert!(listed["jobs"].as_array().unwrap().is_empty());
}
