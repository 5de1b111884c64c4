//! Shared test harness
//!
//! Builds a full runner + scheduler stack over temp directories with a
//! scripted mock LLM provider and the loopback channel.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use switchboard::agent::AgentRunner;
use switchboard::cancel::CancelToken;
use switchboard::channels::loopback::LoopbackChannel;
use switchboard::channels::{ChannelRegistry, LifecycleAdapter as _};
use switchboard::config::{Config, ConfigHandle};
use switchboard::events::{EventBus, GatewayEvent, Subscription};
use switchboard::llm::{
    ChatOutcome, ChatRequest, LlmProvider, ProviderError, ProviderRegistry, ProviderResult,
    StopReason, StreamEvent, ToolCallRequest,
};
use switchboard::outbound::OutboundDeliverer;
use switchboard::providers::store::ProfileStore;
use switchboard::providers::{AuthProfile, AuthProfilePool, ErrorClass, ProfileHandle};
use switchboard::routing::{ChatKind, Envelope};
use switchboard::scheduler::LaneScheduler;
use switchboard::security::ScopeSet;
use switchboard::session::store::SessionStore;
use switchboard::session::SessionKey;
use switchboard::skills::SkillRegistry;
use switchboard::tools::{ApprovalBroker, Tool, ToolContext, ToolOutput, ToolRegistry};

/// One scripted provider response
#[derive(Debug, Clone)]
pub enum MockStep {
    /// Stream the text as one delta and finish
    Reply(String),
    /// Request a tool call
    ToolUse { name: String, params: serde_json::Value },
    /// Fail with the given class
    Fail(ErrorClass),
    /// Sleep (cancellable) then reply
    SlowReply(Duration, String),
}

/// Scripted LLM provider; an exhausted script answers "summary"
pub struct MockProvider {
    name: String,
    script: Mutex<VecDeque<MockStep>>,
    pub used_profiles: Mutex<Vec<String>>,
}

impl MockProvider {
    pub fn new(name: &str, steps: Vec<MockStep>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            script: Mutex::new(steps.into()),
            used_profiles: Mutex::new(Vec::new()),
        })
    }

    pub fn push_steps(&self, steps: Vec<MockStep>) {
        let mut script = self.script.lock().unwrap();
        script.extend(steps);
    }
}

#[async_trait]
impl LlmProvider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(
        &self,
        auth: &ProfileHandle,
        _request: ChatRequest,
        sink: mpsc::Sender<StreamEvent>,
        cancel: CancelToken,
    ) -> ProviderResult<ChatOutcome> {
        self.used_profiles.lock().unwrap().push(auth.id.clone());
        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| MockStep::Reply("summary".to_string()));

        match step {
            MockStep::Reply(text) => {
                let _ = sink.send(StreamEvent::TextDelta(text.clone())).await;
                Ok(ChatOutcome {
                    text,
                    tool_calls: Vec::new(),
                    stop: StopReason::EndTurn,
                })
            }
            MockStep::ToolUse { name, params } => Ok(ChatOutcome {
                text: String::new(),
                tool_calls: vec![ToolCallRequest {
                    id: format!("call-{name}"),
                    name,
                    params,
                }],
                stop: StopReason::ToolUse,
            }),
            MockStep::Fail(class) => Err(ProviderError::new(class, "scripted failure")),
            MockStep::SlowReply(delay, text) => {
                tokio::select! {
                    () = tokio::time::sleep(delay) => Ok(ChatOutcome {
                        text: text.clone(),
                        tool_calls: Vec::new(),
                        stop: StopReason::EndTurn,
                    }),
                    () = cancel.cancelled() => {
                        Err(ProviderError::new(ErrorClass::Timeout, "cancelled"))
                    }
                }
            }
        }
    }
}

/// Tool that blocks until cancelled or a long sleep elapses
pub struct SlowTool;

#[async_trait]
impl Tool for SlowTool {
    fn name(&self) -> &str {
        "slow_tool"
    }

    fn description(&self) -> &str {
        "Sleeps for a long time"
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object", "properties": {}, "required": []})
    }

    async fn execute(
        &self,
        _params: serde_json::Value,
        ctx: &ToolContext,
    ) -> switchboard::Result<ToolOutput> {
        tokio::select! {
            () = tokio::time::sleep(Duration::from_secs(60)) => {
                Ok(ToolOutput::ok("finally done", serde_json::Value::Null))
            }
            () = ctx.cancel.cancelled() => {
                Ok(ToolOutput::err("interrupted"))
            }
        }
    }
}

/// Fully wired runner + scheduler over temp storage
pub struct Harness {
    pub dir: tempfile::TempDir,
    pub config: ConfigHandle,
    pub sessions: Arc<SessionStore>,
    pub pool: Arc<AuthProfilePool>,
    pub provider: Arc<MockProvider>,
    pub bus: Arc<EventBus>,
    pub channel: Arc<LoopbackChannel>,
    pub approvals: Arc<ApprovalBroker>,
    pub scheduler: LaneScheduler,
}

/// Config with one agent on the mock provider and one binding for the
/// loopback channel
pub fn harness_config(profile_ids: &[&str]) -> Config {
    let mut config: Config = toml::from_str(
        r#"
        default_agent = "a1"

        [[agents]]
        id = "a1"
        model = "mock/test-model"

        [[bindings]]
        channel = "loop"
        peer = "*"
        agent = "a1"
        "#,
    )
    .unwrap();
    for id in profile_ids {
        config.providers.push(switchboard::config::ProviderProfileConfig {
            id: (*id).to_string(),
            provider: "mock".to_string(),
            api_key: format!("key-{id}"),
            base_url: None,
        });
    }
    config
}

pub async fn build_harness(steps: Vec<MockStep>, profile_ids: &[&str]) -> Harness {
    build_harness_with(steps, profile_ids, harness_config(profile_ids), ToolRegistry::with_builtins())
        .await
}

pub async fn build_harness_with(
    steps: Vec<MockStep>,
    profile_ids: &[&str],
    mut config: Config,
    mut tools: ToolRegistry,
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    config.data_dir = dir.path().to_path_buf();
    let config = ConfigHandle::new(config);

    let sessions = Arc::new(SessionStore::open(dir.path().join("sessions")).unwrap());
    let profiles: Vec<AuthProfile> = profile_ids
        .iter()
        .map(|id| AuthProfile {
            id: (*id).to_string(),
            provider: "mock".to_string(),
            api_key: format!("key-{id}"),
            base_url: None,
            state: Default::default(),
        })
        .collect();
    let pool = Arc::new(AuthProfilePool::new(
        profiles,
        Some(ProfileStore::new(dir.path().join("profiles.json"))),
    ));

    let provider = MockProvider::new("mock", steps);
    let mut providers = ProviderRegistry::new();
    providers.register(provider.clone());

    let channel = Arc::new(LoopbackChannel::new("loop"));
    let (sink, _inbound) = mpsc::channel(16);
    channel.start(sink).await.unwrap();
    let mut registry = ChannelRegistry::new();
    registry.register(channel.clone()).unwrap();

    let bus = Arc::new(EventBus::new());
    let approvals = Arc::new(ApprovalBroker::new());
    let deliverer = Arc::new(OutboundDeliverer::new(registry, Duration::from_secs(5)));

    tools.register(Arc::new(SlowTool));

    let runner = Arc::new(AgentRunner {
        config: config.clone(),
        sessions: Arc::clone(&sessions),
        pool: Arc::clone(&pool),
        providers,
        tools,
        bus: Arc::clone(&bus),
        deliverer,
        approvals: Arc::clone(&approvals),
        skills: Arc::new(SkillRegistry::new()),
    });

    let scheduler = LaneScheduler::new(runner, config.clone());
    scheduler.start();

    Harness {
        dir,
        config,
        sessions,
        pool,
        provider,
        bus,
        channel,
        approvals,
        scheduler,
    }
}

impl Harness {
    pub fn subscribe(&self) -> Subscription {
        self.bus
            .subscribe("test", ScopeSet::admin(), 8 * 1024 * 1024)
    }

    pub fn dm_envelope(&self, peer: &str, text: &str) -> Envelope {
        Envelope {
            channel: "loop".to_string(),
            account: "acc".to_string(),
            peer: peer.to_string(),
            chat_kind: ChatKind::Dm,
            group: None,
            from_display: peer.to_string(),
            timestamp: chrono::Utc::now(),
            text: text.to_string(),
            attachments: Vec::new(),
            reply_to: None,
            mentions: Vec::new(),
        }
    }

    pub fn session_key(&self, peer: &str) -> SessionKey {
        SessionKey::peer("a1", "loop", "acc", peer)
    }

    /// Wait until the lane for `key` is idle with an empty queue
    pub async fn wait_idle(&self, key: &SessionKey) {
        for _ in 0..400 {
            let status = self.scheduler.lane_status();
            let busy = status
                .get(&key.to_string())
                .is_some_and(|(state, depth)| state != "idle" || *depth > 0);
            if !busy && self.scheduler.active_run_ids().is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("lane never went idle");
    }

    /// Drain all currently queued bus events
    pub fn drain_events(&self, sub: &Subscription) -> Vec<GatewayEvent> {
        let mut events = Vec::new();
        while let Some(sequenced) = sub.try_next() {
            events.push(sequenced.event);
        }
        events
    }
}
