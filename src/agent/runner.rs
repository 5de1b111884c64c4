//! Agent run loop
//!
//! Executes one Think–Tool–Act pass for one envelope: loads the session
//! under the lane's exclusive ownership, applies reset triggers and
//! compaction, walks the model fallback chain with auth-profile failover,
//! dispatches tool calls through the policy gate, and delivers the final
//! message back through the originating channel.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveTime, Utc};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::config::{AgentConfig, Config, ConfigHandle};
use crate::context::compaction::{self, Summarizer};
use crate::events::{ChatDirection, EventBus, GatewayEvent};
use crate::llm::{
    ChatMessage, ChatOutcome, ChatRequest, LlmProvider, ProviderRegistry, Role, StopReason,
    StreamEvent, ToolCallRequest, split_model_ref,
};
use crate::outbound::{DeliveryRequest, OutboundDeliverer};
use crate::providers::{AuthProfilePool, ErrorClass, ProfileHandle};
use crate::routing::{ChatKind, Envelope};
use crate::scheduler::RunExecutor;
use crate::session::store::SessionStore;
use crate::session::transcript::{Transcript, TranscriptKind};
use crate::session::{SessionKey, SessionScope};
use crate::skills::SkillRegistry;
use crate::tools::{
    ApprovalBroker, ApprovalResolution, ToolContext, ToolOutput, ToolRegistry, policy_for,
    validate_params,
};
use crate::{Error, Result};

use super::events::{RunEventKind, RunEventSink};
use super::{RunOutcome, RunStatus};

/// Model used when neither the agent nor its fallbacks resolve
pub const DEFAULT_MODEL: &str = "anthropic/claude-sonnet-4-5";

/// Per-model profile failover bound within one run
const MAX_PROFILE_ATTEMPTS: usize = 3;

/// Tool execution ceiling
const TOOL_TIMEOUT: Duration = Duration::from_secs(120);

/// How long an approval-gated tool waits for a client
const APPROVAL_TIMEOUT: Duration = Duration::from_secs(300);

/// Response token budget per completion
const MAX_COMPLETION_TOKENS: u32 = 8192;

/// Shared dependencies of the run loop
pub struct AgentRunner {
    pub config: ConfigHandle,
    pub sessions: Arc<SessionStore>,
    pub pool: Arc<AuthProfilePool>,
    pub providers: ProviderRegistry,
    pub tools: ToolRegistry,
    pub bus: Arc<EventBus>,
    pub deliverer: Arc<OutboundDeliverer>,
    pub approvals: Arc<ApprovalBroker>,
    pub skills: Arc<SkillRegistry>,
}

#[async_trait]
impl RunExecutor for AgentRunner {
    async fn execute(
        &self,
        session_key: SessionKey,
        envelope: Envelope,
        run_id: Uuid,
        cancel: CancelToken,
    ) -> RunOutcome {
        let mut sink = RunEventSink::new(run_id, session_key.clone(), Arc::clone(&self.bus));
        sink.emit(RunEventKind::Lifecycle {
            phase: "started".to_string(),
        });

        let result = self
            .run_inner(&session_key, &envelope, run_id, &cancel, &mut sink)
            .await;

        match result {
            Ok(text) => {
                let reason = if cancel.is_cancelled() {
                    "aborted"
                } else {
                    "completed"
                };
                sink.emit(RunEventKind::Final {
                    reason: reason.to_string(),
                    text: text.clone(),
                });
                RunOutcome {
                    run_id,
                    status: if cancel.is_cancelled() {
                        RunStatus::Aborted
                    } else {
                        RunStatus::Completed
                    },
                    text,
                }
            }
            Err(Error::Aborted(_)) => {
                sink.emit(RunEventKind::Final {
                    reason: "aborted".to_string(),
                    text: String::new(),
                });
                RunOutcome {
                    run_id,
                    status: RunStatus::Aborted,
                    text: String::new(),
                }
            }
            Err(error) => {
                tracing::warn!(run = %run_id, session = %session_key, error = %error, "run failed");
                // Already-streamed deltas are not rolled back
                let partial = sink.next_seq() > 1;
                let body = error.to_body();
                self.persist_error_note(&session_key, &body.message);
                sink.emit(RunEventKind::Error {
                    error: body,
                    partial,
                });
                RunOutcome {
                    run_id,
                    status: RunStatus::Failed,
                    text: String::new(),
                }
            }
        }
    }
}

impl AgentRunner {
    #[allow(clippy::too_many_lines)]
    async fn run_inner(
        &self,
        session_key: &SessionKey,
        envelope: &Envelope,
        run_id: Uuid,
        cancel: &CancelToken,
        sink: &mut RunEventSink,
    ) -> Result<String> {
        let config = self.config.snapshot();
        let agent = config
            .agent(&session_key.agent_id)
            .ok_or_else(|| Error::NotFound(format!("agent {}", session_key.agent_id)))?
            .clone();

        // Load session state; the lane guarantees exclusive write ownership
        let meta = self.sessions.get_or_create(session_key)?;
        let mut transcript = self.sessions.open_transcript(session_key)?;
        let mut context_start = meta.context_start_seq;

        // Reset triggers: idle window and daily rollover
        if let Some(reason) = reset_reason(&config, &meta) {
            transcript.append(TranscriptKind::SystemNote {
                text: format!("conversation reset: {reason}"),
            })?;
            context_start = transcript.next_seq();
            tracing::info!(session = %session_key, reason, "context reset");
        }

        self.bus.publish(GatewayEvent::Chat {
            session_key: session_key.clone(),
            direction: ChatDirection::Inbound,
            text: envelope.text.clone(),
        });

        // Persist the user turn before anything can fail
        transcript.append(TranscriptKind::UserMessage {
            text: envelope.text.clone(),
            from: Some(envelope.from_display.clone()),
            attachments: envelope.attachments.clone(),
        })?;

        // Compact when the estimate crosses the threshold
        let window = config.limits.context_window_tokens;
        if compaction::needs_compaction(transcript.estimated_tokens()?, window) {
            sink.emit(RunEventKind::Lifecycle {
                phase: "compacting".to_string(),
            });
            self.compact_transcript(session_key, &agent, &mut transcript)
                .await?;
            // Rewrite renumbers from zero
            context_start = 0;
        }

        let system_prompt = crate::context::assemble_system_prompt(
            &config.base_prompt,
            &agent.overlay,
            &agent.persona,
            &self.skills.enabled_instructions(),
        );

        // History excludes the just-appended user turn; the live turn gets
        // the normalized envelope header
        let events = transcript.read_all()?;
        let mut messages = vec![ChatMessage::text(Role::System, system_prompt)];
        messages.extend(crate::context::history_messages(
            &events[..events.len().saturating_sub(1)],
            context_start,
        ));
        messages.push(ChatMessage::text(
            Role::User,
            crate::context::format_envelope(envelope),
        ));

        let overrides = self.sessions.get(session_key)?.overrides;
        let thinking = overrides.thinking.unwrap_or(agent.thinking);
        let model_chain = model_chain(&agent, overrides.model.as_deref());
        let tool_specs = self.tools.specs_for(&agent.tool_policies);

        let mut final_text = String::new();
        let mut new_events: Vec<TranscriptKind> = Vec::new();

        'steps: for step in 0..agent.max_steps {
            if cancel.is_cancelled() {
                break;
            }

            sink.emit(RunEventKind::Lifecycle {
                phase: "calling_model".to_string(),
            });

            let request_base = ChatRequest {
                model: String::new(),
                messages: messages.clone(),
                tools: tool_specs.clone(),
                max_tokens: MAX_COMPLETION_TOKENS,
                thinking,
            };
            let outcome = self
                .call_with_failover(&model_chain, request_base, cancel, sink)
                .await?;

            if !outcome.text.is_empty() {
                final_text = outcome.text.clone();
            }

            if outcome.stop != StopReason::ToolUse || outcome.tool_calls.is_empty() {
                // Assistant turn complete
                new_events.push(TranscriptKind::AssistantMessage {
                    text: outcome.text,
                });
                break;
            }

            // Record the assistant turn that requested tools
            let mut assistant = ChatMessage::text(Role::Assistant, outcome.text.clone());
            assistant.tool_calls.clone_from(&outcome.tool_calls);
            messages.push(assistant);

            for call in &outcome.tool_calls {
                new_events.push(TranscriptKind::ToolCall {
                    call_id: call.id.clone(),
                    tool: call.name.clone(),
                    params: call.params.clone(),
                });

                let output = self
                    .dispatch_tool(&agent, session_key, call, cancel, sink)
                    .await;

                if !output.ok {
                    if let Some(tool) = self.tools.get(&call.name) {
                        if tool.fatal_on_error() {
                            new_events.push(TranscriptKind::ToolResult {
                                call_id: call.id.clone(),
                                ok: false,
                                content: output.content.clone(),
                            });
                            transcript.append_all(std::mem::take(&mut new_events))?;
                            return Err(Error::Tool(format!(
                                "fatal tool {} failed: {}",
                                call.name, output.content
                            )));
                        }
                    }
                }

                sink.emit(RunEventKind::ToolResult {
                    call_id: call.id.clone(),
                    ok: output.ok,
                    content: output.content.clone(),
                });
                new_events.push(TranscriptKind::ToolResult {
                    call_id: call.id.clone(),
                    ok: output.ok,
                    content: output.content.clone(),
                });
                messages.push(ChatMessage::tool_result(
                    call.id.clone(),
                    output.content,
                ));
            }

            if step + 1 == agent.max_steps {
                tracing::warn!(run = %run_id, "step limit reached");
                new_events.push(TranscriptKind::AssistantMessage {
                    text: final_text.clone(),
                });
                break 'steps;
            }
        }

        if cancel.is_cancelled() {
            // Drained in-flight tools; persist what happened, then surface
            transcript.append_all(new_events)?;
            self.sessions.touch(session_key, Some(context_start))?;
            return Err(Error::Aborted(format!("run {run_id}")));
        }

        // Persist the full delta atomically before delivery
        transcript.append_all(new_events)?;
        self.sessions.touch(session_key, Some(context_start))?;

        sink.emit(RunEventKind::Lifecycle {
            phase: "delivering".to_string(),
        });
        self.bus.publish(GatewayEvent::Chat {
            session_key: session_key.clone(),
            direction: ChatDirection::Outbound,
            text: final_text.clone(),
        });

        // Channel-originated sessions get the reply pushed back out
        if !final_text.is_empty() && deliverable(&session_key.scope, envelope) {
            let target = delivery_target(envelope);
            self.deliverer
                .deliver(DeliveryRequest {
                    channel: envelope.channel.clone(),
                    account: envelope.account.clone(),
                    target,
                    text: final_text.clone(),
                    media: Vec::new(),
                    reply_to: envelope.reply_to.clone(),
                    delivery_key: format!("{run_id}:final"),
                })
                .await?;
        }

        Ok(final_text)
    }

    /// Walk the model chain; inside each model, fail over across auth
    /// profiles for transient classes.
    async fn call_with_failover(
        &self,
        model_chain: &[String],
        request_base: ChatRequest,
        cancel: &CancelToken,
        sink: &mut RunEventSink,
    ) -> Result<ChatOutcome> {
        let mut last_unavailable = None;

        for model_ref in model_chain {
            let (provider_name, model) = split_model_ref(model_ref);
            let Some(provider) = self.providers.get(provider_name) else {
                tracing::debug!(provider = provider_name, "no provider registered, trying next model");
                continue;
            };

            let mut request = request_base.clone();
            request.model = model.to_string();

            match self
                .call_model(provider.as_ref(), provider_name, &request, cancel, sink)
                .await
            {
                Ok(outcome) => return Ok(outcome),
                Err(e @ Error::ProviderUnavailable(_)) => {
                    last_unavailable = Some(e);
                }
                Err(other) => return Err(other),
            }
        }

        Err(last_unavailable
            .unwrap_or_else(|| Error::ProviderUnavailable("no model could be served".to_string())))
    }

    /// One model, up to [`MAX_PROFILE_ATTEMPTS`] profiles
    async fn call_model(
        &self,
        provider: &dyn LlmProvider,
        provider_name: &str,
        request: &ChatRequest,
        cancel: &CancelToken,
        sink: &mut RunEventSink,
    ) -> Result<ChatOutcome> {
        for _attempt in 0..MAX_PROFILE_ATTEMPTS {
            if cancel.is_cancelled() {
                return Err(Error::Aborted("cancelled before model call".to_string()));
            }

            let profile = self.pool.select(provider_name)?;
            match self
                .invoke_streaming(provider, &profile, request.clone(), cancel, sink)
                .await
            {
                Ok(outcome) => {
                    self.pool.report_success(&profile.id)?;
                    return Ok(outcome);
                }
                Err(provider_error) => {
                    if cancel.is_cancelled() {
                        return Err(Error::Aborted("cancelled during model call".to_string()));
                    }
                    self.pool
                        .report_failure(&profile.id, provider_error.class)?;
                    if !provider_error.class.is_transient() {
                        // Billing/auth/format: try another profile once, the
                        // pool will refuse when none remains
                        match provider_error.class {
                            ErrorClass::Billing | ErrorClass::Auth => continue,
                            _ => {
                                return Err(Error::ProviderUnavailable(
                                    provider_error.message,
                                ))
                            }
                        }
                    }
                }
            }
        }
        Err(Error::ProviderUnavailable(format!(
            "profiles exhausted for {provider_name}"
        )))
    }

    /// Bridge the provider's stream into the run event sink
    async fn invoke_streaming(
        &self,
        provider: &dyn LlmProvider,
        profile: &ProfileHandle,
        request: ChatRequest,
        cancel: &CancelToken,
        sink: &mut RunEventSink,
    ) -> std::result::Result<ChatOutcome, crate::llm::ProviderError> {
        let (tx, mut rx) = mpsc::channel::<StreamEvent>(64);
        let call = provider.invoke(profile, request, tx, cancel.clone());
        tokio::pin!(call);

        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(StreamEvent::TextDelta(text)) => sink.push_delta(&text),
                    Some(StreamEvent::Thought(text)) => {
                        sink.flush_delta();
                        sink.emit(RunEventKind::Thought { text });
                    }
                    None => {
                        let outcome = call.await;
                        sink.flush_delta();
                        return outcome;
                    }
                },
                outcome = &mut call => {
                    // Drain anything the provider sent before finishing
                    while let Ok(event) = rx.try_recv() {
                        match event {
                            StreamEvent::TextDelta(text) => sink.push_delta(&text),
                            StreamEvent::Thought(text) => {
                                sink.flush_delta();
                                sink.emit(RunEventKind::Thought { text });
                            }
                        }
                    }
                    sink.flush_delta();
                    return outcome;
                }
            }
        }
    }

    /// Policy gate plus execution for one tool call
    async fn dispatch_tool(
        &self,
        agent: &AgentConfig,
        session_key: &SessionKey,
        call: &ToolCallRequest,
        cancel: &CancelToken,
        sink: &mut RunEventSink,
    ) -> ToolOutput {
        use crate::tools::ToolPolicyClass;

        let policy = policy_for(&agent.tool_policies, &call.name);

        if policy == ToolPolicyClass::Denied {
            sink.emit(RunEventKind::ToolCall {
                call_id: call.id.clone(),
                tool: call.name.clone(),
                params: call.params.clone(),
                needs_approval: false,
                approval_id: None,
            });
            return ToolOutput::err(format!("tool {} denied by policy", call.name));
        }

        let approval_id = (policy == ToolPolicyClass::Approval).then(Uuid::new_v4);
        sink.emit(RunEventKind::ToolCall {
            call_id: call.id.clone(),
            tool: call.name.clone(),
            params: call.params.clone(),
            needs_approval: approval_id.is_some(),
            approval_id,
        });

        if let Some(approval_id) = approval_id {
            let resolution = tokio::select! {
                r = self.approvals.request(approval_id, APPROVAL_TIMEOUT) => r,
                () = cancel.cancelled() => ApprovalResolution::Denied,
            };
            match resolution {
                ApprovalResolution::Approved => {}
                ApprovalResolution::Denied => {
                    return ToolOutput::err(format!("tool {} not approved", call.name));
                }
                ApprovalResolution::TimedOut => {
                    return ToolOutput::err(format!("approval for {} timed out", call.name));
                }
            }
        }

        let Some(tool) = self.tools.get(&call.name) else {
            return ToolOutput::err(format!("unknown tool {}", call.name));
        };

        if let Err(e) = validate_params(&tool.input_schema(), &call.params) {
            return ToolOutput::err(format!("invalid params: {e}"));
        }

        let ctx = ToolContext {
            session_key: session_key.clone(),
            workspace: agent.workspace.clone(),
            cancel: cancel.clone(),
            approvals: Arc::clone(&self.approvals),
        };

        let grace = Duration::from_secs(self.config.snapshot().limits.abort_grace_secs);
        let execution = tokio::time::timeout(TOOL_TIMEOUT, tool.execute(call.params.clone(), &ctx));

        // On cancellation the in-flight call keeps the grace period to drain
        let result = tokio::select! {
            result = execution => result,
            () = async {
                cancel.cancelled().await;
                tokio::time::sleep(grace).await;
            } => {
                tracing::warn!(tool = %call.name, "tool call forced out after abort grace");
                return ToolOutput::err(format!("tool {} cancelled", call.name));
            }
        };

        match result {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => ToolOutput::err(format!("tool error: {e}")),
            Err(_) => ToolOutput::err(format!("tool {} timed out", call.name)),
        }
    }

    /// Compact and atomically rewrite the transcript
    async fn compact_transcript(
        &self,
        session_key: &SessionKey,
        agent: &AgentConfig,
        transcript: &mut Transcript,
    ) -> Result<()> {
        let events = transcript.read_all()?;
        let summarizer = PoolSummarizer {
            pool: Arc::clone(&self.pool),
            providers: self.providers.clone(),
            model_ref: agent.model.clone(),
        };
        let outcome =
            compaction::compact(&session_key.to_string(), &events, &summarizer).await?;
        transcript.rewrite(outcome.events)?;
        self.sessions.touch(session_key, Some(0))?;
        Ok(())
    }

    /// Best-effort transcript note so clients can render run failures
    fn persist_error_note(&self, session_key: &SessionKey, message: &str) {
        if let Ok(mut transcript) = self.sessions.open_transcript(session_key) {
            let _ = transcript.append(TranscriptKind::SystemNote {
                text: format!("run error: {message}"),
            });
        }
    }
}

/// Summarizer over the same provider/profile selection as runs
pub struct PoolSummarizer {
    pub pool: Arc<AuthProfilePool>,
    pub providers: ProviderRegistry,
    pub model_ref: String,
}

#[async_trait]
impl Summarizer for PoolSummarizer {
    async fn summarize(&self, text: &str) -> Result<String> {
        let (provider_name, model) = split_model_ref(&self.model_ref);
        let provider = self
            .providers
            .get(provider_name)
            .ok_or_else(|| Error::ProviderUnavailable(provider_name.to_string()))?;
        let profile = self.pool.select(provider_name)?;

        let prompt = format!(
            "Summarize this conversation segment concisely. Preserve tool outputs \
             that influenced state, unresolved questions, and open plans.\n\n{text}"
        );
        let request = ChatRequest {
            model: model.to_string(),
            messages: vec![ChatMessage::text(Role::User, prompt)],
            tools: Vec::new(),
            max_tokens: 1024,
            thinking: crate::config::ThinkingLevel::Off,
        };

        let (tx, _rx) = mpsc::channel(16);
        match provider
            .invoke(&profile, request, tx, CancelToken::new())
            .await
        {
            Ok(outcome) => {
                self.pool.report_success(&profile.id)?;
                Ok(outcome.text)
            }
            Err(e) => {
                self.pool.report_failure(&profile.id, e.class)?;
                Err(Error::ProviderUnavailable(e.message))
            }
        }
    }
}

/// Model fallback chain: session override, agent primary, fallbacks, the
/// global default.
fn model_chain(agent: &AgentConfig, override_model: Option<&str>) -> Vec<String> {
    let mut chain = Vec::new();
    if let Some(model) = override_model {
        chain.push(model.to_string());
    }
    chain.push(agent.model.clone());
    chain.extend(agent.fallback_models.iter().cloned());
    if !chain.iter().any(|m| m == DEFAULT_MODEL) {
        chain.push(DEFAULT_MODEL.to_string());
    }
    chain
}

/// Idle-window or daily-rollover reset
fn reset_reason(config: &Config, meta: &crate::session::store::SessionMeta) -> Option<&'static str> {
    let limits = &config.limits;
    let now = Utc::now();

    if limits.session_reset_idle_secs > 0 {
        let idle = (now - meta.updated_at).num_seconds();
        if idle >= 0 && (idle as u64) >= limits.session_reset_idle_secs {
            return Some("idle window elapsed");
        }
    }

    if let Some(ref at) = limits.session_reset_daily_at {
        if let Ok(boundary) = NaiveTime::parse_from_str(at, "%H:%M") {
            let today_boundary = now.date_naive().and_time(boundary).and_utc();
            if meta.updated_at < today_boundary && now >= today_boundary {
                return Some("daily rollover");
            }
        }
    }

    None
}

/// Channel-originated conversations get replies delivered; interactive
/// client sessions only stream events.
const fn deliverable(scope: &SessionScope, _envelope: &Envelope) -> bool {
    matches!(scope, SessionScope::Peer { .. } | SessionScope::Group { .. })
}

/// Destination for the reply
fn delivery_target(envelope: &Envelope) -> String {
    match envelope.chat_kind {
        ChatKind::Dm => envelope.peer.clone(),
        _ => envelope
            .group
            .clone()
            .unwrap_or_else(|| envelope.peer.clone()),
    }
}
