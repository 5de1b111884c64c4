//! HTTP LLM provider
//!
//! Speaks a messages-style streaming API over SSE. One instance serves one
//! upstream vendor; the credential arrives per call from the auth pool.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;

use crate::cancel::CancelToken;
use crate::config::ThinkingLevel;
use crate::providers::{ErrorClass, ProfileHandle};

use super::{
    ChatOutcome, ChatRequest, LlmProvider, ProviderError, ProviderResult, Role, StopReason,
    StreamEvent, ToolCallRequest,
};

/// Default API endpoint when the profile carries no base URL
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";

/// API version header value
const API_VERSION: &str = "2023-06-01";

/// Streaming messages-API provider
pub struct HttpProvider {
    name: String,
    client: reqwest::Client,
    call_timeout: Duration,
}

impl HttpProvider {
    /// Build a provider with the given call timeout.
    ///
    /// # Errors
    ///
    /// Returns an error when the HTTP client cannot be constructed.
    pub fn new(name: impl Into<String>, call_timeout: Duration) -> crate::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            name: name.into(),
            client,
            call_timeout,
        })
    }

    fn build_body(request: &ChatRequest) -> serde_json::Value {
        let system: String = request
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");

        let messages: Vec<serde_json::Value> = request
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| match m.role {
                Role::Tool => json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": m.tool_call_id,
                        "content": m.content,
                    }],
                }),
                Role::Assistant if !m.tool_calls.is_empty() => {
                    let mut blocks = Vec::new();
                    if !m.content.is_empty() {
                        blocks.push(json!({"type": "text", "text": m.content}));
                    }
                    for call in &m.tool_calls {
                        blocks.push(json!({
                            "type": "tool_use",
                            "id": call.id,
                            "name": call.name,
                            "input": call.params,
                        }));
                    }
                    json!({"role": "assistant", "content": blocks})
                }
                _ => json!({
                    "role": if m.role == Role::Assistant { "assistant" } else { "user" },
                    "content": m.content,
                }),
            })
            .collect();

        let mut body = json!({
            "model": request.model,
            "max_tokens": request.max_tokens,
            "messages": messages,
            "stream": true,
        });
        if !system.is_empty() {
            body["system"] = json!(system);
        }
        if !request.tools.is_empty() {
            body["tools"] = json!(request
                .tools
                .iter()
                .map(|t| json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.input_schema,
                }))
                .collect::<Vec<_>>());
        }
        if let Some(budget) = thinking_budget(request.thinking) {
            body["thinking"] = json!({"type": "enabled", "budget_tokens": budget});
        }
        body
    }
}

/// Map thinking levels to token budgets; `Off` disables the block
const fn thinking_budget(level: ThinkingLevel) -> Option<u32> {
    match level {
        ThinkingLevel::Off => None,
        ThinkingLevel::Minimal => Some(1024),
        ThinkingLevel::Low => Some(4096),
        ThinkingLevel::Medium => Some(8192),
        ThinkingLevel::High => Some(16_384),
        ThinkingLevel::Xhigh => Some(32_768),
    }
}

/// Classify an HTTP status into the pool's failure taxonomy
const fn classify_status(status: u16) -> ErrorClass {
    match status {
        401 | 403 => ErrorClass::Auth,
        402 => ErrorClass::Billing,
        408 | 504 => ErrorClass::Timeout,
        429 => ErrorClass::RateLimit,
        400 | 422 => ErrorClass::Format,
        _ => ErrorClass::Unknown,
    }
}

#[derive(Debug, Deserialize)]
struct SseEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    index: usize,
    #[serde(default)]
    delta: Option<SseDelta>,
    #[serde(default)]
    content_block: Option<SseContentBlock>,
}

#[derive(Debug, Deserialize)]
struct SseDelta {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    thinking: Option<String>,
    #[serde(default)]
    partial_json: Option<String>,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SseContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

/// Tool call under assembly from streamed partial JSON
#[derive(Default)]
struct PendingToolCall {
    id: String,
    name: String,
    arguments: String,
}

#[async_trait]
impl LlmProvider for HttpProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(
        &self,
        auth: &ProfileHandle,
        request: ChatRequest,
        sink: mpsc::Sender<StreamEvent>,
        cancel: CancelToken,
    ) -> ProviderResult<ChatOutcome> {
        let base = auth.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL);
        let url = format!("{}/v1/messages", base.trim_end_matches('/'));
        let body = Self::build_body(&request);

        let call = async {
            let response = self
                .client
                .post(&url)
                .header("x-api-key", &auth.api_key)
                .header("anthropic-version", API_VERSION)
                .json(&body)
                .send()
                .await
                .map_err(|e| {
                    let class = if e.is_timeout() {
                        ErrorClass::Timeout
                    } else {
                        ErrorClass::Unknown
                    };
                    ProviderError::new(class, e.to_string())
                })?;

            let status = response.status();
            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                return Err(ProviderError::new(
                    classify_status(status.as_u16()),
                    format!("{status}: {text}"),
                ));
            }

            parse_stream(response, &sink).await
        };

        tokio::select! {
            outcome = tokio::time::timeout(self.call_timeout, call) => match outcome {
                Ok(result) => result,
                Err(_) => Err(ProviderError::new(
                    ErrorClass::Timeout,
                    format!("llm call exceeded {:?}", self.call_timeout),
                )),
            },
            () = cancel.cancelled() => Err(ProviderError::new(
                ErrorClass::Timeout,
                "llm call cancelled",
            )),
        }
    }
}

/// Consume the SSE body, forwarding deltas and assembling the outcome
async fn parse_stream(
    response: reqwest::Response,
    sink: &mpsc::Sender<StreamEvent>,
) -> ProviderResult<ChatOutcome> {
    let mut text = String::new();
    let mut pending: Vec<PendingToolCall> = Vec::new();
    let mut stop = StopReason::EndTurn;

    let mut buffer = String::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| ProviderError::new(ErrorClass::Unknown, e.to_string()))?;
        buffer.push_str(&String::from_utf8_lossy(&chunk));

        while let Some(pos) = buffer.find('\n') {
            let line: String = buffer.drain(..=pos).collect();
            let line = line.trim();
            let Some(data) = line.strip_prefix("data: ") else {
                continue;
            };
            if data == "[DONE]" {
                continue;
            }
            let Ok(event) = serde_json::from_str::<SseEvent>(data) else {
                continue;
            };
            handle_event(event, &mut text, &mut pending, &mut stop, sink).await;
        }
    }

    let tool_calls = pending
        .into_iter()
        .filter(|p| !p.name.is_empty())
        .map(|p| {
            let params = if p.arguments.trim().is_empty() {
                json!({})
            } else {
                serde_json::from_str(&p.arguments).unwrap_or_else(|_| json!({}))
            };
            ToolCallRequest {
                id: p.id,
                name: p.name,
                params,
            }
        })
        .collect();

    Ok(ChatOutcome {
        text,
        tool_calls,
        stop,
    })
}

async fn handle_event(
    event: SseEvent,
    text: &mut String,
    pending: &mut Vec<PendingToolCall>,
    stop: &mut StopReason,
    sink: &mpsc::Sender<StreamEvent>,
) {
    match event.kind.as_str() {
        "content_block_start" => {
            if let Some(block) = event.content_block {
                if block.kind == "tool_use" {
                    if event.index >= pending.len() {
                        pending.resize_with(event.index + 1, PendingToolCall::default);
                    }
                    pending[event.index].id = block.id.unwrap_or_default();
                    pending[event.index].name = block.name.unwrap_or_default();
                }
            }
        }
        "content_block_delta" => {
            if let Some(delta) = event.delta {
                match delta.kind.as_str() {
                    "text_delta" => {
                        if let Some(t) = delta.text {
                            text.push_str(&t);
                            let _ = sink.send(StreamEvent::TextDelta(t)).await;
                        }
                    }
                    "thinking_delta" => {
                        if let Some(t) = delta.thinking {
                            let _ = sink.send(StreamEvent::Thought(t)).await;
                        }
                    }
                    "input_json_delta" => {
                        if let Some(partial) = delta.partial_json {
                            if event.index >= pending.len() {
                                pending.resize_with(event.index + 1, PendingToolCall::default);
                            }
                            pending[event.index].arguments.push_str(&partial);
                        }
                    }
                    _ => {}
                }
            }
        }
        "message_delta" => {
            if let Some(delta) = event.delta {
                match delta.stop_reason.as_deref() {
                    Some("tool_use") => *stop = StopReason::ToolUse,
                    Some("max_tokens") => *stop = StopReason::MaxTokens,
                    _ => {}
                }
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ChatMessage;

    fn request() -> ChatRequest {
        ChatRequest {
            model: "claude-sonnet-4".to_string(),
            messages: vec![
                ChatMessage::text(Role::System, "be brief"),
                ChatMessage::text(Role::User, "hi"),
            ],
            tools: Vec::new(),
            max_tokens: 512,
            thinking: ThinkingLevel::Off,
        }
    }

    #[test]
    fn body_hoists_system_prompt() {
        let body = HttpProvider::build_body(&request());
        assert_eq!(body["system"], json!("be brief"));
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert!(body.get("thinking").is_none());
    }

    #[test]
    fn body_encodes_tool_results() {
        let mut req = request();
        req.messages.push(ChatMessage::tool_result("c1", "42"));
        let body = HttpProvider::build_body(&req);
        let last = body["messages"].as_array().unwrap().last().unwrap().clone();
        assert_eq!(last["content"][0]["type"], json!("tool_result"));
        assert_eq!(last["content"][0]["tool_use_id"], json!("c1"));
    }

    #[test]
    fn thinking_levels_map_to_budgets() {
        assert!(thinking_budget(ThinkingLevel::Off).is_none());
        assert_eq!(thinking_budget(ThinkingLevel::Minimal), Some(1024));
        assert_eq!(thinking_budget(ThinkingLevel::Xhigh), Some(32_768));
    }

    #[test]
    fn status_classification() {
        assert_eq!(classify_status(401), ErrorClass::Auth);
        assert_eq!(classify_status(402), ErrorClass::Billing);
        assert_eq!(classify_status(429), ErrorClass::RateLimit);
        assert_eq!(classify_status(400), ErrorClass::Format);
        assert_eq!(classify_status(504), ErrorClass::Timeout);
        assert_eq!(classify_status(500), ErrorClass::Unknown);
    }
}
