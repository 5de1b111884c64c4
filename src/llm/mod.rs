//! LLM provider seam
//!
//! Providers implement [`LlmProvider`]: one cancel-aware call that streams
//! deltas into a sink and resolves to a final message or a typed error.
//! Authentication comes from the auth-profile pool; the provider itself is
//! stateless.

pub mod http;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::cancel::CancelToken;
use crate::config::ThinkingLevel;
use crate::providers::{ErrorClass, ProfileHandle};

/// Chat message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One message in the model conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    /// Tool calls the assistant requested in this turn
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    /// For `Role::Tool`, the call this message answers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    /// Plain message constructor
    #[must_use]
    pub fn text(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// Tool result message answering `call_id`
    #[must_use]
    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.into()),
        }
    }
}

/// Tool declaration passed to the model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// Object-shaped JSON schema for the input
    pub input_schema: serde_json::Value,
}

/// A tool call requested by the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub params: serde_json::Value,
}

/// Why the model stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
}

/// One provider invocation
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Model id without the provider prefix
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSpec>,
    pub max_tokens: u32,
    pub thinking: ThinkingLevel,
}

/// Streamed increments surfaced while the call is in flight
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Assistant text delta
    TextDelta(String),
    /// Extended-thinking delta
    Thought(String),
}

/// Final result of a provider call
#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub text: String,
    pub tool_calls: Vec<ToolCallRequest>,
    pub stop: StopReason,
}

/// Typed provider failure, classified for the auth pool
#[derive(Debug, Clone, thiserror::Error)]
#[error("provider error ({class:?}): {message}")]
pub struct ProviderError {
    pub class: ErrorClass,
    pub message: String,
}

impl ProviderError {
    /// Constructor
    #[must_use]
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }
}

/// Provider result alias
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// One LLM provider implementation
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider name, matching auth profile `provider` fields
    fn name(&self) -> &str;

    /// Run one chat completion. Deltas go to `sink` as they arrive; the
    /// final message is the return value. Implementations must observe
    /// `cancel` and return promptly with [`ErrorClass::Timeout`]-class
    /// errors on expiry.
    async fn invoke(
        &self,
        auth: &ProfileHandle,
        request: ChatRequest,
        sink: mpsc::Sender<StreamEvent>,
        cancel: CancelToken,
    ) -> ProviderResult<ChatOutcome>;
}

/// Registry of providers by name
#[derive(Default, Clone)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn LlmProvider>>,
}

impl ProviderRegistry {
    /// Empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under its name
    pub fn register(&mut self, provider: Arc<dyn LlmProvider>) {
        self.providers
            .insert(provider.name().to_string(), provider);
    }

    /// Provider lookup
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn LlmProvider>> {
        self.providers.get(name).cloned()
    }

    /// Registered provider names
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Split a `provider/model` reference.
///
/// A bare model name maps to the `anthropic` provider.
#[must_use]
pub fn split_model_ref(model_ref: &str) -> (&str, &str) {
    model_ref
        .split_once('/')
        .unwrap_or(("anthropic", model_ref))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_model_ref_handles_both_shapes() {
        assert_eq!(
            split_model_ref("anthropic/claude-sonnet-4"),
            ("anthropic", "claude-sonnet-4")
        );
        assert_eq!(
            split_model_ref("claude-sonnet-4"),
            ("anthropic", "claude-sonnet-4")
        );
        assert_eq!(split_model_ref("openai/gpt-4o"), ("openai", "gpt-4o"));
    }

    #[test]
    fn chat_message_constructors() {
        let msg = ChatMessage::text(Role::User, "hi");
        assert_eq!(msg.role, Role::User);
        assert!(msg.tool_calls.is_empty());

        let result = ChatMessage::tool_result("c1", "done");
        assert_eq!(result.tool_call_id.as_deref(), Some("c1"));
        assert_eq!(result.role, Role::Tool);
    }

    #[test]
    fn registry_round_trip() {
        struct Dummy;
        #[async_trait]
        impl LlmProvider for Dummy {
            fn name(&self) -> &str {
                "dummy"
            }
            async fn invoke(
                &self,
                _auth: &ProfileHandle,
                _request: ChatRequest,
                _sink: mpsc::Sender<StreamEvent>,
                _cancel: CancelToken,
            ) -> ProviderResult<ChatOutcome> {
                Ok(ChatOutcome {
                    text: String::new(),
                    tool_calls: Vec::new(),
                    stop: StopReason::EndTurn,
                })
            }
        }

        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(Dummy));
        assert!(registry.get("dummy").is_some());
        assert!(registry.get("other").is_none());
        assert_eq!(registry.names(), vec!["dummy".to_string()]);
    }
}
