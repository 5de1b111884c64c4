//! Tool contract and registry
//!
//! Tools declare an object-shaped input schema and a policy class. Results
//! carry free-text `content` for the model and a structured `details` object
//! for clients and tests.

pub mod approval;
pub mod builtin;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cancel::CancelToken;
use crate::llm::ToolSpec;
use crate::session::SessionKey;
use crate::Result;

pub use approval::{ApprovalBroker, ApprovalResolution};

/// Policy class applied to each tool call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolPolicyClass {
    /// Execute without asking
    #[default]
    Auto,
    /// Suspend until an RPC client approves
    Approval,
    /// Always refuse
    Denied,
}

/// Two-part tool result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutput {
    /// Free text consumed by the LLM
    pub content: String,
    /// Structured object consumed by clients and tests
    #[serde(default)]
    pub details: serde_json::Value,
    pub ok: bool,
}

impl ToolOutput {
    /// Successful output
    #[must_use]
    pub fn ok(content: impl Into<String>, details: serde_json::Value) -> Self {
        Self {
            content: content.into(),
            details,
            ok: true,
        }
    }

    /// Failed output surfaced back to the model
    #[must_use]
    pub fn err(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            details: serde_json::Value::Null,
            ok: false,
        }
    }
}

/// Execution context handed to tools
#[derive(Clone)]
pub struct ToolContext {
    pub session_key: SessionKey,
    pub workspace: Option<PathBuf>,
    pub cancel: CancelToken,
    pub approvals: Arc<ApprovalBroker>,
}

/// One tool implementation
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name as exposed to the model
    fn name(&self) -> &str;

    /// One-line description for the model
    fn description(&self) -> &str;

    /// Object-shaped JSON schema; discriminator fields use enumerated
    /// strings, never root-level unions
    fn input_schema(&self) -> serde_json::Value;

    /// When true, a failed call aborts the run instead of continuing
    fn fatal_on_error(&self) -> bool {
        false
    }

    /// Execute with validated params. Implementations observe
    /// `ctx.cancel` for long operations.
    async fn execute(&self, params: serde_json::Value, ctx: &ToolContext) -> Result<ToolOutput>;
}

/// Registry of available tools plus per-agent policy resolution
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in tools
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(builtin::CurrentTimeTool));
        registry.register(Arc::new(builtin::SessionInfoTool));
        registry
    }

    /// Register a tool; the last registration of a name wins
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// Tool lookup
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Specs for every tool not denied by the policy map
    #[must_use]
    pub fn specs_for(&self, policies: &HashMap<String, ToolPolicyClass>) -> Vec<ToolSpec> {
        let mut specs: Vec<ToolSpec> = self
            .tools
            .values()
            .filter(|t| policy_for(policies, t.name()) != ToolPolicyClass::Denied)
            .map(|t| ToolSpec {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
            })
            .collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    /// Registered tool names
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Resolve the policy class for a tool name, defaulting to `Auto`
#[must_use]
pub fn policy_for(policies: &HashMap<String, ToolPolicyClass>, name: &str) -> ToolPolicyClass {
    policies.get(name).copied().unwrap_or_default()
}

/// Validate params against the shallow shape of an object schema: required
/// fields present, enumerated strings within range.
///
/// # Errors
///
/// Returns [`crate::Error::Invalid`] naming the offending field.
pub fn validate_params(schema: &serde_json::Value, params: &serde_json::Value) -> Result<()> {
    if !params.is_object() {
        return Err(crate::Error::Invalid {
            message: "tool params must be an object".to_string(),
            field: None,
        });
    }

    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for field in required {
            if let Some(name) = field.as_str() {
                if params.get(name).is_none() {
                    return Err(crate::Error::Invalid {
                        message: format!("missing required field {name}"),
                        field: Some(name.to_string()),
                    });
                }
            }
        }
    }

    if let Some(props) = schema.get("properties").and_then(|p| p.as_object()) {
        for (name, prop) in props {
            let Some(value) = params.get(name) else {
                continue;
            };
            if let Some(allowed) = prop.get("enum").and_then(|e| e.as_array()) {
                if !allowed.contains(value) {
                    return Err(crate::Error::Invalid {
                        message: format!("field {name} not in enumeration"),
                        field: Some(name.clone()),
                    });
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn default_policy_is_auto() {
        let policies = HashMap::new();
        assert_eq!(policy_for(&policies, "anything"), ToolPolicyClass::Auto);
    }

    #[test]
    fn denied_tools_are_hidden_from_specs() {
        let registry = ToolRegistry::with_builtins();
        let mut policies = HashMap::new();
        policies.insert("current_time".to_string(), ToolPolicyClass::Denied);
        let specs = registry.specs_for(&policies);
        assert!(specs.iter().all(|s| s.name != "current_time"));
        assert!(specs.iter().any(|s| s.name == "session_info"));
    }

    #[test]
    fn validate_rejects_missing_required() {
        let schema = json!({
            "type": "object",
            "properties": {"path": {"type": "string"}},
            "required": ["path"],
        });
        let err = validate_params(&schema, &json!({})).unwrap_err();
        match err {
            crate::Error::Invalid { field, .. } => assert_eq!(field.as_deref(), Some("path")),
            other => panic!("unexpected error: {other}"),
        }
        assert!(validate_params(&schema, &json!({"path": "/tmp"})).is_ok());
    }

    #[test]
    fn validate_enforces_enums() {
        let schema = json!({
            "type": "object",
            "properties": {"mode": {"type": "string", "enum": ["read", "write"]}},
        });
        assert!(validate_params(&schema, &json!({"mode": "read"})).is_ok());
        assert!(validate_params(&schema, &json!({"mode": "exec"})).is_err());
    }

    #[test]
    fn validate_rejects_non_object() {
        let schema = json!({"type": "object"});
        assert!(validate_params(&schema, &json!("text")).is_err());
        assert!(validate_params(&schema, &json!([1, 2])).is_err());
    }
}
