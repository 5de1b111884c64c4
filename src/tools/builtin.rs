//! Built-in tools
//!
//! A small default set available to every agent; real deployments add their
//! own implementations through the registry.

use async_trait::async_trait;
use serde_json::json;

use crate::Result;

use super::{Tool, ToolContext, ToolOutput};

/// Reports the current date and time
pub struct CurrentTimeTool;

#[async_trait]
impl Tool for CurrentTimeTool {
    fn name(&self) -> &str {
        "current_time"
    }

    fn description(&self) -> &str {
        "Get the current date and time in UTC"
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {},
            "required": [],
        })
    }

    async fn execute(&self, _params: serde_json::Value, _ctx: &ToolContext) -> Result<ToolOutput> {
        let now = chrono::Utc::now();
        Ok(ToolOutput::ok(
            now.to_rfc3339(),
            json!({"unix": now.timestamp()}),
        ))
    }
}

/// Reports the session the agent is running in
pub struct SessionInfoTool;

#[async_trait]
impl Tool for SessionInfoTool {
    fn name(&self) -> &str {
        "session_info"
    }

    fn description(&self) -> &str {
        "Describe the current conversation session"
    }

    fn input_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {},
            "required": [],
        })
    }

    async fn execute(&self, _params: serde_json::Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let key = ctx.session_key.to_string();
        let workspace = ctx
            .workspace
            .as_ref()
            .map(|p| p.display().to_string());
        Ok(ToolOutput::ok(
            format!("session {key}"),
            json!({"session_key": key, "workspace": workspace}),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use crate::session::SessionKey;
    use crate::tools::ApprovalBroker;
    use std::sync::Arc;

    fn ctx() -> ToolContext {
        ToolContext {
            session_key: SessionKey::peer("a1", "x", "acc", "u1"),
            workspace: None,
            cancel: CancelToken::new(),
            approvals: Arc::new(ApprovalBroker::new()),
        }
    }

    #[tokio::test]
    async fn current_time_returns_rfc3339() {
        let out = CurrentTimeTool.execute(json!({}), &ctx()).await.unwrap();
        assert!(out.ok);
        assert!(out.content.contains('T'));
        assert!(out.details["unix"].as_i64().unwrap() > 0);
    }

    #[tokio::test]
    async fn session_info_reports_key() {
        let out = SessionInfoTool.execute(json!({}), &ctx()).await.unwrap();
        assert!(out.ok);
        assert_eq!(
            out.details["session_key"],
            json!("agent:a1:peer:x:acc:u1")
        );
    }
}
