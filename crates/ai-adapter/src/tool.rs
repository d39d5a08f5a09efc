//! Tool dispatch: the two built-ins every flavor offers (`terminate_call`,
//! `transfer_call`) plus pluggable HTTP-backed tools (workflow engines such
//! as Dify), looked up the way `openai_api.py`'s `find_tool` does - first the
//! dynamically configured tools, falling back to the built-ins.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::{AdapterError, Result};

/// A side effect a tool call has on the call lifecycle, applied by the call
/// engine once the adapter reports it alongside the tool's JSON output.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolEffect {
    None,
    TerminateCall,
    TransferCall { target: String, referred_by: Option<String> },
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    /// JSON schema fragment describing this tool's parameters, embedded in
    /// the provider-specific tool manifest sent at session start.
    fn parameters_schema(&self) -> Value;

    async fn call(&self, arguments: Value) -> Result<(Value, ToolEffect)>;
}

pub struct TerminateCallTool;

#[async_trait]
impl Tool for TerminateCallTool {
    fn name(&self) -> &str {
        "terminate_call"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "reason": { "type": "string" } },
            "required": [],
        })
    }

    async fn call(&self, _arguments: Value) -> Result<(Value, ToolEffect)> {
        Ok((json!({"status": "terminating"}), ToolEffect::TerminateCall))
    }
}

pub struct TransferCallTool {
    pub default_target: Option<String>,
    pub referred_by: Option<String>,
}

#[async_trait]
impl Tool for TransferCallTool {
    fn name(&self) -> &str {
        "transfer_call"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "destination": { "type": "string" } },
            "required": [],
        })
    }

    async fn call(&self, arguments: Value) -> Result<(Value, ToolEffect)> {
        let target = arguments
            .get("destination")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| self.default_target.clone())
            .ok_or(AdapterError::MissingConfig("transfer_to"))?;

        Ok((
            json!({"status": "transferring", "to": target}),
            ToolEffect::TransferCall { target, referred_by: self.referred_by.clone() },
        ))
    }
}

/// A generic HTTP tool backend, grounded on `openai_api.py`'s Dify-workflow
/// fallback: arguments are posted as the JSON body, the response body is
/// handed straight back to the provider as the tool's output.
pub struct HttpWorkflowTool {
    pub tool_name: String,
    pub endpoint: String,
    pub api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpWorkflowTool {
    pub fn new(tool_name: String, endpoint: String, api_key: Option<String>) -> Self {
        Self { tool_name, endpoint, api_key, client: reqwest::Client::new() }
    }
}

#[async_trait]
impl Tool for HttpWorkflowTool {
    fn name(&self) -> &str {
        &self.tool_name
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object", "properties": {}, "additionalProperties": true })
    }

    async fn call(&self, arguments: Value) -> Result<(Value, ToolEffect)> {
        let mut request = self.client.post(&self.endpoint).json(&json!({ "inputs": arguments }));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await?.error_for_status()?;
        let body: Value = response.json().await?;
        Ok((body, ToolEffect::None))
    }
}

/// The set of tools offered to a provider for one call, resolved in
/// declaration order with the built-ins always available as a fallback.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    /// Catch-all workflow engine (e.g. Dify) invoked when the model calls a
    /// function name that matches neither a built-in nor a configured HTTP
    /// tool, per `openai_api.py`'s `handle_command` fallback path.
    fallback: Option<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn set_fallback(&mut self, tool: Arc<dyn Tool>) {
        self.fallback = Some(tool);
    }

    pub fn find(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Resolve by name, falling back to the workflow engine (if configured)
    /// for an unrecognized function name instead of dropping the call.
    pub fn find_or_fallback(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.find(name).or_else(|| self.fallback.clone())
    }

    pub fn manifest(&self) -> Vec<(String, Value)> {
        self.tools.values().map(|t| (t.name().to_string(), t.parameters_schema())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn terminate_call_reports_terminate_effect() {
        let (_, effect) = TerminateCallTool.call(json!({})).await.unwrap();
        assert_eq!(effect, ToolEffect::TerminateCall);
    }

    #[tokio::test]
    async fn transfer_call_uses_argument_over_default() {
        let tool = TransferCallTool {
            default_target: Some("sip:fallback@example.com".to_string()),
            referred_by: None,
        };
        let (_, effect) =
            tool.call(json!({"destination": "sip:sales@example.com"})).await.unwrap();
        assert_eq!(
            effect,
            ToolEffect::TransferCall { target: "sip:sales@example.com".to_string(), referred_by: None }
        );
    }

    #[tokio::test]
    async fn transfer_call_without_destination_or_default_errors() {
        let tool = TransferCallTool { default_target: None, referred_by: None };
        assert!(tool.call(json!({})).await.is_err());
    }

    #[test]
    fn registry_looks_up_by_name() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(TerminateCallTool));
        assert!(registry.find("terminate_call").is_some());
        assert!(registry.find("unknown").is_none());
    }

    #[test]
    fn unknown_name_falls_back_to_workflow_engine_when_configured() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(TerminateCallTool));
        assert!(registry.find_or_fallback("unknown").is_none());

        registry.set_fallback(Arc::new(HttpWorkflowTool::new(
            "workflow".to_string(),
            "https://example.com/workflows/run".to_string(),
            None,
        )));
        assert!(registry.find_or_fallback("unknown").is_some());
        // A registered tool is still preferred over the fallback.
        assert_eq!(registry.find_or_fallback("terminate_call").unwrap().name(), "terminate_call");
    }
}
