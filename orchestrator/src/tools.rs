//! Tool routing: server-side tools run locally, client-side tools round-trip
//! through the broker to the client that advertised them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parley_core::broker::{Broker, Payload};
use parley_core::messages::{ToolCapability, WireMessage};
use parley_core::topics;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Timeout")]
    Timeout,
}

/// The trait server-side tools implement.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique tool name as exposed to the model.
    fn name(&self) -> String;

    /// Human-readable description.
    fn description(&self) -> String;

    /// JSON Schema for the arguments object.
    fn parameters(&self) -> Value;

    async fn call(&self, arguments: Value) -> std::result::Result<Value, ToolError>;
}

/// What a dispatch produced, in the shape both history and status events use.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    pub success: bool,
    pub result: Value,
}

impl ToolOutcome {
    pub fn ok(result: Value) -> Self {
        Self {
            success: true,
            result,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            result: json!({"error": message.into()}),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ToolRouterConfig {
    /// How long a client has to answer a tool request.
    pub call_timeout: Duration,
}

impl Default for ToolRouterConfig {
    fn default() -> Self {
        let ms = std::env::var("PARLEY_TOOL_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(30_000u64);
        Self {
            call_timeout: Duration::from_millis(ms),
        }
    }
}

/// Routes tool invocations to the static server registry or to the client
/// that advertised the capability for this conversation.
pub struct ToolRouter {
    broker: Arc<Broker>,
    cfg: ToolRouterConfig,
    server_tools: DashMap<String, Arc<dyn Tool>>,
    /// conversation id -> advertised client tools.
    client_tools: DashMap<String, HashMap<String, ToolCapability>>,
    /// toolCallId -> waiter for the correlated response.
    pending: DashMap<String, oneshot::Sender<ToolOutcome>>,
}

impl ToolRouter {
    pub fn new(broker: Arc<Broker>, cfg: ToolRouterConfig) -> Self {
        Self {
            broker,
            cfg,
            server_tools: DashMap::new(),
            client_tools: DashMap::new(),
            pending: DashMap::new(),
        }
    }

    /// Register a server-side tool.
    pub fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.name();
        info!(target: "orchestrator", tool = %name, "registering server tool");
        self.server_tools.insert(name, tool);
    }

    /// Extend the catalog with a client's advertised tools.
    pub fn register_client_capabilities(
        &self,
        conversation_id: &str,
        client_id: &str,
        capabilities: HashMap<String, ToolCapability>,
    ) {
        info!(
            target: "orchestrator",
            conversation = %conversation_id,
            client = %client_id,
            count = capabilities.len(),
            "registered client tool capabilities"
        );
        self.client_tools
            .insert(conversation_id.to_string(), capabilities);
    }

    /// Drop a conversation's client catalog and orphan its pending waiters.
    pub fn remove_conversation(&self, conversation_id: &str) {
        self.client_tools.remove(conversation_id);
    }

    /// The tools visible to the model for this conversation.
    pub fn catalog(&self, conversation_id: &str) -> Vec<crate::llm::ToolSpec> {
        let mut specs: Vec<crate::llm::ToolSpec> = self
            .server_tools
            .iter()
            .map(|t| crate::llm::ToolSpec {
                name: t.name(),
                description: t.description(),
                parameters: t.parameters(),
            })
            .collect();
        if let Some(caps) = self.client_tools.get(conversation_id) {
            for (name, cap) in caps.iter() {
                specs.push(crate::llm::ToolSpec {
                    name: name.clone(),
                    description: cap.description.clone(),
                    parameters: cap.parameters.clone(),
                });
            }
        }
        specs
    }

    /// Execute one tool call to completion: locally, or via the client with a
    /// timeout. Never returns an error — failures become failed outcomes.
    pub async fn dispatch(
        &self,
        conversation_id: &str,
        tool_call_id: &str,
        name: &str,
        arguments: Value,
    ) -> ToolOutcome {
        if let Some(tool) = self.server_tools.get(name).map(|t| Arc::clone(t.value())) {
            if let Err(e) = validate_arguments(&tool.parameters(), &arguments) {
                return ToolOutcome::err(format!("invalid arguments for {name}: {e}"));
            }
            return match timeout(self.cfg.call_timeout, tool.call(arguments)).await {
                Ok(Ok(result)) => ToolOutcome::ok(result),
                Ok(Err(e)) => ToolOutcome::err(e.to_string()),
                Err(_) => ToolOutcome::err(format!("tool {name} timed out")),
            };
        }

        let schema = self
            .client_tools
            .get(conversation_id)
            .and_then(|caps| caps.get(name).map(|c| c.parameters.clone()));
        let Some(schema) = schema else {
            return ToolOutcome::err(format!("unknown tool: {name}"));
        };
        if let Err(e) = validate_arguments(&schema, &arguments) {
            return ToolOutcome::err(format!("invalid arguments for {name}: {e}"));
        }

        let (tx, rx) = oneshot::channel();
        self.pending.insert(tool_call_id.to_string(), tx);

        let request = WireMessage::ToolRequest {
            conversation_id: conversation_id.to_string(),
            tool_call_id: tool_call_id.to_string(),
            tool_name: name.to_string(),
            arguments,
            timeout_ms: self.cfg.call_timeout.as_millis() as u64,
        };
        if let Err(e) = self
            .broker
            .publish(topics::CLIENT_TOOL_REQUEST, Payload::Control(request))
            .await
        {
            self.pending.remove(tool_call_id);
            return ToolOutcome::err(format!("failed to publish tool request: {e}"));
        }

        match timeout(self.cfg.call_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => {
                self.pending.remove(tool_call_id);
                ToolOutcome::err(format!("tool {name} waiter dropped"))
            }
            Err(_) => {
                self.pending.remove(tool_call_id);
                warn!(target: "orchestrator", tool = %name, call = %tool_call_id, "client tool call timed out");
                ToolOutcome::err(format!("tool {name} timed out"))
            }
        }
    }

    /// Deliver a client tool response. Unknown or duplicate toolCallIds are
    /// dropped — each invocation consumes at most one result.
    pub fn handle_response(&self, tool_call_id: &str, success: bool, result: Value) {
        match self.pending.remove(tool_call_id) {
            Some((_, tx)) => {
                let _ = tx.send(ToolOutcome { success, result });
            }
            None => {
                debug!(target: "orchestrator", call = %tool_call_id, "dropping response for unknown toolCallId");
            }
        }
    }
}

/// Presence validation against the declared schema: the arguments must be an
/// object and contain every `required` property.
fn validate_arguments(schema: &Value, arguments: &Value) -> std::result::Result<(), String> {
    let Some(args) = arguments.as_object() else {
        return Err("arguments must be a JSON object".into());
    };
    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for key in required {
            let Some(key) = key.as_str() else { continue };
            if !args.contains_key(key) {
                return Err(format!("missing required property: {key}"));
            }
        }
    }
    Ok(())
}

/// Built-in server tool reporting the current time.
pub struct GetTimeTool;

#[async_trait]
impl Tool for GetTimeTool {
    fn name(&self) -> String {
        "get_time".to_string()
    }

    fn description(&self) -> String {
        "Get the current date and time in UTC".to_string()
    }

    fn parameters(&self) -> Value {
        json!({"type": "object", "properties": {}, "required": []})
    }

    async fn call(&self, _arguments: Value) -> std::result::Result<Value, ToolError> {
        Ok(json!({"now": chrono::Utc::now().to_rfc3339()}))
    }
}
