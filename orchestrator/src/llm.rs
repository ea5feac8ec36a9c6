//! Language model contract and adapters.
//!
//! The orchestrator only sees [`LlmEvent`]s: tokens, tool calls, end of
//! stream, or an error — provider exceptions never cross the boundary. The
//! production adapter streams an OpenAI-compatible `chat/completions`
//! endpoint over SSE; the scripted model drives tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use parley_core::messages::{Role, Turn};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{OrchestratorError, Result};

/// A tool exposed to the model: name, description, JSON Schema parameters.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// One item of a streamed generation.
#[derive(Debug, Clone, PartialEq)]
pub enum LlmEvent {
    Token(String),
    ToolCall {
        id: String,
        name: String,
        arguments: Value,
    },
    Done,
    Error(String),
}

/// Streaming language model. Implementations honor the cancellation token at
/// every suspension point and close the channel when finished.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn stream(
        &self,
        history: &[Turn],
        tools: &[ToolSpec],
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<LlmEvent>>;
}

/// OpenAI-compatible endpoint configuration, loaded from the environment.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub temperature: f32,
    pub request_timeout_ms: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: std::env::var("PARLEY_LLM_BASE_URL")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "http://localhost:8000/v1".to_string()),
            model: std::env::var("PARLEY_LLM_MODEL")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "qwen2.5-0.5b-instruct".to_string()),
            api_key: std::env::var("PARLEY_LLM_API_KEY")
                .ok()
                .filter(|s| !s.is_empty()),
            temperature: std::env::var("PARLEY_LLM_TEMPERATURE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.7),
            request_timeout_ms: std::env::var("PARLEY_LLM_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(60_000),
        }
    }
}

/// Streaming client for OpenAI-compatible `chat/completions`.
pub struct OpenAiCompatModel {
    http: reqwest::Client,
    cfg: LlmConfig,
}

impl OpenAiCompatModel {
    pub fn new(cfg: LlmConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(cfg.request_timeout_ms))
            .build()
            .map_err(|e| OrchestratorError::ModelError(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http, cfg })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(LlmConfig::default())
    }

    fn body(&self, history: &[Turn], tools: &[ToolSpec]) -> Value {
        let messages: Vec<Value> = history
            .iter()
            .map(|t| {
                json!({
                    "role": match t.role {
                        Role::System => "system",
                        Role::User => "user",
                        Role::Assistant => "assistant",
                        Role::Tool => "tool",
                    },
                    "content": t.content,
                })
            })
            .collect();

        let mut body = json!({
            "model": self.cfg.model,
            "messages": messages,
            "temperature": self.cfg.temperature,
            "stream": true,
        });
        if !tools.is_empty() {
            body["tools"] = Value::Array(
                tools
                    .iter()
                    .map(|t| {
                        json!({
                            "type": "function",
                            "function": {
                                "name": t.name,
                                "description": t.description,
                                "parameters": t.parameters,
                            }
                        })
                    })
                    .collect(),
            );
        }
        body
    }
}

#[async_trait]
impl LanguageModel for OpenAiCompatModel {
    async fn stream(
        &self,
        history: &[Turn],
        tools: &[ToolSpec],
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<LlmEvent>> {
        let url = format!(
            "{}/chat/completions",
            self.cfg.base_url.trim_end_matches('/')
        );
        let mut req = self
            .http
            .post(&url)
            .header("content-type", "application/json");
        if let Some(key) = &self.cfg.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req
            .json(&self.body(history, tools))
            .send()
            .await
            .map_err(|e| OrchestratorError::ModelError(format!("chat request failed: {e}")))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(OrchestratorError::ModelError(format!(
                "chat error: status={status} body={body}"
            )));
        }

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut stream = resp.bytes_stream();
            let mut line_buf = String::new();
            // Tool-call fragments accumulate per delta index until the
            // finish reason arrives.
            let mut pending_tools: Vec<(String, String, String)> = Vec::new();
            let mut finished = false;

            loop {
                let chunk = tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(target: "orchestrator", "llm stream cancelled");
                        return;
                    }
                    chunk = stream.next() => chunk,
                };
                let Some(chunk) = chunk else { break };
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = tx.send(LlmEvent::Error(format!("stream read: {e}"))).await;
                        return;
                    }
                };

                line_buf.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(nl) = line_buf.find('\n') {
                    let line: String = line_buf.drain(..=nl).collect();
                    let line = line.trim();
                    let Some(data) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let data = data.trim();
                    if data == "[DONE]" {
                        finished = true;
                        continue;
                    }
                    let Ok(value) = serde_json::from_str::<Value>(data) else {
                        warn!(target: "orchestrator", "unparsable SSE chunk");
                        continue;
                    };
                    for ev in parse_delta(&value, &mut pending_tools) {
                        if tx.send(ev).await.is_err() {
                            return;
                        }
                    }
                }
            }

            if !finished {
                debug!(target: "orchestrator", "llm stream ended without [DONE]");
            }
            let _ = tx.send(LlmEvent::Done).await;
        });

        Ok(rx)
    }
}

/// Interpret one `chat.completions` stream chunk, emitting events and
/// collecting tool-call fragments into `pending`.
fn parse_delta(value: &Value, pending: &mut Vec<(String, String, String)>) -> Vec<LlmEvent> {
    let mut out = Vec::new();
    let Some(choice) = value
        .get("choices")
        .and_then(|c| c.as_array())
        .and_then(|a| a.first())
    else {
        return out;
    };

    if let Some(delta) = choice.get("delta") {
        if let Some(text) = delta.get("content").and_then(|c| c.as_str()) {
            if !text.is_empty() {
                out.push(LlmEvent::Token(text.to_string()));
            }
        }
        if let Some(calls) = delta.get("tool_calls").and_then(|t| t.as_array()) {
            for call in calls {
                let index = call.get("index").and_then(|i| i.as_u64()).unwrap_or(0) as usize;
                while pending.len() <= index {
                    pending.push((String::new(), String::new(), String::new()));
                }
                let slot = &mut pending[index];
                if let Some(id) = call.get("id").and_then(|i| i.as_str()) {
                    slot.0.push_str(id);
                }
                if let Some(func) = call.get("function") {
                    if let Some(name) = func.get("name").and_then(|n| n.as_str()) {
                        slot.1.push_str(name);
                    }
                    if let Some(args) = func.get("arguments").and_then(|a| a.as_str()) {
                        slot.2.push_str(args);
                    }
                }
            }
        }
    }

    if choice.get("finish_reason").and_then(|f| f.as_str()) == Some("tool_calls") {
        for (id, name, args) in pending.drain(..) {
            if name.is_empty() {
                continue;
            }
            let arguments = serde_json::from_str(&args).unwrap_or_else(|_| json!({}));
            out.push(LlmEvent::ToolCall {
                id,
                name,
                arguments,
            });
        }
    }
    out
}

/// One step of a scripted generation.
#[derive(Debug, Clone)]
pub enum ScriptItem {
    Token(String),
    ToolCall {
        id: String,
        name: String,
        arguments: Value,
    },
    /// Pause between items, keeping the stream open (cancellation window).
    Delay(u64),
    Error(String),
}

/// Deterministic model for tests: each `stream` call replays the next
/// scripted turn; an exhausted script yields an immediate `Done`.
pub struct ScriptedModel {
    turns: Mutex<VecDeque<Vec<ScriptItem>>>,
    seen: Mutex<Vec<Vec<Turn>>>,
}

impl ScriptedModel {
    pub fn new<I>(turns: I) -> Self
    where
        I: IntoIterator<Item = Vec<ScriptItem>>,
    {
        Self {
            turns: Mutex::new(turns.into_iter().collect()),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Convenience: a single turn that streams `text` word by word.
    pub fn speaking(text: &str) -> Self {
        let items = text
            .split_inclusive(' ')
            .map(|w| ScriptItem::Token(w.to_string()))
            .collect();
        Self::new([items])
    }

    /// Histories captured from each `stream` call.
    pub fn histories(&self) -> Vec<Vec<Turn>> {
        self.seen.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn stream(
        &self,
        history: &[Turn],
        _tools: &[ToolSpec],
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<LlmEvent>> {
        self.seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(history.to_vec());
        let items = self
            .turns
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or_default();

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            for item in items {
                if cancel.is_cancelled() {
                    return;
                }
                match item {
                    ScriptItem::Token(t) => {
                        if tx.send(LlmEvent::Token(t)).await.is_err() {
                            return;
                        }
                    }
                    ScriptItem::ToolCall {
                        id,
                        name,
                        arguments,
                    } => {
                        if tx
                            .send(LlmEvent::ToolCall {
                                id,
                                name,
                                arguments,
                            })
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    ScriptItem::Delay(ms) => {
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = tokio::time::sleep(Duration::from_millis(ms)) => {}
                        }
                    }
                    ScriptItem::Error(e) => {
                        let _ = tx.send(LlmEvent::Error(e)).await;
                        return;
                    }
                }
            }
            let _ = tx.send(LlmEvent::Done).await;
        });
        Ok(rx)
    }
}
