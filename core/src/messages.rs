//! Wire message model.
//!
//! Every JSON control message in the system — client socket traffic in both
//! directions and broker control records — is one variant of [`WireMessage`],
//! discriminated by a single `type` field. Payloads are parsed into this sum
//! exactly once, at the boundary where the JSON enters the process; the rest
//! of the pipeline matches on variants. Binary mic/TTS audio travels as
//! [`AudioFrame`] and never passes through serde.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One raw PCM audio frame (16-bit signed little-endian, mono, 16 kHz).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub conversation_id: String,
    pub pcm: Vec<u8>,
}

impl AudioFrame {
    pub fn new(conversation_id: impl Into<String>, pcm: Vec<u8>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            pcm,
        }
    }
}

/// Speaker role of a history turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One conversation history turn, as persisted under `conversation.history:<id>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Tool progress states surfaced to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolStatus {
    Running,
    Completed,
    Failed,
}

/// Commands on the TTS control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TtsControlAction {
    Stop,
}

/// A client-advertised tool: description plus JSON Schema for its arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCapability {
    pub description: String,
    pub parameters: Value,
}

/// The closed sum of JSON control messages.
///
/// Variant tags are the `type` strings on the wire; fields serialize
/// camelCase to match the client contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    /// Session lifecycle notice (e.g. `conversation_started`).
    #[serde(rename_all = "camelCase")]
    SystemEvent {
        event: String,
        conversation_id: String,
    },

    /// Streaming ASR hypothesis.
    #[serde(rename_all = "camelCase")]
    PartialTranscript {
        conversation_id: String,
        transcript: String,
        timestamp_ms: i64,
    },

    /// Stable ASR result.
    #[serde(rename_all = "camelCase")]
    FinalTranscript {
        conversation_id: String,
        transcript: String,
        timestamp_ms: i64,
    },

    /// One chunk of streamed assistant text.
    #[serde(rename_all = "camelCase")]
    Token {
        conversation_id: String,
        role: Role,
        content: String,
    },

    /// Tool progress, server-side or client-side.
    #[serde(rename_all = "camelCase")]
    Tool {
        conversation_id: String,
        tool_call_id: String,
        name: String,
        status: ToolStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
    },

    /// Ask a client to execute one of its advertised tools.
    #[serde(rename_all = "camelCase")]
    ToolRequest {
        conversation_id: String,
        tool_call_id: String,
        tool_name: String,
        arguments: Value,
        timeout_ms: u64,
    },

    /// Result of a client-executed tool.
    #[serde(rename_all = "camelCase")]
    ToolResponse {
        tool_call_id: String,
        conversation_id: String,
        success: bool,
        #[serde(default)]
        result: Value,
    },

    /// Client-advertised tool catalog. The client omits `conversationId`;
    /// the gateway stamps it before re-publishing on the broker.
    #[serde(rename_all = "camelCase")]
    ClientCapabilities {
        #[serde(default)]
        conversation_id: String,
        client_id: String,
        capabilities: HashMap<String, ToolCapability>,
    },

    /// Begin one sentence's audio on the per-conversation output stream.
    #[serde(rename_all = "camelCase")]
    AudioStreamStart {
        conversation_id: String,
        sample_rate: u32,
        channels: u16,
        format: String,
    },

    /// End of one sentence's audio, natural or `interrupted`.
    #[serde(rename_all = "camelCase")]
    AudioStreamEnd {
        conversation_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// Fatal synthesis error for the current sentence.
    #[serde(rename_all = "camelCase")]
    AudioStreamError {
        conversation_id: String,
        error: String,
    },

    /// Instruct consumers to cancel in-flight work and purge queued audio.
    #[serde(rename_all = "camelCase")]
    BargeInNotification {
        conversation_id: String,
        timestamp_ms: i64,
    },

    /// One sentence-sized unit of synthesis work for the TTS worker.
    #[serde(rename_all = "camelCase")]
    SentenceRequest {
        conversation_id: String,
        text: String,
        voice_id: String,
        sequence_number: u64,
    },

    /// Stop/flush command for the TTS worker.
    #[serde(rename_all = "camelCase")]
    TtsControl {
        conversation_id: String,
        action: TtsControlAction,
    },

    /// Connection lifecycle record; `kind` is currently always `disconnected`.
    #[serde(rename_all = "camelCase")]
    ConnectionEvent {
        kind: String,
        conversation_id: String,
        reason: String,
        timestamp_ms: i64,
    },
}

impl WireMessage {
    /// The conversation this message belongs to. `ToolResponse` and
    /// `ClientCapabilities` may carry an empty id before the gateway stamps
    /// one; callers filter on non-empty matches.
    pub fn conversation_id(&self) -> &str {
        match self {
            WireMessage::SystemEvent {
                conversation_id, ..
            }
            | WireMessage::PartialTranscript {
                conversation_id, ..
            }
            | WireMessage::FinalTranscript {
                conversation_id, ..
            }
            | WireMessage::Token {
                conversation_id, ..
            }
            | WireMessage::Tool {
                conversation_id, ..
            }
            | WireMessage::ToolRequest {
                conversation_id, ..
            }
            | WireMessage::ToolResponse {
                conversation_id, ..
            }
            | WireMessage::ClientCapabilities {
                conversation_id, ..
            }
            | WireMessage::AudioStreamStart {
                conversation_id, ..
            }
            | WireMessage::AudioStreamEnd {
                conversation_id, ..
            }
            | WireMessage::AudioStreamError {
                conversation_id, ..
            }
            | WireMessage::BargeInNotification {
                conversation_id, ..
            }
            | WireMessage::SentenceRequest {
                conversation_id, ..
            }
            | WireMessage::TtsControl {
                conversation_id, ..
            }
            | WireMessage::ConnectionEvent {
                conversation_id, ..
            } => conversation_id,
        }
    }

    /// Build a disconnect lifecycle record.
    pub fn disconnected(conversation_id: impl Into<String>, reason: impl Into<String>) -> Self {
        WireMessage::ConnectionEvent {
            kind: "disconnected".to_string(),
            conversation_id: conversation_id.into(),
            reason: reason.into(),
            timestamp_ms: crate::now_ms(),
        }
    }

    /// Parse one JSON control message at the boundary.
    pub fn parse(raw: &str) -> crate::Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| crate::CoreError::ProtocolError(format!("bad control message: {e}")))
    }

    /// Serialize for the client socket.
    pub fn to_json(&self) -> String {
        // The sum contains only JSON-representable fields.
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}
