//! Broker topic names.
//!
//! These are the exact wire names shared by every worker; the per-conversation
//! audio output topic is built with [`audio_output_stream`].

/// Client microphone audio, one shared topic keyed by payload conversation id.
pub const AUDIO_IN: &str = "audio_stream_channel";

/// Partial and final transcripts.
pub const TRANSCRIPT: &str = "transcript_channel";

/// Streaming assistant tokens.
pub const LLM_TOKEN: &str = "llm_token_channel";

/// Server-side tool progress (running/completed/failed).
pub const LLM_TOOL_CALL: &str = "llm_tool_call_channel";

/// Client-executed tool requests.
pub const CLIENT_TOOL_REQUEST: &str = "client_tool_request";

/// Client-executed tool responses.
pub const CLIENT_TOOL_RESPONSE: &str = "client_tool_response";

/// Client-advertised tool schemas.
pub const CLIENT_CAPABILITIES: &str = "client_capabilities";

/// Sentence synthesis requests.
pub const TTS_REQUEST: &str = "tts_request_channel";

/// Stop/flush commands for TTS, per conversation.
pub const TTS_CONTROL: &str = "tts_control_channel";

/// Barge-in signals.
pub const BARGE_IN: &str = "barge_in_notifications";

/// Connection lifecycle notifications.
pub const CONNECTION_EVENTS: &str = "connection_events";

/// Per-conversation TTS audio stream (binary frames + JSON envelopes).
pub fn audio_output_stream(conversation_id: &str) -> String {
    format!("audio_output_stream:{conversation_id}")
}
