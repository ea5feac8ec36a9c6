// Parley Core Library
// Broker, wire model and shared utilities for the spoken-dialog pipeline

pub mod broker;
pub mod conversation;
pub mod kv;
pub mod messages;
pub mod pcm;
pub mod topics;

// Export core types
pub use broker::{Broker, Payload, QosLevel, Subscription, TopicStats};
pub use conversation::ConversationMap;
pub use kv::TtlStore;
pub use messages::{
    AudioFrame, Role, ToolCapability, ToolStatus, TtsControlAction, Turn, WireMessage,
};

// Error types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Broker error: {0}")]
    BrokerError(String),

    #[error("Store error: {0}")]
    StoreError(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Audio error: {0}")]
    AudioError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}
pub type Result<T> = std::result::Result<T, CoreError>;

/// Wall-clock timestamp in milliseconds, as stamped on wire events.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Generate a fresh opaque conversation identifier.
pub fn new_conversation_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
