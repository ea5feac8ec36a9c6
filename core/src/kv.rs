// Short-TTL key/value store for conversation scratch state
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{de::DeserializeOwned, Serialize};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::{CoreError, Result};

/// Conversation scratch keys and their default TTLs.
pub mod keys {
    use std::time::Duration;

    pub const CONFIG_TTL: Duration = Duration::from_secs(60 * 60);
    pub const HISTORY_TTL: Duration = Duration::from_secs(60 * 60);
    pub const TTS_ACTIVE_TTL: Duration = Duration::from_secs(30);

    pub fn conversation_config(id: &str) -> String {
        format!("conversation.config:{id}")
    }

    pub fn conversation_history(id: &str) -> String {
        format!("conversation.history:{id}")
    }

    pub fn tts_active(id: &str) -> String {
        format!("ttsActive:{id}")
    }
}

struct Entry {
    bytes: Vec<u8>,
    deadline: Instant,
}

/// In-memory key/value store with per-key TTL.
///
/// Values are stored as serialized JSON. Reads treat expired entries as
/// absent even before the sweeper reclaims them; the sweeper only bounds
/// memory.
pub struct TtlStore {
    entries: Arc<DashMap<String, Entry>>,
}

impl Default for TtlStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TtlStore {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
        }
    }

    /// Store a value under `key` for `ttl`.
    pub fn put<V: Serialize>(&self, key: &str, value: &V, ttl: Duration) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.entries.insert(
            key.to_string(),
            Entry {
                bytes,
                deadline: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    /// Fetch and deserialize; expired or missing keys yield `None`.
    pub fn get<V: DeserializeOwned>(&self, key: &str) -> Result<Option<V>> {
        match self.entries.get(key) {
            Some(entry) if entry.deadline > Instant::now() => {
                let value = serde_json::from_slice(&entry.bytes)
                    .map_err(|e| CoreError::StoreError(format!("corrupt value at {key}: {e}")))?;
                Ok(Some(value))
            }
            _ => Ok(None),
        }
    }

    /// Whether a live (unexpired) entry exists.
    pub fn exists(&self, key: &str) -> bool {
        self.entries
            .get(key)
            .map(|e| e.deadline > Instant::now())
            .unwrap_or(false)
    }

    /// Extend a live entry's deadline. Expired or missing keys are a no-op
    /// and return false.
    pub fn refresh(&self, key: &str, ttl: Duration) -> bool {
        match self.entries.get_mut(key) {
            Some(mut entry) if entry.deadline > Instant::now() => {
                entry.deadline = Instant::now() + ttl;
                true
            }
            _ => false,
        }
    }

    /// Remove a key. Missing keys are a no-op.
    pub fn delete(&self, key: &str) {
        self.entries.remove(key);
    }

    /// Spawn the background sweeper that reclaims expired entries.
    pub fn start_sweeper(&self, interval: Duration) -> JoinHandle<()> {
        let entries = Arc::clone(&self.entries);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            loop {
                tick.tick().await;
                let now = Instant::now();
                let before = entries.len();
                entries.retain(|_, e| e.deadline > now);
                let reaped = before.saturating_sub(entries.len());
                if reaped > 0 {
                    debug!(target: "broker", reaped, "swept expired keys");
                }
            }
        })
    }
}
