// Keyed per-conversation registry
use std::sync::Arc;

use dashmap::DashMap;

/// A registry of per-conversation state keyed by conversation id.
///
/// Deliberately narrow: workers create state lazily, remove it on teardown,
/// and sweep it with `for_each`; the underlying map is never exposed.
pub struct ConversationMap<T> {
    inner: DashMap<String, Arc<T>>,
}

impl<T> Default for ConversationMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ConversationMap<T> {
    pub fn new() -> Self {
        Self {
            inner: DashMap::new(),
        }
    }

    pub fn get(&self, id: &str) -> Option<Arc<T>> {
        self.inner.get(id).map(|e| Arc::clone(e.value()))
    }

    /// Fetch existing state or build it with `init`.
    pub fn get_or_create<F>(&self, id: &str, init: F) -> Arc<T>
    where
        F: FnOnce() -> T,
    {
        Arc::clone(
            self.inner
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(init()))
                .value(),
        )
    }

    /// Remove and return the state for `id`. Missing ids are a no-op, so
    /// teardown stays idempotent.
    pub fn remove(&self, id: &str) -> Option<Arc<T>> {
        self.inner.remove(id).map(|(_, v)| v)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Visit every live conversation.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&str, &Arc<T>),
    {
        for entry in self.inner.iter() {
            f(entry.key(), entry.value());
        }
    }

    /// Collect the ids for which `pred` holds (used by idle sweepers).
    pub fn ids_where<F>(&self, mut pred: F) -> Vec<String>
    where
        F: FnMut(&Arc<T>) -> bool,
    {
        self.inner
            .iter()
            .filter(|e| pred(e.value()))
            .map(|e| e.key().clone())
            .collect()
    }
}
