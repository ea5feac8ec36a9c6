// Broker pub/sub implementation
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::messages::{AudioFrame, WireMessage};
use crate::Result;

/// One unit of broker traffic: a JSON control record or a binary audio frame.
#[derive(Debug, Clone)]
pub enum Payload {
    Control(WireMessage),
    Audio(AudioFrame),
}

impl Payload {
    pub fn conversation_id(&self) -> &str {
        match self {
            Payload::Control(msg) => msg.conversation_id(),
            Payload::Audio(frame) => &frame.conversation_id,
        }
    }
}

/// Delivery class for a subscription.
///
/// Realtime subscribers get a short queue and lose messages rather than stall
/// the publisher (audio paths). Batched subscribers get a deeper queue and the
/// publisher awaits capacity (control paths).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QosLevel {
    Realtime,
    Batched,
}

impl QosLevel {
    fn capacity(self) -> usize {
        match self {
            QosLevel::Realtime => 64,
            QosLevel::Batched => 1024,
        }
    }
}

/// Per-topic delivery counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TopicStats {
    pub total_published: u64,
    pub total_delivered: u64,
    pub dropped: u64,
    pub active_subscriptions: usize,
}

struct Subscriber {
    id: String,
    qos: QosLevel,
    sender: mpsc::Sender<Payload>,
}

/// A live subscription: receive with [`Subscription::recv`], release with
/// [`Broker::unsubscribe`] (or just let the receiver drop — closed channels
/// are pruned on the next publish).
pub struct Subscription {
    pub id: String,
    rx: mpsc::Receiver<Payload>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Payload> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Payload> {
        self.rx.try_recv().ok()
    }
}

/// Topic-based publish/subscribe with no durability.
///
/// Subscribers receive only messages published while subscribed; publishing
/// to a topic nobody listens on succeeds and delivers nothing.
pub struct Broker {
    subscriptions: DashMap<String, Vec<Subscriber>>,
    stats: DashMap<String, TopicStats>,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker {
    pub fn new() -> Self {
        Self {
            subscriptions: DashMap::new(),
            stats: DashMap::new(),
        }
    }

    /// Convenience for the common shared-handle construction.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Publish to a topic. Returns the number of subscribers reached.
    pub async fn publish(&self, topic: &str, payload: Payload) -> Result<usize> {
        self.update_stats(topic, |s| s.total_published += 1);

        // Collect senders first so the dashmap shard lock is not held across
        // an await on a batched queue.
        let targets: Vec<(String, QosLevel, mpsc::Sender<Payload>)> = match self
            .subscriptions
            .get(topic)
        {
            Some(subs) => subs
                .iter()
                .map(|s| (s.id.clone(), s.qos, s.sender.clone()))
                .collect(),
            None => {
                debug!(target: "broker", %topic, "publish with no subscribers");
                return Ok(0);
            }
        };

        let mut delivered = 0u64;
        let mut dropped = 0u64;
        let mut stale: Vec<String> = Vec::new();

        for (id, qos, sender) in targets {
            match qos {
                QosLevel::Realtime => match sender.try_send(payload.clone()) {
                    Ok(()) => delivered += 1,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        dropped += 1;
                        warn!(target: "broker", %topic, subscription = %id, "dropped realtime message for slow subscriber");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => stale.push(id),
                },
                QosLevel::Batched => match sender.send(payload.clone()).await {
                    Ok(()) => delivered += 1,
                    Err(_) => stale.push(id),
                },
            }
        }

        if !stale.is_empty() {
            self.prune(topic, &stale);
        }

        self.update_stats(topic, |s| {
            s.total_delivered += delivered;
            s.dropped += dropped;
        });

        Ok(delivered as usize)
    }

    /// Subscribe to a topic with the given delivery class.
    pub fn subscribe(&self, topic: &str, qos: QosLevel) -> Subscription {
        let id = format!("sub_{}_{}", topic, uuid::Uuid::new_v4().simple());
        let (tx, rx) = mpsc::channel(qos.capacity());

        self.subscriptions
            .entry(topic.to_string())
            .or_default()
            .push(Subscriber {
                id: id.clone(),
                qos,
                sender: tx,
            });
        self.update_stats(topic, |s| s.active_subscriptions += 1);

        info!(target: "broker", %topic, subscription = %id, "subscribed");
        Subscription { id, rx }
    }

    /// Remove a subscription by id. Unknown ids are a no-op.
    pub fn unsubscribe(&self, subscription_id: &str) {
        for mut entry in self.subscriptions.iter_mut() {
            let before = entry.value().len();
            entry.value_mut().retain(|s| s.id != subscription_id);
            if entry.value().len() != before {
                let topic = entry.key().clone();
                drop(entry);
                self.update_stats(&topic, |s| {
                    s.active_subscriptions = s.active_subscriptions.saturating_sub(1);
                });
                info!(target: "broker", subscription = %subscription_id, "unsubscribed");
                return;
            }
        }
    }

    pub fn stats(&self, topic: &str) -> Option<TopicStats> {
        self.stats.get(topic).map(|s| s.clone())
    }

    fn prune(&self, topic: &str, stale: &[String]) {
        if let Some(mut subs) = self.subscriptions.get_mut(topic) {
            subs.retain(|s| !stale.iter().any(|id| id == &s.id));
        }
        self.update_stats(topic, |s| {
            s.active_subscriptions = s.active_subscriptions.saturating_sub(stale.len());
        });
        debug!(target: "broker", %topic, count = stale.len(), "pruned closed subscriptions");
    }

    fn update_stats<F>(&self, topic: &str, f: F)
    where
        F: FnOnce(&mut TopicStats),
    {
        f(self.stats.entry(topic.to_string()).or_default().value_mut());
    }
}
