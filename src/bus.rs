//! In-process pub/sub keyed by `(owner, session)`.

use crate::events::SessionEvent;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

pub const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    #[error("no subscribers on {0}")]
    NoSubscribers(String),
    #[error("subscription to {topic} lagged by {skipped} events")]
    Lagged { topic: String, skipped: u64 },
    #[error("topic {0} closed")]
    Closed(String),
}

pub fn topic(owner: &str, session_id: &str) -> String {
    format!("session.{owner}.{session_id}")
}

#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    channels: RwLock<HashMap<String, broadcast::Sender<SessionEvent>>>,
    capacity: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                channels: RwLock::new(HashMap::new()),
                capacity: capacity.max(1),
            }),
        }
    }

    /// Registers a receiver on the topic. Events published after this call
    /// returns are delivered to it.
    pub fn subscribe(&self, owner: &str, session_id: &str) -> Subscription {
        let topic = topic(owner, session_id);
        let rx = self.register(&topic);
        Subscription {
            topic,
            rx,
            inner: self.inner.clone(),
        }
    }

    /// Returns how many subscribers received the event.
    pub fn publish(
        &self,
        owner: &str,
        session_id: &str,
        event: SessionEvent,
    ) -> Result<usize, BusError> {
        let topic = topic(owner, session_id);
        let tx = self.inner.channels.read().get(&topic).cloned();
        let Some(tx) = tx else {
            return Err(BusError::NoSubscribers(topic));
        };
        tx.send(event).map_err(|_| BusError::NoSubscribers(topic))
    }

    pub fn topic_count(&self) -> usize {
        self.inner.channels.read().len()
    }

    /// Creates the receiver while the map lock is held so a concurrent
    /// unsubscribe cannot remove the topic between lookup and registration.
    fn register(&self, topic: &str) -> broadcast::Receiver<SessionEvent> {
        let channels = self.inner.channels.read();
        if let Some(tx) = channels.get(topic) {
            return tx.subscribe();
        }
        drop(channels);

        let mut channels = self.inner.channels.write();
        if let Some(tx) = channels.get(topic) {
            return tx.subscribe();
        }
        let (tx, rx) = broadcast::channel(self.inner.capacity);
        channels.insert(topic.to_string(), tx);
        rx
    }
}

/// A live registration on a topic. Dropping it unsubscribes, and the topic
/// is removed once its last subscriber is gone.
pub struct Subscription {
    topic: String,
    rx: broadcast::Receiver<SessionEvent>,
    inner: Arc<BusInner>,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub async fn recv(&mut self) -> Result<SessionEvent, BusError> {
        match self.rx.recv().await {
            Ok(event) => Ok(event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => Err(BusError::Lagged {
                topic: self.topic.clone(),
                skipped,
            }),
            Err(broadcast::error::RecvError::Closed) => Err(BusError::Closed(self.topic.clone())),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut channels = self.inner.channels.write();
        // `self.rx` is still alive here and counts as one receiver.
        let idle = channels
            .get(&self.topic)
            .is_some_and(|tx| tx.receiver_count() <= 1);
        if idle {
            channels.remove(&self.topic);
        }
    }
}
