use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::debug;

use soulbrowser_core_types::BusError;

pub use broadcast::error::RecvError;

/// Trait implemented by payload types that can be carried on the bus.
pub trait Event: Clone + Send + Sync + std::fmt::Debug + 'static {}

impl<T> Event for T where T: Clone + Send + Sync + std::fmt::Debug + 'static {}

#[async_trait]
pub trait EventBus<E>: Send + Sync
where
    E: Event,
{
    async fn publish(&self, event: E) -> Result<(), BusError>;
    fn subscribe(&self) -> broadcast::Receiver<E>;
}

/// Simple in-memory bus suitable for unit tests and observability hooks.
pub struct InMemoryBus<E>
where
    E: Event,
{
    sender: broadcast::Sender<E>,
}

impl<E> InMemoryBus<E>
where
    E: Event,
{
    pub fn new(capacity: usize) -> Arc<Self> {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Arc::new(Self { sender })
    }

    /// Publish without caring whether anyone listens.
    pub fn emit(&self, event: E) {
        let _ = self.sender.send(event);
    }
}

#[async_trait]
impl<E> EventBus<E> for InMemoryBus<E>
where
    E: Event,
{
    async fn publish(&self, event: E) -> Result<(), BusError> {
        self.sender
            .send(event)
            .map(|_| ())
            .map_err(|err| BusError::Internal(err.to_string()))
    }

    fn subscribe(&self) -> broadcast::Receiver<E> {
        self.sender.subscribe()
    }
}

/// Bus partitioned by topic key. A topic exists only while it has subscribers; publishing to
/// a topic nobody listens on is not an error and reaches nobody.
pub struct TopicBus<E>
where
    E: Event,
{
    topics: DashMap<String, broadcast::Sender<E>>,
    capacity: usize,
}

impl<E> TopicBus<E>
where
    E: Event,
{
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            topics: DashMap::new(),
            capacity: capacity.max(1),
        })
    }

    pub fn subscribe(self: &Arc<Self>, topic: &str) -> TopicSubscription<E> {
        let receiver = self
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();
        debug!(target: "event-bus", topic, "topic subscriber added");
        TopicSubscription {
            topic: topic.to_string(),
            receiver: Some(receiver),
            bus: Arc::downgrade(self),
        }
    }

    /// Returns how many subscribers received the event.
    pub fn publish(&self, topic: &str, event: E) -> usize {
        match self.topics.get(topic) {
            Some(sender) => sender.send(event).unwrap_or(0),
            None => 0,
        }
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    pub fn topics(&self) -> Vec<String> {
        self.topics.iter().map(|entry| entry.key().clone()).collect()
    }

    fn release(&self, topic: &str) {
        if self
            .topics
            .remove_if(topic, |_, sender| sender.receiver_count() == 0)
            .is_some()
        {
            debug!(target: "event-bus", topic, "topic dropped after last subscriber left");
        }
    }
}

/// Receiving side of a topic; dropping it unsubscribes.
pub struct TopicSubscription<E>
where
    E: Event,
{
    topic: String,
    receiver: Option<broadcast::Receiver<E>>,
    bus: Weak<TopicBus<E>>,
}

impl<E> TopicSubscription<E>
where
    E: Event,
{
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub async fn recv(&mut self) -> Result<E, RecvError> {
        match self.receiver.as_mut() {
            Some(receiver) => receiver.recv().await,
            None => Err(RecvError::Closed),
        }
    }
}

impl<E> Drop for TopicSubscription<E>
where
    E: Event,
{
    fn drop(&mut self) {
        drop(self.receiver.take());
        if let Some(bus) = self.bus.upgrade() {
            bus.release(&self.topic);
        }
    }
}
