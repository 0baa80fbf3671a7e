//! Pub/sub handles.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tracing::debug;

use super::notifications::EventManager;
use crate::domain::flags::OperationFlags;
use crate::domain::item::{CacheValue, ValueEntry};
use crate::domain::messaging::{
    DeliveryOption, MessageAcks, OutgoingMessage, ReceivedMessage, SubscriptionInfo, SubscriptionPolicy,
};
use crate::domain::ports::CacheStrategy;
use crate::error::Result;

/// A named topic in the cache.
pub struct Topic {
    name: String,
    strategy: Arc<dyn CacheStrategy>,
    events: Arc<EventManager>,
}

impl Topic {
    pub(crate) fn new(name: String, strategy: Arc<dyn CacheStrategy>, events: Arc<EventManager>) -> Self {
        Self { name, strategy, events }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Serialize `value` and publish it; returns the message id.
    pub async fn publish<T: Serialize>(&self, value: &T, delivery: DeliveryOption) -> Result<String> {
        let mut flags = OperationFlags::empty();
        let payload = self
            .strategy
            .safe_serialize(CacheValue::from_serialize(value)?, &mut flags)?;
        let message = OutgoingMessage::new(&self.name, ValueEntry::new(payload, flags)).with_delivery(delivery);
        let id = message.id.clone();
        self.publish_message(message).await?;
        Ok(id)
    }

    pub async fn publish_message(&self, message: OutgoingMessage) -> Result<()> {
        self.strategy.publish_message(&message, OperationFlags::empty()).await
    }

    /// Messages stored on the topic, delivered or not yet acknowledged.
    pub async fn message_count(&self) -> Result<u64> {
        self.strategy.get_message_count(&self.name).await
    }

    pub async fn subscribe(&self, name: &str, policy: SubscriptionPolicy) -> Result<TopicSubscription> {
        let info = SubscriptionInfo {
            topic: self.name.clone(),
            name: name.to_string(),
            subscriber_id: uuid::Uuid::new_v4().to_string(),
            policy,
        };
        self.strategy.subscribe(&info).await?;
        debug!(topic = %self.name, subscription = %name, "Subscribed to topic");
        Ok(TopicSubscription {
            info,
            strategy: Arc::clone(&self.strategy),
            signal: self.events.topic_signal(&self.name),
        })
    }

    /// Remove the topic. Without `forcefully`, a topic holding messages is kept.
    pub async fn delete(self, forcefully: bool) -> Result<()> {
        self.strategy.remove_topic(&self.name, forcefully).await?;
        self.events.forget_topic(&self.name);
        Ok(())
    }
}

impl std::fmt::Debug for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Topic").field("name", &self.name).finish()
    }
}

/// One subscriber's view of a topic.
pub struct TopicSubscription {
    info: SubscriptionInfo,
    strategy: Arc<dyn CacheStrategy>,
    signal: Arc<Notify>,
}

impl TopicSubscription {
    pub fn info(&self) -> &SubscriptionInfo {
        &self.info
    }

    /// Pull pending messages for this subscriber.
    pub async fn receive(&self) -> Result<Vec<ReceivedMessage>> {
        let mut pulled = self.strategy.get_messages(&self.info.subscriber_id).await?;
        Ok(pulled.remove(&self.info.topic).unwrap_or_default())
    }

    pub fn decode(&self, message: &ReceivedMessage) -> Result<CacheValue> {
        self.strategy.safe_deserialize(message.payload.clone())
    }

    pub async fn acknowledge(&self, messages: &[ReceivedMessage]) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let mut acks = MessageAcks::new();
        acks.insert(
            self.info.topic.clone(),
            messages.iter().map(|m| m.id.clone()).collect(),
        );
        self.strategy.acknowledge_message_receipt(&acks).await
    }

    /// Wait until the cache reports new messages; false on timeout.
    pub async fn wait(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.signal.notified()).await.is_ok()
    }

    pub async fn unsubscribe(self) -> Result<()> {
        self.strategy.unsubscribe(&self.info).await
    }
}

impl std::fmt::Debug for TopicSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicSubscription").field("info", &self.info).finish()
    }
}
