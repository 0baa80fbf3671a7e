//! Pub/sub value types.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::item::ValueEntry;

/// Whether `get_or_create_topic` may create the topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TopicOperation {
    Get,
    Create,
}

/// How a subscription shares messages with other subscribers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubscriptionPolicy {
    /// Each message goes to one subscriber of the subscription
    #[default]
    Shared,
    /// A single subscriber owns the subscription
    Exclusive,
}

/// Who receives a published message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryOption {
    /// Every subscription receives it
    #[default]
    All,
    /// Any one subscription receives it
    Any,
}

/// A subscription on a topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionInfo {
    pub topic: String,
    pub name: String,
    pub subscriber_id: String,
    pub policy: SubscriptionPolicy,
}

/// Message to publish.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub id: String,
    pub topic: String,
    pub payload: ValueEntry,
    pub delivery: DeliveryOption,
    pub expiration: Option<Duration>,
    pub created_at: DateTime<Utc>,
}

impl OutgoingMessage {
    pub fn new(topic: impl Into<String>, payload: ValueEntry) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            topic: topic.into(),
            payload,
            delivery: DeliveryOption::default(),
            expiration: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_delivery(mut self, delivery: DeliveryOption) -> Self {
        self.delivery = delivery;
        self
    }

    pub fn with_expiration(mut self, ttl: Duration) -> Self {
        self.expiration = Some(ttl);
        self
    }
}

/// Message pulled for a subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedMessage {
    pub id: String,
    pub topic: String,
    pub payload: ValueEntry,
    pub created_at: DateTime<Utc>,
}

/// Pulled messages grouped by topic.
pub type ReceivedMessages = HashMap<String, Vec<ReceivedMessage>>;

/// Message ids to acknowledge, grouped by topic.
pub type MessageAcks = HashMap<String, Vec<String>>;
