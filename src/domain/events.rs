//! Cache Events
//!
//! Change notifications delivered to application callbacks, and the
//! registration values that tell the cache which notifications to send.
//!
//! # Flow
//!
//! ```text
//! engine / server ──Notification──▶ EventManager ──CacheEvent──▶ callbacks
//! ```
//!
//! Callbacks are registered against a stable handle or callback id; the
//! cache never compares closures.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::item::{GroupInfo, ValueEntry};
use super::lock::ItemVersion;

// =============================================================================
// Event Kinds
// =============================================================================

/// A single kind of cache change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    ItemAdded,
    ItemUpdated,
    ItemRemoved,
    CacheCleared,
    Custom,
}

impl EventType {
    pub fn as_set(self) -> EventTypes {
        match self {
            EventType::ItemAdded => EventTypes::ADDED,
            EventType::ItemUpdated => EventTypes::UPDATED,
            EventType::ItemRemoved => EventTypes::REMOVED,
            EventType::CacheCleared => EventTypes::CLEARED,
            EventType::Custom => EventTypes::CUSTOM,
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EventType::ItemAdded => "item-added",
            EventType::ItemUpdated => "item-updated",
            EventType::ItemRemoved => "item-removed",
            EventType::CacheCleared => "cache-cleared",
            EventType::Custom => "custom",
        };
        write!(f, "{}", name)
    }
}

/// Set of event kinds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventTypes(u8);

impl EventTypes {
    pub const ADDED: Self = Self(1 << 0);
    pub const UPDATED: Self = Self(1 << 1);
    pub const REMOVED: Self = Self(1 << 2);
    pub const CLEARED: Self = Self(1 << 3);
    pub const CUSTOM: Self = Self(1 << 4);
    pub const ITEM_CHANGES: Self = Self(Self::ADDED.0 | Self::UPDATED.0 | Self::REMOVED.0);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn includes(self, event: EventType) -> bool {
        self.contains(event.as_set())
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Individual kinds in this set.
    pub fn iter(self) -> impl Iterator<Item = EventType> {
        [
            EventType::ItemAdded,
            EventType::ItemUpdated,
            EventType::ItemRemoved,
            EventType::CacheCleared,
            EventType::Custom,
        ]
        .into_iter()
        .filter(move |e| self.includes(*e))
    }
}

impl std::ops::BitOr for EventTypes {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl From<EventType> for EventTypes {
    fn from(e: EventType) -> Self {
        e.as_set()
    }
}

/// How much of the item accompanies a notification.
///
/// Ordered: a registration requesting more data subsumes one requesting less.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EventDataFilter {
    #[default]
    None,
    Metadata,
    DataWithMetadata,
}

/// Why an item left the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemovedReason {
    Removed,
    Expired,
    Evicted,
    DependencyChanged,
}

// =============================================================================
// Event Payloads
// =============================================================================

/// Item state attached to an event, trimmed to the requested filter.
#[derive(Debug, Clone, PartialEq)]
pub struct EventItem {
    pub value: Option<ValueEntry>,
    pub version: Option<ItemVersion>,
    pub group: Option<GroupInfo>,
}

impl EventItem {
    /// Apply a data filter; `None` drops the item entirely.
    pub fn filtered(self, filter: EventDataFilter) -> Option<Self> {
        match filter {
            EventDataFilter::None => None,
            EventDataFilter::Metadata => Some(Self {
                value: None,
                ..self
            }),
            EventDataFilter::DataWithMetadata => Some(self),
        }
    }
}

/// A change notification as seen by application callbacks.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEvent {
    pub cache_name: String,
    pub key: Option<String>,
    pub event_type: EventType,
    pub item: Option<EventItem>,
    pub old_item: Option<EventItem>,
    pub reason: Option<RemovedReason>,
    /// Custom event body
    pub data: Option<Bytes>,
    pub timestamp: DateTime<Utc>,
}

impl CacheEvent {
    pub fn new(cache_name: impl Into<String>, key: Option<String>, event_type: EventType) -> Self {
        Self {
            cache_name: cache_name.into(),
            key,
            event_type,
            item: None,
            old_item: None,
            reason: None,
            data: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_item(mut self, item: EventItem) -> Self {
        self.item = Some(item);
        self
    }

    pub fn with_old_item(mut self, item: EventItem) -> Self {
        self.old_item = Some(item);
        self
    }

    pub fn with_reason(mut self, reason: RemovedReason) -> Self {
        self.reason = Some(reason);
        self
    }

    pub fn with_data(mut self, data: Bytes) -> Self {
        self.data = Some(data);
        self
    }

    /// Copy trimmed to what a subscriber with `filter` asked for.
    pub fn filtered(&self, filter: EventDataFilter) -> Self {
        let mut event = self.clone();
        event.item = event.item.and_then(|i| i.filtered(filter));
        event.old_item = event.old_item.and_then(|i| i.filtered(filter));
        event
    }
}

// =============================================================================
// Callbacks and Registrations
// =============================================================================

/// Application callback for cache events.
pub type EventHandler = Arc<dyn Fn(&CacheEvent) + Send + Sync>;

/// Callback plus the amount of data it wants.
#[derive(Clone)]
pub struct ItemCallback {
    pub handler: EventHandler,
    pub filter: EventDataFilter,
}

impl ItemCallback {
    pub fn new<F>(filter: EventDataFilter, handler: F) -> Self
    where
        F: Fn(&CacheEvent) + Send + Sync + 'static,
    {
        Self {
            handler: Arc::new(handler),
            filter,
        }
    }
}

impl std::fmt::Debug for ItemCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ItemCallback")
            .field("filter", &self.filter)
            .finish_non_exhaustive()
    }
}

/// Short id standing in for a registered callback on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CallbackId(pub u32);

impl std::fmt::Display for CallbackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cb#{}", self.0)
    }
}

/// Callback ids sent along with a write or key registration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemCallbackIds {
    pub on_update: Option<CallbackId>,
    pub on_remove: Option<CallbackId>,
    pub filter: EventDataFilter,
    pub notify_on_expiration: bool,
}

impl ItemCallbackIds {
    pub fn is_empty(&self) -> bool {
        self.on_update.is_none() && self.on_remove.is_none()
    }
}

/// Stable handle returned by a notification registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubscriptionHandle(pub u64);

impl std::fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub#{}", self.0)
    }
}

// =============================================================================
// Inbound Notifications
// =============================================================================

/// Notification pushed by an engine or server towards the client.
#[derive(Debug, Clone)]
pub enum Notification {
    /// Key-level callback registered through item callbacks or key registration
    Item { callback: CallbackId, event: CacheEvent },
    /// Cache-wide event
    General { event: CacheEvent },
    /// Continuous-query match, addressed by the server-assigned query id
    Query { server_query_id: String, event: CacheEvent },
    /// Continuous query result set was cleared
    QueryCleared { server_query_id: String },
    /// New messages are available for a subscription
    MessagesAvailable { topic: String },
}

// =============================================================================
// Delivery
// =============================================================================

/// Deliver `event` to one subscriber.
///
/// A panicking handler is caught and logged so the remaining subscribers
/// still receive the event. With `background` set and a Tokio runtime
/// available, the handler runs on its own task.
pub fn deliver(handler: &EventHandler, event: CacheEvent, background: bool) {
    if background {
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let handler = Arc::clone(handler);
            runtime.spawn(async move { invoke_guarded(&handler, &event) });
            return;
        }
    }
    invoke_guarded(handler, &event);
}

fn invoke_guarded(handler: &EventHandler, event: &CacheEvent) {
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(event)));
    if outcome.is_err() {
        tracing::warn!(
            event_type = %event.event_type,
            key = ?event.key,
            "Notification handler panicked, continuing delivery"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::flags::OperationFlags;
    use crate::domain::item::Payload;

    fn event_item() -> EventItem {
        EventItem {
            value: Some(ValueEntry::new(
                Payload::Native(serde_json::json!(7)),
                OperationFlags::empty(),
            )),
            version: Some(ItemVersion(3)),
            group: None,
        }
    }

    #[test]
    fn test_filter_ordering() {
        assert!(EventDataFilter::DataWithMetadata > EventDataFilter::Metadata);
        assert!(EventDataFilter::Metadata > EventDataFilter::None);
    }

    #[test]
    fn test_event_filtering() {
        let event = CacheEvent::new("c", Some("k".into()), EventType::ItemUpdated)
            .with_item(event_item())
            .with_old_item(event_item());

        let meta = event.filtered(EventDataFilter::Metadata);
        let item = meta.item.unwrap();
        assert!(item.value.is_none());
        assert_eq!(item.version, Some(ItemVersion(3)));

        let none = event.filtered(EventDataFilter::None);
        assert!(none.item.is_none() && none.old_item.is_none());

        let full = event.filtered(EventDataFilter::DataWithMetadata);
        assert!(full.item.unwrap().value.is_some());
    }

    #[test]
    fn test_event_type_sets() {
        let set = EventTypes::ADDED | EventTypes::REMOVED;
        let kinds: Vec<_> = set.iter().collect();
        assert_eq!(kinds, vec![EventType::ItemAdded, EventType::ItemRemoved]);
        assert!(EventTypes::ITEM_CHANGES.includes(EventType::ItemUpdated));
        assert!(!EventTypes::ITEM_CHANGES.includes(EventType::CacheCleared));
    }

    #[test]
    fn test_panicking_handler_is_contained() {
        let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let bad: EventHandler = Arc::new(|_| panic!("subscriber bug"));
        let counter = hits.clone();
        let good: EventHandler = Arc::new(move |_| {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });

        let event = CacheEvent::new("c", None, EventType::CacheCleared);
        deliver(&bad, event.clone(), false);
        deliver(&good, event, false);

        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
