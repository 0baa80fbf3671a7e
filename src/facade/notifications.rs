//! Event Manager
//!
//! Client-side fan-out of notifications pushed by an engine or broker.
//!
//! ```text
//! Notification::Item      ──▶ item callback table    (CallbackId → ItemCallback)
//! Notification::General   ──▶ cache-wide subscribers (SubscriptionHandle → types, filter, handler)
//! Notification::Query     ──▶ ContinuousQuery::dispatch       (by server query id)
//! Notification::QueryCleared ─▶ ContinuousQuery::dispatch_clear
//! Notification::MessagesAvailable ─▶ per-topic wake-up signal
//! ```
//!
//! Callbacks are addressed by ids issued here; closures are never compared.
//! A handler is cloned out of its table before it runs, so a handler may
//! register or unregister callbacks itself.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::domain::events::{
    deliver, CacheEvent, CallbackId, EventDataFilter, EventHandler, EventTypes, ItemCallback,
    Notification, SubscriptionHandle,
};
use crate::domain::ports::NotificationSink;
use crate::domain::query::ContinuousQuery;

struct GeneralSubscription {
    types: EventTypes,
    filter: EventDataFilter,
    handler: EventHandler,
}

/// Routes inbound notifications to application callbacks.
pub struct EventManager {
    cache_name: String,
    background: bool,
    item_callbacks: DashMap<CallbackId, ItemCallback>,
    general: DashMap<SubscriptionHandle, GeneralSubscription>,
    queries: DashMap<String, Arc<ContinuousQuery>>,
    topics: DashMap<String, Arc<Notify>>,
    next_callback: AtomicU32,
    next_handle: AtomicU64,
    sequence: AtomicU64,
    delivered: AtomicU64,
}

impl EventManager {
    /// `background` runs handlers on their own Tokio tasks.
    pub fn new(cache_name: impl Into<String>, background: bool) -> Self {
        Self {
            cache_name: cache_name.into(),
            background,
            item_callbacks: DashMap::new(),
            general: DashMap::new(),
            queries: DashMap::new(),
            topics: DashMap::new(),
            next_callback: AtomicU32::new(1),
            next_handle: AtomicU64::new(1),
            sequence: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
        }
    }

    // -------------------------------------------------------------------------
    // Item callbacks
    // -------------------------------------------------------------------------

    /// Store `callback` and issue the id sent to the cache in its place.
    pub fn register_item_callback(&self, callback: ItemCallback) -> CallbackId {
        let id = CallbackId(self.next_callback.fetch_add(1, Ordering::Relaxed));
        self.item_callbacks.insert(id, callback);
        id
    }

    pub fn unregister_item_callback(&self, id: CallbackId) -> bool {
        self.item_callbacks.remove(&id).is_some()
    }

    pub fn item_callback_count(&self) -> usize {
        self.item_callbacks.len()
    }

    // -------------------------------------------------------------------------
    // Cache-wide subscriptions
    // -------------------------------------------------------------------------

    /// Add a cache-wide subscription. The caller registers the new union
    /// of types with the cache under the returned sequence number.
    pub fn add_general<F>(&self, types: EventTypes, filter: EventDataFilter, handler: F) -> (SubscriptionHandle, u64)
    where
        F: Fn(&CacheEvent) + Send + Sync + 'static,
    {
        let handle = SubscriptionHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.general.insert(
            handle,
            GeneralSubscription {
                types,
                filter,
                handler: Arc::new(handler),
            },
        );
        (handle, self.bump_sequence())
    }

    /// Remove a subscription; returns its event types and the new sequence
    /// number, or `None` for an unknown handle.
    pub fn remove_general(&self, handle: SubscriptionHandle) -> Option<(EventTypes, u64)> {
        let (_, removed) = self.general.remove(&handle)?;
        Some((removed.types, self.bump_sequence()))
    }

    /// Union of subscribed types and the largest filter requested for them.
    pub fn general_registration(&self) -> (EventTypes, EventDataFilter) {
        self.general.iter().fold(
            (EventTypes::empty(), EventDataFilter::None),
            |(types, filter), sub| (types | sub.types, filter.max(sub.filter)),
        )
    }

    fn bump_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    // -------------------------------------------------------------------------
    // Continuous queries
    // -------------------------------------------------------------------------

    pub fn track_query(&self, server_id: impl Into<String>, cq: Arc<ContinuousQuery>) {
        self.queries.insert(server_id.into(), cq);
    }

    pub fn untrack_query(&self, server_id: &str) -> Option<Arc<ContinuousQuery>> {
        self.queries.remove(server_id).map(|(_, cq)| cq)
    }

    pub fn query_count(&self) -> usize {
        self.queries.len()
    }

    // -------------------------------------------------------------------------
    // Topics
    // -------------------------------------------------------------------------

    /// Signal raised when new messages arrive on `topic`.
    pub fn topic_signal(&self, topic: &str) -> Arc<Notify> {
        Arc::clone(
            self.topics
                .entry(topic.to_string())
                .or_insert_with(|| Arc::new(Notify::new()))
                .value(),
        )
    }

    pub fn forget_topic(&self, topic: &str) {
        self.topics.remove(topic);
    }

    /// Notifications handed to at least one handler so far.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    fn run(&self, handler: &EventHandler, event: CacheEvent) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
        deliver(handler, event, self.background);
    }
}

impl NotificationSink for EventManager {
    fn notify(&self, notification: Notification) {
        match notification {
            Notification::Item { callback, event } => {
                let target = self
                    .item_callbacks
                    .get(&callback)
                    .map(|cb| (Arc::clone(&cb.handler), cb.filter));
                match target {
                    Some((handler, filter)) => self.run(&handler, event.filtered(filter)),
                    None => trace!(cache = %self.cache_name, callback = %callback, "No callback for item event"),
                }
            }
            Notification::General { event } => {
                let targets: Vec<(EventHandler, EventDataFilter)> = self
                    .general
                    .iter()
                    .filter(|sub| sub.types.includes(event.event_type))
                    .map(|sub| (Arc::clone(&sub.handler), sub.filter))
                    .collect();
                for (handler, filter) in targets {
                    self.run(&handler, event.filtered(filter));
                }
            }
            Notification::Query { server_query_id, event } => {
                let cq = self.queries.get(&server_query_id).map(|cq| Arc::clone(cq.value()));
                match cq {
                    Some(cq) => {
                        self.delivered.fetch_add(1, Ordering::Relaxed);
                        cq.dispatch(&event, self.background);
                    }
                    None => debug!(cache = %self.cache_name, query = %server_query_id, "Event for unknown continuous query"),
                }
            }
            Notification::QueryCleared { server_query_id } => {
                let cq = self.queries.get(&server_query_id).map(|cq| Arc::clone(cq.value()));
                if let Some(cq) = cq {
                    cq.dispatch_clear();
                }
            }
            Notification::MessagesAvailable { topic } => {
                let signal = self.topics.get(&topic).map(|s| Arc::clone(s.value()));
                if let Some(signal) = signal {
                    signal.notify_one();
                }
            }
        }
    }
}

impl std::fmt::Debug for EventManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventManager")
            .field("cache", &self.cache_name)
            .field("item_callbacks", &self.item_callbacks.len())
            .field("general", &self.general.len())
            .field("queries", &self.queries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::events::EventType;
    use crate::domain::query::QueryParams;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, impl Fn(&CacheEvent) + Send + Sync + 'static) {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        (hits, move |_: &CacheEvent| {
            h.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_item_callback_routing() {
        let events = EventManager::new("orders", false);
        let (hits, handler) = counter();
        let id = events.register_item_callback(ItemCallback::new(EventDataFilter::None, handler));

        let event = CacheEvent::new("orders", Some("k".into()), EventType::ItemUpdated);
        events.notify(Notification::Item { callback: id, event: event.clone() });
        events.notify(Notification::Item {
            callback: CallbackId(999),
            event,
        });

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(events.unregister_item_callback(id));
        assert_eq!(events.item_callback_count(), 0);
    }

    #[test]
    fn test_general_registration_union_and_sequence() {
        let events = EventManager::new("orders", false);
        let (added, on_added) = counter();
        let (_, on_removed) = counter();

        let (h1, s1) = events.add_general(EventTypes::ADDED, EventDataFilter::Metadata, on_added);
        let (_h2, s2) = events.add_general(EventTypes::REMOVED, EventDataFilter::None, on_removed);
        assert!(s2 > s1);
        assert_eq!(
            events.general_registration(),
            (EventTypes::ADDED | EventTypes::REMOVED, EventDataFilter::Metadata)
        );

        events.notify(Notification::General {
            event: CacheEvent::new("orders", Some("k".into()), EventType::ItemAdded),
        });
        events.notify(Notification::General {
            event: CacheEvent::new("orders", None, EventType::CacheCleared),
        });
        assert_eq!(added.load(Ordering::SeqCst), 1);

        let (types, s3) = events.remove_general(h1).unwrap();
        assert_eq!(types, EventTypes::ADDED);
        assert!(s3 > s2);
        assert!(events.remove_general(h1).is_none());
        assert_eq!(events.general_registration().0, EventTypes::REMOVED);
    }

    #[test]
    fn test_query_events_reach_tracked_query() {
        let events = EventManager::new("orders", false);
        let cq = Arc::new(ContinuousQuery::new("SELECT * WHERE region = 'eu'", QueryParams::new()));
        let (hits, handler) = counter();
        cq.register_notification(EventTypes::ADDED, EventDataFilter::None, handler);
        events.track_query("cq-1", Arc::clone(&cq));

        let event = CacheEvent::new("orders", Some("k".into()), EventType::ItemAdded);
        events.notify(Notification::Query {
            server_query_id: "cq-1".into(),
            event: event.clone(),
        });
        events.untrack_query("cq-1");
        events.notify(Notification::Query {
            server_query_id: "cq-1".into(),
            event,
        });

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(events.delivered(), 1);
    }

    #[tokio::test]
    async fn test_topic_signal_wakes_waiter() {
        let events = Arc::new(EventManager::new("orders", false));
        let signal = events.topic_signal("prices");

        events.notify(Notification::MessagesAvailable {
            topic: "prices".into(),
        });
        tokio::time::timeout(std::time::Duration::from_secs(1), signal.notified())
            .await
            .expect("signal should carry a stored permit");
    }
}
