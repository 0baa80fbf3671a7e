//! Cache facade over the in-process strategy.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;

use clustra::domain::events::{EventDataFilter, EventType, EventTypes, ItemCallback};
use clustra::domain::item::{CacheValue, Tag, TagMatch};
use clustra::domain::messaging::{DeliveryOption, SubscriptionPolicy};
use clustra::domain::options::{MapReduceTask, StreamMode, WriteOptions};
use clustra::domain::query::{ContinuousQuery, QueryParams};
use clustra::{Cache, CacheInitParams, CacheRegistry, ClientConfig, Error, InMemoryEngine};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Session {
    user: String,
    hits: u32,
}

fn open(registry: &CacheRegistry, name: &str) -> Arc<Cache> {
    let config = ClientConfig {
        notify_async: false,
        ..ClientConfig::default()
    };
    registry
        .open(
            name,
            CacheInitParams::in_proc(Arc::new(InMemoryEngine::new(name))).with_config(config),
        )
        .unwrap()
}

fn counter() -> (Arc<AtomicUsize>, impl Fn(&clustra::domain::events::CacheEvent) + Send + Sync + 'static) {
    let count = Arc::new(AtomicUsize::new(0));
    let inner = Arc::clone(&count);
    (count, move |_: &clustra::domain::events::CacheEvent| {
        inner.fetch_add(1, Ordering::SeqCst);
    })
}

#[test]
fn test_typed_round_trip_without_async_main() {
    tokio_test::block_on(async {
        let registry = CacheRegistry::new();
        let cache = open(&registry, "sessions");
        let session = Session {
            user: "ada".into(),
            hits: 3,
        };

        cache.add("s:1", &session).await.unwrap();
        assert_eq!(cache.get::<Session>("s:1").await.unwrap(), Some(session.clone()));
        assert_matches!(cache.add("s:1", &session).await, Err(_));
        assert!(cache.contains("s:1").await.unwrap());
        assert_eq!(cache.count().await.unwrap(), 1);

        let removed = cache.remove("s:1").await.unwrap();
        assert_matches!(removed, Some(CacheValue::Json(v)) if v["user"] == "ada");
        assert_eq!(cache.get::<Session>("s:1").await.unwrap(), None);

        registry.close("sessions").await.unwrap();
        assert_matches!(cache.count().await, Err(Error::CacheDisposed(_)));
    });
}

#[tokio::test]
async fn test_item_callbacks_fire_on_update_and_remove() {
    let registry = CacheRegistry::new();
    let cache = open(&registry, "items");
    let events: Arc<Mutex<Vec<EventType>>> = Arc::default();
    let seen = Arc::clone(&events);
    let callback = ItemCallback::new(EventDataFilter::Metadata, move |e| {
        seen.lock().push(e.event_type);
    });

    let watched_update = cache.item(&1).unwrap().on_updated(callback.clone());
    let watched_remove = cache.item(&1).unwrap().on_removed(callback);
    cache.add_item("a", watched_update, WriteOptions::default()).await.unwrap();
    cache.add_item("b", watched_remove, WriteOptions::default()).await.unwrap();

    // a plain overwrite fires the callbacks the old item carried
    cache.insert("a", &2).await.unwrap();
    cache.delete("b").await.unwrap();
    cache.delete("a").await.unwrap();

    assert_eq!(*events.lock(), vec![EventType::ItemUpdated, EventType::ItemRemoved]);
    registry.close("items").await.unwrap();
}

#[tokio::test]
async fn test_key_notifications() {
    let registry = CacheRegistry::new();
    let cache = open(&registry, "keys");
    cache.insert("watched", &"a").await.unwrap();

    let (updates, handler) = counter();
    let ids = cache
        .register_key_notification(
            "watched",
            EventTypes::UPDATED,
            ItemCallback::new(EventDataFilter::None, handler),
            true,
        )
        .await
        .unwrap();
    cache.insert("watched", &"b").await.unwrap();
    cache.insert("watched", &"c").await.unwrap();
    assert_eq!(updates.load(Ordering::SeqCst), 2);

    cache.unregister_key_notification("watched", &ids).await.unwrap();
    cache.insert("watched", &"d").await.unwrap();
    assert_eq!(updates.load(Ordering::SeqCst), 2);

    for types in [EventTypes::ADDED, EventTypes::ADDED | EventTypes::UPDATED, EventTypes::empty()] {
        let (_, handler) = counter();
        assert_matches!(
            cache
                .register_key_notification("watched", types, ItemCallback::new(EventDataFilter::None, handler), true)
                .await,
            Err(Error::InvalidArgument(_))
        );
    }
    assert_eq!(cache.events().item_callback_count(), 0);
    registry.close("keys").await.unwrap();
}

#[tokio::test]
async fn test_expiry_reaches_only_callbacks_that_asked_for_it() {
    let registry = CacheRegistry::new();
    let cache = open(&registry, "expiry");
    cache.insert("quiet", &1).await.unwrap();
    cache.insert("loud", &2).await.unwrap();

    let (quiet, handler) = counter();
    cache
        .register_key_notification("quiet", EventTypes::REMOVED, ItemCallback::new(EventDataFilter::None, handler), false)
        .await
        .unwrap();
    let (loud, handler) = counter();
    cache
        .register_key_notification("loud", EventTypes::REMOVED, ItemCallback::new(EventDataFilter::None, handler), true)
        .await
        .unwrap();

    let past = chrono::Utc::now() - chrono::Duration::seconds(1);
    assert!(cache.set_expiration("quiet", past).await.unwrap());
    assert!(cache.set_expiration("loud", past).await.unwrap());
    assert!(!cache.contains("quiet").await.unwrap());
    assert!(!cache.contains("loud").await.unwrap());

    assert_eq!(quiet.load(Ordering::SeqCst), 0);
    assert_eq!(loud.load(Ordering::SeqCst), 1);
    registry.close("expiry").await.unwrap();
}

#[tokio::test]
async fn test_custom_and_clear_events() {
    let registry = CacheRegistry::new();
    let cache = open(&registry, "events");
    let bodies: Arc<Mutex<Vec<bytes::Bytes>>> = Arc::default();
    let sink = Arc::clone(&bodies);
    cache
        .register_custom_event(move |e| {
            if let Some(data) = &e.data {
                sink.lock().push(data.clone());
            }
        })
        .await
        .unwrap();
    let (clears, handler) = counter();
    let clear_handle = cache.register_clear_event(handler).await.unwrap();

    cache.raise_custom_event("deploy", "v2").await.unwrap();
    cache.insert("k", &1).await.unwrap();
    cache.clear().await.unwrap();
    assert_eq!(bodies.lock().as_slice(), &[bytes::Bytes::from("v2")]);
    assert_eq!(clears.load(Ordering::SeqCst), 1);

    assert!(cache.unregister_cache_notification(clear_handle).await.unwrap());
    assert!(!cache.unregister_cache_notification(clear_handle).await.unwrap());
    cache.clear().await.unwrap();
    assert_eq!(clears.load(Ordering::SeqCst), 1);
    registry.close("events").await.unwrap();
}

#[tokio::test]
async fn test_continuous_query_tracks_membership() {
    let registry = CacheRegistry::new();
    let cache = open(&registry, "cq");
    let cq = Arc::new(ContinuousQuery::new(
        "SELECT * WHERE region = ?region",
        QueryParams::from([("region".to_string(), json!("eu"))]),
    ));
    let changes: Arc<Mutex<Vec<(String, EventType)>>> = Arc::default();
    let seen = Arc::clone(&changes);
    cq.register_notification(
        EventTypes::ADDED | EventTypes::REMOVED,
        EventDataFilter::None,
        move |e| seen.lock().push((e.key.clone().unwrap_or_default(), e.event_type)),
    );

    let id = cache.register_cq(&cq).await.unwrap();
    assert_eq!(cq.server_id().as_deref(), Some(id.as_str()));

    let eu = |n: i32| cache.item(&n).unwrap().with_named_tag("region", json!("eu"));
    cache.insert_item("a", eu(1), WriteOptions::default()).await.unwrap();
    let us = cache.item(&2).unwrap().with_named_tag("region", json!("us"));
    cache.insert_item("b", us, WriteOptions::default()).await.unwrap();
    cache.delete("a").await.unwrap();

    assert_eq!(
        *changes.lock(),
        vec![
            ("a".to_string(), EventType::ItemAdded),
            ("a".to_string(), EventType::ItemRemoved)
        ]
    );

    cache.unregister_cq(&cq).await.unwrap();
    assert!(cq.server_id().is_none());
    cache.insert_item("c", eu(3), WriteOptions::default()).await.unwrap();
    assert_eq!(changes.lock().len(), 2);
    registry.close("cq").await.unwrap();
}

#[tokio::test]
async fn test_tags_groups_and_queries() {
    let registry = CacheRegistry::new();
    let cache = open(&registry, "catalog");
    let entries = (0..6)
        .map(|i| {
            let item = cache
                .item(&i)
                .unwrap()
                .with_tags([if i % 2 == 0 { "even" } else { "odd" }])
                .with_group("numbers", Some(if i < 3 { "low" } else { "high" }))
                .with_named_tag("n", json!(i));
            (format!("n{}", i), item)
        })
        .collect();
    cache.insert_bulk(entries, WriteOptions::default()).await.unwrap();

    let mut even = cache.get_keys_by_tags(&[Tag::new("even")], TagMatch::Any).await.unwrap();
    even.sort();
    assert_eq!(even, vec!["n0", "n2", "n4"]);

    let high: HashMap<String, CacheValue> = cache.get_group_data("numbers", Some("high")).await.unwrap();
    assert_eq!(high.len(), 3);

    let found = cache
        .search("SELECT * WHERE n > ?n", &QueryParams::from([("n".to_string(), json!(3))]))
        .await
        .unwrap();
    assert_eq!(found.len(), 2);

    let removed = cache
        .remove_by_query("DELETE WHERE n < 2", &QueryParams::new())
        .await
        .unwrap();
    assert_eq!(removed, 2);

    cache.remove_group("numbers", Some("high")).await.unwrap();
    assert_eq!(cache.count().await.unwrap(), 1);
    registry.close("catalog").await.unwrap();
}

#[tokio::test]
async fn test_stream_write_then_read() {
    let registry = CacheRegistry::new();
    let cache = open(&registry, "blobs");

    let mut writer = cache.open_stream("blob", StreamMode::Write).await.unwrap();
    writer.write(b"hello ").await.unwrap();
    writer.write(b"world").await.unwrap();
    assert_eq!(writer.length().await.unwrap(), 11);
    assert_matches!(cache.open_stream("blob", StreamMode::Read).await, Err(_));
    writer.close().await.unwrap();

    let mut reader = cache.open_stream("blob", StreamMode::Read).await.unwrap();
    assert!(!reader.can_write());
    assert_matches!(reader.write(b"x").await, Err(Error::InvalidArgument(_)));
    assert_eq!(reader.read(5).await.unwrap().as_ref(), b"hello");
    reader.seek(6);
    assert_eq!(reader.read_to_end().await.unwrap().as_ref(), b"world");
    reader.close().await.unwrap();
    reader.close().await.unwrap();
    registry.close("blobs").await.unwrap();
}

#[tokio::test]
async fn test_topic_publish_receive_acknowledge() {
    let registry = CacheRegistry::new();
    let cache = open(&registry, "bus");
    assert!(cache.topic("orders").await.unwrap().is_none());

    let topic = cache.create_topic("orders").await.unwrap();
    let subscription = topic.subscribe("billing", SubscriptionPolicy::Shared).await.unwrap();
    topic.publish(&json!({"order": 7}), DeliveryOption::All).await.unwrap();

    assert!(subscription.wait(Duration::from_secs(1)).await);
    let messages = subscription.receive().await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_matches!(subscription.decode(&messages[0]).unwrap(), CacheValue::Json(v) if v["order"] == 7);

    subscription.acknowledge(&messages).await.unwrap();
    assert_eq!(topic.message_count().await.unwrap(), 0);

    subscription.unsubscribe().await.unwrap();
    topic.delete(true).await.unwrap();
    assert!(cache.topic("orders").await.unwrap().is_none());
    registry.close("bus").await.unwrap();
}

#[tokio::test]
async fn test_cluster_only_operations_are_unsupported() {
    let registry = CacheRegistry::new();
    let cache = open(&registry, "local");
    let task = MapReduceTask {
        name: "word-count".into(),
        params: json!({}),
    };
    assert_matches!(
        cache.execute_map_reduce(&task).await,
        Err(Error::Unsupported { operation: "execute_map_reduce", .. })
    );
    assert_eq!(cache.connected_clients().await.unwrap().len(), 1);
    assert_eq!(cache.strategy_name(), "inproc");
    registry.close("local").await.unwrap();
}
