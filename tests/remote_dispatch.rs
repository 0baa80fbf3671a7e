//! Remote strategy against the in-memory mock cluster: key sharding, the
//! dedicated-call fault policy, lock and version checks.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use chrono::Utc;

use clustra::domain::events::{EventDataFilter, EventTypes, ItemCallback};
use clustra::domain::options::{GetOptions, WriteOptions};
use clustra::domain::ports::{Clock, ManualClock, ServerAddress};
use clustra::domain::query::QueryParams;
use clustra::domain::{LockAccessType, LockHandle};
use clustra::error::ServerFault;
use clustra::remote::{Routing, Target, ViewIdTag};
use clustra::{Cache, CacheInitParams, CacheRegistry, CacheStrategy, ClientConfig, Error, MockCluster};

struct Harness {
    cluster: Arc<MockCluster>,
    clock: Arc<ManualClock>,
    registry: CacheRegistry,
    cache: Arc<Cache>,
}

impl Harness {
    fn with_config(servers: usize, config: ClientConfig) -> Self {
        let cluster = MockCluster::new(servers);
        let clock = Arc::new(ManualClock::new());
        let shared_clock: Arc<dyn Clock> = clock.clone();
        let registry = CacheRegistry::new();
        let cache = registry
            .open(
                "orders",
                CacheInitParams::out_proc(cluster.clone())
                    .with_config(config)
                    .with_clock(shared_clock),
            )
            .unwrap();
        Self {
            cluster,
            clock,
            registry,
            cache,
        }
    }

    fn new(servers: usize) -> Self {
        Self::with_config(
            servers,
            ClientConfig {
                notify_async: false,
                ..ClientConfig::default()
            },
        )
    }

    fn routings(&self) -> Vec<Routing> {
        self.cluster.journal().iter().map(|e| e.routing).collect()
    }

    async fn close(self) {
        self.registry.close("orders").await.unwrap();
    }
}

fn keys(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("key-{}", i)).collect()
}

#[tokio::test]
async fn test_bulk_add_is_sharded_by_owner() {
    let h = Harness::new(3);
    let keys = keys(10);
    let entries = keys
        .iter()
        .enumerate()
        .map(|(i, k)| (k.clone(), h.cache.item(&i).unwrap()))
        .collect();
    h.cluster.clear_journal();

    let result = h.cache.add_bulk(entries, WriteOptions::default()).await.unwrap();
    assert!(result.is_success());
    assert_eq!(result.versions.len(), 10);

    let journal = h.cluster.journal();
    assert_eq!(journal.len(), 1, "one request for the whole bulk call");
    let entry = &journal[0];
    assert_eq!(entry.routing, Routing::Pooled);
    assert_eq!(entry.commands.len(), 3);

    let mut seen = BTreeSet::new();
    for command in &entry.commands {
        let Target::Server(server) = &command.target else {
            panic!("sharded command without a server target: {:?}", command.target);
        };
        assert_eq!(command.view, ViewIdTag::Client(1));
        for key in command.keys.as_ref().unwrap() {
            assert_eq!(&h.cluster.owner_of(key), server);
            assert!(seen.insert(key.clone()), "{} sent twice", key);
        }
    }
    assert_eq!(seen, keys.iter().cloned().collect::<BTreeSet<_>>());
    assert_eq!(h.cache.count().await.unwrap(), 10);
    h.close().await;
}

#[tokio::test]
async fn test_bulk_without_map_goes_to_any_server() {
    let h = Harness::new(3);
    h.cluster.set_distribution_map(false);
    let entries = keys(6)
        .into_iter()
        .map(|k| (k, h.cache.item(&"v").unwrap()))
        .collect();
    h.cluster.clear_journal();

    h.cache.insert_bulk(entries, WriteOptions::default()).await.unwrap();

    let journal = h.cluster.journal();
    assert_eq!(journal.len(), 1);
    assert_eq!(journal[0].commands.len(), 1);
    assert_eq!(journal[0].commands[0].target, Target::Any);
    assert_eq!(h.cache.get_bulk::<String>(&keys(6)).await.unwrap().len(), 6);
    h.close().await;
}

#[tokio::test]
async fn test_activity_blocked_retries_once_on_dedicated_connection() {
    let h = Harness::new(3);
    h.cache.insert("key-1", &"blue").await.unwrap();
    h.cluster.clear_journal();
    h.cluster.fail_next(ServerFault::ActivityBlocked, 1);

    let value: Option<String> = h.cache.get("key-1").await.unwrap();
    assert_eq!(value.as_deref(), Some("blue"));
    assert_eq!(h.routings(), vec![Routing::Pooled, Routing::Dedicated]);

    let retry = &h.cluster.journal()[1];
    assert_eq!(retry.commands[0].view, ViewIdTag::Forced);
    assert_eq!(retry.commands[0].name, "get");

    // the latch stays disengaged
    h.cluster.clear_journal();
    h.cache.contains("key-1").await.unwrap();
    assert_eq!(h.routings(), vec![Routing::Pooled]);
    h.close().await;
}

#[tokio::test]
async fn test_activity_blocked_twice_propagates() {
    let h = Harness::new(2);
    h.cluster.fail_next(ServerFault::ActivityBlocked, 2);

    assert_matches!(
        h.cache.get::<String>("key-1").await,
        Err(Error::ActivityBlocked { .. })
    );
    assert_eq!(h.routings(), vec![Routing::Pooled, Routing::Dedicated]);
    h.close().await;
}

#[tokio::test]
async fn test_state_transfer_engages_dedicated_window() {
    let h = Harness::new(3);
    for (i, key) in keys(6).iter().enumerate() {
        let item = h
            .cache
            .item(&i)
            .unwrap()
            .with_named_tag("n", serde_json::json!(i));
        h.cache.insert_item(key, item, WriteOptions::default()).await.unwrap();
    }
    h.cluster.clear_journal();
    h.cluster.fail_next(ServerFault::StateTransferInProgress, 1);

    let found = h
        .cache
        .search("SELECT * WHERE n >= ?min", &QueryParams::from([("min".to_string(), serde_json::json!(3))]))
        .await
        .unwrap();
    assert_eq!(found.len(), 3);
    assert_eq!(h.routings(), vec![Routing::Pooled, Routing::Dedicated]);

    // every call inside the window is dedicated with the forced view id
    h.cluster.clear_journal();
    assert!(h.cache.contains("key-2").await.unwrap());
    let journal = h.cluster.journal();
    assert_eq!(journal.len(), 1);
    assert_eq!(journal[0].routing, Routing::Dedicated);
    assert_eq!(journal[0].commands[0].view, ViewIdTag::Forced);

    h.clock.advance(Duration::from_secs(60));
    h.cluster.clear_journal();
    h.cache.contains("key-2").await.unwrap();
    assert_eq!(h.routings(), vec![Routing::Dedicated]);

    h.clock.advance(Duration::from_millis(1));
    h.cluster.clear_journal();
    h.cache.contains("key-2").await.unwrap();
    assert_eq!(h.routings(), vec![Routing::Pooled]);
    h.close().await;
}

#[tokio::test]
async fn test_state_transfer_on_dedicated_retry_propagates() {
    let h = Harness::new(3);
    h.cluster.fail_next(ServerFault::StateTransferInProgress, 2);

    assert_matches!(
        h.cache.insert("key-1", &1).await,
        Err(Error::StateTransferInProgress { .. })
    );
    assert_eq!(h.routings(), vec![Routing::Pooled, Routing::Dedicated]);

    h.cluster.clear_journal();
    h.cache.insert("key-1", &1).await.unwrap();
    assert_eq!(h.routings(), vec![Routing::Dedicated]);
    h.close().await;
}

#[tokio::test]
async fn test_other_faults_are_not_retried() {
    let h = Harness::new(3);
    h.cluster
        .fail_next(ServerFault::OperationNotSupported("client too old".into()), 1);

    assert_matches!(h.cache.count().await, Err(Error::OperationNotSupported(_)));
    assert_eq!(h.routings(), vec![Routing::Pooled]);
    h.close().await;
}

#[tokio::test]
async fn test_lock_ids_are_checked_by_the_owner() {
    let h = Harness::new(3);
    h.cache.insert("key-4", &"v1").await.unwrap();

    let (acquired, lock) = h.cache.lock("key-4", Duration::from_secs(30)).await.unwrap();
    assert!(acquired && lock.is_held());
    let (again, holder) = h.cache.lock("key-4", Duration::from_secs(30)).await.unwrap();
    assert!(!again);
    assert_eq!(holder, lock);

    // a plain write respects the lock
    assert_matches!(
        h.cache.insert("key-4", &"v2").await,
        Err(Error::ItemLocked { .. })
    );

    let bogus = LockHandle::new("not-the-lock", Utc::now());
    let item = h.cache.item(&"v2").unwrap();
    assert_matches!(
        h.cache
            .insert_item("key-4", item.clone(), WriteOptions::default().with_lock(&bogus, LockAccessType::UseLock))
            .await,
        Err(Error::ItemLocked { key, .. }) if key == "key-4"
    );

    // reading under someone else's lock fails and names the holder
    assert_matches!(
        h.cache
            .get_with("key-4", &GetOptions::with_lock(bogus.clone(), LockAccessType::UseLock))
            .await,
        Err(Error::ItemLocked { key, lock: holder }) if key == "key-4" && holder == lock
    );
    assert_matches!(
        h.cache
            .strategy()
            .get_cache_item("key-4", &GetOptions::with_lock(bogus, LockAccessType::UseLock))
            .await,
        Err(Error::ItemLocked { .. })
    );
    let read = h
        .cache
        .get_with("key-4", &GetOptions::with_lock(lock.clone(), LockAccessType::UseLock))
        .await
        .unwrap();
    assert!(read.value.is_some());

    h.cache
        .insert_item("key-4", item, WriteOptions::default().with_lock(&lock, LockAccessType::Release))
        .await
        .unwrap();
    let (locked, _) = h.cache.is_locked("key-4").await.unwrap();
    assert!(!locked);
    assert_eq!(h.cache.get::<String>("key-4").await.unwrap().as_deref(), Some("v2"));
    h.close().await;
}

#[tokio::test]
async fn test_lock_access_without_id_is_rejected_before_sending() {
    let h = Harness::new(2);
    h.cluster.clear_journal();
    assert_matches!(
        h.cache
            .get_with("key-1", &GetOptions::with_lock(LockHandle::none(), LockAccessType::UseLock))
            .await,
        Err(Error::InvalidArgument(_))
    );
    assert!(h.cluster.journal().is_empty());
    h.close().await;
}

#[tokio::test]
async fn test_versions_are_fresh_and_checked() {
    let h = Harness::new(3);
    let first = h.cache.insert("key-7", &1).await.unwrap();
    let second = h.cache.insert("key-7", &2).await.unwrap();
    assert_ne!(first, second);

    let stale = h.cache.item(&3).unwrap();
    assert_matches!(
        h.cache
            .insert_item("key-7", stale, WriteOptions::default().with_version(first))
            .await,
        Err(Error::VersionMismatch { expected, actual, .. }) if expected == first && actual == second
    );

    let current = h.cache.item(&3).unwrap();
    let third = h
        .cache
        .insert_item("key-7", current, WriteOptions::default().with_version(second))
        .await
        .unwrap();
    assert_ne!(third, second);
    assert_eq!(h.cache.get::<i32>("key-7").await.unwrap(), Some(3));
    h.close().await;
}

#[tokio::test]
async fn test_conflicting_expiration_never_reaches_the_cluster() {
    let h = Harness::new(3);
    h.cluster.clear_journal();
    let item = h
        .cache
        .item(&"v")
        .unwrap()
        .with_absolute_expiration(Utc::now() + chrono::Duration::minutes(5))
        .with_sliding_expiration(Duration::from_secs(30));

    assert_matches!(
        h.cache.add_item("key-1", item.clone(), WriteOptions::default()).await,
        Err(Error::ConflictingExpiration { .. })
    );
    assert_matches!(
        h.cache
            .insert_bulk(vec![("key-2".into(), item)], WriteOptions::default())
            .await,
        Err(Error::ConflictingExpiration { .. })
    );
    assert_matches!(h.cache.get::<String>("").await, Err(Error::InvalidArgument(_)));
    assert!(h.cluster.journal().is_empty());
    h.close().await;
}

#[tokio::test]
async fn test_request_timeout() {
    let h = Harness::with_config(
        2,
        ClientConfig {
            operation_timeout_ms: 20,
            ..ClientConfig::default()
        },
    );
    h.cluster.set_latency(Some(Duration::from_millis(200)));

    assert_matches!(h.cache.count().await, Err(Error::Timeout { .. }));
    h.cluster.set_latency(None);
    assert_eq!(h.cache.count().await.unwrap(), 0);
    h.close().await;
}

#[tokio::test]
async fn test_general_notifications_arrive_from_every_server() {
    let h = Harness::new(3);
    let added = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&added);
    h.cache
        .register_cache_notification(EventTypes::ADDED, EventDataFilter::None, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();

    for key in keys(9) {
        h.cache.add(&key, &"v").await.unwrap();
    }
    assert_eq!(added.load(Ordering::SeqCst), 9);
    h.close().await;
}

#[tokio::test]
async fn test_registrations_are_replayed_after_reconnect() {
    let h = Harness::new(2);
    let cleared = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&cleared);
    h.cache
        .register_clear_event(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();

    let server = h.cluster.servers()[1].clone();
    h.cluster.drop_server(&server);
    h.cluster.clear_journal();
    h.cluster.restore_server(&server);

    // replay runs on a spawned task
    for _ in 0..50 {
        if !h.cluster.journal().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let journal = h.cluster.journal();
    assert!(journal
        .iter()
        .flat_map(|e| &e.commands)
        .any(|c| c.name == "register-general-notification"));
    h.close().await;
}

/// Reconnects `server` and collects the key registrations replayed to it.
async fn replayed_key_registrations(h: &Harness, server: &ServerAddress, expected: usize) -> Vec<Vec<String>> {
    let key_registrations = || -> Vec<Vec<String>> {
        h.cluster
            .journal()
            .iter()
            .flat_map(|e| e.commands.clone())
            .filter(|c| c.name == "register-key-notification")
            .map(|c| c.keys.unwrap_or_default())
            .collect()
    };
    h.cluster.drop_server(server);
    h.cluster.clear_journal();
    h.cluster.restore_server(server);
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        let general_sent = h
            .cluster
            .journal()
            .iter()
            .flat_map(|e| &e.commands)
            .any(|c| c.name == "register-general-notification");
        if general_sent && key_registrations().len() >= expected {
            break;
        }
    }
    // let any extra replays land before counting
    tokio::time::sleep(Duration::from_millis(20)).await;
    key_registrations()
}

#[tokio::test]
async fn test_every_key_registration_is_replayed() {
    let h = Harness::new(2);
    // replayed ahead of key registrations
    h.cache.register_clear_event(|_| {}).await.unwrap();

    let watch = |types| {
        let cache = Arc::clone(&h.cache);
        async move {
            cache
                .register_key_notification("key-1", types, ItemCallback::new(EventDataFilter::None, |_| {}), true)
                .await
                .unwrap()
        }
    };
    let on_update = watch(EventTypes::UPDATED).await;
    let on_remove = watch(EventTypes::REMOVED).await;
    let gone = h
        .cache
        .register_key_notification("key-2", EventTypes::UPDATED, ItemCallback::new(EventDataFilter::None, |_| {}), true)
        .await
        .unwrap();
    h.cache.unregister_key_notification("key-2", &gone).await.unwrap();

    let server = h.cluster.servers()[0].clone();
    let replayed = replayed_key_registrations(&h, &server, 2).await;
    assert_eq!(replayed, vec![vec!["key-1".to_string()], vec!["key-1".to_string()]]);

    // dropping one registration keeps the other on the same key
    h.cache.unregister_key_notification("key-1", &on_update).await.unwrap();
    let replayed = replayed_key_registrations(&h, &server, 1).await;
    assert_eq!(replayed, vec![vec!["key-1".to_string()]]);

    h.cache.unregister_key_notification("key-1", &on_remove).await.unwrap();
    assert!(replayed_key_registrations(&h, &server, 0).await.is_empty());
    h.close().await;
}
