//! Distributed readers opened through the remote strategy, merged across
//! the partitions of a three-server mock cluster.

use std::collections::BTreeSet;
use std::sync::Arc;

use assert_matches::assert_matches;
use bytes::Bytes;
use futures::StreamExt;
use serde_json::json;

use clustra::domain::item::{CacheItem, Payload};
use clustra::domain::options::WriteOptions;
use clustra::domain::ports::{NotificationSink, SystemClock};
use clustra::domain::query::{MergeMode, QueryParams};
use clustra::facade::EventManager;
use clustra::{CacheEngine, CacheStrategy, ClientConfig, Error, MockCluster, RemoteCache};

const ROWS: i64 = 30;

async fn seeded() -> (Arc<MockCluster>, Arc<RemoteCache>) {
    let cluster = MockCluster::new(3);
    let sink: Arc<dyn NotificationSink> = Arc::new(EventManager::new("rows", false));
    let cache = RemoteCache::new(
        "rows",
        cluster.clone(),
        ClientConfig::default(),
        Arc::new(SystemClock),
        sink,
    );
    for n in 0..ROWS {
        let item = CacheItem::new(Payload::Bytes(Bytes::from(n.to_string())))
            .with_named_tag("n", json!(n))
            .with_named_tag("region", json!(["eu", "us", "apac"][(n % 3) as usize]));
        cache
            .insert(&format!("row-{}", n), &item, &WriteOptions::default())
            .await
            .unwrap();
    }
    (cluster, cache)
}

fn open_on_servers(cluster: &MockCluster) -> usize {
    cluster
        .servers()
        .iter()
        .filter_map(|s| cluster.engine(s))
        .map(|e| e.open_reader_count())
        .sum()
}

#[tokio::test]
async fn test_ordered_reader_is_globally_sorted() {
    let (cluster, cache) = seeded().await;
    let mut reader = cache
        .execute_reader("SELECT n ORDER BY n DESC", &QueryParams::new(), false, 4)
        .await
        .unwrap();
    assert_eq!(reader.merge_mode(), MergeMode::Ordered);
    assert_eq!(reader.partition_count(), 3);
    assert_eq!(cache.partitions().open_total(), 3);

    let mut seen = Vec::new();
    while reader.read().await.unwrap() {
        seen.push(reader.get("n").and_then(|v| v.as_i64()).unwrap());
    }
    let expected: Vec<i64> = (0..ROWS).rev().collect();
    assert_eq!(seen, expected);

    assert_eq!(cache.partitions().open_total(), 0);
    assert_eq!(open_on_servers(&cluster), 0);
    assert!(!reader.read().await.unwrap());
}

#[tokio::test]
async fn test_plain_reader_yields_every_row_once() {
    let (_, cache) = seeded().await;
    let reader = cache
        .execute_reader("SELECT * WHERE n >= ?min", &QueryParams::from([("min".to_string(), json!(10))]), true, 3)
        .await
        .unwrap();
    assert_eq!(reader.merge_mode(), MergeMode::Plain);

    let rows: Vec<_> = reader.into_stream().collect().await;
    let keys: BTreeSet<String> = rows
        .into_iter()
        .map(|row| {
            let row = row.unwrap();
            assert!(row.entry.is_some(), "rows carry values when requested");
            row.key.unwrap()
        })
        .collect();
    let expected: BTreeSet<String> = (10..ROWS).map(|n| format!("row-{}", n)).collect();
    assert_eq!(keys, expected);
}

#[tokio::test]
async fn test_grouped_reader_keeps_groups_together() {
    let (_, cache) = seeded().await;
    let mut reader = cache
        .execute_reader("SELECT region GROUP BY region", &QueryParams::new(), false, 2)
        .await
        .unwrap();
    assert_eq!(reader.merge_mode(), MergeMode::Grouped);

    let mut regions = Vec::new();
    while let Some(row) = reader.next_row().await.unwrap() {
        regions.push(row.values[0].as_str().unwrap().to_string());
    }
    assert_eq!(regions.len() as i64, ROWS);

    let mut finished: Vec<String> = Vec::new();
    for region in regions {
        if finished.last() != Some(&region) {
            assert!(!finished.contains(&region), "group {} split", region);
            finished.push(region);
        }
    }
    assert_eq!(finished.len(), 3);
}

#[tokio::test]
async fn test_close_releases_server_readers() {
    let (cluster, cache) = seeded().await;
    let mut reader = cache
        .execute_reader("SELECT n", &QueryParams::new(), false, 2)
        .await
        .unwrap();
    assert!(reader.read().await.unwrap());
    assert!(reader.read().await.unwrap());
    assert_eq!(open_on_servers(&cluster), 3);

    reader.close().await;
    assert_eq!(open_on_servers(&cluster), 0);
    assert_eq!(cache.partitions().open_total(), 0);
    assert_matches!(reader.read().await, Err(Error::ReaderClosed(_)));
}

#[tokio::test]
async fn test_connection_loss_drops_that_servers_partition() {
    let (cluster, cache) = seeded().await;
    let lost = cluster.servers()[0].clone();
    let on_lost = cluster.engine(&lost).unwrap().count() as i64;
    assert!(on_lost >= 2);

    let mut reader = cache
        .execute_reader("SELECT n", &QueryParams::new(), false, 1)
        .await
        .unwrap();
    assert_eq!(cache.partitions().open_on(&lost), 1);

    cluster.drop_server(&lost);
    assert_eq!(cache.partitions().open_on(&lost), 0);

    let mut delivered = 0;
    while reader.read().await.unwrap() {
        delivered += 1;
    }
    // the row already buffered from the lost server is still delivered
    assert_eq!(delivered, ROWS - on_lost + 1);
    assert_eq!(cache.partitions().open_total(), 0);
}

#[tokio::test]
async fn test_reader_rejects_non_select_queries() {
    let (_, cache) = seeded().await;
    assert_matches!(
        cache
            .execute_reader("DELETE WHERE n < 5", &QueryParams::new(), false, 10)
            .await,
        Err(_)
    );
    assert_eq!(cache.count().await.unwrap() as i64, ROWS);
}
