//! In-process cache strategy.
//!
//! Forwards the operation contract to a [`CacheEngine`] living in the same
//! process. Values are stored natively (no serialization, no compression);
//! lock access types and item options are translated into the engine's
//! terms. MapReduce has no in-process executor and reports a capability
//! error.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info};

use crate::config::ClientConfig;
use crate::domain::events::{EventDataFilter, EventTypes, ItemCallbackIds};
use crate::domain::flags::OperationFlags;
use crate::domain::item::{
    validate_key, validate_keys, CacheItem, CacheValue, ExpirationHint, ItemAttributes, Payload,
    Tag, TagMatch, ValueEntry,
};
use crate::domain::lock::{ItemVersion, LockAccessType, LockHandle};
use crate::domain::messaging::{
    MessageAcks, OutgoingMessage, ReceivedMessages, SubscriptionInfo, TopicOperation,
};
use crate::domain::options::{
    BulkGetResult, BulkWriteResult, ClientInfo, GetOptions, GetResult, ProcessorOutcome,
    RemoveOptions, StreamMode, StreamOptions, WriteOptions,
};
use crate::domain::ports::{
    CacheStrategy, EngineEntry, EngineRead, EngineRecord, EngineWrite, LockExpectation,
    NotificationSink, ServerAddress, SharedEngine,
};
use crate::domain::query::{CqRegistration, QueryParams, QueryResultSet, ReaderChunk};
use crate::error::{Error, Result, ServerFault};
use crate::reader::{ChunkSource, DistributedReader, PartitionRegistry};

/// Lock expectation of a write or remove.
fn write_lock(lock_id: Option<&str>, access: LockAccessType) -> Result<LockExpectation> {
    if access.requires_lock_id() && lock_id.is_none() {
        return Err(Error::InvalidArgument(format!(
            "lock access '{}' requires a lock id",
            access
        )));
    }
    Ok(match (access, lock_id) {
        (LockAccessType::IgnoreLock, _) => LockExpectation::Ignore,
        (LockAccessType::DontRelease, Some(id)) => LockExpectation::Match {
            lock_id: id.to_string(),
            release: false,
        },
        (_, Some(id)) => LockExpectation::Match {
            lock_id: id.to_string(),
            release: true,
        },
        (_, None) => LockExpectation::Respect,
    })
}

fn engine_read(opts: &GetOptions) -> Result<EngineRead> {
    let lock = match opts.access {
        LockAccessType::UseLock | LockAccessType::Release | LockAccessType::DontRelease => {
            let lock_id = opts.lock.lock_id().ok_or_else(|| {
                Error::InvalidArgument(format!("lock access '{}' requires a lock id", opts.access))
            })?;
            LockExpectation::Match {
                lock_id: lock_id.to_string(),
                release: opts.access == LockAccessType::Release,
            }
        }
        LockAccessType::IgnoreLock => LockExpectation::Ignore,
        _ => LockExpectation::Respect,
    };
    let acquire = (opts.access == LockAccessType::Acquire)
        .then(|| opts.lock_timeout.unwrap_or(Duration::ZERO));
    Ok(EngineRead {
        lock,
        acquire,
        group: opts.group.clone(),
        newer_than: opts.version,
    })
}

fn plain_read() -> EngineRead {
    EngineRead {
        lock: LockExpectation::Ignore,
        acquire: None,
        group: None,
        newer_than: None,
    }
}

fn forced_write() -> EngineWrite {
    EngineWrite {
        lock: LockExpectation::Ignore,
        version: None,
        flags: OperationFlags::empty(),
    }
}

/// Item in the engine's terms.
pub(crate) fn engine_entry(key: &str, item: &CacheItem, callbacks: ItemCallbackIds) -> Result<EngineEntry> {
    Ok(EngineEntry {
        value: ValueEntry::new(item.value.clone(), item.payload_flags),
        expiration: item.expiration(key)?,
        priority: item.priority,
        group: item.group.clone(),
        tags: item.tags.clone(),
        named_tags: item.named_tags.clone(),
        dependency: item.dependency.clone(),
        callbacks,
        resync_provider: item.resync_provider.clone(),
    })
}

/// Stored record as a cache item with metadata.
pub(crate) fn record_item(record: EngineRecord) -> CacheItem {
    let entry = record.entry;
    let mut item = CacheItem::new(entry.value.payload);
    item.payload_flags = entry.value.flags;
    match entry.expiration {
        ExpirationHint::Absolute(at) => item.absolute_expiration = Some(at),
        ExpirationHint::Sliding(idle) => item.sliding_expiration = Some(idle),
        ExpirationHint::None => {}
    }
    item.priority = entry.priority;
    item.group = entry.group;
    item.tags = entry.tags;
    item.named_tags = entry.named_tags;
    item.dependency = entry.dependency;
    item.resync_provider = entry.resync_provider;
    item.version = Some(record.version);
    item
}

/// Reader partitions served by an in-process engine.
struct EngineChunks {
    engine: SharedEngine,
}

#[async_trait]
impl ChunkSource for EngineChunks {
    async fn next_chunk(
        &self,
        _server: &ServerAddress,
        reader_id: &str,
        next_index: u64,
        chunk_size: usize,
    ) -> Result<ReaderChunk> {
        self.engine.reader_chunk(reader_id, next_index, chunk_size)
    }

    async fn dispose_reader(&self, _server: &ServerAddress, reader_id: &str) -> Result<()> {
        self.engine.dispose_reader(reader_id);
        Ok(())
    }
}

/// Cache strategy over an in-process engine.
pub struct InprocCache {
    name: String,
    engine: SharedEngine,
    partitions: Arc<PartitionRegistry>,
    /// Kept alive here; the engine only holds a weak reference
    _sink: Arc<dyn NotificationSink>,
    client: ClientInfo,
    config: ClientConfig,
}

impl InprocCache {
    pub fn new(
        name: impl Into<String>,
        engine: SharedEngine,
        config: ClientConfig,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        let name = name.into();
        let listener: Weak<dyn NotificationSink> = Arc::downgrade(&sink);
        engine.set_listener(listener);
        info!(cache = %name, engine = %engine.name(), "In-process cache initialized");
        Self {
            name,
            engine,
            partitions: Arc::new(PartitionRegistry::new()),
            _sink: sink,
            client: ClientInfo::current(config.app_name.as_deref()),
            config,
        }
    }

    pub fn engine(&self) -> &SharedEngine {
        &self.engine
    }

    fn write(&self, lock_id: Option<&str>, access: LockAccessType, version: Option<ItemVersion>, flags: OperationFlags) -> Result<EngineWrite> {
        Ok(EngineWrite {
            lock: write_lock(lock_id, access)?,
            version,
            flags,
        })
    }

    fn remove_write(&self, opts: &RemoveOptions) -> Result<EngineWrite> {
        self.write(opts.lock_id.as_deref(), opts.access, opts.version, opts.flags)
    }

    fn bulk_write<F>(&self, keys: &[String], items: &[CacheItem], opts: &WriteOptions, op: F) -> Result<BulkWriteResult>
    where
        F: Fn(&str, EngineEntry, &EngineWrite) -> Result<ItemVersion>,
    {
        validate_keys(keys)?;
        if keys.len() != items.len() {
            return Err(Error::LengthMismatch {
                keys: keys.len(),
                items: items.len(),
            });
        }
        let entries = keys
            .iter()
            .zip(items)
            .map(|(key, item)| engine_entry(key, item, opts.callbacks))
            .collect::<Result<Vec<_>>>()?;
        let write = self.write(opts.lock_id.as_deref(), opts.access, None, opts.flags)?;

        let mut result = BulkWriteResult::default();
        for (key, entry) in keys.iter().zip(entries) {
            match op(key, entry, &write) {
                Ok(version) => {
                    result.versions.insert(key.clone(), version);
                }
                Err(e) => {
                    debug!(cache = %self.name, key = %key, error = %e, "Bulk write failed for key");
                    result.failures.insert(key.clone(), ServerFault::from(e));
                }
            }
        }
        Ok(result)
    }

    fn entries_of(&self, keys: Vec<String>) -> Result<HashMap<String, ValueEntry>> {
        let mut entries = HashMap::with_capacity(keys.len());
        for key in keys {
            if let (Some(record), _) = self.engine.get(&key, &plain_read())? {
                entries.insert(key, record.entry.value);
            }
        }
        Ok(entries)
    }

    fn remove_all(&self, keys: Vec<String>) -> Result<()> {
        for key in keys {
            self.engine.remove(&key, &forced_write())?;
        }
        Ok(())
    }

    fn reader(&self, chunk: ReaderChunk, chunk_size: usize) -> DistributedReader {
        let source: Arc<dyn ChunkSource> = Arc::new(EngineChunks {
            engine: Arc::clone(&self.engine),
        });
        DistributedReader::new(source, Arc::clone(&self.partitions), vec![chunk], chunk_size)
    }

    fn reader_chunk_size(&self, requested: usize) -> usize {
        if requested == 0 {
            self.config.reader_chunk_size
        } else {
            requested
        }
    }
}

#[async_trait]
impl CacheStrategy for InprocCache {
    fn name(&self) -> &str {
        &self.name
    }

    fn strategy_name(&self) -> &'static str {
        "inproc"
    }

    fn client_info(&self) -> ClientInfo {
        self.client.clone()
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.engine.count())
    }

    async fn dispose(&self) -> Result<()> {
        info!(cache = %self.name, "Disposing in-process cache");
        self.engine.dispose();
        Ok(())
    }

    /// Structured values stay native; bytes pass through marked binary.
    fn safe_serialize(&self, value: CacheValue, flags: &mut OperationFlags) -> Result<Payload> {
        match value {
            CacheValue::Json(json) => Ok(Payload::Native(json)),
            CacheValue::Bytes(bytes) => {
                flags.insert(OperationFlags::BINARY_DATA);
                Ok(Payload::Bytes(bytes))
            }
        }
    }

    // -------------------------------------------------------------------------
    // CRUD
    // -------------------------------------------------------------------------

    async fn add(&self, key: &str, item: &CacheItem, opts: &WriteOptions) -> Result<ItemVersion> {
        validate_key(key)?;
        let entry = engine_entry(key, item, opts.callbacks)?;
        let write = self.write(None, LockAccessType::Default, None, opts.flags)?;
        self.engine.add(key, entry, &write)
    }

    async fn add_bulk(
        &self,
        keys: &[String],
        items: &[CacheItem],
        opts: &WriteOptions,
    ) -> Result<BulkWriteResult> {
        self.bulk_write(keys, items, opts, |key, entry, write| self.engine.add(key, entry, write))
    }

    async fn insert(&self, key: &str, item: &CacheItem, opts: &WriteOptions) -> Result<ItemVersion> {
        validate_key(key)?;
        let entry = engine_entry(key, item, opts.callbacks)?;
        let write = self.write(opts.lock_id.as_deref(), opts.access, opts.version.or(item.version), opts.flags)?;
        self.engine.insert(key, entry, &write)
    }

    async fn insert_bulk(
        &self,
        keys: &[String],
        items: &[CacheItem],
        opts: &WriteOptions,
    ) -> Result<BulkWriteResult> {
        self.bulk_write(keys, items, opts, |key, entry, write| self.engine.insert(key, entry, write))
    }

    async fn get(&self, key: &str, opts: &GetOptions) -> Result<GetResult> {
        validate_key(key)?;
        let (record, lock) = self.engine.get(key, &engine_read(opts)?)?;
        Ok(GetResult {
            version: record.as_ref().map(|r| r.version),
            value: record.map(|r| r.entry.value),
            lock,
        })
    }

    async fn get_bulk(&self, keys: &[String], _flags: OperationFlags) -> Result<BulkGetResult> {
        validate_keys(keys)?;
        let mut result = BulkGetResult::default();
        for key in keys {
            if let (Some(record), _) = self.engine.get(key, &plain_read())? {
                result.versions.insert(key.clone(), record.version);
                result.values.insert(key.clone(), record.entry.value);
            }
        }
        Ok(result)
    }

    async fn get_cache_item(&self, key: &str, opts: &GetOptions) -> Result<Option<CacheItem>> {
        validate_key(key)?;
        let (record, _) = self.engine.get(key, &engine_read(opts)?)?;
        Ok(record.map(record_item))
    }

    async fn get_cache_item_bulk(
        &self,
        keys: &[String],
        _flags: OperationFlags,
    ) -> Result<HashMap<String, CacheItem>> {
        validate_keys(keys)?;
        let mut items = HashMap::new();
        for key in keys {
            if let (Some(record), _) = self.engine.get(key, &plain_read())? {
                items.insert(key.clone(), record_item(record));
            }
        }
        Ok(items)
    }

    async fn remove(&self, key: &str, opts: &RemoveOptions) -> Result<Option<ValueEntry>> {
        validate_key(key)?;
        self.engine.remove(key, &self.remove_write(opts)?)
    }

    async fn delete(&self, key: &str, opts: &RemoveOptions) -> Result<()> {
        self.remove(key, opts).await.map(|_| ())
    }

    async fn remove_bulk(
        &self,
        keys: &[String],
        opts: &RemoveOptions,
    ) -> Result<HashMap<String, ValueEntry>> {
        validate_keys(keys)?;
        let write = self.remove_write(opts)?;
        let mut removed = HashMap::new();
        for key in keys {
            if let Some(value) = self.engine.remove(key, &write)? {
                removed.insert(key.clone(), value);
            }
        }
        Ok(removed)
    }

    async fn delete_bulk(&self, keys: &[String], opts: &RemoveOptions) -> Result<()> {
        self.remove_bulk(keys, opts).await.map(|_| ())
    }

    async fn remove_group(&self, group: &str, sub_group: Option<&str>) -> Result<()> {
        if group.is_empty() {
            return Err(Error::InvalidArgument("group cannot be empty".into()));
        }
        self.remove_all(self.engine.keys_in_group(group, sub_group))
    }

    async fn contains_bulk(&self, keys: &[String]) -> Result<HashMap<String, bool>> {
        validate_keys(keys)?;
        Ok(keys
            .iter()
            .map(|k| (k.clone(), self.engine.contains(k)))
            .collect())
    }

    async fn clear(&self, _flags: OperationFlags) -> Result<()> {
        self.engine.clear();
        Ok(())
    }

    async fn set_attributes(&self, key: &str, attrs: &ItemAttributes) -> Result<bool> {
        validate_key(key)?;
        Ok(match attrs.absolute_expiration {
            Some(at) => self.engine.set_absolute_expiration(key, at),
            None => self.engine.contains(key),
        })
    }

    async fn touch(&self, keys: &[String]) -> Result<()> {
        validate_keys(keys)?;
        for key in keys {
            self.engine.touch(key);
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Locking
    // -------------------------------------------------------------------------

    async fn lock(&self, key: &str, timeout: Duration) -> Result<(bool, LockHandle)> {
        validate_key(key)?;
        Ok(self.engine.lock(key, timeout))
    }

    async fn unlock(&self, key: &str, lock_id: Option<&str>) -> Result<()> {
        validate_key(key)?;
        self.engine.unlock(key, lock_id)
    }

    async fn is_locked(&self, key: &str) -> Result<(bool, LockHandle)> {
        validate_key(key)?;
        Ok(self.engine.is_locked(key))
    }

    // -------------------------------------------------------------------------
    // Tags and Groups
    // -------------------------------------------------------------------------

    async fn get_by_tags(&self, tags: &[Tag], mode: TagMatch) -> Result<HashMap<String, ValueEntry>> {
        self.entries_of(self.engine.keys_by_tags(tags, mode))
    }

    async fn get_keys_by_tags(&self, tags: &[Tag], mode: TagMatch) -> Result<Vec<String>> {
        Ok(self.engine.keys_by_tags(tags, mode))
    }

    async fn remove_by_tags(&self, tags: &[Tag], mode: TagMatch) -> Result<()> {
        self.remove_all(self.engine.keys_by_tags(tags, mode))
    }

    async fn get_group_data(
        &self,
        group: &str,
        sub_group: Option<&str>,
    ) -> Result<HashMap<String, ValueEntry>> {
        self.entries_of(self.engine.keys_in_group(group, sub_group))
    }

    async fn get_group_keys(&self, group: &str, sub_group: Option<&str>) -> Result<Vec<String>> {
        Ok(self.engine.keys_in_group(group, sub_group))
    }

    // -------------------------------------------------------------------------
    // Query
    // -------------------------------------------------------------------------

    async fn search(&self, query: &str, params: &QueryParams) -> Result<QueryResultSet> {
        self.engine.search(query, params, false)
    }

    async fn search_entries(&self, query: &str, params: &QueryParams) -> Result<QueryResultSet> {
        self.engine.search(query, params, true)
    }

    async fn search_cq(&self, cq: &CqRegistration) -> Result<QueryResultSet> {
        let query_id = self.engine.register_cq(cq)?;
        let mut result = self.engine.search(&cq.query, &cq.params, false)?;
        result.query_id = Some(query_id);
        Ok(result)
    }

    async fn search_entries_cq(&self, cq: &CqRegistration) -> Result<QueryResultSet> {
        let query_id = self.engine.register_cq(cq)?;
        let mut result = self.engine.search(&cq.query, &cq.params, true)?;
        result.query_id = Some(query_id);
        Ok(result)
    }

    async fn execute_reader(
        &self,
        query: &str,
        params: &QueryParams,
        get_data: bool,
        chunk_size: usize,
    ) -> Result<DistributedReader> {
        let chunk_size = self.reader_chunk_size(chunk_size);
        let opened = self.engine.open_reader(query, params, get_data, chunk_size)?;
        Ok(self.reader(opened.first_chunk, chunk_size))
    }

    async fn execute_reader_cq(
        &self,
        cq: &CqRegistration,
        get_data: bool,
        chunk_size: usize,
    ) -> Result<DistributedReader> {
        let chunk_size = self.reader_chunk_size(chunk_size);
        let query_id = self.engine.register_cq(cq)?;
        let opened = self.engine.open_reader(&cq.query, &cq.params, get_data, chunk_size)?;
        Ok(self
            .reader(opened.first_chunk, chunk_size)
            .with_query_id(Some(query_id)))
    }

    async fn register_cq(&self, cq: &CqRegistration) -> Result<String> {
        self.engine.register_cq(cq)
    }

    async fn unregister_cq(&self, server_id: &str) -> Result<()> {
        self.engine.unregister_cq(server_id);
        Ok(())
    }

    async fn remove_by_query(&self, query: &str, params: &QueryParams) -> Result<u64> {
        self.engine.remove_by_query(query, params)
    }

    // -------------------------------------------------------------------------
    // Streams
    // -------------------------------------------------------------------------

    async fn open_stream(&self, key: &str, mode: StreamMode, opts: &StreamOptions) -> Result<String> {
        validate_key(key)?;
        self.engine.open_stream(key, mode, opts)
    }

    async fn close_stream(&self, key: &str, handle: &str) -> Result<()> {
        self.engine.close_stream(key, handle)
    }

    async fn read_from_stream(&self, key: &str, handle: &str, offset: u64, length: usize) -> Result<Bytes> {
        self.engine.read_stream(key, handle, offset, length)
    }

    async fn write_to_stream(&self, key: &str, handle: &str, offset: u64, data: Bytes) -> Result<()> {
        self.engine.write_stream(key, handle, offset, &data)
    }

    async fn get_stream_length(&self, key: &str, handle: &str) -> Result<u64> {
        self.engine.stream_length(key, handle)
    }

    // -------------------------------------------------------------------------
    // Notifications
    // -------------------------------------------------------------------------

    async fn register_key_notification(&self, key: &str, ids: &ItemCallbackIds) -> Result<()> {
        validate_key(key)?;
        self.engine.register_key_callbacks(key, ids);
        Ok(())
    }

    async fn unregister_key_notification(&self, key: &str, ids: &ItemCallbackIds) -> Result<()> {
        validate_key(key)?;
        self.engine.unregister_key_callbacks(key, ids);
        Ok(())
    }

    async fn register_bulk_key_notification(&self, keys: &[String], ids: &ItemCallbackIds) -> Result<()> {
        validate_keys(keys)?;
        for key in keys {
            self.engine.register_key_callbacks(key, ids);
        }
        Ok(())
    }

    async fn unregister_bulk_key_notification(
        &self,
        keys: &[String],
        ids: &ItemCallbackIds,
    ) -> Result<()> {
        validate_keys(keys)?;
        for key in keys {
            self.engine.unregister_key_callbacks(key, ids);
        }
        Ok(())
    }

    async fn register_general_notification(
        &self,
        types: EventTypes,
        filter: EventDataFilter,
        _sequence: u64,
    ) -> Result<()> {
        self.engine.register_general(types, filter);
        Ok(())
    }

    async fn unregister_general_notification(&self, types: EventTypes, _sequence: u64) -> Result<()> {
        self.engine.unregister_general(types);
        Ok(())
    }

    async fn raise_custom_event(&self, notif_id: Bytes, data: Bytes) -> Result<()> {
        self.engine.raise_custom_event(notif_id, data);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Pub/Sub
    // -------------------------------------------------------------------------

    async fn get_or_create_topic(&self, name: &str, op: TopicOperation) -> Result<bool> {
        validate_key(name)?;
        Ok(self.engine.create_topic(name, op))
    }

    async fn remove_topic(&self, name: &str, forcefully: bool) -> Result<()> {
        validate_key(name)?;
        self.engine.remove_topic(name, forcefully)
    }

    async fn subscribe(&self, subscription: &SubscriptionInfo) -> Result<()> {
        self.engine.subscribe(subscription)
    }

    async fn unsubscribe(&self, subscription: &SubscriptionInfo) -> Result<()> {
        self.engine.unsubscribe(subscription)
    }

    async fn publish_message(&self, message: &OutgoingMessage, _flags: OperationFlags) -> Result<()> {
        self.engine.publish(message)
    }

    async fn get_message_count(&self, topic: &str) -> Result<u64> {
        self.engine.message_count(topic)
    }

    async fn get_messages(&self, subscriber_id: &str) -> Result<ReceivedMessages> {
        Ok(self.engine.pull_messages(subscriber_id))
    }

    async fn acknowledge_message_receipt(&self, acks: &MessageAcks) -> Result<()> {
        self.engine.acknowledge(acks);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Processing
    // -------------------------------------------------------------------------

    async fn invoke_entry_processor(
        &self,
        keys: &[String],
        processor: &str,
        args: &[serde_json::Value],
        _flags: OperationFlags,
    ) -> Result<HashMap<String, ProcessorOutcome>> {
        validate_keys(keys)?;
        self.engine.invoke_entry_processor(keys, processor, args)
    }

    async fn get_connected_clients(&self) -> Result<Vec<ClientInfo>> {
        Ok(vec![self.client.clone()])
    }
}

impl std::fmt::Debug for InprocCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InprocCache")
            .field("name", &self.name)
            .field("engine", &self.engine.name())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory_engine::InMemoryEngine;
    use crate::domain::events::Notification;
    use crate::domain::options::MapReduceTask;
    use assert_matches::assert_matches;
    use serde_json::json;

    struct Discard;

    impl NotificationSink for Discard {
        fn notify(&self, _notification: Notification) {}
    }

    fn cache() -> InprocCache {
        InprocCache::new(
            "local",
            Arc::new(InMemoryEngine::new("local")),
            ClientConfig::default(),
            Arc::new(Discard),
        )
    }

    fn item(n: i64) -> CacheItem {
        CacheItem::new(Payload::Native(json!({ "n": n }))).with_named_tag("n", json!(n))
    }

    #[tokio::test]
    async fn test_values_stay_native() {
        let cache = cache();
        let mut flags = OperationFlags::empty();
        let payload = cache
            .safe_serialize(CacheValue::Json(json!({"a": 1})), &mut flags)
            .unwrap();
        assert_eq!(payload, Payload::Native(json!({"a": 1})));
        assert!(flags.is_empty());

        cache.insert("k", &item(1), &WriteOptions::default()).await.unwrap();
        let got = cache.get("k", &GetOptions::default()).await.unwrap();
        assert_eq!(got.value.unwrap().payload, Payload::Native(json!({"n": 1})));
    }

    #[tokio::test]
    async fn test_lock_access_translation() {
        let cache = cache();
        cache.insert("k", &item(1), &WriteOptions::default()).await.unwrap();

        let got = cache
            .get("k", &GetOptions::acquire(Duration::from_secs(30)))
            .await
            .unwrap();
        assert!(got.lock.is_held());

        let err = cache
            .insert("k", &item(2), &WriteOptions::default())
            .await
            .unwrap_err();
        assert_matches!(err, Error::ItemLocked { .. });

        let missing_id = WriteOptions {
            access: LockAccessType::Release,
            ..Default::default()
        };
        assert_matches!(
            cache.insert("k", &item(2), &missing_id).await,
            Err(Error::InvalidArgument(_))
        );

        let release = WriteOptions::default().with_lock(&got.lock, LockAccessType::Release);
        cache.insert("k", &item(2), &release).await.unwrap();
        assert!(!cache.is_locked("k").await.unwrap().0);
    }

    #[tokio::test]
    async fn test_bulk_insert_reports_per_key_failures() {
        let cache = cache();
        cache.add("b", &item(0), &WriteOptions::default()).await.unwrap();
        let keys = vec!["a".to_string(), "b".to_string()];
        let result = cache
            .add_bulk(&keys, &[item(1), item(2)], &WriteOptions::default())
            .await
            .unwrap();
        assert!(result.versions.contains_key("a"));
        assert_matches!(result.failures.get("b"), Some(ServerFault::Failed(_)));

        assert_matches!(
            cache.insert_bulk(&keys, &[item(1)], &WriteOptions::default()).await,
            Err(Error::LengthMismatch { keys: 2, items: 1 })
        );
    }

    #[tokio::test]
    async fn test_reader_over_engine_chunks() {
        let cache = cache();
        for n in 0..5 {
            cache.insert(&format!("k{}", n), &item(n), &WriteOptions::default()).await.unwrap();
        }
        let mut reader = cache
            .execute_reader("SELECT n ORDER BY n", &QueryParams::new(), false, 2)
            .await
            .unwrap();
        let mut seen = Vec::new();
        while reader.read().await.unwrap() {
            seen.push(reader.get("n").and_then(|v| v.as_i64()).unwrap());
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_map_reduce_is_a_capability_error() {
        let cache = cache();
        let task = MapReduceTask {
            name: "wordcount".into(),
            params: json!({}),
        };
        assert_matches!(
            cache.execute_map_reduce(&task).await,
            Err(Error::Unsupported {
                operation: "execute_map_reduce",
                strategy: "inproc"
            })
        );
    }
}
