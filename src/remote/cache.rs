//! Remote cache strategy.
//!
//! Implements the operation contract against a clustered cache reached
//! through a [`Broker`]. Arguments are validated before anything is sent;
//! bulk calls are sharded per owning server and their responses merged;
//! every request runs under the dispatcher's fault policy.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::command::{unexpected, Command, ResponseBody};
use super::dispatcher::Dispatcher;
use crate::compression::{CompressionConfig, PayloadCompressor};
use crate::config::ClientConfig;
use crate::domain::events::{CallbackId, EventDataFilter, EventTypes, ItemCallbackIds, Notification};
use crate::domain::flags::OperationFlags;
use crate::domain::item::{
    validate_key, validate_keys, CacheItem, CacheValue, ItemAttributes, Payload, Tag, TagMatch,
    ValueEntry,
};
use crate::domain::lock::{ItemVersion, LockHandle};
use crate::domain::messaging::{
    MessageAcks, OutgoingMessage, ReceivedMessages, SubscriptionInfo, TopicOperation,
};
use crate::domain::options::{
    BulkGetResult, BulkWriteResult, ClientInfo, GetOptions, GetResult, MapReduceTask, PollResult,
    ProcessorOutcome, RemoveOptions, StreamMode, StreamOptions, WriteOptions,
};
use crate::domain::ports::{
    decode_value, encode_value, Broker, BrokerListener, CacheStrategy, Clock, NotificationSink,
    ServerAddress,
};
use crate::domain::query::{CqRegistration, QueryParams, QueryResultSet};
use crate::error::{Error, Result};
use crate::reader::{ChunkSource, DistributedReader, PartitionRegistry};

type Bodies = Vec<(ServerAddress, ResponseBody)>;

/// Extract one response shape or fail with the shape that arrived.
macro_rules! take {
    ($body:expr, $pat:pat => $out:expr, $kind:literal) => {
        match $body {
            $pat => Ok($out),
            other => Err(unexpected($kind, &other)),
        }
    };
}

fn first(bodies: Bodies) -> Result<ResponseBody> {
    bodies
        .into_iter()
        .next()
        .map(|(_, body)| body)
        .ok_or_else(|| Error::OperationFailed("empty response".into()))
}

fn check_lock_id(lock_id: Option<&str>, access: crate::domain::lock::LockAccessType) -> Result<()> {
    if access.requires_lock_id() && lock_id.is_none() {
        return Err(Error::InvalidArgument(format!(
            "lock access '{}' requires a lock id",
            access
        )));
    }
    Ok(())
}

/// Registrations replayed after a connection is restored.
#[derive(Debug, Default)]
struct Registrations {
    general: HashMap<EventTypes, (EventDataFilter, u64)>,
    keys: HashMap<String, Vec<ItemCallbackIds>>,
    queries: HashMap<String, CqRegistration>,
    polling: Vec<CallbackId>,
}

impl Registrations {
    fn add_key(&mut self, key: &str, ids: ItemCallbackIds) {
        let registered = self.keys.entry(key.to_string()).or_default();
        if !registered.contains(&ids) {
            registered.push(ids);
        }
    }

    /// Forget one registration on `key`; others on the same key stay.
    fn remove_key(&mut self, key: &str, ids: &ItemCallbackIds) {
        if let Some(registered) = self.keys.get_mut(key) {
            registered.retain(|r| r != ids);
            if registered.is_empty() {
                self.keys.remove(key);
            }
        }
    }
}

/// Cache strategy for a clustered remote cache.
pub struct RemoteCache {
    name: String,
    me: Weak<RemoteCache>,
    dispatcher: Arc<Dispatcher>,
    partitions: Arc<PartitionRegistry>,
    compressor: PayloadCompressor,
    sink: Arc<dyn NotificationSink>,
    client: ClientInfo,
    config: ClientConfig,
    registrations: Mutex<Registrations>,
}

impl RemoteCache {
    /// Create the strategy and install it as the broker's listener.
    pub fn new(
        name: impl Into<String>,
        broker: Arc<dyn Broker>,
        config: ClientConfig,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn NotificationSink>,
    ) -> Arc<Self> {
        let name = name.into();
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&broker), clock, config.clone()));
        let cache = Arc::new_cyclic(|me| Self {
            name,
            me: me.clone(),
            dispatcher,
            partitions: Arc::new(PartitionRegistry::new()),
            compressor: PayloadCompressor::new(CompressionConfig::from(&config)),
            sink,
            client: ClientInfo::current(config.app_name.as_deref()),
            config,
            registrations: Mutex::new(Registrations::default()),
        });
        let listener: Weak<dyn BrokerListener> = Arc::downgrade(&cache) as Weak<dyn BrokerListener>;
        broker.set_listener(listener);
        info!(cache = %cache.name, "Remote cache initialized");
        cache
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Open reader partitions, by server.
    pub fn partitions(&self) -> &Arc<PartitionRegistry> {
        &self.partitions
    }

    // -------------------------------------------------------------------------
    // Dispatch helpers
    // -------------------------------------------------------------------------

    async fn keyed(&self, op: &'static str, key: &str, command: Command) -> Result<ResponseBody> {
        let bodies = self
            .dispatcher
            .dispatch(op, |route| self.dispatcher.to_key(route, key, command.clone()))
            .await?;
        first(bodies)
    }

    async fn any(&self, op: &'static str, command: Command) -> Result<ResponseBody> {
        let bodies = self
            .dispatcher
            .dispatch(op, |route| self.dispatcher.to_any(route, command.clone()))
            .await?;
        first(bodies)
    }

    async fn broadcast(&self, op: &'static str, command: Command) -> Result<Bodies> {
        self.dispatcher
            .dispatch(op, |route| self.dispatcher.broadcast(route, command.clone()))
            .await
    }

    async fn sharded<T, F>(
        &self,
        op: &'static str,
        keys: &[String],
        items: Option<&[T]>,
        make: F,
    ) -> Result<Bodies>
    where
        T: Clone + Send + Sync,
        F: Fn(Vec<String>, Vec<T>) -> Command + Send + Sync,
    {
        self.dispatcher
            .dispatch(op, |route| self.dispatcher.sharded(route, keys, items, &make))
            .await
    }

    // -------------------------------------------------------------------------
    // Payload preparation
    // -------------------------------------------------------------------------

    /// Payload as sent on the wire: native values are encoded and large
    /// payloads compressed.
    fn wire_entry(&self, payload: &Payload, flags: OperationFlags) -> Result<ValueEntry> {
        let mut flags = flags;
        let payload = match payload {
            Payload::Native(json) => encode_value(CacheValue::Json(json.clone()), &mut flags)?,
            Payload::Bytes(_) => payload.clone(),
        };
        let payload = match payload {
            Payload::Bytes(bytes) if !flags.contains(OperationFlags::COMPRESSED) => {
                let (packed, compressed) = self.compressor.compress(&bytes);
                if compressed {
                    flags.insert(OperationFlags::COMPRESSED);
                }
                Payload::Bytes(packed)
            }
            other => other,
        };
        Ok(ValueEntry::new(payload, flags))
    }

    fn prepare_item(&self, key: &str, item: &CacheItem) -> Result<CacheItem> {
        item.validate(key)?;
        let entry = self.wire_entry(&item.value, item.payload_flags)?;
        let mut prepared = item.clone();
        prepared.value = entry.payload;
        prepared.payload_flags = entry.flags;
        Ok(prepared)
    }

    fn prepare_bulk(&self, keys: &[String], items: &[CacheItem]) -> Result<Vec<CacheItem>> {
        validate_keys(keys)?;
        if keys.len() != items.len() {
            return Err(Error::LengthMismatch {
                keys: keys.len(),
                items: items.len(),
            });
        }
        keys.iter()
            .zip(items)
            .map(|(key, item)| self.prepare_item(key, item))
            .collect()
    }

    // -------------------------------------------------------------------------
    // Notification replay
    // -------------------------------------------------------------------------

    /// Re-send every notification registration this client made, e.g. after
    /// a server connection was restored.
    pub async fn reregister_notifications(&self) -> Result<()> {
        let (general, keys, queries, polling) = {
            let r = self.registrations.lock();
            (
                r.general.clone(),
                r.keys.clone(),
                r.queries.values().cloned().collect::<Vec<_>>(),
                r.polling.clone(),
            )
        };
        debug!(
            general = general.len(),
            keys = keys.len(),
            queries = queries.len(),
            "Replaying notification registrations"
        );

        for (types, (filter, sequence)) in general {
            self.broadcast(
                "register_general_notification",
                Command::RegisterGeneralNotification {
                    types,
                    filter,
                    sequence,
                },
            )
            .await?;
        }
        for (key, registered) in keys {
            for ids in registered {
                self.keyed(
                    "register_key_notification",
                    &key,
                    Command::RegisterKeyNotification {
                        keys: vec![key.clone()],
                        ids,
                    },
                )
                .await?;
            }
        }
        for registration in queries {
            self.broadcast("register_cq", Command::RegisterCq { registration })
                .await?;
        }
        for callback in polling {
            self.broadcast("register_polling", Command::RegisterPolling { callback })
                .await?;
        }
        Ok(())
    }

    fn reader_chunk_size(&self, requested: usize) -> usize {
        if requested == 0 {
            self.config.reader_chunk_size
        } else {
            requested
        }
    }

    fn chunk_source(&self) -> Arc<dyn ChunkSource> {
        Arc::clone(&self.dispatcher) as Arc<dyn ChunkSource>
    }

    fn merge_query(bodies: Bodies) -> Result<QueryResultSet> {
        let mut merged = QueryResultSet::default();
        for (_, body) in bodies {
            merged.merge(take!(body, ResponseBody::Query(q) => q, "query")?);
        }
        Ok(merged)
    }

    fn merge_entries(bodies: Bodies) -> Result<HashMap<String, ValueEntry>> {
        let mut merged = HashMap::new();
        for (_, body) in bodies {
            merged.extend(take!(body, ResponseBody::Entries(e) => e, "entries")?);
        }
        Ok(merged)
    }

    fn merge_keys(bodies: Bodies) -> Result<Vec<String>> {
        let mut merged = Vec::new();
        for (_, body) in bodies {
            merged.extend(take!(body, ResponseBody::Keys(k) => k, "keys")?);
        }
        Ok(merged)
    }

    fn sum_counts(bodies: Bodies) -> Result<u64> {
        let mut total = 0;
        for (_, body) in bodies {
            total += take!(body, ResponseBody::Count(n) => n, "count")?;
        }
        Ok(total)
    }

    async fn open_reader(
        &self,
        command: Command,
        chunk_size: usize,
    ) -> Result<DistributedReader> {
        let bodies = self.broadcast("execute_reader", command).await?;
        let mut chunks = Vec::with_capacity(bodies.len());
        let mut query_id = None;
        for (_, body) in bodies {
            match body {
                ResponseBody::Reader(chunk) => chunks.push(chunk),
                ResponseBody::CqReader { chunk, query_id: id } => {
                    query_id.get_or_insert(id);
                    chunks.push(chunk);
                }
                other => return Err(unexpected("reader", &other)),
            }
        }
        Ok(
            DistributedReader::new(self.chunk_source(), Arc::clone(&self.partitions), chunks, chunk_size)
                .with_query_id(query_id),
        )
    }
}

#[async_trait]
impl CacheStrategy for RemoteCache {
    fn name(&self) -> &str {
        &self.name
    }

    fn strategy_name(&self) -> &'static str {
        "remote"
    }

    fn client_info(&self) -> ClientInfo {
        self.client.clone()
    }

    async fn count(&self) -> Result<u64> {
        let bodies = self.broadcast("count", Command::Count).await?;
        Self::sum_counts(bodies)
    }

    async fn dispose(&self) -> Result<()> {
        info!(cache = %self.name, "Disposing remote cache");
        self.dispatcher.broker().dispose().await
    }

    fn safe_serialize(&self, value: CacheValue, flags: &mut OperationFlags) -> Result<Payload> {
        let entry = self.wire_entry(&encode_value(value, flags)?, *flags)?;
        *flags = entry.flags;
        Ok(entry.payload)
    }

    fn safe_deserialize(&self, entry: ValueEntry) -> Result<CacheValue> {
        let entry = match entry.payload {
            Payload::Bytes(bytes) if entry.flags.contains(OperationFlags::COMPRESSED) => ValueEntry::new(
                Payload::Bytes(self.compressor.decompress(&bytes)?),
                entry.flags.without(OperationFlags::COMPRESSED),
            ),
            payload => ValueEntry::new(payload, entry.flags),
        };
        Ok(decode_value(entry))
    }

    // -------------------------------------------------------------------------
    // CRUD
    // -------------------------------------------------------------------------

    async fn add(&self, key: &str, item: &CacheItem, opts: &WriteOptions) -> Result<ItemVersion> {
        validate_key(key)?;
        let item = self.prepare_item(key, item)?;
        let command = Command::Add {
            key: key.to_string(),
            item,
            opts: opts.clone(),
        };
        take!(self.keyed("add", key, command).await?, ResponseBody::Version(v) => v, "version")
    }

    async fn add_bulk(
        &self,
        keys: &[String],
        items: &[CacheItem],
        opts: &WriteOptions,
    ) -> Result<BulkWriteResult> {
        let items = self.prepare_bulk(keys, items)?;
        let bodies = self
            .sharded("add_bulk", keys, Some(items.as_slice()), |keys, items| Command::BulkAdd {
                keys,
                items,
                opts: opts.clone(),
            })
            .await?;
        let mut merged = BulkWriteResult::default();
        for (_, body) in bodies {
            merged.merge(take!(body, ResponseBody::BulkWrite(r) => r, "bulk-write")?);
        }
        Ok(merged)
    }

    async fn insert(&self, key: &str, item: &CacheItem, opts: &WriteOptions) -> Result<ItemVersion> {
        validate_key(key)?;
        check_lock_id(opts.lock_id.as_deref(), opts.access)?;
        let item = self.prepare_item(key, item)?;
        let command = Command::Insert {
            key: key.to_string(),
            item,
            opts: opts.clone(),
        };
        take!(self.keyed("insert", key, command).await?, ResponseBody::Version(v) => v, "version")
    }

    async fn insert_bulk(
        &self,
        keys: &[String],
        items: &[CacheItem],
        opts: &WriteOptions,
    ) -> Result<BulkWriteResult> {
        let items = self.prepare_bulk(keys, items)?;
        let bodies = self
            .sharded("insert_bulk", keys, Some(items.as_slice()), |keys, items| {
                Command::BulkInsert {
                    keys,
                    items,
                    opts: opts.clone(),
                }
            })
            .await?;
        let mut merged = BulkWriteResult::default();
        for (_, body) in bodies {
            merged.merge(take!(body, ResponseBody::BulkWrite(r) => r, "bulk-write")?);
        }
        Ok(merged)
    }

    async fn get(&self, key: &str, opts: &GetOptions) -> Result<GetResult> {
        validate_key(key)?;
        check_lock_id(opts.lock.lock_id(), opts.access)?;
        let command = Command::Get {
            key: key.to_string(),
            opts: opts.clone(),
        };
        take!(self.keyed("get", key, command).await?, ResponseBody::Value(r) => r, "value")
    }

    async fn get_bulk(&self, keys: &[String], flags: OperationFlags) -> Result<BulkGetResult> {
        validate_keys(keys)?;
        let bodies = self
            .sharded::<(), _>("get_bulk", keys, None, |keys, _| Command::BulkGet { keys, flags })
            .await?;
        let mut merged = BulkGetResult::default();
        for (_, body) in bodies {
            merged.merge(take!(body, ResponseBody::BulkValues(r) => r, "bulk-values")?);
        }
        Ok(merged)
    }

    async fn get_cache_item(&self, key: &str, opts: &GetOptions) -> Result<Option<CacheItem>> {
        validate_key(key)?;
        check_lock_id(opts.lock.lock_id(), opts.access)?;
        let command = Command::GetCacheItem {
            key: key.to_string(),
            opts: opts.clone(),
        };
        take!(
            self.keyed("get_cache_item", key, command).await?,
            ResponseBody::Item(item) => *item,
            "item"
        )
    }

    async fn get_cache_item_bulk(
        &self,
        keys: &[String],
        flags: OperationFlags,
    ) -> Result<HashMap<String, CacheItem>> {
        validate_keys(keys)?;
        let bodies = self
            .sharded::<(), _>("get_cache_item_bulk", keys, None, |keys, _| {
                Command::BulkGetCacheItem { keys, flags }
            })
            .await?;
        let mut merged = HashMap::new();
        for (_, body) in bodies {
            merged.extend(take!(body, ResponseBody::Items(items) => items, "items")?);
        }
        Ok(merged)
    }

    async fn remove(&self, key: &str, opts: &RemoveOptions) -> Result<Option<ValueEntry>> {
        validate_key(key)?;
        check_lock_id(opts.lock_id.as_deref(), opts.access)?;
        let command = Command::Remove {
            key: key.to_string(),
            opts: opts.clone(),
        };
        take!(self.keyed("remove", key, command).await?, ResponseBody::Removed(v) => v, "removed")
    }

    async fn delete(&self, key: &str, opts: &RemoveOptions) -> Result<()> {
        validate_key(key)?;
        check_lock_id(opts.lock_id.as_deref(), opts.access)?;
        let command = Command::Delete {
            key: key.to_string(),
            opts: opts.clone(),
        };
        self.keyed("delete", key, command).await.map(|_| ())
    }

    async fn remove_bulk(
        &self,
        keys: &[String],
        opts: &RemoveOptions,
    ) -> Result<HashMap<String, ValueEntry>> {
        validate_keys(keys)?;
        let bodies = self
            .sharded::<(), _>("remove_bulk", keys, None, |keys, _| Command::BulkRemove {
                keys,
                opts: opts.clone(),
            })
            .await?;
        let mut merged = HashMap::new();
        for (_, body) in bodies {
            merged.extend(take!(body, ResponseBody::RemovedBulk(r) => r, "removed-bulk")?);
        }
        Ok(merged)
    }

    async fn delete_bulk(&self, keys: &[String], opts: &RemoveOptions) -> Result<()> {
        validate_keys(keys)?;
        self.sharded::<(), _>("delete_bulk", keys, None, |keys, _| Command::BulkDelete {
            keys,
            opts: opts.clone(),
        })
        .await
        .map(|_| ())
    }

    async fn remove_group(&self, group: &str, sub_group: Option<&str>) -> Result<()> {
        if group.is_empty() {
            return Err(Error::InvalidArgument("group cannot be empty".into()));
        }
        let command = Command::RemoveGroup {
            group: group.to_string(),
            sub_group: sub_group.map(str::to_string),
        };
        self.broadcast("remove_group", command).await.map(|_| ())
    }

    async fn contains_bulk(&self, keys: &[String]) -> Result<HashMap<String, bool>> {
        validate_keys(keys)?;
        let bodies = self
            .sharded::<(), _>("contains", keys, None, |keys, _| Command::Contains { keys })
            .await?;
        let mut merged = HashMap::new();
        for (_, body) in bodies {
            merged.extend(take!(body, ResponseBody::Found(f) => f, "found")?);
        }
        Ok(merged)
    }

    async fn clear(&self, flags: OperationFlags) -> Result<()> {
        self.broadcast("clear", Command::Clear { flags }).await.map(|_| ())
    }

    async fn set_attributes(&self, key: &str, attrs: &ItemAttributes) -> Result<bool> {
        validate_key(key)?;
        let command = Command::SetAttributes {
            key: key.to_string(),
            attrs: attrs.clone(),
        };
        take!(self.keyed("set_attributes", key, command).await?, ResponseBody::Bool(b) => b, "bool")
    }

    async fn touch(&self, keys: &[String]) -> Result<()> {
        validate_keys(keys)?;
        self.sharded::<(), _>("touch", keys, None, |keys, _| Command::Touch { keys })
            .await
            .map(|_| ())
    }

    // -------------------------------------------------------------------------
    // Locking
    // -------------------------------------------------------------------------

    async fn lock(&self, key: &str, timeout: Duration) -> Result<(bool, LockHandle)> {
        validate_key(key)?;
        let command = Command::Lock {
            key: key.to_string(),
            timeout,
        };
        take!(
            self.keyed("lock", key, command).await?,
            ResponseBody::Lock { acquired, lock } => (acquired, lock),
            "lock"
        )
    }

    async fn unlock(&self, key: &str, lock_id: Option<&str>) -> Result<()> {
        validate_key(key)?;
        let command = Command::Unlock {
            key: key.to_string(),
            lock_id: lock_id.map(str::to_string),
        };
        self.keyed("unlock", key, command).await.map(|_| ())
    }

    async fn is_locked(&self, key: &str) -> Result<(bool, LockHandle)> {
        validate_key(key)?;
        let command = Command::IsLocked {
            key: key.to_string(),
        };
        take!(
            self.keyed("is_locked", key, command).await?,
            ResponseBody::Lock { acquired, lock } => (acquired, lock),
            "lock"
        )
    }

    // -------------------------------------------------------------------------
    // Tags and Groups
    // -------------------------------------------------------------------------

    async fn get_by_tags(&self, tags: &[Tag], mode: TagMatch) -> Result<HashMap<String, ValueEntry>> {
        let command = Command::GetByTags {
            tags: tags.to_vec(),
            mode,
        };
        Self::merge_entries(self.broadcast("get_by_tags", command).await?)
    }

    async fn get_keys_by_tags(&self, tags: &[Tag], mode: TagMatch) -> Result<Vec<String>> {
        let command = Command::GetKeysByTags {
            tags: tags.to_vec(),
            mode,
        };
        Self::merge_keys(self.broadcast("get_keys_by_tags", command).await?)
    }

    async fn remove_by_tags(&self, tags: &[Tag], mode: TagMatch) -> Result<()> {
        let command = Command::RemoveByTags {
            tags: tags.to_vec(),
            mode,
        };
        self.broadcast("remove_by_tags", command).await.map(|_| ())
    }

    async fn get_group_data(
        &self,
        group: &str,
        sub_group: Option<&str>,
    ) -> Result<HashMap<String, ValueEntry>> {
        let command = Command::GetGroupData {
            group: group.to_string(),
            sub_group: sub_group.map(str::to_string),
        };
        Self::merge_entries(self.broadcast("get_group_data", command).await?)
    }

    async fn get_group_keys(&self, group: &str, sub_group: Option<&str>) -> Result<Vec<String>> {
        let command = Command::GetGroupKeys {
            group: group.to_string(),
            sub_group: sub_group.map(str::to_string),
        };
        Self::merge_keys(self.broadcast("get_group_keys", command).await?)
    }

    // -------------------------------------------------------------------------
    // Query
    // -------------------------------------------------------------------------

    async fn search(&self, query: &str, params: &QueryParams) -> Result<QueryResultSet> {
        let command = Command::Search {
            query: query.to_string(),
            params: params.clone(),
            with_values: false,
            cq: None,
        };
        Self::merge_query(self.broadcast("search", command).await?)
    }

    async fn search_entries(&self, query: &str, params: &QueryParams) -> Result<QueryResultSet> {
        let command = Command::Search {
            query: query.to_string(),
            params: params.clone(),
            with_values: true,
            cq: None,
        };
        Self::merge_query(self.broadcast("search_entries", command).await?)
    }

    async fn search_cq(&self, cq: &CqRegistration) -> Result<QueryResultSet> {
        let command = Command::Search {
            query: cq.query.clone(),
            params: cq.params.clone(),
            with_values: false,
            cq: Some(cq.clone()),
        };
        let result = Self::merge_query(self.broadcast("search_cq", command).await?)?;
        if let Some(id) = &result.query_id {
            self.registrations.lock().queries.insert(id.clone(), cq.clone());
        }
        Ok(result)
    }

    async fn search_entries_cq(&self, cq: &CqRegistration) -> Result<QueryResultSet> {
        let command = Command::Search {
            query: cq.query.clone(),
            params: cq.params.clone(),
            with_values: true,
            cq: Some(cq.clone()),
        };
        let result = Self::merge_query(self.broadcast("search_entries_cq", command).await?)?;
        if let Some(id) = &result.query_id {
            self.registrations.lock().queries.insert(id.clone(), cq.clone());
        }
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
        let command = Command::ExecuteReader {
            query: query.to_string(),
            params: params.clone(),
            get_data,
            chunk_size,
            cq: None,
        };
        self.open_reader(command, chunk_size).await
    }

    async fn execute_reader_cq(
        &self,
        cq: &CqRegistration,
        get_data: bool,
        chunk_size: usize,
    ) -> Result<DistributedReader> {
        let chunk_size = self.reader_chunk_size(chunk_size);
        let command = Command::ExecuteReader {
            query: cq.query.clone(),
            params: cq.params.clone(),
            get_data,
            chunk_size,
            cq: Some(cq.clone()),
        };
        let reader = self.open_reader(command, chunk_size).await?;
        if let Some(id) = reader.query_id() {
            self.registrations.lock().queries.insert(id.to_string(), cq.clone());
        }
        Ok(reader)
    }

    async fn register_cq(&self, cq: &CqRegistration) -> Result<String> {
        let bodies = self
            .broadcast(
                "register_cq",
                Command::RegisterCq {
                    registration: cq.clone(),
                },
            )
            .await?;
        let id = take!(first(bodies)?, ResponseBody::QueryId(id) => id, "query-id")?;
        self.registrations.lock().queries.insert(id.clone(), cq.clone());
        Ok(id)
    }

    async fn unregister_cq(&self, server_id: &str) -> Result<()> {
        self.registrations.lock().queries.remove(server_id);
        let command = Command::UnregisterCq {
            server_id: server_id.to_string(),
        };
        self.broadcast("unregister_cq", command).await.map(|_| ())
    }

    async fn remove_by_query(&self, query: &str, params: &QueryParams) -> Result<u64> {
        let command = Command::RemoveByQuery {
            query: query.to_string(),
            params: params.clone(),
        };
        Self::sum_counts(self.broadcast("remove_by_query", command).await?)
    }

    // -------------------------------------------------------------------------
    // Streams
    // -------------------------------------------------------------------------

    async fn open_stream(&self, key: &str, mode: StreamMode, opts: &StreamOptions) -> Result<String> {
        validate_key(key)?;
        let command = Command::OpenStream {
            key: key.to_string(),
            mode,
            opts: opts.clone(),
        };
        take!(
            self.keyed("open_stream", key, command).await?,
            ResponseBody::StreamHandle(h) => h,
            "stream-handle"
        )
    }

    async fn close_stream(&self, key: &str, handle: &str) -> Result<()> {
        let command = Command::CloseStream {
            key: key.to_string(),
            handle: handle.to_string(),
        };
        self.keyed("close_stream", key, command).await.map(|_| ())
    }

    async fn read_from_stream(&self, key: &str, handle: &str, offset: u64, length: usize) -> Result<Bytes> {
        let command = Command::ReadStream {
            key: key.to_string(),
            handle: handle.to_string(),
            offset,
            length,
        };
        take!(
            self.keyed("read_from_stream", key, command).await?,
            ResponseBody::StreamData(b) => b,
            "stream-data"
        )
    }

    async fn write_to_stream(&self, key: &str, handle: &str, offset: u64, data: Bytes) -> Result<()> {
        let command = Command::WriteStream {
            key: key.to_string(),
            handle: handle.to_string(),
            offset,
            data,
        };
        self.keyed("write_to_stream", key, command).await.map(|_| ())
    }

    async fn get_stream_length(&self, key: &str, handle: &str) -> Result<u64> {
        let command = Command::StreamLength {
            key: key.to_string(),
            handle: handle.to_string(),
        };
        take!(
            self.keyed("get_stream_length", key, command).await?,
            ResponseBody::Count(n) => n,
            "count"
        )
    }

    // -------------------------------------------------------------------------
    // Notifications
    // -------------------------------------------------------------------------

    async fn register_key_notification(&self, key: &str, ids: &ItemCallbackIds) -> Result<()> {
        validate_key(key)?;
        let command = Command::RegisterKeyNotification {
            keys: vec![key.to_string()],
            ids: *ids,
        };
        self.keyed("register_key_notification", key, command).await?;
        self.registrations.lock().add_key(key, *ids);
        Ok(())
    }

    async fn unregister_key_notification(&self, key: &str, ids: &ItemCallbackIds) -> Result<()> {
        validate_key(key)?;
        self.registrations.lock().remove_key(key, ids);
        let command = Command::UnregisterKeyNotification {
            keys: vec![key.to_string()],
            ids: *ids,
        };
        self.keyed("unregister_key_notification", key, command)
            .await
            .map(|_| ())
    }

    async fn register_bulk_key_notification(&self, keys: &[String], ids: &ItemCallbackIds) -> Result<()> {
        validate_keys(keys)?;
        let ids = *ids;
        self.sharded::<(), _>("register_bulk_key_notification", keys, None, |keys, _| {
            Command::RegisterKeyNotification { keys, ids }
        })
        .await?;
        let mut registrations = self.registrations.lock();
        for key in keys {
            registrations.add_key(key, ids);
        }
        Ok(())
    }

    async fn unregister_bulk_key_notification(
        &self,
        keys: &[String],
        ids: &ItemCallbackIds,
    ) -> Result<()> {
        validate_keys(keys)?;
        {
            let mut registrations = self.registrations.lock();
            for key in keys {
                registrations.remove_key(key, ids);
            }
        }
        let ids = *ids;
        self.sharded::<(), _>("unregister_bulk_key_notification", keys, None, |keys, _| {
            Command::UnregisterKeyNotification { keys, ids }
        })
        .await
        .map(|_| ())
    }

    async fn register_general_notification(
        &self,
        types: EventTypes,
        filter: EventDataFilter,
        sequence: u64,
    ) -> Result<()> {
        let command = Command::RegisterGeneralNotification {
            types,
            filter,
            sequence,
        };
        self.broadcast("register_general_notification", command).await?;
        self.registrations
            .lock()
            .general
            .insert(types, (filter, sequence));
        Ok(())
    }

    async fn unregister_general_notification(&self, types: EventTypes, sequence: u64) -> Result<()> {
        self.registrations.lock().general.remove(&types);
        let command = Command::UnregisterGeneralNotification { types, sequence };
        self.broadcast("unregister_general_notification", command)
            .await
            .map(|_| ())
    }

    async fn raise_custom_event(&self, notif_id: Bytes, data: Bytes) -> Result<()> {
        self.any("raise_custom_event", Command::RaiseCustomEvent { notif_id, data })
            .await
            .map(|_| ())
    }

    async fn register_polling_notification(&self, callback: CallbackId) -> Result<()> {
        self.broadcast("register_polling", Command::RegisterPolling { callback })
            .await?;
        self.registrations.lock().polling.push(callback);
        Ok(())
    }

    async fn poll(&self) -> Result<PollResult> {
        let mut merged = PollResult::default();
        for (_, body) in self.broadcast("poll", Command::Poll).await? {
            merged.merge(take!(body, ResponseBody::Poll(p) => p, "poll")?);
        }
        Ok(merged)
    }

    // -------------------------------------------------------------------------
    // Pub/Sub
    // -------------------------------------------------------------------------

    async fn get_or_create_topic(&self, name: &str, op: TopicOperation) -> Result<bool> {
        validate_key(name)?;
        let command = Command::GetOrCreateTopic {
            name: name.to_string(),
            op,
        };
        take!(
            self.keyed("get_or_create_topic", name, command).await?,
            ResponseBody::Bool(b) => b,
            "bool"
        )
    }

    async fn remove_topic(&self, name: &str, forcefully: bool) -> Result<()> {
        validate_key(name)?;
        let command = Command::RemoveTopic {
            name: name.to_string(),
            forcefully,
        };
        self.keyed("remove_topic", name, command).await.map(|_| ())
    }

    async fn subscribe(&self, subscription: &SubscriptionInfo) -> Result<()> {
        let command = Command::Subscribe {
            subscription: subscription.clone(),
        };
        self.keyed("subscribe", &subscription.topic, command)
            .await
            .map(|_| ())
    }

    async fn unsubscribe(&self, subscription: &SubscriptionInfo) -> Result<()> {
        let command = Command::Unsubscribe {
            subscription: subscription.clone(),
        };
        self.keyed("unsubscribe", &subscription.topic, command)
            .await
            .map(|_| ())
    }

    async fn publish_message(&self, message: &OutgoingMessage, flags: OperationFlags) -> Result<()> {
        let mut message = message.clone();
        message.payload = self.wire_entry(&message.payload.payload, message.payload.flags)?;
        let topic = message.topic.clone();
        self.keyed("publish_message", &topic, Command::Publish { message, flags })
            .await
            .map(|_| ())
    }

    async fn get_message_count(&self, topic: &str) -> Result<u64> {
        let command = Command::MessageCount {
            topic: topic.to_string(),
        };
        take!(
            self.keyed("get_message_count", topic, command).await?,
            ResponseBody::Count(n) => n,
            "count"
        )
    }

    async fn get_messages(&self, subscriber_id: &str) -> Result<ReceivedMessages> {
        let command = Command::GetMessages {
            subscriber_id: subscriber_id.to_string(),
        };
        let mut merged = ReceivedMessages::new();
        for (_, body) in self.broadcast("get_messages", command).await? {
            for (topic, messages) in take!(body, ResponseBody::Messages(m) => m, "messages")? {
                merged.entry(topic).or_default().extend(messages);
            }
        }
        Ok(merged)
    }

    async fn acknowledge_message_receipt(&self, acks: &MessageAcks) -> Result<()> {
        if acks.is_empty() {
            return Ok(());
        }
        self.dispatcher
            .dispatch("acknowledge_message_receipt", |route| {
                self.dispatcher.sharded_acks(route, acks)
            })
            .await
            .map(|_| ())
    }

    // -------------------------------------------------------------------------
    // Processing
    // -------------------------------------------------------------------------

    async fn invoke_entry_processor(
        &self,
        keys: &[String],
        processor: &str,
        args: &[serde_json::Value],
        flags: OperationFlags,
    ) -> Result<HashMap<String, ProcessorOutcome>> {
        validate_keys(keys)?;
        let bodies = self
            .sharded::<(), _>("invoke_entry_processor", keys, None, |keys, _| {
                Command::InvokeEntryProcessor {
                    keys,
                    processor: processor.to_string(),
                    args: args.to_vec(),
                    flags,
                }
            })
            .await?;
        let mut merged = HashMap::new();
        for (_, body) in bodies {
            merged.extend(take!(body, ResponseBody::Processed(p) => p, "processed")?);
        }
        Ok(merged)
    }

    async fn execute_map_reduce(&self, task: &MapReduceTask) -> Result<String> {
        let command = Command::ExecuteMapReduce { task: task.clone() };
        take!(
            self.any("execute_map_reduce", command).await?,
            ResponseBody::TaskId(id) => id,
            "task-id"
        )
    }

    async fn get_connected_clients(&self) -> Result<Vec<ClientInfo>> {
        take!(
            self.any("get_connected_clients", Command::GetConnectedClients).await?,
            ResponseBody::Clients(c) => c,
            "clients"
        )
    }
}

impl BrokerListener for RemoteCache {
    fn connection_lost(&self, server: &ServerAddress) {
        let invalidated = self.partitions.invalidate_server(server);
        warn!(
            cache = %self.name,
            server = %server,
            partitions = invalidated,
            "Lost connection to server"
        );
    }

    fn notification(&self, notification: Notification) {
        self.sink.notify(notification);
    }

    fn connection_restored(&self, server: &ServerAddress) {
        info!(cache = %self.name, server = %server, "Connection restored, replaying registrations");
        let Some(cache) = self.me.upgrade() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = cache.reregister_notifications().await {
                        warn!(cache = %cache.name, error = %e, "Failed to replay registrations");
                    }
                });
            }
            Err(_) => debug!("No runtime available to replay registrations"),
        }
    }
}

impl std::fmt::Debug for RemoteCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteCache")
            .field("name", &self.name)
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}
