//! Cache Facade
//!
//! The handle applications use. Wraps whichever strategy the registry
//! selected, turns typed values into payloads through the strategy's
//! serialization hooks, and owns the client side of notifications.
//!
//! ```text
//!   app ──▶ Cache ──▶ Arc<dyn CacheStrategy> ──▶ InprocCache | RemoteCache
//!             │
//!             └── Arc<EventManager> ◀── engine / broker notifications
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::notifications::EventManager;
use super::stream::CacheStream;
use super::topic::Topic;
use crate::domain::events::{
    CacheEvent, EventDataFilter, EventTypes, ItemCallback, ItemCallbackIds, SubscriptionHandle,
};
use crate::domain::flags::OperationFlags;
use crate::domain::item::{CacheItem, CacheValue, ItemAttributes, Tag, TagMatch, ValueEntry};
use crate::domain::lock::{ItemVersion, LockHandle};
use crate::domain::messaging::TopicOperation;
use crate::domain::options::{
    BulkWriteResult, ClientInfo, GetOptions, MapReduceTask, PollResult, ProcessorOutcome,
    RemoveOptions, StreamMode, StreamOptions, WriteOptions,
};
use crate::domain::ports::CacheStrategy;
use crate::domain::query::{ContinuousQuery, CqRegistration, QueryParams, QueryResultSet};
use crate::error::{Error, Result};
use crate::reader::DistributedReader;

/// Decoded outcome of [`Cache::get_with`].
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched {
    pub value: Option<CacheValue>,
    pub version: Option<ItemVersion>,
    /// Lock state after the read
    pub lock: LockHandle,
}

/// An open named cache.
pub struct Cache {
    name: String,
    strategy: Arc<dyn CacheStrategy>,
    events: Arc<EventManager>,
    disposed: AtomicBool,
}

impl Cache {
    pub(crate) fn new(name: String, strategy: Arc<dyn CacheStrategy>, events: Arc<EventManager>) -> Self {
        Self {
            name,
            strategy,
            events,
            disposed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `"inproc"` or `"remote"`.
    pub fn strategy_name(&self) -> &'static str {
        self.strategy.strategy_name()
    }

    pub fn strategy(&self) -> &Arc<dyn CacheStrategy> {
        &self.strategy
    }

    pub fn events(&self) -> &Arc<EventManager> {
        &self.events
    }

    pub fn client_info(&self) -> ClientInfo {
        self.strategy.client_info()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(Error::CacheDisposed(self.name.clone()));
        }
        Ok(())
    }

    pub(crate) async fn dispose(&self) -> Result<()> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(cache = %self.name, "Disposing cache");
        self.strategy.dispose().await
    }

    // -------------------------------------------------------------------------
    // Values
    // -------------------------------------------------------------------------

    /// Item holding `value`, encoded the way this cache's strategy carries it.
    pub fn item<T: Serialize>(&self, value: &T) -> Result<CacheItem> {
        self.item_from(CacheValue::from_serialize(value)?)
    }

    /// Item holding raw bytes.
    pub fn bytes_item(&self, bytes: impl Into<Bytes>) -> Result<CacheItem> {
        self.item_from(CacheValue::Bytes(bytes.into()))
    }

    fn item_from(&self, value: CacheValue) -> Result<CacheItem> {
        let mut flags = OperationFlags::empty();
        let payload = self.strategy.safe_serialize(value, &mut flags)?;
        let mut item = CacheItem::new(payload);
        item.payload_flags = flags;
        Ok(item)
    }

    pub fn decode(&self, entry: ValueEntry) -> Result<CacheValue> {
        self.strategy.safe_deserialize(entry)
    }

    fn decode_all(&self, entries: HashMap<String, ValueEntry>) -> Result<HashMap<String, CacheValue>> {
        entries
            .into_iter()
            .map(|(key, entry)| Ok((key, self.decode(entry)?)))
            .collect()
    }

    /// Register the item's callbacks and put their ids on the write.
    fn attach_callbacks(&self, item: &CacheItem, opts: &mut WriteOptions) {
        if item.on_updated.is_none() && item.on_removed.is_none() {
            return;
        }
        opts.callbacks = ItemCallbackIds {
            on_update: item
                .on_updated
                .clone()
                .map(|cb| self.events.register_item_callback(cb)),
            on_remove: item
                .on_removed
                .clone()
                .map(|cb| self.events.register_item_callback(cb)),
            filter: item.callback_filter(),
            notify_on_expiration: true,
        };
    }

    fn release_callbacks(&self, ids: &ItemCallbackIds) {
        for id in [ids.on_update, ids.on_remove].into_iter().flatten() {
            self.events.unregister_item_callback(id);
        }
    }

    // -------------------------------------------------------------------------
    // Writes
    // -------------------------------------------------------------------------

    pub async fn add<T: Serialize>(&self, key: &str, value: &T) -> Result<ItemVersion> {
        let item = self.item(value)?;
        self.add_item(key, item, WriteOptions::default()).await
    }

    pub async fn add_item(&self, key: &str, item: CacheItem, opts: WriteOptions) -> Result<ItemVersion> {
        self.ensure_open()?;
        item.validate(key)?;
        let mut opts = opts;
        self.attach_callbacks(&item, &mut opts);
        let result = self.strategy.add(key, &item, &opts).await;
        if result.is_err() {
            self.release_callbacks(&opts.callbacks);
        }
        result
    }

    pub async fn insert<T: Serialize>(&self, key: &str, value: &T) -> Result<ItemVersion> {
        let item = self.item(value)?;
        self.insert_item(key, item, WriteOptions::default()).await
    }

    pub async fn insert_item(&self, key: &str, item: CacheItem, opts: WriteOptions) -> Result<ItemVersion> {
        self.ensure_open()?;
        item.validate(key)?;
        let mut opts = opts;
        self.attach_callbacks(&item, &mut opts);
        let result = self.strategy.insert(key, &item, &opts).await;
        if result.is_err() {
            self.release_callbacks(&opts.callbacks);
        }
        result
    }

    pub async fn add_bulk(&self, entries: Vec<(String, CacheItem)>, opts: WriteOptions) -> Result<BulkWriteResult> {
        self.ensure_open()?;
        let (keys, items): (Vec<_>, Vec<_>) = entries.into_iter().unzip();
        self.strategy.add_bulk(&keys, &items, &opts).await
    }

    pub async fn insert_bulk(&self, entries: Vec<(String, CacheItem)>, opts: WriteOptions) -> Result<BulkWriteResult> {
        self.ensure_open()?;
        let (keys, items): (Vec<_>, Vec<_>) = entries.into_iter().unzip();
        self.strategy.insert_bulk(&keys, &items, &opts).await
    }

    /// Change the absolute expiration of an existing item.
    pub async fn set_expiration(&self, key: &str, at: DateTime<Utc>) -> Result<bool> {
        self.ensure_open()?;
        let attrs = ItemAttributes {
            absolute_expiration: Some(at),
        };
        self.strategy.set_attributes(key, &attrs).await
    }

    /// Reset sliding expiration on `keys`.
    pub async fn touch(&self, keys: &[String]) -> Result<()> {
        self.ensure_open()?;
        self.strategy.touch(keys).await
    }

    // -------------------------------------------------------------------------
    // Reads
    // -------------------------------------------------------------------------

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get_value(key).await? {
            Some(value) => Ok(Some(value.into_deserialize()?)),
            None => Ok(None),
        }
    }

    pub async fn get_value(&self, key: &str) -> Result<Option<CacheValue>> {
        Ok(self.get_with(key, &GetOptions::default()).await?.value)
    }

    pub async fn get_with(&self, key: &str, opts: &GetOptions) -> Result<Fetched> {
        self.ensure_open()?;
        let result = self.strategy.get(key, opts).await?;
        Ok(Fetched {
            value: result.value.map(|entry| self.decode(entry)).transpose()?,
            version: result.version,
            lock: result.lock,
        })
    }

    pub async fn get_bulk<T: DeserializeOwned>(&self, keys: &[String]) -> Result<HashMap<String, T>> {
        self.ensure_open()?;
        let result = self.strategy.get_bulk(keys, OperationFlags::empty()).await?;
        let mut values = HashMap::with_capacity(result.values.len());
        for (key, entry) in result.values {
            values.insert(key, self.decode(entry)?.into_deserialize()?);
        }
        Ok(values)
    }

    pub async fn get_cache_item(&self, key: &str) -> Result<Option<CacheItem>> {
        self.ensure_open()?;
        self.strategy.get_cache_item(key, &GetOptions::default()).await
    }

    pub async fn contains(&self, key: &str) -> Result<bool> {
        self.ensure_open()?;
        self.strategy.contains(key).await
    }

    pub async fn contains_bulk(&self, keys: &[String]) -> Result<HashMap<String, bool>> {
        self.ensure_open()?;
        self.strategy.contains_bulk(keys).await
    }

    pub async fn count(&self) -> Result<u64> {
        self.ensure_open()?;
        self.strategy.count().await
    }

    // -------------------------------------------------------------------------
    // Removes
    // -------------------------------------------------------------------------

    /// Remove `key`, returning the value it held.
    pub async fn remove(&self, key: &str) -> Result<Option<CacheValue>> {
        self.remove_with(key, &RemoveOptions::default()).await
    }

    pub async fn remove_with(&self, key: &str, opts: &RemoveOptions) -> Result<Option<CacheValue>> {
        self.ensure_open()?;
        self.strategy
            .remove(key, opts)
            .await?
            .map(|entry| self.decode(entry))
            .transpose()
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.ensure_open()?;
        self.strategy.delete(key, &RemoveOptions::default()).await
    }

    pub async fn remove_bulk(&self, keys: &[String]) -> Result<HashMap<String, CacheValue>> {
        self.ensure_open()?;
        let removed = self.strategy.remove_bulk(keys, &RemoveOptions::default()).await?;
        self.decode_all(removed)
    }

    pub async fn delete_bulk(&self, keys: &[String]) -> Result<()> {
        self.ensure_open()?;
        self.strategy.delete_bulk(keys, &RemoveOptions::default()).await
    }

    pub async fn clear(&self) -> Result<()> {
        self.ensure_open()?;
        self.strategy.clear(OperationFlags::empty()).await
    }

    // -------------------------------------------------------------------------
    // Fire-and-forget
    // -------------------------------------------------------------------------

    pub fn add_async(self: &Arc<Self>, key: impl Into<String>, item: CacheItem) -> JoinHandle<Result<ItemVersion>> {
        let cache = Arc::clone(self);
        let key = key.into();
        tokio::spawn(async move { cache.add_item(&key, item, WriteOptions::default()).await })
    }

    pub fn insert_async(self: &Arc<Self>, key: impl Into<String>, item: CacheItem) -> JoinHandle<Result<ItemVersion>> {
        let cache = Arc::clone(self);
        let key = key.into();
        tokio::spawn(async move { cache.insert_item(&key, item, WriteOptions::default()).await })
    }

    pub fn remove_async(self: &Arc<Self>, key: impl Into<String>) -> JoinHandle<Result<()>> {
        let cache = Arc::clone(self);
        let key = key.into();
        tokio::spawn(async move { cache.delete(&key).await })
    }

    pub fn clear_async(self: &Arc<Self>) -> JoinHandle<Result<()>> {
        let cache = Arc::clone(self);
        tokio::spawn(async move { cache.clear().await })
    }

    // -------------------------------------------------------------------------
    // Locking
    // -------------------------------------------------------------------------

    pub async fn lock(&self, key: &str, timeout: Duration) -> Result<(bool, LockHandle)> {
        self.ensure_open()?;
        self.strategy.lock(key, timeout).await
    }

    /// Release a lock held under `lock`.
    pub async fn unlock(&self, key: &str, lock: &LockHandle) -> Result<()> {
        self.ensure_open()?;
        self.strategy.unlock(key, lock.lock_id()).await
    }

    /// Release whatever lock is on `key`.
    pub async fn force_unlock(&self, key: &str) -> Result<()> {
        self.ensure_open()?;
        self.strategy.unlock(key, None).await
    }

    pub async fn is_locked(&self, key: &str) -> Result<(bool, LockHandle)> {
        self.ensure_open()?;
        self.strategy.is_locked(key).await
    }

    // -------------------------------------------------------------------------
    // Tags and groups
    // -------------------------------------------------------------------------

    pub async fn get_by_tags(&self, tags: &[Tag], mode: TagMatch) -> Result<HashMap<String, CacheValue>> {
        self.ensure_open()?;
        let entries = self.strategy.get_by_tags(tags, mode).await?;
        self.decode_all(entries)
    }

    pub async fn get_keys_by_tags(&self, tags: &[Tag], mode: TagMatch) -> Result<Vec<String>> {
        self.ensure_open()?;
        self.strategy.get_keys_by_tags(tags, mode).await
    }

    pub async fn remove_by_tags(&self, tags: &[Tag], mode: TagMatch) -> Result<()> {
        self.ensure_open()?;
        self.strategy.remove_by_tags(tags, mode).await
    }

    pub async fn get_group_data(&self, group: &str, sub_group: Option<&str>) -> Result<HashMap<String, CacheValue>> {
        self.ensure_open()?;
        let entries = self.strategy.get_group_data(group, sub_group).await?;
        self.decode_all(entries)
    }

    pub async fn get_group_keys(&self, group: &str, sub_group: Option<&str>) -> Result<Vec<String>> {
        self.ensure_open()?;
        self.strategy.get_group_keys(group, sub_group).await
    }

    pub async fn remove_group(&self, group: &str, sub_group: Option<&str>) -> Result<()> {
        self.ensure_open()?;
        self.strategy.remove_group(group, sub_group).await
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub async fn search(&self, query: &str, params: &QueryParams) -> Result<QueryResultSet> {
        self.ensure_open()?;
        self.strategy.search(query, params).await
    }

    pub async fn search_entries(&self, query: &str, params: &QueryParams) -> Result<QueryResultSet> {
        self.ensure_open()?;
        self.strategy.search_entries(query, params).await
    }

    /// Open a reader; `chunk_size` 0 uses the configured default.
    pub async fn execute_reader(
        &self,
        query: &str,
        params: &QueryParams,
        get_data: bool,
        chunk_size: usize,
    ) -> Result<DistributedReader> {
        self.ensure_open()?;
        self.strategy
            .execute_reader(query, params, get_data, chunk_size)
            .await
    }

    pub async fn remove_by_query(&self, query: &str, params: &QueryParams) -> Result<u64> {
        self.ensure_open()?;
        self.strategy.remove_by_query(query, params).await
    }

    fn track(&self, cq: &Arc<ContinuousQuery>, server_id: Option<String>) {
        if let Some(id) = server_id {
            cq.set_server_id(Some(id.clone()));
            self.events.track_query(id, Arc::clone(cq));
        }
    }

    /// Register a continuous query; its subscribers start receiving events.
    pub async fn register_cq(&self, cq: &Arc<ContinuousQuery>) -> Result<String> {
        self.ensure_open()?;
        let registration = CqRegistration::from(cq.as_ref());
        let id = self.strategy.register_cq(&registration).await?;
        self.track(cq, Some(id.clone()));
        debug!(cache = %self.name, query = %cq.query(), server_id = %id, "Continuous query registered");
        Ok(id)
    }

    /// Search and register `cq` in one round.
    pub async fn search_cq(&self, cq: &Arc<ContinuousQuery>, with_values: bool) -> Result<QueryResultSet> {
        self.ensure_open()?;
        let registration = CqRegistration::from(cq.as_ref());
        let result = if with_values {
            self.strategy.search_entries_cq(&registration).await?
        } else {
            self.strategy.search_cq(&registration).await?
        };
        self.track(cq, result.query_id.clone());
        Ok(result)
    }

    pub async fn execute_reader_cq(
        &self,
        cq: &Arc<ContinuousQuery>,
        get_data: bool,
        chunk_size: usize,
    ) -> Result<DistributedReader> {
        self.ensure_open()?;
        let registration = CqRegistration::from(cq.as_ref());
        let reader = self
            .strategy
            .execute_reader_cq(&registration, get_data, chunk_size)
            .await?;
        self.track(cq, reader.query_id().map(str::to_string));
        Ok(reader)
    }

    pub async fn unregister_cq(&self, cq: &ContinuousQuery) -> Result<()> {
        self.ensure_open()?;
        let Some(id) = cq.server_id() else {
            return Ok(());
        };
        self.strategy.unregister_cq(&id).await?;
        self.events.untrack_query(&id);
        cq.set_server_id(None);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Notifications
    // -------------------------------------------------------------------------

    /// Subscribe to cache-wide events of `types`.
    pub async fn register_cache_notification<F>(
        &self,
        types: EventTypes,
        filter: EventDataFilter,
        handler: F,
    ) -> Result<SubscriptionHandle>
    where
        F: Fn(&CacheEvent) + Send + Sync + 'static,
    {
        self.ensure_open()?;
        let (handle, sequence) = self.events.add_general(types, filter, handler);
        let (all, max_filter) = self.events.general_registration();
        if let Err(e) = self
            .strategy
            .register_general_notification(all, max_filter, sequence)
            .await
        {
            self.events.remove_general(handle);
            return Err(e);
        }
        Ok(handle)
    }

    /// Drop a cache-wide subscription. Returns false for an unknown handle.
    pub async fn unregister_cache_notification(&self, handle: SubscriptionHandle) -> Result<bool> {
        self.ensure_open()?;
        let Some((types, sequence)) = self.events.remove_general(handle) else {
            return Ok(false);
        };
        let (remaining, _) = self.events.general_registration();
        let gone = types
            .iter()
            .filter(|t| !remaining.includes(*t))
            .fold(EventTypes::empty(), |acc, t| acc | t.as_set());
        if !gone.is_empty() {
            self.strategy
                .unregister_general_notification(gone, sequence)
                .await?;
        }
        Ok(true)
    }

    /// Subscribe to events raised with [`Cache::raise_custom_event`].
    pub async fn register_custom_event<F>(&self, handler: F) -> Result<SubscriptionHandle>
    where
        F: Fn(&CacheEvent) + Send + Sync + 'static,
    {
        self.register_cache_notification(EventTypes::CUSTOM, EventDataFilter::None, handler)
            .await
    }

    /// Be told when the cache is cleared.
    pub async fn register_clear_event<F>(&self, handler: F) -> Result<SubscriptionHandle>
    where
        F: Fn(&CacheEvent) + Send + Sync + 'static,
    {
        self.register_cache_notification(EventTypes::CLEARED, EventDataFilter::None, handler)
            .await
    }

    pub async fn raise_custom_event(&self, notif_id: impl Into<Bytes>, data: impl Into<Bytes>) -> Result<()> {
        self.ensure_open()?;
        self.strategy
            .raise_custom_event(notif_id.into(), data.into())
            .await
    }

    /// Watch `key` for the event kinds in `types` (updated and/or removed).
    ///
    /// `notify_on_expiration` decides whether an expiry counts as a removal
    /// for this callback.
    pub async fn register_key_notification(
        &self,
        key: &str,
        types: EventTypes,
        callback: ItemCallback,
        notify_on_expiration: bool,
    ) -> Result<ItemCallbackIds> {
        self.ensure_open()?;
        if types.is_empty() || !(EventTypes::UPDATED | EventTypes::REMOVED).contains(types) {
            return Err(Error::InvalidArgument(
                "key notifications support updated and removed events only".into(),
            ));
        }
        let filter = callback.filter;
        let id = self.events.register_item_callback(callback);
        let ids = ItemCallbackIds {
            on_update: types.contains(EventTypes::UPDATED).then_some(id),
            on_remove: types.contains(EventTypes::REMOVED).then_some(id),
            filter,
            notify_on_expiration,
        };
        if let Err(e) = self.strategy.register_key_notification(key, &ids).await {
            self.events.unregister_item_callback(id);
            return Err(e);
        }
        Ok(ids)
    }

    pub async fn unregister_key_notification(&self, key: &str, ids: &ItemCallbackIds) -> Result<()> {
        self.ensure_open()?;
        self.strategy.unregister_key_notification(key, ids).await?;
        self.release_callbacks(ids);
        Ok(())
    }

    /// Keys changed since the last poll.
    pub async fn poll(&self) -> Result<PollResult> {
        self.ensure_open()?;
        self.strategy.poll().await
    }

    // -------------------------------------------------------------------------
    // Streams and topics
    // -------------------------------------------------------------------------

    pub async fn open_stream(&self, key: &str, mode: StreamMode) -> Result<CacheStream> {
        self.open_stream_with(key, mode, &StreamOptions::default()).await
    }

    pub async fn open_stream_with(&self, key: &str, mode: StreamMode, opts: &StreamOptions) -> Result<CacheStream> {
        self.ensure_open()?;
        let handle = self.strategy.open_stream(key, mode, opts).await?;
        Ok(CacheStream::new(
            Arc::clone(&self.strategy),
            key.to_string(),
            handle,
            mode,
        ))
    }

    /// Existing topic, or `None`.
    pub async fn topic(&self, name: &str) -> Result<Option<Topic>> {
        self.ensure_open()?;
        let exists = self
            .strategy
            .get_or_create_topic(name, TopicOperation::Get)
            .await?;
        Ok(exists.then(|| self.topic_handle(name)))
    }

    pub async fn create_topic(&self, name: &str) -> Result<Topic> {
        self.ensure_open()?;
        self.strategy
            .get_or_create_topic(name, TopicOperation::Create)
            .await?;
        Ok(self.topic_handle(name))
    }

    fn topic_handle(&self, name: &str) -> Topic {
        Topic::new(name.to_string(), Arc::clone(&self.strategy), Arc::clone(&self.events))
    }

    // -------------------------------------------------------------------------
    // Processing
    // -------------------------------------------------------------------------

    pub async fn invoke_entry_processor(
        &self,
        keys: &[String],
        processor: &str,
        args: &[serde_json::Value],
    ) -> Result<HashMap<String, ProcessorOutcome>> {
        self.ensure_open()?;
        self.strategy
            .invoke_entry_processor(keys, processor, args, OperationFlags::empty())
            .await
    }

    pub async fn execute_map_reduce(&self, task: &MapReduceTask) -> Result<String> {
        self.ensure_open()?;
        self.strategy.execute_map_reduce(task).await
    }

    pub async fn connected_clients(&self) -> Result<Vec<ClientInfo>> {
        self.ensure_open()?;
        self.strategy.get_connected_clients().await
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        if !self.is_disposed() {
            warn!(cache = %self.name, "Cache dropped without being closed");
        }
    }
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("name", &self.name)
            .field("strategy", &self.strategy_name())
            .field("disposed", &self.is_disposed())
            .field("events", &self.events)
            .finish()
    }
}
