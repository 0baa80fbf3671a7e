//! Domain Ports
//!
//! The operation contract shared by every cache strategy, plus the
//! collaborators the strategies are built on.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Cache (facade)                         │
//! │                 holds Arc<dyn CacheStrategy>                 │
//! └─────────────────────────────────────────────────────────────┘
//!                 │                               │
//!                 ▼                               ▼
//! ┌───────────────────────────┐   ┌───────────────────────────────┐
//! │  InprocCache              │   │  RemoteCache                  │
//! │  └── dyn CacheEngine      │   │  └── dyn Broker (+ KeyRouter) │
//! └───────────────────────────┘   └───────────────────────────────┘
//! ```
//!
//! Every contract method has a provided body: data operations report
//! [`Error::Unsupported`], registration toggles succeed without effect. A
//! strategy overrides what it implements.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::events::{EventDataFilter, EventTypes, ItemCallbackIds, Notification, CallbackId};
use super::flags::OperationFlags;
use super::item::{
    CacheItem, CacheValue, Dependency, ExpirationHint, GroupInfo, ItemAttributes, ItemPriority,
    NamedTags, Payload, Tag, TagMatch, ValueEntry,
};
use super::lock::{ItemVersion, LockHandle};
use super::messaging::{
    MessageAcks, OutgoingMessage, ReceivedMessages, SubscriptionInfo, TopicOperation,
};
use super::options::{
    BulkGetResult, BulkWriteResult, ClientInfo, GetOptions, GetResult, MapReduceTask, PollResult,
    ProcessorOutcome, RemoveOptions, StreamMode, StreamOptions, WriteOptions,
};
use super::query::{CqRegistration, QueryParams, QueryResultSet, ReaderChunk};
use crate::error::{Error, Result};
use crate::reader::DistributedReader;
use crate::remote::command::{Request, Response};

// =============================================================================
// Value Objects
// =============================================================================

/// Address of a cache server (`host:port`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServerAddress(pub String);

impl ServerAddress {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ServerAddress {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ServerAddress {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// =============================================================================
// Clock Port
// =============================================================================

/// Monotonic time source, injectable for tests.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> Instant;
}

/// Wall-clock implementation.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Manually advanced clock.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *self.offset.lock()
    }
}

// =============================================================================
// Notification Port
// =============================================================================

/// Receiver for notifications pushed by an engine or broker.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: Notification);
}

// =============================================================================
// Serialization Hooks
// =============================================================================

/// Encode an application value as bytes.
///
/// Byte values pass through marked [`OperationFlags::BINARY_DATA`]; structured
/// values are JSON-encoded and marked [`OperationFlags::SERIALIZED`].
pub fn encode_value(value: CacheValue, flags: &mut OperationFlags) -> Result<Payload> {
    match value {
        CacheValue::Bytes(bytes) => {
            flags.insert(OperationFlags::BINARY_DATA);
            Ok(Payload::Bytes(bytes))
        }
        CacheValue::Json(json) => {
            flags.insert(OperationFlags::SERIALIZED);
            Ok(Payload::Bytes(Bytes::from(serde_json::to_vec(&json)?)))
        }
    }
}

/// Decode a payload produced by [`encode_value`] (after decompression).
///
/// Bytes that fail to parse as JSON are returned raw rather than failing
/// the read.
pub fn decode_value(entry: ValueEntry) -> CacheValue {
    match entry.payload {
        Payload::Native(json) => CacheValue::Json(json),
        Payload::Bytes(bytes) if entry.flags.contains(OperationFlags::SERIALIZED) => {
            match serde_json::from_slice(&bytes) {
                Ok(json) => CacheValue::Json(json),
                Err(e) => {
                    tracing::debug!("Payload is not valid JSON, returning raw bytes: {}", e);
                    CacheValue::Bytes(bytes)
                }
            }
        }
        Payload::Bytes(bytes) => CacheValue::Bytes(bytes),
    }
}

// =============================================================================
// Operation Contract
// =============================================================================

/// The operation set every cache strategy exposes.
#[async_trait]
pub trait CacheStrategy: Send + Sync {
    /// Cache name.
    fn name(&self) -> &str;

    /// Strategy name used in diagnostics.
    fn strategy_name(&self) -> &'static str {
        "base"
    }

    /// Identity this client presents to the cache.
    fn client_info(&self) -> ClientInfo;

    async fn count(&self) -> Result<u64> {
        Err(Error::unsupported("count", self.strategy_name()))
    }

    /// Release resources held by the strategy.
    async fn dispose(&self) -> Result<()> {
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Serialization
    // -------------------------------------------------------------------------

    fn safe_serialize(&self, value: CacheValue, flags: &mut OperationFlags) -> Result<Payload> {
        encode_value(value, flags)
    }

    fn safe_deserialize(&self, entry: ValueEntry) -> Result<CacheValue> {
        Ok(decode_value(entry))
    }

    // -------------------------------------------------------------------------
    // CRUD
    // -------------------------------------------------------------------------

    async fn add(&self, _key: &str, _item: &CacheItem, _opts: &WriteOptions) -> Result<ItemVersion> {
        Err(Error::unsupported("add", self.strategy_name()))
    }

    async fn add_bulk(
        &self,
        _keys: &[String],
        _items: &[CacheItem],
        _opts: &WriteOptions,
    ) -> Result<BulkWriteResult> {
        Err(Error::unsupported("add_bulk", self.strategy_name()))
    }

    async fn insert(&self, _key: &str, _item: &CacheItem, _opts: &WriteOptions) -> Result<ItemVersion> {
        Err(Error::unsupported("insert", self.strategy_name()))
    }

    async fn insert_bulk(
        &self,
        _keys: &[String],
        _items: &[CacheItem],
        _opts: &WriteOptions,
    ) -> Result<BulkWriteResult> {
        Err(Error::unsupported("insert_bulk", self.strategy_name()))
    }

    async fn get(&self, _key: &str, _opts: &GetOptions) -> Result<GetResult> {
        Err(Error::unsupported("get", self.strategy_name()))
    }

    async fn get_bulk(&self, _keys: &[String], _flags: OperationFlags) -> Result<BulkGetResult> {
        Err(Error::unsupported("get_bulk", self.strategy_name()))
    }

    async fn get_cache_item(&self, _key: &str, _opts: &GetOptions) -> Result<Option<CacheItem>> {
        Err(Error::unsupported("get_cache_item", self.strategy_name()))
    }

    async fn get_cache_item_bulk(
        &self,
        _keys: &[String],
        _flags: OperationFlags,
    ) -> Result<HashMap<String, CacheItem>> {
        Err(Error::unsupported("get_cache_item_bulk", self.strategy_name()))
    }

    async fn remove(&self, _key: &str, _opts: &RemoveOptions) -> Result<Option<ValueEntry>> {
        Err(Error::unsupported("remove", self.strategy_name()))
    }

    async fn delete(&self, _key: &str, _opts: &RemoveOptions) -> Result<()> {
        Err(Error::unsupported("delete", self.strategy_name()))
    }

    async fn remove_bulk(
        &self,
        _keys: &[String],
        _opts: &RemoveOptions,
    ) -> Result<HashMap<String, ValueEntry>> {
        Err(Error::unsupported("remove_bulk", self.strategy_name()))
    }

    async fn delete_bulk(&self, _keys: &[String], _opts: &RemoveOptions) -> Result<()> {
        Err(Error::unsupported("delete_bulk", self.strategy_name()))
    }

    async fn remove_group(&self, _group: &str, _sub_group: Option<&str>) -> Result<()> {
        Err(Error::unsupported("remove_group", self.strategy_name()))
    }

    async fn contains(&self, key: &str) -> Result<bool> {
        let found = self.contains_bulk(&[key.to_string()]).await?;
        Ok(found.get(key).copied().unwrap_or(false))
    }

    async fn contains_bulk(&self, _keys: &[String]) -> Result<HashMap<String, bool>> {
        Err(Error::unsupported("contains_bulk", self.strategy_name()))
    }

    async fn clear(&self, _flags: OperationFlags) -> Result<()> {
        Err(Error::unsupported("clear", self.strategy_name()))
    }

    async fn set_attributes(&self, _key: &str, _attrs: &ItemAttributes) -> Result<bool> {
        Err(Error::unsupported("set_attributes", self.strategy_name()))
    }

    async fn touch(&self, _keys: &[String]) -> Result<()> {
        Err(Error::unsupported("touch", self.strategy_name()))
    }

    // -------------------------------------------------------------------------
    // Locking
    // -------------------------------------------------------------------------

    async fn lock(&self, _key: &str, _timeout: Duration) -> Result<(bool, LockHandle)> {
        Err(Error::unsupported("lock", self.strategy_name()))
    }

    async fn unlock(&self, _key: &str, _lock_id: Option<&str>) -> Result<()> {
        Err(Error::unsupported("unlock", self.strategy_name()))
    }

    async fn is_locked(&self, _key: &str) -> Result<(bool, LockHandle)> {
        Err(Error::unsupported("is_locked", self.strategy_name()))
    }

    // -------------------------------------------------------------------------
    // Tags and Groups
    // -------------------------------------------------------------------------

    async fn get_by_tags(&self, _tags: &[Tag], _mode: TagMatch) -> Result<HashMap<String, ValueEntry>> {
        Err(Error::unsupported("get_by_tags", self.strategy_name()))
    }

    async fn get_keys_by_tags(&self, _tags: &[Tag], _mode: TagMatch) -> Result<Vec<String>> {
        Err(Error::unsupported("get_keys_by_tags", self.strategy_name()))
    }

    async fn remove_by_tags(&self, _tags: &[Tag], _mode: TagMatch) -> Result<()> {
        Err(Error::unsupported("remove_by_tags", self.strategy_name()))
    }

    async fn get_group_data(
        &self,
        _group: &str,
        _sub_group: Option<&str>,
    ) -> Result<HashMap<String, ValueEntry>> {
        Err(Error::unsupported("get_group_data", self.strategy_name()))
    }

    async fn get_group_keys(&self, _group: &str, _sub_group: Option<&str>) -> Result<Vec<String>> {
        Err(Error::unsupported("get_group_keys", self.strategy_name()))
    }

    // -------------------------------------------------------------------------
    // Query
    // -------------------------------------------------------------------------

    async fn search(&self, _query: &str, _params: &QueryParams) -> Result<QueryResultSet> {
        Err(Error::unsupported("search", self.strategy_name()))
    }

    async fn search_entries(&self, _query: &str, _params: &QueryParams) -> Result<QueryResultSet> {
        Err(Error::unsupported("search_entries", self.strategy_name()))
    }

    /// Search and register a continuous query in one call.
    async fn search_cq(&self, _cq: &CqRegistration) -> Result<QueryResultSet> {
        Err(Error::unsupported("search_cq", self.strategy_name()))
    }

    async fn search_entries_cq(&self, _cq: &CqRegistration) -> Result<QueryResultSet> {
        Err(Error::unsupported("search_entries_cq", self.strategy_name()))
    }

    async fn execute_reader(
        &self,
        _query: &str,
        _params: &QueryParams,
        _get_data: bool,
        _chunk_size: usize,
    ) -> Result<DistributedReader> {
        Err(Error::unsupported("execute_reader", self.strategy_name()))
    }

    /// Open a reader and register a continuous query; the reader carries the
    /// assigned query id.
    async fn execute_reader_cq(
        &self,
        _cq: &CqRegistration,
        _get_data: bool,
        _chunk_size: usize,
    ) -> Result<DistributedReader> {
        Err(Error::unsupported("execute_reader_cq", self.strategy_name()))
    }

    /// Register a continuous query, returning the assigned id.
    async fn register_cq(&self, _cq: &CqRegistration) -> Result<String> {
        Err(Error::unsupported("register_cq", self.strategy_name()))
    }

    async fn unregister_cq(&self, _server_id: &str) -> Result<()> {
        Err(Error::unsupported("unregister_cq", self.strategy_name()))
    }

    async fn remove_by_query(&self, _query: &str, _params: &QueryParams) -> Result<u64> {
        Err(Error::unsupported("remove_by_query", self.strategy_name()))
    }

    // -------------------------------------------------------------------------
    // Streams
    // -------------------------------------------------------------------------

    /// Open a stream over a blob item, returning its stream handle.
    async fn open_stream(
        &self,
        _key: &str,
        _mode: StreamMode,
        _opts: &StreamOptions,
    ) -> Result<String> {
        Err(Error::unsupported("open_stream", self.strategy_name()))
    }

    async fn close_stream(&self, _key: &str, _handle: &str) -> Result<()> {
        Err(Error::unsupported("close_stream", self.strategy_name()))
    }

    async fn read_from_stream(
        &self,
        _key: &str,
        _handle: &str,
        _offset: u64,
        _length: usize,
    ) -> Result<Bytes> {
        Err(Error::unsupported("read_from_stream", self.strategy_name()))
    }

    async fn write_to_stream(&self, _key: &str, _handle: &str, _offset: u64, _data: Bytes) -> Result<()> {
        Err(Error::unsupported("write_to_stream", self.strategy_name()))
    }

    async fn get_stream_length(&self, _key: &str, _handle: &str) -> Result<u64> {
        Err(Error::unsupported("get_stream_length", self.strategy_name()))
    }

    // -------------------------------------------------------------------------
    // Notifications
    // -------------------------------------------------------------------------

    async fn register_key_notification(&self, _key: &str, _ids: &ItemCallbackIds) -> Result<()> {
        Ok(())
    }

    async fn unregister_key_notification(&self, _key: &str, _ids: &ItemCallbackIds) -> Result<()> {
        Ok(())
    }

    async fn register_bulk_key_notification(&self, _keys: &[String], _ids: &ItemCallbackIds) -> Result<()> {
        Ok(())
    }

    async fn unregister_bulk_key_notification(
        &self,
        _keys: &[String],
        _ids: &ItemCallbackIds,
    ) -> Result<()> {
        Ok(())
    }

    /// Register cache-wide events. `sequence` increases with every change to
    /// the client's registration set.
    async fn register_general_notification(
        &self,
        _types: EventTypes,
        _filter: EventDataFilter,
        _sequence: u64,
    ) -> Result<()> {
        Ok(())
    }

    async fn unregister_general_notification(&self, _types: EventTypes, _sequence: u64) -> Result<()> {
        Ok(())
    }

    async fn raise_custom_event(&self, _notif_id: Bytes, _data: Bytes) -> Result<()> {
        Err(Error::unsupported("raise_custom_event", self.strategy_name()))
    }

    async fn register_polling_notification(&self, _callback: CallbackId) -> Result<()> {
        Ok(())
    }

    async fn poll(&self) -> Result<PollResult> {
        Err(Error::unsupported("poll", self.strategy_name()))
    }

    // -------------------------------------------------------------------------
    // Pub/Sub
    // -------------------------------------------------------------------------

    /// Look up or create a topic; returns whether it exists afterwards.
    async fn get_or_create_topic(&self, _name: &str, _op: TopicOperation) -> Result<bool> {
        Err(Error::unsupported("get_or_create_topic", self.strategy_name()))
    }

    async fn remove_topic(&self, _name: &str, _forcefully: bool) -> Result<()> {
        Err(Error::unsupported("remove_topic", self.strategy_name()))
    }

    async fn subscribe(&self, _subscription: &SubscriptionInfo) -> Result<()> {
        Err(Error::unsupported("subscribe", self.strategy_name()))
    }

    async fn unsubscribe(&self, _subscription: &SubscriptionInfo) -> Result<()> {
        Err(Error::unsupported("unsubscribe", self.strategy_name()))
    }

    async fn publish_message(&self, _message: &OutgoingMessage, _flags: OperationFlags) -> Result<()> {
        Err(Error::unsupported("publish_message", self.strategy_name()))
    }

    async fn get_message_count(&self, _topic: &str) -> Result<u64> {
        Err(Error::unsupported("get_message_count", self.strategy_name()))
    }

    /// Pull pending messages for a subscriber.
    async fn get_messages(&self, _subscriber_id: &str) -> Result<ReceivedMessages> {
        Err(Error::unsupported("get_messages", self.strategy_name()))
    }

    async fn acknowledge_message_receipt(&self, _acks: &MessageAcks) -> Result<()> {
        Err(Error::unsupported("acknowledge_message_receipt", self.strategy_name()))
    }

    // -------------------------------------------------------------------------
    // Processing
    // -------------------------------------------------------------------------

    async fn invoke_entry_processor(
        &self,
        _keys: &[String],
        _processor: &str,
        _args: &[serde_json::Value],
        _flags: OperationFlags,
    ) -> Result<HashMap<String, ProcessorOutcome>> {
        Err(Error::unsupported("invoke_entry_processor", self.strategy_name()))
    }

    /// Submit a MapReduce task, returning its task id.
    async fn execute_map_reduce(&self, _task: &MapReduceTask) -> Result<String> {
        Err(Error::unsupported("execute_map_reduce", self.strategy_name()))
    }

    async fn get_connected_clients(&self) -> Result<Vec<ClientInfo>> {
        Err(Error::unsupported("get_connected_clients", self.strategy_name()))
    }
}

// =============================================================================
// Broker Port
// =============================================================================

/// Client-held view of which server owns which key.
pub trait KeyRouter: Send + Sync {
    /// Owner of `key`, or `None` when no distribution map is held.
    fn key_owner(&self, key: &str) -> Option<ServerAddress>;

    /// Whether a connection to `server` is currently up.
    fn is_connected(&self, server: &ServerAddress) -> bool;

    /// A connected server chosen by load, used for dedicated and fallback
    /// requests.
    fn load_balanced_server(&self) -> Option<ServerAddress>;
}

/// Events raised by the broker outside of request execution.
pub trait BrokerListener: Send + Sync {
    /// A server connection dropped.
    fn connection_lost(&self, server: &ServerAddress);

    /// A notification arrived from a server.
    fn notification(&self, notification: Notification);

    /// A dropped connection was re-established.
    fn connection_restored(&self, _server: &ServerAddress) {}
}

/// Request/response channel to a clustered cache.
///
/// Framing, connection pooling and command encoding live behind this trait.
/// The broker is expected to fail a request with [`Error::Timeout`] once the
/// request's timeout elapses.
#[async_trait]
pub trait Broker: KeyRouter {
    /// Whether the client holds a usable key distribution map.
    fn has_distribution_map(&self) -> bool;

    /// Last cluster view id this client observed.
    fn client_last_view_id(&self) -> u64;

    /// Servers with a live connection.
    fn connected_servers(&self) -> Vec<ServerAddress>;

    /// Install the listener for connection and notification events.
    fn set_listener(&self, _listener: Weak<dyn BrokerListener>) {}

    /// Execute a request and collect one response per command.
    async fn execute(&self, request: Request) -> Result<Response>;

    async fn dispose(&self) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Engine Port
// =============================================================================

/// How an engine write or read treats an existing lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockExpectation {
    /// Fail if locked
    Respect,
    /// Skip lock checks
    Ignore,
    /// Require this lock id; optionally release it afterwards
    Match { lock_id: String, release: bool },
}

/// An item in the engine's own terms.
#[derive(Debug, Clone)]
pub struct EngineEntry {
    pub value: ValueEntry,
    pub expiration: ExpirationHint,
    pub priority: ItemPriority,
    pub group: Option<GroupInfo>,
    pub tags: Vec<Tag>,
    pub named_tags: NamedTags,
    pub dependency: Option<Dependency>,
    pub callbacks: ItemCallbackIds,
    pub resync_provider: Option<String>,
}

/// Stored entry with its bookkeeping.
#[derive(Debug, Clone)]
pub struct EngineRecord {
    pub entry: EngineEntry,
    pub version: ItemVersion,
    pub created_at: DateTime<Utc>,
}

/// Write in the engine's terms.
#[derive(Debug, Clone)]
pub struct EngineWrite {
    pub lock: LockExpectation,
    pub version: Option<ItemVersion>,
    pub flags: OperationFlags,
}

/// Read in the engine's terms.
#[derive(Debug, Clone)]
pub struct EngineRead {
    pub lock: LockExpectation,
    /// Acquire a lock for this duration while reading
    pub acquire: Option<Duration>,
    pub group: Option<GroupInfo>,
    pub newer_than: Option<ItemVersion>,
}

/// Query row source produced by an engine reader.
#[derive(Debug, Clone)]
pub struct EngineReader {
    pub first_chunk: ReaderChunk,
}

/// An in-process cache engine.
///
/// Calls are synchronous; the engine is reliable and local.
pub trait CacheEngine: Send + Sync {
    fn name(&self) -> &str;
    fn count(&self) -> u64;
    fn set_listener(&self, listener: Weak<dyn NotificationSink>);

    fn add(&self, key: &str, entry: EngineEntry, write: &EngineWrite) -> Result<ItemVersion>;
    fn insert(&self, key: &str, entry: EngineEntry, write: &EngineWrite) -> Result<ItemVersion>;
    /// Returns the record and lock state after the read.
    fn get(&self, key: &str, read: &EngineRead) -> Result<(Option<EngineRecord>, LockHandle)>;
    fn remove(&self, key: &str, write: &EngineWrite) -> Result<Option<ValueEntry>>;
    fn contains(&self, key: &str) -> bool;
    fn clear(&self);
    fn set_absolute_expiration(&self, key: &str, at: DateTime<Utc>) -> bool;
    fn touch(&self, key: &str) -> bool;

    fn lock(&self, key: &str, timeout: Duration) -> (bool, LockHandle);
    fn unlock(&self, key: &str, lock_id: Option<&str>) -> Result<()>;
    fn is_locked(&self, key: &str) -> (bool, LockHandle);

    fn keys_by_tags(&self, tags: &[Tag], mode: TagMatch) -> Vec<String>;
    fn keys_in_group(&self, group: &str, sub_group: Option<&str>) -> Vec<String>;

    fn search(&self, query: &str, params: &QueryParams, with_values: bool) -> Result<QueryResultSet>;
    fn open_reader(
        &self,
        query: &str,
        params: &QueryParams,
        get_data: bool,
        chunk_size: usize,
    ) -> Result<EngineReader>;
    fn reader_chunk(&self, reader_id: &str, next_index: u64, chunk_size: usize) -> Result<ReaderChunk>;
    fn dispose_reader(&self, reader_id: &str);
    /// Remove every item matched by a `DELETE` query; returns how many.
    fn remove_by_query(&self, query: &str, params: &QueryParams) -> Result<u64>;
    fn register_cq(&self, registration: &CqRegistration) -> Result<String>;
    fn unregister_cq(&self, server_id: &str);

    fn open_stream(&self, key: &str, mode: StreamMode, opts: &StreamOptions) -> Result<String>;
    fn close_stream(&self, key: &str, handle: &str) -> Result<()>;
    fn read_stream(&self, key: &str, handle: &str, offset: u64, length: usize) -> Result<Bytes>;
    fn write_stream(&self, key: &str, handle: &str, offset: u64, data: &[u8]) -> Result<()>;
    fn stream_length(&self, key: &str, handle: &str) -> Result<u64>;

    fn register_key_callbacks(&self, key: &str, ids: &ItemCallbackIds);
    fn unregister_key_callbacks(&self, key: &str, ids: &ItemCallbackIds);
    fn register_general(&self, types: EventTypes, filter: EventDataFilter);
    fn unregister_general(&self, types: EventTypes);
    fn raise_custom_event(&self, notif_id: Bytes, data: Bytes);

    fn create_topic(&self, name: &str, op: TopicOperation) -> bool;
    fn remove_topic(&self, name: &str, forcefully: bool) -> Result<()>;
    fn subscribe(&self, subscription: &SubscriptionInfo) -> Result<()>;
    fn unsubscribe(&self, subscription: &SubscriptionInfo) -> Result<()>;
    fn publish(&self, message: &OutgoingMessage) -> Result<()>;
    fn message_count(&self, topic: &str) -> Result<u64>;
    fn pull_messages(&self, subscriber_id: &str) -> ReceivedMessages;
    fn acknowledge(&self, acks: &MessageAcks);

    /// Entry processors are executed by the engine itself when it has one.
    fn invoke_entry_processor(
        &self,
        _keys: &[String],
        _processor: &str,
        _args: &[serde_json::Value],
    ) -> Result<HashMap<String, ProcessorOutcome>> {
        Err(Error::unsupported("invoke_entry_processor", "in-process engine"))
    }

    fn dispose(&self);
}

/// Shared handle to an engine.
pub type SharedEngine = Arc<dyn CacheEngine>;

#[cfg(test)]
mod tests {
    use super::*;

    struct Bare;

    #[async_trait]
    impl CacheStrategy for Bare {
        fn name(&self) -> &str {
            "bare"
        }

        fn client_info(&self) -> ClientInfo {
            ClientInfo::current(Some("test"))
        }
    }

    #[tokio::test]
    async fn test_defaults_report_unsupported() {
        let bare = Bare;
        let err = bare.get("k", &GetOptions::default()).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Unsupported {
                operation: "get",
                strategy: "base"
            }
        ));
        // contains is derived from contains_bulk
        assert!(matches!(
            bare.contains("k").await,
            Err(Error::Unsupported {
                operation: "contains_bulk",
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_default_registrations_are_noops() {
        let bare = Bare;
        bare.register_general_notification(EventTypes::ADDED, EventDataFilter::None, 1)
            .await
            .unwrap();
        bare.register_key_notification("k", &ItemCallbackIds::default())
            .await
            .unwrap();
        bare.dispose().await.unwrap();
    }

    #[test]
    fn test_serialization_hooks() {
        let mut flags = OperationFlags::empty();
        let payload = encode_value(CacheValue::Json(serde_json::json!({"a": 1})), &mut flags).unwrap();
        assert!(flags.contains(OperationFlags::SERIALIZED));

        let value = decode_value(ValueEntry::new(payload, flags));
        assert_eq!(value, CacheValue::Json(serde_json::json!({"a": 1})));

        // bytes marked serialized but not JSON come back raw
        let raw = decode_value(ValueEntry::new(
            Payload::Bytes(Bytes::from_static(b"\xff\x00")),
            OperationFlags::SERIALIZED,
        ));
        assert_eq!(raw, CacheValue::Bytes(Bytes::from_static(b"\xff\x00")));
    }

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new();
        let start = clock.now();
        clock.advance(Duration::from_secs(61));
        assert_eq!(clock.now() - start, Duration::from_secs(61));
    }
}
