//! Abstract commands, requests and responses exchanged with a [`Broker`].
//!
//! These are the logical shapes only; encoding them on the wire is the
//! broker's concern.
//!
//! [`Broker`]: crate::domain::ports::Broker

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;

use super::distribution::ViewIdTag;
use crate::domain::events::{CallbackId, EventDataFilter, EventTypes, ItemCallbackIds};
use crate::domain::flags::OperationFlags;
use crate::domain::item::{CacheItem, ItemAttributes, Tag, TagMatch, ValueEntry};
use crate::domain::lock::LockHandle;
use crate::domain::messaging::{
    MessageAcks, OutgoingMessage, ReceivedMessages, SubscriptionInfo, TopicOperation,
};
use crate::domain::options::{
    BulkGetResult, BulkWriteResult, ClientInfo, GetOptions, GetResult, MapReduceTask, PollResult,
    ProcessorOutcome, RemoveOptions, StreamMode, StreamOptions, WriteOptions,
};
use crate::domain::ports::ServerAddress;
use crate::domain::query::{CqRegistration, QueryParams, QueryResultSet, ReaderChunk};
use crate::error::{Error, Result, ServerFault};

// =============================================================================
// Commands
// =============================================================================

/// A logical cache command.
#[derive(Debug, Clone)]
pub enum Command {
    Add { key: String, item: CacheItem, opts: WriteOptions },
    Insert { key: String, item: CacheItem, opts: WriteOptions },
    BulkAdd { keys: Vec<String>, items: Vec<CacheItem>, opts: WriteOptions },
    BulkInsert { keys: Vec<String>, items: Vec<CacheItem>, opts: WriteOptions },
    Get { key: String, opts: GetOptions },
    BulkGet { keys: Vec<String>, flags: OperationFlags },
    GetCacheItem { key: String, opts: GetOptions },
    BulkGetCacheItem { keys: Vec<String>, flags: OperationFlags },
    Remove { key: String, opts: RemoveOptions },
    Delete { key: String, opts: RemoveOptions },
    BulkRemove { keys: Vec<String>, opts: RemoveOptions },
    BulkDelete { keys: Vec<String>, opts: RemoveOptions },
    RemoveGroup { group: String, sub_group: Option<String> },
    Contains { keys: Vec<String> },
    Clear { flags: OperationFlags },
    Count,
    SetAttributes { key: String, attrs: ItemAttributes },
    Touch { keys: Vec<String> },

    Lock { key: String, timeout: Duration },
    Unlock { key: String, lock_id: Option<String> },
    IsLocked { key: String },

    GetByTags { tags: Vec<Tag>, mode: TagMatch },
    GetKeysByTags { tags: Vec<Tag>, mode: TagMatch },
    RemoveByTags { tags: Vec<Tag>, mode: TagMatch },
    GetGroupData { group: String, sub_group: Option<String> },
    GetGroupKeys { group: String, sub_group: Option<String> },

    Search {
        query: String,
        params: QueryParams,
        with_values: bool,
        cq: Option<CqRegistration>,
    },
    ExecuteReader {
        query: String,
        params: QueryParams,
        get_data: bool,
        chunk_size: usize,
        cq: Option<CqRegistration>,
    },
    GetReaderChunk { reader_id: String, next_index: u64, chunk_size: usize },
    DisposeReader { reader_id: String },
    RegisterCq { registration: CqRegistration },
    UnregisterCq { server_id: String },
    RemoveByQuery { query: String, params: QueryParams },

    OpenStream { key: String, mode: StreamMode, opts: StreamOptions },
    CloseStream { key: String, handle: String },
    ReadStream { key: String, handle: String, offset: u64, length: usize },
    WriteStream { key: String, handle: String, offset: u64, data: Bytes },
    StreamLength { key: String, handle: String },

    RegisterKeyNotification { keys: Vec<String>, ids: ItemCallbackIds },
    UnregisterKeyNotification { keys: Vec<String>, ids: ItemCallbackIds },
    RegisterGeneralNotification { types: EventTypes, filter: EventDataFilter, sequence: u64 },
    UnregisterGeneralNotification { types: EventTypes, sequence: u64 },
    RaiseCustomEvent { notif_id: Bytes, data: Bytes },
    RegisterPolling { callback: CallbackId },
    Poll,

    GetOrCreateTopic { name: String, op: TopicOperation },
    RemoveTopic { name: String, forcefully: bool },
    Subscribe { subscription: SubscriptionInfo },
    Unsubscribe { subscription: SubscriptionInfo },
    Publish { message: OutgoingMessage, flags: OperationFlags },
    MessageCount { topic: String },
    GetMessages { subscriber_id: String },
    AcknowledgeMessages { acks: MessageAcks },

    InvokeEntryProcessor {
        keys: Vec<String>,
        processor: String,
        args: Vec<serde_json::Value>,
        flags: OperationFlags,
    },
    ExecuteMapReduce { task: MapReduceTask },
    GetConnectedClients,
}

impl Command {
    /// Command name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Add { .. } => "add",
            Command::Insert { .. } => "insert",
            Command::BulkAdd { .. } => "bulk-add",
            Command::BulkInsert { .. } => "bulk-insert",
            Command::Get { .. } => "get",
            Command::BulkGet { .. } => "bulk-get",
            Command::GetCacheItem { .. } => "get-cache-item",
            Command::BulkGetCacheItem { .. } => "bulk-get-cache-item",
            Command::Remove { .. } => "remove",
            Command::Delete { .. } => "delete",
            Command::BulkRemove { .. } => "bulk-remove",
            Command::BulkDelete { .. } => "bulk-delete",
            Command::RemoveGroup { .. } => "remove-group",
            Command::Contains { .. } => "contains",
            Command::Clear { .. } => "clear",
            Command::Count => "count",
            Command::SetAttributes { .. } => "set-attributes",
            Command::Touch { .. } => "touch",
            Command::Lock { .. } => "lock",
            Command::Unlock { .. } => "unlock",
            Command::IsLocked { .. } => "is-locked",
            Command::GetByTags { .. } => "get-by-tags",
            Command::GetKeysByTags { .. } => "get-keys-by-tags",
            Command::RemoveByTags { .. } => "remove-by-tags",
            Command::GetGroupData { .. } => "get-group-data",
            Command::GetGroupKeys { .. } => "get-group-keys",
            Command::Search { .. } => "search",
            Command::ExecuteReader { .. } => "execute-reader",
            Command::GetReaderChunk { .. } => "get-reader-chunk",
            Command::DisposeReader { .. } => "dispose-reader",
            Command::RegisterCq { .. } => "register-cq",
            Command::UnregisterCq { .. } => "unregister-cq",
            Command::RemoveByQuery { .. } => "remove-by-query",
            Command::OpenStream { .. } => "open-stream",
            Command::CloseStream { .. } => "close-stream",
            Command::ReadStream { .. } => "read-stream",
            Command::WriteStream { .. } => "write-stream",
            Command::StreamLength { .. } => "stream-length",
            Command::RegisterKeyNotification { .. } => "register-key-notification",
            Command::UnregisterKeyNotification { .. } => "unregister-key-notification",
            Command::RegisterGeneralNotification { .. } => "register-general-notification",
            Command::UnregisterGeneralNotification { .. } => "unregister-general-notification",
            Command::RaiseCustomEvent { .. } => "raise-custom-event",
            Command::RegisterPolling { .. } => "register-polling",
            Command::Poll => "poll",
            Command::GetOrCreateTopic { .. } => "get-or-create-topic",
            Command::RemoveTopic { .. } => "remove-topic",
            Command::Subscribe { .. } => "subscribe",
            Command::Unsubscribe { .. } => "unsubscribe",
            Command::Publish { .. } => "publish",
            Command::MessageCount { .. } => "message-count",
            Command::GetMessages { .. } => "get-messages",
            Command::AcknowledgeMessages { .. } => "acknowledge-messages",
            Command::InvokeEntryProcessor { .. } => "invoke-entry-processor",
            Command::ExecuteMapReduce { .. } => "execute-map-reduce",
            Command::GetConnectedClients => "get-connected-clients",
        }
    }

    /// Keys a bulk command carries.
    pub fn keys(&self) -> Option<&[String]> {
        match self {
            Command::BulkAdd { keys, .. }
            | Command::BulkInsert { keys, .. }
            | Command::BulkGet { keys, .. }
            | Command::BulkGetCacheItem { keys, .. }
            | Command::BulkRemove { keys, .. }
            | Command::BulkDelete { keys, .. }
            | Command::Contains { keys }
            | Command::Touch { keys }
            | Command::RegisterKeyNotification { keys, .. }
            | Command::UnregisterKeyNotification { keys, .. }
            | Command::InvokeEntryProcessor { keys, .. } => Some(keys),
            _ => None,
        }
    }
}

// =============================================================================
// Requests
// =============================================================================

/// Connection class a request is sent on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routing {
    /// Shared connection pool
    Pooled,
    /// Dedicated, non-pooled connection
    Dedicated,
}

/// Where a command goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Server owning this key
    KeyOwner(String),
    /// A specific server
    Server(ServerAddress),
    /// Broker's choice
    Any,
}

/// A command bound to its target and view id.
#[derive(Debug, Clone)]
pub struct TargetedCommand {
    pub target: Target,
    pub view: ViewIdTag,
    pub command: Command,
}

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// One or more commands executed together.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: u64,
    pub routing: Routing,
    pub timeout: Duration,
    pub commands: Vec<TargetedCommand>,
}

impl Request {
    pub fn new(routing: Routing, timeout: Duration, commands: Vec<TargetedCommand>) -> Self {
        Self {
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            routing,
            timeout,
            commands,
        }
    }

    /// Single pooled command.
    pub fn pooled(command: Command, target: Target, view: ViewIdTag, timeout: Duration) -> Self {
        Self::new(
            Routing::Pooled,
            timeout,
            vec![TargetedCommand {
                target,
                view,
                command,
            }],
        )
    }

    /// Single command on a dedicated connection to `server`, presenting the
    /// forced view id.
    pub fn dedicated(command: Command, server: ServerAddress, timeout: Duration) -> Self {
        Self::new(
            Routing::Dedicated,
            timeout,
            vec![TargetedCommand {
                target: Target::Server(server),
                view: ViewIdTag::Forced,
                command,
            }],
        )
    }

    pub fn is_bulk(&self) -> bool {
        self.commands.len() > 1
    }

    /// Name of the first command, for logs.
    pub fn name(&self) -> &'static str {
        self.commands.first().map(|c| c.command.name()).unwrap_or("empty")
    }
}

// =============================================================================
// Responses
// =============================================================================

/// Decoded body of a successful command.
#[derive(Debug, Clone)]
pub enum ResponseBody {
    Empty,
    Version(crate::domain::lock::ItemVersion),
    BulkWrite(BulkWriteResult),
    Value(GetResult),
    BulkValues(BulkGetResult),
    Item(Box<Option<CacheItem>>),
    Items(HashMap<String, CacheItem>),
    Removed(Option<ValueEntry>),
    RemovedBulk(HashMap<String, ValueEntry>),
    Found(HashMap<String, bool>),
    Count(u64),
    Bool(bool),
    Lock { acquired: bool, lock: LockHandle },
    Keys(Vec<String>),
    Entries(HashMap<String, ValueEntry>),
    Query(QueryResultSet),
    Reader(ReaderChunk),
    /// First chunk of a reader opened together with a continuous query
    CqReader { chunk: ReaderChunk, query_id: String },
    QueryId(String),
    StreamHandle(String),
    StreamData(Bytes),
    Poll(PollResult),
    Messages(ReceivedMessages),
    Processed(HashMap<String, ProcessorOutcome>),
    TaskId(String),
    Clients(Vec<ClientInfo>),
}

impl ResponseBody {
    pub fn kind(&self) -> &'static str {
        match self {
            ResponseBody::Empty => "empty",
            ResponseBody::Version(_) => "version",
            ResponseBody::BulkWrite(_) => "bulk-write",
            ResponseBody::Value(_) => "value",
            ResponseBody::BulkValues(_) => "bulk-values",
            ResponseBody::Item(_) => "item",
            ResponseBody::Items(_) => "items",
            ResponseBody::Removed(_) => "removed",
            ResponseBody::RemovedBulk(_) => "removed-bulk",
            ResponseBody::Found(_) => "found",
            ResponseBody::Count(_) => "count",
            ResponseBody::Bool(_) => "bool",
            ResponseBody::Lock { .. } => "lock",
            ResponseBody::Keys(_) => "keys",
            ResponseBody::Entries(_) => "entries",
            ResponseBody::Query(_) => "query",
            ResponseBody::Reader(_) => "reader",
            ResponseBody::CqReader { .. } => "cq-reader",
            ResponseBody::QueryId(_) => "query-id",
            ResponseBody::StreamHandle(_) => "stream-handle",
            ResponseBody::StreamData(_) => "stream-data",
            ResponseBody::Poll(_) => "poll",
            ResponseBody::Messages(_) => "messages",
            ResponseBody::Processed(_) => "processed",
            ResponseBody::TaskId(_) => "task-id",
            ResponseBody::Clients(_) => "clients",
        }
    }
}

/// Response to one command of a request.
#[derive(Debug, Clone)]
pub struct CommandResponse {
    pub server: ServerAddress,
    pub result: std::result::Result<ResponseBody, ServerFault>,
}

impl CommandResponse {
    pub fn ok(server: ServerAddress, body: ResponseBody) -> Self {
        Self {
            server,
            result: Ok(body),
        }
    }

    pub fn fault(server: ServerAddress, fault: ServerFault) -> Self {
        Self {
            server,
            result: Err(fault),
        }
    }
}

/// All command responses of a request.
#[derive(Debug, Clone, Default)]
pub struct Response {
    pub responses: Vec<CommandResponse>,
}

impl Response {
    pub fn new(responses: Vec<CommandResponse>) -> Self {
        Self { responses }
    }

    /// Parse into per-server bodies.
    ///
    /// A state-transfer fault on any command takes precedence over other
    /// faults, so the caller's retry policy sees it.
    pub fn parse(self) -> Result<Vec<(ServerAddress, ResponseBody)>> {
        let transfer = self
            .responses
            .iter()
            .find(|r| matches!(r.result, Err(ServerFault::StateTransferInProgress)));
        if let Some(r) = transfer {
            return Err(ServerFault::StateTransferInProgress.into_error(r.server.as_str()));
        }

        let mut bodies = Vec::with_capacity(self.responses.len());
        for response in self.responses {
            match response.result {
                Ok(body) => bodies.push((response.server, body)),
                Err(fault) => return Err(fault.into_error(response.server.as_str())),
            }
        }
        if bodies.is_empty() {
            return Err(Error::OperationFailed("empty response".into()));
        }
        Ok(bodies)
    }
}

/// Error for a body of the wrong shape.
pub fn unexpected(expected: &'static str, body: &ResponseBody) -> Error {
    Error::Internal(format!(
        "expected {} response, got {}",
        expected,
        body.kind()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn addr(s: &str) -> ServerAddress {
        ServerAddress::new(s)
    }

    #[test]
    fn test_parse_prefers_state_transfer() {
        let response = Response::new(vec![
            CommandResponse::fault(addr("a"), ServerFault::Failed("boom".into())),
            CommandResponse::fault(addr("b"), ServerFault::StateTransferInProgress),
        ]);
        assert_matches!(
            response.parse(),
            Err(Error::StateTransferInProgress { server }) if server == "b"
        );
    }

    #[test]
    fn test_parse_collects_bodies() {
        let response = Response::new(vec![
            CommandResponse::ok(addr("a"), ResponseBody::Count(2)),
            CommandResponse::ok(addr("b"), ResponseBody::Count(3)),
        ]);
        let bodies = response.parse().unwrap();
        assert_eq!(bodies.len(), 2);
        assert_eq!(bodies[1].0, addr("b"));
    }

    #[test]
    fn test_empty_response_is_an_error() {
        assert_matches!(Response::default().parse(), Err(Error::OperationFailed(_)));
    }

    #[test]
    fn test_request_ids_increase() {
        let a = Request::dedicated(Command::Count, addr("a"), Duration::from_secs(1));
        let b = Request::dedicated(Command::Count, addr("a"), Duration::from_secs(1));
        assert!(b.id > a.id);
        assert_eq!(a.routing, Routing::Dedicated);
        assert_eq!(a.commands[0].view, ViewIdTag::Forced);
        assert_eq!(a.name(), "count");
    }
}
