//! Domain Layer
//!
//! Value types and ports shared by both cache strategies.
//!
//! - **Items** (`item.rs`, `lock.rs`, `flags.rs`) - what callers store and how
//! - **Events** (`events.rs`) - notifications and their registrations
//! - **Queries** (`query.rs`) - result sets, reader rows, continuous queries
//! - **Messaging** (`messaging.rs`) - pub/sub value types
//! - **Options** (`options.rs`) - per-call options and results
//! - **Ports** (`ports.rs`) - the operation contract and its collaborators

pub mod events;
pub mod flags;
pub mod item;
pub mod lock;
pub mod messaging;
pub mod options;
pub mod ports;
pub mod query;

pub use events::{
    CacheEvent, CallbackId, EventDataFilter, EventHandler, EventItem, EventType, EventTypes,
    ItemCallback, ItemCallbackIds, Notification, RemovedReason, SubscriptionHandle,
};
pub use flags::OperationFlags;
pub use item::{
    CacheItem, CacheValue, Dependency, ExpirationHint, GroupInfo, ItemAttributes, ItemPriority,
    NamedTags, Payload, Tag, TagMatch, ValueEntry,
};
pub use lock::{ItemVersion, LockAccessType, LockHandle};
pub use messaging::{
    DeliveryOption, MessageAcks, OutgoingMessage, ReceivedMessage, ReceivedMessages,
    SubscriptionInfo, SubscriptionPolicy, TopicOperation,
};
pub use options::{
    BulkGetResult, BulkWriteResult, ClientInfo, GetOptions, GetResult, MapReduceTask, PollResult,
    ProcessorOutcome, RemoveOptions, StreamMode, StreamOptions, WriteOptions,
};
pub use ports::{
    Broker, BrokerListener, CacheEngine, CacheStrategy, Clock, KeyRouter, ManualClock,
    NotificationSink, ServerAddress, SystemClock,
};
pub use query::{
    ContinuousQuery, CqRegistration, MergeMode, QueryParams, QueryResultSet, ReaderChunk,
    ReaderDescriptor, ReaderRow,
};
