//! In-Memory Cache Engine
//!
//! Reference [`CacheEngine`] used by the in-process strategy and by every
//! server of the mock cluster. It implements the item semantics a real
//! cache server applies:
//!
//! - **Versions**: every write issues a version greater than any the
//!   engine issued before, so a re-added key never reuses a removed
//!   item's version
//! - **Locks**: optional expiry; writes respect or match them, reads only
//!   look at them when a lock id is presented and fail if it is not the
//!   holder's
//! - **Expiration**: absolute and sliding, evaluated lazily on access
//! - **Notifications**: item callbacks, general events and continuous-query
//!   membership changes, collected under the state lock and delivered after
//!   it is released
//!
//! Readers, streams and topics are kept alongside the items.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Weak;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::query_eval::{ParsedQuery, Projection, Statement};
use crate::domain::events::{
    CacheEvent, EventDataFilter, EventItem, EventType, EventTypes, ItemCallbackIds, Notification,
    RemovedReason,
};
use crate::domain::flags::OperationFlags;
use crate::domain::item::{ExpirationHint, GroupInfo, NamedTags, Payload, Tag, TagMatch, ValueEntry};
use crate::domain::lock::{ItemVersion, LockHandle};
use crate::domain::messaging::{
    DeliveryOption, MessageAcks, OutgoingMessage, ReceivedMessage, ReceivedMessages,
    SubscriptionInfo, SubscriptionPolicy, TopicOperation,
};
use crate::domain::options::{StreamMode, StreamOptions};
use crate::domain::ports::{
    CacheEngine, EngineEntry, EngineRead, EngineReader, EngineRecord, EngineWrite,
    LockExpectation, NotificationSink, ServerAddress,
};
use crate::domain::query::{CqRegistration, QueryParams, QueryResultSet, ReaderChunk, ReaderDescriptor, ReaderRow};
use crate::error::{Error, Result};

/// Address reported in reader chunks served by a standalone engine.
pub const LOCAL_ADDRESS: &str = "inproc";

const DEFAULT_CHUNK: usize = 1000;

// =============================================================================
// Stored State
// =============================================================================

#[derive(Debug, Clone)]
struct HeldLock {
    handle: LockHandle,
    expires_at: Option<DateTime<Utc>>,
}

impl HeldLock {
    fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

#[derive(Debug, Clone)]
struct StoredItem {
    record: EngineRecord,
    lock: Option<HeldLock>,
    last_access: DateTime<Utc>,
}

impl StoredItem {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.record.entry.expiration {
            ExpirationHint::None => false,
            ExpirationHint::Absolute(at) => now >= at,
            ExpirationHint::Sliding(idle) => now - self.last_access >= to_chrono(idle),
        }
    }

    fn active_lock(&self, now: DateTime<Utc>) -> Option<&LockHandle> {
        self.lock
            .as_ref()
            .filter(|l| l.is_active(now))
            .map(|l| &l.handle)
    }

    fn event_item(&self) -> EventItem {
        EventItem {
            value: Some(self.record.entry.value.clone()),
            version: Some(self.record.version),
            group: self.record.entry.group.clone(),
        }
    }
}

#[derive(Debug)]
struct ActiveQuery {
    parsed: ParsedQuery,
    registration: CqRegistration,
    members: BTreeSet<String>,
}

#[derive(Debug)]
struct OpenReader {
    rows: Vec<ReaderRow>,
    descriptor: ReaderDescriptor,
}

#[derive(Debug)]
struct OpenStream {
    key: String,
    mode: StreamMode,
}

#[derive(Debug)]
struct StoredMessage {
    message: ReceivedMessage,
    delivery: DeliveryOption,
    /// Subscribers still owed this message
    recipients: BTreeSet<String>,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct TopicState {
    subscribers: BTreeMap<String, SubscriptionInfo>,
    messages: BTreeMap<u64, StoredMessage>,
    /// Delivered, not yet acknowledged
    unacked: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct EngineState {
    items: BTreeMap<String, StoredItem>,
    /// Highest version issued by this engine
    last_version: Option<ItemVersion>,
    key_callbacks: HashMap<String, Vec<ItemCallbackIds>>,
    general: HashMap<EventType, EventDataFilter>,
    queries: BTreeMap<String, ActiveQuery>,
    readers: HashMap<String, OpenReader>,
    streams: HashMap<String, OpenStream>,
    topics: BTreeMap<String, TopicState>,
    next_message: u64,
}

/// An item change, before or after the write.
enum Change {
    Added(StoredItem),
    Updated { old: StoredItem, new: StoredItem },
    Removed { old: StoredItem, reason: RemovedReason },
}

/// Engine operation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub reads: u64,
    pub writes: u64,
    pub removes: u64,
    pub hits: u64,
    pub misses: u64,
}

// =============================================================================
// Engine
// =============================================================================

/// In-memory engine with full item semantics.
pub struct InMemoryEngine {
    name: String,
    address: ServerAddress,
    state: Mutex<EngineState>,
    listener: Mutex<Option<Weak<dyn NotificationSink>>>,
    next_id: AtomicU64,
    /// Statistics
    reads: AtomicU64,
    writes: AtomicU64,
    removes: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl InMemoryEngine {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_address(name, ServerAddress::new(LOCAL_ADDRESS))
    }

    /// Engine reporting `address` in the reader chunks it serves.
    pub fn with_address(name: impl Into<String>, address: ServerAddress) -> Self {
        Self {
            name: name.into(),
            address,
            state: Mutex::new(EngineState::default()),
            listener: Mutex::new(None),
            next_id: AtomicU64::new(1),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            removes: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            removes: self.removes.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Open continuous queries.
    pub fn query_count(&self) -> usize {
        self.state.lock().queries.len()
    }

    /// Readers still holding rows.
    pub fn open_reader_count(&self) -> usize {
        self.state.lock().readers.len()
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn fire(&self, notifications: Vec<Notification>) {
        if notifications.is_empty() {
            return;
        }
        let sink = self.listener.lock().as_ref().and_then(Weak::upgrade);
        match sink {
            Some(sink) => {
                for notification in notifications {
                    sink.notify(notification);
                }
            }
            None => debug!(
                cache = %self.name,
                dropped = notifications.len(),
                "No notification listener, dropping notifications"
            ),
        }
    }

    /// Run `f` under the state lock, then deliver what it collected.
    fn mutate<T>(&self, f: impl FnOnce(&mut EngineState, &mut Vec<Notification>) -> T) -> T {
        let mut out = Vec::new();
        let result = {
            let mut state = self.state.lock();
            f(&mut state, &mut out)
        };
        self.fire(out);
        result
    }

    fn chunk(&self, reader_id: &str, reader: &OpenReader, from: u64, size: usize) -> ReaderChunk {
        let size = if size == 0 { DEFAULT_CHUNK } else { size };
        let start = (from as usize).min(reader.rows.len());
        let end = (start + size).min(reader.rows.len());
        ReaderChunk {
            reader_id: reader_id.to_string(),
            server: self.address.clone(),
            rows: reader.rows[start..end].to_vec(),
            next_index: end as u64,
            is_last: end >= reader.rows.len(),
            descriptor: reader.descriptor.clone(),
        }
    }
}

impl Default for InMemoryEngine {
    fn default() -> Self {
        Self::new("default")
    }
}

impl std::fmt::Debug for InMemoryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryEngine")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("stats", &self.stats())
            .finish()
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

fn check_version(key: &str, expected: Option<ItemVersion>, current: Option<ItemVersion>) -> Result<()> {
    match expected {
        Some(expected) if current != Some(expected) => Err(Error::VersionMismatch {
            key: key.to_string(),
            expected,
            actual: current.unwrap_or(ItemVersion(0)),
        }),
        _ => Ok(()),
    }
}

fn check_lock(key: &str, held: Option<&LockHandle>, expectation: &LockExpectation) -> Result<()> {
    let Some(held) = held else {
        return Ok(());
    };
    let conflict = match expectation {
        LockExpectation::Ignore => false,
        LockExpectation::Respect => true,
        LockExpectation::Match { lock_id, .. } => held.lock_id() != Some(lock_id.as_str()),
    };
    if conflict {
        Err(Error::ItemLocked {
            key: key.to_string(),
            lock: held.clone(),
        })
    } else {
        Ok(())
    }
}

fn tags_of(item: &StoredItem) -> &NamedTags {
    &item.record.entry.named_tags
}

// =============================================================================
// State Operations
// =============================================================================

impl EngineState {
    /// Drop `key` if it has expired, recording the removal.
    fn expire(&mut self, key: &str, now: DateTime<Utc>, cache: &str, out: &mut Vec<Notification>) {
        if self.items.get(key).is_some_and(|i| i.is_expired(now)) {
            if let Some(old) = self.items.remove(key) {
                debug!(cache = %cache, key = %key, "Item expired");
                self.record_change(cache, key, Change::Removed { old, reason: RemovedReason::Expired }, out);
            }
        }
    }

    fn expire_all(&mut self, now: DateTime<Utc>, cache: &str, out: &mut Vec<Notification>) {
        let expired: Vec<String> = self
            .items
            .iter()
            .filter(|(_, i)| i.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            self.expire(&key, now, cache, out);
        }
    }

    fn live(&mut self, key: &str, now: DateTime<Utc>, cache: &str, out: &mut Vec<Notification>) -> Option<&mut StoredItem> {
        self.expire(key, now, cache, out);
        self.items.get_mut(key)
    }

    fn issue_version(&mut self, now: DateTime<Utc>) -> ItemVersion {
        let version = ItemVersion::next_after(self.last_version, now);
        self.last_version = Some(version);
        version
    }

    fn store(&mut self, key: &str, entry: EngineEntry, lock: Option<HeldLock>, now: DateTime<Utc>) -> StoredItem {
        let version = self.issue_version(now);
        let item = StoredItem {
            record: EngineRecord {
                entry,
                version,
                created_at: now,
            },
            lock,
            last_access: now,
        };
        self.items.insert(key.to_string(), item.clone());
        item
    }

    /// Collect notifications for one item change.
    fn record_change(&mut self, cache: &str, key: &str, change: Change, out: &mut Vec<Notification>) {
        let (event_type, item, old) = match &change {
            Change::Added(new) => (EventType::ItemAdded, Some(new), None),
            Change::Updated { old, new } => (EventType::ItemUpdated, Some(new), Some(old)),
            Change::Removed { old, .. } => (EventType::ItemRemoved, None, Some(old)),
        };
        let mut event = CacheEvent::new(cache, Some(key.to_string()), event_type);
        if let Some(item) = item {
            event = event.with_item(item.event_item());
        }
        if let Some(old) = old {
            event = event.with_old_item(old.event_item());
        }
        if let Change::Removed { reason, .. } = &change {
            event = event.with_reason(*reason);
        }

        // item-level callbacks: those carried by the item plus key registrations
        let mut callbacks: Vec<ItemCallbackIds> = old
            .map(|o| o.record.entry.callbacks)
            .into_iter()
            .chain(self.key_callbacks.get(key).into_iter().flatten().copied())
            .collect();
        if let Change::Updated { new, .. } = &change {
            let carried = new.record.entry.callbacks;
            if !callbacks.contains(&carried) {
                callbacks.push(carried);
            }
        }
        for ids in callbacks {
            let target = match &change {
                Change::Added(_) => None,
                Change::Updated { .. } => ids.on_update,
                Change::Removed { reason, .. } => {
                    let expired = matches!(reason, RemovedReason::Expired);
                    ids.on_remove.filter(|_| !expired || ids.notify_on_expiration)
                }
            };
            if let Some(callback) = target {
                out.push(Notification::Item {
                    callback,
                    event: event.filtered(ids.filter),
                });
            }
        }

        if let Some(filter) = self.general.get(&event_type) {
            out.push(Notification::General {
                event: event.filtered(*filter),
            });
        }

        for (query_id, query) in self.queries.iter_mut() {
            let was_member = query.members.contains(key);
            let is_member = item.is_some_and(|i| {
                query
                    .parsed
                    .matches(key, tags_of(i), &query.registration.params)
                    .unwrap_or(false)
            });
            let (kind, filter) = match (was_member, is_member) {
                (false, true) => (EventType::ItemAdded, query.registration.notify_add),
                (true, true) => (EventType::ItemUpdated, query.registration.notify_update),
                (true, false) => (EventType::ItemRemoved, query.registration.notify_remove),
                (false, false) => continue,
            };
            if is_member {
                query.members.insert(key.to_string());
            } else {
                query.members.remove(key);
            }
            if let Some(filter) = filter {
                let mut query_event = event.filtered(filter);
                query_event.event_type = kind;
                out.push(Notification::Query {
                    server_query_id: query_id.clone(),
                    event: query_event,
                });
            }
        }

        if matches!(change, Change::Removed { .. }) {
            self.key_callbacks.remove(key);
        }
    }

    fn matching<'a>(
        &'a self,
        parsed: &'a ParsedQuery,
        params: &'a QueryParams,
    ) -> impl Iterator<Item = Result<(&'a String, &'a StoredItem)>> + 'a {
        self.items.iter().filter_map(move |(key, item)| {
            match parsed.matches(key, tags_of(item), params) {
                Ok(true) => Some(Ok((key, item))),
                Ok(false) => None,
                Err(e) => Some(Err(e)),
            }
        })
    }

    fn rows(&self, parsed: &ParsedQuery, params: &QueryParams, with_values: bool) -> Result<(ReaderDescriptor, Vec<ReaderRow>)> {
        let descriptor = parsed.descriptor();
        let mut rows = Vec::new();
        for found in self.matching(parsed, params) {
            let (key, item) = found?;
            let mut row = ParsedQuery::row(&descriptor, key, tags_of(item));
            if with_values {
                row.entry = Some(item.record.entry.value.clone());
            }
            rows.push(row);
        }
        if !descriptor.order_by.is_empty() {
            rows.sort_by(|a, b| descriptor.compare(a, b));
        }
        Ok((descriptor, rows))
    }

    fn topic(&mut self, name: &str) -> Result<&mut TopicState> {
        self.topics
            .get_mut(name)
            .ok_or_else(|| Error::OperationFailed(format!("topic '{}' does not exist", name)))
    }
}

// =============================================================================
// CacheEngine
// =============================================================================

impl CacheEngine for InMemoryEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn count(&self) -> u64 {
        let now = Utc::now();
        self.mutate(|state, out| {
            state.expire_all(now, &self.name, out);
            state.items.len() as u64
        })
    }

    fn set_listener(&self, listener: Weak<dyn NotificationSink>) {
        *self.listener.lock() = Some(listener);
    }

    fn add(&self, key: &str, entry: EngineEntry, _write: &EngineWrite) -> Result<ItemVersion> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let now = Utc::now();
        self.mutate(|state, out| {
            if state.live(key, now, &self.name, out).is_some() {
                return Err(Error::OperationFailed(format!("key '{}' already exists", key)));
            }
            let item = state.store(key, entry, None, now);
            let version = item.record.version;
            state.record_change(&self.name, key, Change::Added(item), out);
            Ok(version)
        })
    }

    fn insert(&self, key: &str, entry: EngineEntry, write: &EngineWrite) -> Result<ItemVersion> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let now = Utc::now();
        self.mutate(|state, out| {
            let existing = state.live(key, now, &self.name, out).cloned();
            let current = existing.as_ref().map(|i| i.record.version);
            check_version(key, write.version, current)?;

            let Some(old) = existing else {
                let item = state.store(key, entry, None, now);
                let version = item.record.version;
                state.record_change(&self.name, key, Change::Added(item), out);
                return Ok(version);
            };

            check_lock(key, old.active_lock(now), &write.lock)?;
            let keep_lock = match &write.lock {
                LockExpectation::Match { release, .. } => !release,
                _ => true,
            };
            let lock = old.lock.clone().filter(|l| keep_lock && l.is_active(now));
            let new = state.store(key, entry, lock, now);
            let version = new.record.version;
            state.record_change(&self.name, key, Change::Updated { old, new }, out);
            Ok(version)
        })
    }

    fn get(&self, key: &str, read: &EngineRead) -> Result<(Option<EngineRecord>, LockHandle)> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let now = Utc::now();
        let found = self.mutate(|state, out| {
            let lock_id = self.next_id("lock");
            let Some(item) = state.live(key, now, &self.name, out) else {
                return Ok((None, LockHandle::none()));
            };
            if let Some(group) = &read.group {
                let in_group = item
                    .record
                    .entry
                    .group
                    .as_ref()
                    .is_some_and(|g| g.matches(&group.group, group.sub_group.as_deref()));
                if !in_group {
                    return Ok((None, LockHandle::none()));
                }
            }
            if read.newer_than.is_some_and(|v| item.record.version <= v) {
                return Ok((None, item.active_lock(now).cloned().unwrap_or_default()));
            }

            let held = item.active_lock(now).cloned();
            if let LockExpectation::Match { lock_id, release } = &read.lock {
                if let Some(held) = held.as_ref().filter(|h| h.lock_id() != Some(lock_id.as_str())) {
                    return Err(Error::ItemLocked {
                        key: key.to_string(),
                        lock: held.clone(),
                    });
                }
                if *release {
                    item.lock = None;
                }
            }

            let mut handle = item.active_lock(now).cloned().unwrap_or_default();
            if let Some(timeout) = read.acquire {
                if let Some(held) = held.filter(|_| read.lock == LockExpectation::Respect) {
                    return Ok((None, held));
                }
                handle = LockHandle::new(lock_id, now);
                item.lock = Some(HeldLock {
                    handle: handle.clone(),
                    expires_at: (!timeout.is_zero()).then(|| now + to_chrono(timeout)),
                });
            }
            item.last_access = now;
            Ok((Some(item.record.clone()), handle))
        })?;
        if found.0.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        Ok(found)
    }

    fn remove(&self, key: &str, write: &EngineWrite) -> Result<Option<ValueEntry>> {
        self.removes.fetch_add(1, Ordering::Relaxed);
        let now = Utc::now();
        self.mutate(|state, out| {
            let Some(item) = state.live(key, now, &self.name, out) else {
                return check_version(key, write.version, None).map(|_| None);
            };
            check_lock(key, item.active_lock(now), &write.lock)?;
            check_version(key, write.version, Some(item.record.version))?;
            let Some(old) = state.items.remove(key) else {
                return Ok(None);
            };
            let value = old.record.entry.value.clone();
            state.record_change(
                &self.name,
                key,
                Change::Removed {
                    old,
                    reason: RemovedReason::Removed,
                },
                out,
            );
            Ok(Some(value))
        })
    }

    fn remove_by_query(&self, query: &str, params: &QueryParams) -> Result<u64> {
        let parsed = ParsedQuery::parse(query)?;
        if parsed.statement != Statement::Delete {
            return Err(Error::InvalidArgument(format!(
                "remove by query needs a DELETE statement: '{}'",
                query
            )));
        }
        let now = Utc::now();
        self.mutate(|state, out| {
            state.expire_all(now, &self.name, out);
            let keys: Vec<String> = state
                .matching(&parsed, params)
                .map(|found| found.map(|(k, _)| k.clone()))
                .collect::<Result<_>>()?;
            for key in &keys {
                if let Some(old) = state.items.remove(key) {
                    state.record_change(&self.name, key, Change::Removed { old, reason: RemovedReason::Removed }, out);
                }
            }
            self.removes.fetch_add(keys.len() as u64, Ordering::Relaxed);
            Ok(keys.len() as u64)
        })
    }

    fn contains(&self, key: &str) -> bool {
        let now = Utc::now();
        self.mutate(|state, out| state.live(key, now, &self.name, out).is_some())
    }

    fn clear(&self) {
        self.mutate(|state, out| {
            let removed = state.items.len();
            state.items.clear();
            state.key_callbacks.clear();
            state.streams.clear();
            for (query_id, query) in state.queries.iter_mut() {
                query.members.clear();
                out.push(Notification::QueryCleared {
                    server_query_id: query_id.clone(),
                });
            }
            if let Some(filter) = state.general.get(&EventType::CacheCleared) {
                let event = CacheEvent::new(&self.name, None, EventType::CacheCleared);
                out.push(Notification::General {
                    event: event.filtered(*filter),
                });
            }
            debug!(cache = %self.name, removed, "Cache cleared");
        })
    }

    fn set_absolute_expiration(&self, key: &str, at: DateTime<Utc>) -> bool {
        let now = Utc::now();
        self.mutate(|state, out| match state.live(key, now, &self.name, out) {
            Some(item) => {
                item.record.entry.expiration = ExpirationHint::Absolute(at);
                true
            }
            None => false,
        })
    }

    fn touch(&self, key: &str) -> bool {
        let now = Utc::now();
        self.mutate(|state, out| match state.live(key, now, &self.name, out) {
            Some(item) => {
                item.last_access = now;
                true
            }
            None => false,
        })
    }

    fn lock(&self, key: &str, timeout: Duration) -> (bool, LockHandle) {
        let now = Utc::now();
        self.mutate(|state, out| {
            let lock_id = self.next_id("lock");
            let Some(item) = state.live(key, now, &self.name, out) else {
                return (false, LockHandle::none());
            };
            if let Some(held) = item.active_lock(now) {
                return (false, held.clone());
            }
            let handle = LockHandle::new(lock_id, now);
            item.lock = Some(HeldLock {
                handle: handle.clone(),
                expires_at: (!timeout.is_zero()).then(|| now + to_chrono(timeout)),
            });
            (true, handle)
        })
    }

    fn unlock(&self, key: &str, lock_id: Option<&str>) -> Result<()> {
        let now = Utc::now();
        self.mutate(|state, out| {
            let Some(item) = state.live(key, now, &self.name, out) else {
                return Ok(());
            };
            if let (Some(id), Some(held)) = (lock_id, item.active_lock(now)) {
                if held.lock_id() != Some(id) {
                    return Err(Error::ItemLocked {
                        key: key.to_string(),
                        lock: held.clone(),
                    });
                }
            }
            item.lock = None;
            Ok(())
        })
    }

    fn is_locked(&self, key: &str) -> (bool, LockHandle) {
        let now = Utc::now();
        self.mutate(|state, out| {
            match state.live(key, now, &self.name, out).and_then(|i| i.active_lock(now)) {
                Some(held) => (true, held.clone()),
                None => (false, LockHandle::none()),
            }
        })
    }

    fn keys_by_tags(&self, tags: &[Tag], mode: TagMatch) -> Vec<String> {
        if tags.is_empty() {
            return Vec::new();
        }
        let now = Utc::now();
        self.mutate(|state, out| {
            state.expire_all(now, &self.name, out);
            state
                .items
                .iter()
                .filter(|(_, i)| mode.matches(&i.record.entry.tags, tags))
                .map(|(k, _)| k.clone())
                .collect()
        })
    }

    fn keys_in_group(&self, group: &str, sub_group: Option<&str>) -> Vec<String> {
        let now = Utc::now();
        self.mutate(|state, out| {
            state.expire_all(now, &self.name, out);
            state
                .items
                .iter()
                .filter(|(_, i)| {
                    i.record
                        .entry
                        .group
                        .as_ref()
                        .is_some_and(|g: &GroupInfo| g.matches(group, sub_group))
                })
                .map(|(k, _)| k.clone())
                .collect()
        })
    }

    fn search(&self, query: &str, params: &QueryParams, with_values: bool) -> Result<QueryResultSet> {
        let parsed = ParsedQuery::parse(query)?;
        if parsed.statement == Statement::Delete {
            return Err(Error::InvalidArgument("DELETE queries go through remove by query".into()));
        }
        let now = Utc::now();
        self.mutate(|state, out| {
            state.expire_all(now, &self.name, out);
            if matches!(parsed.projection, Projection::Aggregate(..)) {
                let matched: Vec<(&String, &StoredItem)> =
                    state.matching(&parsed, params).collect::<Result<_>>()?;
                return Ok(QueryResultSet {
                    aggregate: parsed.aggregate(matched.iter().map(|(k, i)| (k.as_str(), tags_of(i)))),
                    ..Default::default()
                });
            }
            let (_, rows) = state.rows(&parsed, params, with_values)?;
            let mut result = QueryResultSet::default();
            for row in rows {
                let Some(key) = row.key else { continue };
                match row.entry {
                    Some(entry) if with_values => {
                        result.entries.insert(key.clone(), entry);
                    }
                    _ => {}
                }
                result.keys.push(key);
            }
            Ok(result)
        })
    }

    fn open_reader(
        &self,
        query: &str,
        params: &QueryParams,
        get_data: bool,
        chunk_size: usize,
    ) -> Result<EngineReader> {
        let parsed = ParsedQuery::parse(query)?;
        if parsed.statement != Statement::Select || matches!(parsed.projection, Projection::Aggregate(..)) {
            return Err(Error::InvalidArgument(format!("query cannot open a reader: '{}'", query)));
        }
        let reader_id = self.next_id("reader");
        let now = Utc::now();
        self.mutate(|state, out| {
            state.expire_all(now, &self.name, out);
            let (descriptor, rows) = state.rows(&parsed, params, get_data)?;
            let reader = OpenReader { rows, descriptor };
            let first_chunk = self.chunk(&reader_id, &reader, 0, chunk_size);
            if !first_chunk.is_last {
                state.readers.insert(reader_id.clone(), reader);
            }
            debug!(cache = %self.name, reader = %reader_id, rows = first_chunk.rows.len(), "Reader opened");
            Ok(EngineReader { first_chunk })
        })
    }

    fn reader_chunk(&self, reader_id: &str, next_index: u64, chunk_size: usize) -> Result<ReaderChunk> {
        let mut state = self.state.lock();
        let reader = state
            .readers
            .get(reader_id)
            .ok_or_else(|| Error::OperationFailed(format!("reader '{}' is not open", reader_id)))?;
        let chunk = self.chunk(reader_id, reader, next_index, chunk_size);
        if chunk.is_last {
            state.readers.remove(reader_id);
        }
        Ok(chunk)
    }

    fn dispose_reader(&self, reader_id: &str) {
        if self.state.lock().readers.remove(reader_id).is_some() {
            debug!(cache = %self.name, reader = %reader_id, "Reader disposed");
        }
    }

    fn register_cq(&self, registration: &CqRegistration) -> Result<String> {
        let parsed = ParsedQuery::parse(&registration.query)?;
        if parsed.statement != Statement::Select {
            return Err(Error::InvalidArgument("continuous queries must be SELECT statements".into()));
        }
        let query_id = format!("cq-{}", registration.client_id);
        let now = Utc::now();
        self.mutate(|state, out| {
            state.expire_all(now, &self.name, out);
            let members = state
                .matching(&parsed, &registration.params)
                .map(|found| found.map(|(k, _)| k.clone()))
                .collect::<Result<BTreeSet<_>>>()?;
            state.queries.insert(
                query_id.clone(),
                ActiveQuery {
                    parsed,
                    registration: registration.clone(),
                    members,
                },
            );
            Ok(query_id)
        })
    }

    fn unregister_cq(&self, server_id: &str) {
        self.state.lock().queries.remove(server_id);
    }

    fn open_stream(&self, key: &str, mode: StreamMode, opts: &StreamOptions) -> Result<String> {
        let handle = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        self.mutate(|state, out| {
            let open_modes: Vec<StreamMode> = state
                .streams
                .values()
                .filter(|s| s.key == key)
                .map(|s| s.mode)
                .collect();
            let exists = state.live(key, now, &self.name, out).is_some();
            match mode {
                StreamMode::Write => {
                    if open_modes.iter().any(|m| *m != StreamMode::ReadWithoutLock) {
                        return Err(Error::OperationFailed(format!("stream '{}' is in use", key)));
                    }
                    if !exists {
                        let entry = EngineEntry {
                            value: ValueEntry::new(Payload::Bytes(Bytes::new()), OperationFlags::BINARY_DATA),
                            expiration: opts.expiration,
                            priority: opts.priority,
                            group: opts.group.clone(),
                            tags: Vec::new(),
                            named_tags: NamedTags::new(),
                            dependency: None,
                            callbacks: ItemCallbackIds::default(),
                            resync_provider: None,
                        };
                        let item = state.store(key, entry, None, now);
                        state.record_change(&self.name, key, Change::Added(item), out);
                    }
                }
                StreamMode::Read => {
                    if open_modes.contains(&StreamMode::Write) {
                        return Err(Error::OperationFailed(format!("stream '{}' is open for writing", key)));
                    }
                    if !exists {
                        return Err(Error::OperationFailed(format!("stream '{}' does not exist", key)));
                    }
                }
                StreamMode::ReadWithoutLock => {
                    if !exists {
                        return Err(Error::OperationFailed(format!("stream '{}' does not exist", key)));
                    }
                }
            }
            state.streams.insert(
                handle.clone(),
                OpenStream {
                    key: key.to_string(),
                    mode,
                },
            );
            Ok(handle)
        })
    }

    fn close_stream(&self, key: &str, handle: &str) -> Result<()> {
        let mut state = self.state.lock();
        match state.streams.get(handle) {
            Some(stream) if stream.key == key => {
                state.streams.remove(handle);
                Ok(())
            }
            _ => Err(Error::OperationFailed(format!("stream handle '{}' is not open", handle))),
        }
    }

    fn read_stream(&self, key: &str, handle: &str, offset: u64, length: usize) -> Result<Bytes> {
        let state = self.state.lock();
        if !state.streams.get(handle).is_some_and(|s| s.key == key) {
            return Err(Error::OperationFailed(format!("stream handle '{}' is not open", handle)));
        }
        let bytes = stream_bytes(&state, key)?;
        let start = (offset as usize).min(bytes.len());
        let end = start.saturating_add(length).min(bytes.len());
        Ok(bytes.slice(start..end))
    }

    fn write_stream(&self, key: &str, handle: &str, offset: u64, data: &[u8]) -> Result<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let now = Utc::now();
        let mut state = self.state.lock();
        if !state
            .streams
            .get(handle)
            .is_some_and(|s| s.key == key && s.mode == StreamMode::Write)
        {
            return Err(Error::OperationFailed(format!("stream handle '{}' is not open for writing", handle)));
        }
        let current = stream_bytes(&state, key)?;
        let offset = offset as usize;
        let mut buf = BytesMut::from(current.as_ref());
        if buf.len() < offset + data.len() {
            buf.resize(offset + data.len(), 0);
        }
        buf[offset..offset + data.len()].copy_from_slice(data);
        let version = state.issue_version(now);
        if let Some(item) = state.items.get_mut(key) {
            item.record.entry.value.payload = Payload::Bytes(buf.freeze());
            item.record.version = version;
            item.last_access = now;
        }
        Ok(())
    }

    fn stream_length(&self, key: &str, handle: &str) -> Result<u64> {
        let state = self.state.lock();
        if !state.streams.get(handle).is_some_and(|s| s.key == key) {
            return Err(Error::OperationFailed(format!("stream handle '{}' is not open", handle)));
        }
        Ok(stream_bytes(&state, key)?.len() as u64)
    }

    fn register_key_callbacks(&self, key: &str, ids: &ItemCallbackIds) {
        let mut state = self.state.lock();
        let registered = state.key_callbacks.entry(key.to_string()).or_default();
        if !registered.contains(ids) {
            registered.push(*ids);
        }
    }

    fn unregister_key_callbacks(&self, key: &str, ids: &ItemCallbackIds) {
        let mut state = self.state.lock();
        if let Some(registered) = state.key_callbacks.get_mut(key) {
            registered.retain(|r| r.on_update != ids.on_update || r.on_remove != ids.on_remove);
            if registered.is_empty() {
                state.key_callbacks.remove(key);
            }
        }
    }

    fn register_general(&self, types: EventTypes, filter: EventDataFilter) {
        let mut state = self.state.lock();
        for event_type in types.iter() {
            state.general.insert(event_type, filter);
        }
    }

    fn unregister_general(&self, types: EventTypes) {
        let mut state = self.state.lock();
        for event_type in types.iter() {
            state.general.remove(&event_type);
        }
    }

    fn raise_custom_event(&self, notif_id: Bytes, data: Bytes) {
        self.mutate(|state, out| {
            if state.general.contains_key(&EventType::Custom) {
                let key = String::from_utf8_lossy(&notif_id).into_owned();
                let event = CacheEvent::new(&self.name, Some(key), EventType::Custom).with_data(data);
                out.push(Notification::General { event });
            }
        })
    }

    fn create_topic(&self, name: &str, op: TopicOperation) -> bool {
        let mut state = self.state.lock();
        match op {
            TopicOperation::Get => state.topics.contains_key(name),
            TopicOperation::Create => {
                state.topics.entry(name.to_string()).or_default();
                true
            }
        }
    }

    fn remove_topic(&self, name: &str, forcefully: bool) -> Result<()> {
        let mut state = self.state.lock();
        let Some(topic) = state.topics.get(name) else {
            return Ok(());
        };
        if !forcefully && !topic.messages.is_empty() {
            return Err(Error::OperationFailed(format!(
                "topic '{}' has {} undelivered messages",
                name,
                topic.messages.len()
            )));
        }
        state.topics.remove(name);
        Ok(())
    }

    fn subscribe(&self, subscription: &SubscriptionInfo) -> Result<()> {
        let mut state = self.state.lock();
        let topic = state.topic(&subscription.topic)?;
        let taken = topic.subscribers.values().any(|s| {
            s.name == subscription.name
                && s.subscriber_id != subscription.subscriber_id
                && (s.policy == SubscriptionPolicy::Exclusive || subscription.policy == SubscriptionPolicy::Exclusive)
        });
        if taken {
            return Err(Error::OperationFailed(format!(
                "subscription '{}' on '{}' is exclusive",
                subscription.name, subscription.topic
            )));
        }
        topic
            .subscribers
            .insert(subscription.subscriber_id.clone(), subscription.clone());
        Ok(())
    }

    fn unsubscribe(&self, subscription: &SubscriptionInfo) -> Result<()> {
        let mut state = self.state.lock();
        let topic = state.topic(&subscription.topic)?;
        topic.subscribers.remove(&subscription.subscriber_id);
        for message in topic.messages.values_mut() {
            message.recipients.remove(&subscription.subscriber_id);
        }
        topic.messages.retain(|_, m| !m.recipients.is_empty());
        Ok(())
    }

    fn publish(&self, message: &OutgoingMessage) -> Result<()> {
        self.mutate(|state, out| {
            let seq = state.next_message;
            state.next_message += 1;
            let topic = state.topic(&message.topic)?;
            let recipients: BTreeSet<String> = topic.subscribers.keys().cloned().collect();
            if recipients.is_empty() {
                debug!(topic = %message.topic, message = %message.id, "Published with no subscribers");
                return Ok(());
            }
            topic.messages.insert(
                seq,
                StoredMessage {
                    message: ReceivedMessage {
                        id: message.id.clone(),
                        topic: message.topic.clone(),
                        payload: message.payload.clone(),
                        created_at: message.created_at,
                    },
                    delivery: message.delivery,
                    recipients,
                    expires_at: message.expiration.map(|ttl| message.created_at + to_chrono(ttl)),
                },
            );
            out.push(Notification::MessagesAvailable {
                topic: message.topic.clone(),
            });
            Ok(())
        })
    }

    fn message_count(&self, topic: &str) -> Result<u64> {
        let mut state = self.state.lock();
        let topic = state.topic(topic)?;
        Ok((topic.messages.len() + topic.unacked.len()) as u64)
    }

    fn pull_messages(&self, subscriber_id: &str) -> ReceivedMessages {
        let now = Utc::now();
        let mut state = self.state.lock();
        let mut received = ReceivedMessages::new();
        for (name, topic) in state.topics.iter_mut() {
            if !topic.subscribers.contains_key(subscriber_id) {
                continue;
            }
            topic
                .messages
                .retain(|_, m| m.expires_at.map_or(true, |at| now < at));
            for message in topic.messages.values_mut() {
                if !message.recipients.remove(subscriber_id) {
                    continue;
                }
                if message.delivery == DeliveryOption::Any {
                    message.recipients.clear();
                }
                topic.unacked.insert(message.message.id.clone());
                received
                    .entry(name.clone())
                    .or_default()
                    .push(message.message.clone());
            }
            topic.messages.retain(|_, m| !m.recipients.is_empty());
        }
        received
    }

    fn acknowledge(&self, acks: &MessageAcks) {
        let mut state = self.state.lock();
        for (topic, ids) in acks {
            match state.topics.get_mut(topic) {
                Some(topic) => {
                    for id in ids {
                        topic.unacked.remove(id);
                    }
                }
                None => warn!(topic = %topic, "Acknowledgement for unknown topic"),
            }
        }
    }

    fn dispose(&self) {
        let mut state = self.state.lock();
        debug!(cache = %self.name, items = state.items.len(), "Engine disposed");
        *state = EngineState::default();
    }
}

fn stream_bytes(state: &EngineState, key: &str) -> Result<Bytes> {
    match state.items.get(key).map(|i| &i.record.entry.value.payload) {
        Some(Payload::Bytes(bytes)) => Ok(bytes.clone()),
        Some(Payload::Native(_)) => Err(Error::InvalidArgument(format!("item '{}' is not binary", key))),
        None => Err(Error::OperationFailed(format!("stream '{}' does not exist", key))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::events::CallbackId;
    use crate::domain::item::ItemPriority;
    use assert_matches::assert_matches;
    use serde_json::json;
    use std::sync::Arc;

    #[derive(Default)]
    struct Collector(Mutex<Vec<Notification>>);

    impl NotificationSink for Collector {
        fn notify(&self, notification: Notification) {
            self.0.lock().push(notification);
        }
    }

    fn entry(n: i64) -> EngineEntry {
        EngineEntry {
            value: ValueEntry::new(Payload::Native(json!(n)), OperationFlags::empty()),
            expiration: ExpirationHint::None,
            priority: ItemPriority::Normal,
            group: None,
            tags: Vec::new(),
            named_tags: NamedTags::from([("n".to_string(), json!(n))]),
            dependency: None,
            callbacks: ItemCallbackIds::default(),
            resync_provider: None,
        }
    }

    fn write() -> EngineWrite {
        EngineWrite {
            lock: LockExpectation::Respect,
            version: None,
            flags: OperationFlags::empty(),
        }
    }

    fn read() -> EngineRead {
        EngineRead {
            lock: LockExpectation::Respect,
            acquire: None,
            group: None,
            newer_than: None,
        }
    }

    fn engine_with_sink() -> (InMemoryEngine, Arc<Collector>) {
        let engine = InMemoryEngine::new("test");
        let sink = Arc::new(Collector::default());
        let weak: Weak<dyn NotificationSink> = Arc::downgrade(&(sink.clone() as Arc<dyn NotificationSink>));
        engine.set_listener(weak);
        (engine, sink)
    }

    #[test]
    fn test_add_rejects_existing_key() {
        let engine = InMemoryEngine::new("test");
        engine.add("k", entry(1), &write()).unwrap();
        assert_matches!(engine.add("k", entry(2), &write()), Err(Error::OperationFailed(_)));
        assert_eq!(engine.count(), 1);
    }

    #[test]
    fn test_versions_increase_across_removal() {
        let engine = InMemoryEngine::new("test");
        let v1 = engine.insert("k", entry(1), &write()).unwrap();
        let v2 = engine.insert("k", entry(2), &write()).unwrap();
        engine.remove("k", &write()).unwrap();
        let v3 = engine.add("k", entry(3), &write()).unwrap();
        assert!(v1 < v2 && v2 < v3);

        let stale = EngineWrite {
            version: Some(v2),
            ..write()
        };
        assert_matches!(
            engine.insert("k", entry(4), &stale),
            Err(Error::VersionMismatch { actual, .. }) if actual == v3
        );
    }

    #[test]
    fn test_versions_are_engine_wide() {
        let engine = InMemoryEngine::new("test");
        let mut last = ItemVersion::new(0);
        for i in 0..20 {
            let key = format!("k{}", i % 4);
            let version = engine.insert(&key, entry(i), &write()).unwrap();
            assert!(version > last);
            last = version;
            if i % 3 == 0 {
                engine.remove(&key, &write()).unwrap();
            }
        }
        let readded = engine.add("fresh", entry(0), &write()).unwrap();
        assert!(readded > last);
    }

    #[test]
    fn test_lock_blocks_writes_until_matched() {
        let engine = InMemoryEngine::new("test");
        engine.insert("k", entry(1), &write()).unwrap();
        let (acquired, handle) = engine.lock("k", Duration::from_secs(30));
        assert!(acquired);
        assert_eq!(engine.lock("k", Duration::from_secs(30)).0, false);

        assert_matches!(engine.insert("k", entry(2), &write()), Err(Error::ItemLocked { .. }));

        let matched = EngineWrite {
            lock: LockExpectation::Match {
                lock_id: handle.lock_id.clone().unwrap(),
                release: true,
            },
            ..write()
        };
        engine.insert("k", entry(2), &matched).unwrap();
        assert!(!engine.is_locked("k").0);
    }

    #[test]
    fn test_get_with_acquire_returns_holder_when_locked() {
        let engine = InMemoryEngine::new("test");
        engine.insert("k", entry(1), &write()).unwrap();

        let acquire = EngineRead {
            acquire: Some(Duration::from_secs(10)),
            ..read()
        };
        let (first, handle) = engine.get("k", &acquire).unwrap();
        assert!(first.is_some() && handle.is_held());

        let (second, holder) = engine.get("k", &acquire).unwrap();
        assert!(second.is_none());
        assert_eq!(holder, handle);

        // plain reads ignore the lock
        assert!(engine.get("k", &read()).unwrap().0.is_some());
    }

    #[test]
    fn test_get_under_wrong_lock_fails_with_holder() {
        let engine = InMemoryEngine::new("test");
        engine.insert("k", entry(1), &write()).unwrap();
        let (_, handle) = engine.lock("k", Duration::from_secs(30));

        let wrong = EngineRead {
            lock: LockExpectation::Match {
                lock_id: "someone-else".into(),
                release: false,
            },
            ..read()
        };
        assert_matches!(
            engine.get("k", &wrong),
            Err(Error::ItemLocked { key, lock }) if key == "k" && lock == handle
        );

        let right = EngineRead {
            lock: LockExpectation::Match {
                lock_id: handle.lock_id.clone().unwrap(),
                release: true,
            },
            ..read()
        };
        assert!(engine.get("k", &right).unwrap().0.is_some());
        assert!(!engine.is_locked("k").0);
    }

    #[test]
    fn test_absolute_expiration_is_lazy() {
        let engine = InMemoryEngine::new("test");
        engine.insert("k", entry(1), &write()).unwrap();
        assert!(engine.set_absolute_expiration("k", Utc::now() - chrono::Duration::seconds(1)));
        assert!(!engine.contains("k"));
        assert_eq!(engine.count(), 0);
    }

    #[test]
    fn test_callbacks_and_general_events() {
        let (engine, sink) = engine_with_sink();
        engine.register_general(EventTypes::ADDED, EventDataFilter::Metadata);

        let mut tracked = entry(1);
        tracked.callbacks = ItemCallbackIds {
            on_update: Some(CallbackId(7)),
            on_remove: Some(CallbackId(8)),
            filter: EventDataFilter::DataWithMetadata,
            notify_on_expiration: false,
        };
        engine.add("k", tracked.clone(), &write()).unwrap();
        engine.insert("k", tracked, &write()).unwrap();
        engine.remove("k", &write()).unwrap();

        let seen = sink.0.lock();
        assert_matches!(&seen[0], Notification::General { event } if event.event_type == EventType::ItemAdded);
        assert_matches!(&seen[1], Notification::Item { callback: CallbackId(7), .. });
        assert_matches!(&seen[2], Notification::Item { callback: CallbackId(8), event } if event.reason == Some(RemovedReason::Removed));
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn test_continuous_query_membership() {
        let (engine, sink) = engine_with_sink();
        let registration = CqRegistration {
            query: "SELECT * WHERE n > ?min".into(),
            params: QueryParams::from([("min".to_string(), json!(5))]),
            client_id: "c1".into(),
            notify_add: Some(EventDataFilter::None),
            notify_update: None,
            notify_remove: Some(EventDataFilter::None),
        };
        assert_eq!(engine.register_cq(&registration).unwrap(), "cq-c1");

        engine.insert("a", entry(10), &write()).unwrap();
        engine.insert("a", entry(1), &write()).unwrap();
        engine.clear();

        let kinds: Vec<_> = sink
            .0
            .lock()
            .iter()
            .map(|n| match n {
                Notification::Query { event, .. } => format!("{}", event.event_type),
                Notification::QueryCleared { .. } => "cleared".to_string(),
                other => format!("{:?}", other),
            })
            .collect();
        assert_eq!(kinds, vec!["item-added", "item-removed", "cleared"]);
    }

    #[test]
    fn test_reader_serves_sorted_chunks() {
        let engine = InMemoryEngine::new("test");
        for n in [3, 1, 2] {
            engine.insert(&format!("k{}", n), entry(n), &write()).unwrap();
        }
        let reader = engine
            .open_reader("SELECT n ORDER BY n DESC", &QueryParams::new(), false, 2)
            .unwrap();
        let first = reader.first_chunk;
        assert_eq!(first.rows.len(), 2);
        assert_eq!(first.rows[0].value(0), Some(&json!(3)));
        assert!(!first.is_last);

        let rest = engine.reader_chunk(&first.reader_id, first.next_index, 2).unwrap();
        assert_eq!(rest.rows.len(), 1);
        assert!(rest.is_last);
        assert_eq!(engine.open_reader_count(), 0);
    }

    #[test]
    fn test_remove_by_query_requires_delete() {
        let engine = InMemoryEngine::new("test");
        engine.insert("a", entry(1), &write()).unwrap();
        engine.insert("b", entry(9), &write()).unwrap();
        assert_matches!(
            engine.remove_by_query("SELECT * WHERE n > 5", &QueryParams::new()),
            Err(Error::InvalidArgument(_))
        );
        assert_eq!(engine.remove_by_query("DELETE WHERE n > 5", &QueryParams::new()).unwrap(), 1);
        assert!(engine.contains("a") && !engine.contains("b"));
    }

    #[test]
    fn test_stream_write_then_read() {
        let engine = InMemoryEngine::new("test");
        let writer = engine.open_stream("blob", StreamMode::Write, &StreamOptions::default()).unwrap();
        assert!(engine.open_stream("blob", StreamMode::Read, &StreamOptions::default()).is_err());

        engine.write_stream("blob", &writer, 0, b"hello").unwrap();
        engine.write_stream("blob", &writer, 5, b" world").unwrap();
        engine.close_stream("blob", &writer).unwrap();

        let reader = engine.open_stream("blob", StreamMode::Read, &StreamOptions::default()).unwrap();
        assert_eq!(engine.stream_length("blob", &reader).unwrap(), 11);
        assert_eq!(engine.read_stream("blob", &reader, 6, 100).unwrap(), Bytes::from_static(b"world"));
    }

    #[test]
    fn test_topic_delivery_and_ack() {
        let engine = InMemoryEngine::new("test");
        assert!(!engine.create_topic("orders", TopicOperation::Get));
        assert!(engine.create_topic("orders", TopicOperation::Create));

        for id in ["s1", "s2"] {
            engine
                .subscribe(&SubscriptionInfo {
                    topic: "orders".into(),
                    name: id.into(),
                    subscriber_id: id.into(),
                    policy: SubscriptionPolicy::Shared,
                })
                .unwrap();
        }
        let payload = ValueEntry::new(Payload::Native(json!("hi")), OperationFlags::empty());
        let message = OutgoingMessage::new("orders", payload).with_delivery(DeliveryOption::Any);
        engine.publish(&message).unwrap();

        let first = engine.pull_messages("s1");
        assert_eq!(first["orders"].len(), 1);
        assert!(engine.pull_messages("s2").is_empty());
        assert_eq!(engine.message_count("orders").unwrap(), 1);

        engine.acknowledge(&MessageAcks::from([("orders".to_string(), vec![message.id.clone()])]));
        assert_eq!(engine.message_count("orders").unwrap(), 0);
        engine.remove_topic("orders", false).unwrap();
    }
}
