//! Cache entry descriptors
//!
//! [`CacheItem`] describes everything a caller can attach to a cached value:
//! expiration, priority, group, tags, dependencies and change callbacks.
//! Strategies receive items by reference and clone them before submission;
//! callbacks are shared through `Arc` so clones stay cheap.

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::events::{EventDataFilter, ItemCallback};
use super::flags::OperationFlags;
use super::lock::ItemVersion;
use crate::error::{Error, Result};

// =============================================================================
// Values
// =============================================================================

/// Value handed in by (and back to) the application.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheValue {
    /// Opaque bytes, never re-encoded
    Bytes(Bytes),
    /// Structured value, serialized only when it leaves the process
    Json(serde_json::Value),
}

impl CacheValue {
    /// Build a structured value from any serializable type.
    pub fn from_serialize<T: Serialize>(value: &T) -> Result<Self> {
        Ok(CacheValue::Json(serde_json::to_value(value)?))
    }

    /// Decode a structured value into `T`.
    pub fn into_deserialize<T: serde::de::DeserializeOwned>(self) -> Result<T> {
        match self {
            CacheValue::Json(v) => Ok(serde_json::from_value(v)?),
            CacheValue::Bytes(b) => Ok(serde_json::from_slice(&b)?),
        }
    }
}

impl From<Bytes> for CacheValue {
    fn from(b: Bytes) -> Self {
        CacheValue::Bytes(b)
    }
}

impl From<Vec<u8>> for CacheValue {
    fn from(b: Vec<u8>) -> Self {
        CacheValue::Bytes(Bytes::from(b))
    }
}

impl From<serde_json::Value> for CacheValue {
    fn from(v: serde_json::Value) -> Self {
        CacheValue::Json(v)
    }
}

/// Value as carried by a strategy, after `safe_serialize`.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Encoded bytes; their meaning is given by the payload flags
    Bytes(Bytes),
    /// Native value passed through in-process without encoding
    Native(serde_json::Value),
}

impl Payload {
    /// Encoded size, or a serialized estimate for native values.
    pub fn size(&self) -> usize {
        match self {
            Payload::Bytes(b) => b.len(),
            Payload::Native(v) => v.to_string().len(),
        }
    }
}

/// Payload plus the flags describing its encoding.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueEntry {
    pub payload: Payload,
    pub flags: OperationFlags,
}

impl ValueEntry {
    pub fn new(payload: Payload, flags: OperationFlags) -> Self {
        Self {
            payload,
            flags: flags.payload_bits(),
        }
    }
}

// =============================================================================
// Item Metadata
// =============================================================================

/// Eviction priority.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ItemPriority {
    Low,
    BelowNormal,
    #[default]
    Normal,
    AboveNormal,
    High,
    NotRemovable,
}

/// Hierarchical group tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupInfo {
    pub group: String,
    pub sub_group: Option<String>,
}

impl GroupInfo {
    pub fn new(group: impl Into<String>, sub_group: Option<String>) -> Self {
        Self {
            group: group.into(),
            sub_group,
        }
    }

    /// Whether this item belongs to `group` (and `sub_group` when given).
    pub fn matches(&self, group: &str, sub_group: Option<&str>) -> bool {
        self.group == group && sub_group.map_or(true, |s| self.sub_group.as_deref() == Some(s))
    }
}

/// Free-form tag.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tag(pub String);

impl Tag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }
}

impl std::fmt::Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a tag query combines its tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TagMatch {
    /// Item carries at least one of the tags
    Any,
    /// Item carries every tag
    All,
}

impl TagMatch {
    pub fn matches(self, item_tags: &[Tag], query: &[Tag]) -> bool {
        match self {
            TagMatch::Any => query.iter().any(|t| item_tags.contains(t)),
            TagMatch::All => query.iter().all(|t| item_tags.contains(t)),
        }
    }
}

/// Named tags queried by the search language.
pub type NamedTags = BTreeMap<String, serde_json::Value>;

/// Invalidation dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Dependency {
    /// Invalidate when any of these keys changes
    Keys(Vec<String>),
    /// Invalidate when any of these files changes
    Files(Vec<String>),
}

/// Dependency on an item in another cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncDependency {
    pub cache_id: String,
    pub key: String,
}

/// Expiration in the engine's terms, validated from an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpirationHint {
    None,
    Absolute(DateTime<Utc>),
    Sliding(Duration),
}

/// Attributes that may be changed on an existing item.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemAttributes {
    pub absolute_expiration: Option<DateTime<Utc>>,
}

// =============================================================================
// Cache Item
// =============================================================================

/// A value plus its cache configuration.
#[derive(Debug, Clone)]
pub struct CacheItem {
    pub value: Payload,
    /// Encoding flags of `value`
    pub payload_flags: OperationFlags,
    pub dependency: Option<Dependency>,
    pub sync_dependency: Option<SyncDependency>,
    pub absolute_expiration: Option<DateTime<Utc>>,
    pub sliding_expiration: Option<Duration>,
    pub priority: ItemPriority,
    pub group: Option<GroupInfo>,
    pub tags: Vec<Tag>,
    pub named_tags: NamedTags,
    /// Re-fetch through the read-through provider on expiry
    pub resync_expired: bool,
    pub resync_provider: Option<String>,
    pub on_updated: Option<ItemCallback>,
    pub on_removed: Option<ItemCallback>,
    pub size_hint: Option<u64>,
    /// Version read from the cache, set by `get_cache_item`
    pub version: Option<ItemVersion>,
}

impl CacheItem {
    pub fn new(value: Payload) -> Self {
        Self {
            value,
            payload_flags: OperationFlags::empty(),
            dependency: None,
            sync_dependency: None,
            absolute_expiration: None,
            sliding_expiration: None,
            priority: ItemPriority::default(),
            group: None,
            tags: Vec::new(),
            named_tags: NamedTags::new(),
            resync_expired: false,
            resync_provider: None,
            on_updated: None,
            on_removed: None,
            size_hint: None,
            version: None,
        }
    }

    pub fn with_absolute_expiration(mut self, at: DateTime<Utc>) -> Self {
        self.absolute_expiration = Some(at);
        self
    }

    pub fn with_sliding_expiration(mut self, idle: Duration) -> Self {
        self.sliding_expiration = Some(idle);
        self
    }

    pub fn with_priority(mut self, priority: ItemPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_group(mut self, group: impl Into<String>, sub_group: Option<&str>) -> Self {
        self.group = Some(GroupInfo::new(group, sub_group.map(str::to_string)));
        self
    }

    pub fn with_tags<I, T>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(|t| Tag::new(t)));
        self
    }

    pub fn with_named_tag(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.named_tags.insert(name.into(), value);
        self
    }

    pub fn with_dependency(mut self, dependency: Dependency) -> Self {
        self.dependency = Some(dependency);
        self
    }

    pub fn with_sync_dependency(mut self, cache_id: impl Into<String>, key: impl Into<String>) -> Self {
        self.sync_dependency = Some(SyncDependency {
            cache_id: cache_id.into(),
            key: key.into(),
        });
        self
    }

    pub fn with_resync(mut self, provider: Option<&str>) -> Self {
        self.resync_expired = true;
        self.resync_provider = provider.map(str::to_string);
        self
    }

    pub fn with_size_hint(mut self, size: u64) -> Self {
        self.size_hint = Some(size);
        self
    }

    /// Notify `callback` when this item is updated.
    pub fn on_updated(mut self, callback: ItemCallback) -> Self {
        self.on_updated = Some(callback);
        self
    }

    /// Notify `callback` when this item is removed.
    pub fn on_removed(mut self, callback: ItemCallback) -> Self {
        self.on_removed = Some(callback);
        self
    }

    /// Check the item before it is submitted.
    pub fn validate(&self, key: &str) -> Result<()> {
        self.expiration(key).map(|_| ())
    }

    /// The single active expiration, or an error if both kinds are set.
    pub fn expiration(&self, key: &str) -> Result<ExpirationHint> {
        match (self.absolute_expiration, self.sliding_expiration) {
            (Some(_), Some(_)) => Err(Error::ConflictingExpiration {
                key: key.to_string(),
            }),
            (Some(at), None) => Ok(ExpirationHint::Absolute(at)),
            (None, Some(idle)) => Ok(ExpirationHint::Sliding(idle)),
            (None, None) => Ok(ExpirationHint::None),
        }
    }

    /// Largest data filter requested by the item's callbacks.
    pub fn callback_filter(&self) -> EventDataFilter {
        [&self.on_updated, &self.on_removed]
            .into_iter()
            .flatten()
            .map(|cb| cb.filter)
            .max()
            .unwrap_or(EventDataFilter::None)
    }
}

/// Reject null/empty keys.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::InvalidArgument("key cannot be empty".into()));
    }
    Ok(())
}

/// Reject empty bulk key sets, empty keys and duplicate keys.
pub fn validate_keys(keys: &[String]) -> Result<()> {
    if keys.is_empty() {
        return Err(Error::InvalidArgument("key set cannot be empty".into()));
    }
    let mut seen = std::collections::HashSet::with_capacity(keys.len());
    for key in keys {
        validate_key(key)?;
        if !seen.insert(key.as_str()) {
            return Err(Error::InvalidArgument(format!("duplicate key '{}'", key)));
        }
    }
    Ok(())
}
