//! Per-call options and results of the operation contract.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::events::ItemCallbackIds;
use super::flags::OperationFlags;
use super::item::{ExpirationHint, GroupInfo, ItemPriority, ValueEntry};
use super::lock::{ItemVersion, LockAccessType, LockHandle};
use crate::error::ServerFault;

// =============================================================================
// Writes
// =============================================================================

/// Options for `add` / `insert` and their bulk forms.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteOptions {
    pub flags: OperationFlags,
    pub callbacks: ItemCallbackIds,
    pub lock_id: Option<String>,
    /// Expected current version; the write fails if it differs
    pub version: Option<ItemVersion>,
    pub access: LockAccessType,
    /// Write-through provider
    pub provider: Option<String>,
}

impl WriteOptions {
    pub fn with_flags(flags: OperationFlags) -> Self {
        Self {
            flags,
            ..Default::default()
        }
    }

    /// Write under a lock obtained from `lock`.
    pub fn with_lock(mut self, lock: &LockHandle, access: LockAccessType) -> Self {
        self.lock_id = lock.lock_id.clone();
        self.access = access;
        self
    }

    pub fn with_version(mut self, version: ItemVersion) -> Self {
        self.version = Some(version);
        self
    }
}

/// Outcome of a bulk write.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkWriteResult {
    /// Keys that failed, with the reason
    pub failures: HashMap<String, ServerFault>,
    /// Versions of the keys that were written
    pub versions: HashMap<String, ItemVersion>,
}

impl BulkWriteResult {
    pub fn merge(&mut self, other: BulkWriteResult) {
        self.failures.extend(other.failures);
        self.versions.extend(other.versions);
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

// =============================================================================
// Reads
// =============================================================================

/// Options for `get`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GetOptions {
    pub flags: OperationFlags,
    /// Only return the item if it belongs to this group
    pub group: Option<GroupInfo>,
    /// Only return the item if its version is newer than this
    pub version: Option<ItemVersion>,
    /// Lock presented (or filled in when acquiring)
    pub lock: LockHandle,
    /// Lock duration when `access` is `Acquire`
    pub lock_timeout: Option<Duration>,
    pub access: LockAccessType,
    /// Read-through provider
    pub provider: Option<String>,
}

impl GetOptions {
    pub fn with_lock(lock: LockHandle, access: LockAccessType) -> Self {
        Self {
            lock,
            access,
            ..Default::default()
        }
    }

    pub fn acquire(timeout: Duration) -> Self {
        Self {
            access: LockAccessType::Acquire,
            lock_timeout: Some(timeout),
            ..Default::default()
        }
    }
}

/// Outcome of `get`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GetResult {
    pub value: Option<ValueEntry>,
    pub version: Option<ItemVersion>,
    /// Lock state after the read
    pub lock: LockHandle,
}

/// Outcome of `get_bulk`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkGetResult {
    pub values: HashMap<String, ValueEntry>,
    pub versions: HashMap<String, ItemVersion>,
}

impl BulkGetResult {
    pub fn merge(&mut self, other: BulkGetResult) {
        self.values.extend(other.values);
        self.versions.extend(other.versions);
    }
}

// =============================================================================
// Removes
// =============================================================================

/// Options for `remove` / `delete` and their bulk forms.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoveOptions {
    pub flags: OperationFlags,
    pub lock_id: Option<String>,
    pub version: Option<ItemVersion>,
    pub access: LockAccessType,
    pub provider: Option<String>,
}

impl RemoveOptions {
    pub fn with_lock(lock: &LockHandle) -> Self {
        Self {
            lock_id: lock.lock_id.clone(),
            access: LockAccessType::UseLock,
            ..Default::default()
        }
    }
}

// =============================================================================
// Streams
// =============================================================================

/// Access mode of a cache stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamMode {
    Read,
    ReadWithoutLock,
    Write,
}

/// Item settings used when a write stream creates its key.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamOptions {
    pub group: Option<GroupInfo>,
    pub expiration: ExpirationHint,
    pub priority: ItemPriority,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            group: None,
            expiration: ExpirationHint::None,
            priority: ItemPriority::default(),
        }
    }
}

// =============================================================================
// Misc Results
// =============================================================================

/// Keys changed since the last poll.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollResult {
    pub updated: Vec<String>,
    pub removed: Vec<String>,
}

impl PollResult {
    pub fn merge(&mut self, other: PollResult) {
        self.updated.extend(other.updated);
        self.removed.extend(other.removed);
    }

    pub fn is_empty(&self) -> bool {
        self.updated.is_empty() && self.removed.is_empty()
    }
}

/// Per-key outcome of an entry processor.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessorOutcome {
    Value(Option<serde_json::Value>),
    Failed(String),
}

/// A MapReduce task forwarded to the cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapReduceTask {
    pub name: String,
    pub params: serde_json::Value,
}

/// Identity of a client connected to a cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub client_id: String,
    pub process_id: u32,
    pub machine_name: String,
    pub app_name: String,
    pub client_version: u32,
}

/// Client protocol version reported in [`ClientInfo`].
pub const CLIENT_VERSION: u32 = 5000;

impl ClientInfo {
    /// Describe the current process.
    pub fn current(app_name: Option<&str>) -> Self {
        let process_id = std::process::id();
        let app_name = app_name.map(str::to_string).unwrap_or_else(|| {
            std::env::current_exe()
                .ok()
                .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
                .unwrap_or_else(|| format!("process-{}", process_id))
        });
        Self {
            client_id: uuid::Uuid::new_v4().to_string(),
            process_id,
            machine_name: std::env::var("HOSTNAME")
                .or_else(|_| std::env::var("COMPUTERNAME"))
                .unwrap_or_else(|_| "localhost".to_string()),
            app_name,
            client_version: CLIENT_VERSION,
        }
    }
}
