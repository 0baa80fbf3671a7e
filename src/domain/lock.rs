//! Lock handles and item versions.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Base of the version clock (2016-01-01T00:00:00Z).
const VERSION_EPOCH_MS: i64 = 1_451_606_400_000;

/// Monotonic version marker for a cached item.
///
/// Either supplied by the caller as an optimistic-concurrency token or
/// assigned by the engine. Engine-assigned versions are milliseconds since
/// a fixed epoch, bumped past the previous version when the clock has not
/// advanced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ItemVersion(pub u64);

impl ItemVersion {
    pub fn new(version: u64) -> Self {
        Self(version)
    }

    /// Version derived from a timestamp.
    pub fn from_timestamp(at: DateTime<Utc>) -> Self {
        Self(at.timestamp_millis().saturating_sub(VERSION_EPOCH_MS).max(0) as u64)
    }

    /// Next version after `previous`, derived from `now`.
    pub fn next_after(previous: Option<ItemVersion>, now: DateTime<Utc>) -> Self {
        let candidate = Self::from_timestamp(now);
        match previous {
            Some(prev) if candidate <= prev => Self(prev.0 + 1),
            _ => candidate,
        }
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ItemVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Opaque lock identifier plus acquisition time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockHandle {
    pub lock_id: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
}

impl LockHandle {
    pub fn new(lock_id: impl Into<String>, locked_at: DateTime<Utc>) -> Self {
        Self {
            lock_id: Some(lock_id.into()),
            locked_at: Some(locked_at),
        }
    }

    /// Handle carrying no lock.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_held(&self) -> bool {
        self.lock_id.is_some()
    }

    pub fn lock_id(&self) -> Option<&str> {
        self.lock_id.as_deref()
    }

    /// Overwrite with the lock state reported by a server.
    pub fn update(&mut self, other: LockHandle) {
        self.lock_id = other.lock_id;
        self.locked_at = other.locked_at;
    }

    /// Lock date as reported on the wire (unix millis, zero when unlocked).
    pub fn locked_at_millis(&self) -> i64 {
        self.locked_at.map(|t| t.timestamp_millis()).unwrap_or(0)
    }

    /// Rebuild a handle from wire fields.
    pub fn from_wire(lock_id: Option<String>, locked_at_millis: i64) -> Self {
        let locked_at = if locked_at_millis > 0 {
            Utc.timestamp_millis_opt(locked_at_millis).single()
        } else {
            None
        };
        Self { lock_id, locked_at }
    }
}

impl std::fmt::Display for LockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.lock_id, &self.locked_at) {
            (Some(id), Some(at)) => write!(f, "{} since {}", id, at.to_rfc3339()),
            (Some(id), None) => write!(f, "{}", id),
            _ => write!(f, "<none>"),
        }
    }
}

/// How an operation treats an existing lock on its key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockAccessType {
    /// Respect locks; fail if the key is locked by someone else
    #[default]
    Default,
    /// Acquire a lock as part of a read
    Acquire,
    /// Present a lock id that must match the current lock
    UseLock,
    /// Present a lock id and release the lock after the write
    Release,
    /// Present a lock id and keep the lock after the write
    DontRelease,
    /// Bypass lock checks entirely
    IgnoreLock,
}

impl LockAccessType {
    /// Whether the caller must present a matching lock id.
    pub fn requires_lock_id(self) -> bool {
        matches!(
            self,
            LockAccessType::UseLock | LockAccessType::Release | LockAccessType::DontRelease
        )
    }
}

impl std::fmt::Display for LockAccessType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LockAccessType::Default => "default",
            LockAccessType::Acquire => "acquire",
            LockAccessType::UseLock => "use-lock",
            LockAccessType::Release => "release",
            LockAccessType::DontRelease => "dont-release",
            LockAccessType::IgnoreLock => "ignore-lock",
        };
        write!(f, "{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_is_monotonic_when_clock_stalls() {
        let now = Utc::now();
        let first = ItemVersion::next_after(None, now);
        let second = ItemVersion::next_after(Some(first), now);
        let third = ItemVersion::next_after(Some(second), now);

        assert!(second > first);
        assert!(third > second);
    }

    #[test]
    fn test_lock_handle_wire_roundtrip() {
        let handle = LockHandle::new("abc", Utc.timestamp_millis_opt(1_700_000_000_123).unwrap());
        let rebuilt = LockHandle::from_wire(
            handle.lock_id.clone(),
            handle.locked_at_millis(),
        );
        assert_eq!(rebuilt, handle);
        assert_eq!(LockHandle::from_wire(None, 0), LockHandle::none());
    }
}
