//! Open-partition registry, keyed by server address.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::domain::ports::ServerAddress;

/// Tracks every open reader partition so a connection loss can invalidate
/// the partitions on that server without scanning the others.
///
/// Connection events arrive on the broker's context while readers are
/// consumed elsewhere, so the map is behind a mutex and each partition
/// observes its validity through a shared flag.
#[derive(Debug, Default)]
pub struct PartitionRegistry {
    open: Mutex<HashMap<ServerAddress, HashMap<String, Arc<AtomicBool>>>>,
}

impl PartitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a partition; the returned flag drops to false on invalidation.
    pub fn register(&self, server: &ServerAddress, reader_id: &str) -> Arc<AtomicBool> {
        let flag = Arc::new(AtomicBool::new(true));
        self.open
            .lock()
            .entry(server.clone())
            .or_default()
            .insert(reader_id.to_string(), Arc::clone(&flag));
        flag
    }

    /// Forget a partition that was exhausted or disposed.
    pub fn deregister(&self, server: &ServerAddress, reader_id: &str) {
        let mut open = self.open.lock();
        if let Some(readers) = open.get_mut(server) {
            readers.remove(reader_id);
            if readers.is_empty() {
                open.remove(server);
            }
        }
    }

    /// Invalidate every partition on `server`; returns how many there were.
    pub fn invalidate_server(&self, server: &ServerAddress) -> usize {
        let removed = self.open.lock().remove(server);
        match removed {
            Some(readers) => {
                for flag in readers.values() {
                    flag.store(false, Ordering::Release);
                }
                tracing::info!(
                    server = %server,
                    partitions = readers.len(),
                    "Invalidated reader partitions after connection loss"
                );
                readers.len()
            }
            None => 0,
        }
    }

    /// Open partitions on `server`.
    pub fn open_on(&self, server: &ServerAddress) -> usize {
        self.open.lock().get(server).map_or(0, HashMap::len)
    }

    /// Open partitions across all servers.
    pub fn open_total(&self) -> usize {
        self.open.lock().values().map(HashMap::len).sum()
    }
}
