//! Cache Registry
//!
//! Explicitly constructed registry of open named caches. Opening a name that
//! is already open hands out the same [`Cache`] and bumps its reference
//! count; the strategy is torn down when the last reference is closed.
//!
//! ```text
//!   open("orders") ──▶ refs 1  (strategy built)
//!   open("orders") ──▶ refs 2  (same Arc<Cache>)
//!   close("orders") ─▶ refs 1
//!   close("orders") ─▶ refs 0  (removed, strategy disposed)
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use super::cache::Cache;
use super::notifications::EventManager;
use crate::adapters::InprocCache;
use crate::config::ClientConfig;
use crate::domain::ports::{Broker, CacheStrategy, Clock, NotificationSink, SharedEngine, SystemClock};
use crate::error::{Error, Result};
use crate::remote::RemoteCache;

/// Where a cache's data lives.
#[derive(Clone)]
pub enum CacheMode {
    /// In this process, in `engine`
    InProc { engine: SharedEngine },
    /// In a cluster reached through `broker`
    OutProc { broker: Arc<dyn Broker> },
}

impl std::fmt::Debug for CacheMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheMode::InProc { engine } => write!(f, "InProc({})", engine.name()),
            CacheMode::OutProc { .. } => write!(f, "OutProc"),
        }
    }
}

/// Parameters for opening a cache.
#[derive(Debug, Clone)]
pub struct CacheInitParams {
    pub mode: CacheMode,
    pub config: ClientConfig,
    pub clock: Arc<dyn Clock>,
}

impl CacheInitParams {
    pub fn in_proc(engine: SharedEngine) -> Self {
        Self {
            mode: CacheMode::InProc { engine },
            config: ClientConfig::default(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn out_proc(broker: Arc<dyn Broker>) -> Self {
        Self {
            mode: CacheMode::OutProc { broker },
            config: ClientConfig::default(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

struct Entry {
    cache: Arc<Cache>,
    refs: usize,
}

/// Named caches open in this process.
#[derive(Default)]
pub struct CacheRegistry {
    caches: Mutex<HashMap<String, Entry>>,
}

impl CacheRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open `name`, or take another reference to it if it is already open.
    ///
    /// `params` only apply when the cache is first opened.
    pub fn open(&self, name: &str, params: CacheInitParams) -> Result<Arc<Cache>> {
        if name.is_empty() {
            return Err(Error::InvalidArgument("cache name cannot be empty".into()));
        }
        let mut caches = self.caches.lock();
        if let Some(entry) = caches.get_mut(name) {
            entry.refs += 1;
            debug!(cache = %name, refs = entry.refs, "Cache already open, reference added");
            return Ok(Arc::clone(&entry.cache));
        }

        params.config.validate()?;
        let cache = Arc::new(Self::build(name, params));
        caches.insert(
            name.to_string(),
            Entry {
                cache: Arc::clone(&cache),
                refs: 1,
            },
        );
        info!(cache = %name, strategy = cache.strategy_name(), "Cache opened");
        Ok(cache)
    }

    fn build(name: &str, params: CacheInitParams) -> Cache {
        let events = Arc::new(EventManager::new(name, params.config.notify_async));
        let sink: Arc<dyn NotificationSink> = Arc::clone(&events) as Arc<dyn NotificationSink>;
        let strategy: Arc<dyn CacheStrategy> = match params.mode {
            CacheMode::InProc { engine } => Arc::new(InprocCache::new(name, engine, params.config, sink)),
            CacheMode::OutProc { broker } => RemoteCache::new(name, broker, params.config, params.clock, sink),
        };
        Cache::new(name.to_string(), strategy, events)
    }

    /// Drop one reference to `name`; the last one disposes the cache.
    pub async fn close(&self, name: &str) -> Result<()> {
        let released = {
            let mut caches = self.caches.lock();
            let entry = caches
                .get_mut(name)
                .ok_or_else(|| Error::CacheNotFound(name.to_string()))?;
            entry.refs -= 1;
            debug!(cache = %name, refs = entry.refs, "Cache reference closed");
            if entry.refs == 0 {
                caches.remove(name).map(|e| e.cache)
            } else {
                None
            }
        };
        if let Some(cache) = released {
            cache.dispose().await?;
            info!(cache = %name, "Cache closed");
        }
        Ok(())
    }

    pub fn is_open(&self, name: &str) -> bool {
        self.caches.lock().contains_key(name)
    }

    pub fn ref_count(&self, name: &str) -> usize {
        self.caches.lock().get(name).map_or(0, |e| e.refs)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.caches.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Dispose every open cache regardless of reference counts.
    pub async fn shutdown(&self) -> Result<()> {
        let drained: Vec<(String, Arc<Cache>)> = self
            .caches
            .lock()
            .drain()
            .map(|(name, entry)| (name, entry.cache))
            .collect();
        info!(caches = drained.len(), "Shutting down cache registry");
        for (_, cache) in drained {
            cache.dispose().await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for CacheRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheRegistry")
            .field("caches", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::InMemoryEngine;
    use assert_matches::assert_matches;

    fn params() -> CacheInitParams {
        CacheInitParams::in_proc(Arc::new(InMemoryEngine::new("orders")))
    }

    #[tokio::test]
    async fn test_reopen_shares_cache_and_counts_refs() {
        let registry = CacheRegistry::new();
        let a = registry.open("orders", params()).unwrap();
        let b = registry.open("orders", params()).unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.ref_count("orders"), 2);

        registry.close("orders").await.unwrap();
        assert!(registry.is_open("orders"));
        assert!(!a.is_disposed());

        registry.close("orders").await.unwrap();
        assert!(!registry.is_open("orders"));
        assert!(a.is_disposed());
        assert_matches!(a.count().await, Err(Error::CacheDisposed(_)));
    }

    #[tokio::test]
    async fn test_close_unknown_cache() {
        let registry = CacheRegistry::new();
        assert_matches!(registry.close("missing").await, Err(Error::CacheNotFound(_)));
        assert_matches!(registry.open("", params()), Err(Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let registry = CacheRegistry::new();
        let config = ClientConfig {
            reader_chunk_size: 0,
            ..ClientConfig::default()
        };
        assert_matches!(
            registry.open("orders", params().with_config(config)),
            Err(Error::Config(_))
        );
        assert!(registry.names().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_disposes_everything() {
        let registry = CacheRegistry::new();
        let orders = registry.open("orders", params()).unwrap();
        let _again = registry.open("orders", params()).unwrap();
        let sessions = registry
            .open("sessions", CacheInitParams::in_proc(Arc::new(InMemoryEngine::new("sessions"))))
            .unwrap();
        assert_eq!(registry.names(), vec!["orders".to_string(), "sessions".to_string()]);

        registry.shutdown().await.unwrap();
        assert!(orders.is_disposed() && sessions.is_disposed());
        assert!(registry.names().is_empty());
    }
}
