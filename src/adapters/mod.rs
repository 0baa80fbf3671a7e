//! Infrastructure Adapters
//!
//! Implementations of the domain ports that run entirely in memory.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          Domain Ports                            │
//! │         CacheStrategy │ CacheEngine │ Broker + KeyRouter         │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │  InprocCache      strategy over a local engine                   │
//! │  InMemoryEngine   engine with locks, queries, streams, topics    │
//! │  MockCluster      multi-server broker with fault injection       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use clustra::adapters::{InMemoryEngine, InprocCache};
//!
//! let engine = Arc::new(InMemoryEngine::new("orders"));
//! let cache = InprocCache::new("orders", engine, ClientConfig::default(), sink);
//! cache.insert("order:1", &item, &WriteOptions::default()).await?;
//! ```

mod inproc;
mod memory_engine;
mod mock_cluster;
mod query_eval;

pub use inproc::InprocCache;
pub use memory_engine::{EngineStats, InMemoryEngine, LOCAL_ADDRESS};
pub use mock_cluster::{JournalEntry, JournaledCommand, MockCluster};
pub use query_eval::ParsedQuery;
