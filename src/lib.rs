//! Clustra - Dual-Strategy Distributed Cache Client
//!
//! One operation contract, two implementations: an in-process cache backed
//! by a local engine, and a remote cache that talks to a cluster of cache
//! servers through a broker.
//!
//! # Architecture
//!
//! ```text
//!   application
//!       │
//!       ▼
//!   CacheRegistry ──▶ Cache (facade)
//!                        │  Arc<dyn CacheStrategy>
//!          ┌─────────────┴──────────────┐
//!          ▼                            ▼
//!     InprocCache                  RemoteCache
//!     └── CacheEngine              ├── Dispatcher (latch, routing, view ids)
//!                                  ├── Broker ──▶ servers
//!                                  └── DistributedReader (partition merge)
//! ```
//!
//! The remote strategy shards bulk calls by key owner, retries on a
//! dedicated connection when a server reports it is blocked or transferring
//! state, and merges per-server query readers into one cursor.
//!
//! # Modules
//!
//! - [`adapters`] - In-process strategy, in-memory engine, mock cluster
//! - [`compression`] - LZ4 payload compression
//! - [`config`] - Client configuration
//! - [`domain`] - Value types and ports, including the operation contract
//! - [`error`] - Error types
//! - [`facade`] - Cache handle and registry
//! - [`reader`] - Distributed reader merge
//! - [`remote`] - Remote strategy

pub mod adapters;
pub mod compression;
pub mod config;
pub mod domain;
pub mod error;
pub mod facade;
pub mod reader;
pub mod remote;

// Re-export commonly used types
pub use adapters::{InMemoryEngine, InprocCache, MockCluster};
pub use config::ClientConfig;
pub use domain::ports::{Broker, CacheEngine, CacheStrategy};
pub use error::{Error, Result};
pub use facade::{Cache, CacheInitParams, CacheMode, CacheRegistry};
pub use remote::RemoteCache;

/// Client protocol version reported to servers.
pub fn client_version() -> u32 {
    domain::options::CLIENT_VERSION
}
