//! Remote Strategy
//!
//! Client side of a clustered cache: commands, key distribution, the
//! dedicated-call latch and the strategy that ties them together.
//!
//! ```text
//! RemoteCache ──▶ Dispatcher ──▶ Broker
//!                 │  ├── DedicatedCallLatch   (route: pooled | dedicated)
//!                 │  └── distribute_keys      (one command per server)
//!                 └── ChunkSource for DistributedReader
//! ```

pub mod cache;
pub mod command;
pub mod dispatcher;
pub mod distribution;
pub mod latch;
#[cfg(test)]
mod proptest;

pub use cache::RemoteCache;
pub use command::{
    Command, CommandResponse, Request, Response, ResponseBody, Routing, Target, TargetedCommand,
};
pub use dispatcher::Dispatcher;
pub use distribution::{distribute_keys, KeyDistribution, Partition, ViewIdTag};
pub use latch::{decide, CallRoute, DedicatedCallLatch, LatchState, RetryDecision};
