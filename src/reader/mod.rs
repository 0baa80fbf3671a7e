//! Distributed Readers
//!
//! A query reader spans one server-side cursor per contributing server.
//! This module merges them into a single forward-only cursor.
//!
//! ```text
//!   ┌─────────────┐  ┌─────────────┐  ┌─────────────┐
//!   │ partition s1│  │ partition s2│  │ partition s3│   PartitionCursor
//!   └──────┬──────┘  └──────┬──────┘  └──────┬──────┘   (chunked, refetched)
//!          └───────────┬────┴────────────────┘
//!                      ▼
//!             ┌──────────────────┐
//!             │ DistributedReader│  Plain | Ordered | Grouped
//!             └──────────────────┘
//! ```
//!
//! Open partitions are tracked in a [`PartitionRegistry`] keyed by server so
//! a lost connection invalidates exactly the partitions on that server.

mod merge;
mod partition;
mod registry;

pub use merge::{ChunkSource, DistributedReader};
pub use partition::PartitionCursor;
pub use registry::PartitionRegistry;
