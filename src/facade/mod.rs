//! Application Facade
//!
//! What applications hold: a [`CacheRegistry`] created at start-up, and the
//! [`Cache`] handles it opens.
//!
//! ```text
//!   CacheRegistry ──open──▶ Arc<Cache> ──▶ strategy (in-process | remote)
//!                                 ├── EventManager   notifications
//!                                 ├── CacheStream    blob streams
//!                                 └── Topic          pub/sub
//! ```

mod cache;
mod notifications;
mod registry;
mod stream;
mod topic;

pub use cache::{Cache, Fetched};
pub use notifications::EventManager;
pub use registry::{CacheInitParams, CacheMode, CacheRegistry};
pub use stream::CacheStream;
pub use topic::{Topic, TopicSubscription};
