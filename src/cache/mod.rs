//! Generic caching layer: time, single-flight fetching, refresh throttling
//! and the persisted key-value copy.
//!
//! Nothing in here knows about groups or subscriptions; the `sync` module
//! builds the domain stores on top of these pieces.

pub mod clock;
mod keyed;
mod storage;
mod throttle;
mod traits;

pub use clock::{Clock, ManualClock, SystemClock};
pub use keyed::{KeyedAsyncCache, Lookup, Peek};
pub use storage::{AnyStorage, CacheStorage, EntryInfo, MemoryStorage, NoopStorage, SqliteStorage};
pub use throttle::ThrottledRefresher;
pub use traits::{content_hash, CacheSource, CacheStats, Persistable, Stored, CACHE_VERSION};
