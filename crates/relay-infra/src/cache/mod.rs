pub mod timed;

pub use timed::{CacheStats, TimedCache, TimedCacheConfig};
