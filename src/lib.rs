//! Rate limiting over pluggable storage.
//!
//! `rategate` provides three rate limiting algorithms behind one `Limiter`
//! contract:
//!
//! - **Token Bucket**: bursts up to a capacity, continuous refill
//! - **Fixed Window**: one counter per epoch-aligned window
//! - **Sliding Window**: weighted estimate over the current and previous window
//!
//! State lives in a [`Storage`] backend: an in-process concurrent map, or
//! Redis for limits shared between processes. Backends that can evaluate a
//! whole admission decision atomically (Redis, via Lua) do so; others are
//! driven through optimistic compare-and-swap.
//!
//! # Quick Start
//!
//! ```ignore
//! use rategate::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> rategate::Result<()> {
//!     let limiter = TokenBucket::new(MemoryStorage::new(), Config::per_second(10).with_burst(15))?;
//!
//!     if limiter.allow("user:123").await? {
//!         println!("Request allowed!");
//!     } else {
//!         let stats = limiter.stats("user:123").await?;
//!         println!("Rate limited! Retry after {:?}", stats.reset_after());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Feature Flags
//!
//! - `memory` (default): In-memory storage with garbage collection
//! - `redis`: Redis storage backend
//! - `full`: Both backends

pub mod config;
pub mod error;
pub mod headers;
pub mod limiter;
pub mod stats;
pub mod storage;

// Re-export main types
pub use config::{Config, ConfigBuilder};
pub use error::{ConfigError, ConnectionError, RateLimitError, Result, StorageError};
pub use headers::RateLimitHeaders;
pub use limiter::{AlgorithmKind, AnyLimiter, FixedWindow, Limiter, SlidingWindow, TokenBucket};
pub use stats::Stats;
pub use storage::{BucketState, Storage, StoredValue};

#[cfg(feature = "memory")]
pub use storage::{GcConfig, GcInterval, MemoryStorage};

#[cfg(feature = "redis")]
pub use storage::{RedisConfig, RedisStorage};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{RateLimitError, Result};
    pub use crate::limiter::{
        AlgorithmKind, AnyLimiter, FixedWindow, Limiter, SlidingWindow, TokenBucket,
    };
    pub use crate::stats::Stats;
    pub use crate::storage::Storage;

    #[cfg(feature = "memory")]
    pub use crate::storage::{GcConfig, GcInterval, MemoryStorage};

    #[cfg(feature = "redis")]
    pub use crate::storage::{RedisConfig, RedisStorage};
}
