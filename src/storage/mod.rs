//! Storage backend trait and implementations.
//!
//! This module defines the `Storage` trait that all storage backends must implement,
//! along with built-in implementations for in-memory and Redis storage.

#[cfg(feature = "memory")]
mod memory;
#[cfg(feature = "redis")]
mod redis;
mod value;

pub use value::{BucketState, StoredValue};

#[cfg(feature = "memory")]
pub use memory::{GcConfig, GcInterval, MemoryStorage};

#[cfg(feature = "redis")]
pub use redis::{RedisConfig, RedisStorage};

use std::future::Future;
use std::time::Duration;

use crate::error::Result;

/// Parameters of an atomic token bucket charge.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenBucketParams {
    /// Tokens to take.
    pub requested: u64,
    /// Bucket capacity.
    pub capacity: u64,
    /// Tokens restored per second.
    pub refill_rate: f64,
    /// Caller's clock (Unix milliseconds).
    pub now_ms: u64,
    /// Expiry applied to the bucket record.
    pub ttl: Duration,
}

/// Parameters of an atomic fixed window charge.
#[derive(Debug, Clone, PartialEq)]
pub struct FixedWindowParams {
    /// Units to add to the window counter.
    pub requested: u64,
    /// Maximum count for the window.
    pub limit: u64,
    /// Expiry applied when the counter is created.
    pub ttl: Duration,
}

/// Parameters of an atomic sliding window charge.
#[derive(Debug, Clone, PartialEq)]
pub struct SlidingWindowParams {
    /// Units to add to the current window counter.
    pub requested: u64,
    /// Maximum weighted estimate.
    pub limit: u64,
    /// Fraction of the previous window still counted, in `[0, 1]`.
    pub weight: f64,
    /// Expiry applied when the counter is created.
    pub ttl: Duration,
}

/// Storage backend trait for rate limiting state.
///
/// All storage operations are async to support both local and distributed backends.
/// Implementations must be thread-safe (`Send + Sync`) and make every single
/// operation atomic with respect to concurrent callers on the same key.
///
/// # Required Operations
///
/// - `get`: Retrieve a live value by key
/// - `set`: Store a value with a TTL
/// - `delete`: Remove a value
/// - `increment`: Atomically add to a counter
/// - `compare_and_swap`: Replace a value only if it is unchanged
///
/// # Composite Operations
///
/// `token_bucket_allow`, `fixed_window_allow` and `sliding_window_allow` let a
/// backend evaluate a whole admission decision in one atomic step. The
/// default implementations return `Ok(None)`, which tells the limiter to fall
/// back to the generic operations above.
pub trait Storage: Send + Sync + 'static {
    /// Get a value by key.
    ///
    /// Returns `None` if the key doesn't exist or has expired.
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<StoredValue>>> + Send;

    /// Set a value with a TTL.
    fn set(
        &self,
        key: &str,
        value: StoredValue,
        ttl: Duration,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Atomically add `delta` to a counter.
    ///
    /// A missing or expired key starts from zero and gets the given TTL; an
    /// existing counter keeps its expiry. Returns the count after adding.
    fn increment(
        &self,
        key: &str,
        delta: i64,
        ttl: Duration,
    ) -> impl Future<Output = Result<i64>> + Send;

    /// Delete a value.
    ///
    /// Returns success even if the key didn't exist.
    fn delete(&self, key: &str) -> impl Future<Output = Result<()>> + Send;

    /// Compare-and-swap operation.
    ///
    /// If the live value equals `expected` (`None` meaning absent or expired),
    /// it is replaced with `new` and the TTL is reset. Returns `true` if the
    /// swap succeeded.
    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&StoredValue>,
        new: StoredValue,
        ttl: Duration,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Refill and charge a token bucket in one atomic step.
    fn token_bucket_allow(
        &self,
        key: &str,
        params: &TokenBucketParams,
    ) -> impl Future<Output = Result<Option<bool>>> + Send {
        let _ = (key, params);
        std::future::ready(Ok(None))
    }

    /// Increment, check and roll back a window counter in one atomic step.
    fn fixed_window_allow(
        &self,
        key: &str,
        params: &FixedWindowParams,
    ) -> impl Future<Output = Result<Option<bool>>> + Send {
        let _ = (key, params);
        std::future::ready(Ok(None))
    }

    /// Read both window counters, weigh them and conditionally increment the
    /// current one, in one atomic step.
    fn sliding_window_allow(
        &self,
        current_key: &str,
        previous_key: &str,
        params: &SlidingWindowParams,
    ) -> impl Future<Output = Result<Option<bool>>> + Send {
        let _ = (current_key, previous_key, params);
        std::future::ready(Ok(None))
    }
}

impl<S: Storage + ?Sized> Storage for std::sync::Arc<S> {
    async fn get(&self, key: &str) -> Result<Option<StoredValue>> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, value: StoredValue, ttl: Duration) -> Result<()> {
        (**self).set(key, value, ttl).await
    }

    async fn increment(&self, key: &str, delta: i64, ttl: Duration) -> Result<i64> {
        (**self).increment(key, delta, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        (**self).delete(key).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&StoredValue>,
        new: StoredValue,
        ttl: Duration,
    ) -> Result<bool> {
        (**self).compare_and_swap(key, expected, new, ttl).await
    }

    async fn token_bucket_allow(
        &self,
        key: &str,
        params: &TokenBucketParams,
    ) -> Result<Option<bool>> {
        (**self).token_bucket_allow(key, params).await
    }

    async fn fixed_window_allow(
        &self,
        key: &str,
        params: &FixedWindowParams,
    ) -> Result<Option<bool>> {
        (**self).fixed_window_allow(key, params).await
    }

    async fn sliding_window_allow(
        &self,
        current_key: &str,
        previous_key: &str,
        params: &SlidingWindowParams,
    ) -> Result<Option<bool>> {
        (**self)
            .sliding_window_allow(current_key, previous_key, params)
            .await
    }
}

impl<S: Storage + ?Sized> Storage for Box<S> {
    async fn get(&self, key: &str) -> Result<Option<StoredValue>> {
        (**self).get(key).await
    }

    async fn set(&self, key: &str, value: StoredValue, ttl: Duration) -> Result<()> {
        (**self).set(key, value, ttl).await
    }

    async fn increment(&self, key: &str, delta: i64, ttl: Duration) -> Result<i64> {
        (**self).increment(key, delta, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        (**self).delete(key).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&StoredValue>,
        new: StoredValue,
        ttl: Duration,
    ) -> Result<bool> {
        (**self).compare_and_swap(key, expected, new, ttl).await
    }

    async fn token_bucket_allow(
        &self,
        key: &str,
        params: &TokenBucketParams,
    ) -> Result<Option<bool>> {
        (**self).token_bucket_allow(key, params).await
    }

    async fn fixed_window_allow(
        &self,
        key: &str,
        params: &FixedWindowParams,
    ) -> Result<Option<bool>> {
        (**self).fixed_window_allow(key, params).await
    }

    async fn sliding_window_allow(
        &self,
        current_key: &str,
        previous_key: &str,
        params: &SlidingWindowParams,
    ) -> Result<Option<bool>> {
        (**self)
            .sliding_window_allow(current_key, previous_key, params)
            .await
    }
}

/// Get the current timestamp in milliseconds since Unix epoch.
pub fn current_timestamp_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
