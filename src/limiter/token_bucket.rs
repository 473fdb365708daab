//! Token Bucket rate limiting algorithm.

use std::time::Duration;

use tracing::{debug, trace};

use crate::config::Config;
use crate::error::{Result, StorageError};
use crate::limiter::Limiter;
use crate::stats::Stats;
use crate::storage::{BucketState, Storage, StoredValue, TokenBucketParams, current_timestamp_ms};

/// Token Bucket rate limiter.
///
/// Allows controlled bursts while enforcing an average rate limit. Each key
/// holds up to `effective_burst()` tokens, refilled continuously at
/// `rate / window` tokens per second.
#[derive(Debug, Clone)]
pub struct TokenBucket<S> {
    storage: S,
    config: Config,
}

impl<S: Storage> TokenBucket<S> {
    /// Create a token bucket limiter over `storage`.
    pub fn new(storage: S, config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self { storage, config })
    }

    /// Get the underlying storage.
    pub fn storage(&self) -> &S {
        &self.storage
    }

    fn capacity(&self) -> u64 {
        self.config.effective_burst()
    }

    /// Long enough for an idle bucket to refill completely before it expires.
    ///
    /// A bucket with rate 0 never refills, so its burst is a one-off
    /// allowance that only comes back once the key has been idle for
    /// 2 × window and the spent bucket expires.
    fn ttl(&self) -> Duration {
        let window = self.config.window().saturating_mul(2);
        let rate = self.config.rate();
        if rate == 0 {
            return window;
        }

        // 2 × capacity / (rate / window), kept in integer milliseconds.
        let fill_ms = 2 * self.capacity() as u128 * self.config.window_ms() as u128 / rate as u128;
        window.max(Duration::from_millis(u64::try_from(fill_ms).unwrap_or(u64::MAX)))
    }

    /// Generic read-modify-write, retried until the swap lands on the
    /// snapshot it was computed from.
    async fn charge(&self, key: &str, n: u64) -> Result<bool> {
        let capacity = self.capacity();
        let refill_rate = self.config.refill_rate();
        let ttl = self.ttl();

        loop {
            let now_ms = current_timestamp_ms();
            let current = self.storage.get(key).await?;
            let bucket = match &current {
                None => BucketState::full(capacity, refill_rate, now_ms),
                Some(StoredValue::Bucket(bucket)) => bucket.refilled(now_ms, capacity, refill_rate),
                Some(other) => {
                    return Err(StorageError::type_mismatch(key, "bucket", other.kind()).into());
                }
            };

            let (next, allowed) = bucket.take(n);
            if self
                .storage
                .compare_and_swap(key, current.as_ref(), next.into(), ttl)
                .await?
            {
                return Ok(allowed);
            }

            trace!(key, "token bucket update raced with another writer, retrying");
        }
    }
}

impl<S: Storage> Limiter for TokenBucket<S> {
    fn name(&self) -> &'static str {
        "token_bucket"
    }

    fn config(&self) -> &Config {
        &self.config
    }

    async fn allow_n(&self, key: &str, n: u64) -> Result<bool> {
        let params = TokenBucketParams {
            requested: n,
            capacity: self.capacity(),
            refill_rate: self.config.refill_rate(),
            now_ms: current_timestamp_ms(),
            ttl: self.ttl(),
        };

        let allowed = match self.storage.token_bucket_allow(key, &params).await? {
            Some(allowed) => allowed,
            None => self.charge(key, n).await?,
        };

        if !allowed {
            debug!(algorithm = "token_bucket", key, n, "rate limit exceeded");
        }
        Ok(allowed)
    }

    async fn reset(&self, key: &str) -> Result<()> {
        self.storage.delete(key).await
    }

    async fn stats(&self, key: &str) -> Result<Stats> {
        let now_ms = current_timestamp_ms();
        let capacity = self.capacity();

        let bucket = match self.storage.get(key).await? {
            // First access sees a full bucket.
            None => return Ok(Stats::at_ms(capacity, capacity, now_ms)),
            Some(StoredValue::Bucket(bucket)) => {
                bucket.refilled(now_ms, capacity, self.config.refill_rate())
            }
            Some(other) => {
                return Err(StorageError::type_mismatch(key, "bucket", other.kind()).into());
            }
        };

        let until_full = bucket.ms_until_full().unwrap_or(0);
        Ok(Stats::at_ms(
            capacity,
            bucket.remaining(),
            now_ms.saturating_add(until_full),
        ))
    }
}
