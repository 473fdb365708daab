//! Sliding Window rate limiting algorithm.
//!
//! Approximates a true sliding log with two counters: the current window's
//! exact count plus the previous window's count, weighted by how much of the
//! previous window still overlaps the sliding interval:
//!
//! ```text
//! weight   = clamp(1 - elapsed_in_current / window, 0, 1)
//! estimate = ceil(previous * weight + current)
//! ```

use std::time::Duration;

use tracing::{debug, trace};

use crate::config::Config;
use crate::error::{RateLimitError, Result, StorageError};
use crate::limiter::{Limiter, WindowSpan, read_counter};
use crate::stats::Stats;
use crate::storage::{SlidingWindowParams, Storage, StoredValue, current_timestamp_ms};

/// Sliding Window rate limiter.
#[derive(Debug, Clone)]
pub struct SlidingWindow<S> {
    storage: S,
    config: Config,
}

/// Weighted request count; negative counters count as zero.
pub(crate) fn weighted_estimate(previous: i64, current: i64, weight: f64) -> u64 {
    let previous = previous.max(0) as f64;
    let current = current.max(0) as f64;
    (previous * weight.clamp(0.0, 1.0) + current).ceil() as u64
}

impl<S: Storage> SlidingWindow<S> {
    /// Create a sliding window limiter over `storage`.
    pub fn new(storage: S, config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self { storage, config })
    }

    /// Get the underlying storage.
    pub fn storage(&self) -> &S {
        &self.storage
    }

    fn ttl(&self) -> Duration {
        self.config.window().saturating_mul(2)
    }

    /// Generic path: read the previous window once, then retry a conditional
    /// swap on the current counter until it lands.
    async fn charge(
        &self,
        current_key: &str,
        previous_key: &str,
        params: &SlidingWindowParams,
    ) -> Result<bool> {
        let previous = read_counter(&self.storage, previous_key).await?.unwrap_or(0);

        loop {
            let observed = self.storage.get(current_key).await?;
            let current = match &observed {
                None => 0,
                Some(StoredValue::Counter(count)) => *count,
                Some(other) => {
                    return Err(
                        StorageError::type_mismatch(current_key, "counter", other.kind()).into(),
                    );
                }
            };

            let estimate = weighted_estimate(previous, current, params.weight);
            if estimate.saturating_add(params.requested) > params.limit {
                return Ok(false);
            }

            let next = StoredValue::Counter(current.max(0) + params.requested as i64);
            if self
                .storage
                .compare_and_swap(current_key, observed.as_ref(), next, params.ttl)
                .await?
            {
                return Ok(true);
            }

            trace!(key = current_key, "sliding window update raced with another writer, retrying");
        }
    }
}

impl<S: Storage> Limiter for SlidingWindow<S> {
    fn name(&self) -> &'static str {
        "sliding_window"
    }

    fn config(&self) -> &Config {
        &self.config
    }

    async fn allow_n(&self, key: &str, n: u64) -> Result<bool> {
        let rate = self.config.rate();
        if n > rate {
            debug!(algorithm = "sliding_window", key, n, rate, "request larger than the limit");
            return Ok(false);
        }

        let now_ms = current_timestamp_ms();
        let window = WindowSpan::containing(now_ms, self.config.window_ms());
        let current_key = window.key(key);
        let previous_key = window.previous().key(key);
        let params = SlidingWindowParams {
            requested: n,
            limit: rate,
            weight: window.previous_weight(now_ms),
            ttl: self.ttl(),
        };

        let allowed = match self
            .storage
            .sliding_window_allow(&current_key, &previous_key, &params)
            .await?
        {
            Some(allowed) => allowed,
            None => self.charge(&current_key, &previous_key, &params).await?,
        };

        if !allowed {
            debug!(algorithm = "sliding_window", key, n, "rate limit exceeded");
        }
        Ok(allowed)
    }

    async fn reset(&self, key: &str) -> Result<()> {
        let window = WindowSpan::containing(current_timestamp_ms(), self.config.window_ms());
        self.storage.delete(&window.key(key)).await?;
        self.storage.delete(&window.previous().key(key)).await
    }

    async fn stats(&self, key: &str) -> Result<Stats> {
        let now_ms = current_timestamp_ms();
        let window = WindowSpan::containing(now_ms, self.config.window_ms());
        let current_key = window.key(key);

        let current = read_counter(&self.storage, &current_key).await?;
        let previous = read_counter(&self.storage, &window.previous().key(key)).await?;
        if current.is_none() && previous.is_none() {
            return Err(RateLimitError::NotFound(current_key));
        }

        let estimate = weighted_estimate(
            previous.unwrap_or(0),
            current.unwrap_or(0),
            window.previous_weight(now_ms),
        );
        let rate = self.config.rate();
        Ok(Stats::at_ms(
            rate,
            rate.saturating_sub(estimate),
            window.end_ms(),
        ))
    }
}
