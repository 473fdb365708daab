//! Fixed Window rate limiting algorithm.

use std::time::Duration;

use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{RateLimitError, Result};
use crate::limiter::{Limiter, WindowSpan, read_counter};
use crate::stats::Stats;
use crate::storage::{FixedWindowParams, Storage, current_timestamp_ms};

/// Fixed Window rate limiter.
///
/// Counts requests in windows aligned to the Unix epoch. Simple and cheap,
/// but a client can get up to `2 × rate` requests through in a short span
/// straddling two adjacent windows.
#[derive(Debug, Clone)]
pub struct FixedWindow<S> {
    storage: S,
    config: Config,
}

impl<S: Storage> FixedWindow<S> {
    /// Create a fixed window limiter over `storage`.
    pub fn new(storage: S, config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self { storage, config })
    }

    /// Get the underlying storage.
    pub fn storage(&self) -> &S {
        &self.storage
    }

    fn current_window(&self) -> WindowSpan {
        WindowSpan::containing(current_timestamp_ms(), self.config.window_ms())
    }

    fn ttl(&self) -> Duration {
        self.config.window().saturating_mul(2)
    }

    /// Increment, then undo the increment if it overshot the limit.
    async fn charge(&self, window_key: &str, n: u64, ttl: Duration) -> Result<bool> {
        let delta = n as i64;
        let count = self.storage.increment(window_key, delta, ttl).await?;
        if count <= self.config.rate() as i64 {
            return Ok(true);
        }

        if let Err(e) = self.storage.increment(window_key, -delta, ttl).await {
            warn!(key = window_key, n, error = %e, "failed to roll back fixed window counter");
            return Err(e);
        }
        Ok(false)
    }
}

impl<S: Storage> Limiter for FixedWindow<S> {
    fn name(&self) -> &'static str {
        "fixed_window"
    }

    fn config(&self) -> &Config {
        &self.config
    }

    async fn allow_n(&self, key: &str, n: u64) -> Result<bool> {
        let rate = self.config.rate();
        if n > rate {
            debug!(algorithm = "fixed_window", key, n, rate, "request larger than the limit");
            return Ok(false);
        }

        let window_key = self.current_window().key(key);
        let params = FixedWindowParams {
            requested: n,
            limit: rate,
            ttl: self.ttl(),
        };

        let allowed = match self.storage.fixed_window_allow(&window_key, &params).await? {
            Some(allowed) => allowed,
            None => self.charge(&window_key, n, params.ttl).await?,
        };

        if !allowed {
            debug!(algorithm = "fixed_window", key, n, "rate limit exceeded");
        }
        Ok(allowed)
    }

    async fn reset(&self, key: &str) -> Result<()> {
        let window = self.current_window();
        self.storage.delete(&window.key(key)).await?;
        self.storage.delete(&window.previous().key(key)).await
    }

    async fn stats(&self, key: &str) -> Result<Stats> {
        let window = self.current_window();
        let window_key = window.key(key);

        let count = read_counter(&self.storage, &window_key)
            .await?
            .ok_or_else(|| RateLimitError::NotFound(window_key))?;

        let rate = self.config.rate();
        Ok(Stats::at_ms(
            rate,
            rate.saturating_sub(count.max(0) as u64),
            window.end_ms(),
        ))
    }
}
