//! Limiter configuration.
//!
//! A `Config` defines how many permits are granted per window and, for the
//! token bucket, how large the bucket is.
//!
//! # Examples
//!
//! ```ignore
//! use rategate::Config;
//! use std::time::Duration;
//!
//! // 100 requests per minute
//! let config = Config::per_minute(100);
//!
//! // 100 requests per minute, bucket capacity 150
//! let config = Config::per_minute(100).with_burst(150);
//!
//! // Custom: 50 requests per 30 seconds
//! let config = Config::new(50, Duration::from_secs(30));
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

/// Rate limiting configuration shared by every algorithm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Permits granted per window.
    rate: u64,

    /// Length of the window.
    window: Duration,

    /// Token bucket capacity; 0 means "same as rate".
    #[serde(default)]
    burst: u64,
}

impl Config {
    /// Create a new config with the given rate and window.
    ///
    /// # Panics
    ///
    /// Panics if the window is shorter than one millisecond.
    pub fn new(rate: u64, window: Duration) -> Self {
        assert!(
            window.as_millis() > 0,
            "window must be at least one millisecond"
        );

        Self {
            rate,
            window,
            burst: 0,
        }
    }

    /// Create a config allowing `n` requests per second.
    pub fn per_second(n: u64) -> Self {
        Self::new(n, Duration::from_secs(1))
    }

    /// Create a config allowing `n` requests per minute.
    pub fn per_minute(n: u64) -> Self {
        Self::new(n, Duration::from_secs(60))
    }

    /// Create a config allowing `n` requests per hour.
    pub fn per_hour(n: u64) -> Self {
        Self::new(n, Duration::from_secs(3600))
    }

    /// Try to create a new config, returning an error if invalid.
    pub fn try_new(rate: u64, window: Duration) -> Result<Self> {
        let config = Self {
            rate,
            window,
            burst: 0,
        };
        config.validate()?;
        Ok(config)
    }

    /// Set the token bucket capacity.
    ///
    /// Unlike the rate, the burst may be lower than `rate`. Zero restores the
    /// default of using `rate` as capacity.
    pub fn with_burst(mut self, burst: u64) -> Self {
        self.burst = burst;
        self
    }

    /// Check the invariants every limiter relies on.
    ///
    /// Deserialized configs bypass the constructors, so limiters call this
    /// before use.
    pub fn validate(&self) -> Result<()> {
        if self.window.as_millis() == 0 {
            return Err(
                ConfigError::InvalidConfig("window must be at least one millisecond".into()).into(),
            );
        }
        if self.rate > i64::MAX as u64 {
            return Err(ConfigError::InvalidConfig("rate does not fit a counter".into()).into());
        }
        if self.burst > i64::MAX as u64 {
            return Err(ConfigError::InvalidConfig("burst does not fit a counter".into()).into());
        }
        Ok(())
    }

    /// Get the permits granted per window.
    pub fn rate(&self) -> u64 {
        self.rate
    }

    /// Get the window duration.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Get the configured burst (0 when unset).
    pub fn burst(&self) -> u64 {
        self.burst
    }

    /// Get the effective bucket capacity.
    ///
    /// Returns the configured burst, or `rate` if the burst is zero.
    pub fn effective_burst(&self) -> u64 {
        if self.burst == 0 { self.rate } else { self.burst }
    }

    /// Tokens restored per second: `rate / window_seconds`.
    pub fn refill_rate(&self) -> f64 {
        self.rate as f64 / self.window.as_secs_f64()
    }

    /// Window length in whole milliseconds.
    pub(crate) fn window_ms(&self) -> u64 {
        self.window.as_millis() as u64
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::per_minute(60)
    }
}

/// Builder for creating configs with validation.
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    rate: Option<u64>,
    window: Option<Duration>,
    burst: Option<u64>,
}

impl ConfigBuilder {
    /// Create a new config builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the permits per window.
    pub fn rate(mut self, n: u64) -> Self {
        self.rate = Some(n);
        self
    }

    /// Set the window duration.
    pub fn window(mut self, duration: Duration) -> Self {
        self.window = Some(duration);
        self
    }

    /// Set the burst size.
    pub fn burst(mut self, n: u64) -> Self {
        self.burst = Some(n);
        self
    }

    /// Build the config, returning an error if invalid.
    pub fn build(self) -> Result<Config> {
        let rate = self
            .rate
            .ok_or_else(|| ConfigError::MissingRequired("rate".into()))?;
        let window = self
            .window
            .ok_or_else(|| ConfigError::MissingRequired("window".into()))?;

        let config = Config::try_new(rate, window)?.with_burst(self.burst.unwrap_or(0));
        config.validate()?;
        Ok(config)
    }
}
