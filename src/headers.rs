//! HTTP header values for rate limiting.
//!
//! Plain `(name, value)` pairs derived from [`Stats`]; wiring them into a
//! framework's response type is left to the caller.

use crate::stats::Stats;

/// Standard rate limit header names.
pub mod names {
    /// Maximum requests allowed per window.
    pub const RATE_LIMIT_LIMIT: &str = "X-RateLimit-Limit";

    /// Remaining requests in current window.
    pub const RATE_LIMIT_REMAINING: &str = "X-RateLimit-Remaining";

    /// Unix time (seconds) at which the rate limit resets.
    pub const RATE_LIMIT_RESET: &str = "X-RateLimit-Reset";

    /// Seconds until the client should retry (standard HTTP header).
    pub const RETRY_AFTER: &str = "Retry-After";

    /// The algorithm in effect (extended).
    pub const RATE_LIMIT_POLICY: &str = "X-RateLimit-Policy";
}

/// Builder for rate limit headers.
#[derive(Debug, Default)]
pub struct RateLimitHeaders {
    limit: Option<u64>,
    remaining: Option<u64>,
    reset: Option<u64>,
    retry_after: Option<u64>,
    policy: Option<String>,
}

impl RateLimitHeaders {
    /// Create a new header builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the limit header.
    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Set the remaining header.
    pub fn remaining(mut self, remaining: u64) -> Self {
        self.remaining = Some(remaining);
        self
    }

    /// Set the reset header (Unix seconds).
    pub fn reset(mut self, reset_unix_secs: u64) -> Self {
        self.reset = Some(reset_unix_secs);
        self
    }

    /// Set the retry-after header (seconds until retry).
    pub fn retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }

    /// Set the policy header, usually [`Limiter::name`](crate::Limiter::name).
    pub fn policy(mut self, policy: impl Into<String>) -> Self {
        self.policy = Some(policy.into());
        self
    }

    /// Convert to a vector of (name, value) pairs.
    pub fn to_vec(&self) -> Vec<(&'static str, String)> {
        let mut headers = Vec::new();

        if let Some(limit) = self.limit {
            headers.push((names::RATE_LIMIT_LIMIT, limit.to_string()));
        }
        if let Some(remaining) = self.remaining {
            headers.push((names::RATE_LIMIT_REMAINING, remaining.to_string()));
        }
        if let Some(reset) = self.reset {
            headers.push((names::RATE_LIMIT_RESET, reset.to_string()));
        }
        if let Some(retry_after) = self.retry_after {
            headers.push((names::RETRY_AFTER, retry_after.to_string()));
        }
        if let Some(ref policy) = self.policy {
            headers.push((names::RATE_LIMIT_POLICY, policy.clone()));
        }

        headers
    }
}

impl From<&Stats> for RateLimitHeaders {
    fn from(stats: &Stats) -> Self {
        let headers = Self::new()
            .limit(stats.limit)
            .remaining(stats.remaining)
            .reset(stats.reset_unix_secs());

        if stats.is_exhausted() {
            // Round up so clients never retry a moment too early.
            let wait = stats.reset_after();
            let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
            headers.retry_after(secs)
        } else {
            headers
        }
    }
}
