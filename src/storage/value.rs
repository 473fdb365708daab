//! Payloads held by storage backends.

use serde::{Deserialize, Serialize};

/// Value stored under a key.
///
/// Window algorithms keep a plain counter per window key; the token bucket
/// keeps a full bucket record.
#[derive(Debug, Clone, PartialEq)]
pub enum StoredValue {
    /// Signed counter (requests seen in one window).
    Counter(i64),
    /// Token bucket record.
    Bucket(BucketState),
}

impl StoredValue {
    /// Short name of the payload shape, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Counter(_) => "counter",
            Self::Bucket(_) => "bucket",
        }
    }

    /// Get the counter value, if this is a counter.
    pub fn as_counter(&self) -> Option<i64> {
        match self {
            Self::Counter(count) => Some(*count),
            Self::Bucket(_) => None,
        }
    }

    /// Get the bucket record, if this is a bucket.
    pub fn as_bucket(&self) -> Option<&BucketState> {
        match self {
            Self::Bucket(bucket) => Some(bucket),
            Self::Counter(_) => None,
        }
    }
}

impl From<i64> for StoredValue {
    fn from(count: i64) -> Self {
        Self::Counter(count)
    }
}

impl From<BucketState> for StoredValue {
    fn from(bucket: BucketState) -> Self {
        Self::Bucket(bucket)
    }
}

/// Token bucket state for one key.
///
/// Field names double as the JSON layout used by the Redis backend, both from
/// Rust and from inside its Lua scripts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketState {
    /// Tokens currently in the bucket, never above `capacity`.
    pub tokens: f64,
    /// Last refill (Unix milliseconds).
    pub last_refill_ms: u64,
    /// Bucket capacity.
    pub capacity: u64,
    /// Tokens restored per second.
    pub refill_rate: f64,
}

impl BucketState {
    /// A full bucket, as seen on first access.
    pub fn full(capacity: u64, refill_rate: f64, now_ms: u64) -> Self {
        Self {
            tokens: capacity as f64,
            last_refill_ms: now_ms,
            capacity,
            refill_rate,
        }
    }

    /// Bring the bucket forward to `now_ms` under the given parameters.
    ///
    /// Elapsed time never goes negative, so a clock that steps backwards (or
    /// another process with a lagging clock) cannot mint or remove tokens.
    pub fn refilled(&self, now_ms: u64, capacity: u64, refill_rate: f64) -> Self {
        let capacity_f = capacity as f64;
        let elapsed_secs = now_ms.saturating_sub(self.last_refill_ms) as f64 / 1000.0;
        let tokens = (self.tokens.min(capacity_f) + elapsed_secs * refill_rate).min(capacity_f);

        Self {
            tokens,
            last_refill_ms: now_ms.max(self.last_refill_ms),
            capacity,
            refill_rate,
        }
    }

    /// Try to take `n` tokens. All or nothing.
    pub fn take(mut self, n: u64) -> (Self, bool) {
        let n = n as f64;
        if self.tokens >= n {
            self.tokens -= n;
            (self, true)
        } else {
            (self, false)
        }
    }

    /// Whole tokens available.
    pub fn remaining(&self) -> u64 {
        self.tokens.max(0.0).floor() as u64
    }

    /// Milliseconds until the bucket is full again, `None` if it never refills.
    pub fn ms_until_full(&self) -> Option<u64> {
        let missing = self.capacity as f64 - self.tokens;
        if missing <= 0.0 {
            Some(0)
        } else if self.refill_rate > 0.0 {
            Some((missing / self.refill_rate * 1000.0).ceil() as u64)
        } else {
            None
        }
    }
}
