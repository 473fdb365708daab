//! Read-only snapshot of a key's rate limit state.
//!
//! `Stats` are computed on demand from whatever the storage currently holds
//! and are never written back.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Information about the current rate limit state of one key.
#[derive(Debug, Clone, PartialEq)]
pub struct Stats {
    /// Maximum permits (rate for windows, capacity for buckets).
    pub limit: u64,
    /// Permits still available right now.
    pub remaining: u64,
    /// When the limit resets (window end, or bucket full).
    pub reset_at: SystemTime,
}

impl Stats {
    /// Create a new snapshot.
    pub fn new(limit: u64, remaining: u64, reset_at: SystemTime) -> Self {
        Self {
            limit,
            remaining,
            reset_at,
        }
    }

    /// Build a snapshot whose reset instant is given in epoch milliseconds.
    pub(crate) fn at_ms(limit: u64, remaining: u64, reset_at_ms: u64) -> Self {
        Self::new(
            limit,
            remaining,
            UNIX_EPOCH + Duration::from_millis(reset_at_ms),
        )
    }

    /// Time left until reset, zero if already passed.
    pub fn reset_after(&self) -> Duration {
        self.reset_at
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO)
    }

    /// Reset instant as Unix seconds.
    pub fn reset_unix_secs(&self) -> u64 {
        self.reset_at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    /// Check whether no permits remain.
    pub fn is_exhausted(&self) -> bool {
        self.remaining == 0
    }
}
