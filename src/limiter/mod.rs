//! The `Limiter` contract and its three implementations.
//!
//! # Available Algorithms
//!
//! - **Token Bucket**: controlled bursts up to a capacity, refilled continuously
//! - **Fixed Window**: one counter per aligned window; cheap, but up to twice
//!   the rate can pass around a window boundary
//! - **Sliding Window**: weighted blend of the current and previous window
//!   counters, smoothing out the fixed window's boundary burst
//!
//! Every limiter owns its storage handle and config. Share one store between
//! limiters by passing an `Arc<S>`.

mod fixed_window;
mod sliding_window;
mod token_bucket;

pub use fixed_window::FixedWindow;
pub use sliding_window::SlidingWindow;
pub use token_bucket::TokenBucket;

use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{Result, StorageError};
use crate::stats::Stats;
use crate::storage::{Storage, StoredValue};

/// Rate limiter contract shared by all algorithms.
///
/// | Algorithm | Accuracy | Storage per key | Burst |
/// |-----------|----------|-----------------|-------|
/// | Token Bucket | High | 1 record | Up to capacity |
/// | Fixed Window | Low at boundaries | 1 counter | Up to 2 × rate across a boundary |
/// | Sliding Window | Medium | 2 counters | Smoothed |
///
/// Being over the limit is a normal outcome (`Ok(false)`); errors only come
/// from the storage backend.
pub trait Limiter: Send + Sync {
    /// Get the algorithm name (for logging and headers).
    fn name(&self) -> &'static str;

    /// Get the limiter's configuration.
    fn config(&self) -> &Config;

    /// Admit a single request. Same as `allow_n(key, 1)`.
    fn allow(&self, key: &str) -> impl Future<Output = Result<bool>> + Send {
        self.allow_n(key, 1)
    }

    /// Admit `n` units at once: either all `n` are charged, or none are.
    fn allow_n(&self, key: &str, n: u64) -> impl Future<Output = Result<bool>> + Send;

    /// Clear all state for `key`, so the next call behaves like a first access.
    fn reset(&self, key: &str) -> impl Future<Output = Result<()>> + Send;

    /// Read-only snapshot of the key's state.
    fn stats(&self, key: &str) -> impl Future<Output = Result<Stats>> + Send;
}

/// Algorithm selector, e.g. from a configuration file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlgorithmKind {
    /// [`TokenBucket`]
    TokenBucket,
    /// [`FixedWindow`]
    FixedWindow,
    /// [`SlidingWindow`]
    SlidingWindow,
}

impl AlgorithmKind {
    /// Name reported by the matching limiter.
    pub fn name(&self) -> &'static str {
        match self {
            Self::TokenBucket => "token_bucket",
            Self::FixedWindow => "fixed_window",
            Self::SlidingWindow => "sliding_window",
        }
    }
}

impl std::fmt::Display for AlgorithmKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A limiter whose algorithm is chosen at runtime.
#[derive(Debug)]
pub enum AnyLimiter<S> {
    /// Token bucket.
    TokenBucket(TokenBucket<S>),
    /// Fixed window.
    FixedWindow(FixedWindow<S>),
    /// Sliding window.
    SlidingWindow(SlidingWindow<S>),
}

impl<S: Storage> AnyLimiter<S> {
    /// Build the limiter selected by `kind`.
    pub fn new(kind: AlgorithmKind, storage: S, config: Config) -> Result<Self> {
        Ok(match kind {
            AlgorithmKind::TokenBucket => Self::TokenBucket(TokenBucket::new(storage, config)?),
            AlgorithmKind::FixedWindow => Self::FixedWindow(FixedWindow::new(storage, config)?),
            AlgorithmKind::SlidingWindow => {
                Self::SlidingWindow(SlidingWindow::new(storage, config)?)
            }
        })
    }

    /// The selected algorithm.
    pub fn kind(&self) -> AlgorithmKind {
        match self {
            Self::TokenBucket(_) => AlgorithmKind::TokenBucket,
            Self::FixedWindow(_) => AlgorithmKind::FixedWindow,
            Self::SlidingWindow(_) => AlgorithmKind::SlidingWindow,
        }
    }
}

impl<S: Storage> Limiter for AnyLimiter<S> {
    fn name(&self) -> &'static str {
        self.kind().name()
    }

    fn config(&self) -> &Config {
        match self {
            Self::TokenBucket(l) => l.config(),
            Self::FixedWindow(l) => l.config(),
            Self::SlidingWindow(l) => l.config(),
        }
    }

    async fn allow_n(&self, key: &str, n: u64) -> Result<bool> {
        match self {
            Self::TokenBucket(l) => l.allow_n(key, n).await,
            Self::FixedWindow(l) => l.allow_n(key, n).await,
            Self::SlidingWindow(l) => l.allow_n(key, n).await,
        }
    }

    async fn reset(&self, key: &str) -> Result<()> {
        match self {
            Self::TokenBucket(l) => l.reset(key).await,
            Self::FixedWindow(l) => l.reset(key).await,
            Self::SlidingWindow(l) => l.reset(key).await,
        }
    }

    async fn stats(&self, key: &str) -> Result<Stats> {
        match self {
            Self::TokenBucket(l) => l.stats(key).await,
            Self::FixedWindow(l) => l.stats(key).await,
            Self::SlidingWindow(l) => l.stats(key).await,
        }
    }
}

/// One aligned window of time, in Unix milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WindowSpan {
    start_ms: u64,
    len_ms: u64,
}

impl WindowSpan {
    /// The window containing `now_ms`: `floor(now / len) * len`.
    pub(crate) fn containing(now_ms: u64, len_ms: u64) -> Self {
        Self {
            start_ms: (now_ms / len_ms) * len_ms,
            len_ms,
        }
    }

    /// The window right before this one.
    pub(crate) fn previous(&self) -> Self {
        Self {
            start_ms: self.start_ms.saturating_sub(self.len_ms),
            len_ms: self.len_ms,
        }
    }

    pub(crate) fn end_ms(&self) -> u64 {
        self.start_ms + self.len_ms
    }

    /// Storage key for this window: `base:start`.
    ///
    /// The start is in epoch seconds for whole-second windows and in epoch
    /// milliseconds otherwise, so sub-second windows get distinct keys.
    pub(crate) fn key(&self, base: &str) -> String {
        if self.len_ms % 1000 == 0 {
            format!("{}:{}", base, self.start_ms / 1000)
        } else {
            format!("{}:{}", base, self.start_ms)
        }
    }

    /// Share of the previous window still counted at `now_ms`, in `[0, 1]`.
    pub(crate) fn previous_weight(&self, now_ms: u64) -> f64 {
        let elapsed = now_ms.saturating_sub(self.start_ms) as f64;
        (1.0 - elapsed / self.len_ms as f64).clamp(0.0, 1.0)
    }
}

/// Read a window counter; absent counts as zero.
pub(crate) async fn read_counter<S: Storage>(storage: &S, key: &str) -> Result<Option<i64>> {
    match storage.get(key).await? {
        None => Ok(None),
        Some(StoredValue::Counter(count)) => Ok(Some(count)),
        Some(other) => Err(StorageError::type_mismatch(key, "counter", other.kind()).into()),
    }
}
