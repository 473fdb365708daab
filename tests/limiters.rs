//! Integration tests for the rate limiting algorithms over in-memory storage.

use std::time::Duration;

use rategate::storage::{FixedWindowParams, current_timestamp_ms};
use rategate::{
    AlgorithmKind, AnyLimiter, Config, FixedWindow, Limiter, MemoryStorage, RateLimitError,
    Result, SlidingWindow, Storage, StorageError, StoredValue, TokenBucket,
};
use serde::Deserialize;

const ALL_KINDS: [AlgorithmKind; 3] = [
    AlgorithmKind::TokenBucket,
    AlgorithmKind::FixedWindow,
    AlgorithmKind::SlidingWindow,
];

/// Sleep until `offset` past the start of the next window.
async fn align_to_window(window: Duration, offset: Duration) {
    let window_ms = window.as_millis() as u64;
    let now = current_timestamp_ms();
    let target = (now / window_ms + 1) * window_ms + offset.as_millis() as u64;
    tokio::time::sleep(Duration::from_millis(target - now)).await;
}

async fn count_allowed<L: Limiter>(limiter: &L, key: &str, attempts: usize) -> usize {
    let mut allowed = 0;
    for _ in 0..attempts {
        if limiter.allow(key).await.unwrap() {
            allowed += 1;
        }
    }
    allowed
}

#[tokio::test]
async fn test_token_bucket_capacity() {
    let limiter = TokenBucket::new(MemoryStorage::new(), Config::per_minute(10).with_burst(5)).unwrap();

    for i in 1..=5 {
        assert!(limiter.allow("test:user").await.unwrap(), "Request {} should be allowed", i);
    }
    assert!(!limiter.allow("test:user").await.unwrap(), "6th request should be denied");
}

#[tokio::test]
async fn test_token_bucket_refill_is_monotonic_and_capped() {
    let limiter = TokenBucket::new(MemoryStorage::new(), Config::per_second(20).with_burst(5)).unwrap();

    assert!(limiter.allow_n("test:user", 5).await.unwrap());
    let mut last = limiter.stats("test:user").await.unwrap().remaining;
    assert_eq!(last, 0);

    for _ in 0..5 {
        tokio::time::sleep(Duration::from_millis(60)).await;
        let remaining = limiter.stats("test:user").await.unwrap().remaining;
        assert!(remaining >= last, "remaining went from {} to {}", last, remaining);
        assert!(remaining <= 5);
        last = remaining;
    }

    tokio::time::sleep(Duration::from_millis(400)).await;
    let stats = limiter.stats("test:user").await.unwrap();
    assert_eq!(stats.remaining, 5, "bucket should be full and capped");
    assert_eq!(stats.reset_after(), Duration::ZERO);
}

#[tokio::test]
async fn test_fixed_window_resets_after_window() {
    let window = Duration::from_secs(2);
    let limiter = FixedWindow::new(MemoryStorage::new(), Config::new(5, window)).unwrap();
    align_to_window(window, Duration::from_millis(50)).await;

    for i in 1..=5 {
        assert!(limiter.allow("test:user").await.unwrap(), "Request {} should be allowed", i);
    }
    assert!(!limiter.allow("test:user").await.unwrap());

    tokio::time::sleep(Duration::from_millis(2100)).await;
    assert!(limiter.allow("test:user").await.unwrap());
}

#[tokio::test]
async fn test_fixed_window_boundary_allows_double_rate() {
    let window = Duration::from_secs(1);
    let storage = std::sync::Arc::new(MemoryStorage::new());
    let fixed = FixedWindow::new(storage.clone(), Config::new(5, window)).unwrap();
    let sliding = SlidingWindow::new(storage, Config::new(5, window)).unwrap();

    // Last fifth of window k.
    align_to_window(window, Duration::from_millis(800)).await;
    assert_eq!(count_allowed(&fixed, "fixed", 5).await, 5);
    assert_eq!(count_allowed(&sliding, "sliding", 5).await, 5);

    // Start of window k + 1, a couple hundred milliseconds later.
    align_to_window(window, Duration::from_millis(10)).await;
    assert_eq!(
        count_allowed(&fixed, "fixed", 5).await,
        5,
        "fixed window admits a second full batch right after the boundary"
    );
    assert!(
        !sliding.allow("sliding").await.unwrap(),
        "sliding window still counts the previous window"
    );
}

#[tokio::test]
async fn test_sliding_window_decays() {
    let window = Duration::from_secs(1);
    let limiter = SlidingWindow::new(MemoryStorage::new(), Config::new(20, window)).unwrap();
    align_to_window(window, Duration::from_millis(50)).await;

    for i in 1..=20 {
        assert!(limiter.allow("test:user").await.unwrap(), "Request {} should be allowed", i);
    }
    assert!(!limiter.allow("test:user").await.unwrap());

    tokio::time::sleep(Duration::from_millis(2100)).await;
    assert_eq!(count_allowed(&limiter, "test:user", 20).await, 20);
}

#[tokio::test]
async fn test_allow_n_never_admits_partially() {
    for kind in ALL_KINDS {
        let limiter = AnyLimiter::new(kind, MemoryStorage::new(), Config::per_hour(100)).unwrap();

        assert!(limiter.allow_n("test:user", 50).await.unwrap(), "{}", kind);
        assert!(limiter.allow_n("test:user", 50).await.unwrap(), "{}", kind);
        assert!(!limiter.allow_n("test:user", 1).await.unwrap(), "{}", kind);
        assert_eq!(limiter.stats("test:user").await.unwrap().remaining, 0, "{}", kind);
    }
}

#[tokio::test]
async fn test_separate_keys_independent() {
    for kind in ALL_KINDS {
        let limiter = AnyLimiter::new(kind, MemoryStorage::new(), Config::per_hour(2)).unwrap();

        assert_eq!(count_allowed(&limiter, "user:1", 3).await, 2, "{}", kind);
        assert!(limiter.allow("user:2").await.unwrap(), "{}: user:2 should be allowed", kind);
    }
}

#[tokio::test]
async fn test_reset_behaves_like_fresh_key() {
    for kind in ALL_KINDS {
        let limiter = AnyLimiter::new(kind, MemoryStorage::new(), Config::per_hour(3)).unwrap();

        // Resetting an unknown key is fine.
        limiter.reset("test:user").await.unwrap();

        assert_eq!(count_allowed(&limiter, "test:user", 4).await, 3, "{}", kind);

        limiter.reset("test:user").await.unwrap();
        limiter.reset("test:user").await.unwrap();
        assert_eq!(count_allowed(&limiter, "test:user", 4).await, 3, "{}", kind);
    }
}

#[tokio::test]
async fn test_stats_for_unknown_key() {
    for kind in ALL_KINDS {
        let limiter = AnyLimiter::new(kind, MemoryStorage::new(), Config::per_hour(7)).unwrap();

        match kind {
            AlgorithmKind::TokenBucket => {
                let stats = limiter.stats("nobody").await.unwrap();
                assert_eq!((stats.limit, stats.remaining), (7, 7));
            }
            _ => {
                let err = limiter.stats("nobody").await.unwrap_err();
                assert!(err.is_not_found(), "{}: {}", kind, err);
            }
        }
    }
}

#[tokio::test]
async fn test_stats_do_not_consume() {
    for kind in ALL_KINDS {
        let limiter = AnyLimiter::new(kind, MemoryStorage::new(), Config::per_hour(2)).unwrap();
        limiter.allow("test:user").await.unwrap();

        for _ in 0..10 {
            assert_eq!(limiter.stats("test:user").await.unwrap().remaining, 1, "{}", kind);
        }
        assert!(limiter.allow("test:user").await.unwrap(), "{}", kind);
    }
}

#[tokio::test]
async fn test_limiter_from_configuration() {
    #[derive(Deserialize)]
    struct Settings {
        algorithm: AlgorithmKind,
        limit: Config,
    }

    let settings: Settings = serde_json::from_str(
        r#"{
            "algorithm": "sliding_window",
            "limit": { "rate": 3, "window": { "secs": 3600, "nanos": 0 } }
        }"#,
    )
    .unwrap();

    let limiter = AnyLimiter::new(settings.algorithm, MemoryStorage::new(), settings.limit).unwrap();
    assert_eq!(limiter.name(), "sliding_window");
    assert_eq!(limiter.config().rate(), 3);
    assert_eq!(count_allowed(&limiter, "test:user", 5).await, 3);
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let config: Config =
        serde_json::from_str(r#"{ "rate": 3, "window": { "secs": 0, "nanos": 0 } }"#).unwrap();

    for kind in ALL_KINDS {
        let err = AnyLimiter::new(kind, MemoryStorage::new(), config.clone()).unwrap_err();
        assert!(matches!(err, RateLimitError::Config(_)), "{}: {}", kind, err);
    }
}

/// A backend whose every call fails, like an unreachable server.
struct Unreachable;

fn refused<T>() -> Result<T> {
    Err(StorageError::operation_failed("connection refused", true).into())
}

impl Storage for Unreachable {
    async fn get(&self, _key: &str) -> Result<Option<StoredValue>> {
        refused()
    }

    async fn set(&self, _key: &str, _value: StoredValue, _ttl: Duration) -> Result<()> {
        refused()
    }

    async fn increment(&self, _key: &str, _delta: i64, _ttl: Duration) -> Result<i64> {
        refused()
    }

    async fn delete(&self, _key: &str) -> Result<()> {
        refused()
    }

    async fn compare_and_swap(
        &self,
        _key: &str,
        _expected: Option<&StoredValue>,
        _new: StoredValue,
        _ttl: Duration,
    ) -> Result<bool> {
        refused()
    }
}

#[tokio::test]
async fn test_storage_errors_propagate() {
    for kind in ALL_KINDS {
        let limiter = AnyLimiter::new(kind, Unreachable, Config::per_hour(10)).unwrap();

        let err = limiter.allow("test:user").await.unwrap_err();
        assert!(
            matches!(err, RateLimitError::Storage(ref e) if e.is_retryable()),
            "{}: {}",
            kind,
            err
        );
        assert!(limiter.reset("test:user").await.is_err());
        assert!(limiter.stats("test:user").await.is_err());
    }
}

/// Memory storage that answers fixed window decisions itself.
struct Decides {
    inner: MemoryStorage,
    answer: bool,
}

impl Storage for Decides {
    async fn get(&self, key: &str) -> Result<Option<StoredValue>> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: StoredValue, ttl: Duration) -> Result<()> {
        self.inner.set(key, value, ttl).await
    }

    async fn increment(&self, key: &str, delta: i64, ttl: Duration) -> Result<i64> {
        self.inner.increment(key, delta, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(key).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&StoredValue>,
        new: StoredValue,
        ttl: Duration,
    ) -> Result<bool> {
        self.inner.compare_and_swap(key, expected, new, ttl).await
    }

    async fn fixed_window_allow(
        &self,
        _key: &str,
        params: &FixedWindowParams,
    ) -> Result<Option<bool>> {
        assert_eq!(params.ttl, Duration::from_secs(7200));
        Ok(Some(self.answer))
    }
}

#[tokio::test]
async fn test_atomic_capability_is_preferred() {
    for answer in [true, false] {
        let storage = Decides {
            inner: MemoryStorage::new(),
            answer,
        };
        let limiter = FixedWindow::new(storage, Config::per_hour(1)).unwrap();

        for _ in 0..3 {
            assert_eq!(limiter.allow("test:user").await.unwrap(), answer);
        }
        // The generic counter was never touched.
        assert!(limiter.storage().inner.is_empty());
    }
}

/// Memory storage that accepts charges but fails to give them back.
struct NoRollback {
    inner: MemoryStorage,
}

impl Storage for NoRollback {
    async fn get(&self, key: &str) -> Result<Option<StoredValue>> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: StoredValue, ttl: Duration) -> Result<()> {
        self.inner.set(key, value, ttl).await
    }

    async fn increment(&self, key: &str, delta: i64, ttl: Duration) -> Result<i64> {
        if delta < 0 {
            return refused();
        }
        self.inner.increment(key, delta, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(key).await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&StoredValue>,
        new: StoredValue,
        ttl: Duration,
    ) -> Result<bool> {
        self.inner.compare_and_swap(key, expected, new, ttl).await
    }
}

#[tokio::test]
async fn test_failed_rollback_is_an_error() {
    let storage = NoRollback {
        inner: MemoryStorage::new(),
    };
    let limiter = FixedWindow::new(storage, Config::per_hour(2)).unwrap();

    assert!(limiter.allow_n("test:user", 2).await.unwrap());

    // Over the limit: the charge lands, its rollback does not.
    let err = limiter.allow("test:user").await.unwrap_err();
    assert!(
        matches!(err, RateLimitError::Storage(ref e) if e.is_retryable()),
        "{}",
        err
    );

    // The overshoot stays on the counter, so later calls are still denied.
    let stats = limiter.stats("test:user").await.unwrap();
    assert_eq!(stats.remaining, 0);
}
