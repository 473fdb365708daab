//! Redis storage backend for distributed rate limiting.
//!
//! Uses connection pooling for high performance. Every operation whose result
//! depends on the stored value runs as a Lua script through `EVAL`, so Redis
//! serializes it against all other clients and no intermediate state is ever
//! visible.

use std::time::Duration;

use deadpool_redis::redis::{AsyncCommands, Cmd, RedisError, cmd};
use deadpool_redis::{Config, Connection, Pool, PoolConfig, PoolError, Runtime};
use tracing::debug;

use crate::error::{ConfigError, ConnectionError, Result, StorageError};
use crate::storage::{
    BucketState, FixedWindowParams, SlidingWindowParams, Storage, StoredValue, TokenBucketParams,
};

/// `INCRBY` that only assigns a TTL when the key has none yet. Replies nil
/// when the key holds something other than an integer.
const INCREMENT_SCRIPT: &str = r#"
local raw = redis.call('GET', KEYS[1])
if raw and not string.match(raw, '^%-?%d+$') then
  return false
end
local count = redis.call('INCRBY', KEYS[1], ARGV[1])
if redis.call('PTTL', KEYS[1]) < 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return count
"#;

/// ARGV: has_expected (0|1), expected, new, ttl_ms.
const COMPARE_AND_SWAP_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if ARGV[1] == '0' then
  if current then return 0 end
elseif current ~= ARGV[2] then
  return 0
end
redis.call('SET', KEYS[1], ARGV[3], 'PX', ARGV[4])
return 1
"#;

/// ARGV: requested, capacity, refill_rate, now_ms, ttl_ms.
/// Replies 1 (allowed), 0 (denied) or -1 (KEYS[1] is not a bucket).
const TOKEN_BUCKET_SCRIPT: &str = r#"
local requested = tonumber(ARGV[1])
local capacity = tonumber(ARGV[2])
local refill_rate = tonumber(ARGV[3])
local now = tonumber(ARGV[4])

local tokens = capacity
local last_refill = now
local raw = redis.call('GET', KEYS[1])
if raw then
  local ok, bucket = pcall(cjson.decode, raw)
  if not ok or type(bucket) ~= 'table'
      or type(bucket.tokens) ~= 'number'
      or type(bucket.last_refill_ms) ~= 'number' then
    return -1
  end
  tokens = math.min(bucket.tokens, capacity)
  last_refill = bucket.last_refill_ms
end

local elapsed = math.max(0, now - last_refill) / 1000
tokens = math.min(capacity, tokens + elapsed * refill_rate)

local allowed = 0
if tokens >= requested then
  tokens = tokens - requested
  allowed = 1
end

local bucket = {
  tokens = tokens,
  last_refill_ms = math.max(now, last_refill),
  capacity = capacity,
  refill_rate = refill_rate,
}
redis.call('SET', KEYS[1], cjson.encode(bucket), 'PX', ARGV[5])
return allowed
"#;

/// ARGV: requested, limit, ttl_ms.
/// Replies 1 (allowed), 0 (denied) or -1 (KEYS[1] is not a counter).
const FIXED_WINDOW_SCRIPT: &str = r#"
local requested = tonumber(ARGV[1])
local raw = redis.call('GET', KEYS[1])
if raw and not string.match(raw, '^%-?%d+$') then
  return -1
end
local count = redis.call('INCRBY', KEYS[1], requested)
if redis.call('PTTL', KEYS[1]) < 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[3])
end
if count > tonumber(ARGV[2]) then
  redis.call('DECRBY', KEYS[1], requested)
  return 0
end
return 1
"#;

/// KEYS: current, previous. ARGV: requested, limit, weight, ttl_ms.
/// Replies 1 (allowed), 0 (denied), -1 or -2 (KEYS[1] or KEYS[2] is not a
/// counter).
const SLIDING_WINDOW_SCRIPT: &str = r#"
local requested = tonumber(ARGV[1])
local weight = tonumber(ARGV[3])
if weight < 0 then weight = 0 elseif weight > 1 then weight = 1 end

local counts = {}
for i = 1, 2 do
  local raw = redis.call('GET', KEYS[i]) or '0'
  if not string.match(raw, '^%-?%d+$') then
    return -i
  end
  counts[i] = math.max(0, tonumber(raw))
end
local current, previous = counts[1], counts[2]
local estimate = math.ceil(previous * weight + current)
if estimate + requested > tonumber(ARGV[2]) then
  return 0
end

redis.call('INCRBY', KEYS[1], requested)
if redis.call('PTTL', KEYS[1]) < 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[4])
end
return 1
"#;

/// Redis storage configuration.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Redis connection URL (e.g., "redis://localhost:6379")
    pub url: String,
    /// Connection pool size
    pub pool_size: usize,
    /// Key prefix for rate limit keys
    pub key_prefix: String,
    /// Connection timeout
    pub connection_timeout: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            pool_size: 10,
            key_prefix: "rl:".to_string(),
            connection_timeout: Duration::from_secs(5),
        }
    }
}

impl RedisConfig {
    /// Create a new Redis configuration.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Set the key prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Set the pool size.
    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    /// Set the connection timeout.
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }
}

/// Redis storage backend for distributed rate limiting.
///
/// Implements the composite admission operations as server-side scripts, so
/// several processes sharing one Redis agree on a single rate limit state.
///
/// # Example
///
/// ```ignore
/// use rategate::storage::{RedisStorage, RedisConfig};
///
/// let config = RedisConfig::new("redis://localhost:6379")
///     .with_prefix("myapp:rl:")
///     .with_pool_size(20);
///
/// let storage = RedisStorage::new(config).await?;
/// ```
pub struct RedisStorage {
    pool: Pool,
    key_prefix: String,
}

impl std::fmt::Debug for RedisStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStorage")
            .field("key_prefix", &self.key_prefix)
            .finish()
    }
}

impl RedisStorage {
    /// Create a new Redis storage from configuration.
    pub async fn new(config: RedisConfig) -> Result<Self> {
        if config.pool_size == 0 {
            return Err(ConfigError::InvalidStorage("pool_size must be greater than 0".into()).into());
        }

        let mut cfg = Config::from_url(&config.url);
        let mut pool_config = PoolConfig::new(config.pool_size);
        pool_config.timeouts.wait = Some(config.connection_timeout);
        pool_config.timeouts.create = Some(config.connection_timeout);
        cfg.pool = Some(pool_config);

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| ConnectionError::ConnectionFailed(e.to_string()))?;

        // Test connection
        let ping = async {
            let mut conn = pool
                .get()
                .await
                .map_err(|e| ConnectionError::ConnectionFailed(e.to_string()))?;
            cmd("PING")
                .query_async::<()>(&mut *conn)
                .await
                .map_err(|e| ConnectionError::ConnectionFailed(e.to_string()))
        };
        tokio::time::timeout(config.connection_timeout, ping)
            .await
            .map_err(|_| ConnectionError::Timeout(config.connection_timeout))??;

        debug!(url = %config.url, pool_size = config.pool_size, "connected to redis");

        Ok(Self {
            pool,
            key_prefix: config.key_prefix,
        })
    }

    /// Create a new Redis storage from a URL.
    pub async fn from_url(url: impl Into<String>) -> Result<Self> {
        Self::new(RedisConfig::new(url)).await
    }

    /// Get the full key with prefix.
    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    /// Get a connection from the pool.
    async fn get_conn(&self) -> Result<Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| match e {
                PoolError::Timeout(_) => StorageError::PoolExhausted.into(),
                other => StorageError::operation_failed(other.to_string(), true).into(),
            })
    }

    /// `EVAL` of `script` over the prefixed `keys`; callers append the ARGV.
    fn eval(&self, script: &str, keys: &[&str]) -> Cmd {
        let mut command = cmd("EVAL");
        command.arg(script).arg(keys.len());
        for key in keys {
            command.arg(self.full_key(key));
        }
        command
    }
}

fn ttl_ms(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis())
        .unwrap_or(i64::MAX as u64)
        .clamp(1, i64::MAX as u64)
}

/// Only transport failures are worth retrying; a reply error will come back
/// the same way next time.
fn command_failed(e: RedisError) -> StorageError {
    let retryable = e.is_io_error() || e.is_timeout() || e.is_connection_dropped();
    StorageError::operation_failed(e.to_string(), retryable)
}

/// Maps an admission script reply onto a decision. A negative reply `-i`
/// names the `i`th key as holding the wrong kind of value.
fn decision(reply: i64, keys: &[&str], expected: &'static str) -> Result<Option<bool>> {
    match reply {
        1 => Ok(Some(true)),
        0 => Ok(Some(false)),
        code => {
            let index = usize::try_from(code.unsigned_abs()).unwrap_or(1).saturating_sub(1);
            let key = keys.get(index).or(keys.first()).copied().unwrap_or_default();
            Err(wrong_shape(key, expected).into())
        }
    }
}

/// Only counters and buckets are ever stored, so a value that is not the
/// expected kind is reported as the other one.
fn wrong_shape(key: &str, expected: &'static str) -> StorageError {
    let found = if expected == "counter" { "bucket" } else { "counter" };
    StorageError::type_mismatch(key, expected, found)
}

/// Redis representation of a value: integers for counters, JSON for buckets.
fn encode(value: &StoredValue) -> Result<String> {
    match value {
        StoredValue::Counter(count) => Ok(count.to_string()),
        StoredValue::Bucket(bucket) => serde_json::to_string(bucket)
            .map_err(|e| StorageError::Serialization(e.to_string()).into()),
    }
}

fn decode(key: &str, raw: &str) -> Result<StoredValue> {
    if let Ok(count) = raw.parse::<i64>() {
        return Ok(StoredValue::Counter(count));
    }
    serde_json::from_str::<BucketState>(raw)
        .map(StoredValue::Bucket)
        .map_err(|e| StorageError::Serialization(format!("{key}: {e}")).into())
}

impl Storage for RedisStorage {
    async fn get(&self, key: &str) -> Result<Option<StoredValue>> {
        let mut conn = self.get_conn().await?;

        let raw: Option<String> = conn
            .get(self.full_key(key))
            .await
            .map_err(command_failed)?;

        raw.map(|raw| decode(key, &raw)).transpose()
    }

    async fn set(&self, key: &str, value: StoredValue, ttl: Duration) -> Result<()> {
        let mut conn = self.get_conn().await?;
        let encoded = encode(&value)?;

        conn.pset_ex::<_, _, ()>(self.full_key(key), encoded, ttl_ms(ttl))
            .await
            .map_err(command_failed)?;

        Ok(())
    }

    async fn increment(&self, key: &str, delta: i64, ttl: Duration) -> Result<i64> {
        let mut conn = self.get_conn().await?;

        let count: Option<i64> = self
            .eval(INCREMENT_SCRIPT, &[key])
            .arg(delta)
            .arg(ttl_ms(ttl))
            .query_async(&mut *conn)
            .await
            .map_err(command_failed)?;

        count.ok_or_else(|| wrong_shape(key, "counter").into())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.get_conn().await?;

        conn.del::<_, ()>(self.full_key(key))
            .await
            .map_err(command_failed)?;

        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&StoredValue>,
        new: StoredValue,
        ttl: Duration,
    ) -> Result<bool> {
        let mut conn = self.get_conn().await?;
        let expected = expected.map(encode).transpose()?;
        let new = encode(&new)?;

        let swapped: i64 = self
            .eval(COMPARE_AND_SWAP_SCRIPT, &[key])
            .arg(if expected.is_some() { "1" } else { "0" })
            .arg(expected.unwrap_or_default())
            .arg(new)
            .arg(ttl_ms(ttl))
            .query_async(&mut *conn)
            .await
            .map_err(command_failed)?;

        Ok(swapped == 1)
    }

    async fn token_bucket_allow(
        &self,
        key: &str,
        params: &TokenBucketParams,
    ) -> Result<Option<bool>> {
        let mut conn = self.get_conn().await?;

        let reply: i64 = self
            .eval(TOKEN_BUCKET_SCRIPT, &[key])
            .arg(params.requested)
            .arg(params.capacity)
            .arg(params.refill_rate)
            .arg(params.now_ms)
            .arg(ttl_ms(params.ttl))
            .query_async(&mut *conn)
            .await
            .map_err(command_failed)?;

        decision(reply, &[key], "bucket")
    }

    async fn fixed_window_allow(
        &self,
        key: &str,
        params: &FixedWindowParams,
    ) -> Result<Option<bool>> {
        let mut conn = self.get_conn().await?;

        let reply: i64 = self
            .eval(FIXED_WINDOW_SCRIPT, &[key])
            .arg(params.requested)
            .arg(params.limit)
            .arg(ttl_ms(params.ttl))
            .query_async(&mut *conn)
            .await
            .map_err(command_failed)?;

        decision(reply, &[key], "counter")
    }

    async fn sliding_window_allow(
        &self,
        current_key: &str,
        previous_key: &str,
        params: &SlidingWindowParams,
    ) -> Result<Option<bool>> {
        let mut conn = self.get_conn().await?;

        let reply: i64 = self
            .eval(SLIDING_WINDOW_SCRIPT, &[current_key, previous_key])
            .arg(params.requested)
            .arg(params.limit)
            .arg(params.weight.clamp(0.0, 1.0))
            .arg(ttl_ms(params.ttl))
            .query_async(&mut *conn)
            .await
            .map_err(command_failed)?;

        decision(reply, &[current_key, previous_key], "counter")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deadpool_redis::redis::ErrorKind;

    #[test]
    fn test_redis_config() {
        let config = RedisConfig::new("redis://localhost:6380")
            .with_prefix("test:")
            .with_pool_size(5)
            .with_connection_timeout(Duration::from_secs(1));

        assert_eq!(config.url, "redis://localhost:6380");
        assert_eq!(config.key_prefix, "test:");
        assert_eq!(config.pool_size, 5);
        assert_eq!(config.connection_timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_encoding() {
        assert_eq!(encode(&StoredValue::Counter(-3)).unwrap(), "-3");
        assert_eq!(decode("k", "42").unwrap(), StoredValue::Counter(42));

        let bucket = BucketState::full(10, 0.5, 1_700_000_000_000);
        let raw = encode(&StoredValue::Bucket(bucket.clone())).unwrap();
        assert_eq!(decode("k", &raw).unwrap(), StoredValue::Bucket(bucket));

        assert!(decode("k", "not a value").is_err());
    }

    #[test]
    fn test_only_transport_errors_are_retryable() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(command_failed(RedisError::from(io)).is_retryable());

        let reply = RedisError::from((ErrorKind::TypeError, "wrong type"));
        assert!(!command_failed(reply).is_retryable());
    }

    #[test]
    fn test_script_replies() {
        assert_eq!(decision(1, &["k"], "bucket").unwrap(), Some(true));
        assert_eq!(decision(0, &["k"], "bucket").unwrap(), Some(false));

        match decision(-2, &["cur", "prev"], "counter") {
            Err(crate::RateLimitError::Storage(err)) => {
                assert!(!err.is_retryable());
                assert!(matches!(err, StorageError::TypeMismatch { ref key, .. } if key == "prev"));
            }
            other => panic!("expected a type mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_ttl_rounds_up_to_one_ms() {
        assert_eq!(ttl_ms(Duration::from_micros(10)), 1);
        assert_eq!(ttl_ms(Duration::from_secs(2)), 2000);
    }
}
