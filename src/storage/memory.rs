//! In-memory storage with automatic garbage collection.
//!
//! Entries live in a `DashMap` as immutable `Arc<Slot>` snapshots. Writers
//! that depend on the current value (`increment`, `compare_and_swap`) compute
//! the next slot outside any lock and install it only if the map still holds
//! the exact snapshot they read, retrying otherwise. The shard lock is held
//! just for that final identity check and replacement.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use crate::error::{Result, StorageError};
use crate::storage::{Storage, StoredValue};

const MIN_GC_INTERVAL: Duration = Duration::from_millis(1);

/// Garbage collection interval configuration.
#[derive(Debug, Clone)]
pub enum GcInterval {
    /// Sweep every N storage operations.
    Requests(u64),
    /// Sweep on a fixed timer in the background.
    Duration(Duration),
    /// Disable automatic GC.
    Manual,
}

impl Default for GcInterval {
    fn default() -> Self {
        Self::Duration(Duration::from_secs(60))
    }
}

/// Garbage collection configuration.
#[derive(Debug, Clone, Default)]
pub struct GcConfig {
    /// When to sweep expired entries.
    pub interval: GcInterval,
}

impl GcConfig {
    /// Create config with request-based GC.
    pub fn on_requests(count: u64) -> Self {
        Self {
            interval: GcInterval::Requests(count.max(1)),
        }
    }

    /// Create config with time-based GC. Intervals under 1ms are raised to 1ms.
    pub fn on_duration(interval: Duration) -> Self {
        Self {
            interval: GcInterval::Duration(interval.max(MIN_GC_INTERVAL)),
        }
    }

    /// Create config with manual GC only.
    pub fn manual() -> Self {
        Self {
            interval: GcInterval::Manual,
        }
    }
}

/// One immutable snapshot of a key's value.
#[derive(Debug)]
struct Slot {
    value: StoredValue,
    expires_at: Instant,
}

impl Slot {
    fn new(value: StoredValue, ttl: Duration, now: Instant) -> Self {
        Self {
            value,
            expires_at: expiry_after(now, ttl),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

type Slots = DashMap<String, Arc<Slot>>;

fn expiry_after(now: Instant, ttl: Duration) -> Instant {
    now.checked_add(ttl)
        .unwrap_or_else(|| now + Duration::from_secs(100 * 365 * 24 * 3600))
}

/// In-memory storage with garbage collection.
///
/// Uses `DashMap` for thread-safe concurrent access. Expired entries read as
/// absent immediately and are physically removed lazily on read and by the
/// periodic sweep.
///
/// # Example
///
/// ```ignore
/// use rategate::storage::{MemoryStorage, GcConfig};
/// use std::time::Duration;
///
/// // Default GC (background sweep every minute)
/// let storage = MemoryStorage::new();
///
/// // Custom GC interval
/// let storage = MemoryStorage::with_gc(GcConfig::on_duration(Duration::from_secs(10)));
///
/// // Manual GC only
/// let storage = MemoryStorage::with_gc(GcConfig::manual());
/// storage.run_gc();
/// ```
pub struct MemoryStorage {
    data: Arc<Slots>,
    gc_config: GcConfig,
    op_count: AtomicU64,
    gc_lock: Mutex<()>,
    shutdown: Arc<Notify>,
    sweeper: Option<Sweeper>,
}

/// Sweeper thread used outside a tokio runtime. Dropping `stop` wakes it.
struct Sweeper {
    stop: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl std::fmt::Debug for MemoryStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStorage")
            .field("entries", &self.data.len())
            .field("gc_config", &self.gc_config)
            .finish()
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    /// Create a new memory storage with default GC configuration.
    pub fn new() -> Self {
        Self::with_gc(GcConfig::default())
    }

    /// Create a new memory storage with custom GC configuration.
    pub fn with_gc(gc_config: GcConfig) -> Self {
        let mut storage = Self {
            data: Arc::new(DashMap::new()),
            gc_config: gc_config.clone(),
            op_count: AtomicU64::new(0),
            gc_lock: Mutex::new(()),
            shutdown: Arc::new(Notify::new()),
            sweeper: None,
        };

        if let GcInterval::Duration(interval) = gc_config.interval {
            storage.sweeper = storage.start_gc_task(interval.max(MIN_GC_INTERVAL));
        }

        storage
    }

    /// Start the background sweeper.
    ///
    /// The sweeper only holds a weak reference to the map and stops when the
    /// storage is dropped. Without a tokio runtime it runs on its own thread,
    /// which is returned so `Drop` can stop and join it.
    fn start_gc_task(&self, interval: Duration) -> Option<Sweeper> {
        let data = Arc::downgrade(&self.data);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let shutdown = self.shutdown.clone();
                handle.spawn(async move {
                    loop {
                        tokio::select! {
                            _ = tokio::time::sleep(interval) => {
                                if !sweep_weak(&data) {
                                    break;
                                }
                            }
                            _ = shutdown.notified() => {
                                break;
                            }
                        }
                    }
                });
                None
            }
            Err(_) => {
                let (stop, stopped) = mpsc::channel::<()>();
                let spawned = std::thread::Builder::new()
                    .name("rategate-gc".into())
                    .spawn(move || {
                        while let Err(RecvTimeoutError::Timeout) = stopped.recv_timeout(interval) {
                            if !sweep_weak(&data) {
                                break;
                            }
                        }
                    });
                match spawned {
                    Ok(handle) => Some(Sweeper { stop, handle }),
                    Err(e) => {
                        warn!(error = %e, "failed to start memory storage sweeper");
                        None
                    }
                }
            }
        }
    }

    /// Manually trigger garbage collection. Returns the number of evicted entries.
    pub fn run_gc(&self) -> usize {
        sweep(&self.data)
    }

    /// Get the number of entries currently stored, including expired ones
    /// not yet swept.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if the storage is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Clear all entries.
    pub fn clear(&self) {
        self.data.clear();
    }

    /// Check if GC should run and run it if needed.
    fn maybe_run_gc(&self) {
        if let GcInterval::Requests(threshold) = self.gc_config.interval {
            let count = self.op_count.fetch_add(1, Ordering::Relaxed);
            if threshold > 0 && count > 0 && count % threshold == 0 {
                // Try to acquire GC lock (non-blocking)
                if let Some(_guard) = self.gc_lock.try_lock() {
                    sweep(&self.data);
                }
            }
        }
    }

    /// Current snapshot for a key, live or not.
    fn slot(&self, key: &str) -> Option<Arc<Slot>> {
        self.data.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Install `next` only if the key still holds `observed`.
    ///
    /// `None` as the observation matches a vacant key or an expired slot.
    fn swap_slot(&self, key: &str, observed: Option<&Arc<Slot>>, next: Slot) -> bool {
        match self.data.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let unchanged = match observed {
                    Some(observed) => Arc::ptr_eq(occupied.get(), observed),
                    None => !occupied.get().is_live(Instant::now()),
                };
                if unchanged {
                    occupied.insert(Arc::new(next));
                }
                unchanged
            }
            Entry::Vacant(vacant) => {
                if observed.is_none() {
                    vacant.insert(Arc::new(next));
                    true
                } else {
                    false
                }
            }
        }
    }
}

impl Drop for MemoryStorage {
    fn drop(&mut self) {
        // Stores a permit, so a task busy sweeping still sees it.
        self.shutdown.notify_one();

        if let Some(Sweeper { stop, handle }) = self.sweeper.take() {
            drop(stop);
            if handle.join().is_err() {
                warn!("memory storage sweeper panicked");
            }
        }
    }
}

/// Remove every expired entry from the map.
fn sweep(data: &Slots) -> usize {
    let now = Instant::now();
    let before = data.len();
    data.retain(|_, slot| slot.is_live(now));
    let evicted = before.saturating_sub(data.len());
    if evicted > 0 {
        debug!(evicted, "swept expired rate limit entries");
    }
    evicted
}

/// Sweep through a weak handle; `false` once the storage is gone.
fn sweep_weak(data: &Weak<Slots>) -> bool {
    match data.upgrade() {
        Some(data) => {
            sweep(&data);
            true
        }
        None => false,
    }
}

impl Storage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<StoredValue>> {
        self.maybe_run_gc();

        let now = Instant::now();
        match self.slot(key) {
            Some(slot) if slot.is_live(now) => Ok(Some(slot.value.clone())),
            Some(_) => {
                // Only evict if nobody replaced the expired slot meanwhile.
                self.data.remove_if(key, |_, slot| !slot.is_live(now));
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: StoredValue, ttl: Duration) -> Result<()> {
        self.maybe_run_gc();

        self.data
            .insert(key.to_string(), Arc::new(Slot::new(value, ttl, Instant::now())));
        Ok(())
    }

    async fn increment(&self, key: &str, delta: i64, ttl: Duration) -> Result<i64> {
        self.maybe_run_gc();

        loop {
            let now = Instant::now();
            let observed = self.slot(key);

            let next = match observed.as_deref() {
                Some(slot) if slot.is_live(now) => match slot.value {
                    StoredValue::Counter(count) => Slot {
                        value: StoredValue::Counter(count.saturating_add(delta)),
                        expires_at: slot.expires_at,
                    },
                    ref other => {
                        return Err(StorageError::type_mismatch(key, "counter", other.kind()).into());
                    }
                },
                // Absent or expired: the counter restarts instead of adding to stale data.
                _ => Slot::new(StoredValue::Counter(delta), ttl, now),
            };
            let new_count = next.value.as_counter().unwrap_or(delta);

            if self.swap_slot(key, observed.as_ref(), next) {
                return Ok(new_count);
            }
            trace!(key, "increment raced with another writer, retrying");
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.data.remove(key);
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&StoredValue>,
        new: StoredValue,
        ttl: Duration,
    ) -> Result<bool> {
        self.maybe_run_gc();

        let now = Instant::now();
        let observed = self.slot(key);
        let live = observed.as_ref().filter(|slot| slot.is_live(now));

        let matches = match (expected, live) {
            (None, None) => true,
            (Some(expected), Some(slot)) => *expected == slot.value,
            _ => false,
        };
        if !matches {
            return Ok(false);
        }

        Ok(self.swap_slot(key, observed.as_ref(), Slot::new(new, ttl, now)))
    }
}
