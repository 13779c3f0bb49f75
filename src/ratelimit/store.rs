//! Bounded storage for per-key window state.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use lru::LruCache;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, trace};

use super::window::WindowState;

/// Errors a window store backend can report.
///
/// The limiter never surfaces these to the request path; it fails open.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("window store unavailable: {0}")]
    Unavailable(String),
}

/// Storage interface for window state keyed by throttling key.
///
/// `increment` must be atomic with respect to every other operation on the
/// same key: two concurrent increments always produce two counts.
pub trait WindowStore: Send + Sync + std::fmt::Debug {
    /// Read a key's state without refreshing its recency.
    fn get(&self, key: &str) -> Result<Option<WindowState>, StoreError>;

    /// Overwrite a key's state.
    fn set(&self, key: &str, state: WindowState) -> Result<(), StoreError>;

    /// Count one hit for `key`, opening a new window if there is none or the
    /// current one has expired. Returns the post-increment state.
    fn increment(
        &self,
        key: &str,
        now_ms: u64,
        window: Duration,
        ceiling: u64,
    ) -> Result<WindowState, StoreError>;

    /// Drop a key's state.
    fn remove(&self, key: &str) -> Result<Option<WindowState>, StoreError>;

    /// Physically remove every expired entry. Returns how many were removed.
    fn purge_expired(&self, now_ms: u64) -> Result<usize, StoreError>;

    /// Number of keys currently held, expired or not.
    ///
    /// Inspection only. Backends that cannot answer report zero rather than
    /// an error.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of keys held before eviction. Fixed at construction.
    fn capacity(&self) -> usize;
}

/// In-memory store with least-recently-used eviction.
///
/// All operations run under one short mutex section, so the
/// read-modify-write in `increment` cannot lose updates.
#[derive(Debug)]
pub struct LruWindowStore {
    entries: Mutex<LruCache<String, WindowState>>,
    evictions: AtomicU64,
}

impl LruWindowStore {
    /// Default number of distinct keys held.
    pub const DEFAULT_CAPACITY: usize = 1000;

    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            evictions: AtomicU64::new(0),
        }
    }

    /// Total entries evicted under capacity pressure.
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    fn record_eviction(&self, evicted: Option<(String, WindowState)>, inserted: &str) {
        if let Some((evicted_key, state)) = evicted {
            // `push` hands back the old value when the key already existed
            if evicted_key != inserted {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(
                    evicted = %evicted_key,
                    count = state.count,
                    "Evicted least recently used window"
                );
            }
        }
    }
}

impl Default for LruWindowStore {
    fn default() -> Self {
        Self::new(NonZeroUsize::new(Self::DEFAULT_CAPACITY).unwrap_or(NonZeroUsize::MIN))
    }
}

impl WindowStore for LruWindowStore {
    fn get(&self, key: &str) -> Result<Option<WindowState>, StoreError> {
        Ok(self.entries.lock().peek(key).copied())
    }

    fn set(&self, key: &str, state: WindowState) -> Result<(), StoreError> {
        let evicted = self.entries.lock().push(key.to_string(), state);
        self.record_eviction(evicted, key);
        Ok(())
    }

    fn increment(
        &self,
        key: &str,
        now_ms: u64,
        window: Duration,
        ceiling: u64,
    ) -> Result<WindowState, StoreError> {
        let mut entries = self.entries.lock();

        if let Some(state) = entries.get_mut(key) {
            state.record_hit(now_ms, window, ceiling);
            trace!(key = key, count = state.count, "Incremented window");
            return Ok(*state);
        }

        let mut state = WindowState::fresh(now_ms, window);
        state.record_hit(now_ms, window, ceiling);
        let evicted = entries.push(key.to_string(), state);
        drop(entries);

        debug!(key = key, reset_at_ms = state.reset_at_ms, "Opened new window");
        self.record_eviction(evicted, key);
        Ok(state)
    }

    fn remove(&self, key: &str) -> Result<Option<WindowState>, StoreError> {
        Ok(self.entries.lock().pop(key))
    }

    fn purge_expired(&self, now_ms: u64) -> Result<usize, StoreError> {
        let mut entries = self.entries.lock();
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, state)| state.is_expired(now_ms))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            entries.pop(key);
        }
        Ok(expired.len())
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }

    fn capacity(&self) -> usize {
        self.entries.lock().cap().get()
    }
}
