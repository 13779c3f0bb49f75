//! Core rate limiter implementation.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::config::LimiterSettings;
use crate::error::{Result, TurnstileError};

use super::clock::{Clock, SystemClock};
use super::decision::Decision;
use super::descriptor::{AddressRouteKey, KeyDeriver, RequestDescriptor, LOOPBACK_PLACEHOLDER};
use super::store::{LruWindowStore, WindowStore};
use super::window::{duration_millis, WindowState};

/// A fixed-window rate limiter for one named endpoint class.
///
/// This struct is thread-safe and is meant to be shared behind an `Arc`.
/// Requests are counted before they are judged: the request that pushes a
/// key past `max_requests` is denied but still occupies a slot.
pub struct RateLimiter {
    name: String,
    window: Duration,
    max_requests: u64,
    key_deriver: Arc<dyn KeyDeriver>,
    store: Arc<dyn WindowStore>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Start building a limiter.
    pub fn builder(name: impl Into<String>) -> RateLimiterBuilder {
        RateLimiterBuilder::new(name)
    }

    /// Build a limiter from configuration with the system clock and an
    /// in-memory store.
    pub fn from_settings(name: &str, settings: &LimiterSettings) -> Result<Self> {
        settings.validate(name)?;
        Self::builder(name)
            .window(settings.window())
            .max_requests(settings.max_requests)
            .store_capacity(settings.store_capacity)
            .key_deriver_arc(settings.key.deriver(settings.key_header.as_deref())?)
            .build()
    }

    /// Limiter name, used in logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Length of each counting window.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Requests admitted per key per window.
    pub fn max_requests(&self) -> u64 {
        self.max_requests
    }

    /// The key a descriptor is throttled under.
    pub fn key_for(&self, descriptor: &RequestDescriptor) -> String {
        self.key_deriver.derive(descriptor).unwrap_or_else(|| {
            debug!(
                limiter = %self.name,
                route = %descriptor.route,
                "Key derivation failed, using placeholder key"
            );
            LOOPBACK_PLACEHOLDER.to_string()
        })
    }

    /// Report the current standing of a request without counting it.
    pub fn check(&self, descriptor: &RequestDescriptor) -> Decision {
        self.check_key(&self.key_for(descriptor))
    }

    /// Count a request and decide whether to admit it.
    pub fn increment(&self, descriptor: &RequestDescriptor) -> Decision {
        self.increment_key(&self.key_for(descriptor))
    }

    /// [`check`](Self::check) for an already-derived key.
    pub fn check_key(&self, key: &str) -> Decision {
        let now = self.clock.now_millis();

        trace!(limiter = %self.name, key = key, "Checking rate limit");

        let state = match self.store.get(key) {
            Ok(Some(state)) if !state.is_expired(now) => state,
            Ok(_) => WindowState::fresh(now, self.window),
            Err(e) => return self.fail_open(key, now, &e),
        };

        Decision::from_window(self.max_requests, &state, now, state.count < self.max_requests)
    }

    /// [`increment`](Self::increment) for an already-derived key.
    pub fn increment_key(&self, key: &str) -> Decision {
        let now = self.clock.now_millis();
        let ceiling = self.max_requests.saturating_add(1);

        let state = match self.store.increment(key, now, self.window, ceiling) {
            Ok(state) => state,
            Err(e) => return self.fail_open(key, now, &e),
        };

        let allowed = state.count <= self.max_requests;
        if !allowed {
            debug!(
                limiter = %self.name,
                key = key,
                count = state.count,
                limit = self.max_requests,
                "Rate limit exceeded"
            );
        }

        Decision::from_window(self.max_requests, &state, now, allowed)
    }

    /// Forget a request's window, e.g. after a successful login.
    pub fn reset(&self, descriptor: &RequestDescriptor) {
        self.reset_key(&self.key_for(descriptor));
    }

    /// Forget the window for `key`.
    pub fn reset_key(&self, key: &str) {
        if let Err(e) = self.store.remove(key) {
            warn!(limiter = %self.name, key = key, error = %e, "Failed to reset window");
        }
    }

    /// Physically drop expired windows. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        match self.store.purge_expired(self.clock.now_millis()) {
            Ok(purged) => purged,
            Err(e) => {
                warn!(limiter = %self.name, error = %e, "Failed to purge expired windows");
                0
            }
        }
    }

    /// Number of keys currently held by the store.
    pub fn tracked_keys(&self) -> usize {
        self.store.len()
    }

    /// The backing window store.
    pub fn store(&self) -> &Arc<dyn WindowStore> {
        &self.store
    }

    fn fail_open(&self, key: &str, now: u64, error: &dyn std::error::Error) -> Decision {
        warn!(
            limiter = %self.name,
            key = key,
            error = %error,
            "Window store failed, admitting request"
        );
        Decision::from_window(self.max_requests, &WindowState::fresh(now, self.window), now, true)
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("name", &self.name)
            .field("window", &self.window)
            .field("max_requests", &self.max_requests)
            .field("store", &self.store)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

/// Builder for [`RateLimiter`].
///
/// `window` and `max_requests` are required. The key deriver defaults to
/// [`AddressRouteKey`], the clock to [`SystemClock`] and the store to an
/// [`LruWindowStore`] of `store_capacity` keys.
pub struct RateLimiterBuilder {
    name: String,
    window: Option<Duration>,
    max_requests: Option<u64>,
    store_capacity: usize,
    key_deriver: Arc<dyn KeyDeriver>,
    store: Option<Arc<dyn WindowStore>>,
    clock: Arc<dyn Clock>,
}

impl RateLimiterBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            window: None,
            max_requests: None,
            store_capacity: LruWindowStore::DEFAULT_CAPACITY,
            key_deriver: Arc::new(AddressRouteKey),
            store: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Window length. Required and non-zero.
    pub fn window(mut self, window: Duration) -> Self {
        self.window = Some(window);
        self
    }

    /// Requests admitted per key per window. Required and non-zero.
    pub fn max_requests(mut self, max_requests: u64) -> Self {
        self.max_requests = Some(max_requests);
        self
    }

    /// Capacity of the default in-memory store. Ignored when a store is
    /// supplied with [`store`](Self::store).
    pub fn store_capacity(mut self, capacity: usize) -> Self {
        self.store_capacity = capacity;
        self
    }

    /// How keys are derived from requests.
    pub fn key_deriver<K: KeyDeriver + 'static>(self, key_deriver: K) -> Self {
        self.key_deriver_arc(Arc::new(key_deriver))
    }

    /// [`key_deriver`](Self::key_deriver) for an already shared deriver.
    pub fn key_deriver_arc(mut self, key_deriver: Arc<dyn KeyDeriver>) -> Self {
        self.key_deriver = key_deriver;
        self
    }

    /// Use `store` instead of a fresh in-memory one.
    pub fn store(mut self, store: Arc<dyn WindowStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Time source, e.g. a [`ManualClock`](super::clock::ManualClock) in tests.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Validate and build the limiter.
    pub fn build(self) -> Result<RateLimiter> {
        let RateLimiterBuilder {
            name,
            window,
            max_requests,
            store_capacity,
            key_deriver,
            store,
            clock,
        } = self;
        let invalid =
            |reason: &str| TurnstileError::Config(format!("limiter {:?}: {}", name, reason));

        let window = window
            .filter(|w| duration_millis(*w) > 0)
            .ok_or_else(|| invalid("window must be at least one millisecond"))?;
        let max_requests = max_requests
            .filter(|m| *m > 0)
            .ok_or_else(|| invalid("max_requests must be greater than zero"))?;

        let store: Arc<dyn WindowStore> = match store {
            Some(store) => store,
            None => {
                let capacity = NonZeroUsize::new(store_capacity)
                    .ok_or_else(|| invalid("store_capacity must be greater than zero"))?;
                Arc::new(LruWindowStore::new(capacity))
            }
        };

        info!(
            limiter = %name,
            window_ms = duration_millis(window),
            max_requests = max_requests,
            capacity = store.capacity(),
            "Rate limiter initialized"
        );

        Ok(RateLimiter {
            name,
            window,
            max_requests,
            key_deriver,
            store,
            clock,
        })
    }
}
