//! Fixed-window state for a single throttling key.

use std::time::Duration;

/// Count and reset time of the current window for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowState {
    /// Requests counted in this window, including the one that overflowed it
    pub count: u64,
    /// Epoch milliseconds at which this window closes
    pub reset_at_ms: u64,
}

impl WindowState {
    /// An empty window opening at `now_ms`.
    pub fn fresh(now_ms: u64, window: Duration) -> Self {
        Self {
            count: 0,
            reset_at_ms: now_ms.saturating_add(duration_millis(window)),
        }
    }

    /// Whether the window has closed. Expired entries are treated as absent
    /// even if the store still holds them.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.reset_at_ms
    }

    /// Slots left before `limit` is reached.
    pub fn remaining(&self, limit: u64) -> u64 {
        limit.saturating_sub(self.count)
    }

    /// Milliseconds until the window closes, zero once it has.
    pub fn millis_until_reset(&self, now_ms: u64) -> u64 {
        self.reset_at_ms.saturating_sub(now_ms)
    }

    /// Count one request, opening a new window first if this one has closed.
    ///
    /// The count saturates at `ceiling`, so repeated denials within a window
    /// do not grow it without bound.
    pub fn record_hit(&mut self, now_ms: u64, window: Duration, ceiling: u64) {
        if self.is_expired(now_ms) {
            *self = Self::fresh(now_ms, window);
        }
        self.count = self.count.saturating_add(1).min(ceiling);
    }
}

/// Convert a window length to whole milliseconds.
pub fn duration_millis(window: Duration) -> u64 {
    u64::try_from(window.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);

    #[test]
    fn test_fresh_window_reset_time() {
        let state = WindowState::fresh(1_000, MINUTE);
        assert_eq!(state.count, 0);
        assert_eq!(state.reset_at_ms, 61_000);
        assert!(!state.is_expired(60_999));
        assert!(state.is_expired(61_000));
    }

    #[test]
    fn test_record_hit_within_window() {
        let mut state = WindowState::fresh(0, MINUTE);
        state.record_hit(10, MINUTE, 4);
        state.record_hit(20, MINUTE, 4);

        assert_eq!(state.count, 2);
        assert_eq!(state.reset_at_ms, 60_000);
        assert_eq!(state.remaining(3), 1);
    }

    #[test]
    fn test_record_hit_after_expiry_opens_new_window() {
        let mut state = WindowState {
            count: 7,
            reset_at_ms: 60_000,
        };
        state.record_hit(60_000, MINUTE, 4);

        assert_eq!(state.count, 1);
        assert_eq!(state.reset_at_ms, 120_000);
    }

    #[test]
    fn test_record_hit_saturates_at_ceiling() {
        let mut state = WindowState::fresh(0, MINUTE);
        for _ in 0..10 {
            state.record_hit(5, MINUTE, 4);
        }
        assert_eq!(state.count, 4);
        assert_eq!(state.remaining(3), 0);
    }

    #[test]
    fn test_millis_until_reset() {
        let state = WindowState::fresh(0, MINUTE);
        assert_eq!(state.millis_until_reset(59_500), 500);
        assert_eq!(state.millis_until_reset(70_000), 0);
    }
}
