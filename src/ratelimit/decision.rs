//! Admission decisions and the rate-limit header contract.

use http::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use serde::Serialize;

use super::window::WindowState;

/// Cap on requests in the current window.
pub const X_RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
/// Requests left in the current window.
pub const X_RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
/// Epoch seconds at which the current window closes.
pub const X_RATELIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");

/// The outcome of a `check` or `increment`.
///
/// Computed fresh from the window state on every call; never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    /// Epoch milliseconds at which the window closes
    pub reset_at_ms: u64,
    /// Whole seconds to wait, present only when denied
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

impl Decision {
    /// Build a decision from a window snapshot taken at `now_ms`.
    pub fn from_window(limit: u64, state: &WindowState, now_ms: u64, allowed: bool) -> Self {
        Self {
            allowed,
            limit,
            remaining: state.remaining(limit),
            reset_at_ms: state.reset_at_ms,
            retry_after_secs: (!allowed).then(|| state.millis_until_reset(now_ms).div_ceil(1000)),
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.allowed
    }

    /// Reset time as epoch seconds, rounded up so clients never retry early.
    pub fn reset_epoch_secs(&self) -> u64 {
        self.reset_at_ms.div_ceil(1000)
    }

    /// Write the `X-RateLimit-*` headers, plus `Retry-After` when denied.
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        headers.insert(X_RATELIMIT_LIMIT, HeaderValue::from(self.limit));
        headers.insert(X_RATELIMIT_REMAINING, HeaderValue::from(self.remaining));
        headers.insert(X_RATELIMIT_RESET, HeaderValue::from(self.reset_epoch_secs()));
        if let Some(retry_after) = self.retry_after_secs {
            headers.insert(RETRY_AFTER, HeaderValue::from(retry_after));
        }
    }
}
