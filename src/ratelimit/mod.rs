//! Rate limiting logic and state management.

pub mod clock;
mod decision;
mod descriptor;
mod limiter;
pub mod middleware;
mod registry;
pub mod store;
mod sweeper;
mod window;

pub use clock::{Clock, ManualClock, SystemClock};
pub use decision::{Decision, X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING, X_RATELIMIT_RESET};
pub use descriptor::{
    AddressKey, AddressRouteKey, ClientIdentity, HeaderKey, KeyDeriver, KeyStrategy,
    RequestDescriptor, LOOPBACK_PLACEHOLDER,
};
pub use limiter::{RateLimiter, RateLimiterBuilder};
pub use middleware::{wrap, wrap_handler, AdmissionLayer, AdmissionService, DenialBody};
pub use registry::LimiterRegistry;
pub use store::{LruWindowStore, StoreError, WindowStore};
pub use sweeper::spawn_sweeper;
pub use window::WindowState;
