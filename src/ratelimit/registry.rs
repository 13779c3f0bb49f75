//! Named limiter instances.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::TurnstileConfig;
use crate::error::Result;

use super::limiter::RateLimiter;
use super::middleware::AdmissionLayer;

/// Independent limiters keyed by name ("api", "chat", "compute", "auth").
///
/// Each limiter owns its own store, so exhausting one endpoint class's budget
/// never affects another's.
#[derive(Debug, Default)]
pub struct LimiterRegistry {
    limiters: DashMap<String, Arc<RateLimiter>>,
}

impl LimiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build one limiter per configured entry.
    pub fn from_config(config: &TurnstileConfig) -> Result<Self> {
        config.validate()?;
        let registry = Self::new();
        for (name, settings) in &config.limiters {
            registry.register(RateLimiter::from_settings(name, settings)?);
        }
        info!(limiters = registry.len(), "Limiter registry built");
        Ok(registry)
    }

    /// Add a limiter under its own name, returning any limiter it replaced.
    pub fn register(&self, limiter: RateLimiter) -> Option<Arc<RateLimiter>> {
        let name = limiter.name().to_string();
        let replaced = self.limiters.insert(name.clone(), Arc::new(limiter));
        if replaced.is_some() {
            debug!(limiter = %name, "Replaced limiter");
        }
        replaced
    }

    pub fn get(&self, name: &str) -> Option<Arc<RateLimiter>> {
        self.limiters.get(name).map(|entry| entry.value().clone())
    }

    /// An [`AdmissionLayer`] enforcing the named limiter.
    pub fn layer(&self, name: &str) -> Option<AdmissionLayer> {
        self.get(name).map(AdmissionLayer::new)
    }

    /// Limiter names in sorted order.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.limiters.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }

    /// Drop expired windows from every limiter.
    pub fn purge_expired(&self) -> usize {
        self.limiters
            .iter()
            .map(|entry| entry.value().purge_expired())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::RequestDescriptor;
    use std::time::Duration;

    fn limiter(name: &str, max_requests: u64, clock: Arc<ManualClock>) -> RateLimiter {
        RateLimiter::builder(name)
            .window(Duration::from_secs(60))
            .max_requests(max_requests)
            .clock(clock)
            .build()
            .unwrap()
    }

    #[test]
    fn test_from_default_config() {
        let registry = LimiterRegistry::from_config(&TurnstileConfig::default()).unwrap();

        assert_eq!(registry.names(), vec!["api", "auth", "chat", "compute"]);
        assert_eq!(registry.get("auth").unwrap().max_requests(), 5);
        assert!(registry.get("missing").is_none());
        assert!(registry.layer("chat").is_some());
    }

    #[test]
    fn test_limiters_are_independent() {
        let clock = Arc::new(ManualClock::new(0));
        let registry = LimiterRegistry::new();
        registry.register(limiter("chat", 1, clock.clone()));
        registry.register(limiter("compute", 1, clock));

        let request = RequestDescriptor::new("/same").with_header("x-real-ip", "1.2.3.4");
        let chat = registry.get("chat").unwrap();
        let compute = registry.get("compute").unwrap();

        assert!(chat.increment(&request).allowed);
        assert!(!chat.increment(&request).allowed);
        assert!(compute.increment(&request).allowed);
    }

    #[test]
    fn test_register_replaces() {
        let clock = Arc::new(ManualClock::new(0));
        let registry = LimiterRegistry::new();
        assert!(registry.register(limiter("chat", 1, clock.clone())).is_none());

        let replaced = registry.register(limiter("chat", 9, clock)).unwrap();
        assert_eq!(replaced.max_requests(), 1);
        assert_eq!(registry.get("chat").unwrap().max_requests(), 9);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_purge_expired_across_limiters() {
        let clock = Arc::new(ManualClock::new(0));
        let registry = LimiterRegistry::new();
        registry.register(limiter("a", 5, clock.clone()));
        registry.register(limiter("b", 5, clock.clone()));

        registry.get("a").unwrap().increment_key("k");
        registry.get("b").unwrap().increment_key("k");

        clock.advance(Duration::from_secs(60));
        assert_eq!(registry.purge_expired(), 2);
    }
}
