//! Configuration management for Turnstile.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, TurnstileError};
use crate::ratelimit::KeyStrategy;

/// Environment variable prefix for overrides, e.g.
/// `TURNSTILE__LIMITERS__CHAT__MAX_REQUESTS=20`.
pub const ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration: one entry per named limiter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Limiter settings keyed by limiter name
    #[serde(default = "default_limiters")]
    pub limiters: BTreeMap<String, LimiterSettings>,
}

impl Default for TurnstileConfig {
    fn default() -> Self {
        Self {
            limiters: default_limiters(),
        }
    }
}

/// Settings for one named limiter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterSettings {
    /// Window length in milliseconds
    pub window_ms: u64,

    /// Requests allowed per key per window
    pub max_requests: u64,

    /// Distinct keys held before least-recently-used eviction
    #[serde(default = "default_store_capacity")]
    pub store_capacity: usize,

    /// How the throttling key is derived from a request
    #[serde(default)]
    pub key: KeyStrategy,

    /// Header to key on when `key` is `header`
    #[serde(default)]
    pub key_header: Option<String>,
}

impl LimiterSettings {
    pub fn new(window: Duration, max_requests: u64) -> Self {
        Self {
            window_ms: u64::try_from(window.as_millis()).unwrap_or(u64::MAX),
            max_requests,
            store_capacity: default_store_capacity(),
            key: KeyStrategy::default(),
            key_header: None,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Reject settings no limiter can be built from.
    pub fn validate(&self, name: &str) -> Result<()> {
        if self.window_ms == 0 {
            return Err(invalid(name, "window_ms must be greater than zero"));
        }
        if self.max_requests == 0 {
            return Err(invalid(name, "max_requests must be greater than zero"));
        }
        if self.store_capacity == 0 {
            return Err(invalid(name, "store_capacity must be greater than zero"));
        }
        self.key
            .deriver(self.key_header.as_deref())
            .map_err(|e| invalid(name, &e.to_string()))?;
        Ok(())
    }
}

fn invalid(name: &str, reason: &str) -> TurnstileError {
    TurnstileError::Config(format!("limiter {:?}: {}", name, reason))
}

fn default_store_capacity() -> usize {
    1000
}

/// General API traffic, chat, compute-heavy endpoints and authentication.
fn default_limiters() -> BTreeMap<String, LimiterSettings> {
    const MINUTE: Duration = Duration::from_secs(60);
    BTreeMap::from([
        ("api".to_string(), LimiterSettings::new(MINUTE * 15, 100)),
        ("chat".to_string(), LimiterSettings::new(MINUTE, 10)),
        ("compute".to_string(), LimiterSettings::new(MINUTE, 30)),
        ("auth".to_string(), LimiterSettings::new(MINUTE * 15, 5)),
    ])
}

impl TurnstileConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading limiter configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TurnstileConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load the built-in presets, then an optional file, then
    /// `TURNSTILE__*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let defaults = config::Config::try_from(&TurnstileConfig::default())?;
        let mut builder = config::Config::builder().add_source(defaults);

        if let Some(path) = path {
            info!(path = %path.display(), "Layering limiter configuration file");
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Yaml)
                    .required(true),
            );
        }

        let config: TurnstileConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Validate every limiter.
    pub fn validate(&self) -> Result<()> {
        if self.limiters.is_empty() {
            return Err(TurnstileError::Config(
                "at least one limiter must be configured".to_string(),
            ));
        }
        for (name, settings) in &self.limiters {
            settings.validate(name)?;
        }
        Ok(())
    }

    /// Settings for one limiter.
    pub fn limiter(&self, name: &str) -> Option<&LimiterSettings> {
        self.limiters.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_presets() {
        let config = TurnstileConfig::default();
        assert!(config.validate().is_ok());

        let chat = config.limiter("chat").unwrap();
        assert_eq!(chat.window_ms, 60_000);
        assert_eq!(chat.max_requests, 10);
        assert_eq!(chat.store_capacity, 1000);
        assert_eq!(chat.key, KeyStrategy::AddressRoute);

        let auth = config.limiter("auth").unwrap();
        assert_eq!(auth.window(), Duration::from_secs(900));
        assert_eq!(auth.max_requests, 5);

        assert!(config.limiter("api").is_some());
        assert!(config.limiter("compute").is_some());
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
limiters:
  chat:
    window_ms: 60000
    max_requests: 3
  users:
    window_ms: 1000
    max_requests: 50
    store_capacity: 10
    key: header
    key_header: x-user-id
"#;
        let config = TurnstileConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.limiters.len(), 2);

        let chat = config.limiter("chat").unwrap();
        assert_eq!(chat.max_requests, 3);
        assert_eq!(chat.store_capacity, 1000);

        let users = config.limiter("users").unwrap();
        assert_eq!(users.key, KeyStrategy::Header);
        assert_eq!(users.key_header.as_deref(), Some("x-user-id"));
        assert_eq!(users.store_capacity, 10);
    }

    #[test]
    fn test_missing_limiters_uses_presets() {
        let config = TurnstileConfig::from_yaml("{}").unwrap();
        assert_eq!(config.limiters.len(), 4);
    }

    #[test]
    fn test_rejects_zero_window() {
        let yaml = r#"
limiters:
  broken:
    window_ms: 0
    max_requests: 3
"#;
        let err = TurnstileConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("window_ms"));
    }

    #[test]
    fn test_rejects_zero_max_requests() {
        let settings = LimiterSettings::new(Duration::from_secs(1), 0);
        assert!(settings.validate("x").is_err());
    }

    #[test]
    fn test_rejects_zero_capacity() {
        let mut settings = LimiterSettings::new(Duration::from_secs(1), 1);
        settings.store_capacity = 0;
        assert!(settings.validate("x").is_err());
    }

    #[test]
    fn test_rejects_header_strategy_without_header() {
        let mut settings = LimiterSettings::new(Duration::from_secs(1), 1);
        settings.key = KeyStrategy::Header;
        assert!(settings.validate("x").is_err());
    }

    #[test]
    fn test_rejects_empty_limiters() {
        assert!(TurnstileConfig::from_yaml("limiters: {}").is_err());
    }

    #[test]
    fn test_rejects_malformed_yaml() {
        let err = TurnstileConfig::from_yaml("limiters: [").unwrap_err();
        assert!(matches!(err, TurnstileError::Config(_)));
    }

    #[test]
    fn test_from_file() {
        let path = std::env::temp_dir().join(format!("turnstile-{}.yaml", std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "limiters:\n  compute:\n    window_ms: 30000\n    max_requests: 7"
        )
        .unwrap();

        let config = TurnstileConfig::from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.limiter("compute").unwrap().max_requests, 7);
    }

    #[test]
    fn test_from_missing_file_is_io_error() {
        let err = TurnstileConfig::from_file("/nonexistent/turnstile.yaml").unwrap_err();
        assert!(matches!(err, TurnstileError::Io(_)));
    }

    #[test]
    fn test_load_without_file_yields_presets() {
        let config = TurnstileConfig::load(None).unwrap();
        assert!(config.limiter("api").is_some());
        assert_eq!(config.limiter("chat").unwrap().max_requests, 10);
    }

    #[test]
    fn test_load_layers_partial_file_over_presets() {
        // Parsed as YAML whatever the extension
        let path = std::env::temp_dir().join(format!("turnstile-load-{}.conf", std::process::id()));
        std::fs::write(&path, "limiters:\n  chat:\n    max_requests: 3\n").unwrap();

        let config = TurnstileConfig::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.limiters.len(), 4);
        let chat = config.limiter("chat").unwrap();
        assert_eq!(chat.max_requests, 3);
        assert_eq!(chat.window_ms, 60_000);
        assert_eq!(chat.store_capacity, 1000);
        assert_eq!(config.limiter("compute").unwrap().max_requests, 30);
    }

    #[test]
    fn test_load_applies_env_override() {
        std::env::set_var("TURNSTILE__LIMITERS__AUTH__MAX_REQUESTS", "9");
        let config = TurnstileConfig::load(None);
        std::env::remove_var("TURNSTILE__LIMITERS__AUTH__MAX_REQUESTS");

        let auth = config.unwrap().limiters.remove("auth").unwrap();
        assert_eq!(auth.max_requests, 9);
        assert_eq!(auth.window_ms, 900_000);
    }
}
