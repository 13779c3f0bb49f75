//! Request descriptors and throttling key derivation.

use std::sync::Arc;

use http::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::{Result, TurnstileError};

/// Address used when a request carries no usable client-address signal, and
/// the key used when a deriver cannot produce one.
pub const LOOPBACK_PLACEHOLDER: &str = "127.0.0.1";

/// Joins the identity and route parts of a key.
pub const KEY_SEPARATOR: char = ':';

/// Client-address headers in resolution order.
const ADDRESS_HEADERS: [&str; 3] = ["x-forwarded-for", "x-real-ip", "cf-connecting-ip"];

/// Identity established by an upstream authentication layer.
///
/// Insert it into the request extensions and the default key derivation
/// throttles by it instead of by client address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity(pub String);

/// What the limiter needs to know about an inbound request.
#[derive(Debug, Clone, Default)]
pub struct RequestDescriptor {
    /// Logical route or operation name
    pub route: String,
    /// Raw request headers, consulted for forwarded-address signals
    pub headers: HeaderMap,
    /// Caller-supplied identity that replaces the client address
    pub identity: Option<String>,
}

impl RequestDescriptor {
    /// Create a descriptor for `route` with no headers.
    pub fn new(route: impl Into<String>) -> Self {
        Self {
            route: route.into(),
            ..Self::default()
        }
    }

    /// Add a header. Names or values that are not valid HTTP are ignored.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                self.headers.append(name, value);
            }
            _ => trace!(header = name, "Ignoring invalid header on descriptor"),
        }
        self
    }

    /// Set the identity override.
    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = Some(identity.into());
        self
    }

    /// Describe an HTTP request by its path, headers and any
    /// [`ClientIdentity`] extension.
    pub fn from_request<B>(request: &http::Request<B>) -> Self {
        Self {
            route: request.uri().path().to_string(),
            headers: request.headers().clone(),
            identity: request
                .extensions()
                .get::<ClientIdentity>()
                .map(|identity| identity.0.clone()),
        }
    }

    /// Resolve the client address from forwarded-address headers.
    ///
    /// Takes the first non-empty of the first `X-Forwarded-For` entry,
    /// `X-Real-IP` and `CF-Connecting-IP`, else [`LOOPBACK_PLACEHOLDER`].
    pub fn client_address(&self) -> String {
        ADDRESS_HEADERS
            .iter()
            .filter_map(|name| self.header_str(name))
            .filter_map(|value| value.split(',').next())
            .map(str::trim)
            .find(|value| !value.is_empty())
            .unwrap_or(LOOPBACK_PLACEHOLDER)
            .to_string()
    }

    fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    fn identity_or_address(&self) -> String {
        match self.identity.as_deref().map(str::trim) {
            Some(identity) if !identity.is_empty() => identity.to_string(),
            _ => self.client_address(),
        }
    }
}

/// Maps a request descriptor to the key it is throttled under.
///
/// Returning `None` means no key could be derived; the limiter then uses
/// [`LOOPBACK_PLACEHOLDER`] rather than failing the request. Implementations
/// must be deterministic.
pub trait KeyDeriver: Send + Sync {
    fn derive(&self, descriptor: &RequestDescriptor) -> Option<String>;
}

impl<F> KeyDeriver for F
where
    F: Fn(&RequestDescriptor) -> Option<String> + Send + Sync,
{
    fn derive(&self, descriptor: &RequestDescriptor) -> Option<String> {
        self(descriptor)
    }
}

/// `"{identity-or-address}:{route}"`: each client is throttled separately
/// per route.
#[derive(Debug, Clone, Copy, Default)]
pub struct AddressRouteKey;

impl KeyDeriver for AddressRouteKey {
    fn derive(&self, descriptor: &RequestDescriptor) -> Option<String> {
        Some(format!(
            "{}{}{}",
            descriptor.identity_or_address(),
            KEY_SEPARATOR,
            descriptor.route
        ))
    }
}

/// Identity or address alone, shared across routes.
#[derive(Debug, Clone, Copy, Default)]
pub struct AddressKey;

impl KeyDeriver for AddressKey {
    fn derive(&self, descriptor: &RequestDescriptor) -> Option<String> {
        Some(descriptor.identity_or_address())
    }
}

/// The value of a named request header, e.g. `x-user-id`.
#[derive(Debug, Clone)]
pub struct HeaderKey {
    name: HeaderName,
}

impl HeaderKey {
    pub fn new(name: &str) -> Result<Self> {
        let name = HeaderName::from_bytes(name.trim().as_bytes()).map_err(|e| {
            TurnstileError::Config(format!("invalid key header name {:?}: {}", name, e))
        })?;
        Ok(Self { name })
    }
}

impl KeyDeriver for HeaderKey {
    fn derive(&self, descriptor: &RequestDescriptor) -> Option<String> {
        descriptor
            .headers
            .get(&self.name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    }
}

/// Key derivation strategies selectable from configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategy {
    #[default]
    AddressRoute,
    Address,
    /// Requires a header name alongside
    Header,
}

impl KeyStrategy {
    /// Build the deriver for this strategy.
    pub fn deriver(&self, header: Option<&str>) -> Result<Arc<dyn KeyDeriver>> {
        let deriver: Arc<dyn KeyDeriver> = match self {
            KeyStrategy::AddressRoute => Arc::new(AddressRouteKey),
            KeyStrategy::Address => Arc::new(AddressKey),
            KeyStrategy::Header => match header.map(str::trim) {
                Some(name) if !name.is_empty() => Arc::new(HeaderKey::new(name)?),
                _ => {
                    return Err(TurnstileError::Config(
                        "header key strategy requires key_header".to_string(),
                    ))
                }
            },
        };
        Ok(deriver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forwarded_for_first_entry_wins() {
        let descriptor = RequestDescriptor::new("/chat")
            .with_header("x-forwarded-for", " 1.2.3.4 , 10.0.0.1")
            .with_header("x-real-ip", "5.6.7.8")
            .with_header("cf-connecting-ip", "9.9.9.9");

        assert_eq!(descriptor.client_address(), "1.2.3.4");
        assert_eq!(
            AddressRouteKey.derive(&descriptor).as_deref(),
            Some("1.2.3.4:/chat")
        );
    }

    #[test]
    fn test_address_resolution_order() {
        let real_ip = RequestDescriptor::new("/")
            .with_header("x-forwarded-for", "  ")
            .with_header("x-real-ip", "5.6.7.8")
            .with_header("cf-connecting-ip", "9.9.9.9");
        assert_eq!(real_ip.client_address(), "5.6.7.8");

        let edge = RequestDescriptor::new("/").with_header("cf-connecting-ip", "9.9.9.9");
        assert_eq!(edge.client_address(), "9.9.9.9");
    }

    #[test]
    fn test_missing_address_falls_back_to_loopback() {
        let descriptor = RequestDescriptor::new("/compute");
        assert_eq!(descriptor.client_address(), LOOPBACK_PLACEHOLDER);
        assert_eq!(
            AddressRouteKey.derive(&descriptor).as_deref(),
            Some("127.0.0.1:/compute")
        );
    }

    #[test]
    fn test_identity_replaces_address() {
        let descriptor = RequestDescriptor::new("/chat")
            .with_header("x-forwarded-for", "1.2.3.4")
            .with_identity("user-42");

        assert_eq!(
            AddressRouteKey.derive(&descriptor).as_deref(),
            Some("user-42:/chat")
        );
        assert_eq!(AddressKey.derive(&descriptor).as_deref(), Some("user-42"));
    }

    #[test]
    fn test_same_client_different_routes() {
        let chat = RequestDescriptor::new("/chat").with_header("x-real-ip", "1.1.1.1");
        let compute = RequestDescriptor::new("/compute").with_header("x-real-ip", "1.1.1.1");

        assert_ne!(AddressRouteKey.derive(&chat), AddressRouteKey.derive(&compute));
        assert_eq!(AddressKey.derive(&chat), AddressKey.derive(&compute));
    }

    #[test]
    fn test_from_request() {
        let mut request = http::Request::builder()
            .uri("https://example.com/api/chat?stream=true")
            .header("x-forwarded-for", "8.8.8.8")
            .body(())
            .unwrap();
        request
            .extensions_mut()
            .insert(ClientIdentity("alice".to_string()));

        let descriptor = RequestDescriptor::from_request(&request);
        assert_eq!(descriptor.route, "/api/chat");
        assert_eq!(descriptor.client_address(), "8.8.8.8");
        assert_eq!(descriptor.identity.as_deref(), Some("alice"));
    }

    #[test]
    fn test_non_ascii_address_header_is_skipped() {
        let request = http::Request::builder()
            .uri("/chat")
            .header(
                "x-forwarded-for",
                HeaderValue::from_bytes(b"\xe2\x80\x8b1.2.3.4").unwrap(),
            )
            .header("x-real-ip", "5.6.7.8")
            .body(())
            .unwrap();

        let descriptor = RequestDescriptor::from_request(&request);
        assert_eq!(descriptor.client_address(), "5.6.7.8");
        assert_eq!(AddressRouteKey.derive(&descriptor).as_deref(), Some("5.6.7.8:/chat"));
    }

    #[test]
    fn test_header_key() {
        let deriver = HeaderKey::new("X-User-Id").unwrap();

        let with_user = RequestDescriptor::new("/").with_header("x-user-id", "u-1");
        assert_eq!(deriver.derive(&with_user).as_deref(), Some("u-1"));

        let without_user = RequestDescriptor::new("/");
        assert_eq!(deriver.derive(&without_user), None);
    }

    #[test]
    fn test_closure_deriver() {
        let deriver = |d: &RequestDescriptor| Some(format!("tenant:{}", d.route));
        let descriptor = RequestDescriptor::new("/x");
        assert_eq!(deriver.derive(&descriptor).as_deref(), Some("tenant:/x"));
    }

    #[test]
    fn test_strategy_header_requires_name() {
        assert!(KeyStrategy::Header.deriver(None).is_err());
        assert!(KeyStrategy::Header.deriver(Some("  ")).is_err());
        assert!(KeyStrategy::Header.deriver(Some("x-user-id")).is_ok());
        assert!(KeyStrategy::AddressRoute.deriver(None).is_ok());
    }

    #[test]
    fn test_derivation_is_deterministic() {
        let descriptor = RequestDescriptor::new("/chat").with_header("x-real-ip", "3.3.3.3");
        assert_eq!(
            AddressRouteKey.derive(&descriptor),
            AddressRouteKey.derive(&descriptor)
        );
    }
}
