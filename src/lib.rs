//! Turnstile - Request Admission Control
//!
//! This crate throttles inbound requests with fixed-window counters keyed by
//! client address and route. Named limiters hold their windows in bounded
//! in-memory LRU stores, and a tower layer turns denials into `429` responses
//! carrying the standard `X-RateLimit-*` headers.

pub mod config;
pub mod error;
pub mod ratelimit;
