//! API key authorization gateway.
//!
//! Parses `<prefix>_<key_id>_<secret>` tokens, verifies the secret against a
//! secret store through a TTL cache, enforces a per-key sliding-window rate
//! limit and tracks a per-key token balance. [`server`] exposes the decisions
//! over HTTP with pingora; [`keys`] manages the keys held in the secret store.

pub mod cache;
pub mod clock;
pub mod configuration;
pub mod gate;
pub mod keys;
pub mod limiter;
pub mod metric;
pub mod server;
pub mod store;
pub mod throttle;
pub mod usage;
pub mod verify;
