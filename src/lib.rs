//! MQTT Authorization Engine for Sentinel
//!
//! Decides whether an MQTT client may CONNECT, PUBLISH to a topic or
//! SUBSCRIBE to a topic filter:
//!
//! - **Credential Normalization**: Client ID, username/password and certificate
//!   subject reduced to a canonical identity, with IP allowlist stripping
//! - **Topic Policies**: Wildcard-aware rules; the most specific match wins
//! - **Decision Cache**: Sharded TTL + LRU cache invalidated by policy version
//! - **Hot Reload**: Periodic and on-demand policy refresh with timeouts and
//!   last-known-good fallback
//! - **Fail Closed**: Internal faults deny with `DENY_FAIL_SAFE`
//!
//! # Architecture
//!
//! Decisions run synchronously on the caller's thread against an immutable
//! policy snapshot. The refresh coordinator compiles new snapshots on the
//! tokio runtime and swaps them in atomically.
//!
//! # Example Configuration
//!
//! ```json
//! {
//!   "default-effect": "deny",
//!   "cache": { "max-entries": 10000, "ttl-ms": 60000 },
//!   "refresh": { "interval-seconds": 60, "timeout-ms": 5000 },
//!   "policy": {
//!     "rules": [
//!       {
//!         "name": "devices-publish",
//!         "match": "role:\"device\"",
//!         "topics": ["sensors/#"],
//!         "operations": ["publish"],
//!         "effect": "allow"
//!       }
//!     ]
//!   }
//! }
//! ```

pub mod agent;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod identity;
pub mod mqtt;
pub mod policy;
pub mod refresh;

// Re-export main types
pub use agent::{Authorizer, Grant, MqttAuthzAgent};
pub use config::{AuthzConfig, Effect, Operation};
pub use engine::{Decision, DecisionEngine, Verdict};
pub use identity::{ClientIdentity, CredentialNormalizer, RawContext};
