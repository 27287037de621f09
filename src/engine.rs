//! Decision engine
//!
//! Orchestrates identity normalization, cache lookup, policy evaluation and
//! the fail-safe fallback. `decide` always returns a [`Decision`]; internal
//! faults become [`Decision::DenyFailSafe`], never an error or a panic.

use crate::cache::{CacheKey, DecisionCache};
use crate::config::{AuthzConfig, Effect, Operation};
use crate::error::IdentityError;
use crate::identity::{ClientIdentity, CredentialNormalizer, Normalizer, RawContext};
use crate::mqtt::{TopicMatcher, MAX_TOPIC_LENGTH};
use crate::policy::{PolicyStore, RuleMatch};
use anyhow::Result;
use serde::Serialize;
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, warn};

/// Final answer returned to the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Allow,
    Deny,
    /// Denial caused by an internal fault
    DenyFailSafe,
}

impl Decision {
    pub fn is_allowed(self) -> bool {
        self == Decision::Allow
    }
}

impl From<Effect> for Decision {
    fn from(effect: Effect) -> Self {
        match effect {
            Effect::Allow => Decision::Allow,
            Effect::Deny => Decision::Deny,
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Decision::Allow => "ALLOW",
            Decision::Deny => "DENY",
            Decision::DenyFailSafe => "DENY_FAIL_SAFE",
        })
    }
}

/// What produced a verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    /// A policy rule matched
    Rule,
    /// No rule matched; the configured default applied
    Default,
    /// The resource is not a valid topic/filter for the operation
    InvalidResource,
    /// An internal fault occurred
    FailSafe,
}

/// Decision plus the details that explain it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verdict {
    pub decision: Decision,
    pub source: DecisionSource,
    /// Name of the deciding rule (if any)
    pub rule: Option<Arc<str>>,
    /// Maximum QoS granted by the deciding rule
    pub max_qos: Option<u8>,
    /// Snapshot version the verdict was computed against
    pub snapshot_version: u64,
    /// Served from the decision cache
    pub cached: bool,
}

impl Verdict {
    pub fn from_rule(rule: RuleMatch, snapshot_version: u64) -> Self {
        let allowed = rule.effect == Effect::Allow;
        Self {
            decision: rule.effect.into(),
            source: DecisionSource::Rule,
            rule: Some(rule.rule),
            max_qos: if allowed { rule.max_qos } else { None },
            snapshot_version,
            cached: false,
        }
    }

    pub fn from_default(effect: Effect, snapshot_version: u64) -> Self {
        Self {
            decision: effect.into(),
            source: DecisionSource::Default,
            rule: None,
            max_qos: None,
            snapshot_version,
            cached: false,
        }
    }

    pub fn invalid_resource(snapshot_version: u64) -> Self {
        Self {
            decision: Decision::Deny,
            source: DecisionSource::InvalidResource,
            rule: None,
            max_qos: None,
            snapshot_version,
            cached: false,
        }
    }

    pub fn fail_safe() -> Self {
        Self {
            decision: Decision::DenyFailSafe,
            source: DecisionSource::FailSafe,
            rule: None,
            max_qos: None,
            snapshot_version: 0,
            cached: false,
        }
    }

    fn from_cache(mut self) -> Self {
        self.cached = true;
        self
    }

    pub fn is_allowed(&self) -> bool {
        self.decision.is_allowed()
    }

    /// QoS the broker may grant for a requested level, `None` when denied
    pub fn granted_qos(&self, requested: u8) -> Option<u8> {
        if !self.is_allowed() {
            return None;
        }
        Some(self.max_qos.map_or(requested, |max| requested.min(max)))
    }

    /// Human-readable explanation
    pub fn reason(&self) -> String {
        match (self.source, &self.rule) {
            (DecisionSource::Rule, Some(rule)) if self.is_allowed() => {
                format!("Allowed by rule: {}", rule)
            }
            (DecisionSource::Rule, Some(rule)) => format!("Denied by rule: {}", rule),
            (DecisionSource::Default, _) if self.is_allowed() => {
                "No matching rule, default allow".to_string()
            }
            (DecisionSource::Default, _) => "No matching rule, default deny".to_string(),
            (DecisionSource::InvalidResource, _) => "Invalid resource for operation".to_string(),
            _ => "Internal fault, denied fail-safe".to_string(),
        }
    }
}

/// Internal faults that force a fail-safe denial
#[derive(Debug, Error)]
pub enum DecisionFault {
    #[error("identity normalizer '{normalizer}' failed: {reason}")]
    Normalizer { normalizer: String, reason: String },

    #[error("decision evaluation panicked: {0}")]
    Panicked(String),
}

/// Decision counters
#[derive(Debug, Default)]
pub struct EngineStats {
    allowed: AtomicU64,
    denied: AtomicU64,
    fail_safe: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    allowlist_allowed: AtomicU64,
    credentials_stripped: AtomicU64,
    malformed_credentials: AtomicU64,
}

/// Point-in-time copy of [`EngineStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStatsSnapshot {
    pub allowed: u64,
    pub denied: u64,
    pub fail_safe: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub allowlist_allowed: u64,
    pub credentials_stripped: u64,
    pub malformed_credentials: u64,
}

impl EngineStats {
    fn record(&self, decision: Decision) {
        let counter = match decision {
            Decision::Allow => &self.allowed,
            Decision::Deny => &self.denied,
            Decision::DenyFailSafe => &self.fail_safe,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            allowed: self.allowed.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            fail_safe: self.fail_safe.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            allowlist_allowed: self.allowlist_allowed.load(Ordering::Relaxed),
            credentials_stripped: self.credentials_stripped.load(Ordering::Relaxed),
            malformed_credentials: self.malformed_credentials.load(Ordering::Relaxed),
        }
    }
}

/// Decision Engine - evaluates broker operations against the active policy
pub struct DecisionEngine {
    store: Arc<PolicyStore>,
    cache: Arc<DecisionCache>,
    normalizer: Arc<dyn CredentialNormalizer>,
    default_effect: Effect,
    cache_ttl: Duration,
    topic_matcher: TopicMatcher,
    stats: EngineStats,
}

impl DecisionEngine {
    /// Create an engine with the default normalizer
    pub fn new(config: &AuthzConfig, store: Arc<PolicyStore>, cache: Arc<DecisionCache>) -> Result<Self> {
        let normalizer = Normalizer::new(&config.identity)?;
        Ok(Self {
            store,
            cache,
            normalizer: Arc::new(normalizer),
            default_effect: config.default_effect,
            cache_ttl: config.cache.ttl(),
            topic_matcher: TopicMatcher::new(),
            stats: EngineStats::default(),
        })
    }

    /// Replace the credential normalizer
    pub fn with_normalizer(mut self, normalizer: Arc<dyn CredentialNormalizer>) -> Self {
        self.normalizer = normalizer;
        self
    }

    /// Decide an operation. Never panics, never returns an error.
    pub fn decide(&self, raw: &RawContext, operation: Operation, resource: &str) -> Decision {
        self.authorize(raw, operation, resource).decision
    }

    /// Decide an operation and return the full verdict
    pub fn authorize(&self, raw: &RawContext, operation: Operation, resource: &str) -> Verdict {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            let identity = self.identify(raw)?;
            Ok(self.evaluate(&identity, operation, resource))
        }));
        self.finish(outcome, operation, resource)
    }

    /// Normalize a raw context the way `authorize` does
    pub fn identify(&self, raw: &RawContext) -> Result<ClientIdentity, DecisionFault> {
        match self.normalizer.normalize(raw) {
            Ok(identity) => {
                if identity.credentials_stripped() {
                    self.stats.credentials_stripped.fetch_add(1, Ordering::Relaxed);
                } else if identity.allowlisted() {
                    self.stats.allowlist_allowed.fetch_add(1, Ordering::Relaxed);
                }
                Ok(identity)
            }
            Err(IdentityError::Malformed(e)) => {
                warn!(
                    client_id = ?raw.client_id,
                    field = e.field,
                    reason = %e.reason,
                    "Malformed credentials, treating client as anonymous"
                );
                self.stats.malformed_credentials.fetch_add(1, Ordering::Relaxed);
                Ok(self.normalizer.anonymous_for(raw))
            }
            Err(IdentityError::Unavailable(reason)) => Err(DecisionFault::Normalizer {
                normalizer: self.normalizer.name().to_string(),
                reason,
            }),
        }
    }

    fn finish(
        &self,
        outcome: std::thread::Result<Result<Verdict, DecisionFault>>,
        operation: Operation,
        resource: &str,
    ) -> Verdict {
        let verdict = match outcome {
            Ok(Ok(verdict)) => verdict,
            Ok(Err(fault)) => {
                error!(error = %fault, operation = %operation, resource = %resource, "Decision failed, denying");
                Verdict::fail_safe()
            }
            Err(payload) => {
                let fault = DecisionFault::Panicked(panic_message(payload.as_ref()));
                error!(error = %fault, operation = %operation, resource = %resource, "Decision failed, denying");
                Verdict::fail_safe()
            }
        };
        self.stats.record(verdict.decision);
        verdict
    }

    fn evaluate(&self, identity: &ClientIdentity, operation: Operation, resource: &str) -> Verdict {
        let snapshot = self.store.current();
        let version = snapshot.version();

        if !self.is_valid_resource(operation, resource) {
            debug!(client_id = %identity.client_id(), operation = %operation, resource = %resource, "Invalid resource");
            return Verdict::invalid_resource(version);
        }

        let key = CacheKey::new(identity.key().clone(), operation, resource);
        if let Some(verdict) = self.cache.get(&key, version) {
            self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
            return verdict.from_cache();
        }
        self.stats.cache_misses.fetch_add(1, Ordering::Relaxed);

        let verdict = match snapshot.lookup(identity, operation, resource) {
            Some(rule) => Verdict::from_rule(rule, version),
            None => {
                debug!(
                    client_id = %identity.client_id(),
                    operation = %operation,
                    resource = %resource,
                    default = ?self.default_effect,
                    "No policy rule matched, using default"
                );
                Verdict::from_default(self.default_effect, version)
            }
        };

        self.cache.put(key, verdict.clone(), version, self.cache_ttl);
        verdict
    }

    fn is_valid_resource(&self, operation: Operation, resource: &str) -> bool {
        match operation {
            Operation::Publish => self.topic_matcher.is_valid_topic(resource),
            Operation::Subscribe => self.topic_matcher.is_valid_filter(resource),
            Operation::Connect => resource.len() <= MAX_TOPIC_LENGTH && !resource.contains('\0'),
        }
    }

    pub fn default_effect(&self) -> Effect {
        self.default_effect
    }

    pub fn store(&self) -> &Arc<PolicyStore> {
        &self.store
    }

    pub fn cache(&self) -> &Arc<DecisionCache> {
        &self.cache
    }

    pub fn stats(&self) -> EngineStatsSnapshot {
        self.stats.snapshot()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
