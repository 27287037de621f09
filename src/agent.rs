//! MQTT authorization agent
//!
//! Wires the normalizer, policy store, decision cache, decision engine and
//! refresh coordinator together from an [`AuthzConfig`] and exposes them to
//! the broker through the [`Authorizer`] capability.

use crate::cache::DecisionCache;
use crate::config::{AuthzConfig, Operation};
use crate::engine::{Decision, DecisionEngine, EngineStatsSnapshot, Verdict};
use crate::error::PolicyLoadError;
use crate::identity::{CredentialNormalizer, RawContext};
use crate::policy::{source_from_config, PolicySource, PolicyStore};
use crate::refresh::{RefreshCoordinator, RefreshStatsSnapshot};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Authorization capability held by the broker
pub trait Authorizer: Send + Sync {
    /// Decide an operation
    fn decide(&self, raw: &RawContext, operation: Operation, resource: &str) -> Decision;

    /// Decide an operation and return the explaining verdict
    fn authorize(&self, raw: &RawContext, operation: Operation, resource: &str) -> Verdict;

    /// Ask for a policy reload without waiting for it
    fn request_refresh(&self);
}

/// Outcome of a publish or subscribe check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Grant {
    pub verdict: Verdict,
    /// QoS the broker may use, `None` when denied
    pub qos: Option<u8>,
}

impl Grant {
    fn new(verdict: Verdict, requested_qos: u8) -> Self {
        let qos = verdict.granted_qos(requested_qos);
        Self { verdict, qos }
    }

    pub fn is_allowed(&self) -> bool {
        self.verdict.is_allowed()
    }
}

/// Combined agent counters
#[derive(Debug, Clone, Serialize)]
pub struct AgentStats {
    pub policy_version: u64,
    pub cache_entries: usize,
    pub engine: EngineStatsSnapshot,
    pub refresh: RefreshStatsSnapshot,
}

/// MQTT Authorization Agent
pub struct MqttAuthzAgent {
    engine: Arc<DecisionEngine>,
    coordinator: Arc<RefreshCoordinator>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MqttAuthzAgent {
    /// Create an agent with default configuration
    pub fn new() -> Result<Self> {
        Self::with_config(AuthzConfig::default())
    }

    /// Create an agent, taking the policy source from configuration
    pub fn with_config(config: AuthzConfig) -> Result<Self> {
        let source = source_from_config(&config.policy, config.refresh.timeout());
        Self::with_source(config, source)
    }

    /// Create an agent with an explicit policy source
    pub fn with_source(config: AuthzConfig, source: Arc<dyn PolicySource>) -> Result<Self> {
        Self::build(config, source, None)
    }

    /// Create an agent with an explicit policy source and credential normalizer
    pub fn with_normalizer(
        config: AuthzConfig,
        source: Arc<dyn PolicySource>,
        normalizer: Arc<dyn CredentialNormalizer>,
    ) -> Result<Self> {
        Self::build(config, source, Some(normalizer))
    }

    fn build(
        config: AuthzConfig,
        source: Arc<dyn PolicySource>,
        normalizer: Option<Arc<dyn CredentialNormalizer>>,
    ) -> Result<Self> {
        config.validate().context("invalid authorization config")?;

        let store = Arc::new(PolicyStore::new());
        let cache = Arc::new(DecisionCache::new(&config.cache));
        let mut engine = DecisionEngine::new(&config, store.clone(), cache.clone())
            .context("failed to build decision engine")?;
        if let Some(normalizer) = normalizer {
            info!(normalizer = %normalizer.name(), "Using custom credential normalizer");
            engine = engine.with_normalizer(normalizer);
        }
        let coordinator = RefreshCoordinator::new(store, cache, source, &config.refresh);
        let (shutdown, _) = watch::channel(false);

        info!(
            default_effect = ?config.default_effect,
            cache_enabled = config.cache.enabled,
            cache_max_entries = config.cache.max_entries,
            source = %coordinator.source().describe(),
            "MQTT authorization agent created"
        );

        Ok(Self {
            engine: Arc::new(engine),
            coordinator: Arc::new(coordinator),
            shutdown,
            task: Mutex::new(None),
        })
    }

    /// Load the initial policy and start the refresh loop.
    ///
    /// The loop is started even when the initial load fails; until a load
    /// succeeds the empty snapshot applies the default effect.
    pub async fn start(&self) -> Result<u64, PolicyLoadError> {
        let initial = self.coordinator.refresh().await;
        if let Err(e) = &initial {
            warn!(error = %e, "Initial policy load failed, serving default decisions");
        }

        let mut task = self.task.lock();
        if task.is_none() {
            *task = Some(self.coordinator.spawn(self.shutdown.subscribe()));
        }
        initial
    }

    /// Reload the policy now and wait for the result
    pub async fn refresh(&self) -> Result<u64, PolicyLoadError> {
        self.coordinator.refresh().await
    }

    /// Stop the refresh loop
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Refresh loop ended abnormally");
            }
        }
    }

    /// Check a connection attempt. The resource is the client ID.
    pub fn on_connect(&self, raw: &RawContext) -> Verdict {
        let client_id = raw.client_id.as_deref().unwrap_or_default().trim();
        let verdict = self.engine.authorize(raw, Operation::Connect, client_id);
        debug!(client_id = %client_id, decision = %verdict.decision, "CONNECT checked");
        verdict
    }

    /// Check a publish, downgrading QoS where a rule restricts it
    pub fn on_publish(&self, raw: &RawContext, topic: &str, qos: u8) -> Grant {
        let grant = Grant::new(self.engine.authorize(raw, Operation::Publish, topic), qos);
        debug!(
            client_id = ?raw.client_id,
            topic = %topic,
            requested_qos = qos,
            granted_qos = ?grant.qos,
            decision = %grant.verdict.decision,
            "PUBLISH checked"
        );
        grant
    }

    /// Check a subscription filter, downgrading QoS where a rule restricts it
    pub fn on_subscribe(&self, raw: &RawContext, filter: &str, qos: u8) -> Grant {
        let grant = Grant::new(self.engine.authorize(raw, Operation::Subscribe, filter), qos);
        debug!(
            client_id = ?raw.client_id,
            filter = %filter,
            requested_qos = qos,
            granted_qos = ?grant.qos,
            decision = %grant.verdict.decision,
            "SUBSCRIBE checked"
        );
        grant
    }

    pub fn engine(&self) -> &Arc<DecisionEngine> {
        &self.engine
    }

    pub fn policy_version(&self) -> u64 {
        self.engine.store().version()
    }

    pub fn stats(&self) -> AgentStats {
        AgentStats {
            policy_version: self.policy_version(),
            cache_entries: self.engine.cache().len(),
            engine: self.engine.stats(),
            refresh: self.coordinator.stats(),
        }
    }
}

impl Authorizer for MqttAuthzAgent {
    fn decide(&self, raw: &RawContext, operation: Operation, resource: &str) -> Decision {
        self.engine.decide(raw, operation, resource)
    }

    fn authorize(&self, raw: &RawContext, operation: Operation, resource: &str) -> Verdict {
        self.engine.authorize(raw, operation, resource)
    }

    fn request_refresh(&self) {
        self.coordinator.trigger();
    }
}

impl Drop for MqttAuthzAgent {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}
