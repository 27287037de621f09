//! Refresh coordinator
//!
//! Reloads the policy from its source on a schedule or on demand, bounds
//! each load with a timeout, and publishes the compiled snapshot. A failed
//! refresh leaves the last-known-good snapshot in place.

use crate::cache::DecisionCache;
use crate::config::RefreshConfig;
use crate::error::PolicyLoadError;
use crate::policy::{self, PolicySource, PolicyStore};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Refresh counters
#[derive(Debug, Default)]
pub struct RefreshStats {
    successes: AtomicU64,
    failures: AtomicU64,
    last_version: AtomicU64,
    last_error: RwLock<Option<String>>,
}

/// Point-in-time copy of [`RefreshStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefreshStatsSnapshot {
    pub successes: u64,
    pub failures: u64,
    pub last_version: u64,
    pub last_error: Option<String>,
}

impl RefreshStats {
    fn record_success(&self, version: u64) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        self.last_version.store(version, Ordering::Relaxed);
        *self.last_error.write() = None;
    }

    fn record_failure(&self, error: &PolicyLoadError) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        *self.last_error.write() = Some(error.to_string());
    }

    pub fn snapshot(&self) -> RefreshStatsSnapshot {
        RefreshStatsSnapshot {
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            last_version: self.last_version.load(Ordering::Relaxed),
            last_error: self.last_error.read().clone(),
        }
    }
}

/// Marks a blocking load as running until dropped
struct LoadGuard(Arc<AtomicBool>);

impl LoadGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        if flag.swap(true, Ordering::AcqRel) {
            None
        } else {
            Some(Self(Arc::clone(flag)))
        }
    }
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Reloads the policy and publishes new snapshots
pub struct RefreshCoordinator {
    store: Arc<PolicyStore>,
    cache: Arc<DecisionCache>,
    source: Arc<dyn PolicySource>,
    interval: Option<Duration>,
    timeout: Duration,
    /// Serializes refreshes
    in_flight: Mutex<()>,
    /// Set while a source load runs, including one abandoned after a timeout
    loading: Arc<AtomicBool>,
    trigger: Notify,
    stats: RefreshStats,
}

impl RefreshCoordinator {
    pub fn new(
        store: Arc<PolicyStore>,
        cache: Arc<DecisionCache>,
        source: Arc<dyn PolicySource>,
        config: &RefreshConfig,
    ) -> Self {
        Self {
            store,
            cache,
            source,
            interval: config.interval(),
            timeout: config.timeout(),
            in_flight: Mutex::new(()),
            loading: Arc::new(AtomicBool::new(false)),
            trigger: Notify::new(),
            stats: RefreshStats::default(),
        }
    }

    /// Load, compile and publish a new snapshot. Returns the new version.
    ///
    /// On failure the active snapshot is left untouched.
    pub async fn refresh(&self) -> Result<u64, PolicyLoadError> {
        let _guard = self.in_flight.lock().await;

        let version = self.store.version() + 1;
        let source = self.source.clone();
        debug!(version, source = %source.describe(), "Refreshing policy");

        let result = match LoadGuard::acquire(&self.loading) {
            // A timed-out load cannot be interrupted; never stack another one on top
            None => Err(PolicyLoadError::Source("previous load still running".to_string())),
            Some(guard) => {
                let task = tokio::task::spawn_blocking(move || {
                    let _guard = guard;
                    policy::load(source.as_ref(), version)
                });

                match tokio::time::timeout(self.timeout, task).await {
                    Err(_) => Err(PolicyLoadError::Timeout(self.timeout)),
                    Ok(Err(join_error)) if join_error.is_cancelled() => Err(PolicyLoadError::Cancelled),
                    Ok(Err(join_error)) => Err(PolicyLoadError::Source(format!(
                        "policy load panicked: {}",
                        join_error
                    ))),
                    Ok(Ok(result)) => result,
                }
            }
        };

        match result {
            Ok(snapshot) => {
                self.store.publish(snapshot);
                self.cache.retire_before(version);
                self.stats.record_success(version);
                Ok(version)
            }
            Err(e) => {
                warn!(
                    error = %e,
                    active_version = self.store.version(),
                    "Policy refresh failed, keeping last-known-good snapshot"
                );
                self.stats.record_failure(&e);
                Err(e)
            }
        }
    }

    /// Ask the running loop to refresh as soon as possible
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// Run the refresh loop until `shutdown` flips to `true`
    pub fn spawn(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);

        tokio::spawn(async move {
            // A disabled schedule still needs a tick for cache purging
            let period = coordinator.interval.unwrap_or(Duration::from_secs(60));
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!(
                interval = ?coordinator.interval,
                timeout = ?coordinator.timeout,
                "Policy refresh coordinator started"
            );

            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = coordinator.trigger.notified() => {
                        let _ = coordinator.refresh().await;
                    }
                    _ = ticker.tick() => {
                        let purged = coordinator.cache.purge_expired();
                        if purged > 0 {
                            debug!(purged, "Purged expired decisions");
                        }
                        if coordinator.interval.is_some() {
                            let _ = coordinator.refresh().await;
                        }
                    }
                }
            }

            info!("Policy refresh coordinator stopped");
        })
    }

    pub fn stats(&self) -> RefreshStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn source(&self) -> &Arc<dyn PolicySource> {
        &self.source
    }
}
