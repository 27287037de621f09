//! Active policy snapshot holder

use arc_swap::ArcSwap;
use std::sync::Arc;
use tracing::info;

use super::snapshot::PolicySnapshot;
use super::source::PolicySource;
use crate::error::PolicyLoadError;

/// Holds the active snapshot behind an atomically swapped pointer.
///
/// Readers never block and always see a complete snapshot; a reader that
/// loaded the previous snapshot keeps it alive until it is done.
pub struct PolicyStore {
    active: ArcSwap<PolicySnapshot>,
}

impl PolicyStore {
    /// Store with the empty version-0 snapshot active
    pub fn new() -> Self {
        Self::with_snapshot(PolicySnapshot::empty())
    }

    pub fn with_snapshot(snapshot: PolicySnapshot) -> Self {
        Self {
            active: ArcSwap::from_pointee(snapshot),
        }
    }

    /// The active snapshot
    pub fn current(&self) -> Arc<PolicySnapshot> {
        self.active.load_full()
    }

    /// Version of the active snapshot
    pub fn version(&self) -> u64 {
        self.active.load().version()
    }

    /// Make `snapshot` active. Only the refresh coordinator publishes.
    pub(crate) fn publish(&self, snapshot: PolicySnapshot) -> Arc<PolicySnapshot> {
        let snapshot = Arc::new(snapshot);
        let previous = self.active.swap(snapshot.clone());
        info!(
            version = snapshot.version(),
            previous_version = previous.version(),
            rules = snapshot.rule_count(),
            source = %snapshot.source(),
            "Policy snapshot published"
        );
        snapshot
    }
}

impl Default for PolicyStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Load and compile a snapshot from `source`. Nothing is published.
pub fn load(source: &dyn PolicySource, version: u64) -> Result<PolicySnapshot, PolicyLoadError> {
    let document = source.load()?;
    PolicySnapshot::compile(&document, version, source.describe())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{PolicyDocument, StaticPolicySource};

    #[test]
    fn test_publish_swaps_and_old_readers_keep_snapshot() {
        let store = PolicyStore::new();
        assert_eq!(store.version(), 0);

        let held = store.current();

        let source = StaticPolicySource::new(
            PolicyDocument::from_json(r##"{"rules": [{"name": "r", "topics": ["#"], "effect": "allow"}]}"##)
                .unwrap(),
        );
        let snapshot = load(&source, 1).unwrap();
        store.publish(snapshot);

        assert_eq!(store.version(), 1);
        assert_eq!(store.current().rule_count(), 3);
        assert_eq!(held.version(), 0);
        assert_eq!(held.rule_count(), 0);
    }

    #[test]
    fn test_failed_load_leaves_store_untouched() {
        let store = PolicyStore::new();
        let source = StaticPolicySource::new(
            PolicyDocument::from_json(r#"{"rules": [{"name": "r", "topics": ["a/#/b"], "effect": "allow"}]}"#)
                .unwrap(),
        );

        assert!(load(&source, 1).is_err());
        assert_eq!(store.version(), 0);
    }
}
