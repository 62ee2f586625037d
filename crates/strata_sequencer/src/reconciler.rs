//! Storage-set reconciliation against cluster configuration.
//!
//! The reconciler rewrites a tentative epoch metadata record to match the
//! current configuration: the selected storage set, replication attributes,
//! and selection parameters. Selection is a pure function of the log id and
//! the configuration, which is what makes the convergence contract hold.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use strata_core::{EpochMetadata, LogId, NodeId, ReplicationAttrs, StorageSetParams};

use crate::config::{ClusterConfig, LogAttributes, NodesConfig};

/// What one reconciliation pass did to the metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateResult {
    Unchanged,
    Updated,
    Failed,
}

/// Result of one reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub result: UpdateResult,
    /// True when the only delta is selection parameters over an identical
    /// storage set; such updates can be written to the epoch store without
    /// reactivating the sequencer.
    pub only_params_changed: bool,
}

impl ReconcileOutcome {
    pub fn unchanged() -> Self {
        ReconcileOutcome {
            result: UpdateResult::Unchanged,
            only_params_changed: false,
        }
    }

    pub fn failed() -> Self {
        ReconcileOutcome {
            result: UpdateResult::Failed,
            only_params_changed: false,
        }
    }

    pub fn updated(only_params_changed: bool) -> Self {
        ReconcileOutcome {
            result: UpdateResult::Updated,
            only_params_changed,
        }
    }
}

/// Rewrites epoch metadata to match cluster configuration.
///
/// Implementations must be deterministic and convergent: reconciling the
/// output of a successful pass again must report [`UpdateResult::Unchanged`].
/// The reconfiguration engine enforces this with a second application and
/// abandons the update when the contract is violated, so a non-convergent
/// implementation degrades to a logged no-op instead of an activation storm.
pub trait MetadataReconciler: Send + Sync + 'static {
    fn reconcile(
        &self,
        log_id: LogId,
        metadata: &mut EpochMetadata,
        config: &ClusterConfig,
        use_new_format: bool,
    ) -> ReconcileOutcome;
}

/// Default reconciler: selects storage sets directly from the nodes
/// configuration.
#[derive(Debug, Default)]
pub struct StorageSetReconciler;

impl MetadataReconciler for StorageSetReconciler {
    fn reconcile(
        &self,
        log_id: LogId,
        metadata: &mut EpochMetadata,
        config: &ClusterConfig,
        use_new_format: bool,
    ) -> ReconcileOutcome {
        let Some(attrs) = config.logs.get(log_id) else {
            return ReconcileOutcome::failed();
        };
        let Some(storage_set) = select_storage_set(log_id, attrs, &config.nodes) else {
            return ReconcileOutcome::failed();
        };
        let replication = ReplicationAttrs {
            copies: attrs.replication_factor,
        };
        let params = StorageSetParams {
            seed: attrs.storage_set_seed,
            target_size: attrs.storage_set_size,
            signature: selection_signature(attrs, &config.nodes, use_new_format),
        };

        let mut storage_changed = false;
        if metadata.storage_set != storage_set {
            metadata.storage_set = storage_set;
            storage_changed = true;
        }
        if metadata.replication != replication {
            metadata.replication = replication;
            storage_changed = true;
        }
        let mut params_changed = false;
        if metadata.storage_set_params != params {
            metadata.storage_set_params = params;
            params_changed = true;
        }

        if !storage_changed && !params_changed {
            ReconcileOutcome::unchanged()
        } else {
            ReconcileOutcome::updated(params_changed && !storage_changed)
        }
    }
}

/// Deterministically select a storage set for a log.
///
/// Candidates are the enabled storage nodes; the seed rotates the starting
/// point so distinct logs spread over the cluster. Returns `None` when the
/// configuration cannot satisfy the request.
pub fn select_storage_set(
    log_id: LogId,
    attrs: &LogAttributes,
    nodes: &NodesConfig,
) -> Option<Vec<NodeId>> {
    let candidates = nodes.storage_candidates();
    let target = attrs
        .storage_set_size
        .max(attrs.replication_factor as usize)
        .max(1);
    if candidates.len() < target {
        return None;
    }
    let mut hasher = DefaultHasher::new();
    log_id.hash(&mut hasher);
    attrs.storage_set_seed.hash(&mut hasher);
    let start = (hasher.finish() % candidates.len() as u64) as usize;
    let mut selected: Vec<NodeId> = (0..target)
        .map(|offset| candidates[(start + offset) % candidates.len()])
        .collect();
    selected.sort_unstable();
    Some(selected)
}

/// Fingerprint of every input feeding storage-set selection.
///
/// Two parameter sets compare equal exactly when selection would behave
/// identically, so capacity or format changes surface as a params-only
/// update even when the selected set is stable.
fn selection_signature(attrs: &LogAttributes, nodes: &NodesConfig, use_new_format: bool) -> u64 {
    let mut hasher = DefaultHasher::new();
    use_new_format.hash(&mut hasher);
    attrs.storage_set_seed.hash(&mut hasher);
    attrs.storage_set_size.hash(&mut hasher);
    attrs.replication_factor.hash(&mut hasher);
    for (node_id, node) in &nodes.storage {
        node_id.hash(&mut hasher);
        node.capacity.hash(&mut hasher);
        node.enabled.hash(&mut hasher);
    }
    hasher.finish()
}

/// Provision epoch-1 metadata for a log's first activation.
pub fn provision_initial_metadata(
    log_id: LogId,
    config: &ClusterConfig,
    use_new_format: bool,
) -> Option<EpochMetadata> {
    let attrs = config.logs.get(log_id)?;
    let storage_set = select_storage_set(log_id, attrs, &config.nodes)?;
    let mut metadata = EpochMetadata::new(
        strata_core::Epoch(1),
        storage_set,
        ReplicationAttrs {
            copies: attrs.replication_factor,
        },
    );
    metadata.storage_set_params = StorageSetParams {
        seed: attrs.storage_set_seed,
        target_size: attrs.storage_set_size,
        signature: selection_signature(attrs, &config.nodes, use_new_format),
    };
    Some(metadata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LogsConfig, StorageNodeConfig};
    use strata_core::Epoch;

    fn test_config(storage_nodes: u64) -> ClusterConfig {
        let mut nodes = NodesConfig::default();
        for node_id in 1..=storage_nodes {
            nodes.storage.insert(
                node_id,
                StorageNodeConfig {
                    capacity: 100,
                    enabled: true,
                },
            );
        }
        nodes.sequencers.insert(1);
        let mut logs = LogsConfig::default();
        logs.logs.insert(
            LogId(7),
            LogAttributes {
                replication_factor: 2,
                max_writes_in_flight: 256,
                storage_set_size: 3,
                storage_set_seed: 11,
            },
        );
        ClusterConfig {
            version: 1,
            my_node: 1,
            nodes,
            logs,
            provision_epoch_store: true,
        }
    }

    fn provisioned(config: &ClusterConfig) -> EpochMetadata {
        provision_initial_metadata(LogId(7), config, false).expect("provision")
    }

    #[test]
    fn reconciled_metadata_is_a_fixed_point() {
        let config = test_config(5);
        let mut metadata = provisioned(&config).with_epoch(Epoch(4));
        let outcome = StorageSetReconciler.reconcile(LogId(7), &mut metadata, &config, false);
        assert_eq!(outcome.result, UpdateResult::Unchanged);
    }

    #[test]
    fn capacity_change_updates_params_only() {
        let config = test_config(5);
        let mut metadata = provisioned(&config);
        let mut changed = config.clone();
        changed
            .nodes
            .storage
            .get_mut(&1)
            .expect("node 1")
            .capacity = 250;
        let outcome = StorageSetReconciler.reconcile(LogId(7), &mut metadata, &changed, false);
        assert_eq!(outcome.result, UpdateResult::Updated);
        assert!(outcome.only_params_changed);

        // Second application must be a no-op.
        let second = StorageSetReconciler.reconcile(LogId(7), &mut metadata, &changed, false);
        assert_eq!(second.result, UpdateResult::Unchanged);
    }

    #[test]
    fn disabling_a_selected_node_rewrites_the_storage_set() {
        let config = test_config(5);
        let mut metadata = provisioned(&config);
        let selected = metadata.storage_set[0];
        let mut changed = config.clone();
        changed
            .nodes
            .storage
            .get_mut(&selected)
            .expect("selected node")
            .enabled = false;
        let outcome = StorageSetReconciler.reconcile(LogId(7), &mut metadata, &changed, false);
        assert_eq!(outcome.result, UpdateResult::Updated);
        assert!(!outcome.only_params_changed);
        assert!(!metadata.storage_set.contains(&selected));

        let second = StorageSetReconciler.reconcile(LogId(7), &mut metadata, &changed, false);
        assert_eq!(second.result, UpdateResult::Unchanged);
    }

    #[test]
    fn format_flip_updates_params_only() {
        let config = test_config(5);
        let mut metadata = provisioned(&config);
        let outcome = StorageSetReconciler.reconcile(LogId(7), &mut metadata, &config, true);
        assert_eq!(outcome.result, UpdateResult::Updated);
        assert!(outcome.only_params_changed);
    }

    #[test]
    fn missing_log_or_thin_cluster_fails() {
        let config = test_config(5);
        let mut metadata = provisioned(&config);
        let outcome = StorageSetReconciler.reconcile(LogId(8), &mut metadata, &config, false);
        assert_eq!(outcome.result, UpdateResult::Failed);

        let thin = test_config(2);
        let outcome = StorageSetReconciler.reconcile(LogId(7), &mut metadata, &thin, false);
        assert_eq!(outcome.result, UpdateResult::Failed);
    }

    #[test]
    fn selection_is_deterministic() {
        let config = test_config(6);
        let attrs = config.logs.get(LogId(7)).expect("attrs");
        let first = select_storage_set(LogId(7), attrs, &config.nodes);
        let second = select_storage_set(LogId(7), attrs, &config.nodes);
        assert_eq!(first, second);
        let set = first.expect("storage set");
        assert_eq!(set.len(), 3);
        let mut sorted = set.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted, set);
    }
}
