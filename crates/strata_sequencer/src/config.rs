//! Cluster configuration model: node membership and the logs configuration.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use strata_core::{LogId, NodeId};

/// Storage properties of one cluster node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageNodeConfig {
    /// Relative capacity units. Folded into selection signatures, so a
    /// capacity change refreshes storage-set parameters even when the
    /// selected set stays the same.
    pub capacity: u32,
    /// Disabled nodes are excluded from new storage sets.
    pub enabled: bool,
}

/// Node membership: which nodes store records, which may run sequencers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodesConfig {
    pub storage: BTreeMap<NodeId, StorageNodeConfig>,
    pub sequencers: BTreeSet<NodeId>,
}

impl NodesConfig {
    pub fn is_sequencing_enabled(&self, node: NodeId) -> bool {
        self.sequencers.contains(&node)
    }

    /// Enabled storage nodes in ascending id order.
    pub fn storage_candidates(&self) -> Vec<NodeId> {
        self.storage
            .iter()
            .filter_map(|(id, node)| node.enabled.then_some(*id))
            .collect()
    }
}

/// Per-log attributes from the logs configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogAttributes {
    pub replication_factor: u8,
    /// Sliding-window bound for the log's sequencer. Feeds the immutable
    /// per-epoch options, so changing it forces a reactivation.
    pub max_writes_in_flight: usize,
    /// Requested storage-set size.
    pub storage_set_size: usize,
    /// Selection seed; changing it re-rolls the storage set.
    pub storage_set_seed: u64,
}

/// All configured logs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogsConfig {
    pub logs: BTreeMap<LogId, LogAttributes>,
}

impl LogsConfig {
    pub fn get(&self, log_id: LogId) -> Option<&LogAttributes> {
        self.logs.get(&log_id)
    }
}

/// One immutable snapshot of cluster configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub version: u64,
    /// The node this process runs on.
    pub my_node: NodeId,
    pub nodes: NodesConfig,
    pub logs: LogsConfig,
    /// When set, sequencers keep the epoch store reconciled with
    /// configuration (storage sets, replication, selection parameters).
    pub provision_epoch_store: bool,
}

/// Shared handle to the current configuration snapshot.
///
/// Readers take cheap `Arc` snapshots; installs swap the snapshot wholesale.
#[derive(Clone)]
pub struct ConfigHandle {
    inner: Arc<RwLock<Arc<ClusterConfig>>>,
}

impl ConfigHandle {
    pub fn new(config: ClusterConfig) -> Self {
        ConfigHandle {
            inner: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    pub fn snapshot(&self) -> Arc<ClusterConfig> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn install(&self, config: ClusterConfig) {
        let mut slot = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Arc::new(config);
    }
}
