//! Per-epoch metadata describing how one epoch of a log is served.

use serde::{Deserialize, Serialize};

use crate::log::{Epoch, NodeId};

/// Replication attributes of an epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationAttrs {
    /// Copies each record must reach before it is acknowledged.
    pub copies: u8,
}

/// Inputs that drove storage-set selection for an epoch.
///
/// Parameters may change without changing the selected storage set. The
/// signature folds in every selection input, so two parameter values compare
/// equal exactly when selection would behave identically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageSetParams {
    pub seed: u64,
    pub target_size: usize,
    pub signature: u64,
}

impl StorageSetParams {
    pub const UNSET: StorageSetParams = StorageSetParams {
        seed: 0,
        target_size: 0,
        signature: 0,
    };
}

/// The record kept per log in the epoch store.
///
/// The store entry always carries the *next* epoch to be assigned, one past
/// the epoch of the currently active sequencer. Copying a sequencer's
/// metadata and incrementing the epoch therefore reproduces the store entry,
/// unless the sequencer has been preempted in the meantime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochMetadata {
    pub epoch: Epoch,
    /// Storage nodes eligible to receive records of this epoch. Sorted.
    pub storage_set: Vec<NodeId>,
    pub replication: ReplicationAttrs,
    pub storage_set_params: StorageSetParams,
    /// Set once the epoch has been recorded in the log's metadata log.
    /// Reprovisioning waits for this flag.
    pub written_in_metadata_log: bool,
    /// A disabled entry marks a log that must not be served.
    pub disabled: bool,
}

impl EpochMetadata {
    pub fn new(epoch: Epoch, storage_set: Vec<NodeId>, replication: ReplicationAttrs) -> Self {
        EpochMetadata {
            epoch,
            storage_set,
            replication,
            storage_set_params: StorageSetParams::UNSET,
            written_in_metadata_log: false,
            disabled: false,
        }
    }

    /// An entry with no storage set carries no provisioned epoch.
    pub fn is_empty(&self) -> bool {
        self.storage_set.is_empty()
    }

    pub fn with_epoch(mut self, epoch: Epoch) -> Self {
        self.epoch = epoch;
        self
    }
}
