//! Log, node, and epoch identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a cluster node.
pub type NodeId = u64;

/// High bit marking the metadata-log subspace of the log id space.
///
/// Every data log has a shadow metadata log whose id is the data log id with
/// this bit set. Metadata logs carry epoch history rather than payload
/// records and take a different activation path.
const METADATA_LOG_BIT: u64 = 1 << 63;

/// Opaque 64-bit log identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct LogId(pub u64);

impl LogId {
    /// True when this id lives in the metadata-log subspace.
    pub fn is_metadata(self) -> bool {
        self.0 & METADATA_LOG_BIT != 0
    }

    /// The metadata log shadowing this data log.
    pub fn metadata_log(self) -> LogId {
        LogId(self.0 | METADATA_LOG_BIT)
    }

    /// The data log shadowed by this metadata log.
    pub fn data_log(self) -> LogId {
        LogId(self.0 & !METADATA_LOG_BIT)
    }
}

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_metadata() {
            write!(f, "M{}", self.data_log().0)
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Monotonic version of a log's configuration. Each sequencer activation
/// bumps it by one.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Epoch(pub u32);

impl Epoch {
    /// Sentinel for "no epoch assigned yet".
    pub const INVALID: Epoch = Epoch(0);

    /// Largest representable epoch. Reactivation keeps a two-slot margin
    /// below this so the metadata-log write that follows activation still
    /// has room.
    pub const MAX: Epoch = Epoch(u32::MAX);

    /// The next epoch, saturating at [`Epoch::MAX`].
    pub fn next(self) -> Epoch {
        Epoch(self.0.saturating_add(1))
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}", self.0)
    }
}
