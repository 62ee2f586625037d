//! Foundational types for the strata log system.
//!
//! This crate provides the identifier, epoch, and epoch-metadata types shared
//! by the rest of the workspace. The API surface is intentionally small:
//! higher layers model configuration, sequencers, and the epoch store on top
//! of these.

pub mod log;
pub mod metadata;
pub mod status;

pub use log::{Epoch, LogId, NodeId};
pub use metadata::{EpochMetadata, ReplicationAttrs, StorageSetParams};
pub use status::Status;
