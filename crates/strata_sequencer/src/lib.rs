//! Sequencer subsystem of the strata log system.
//!
//! Each log has an in-memory sequencer assigning sequence numbers within the
//! current epoch. This crate models the sequencer-side control plane: the
//! cluster configuration snapshot, hot-reloadable settings, the sequencer
//! registry and its activation path, the epoch store interface, storage-set
//! reconciliation, and the background reconfiguration engine that keeps
//! epoch metadata converged with configuration.

pub mod budget;
pub mod config;
pub mod epoch_store;
pub mod metrics;
pub mod reconciler;
pub mod reconfig;
pub mod registry;
pub mod sequencer;
pub mod settings;
