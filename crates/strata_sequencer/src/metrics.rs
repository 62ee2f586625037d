//! In-process counters for background sequencer reconfiguration.
//!
//! These metrics are intentionally lightweight and lock-free so they can be
//! bumped from the engine's hot path without overhead.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters kept by the background reconfiguration engine.
#[derive(Debug, Default)]
pub struct ReconfigMetrics {
    /// Log ids freshly added to the pending set.
    scheduled: AtomicU64,
    /// Background passes finished with their in-flight slot reclaimed.
    completed: AtomicU64,
    /// Reactivations issued because epoch metadata or options changed.
    reactivations_for_metadata_update: AtomicU64,
    /// Parameter-only epoch store writes issued without a reactivation.
    metadata_updates_without_reactivation: AtomicU64,
}

/// Point-in-time copy of [`ReconfigMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReconfigMetricsSnapshot {
    pub scheduled: u64,
    pub completed: u64,
    pub reactivations_for_metadata_update: u64,
    pub metadata_updates_without_reactivation: u64,
}

impl ReconfigMetrics {
    pub fn record_scheduled(&self, count: u64) {
        self.scheduled.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_completed(&self, count: u64) {
        self.completed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_reactivation_for_metadata_update(&self) {
        self.reactivations_for_metadata_update
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_metadata_update_without_reactivation(&self) {
        self.metadata_updates_without_reactivation
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ReconfigMetricsSnapshot {
        ReconfigMetricsSnapshot {
            scheduled: self.scheduled.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            reactivations_for_metadata_update: self
                .reactivations_for_metadata_update
                .load(Ordering::Relaxed),
            metadata_updates_without_reactivation: self
                .metadata_updates_without_reactivation
                .load(Ordering::Relaxed),
        }
    }

    /// Renders the counters in a plain-text format suitable for `/metrics`.
    pub fn render_text(&self) -> String {
        let s = self.snapshot();
        format!(
            "background_sequencer_reconfigurations_scheduled={}\n\
             background_sequencer_reconfigurations_completed={}\n\
             sequencer_reactivations_for_metadata_update={}\n\
             metadata_updates_without_sequencer_reactivation={}\n",
            s.scheduled,
            s.completed,
            s.reactivations_for_metadata_update,
            s.metadata_updates_without_reactivation,
        )
    }
}
