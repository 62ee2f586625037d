//! Hot-reloadable sequencer settings.

use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Runtime settings consumed by the sequencer subsystem.
///
/// Settings are read fresh at each decision point rather than captured at
/// startup. The reconfiguration engine re-reads the in-flight limit on every
/// drain pass, and a settings mutation is one of the events that can make a
/// sequencer's immutable options stale.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Capacity of the background reconfiguration in-flight budget.
    pub max_reconfigurations_in_flight: usize,
    /// Default delay before retrying a transiently failed reconfiguration.
    pub reconfiguration_retry_interval: Duration,
    /// Passed through to the storage-set reconciler. Flipping it changes the
    /// signature of every storage-set parameter set, forcing a params-only
    /// refresh in the epoch store.
    pub epoch_metadata_use_new_storage_set_format: bool,
    /// Upper bound on the sequencer sliding window; folded into the
    /// immutable per-epoch options.
    pub max_sequencer_window: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            max_reconfigurations_in_flight: 8,
            reconfiguration_retry_interval: Duration::from_secs(10),
            epoch_metadata_use_new_storage_set_format: false,
            max_sequencer_window: 4096,
        }
    }
}

/// Shared handle to the live settings.
#[derive(Clone)]
pub struct SettingsHandle {
    inner: Arc<RwLock<Settings>>,
}

impl SettingsHandle {
    pub fn new(settings: Settings) -> Self {
        SettingsHandle {
            inner: Arc::new(RwLock::new(settings)),
        }
    }

    /// Current settings by value; callers hold no lock while acting on them.
    pub fn get(&self) -> Settings {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Mutate the live settings in place.
    pub fn update(&self, mutate: impl FnOnce(&mut Settings)) {
        let mut settings = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        mutate(&mut settings);
    }
}
