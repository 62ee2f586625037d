//! Per-log sequencer objects.
//!
//! Only the epoch bookkeeping consulted by the control plane is modelled
//! here: lifecycle state, the current epoch metadata and immutable options,
//! and the single-slot credit for an in-flight background action. Foreground
//! append plumbing lives elsewhere.

use std::sync::Mutex;

use strata_core::{Epoch, EpochMetadata, LogId, Status, StorageSetParams};

use crate::budget::Token;
use crate::config::{ClusterConfig, LogAttributes};
use crate::settings::Settings;

/// Lifecycle state of a sequencer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequencerState {
    Inactive,
    Activating,
    Active,
    Preempted,
}

/// Immutable per-epoch sequencer options.
///
/// Fixed for the lifetime of an epoch; changing them requires reactivating
/// the sequencer into a new epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequencerOptions {
    /// Sliding-window bound on appends in flight.
    pub window_size: usize,
}

impl SequencerOptions {
    /// Derive the options an activation would use right now.
    pub fn from_config(attrs: &LogAttributes, settings: &Settings) -> Self {
        SequencerOptions {
            window_size: attrs
                .max_writes_in_flight
                .min(settings.max_sequencer_window)
                .max(1),
        }
    }
}

/// In-memory authority assigning sequence numbers for one log.
pub struct Sequencer {
    log_id: LogId,
    core: Mutex<SequencerCore>,
}

struct SequencerCore {
    state: SequencerState,
    metadata: Option<EpochMetadata>,
    options: Option<SequencerOptions>,
    /// Single-slot credit for the in-flight background action, if any.
    background_token: Option<Token>,
    preempted_by: Option<Epoch>,
}

impl Sequencer {
    pub fn new(log_id: LogId) -> Self {
        Sequencer {
            log_id,
            core: Mutex::new(SequencerCore {
                state: SequencerState::Inactive,
                metadata: None,
                options: None,
                background_token: None,
                preempted_by: None,
            }),
        }
    }

    pub fn log_id(&self) -> LogId {
        self.log_id
    }

    pub fn state(&self) -> SequencerState {
        self.lock().state
    }

    pub fn current_metadata(&self) -> Option<EpochMetadata> {
        self.lock().metadata.clone()
    }

    pub fn current_epoch(&self) -> Option<Epoch> {
        self.lock().metadata.as_ref().map(|meta| meta.epoch)
    }

    pub fn current_options(&self) -> Option<SequencerOptions> {
        self.lock().options
    }

    /// Epoch that preempted this sequencer, when in
    /// [`SequencerState::Preempted`].
    pub fn preempted_by(&self) -> Option<Epoch> {
        self.lock().preempted_by
    }

    /// Apply a configuration snapshot. The sequencer steps down when this
    /// node is no longer a sequencing node or its log left the logs
    /// configuration.
    pub fn note_config_change(&self, config: &ClusterConfig, is_sequencer_node: bool) {
        if is_sequencer_node && config.logs.get(self.log_id).is_some() {
            return;
        }
        let mut core = self.lock();
        if matches!(
            core.state,
            SequencerState::Active | SequencerState::Activating
        ) {
            tracing::info!(
                log_id = %self.log_id,
                "deactivating sequencer after configuration change"
            );
            core.state = SequencerState::Inactive;
        }
    }

    pub fn has_background_token(&self) -> bool {
        self.lock().background_token.is_some()
    }

    /// Park an in-flight credit on this sequencer. The slot must be empty;
    /// at most one background action runs per log.
    pub fn attach_background_token(&self, token: Token) {
        let mut core = self.lock();
        debug_assert!(core.background_token.is_none());
        core.background_token = Some(token);
    }

    /// Release the parked credit, if any. Returns whether one was held.
    pub fn release_background_token(&self) -> bool {
        let taken = self.lock().background_token.take();
        match taken {
            Some(mut token) => {
                token.release();
                true
            }
            None => false,
        }
    }

    /// Install new selection parameters if the epoch still matches. Returns
    /// false when the epoch moved underneath the caller.
    pub fn set_storage_set_params_in_current_epoch(
        &self,
        epoch: Epoch,
        params: StorageSetParams,
    ) -> bool {
        let mut core = self.lock();
        if core.state != SequencerState::Active {
            return false;
        }
        match core.metadata.as_mut() {
            Some(meta) if meta.epoch == epoch => {
                meta.storage_set_params = params;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn begin_activation(&self) -> Result<SequencerState, Status> {
        let mut core = self.lock();
        if core.state == SequencerState::Activating {
            return Err(Status::InProgress);
        }
        let previous = core.state;
        core.state = SequencerState::Activating;
        Ok(previous)
    }

    pub(crate) fn complete_activation(
        &self,
        metadata: EpochMetadata,
        options: SequencerOptions,
    ) {
        let mut core = self.lock();
        core.state = SequencerState::Active;
        core.metadata = Some(metadata);
        core.options = Some(options);
        core.preempted_by = None;
    }

    pub(crate) fn fail_activation(&self, previous: SequencerState) {
        let mut core = self.lock();
        if core.state == SequencerState::Activating {
            core.state = previous;
        }
    }

    pub(crate) fn note_preempted(&self, by: Epoch) {
        let mut core = self.lock();
        core.state = SequencerState::Preempted;
        core.preempted_by = Some(by);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SequencerCore> {
        self.core
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
