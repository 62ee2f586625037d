//! Sequencer registry and the activation path.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, OnceLock, RwLock};

use strata_core::{Epoch, EpochMetadata, LogId, Status};

use crate::config::ConfigHandle;
use crate::epoch_store::{EpochStore, EpochStoreResult};
use crate::reconciler::{provision_initial_metadata, MetadataReconciler, UpdateResult};
use crate::reconfig::ReconfigHandle;
use crate::sequencer::{Sequencer, SequencerOptions};
use crate::settings::SettingsHandle;

/// Owns every sequencer on this node and performs activations.
pub struct SequencerRegistry {
    config: ConfigHandle,
    settings: SettingsHandle,
    epoch_store: Arc<dyn EpochStore>,
    reconciler: Arc<dyn MetadataReconciler>,
    sequencers: RwLock<BTreeMap<LogId, Arc<Sequencer>>>,
    reconfig: OnceLock<ReconfigHandle>,
    injected_activation_errors: Mutex<VecDeque<Status>>,
}

impl SequencerRegistry {
    pub fn new(
        config: ConfigHandle,
        settings: SettingsHandle,
        epoch_store: Arc<dyn EpochStore>,
        reconciler: Arc<dyn MetadataReconciler>,
    ) -> Arc<Self> {
        Arc::new(SequencerRegistry {
            config,
            settings,
            epoch_store,
            reconciler,
            sequencers: RwLock::new(BTreeMap::new()),
            reconfig: OnceLock::new(),
            injected_activation_errors: Mutex::new(VecDeque::new()),
        })
    }

    /// Wire the background reconfiguration handle. Activation completions
    /// are posted to it so finished work triggers a re-check.
    pub fn set_reconfig_handle(&self, handle: ReconfigHandle) {
        let _ = self.reconfig.set(handle);
    }

    pub fn epoch_store(&self) -> Arc<dyn EpochStore> {
        Arc::clone(&self.epoch_store)
    }

    pub fn find(&self, log_id: LogId) -> Option<Arc<Sequencer>> {
        self.sequencers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&log_id)
            .cloned()
    }

    pub fn get_or_create(&self, log_id: LogId) -> Arc<Sequencer> {
        let mut sequencers = self
            .sequencers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(
            sequencers
                .entry(log_id)
                .or_insert_with(|| Arc::new(Sequencer::new(log_id))),
        )
    }

    /// Queue a synchronous failure for the next activation attempt.
    pub fn inject_activation_error(&self, status: Status) {
        self.injected_activation_errors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(status);
    }

    /// Activate (or reactivate) the sequencer for a log.
    ///
    /// The epoch assignment goes through the epoch store: the CAS succeeds
    /// only while the store entry still carries `acceptable_epoch`, so a
    /// sequencer whose epoch has moved on is rejected with a preemption. On
    /// completion the sequencer holds the new epoch and options and a
    /// completion notification is posted to the reconfiguration engine.
    ///
    /// Synchronous failures are one of `{NOTFOUND, NOBUFS, INPROGRESS,
    /// FAILED, TOOMANY, SYSLIMIT}`.
    pub fn activate<F>(
        &self,
        log_id: LogId,
        reason: &'static str,
        precondition: F,
        acceptable_epoch: Option<Epoch>,
        proposed: Option<EpochMetadata>,
    ) -> Result<(), Status>
    where
        F: FnOnce(&Sequencer) -> bool,
    {
        if let Some(status) = self
            .injected_activation_errors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front()
        {
            return Err(status);
        }

        let seq = self.find(log_id).ok_or(Status::NotFound)?;
        let config = self.config.snapshot();
        let settings = self.settings.get();
        let Some(attrs) = config.logs.get(log_id) else {
            return Err(Status::NotFound);
        };
        if !precondition(&seq) {
            return Err(Status::Failed);
        }

        let use_new_format = settings.epoch_metadata_use_new_storage_set_format;
        let proposed = match proposed {
            Some(metadata) => metadata,
            None => match seq.current_metadata() {
                Some(current) => {
                    let mut candidate = current.clone().with_epoch(current.epoch.next());
                    let outcome =
                        self.reconciler
                            .reconcile(log_id, &mut candidate, &config, use_new_format);
                    if outcome.result == UpdateResult::Failed {
                        return Err(Status::Failed);
                    }
                    candidate
                }
                None => provision_initial_metadata(log_id, &config, use_new_format)
                    .ok_or(Status::Failed)?,
            },
        };
        let options = SequencerOptions::from_config(attrs, &settings);

        let previous = seq.begin_activation()?;

        let notify = self.reconfig.get().cloned();
        let seq_for_completion = Arc::clone(&seq);
        let completion = Box::new(move |result: EpochStoreResult| {
            let status = match result.status {
                Status::Ok | Status::UpToDate => match result.metadata {
                    Some(mut assigned) => {
                        // The metadata-log write that follows activation is
                        // folded into completion here; real deployments gate
                        // reprovisioning on it separately.
                        assigned.written_in_metadata_log = true;
                        let epoch = assigned.epoch;
                        seq_for_completion.complete_activation(assigned, options);
                        tracing::info!(log_id = %log_id, epoch = %epoch, reason, "sequencer activated");
                        Status::Ok
                    }
                    None => {
                        seq_for_completion.fail_activation(previous);
                        Status::Failed
                    }
                },
                Status::Aborted => {
                    seq_for_completion.fail_activation(previous);
                    if let Some(winner) = &result.metadata {
                        record_preemption(
                            log_id,
                            Epoch(winner.epoch.0.saturating_sub(1)),
                            &seq_for_completion,
                            reason,
                        );
                    }
                    Status::Aborted
                }
                other => {
                    seq_for_completion.fail_activation(previous);
                    other
                }
            };
            if status != Status::Shutdown {
                if let Some(handle) = &notify {
                    handle.request_notify_completion(log_id, status);
                }
            }
        });

        match self
            .epoch_store
            .begin_metadata_write(log_id, acceptable_epoch, proposed, completion)
        {
            Ok(()) => Ok(()),
            Err(status) => {
                seq.fail_activation(previous);
                Err(match status {
                    Status::NotFound => Status::NotFound,
                    Status::SysLimit => Status::SysLimit,
                    _ => Status::Failed,
                })
            }
        }
    }

    /// Record that another sequencer advanced the epoch store past ours; the
    /// local sequencer steps down.
    pub fn note_preemption(
        &self,
        log_id: LogId,
        preempting_epoch: Epoch,
        seq: &Arc<Sequencer>,
        reason: &str,
    ) {
        record_preemption(log_id, preempting_epoch, seq, reason);
    }
}

fn record_preemption(log_id: LogId, preempting_epoch: Epoch, seq: &Sequencer, reason: &str) {
    tracing::info!(
        log_id = %log_id,
        epoch = %preempting_epoch,
        reason,
        "sequencer preempted"
    );
    seq.note_preempted(preempting_epoch);
}
