//! Epoch store interface and in-memory implementation.
//!
//! The epoch store is a linearizable key-value store mapping log id to epoch
//! metadata. By convention the stored entry carries the *next* epoch to be
//! assigned, one past the epoch of the currently active sequencer; activation
//! CAS-advances it, a parameter refresh rewrites it in place.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use strata_core::{Epoch, EpochMetadata, LogId, Status, StorageSetParams};

/// Completion of an epoch store write, delivered off the caller's stack.
#[derive(Debug)]
pub struct EpochStoreResult {
    pub status: Status,
    pub log_id: LogId,
    /// On success, the metadata as assigned to the caller; on
    /// [`Status::Aborted`], the entry that won the race.
    pub metadata: Option<EpochMetadata>,
}

pub type EpochStoreCompletion = Box<dyn FnOnce(EpochStoreResult) + Send + 'static>;

/// Linearizable store of per-log epoch metadata.
///
/// Writes begin synchronously and complete through a callback; the caller
/// never blocks on store latency. A synchronous error means the write was
/// never started and is one of `{INTERNAL, NOTCONN, ACCESS, SYSLIMIT,
/// NOTFOUND, FAILED}`.
pub trait EpochStore: Send + Sync + 'static {
    /// Compare-and-swap the full metadata entry.
    ///
    /// With `acceptable_epoch` set, the write succeeds only while the store
    /// entry still carries that epoch; the entry is then advanced past it and
    /// the completion reports the metadata as assigned. `None` provisions a
    /// first epoch unconditionally.
    fn begin_metadata_write(
        &self,
        log_id: LogId,
        acceptable_epoch: Option<Epoch>,
        metadata: EpochMetadata,
        completion: EpochStoreCompletion,
    ) -> Result<(), Status>;

    /// Rewrite only the storage-set parameters, conditioned on the store
    /// entry still carrying `expected_epoch`. The epoch does not advance.
    fn begin_params_update(
        &self,
        log_id: LogId,
        expected_epoch: Epoch,
        params: StorageSetParams,
        completion: EpochStoreCompletion,
    ) -> Result<(), Status>;

    /// Current entry for a log.
    fn read(&self, log_id: LogId) -> Option<EpochMetadata>;
}

/// In-memory epoch store with injectable latency and failures, used by tests
/// and the workload driver.
pub struct InMemoryEpochStore {
    entries: Arc<Mutex<BTreeMap<LogId, EpochMetadata>>>,
    write_delay: Mutex<Duration>,
    begin_errors: Mutex<VecDeque<Status>>,
}

impl InMemoryEpochStore {
    pub fn new() -> Arc<Self> {
        Arc::new(InMemoryEpochStore {
            entries: Arc::new(Mutex::new(BTreeMap::new())),
            write_delay: Mutex::new(Duration::ZERO),
            begin_errors: Mutex::new(VecDeque::new()),
        })
    }

    /// Delay applied between a begun write and its completion.
    pub fn set_write_delay(&self, delay: Duration) {
        *self
            .write_delay
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = delay;
    }

    /// Queue a synchronous failure for the next begun write.
    pub fn inject_begin_error(&self, status: Status) {
        self.begin_errors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push_back(status);
    }

    /// Overwrite an entry directly, bypassing CAS. Simulates a competing
    /// sequencer advancing the store.
    pub fn put(&self, log_id: LogId, metadata: EpochMetadata) {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(log_id, metadata);
    }

    fn take_begin_error(&self) -> Option<Status> {
        self.begin_errors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front()
    }

    fn delay(&self) -> Duration {
        *self
            .write_delay
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn apply_metadata_write(
        entries: &mut BTreeMap<LogId, EpochMetadata>,
        log_id: LogId,
        acceptable_epoch: Option<Epoch>,
        metadata: EpochMetadata,
    ) -> EpochStoreResult {
        let assigned_epoch = match entries.get(&log_id) {
            Some(current) => {
                if let Some(acceptable) = acceptable_epoch {
                    if current.epoch != acceptable {
                        return EpochStoreResult {
                            status: Status::Aborted,
                            log_id,
                            metadata: Some(current.clone()),
                        };
                    }
                }
                current.epoch
            }
            None => acceptable_epoch.unwrap_or(Epoch(1)),
        };
        let assigned = metadata.with_epoch(assigned_epoch);
        let mut stored = assigned.clone().with_epoch(assigned_epoch.next());
        stored.written_in_metadata_log = false;
        entries.insert(log_id, stored);
        EpochStoreResult {
            status: Status::Ok,
            log_id,
            metadata: Some(assigned),
        }
    }

    fn apply_params_update(
        entries: &mut BTreeMap<LogId, EpochMetadata>,
        log_id: LogId,
        expected_epoch: Epoch,
        params: StorageSetParams,
    ) -> EpochStoreResult {
        match entries.get_mut(&log_id) {
            None => EpochStoreResult {
                status: Status::NotFound,
                log_id,
                metadata: None,
            },
            Some(current) if current.epoch != expected_epoch => EpochStoreResult {
                status: Status::Aborted,
                log_id,
                metadata: Some(current.clone()),
            },
            Some(current) if current.storage_set_params == params => EpochStoreResult {
                status: Status::UpToDate,
                log_id,
                metadata: Some(current.clone()),
            },
            Some(current) => {
                current.storage_set_params = params;
                EpochStoreResult {
                    status: Status::Ok,
                    log_id,
                    metadata: Some(current.clone()),
                }
            }
        }
    }

    fn complete_later(
        &self,
        apply: impl FnOnce(&mut BTreeMap<LogId, EpochMetadata>) -> EpochStoreResult
            + Send
            + 'static,
        completion: EpochStoreCompletion,
    ) {
        let entries = Arc::clone(&self.entries);
        let delay = self.delay();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let result = {
                let mut entries = entries
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                apply(&mut entries)
            };
            completion(result);
        });
    }
}

impl EpochStore for InMemoryEpochStore {
    fn begin_metadata_write(
        &self,
        log_id: LogId,
        acceptable_epoch: Option<Epoch>,
        metadata: EpochMetadata,
        completion: EpochStoreCompletion,
    ) -> Result<(), Status> {
        if let Some(status) = self.take_begin_error() {
            return Err(status);
        }
        self.complete_later(
            move |entries| Self::apply_metadata_write(entries, log_id, acceptable_epoch, metadata),
            completion,
        );
        Ok(())
    }

    fn begin_params_update(
        &self,
        log_id: LogId,
        expected_epoch: Epoch,
        params: StorageSetParams,
        completion: EpochStoreCompletion,
    ) -> Result<(), Status> {
        if let Some(status) = self.take_begin_error() {
            return Err(status);
        }
        self.complete_later(
            move |entries| Self::apply_params_update(entries, log_id, expected_epoch, params),
            completion,
        );
        Ok(())
    }

    fn read(&self, log_id: LogId) -> Option<EpochMetadata> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&log_id)
            .cloned()
    }
}
