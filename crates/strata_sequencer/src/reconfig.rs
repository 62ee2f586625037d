//! Background sequencer reconfiguration engine.
//!
//! Configuration changes, epoch store completions, sequencer state changes,
//! and settings mutations all converge here. For each notified log the
//! engine decides whether nothing needs doing, the epoch store entry needs a
//! params-only refresh, or the sequencer must be reactivated into a new
//! epoch, then issues exactly one of those actions under a token budget.
//!
//! All engine state lives on one spawned task; producers on other threads
//! reach it only through [`ReconfigHandle`]. The engine itself never awaits:
//! actions are fire-and-forget, and their completions are posted back
//! through the handle. Each drain pass is bounded by a wall-clock slice so
//! the task stays responsive even with thousands of pending logs.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};

use strata_core::{Epoch, EpochMetadata, LogId, Status};

use crate::budget::{ResourceBudget, Token};
use crate::config::{ClusterConfig, ConfigHandle};
use crate::epoch_store::EpochStoreResult;
use crate::metrics::ReconfigMetrics;
use crate::reconciler::{MetadataReconciler, UpdateResult};
use crate::registry::SequencerRegistry;
use crate::sequencer::{Sequencer, SequencerOptions, SequencerState};
use crate::settings::{Settings, SettingsHandle};

/// Wall-clock slice one drain pass may occupy before yielding.
const DRAIN_TIME_SLICE: Duration = Duration::from_millis(2);
/// Delay before resuming a drain that yielded mid-pass.
const DRAIN_RESUME_DELAY: Duration = Duration::from_millis(5);
/// Minimum spacing between repeated decision-procedure log lines.
const LOG_RATE_INTERVAL: Duration = Duration::from_secs(10);

/// Everything the engine reads from the rest of the process.
pub struct ReconfigEnv {
    pub registry: Arc<SequencerRegistry>,
    pub config: ConfigHandle,
    pub settings: SettingsHandle,
    pub metrics: Arc<ReconfigMetrics>,
    pub reconciler: Arc<dyn MetadataReconciler>,
}

enum ReconfigMsg {
    Schedule(Vec<LogId>),
    NotifyCompletion(LogId, Status),
    Inspect(oneshot::Sender<ReconfigSnapshot>),
}

/// Point-in-time view of engine state, served on the owner task.
#[derive(Debug, Clone)]
pub struct ReconfigSnapshot {
    pub pending: Vec<LogId>,
    pub budget_limit: usize,
    pub budget_in_use: usize,
    pub retry_armed: bool,
}

/// Cross-thread handle posting work onto the engine task.
///
/// Posting is best-effort: once the engine task is gone the process is
/// shutting down, and sends are silently dropped.
#[derive(Clone)]
pub struct ReconfigHandle {
    tx: mpsc::UnboundedSender<ReconfigMsg>,
}

impl ReconfigHandle {
    /// Enqueue logs for a reconfiguration re-check. Metadata-log ids are
    /// rejected by the engine.
    pub fn request_schedule(&self, log_ids: Vec<LogId>) {
        if log_ids.is_empty() {
            return;
        }
        let _ = self.tx.send(ReconfigMsg::Schedule(log_ids));
    }

    /// Report that a background action for a log finished.
    pub fn request_notify_completion(&self, log_id: LogId, status: Status) {
        let _ = self.tx.send(ReconfigMsg::NotifyCompletion(log_id, status));
    }

    /// Snapshot engine state. `None` when the engine task is gone.
    pub async fn inspect(&self) -> Option<ReconfigSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(ReconfigMsg::Inspect(tx)).ok()?;
        rx.await.ok()
    }
}

/// Spawn the engine on its owner task and wire the registry to it.
pub fn spawn(env: ReconfigEnv) -> ReconfigHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = ReconfigHandle { tx };
    env.registry.set_reconfig_handle(handle.clone());
    tokio::spawn(run(env, rx, handle.clone()));
    handle
}

async fn run(
    env: ReconfigEnv,
    mut rx: mpsc::UnboundedReceiver<ReconfigMsg>,
    handle: ReconfigHandle,
) {
    let mut engine = ReconfigEngine::new(env, handle);
    loop {
        let msg = match engine.retry_deadline {
            Some(deadline) => tokio::select! {
                msg = rx.recv() => match msg {
                    Some(msg) => Some(msg),
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline) => None,
            },
            None => match rx.recv().await {
                Some(msg) => Some(msg),
                None => break,
            },
        };
        match msg {
            Some(ReconfigMsg::Schedule(log_ids)) => engine.schedule(log_ids),
            Some(ReconfigMsg::NotifyCompletion(log_id, status)) => {
                engine.notify_completion(log_id, status)
            }
            Some(ReconfigMsg::Inspect(reply)) => {
                let _ = reply.send(engine.snapshot());
            }
            // Retry timer fired.
            None => {
                engine.retry_deadline = None;
                engine.process_pending();
            }
        }
    }
}

enum Disposition {
    Done,
    Defer,
}

enum ReprovisionAction {
    UpToDate,
    Issued,
}

struct ReconfigEngine {
    env: ReconfigEnv,
    handle: ReconfigHandle,
    /// Deduplicated log ids awaiting a re-check. Cleared only by successful
    /// processing.
    pending: BTreeSet<LogId>,
    budget: Option<ResourceBudget>,
    retry_deadline: Option<tokio::time::Instant>,
    last_log: BTreeMap<&'static str, Instant>,
    #[cfg(test)]
    per_log_delay: Option<Duration>,
}

impl ReconfigEngine {
    fn new(env: ReconfigEnv, handle: ReconfigHandle) -> Self {
        ReconfigEngine {
            env,
            handle,
            pending: BTreeSet::new(),
            budget: None,
            retry_deadline: None,
            last_log: BTreeMap::new(),
            #[cfg(test)]
            per_log_delay: None,
        }
    }

    fn snapshot(&self) -> ReconfigSnapshot {
        ReconfigSnapshot {
            pending: self.pending.iter().copied().collect(),
            budget_limit: self.budget.as_ref().map(ResourceBudget::limit).unwrap_or(0),
            budget_in_use: self.budget.as_ref().map(ResourceBudget::in_use).unwrap_or(0),
            retry_armed: self.retry_deadline.is_some(),
        }
    }

    fn schedule(&mut self, log_ids: Vec<LogId>) {
        let mut newly_scheduled = 0u64;
        for log_id in log_ids {
            // Metadata logs are activated without the epoch store, so this
            // state machine cannot drive them.
            if log_id.is_metadata() {
                tracing::warn!(
                    log_id = %log_id,
                    "refusing to schedule a metadata log for background reconfiguration"
                );
                continue;
            }
            if self.pending.insert(log_id) {
                newly_scheduled += 1;
            }
        }
        self.env.metrics.record_scheduled(newly_scheduled);
        self.process_pending();
    }

    fn notify_completion(&mut self, log_id: LogId, _status: Status) {
        if log_id.is_metadata() {
            return;
        }
        let Some(seq) = self.env.registry.find(log_id) else {
            return;
        };
        // Reclaim the in-flight slot if the completed action was ours.
        let had_token = seq.release_background_token();
        // Re-check the log regardless: configuration may have moved while
        // the action was in flight, and a re-check is cheap when nothing
        // changed.
        let inserted = self.pending.insert(log_id);
        if had_token && !inserted {
            self.env.metrics.record_completed(1);
        }
        if inserted {
            self.env.metrics.record_scheduled(1);
        }
        self.process_pending();
    }

    /// Drain the pending set under the in-flight budget.
    ///
    /// Runs only on the engine task. Yields after [`DRAIN_TIME_SLICE`] so a
    /// long backlog cannot monopolize the task.
    fn process_pending(&mut self) {
        self.retry_deadline = None;
        let settings = self.env.settings.get();
        let limit = settings.max_reconfigurations_in_flight;
        let budget = match &self.budget {
            Some(budget) => {
                if budget.limit() != limit {
                    budget.set_limit(limit);
                }
                budget.clone()
            }
            None => {
                let budget = ResourceBudget::new(limit);
                self.budget = Some(budget.clone());
                budget
            }
        };

        let start = Instant::now();
        let mut made_progress = false;
        while !self.pending.is_empty() && budget.available() > 0 {
            if made_progress && start.elapsed() > DRAIN_TIME_SLICE {
                // Taking a while; yield and resume shortly.
                self.arm_retry(DRAIN_RESUME_DELAY);
                break;
            }
            made_progress = true;

            let Some(log_id) = self.pending.first().copied() else {
                break;
            };
            let Some(mut token) = budget.acquire() else {
                break;
            };
            match self.process_one_log(log_id, &mut token, &settings) {
                Disposition::Done => {
                    self.pending.remove(&log_id);
                    if token.valid() {
                        // The credit was not handed off, so nothing will
                        // release it later.
                        token.release();
                        self.env.metrics.record_completed(1);
                    }
                }
                Disposition::Defer => {
                    token.release();
                    self.arm_retry(settings.reconfiguration_retry_interval);
                    break;
                }
            }
        }
    }

    /// Decide and act for one log. `Done` means the caller erases the id;
    /// `Defer` keeps it and arms the retry timer. On success the transient
    /// token may have been moved into the sequencer.
    fn process_one_log(
        &mut self,
        log_id: LogId,
        token: &mut Token,
        settings: &Settings,
    ) -> Disposition {
        #[cfg(test)]
        if let Some(delay) = self.per_log_delay {
            std::thread::sleep(delay);
        }

        let Some(seq) = self.env.registry.find(log_id) else {
            // No sequencer for this log on this node.
            return Disposition::Done;
        };
        if seq.has_background_token() {
            // An action is already in flight; its completion re-checks us.
            return Disposition::Done;
        }

        let config = self.env.config.snapshot();
        let is_sequencer_node = config.nodes.is_sequencing_enabled(config.my_node);
        seq.note_config_change(&config, is_sequencer_node);
        if !is_sequencer_node {
            // The sequencer stepped down in the call above; nothing to check.
            return Disposition::Done;
        }

        match self.reprovision_or_reactivate(log_id, &seq, &config, settings) {
            Ok(ReprovisionAction::UpToDate) => Disposition::Done,
            Ok(ReprovisionAction::Issued) => {
                // Park the credit on the sequencer until the completion path
                // reclaims it.
                seq.attach_background_token(token.take());
                Disposition::Done
            }
            Err(status) => {
                let should_retry = status.is_transient();
                if !matches!(status, Status::InProgress | Status::NoSequencer)
                    && self.should_log("decision-failure")
                {
                    tracing::info!(
                        log_id = %log_id,
                        status = %status,
                        retry = should_retry,
                        "background reconfiguration check did not complete"
                    );
                }
                if should_retry {
                    Disposition::Defer
                } else {
                    Disposition::Done
                }
            }
        }
    }

    /// Decide whether an active sequencer needs its epoch metadata updated,
    /// and issue at most one action: a reactivation into the next epoch, or
    /// a params-only refresh of the epoch store entry.
    fn reprovision_or_reactivate(
        &mut self,
        log_id: LogId,
        seq: &Arc<Sequencer>,
        config: &Arc<ClusterConfig>,
        settings: &Settings,
    ) -> Result<ReprovisionAction, Status> {
        debug_assert!(!log_id.is_metadata());

        // Only act on an active sequencer holding epoch metadata. State and
        // metadata are read separately, so both are checked: a reactivation
        // may slip between the two reads.
        let state = seq.state();
        let Some(metadata) = seq
            .current_metadata()
            .filter(|_| state == SequencerState::Active)
        else {
            return Err(if state == SequencerState::Activating {
                Status::InProgress
            } else {
                Status::NoSequencer
            });
        };
        if metadata.is_empty() || metadata.disabled {
            tracing::error!(
                log_id = %log_id,
                "active sequencer carries empty or disabled epoch metadata"
            );
            return Err(Status::Internal);
        }
        let Some(attrs) = config.logs.get(log_id) else {
            // The log left the configuration.
            return Err(Status::NotFound);
        };
        let current_epoch = metadata.epoch;
        debug_assert_ne!(current_epoch, Epoch::INVALID);
        if current_epoch.0 >= Epoch::MAX.0 - 2 {
            // Out of epoch numbers. The margin keeps room for the
            // metadata-log write that follows an activation.
            return Err(Status::TooBig);
        }
        let Some(current_options) = seq.current_options() else {
            return Err(Status::NoSequencer);
        };
        let new_options = SequencerOptions::from_config(attrs, settings);

        let mut need_reactivation = false;
        if new_options != current_options {
            need_reactivation = true;
            if self.should_log("options-changed") {
                tracing::info!(
                    log_id = %log_id,
                    epoch = %current_epoch,
                    ?current_options,
                    ?new_options,
                    "reactivating sequencer because immutable options changed"
                );
            }
        }

        let mut need_params_update = false;
        let mut proposed: Option<EpochMetadata> = None;
        'reconcile: {
            if !config.provision_epoch_store {
                break 'reconcile;
            }
            if !metadata.written_in_metadata_log {
                // Reprovisioning must wait until the current epoch reaches
                // the metadata log; that writer re-checks afterwards.
                return Err(Status::InProgress);
            }
            let use_new_format = settings.epoch_metadata_use_new_storage_set_format;

            // The tentative entry mirrors the epoch store: current metadata
            // with the epoch advanced by one.
            let mut tentative = metadata.clone().with_epoch(current_epoch.next());
            let outcome =
                self.env
                    .reconciler
                    .reconcile(log_id, &mut tentative, config, use_new_format);
            match outcome.result {
                UpdateResult::Failed => {
                    if self.should_log("reconcile-failed") {
                        tracing::error!(
                            log_id = %log_id,
                            epoch = %current_epoch,
                            "storage set reconciliation failed; leaving epoch metadata alone"
                        );
                    }
                    break 'reconcile;
                }
                UpdateResult::Unchanged => break 'reconcile,
                UpdateResult::Updated => {}
            }

            need_params_update = true;
            if !outcome.only_params_changed {
                need_reactivation = true;
                if self.should_log("metadata-changed") {
                    tracing::info!(
                        log_id = %log_id,
                        epoch = %current_epoch,
                        storage_set = ?tentative.storage_set,
                        "reactivating sequencer to update epoch metadata"
                    );
                }
            } else if self.should_log("params-changed") {
                tracing::info!(
                    log_id = %log_id,
                    epoch = %current_epoch,
                    params = ?tentative.storage_set_params,
                    "updating storage set params in epoch store without changing the storage set"
                );
            }

            // The selector must be satisfied with its own output; otherwise
            // a buggy selector turns into an endless reactivation loop.
            let mut second = tentative.clone();
            let second_outcome =
                self.env
                    .reconciler
                    .reconcile(log_id, &mut second, config, use_new_format);
            if second_outcome.result != UpdateResult::Unchanged {
                tracing::error!(
                    log_id = %log_id,
                    epoch = %current_epoch,
                    first = ?outcome.result,
                    second = ?second_outcome.result,
                    "storage set selection did not converge; abandoning the update"
                );
                need_params_update = false;
                need_reactivation = false;
                break 'reconcile;
            }
            proposed = Some(tentative);
        }

        if need_reactivation {
            self.env.metrics.record_reactivation_for_metadata_update();
            self.env.registry.activate(
                log_id,
                "background reconfiguration",
                |_| true,
                Some(current_epoch.next()),
                proposed,
            )?;
            return Ok(ReprovisionAction::Issued);
        }

        if need_params_update {
            self.env.metrics.record_metadata_update_without_reactivation();
            let Some(params) = proposed.map(|meta| meta.storage_set_params) else {
                return Err(Status::Internal);
            };
            let registry = Arc::clone(&self.env.registry);
            let seq = Arc::clone(seq);
            let handle = self.handle.clone();
            // The closure holds a strong reference to the sequencer so it
            // cannot be destroyed before the callback runs; the registry
            // owns its lifetime independently.
            let completion = Box::new(move |result: EpochStoreResult| {
                if matches!(result.status, Status::Ok | Status::UpToDate) {
                    if !seq.set_storage_set_params_in_current_epoch(current_epoch, params) {
                        tracing::info!(
                            log_id = %log_id,
                            epoch = %current_epoch,
                            "lost the race updating storage set params; epoch moved underneath"
                        );
                    }
                }
                if result.status == Status::Aborted {
                    // The store epoch no longer matched: we were preempted.
                    if let Some(winner) = &result.metadata {
                        registry.note_preemption(
                            log_id,
                            Epoch(winner.epoch.0.saturating_sub(1)),
                            &seq,
                            "updating storage set params",
                        );
                    }
                }
                if !matches!(result.status, Status::Shutdown | Status::Failed) {
                    handle.request_notify_completion(log_id, result.status);
                }
            });
            if let Err(status) = self.env.registry.epoch_store().begin_params_update(
                log_id,
                current_epoch.next(),
                params,
                completion,
            ) {
                if self.should_log("params-write-failed") {
                    tracing::error!(
                        log_id = %log_id,
                        status = %status,
                        "failed to start storage set params update in the epoch store"
                    );
                }
                return Err(status);
            }
            return Ok(ReprovisionAction::Issued);
        }

        Ok(ReprovisionAction::UpToDate)
    }

    /// Re-arm the single retry timer; a later arm replaces an earlier one.
    fn arm_retry(&mut self, delay: Duration) {
        self.retry_deadline = Some(tokio::time::Instant::now() + delay);
    }

    fn should_log(&mut self, key: &'static str) -> bool {
        let now = Instant::now();
        match self.last_log.get(key) {
            Some(last) if now.duration_since(*last) < LOG_RATE_INTERVAL => false,
            _ => {
                self.last_log.insert(key, now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LogsConfig, NodesConfig};
    use crate::epoch_store::InMemoryEpochStore;
    use crate::metrics::ReconfigMetrics;
    use crate::reconciler::StorageSetReconciler;

    fn test_engine(limit: usize) -> (ReconfigEngine, mpsc::UnboundedReceiver<ReconfigMsg>) {
        let settings = SettingsHandle::new(Settings {
            max_reconfigurations_in_flight: limit,
            ..Settings::default()
        });
        let config = ConfigHandle::new(ClusterConfig {
            version: 1,
            my_node: 1,
            nodes: NodesConfig::default(),
            logs: LogsConfig::default(),
            provision_epoch_store: true,
        });
        let reconciler = Arc::new(StorageSetReconciler);
        let registry = SequencerRegistry::new(
            config.clone(),
            settings.clone(),
            InMemoryEpochStore::new(),
            reconciler.clone(),
        );
        let env = ReconfigEnv {
            registry,
            config,
            settings,
            metrics: Arc::new(ReconfigMetrics::default()),
            reconciler,
        };
        let (tx, rx) = mpsc::unbounded_channel();
        (ReconfigEngine::new(env, ReconfigHandle { tx }), rx)
    }

    #[test]
    fn schedule_deduplicates_and_counts_fresh_ids() {
        let (mut engine, _rx) = test_engine(0);
        engine.schedule(vec![LogId(1), LogId(2), LogId(2), LogId(3)]);
        assert_eq!(engine.pending.len(), 3);
        assert_eq!(engine.env.metrics.snapshot().scheduled, 3);

        // Scheduling the same set again changes nothing.
        engine.schedule(vec![LogId(1), LogId(2), LogId(3)]);
        assert_eq!(engine.pending.len(), 3);
        assert_eq!(engine.env.metrics.snapshot().scheduled, 3);
    }

    #[test]
    fn metadata_logs_are_refused() {
        let (mut engine, _rx) = test_engine(4);
        engine.schedule(vec![LogId(5).metadata_log()]);
        assert!(engine.pending.is_empty());
        assert_eq!(engine.env.metrics.snapshot().scheduled, 0);

        engine.notify_completion(LogId(5).metadata_log(), Status::Ok);
        assert!(engine.pending.is_empty());
    }

    #[test]
    fn zero_limit_stalls_the_drain() {
        let (mut engine, _rx) = test_engine(0);
        engine.schedule(vec![LogId(1), LogId(2)]);
        assert_eq!(engine.pending.len(), 2);
        assert!(engine.retry_deadline.is_none());
    }

    #[test]
    fn drain_yields_after_its_time_slice() {
        let (mut engine, _rx) = test_engine(4);
        engine.per_log_delay = Some(Duration::from_micros(300));
        for raw in 0..200u64 {
            engine.pending.insert(LogId(raw));
        }

        let start = Instant::now();
        engine.process_pending();
        let elapsed = start.elapsed();

        // The pass must stop well short of the full backlog and re-arm.
        assert!(!engine.pending.is_empty());
        assert!(engine.retry_deadline.is_some());
        assert!(
            elapsed < Duration::from_millis(100),
            "drain ran too long: {elapsed:?}"
        );
        // Nothing was handed off, so no credit is still out.
        assert_eq!(engine.budget.as_ref().map(ResourceBudget::in_use), Some(0));
    }

    #[test]
    fn drain_without_sequencers_empties_the_pending_set() {
        let (mut engine, _rx) = test_engine(4);
        engine.schedule(vec![LogId(1), LogId(2), LogId(3)]);
        assert!(engine.pending.is_empty());
        let snapshot = engine.env.metrics.snapshot();
        assert_eq!(snapshot.scheduled, 3);
        assert_eq!(snapshot.completed, 3);
        assert!(engine.retry_deadline.is_none());
    }
}
