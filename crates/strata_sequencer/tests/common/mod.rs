//! Shared helpers for reconfiguration integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Result};
use strata_core::LogId;
use strata_sequencer::config::{
    ClusterConfig, ConfigHandle, LogAttributes, LogsConfig, NodesConfig, StorageNodeConfig,
};
use strata_sequencer::epoch_store::InMemoryEpochStore;
use strata_sequencer::metrics::{ReconfigMetrics, ReconfigMetricsSnapshot};
use strata_sequencer::reconciler::{MetadataReconciler, StorageSetReconciler};
use strata_sequencer::reconfig::{self, ReconfigEnv, ReconfigHandle, ReconfigSnapshot};
use strata_sequencer::registry::SequencerRegistry;
use strata_sequencer::sequencer::{Sequencer, SequencerState};
use strata_sequencer::settings::{Settings, SettingsHandle};

const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// In-process cluster model: configuration, settings, epoch store, registry,
/// and a running reconfiguration engine.
pub struct TestCluster {
    pub config: ConfigHandle,
    pub settings: SettingsHandle,
    pub store: Arc<InMemoryEpochStore>,
    pub registry: Arc<SequencerRegistry>,
    pub metrics: Arc<ReconfigMetrics>,
    pub handle: ReconfigHandle,
}

/// A config with `storage_nodes` enabled storage nodes, node 1 sequencing,
/// and one log per entry of `logs`.
pub fn base_config(storage_nodes: u64, logs: &[u64]) -> ClusterConfig {
    let mut nodes = NodesConfig::default();
    for node_id in 1..=storage_nodes {
        nodes.storage.insert(
            node_id,
            StorageNodeConfig {
                capacity: 100,
                enabled: true,
            },
        );
    }
    nodes.sequencers.insert(1);
    let mut logs_config = LogsConfig::default();
    for &raw in logs {
        logs_config.logs.insert(
            LogId(raw),
            LogAttributes {
                replication_factor: 2,
                max_writes_in_flight: 256,
                storage_set_size: 3,
                storage_set_seed: raw,
            },
        );
    }
    ClusterConfig {
        version: 1,
        my_node: 1,
        nodes,
        logs: logs_config,
        provision_epoch_store: true,
    }
}

/// Settings with a retry interval short enough for tests.
pub fn fast_settings() -> Settings {
    Settings {
        reconfiguration_retry_interval: Duration::from_millis(20),
        ..Settings::default()
    }
}

pub fn start_cluster(config: ClusterConfig, settings: Settings) -> TestCluster {
    start_cluster_with_reconciler(config, settings, Arc::new(StorageSetReconciler))
}

pub fn start_cluster_with_reconciler(
    config: ClusterConfig,
    settings: Settings,
    reconciler: Arc<dyn MetadataReconciler>,
) -> TestCluster {
    let config = ConfigHandle::new(config);
    let settings = SettingsHandle::new(settings);
    let store = InMemoryEpochStore::new();
    let registry = SequencerRegistry::new(
        config.clone(),
        settings.clone(),
        store.clone(),
        Arc::clone(&reconciler),
    );
    let metrics = Arc::new(ReconfigMetrics::default());
    let handle = reconfig::spawn(ReconfigEnv {
        registry: Arc::clone(&registry),
        config: config.clone(),
        settings: settings.clone(),
        metrics: Arc::clone(&metrics),
        reconciler,
    });
    TestCluster {
        config,
        settings,
        store,
        registry,
        metrics,
        handle,
    }
}

/// Create and activate the sequencer for a log, then wait for the engine to
/// settle again.
pub async fn bootstrap_log(cluster: &TestCluster, log_id: LogId) -> Result<Arc<Sequencer>> {
    let completed_before = cluster.metrics.snapshot().completed;
    let seq = cluster.registry.get_or_create(log_id);
    cluster
        .registry
        .activate(log_id, "test bootstrap", |_| true, None, None)
        .map_err(|status| anyhow!("bootstrap activation for {log_id} failed: {status}"))?;
    wait_for_state(&seq, SequencerState::Active).await?;

    // The activation completion schedules a follow-up re-check, which ends
    // by reclaiming its credit. Wait for that so callers start from a
    // settled metrics baseline.
    let deadline = Instant::now() + WAIT_TIMEOUT;
    while cluster.metrics.snapshot().completed <= completed_before {
        if Instant::now() > deadline {
            bail!("post-activation re-check for {log_id} never completed");
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    wait_quiescent(cluster).await?;
    Ok(seq)
}

pub async fn wait_for_state(seq: &Arc<Sequencer>, state: SequencerState) -> Result<()> {
    let deadline = Instant::now() + WAIT_TIMEOUT;
    while seq.state() != state {
        if Instant::now() > deadline {
            bail!(
                "sequencer for {} never reached {state:?}, still {:?}",
                seq.log_id(),
                seq.state()
            );
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    Ok(())
}

/// Wait until the pending set is empty and every budget credit is home.
pub async fn wait_quiescent(cluster: &TestCluster) -> Result<()> {
    let deadline = Instant::now() + WAIT_TIMEOUT;
    loop {
        let Some(snapshot) = cluster.handle.inspect().await else {
            bail!("reconfiguration engine is gone");
        };
        if snapshot.pending.is_empty() && snapshot.budget_in_use == 0 {
            return Ok(());
        }
        if Instant::now() > deadline {
            bail!("engine never went quiescent: {snapshot:?}");
        }
        tokio::time::sleep(Duration::from_millis(3)).await;
    }
}

pub async fn inspect(cluster: &TestCluster) -> Result<ReconfigSnapshot> {
    cluster
        .handle
        .inspect()
        .await
        .ok_or_else(|| anyhow!("reconfiguration engine is gone"))
}

/// Install a mutated copy of the current configuration with a bumped version.
pub fn mutate_config(cluster: &TestCluster, mutate: impl FnOnce(&mut ClusterConfig)) {
    let mut next = (*cluster.config.snapshot()).clone();
    next.version += 1;
    mutate(&mut next);
    cluster.config.install(next);
}

/// Counter deltas relative to a baseline snapshot.
pub fn metrics_delta(
    baseline: ReconfigMetricsSnapshot,
    now: ReconfigMetricsSnapshot,
) -> ReconfigMetricsSnapshot {
    ReconfigMetricsSnapshot {
        scheduled: now.scheduled - baseline.scheduled,
        completed: now.completed - baseline.completed,
        reactivations_for_metadata_update: now.reactivations_for_metadata_update
            - baseline.reactivations_for_metadata_update,
        metadata_updates_without_reactivation: now.metadata_updates_without_reactivation
            - baseline.metadata_updates_without_reactivation,
    }
}
