//! Churn driver for the background reconfiguration engine.
//!
//! This binary stands up an in-process cluster model (configuration,
//! in-memory epoch store, sequencer registry, reconfiguration engine),
//! bootstraps a set of logs, then applies rounds of configuration churn and
//! waits for the engine to converge after each round. It reports engine
//! metrics as JSON at the end, and is the quickest way to watch the engine's
//! decisions under a log-heavy workload.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use strata_core::LogId;
use strata_sequencer::config::{
    ClusterConfig, ConfigHandle, LogAttributes, LogsConfig, NodesConfig, StorageNodeConfig,
};
use strata_sequencer::epoch_store::{EpochStore, InMemoryEpochStore};
use strata_sequencer::metrics::ReconfigMetrics;
use strata_sequencer::reconciler::StorageSetReconciler;
use strata_sequencer::reconfig::{self, ReconfigEnv, ReconfigHandle};
use strata_sequencer::registry::SequencerRegistry;
use strata_sequencer::sequencer::SequencerState;
use strata_sequencer::settings::{Settings, SettingsHandle};

/// CLI options for the churn workload.
#[derive(Parser, Debug)]
#[command(name = "strata-workload")]
struct Args {
    /// Number of logs to bootstrap and churn.
    #[arg(long, default_value_t = 50)]
    logs: u64,

    /// Number of storage nodes in the simulated cluster.
    #[arg(long, default_value_t = 8)]
    storage_nodes: u64,

    /// Rounds of configuration churn to apply.
    #[arg(long, default_value_t = 20)]
    rounds: u64,

    /// Simulated epoch store write latency.
    #[arg(long, default_value = "2ms")]
    store_latency: humantime::Duration,

    /// Budget for concurrent background actions.
    #[arg(long, default_value_t = 8)]
    max_in_flight: usize,

    /// Random seed (0 picks a random seed).
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Per-round convergence timeout.
    #[arg(long, default_value = "10s")]
    round_timeout: humantime::Duration,
}

struct Cluster {
    config: ConfigHandle,
    settings: SettingsHandle,
    store: Arc<InMemoryEpochStore>,
    registry: Arc<SequencerRegistry>,
    metrics: Arc<ReconfigMetrics>,
    handle: ReconfigHandle,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let seed = if args.seed == 0 {
        rand::random::<u64>()
    } else {
        args.seed
    };
    tracing::info!(
        logs = args.logs,
        storage_nodes = args.storage_nodes,
        rounds = args.rounds,
        seed,
        "starting reconfiguration churn"
    );

    let cluster = start_cluster(&args);
    cluster.store.set_write_delay(*args.store_latency);

    bootstrap(&cluster, args.logs, *args.round_timeout).await?;
    tracing::info!(logs = args.logs, "bootstrap complete");

    let mut rng = SmallRng::seed_from_u64(seed);
    let log_ids: Vec<LogId> = (1..=args.logs).map(LogId).collect();
    let started = Instant::now();
    for round in 1..=args.rounds {
        apply_churn(&cluster, &mut rng, args.storage_nodes);
        cluster.handle.request_schedule(log_ids.clone());
        wait_quiescent(&cluster, *args.round_timeout)
            .await
            .with_context(|| format!("round {round} never converged"))?;
        tracing::info!(round, elapsed = ?started.elapsed(), "round converged");
    }

    verify_converged(&cluster, &log_ids)?;

    let report = serde_json::json!({
        "seed": seed,
        "rounds": args.rounds,
        "logs": args.logs,
        "elapsed_ms": started.elapsed().as_millis() as u64,
        "metrics": cluster.metrics.snapshot(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn start_cluster(args: &Args) -> Cluster {
    let mut nodes = NodesConfig::default();
    for node_id in 1..=args.storage_nodes {
        nodes.storage.insert(
            node_id,
            StorageNodeConfig {
                capacity: 100,
                enabled: true,
            },
        );
    }
    nodes.sequencers.insert(1);
    let mut logs = LogsConfig::default();
    for raw in 1..=args.logs {
        logs.logs.insert(
            LogId(raw),
            LogAttributes {
                replication_factor: 2,
                max_writes_in_flight: 256,
                storage_set_size: 3,
                storage_set_seed: raw,
            },
        );
    }
    let config = ConfigHandle::new(ClusterConfig {
        version: 1,
        my_node: 1,
        nodes,
        logs,
        provision_epoch_store: true,
    });
    let settings = SettingsHandle::new(Settings {
        max_reconfigurations_in_flight: args.max_in_flight,
        reconfiguration_retry_interval: Duration::from_millis(50),
        ..Settings::default()
    });
    let store = InMemoryEpochStore::new();
    let reconciler = Arc::new(StorageSetReconciler);
    let registry = SequencerRegistry::new(
        config.clone(),
        settings.clone(),
        store.clone(),
        reconciler.clone(),
    );
    let metrics = Arc::new(ReconfigMetrics::default());
    let handle = reconfig::spawn(ReconfigEnv {
        registry: Arc::clone(&registry),
        config: config.clone(),
        settings: settings.clone(),
        metrics: Arc::clone(&metrics),
        reconciler,
    });
    Cluster {
        config,
        settings,
        store,
        registry,
        metrics,
        handle,
    }
}

async fn bootstrap(cluster: &Cluster, logs: u64, timeout: Duration) -> Result<()> {
    for raw in 1..=logs {
        let log_id = LogId(raw);
        cluster.registry.get_or_create(log_id);
        cluster
            .registry
            .activate(log_id, "workload bootstrap", |_| true, None, None)
            .map_err(|status| anyhow!("bootstrap activation for {log_id} failed: {status}"))?;
    }
    let deadline = Instant::now() + timeout;
    for raw in 1..=logs {
        let log_id = LogId(raw);
        let seq = cluster
            .registry
            .find(log_id)
            .ok_or_else(|| anyhow!("no sequencer for {log_id}"))?;
        while seq.state() != SequencerState::Active {
            if Instant::now() > deadline {
                bail!("sequencer for {log_id} never activated");
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }
    // Each activation completion drives one follow-up re-check; wait for all
    // of them so the first churn round starts from a settled engine.
    while cluster.metrics.snapshot().completed < logs {
        if Instant::now() > deadline {
            bail!("post-activation re-checks never completed");
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    wait_quiescent(cluster, timeout).await
}

/// One round of churn: one of a capacity bump, a node flap, a window-size
/// change, or a storage-set format flip.
fn apply_churn(cluster: &Cluster, rng: &mut SmallRng, storage_nodes: u64) {
    let mut next = (*cluster.config.snapshot()).clone();
    next.version += 1;
    match rng.gen_range(0..4u8) {
        0 => {
            let node_id = rng.gen_range(1..=storage_nodes);
            if let Some(node) = next.nodes.storage.get_mut(&node_id) {
                node.capacity = rng.gen_range(50..400);
                tracing::debug!(node_id, capacity = node.capacity, "churn: capacity change");
            }
        }
        1 => {
            // Flap one node, but keep enough enabled to satisfy selection.
            let enabled = next
                .nodes
                .storage
                .values()
                .filter(|node| node.enabled)
                .count();
            let node_id = rng.gen_range(1..=storage_nodes);
            if let Some(node) = next.nodes.storage.get_mut(&node_id) {
                if node.enabled && enabled > 4 {
                    node.enabled = false;
                } else {
                    node.enabled = true;
                }
                tracing::debug!(node_id, enabled = node.enabled, "churn: node flap");
            }
        }
        2 => {
            let log_count = next.logs.logs.len() as u64;
            let raw = rng.gen_range(1..=log_count.max(1));
            if let Some(attrs) = next.logs.logs.get_mut(&LogId(raw)) {
                attrs.max_writes_in_flight = rng.gen_range(32..512);
                tracing::debug!(
                    log_id = raw,
                    window = attrs.max_writes_in_flight,
                    "churn: window change"
                );
            }
        }
        _ => {
            cluster.settings.update(|settings| {
                settings.epoch_metadata_use_new_storage_set_format =
                    !settings.epoch_metadata_use_new_storage_set_format;
            });
            tracing::debug!("churn: storage set format flip");
        }
    }
    cluster.config.install(next);
}

async fn wait_quiescent(cluster: &Cluster, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
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

/// After convergence every active sequencer's params must match the store.
fn verify_converged(cluster: &Cluster, log_ids: &[LogId]) -> Result<()> {
    for &log_id in log_ids {
        let seq = cluster
            .registry
            .find(log_id)
            .ok_or_else(|| anyhow!("no sequencer for {log_id}"))?;
        if seq.state() != SequencerState::Active {
            // A preempted or inactive sequencer is legal after churn; it just
            // means this node no longer serves the log.
            continue;
        }
        let metadata = seq
            .current_metadata()
            .ok_or_else(|| anyhow!("active sequencer for {log_id} has no metadata"))?;
        let entry = cluster
            .store
            .read(log_id)
            .ok_or_else(|| anyhow!("no store entry for {log_id}"))?;
        if entry.storage_set_params != metadata.storage_set_params {
            bail!(
                "{log_id} params diverged: store {:?} vs sequencer {:?}",
                entry.storage_set_params,
                metadata.storage_set_params
            );
        }
    }
    Ok(())
}
