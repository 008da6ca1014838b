//! # trestle
//!
//! Test harness for a distributed SQL cluster on Kubernetes.
//!
//! ## Commands
//!
//! - `smoke`: provision a TiDB cluster, probe it over SQL, optionally
//!   inject faults while it runs, tear everything down
//!
//! ## Example
//!
//! ```bash
//! # Plain smoke test against the configured namespace
//! trestle smoke
//!
//! # Same scenario with one storage node knocked offline partway through
//! trestle smoke --chaos offline
//!
//! # Randomized background faults, settings from a config file
//! trestle smoke --chaos both --config trestle.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::OnceCell;
use trestle_chaos::{
    ChaosDown, ChaosManager, ChaosOperator, ChaosUp, NetworkPartition, NodeOffline,
};
use trestle_testbed::{
    logging, start_nodes, tidb, CleanupStack, KubeCluster, Role, Scenario, SleepAction, SqlProbe,
    TestContext,
};

mod config;

use config::TrestleConfig;

/// Seconds the cluster gets to settle before the first probe.
const SETTLE: Duration = Duration::from_secs(5);

/// Seconds faults stay registered before the scenario heals them.
const FAULT_WINDOW: Duration = Duration::from_secs(30);

/// Test harness for a distributed SQL cluster on Kubernetes.
#[derive(Parser, Debug)]
#[command(name = "trestle")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to a TOML config file (default: trestle.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Provision a cluster, probe it over SQL, tear everything down
    Smoke {
        /// Fault injection to run alongside the probes
        #[arg(long, value_enum, default_value = "off")]
        chaos: ChaosMode,
    },
}

/// Which fault operators the smoke scenario registers.
#[derive(ValueEnum, Clone, Copy, Debug)]
enum ChaosMode {
    /// No fault injection
    Off,
    /// One random storage node taken offline
    Offline,
    /// The whole cluster split into two regions
    Partition,
    /// Both operators registered
    Both,
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();

    let cli = Cli::parse();
    let config = TrestleConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Smoke { chaos } => smoke(config, chaos).await,
    }
}

/// Run the smoke scenario, tearing down on every exit path.
async fn smoke(config: TrestleConfig, mode: ChaosMode) -> Result<()> {
    let cluster = KubeCluster::connect(config.cluster.clone()).await?;
    let cleanups = Arc::new(CleanupStack::new());
    let manager_slot: OnceCell<Arc<ChaosManager>> = OnceCell::new();

    let result = tokio::select! {
        result = run_smoke(&cluster, &config, mode, &cleanups, &manager_slot) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Interrupted, tearing down");
            Err(anyhow::anyhow!("interrupted"))
        }
    };

    // The scheduling loop must be parked before the drain, or it could
    // re-arm a fault behind the drain's back.
    if let Some(manager) = manager_slot.get() {
        if manager.stop().is_ok() {
            manager.join().await;
        }
    }
    cleanups.drain().await;

    result
}

async fn run_smoke(
    cluster: &KubeCluster,
    config: &TrestleConfig,
    mode: ChaosMode,
    cleanups: &Arc<CleanupStack>,
    manager_slot: &OnceCell<Arc<ChaosManager>>,
) -> Result<()> {
    let spec = tidb::cluster_spec();
    let topology = Arc::new(cluster.provision(&spec, cleanups).await?);
    start_nodes(
        cluster,
        &spec,
        &topology,
        Duration::from_secs(config.cluster.launch_stagger_secs),
    )
    .await?;

    let manager = Arc::new(ChaosManager::new(
        Arc::clone(&topology),
        Arc::new(cluster.clone()),
        Arc::clone(cleanups),
        config.chaos.clone(),
    )?);
    let _ = manager_slot.set(Arc::clone(&manager));

    let scenario = build_scenario(&manager, mode);
    let ctx = TestContext::new(topology, Arc::new(cluster.clone()));

    manager.start().await?;
    let result = scenario.run(&ctx).await;
    if manager.stop().is_ok() {
        manager.join().await;
    }
    result
}

/// Settle, probe, inject, wait out the fault window, heal, probe again.
fn build_scenario(manager: &Arc<ChaosManager>, mode: ChaosMode) -> Scenario {
    let mut operators: Vec<Arc<dyn ChaosOperator>> = Vec::new();
    if matches!(mode, ChaosMode::Offline | ChaosMode::Both) {
        operators.push(Arc::new(NodeOffline::new(
            manager,
            Role::new(tidb::KV_ROLE),
        )));
    }
    if matches!(mode, ChaosMode::Partition | ChaosMode::Both) {
        operators.push(Arc::new(NetworkPartition::new(manager)));
    }

    let mut scenario = Scenario::new("smoke")
        .with_step(SleepAction::new(SETTLE))
        .with_step(SqlProbe::new(Role::new(tidb::DB_ROLE)));
    for op in &operators {
        scenario = scenario.with_step(ChaosUp::new(Arc::clone(manager), Arc::clone(op)));
    }
    if !operators.is_empty() {
        scenario = scenario.with_step(SleepAction::new(FAULT_WINDOW));
        for op in &operators {
            scenario = scenario.with_step(ChaosDown::new(Arc::clone(manager), Arc::clone(op)));
        }
    }
    scenario.with_step(SqlProbe::new(Role::new(tidb::DB_ROLE)))
}
