//! Operator registry and the background scheduling loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use rand::Rng;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use trestle_testbed::{CleanupStack, ClusterControl, Topology};

use crate::error::ChaosError;
use crate::names::NameSource;
use crate::operator::ChaosOperator;

/// Background scheduling configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ChaosConfig {
    /// Probability in [0, 1] that one loop iteration triggers a transition
    /// (default: 0.5).
    #[serde(default = "default_trigger_rate")]
    pub trigger_rate: f64,
    /// Milliseconds slept between loop iterations (default: 10000).
    #[serde(default = "default_polling_interval_ms")]
    pub polling_interval_ms: u64,
    /// Activate an operator immediately when it is registered
    /// (default: false).
    #[serde(default)]
    pub activate_on_register: bool,
}

// Default value functions

fn default_trigger_rate() -> f64 {
    0.5
}

fn default_polling_interval_ms() -> u64 {
    10_000
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            trigger_rate: default_trigger_rate(),
            polling_interval_ms: default_polling_interval_ms(),
            activate_on_register: false,
        }
    }
}

impl ChaosConfig {
    /// Reject out-of-range values.
    pub fn validate(&self) -> Result<(), ChaosError> {
        if !(0.0..=1.0).contains(&self.trigger_rate) {
            return Err(ChaosError::InvalidConfig(format!(
                "trigger_rate {} outside [0, 1]",
                self.trigger_rate
            )));
        }
        if self.polling_interval_ms == 0 {
            return Err(ChaosError::InvalidConfig(
                "polling_interval_ms must be nonzero".to_string(),
            ));
        }
        Ok(())
    }

    /// Sleep between loop iterations.
    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }
}

/// Shared registry of fault operators plus the scheduling loop.
///
/// One manager exists per test run, shared as `Arc<ChaosManager>`;
/// operators are constructed against it and every cloned handle sees the
/// same registry. The registry mutex also serializes operator state
/// transitions, whether they originate from a scenario step or from the
/// background loop.
pub struct ChaosManager {
    topology: Arc<Topology>,
    control: Arc<dyn ClusterControl>,
    cleanups: Arc<CleanupStack>,
    names: NameSource,
    config: ChaosConfig,
    ops: Arc<Mutex<Vec<Arc<dyn ChaosOperator>>>>,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ChaosManager {
    /// Create a manager over the shared test-run state.
    ///
    /// The config is validated once here.
    pub fn new(
        topology: Arc<Topology>,
        control: Arc<dyn ClusterControl>,
        cleanups: Arc<CleanupStack>,
        config: ChaosConfig,
    ) -> Result<Self, ChaosError> {
        config.validate()?;
        Ok(Self {
            topology,
            control,
            cleanups,
            names: NameSource::new(),
            config,
            ops: Arc::new(Mutex::new(Vec::new())),
            running: Arc::new(AtomicBool::new(false)),
            worker: Mutex::new(None),
        })
    }

    /// Topology shared with every operator.
    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    /// Cluster control seam shared with every operator.
    pub fn control(&self) -> &Arc<dyn ClusterControl> {
        &self.control
    }

    /// Cleanup stack operators register reversals on.
    pub fn cleanups(&self) -> &Arc<CleanupStack> {
        &self.cleanups
    }

    /// Name source for labels and rule names.
    pub fn names(&self) -> &NameSource {
        &self.names
    }

    /// Number of registered operators.
    pub async fn operator_count(&self) -> usize {
        self.ops.lock().await.len()
    }

    /// Whether the scheduling loop is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Register an operator with the scheduler.
    ///
    /// Registering the same instance twice is an error. With
    /// `activate_on_register` set the operator is activated first and not
    /// registered if activation fails.
    pub async fn add_chaos_operator(&self, op: Arc<dyn ChaosOperator>) -> Result<(), ChaosError> {
        let mut ops = self.ops.lock().await;
        if ops.iter().any(|existing| Arc::ptr_eq(existing, &op)) {
            return Err(ChaosError::AlreadyRegistered(op.name().to_string()));
        }
        if self.config.activate_on_register {
            tracing::info!("Activating {} on registration", op.name());
            op.activate().await?;
        }
        tracing::info!("Registered chaos operator {}", op.name());
        ops.push(op);
        Ok(())
    }

    /// Remove an operator from the scheduler.
    ///
    /// Removing an instance that is not registered is an error. A removed
    /// operator is deactivated iff it reports `can_deactivate`, before
    /// this call returns; the deactivation error, if any, propagates.
    pub async fn remove_chaos_operator(
        &self,
        op: &Arc<dyn ChaosOperator>,
    ) -> Result<(), ChaosError> {
        let mut ops = self.ops.lock().await;
        let pos = ops
            .iter()
            .position(|existing| Arc::ptr_eq(existing, op))
            .ok_or_else(|| ChaosError::NotRegistered(op.name().to_string()))?;
        let removed = ops.remove(pos);
        tracing::info!("Removed chaos operator {}", removed.name());
        if removed.can_deactivate().await {
            removed.deactivate().await?;
        }
        Ok(())
    }

    /// Spawn the scheduling loop.
    ///
    /// Starting a running manager is an error. A manager that was stopped
    /// and joined can be started again.
    pub async fn start(&self) -> Result<(), ChaosError> {
        let mut worker = self.worker.lock().await;
        if worker.is_some() {
            return Err(ChaosError::AlreadyRunning);
        }
        self.running.store(true, Ordering::SeqCst);
        *worker = Some(tokio::spawn(run_loop(
            Arc::clone(&self.ops),
            Arc::clone(&self.running),
            self.config.clone(),
        )));
        tracing::info!("Chaos worker started");
        Ok(())
    }

    /// Ask the scheduling loop to stop.
    ///
    /// Only flips the running flag; the loop observes it at the top of
    /// its next iteration. Use [`join`](Self::join) to wait for it.
    pub fn stop(&self) -> Result<(), ChaosError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(ChaosError::NotRunning);
        }
        tracing::info!("Chaos worker stopping");
        Ok(())
    }

    /// Wait for a stopped scheduling loop to finish its final iteration.
    pub async fn join(&self) {
        let handle = self.worker.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

async fn run_loop(
    ops: Arc<Mutex<Vec<Arc<dyn ChaosOperator>>>>,
    running: Arc<AtomicBool>,
    config: ChaosConfig,
) {
    tracing::info!("Chaos worker loop running");
    while running.load(Ordering::SeqCst) {
        tick(&ops, &config).await;
        tokio::time::sleep(config.polling_interval()).await;
    }
    tracing::info!("Chaos worker loop ended");
}

/// One scheduling iteration.
///
/// Holds the registry lock for the whole transition so scenario steps
/// cannot race it. Transition failures are logged, never propagated;
/// the loop must outlive any single fault.
async fn tick(ops: &Mutex<Vec<Arc<dyn ChaosOperator>>>, config: &ChaosConfig) {
    let ops = ops.lock().await;
    if ops.is_empty() {
        return;
    }

    // rng handle must not live across an await
    let picked = {
        let mut rng = rand::thread_rng();
        if rng.gen::<f64>() < config.trigger_rate {
            ops.choose(&mut rng).cloned()
        } else {
            None
        }
    };
    let Some(op) = picked else { return };

    if op.can_activate().await {
        tracing::info!("Activating {}", op.name());
        if let Err(e) = op.activate().await {
            tracing::error!("Failed to activate {}: {}", op.name(), e);
        }
    } else if op.can_deactivate().await {
        tracing::info!("Deactivating {}", op.name());
        if let Err(e) = op.deactivate().await {
            tracing::error!("Failed to deactivate {}: {}", op.name(), e);
        }
    } else {
        tracing::error!(
            "{} can neither activate nor deactivate, operator state looks inconsistent",
            op.name()
        );
    }
}
