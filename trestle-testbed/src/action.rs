//! Test actions and the scenario runner.
//!
//! A scenario is an ordered list of steps run against the provisioned
//! cluster. Steps are foreground work: the runner executes them one at a
//! time and aborts the whole scenario on the first failure.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;

use crate::cluster::PodExec;
use crate::error::TestbedError;
use crate::node::{Role, Topology};
use crate::tidb;

/// Shared state every step runs against.
#[derive(Clone)]
pub struct TestContext {
    /// View of the provisioned cluster, fixed for the whole run.
    pub topology: Arc<Topology>,
    /// Command execution seam.
    pub exec: Arc<dyn PodExec>,
}

impl TestContext {
    /// Bundle a topology with an exec implementation.
    pub fn new(topology: Arc<Topology>, exec: Arc<dyn PodExec>) -> Self {
        Self { topology, exec }
    }
}

/// One scenario step.
#[async_trait]
pub trait TestAction: Send + Sync {
    /// Step name for logs.
    fn name(&self) -> &str;

    /// Run the step to completion. An error aborts the scenario.
    async fn run(&self, ctx: &TestContext) -> anyhow::Result<()>;
}

/// Pause the scenario for a fixed duration.
pub struct SleepAction {
    duration: Duration,
}

impl SleepAction {
    /// Sleep for `duration` when run.
    pub fn new(duration: Duration) -> Self {
        Self { duration }
    }
}

#[async_trait]
impl TestAction for SleepAction {
    fn name(&self) -> &str {
        "sleep"
    }

    async fn run(&self, _ctx: &TestContext) -> anyhow::Result<()> {
        tokio::time::sleep(self.duration).await;
        Ok(())
    }
}

/// Probe the SQL head by selecting the server version in-pod.
///
/// Runs the MySQL client inside the first node of the query role against
/// its local SQL port. The step fails when no query node exists or the
/// output lacks the version marker.
pub struct SqlProbe {
    role: Role,
}

impl SqlProbe {
    /// Probe the first node carrying `role`.
    pub fn new(role: Role) -> Self {
        Self { role }
    }
}

#[async_trait]
impl TestAction for SqlProbe {
    fn name(&self) -> &str {
        "sql-probe"
    }

    async fn run(&self, ctx: &TestContext) -> anyhow::Result<()> {
        let node = ctx
            .topology
            .nodes_with_role(&self.role)
            .first()
            .ok_or_else(|| TestbedError::NoNodes {
                role: self.role.to_string(),
            })?;

        let argv = vec![
            "mysql".to_string(),
            "-h".to_string(),
            "127.0.0.1".to_string(),
            "-P".to_string(),
            tidb::SQL_PORT.to_string(),
            "-u".to_string(),
            "root".to_string(),
            "--connect-timeout".to_string(),
            "5".to_string(),
            "-e".to_string(),
            "select tidb_version();".to_string(),
        ];
        let output = ctx.exec.exec(node, &argv).await?;

        if !output.contains("tidb_version") {
            return Err(TestbedError::ProbeFailed {
                pod: node.name().to_string(),
                output,
            }
            .into());
        }
        tracing::info!("SQL probe on {} succeeded", node.name());
        Ok(())
    }
}

/// Named ordered list of steps.
pub struct Scenario {
    name: String,
    steps: Vec<Box<dyn TestAction>>,
}

impl Scenario {
    /// Create an empty scenario.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    /// Append a step.
    pub fn with_step(mut self, step: impl TestAction + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    /// Scenario name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the scenario has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Run every step in order, stopping at the first failure.
    pub async fn run(&self, ctx: &TestContext) -> anyhow::Result<()> {
        tracing::info!("Running scenario {} ({} steps)", self.name, self.steps.len());
        for (index, step) in self.steps.iter().enumerate() {
            tracing::info!("Step {}/{}: {}", index + 1, self.steps.len(), step.name());
            step.run(ctx)
                .await
                .with_context(|| format!("step {} failed", step.name()))?;
        }
        tracing::info!("Scenario {} complete", self.name);
        Ok(())
    }
}
