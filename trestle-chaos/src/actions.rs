//! Scenario steps that hand operators to the chaos manager.

use std::sync::Arc;

use async_trait::async_trait;
use trestle_testbed::{TestAction, TestContext};

use crate::manager::ChaosManager;
use crate::operator::ChaosOperator;

/// Scenario step registering an operator with the manager.
///
/// Registration is synchronous from the scenario's point of view: with
/// `activate_on_register` set, the fault's orchestration writes have
/// landed when the step returns.
pub struct ChaosUp {
    manager: Arc<ChaosManager>,
    operator: Arc<dyn ChaosOperator>,
}

impl ChaosUp {
    /// Step that registers `operator` when it runs.
    pub fn new(manager: Arc<ChaosManager>, operator: Arc<dyn ChaosOperator>) -> Self {
        Self { manager, operator }
    }
}

#[async_trait]
impl TestAction for ChaosUp {
    fn name(&self) -> &str {
        "chaos-up"
    }

    async fn run(&self, _ctx: &TestContext) -> anyhow::Result<()> {
        self.manager
            .add_chaos_operator(Arc::clone(&self.operator))
            .await?;
        Ok(())
    }
}

/// Scenario step unregistering an operator, deactivating it if active.
pub struct ChaosDown {
    manager: Arc<ChaosManager>,
    operator: Arc<dyn ChaosOperator>,
}

impl ChaosDown {
    /// Step that removes `operator` when it runs.
    pub fn new(manager: Arc<ChaosManager>, operator: Arc<dyn ChaosOperator>) -> Self {
        Self { manager, operator }
    }
}

#[async_trait]
impl TestAction for ChaosDown {
    fn name(&self) -> &str {
        "chaos-down"
    }

    async fn run(&self, _ctx: &TestContext) -> anyhow::Result<()> {
        self.manager
            .remove_chaos_operator(&self.operator)
            .await?;
        Ok(())
    }
}
