//! Fault operator that takes one node of a role off the network.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use trestle_testbed::{
    CleanupStack, CleanupToken, ClusterControl, IsolationRule, Node, Role, TestbedError, Topology,
};

use crate::error::ChaosError;
use crate::manager::ChaosManager;
use crate::names::NameSource;
use crate::operator::ChaosOperator;

/// Everything needed to undo one activation.
struct OfflineState {
    node: Node,
    label_key: String,
    rule_name: String,
    cleanup: CleanupToken,
}

/// Takes a random node of one role off the network.
///
/// Activation picks a node uniformly from the role, stamps it with a
/// unique label, and installs a deny-all isolation rule selecting that
/// label, so only the chosen pod is cut off. Deactivation deletes the
/// rule and strips the label. At most one node is offline per operator
/// instance; register several instances to overlap faults.
pub struct NodeOffline {
    name: String,
    role: Role,
    topology: Arc<Topology>,
    control: Arc<dyn ClusterControl>,
    cleanups: Arc<CleanupStack>,
    names: NameSource,
    state: Mutex<Option<OfflineState>>,
}

impl NodeOffline {
    /// Create an operator targeting nodes of `role` on the manager's
    /// cluster.
    pub fn new(manager: &ChaosManager, role: Role) -> Self {
        Self {
            name: format!("node-offline-{role}"),
            role,
            topology: Arc::clone(manager.topology()),
            control: Arc::clone(manager.control()),
            cleanups: Arc::clone(manager.cleanups()),
            names: manager.names().clone(),
            state: Mutex::new(None),
        }
    }
}

#[async_trait]
impl ChaosOperator for NodeOffline {
    fn name(&self) -> &str {
        &self.name
    }

    async fn can_activate(&self) -> bool {
        self.state.lock().await.is_none()
    }

    async fn can_deactivate(&self) -> bool {
        self.state.lock().await.is_some()
    }

    async fn activate(&self) -> Result<(), ChaosError> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            return Err(ChaosError::AlreadyActive(self.name.clone()));
        }
        let node = self
            .topology
            .pick_random(&self.role)
            .ok_or_else(|| ChaosError::NoEligibleNodes {
                role: self.role.to_string(),
            })?
            .clone();
        let label_key = self.names.next("offline");
        let rule_name = self.names.next("np-deny-all");

        // Registered before the first mutation so a partial activation
        // still gets reversed at the end of the run.
        let cleanup = {
            let control = Arc::clone(&self.control);
            let node = node.clone();
            let label_key = label_key.clone();
            let rule_name = rule_name.clone();
            self.cleanups
                .register(format!("node-offline {}", node.name()), move || async move {
                    teardown(control.as_ref(), &node, &label_key, &rule_name).await;
                    Ok(())
                })
                .await
        };

        if let Err(e) = apply(self.control.as_ref(), &node, &label_key, &rule_name).await {
            tracing::warn!(
                "Rolling back partial offline activation of {}: {}",
                node.name(),
                e
            );
            teardown(self.control.as_ref(), &node, &label_key, &rule_name).await;
            self.cleanups.unregister(cleanup).await;
            return Err(e.into());
        }

        tracing::info!("Node {} taken offline via rule {}", node.name(), rule_name);
        *state = Some(OfflineState {
            node,
            label_key,
            rule_name,
            cleanup,
        });
        Ok(())
    }

    async fn deactivate(&self) -> Result<(), ChaosError> {
        let mut state = self.state.lock().await;
        let OfflineState {
            node,
            label_key,
            rule_name,
            cleanup,
        } = state
            .take()
            .ok_or_else(|| ChaosError::NotActive(self.name.clone()))?;

        teardown(self.control.as_ref(), &node, &label_key, &rule_name).await;
        self.cleanups.unregister(cleanup).await;
        tracing::info!("Node {} back online", node.name());
        Ok(())
    }
}

/// Label the node and wall it off behind a deny-all rule.
async fn apply(
    control: &dyn ClusterControl,
    node: &Node,
    label_key: &str,
    rule_name: &str,
) -> Result<(), TestbedError> {
    let mut labels = control.pod_labels(node).await?;
    labels.insert(label_key.to_string(), "true".to_string());
    control.set_pod_labels(node, labels).await?;

    let selector = BTreeMap::from([(label_key.to_string(), "true".to_string())]);
    control
        .create_isolation_rule(&IsolationRule::deny_all(rule_name, selector))
        .await
}

/// Reverse [`apply`], tolerating targets that no longer exist.
///
/// Teardown can run after the cluster is already half gone, so every
/// step is attempted and failures are only logged.
async fn teardown(control: &dyn ClusterControl, node: &Node, label_key: &str, rule_name: &str) {
    if let Err(e) = control.delete_isolation_rule(rule_name).await {
        tracing::warn!("Could not delete isolation rule {}: {}", rule_name, e);
    }
    match control.pod_labels(node).await {
        Ok(mut labels) => {
            if labels.remove(label_key).is_some() {
                if let Err(e) = control.set_pod_labels(node, labels).await {
                    tracing::warn!("Could not restore labels on {}: {}", node.name(), e);
                }
            }
        }
        Err(e) => tracing::warn!("Could not read labels on {}: {}", node.name(), e),
    }
}
