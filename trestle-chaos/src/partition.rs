//! Fault operator that splits the cluster into two network regions.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::Mutex;
use trestle_testbed::{
    CleanupStack, CleanupToken, ClusterControl, IsolationRule, Node, TestbedError, Topology,
};

use crate::error::ChaosError;
use crate::manager::ChaosManager;
use crate::names::NameSource;
use crate::operator::ChaosOperator;

/// Everything needed to undo one activation.
struct PartitionState {
    label_key: String,
    regions: [Vec<Node>; 2],
    rules: Vec<String>,
    cleanup: CleanupToken,
}

/// Splits every node in the cluster into two disjoint regions.
///
/// Activation assigns each node to one of two regions, labels it with
/// the region it landed in, and installs one allow-list rule per region
/// restricting its traffic to the other region's addresses as host-exact
/// blocks. With two or more nodes both regions are non-empty; a single
/// node lands alone in one region with no rules, and an empty topology
/// partitions as a no-op. Deactivation deletes the rules and strips the
/// labels.
pub struct NetworkPartition {
    name: String,
    topology: Arc<Topology>,
    control: Arc<dyn ClusterControl>,
    cleanups: Arc<CleanupStack>,
    names: NameSource,
    state: Mutex<Option<PartitionState>>,
}

impl NetworkPartition {
    /// Create an operator partitioning the manager's whole cluster.
    pub fn new(manager: &ChaosManager) -> Self {
        Self {
            name: "network-partition".to_string(),
            topology: Arc::clone(manager.topology()),
            control: Arc::clone(manager.control()),
            cleanups: Arc::clone(manager.cleanups()),
            names: manager.names().clone(),
            state: Mutex::new(None),
        }
    }
}

#[async_trait]
impl ChaosOperator for NetworkPartition {
    fn name(&self) -> &str {
        &self.name
    }

    async fn can_activate(&self) -> bool {
        self.state.lock().await.is_none()
    }

    async fn activate(&self) -> Result<(), ChaosError> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            return Err(ChaosError::AlreadyActive(self.name.clone()));
        }

        let mut pool: Vec<Node> = self.topology.all_nodes().cloned().collect();
        let regions = {
            let mut rng = rand::thread_rng();
            let mut regions: [Vec<Node>; 2] = [Vec::new(), Vec::new()];
            // Seed each side once so neither region is empty when two or
            // more nodes exist.
            for region in regions.iter_mut() {
                if let Some(node) = pop_random(&mut pool, &mut rng) {
                    region.push(node);
                }
            }
            while let Some(node) = pop_random(&mut pool, &mut rng) {
                regions[rng.gen_range(0..2)].push(node);
            }
            regions
        };

        let label_key = self.names.next("partition");
        // Rules only make sense when both sides are populated.
        let rules: Vec<String> = if regions.iter().all(|r| !r.is_empty()) {
            vec![self.names.next("np-partition"), self.names.next("np-partition")]
        } else {
            Vec::new()
        };

        // Registered before the first mutation so a partial activation
        // still gets reversed at the end of the run.
        let cleanup = {
            let control = Arc::clone(&self.control);
            let regions = regions.clone();
            let label_key = label_key.clone();
            let rules = rules.clone();
            self.cleanups
                .register("network-partition", move || async move {
                    teardown(control.as_ref(), &regions, &label_key, &rules).await;
                    Ok(())
                })
                .await
        };

        if let Err(e) = apply(self.control.as_ref(), &regions, &label_key, &rules).await {
            tracing::warn!("Rolling back partial partition activation: {}", e);
            teardown(self.control.as_ref(), &regions, &label_key, &rules).await;
            self.cleanups.unregister(cleanup).await;
            return Err(e.into());
        }

        tracing::info!(
            "Partition active: {} vs {} nodes under {}",
            regions[0].len(),
            regions[1].len(),
            label_key
        );
        *state = Some(PartitionState {
            label_key,
            regions,
            rules,
            cleanup,
        });
        Ok(())
    }

    async fn deactivate(&self) -> Result<(), ChaosError> {
        let mut state = self.state.lock().await;
        let PartitionState {
            label_key,
            regions,
            rules,
            cleanup,
        } = state
            .take()
            .ok_or_else(|| ChaosError::NotActive(self.name.clone()))?;

        teardown(self.control.as_ref(), &regions, &label_key, &rules).await;
        self.cleanups.unregister(cleanup).await;
        tracing::info!("Partition healed");
        Ok(())
    }
}

/// Remove one random node from the pool.
fn pop_random(pool: &mut Vec<Node>, rng: &mut impl Rng) -> Option<Node> {
    if pool.is_empty() {
        return None;
    }
    let idx = rng.gen_range(0..pool.len());
    Some(pool.swap_remove(idx))
}

/// Label both regions and fence them off from each other.
async fn apply(
    control: &dyn ClusterControl,
    regions: &[Vec<Node>; 2],
    label_key: &str,
    rules: &[String],
) -> Result<(), TestbedError> {
    for (i, region) in regions.iter().enumerate() {
        for node in region {
            let mut labels = control.pod_labels(node).await?;
            labels.insert(label_key.to_string(), format!("region-{i}"));
            control.set_pod_labels(node, labels).await?;
        }
    }
    for (i, rule_name) in rules.iter().enumerate() {
        let selector = BTreeMap::from([(label_key.to_string(), format!("region-{i}"))]);
        let peers = regions[1 - i]
            .iter()
            .map(|n| n.address().to_string())
            .collect();
        control
            .create_isolation_rule(&IsolationRule::allow_only(rule_name, selector, peers))
            .await?;
    }
    Ok(())
}

/// Reverse [`apply`], tolerating targets that no longer exist.
async fn teardown(
    control: &dyn ClusterControl,
    regions: &[Vec<Node>; 2],
    label_key: &str,
    rules: &[String],
) {
    for rule_name in rules {
        if let Err(e) = control.delete_isolation_rule(rule_name).await {
            tracing::warn!("Could not delete isolation rule {}: {}", rule_name, e);
        }
    }
    for node in regions.iter().flatten() {
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
}
