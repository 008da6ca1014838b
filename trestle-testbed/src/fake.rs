//! In-memory cluster fake for testing.
//!
//! Implements both cluster seams against plain maps so operator and
//! scenario logic can be exercised without a live Kubernetes cluster.
//! Allows queueing exec output and capturing every mutation for
//! verification.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::cluster::{ClusterControl, IsolationRule, PodExec};
use crate::error::TestbedError;
use crate::node::{Node, Topology};

/// In-memory cluster fake for testing.
///
/// Pods must be registered (`add_pod` or `add_topology`) before they can
/// be labeled or execed into; operations on unknown pods fail the way the
/// real API server would.
#[derive(Debug, Default)]
pub struct FakeCluster {
    inner: Arc<Mutex<FakeClusterInner>>,
}

#[derive(Debug, Default)]
struct FakeClusterInner {
    labels: BTreeMap<String, BTreeMap<String, String>>,
    rules: BTreeMap<String, IsolationRule>,
    created_rules: Vec<IsolationRule>,
    deleted_rules: Vec<String>,
    exec_queue: VecDeque<String>,
    exec_log: Vec<(String, Vec<String>)>,
    spawned: Vec<(String, String)>,
    fail_next_label_write: Option<String>,
    fail_next_rule_create: Option<String>,
    fail_next_rule_delete: Option<String>,
    fail_next_exec: Option<String>,
}

impl FakeCluster {
    /// Create a new fake with no pods.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pod with an empty label map.
    pub fn add_pod(&self, name: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.labels.entry(name.to_string()).or_default();
    }

    /// Register every node of a topology.
    pub fn add_topology(&self, topology: &Topology) {
        for node in topology.all_nodes() {
            self.add_pod(node.name());
        }
    }

    /// Current labels of a pod, for assertions.
    pub fn labels_of(&self, name: &str) -> BTreeMap<String, String> {
        let inner = self.inner.lock().unwrap();
        inner.labels.get(name).cloned().unwrap_or_default()
    }

    /// Names of the isolation rules currently installed.
    pub fn rule_names(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner.rules.keys().cloned().collect()
    }

    /// Get an installed rule by name.
    pub fn rule(&self, name: &str) -> Option<IsolationRule> {
        let inner = self.inner.lock().unwrap();
        inner.rules.get(name).cloned()
    }

    /// Every rule ever created, in creation order.
    pub fn created_rules(&self) -> Vec<IsolationRule> {
        let inner = self.inner.lock().unwrap();
        inner.created_rules.clone()
    }

    /// Every rule name ever deleted, in deletion order.
    pub fn deleted_rules(&self) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        inner.deleted_rules.clone()
    }

    /// Queue output to be returned by the next `exec()` call.
    pub fn queue_exec_output(&self, output: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.exec_queue.push_back(output.to_string());
    }

    /// Get all exec invocations as (pod, argv) pairs.
    pub fn exec_log(&self) -> Vec<(String, Vec<String>)> {
        let inner = self.inner.lock().unwrap();
        inner.exec_log.clone()
    }

    /// Get all detached spawns as (pod, command) pairs.
    pub fn spawned_commands(&self) -> Vec<(String, String)> {
        let inner = self.inner.lock().unwrap();
        inner.spawned.clone()
    }

    /// Cause the next `set_pod_labels()` to fail with the given error.
    pub fn fail_next_label_write(&self, error: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_next_label_write = Some(error.to_string());
    }

    /// Cause the next `create_isolation_rule()` to fail with the given error.
    pub fn fail_next_rule_create(&self, error: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_next_rule_create = Some(error.to_string());
    }

    /// Cause the next `delete_isolation_rule()` to fail with the given error.
    pub fn fail_next_rule_delete(&self, error: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_next_rule_delete = Some(error.to_string());
    }

    /// Cause the next `exec()` or `spawn_detached()` to fail with the
    /// given error.
    pub fn fail_next_exec(&self, error: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_next_exec = Some(error.to_string());
    }

    /// Clear all state (pods, rules, histories, queues).
    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        *inner = FakeClusterInner::default();
    }
}

impl Clone for FakeCluster {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[async_trait]
impl ClusterControl for FakeCluster {
    async fn pod_labels(&self, node: &Node) -> Result<BTreeMap<String, String>, TestbedError> {
        let inner = self.inner.lock().unwrap();
        inner
            .labels
            .get(node.name())
            .cloned()
            .ok_or_else(|| TestbedError::Api(format!("pod {} not found", node.name())))
    }

    async fn set_pod_labels(
        &self,
        node: &Node,
        labels: BTreeMap<String, String>,
    ) -> Result<(), TestbedError> {
        let mut inner = self.inner.lock().unwrap();

        // Check for forced failure
        if let Some(error) = inner.fail_next_label_write.take() {
            return Err(TestbedError::Api(error));
        }

        match inner.labels.get_mut(node.name()) {
            Some(existing) => {
                *existing = labels;
                Ok(())
            }
            None => Err(TestbedError::Api(format!("pod {} not found", node.name()))),
        }
    }

    async fn create_isolation_rule(&self, rule: &IsolationRule) -> Result<(), TestbedError> {
        let mut inner = self.inner.lock().unwrap();

        // Check for forced failure
        if let Some(error) = inner.fail_next_rule_create.take() {
            return Err(TestbedError::Api(error));
        }

        if inner.rules.contains_key(&rule.name) {
            return Err(TestbedError::Api(format!(
                "isolation rule {} already exists",
                rule.name
            )));
        }
        inner.rules.insert(rule.name.clone(), rule.clone());
        inner.created_rules.push(rule.clone());
        Ok(())
    }

    async fn delete_isolation_rule(&self, name: &str) -> Result<(), TestbedError> {
        let mut inner = self.inner.lock().unwrap();

        // Check for forced failure
        if let Some(error) = inner.fail_next_rule_delete.take() {
            return Err(TestbedError::Api(error));
        }

        if inner.rules.remove(name).is_none() {
            return Err(TestbedError::Api(format!("isolation rule {name} not found")));
        }
        inner.deleted_rules.push(name.to_string());
        Ok(())
    }
}

#[async_trait]
impl PodExec for FakeCluster {
    async fn exec(&self, node: &Node, argv: &[String]) -> Result<String, TestbedError> {
        let mut inner = self.inner.lock().unwrap();

        if !inner.labels.contains_key(node.name()) {
            return Err(TestbedError::Api(format!("pod {} not found", node.name())));
        }

        // Check for forced failure
        if let Some(error) = inner.fail_next_exec.take() {
            return Err(TestbedError::ExecFailed {
                pod: node.name().to_string(),
                message: error,
            });
        }

        inner
            .exec_log
            .push((node.name().to_string(), argv.to_vec()));
        Ok(inner.exec_queue.pop_front().unwrap_or_default())
    }

    async fn spawn_detached(&self, node: &Node, command: &str) -> Result<(), TestbedError> {
        let mut inner = self.inner.lock().unwrap();

        if !inner.labels.contains_key(node.name()) {
            return Err(TestbedError::Api(format!("pod {} not found", node.name())));
        }

        // Check for forced failure
        if let Some(error) = inner.fail_next_exec.take() {
            return Err(TestbedError::ExecFailed {
                pod: node.name().to_string(),
                message: error,
            });
        }

        inner
            .spawned
            .push((node.name().to_string(), command.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::start_nodes;
    use crate::node::Role;
    use crate::spec::{ClusterSpec, RoleSpec};
    use std::time::Duration;

    fn node(name: &str, address: &str, role: &str, index: usize) -> Node {
        Node::new(name, address, Role::new(role), index)
    }

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    // ===========================================
    // Label Tests
    // ===========================================

    #[tokio::test]
    async fn fake_cluster_tracks_labels() {
        let cluster = FakeCluster::new();
        cluster.add_pod("pd-0");
        let n = node("pd-0", "10.0.0.1", "pd", 0);

        assert!(cluster.pod_labels(&n).await.unwrap().is_empty());

        cluster
            .set_pod_labels(&n, labels(&[("offline", "true")]))
            .await
            .unwrap();
        assert_eq!(cluster.labels_of("pd-0"), labels(&[("offline", "true")]));
    }

    #[tokio::test]
    async fn set_labels_replaces_the_whole_map() {
        let cluster = FakeCluster::new();
        cluster.add_pod("pd-0");
        let n = node("pd-0", "10.0.0.1", "pd", 0);

        cluster
            .set_pod_labels(&n, labels(&[("a", "1"), ("b", "2")]))
            .await
            .unwrap();
        cluster
            .set_pod_labels(&n, labels(&[("b", "2")]))
            .await
            .unwrap();

        assert_eq!(cluster.labels_of("pd-0"), labels(&[("b", "2")]));
    }

    #[tokio::test]
    async fn unknown_pod_is_an_error() {
        let cluster = FakeCluster::new();
        let n = node("ghost", "10.0.0.9", "pd", 0);

        assert!(cluster.pod_labels(&n).await.is_err());
        assert!(cluster.set_pod_labels(&n, labels(&[])).await.is_err());
        assert!(cluster.exec(&n, &["ls".to_string()]).await.is_err());
    }

    // ===========================================
    // Isolation Rule Tests
    // ===========================================

    #[tokio::test]
    async fn rules_create_and_delete_with_history() {
        let cluster = FakeCluster::new();
        let rule = IsolationRule::deny_all("np-0", labels(&[("offline", "true")]));

        cluster.create_isolation_rule(&rule).await.unwrap();
        assert_eq!(cluster.rule_names(), vec!["np-0"]);
        assert_eq!(cluster.rule("np-0"), Some(rule.clone()));

        cluster.delete_isolation_rule("np-0").await.unwrap();
        assert!(cluster.rule_names().is_empty());

        assert_eq!(cluster.created_rules(), vec![rule]);
        assert_eq!(cluster.deleted_rules(), vec!["np-0"]);
    }

    #[tokio::test]
    async fn duplicate_rule_create_fails() {
        let cluster = FakeCluster::new();
        let rule = IsolationRule::deny_all("np-0", labels(&[]));

        cluster.create_isolation_rule(&rule).await.unwrap();
        let result = cluster.create_isolation_rule(&rule).await;
        assert!(matches!(result, Err(TestbedError::Api(_))));
    }

    #[tokio::test]
    async fn missing_rule_delete_fails() {
        let cluster = FakeCluster::new();
        let result = cluster.delete_isolation_rule("np-ghost").await;
        assert!(matches!(result, Err(TestbedError::Api(_))));
    }

    // ===========================================
    // Exec Tests
    // ===========================================

    #[tokio::test]
    async fn exec_returns_queued_output_and_logs_calls() {
        let cluster = FakeCluster::new();
        cluster.add_pod("db-0");
        let n = node("db-0", "10.0.0.4", "db", 0);

        cluster.queue_exec_output("tidb_version: v7.1.0");
        let argv = vec!["mysql".to_string(), "-e".to_string()];
        let output = cluster.exec(&n, &argv).await.unwrap();

        assert_eq!(output, "tidb_version: v7.1.0");
        assert_eq!(cluster.exec_log(), vec![("db-0".to_string(), argv)]);
    }

    #[tokio::test]
    async fn exec_with_empty_queue_returns_empty_output() {
        let cluster = FakeCluster::new();
        cluster.add_pod("db-0");
        let n = node("db-0", "10.0.0.4", "db", 0);

        let output = cluster.exec(&n, &["true".to_string()]).await.unwrap();
        assert!(output.is_empty());
    }

    #[tokio::test]
    async fn spawn_records_detached_commands() {
        let cluster = FakeCluster::new();
        cluster.add_pod("kv-0");
        let n = node("kv-0", "10.0.0.2", "kv", 0);

        cluster.spawn_detached(&n, "tikv-server --addr ...").await.unwrap();
        assert_eq!(
            cluster.spawned_commands(),
            vec![("kv-0".to_string(), "tikv-server --addr ...".to_string())]
        );
    }

    // ===========================================
    // Error Condition Tests
    // ===========================================

    #[tokio::test]
    async fn forced_label_write_failure() {
        let cluster = FakeCluster::new();
        cluster.add_pod("pd-0");
        let n = node("pd-0", "10.0.0.1", "pd", 0);

        cluster.fail_next_label_write("conflict");
        let result = cluster.set_pod_labels(&n, labels(&[])).await;
        assert!(matches!(result, Err(TestbedError::Api(_))));

        // Next write should work
        cluster.set_pod_labels(&n, labels(&[("a", "1")])).await.unwrap();
    }

    #[tokio::test]
    async fn forced_rule_failures_recover() {
        let cluster = FakeCluster::new();
        let rule = IsolationRule::deny_all("np-0", labels(&[]));

        cluster.fail_next_rule_create("quota exceeded");
        assert!(cluster.create_isolation_rule(&rule).await.is_err());
        cluster.create_isolation_rule(&rule).await.unwrap();

        cluster.fail_next_rule_delete("server timeout");
        assert!(cluster.delete_isolation_rule("np-0").await.is_err());
        cluster.delete_isolation_rule("np-0").await.unwrap();
    }

    #[tokio::test]
    async fn forced_exec_failure() {
        let cluster = FakeCluster::new();
        cluster.add_pod("db-0");
        let n = node("db-0", "10.0.0.4", "db", 0);

        cluster.fail_next_exec("command not found");
        let result = cluster.exec(&n, &["mysql".to_string()]).await;
        assert!(matches!(result, Err(TestbedError::ExecFailed { .. })));

        // Next exec should work
        cluster.exec(&n, &["mysql".to_string()]).await.unwrap();
    }

    // ===========================================
    // Clone and Shared State Tests
    // ===========================================

    #[tokio::test]
    async fn fake_cluster_clone_shares_state() {
        let cluster1 = FakeCluster::new();
        let cluster2 = cluster1.clone();

        cluster1.add_pod("pd-0");
        let n = node("pd-0", "10.0.0.1", "pd", 0);

        cluster2
            .set_pod_labels(&n, labels(&[("seen", "yes")]))
            .await
            .unwrap();
        assert_eq!(cluster1.labels_of("pd-0"), labels(&[("seen", "yes")]));
    }

    #[tokio::test]
    async fn reset_clears_all() {
        let cluster = FakeCluster::new();
        cluster.add_pod("pd-0");
        cluster
            .create_isolation_rule(&IsolationRule::deny_all("np-0", labels(&[])))
            .await
            .unwrap();
        cluster.queue_exec_output("output");

        cluster.reset();

        assert!(cluster.labels_of("pd-0").is_empty());
        assert!(cluster.rule_names().is_empty());
        assert!(cluster.created_rules().is_empty());
    }

    // ===========================================
    // Node Launch Tests
    // ===========================================

    #[tokio::test]
    async fn start_nodes_launches_in_role_order() {
        let cluster = FakeCluster::new();
        let topology = Topology::from_nodes(vec![
            node("kv-0", "10.0.0.3", "kv", 0),
            node("pd-0", "10.0.0.1", "pd", 0),
            node("pd-1", "10.0.0.2", "pd", 1),
        ]);
        cluster.add_topology(&topology);

        let spec = ClusterSpec::new("mini")
            .with_role(RoleSpec::new(Role::new("pd"), 2, |node: &Node, _: &Topology| {
                format!("pd-server --name {}", node.name())
            }))
            .with_role(RoleSpec::new(Role::new("kv"), 1, |node: &Node, _: &Topology| {
                format!("kv-server --addr {}", node.address())
            }));

        start_nodes(&cluster, &spec, &topology, Duration::ZERO)
            .await
            .unwrap();

        let spawned = cluster.spawned_commands();
        assert_eq!(spawned.len(), 3);
        // Metadata nodes launch before storage nodes regardless of
        // topology iteration order.
        assert_eq!(spawned[0].0, "pd-0");
        assert_eq!(spawned[1].0, "pd-1");
        assert_eq!(spawned[2].0, "kv-0");
        assert_eq!(spawned[0].1, "pd-server --name pd-0");
        assert_eq!(spawned[2].1, "kv-server --addr 10.0.0.3");
    }

    #[tokio::test]
    async fn start_nodes_stops_on_first_failure() {
        let cluster = FakeCluster::new();
        let topology = Topology::from_nodes(vec![
            node("pd-0", "10.0.0.1", "pd", 0),
            node("pd-1", "10.0.0.2", "pd", 1),
        ]);
        cluster.add_topology(&topology);

        let spec = ClusterSpec::new("mini").with_role(RoleSpec::new(
            Role::new("pd"),
            2,
            |_: &Node, _: &Topology| "pd-server".to_string(),
        ));

        cluster.fail_next_exec("container not ready");
        let result = start_nodes(&cluster, &spec, &topology, Duration::ZERO).await;

        assert!(result.is_err());
        assert!(cluster.spawned_commands().is_empty());
    }
}
