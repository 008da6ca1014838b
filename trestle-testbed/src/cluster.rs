//! Cluster control: the narrow orchestration surface the harness drives.
//!
//! Two seams cover everything the harness does to a live cluster: label
//! and isolation-rule management ([`ClusterControl`], what fault injection
//! needs) and in-pod command execution ([`PodExec`], what provisioning and
//! probes need). [`KubeCluster`] implements both against a real Kubernetes
//! namespace; [`FakeCluster`](crate::FakeCluster) implements both in memory
//! for tests.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{Container, Pod, PodSpec, PodTemplateSpec};
use k8s_openapi::api::networking::v1::{
    IPBlock, NetworkPolicy, NetworkPolicyEgressRule, NetworkPolicyIngressRule, NetworkPolicyPeer,
    NetworkPolicySpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::api::{Api, AttachParams, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::Value;
use tokio::io::AsyncReadExt;
use uuid::Uuid;

use crate::cleanup::CleanupStack;
use crate::config::ClusterConfig;
use crate::error::TestbedError;
use crate::node::{Node, Topology};
use crate::spec::ClusterSpec;

// ============================================================================
// Isolation rules
// ============================================================================

/// In-process model of one network isolation rule.
///
/// `allow: None` is a deny-all rule: selected pods lose all ingress and
/// egress. `allow: Some(addrs)` permits traffic only from and to the given
/// peer addresses, installed as host-exact (`/32`) address blocks in both
/// directions. Both policy types are always set so an empty direction
/// means "deny", never "unrestricted".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsolationRule {
    /// Rule object name, unique per activation.
    pub name: String,
    /// Pod label selector the rule applies to.
    pub selector: BTreeMap<String, String>,
    /// Peer addresses allowed in and out; `None` denies everything.
    pub allow: Option<Vec<String>>,
}

impl IsolationRule {
    /// Deny-all rule for pods matching `selector`.
    pub fn deny_all(name: impl Into<String>, selector: BTreeMap<String, String>) -> Self {
        Self {
            name: name.into(),
            selector,
            allow: None,
        }
    }

    /// Rule allowing traffic only from/to `addresses`.
    pub fn allow_only(
        name: impl Into<String>,
        selector: BTreeMap<String, String>,
        addresses: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            selector,
            allow: Some(addresses),
        }
    }

    fn as_network_policy(&self) -> NetworkPolicy {
        let peers = |addresses: &[String]| -> Vec<NetworkPolicyPeer> {
            addresses
                .iter()
                .map(|addr| NetworkPolicyPeer {
                    ip_block: Some(IPBlock {
                        cidr: format!("{addr}/32"),
                        except: None,
                    }),
                    ..Default::default()
                })
                .collect()
        };

        NetworkPolicy {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                ..Default::default()
            },
            spec: Some(NetworkPolicySpec {
                pod_selector: LabelSelector {
                    match_labels: Some(self.selector.clone()),
                    ..Default::default()
                },
                policy_types: Some(vec!["Ingress".to_string(), "Egress".to_string()]),
                ingress: self.allow.as_ref().map(|addrs| {
                    vec![NetworkPolicyIngressRule {
                        from: Some(peers(addrs)),
                        ..Default::default()
                    }]
                }),
                egress: self.allow.as_ref().map(|addrs| {
                    vec![NetworkPolicyEgressRule {
                        to: Some(peers(addrs)),
                        ..Default::default()
                    }]
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

// ============================================================================
// Traits
// ============================================================================

/// Label and isolation-rule operations against the cluster under test.
///
/// The narrow surface fault injection needs: read/replace a pod's label
/// map, and create/delete isolation rules keyed by name.
#[async_trait]
pub trait ClusterControl: Send + Sync {
    /// Current labels of the node's pod.
    async fn pod_labels(&self, node: &Node) -> Result<BTreeMap<String, String>, TestbedError>;

    /// Replace the node's label map.
    ///
    /// Read-modify-write, last write wins; keys present upstream but
    /// missing from `labels` are removed.
    async fn set_pod_labels(
        &self,
        node: &Node,
        labels: BTreeMap<String, String>,
    ) -> Result<(), TestbedError>;

    /// Create an isolation rule. A duplicate name is an error.
    async fn create_isolation_rule(&self, rule: &IsolationRule) -> Result<(), TestbedError>;

    /// Delete an isolation rule by name. An unknown name is an error.
    async fn delete_isolation_rule(&self, name: &str) -> Result<(), TestbedError>;
}

/// Remote command execution inside cluster pods.
#[async_trait]
pub trait PodExec: Send + Sync {
    /// Run a command in the node's pod and capture its output.
    async fn exec(&self, node: &Node, argv: &[String]) -> Result<String, TestbedError>;

    /// Start a long-running command in the node's pod, detached from the
    /// exec session (the command outlives the connection).
    async fn spawn_detached(&self, node: &Node, command: &str) -> Result<(), TestbedError>;
}

/// Launch every node's server process in spec order.
///
/// Sleeps `stagger` between launches when nonzero; the first role in the
/// spec (typically the metadata quorum) is fully launched before the next
/// role starts.
pub async fn start_nodes(
    exec: &dyn PodExec,
    spec: &ClusterSpec,
    topology: &Topology,
    stagger: Duration,
) -> Result<(), TestbedError> {
    for role_spec in spec.roles() {
        for node in topology.nodes_with_role(role_spec.role()) {
            let command = role_spec.launch_command(node, topology);
            tracing::info!("Starting {} process on {}", role_spec.role(), node.name());
            tracing::debug!("Launch command: {}", command);
            exec.spawn_detached(node, &command).await?;
            if !stagger.is_zero() {
                tokio::time::sleep(stagger).await;
            }
        }
    }
    Ok(())
}

// ============================================================================
// KubeCluster
// ============================================================================

/// Kubernetes-backed implementation of the cluster seams.
///
/// Owns a [`kube::Client`] scoped to one namespace and adds deployment
/// provisioning with readiness polling on top of the two traits.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    config: ClusterConfig,
}

impl KubeCluster {
    /// Connect using the ambient kubeconfig (in-cluster or `~/.kube/config`).
    pub async fn connect(config: ClusterConfig) -> Result<Self, TestbedError> {
        let client = Client::try_default().await?;
        Ok(Self::new(client, config))
    }

    /// Wrap an existing client.
    pub fn new(client: Client, config: ClusterConfig) -> Self {
        Self { client, config }
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.config.namespace)
    }

    fn deployments(&self) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), &self.config.namespace)
    }

    fn policies(&self) -> Api<NetworkPolicy> {
        Api::namespaced(self.client.clone(), &self.config.namespace)
    }

    /// Provision the cluster described by `spec` and wait for readiness.
    ///
    /// Creates one deployment of idle pods (the node processes are
    /// launched separately, see [`start_nodes`]), registers its deletion
    /// on the cleanup stack, then polls until every pod is Running with
    /// an IP. Pods are assigned to roles in spec order, sorted by name,
    /// so indices are stable across runs against the same deployment.
    pub async fn provision(
        &self,
        spec: &ClusterSpec,
        cleanups: &CleanupStack,
    ) -> Result<Topology, TestbedError> {
        let run_tag = Uuid::new_v4().as_simple().to_string();
        let name = format!("{}-{}", spec.name(), &run_tag[..8]);
        let expected = spec.total_count();

        let deployment = build_deployment(&name, expected as i32, &self.config.image);
        self.deployments()
            .create(&PostParams::default(), &deployment)
            .await?;
        tracing::info!("Created deployment {} ({} pods)", name, expected);

        // Registered before the readiness wait: a cluster that never comes
        // up still gets torn down.
        let deployments = self.deployments();
        let delete_name = name.clone();
        cleanups
            .register(format!("delete deployment {name}"), move || async move {
                let _ = deployments
                    .delete(&delete_name, &DeleteParams::default())
                    .await?;
                Ok(())
            })
            .await;

        let mut pods = self.wait_ready(&name, expected).await?;
        pods.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));

        let mut remaining = pods.into_iter();
        let mut nodes = Vec::with_capacity(expected);
        for role_spec in spec.roles() {
            for index in 0..role_spec.count() {
                let pod = remaining.next().ok_or(TestbedError::MissingPods {
                    expected,
                    found: nodes.len(),
                })?;
                let pod_name = pod
                    .metadata
                    .name
                    .clone()
                    .ok_or_else(|| TestbedError::Api("pod without a name".to_string()))?;
                let address = pod
                    .status
                    .as_ref()
                    .and_then(|s| s.pod_ip.clone())
                    .ok_or_else(|| TestbedError::MissingPodIp {
                        pod: pod_name.clone(),
                    })?;
                nodes.push(Node::new(pod_name, address, role_spec.role().clone(), index));
            }
        }

        let topology = Topology::from_nodes(nodes);
        tracing::info!(
            "Topology ready: {} nodes across {} roles",
            topology.node_count(),
            topology.nodes_by_role().len()
        );
        Ok(topology)
    }

    /// Poll the pod listing once per second until all `expected` pods are
    /// Running with an IP, failing hard after the configured budget.
    async fn wait_ready(&self, deployment: &str, expected: usize) -> Result<Vec<Pod>, TestbedError> {
        let pods_api = self.pods();
        let params = ListParams::default().labels(&format!("app={deployment}"));
        let budget = self.config.startup_timeout_secs;

        let mut last_seen = Vec::new();
        for _ in 0..budget {
            last_seen = pods_api.list(&params).await?.items;
            if pods_ready(&last_seen, expected) {
                return Ok(last_seen);
            }
            tracing::debug!(
                "Waiting for {} ({}/{} pods running)",
                deployment,
                running_count(&last_seen),
                expected
            );
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        Err(TestbedError::PodsNotReady {
            waited_secs: budget,
            phases: phase_summary(&last_seen),
        })
    }
}

#[async_trait]
impl ClusterControl for KubeCluster {
    async fn pod_labels(&self, node: &Node) -> Result<BTreeMap<String, String>, TestbedError> {
        let pod = self.pods().get(node.name()).await?;
        Ok(pod.metadata.labels.unwrap_or_default())
    }

    async fn set_pod_labels(
        &self,
        node: &Node,
        labels: BTreeMap<String, String>,
    ) -> Result<(), TestbedError> {
        let pods = self.pods();
        let current = pods.get(node.name()).await?.metadata.labels.unwrap_or_default();

        // Merge patch keeps keys it does not mention, so removed keys
        // must be nulled explicitly.
        let mut patch = serde_json::Map::new();
        for key in current.keys() {
            if !labels.contains_key(key) {
                patch.insert(key.clone(), Value::Null);
            }
        }
        for (key, value) in &labels {
            patch.insert(key.clone(), Value::String(value.clone()));
        }

        let body = serde_json::json!({ "metadata": { "labels": Value::Object(patch) } });
        pods.patch(node.name(), &PatchParams::default(), &Patch::Merge(&body))
            .await?;
        Ok(())
    }

    async fn create_isolation_rule(&self, rule: &IsolationRule) -> Result<(), TestbedError> {
        self.policies()
            .create(&PostParams::default(), &rule.as_network_policy())
            .await?;
        Ok(())
    }

    async fn delete_isolation_rule(&self, name: &str) -> Result<(), TestbedError> {
        let _ = self.policies().delete(name, &DeleteParams::default()).await?;
        Ok(())
    }
}

#[async_trait]
impl PodExec for KubeCluster {
    async fn exec(&self, node: &Node, argv: &[String]) -> Result<String, TestbedError> {
        let params = AttachParams::default().stdout(true).stderr(true);
        let mut attached = self.pods().exec(node.name(), argv.to_vec(), &params).await?;

        let mut stdout = attached.stdout().ok_or_else(|| TestbedError::ExecStream {
            pod: node.name().to_string(),
        })?;
        let mut stderr = attached.stderr().ok_or_else(|| TestbedError::ExecStream {
            pod: node.name().to_string(),
        })?;
        let status = attached.take_status();

        let mut out = Vec::new();
        let mut err = Vec::new();
        let (out_read, err_read) =
            tokio::join!(stdout.read_to_end(&mut out), stderr.read_to_end(&mut err));
        out_read?;
        err_read?;

        if let Some(status) = status {
            if let Some(status) = status.await {
                if status.status.as_deref() == Some("Failure") {
                    return Err(TestbedError::ExecFailed {
                        pod: node.name().to_string(),
                        message: status
                            .message
                            .unwrap_or_else(|| "unknown failure".to_string()),
                    });
                }
            }
        }
        let _ = attached.join().await;

        out.extend_from_slice(&err);
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    async fn spawn_detached(&self, node: &Node, command: &str) -> Result<(), TestbedError> {
        let argv = vec![
            "tmux".to_string(),
            "new-session".to_string(),
            "-d".to_string(),
            command.to_string(),
        ];
        self.exec(node, &argv).await?;
        Ok(())
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn build_deployment(name: &str, replicas: i32, image: &str) -> Deployment {
    let labels = BTreeMap::from([("app".to_string(), name.to_string())]);
    Deployment {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(replicas),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "node".to_string(),
                        image: Some(image.to_string()),
                        command: Some(vec![
                            "/bin/bash".to_string(),
                            "-c".to_string(),
                            "--".to_string(),
                        ]),
                        args: Some(vec!["sleep infinity".to_string()]),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn pods_ready(pods: &[Pod], expected: usize) -> bool {
    pods.len() == expected && pods.iter().all(pod_running)
}

fn pod_running(pod: &Pod) -> bool {
    let status = pod.status.as_ref();
    status.and_then(|s| s.phase.as_deref()) == Some("Running")
        && status.and_then(|s| s.pod_ip.as_deref()).is_some()
}

fn running_count(pods: &[Pod]) -> usize {
    pods.iter().filter(|p| pod_running(p)).count()
}

fn phase_summary(pods: &[Pod]) -> String {
    if pods.is_empty() {
        return "no pods".to_string();
    }
    pods.iter()
        .map(|pod| {
            let name = pod.metadata.name.as_deref().unwrap_or("?");
            let phase = pod
                .status
                .as_ref()
                .and_then(|s| s.phase.as_deref())
                .unwrap_or("Unknown");
            format!("{name}={phase}")
        })
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::PodStatus;

    fn make_pod(name: &str, phase: &str, ip: Option<&str>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                pod_ip: ip.map(str::to_string),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn selector(key: &str, value: &str) -> BTreeMap<String, String> {
        BTreeMap::from([(key.to_string(), value.to_string())])
    }

    #[test]
    fn deny_all_rule_has_no_allow_sections() {
        let rule = IsolationRule::deny_all("np-deny-0", selector("offline", "true"));
        let policy = rule.as_network_policy();

        assert_eq!(policy.metadata.name.as_deref(), Some("np-deny-0"));
        let spec = policy.spec.expect("spec");
        assert_eq!(
            spec.policy_types,
            Some(vec!["Ingress".to_string(), "Egress".to_string()])
        );
        assert!(spec.ingress.is_none());
        assert!(spec.egress.is_none());
        assert_eq!(
            spec.pod_selector.match_labels,
            Some(selector("offline", "true"))
        );
    }

    #[test]
    fn allow_rule_uses_host_exact_blocks() {
        let rule = IsolationRule::allow_only(
            "np-region-0",
            selector("region", "region-0"),
            vec!["10.0.0.7".to_string(), "10.0.0.9".to_string()],
        );
        let spec = rule.as_network_policy().spec.expect("spec");

        let ingress = spec.ingress.expect("ingress");
        assert_eq!(ingress.len(), 1);
        let froms = ingress[0].from.as_ref().expect("from peers");
        let cidrs: Vec<_> = froms
            .iter()
            .map(|p| p.ip_block.as_ref().expect("ip block").cidr.clone())
            .collect();
        assert_eq!(cidrs, vec!["10.0.0.7/32", "10.0.0.9/32"]);

        let egress = spec.egress.expect("egress");
        let tos = egress[0].to.as_ref().expect("to peers");
        assert_eq!(tos.len(), 2);
    }

    #[test]
    fn deployment_shape() {
        let deployment = build_deployment("trestle-abc", 7, "registry/img:v1");
        let spec = deployment.spec.expect("spec");
        assert_eq!(spec.replicas, Some(7));
        assert_eq!(
            spec.selector.match_labels,
            Some(selector("app", "trestle-abc"))
        );
        let pod_spec = spec.template.spec.expect("pod spec");
        assert_eq!(pod_spec.containers.len(), 1);
        assert_eq!(pod_spec.containers[0].image.as_deref(), Some("registry/img:v1"));
        assert_eq!(
            pod_spec.containers[0].args,
            Some(vec!["sleep infinity".to_string()])
        );
    }

    #[test]
    fn readiness_requires_all_running_with_ips() {
        let ready = vec![
            make_pod("a", "Running", Some("10.0.0.1")),
            make_pod("b", "Running", Some("10.0.0.2")),
        ];
        assert!(pods_ready(&ready, 2));
        assert!(!pods_ready(&ready, 3));

        let pending = vec![
            make_pod("a", "Running", Some("10.0.0.1")),
            make_pod("b", "Pending", None),
        ];
        assert!(!pods_ready(&pending, 2));
        assert_eq!(running_count(&pending), 1);

        let no_ip = vec![make_pod("a", "Running", None)];
        assert!(!pods_ready(&no_ip, 1));
    }

    #[test]
    fn phase_summary_names_every_pod() {
        let pods = vec![
            make_pod("a", "Running", Some("10.0.0.1")),
            make_pod("b", "Pending", None),
        ];
        assert_eq!(phase_summary(&pods), "a=Running, b=Pending");
        assert_eq!(phase_summary(&[]), "no pods");
    }
}
