//! Node registry: roles, nodes, and the provisioned topology.
//!
//! A [`Topology`] is built once when the cluster is provisioned and is
//! read-only afterwards: fault injection reads membership but never adds
//! or removes nodes.

use std::collections::BTreeMap;
use std::fmt;

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

/// Role tag for a cluster node, e.g. `pd`, `kv`, `db`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Role(String);

impl Role {
    /// Create a role from its tag.
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    /// The role tag as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Role {
    fn from(tag: &str) -> Self {
        Self::new(tag)
    }
}

/// One running instance of a cluster role.
///
/// Identity is fixed at provisioning time: the pod name, the pod IP and
/// the role never change for the lifetime of the topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    name: String,
    address: String,
    role: Role,
    index: usize,
}

impl Node {
    /// Create a node record.
    pub fn new(
        name: impl Into<String>,
        address: impl Into<String>,
        role: Role,
        index: usize,
    ) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            role,
            index,
        }
    }

    /// Stable pod name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Pod IP address.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// The node's role.
    pub fn role(&self) -> &Role {
        &self.role
    }

    /// Position of this node among the nodes of its role, zero-based.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Whether this node belongs to the given role.
    pub fn is_role(&self, role: &Role) -> bool {
        &self.role == role
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// All provisioned nodes for one test run, grouped by role.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    nodes: BTreeMap<Role, Vec<Node>>,
}

impl Topology {
    /// Build a topology from a flat node list, grouping by role.
    ///
    /// Within each role, nodes keep the order they were provided in.
    pub fn from_nodes(nodes: impl IntoIterator<Item = Node>) -> Self {
        let mut grouped: BTreeMap<Role, Vec<Node>> = BTreeMap::new();
        for node in nodes {
            grouped.entry(node.role().clone()).or_default().push(node);
        }
        Self { nodes: grouped }
    }

    /// Mapping from role to the ordered nodes of that role.
    pub fn nodes_by_role(&self) -> &BTreeMap<Role, Vec<Node>> {
        &self.nodes
    }

    /// Nodes of one role; empty for roles the topology does not contain.
    pub fn nodes_with_role(&self, role: &Role) -> &[Node] {
        self.nodes.get(role).map(Vec::as_slice).unwrap_or_default()
    }

    /// Iterator over every node of every role.
    pub fn all_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values().flatten()
    }

    /// Total node count across all roles.
    pub fn node_count(&self) -> usize {
        self.nodes.values().map(Vec::len).sum()
    }

    /// True when no nodes are provisioned.
    pub fn is_empty(&self) -> bool {
        self.node_count() == 0
    }

    /// Pick one node of the role uniformly at random.
    pub fn pick_random(&self, role: &Role) -> Option<&Node> {
        self.nodes_with_role(role).choose(&mut rand::thread_rng())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_topology() -> Topology {
        Topology::from_nodes(vec![
            Node::new("pd-0", "10.0.0.1", Role::new("pd"), 0),
            Node::new("pd-1", "10.0.0.2", Role::new("pd"), 1),
            Node::new("kv-0", "10.0.0.3", Role::new("kv"), 0),
        ])
    }

    #[test]
    fn role_display_and_eq() {
        let role = Role::new("pd");
        assert_eq!(role.to_string(), "pd");
        assert_eq!(role, Role::from("pd"));
        assert_ne!(role, Role::new("kv"));
    }

    #[test]
    fn node_role_membership() {
        let node = Node::new("pd-0", "10.0.0.1", Role::new("pd"), 0);
        assert!(node.is_role(&Role::new("pd")));
        assert!(!node.is_role(&Role::new("kv")));
        assert_eq!(node.index(), 0);
        assert_eq!(node.to_string(), "pd-0");
    }

    #[test]
    fn topology_groups_by_role() {
        let topo = sample_topology();
        assert_eq!(topo.node_count(), 3);
        assert_eq!(topo.nodes_with_role(&Role::new("pd")).len(), 2);
        assert_eq!(topo.nodes_with_role(&Role::new("kv")).len(), 1);
        assert_eq!(topo.nodes_by_role().len(), 2);
    }

    #[test]
    fn unknown_role_yields_empty_slice() {
        let topo = sample_topology();
        assert!(topo.nodes_with_role(&Role::new("db")).is_empty());
        assert!(topo.pick_random(&Role::new("db")).is_none());
    }

    #[test]
    fn pick_random_stays_within_role() {
        let topo = sample_topology();
        let pd = Role::new("pd");
        for _ in 0..32 {
            let node = topo.pick_random(&pd).expect("pd nodes exist");
            assert!(node.is_role(&pd));
        }
    }

    #[test]
    fn empty_topology() {
        let topo = Topology::default();
        assert!(topo.is_empty());
        assert_eq!(topo.all_nodes().count(), 0);
    }
}
