//! Declarative description of the cluster to provision.

use std::fmt;

use crate::node::{Node, Role, Topology};

/// Builds the launch command line for one node, given the full topology.
pub type LaunchCommand = Box<dyn Fn(&Node, &Topology) -> String + Send + Sync>;

/// How many nodes of one role to provision, and how to start each one.
pub struct RoleSpec {
    role: Role,
    count: usize,
    launch: LaunchCommand,
}

impl RoleSpec {
    /// Create a role spec.
    pub fn new(
        role: Role,
        count: usize,
        launch: impl Fn(&Node, &Topology) -> String + Send + Sync + 'static,
    ) -> Self {
        Self {
            role,
            count,
            launch: Box::new(launch),
        }
    }

    /// The role this spec provisions.
    pub fn role(&self) -> &Role {
        &self.role
    }

    /// Node count for this role.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Build the launch command for one provisioned node.
    pub fn launch_command(&self, node: &Node, topology: &Topology) -> String {
        (self.launch)(node, topology)
    }
}

impl fmt::Debug for RoleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoleSpec")
            .field("role", &self.role)
            .field("count", &self.count)
            .finish()
    }
}

/// Full description of the cluster to provision: which roles, how many
/// nodes of each, and how each node's server process is launched.
///
/// Role order matters: pods are assigned to roles in spec order, and
/// node processes start in spec order (a metadata quorum has to be up
/// before storage nodes can register with it).
#[derive(Debug)]
pub struct ClusterSpec {
    name: String,
    roles: Vec<RoleSpec>,
}

impl ClusterSpec {
    /// Create an empty spec with a deployment name prefix.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            roles: Vec::new(),
        }
    }

    /// Append a role.
    pub fn with_role(mut self, role: RoleSpec) -> Self {
        self.roles.push(role);
        self
    }

    /// Deployment name prefix.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Role specs in provisioning order.
    pub fn roles(&self) -> &[RoleSpec] {
        &self.roles
    }

    /// Total node count across all roles.
    pub fn total_count(&self) -> usize {
        self.roles.iter().map(RoleSpec::count).sum()
    }
}
