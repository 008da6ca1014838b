//! TiDB cluster layout and per-role launch commands.
//!
//! Three roles: `pd` (placement drivers, the metadata quorum), `kv` (TiKV
//! storage) and `db` (the TiDB SQL head). Command assembly is pure so it
//! can be checked without a cluster; data dirs and log files are paths
//! relative to the launch session's working directory inside the pod.

use crate::node::{Node, Role, Topology};
use crate::spec::{ClusterSpec, RoleSpec};

/// Metadata quorum role tag.
pub const PD_ROLE: &str = "pd";
/// Storage role tag.
pub const KV_ROLE: &str = "kv";
/// SQL head role tag.
pub const DB_ROLE: &str = "db";

/// PD client port.
pub const CLIENT_PORT: u16 = 2379;
/// PD peer port.
pub const PEER_PORT: u16 = 2380;
/// TiKV service port.
pub const STORE_PORT: u16 = 20160;
/// TiKV status port.
pub const STATUS_PORT: u16 = 20180;
/// TiDB MySQL port.
pub const SQL_PORT: u16 = 4000;

/// The standard smoke topology: three PDs, three TiKVs, one TiDB.
///
/// Role order is the launch order; PD members must form their quorum
/// before TiKV stores can register, and TiDB needs both.
pub fn cluster_spec() -> ClusterSpec {
    ClusterSpec::new("tidb")
        .with_role(RoleSpec::new(Role::new(PD_ROLE), 3, pd_command))
        .with_role(RoleSpec::new(Role::new(KV_ROLE), 3, kv_command))
        .with_role(RoleSpec::new(Role::new(DB_ROLE), 1, db_command))
}

/// PD client endpoints for every PD node, comma-joined.
fn pd_endpoints(topology: &Topology) -> String {
    topology
        .nodes_with_role(&Role::new(PD_ROLE))
        .iter()
        .map(|pd| format!("{}:{}", pd.address(), CLIENT_PORT))
        .collect::<Vec<_>>()
        .join(",")
}

// PD member names are 1-based, matching --initial-cluster entries.
fn pd_command(node: &Node, topology: &Topology) -> String {
    let initial_cluster = topology
        .nodes_with_role(&Role::new(PD_ROLE))
        .iter()
        .map(|pd| format!("pd{}=http://{}:{}", pd.index() + 1, pd.address(), PEER_PORT))
        .collect::<Vec<_>>()
        .join(",");
    let mut cmd = format!(
        "pd-server --name=pd{} --data-dir=pd --client-urls=http://{ip}:{} --peer-urls=http://{ip}:{} --log-file=pd.log",
        node.index() + 1,
        CLIENT_PORT,
        PEER_PORT,
        ip = node.address(),
    );
    cmd.push_str(&format!(" --initial-cluster=\"{initial_cluster}\" -L \"info\""));
    cmd
}

fn kv_command(node: &Node, topology: &Topology) -> String {
    format!(
        "tikv-server --pd=\"{}\" --addr=\"{ip}:{}\" --status-addr=\"{ip}:{}\" --data-dir=tikv{} --log-file=tikv.log",
        pd_endpoints(topology),
        STORE_PORT,
        STATUS_PORT,
        node.index(),
        ip = node.address(),
    )
}

fn db_command(_node: &Node, topology: &Topology) -> String {
    format!(
        "tidb-server --store=tikv --path=\"{}\" --log-file=tidb.log",
        pd_endpoints(topology)
    )
}
