//! # trestle-testbed
//!
//! Kubernetes testbed for a distributed SQL cluster under test.
//!
//! This crate provides the plumbing the chaos harness drives:
//! - [`Node`], [`Role`], [`Topology`] - the provisioned-cluster registry
//! - [`ClusterControl`], [`PodExec`] - the orchestration seams, implemented
//!   by [`KubeCluster`] (live) and [`FakeCluster`] (in-memory, for tests)
//! - [`ClusterSpec`], [`RoleSpec`], [`tidb`] - role layout and per-node
//!   launch commands
//! - [`CleanupStack`] - reverse-order teardown of registered side effects
//! - [`TestAction`], [`Scenario`] - the foreground step runner
//! - [`ClusterConfig`] - TOML configuration

#![warn(missing_docs)]
#![warn(clippy::all)]

mod action;
mod cleanup;
mod cluster;
mod config;
mod error;
mod fake;
mod node;
mod spec;

pub mod logging;
pub mod tidb;

pub use action::{Scenario, SleepAction, SqlProbe, TestAction, TestContext};
pub use cleanup::{CleanupStack, CleanupToken};
pub use cluster::{start_nodes, ClusterControl, IsolationRule, KubeCluster, PodExec};
pub use config::{ClusterConfig, ConfigError};
pub use error::TestbedError;
pub use fake::FakeCluster;
pub use node::{Node, Role, Topology};
pub use spec::{ClusterSpec, LaunchCommand, RoleSpec};
