//! # trestle-chaos
//!
//! Randomized fault injection for a cluster under test.
//!
//! Faults are [`ChaosOperator`]s, reversible state machines that inject
//! one failure mode and undo it again:
//! - [`NodeOffline`] - cuts one random node of a role off the network
//! - [`NetworkPartition`] - splits the whole cluster into two regions
//!
//! Operators hang off a shared [`ChaosManager`], which either flips them
//! on a randomized background schedule ([`ChaosConfig`]) or hands control
//! to the foreground scenario through the [`ChaosUp`] and [`ChaosDown`]
//! steps. Every activation registers its own reversal with the test run's
//! cleanup stack, so faults never outlive the run.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod actions;
mod error;
mod manager;
mod names;
mod offline;
mod operator;
mod partition;

pub use actions::{ChaosDown, ChaosUp};
pub use error::ChaosError;
pub use manager::{ChaosConfig, ChaosManager};
pub use names::NameSource;
pub use offline::NodeOffline;
pub use operator::ChaosOperator;
pub use partition::NetworkPartition;
