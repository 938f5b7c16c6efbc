#![warn(missing_docs)]

//! replstack management subsystem: cluster description loading and the `rstack` operator CLI

pub mod cli;
pub mod cluster;
pub mod report;

pub use cli::{Cli, Command};
pub use cluster::ClusterSpec;
pub use report::{ComposeOutput, ReconcileOutput, SnapshotOutput};
