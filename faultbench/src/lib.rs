//! Inject node faults into a ledger-backed credential registry and measure recovery.
//!
//! A suite runs a sequence of [scenario::Scenario]s against a cluster of independently
//! running ledger nodes. For each scenario, the [runner::Runner] keeps a random subset of
//! nodes running, stops the rest, drives transactions against the survivors, restarts the
//! stopped nodes, waits for chain heights to converge, and checks that every running node
//! reports the same state for a fixed probe set. One [scenario::Outcome] is recorded per
//! completed scenario and persisted as a CSV dataset at the end of the run.
//!
//! # Components
//!
//! - [registry::Registry] owns node processes and decides whether a node is running.
//! - [connector::Connector] deploys and authorizes a registry contract on each running node.
//! - [runner::Runner] drives the per-scenario state machine.
//! - [verifier] compares probe results across nodes.
//! - [recorder::Recorder] accumulates and persists outcomes.
//!
//! The ledger itself is an opaque collaborator reached through [rpc::Dialer] and [rpc::Client].

pub mod config;
pub mod connector;
mod error;
pub use error::Error;
pub mod recorder;
pub mod registry;
pub mod retry;
pub mod rpc;
pub mod runner;
pub mod scenario;
pub mod verifier;

#[cfg(test)]
pub mod mocks;

/// Identifier of a managed node.
pub type NodeId = usize;

/// Returns the version of the crate.
pub const fn crate_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
