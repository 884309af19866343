//! Scenario inputs, outcomes, and fault selection.

use crate::{Error, NodeId};
use rand::{seq::SliceRandom, Rng};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, time::Duration};

/// Default length of a fault window, in seconds.
pub const DEFAULT_FAULT_DURATION: u64 = 30;

/// Default number of transactions attempted per scenario.
pub const DEFAULT_TRANSACTIONS: usize = 50;

/// A fault scenario to run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scenario {
    /// Unique name of the scenario
    pub name: String,

    /// Number of nodes kept running during the fault window
    pub active_nodes: usize,

    /// Minimum length of the fault window, in seconds
    #[serde(default = "default_fault_duration")]
    pub fault_duration: u64,

    /// Number of transactions attempted during the fault window
    #[serde(default = "default_transactions")]
    pub transactions: usize,
}

fn default_fault_duration() -> u64 {
    DEFAULT_FAULT_DURATION
}

fn default_transactions() -> usize {
    DEFAULT_TRANSACTIONS
}

impl Scenario {
    pub fn new(name: &str, active_nodes: usize) -> Self {
        Self {
            name: name.to_string(),
            active_nodes,
            fault_duration: DEFAULT_FAULT_DURATION,
            transactions: DEFAULT_TRANSACTIONS,
        }
    }

    /// Returns the minimum length of the fault window.
    pub fn fault_window(&self) -> Duration {
        Duration::from_secs(self.fault_duration)
    }
}

/// The suite run when no scenarios are configured: progressively fewer survivors out of four.
pub fn default_scenarios() -> Vec<Scenario> {
    vec![
        Scenario::new("Normal Operation", 4),
        Scenario::new("Single Node Failure", 3),
        Scenario::new("Double Node Failure", 2),
        Scenario::new("Extreme Failure", 1),
    ]
}

/// Phases of a single scenario run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Setup,
    Steady,
    FaultInjected,
    Recovering,
    Verified,
    Done,
}

/// Result of one completed scenario (one row of the persisted dataset).
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Outcome {
    pub scenario: String,
    pub active_nodes: usize,
    pub total_nodes: usize,
    /// Seconds
    pub fault_duration: u64,
    /// Fraction of attempted transactions that succeeded
    pub availability: f64,
    pub successful_txs: usize,
    pub failed_txs: usize,
    /// Seconds from the start of restarts until convergence (or giving up)
    pub recovery_time: f64,
    pub sync_complete: bool,
    pub data_consistent: bool,
}

/// Partition of the managed nodes for one scenario.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Selection {
    /// Nodes left running during the fault window
    pub kept: Vec<NodeId>,

    /// Nodes stopped during the fault window
    pub faulty: Vec<NodeId>,
}

/// Uniformly choose `keep` distinct running nodes to keep; every other node is faulty.
///
/// Returns [Error::InsufficientActiveNodes] if fewer than `keep` nodes are running.
pub fn select<R: Rng>(
    rng: &mut R,
    all: &[NodeId],
    running: &[NodeId],
    keep: usize,
) -> Result<Selection, Error> {
    if running.len() < keep {
        return Err(Error::InsufficientActiveNodes {
            required: keep,
            running: running.len(),
        });
    }
    let kept: BTreeSet<NodeId> = running.choose_multiple(rng, keep).copied().collect();
    let faulty = all.iter().copied().filter(|id| !kept.contains(id)).collect();
    Ok(Selection {
        kept: kept.into_iter().collect(),
        faulty,
    })
}
