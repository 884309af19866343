//! Error types for the fault-injection harness.

use crate::NodeId;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while managing nodes, talking to them, or running scenarios.
#[derive(Debug, Error)]
pub enum Error {
    /// The node's fixed port is already bound by another process
    #[error("port {0} is already in use")]
    PortInUse(u16),

    /// The node process could not be spawned or never became responsive
    #[error("failed to start node {node}: {reason}")]
    ProcessStart { node: NodeId, reason: String },

    /// The node process survived both graceful and forced termination
    #[error("node {0} survived forced termination")]
    ProcessStopEscalation(NodeId),

    /// The node's RPC endpoint could not be reached
    #[error("connection to {endpoint} failed: {reason}")]
    ConnectionFailure { endpoint: String, reason: String },

    /// The registry contract could not be deployed or authorized
    #[error("deployment failed: {0}")]
    DeploymentFailure(String),

    /// A submitted transaction was not confirmed in time
    #[error("transaction {hash} not confirmed within {timeout:?}")]
    TransactionTimeout { hash: String, timeout: Duration },

    /// A transaction was rejected at submission
    #[error("transaction submission failed: {0}")]
    TransactionSubmission(String),

    /// Running nodes did not report equal chain heights in time
    #[error("nodes did not converge within {0:?}")]
    SyncTimeout(Duration),

    /// A node failed while answering consistency probes
    #[error("consistency probe failed on node {node}: {reason}")]
    ConsistencyProbe { node: NodeId, reason: String },

    /// Fewer nodes are running than a scenario requires
    #[error("insufficient active nodes: need {required}, have {running}")]
    InsufficientActiveNodes { required: usize, running: usize },

    /// A contract call or transaction was reverted by the ledger
    #[error("reverted: {0}")]
    Reverted(String),

    /// The node id is not managed by the registry
    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    /// The node must be running for the requested operation
    #[error("node {0} is not running")]
    NodeNotRunning(NodeId),

    /// The ledger returned a response that could not be interpreted
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// The run was interrupted before every scenario completed
    #[error("interrupted")]
    Interrupted,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("invalid identity: {0}")]
    InvalidIdentity(String),
    #[error("invalid artifact: {0}")]
    InvalidArtifact(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}
