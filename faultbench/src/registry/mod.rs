//! Own the lifecycle of every managed ledger node.
//!
//! The [Registry] is the only component that starts or stops node processes and the single
//! source of truth for whether a node is running: a node is running iff its process is alive
//! and it answers a liveness query within [Config::probe_timeout].
//!
//! Individual start and stop failures are logged and reported as `false`; they are never
//! fatal to the caller. Dropping the registry kills any process it still owns.

use crate::{
    retry::{poll, Backoff},
    rpc::{Client as _, Dialer},
    Error, NodeId,
};
use std::{net::Ipv4Addr, time::Duration};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

pub mod process;
pub use process::{Launcher, Process};

/// Lifecycle state of a node, as last observed by the [Registry].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    /// No process is running
    Stopped,

    /// A process was launched and has not yet answered a liveness query
    Starting,

    /// The process is alive and answers liveness queries
    Running,

    /// The process is alive but does not answer liveness queries
    Unresponsive,
}

/// Configuration for the [Registry].
#[derive(Clone, Debug)]
pub struct Config {
    /// Number of managed nodes (ids `0..nodes`)
    pub nodes: usize,

    /// Node `id` listens on `base_port + id`
    pub base_port: u16,

    /// Host every node listens on
    pub host: Ipv4Addr,

    /// Maximum time to wait for a launched node to answer a liveness query
    pub start_timeout: Duration,

    /// Schedule for liveness queries while a node starts
    pub start_backoff: Backoff,

    /// Maximum time for a single liveness query
    pub probe_timeout: Duration,

    /// Time a node is given to exit after graceful termination
    pub grace_period: Duration,

    /// Time a node is given to exit after forced termination
    pub kill_timeout: Duration,
}

/// A managed node.
struct Node<P> {
    id: NodeId,
    port: u16,
    endpoint: String,
    status: Status,
    generation: u64,
    process: Option<P>,
}

/// Owns the set of managed nodes.
pub struct Registry<L: Launcher, D: Dialer> {
    cfg: Config,
    launcher: L,
    dialer: D,
    nodes: Vec<Node<L::Process>>,
}

impl<L: Launcher, D: Dialer> Registry<L, D> {
    /// Create a registry managing `cfg.nodes` stopped nodes.
    pub fn new(cfg: Config, launcher: L, dialer: D) -> Result<Self, Error> {
        let nodes = (0..cfg.nodes)
            .map(|id| {
                let port = u16::try_from(id)
                    .ok()
                    .and_then(|offset| cfg.base_port.checked_add(offset))
                    .ok_or_else(|| {
                        Error::InvalidConfig(format!(
                            "port for node {id} exceeds {} (base port {})",
                            u16::MAX,
                            cfg.base_port
                        ))
                    })?;
                Ok(Node {
                    id,
                    port,
                    endpoint: format!("http://{}:{port}", cfg.host),
                    status: Status::Stopped,
                    generation: 0,
                    process: None,
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;
        Ok(Self {
            cfg,
            launcher,
            dialer,
            nodes,
        })
    }

    /// Returns the ids of all managed nodes.
    pub fn ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|node| node.id).collect()
    }

    /// Returns the number of managed nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if no nodes are managed.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns the RPC endpoint of `id`.
    pub fn endpoint(&self, id: NodeId) -> Option<&str> {
        self.nodes.get(id).map(|node| node.endpoint.as_str())
    }

    /// Returns the port of `id`.
    pub fn port(&self, id: NodeId) -> Option<u16> {
        self.nodes.get(id).map(|node| node.port)
    }

    /// Returns the last observed status of `id` (without probing).
    pub fn status(&self, id: NodeId) -> Option<Status> {
        self.nodes.get(id).map(|node| node.status)
    }

    /// Returns how many times `id` has been launched.
    ///
    /// A fresh process is assumed to start with an empty application state, so anything bound
    /// to an earlier generation must be recreated.
    pub fn generation(&self, id: NodeId) -> Option<u64> {
        self.nodes.get(id).map(|node| node.generation)
    }

    /// Returns the dialer used for liveness queries.
    pub fn dialer(&self) -> &D {
        &self.dialer
    }

    /// Run a single liveness query against `endpoint`.
    async fn probe(dialer: &D, limit: Duration, endpoint: &str) -> bool {
        let client = dialer.dial(endpoint);
        matches!(timeout(limit, client.block_number()).await, Ok(Ok(_)))
    }

    /// Returns true if the process of `id` is alive and answers a liveness query.
    pub async fn is_running(&mut self, id: NodeId) -> bool {
        let Some(node) = self.nodes.get_mut(id) else {
            return false;
        };
        let Some(process) = node.process.as_mut() else {
            node.status = Status::Stopped;
            return false;
        };
        if !process.is_alive() {
            if node.status != Status::Stopped {
                warn!(node = id, "node process exited");
            }
            node.process = None;
            node.status = Status::Stopped;
            return false;
        }
        let running = Self::probe(&self.dialer, self.cfg.probe_timeout, &node.endpoint).await;
        node.status = if running {
            Status::Running
        } else {
            Status::Unresponsive
        };
        running
    }

    /// Returns the ids of all nodes that are currently running.
    pub async fn running_nodes(&mut self) -> Vec<NodeId> {
        let mut running = Vec::new();
        for id in self.ids() {
            if self.is_running(id).await {
                running.push(id);
            }
        }
        running
    }

    /// Start `id`, waiting until it answers a liveness query.
    ///
    /// Succeeds without launching anything if the node is already running.
    pub async fn start(&mut self, id: NodeId) -> bool {
        match self.try_start(id).await {
            Ok(()) => true,
            Err(e) => {
                error!(node = id, error = %e, "failed to start node");
                false
            }
        }
    }

    async fn try_start(&mut self, id: NodeId) -> Result<(), Error> {
        if id >= self.nodes.len() {
            return Err(Error::UnknownNode(id));
        }
        if self.is_running(id).await {
            debug!(node = id, "node already running");
            return Ok(());
        }

        // Release a process that is alive but unresponsive before relaunching
        if self.nodes[id].process.is_some() {
            warn!(node = id, "releasing unresponsive node before restart");
            self.try_stop(id).await?;
        }

        let node = &mut self.nodes[id];
        info!(node = id, port = node.port, "starting node");
        node.status = Status::Starting;
        let process = match self.launcher.launch(id, node.port).await {
            Ok(process) => process,
            Err(e) => {
                node.status = Status::Stopped;
                return Err(e);
            }
        };
        node.process = Some(process);
        node.generation += 1;

        let endpoint = node.endpoint.clone();
        let endpoint = endpoint.as_str();
        let dialer = &self.dialer;
        let probe_timeout = self.cfg.probe_timeout;
        let ready = poll(self.cfg.start_timeout, self.cfg.start_backoff, move || async move {
            Self::probe(dialer, probe_timeout, endpoint)
                .await
                .then_some(())
        })
        .await
        .is_some();

        let node = &mut self.nodes[id];
        if ready {
            node.status = Status::Running;
            info!(node = id, endpoint = %node.endpoint, generation = node.generation, "node started");
            return Ok(());
        }

        // Keep the handle so a slow node can still be observed (or stopped) later
        let alive = node.process.as_mut().is_some_and(|process| process.is_alive());
        node.status = if alive {
            Status::Unresponsive
        } else {
            node.process = None;
            Status::Stopped
        };
        Err(Error::ProcessStart {
            node: id,
            reason: if alive {
                format!("not responsive within {:?}", self.cfg.start_timeout)
            } else {
                "process exited during startup".into()
            },
        })
    }

    /// Stop `id`, escalating from graceful to forced termination.
    ///
    /// Succeeds without signalling anything if the node is already stopped. Reports success
    /// only once the process is confirmed dead.
    pub async fn stop(&mut self, id: NodeId) -> bool {
        match self.try_stop(id).await {
            Ok(()) => true,
            Err(e) => {
                error!(node = id, error = %e, "failed to stop node");
                false
            }
        }
    }

    async fn try_stop(&mut self, id: NodeId) -> Result<(), Error> {
        let grace_period = self.cfg.grace_period;
        let kill_timeout = self.cfg.kill_timeout;
        let node = self.nodes.get_mut(id).ok_or(Error::UnknownNode(id))?;
        let Some(process) = node.process.as_mut() else {
            node.status = Status::Stopped;
            return Ok(());
        };
        if !process.is_alive() {
            node.process = None;
            node.status = Status::Stopped;
            return Ok(());
        }

        info!(node = id, "stopping node");
        if let Err(e) = process.terminate() {
            warn!(node = id, error = %e, "failed to signal node");
        }
        if timeout(grace_period, process.exited()).await.is_err() {
            warn!(node = id, ?grace_period, "node ignored graceful termination, killing");
            if let Err(e) = process.kill() {
                warn!(node = id, error = %e, "failed to kill node");
            }
            if timeout(kill_timeout, process.exited()).await.is_err() {
                node.status = Status::Unresponsive;
                return Err(Error::ProcessStopEscalation(id));
            }
        }

        node.process = None;
        node.status = Status::Stopped;
        info!(node = id, "node stopped");
        Ok(())
    }

    /// Start every managed node, returning the ids that are running afterwards.
    pub async fn start_all(&mut self) -> Vec<NodeId> {
        let mut started = Vec::new();
        for id in self.ids() {
            if self.start(id).await {
                started.push(id);
            }
        }
        started
    }

    /// Stop every managed node, returning the ids confirmed stopped.
    pub async fn stop_all(&mut self) -> Vec<NodeId> {
        let mut stopped = Vec::new();
        for id in self.ids() {
            if self.stop(id).await {
                stopped.push(id);
            }
        }
        stopped
    }
}
