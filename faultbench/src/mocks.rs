//! In-memory cluster of ledger nodes for tests.
//!
//! A [Cluster] is both the [Launcher] and the [Dialer] handed to a [Registry]. Every node shares
//! one chain height (a replicated ledger), while deployed contracts live in the memory of the
//! node's current process and are lost whenever the node is relaunched.

use crate::{
    registry::{self, Launcher, Process, Registry},
    retry::Backoff,
    rpc::{self, Address, B256},
    Error, NodeId,
};
use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    io,
    net::Ipv4Addr,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::time::{sleep, Instant};

/// Port of node 0.
pub const BASE_PORT: u16 = 9545;

/// Time a launched node has to become responsive.
pub const START_TIMEOUT: Duration = Duration::from_secs(5);

/// Time a node has to exit after graceful termination.
pub const GRACE_PERIOD: Duration = Duration::from_secs(3);

/// Time a node has to exit after forced termination.
pub const KILL_TIMEOUT: Duration = Duration::from_secs(2);

/// Maximum time for a single liveness query.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// How often a mock process checks whether it has exited.
const EXIT_CHECK: Duration = Duration::from_millis(10);

/// Registry configuration with short timings for `nodes` nodes.
pub fn registry_config(nodes: usize) -> registry::Config {
    registry::Config {
        nodes,
        base_port: BASE_PORT,
        host: Ipv4Addr::LOCALHOST,
        start_timeout: START_TIMEOUT,
        start_backoff: Backoff::exponential(Duration::from_millis(100), Duration::from_secs(1)),
        probe_timeout: PROBE_TIMEOUT,
        grace_period: GRACE_PERIOD,
        kill_timeout: KILL_TIMEOUT,
    }
}

/// Registry managing every node of `cluster`.
pub fn registry(cluster: &Cluster) -> Registry<Cluster, Cluster> {
    Registry::new(
        registry_config(cluster.len()),
        cluster.clone(),
        cluster.clone(),
    )
    .expect("valid registry config")
}

/// A registry contract deployed on one node.
#[derive(Default)]
struct Contract {
    owner: Address,
    issuers: BTreeSet<Address>,
    records: BTreeMap<B256, u64>,
}

/// Simulated state of one node.
#[derive(Default)]
struct Node {
    // Process
    alive: bool,
    incarnation: u64,
    responsive: bool,
    ignores_sigterm: bool,
    unkillable: bool,
    launched_at: Option<Instant>,
    exited_at: Option<Instant>,

    // Ledger
    contracts: BTreeMap<Address, Contract>,
    lag: u64,
    catch_up_at: Option<Instant>,
    overrides: BTreeMap<B256, u64>,

    // Failure injection
    fail_deploy: bool,
    stall_issue: bool,
    reject_issue: bool,
    fail_probes: bool,

    // Counters
    spawns: usize,
    terminates: usize,
    kills: usize,
    deploys: usize,
    issued: usize,
}

impl Node {
    fn exit(&mut self) {
        if self.alive {
            self.alive = false;
            self.exited_at = Some(Instant::now());
        }
    }
}

struct State {
    nodes: Vec<Node>,
    occupied: HashSet<u16>,
    height: u64,
    next_contract: u64,
}

/// A simulated cluster of ledger nodes.
#[derive(Clone)]
pub struct Cluster {
    state: Arc<Mutex<State>>,
}

impl Cluster {
    /// Create a cluster of `nodes` stopped, responsive nodes.
    pub fn new(nodes: usize) -> Self {
        let nodes = (0..nodes)
            .map(|_| Node {
                responsive: true,
                ..Default::default()
            })
            .collect();
        Self {
            state: Arc::new(Mutex::new(State {
                nodes,
                occupied: HashSet::new(),
                height: 0,
                next_contract: 0,
            })),
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().nodes.len()
    }

    fn with<T>(&self, id: NodeId, f: impl FnOnce(&mut Node) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        f(&mut state.nodes[id])
    }

    pub fn spawns(&self, id: NodeId) -> usize {
        self.with(id, |node| node.spawns)
    }

    pub fn terminates(&self, id: NodeId) -> usize {
        self.with(id, |node| node.terminates)
    }

    pub fn kills(&self, id: NodeId) -> usize {
        self.with(id, |node| node.kills)
    }

    pub fn deploys(&self, id: NodeId) -> usize {
        self.with(id, |node| node.deploys)
    }

    pub fn issued(&self, id: NodeId) -> usize {
        self.with(id, |node| node.issued)
    }

    pub fn alive(&self, id: NodeId) -> bool {
        self.with(id, |node| node.alive)
    }

    /// When the node's latest process was launched.
    pub fn launched_at(&self, id: NodeId) -> Option<Instant> {
        self.with(id, |node| node.launched_at)
    }

    /// When the node's process last exited.
    pub fn exited_at(&self, id: NodeId) -> Option<Instant> {
        self.with(id, |node| node.exited_at)
    }

    /// Shared chain height.
    pub fn height(&self) -> u64 {
        self.state.lock().unwrap().height
    }

    /// Bind `port` to a foreign process.
    pub fn occupy_port(&self, port: u16) {
        self.state.lock().unwrap().occupied.insert(port);
    }

    pub fn set_responsive(&self, id: NodeId, responsive: bool) {
        self.with(id, |node| node.responsive = responsive);
    }

    pub fn set_ignores_sigterm(&self, id: NodeId, ignores: bool) {
        self.with(id, |node| node.ignores_sigterm = ignores);
    }

    pub fn set_unkillable(&self, id: NodeId, unkillable: bool) {
        self.with(id, |node| node.unkillable = unkillable);
    }

    /// Make the node's process exit on its own.
    pub fn crash(&self, id: NodeId) {
        self.with(id, Node::exit);
    }

    /// Report a height `blocks` behind the chain, until `catch_up` elapses (or forever).
    pub fn set_lag(&self, id: NodeId, blocks: u64, catch_up: Option<Duration>) {
        self.with(id, |node| {
            node.lag = blocks;
            node.catch_up_at = catch_up.map(|after| Instant::now() + after);
        });
    }

    /// Answer `status(record)` with `status` regardless of what was issued.
    pub fn set_status(&self, id: NodeId, record: B256, status: u64) {
        self.with(id, |node| {
            node.overrides.insert(record, status);
        });
    }

    pub fn set_fail_deploy(&self, id: NodeId, fail: bool) {
        self.with(id, |node| node.fail_deploy = fail);
    }

    /// Never confirm issued records.
    pub fn set_stall_issue(&self, id: NodeId, stall: bool) {
        self.with(id, |node| node.stall_issue = stall);
    }

    /// Reject issued records at submission.
    pub fn set_reject_issue(&self, id: NodeId, reject: bool) {
        self.with(id, |node| node.reject_issue = reject);
    }

    /// Fail every status query with a transport error.
    pub fn set_fail_probes(&self, id: NodeId, fail: bool) {
        self.with(id, |node| node.fail_probes = fail);
    }
}

impl Launcher for Cluster {
    type Process = MockProcess;

    async fn launch(&self, id: NodeId, port: u16) -> Result<MockProcess, Error> {
        let mut state = self.state.lock().unwrap();
        if state.occupied.contains(&port) {
            return Err(Error::PortInUse(port));
        }
        let node = &mut state.nodes[id];
        node.alive = true;
        node.launched_at = Some(Instant::now());
        node.incarnation += 1;
        node.spawns += 1;
        node.contracts.clear();
        Ok(MockProcess {
            cluster: self.clone(),
            id,
            incarnation: node.incarnation,
        })
    }
}

/// Handle to a simulated node process.
pub struct MockProcess {
    cluster: Cluster,
    id: NodeId,
    incarnation: u64,
}

impl MockProcess {
    fn current(&self, node: &Node) -> bool {
        node.incarnation == self.incarnation
    }
}

impl Process for MockProcess {
    fn is_alive(&mut self) -> bool {
        self.cluster
            .with(self.id, |node| node.alive && node.incarnation == self.incarnation)
    }

    fn terminate(&mut self) -> io::Result<()> {
        let incarnation = self.incarnation;
        self.cluster.with(self.id, |node| {
            node.terminates += 1;
            if node.incarnation == incarnation && !node.ignores_sigterm {
                node.exit();
            }
        });
        Ok(())
    }

    fn kill(&mut self) -> io::Result<()> {
        let incarnation = self.incarnation;
        self.cluster.with(self.id, |node| {
            node.kills += 1;
            if node.incarnation == incarnation && !node.unkillable {
                node.exit();
            }
        });
        Ok(())
    }

    async fn exited(&mut self) {
        loop {
            let exited = self
                .cluster
                .with(self.id, |node| !node.alive || !self.current(node));
            if exited {
                return;
            }
            sleep(EXIT_CHECK).await;
        }
    }
}

impl rpc::Dialer for Cluster {
    type Client = MockClient;

    fn dial(&self, endpoint: &str) -> MockClient {
        let id = endpoint
            .rsplit(':')
            .next()
            .and_then(|port| port.parse::<u16>().ok())
            .and_then(|port| port.checked_sub(BASE_PORT))
            .map(NodeId::from)
            .filter(|id| *id < self.len());
        MockClient {
            cluster: self.clone(),
            endpoint: endpoint.to_string(),
            id,
        }
    }
}

/// Client bound to one simulated node.
#[derive(Clone)]
pub struct MockClient {
    cluster: Cluster,
    endpoint: String,
    id: Option<NodeId>,
}

impl MockClient {
    fn unreachable(&self) -> Error {
        Error::ConnectionFailure {
            endpoint: self.endpoint.clone(),
            reason: "connection refused".into(),
        }
    }

    /// Run `f` against the node if it is reachable.
    fn with<T>(
        &self,
        f: impl FnOnce(&mut State, NodeId) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let id = self.id.ok_or_else(|| self.unreachable())?;
        let mut state = self.cluster.state.lock().unwrap();
        let node = &state.nodes[id];
        if !node.alive || !node.responsive {
            return Err(self.unreachable());
        }
        f(&mut *state, id)
    }
}

impl rpc::Client for MockClient {
    async fn block_number(&self) -> Result<u64, Error> {
        self.with(|state, id| {
            let height = state.height;
            let node = &mut state.nodes[id];
            if node.catch_up_at.is_some_and(|at| Instant::now() >= at) {
                node.lag = 0;
                node.catch_up_at = None;
            }
            Ok(height.saturating_sub(node.lag))
        })
    }

    async fn deploy(&self, from: &Address) -> Result<Address, Error> {
        self.with(|state, id| {
            if state.nodes[id].fail_deploy {
                return Err(Error::DeploymentFailure("out of gas".into()));
            }
            state.next_contract += 1;
            state.height += 1;
            let mut address = Address::ZERO;
            address[0] = 0xc0;
            address[12..].copy_from_slice(&state.next_contract.to_be_bytes());
            let node = &mut state.nodes[id];
            node.deploys += 1;
            node.contracts.insert(
                address,
                Contract {
                    owner: *from,
                    ..Default::default()
                },
            );
            Ok(address)
        })
    }

    async fn authorize(
        &self,
        contract: &Address,
        from: &Address,
        issuer: &Address,
    ) -> Result<(), Error> {
        self.with(|state, id| {
            let contract = state.nodes[id]
                .contracts
                .get_mut(contract)
                .ok_or_else(|| Error::DeploymentFailure("unknown contract".into()))?;
            if contract.owner != *from {
                return Err(Error::DeploymentFailure("caller is not the owner".into()));
            }
            contract.issuers.insert(*issuer);
            state.height += 1;
            Ok(())
        })
    }

    async fn issue(
        &self,
        contract: &Address,
        from: &Address,
        record: &B256,
        confirmation: Duration,
    ) -> Result<(), Error> {
        let stall = self.with(|state, id| {
            let node = &mut state.nodes[id];
            if node.reject_issue {
                return Err(Error::TransactionSubmission("nonce too low".into()));
            }
            let contract = node
                .contracts
                .get_mut(contract)
                .ok_or_else(|| Error::TransactionSubmission("unknown contract".into()))?;
            if !contract.issuers.contains(from) {
                return Err(Error::TransactionSubmission("issuer not authorized".into()));
            }
            if node.stall_issue {
                return Ok(true);
            }
            contract.records.insert(*record, 1);
            node.issued += 1;
            state.height += 1;
            Ok(false)
        })?;
        if stall {
            sleep(confirmation).await;
            return Err(Error::TransactionTimeout {
                hash: record.to_string(),
                timeout: confirmation,
            });
        }
        Ok(())
    }

    async fn status(&self, contract: &Address, record: &B256) -> Result<u64, Error> {
        let unreachable = self.unreachable();
        self.with(|state, id| {
            let node = &state.nodes[id];
            if node.fail_probes {
                return Err(unreachable);
            }
            if let Some(status) = node.overrides.get(record) {
                return Ok(*status);
            }
            node.contracts
                .get(contract)
                .and_then(|contract| contract.records.get(record))
                .copied()
                .ok_or_else(|| Error::Reverted("certificate does not exist".into()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{Client as _, Dialer as _};

    #[tokio::test]
    async fn test_contracts_lost_on_relaunch() {
        let cluster = Cluster::new(1);
        let mut process = cluster.launch(0, BASE_PORT).await.unwrap();
        let client = cluster.dial("http://127.0.0.1:9545");
        let owner = Address::repeat_byte(1);
        let contract = client.deploy(&owner).await.unwrap();
        client.authorize(&contract, &owner, &owner).await.unwrap();
        let record = rpc::hash("record");
        client
            .issue(&contract, &owner, &record, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(client.status(&contract, &record).await.unwrap(), 1);
        assert_eq!(client.block_number().await.unwrap(), 3);

        process.terminate().unwrap();
        assert!(matches!(
            client.block_number().await,
            Err(Error::ConnectionFailure { .. })
        ));

        let _process = cluster.launch(0, BASE_PORT).await.unwrap();
        assert!(matches!(
            client.status(&contract, &record).await,
            Err(Error::Reverted(_))
        ));
        assert_eq!(client.block_number().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_stale_handle_does_not_affect_relaunch() {
        let cluster = Cluster::new(1);
        let mut stale = cluster.launch(0, BASE_PORT).await.unwrap();
        let mut fresh = cluster.launch(0, BASE_PORT).await.unwrap();
        assert!(!stale.is_alive());
        stale.kill().unwrap();
        assert!(fresh.is_alive());
    }

    #[test]
    fn test_dial_unknown_endpoint() {
        let cluster = Cluster::new(2);
        assert!(cluster.dial("http://127.0.0.1:9546").id.is_some());
        assert!(cluster.dial("http://127.0.0.1:9547").id.is_none());
        assert!(cluster.dial("http://127.0.0.1:80").id.is_none());
    }
}
