//! Drive fault scenarios against a managed cluster.
//!
//! Each scenario walks through the [Phase]s in order:
//!
//! 1. [Phase::Setup]: start any stopped node and choose which connected nodes to keep.
//! 2. [Phase::Steady]: log the chain height of every running node.
//! 3. [Phase::FaultInjected]: stop every other node, then issue transactions against random
//!    kept nodes, holding the fault for at least the scenario's fault window.
//! 4. [Phase::Recovering]: restart the stopped nodes, reconnect them, and wait for every connected
//!    node to report the same chain height.
//! 5. [Phase::Verified]: compare the probe set across every connected running node.
//! 6. [Phase::Done]: record the [Outcome].
//!
//! A scenario that cannot keep enough nodes running is skipped without a result.

use crate::{
    connector::{Connection, Connector},
    recorder::Recorder,
    registry::{Launcher, Registry},
    retry::{poll, Backoff},
    rpc::{self, Address, Client, Dialer},
    scenario::{self, Outcome, Phase, Scenario},
    verifier, Error, NodeId,
};
use futures::future::join_all;
use rand::Rng;
use std::time::Duration;
use tokio::{
    sync::Mutex,
    time::{sleep, Instant},
};
use tracing::{debug, info, warn};

/// Timing of a scenario run.
#[derive(Clone, Debug)]
pub struct Config {
    /// Delay after every transaction
    pub tx_delay: Duration,

    /// Maximum time to wait for a transaction to be confirmed
    pub confirmation_timeout: Duration,

    /// Delay between restarting nodes and polling their heights
    pub settle_delay: Duration,

    /// Interval between height polls
    pub sync_interval: Duration,

    /// Maximum time to wait for heights to converge
    pub sync_timeout: Duration,

    /// Delay between consecutive scenarios
    pub cooldown: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tx_delay: Duration::from_millis(500),
            confirmation_timeout: Duration::from_secs(10),
            settle_delay: Duration::from_secs(10),
            sync_interval: Duration::from_secs(5),
            sync_timeout: Duration::from_secs(60),
            cooldown: Duration::from_secs(10),
        }
    }
}

/// Runs scenarios against the nodes of a [Registry].
pub struct Runner<L: Launcher, D: Dialer, R: Rng> {
    cfg: Config,
    registry: Registry<L, D>,
    connector: Connector<D>,
    recorder: Recorder,
    rng: R,
}

impl<L: Launcher, D: Dialer, R: Rng + Send> Runner<L, D, R> {
    /// Create a runner that transacts as `identity` and draws every random choice from `rng`.
    pub fn new(cfg: Config, registry: Registry<L, D>, identity: Address, rng: R) -> Self {
        Self {
            cfg,
            registry,
            connector: Connector::new(identity),
            recorder: Recorder::new(),
            rng,
        }
    }

    pub fn registry(&self) -> &Registry<L, D> {
        &self.registry
    }

    pub fn connector(&self) -> &Connector<D> {
        &self.connector
    }

    pub fn recorder(&self) -> &Recorder {
        &self.recorder
    }

    /// Start and connect every node.
    ///
    /// Returns [Error::InsufficientActiveNodes] if no node could be started and connected.
    pub async fn setup(&mut self) -> Result<Vec<NodeId>, Error> {
        let started = self.registry.start_all().await;
        let connected = self
            .connector
            .connect_all(&mut self.registry, &started)
            .await;
        info!(
            total = self.registry.len(),
            started = started.len(),
            connected = connected.len(),
            "cluster ready"
        );
        if connected.is_empty() {
            return Err(Error::InsufficientActiveNodes {
                required: 1,
                running: 0,
            });
        }
        Ok(connected)
    }

    /// Set up the cluster and run every scenario in order, pausing between them.
    ///
    /// Skipped scenarios do not stop the suite. Outcomes are available from
    /// [Runner::recorder] and are not persisted here.
    pub async fn run_suite(&mut self, scenarios: &[Scenario]) -> Result<(), Error> {
        self.setup().await?;
        for (i, scenario) in scenarios.iter().enumerate() {
            if i > 0 {
                debug!(cooldown = ?self.cfg.cooldown, "cooling down");
                sleep(self.cfg.cooldown).await;
            }
            if let Err(e) = self.run_scenario(scenario).await {
                warn!(scenario = %scenario.name, error = %e, "scenario skipped");
            }
        }
        Ok(())
    }

    /// Stop every node and forget every connection, returning the ids confirmed stopped.
    pub async fn shutdown(&mut self) -> Vec<NodeId> {
        for id in self.registry.ids() {
            self.connector.disconnect(id);
        }
        let stopped = self.registry.stop_all().await;
        if stopped.len() != self.registry.len() {
            warn!(
                stopped = stopped.len(),
                total = self.registry.len(),
                "some nodes could not be stopped"
            );
        }
        stopped
    }

    fn enter(scenario: &Scenario, phase: Phase) {
        info!(scenario = %scenario.name, ?phase, "entering phase");
    }

    /// Run one scenario and record its outcome.
    ///
    /// Returns [Error::InsufficientActiveNodes] (recording nothing and stopping nothing) if
    /// fewer than the requested number of nodes are running and connected.
    pub async fn run_scenario(&mut self, scenario: &Scenario) -> Result<Outcome, Error> {
        Self::enter(scenario, Phase::Setup);
        let all = self.registry.ids();
        for id in &all {
            if !self.registry.is_running(*id).await {
                self.registry.start(*id).await;
            }
        }
        let running = self.registry.running_nodes().await;
        for id in &running {
            if self.connector.live(&self.registry, *id).is_none() {
                let _ = self.connector.connect(&mut self.registry, *id).await;
            }
        }

        // Nodes without a contract take no part in the scenario
        let connected: Vec<NodeId> = running
            .iter()
            .copied()
            .filter(|id| self.connector.live(&self.registry, *id).is_some())
            .collect();
        let selection =
            scenario::select(&mut self.rng, &all, &connected, scenario.active_nodes)?;
        info!(
            scenario = %scenario.name,
            kept = ?selection.kept,
            faulty = ?selection.faulty,
            "selected fault set"
        );

        Self::enter(scenario, Phase::Steady);
        for (id, height) in self.heights(&running).await {
            match height {
                Ok(height) => info!(node = id, height, "height before fault"),
                Err(e) => warn!(node = id, error = %e, "failed to read height before fault"),
            }
        }

        Self::enter(scenario, Phase::FaultInjected);
        for id in &selection.faulty {
            self.connector.disconnect(*id);
            self.registry.stop(*id).await;
        }
        let window = Instant::now();
        let (successful, failed) = self.load(scenario, &selection.kept).await;
        let elapsed = window.elapsed();
        if let Some(remaining) = scenario.fault_window().checked_sub(elapsed) {
            debug!(scenario = %scenario.name, ?remaining, "holding fault window");
            sleep(remaining).await;
        }

        Self::enter(scenario, Phase::Recovering);
        let recovery = Instant::now();
        for id in &selection.faulty {
            self.registry.start(*id).await;
        }
        for id in self.registry.running_nodes().await {
            if self.connector.live(&self.registry, id).is_none() {
                let _ = self.connector.connect(&mut self.registry, id).await;
            }
        }
        sleep(self.cfg.settle_delay).await;
        let sync_complete = match self.wait_for_sync().await {
            Ok(height) => {
                info!(scenario = %scenario.name, height, "nodes converged");
                true
            }
            Err(e) => {
                warn!(scenario = %scenario.name, error = %e, "nodes did not converge");
                false
            }
        };
        let recovery_time = recovery.elapsed().as_secs_f64();

        Self::enter(scenario, Phase::Verified);
        let running = self.registry.running_nodes().await;
        let nodes: Vec<(NodeId, &Connection<D::Client>)> = running
            .iter()
            .filter_map(|id| {
                self.connector
                    .live(&self.registry, *id)
                    .map(|connection| (*id, connection))
            })
            .collect();
        let data_consistent = verifier::verify(&nodes).await;

        Self::enter(scenario, Phase::Done);
        let outcome = Outcome {
            scenario: scenario.name.clone(),
            active_nodes: scenario.active_nodes,
            total_nodes: all.len(),
            fault_duration: scenario.fault_duration,
            availability: availability(successful, scenario.transactions),
            successful_txs: successful,
            failed_txs: failed,
            recovery_time,
            sync_complete,
            data_consistent,
        };
        self.recorder.record(outcome.clone());
        Ok(outcome)
    }

    /// Issue `scenario.transactions` records against random nodes of `kept`, returning the
    /// number of successful and failed transactions.
    async fn load(&mut self, scenario: &Scenario, kept: &[NodeId]) -> (usize, usize) {
        let mut successful = 0;
        let mut failed = 0;
        for i in 0..scenario.transactions {
            let target = if kept.is_empty() {
                None
            } else {
                Some(kept[self.rng.gen_range(0..kept.len())])
            };
            let token: u32 = self.rng.gen();
            let key = format!("certificate-fault-test-{}-{i}-{token:08x}", scenario.name);

            let result = match target {
                None => Err("no nodes kept".to_string()),
                Some(id) => match self.connector.live(&self.registry, id) {
                    None => Err(format!("no live connection to node {id}")),
                    Some(connection) => connection
                        .client
                        .issue(
                            &connection.contract,
                            self.connector.identity(),
                            &rpc::hash(&key),
                            self.cfg.confirmation_timeout,
                        )
                        .await
                        .map_err(|e| e.to_string()),
                },
            };
            match result {
                Ok(()) => {
                    successful += 1;
                    debug!(scenario = %scenario.name, node = ?target, tx = i, "transaction confirmed");
                }
                Err(reason) => {
                    failed += 1;
                    warn!(scenario = %scenario.name, node = ?target, tx = i, %reason, "transaction failed");
                }
            }
            sleep(self.cfg.tx_delay).await;
        }
        info!(scenario = %scenario.name, successful, failed, "load finished");
        (successful, failed)
    }

    /// Read the chain height of every node in `ids`.
    async fn heights(&self, ids: &[NodeId]) -> Vec<(NodeId, Result<u64, Error>)> {
        let clients: Vec<(NodeId, D::Client)> = ids
            .iter()
            .filter_map(|id| {
                let endpoint = self.registry.endpoint(*id)?;
                Some((*id, self.registry.dialer().dial(endpoint)))
            })
            .collect();
        join_all(
            clients
                .iter()
                .map(|(id, client)| async move { (*id, client.block_number().await) }),
        )
        .await
    }

    /// Poll the running, connected nodes until every one that answers reports the same height.
    ///
    /// The nodes are looked up again on every attempt. A node whose height cannot be read is
    /// left out of that attempt's comparison.
    async fn wait_for_sync(&mut self) -> Result<u64, Error> {
        let limit = self.cfg.sync_timeout;
        let backoff = Backoff::fixed(self.cfg.sync_interval);
        let registry = &Mutex::new(&mut self.registry);
        let connector = &self.connector;
        poll(limit, backoff, move || async move {
            let clients: Vec<(NodeId, D::Client)> = {
                let mut registry = registry.lock().await;
                let running = registry.running_nodes().await;
                running
                    .into_iter()
                    .filter_map(|id| {
                        let connection = connector.live(&**registry, id)?;
                        Some((id, connection.client.clone()))
                    })
                    .collect()
            };
            let heights: Vec<(NodeId, u64)> = join_all(
                clients
                    .iter()
                    .map(|(id, client)| async move { (*id, client.block_number().await) }),
            )
            .await
            .into_iter()
            .filter_map(|(id, height)| match height {
                Ok(height) => Some((id, height)),
                Err(e) => {
                    debug!(node = id, error = %e, "skipping node without height");
                    None
                }
            })
            .collect();
            debug!(?heights, "polled heights");
            let (_, first) = *heights.first()?;
            heights
                .iter()
                .all(|(_, height)| *height == first)
                .then_some(first)
        })
        .await
        .ok_or(Error::SyncTimeout(limit))
    }
}

/// Fraction of `transactions` that succeeded (zero if none were attempted).
fn availability(successful: usize, transactions: usize) -> f64 {
    if transactions == 0 {
        return 0.0;
    }
    successful as f64 / transactions as f64
}
