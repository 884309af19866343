//! YAML configuration of a fault-injection run.

use crate::{
    registry::{self, process},
    retry::Backoff,
    rpc::jsonrpc,
    runner,
    scenario::{default_scenarios, Scenario},
    Error,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    fs::File,
    net::Ipv4Addr,
    path::{Path, PathBuf},
    time::Duration,
};

/// Default port of node 0.
pub const DEFAULT_BASE_PORT: u16 = 8545;

/// Default number of managed nodes.
pub const DEFAULT_NODES: usize = 4;

fn default_nodes() -> usize {
    DEFAULT_NODES
}

fn default_base_port() -> u16 {
    DEFAULT_BASE_PORT
}

fn default_host() -> Ipv4Addr {
    Ipv4Addr::LOCALHOST
}

fn default_command() -> Vec<String> {
    ["npx", "hardhat", "node", "--hostname", "{host}", "--port", "{port}"]
        .iter()
        .map(|arg| arg.to_string())
        .collect()
}

fn default_workdir() -> PathBuf {
    PathBuf::from(".")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_output() -> PathBuf {
    PathBuf::from("results/fault_tolerance.csv")
}

/// Timeouts and delays, in milliseconds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timing {
    pub start_timeout: u64,
    pub probe_timeout: u64,
    pub grace_period: u64,
    pub kill_timeout: u64,
    pub request_timeout: u64,
    pub deployment_timeout: u64,
    pub tx_delay: u64,
    pub confirmation_timeout: u64,
    pub settle_delay: u64,
    pub sync_interval: u64,
    pub sync_timeout: u64,
    pub cooldown: u64,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            start_timeout: 60_000,
            probe_timeout: 2_000,
            grace_period: 5_000,
            kill_timeout: 5_000,
            request_timeout: 10_000,
            deployment_timeout: 30_000,
            tx_delay: 500,
            confirmation_timeout: 10_000,
            settle_delay: 10_000,
            sync_interval: 5_000,
            sync_timeout: 60_000,
            cooldown: 10_000,
        }
    }
}

/// Configuration of a fault-injection run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Number of managed nodes
    #[serde(default = "default_nodes")]
    pub nodes: usize,

    /// Node `id` listens on `base_port + id`
    #[serde(default = "default_base_port")]
    pub base_port: u16,

    #[serde(default = "default_host")]
    pub host: Ipv4Addr,

    /// Node command line, with `{host}` and `{port}` placeholders
    #[serde(default = "default_command")]
    pub command: Vec<String>,

    #[serde(default = "default_workdir")]
    pub workdir: PathBuf,

    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Hex-encoded secp256k1 private key of the test account
    pub identity: String,

    /// Compiled registry contract artifact
    pub artifact: PathBuf,

    /// Where the dataset is written
    #[serde(default = "default_output")]
    pub output: PathBuf,

    /// Seed of every random choice (drawn from the OS if absent)
    #[serde(default)]
    pub seed: Option<u64>,

    #[serde(default)]
    pub timing: Timing,

    #[serde(default = "default_scenarios")]
    pub scenarios: Vec<Scenario>,
}

impl Config {
    /// Read a configuration file.
    ///
    /// The result is not validated, so that overrides can be applied first.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let file = File::open(path)?;
        Ok(serde_yaml::from_reader(file)?)
    }

    /// Check the configuration for values that cannot be run.
    pub fn validate(&self) -> Result<(), Error> {
        if self.nodes == 0 {
            return Err(Error::InvalidConfig("nodes must be at least 1".into()));
        }
        let last_port = (self.base_port as usize).checked_add(self.nodes - 1);
        if last_port.is_none_or(|port| port > u16::MAX as usize) {
            return Err(Error::InvalidConfig(format!(
                "{} nodes starting at port {} exceed port {}",
                self.nodes,
                self.base_port,
                u16::MAX
            )));
        }
        if self.command.is_empty() {
            return Err(Error::InvalidConfig("node command is empty".into()));
        }
        if self.scenarios.is_empty() {
            return Err(Error::InvalidConfig("no scenarios configured".into()));
        }
        let mut names = HashSet::new();
        for scenario in &self.scenarios {
            if scenario.active_nodes > self.nodes {
                return Err(Error::InvalidConfig(format!(
                    "scenario {:?} keeps {} of {} nodes",
                    scenario.name, scenario.active_nodes, self.nodes
                )));
            }
            if !names.insert(scenario.name.as_str()) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate scenario {:?}",
                    scenario.name
                )));
            }
        }
        Ok(())
    }

    pub fn registry(&self) -> registry::Config {
        registry::Config {
            nodes: self.nodes,
            base_port: self.base_port,
            host: self.host,
            start_timeout: ms(self.timing.start_timeout),
            start_backoff: Backoff::exponential(Duration::from_millis(250), Duration::from_secs(2)),
            probe_timeout: ms(self.timing.probe_timeout),
            grace_period: ms(self.timing.grace_period),
            kill_timeout: ms(self.timing.kill_timeout),
        }
    }

    pub fn launcher(&self) -> process::Config {
        process::Config {
            host: self.host,
            command: self.command.clone(),
            workdir: self.workdir.clone(),
            log_dir: self.log_dir.clone(),
        }
    }

    pub fn rpc(&self, bytecode: Vec<u8>) -> jsonrpc::Config {
        jsonrpc::Config {
            request_timeout: ms(self.timing.request_timeout),
            deployment_timeout: ms(self.timing.deployment_timeout),
            receipt_backoff: Backoff::exponential(
                Duration::from_millis(100),
                Duration::from_secs(1),
            ),
            bytecode,
        }
    }

    pub fn runner(&self) -> runner::Config {
        runner::Config {
            tx_delay: ms(self.timing.tx_delay),
            confirmation_timeout: ms(self.timing.confirmation_timeout),
            settle_delay: ms(self.timing.settle_delay),
            sync_interval: ms(self.timing.sync_interval),
            sync_timeout: ms(self.timing.sync_timeout),
            cooldown: ms(self.timing.cooldown),
        }
    }
}

fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}
