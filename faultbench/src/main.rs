//! Fault-injection benchmark for a ledger-backed credential registry.

use clap::{Arg, ArgAction, Command};
use faultbench::{
    config::Config,
    crate_version,
    registry::{process::CommandLauncher, Registry},
    rpc::{
        identity::address_from_private_key,
        jsonrpc::{self, load_bytecode},
    },
    runner::Runner,
    Error,
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::{
    path::{Path, PathBuf},
    process::ExitCode,
};
use tracing::{error, info, warn, Level};

/// Flag for verbose output
const VERBOSE_FLAG: &str = "verbose";

/// Flag for JSON output
const JSON_FLAG: &str = "json";

/// Run every configured scenario and persist the dataset
const RUN_CMD: &str = "run";

/// Validate the configuration and print the scenario plan
const PLAN_CMD: &str = "plan";

#[tokio::main]
async fn main() -> ExitCode {
    let config_arg = Arg::new("config")
        .long("config")
        .required(true)
        .help("Path to YAML config file")
        .value_parser(clap::value_parser!(PathBuf));
    let matches = Command::new("faultbench")
        .version(crate_version())
        .about("Stop and restart ledger nodes while issuing credentials, then measure recovery.")
        .arg(
            Arg::new(VERBOSE_FLAG)
                .short('v')
                .long(VERBOSE_FLAG)
                .global(true)
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new(JSON_FLAG)
                .long(JSON_FLAG)
                .global(true)
                .help("Emit logs as JSON")
                .action(ArgAction::SetTrue),
        )
        .subcommand(
            Command::new(RUN_CMD)
                .about("Run every scenario against freshly started nodes and write the results as CSV.")
                .arg(config_arg.clone())
                .arg(
                    Arg::new("base-port")
                        .long("base-port")
                        .env("BASE_PORT")
                        .help("Port of node 0 (overrides the config file)")
                        .value_parser(clap::value_parser!(u16)),
                )
                .arg(
                    Arg::new("seed")
                        .long("seed")
                        .help("Seed for fault selection and record keys (overrides the config file)")
                        .value_parser(clap::value_parser!(u64)),
                )
                .arg(
                    Arg::new("output")
                        .long("output")
                        .help("Path of the CSV dataset (overrides the config file)")
                        .value_parser(clap::value_parser!(PathBuf)),
                ),
        )
        .subcommand(
            Command::new(PLAN_CMD)
                .about("Validate a config file and print the scenarios it would run.")
                .arg(config_arg),
        )
        .get_matches();

    // Create logger
    let level = if matches.get_flag(VERBOSE_FLAG) {
        Level::DEBUG
    } else {
        Level::INFO
    };
    if matches.get_flag(JSON_FLAG) {
        tracing_subscriber::fmt()
            .json()
            .with_max_level(level)
            .with_file(true)
            .with_line_number(true)
            .init();
    } else {
        tracing_subscriber::fmt().with_max_level(level).init();
    }

    // Parse subcommands
    match matches.subcommand() {
        Some((RUN_CMD, matches)) => {
            let config_path = matches.get_one::<PathBuf>("config").unwrap();
            let base_port = matches.get_one::<u16>("base-port").copied();
            let seed = matches.get_one::<u64>("seed").copied();
            let output = matches.get_one::<PathBuf>("output").cloned();
            if let Err(e) = run(config_path, base_port, seed, output).await {
                error!(error = %e, "fault-injection run failed");
            } else {
                return ExitCode::SUCCESS;
            }
        }
        Some((PLAN_CMD, matches)) => {
            let config_path = matches.get_one::<PathBuf>("config").unwrap();
            if let Err(e) = plan(config_path) {
                error!(error = %e, "invalid configuration");
            } else {
                return ExitCode::SUCCESS;
            }
        }
        Some((cmd, _)) => {
            error!(cmd, "invalid subcommand");
        }
        None => {
            error!("no subcommand provided");
        }
    }
    ExitCode::FAILURE
}

/// Load `path`, applying command-line overrides.
fn load(
    path: &Path,
    base_port: Option<u16>,
    seed: Option<u64>,
    output: Option<PathBuf>,
) -> Result<Config, Error> {
    let mut config = Config::load(path)?;
    if let Some(base_port) = base_port {
        config.base_port = base_port;
    }
    if seed.is_some() {
        config.seed = seed;
    }
    if let Some(output) = output {
        config.output = output;
    }
    config.validate()?;
    Ok(config)
}

fn plan(path: &Path) -> Result<(), Error> {
    let config = load(path, None, None, None)?;
    let identity = address_from_private_key(&config.identity)?;
    let bytecode = load_bytecode(&config.artifact)?;
    info!(
        nodes = config.nodes,
        base_port = config.base_port,
        %identity,
        bytecode = bytecode.len(),
        output = ?config.output,
        "configuration valid"
    );
    for scenario in &config.scenarios {
        info!(
            scenario = %scenario.name,
            active_nodes = scenario.active_nodes,
            faulty_nodes = config.nodes - scenario.active_nodes,
            fault_duration = scenario.fault_duration,
            transactions = scenario.transactions,
            "planned scenario"
        );
    }
    Ok(())
}

async fn run(
    path: &Path,
    base_port: Option<u16>,
    seed: Option<u64>,
    output: Option<PathBuf>,
) -> Result<(), Error> {
    let config = load(path, base_port, seed, output)?;
    let identity = address_from_private_key(&config.identity)?;
    let bytecode = load_bytecode(&config.artifact)?;
    let dialer = jsonrpc::Dialer::new(config.rpc(bytecode))?;
    let launcher = CommandLauncher::new(config.launcher())?;
    let registry = Registry::new(config.registry(), launcher, dialer)?;
    let seed = config.seed.unwrap_or_else(|| rand::thread_rng().gen());
    info!(
        seed,
        nodes = config.nodes,
        scenarios = config.scenarios.len(),
        %identity,
        "starting fault-injection suite"
    );

    // Nodes are stopped however the suite ends
    let mut runner = Runner::new(
        config.runner(),
        registry,
        identity,
        StdRng::seed_from_u64(seed),
    );
    let result = tokio::select! {
        result = runner.run_suite(&config.scenarios) => result,
        _ = tokio::signal::ctrl_c() => Err(Error::Interrupted),
    };
    let stopped = runner.shutdown().await;
    info!(stopped = stopped.len(), "cluster shut down");
    if let Err(e) = result {
        if matches!(e, Error::Interrupted) {
            warn!(
                completed = runner.recorder().outcomes().len(),
                "interrupted, discarding results"
            );
        }
        return Err(e);
    }

    let recorder = runner.recorder();
    recorder.persist(&config.output)?;
    for outcome in recorder.outcomes() {
        info!(
            scenario = %outcome.scenario,
            active_nodes = outcome.active_nodes,
            total_nodes = outcome.total_nodes,
            availability = outcome.availability,
            successful_txs = outcome.successful_txs,
            failed_txs = outcome.failed_txs,
            recovery_time = outcome.recovery_time,
            sync_complete = outcome.sync_complete,
            data_consistent = outcome.data_consistent,
            "scenario summary"
        );
    }
    let skipped = config.scenarios.len() - recorder.outcomes().len();
    if skipped > 0 {
        warn!(skipped, "some scenarios were skipped");
    }
    Ok(())
}
