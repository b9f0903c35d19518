use std::path::PathBuf;

use alloy_core::primitives::Address;
use clap::{Args, Parser, Subcommand};
use stackup_deploy::{DEFAULT_DEPLOYMENTS_DIR, WiringExitPolicy};
use tracing::level_filters::LevelFilter;

/// The default network name.
const DEFAULT_NETWORK: &str = "localhost";

#[derive(Parser)]
#[command(name = "stackup")]
#[command(
    author,
    version,
    about = "Deploy a graph of interdependent contracts, idempotently"
)]
pub struct Cli {
    /// The verbosity level.
    #[arg(short, long, global = true, env = "STACKUP_VERBOSITY", default_value_t = LevelFilter::INFO)]
    pub verbosity: LevelFilter,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Deploy every step of a graph and apply its wiring calls.
    Deploy(DeployArgs),
    /// Validate a graph and print its execution levels, without touching the network.
    Plan(PlanArgs),
    /// Print the registry entries recorded for a network.
    Status(StatusArgs),
}

#[derive(Debug, Clone, Args)]
pub struct DeployArgs {
    /// Path to an existing Stackup.toml configuration file (or its directory).
    ///
    /// When provided, the network and steps come from this file; the other flags override it.
    #[arg(long, alias = "conf", env = "STACKUP_CONFIG", conflicts_with = "graph")]
    pub config: Option<PathBuf>,

    /// Path to a deployment graph TOML file (`[[steps]]` tables).
    #[arg(long, env = "STACKUP_GRAPH", required_unless_present = "config")]
    pub graph: Option<PathBuf>,

    /// The network name, also the registry namespace.
    ///
    /// Defaults to `localhost` when no config file is given.
    #[arg(short, long, env = "STACKUP_NETWORK")]
    pub network: Option<String>,

    /// The JSON-RPC endpoint of the node.
    ///
    /// Defaults to `http://127.0.0.1:8545` when no config file is given.
    #[arg(long, alias = "rpc", env = "STACKUP_RPC_URL")]
    pub rpc_url: Option<String>,

    /// The unlocked account sending transactions. Defaults to the node's first account.
    #[arg(long, env = "STACKUP_DEPLOYER")]
    pub deployer: Option<Address>,

    /// The expected chain ID. Fetched from the node if not provided.
    #[arg(long, env = "STACKUP_CHAIN_ID")]
    pub chain_id: Option<u64>,

    /// Directory of compiled contract artifacts.
    #[arg(long, env = "STACKUP_ARTIFACTS")]
    pub artifacts: Option<PathBuf>,

    /// Root directory of the deployment registry.
    #[arg(long, env = "STACKUP_DEPLOYMENTS")]
    pub deployments: Option<PathBuf>,

    /// Deploy every step again, even those already recorded in the registry.
    #[arg(long, env = "STACKUP_REDEPLOY", default_value_t = false)]
    pub redeploy: bool,

    /// Keep deploying steps that do not depend on a failed one.
    #[arg(long, env = "STACKUP_CONTINUE_ON_FAILURE", default_value_t = false)]
    pub continue_on_failure: bool,

    /// Maximum number of steps deployed at the same time.
    #[arg(long, env = "STACKUP_CONCURRENCY")]
    pub concurrency: Option<usize>,

    /// Timeout of a single step, in seconds.
    #[arg(long, env = "STACKUP_STEP_TIMEOUT")]
    pub step_timeout: Option<u64>,

    /// How failed wiring calls weigh on the exit code
    /// (`ignore`, `fail-on-error` or `fail-on-any`).
    #[arg(long, env = "STACKUP_WIRING_EXIT")]
    pub wiring_exit: Option<WiringExitPolicy>,

    /// Write the run report as JSON to this path.
    #[arg(long, env = "STACKUP_REPORT")]
    pub report: Option<PathBuf>,

    /// Save the resolved configuration to `<deployments>/Stackup.toml` before deploying.
    #[arg(long, env = "STACKUP_SAVE_CONFIG", default_value_t = false)]
    pub save_config: bool,
}

#[derive(Debug, Clone, Args)]
pub struct PlanArgs {
    /// Path to a deployment graph TOML file.
    #[arg(long, env = "STACKUP_GRAPH", required_unless_present = "config")]
    pub graph: Option<PathBuf>,

    /// Path to a Stackup.toml configuration file (or its directory).
    #[arg(long, alias = "conf", env = "STACKUP_CONFIG", conflicts_with = "graph")]
    pub config: Option<PathBuf>,

    /// Group the steps the way a run with this concurrency would.
    #[arg(long, env = "STACKUP_CONCURRENCY", default_value_t = 1)]
    pub concurrency: usize,
}

#[derive(Debug, Clone, Args)]
pub struct StatusArgs {
    /// The network to list.
    #[arg(short, long, env = "STACKUP_NETWORK", default_value = DEFAULT_NETWORK)]
    pub network: String,

    /// Root directory of the deployment registry.
    #[arg(long, env = "STACKUP_DEPLOYMENTS", default_value = DEFAULT_DEPLOYMENTS_DIR)]
    pub deployments: PathBuf,
}

impl DeployArgs {
    pub fn network_or_default(&self) -> String {
        self.network
            .clone()
            .unwrap_or_else(|| DEFAULT_NETWORK.to_string())
    }
}
