//! Builder module for creating a [`Deployer`] configuration.
//!
//! This module provides the [`DeployerBuilder`] struct which simplifies the creation
//! of a [`Deployer`] from command-line style inputs: it parses the RPC URL, creates the
//! deployments directory and fills in the chain ID from the node when none is given.

use std::path::PathBuf;

use alloy_core::primitives::Address;
use anyhow::{Context, Result};
use url::Url;

use crate::{
    Deployer, DeploymentGraph, NetworkConfig, RunOptions, WiringExitPolicy,
    provisioning::fetch_chain_id, rpc,
};

/// Default RPC endpoint (a local Anvil or Hardhat node).
pub const DEFAULT_RPC_URL: &str = "http://127.0.0.1:8545";
/// Default directory of compiled artifacts.
pub const DEFAULT_ARTIFACTS_DIR: &str = "artifacts";
/// Default root of the file registry.
pub const DEFAULT_DEPLOYMENTS_DIR: &str = "deployments";

/// Builder for creating a [`Deployer`] configuration.
///
/// This builder handles:
/// - RPC URL parsing
/// - Deployments directory creation
/// - Chain ID discovery (best effort, when not provided)
///
/// # Example
///
/// ```no_run
/// use stackup_deploy::{DeployerBuilder, DeploymentGraph};
///
/// # async fn example() -> anyhow::Result<()> {
/// let graph = DeploymentGraph::load_from_file("graph.toml".as_ref())?;
/// let deployer = DeployerBuilder::new("localhost")
///     .rpc_url("http://127.0.0.1:8545")
///     .graph(graph)
///     .build()
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct DeployerBuilder {
    /// The network name (required).
    network_name: String,
    /// The RPC URL (defaults to a local node).
    rpc_url: Option<String>,
    /// The expected chain ID (fetched from the node if not provided).
    chain_id: Option<u64>,
    /// The account sending transactions.
    deployer: Option<Address>,
    /// Directory of compiled artifacts.
    artifacts: Option<PathBuf>,
    /// Root of the file registry.
    deployments: Option<PathBuf>,
    /// Options of the run.
    run: RunOptions,
    /// How wiring failures weigh on the exit code.
    wiring_exit: WiringExitPolicy,
    /// The steps to deploy.
    graph: DeploymentGraph,
}

impl DeployerBuilder {
    /// Create a new [`DeployerBuilder`] for the given network.
    pub fn new(network_name: impl Into<String>) -> Self {
        Self {
            network_name: network_name.into(),
            rpc_url: None,
            chain_id: None,
            deployer: None,
            artifacts: None,
            deployments: None,
            run: RunOptions::default(),
            wiring_exit: WiringExitPolicy::default(),
            graph: DeploymentGraph::default(),
        }
    }

    /// Set the RPC URL.
    ///
    /// If not set, defaults to `http://127.0.0.1:8545`.
    pub fn rpc_url(mut self, url: impl Into<String>) -> Self {
        self.rpc_url = Some(url.into());
        self
    }

    /// Set the expected chain ID.
    ///
    /// If not set, the chain ID reported by the node is recorded when it is reachable.
    pub fn chain_id(mut self, chain_id: u64) -> Self {
        self.chain_id = Some(chain_id);
        self
    }

    /// Set the deployer account.
    pub fn deployer(mut self, deployer: Address) -> Self {
        self.deployer = Some(deployer);
        self
    }

    /// Set the artifacts directory.
    pub fn artifacts(mut self, path: impl Into<PathBuf>) -> Self {
        self.artifacts = Some(path.into());
        self
    }

    /// Set the deployments directory.
    ///
    /// If not set, defaults to `./deployments`.
    pub fn deployments(mut self, path: impl Into<PathBuf>) -> Self {
        self.deployments = Some(path.into());
        self
    }

    pub fn run_options(mut self, run: RunOptions) -> Self {
        self.run = run;
        self
    }

    pub fn wiring_exit(mut self, policy: WiringExitPolicy) -> Self {
        self.wiring_exit = policy;
        self
    }

    pub fn graph(mut self, graph: DeploymentGraph) -> Self {
        self.graph = graph;
        self
    }

    /// Build the [`Deployer`] configuration.
    ///
    /// This method:
    /// 1. Parses the RPC URL
    /// 2. Creates the deployments directory if it doesn't exist
    /// 3. Fetches the chain ID from the node if none was provided
    pub async fn build(self) -> Result<Deployer> {
        let rpc_url = self.rpc_url.as_deref().unwrap_or(DEFAULT_RPC_URL);
        let rpc_url =
            Url::parse(rpc_url).context(format!("Invalid RPC URL: {rpc_url}"))?;

        let deployments = self
            .deployments
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DEPLOYMENTS_DIR));

        // Create the deployments directory if it doesn't exist
        if !deployments.try_exists().context(format!(
            "Failed to check if deployments directory exists at path {}. Ensure you provided valid permissions to the directory.",
            deployments.display()
        ))? {
            std::fs::create_dir_all(&deployments)
                .context("Failed to create deployments directory")?;
        }

        let deployments = deployments
            .canonicalize()
            .context("Failed to canonicalize deployments directory path")?;

        let chain_id = match self.chain_id {
            Some(chain_id) => Some(chain_id),
            None => {
                let client = rpc::create_client(rpc::DEFAULT_TIMEOUT)?;
                match fetch_chain_id(&client, &rpc_url).await {
                    Ok(chain_id) => Some(chain_id),
                    Err(e) => {
                        tracing::warn!(rpc_url = %rpc_url, error = %format!("{e:#}"), "Could not fetch chain ID, it will not be pinned");
                        None
                    }
                }
            }
        };

        tracing::info!(
            network = %self.network_name,
            rpc_url = %rpc_url,
            chain_id,
            deployments = %deployments.display(),
            steps = self.graph.len(),
            "Building deployer configuration..."
        );

        let mut network = NetworkConfig::new(self.network_name, rpc_url);
        network.chain_id = chain_id;
        network.deployer = self.deployer;

        Ok(Deployer {
            artifacts: self
                .artifacts
                .unwrap_or_else(|| PathBuf::from(DEFAULT_ARTIFACTS_DIR)),
            deployments,
            wiring_exit: self.wiring_exit,
            network,
            run: self.run,
            steps: self.graph.steps,
        })
    }
}
