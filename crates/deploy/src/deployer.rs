use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use alloy_core::primitives::Address;
use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{
    AbortSignal, DeploymentGraph, FileRegistry, Orchestrator, ResourceStep, RunOptions,
    RunReport, WiringExitPolicy,
    provisioning::{
        ArtifactStore, DEFAULT_MAX_POLLS, DEFAULT_POLL_INTERVAL, JsonRpcConfig,
        JsonRpcProvisioner, ProvisionContext, fetch_accounts, fetch_chain_id,
    },
    rpc,
};

/// The default name for the stackup configuration file.
pub const STACKUP_CONFIG_FILENAME: &str = "Stackup.toml";

/// Prefix of the environment variables overriding configuration values.
///
/// Nested keys are separated by `__`, e.g. `STACKUP_CONF_NETWORK__RPC_URL`.
pub const STACKUP_CONFIG_ENV_PREFIX: &str = "STACKUP_CONF_";

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL.as_millis() as u64
}

fn default_max_polls() -> usize {
    DEFAULT_MAX_POLLS
}

fn default_request_timeout_secs() -> u64 {
    rpc::DEFAULT_TIMEOUT.as_secs()
}

/// The network a deployment targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Name of the network, also the registry namespace.
    pub name: String,
    /// JSON-RPC endpoint of the node.
    pub rpc_url: Url,
    /// Expected chain ID. The run refuses to start on a node reporting another one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<u64>,
    /// Unlocked account sending the transactions. Defaults to the node's first account.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployer: Option<Address>,
    /// Interval between receipt polls, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Receipt polls before a transaction is considered timed out.
    #[serde(default = "default_max_polls")]
    pub max_polls: usize,
    /// Timeout of a single JSON-RPC request, in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// CREATE2 factory used by salted steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create2_factory: Option<Address>,
}

impl NetworkConfig {
    pub fn new(name: impl Into<String>, rpc_url: Url) -> Self {
        Self {
            name: name.into(),
            rpc_url,
            chain_id: None,
            deployer: None,
            poll_interval_ms: default_poll_interval_ms(),
            max_polls: default_max_polls(),
            request_timeout_secs: default_request_timeout_secs(),
            create2_factory: None,
        }
    }

    fn provisioner_config(&self) -> JsonRpcConfig {
        let defaults = JsonRpcConfig::default();
        JsonRpcConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            max_polls: self.max_polls,
            create2_factory: self.create2_factory.unwrap_or(defaults.create2_factory),
        }
    }
}

/// A complete deployment: target network, paths, run options and the graph itself.
///
/// This struct can be serialized to/from TOML format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployer {
    /// Directory holding the compiled contract artifacts.
    pub artifacts: PathBuf,
    /// Root directory of the file registry.
    pub deployments: PathBuf,
    /// How wiring failures weigh on the exit code.
    #[serde(default)]
    pub wiring_exit: WiringExitPolicy,

    /// Target network.
    pub network: NetworkConfig,
    /// Options of the run.
    #[serde(default)]
    pub run: RunOptions,
    /// The deployment steps, in declared order.
    #[serde(default)]
    pub steps: Vec<ResourceStep>,
}

impl Deployer {
    /// The deployment graph described by this configuration.
    pub fn graph(&self) -> DeploymentGraph {
        DeploymentGraph::new(self.steps.clone())
    }

    /// Save the configuration to a TOML file.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize deployer config to TOML")?;
        std::fs::write(path, content)
            .context(format!("Failed to write config to {}", path.display()))?;
        tracing::info!(path = %path.display(), "Configuration saved");
        Ok(())
    }

    /// Load the configuration from a TOML file, or from `Stackup.toml` inside a directory.
    ///
    /// Values can be overridden through `STACKUP_CONF_*` environment variables.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(anyhow::anyhow!(
                "Configuration file or directory not found: {}",
                path.display()
            ));
        }

        let config_path = if path.is_dir() {
            path.join(STACKUP_CONFIG_FILENAME)
        } else {
            path.to_path_buf()
        };
        if !config_path.is_file() {
            anyhow::bail!("Configuration file not found: {}", config_path.display());
        }

        let config: Self = Figment::new()
            .merge(Toml::file(&config_path))
            .merge(Env::prefixed(STACKUP_CONFIG_ENV_PREFIX).split("__"))
            .extract()
            .context(format!("Failed to load config from {}", config_path.display()))?;
        tracing::info!(path = %config_path.display(), "Configuration loaded");
        Ok(config)
    }

    /// Save the configuration next to the registry, as `<deployments>/Stackup.toml`.
    pub fn save_config(&self) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.deployments).context(format!(
            "Failed to create deployments directory {}",
            self.deployments.display()
        ))?;
        let config_path = self.deployments.join(STACKUP_CONFIG_FILENAME);
        self.save_to_file(&config_path)?;
        Ok(config_path)
    }

    /// Run the deployment against the configured node.
    ///
    /// Fails before any transaction if the graph or the run options are invalid, the node
    /// reports an unexpected chain ID, no deployer account is available, or another run holds
    /// the registry of this network.
    pub async fn deploy(self, abort: &AbortSignal) -> Result<RunReport> {
        let graph = self.graph();
        graph.validate().context("Invalid deployment graph")?;
        self.run.validate().context("Invalid run options")?;

        tracing::info!(
            network = %self.network.name,
            rpc_url = %self.network.rpc_url,
            steps = graph.len(),
            "Starting deployment process..."
        );

        let client = rpc::create_client(Duration::from_secs(self.network.request_timeout_secs))?;

        let chain_id = fetch_chain_id(&client, &self.network.rpc_url)
            .await
            .context(format!(
                "Failed to reach the node at {}",
                self.network.rpc_url
            ))?;
        if let Some(expected) = self.network.chain_id {
            if expected != chain_id {
                anyhow::bail!(
                    "Node at {} reports chain ID {chain_id}, expected {expected}",
                    self.network.rpc_url
                );
            }
        }

        let deployer = match self.network.deployer {
            Some(deployer) => deployer,
            None => fetch_accounts(&client, &self.network.rpc_url)
                .await?
                .into_iter()
                .next()
                .context("The node exposes no unlocked account, set `network.deployer`")?,
        };

        let registry = FileRegistry::open(&self.deployments)?;
        registry.lock_network(&self.network.name)?;

        tracing::info!(
            network = %self.network.name,
            chain_id,
            deployer = %deployer,
            deployments = %registry.root().display(),
            "Deployment context resolved"
        );

        let provisioner = JsonRpcProvisioner::new(
            client,
            ProvisionContext {
                network: self.network.name.clone(),
                rpc_url: self.network.rpc_url.clone(),
                chain_id,
                deployer,
            },
            ArtifactStore::new(&self.artifacts),
            self.network.provisioner_config(),
        );

        let orchestrator = Orchestrator::new(self.network.name.clone(), provisioner, registry)
            .with_options(self.run.clone());

        let report = orchestrator.run(&graph, abort).await?;
        Ok(report)
    }
}
