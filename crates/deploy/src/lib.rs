//! stackup-deploy - Deployment orchestration for interdependent on-chain contracts.
//!
//! This crate deploys a [`DeploymentGraph`] in dependency order: every step's references are
//! resolved against the addresses produced before it, the [`ResourceRegistry`] makes re-runs
//! idempotent, and post-deploy wiring calls fail softly into the [`RunReport`].

mod builder;
pub use builder::{DEFAULT_ARTIFACTS_DIR, DEFAULT_DEPLOYMENTS_DIR, DEFAULT_RPC_URL, DeployerBuilder};

mod deployer;
pub use deployer::{Deployer, NetworkConfig, STACKUP_CONFIG_ENV_PREFIX, STACKUP_CONFIG_FILENAME};

mod cancel;
pub use cancel::AbortSignal;

mod fingerprint;
pub use fingerprint::StepFingerprint;

mod graph;
pub use graph::{
    Arg, ConfigurationError, DEFAULT_CONFIRMATIONS, DEFAULT_RETURNS, DeploymentGraph, ResourceStep,
    WiringCall, is_valid_name,
};

mod orchestrator;
pub use orchestrator::{FailurePolicy, Orchestrator, RunOptions};

pub mod provisioning;
pub use provisioning::{
    DeployRequest, DeployedResource, InvokeError, ProvisionError, ProvisioningClient, Receipt,
};

mod registry;
pub use registry::{FileRegistry, MemoryRegistry, RegistryEntry, ResourceRegistry};

mod report;
pub use report::{
    EXIT_ABORTED, EXIT_FAILURE, EXIT_WIRING_FAILURE, ReportBuilder, RunReport, StepOutcome,
    StepStatus, WiringExitPolicy, WiringFailure, WiringFailureKind,
};

pub mod rpc;
