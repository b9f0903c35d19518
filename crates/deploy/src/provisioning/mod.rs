//! Provisioning backend abstraction.
//!
//! The orchestrator only sees the [`ProvisioningClient`] trait: `create` deploys a resource
//! and resolves once the requested confirmation depth is reached, `invoke` sends a call to an
//! already deployed resource and `read` queries one without a transaction. [`JsonRpcProvisioner`] implements it against an Ethereum
//! JSON-RPC node.

pub mod abi;
pub mod artifacts;
mod json_rpc;

use std::{future::Future, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use artifacts::{Artifact, ArtifactStore};
pub use json_rpc::{
    DEFAULT_MAX_POLLS, DEFAULT_POLL_INTERVAL, DETERMINISTIC_DEPLOYMENT_PROXY, JsonRpcConfig, JsonRpcProvisioner, ProvisionContext,
    create2_address, fetch_accounts, fetch_chain_id,
};

/// Confirmation record of a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub tx_hash: String,
    pub block_number: Option<u64>,
    /// Confirmation depth observed when the wait resolved.
    pub confirmations: u64,
}

/// A resource produced by a successful `create`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployedResource {
    pub name: String,
    pub address: String,
    pub receipt: Receipt,
}

/// Everything the backend needs to deploy one resource.
#[derive(Debug, Clone, Copy)]
pub struct DeployRequest<'a> {
    /// Logical step name.
    pub name: &'a str,
    /// Artifact to deploy.
    pub contract: &'a str,
    /// Resolved constructor arguments.
    pub args: &'a [Value],
    pub confirmations: u64,
    pub salt: Option<&'a str>,
}

/// Failure of a `create` call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProvisionError {
    /// The resource is already present; the orchestrator treats this as success.
    #[error("resource already exists at {address}")]
    AlreadyExists { address: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("timed out after {}s", .0.as_secs_f64())]
    Timeout(Duration),
}

/// Failure of an `invoke` call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvokeError {
    /// The target reverted because the change is already in place.
    #[error("already applied: {0}")]
    AlreadyApplied(String),
    #[error("reverted: {0}")]
    Reverted(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("timed out after {}s", .0.as_secs_f64())]
    Timeout(Duration),
    #[error("could not encode call: {0}")]
    Encoding(String),
    /// A read returned data that does not decode as the declared type.
    #[error("unexpected return data: {0}")]
    InvalidOutput(String),
}

/// Backend able to create resources and call them.
///
/// Implementations receive the network and signing account at construction time; nothing is
/// looked up from ambient state during a call.
pub trait ProvisioningClient: Send + Sync {
    /// Deploy a resource and wait for `request.confirmations`.
    fn create(
        &self,
        request: DeployRequest<'_>,
    ) -> impl Future<Output = Result<DeployedResource, ProvisionError>> + Send;

    /// Send `method` with `args` to the resource at `address`.
    fn invoke(
        &self,
        address: &str,
        method: &str,
        args: &[Value],
    ) -> impl Future<Output = Result<Receipt, InvokeError>> + Send;

    /// Call `method` on `address` without sending a transaction and decode its single
    /// return value of type `returns`.
    fn read(
        &self,
        address: &str,
        method: &str,
        args: &[Value],
        returns: &str,
    ) -> impl Future<Output = Result<Value, InvokeError>> + Send;
}
