//! Provisioning against an Ethereum JSON-RPC node with unlocked accounts.

use std::time::Duration;

use alloy_core::primitives::{Address, B256, keccak256};
use anyhow::Context;
use backon::{ConstantBuilder, Retryable};
use serde::Deserialize;
use serde_json::{Value, json};
use url::Url;

use super::{
    DeployRequest, DeployedResource, InvokeError, ProvisionError, ProvisioningClient, Receipt,
    abi::{self, FunctionSignature},
    artifacts::ArtifactStore,
};
use crate::rpc::{self, RpcError};

/// Default address of the deterministic deployment proxy used for CREATE2 deployments.
pub const DETERMINISTIC_DEPLOYMENT_PROXY: &str = "0x4e59b44847b379578588920cA78FbF26c0B4956C";

/// Default interval between receipt polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Default number of receipt polls before giving up.
pub const DEFAULT_MAX_POLLS: usize = 600;

/// Network and account the provisioner acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionContext {
    pub network: String,
    pub rpc_url: Url,
    pub chain_id: u64,
    /// Unlocked account every transaction is sent from.
    pub deployer: Address,
}

/// Tuning of the JSON-RPC provisioner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonRpcConfig {
    pub poll_interval: Duration,
    pub max_polls: usize,
    pub create2_factory: Address,
}

impl Default for JsonRpcConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_polls: DEFAULT_MAX_POLLS,
            create2_factory: DETERMINISTIC_DEPLOYMENT_PROXY
                .parse()
                .unwrap_or(Address::ZERO),
        }
    }
}

/// Transaction receipt fields the provisioner relies on.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TxReceipt {
    transaction_hash: String,
    #[serde(deserialize_with = "rpc::deserialize_u64_from_hex")]
    block_number: u64,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    contract_address: Option<String>,
}

impl TxReceipt {
    fn reverted(&self) -> bool {
        self.status.as_deref() == Some("0x0")
    }

    fn into_receipt(self, confirmations: u64) -> Receipt {
        Receipt {
            tx_hash: self.transaction_hash,
            block_number: Some(self.block_number),
            confirmations,
        }
    }
}

/// Outcome of one receipt poll.
#[derive(Debug)]
enum PollError {
    /// Not mined yet, or not deep enough.
    Pending,
    Rpc(RpcError),
}

/// [`ProvisioningClient`] sending transactions through `eth_sendTransaction`.
#[derive(Debug, Clone)]
pub struct JsonRpcProvisioner {
    client: reqwest::Client,
    ctx: ProvisionContext,
    artifacts: ArtifactStore,
    config: JsonRpcConfig,
}

impl JsonRpcProvisioner {
    pub fn new(
        client: reqwest::Client,
        ctx: ProvisionContext,
        artifacts: ArtifactStore,
        config: JsonRpcConfig,
    ) -> Self {
        Self {
            client,
            ctx,
            artifacts,
            config,
        }
    }

    pub fn context(&self) -> &ProvisionContext {
        &self.ctx
    }

    async fn send_transaction(&self, to: Option<Address>, data: &[u8]) -> Result<String, RpcError> {
        let mut tx = json!({
            "from": self.ctx.deployer,
            "chainId": format!("{:#x}", self.ctx.chain_id),
            "data": format!("0x{}", hex::encode(data)),
        });
        if let Some(to) = to {
            tx["to"] = json!(to);
        }

        rpc::json_rpc_call(
            &self.client,
            self.ctx.rpc_url.as_str(),
            "eth_sendTransaction",
            vec![tx],
        )
        .await
    }

    async fn has_code(&self, address: Address) -> Result<bool, RpcError> {
        let code: String = rpc::json_rpc_call(
            &self.client,
            self.ctx.rpc_url.as_str(),
            "eth_getCode",
            vec![json!(address), json!("latest")],
        )
        .await?;
        Ok(!code.trim_start_matches("0x").is_empty())
    }

    /// Poll until the transaction is mined and `confirmations` blocks deep.
    async fn wait_for_receipt(
        &self,
        tx_hash: &str,
        confirmations: u64,
    ) -> Result<TxReceipt, PollError> {
        let url = self.ctx.rpc_url.to_string();
        let backoff = ConstantBuilder::default()
            .with_delay(self.config.poll_interval)
            .with_max_times(self.config.max_polls);

        (|| poll_receipt(self.client.clone(), url.clone(), tx_hash.to_string(), confirmations))
            .retry(backoff)
            .when(|e| matches!(e, PollError::Pending))
            .notify(|_, after| {
                tracing::trace!(tx_hash, ?after, "Transaction not confirmed yet, polling again");
            })
            .await
    }

    fn poll_budget(&self) -> Duration {
        self.config
            .poll_interval
            .saturating_mul(u32::try_from(self.config.max_polls).unwrap_or(u32::MAX))
    }
}

async fn poll_receipt(
    client: reqwest::Client,
    url: String,
    tx_hash: String,
    confirmations: u64,
) -> Result<TxReceipt, PollError> {
    let receipt: Option<TxReceipt> = rpc::json_rpc_call(
        &client,
        &url,
        "eth_getTransactionReceipt",
        vec![json!(tx_hash)],
    )
    .await
    .map_err(PollError::Rpc)?;
    let receipt = receipt.ok_or(PollError::Pending)?;

    // Inclusion is the first confirmation.
    if confirmations > 1 {
        let head: String = rpc::json_rpc_call(&client, &url, "eth_blockNumber", vec![])
            .await
            .map_err(PollError::Rpc)?;
        let head = rpc::parse_hex_u64(&head).map_err(|e| {
            PollError::Rpc(RpcError::Decode {
                method: "eth_blockNumber".to_string(),
                message: e.to_string(),
            })
        })?;
        let depth = head.saturating_sub(receipt.block_number) + 1;
        if depth < confirmations {
            return Err(PollError::Pending);
        }
    }

    Ok(receipt)
}

/// Address of a contract deployed with CREATE2 by `factory`.
pub fn create2_address(factory: Address, salt: B256, init_code: &[u8]) -> Address {
    let mut preimage = Vec::with_capacity(1 + 20 + 32 + 32);
    preimage.push(0xff);
    preimage.extend_from_slice(factory.as_slice());
    preimage.extend_from_slice(salt.as_slice());
    preimage.extend_from_slice(keccak256(init_code).as_slice());
    Address::from_slice(&keccak256(&preimage)[12..])
}

/// A 32-byte hex salt is used as is; any other string is hashed into one.
fn parse_salt(salt: &str) -> B256 {
    match salt.strip_prefix("0x").map(hex::decode) {
        Some(Ok(bytes)) if bytes.len() == 32 => B256::from_slice(&bytes),
        _ => keccak256(salt.as_bytes()),
    }
}

fn provision_error(e: RpcError) -> ProvisionError {
    match e {
        RpcError::Server { message, .. } => ProvisionError::Rejected(message),
        other => ProvisionError::Network(other.to_string()),
    }
}

fn invoke_error(e: RpcError) -> InvokeError {
    match e {
        RpcError::Server { message, .. } if message.to_lowercase().contains("already") => {
            InvokeError::AlreadyApplied(message)
        }
        RpcError::Server { message, .. } => InvokeError::Reverted(message),
        other => InvokeError::Network(other.to_string()),
    }
}

impl ProvisioningClient for JsonRpcProvisioner {
    async fn create(&self, request: DeployRequest<'_>) -> Result<DeployedResource, ProvisionError> {
        let artifact = self
            .artifacts
            .load(request.contract)
            .map_err(|e| ProvisionError::Rejected(format!("{e:#}")))?;
        let init_code = artifact
            .init_code(request.args)
            .map_err(|e| ProvisionError::Rejected(format!("{e:#}")))?;

        let (to, data, predicted) = match request.salt {
            Some(salt) => {
                let salt = parse_salt(salt);
                let factory = self.config.create2_factory;
                let address = create2_address(factory, salt, &init_code);

                if self.has_code(address).await.map_err(provision_error)? {
                    return Err(ProvisionError::AlreadyExists {
                        address: address.to_checksum(None),
                    });
                }
                // Without the factory the transaction would be a plain transfer.
                if !self.has_code(factory).await.map_err(provision_error)? {
                    return Err(ProvisionError::Rejected(format!(
                        "CREATE2 factory {factory} has no code on network `{}`",
                        self.ctx.network
                    )));
                }

                let mut data = salt.to_vec();
                data.extend_from_slice(&init_code);
                (Some(factory), data, Some(address))
            }
            None => (None, init_code, None),
        };

        let tx_hash = self
            .send_transaction(to, &data)
            .await
            .map_err(provision_error)?;

        tracing::info!(
            network = %self.ctx.network,
            chain_id = self.ctx.chain_id,
            step = request.name,
            contract = request.contract,
            tx_hash,
            confirmations = request.confirmations,
            "Deployment transaction sent, waiting for confirmations"
        );

        let receipt = self
            .wait_for_receipt(&tx_hash, request.confirmations)
            .await
            .map_err(|e| match e {
                PollError::Pending => ProvisionError::Timeout(self.poll_budget()),
                PollError::Rpc(e) => provision_error(e),
            })?;

        if receipt.reverted() {
            return Err(ProvisionError::Rejected(format!(
                "deployment transaction {tx_hash} reverted"
            )));
        }

        let address = match predicted {
            Some(address) => {
                if !self.has_code(address).await.map_err(provision_error)? {
                    return Err(ProvisionError::Rejected(format!(
                        "deployment transaction {tx_hash} left no code at {}",
                        address.to_checksum(None)
                    )));
                }
                address
            }
            None => receipt
                .contract_address
                .as_deref()
                .context("receipt has no contract address")
                .and_then(|a| a.parse::<Address>().context("invalid contract address"))
                .map_err(|e| ProvisionError::Rejected(format!("{e:#}")))?,
        };

        Ok(DeployedResource {
            name: request.name.to_string(),
            address: address.to_checksum(None),
            receipt: receipt.into_receipt(request.confirmations),
        })
    }

    async fn invoke(&self, address: &str, method: &str, args: &[Value]) -> Result<Receipt, InvokeError> {
        let target: Address = address
            .parse()
            .map_err(|e| InvokeError::Encoding(format!("invalid target address {address}: {e}")))?;
        let signature =
            FunctionSignature::parse(method).map_err(|e| InvokeError::Encoding(format!("{e:#}")))?;
        let data =
            abi::encode_call(&signature, args).map_err(|e| InvokeError::Encoding(format!("{e:#}")))?;

        let tx_hash = self
            .send_transaction(Some(target), &data)
            .await
            .map_err(invoke_error)?;

        tracing::debug!(
            network = %self.ctx.network,
            target = %target,
            method = %signature.canonical(),
            tx_hash,
            "Call sent"
        );

        let receipt = self
            .wait_for_receipt(&tx_hash, 1)
            .await
            .map_err(|e| match e {
                PollError::Pending => InvokeError::Timeout(self.poll_budget()),
                PollError::Rpc(e) => invoke_error(e),
            })?;

        if receipt.reverted() {
            return Err(InvokeError::Reverted(format!("transaction {tx_hash} reverted")));
        }

        Ok(receipt.into_receipt(1))
    }

    async fn read(
        &self,
        address: &str,
        method: &str,
        args: &[Value],
        returns: &str,
    ) -> Result<Value, InvokeError> {
        let target: Address = address
            .parse()
            .map_err(|e| InvokeError::Encoding(format!("invalid target address {address}: {e}")))?;
        let signature =
            FunctionSignature::parse(method).map_err(|e| InvokeError::Encoding(format!("{e:#}")))?;
        let output_type =
            abi::parse_type(returns).map_err(|e| InvokeError::Encoding(format!("{e:#}")))?;
        let data =
            abi::encode_call(&signature, args).map_err(|e| InvokeError::Encoding(format!("{e:#}")))?;

        let output: String = rpc::json_rpc_call(
            &self.client,
            self.ctx.rpc_url.as_str(),
            "eth_call",
            vec![
                json!({
                    "from": self.ctx.deployer,
                    "to": target,
                    "data": format!("0x{}", hex::encode(data)),
                }),
                json!("latest"),
            ],
        )
        .await
        .map_err(invoke_error)?;

        let bytes = hex::decode(output.trim_start_matches("0x"))
            .map_err(|e| InvokeError::InvalidOutput(format!("{output}: {e}")))?;
        let value = abi::decode_output(&output_type, &bytes)
            .map_err(|e| InvokeError::InvalidOutput(format!("{e:#}")))?;

        tracing::debug!(
            network = %self.ctx.network,
            target = %target,
            method = %signature.canonical(),
            %value,
            "Read call returned"
        );
        Ok(value)
    }
}

/// Fetch the chain ID of the node behind `url`.
pub async fn fetch_chain_id(client: &reqwest::Client, url: &Url) -> anyhow::Result<u64> {
    let chain_id: String = rpc::json_rpc_call(client, url.as_str(), "eth_chainId", vec![])
        .await
        .context("Failed to fetch chain ID")?;
    rpc::parse_hex_u64(&chain_id)
}

/// Fetch the unlocked accounts of the node behind `url`.
pub async fn fetch_accounts(client: &reqwest::Client, url: &Url) -> anyhow::Result<Vec<Address>> {
    rpc::json_rpc_call(client, url.as_str(), "eth_accounts", vec![])
        .await
        .context("Failed to fetch node accounts")
}
