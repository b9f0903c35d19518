//! Shared RPC utilities for interacting with Ethereum JSON-RPC endpoints.

use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::Value;

/// Default timeout for RPC requests.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Failure of a single JSON-RPC request.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RpcError {
    /// The request never got a well-formed answer.
    #[error("{method} request failed: {message}")]
    Transport { method: String, message: String },
    /// The node answered with a JSON-RPC error object.
    #[error("{method} returned error {code}: {message}")]
    Server {
        method: String,
        code: i64,
        message: String,
    },
    #[error("failed to decode {method} result: {message}")]
    Decode { method: String, message: String },
}

/// Create an HTTP client configured for JSON-RPC requests.
pub fn create_client(timeout: Duration) -> Result<reqwest::Client, anyhow::Error> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .context("Failed to create HTTP client")
}

/// Make a JSON-RPC call and deserialize the result.
///
/// # Arguments
/// * `client` - The HTTP client to use
/// * `url` - The RPC endpoint URL
/// * `method` - The RPC method name
/// * `params` - The method parameters
pub async fn json_rpc_call<T: DeserializeOwned>(
    client: &reqwest::Client,
    url: &str,
    method: &str,
    params: Vec<Value>,
) -> Result<T, RpcError> {
    let transport = |e: reqwest::Error| RpcError::Transport {
        method: method.to_string(),
        message: e.to_string(),
    };

    let response = client
        .post(url)
        .json(&serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        }))
        .send()
        .await
        .map_err(transport)?;

    let result: Value = response.json().await.map_err(transport)?;

    if let Some(error) = result.get("error") {
        return Err(RpcError::Server {
            method: method.to_string(),
            code: error.get("code").and_then(Value::as_i64).unwrap_or_default(),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
        });
    }

    let result_value = result.get("result").cloned().unwrap_or(Value::Null);

    serde_json::from_value(result_value).map_err(|e| RpcError::Decode {
        method: method.to_string(),
        message: e.to_string(),
    })
}

/// Parse a `0x`-prefixed hex quantity.
pub fn parse_hex_u64(s: &str) -> anyhow::Result<u64> {
    u64::from_str_radix(s.trim_start_matches("0x"), 16)
        .with_context(|| format!("invalid hex quantity `{s}`"))
}

/// Deserialize a u64 from a hex string (with 0x prefix).
pub fn deserialize_u64_from_hex<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    parse_hex_u64(&s).map_err(serde::de::Error::custom)
}
