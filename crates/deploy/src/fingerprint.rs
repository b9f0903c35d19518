use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Inputs of a step that, when changed, make an existing deployment stale.
///
/// Only what ends up on-chain is included: the contract, the resolved constructor arguments
/// and the CREATE2 salt. Timeouts, confirmation depth and wiring are excluded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFingerprint {
    pub contract: String,
    /// Constructor arguments after references have been replaced by addresses.
    pub args: Vec<Value>,
    pub salt: Option<String>,
}

impl StepFingerprint {
    pub fn new(contract: impl Into<String>, args: Vec<Value>, salt: Option<String>) -> Self {
        Self {
            contract: contract.into(),
            args,
            salt,
        }
    }

    /// Compute a SHA-256 hash of these inputs, hex encoded.
    ///
    /// Arguments are hashed through their compact JSON form, so the same inputs always give
    /// the same hash.
    pub fn compute_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.contract.as_bytes());
        hasher.update([0]);
        for arg in &self.args {
            hasher.update(arg.to_string().as_bytes());
            hasher.update([0]);
        }
        if let Some(salt) = &self.salt {
            hasher.update([1]);
            hasher.update(salt.as_bytes());
        }

        hex::encode(hasher.finalize())
    }
}
