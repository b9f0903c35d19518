//! Compiled contract artifacts.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde_json::Value;

use alloy_core::dyn_abi::DynSolType;

use super::abi;

/// ABI and creation bytecode of a compiled contract.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub contract_name: String,
    pub abi: Value,
    pub bytecode: Vec<u8>,
}

impl Artifact {
    /// Build an artifact from its JSON form.
    ///
    /// Accepts the Hardhat layout (`"bytecode": "0x..."`) and the Foundry layout
    /// (`"bytecode": { "object": "0x..." }`).
    pub fn from_json(contract_name: &str, json: &Value) -> Result<Self> {
        let bytecode = match &json["bytecode"] {
            Value::String(code) => code.as_str(),
            Value::Object(object) => object
                .get("object")
                .and_then(Value::as_str)
                .context("`bytecode.object` is missing")?,
            _ => bail!("artifact for `{contract_name}` has no `bytecode` field"),
        };

        if bytecode.contains("__") {
            bail!("bytecode of `{contract_name}` contains unlinked library placeholders");
        }

        let bytecode = hex::decode(bytecode.trim_start_matches("0x"))
            .with_context(|| format!("bytecode of `{contract_name}` is not valid hex"))?;
        if bytecode.is_empty() {
            bail!("`{contract_name}` has no creation bytecode (abstract contract or interface?)");
        }

        Ok(Self {
            contract_name: contract_name.to_string(),
            abi: json.get("abi").cloned().unwrap_or(Value::Array(Vec::new())),
            bytecode,
        })
    }

    /// Parameter types of the constructor; empty when the ABI declares none.
    pub fn constructor_inputs(&self) -> Result<Vec<DynSolType>> {
        let Some(entries) = self.abi.as_array() else {
            return Ok(Vec::new());
        };
        let Some(constructor) = entries
            .iter()
            .find(|entry| entry["type"].as_str() == Some("constructor"))
        else {
            return Ok(Vec::new());
        };

        constructor["inputs"]
            .as_array()
            .map(Vec::as_slice)
            .unwrap_or_default()
            .iter()
            .map(|input| abi::parse_type(&param_type(input)?))
            .collect()
    }

    /// Creation bytecode followed by the encoded constructor arguments.
    pub fn init_code(&self, args: &[Value]) -> Result<Vec<u8>> {
        let inputs = self.constructor_inputs()?;
        let encoded = abi::encode_args(&inputs, args).with_context(|| {
            format!("invalid constructor arguments for `{}`", self.contract_name)
        })?;

        let mut code = self.bytecode.clone();
        code.extend(encoded);
        Ok(code)
    }
}

/// Solidity type of an ABI parameter, expanding `tuple` components.
fn param_type(param: &Value) -> Result<String> {
    let ty = param["type"]
        .as_str()
        .context("ABI parameter without a type")?;

    match ty.strip_prefix("tuple") {
        Some(suffix) => {
            let components = param["components"]
                .as_array()
                .map(Vec::as_slice)
                .unwrap_or_default()
                .iter()
                .map(param_type)
                .collect::<Result<Vec<_>>>()?;
            Ok(format!("({}){suffix}", components.join(",")))
        }
        None => Ok(ty.to_string()),
    }
}

/// Directory of compiled artifacts.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Load the artifact of `contract`.
    pub fn load(&self, contract: &str) -> Result<Artifact> {
        let path = self.locate(contract)?;
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read artifact {}", path.display()))?;
        let json: Value = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse artifact {}", path.display()))?;

        tracing::trace!(contract, path = %path.display(), "Artifact loaded");
        Artifact::from_json(contract, &json)
    }

    /// Find `<contract>.json`, first at the root, then in `<contract>.sol/`, then anywhere below.
    fn locate(&self, contract: &str) -> Result<PathBuf> {
        let file_name = format!("{contract}.json");

        let direct = [
            self.root.join(&file_name),
            self.root.join(format!("{contract}.sol")).join(&file_name),
        ];
        if let Some(path) = direct.into_iter().find(|p| p.is_file()) {
            return Ok(path);
        }

        find_file(&self.root, &file_name)?.with_context(|| {
            format!(
                "No artifact named {} under {}",
                file_name,
                self.root.display()
            )
        })
    }
}

fn find_file(dir: &Path, file_name: &str) -> Result<Option<PathBuf>> {
    if !dir.is_dir() {
        return Ok(None);
    }

    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to list artifacts in {}", dir.display()))?;
    for entry in entries {
        let path = entry?.path();
        if path.is_dir() {
            if let Some(found) = find_file(&path, file_name)? {
                return Ok(Some(found));
            }
        } else if path.file_name().and_then(|n| n.to_str()) == Some(file_name) {
            return Ok(Some(path));
        }
    }

    Ok(None)
}
