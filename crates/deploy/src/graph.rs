//! Deployment graph definition.
//!
//! A [`DeploymentGraph`] is an ordered list of [`ResourceStep`]s. The declared order is a
//! total order consistent with the dependencies between steps: a step may only reference
//! the address produced by a step declared before it. Wiring calls attached to a step run
//! right after that step and may reference any step up to and including their owner.
//!
//! A wiring call with an `output` is a read: its return value is stored under that name and
//! later arguments may reference it like a step.

use std::{
    collections::{BTreeSet, HashMap},
    fmt,
    path::Path,
};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default confirmation depth for a step that does not set one.
pub const DEFAULT_CONFIRMATIONS: u64 = 1;

/// Return type of a read that does not declare one.
pub const DEFAULT_RETURNS: &str = "address";

/// A constructor or call argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Arg {
    /// The address produced by an earlier step or the value of an earlier read, written
    /// `{ ref = "Name" }`.
    Ref {
        #[serde(rename = "ref")]
        step: String,
    },
    /// Any literal value, passed to the backend untouched.
    Literal(Value),
}

impl Arg {
    /// Reference the address produced by `step`.
    pub fn reference(step: impl Into<String>) -> Self {
        Self::Ref { step: step.into() }
    }

    /// A literal value.
    pub fn literal(value: impl Into<Value>) -> Self {
        Self::Literal(value.into())
    }

    /// The step name this argument refers to, if any.
    pub fn referenced_step(&self) -> Option<&str> {
        match self {
            Self::Ref { step } => Some(step),
            Self::Literal(_) => None,
        }
    }
}

/// A post-deploy configuration call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WiringCall {
    /// The step whose address receives the call.
    pub target: String,
    /// Canonical method signature, e.g. `updateFactory(address)`.
    pub method: String,
    /// Call arguments.
    #[serde(default)]
    pub args: Vec<Arg>,
    /// Makes the call a read whose result is stored under this name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    /// ABI type of the read result, `address` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub returns: Option<String>,
}

impl WiringCall {
    pub fn new(target: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            method: method.into(),
            args: Vec::new(),
            output: None,
            returns: None,
        }
    }

    pub fn arg(mut self, arg: Arg) -> Self {
        self.args.push(arg);
        self
    }

    /// Turn the call into a read stored as `name`.
    pub fn output(mut self, name: impl Into<String>) -> Self {
        self.output = Some(name.into());
        self
    }

    pub fn returns(mut self, ty: impl Into<String>) -> Self {
        self.returns = Some(ty.into());
        self
    }

    pub fn is_read(&self) -> bool {
        self.output.is_some()
    }

    /// ABI type the read result decodes as.
    pub fn return_type(&self) -> &str {
        self.returns.as_deref().unwrap_or(DEFAULT_RETURNS)
    }

    /// Every step name this call needs an address for, target included.
    pub fn references(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.target.as_str())
            .chain(self.args.iter().filter_map(Arg::referenced_step))
    }
}

impl fmt::Display for WiringCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.target, self.method)
    }
}

/// A single resource deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceStep {
    /// Logical name, unique within the graph.
    pub name: String,
    /// Artifact to deploy when it differs from `name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract: Option<String>,
    /// Constructor arguments.
    #[serde(default)]
    pub args: Vec<Arg>,
    /// Confirmations to wait for before the deployment counts as durable.
    #[serde(default = "default_confirmations")]
    pub confirmations: u64,
    /// Reuse the address recorded in the registry instead of deploying again.
    #[serde(default)]
    pub skip_if_already_deployed: bool,
    /// Salt for a deterministic (CREATE2) deployment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub salt: Option<String>,
    /// Overrides the run-level step timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Calls issued right after this step.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub wiring: Vec<WiringCall>,
}

fn default_confirmations() -> u64 {
    DEFAULT_CONFIRMATIONS
}

impl ResourceStep {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            contract: None,
            args: Vec::new(),
            confirmations: DEFAULT_CONFIRMATIONS,
            skip_if_already_deployed: false,
            salt: None,
            timeout_secs: None,
            wiring: Vec::new(),
        }
    }

    pub fn contract(mut self, contract: impl Into<String>) -> Self {
        self.contract = Some(contract.into());
        self
    }

    pub fn arg(mut self, arg: Arg) -> Self {
        self.args.push(arg);
        self
    }

    pub fn confirmations(mut self, confirmations: u64) -> Self {
        self.confirmations = confirmations;
        self
    }

    pub fn skip_if_already_deployed(mut self, skip: bool) -> Self {
        self.skip_if_already_deployed = skip;
        self
    }

    pub fn salt(mut self, salt: impl Into<String>) -> Self {
        self.salt = Some(salt.into());
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn wire(mut self, call: WiringCall) -> Self {
        self.wiring.push(call);
        self
    }

    /// The artifact name to deploy.
    pub fn contract_name(&self) -> &str {
        self.contract.as_deref().unwrap_or(&self.name)
    }
}

/// A violation of the graph definition contract. Always detected before any network call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigurationError {
    #[error("step #{index} has an invalid name `{name}` (allowed: letters, digits, `_`, `-`, `.`)")]
    InvalidName { index: usize, name: String },
    #[error("step `{name}` is declared more than once")]
    DuplicateStep { name: String },
    #[error("step `{step}` references unknown step `{reference}`")]
    UnknownReference { step: String, reference: String },
    #[error("step `{step}` references `{reference}`, which is declared after it")]
    ForwardReference { step: String, reference: String },
    #[error("step `{step}` references its own address")]
    SelfReference { step: String },
    #[error("wiring call `{call}` of step `{step}` references unknown step `{reference}`")]
    UnknownWiringReference {
        step: String,
        call: String,
        reference: String,
    },
    #[error(
        "wiring call `{call}` of step `{step}` references `{reference}`, which is deployed after `{step}`"
    )]
    ForwardWiringReference {
        step: String,
        call: String,
        reference: String,
    },
    #[error("wiring call on step `{step}` has an empty method")]
    EmptyMethod { step: String },
    #[error("wiring call `{call}` of step `{step}` has an invalid output name `{name}`")]
    InvalidOutputName {
        step: String,
        call: String,
        name: String,
    },
    #[error("output `{name}` clashes with a step or another output of the same name")]
    DuplicateOutput { name: String },
    #[error("wiring call `{call}` of step `{step}` has an invalid return type `{returns}`")]
    InvalidReturnType {
        step: String,
        call: String,
        returns: String,
    },
    #[error("wiring call `{call}` of step `{step}` declares a return type but no output")]
    ReturnsWithoutOutput { step: String, call: String },
    #[error("invalid run option: {0}")]
    InvalidOption(String),
}

/// Returns true if `name` can be used as a step, network or registry key.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

/// An ordered list of deployment steps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentGraph {
    #[serde(default)]
    pub steps: Vec<ResourceStep>,
}

impl DeploymentGraph {
    pub fn new(steps: Vec<ResourceStep>) -> Self {
        Self { steps }
    }

    /// Append a step.
    pub fn step(mut self, step: ResourceStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Position of a step in declared order.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.name == name)
    }

    /// Check every reference against the declared order.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let mut positions = HashMap::with_capacity(self.steps.len());
        for (index, step) in self.steps.iter().enumerate() {
            if !is_valid_name(&step.name) {
                return Err(ConfigurationError::InvalidName {
                    index,
                    name: step.name.clone(),
                });
            }
            if positions.insert(step.name.as_str(), index).is_some() {
                return Err(ConfigurationError::DuplicateStep {
                    name: step.name.clone(),
                });
            }
        }

        let mut outputs = HashMap::new();
        for (index, step) in self.steps.iter().enumerate() {
            for (position, call) in step.wiring.iter().enumerate() {
                if let Some(name) = &call.output {
                    if !is_valid_name(name) {
                        return Err(ConfigurationError::InvalidOutputName {
                            step: step.name.clone(),
                            call: call.to_string(),
                            name: name.clone(),
                        });
                    }
                    if positions.contains_key(name.as_str())
                        || outputs.insert(name.as_str(), (index, position)).is_some()
                    {
                        return Err(ConfigurationError::DuplicateOutput { name: name.clone() });
                    }
                    if crate::provisioning::abi::parse_type(call.return_type()).is_err() {
                        return Err(ConfigurationError::InvalidReturnType {
                            step: step.name.clone(),
                            call: call.to_string(),
                            returns: call.return_type().to_string(),
                        });
                    }
                } else if call.returns.is_some() {
                    return Err(ConfigurationError::ReturnsWithoutOutput {
                        step: step.name.clone(),
                        call: call.to_string(),
                    });
                }
            }
        }

        for (index, step) in self.steps.iter().enumerate() {
            for reference in step.args.iter().filter_map(Arg::referenced_step) {
                // Reads run after their owner is deployed, so a constructor may only use
                // the outputs of earlier steps.
                let at = positions
                    .get(reference)
                    .copied()
                    .or_else(|| outputs.get(reference).map(|&(owner, _)| owner));
                match at {
                    None => {
                        return Err(ConfigurationError::UnknownReference {
                            step: step.name.clone(),
                            reference: reference.to_string(),
                        });
                    }
                    Some(at) if at == index && positions.contains_key(reference) => {
                        return Err(ConfigurationError::SelfReference {
                            step: step.name.clone(),
                        });
                    }
                    Some(at) if at >= index => {
                        return Err(ConfigurationError::ForwardReference {
                            step: step.name.clone(),
                            reference: reference.to_string(),
                        });
                    }
                    Some(_) => {}
                }
            }

            for (position, call) in step.wiring.iter().enumerate() {
                if call.method.trim().is_empty() {
                    return Err(ConfigurationError::EmptyMethod {
                        step: step.name.clone(),
                    });
                }
                for reference in call.references() {
                    let available = match (positions.get(reference), outputs.get(reference)) {
                        (Some(&at), _) => Some(at <= index),
                        (None, Some(&(owner, earlier))) => {
                            Some(owner < index || (owner == index && earlier < position))
                        }
                        (None, None) => None,
                    };
                    match available {
                        None => {
                            return Err(ConfigurationError::UnknownWiringReference {
                                step: step.name.clone(),
                                call: call.to_string(),
                                reference: reference.to_string(),
                            });
                        }
                        Some(false) => {
                            return Err(ConfigurationError::ForwardWiringReference {
                                step: step.name.clone(),
                                call: call.to_string(),
                                reference: reference.to_string(),
                            });
                        }
                        Some(true) => {}
                    }
                }
            }
        }

        Ok(())
    }

    /// The step that produces `name`: the step itself, or the owner of the read storing it.
    pub fn producer_of(&self, name: &str) -> Option<usize> {
        self.index_of(name).or_else(|| {
            self.steps.iter().position(|step| {
                step.wiring
                    .iter()
                    .any(|call| call.output.as_deref() == Some(name))
            })
        })
    }

    /// Indices of the steps that `index` needs an address from, through its constructor
    /// arguments or its wiring calls. Unknown names are ignored; call [`Self::validate`] first.
    pub fn dependencies(&self, index: usize) -> BTreeSet<usize> {
        let Some(step) = self.steps.get(index) else {
            return BTreeSet::new();
        };

        step.args
            .iter()
            .filter_map(Arg::referenced_step)
            .chain(step.wiring.iter().flat_map(WiringCall::references))
            .filter_map(|name| self.producer_of(name))
            .filter(|&dep| dep != index)
            .collect()
    }

    /// Like [`Self::dependencies`], restricted to constructor arguments: the steps without
    /// which `index` cannot be deployed at all.
    pub fn constructor_dependencies(&self, index: usize) -> BTreeSet<usize> {
        let Some(step) = self.steps.get(index) else {
            return BTreeSet::new();
        };

        step.args
            .iter()
            .filter_map(Arg::referenced_step)
            .filter_map(|name| self.producer_of(name))
            .filter(|&dep| dep != index)
            .collect()
    }

    /// Group steps into dependency levels.
    ///
    /// A step's level is one more than the highest level among its dependencies. Steps of
    /// the same level share no address dependency and may run concurrently.
    pub fn levels(&self) -> Vec<Vec<usize>> {
        let mut level_of = vec![0usize; self.steps.len()];
        let mut levels: Vec<Vec<usize>> = Vec::new();

        for index in 0..self.steps.len() {
            let level = self
                .dependencies(index)
                .into_iter()
                .filter(|&dep| dep < index)
                .map(|dep| level_of[dep] + 1)
                .max()
                .unwrap_or(0);
            level_of[index] = level;

            if levels.len() <= level {
                levels.resize_with(level + 1, Vec::new);
            }
            levels[level].push(index);
        }

        levels
    }

    /// Execution waves for a run. Sequential runs get one wave per step in declared order.
    pub fn schedule(&self, max_concurrency: usize) -> Vec<Vec<usize>> {
        if max_concurrency <= 1 {
            (0..self.steps.len()).map(|index| vec![index]).collect()
        } else {
            self.levels()
        }
    }

    /// Load a graph from a TOML file containing `[[steps]]` tables.
    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read deployment graph from {}", path.display()))?;
        let graph: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse deployment graph {}", path.display()))?;
        tracing::debug!(path = %path.display(), steps = graph.len(), "Deployment graph loaded");
        Ok(graph)
    }

    /// Save the graph as TOML.
    pub fn save_to_file(&self, path: &Path) -> anyhow::Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize deployment graph to TOML")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write deployment graph to {}", path.display()))?;
        Ok(())
    }
}
