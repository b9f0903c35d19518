//! Shared fixtures for the orchestrator tests.

#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use serde_json::Value;
use stackup_deploy::{
    AbortSignal, DeployRequest, DeployedResource, InvokeError, ProvisionError, ProvisioningClient,
    Receipt, RegistryEntry, ResourceRegistry,
};

/// A call received by the mock backend.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Create { name: String, args: Vec<Value> },
    Invoke {
        address: String,
        method: String,
        args: Vec<Value>,
    },
    Read {
        address: String,
        method: String,
        args: Vec<Value>,
    },
}

#[derive(Debug, Default)]
struct MockState {
    calls: Vec<Call>,
    events: Vec<String>,
    create_failures: HashMap<String, ProvisionError>,
    invoke_failures: HashMap<String, InvokeError>,
    read_values: HashMap<String, Value>,
    addresses: HashMap<String, String>,
    delays: HashMap<String, Duration>,
    abort_after: Option<(String, AbortSignal)>,
    active: usize,
    max_active: usize,
}

/// In-memory provisioning backend. Step `X` deploys at `0xX1` unless told otherwise.
#[derive(Debug, Clone, Default)]
pub struct MockProvisioner {
    state: Arc<Mutex<MockState>>,
}

impl MockProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    /// Make `create` of `name` fail.
    pub fn fail_create(self, name: &str, error: ProvisionError) -> Self {
        self.state().create_failures.insert(name.to_string(), error);
        self
    }

    /// Make every `invoke` of `method` fail.
    pub fn fail_invoke(self, method: &str, error: InvokeError) -> Self {
        self.state().invoke_failures.insert(method.to_string(), error);
        self
    }

    /// Make every read of `method` return `value`.
    pub fn with_read(self, method: &str, value: Value) -> Self {
        self.state().read_values.insert(method.to_string(), value);
        self
    }

    pub fn with_address(self, name: &str, address: &str) -> Self {
        self.state()
            .addresses
            .insert(name.to_string(), address.to_string());
        self
    }

    /// Make `create` of `name` take `delay` before it confirms.
    pub fn with_delay(self, name: &str, delay: Duration) -> Self {
        self.state().delays.insert(name.to_string(), delay);
        self
    }

    /// Fire `signal` once `create` of `name` confirmed.
    pub fn abort_after(self, name: &str, signal: AbortSignal) -> Self {
        self.state().abort_after = Some((name.to_string(), signal));
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    /// Names passed to `create`, in call order.
    pub fn created(&self) -> Vec<String> {
        self.state()
            .calls
            .iter()
            .filter_map(|call| match call {
                Call::Create { name, .. } => Some(name.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn create_args(&self, name: &str) -> Option<Vec<Value>> {
        self.state().calls.iter().find_map(|call| match call {
            Call::Create { name: n, args } if n == name => Some(args.clone()),
            _ => None,
        })
    }

    /// `(address, method)` of every `invoke`, in call order.
    pub fn invoked(&self) -> Vec<(String, String)> {
        self.state()
            .calls
            .iter()
            .filter_map(|call| match call {
                Call::Invoke {
                    address, method, ..
                } => Some((address.clone(), method.clone())),
                _ => None,
            })
            .collect()
    }

    /// `(address, method)` of every read, in call order.
    pub fn reads(&self) -> Vec<(String, String)> {
        self.state()
            .calls
            .iter()
            .filter_map(|call| match call {
                Call::Read {
                    address, method, ..
                } => Some((address.clone(), method.clone())),
                _ => None,
            })
            .collect()
    }

    /// Arguments of the first `invoke` of `method`.
    pub fn invoke_args(&self, method: &str) -> Option<Vec<Value>> {
        self.state().calls.iter().find_map(|call| match call {
            Call::Invoke { method: m, args, .. } if m == method => Some(args.clone()),
            _ => None,
        })
    }

    /// `start:<name>` / `end:<name>` markers of every `create`.
    pub fn events(&self) -> Vec<String> {
        self.state().events.clone()
    }

    pub fn max_active(&self) -> usize {
        self.state().max_active
    }
}

impl ProvisioningClient for MockProvisioner {
    async fn create(&self, request: DeployRequest<'_>) -> Result<DeployedResource, ProvisionError> {
        let delay = {
            let mut state = self.state();
            state.calls.push(Call::Create {
                name: request.name.to_string(),
                args: request.args.to_vec(),
            });
            state.events.push(format!("start:{}", request.name));
            state.active += 1;
            state.max_active = state.max_active.max(state.active);
            state.delays.get(request.name).copied()
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        state.active -= 1;
        state.events.push(format!("end:{}", request.name));

        if let Some((name, signal)) = &state.abort_after {
            if name == request.name {
                signal.abort("interrupted by test");
            }
        }

        if let Some(error) = state.create_failures.get(request.name) {
            return Err(error.clone());
        }

        let address = state
            .addresses
            .get(request.name)
            .cloned()
            .unwrap_or_else(|| format!("0x{}1", request.name));

        Ok(DeployedResource {
            name: request.name.to_string(),
            address,
            receipt: Receipt {
                tx_hash: format!("0xtx{}", request.name),
                block_number: Some(1),
                confirmations: request.confirmations,
            },
        })
    }

    async fn invoke(&self, address: &str, method: &str, args: &[Value]) -> Result<Receipt, InvokeError> {
        let mut state = self.state();
        state.calls.push(Call::Invoke {
            address: address.to_string(),
            method: method.to_string(),
            args: args.to_vec(),
        });

        if let Some(error) = state.invoke_failures.get(method) {
            return Err(error.clone());
        }

        Ok(Receipt {
            tx_hash: format!("0xcall{method}"),
            block_number: Some(2),
            confirmations: 1,
        })
    }

    async fn read(
        &self,
        address: &str,
        method: &str,
        args: &[Value],
        _returns: &str,
    ) -> Result<Value, InvokeError> {
        let mut state = self.state();
        state.calls.push(Call::Read {
            address: address.to_string(),
            method: method.to_string(),
            args: args.to_vec(),
        });

        if let Some(error) = state.invoke_failures.get(method) {
            return Err(error.clone());
        }

        state
            .read_values
            .get(method)
            .cloned()
            .ok_or_else(|| InvokeError::Reverted(format!("no value for {method}")))
    }
}

/// Registry that can read but never write.
#[derive(Debug, Default)]
pub struct ReadOnlyRegistry;

impl ResourceRegistry for ReadOnlyRegistry {
    fn lookup(&self, _network: &str, _name: &str) -> anyhow::Result<Option<RegistryEntry>> {
        Ok(None)
    }

    fn record(&self, network: &str, entry: &RegistryEntry) -> anyhow::Result<()> {
        anyhow::bail!("registry for `{network}` is read-only, cannot record `{}`", entry.name)
    }

    fn list(&self, _network: &str) -> anyhow::Result<Vec<RegistryEntry>> {
        Ok(Vec::new())
    }
}
