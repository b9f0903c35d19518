//! The orchestration engine.
//!
//! Steps run in declared order, or level by level when the run allows concurrency. Each step
//! resolves its references against the addresses produced so far, checks the registry,
//! deploys through the [`ProvisioningClient`], records the address and then runs its wiring
//! calls. Deployment failures are hard failures for the step; wiring failures are recorded
//! on the step and never change its status.

use std::{
    collections::HashMap,
    future::Future,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use futures::{StreamExt, stream};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    cancel::AbortSignal,
    fingerprint::StepFingerprint,
    graph::{Arg, ConfigurationError, DeploymentGraph, ResourceStep},
    provisioning::{DeployRequest, InvokeError, ProvisionError, ProvisioningClient},
    registry::{RegistryEntry, ResourceRegistry},
    report::{
        ReportBuilder, RunReport, StepOutcome, StepStatus, WiringFailure, WiringFailureKind,
    },
};

/// What happens to the rest of the run when a step fails.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum FailurePolicy {
    /// Stop: no further step is attempted.
    #[default]
    Abort,
    /// Block the steps that depend on the failed one and keep going with the others.
    ContinueIndependent,
}

/// Options of a single run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOptions {
    pub failure_policy: FailurePolicy,
    /// Maximum number of steps in flight. 1 runs the graph strictly in declared order.
    pub max_concurrency: usize,
    /// Timeout of each `create` / `invoke` call, unless the step sets its own.
    pub step_timeout_secs: Option<u64>,
    /// Deploy every step even if the registry already has it.
    pub force_redeploy: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::default(),
            max_concurrency: 1,
            step_timeout_secs: None,
            force_redeploy: false,
        }
    }
}

impl RunOptions {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.max_concurrency == 0 {
            return Err(ConfigurationError::InvalidOption(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.step_timeout_secs == Some(0) {
            return Err(ConfigurationError::InvalidOption(
                "step_timeout_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Mutable state of a run, shared by the steps in flight.
#[derive(Debug)]
struct RunState {
    report: ReportBuilder,
    /// Address of every step that produced one, by step index.
    addresses: Vec<Option<String>>,
    /// Values returned by reads, by output name.
    outputs: HashMap<String, Value>,
    /// Set once a failure stops the run.
    halted: Option<String>,
}

fn lock(state: &Mutex<RunState>) -> MutexGuard<'_, RunState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Run `fut`, turning an elapsed `limit` into the error built by `on_timeout`.
async fn bounded<T, E>(
    limit: Option<Duration>,
    fut: impl Future<Output = Result<T, E>>,
    on_timeout: impl FnOnce(Duration) -> E,
) -> Result<T, E> {
    match limit {
        None => fut.await,
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .unwrap_or_else(|_| Err(on_timeout(limit))),
    }
}

/// Drives a [`DeploymentGraph`] against a provisioning backend and a registry.
#[derive(Debug)]
pub struct Orchestrator<P, R> {
    network: String,
    client: P,
    registry: R,
    options: RunOptions,
}

impl<P: ProvisioningClient, R: ResourceRegistry> Orchestrator<P, R> {
    pub fn new(network: impl Into<String>, client: P, registry: R) -> Self {
        Self {
            network: network.into(),
            client,
            registry,
            options: RunOptions::default(),
        }
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    pub fn registry(&self) -> &R {
        &self.registry
    }

    /// Run every step of `graph`.
    ///
    /// A [`ConfigurationError`] is returned before any backend call. Any other problem ends
    /// up in the returned report.
    pub async fn run(
        &self,
        graph: &DeploymentGraph,
        abort: &AbortSignal,
    ) -> Result<RunReport, ConfigurationError> {
        graph.validate()?;
        self.options.validate()?;

        let names = graph.steps.iter().map(|s| s.name.clone()).collect();
        let state = Mutex::new(RunState {
            report: ReportBuilder::new(&self.network, names),
            addresses: vec![None; graph.len()],
            outputs: HashMap::new(),
            halted: None,
        });

        tracing::info!(
            network = %self.network,
            steps = graph.len(),
            max_concurrency = self.options.max_concurrency,
            failure_policy = %self.options.failure_policy,
            "Starting deployment run"
        );

        for wave in graph.schedule(self.options.max_concurrency) {
            if abort.is_aborted() || lock(&state).halted.is_some() {
                break;
            }

            stream::iter(wave)
                .map(|index| self.execute_step(graph, index, &state, abort))
                .buffer_unordered(self.options.max_concurrency)
                .collect::<Vec<()>>()
                .await;
        }

        let mut state = state.into_inner().unwrap_or_else(PoisonError::into_inner);
        Self::fill_unattempted(graph, &mut state, abort);
        let report = state.report.finalize(abort.reason());

        tracing::info!(
            network = %self.network,
            deployed = report.count(StepStatus::Deployed),
            skipped = report.count(StepStatus::Skipped),
            failed = report.count(StepStatus::Failed),
            blocked = report.count(StepStatus::Blocked),
            aborted = report.count(StepStatus::Aborted),
            "Deployment run finished"
        );

        Ok(report)
    }

    /// Give an outcome to every step the run never reached. Only a missing constructor
    /// argument blocks a step; a broken wiring reference would not have stopped its deployment.
    fn fill_unattempted(graph: &DeploymentGraph, state: &mut RunState, abort: &AbortSignal) {
        let stopped = state
            .halted
            .clone()
            .or_else(|| abort.reason().map(|r| format!("run aborted: {r}")))
            .unwrap_or_else(|| "run stopped before this step".to_string());

        for (index, step) in graph.steps.iter().enumerate() {
            if state.report.is_set(index) {
                continue;
            }

            let failed_dependency = graph.constructor_dependencies(index).into_iter().find(|&dep| {
                state
                    .report
                    .get(dep)
                    .is_some_and(|o| matches!(o.status, StepStatus::Failed | StepStatus::Blocked))
            });

            let outcome = match failed_dependency {
                Some(dep) => StepOutcome::blocked(
                    &step.name,
                    format!("depends on `{}`, which has no address", graph.steps[dep].name),
                ),
                None => StepOutcome::aborted(&step.name, stopped.clone()),
            };
            state.report.set(index, outcome);
        }
    }

    fn step_timeout(&self, step: &ResourceStep) -> Option<Duration> {
        step.timeout_secs
            .or(self.options.step_timeout_secs)
            .map(Duration::from_secs)
    }

    /// Replace references by the addresses and read outputs produced so far. Returns the
    /// first reference without a value.
    fn resolve_args(
        &self,
        graph: &DeploymentGraph,
        args: &[Arg],
        state: &Mutex<RunState>,
    ) -> Result<Vec<Value>, String> {
        let state = lock(state);
        args.iter()
            .map(|arg| match arg {
                Arg::Literal(value) => Ok(value.clone()),
                Arg::Ref { step } => match graph.index_of(step) {
                    Some(index) => state.addresses[index].clone().map(Value::String),
                    None => state.outputs.get(step).cloned(),
                }
                .ok_or_else(|| step.clone()),
            })
            .collect()
    }

    fn address_of(&self, graph: &DeploymentGraph, name: &str, state: &Mutex<RunState>) -> Option<String> {
        let state = lock(state);
        match graph.index_of(name) {
            Some(index) => state.addresses[index].clone(),
            None => state
                .outputs
                .get(name)
                .and_then(Value::as_str)
                .map(str::to_string),
        }
    }

    fn finish(&self, index: usize, state: &Mutex<RunState>, outcome: StepOutcome) {
        lock(state).report.set(index, outcome);
    }

    fn fail(&self, index: usize, state: &Mutex<RunState>, outcome: StepOutcome) {
        tracing::error!(
            step = %outcome.step,
            reason = outcome.reason.as_deref().unwrap_or_default(),
            "Step failed"
        );

        let mut state = lock(state);
        if self.options.failure_policy == FailurePolicy::Abort && state.halted.is_none() {
            state.halted = Some(format!("not attempted: step `{}` failed", outcome.step));
        }
        state.report.set(index, outcome);
    }

    async fn execute_step(
        &self,
        graph: &DeploymentGraph,
        index: usize,
        state: &Mutex<RunState>,
        abort: &AbortSignal,
    ) {
        let step = &graph.steps[index];

        if abort.is_aborted() || lock(state).halted.is_some() {
            return;
        }

        let args = match self.resolve_args(graph, &step.args, state) {
            Ok(args) => args,
            Err(missing) => {
                tracing::warn!(step = %step.name, dependency = %missing, "Step blocked");
                self.finish(
                    index,
                    state,
                    StepOutcome::blocked(
                        &step.name,
                        format!("depends on `{missing}`, which has no address"),
                    ),
                );
                return;
            }
        };

        let fingerprint =
            StepFingerprint::new(step.contract_name(), args.clone(), step.salt.clone()).compute_hash();

        let existing = if step.skip_if_already_deployed && !self.options.force_redeploy {
            match self.registry.lookup(&self.network, &step.name) {
                Ok(entry) => entry,
                Err(e) => {
                    self.fail(
                        index,
                        state,
                        StepOutcome::failed(&step.name, format!("registry lookup failed: {e:#}")),
                    );
                    return;
                }
            }
        } else {
            None
        };

        let mut outcome = match existing {
            Some(entry) => self.skip_existing(index, step, entry, &fingerprint, state),
            None => match self.deploy(index, step, &args, fingerprint, state).await {
                Some(outcome) => outcome,
                None => return,
            },
        };

        self.apply_wiring(graph, step, &mut outcome, state, abort).await;
        self.finish(index, state, outcome);
    }

    fn skip_existing(
        &self,
        index: usize,
        step: &ResourceStep,
        entry: RegistryEntry,
        fingerprint: &str,
        state: &Mutex<RunState>,
    ) -> StepOutcome {
        tracing::info!(step = %step.name, address = %entry.address, "Already deployed, skipping");

        let mut outcome =
            StepOutcome::skipped(&step.name, &entry.address).with_tx_hash(entry.tx_hash.clone());
        if entry
            .fingerprint
            .as_deref()
            .is_some_and(|recorded| recorded != fingerprint)
        {
            tracing::warn!(
                step = %step.name,
                address = %entry.address,
                "Recorded deployment is stale: its inputs changed since it was deployed"
            );
            outcome = outcome.with_note("stale: inputs changed since it was deployed");
        }

        lock(state).addresses[index] = Some(entry.address);
        outcome
    }

    /// Create the resource and record it. Returns `None` once the step has been marked failed.
    async fn deploy(
        &self,
        index: usize,
        step: &ResourceStep,
        args: &[Value],
        fingerprint: String,
        state: &Mutex<RunState>,
    ) -> Option<StepOutcome> {
        let request = DeployRequest {
            name: &step.name,
            contract: step.contract_name(),
            args,
            confirmations: step.confirmations,
            salt: step.salt.as_deref(),
        };

        tracing::info!(
            step = %step.name,
            contract = request.contract,
            confirmations = step.confirmations,
            "Deploying"
        );

        let result = bounded(
            self.step_timeout(step),
            self.client.create(request),
            ProvisionError::Timeout,
        )
        .await;

        let (entry, note) = match result {
            Ok(resource) => (
                RegistryEntry::new(&step.name, &resource.address)
                    .with_receipt(resource.receipt.tx_hash, resource.receipt.block_number),
                None,
            ),
            Err(ProvisionError::AlreadyExists { address }) => {
                let note = format!("already present at {address}");
                (RegistryEntry::new(&step.name, address), Some(note))
            }
            Err(e) => {
                self.fail(index, state, StepOutcome::failed(&step.name, e.to_string()));
                return None;
            }
        };
        let entry = entry.with_fingerprint(fingerprint);

        if let Err(e) = self.registry.record(&self.network, &entry) {
            self.fail(
                index,
                state,
                StepOutcome::failed(
                    &step.name,
                    format!("deployed but could not be recorded: {e:#}"),
                )
                .with_address(&entry.address)
                .with_tx_hash(entry.tx_hash.clone()),
            );
            return None;
        }

        tracing::info!(step = %step.name, address = %entry.address, "Resource deployed");

        let mut outcome = StepOutcome::deployed(&step.name, &entry.address).with_tx_hash(entry.tx_hash);
        if let Some(note) = note {
            outcome = outcome.with_note(note);
        }
        lock(state).addresses[index] = Some(entry.address);
        Some(outcome)
    }

    /// Run the wiring calls of `step`. Every failure is recorded on `outcome`.
    async fn apply_wiring(
        &self,
        graph: &DeploymentGraph,
        step: &ResourceStep,
        outcome: &mut StepOutcome,
        state: &Mutex<RunState>,
        abort: &AbortSignal,
    ) {
        let timeout = self.step_timeout(step);

        for call in &step.wiring {
            let label = call.to_string();

            if abort.is_aborted() {
                outcome.wiring_failures.push(WiringFailure::new(
                    label,
                    WiringFailureKind::Aborted,
                    "run aborted before the call was issued",
                ));
                continue;
            }

            let Some(target) = self.address_of(graph, &call.target, state) else {
                outcome.wiring_failures.push(WiringFailure::new(
                    label,
                    WiringFailureKind::Unresolved,
                    format!("`{}` has no address", call.target),
                ));
                continue;
            };
            let args = match self.resolve_args(graph, &call.args, state) {
                Ok(args) => args,
                Err(missing) => {
                    outcome.wiring_failures.push(WiringFailure::new(
                        label,
                        WiringFailureKind::Unresolved,
                        format!("`{missing}` has no value"),
                    ));
                    continue;
                }
            };

            if let Some(output) = &call.output {
                match bounded(
                    timeout,
                    self.client.read(&target, &call.method, &args, call.return_type()),
                    InvokeError::Timeout,
                )
                .await
                {
                    Ok(value) => {
                        tracing::info!(step = %step.name, call = %label, output = %output, %value, "Read call returned");
                        lock(state).outputs.insert(output.clone(), value);
                        outcome.wiring_applied += 1;
                    }
                    Err(e) => {
                        tracing::warn!(step = %step.name, call = %label, error = %e, "Read call failed");
                        outcome
                            .wiring_failures
                            .push(WiringFailure::new(label, WiringFailureKind::from(&e), e.to_string()));
                    }
                }
                continue;
            }

            match bounded(
                timeout,
                self.client.invoke(&target, &call.method, &args),
                InvokeError::Timeout,
            )
            .await
            {
                Ok(receipt) => {
                    tracing::info!(step = %step.name, call = %label, tx_hash = %receipt.tx_hash, "Wiring call applied");
                    outcome.wiring_applied += 1;
                }
                Err(e) => {
                    tracing::warn!(step = %step.name, call = %label, error = %e, "Wiring call failed");
                    outcome
                        .wiring_failures
                        .push(WiringFailure::new(label, WiringFailureKind::from(&e), e.to_string()));
                }
            }
        }
    }
}
