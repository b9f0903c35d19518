//! Outcome of a run, step by step.

use std::fmt;

use chrono::{DateTime, Utc};
use comfy_table::{Table, presets::UTF8_FULL};
use serde::{Deserialize, Serialize};

use crate::provisioning::InvokeError;

/// Exit code of a run with a failed or blocked step.
pub const EXIT_FAILURE: u8 = 1;
/// Exit code of a run whose wiring failures are not tolerated.
pub const EXIT_WIRING_FAILURE: u8 = 2;
/// Exit code of an aborted run.
pub const EXIT_ABORTED: u8 = 130;

/// Terminal status of a step.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum StepStatus {
    /// Created during this run.
    Deployed,
    /// Already recorded in the registry; the recorded address was reused.
    Skipped,
    /// `create` failed, or the address could not be recorded.
    Failed,
    /// Not attempted because a step it depends on did not produce an address.
    Blocked,
    /// Not attempted because the run stopped first.
    Aborted,
}

impl StepStatus {
    /// True if the step has a usable address.
    pub fn produced_address(self) -> bool {
        matches!(self, Self::Deployed | Self::Skipped)
    }
}

/// Why a wiring call failed.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum WiringFailureKind {
    /// The target was already configured.
    AlreadyApplied,
    Reverted,
    Network,
    Timeout,
    Encoding,
    /// A read returned data that does not decode as declared.
    InvalidOutput,
    /// The target or an argument has no address.
    Unresolved,
    /// Not issued because the run was aborted.
    Aborted,
}

impl From<&InvokeError> for WiringFailureKind {
    fn from(error: &InvokeError) -> Self {
        match error {
            InvokeError::AlreadyApplied(_) => Self::AlreadyApplied,
            InvokeError::Reverted(_) => Self::Reverted,
            InvokeError::Network(_) => Self::Network,
            InvokeError::Timeout(_) => Self::Timeout,
            InvokeError::Encoding(_) => Self::Encoding,
            InvokeError::InvalidOutput(_) => Self::InvalidOutput,
        }
    }
}

/// A wiring call that did not go through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WiringFailure {
    /// `target.method` of the call.
    pub call: String,
    pub kind: WiringFailureKind,
    pub reason: String,
}

impl WiringFailure {
    pub fn new(call: impl Into<String>, kind: WiringFailureKind, reason: impl Into<String>) -> Self {
        Self {
            call: call.into(),
            kind,
            reason: reason.into(),
        }
    }
}

/// How wiring failures weigh on the exit code.
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
pub enum WiringExitPolicy {
    /// Wiring failures never fail the run.
    #[default]
    Ignore,
    /// Fail on any wiring failure except `already-applied`.
    FailOnError,
    /// Fail on any wiring failure.
    FailOnAny,
}

impl WiringExitPolicy {
    fn rejects(self, failure: &WiringFailure) -> bool {
        match self {
            Self::Ignore => false,
            Self::FailOnError => failure.kind != WiringFailureKind::AlreadyApplied,
            Self::FailOnAny => true,
        }
    }
}

/// Outcome of one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub step: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    /// Why the step failed, was blocked or was aborted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
    #[serde(default)]
    pub wiring_applied: usize,
    #[serde(default)]
    pub wiring_failures: Vec<WiringFailure>,
}

impl StepOutcome {
    fn new(step: impl Into<String>, status: StepStatus) -> Self {
        Self {
            step: step.into(),
            status,
            address: None,
            tx_hash: None,
            reason: None,
            notes: Vec::new(),
            wiring_applied: 0,
            wiring_failures: Vec::new(),
        }
    }

    pub fn deployed(step: impl Into<String>, address: impl Into<String>) -> Self {
        Self::new(step, StepStatus::Deployed).with_address(address)
    }

    pub fn skipped(step: impl Into<String>, address: impl Into<String>) -> Self {
        Self::new(step, StepStatus::Skipped).with_address(address)
    }

    pub fn failed(step: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(step, StepStatus::Failed).with_reason(reason)
    }

    pub fn blocked(step: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(step, StepStatus::Blocked).with_reason(reason)
    }

    pub fn aborted(step: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(step, StepStatus::Aborted).with_reason(reason)
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn with_tx_hash(mut self, tx_hash: Option<String>) -> Self {
        self.tx_hash = tx_hash;
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }
}

/// Read-only report of a finished run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub network: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Reason of the external abort, if the run was aborted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aborted: Option<String>,
    /// One outcome per step, in declared order.
    pub steps: Vec<StepOutcome>,
}

impl RunReport {
    /// Outcome of the step named `name`.
    pub fn step(&self, name: &str) -> Option<&StepOutcome> {
        self.steps.iter().find(|s| s.step == name)
    }

    /// Address of `name`, if it has one.
    pub fn address(&self, name: &str) -> Option<&str> {
        self.step(name).and_then(|s| s.address.as_deref())
    }

    /// `(step, address)` for every step with a usable address.
    pub fn addresses(&self) -> Vec<(&str, &str)> {
        self.steps
            .iter()
            .filter(|s| s.status.produced_address())
            .filter_map(|s| Some((s.step.as_str(), s.address.as_deref()?)))
            .collect()
    }

    pub fn count(&self, status: StepStatus) -> usize {
        self.steps.iter().filter(|s| s.status == status).count()
    }

    /// True if a step failed or was blocked.
    pub fn has_failures(&self) -> bool {
        self.count(StepStatus::Failed) + self.count(StepStatus::Blocked) > 0
    }

    pub fn wiring_failures(&self) -> impl Iterator<Item = (&str, &WiringFailure)> {
        self.steps
            .iter()
            .flat_map(|s| s.wiring_failures.iter().map(move |w| (s.step.as_str(), w)))
    }

    /// Process exit code for this report.
    pub fn exit_code(&self, policy: WiringExitPolicy) -> u8 {
        if self.has_failures() {
            EXIT_FAILURE
        } else if self.aborted.is_some() || self.count(StepStatus::Aborted) > 0 {
            EXIT_ABORTED
        } else if self.wiring_failures().any(|(_, w)| policy.rejects(w)) {
            EXIT_WIRING_FAILURE
        } else {
            0
        }
    }

    /// True if the run exits with 0 under `policy`.
    pub fn succeeded(&self, policy: WiringExitPolicy) -> bool {
        self.exit_code(policy) == 0
    }

    /// Render the outcomes as a table.
    pub fn to_table(&self) -> Table {
        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL)
            .set_header(vec!["Step", "Status", "Address", "Wiring", "Details"]);

        for s in &self.steps {
            let attempted = s.wiring_applied + s.wiring_failures.len();
            let wiring = if attempted == 0 {
                String::new()
            } else {
                format!("{}/{}", s.wiring_applied, attempted)
            };
            let details = s
                .reason
                .iter()
                .chain(s.notes.iter())
                .cloned()
                .collect::<Vec<_>>()
                .join("; ");

            table.add_row(vec![
                s.step.clone(),
                s.status.to_string(),
                s.address.clone().unwrap_or_default(),
                wiring,
                details,
            ]);
        }

        table
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Network: {} ({} deployed, {} skipped, {} failed, {} blocked, {} aborted)",
            self.network,
            self.count(StepStatus::Deployed),
            self.count(StepStatus::Skipped),
            self.count(StepStatus::Failed),
            self.count(StepStatus::Blocked),
            self.count(StepStatus::Aborted),
        )?;
        if let Some(reason) = &self.aborted {
            writeln!(f, "Aborted: {reason}")?;
        }
        writeln!(f, "{}", self.to_table())?;

        let mut failures = self.wiring_failures().peekable();
        if failures.peek().is_some() {
            writeln!(f, "Wiring failures:")?;
            for (step, failure) in failures {
                writeln!(
                    f,
                    "  [{step}] {} ({}): {}",
                    failure.call, failure.kind, failure.reason
                )?;
            }
        }

        Ok(())
    }
}

/// Accumulates outcomes while a run progresses.
#[derive(Debug)]
pub struct ReportBuilder {
    network: String,
    started_at: DateTime<Utc>,
    names: Vec<String>,
    outcomes: Vec<Option<StepOutcome>>,
}

impl ReportBuilder {
    pub fn new(network: impl Into<String>, names: Vec<String>) -> Self {
        let outcomes = vec![None; names.len()];
        Self {
            network: network.into(),
            started_at: Utc::now(),
            names,
            outcomes,
        }
    }

    /// Store the outcome of step `index`, replacing any earlier one.
    pub fn set(&mut self, index: usize, outcome: StepOutcome) {
        if let Some(slot) = self.outcomes.get_mut(index) {
            *slot = Some(outcome);
        }
    }

    pub fn get(&self, index: usize) -> Option<&StepOutcome> {
        self.outcomes.get(index).and_then(Option::as_ref)
    }

    pub fn is_set(&self, index: usize) -> bool {
        self.get(index).is_some()
    }

    /// Freeze the report. Steps without an outcome are reported as aborted.
    pub fn finalize(self, aborted: Option<String>) -> RunReport {
        let reason = aborted
            .clone()
            .unwrap_or_else(|| "run stopped before this step".to_string());
        let steps = self
            .names
            .into_iter()
            .zip(self.outcomes)
            .map(|(name, outcome)| {
                outcome.unwrap_or_else(|| StepOutcome::aborted(name, reason.clone()))
            })
            .collect();

        RunReport {
            network: self.network,
            started_at: self.started_at,
            finished_at: Utc::now(),
            aborted,
            steps,
        }
    }
}
