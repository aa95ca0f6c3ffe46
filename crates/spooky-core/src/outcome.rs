//! Per-machine outcomes and aggregated action results

use std::time::Duration;

use serde::Serialize;
use spooky_exec::ExecError;

/// Result of running one action on one machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Outcome {
    /// Machine name
    pub machine: String,
    /// Whether the command exited zero
    pub success: bool,
    /// Captured stdout on success, empty otherwise
    pub output: String,
    /// Failure cause
    #[serde(skip_serializing_if = "Option::is_none", serialize_with = "error_string")]
    pub error: Option<ExecError>,
    /// Wall time spent on this machine
    pub duration: Duration,
}

fn error_string<S: serde::Serializer>(
    error: &Option<ExecError>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match error {
        Some(e) => serializer.serialize_str(&e.to_string()),
        None => serializer.serialize_none(),
    }
}

impl Outcome {
    /// A successful outcome
    pub fn ok(machine: impl Into<String>, output: impl Into<String>, duration: Duration) -> Self {
        Self {
            machine: machine.into(),
            success: true,
            output: output.into(),
            error: None,
            duration,
        }
    }

    /// A failed outcome
    pub fn failed(machine: impl Into<String>, error: ExecError, duration: Duration) -> Self {
        Self {
            machine: machine.into(),
            success: false,
            output: String::new(),
            error: Some(error),
            duration,
        }
    }
}

/// Aggregated result of one action
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionResult {
    /// Action name
    pub action: String,
    /// Outcomes in the order machines were processed
    pub outcomes: Vec<Outcome>,
    /// True iff every outcome succeeded (vacuously true when empty)
    pub success: bool,
}

impl ActionResult {
    /// Aggregate outcomes
    pub fn from_outcomes(action: impl Into<String>, outcomes: Vec<Outcome>) -> Self {
        let success = outcomes.iter().all(|o| o.success);
        Self {
            action: action.into(),
            outcomes,
            success,
        }
    }

    /// Outcomes that failed
    pub fn failures(&self) -> impl Iterator<Item = &Outcome> {
        self.outcomes.iter().filter(|o| !o.success)
    }

    /// One-line human summary
    #[must_use]
    pub fn summary(&self) -> String {
        let failed = self.failures().count();
        format!(
            "{}: {}/{} machines succeeded",
            self.action,
            self.outcomes.len() - failed,
            self.outcomes.len()
        )
    }
}
