//! Progress events emitted while an action runs

use std::fmt;
use std::time::Duration;

use serde::Serialize;

/// Dispatcher progress notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
pub enum DispatchEvent {
    /// An action resolved to `targets` machines and is about to run
    ActionStarted {
        action: String,
        targets: usize,
        parallel: bool,
    },
    /// Work on one machine began, before its channel is opened
    MachineStarted {
        action: String,
        machine: String,
    },
    /// One machine is done; `duration` includes opening the channel
    MachineFinished {
        action: String,
        machine: String,
        success: bool,
        duration: Duration,
    },
    /// Every outcome for the action is recorded
    ActionFinished {
        action: String,
        succeeded: usize,
        failed: usize,
    },
}

impl fmt::Display for DispatchEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchEvent::ActionStarted {
                action,
                targets,
                parallel,
            } => {
                let mode = if *parallel { "parallel" } else { "sequential" };
                write!(f, "[{action}] starting on {targets} machine(s), {mode}")
            }
            DispatchEvent::MachineStarted { action, machine } => {
                write!(f, "[{action}] {machine}: running")
            }
            DispatchEvent::MachineFinished {
                action,
                machine,
                success,
                duration,
            } => {
                let status = if *success { "ok" } else { "failed" };
                write!(f, "[{action}] {machine}: {status} in {duration:.2?}")
            }
            DispatchEvent::ActionFinished {
                action,
                succeeded,
                failed,
            } => write!(f, "[{action}] done: {succeeded} ok, {failed} failed"),
        }
    }
}
