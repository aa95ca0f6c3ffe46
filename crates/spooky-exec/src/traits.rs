//! Command channel trait

use std::path::Path;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::time::timeout;
use tracing::{debug, error};

use crate::error::ExecError;
use crate::result::CommandResult;

/// A session to one machine able to run commands and scripts.
///
/// Implementations only provide `exec` and `close`; the remaining methods
/// are expressed in terms of those two.
#[async_trait]
pub trait CommandChannel: Send + Sync {
    /// Run one command and return its raw result, whatever the exit status
    async fn exec(&self, cmd: &str) -> Result<CommandResult, ExecError>;

    /// Release the session. Calling it more than once is a no-op.
    async fn close(&self) -> Result<(), ExecError>;

    /// Channel kind, for logging
    fn channel_type(&self) -> &'static str;

    /// Run one command and return its stdout.
    ///
    /// # Errors
    /// Returns `ExecError::CommandFailed` with the remote stderr when the
    /// command exits non-zero.
    async fn run(&self, cmd: &str) -> Result<String, ExecError> {
        let result = self.exec(cmd).await?;
        if result.success() {
            Ok(result.stdout)
        } else {
            Err(ExecError::CommandFailed {
                status: result.status,
                stderr: result.stderr.trim_end().to_string(),
            })
        }
    }

    /// Like `run`, bounded by `timeout_duration`
    async fn run_with_timeout(
        &self,
        cmd: &str,
        timeout_duration: Duration,
    ) -> Result<String, ExecError> {
        let start = Instant::now();

        debug!(command = %cmd, timeout = ?timeout_duration, "executing with timeout");

        match timeout(timeout_duration, self.run(cmd)).await {
            Ok(result) => result,
            Err(_) => {
                error!(
                    command = %cmd,
                    timeout = ?timeout_duration,
                    elapsed = ?start.elapsed(),
                    "command timed out"
                );
                Err(ExecError::Timeout {
                    timeout: timeout_duration,
                })
            }
        }
    }

    /// Read a local script and execute its body on the channel.
    ///
    /// # Errors
    /// Returns `ExecError::ScriptRead` if the file cannot be read, otherwise
    /// the same errors as `run`.
    async fn run_script(&self, path: &Path) -> Result<String, ExecError> {
        let body = read_script(path).await?;
        self.run(&body).await
    }
}

/// Read a script file into memory
///
/// # Errors
/// Returns `ExecError::ScriptRead` when the file is missing, unreadable or empty.
pub async fn read_script(path: &Path) -> Result<String, ExecError> {
    let body = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| ExecError::ScriptRead {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

    if body.trim().is_empty() {
        return Err(ExecError::ScriptRead {
            path: path.display().to_string(),
            reason: "script is empty".to_string(),
        });
    }

    Ok(body)
}
