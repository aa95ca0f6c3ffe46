//! Local command execution using `tokio::process`

use std::time::Instant;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use crate::error::ExecError;
use crate::result::CommandResult;
use crate::traits::CommandChannel;

/// Local command channel
///
/// Executes commands on the local machine through `sh -c`.
#[derive(Debug, Clone, Default)]
pub struct LocalChannel;

impl LocalChannel {
    /// Create a new local channel
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandChannel for LocalChannel {
    #[instrument(skip(self), level = "debug")]
    async fn exec(&self, cmd: &str) -> Result<CommandResult, ExecError> {
        let start = Instant::now();

        debug!(command = %cmd, "executing local command");

        // Use shell to support pipes, redirections, etc.
        let output = Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecError::SpawnError(e.to_string()))?
            .wait_with_output()
            .await
            .map_err(|e| ExecError::IoError(e.to_string()))?;

        let duration = start.elapsed();

        let status = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        debug!(
            command = %cmd,
            status = status,
            duration = ?duration,
            "command completed"
        );

        if !output.status.success() {
            warn!(
                command = %cmd,
                status = status,
                stderr = %stderr.trim_end(),
                "command failed"
            );
        }

        Ok(CommandResult {
            status,
            stdout,
            stderr,
            duration,
        })
    }

    async fn close(&self) -> Result<(), ExecError> {
        Ok(())
    }

    fn channel_type(&self) -> &'static str {
        "local"
    }
}
