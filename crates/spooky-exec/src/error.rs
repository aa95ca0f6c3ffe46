//! Error types for spooky-exec

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while opening or using a command channel
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecError {
    /// Failed to connect to remote host (network, handshake or connect timeout)
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// No usable credential, or the server rejected every credential
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Remote command exited non-zero
    #[error("command exited with status {status}: {stderr}")]
    CommandFailed {
        /// Exit status code
        status: i32,
        /// Stderr output
        stderr: String,
    },

    /// Command timed out
    #[error("command timed out after {timeout:?}")]
    Timeout {
        /// Timeout duration that was exceeded
        timeout: Duration,
    },

    /// Local script file could not be read
    #[error("cannot read script {path}: {reason}")]
    ScriptRead {
        /// Script path as configured
        path: String,
        /// Underlying I/O error
        reason: String,
    },

    /// SSH key error
    #[error("SSH key error: {0}")]
    SshKeyError(String),

    /// Process spawn error
    #[error("failed to spawn process: {0}")]
    SpawnError(String),

    /// I/O error during execution (session could not be created, channel broke)
    #[error("I/O error: {0}")]
    IoError(String),

    /// Channel already closed
    #[error("not connected")]
    NotConnected,

    /// Execution abandoned before completion
    #[error("cancelled")]
    Cancelled,
}

impl ExecError {
    /// Check if error is retryable
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExecError::ConnectionFailed(_) | ExecError::Timeout { .. }
        )
    }

    /// Short machine-readable kind, used in progress output
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ExecError::ConnectionFailed(_) => "connection",
            ExecError::AuthenticationFailed(_) | ExecError::SshKeyError(_) => "authentication",
            ExecError::CommandFailed { .. } => "execution",
            ExecError::Timeout { .. } => "timeout",
            ExecError::ScriptRead { .. } => "script",
            ExecError::SpawnError(_) | ExecError::IoError(_) | ExecError::NotConnected => "io",
            ExecError::Cancelled => "cancelled",
        }
    }
}
