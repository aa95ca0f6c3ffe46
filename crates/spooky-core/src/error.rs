//! Core error types for spooky-core

use thiserror::Error;

/// Errors raised before any machine is contacted
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Invalid configuration (shape, required fields, unique names)
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Action references a machine missing from the inventory
    #[error("action '{action}' targets unknown machine '{machine}'")]
    UnknownMachine {
        /// Action being resolved
        action: String,
        /// Name that could not be found
        machine: String,
    },

    /// Action not defined in the configuration
    #[error("action not found: {0}")]
    ActionNotFound(String),
}
