//! SSH key management and resolution

use std::env;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::debug;

/// Prefix marking a `key_file` value as an environment variable reference
const ENV_PREFIX: &str = "env:";

/// SSH key resolution strategy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySource {
    /// Explicit path to key file
    Path(PathBuf),
    /// Base64-encoded key from environment
    Env(String),
}

impl KeySource {
    /// Interpret a configured `key_file` value.
    ///
    /// `env:NAME` reads a base64 key from `$NAME`, `~/` expands to the home
    /// directory, anything else is a plain path.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        if let Some(var) = value.strip_prefix(ENV_PREFIX) {
            return KeySource::Env(var.to_string());
        }
        if let Some(rest) = value.strip_prefix("~/")
            && let Some(home) = dirs::home_dir()
        {
            return KeySource::Path(home.join(rest));
        }
        KeySource::Path(PathBuf::from(value))
    }

    /// Resolve key source to a readable path
    ///
    /// For `Env`, decodes base64 and writes to a private temp file
    ///
    /// # Errors
    /// Returns `KeyError` if key resolution fails (env not set, invalid base64, etc.)
    pub fn resolve(&self) -> Result<ResolvedKey, KeyError> {
        match self {
            KeySource::Path(path) => {
                validate_key_permissions(path)?;
                Ok(ResolvedKey::Path(path.clone()))
            }
            KeySource::Env(var_name) => {
                let base64_key =
                    env::var(var_name).map_err(|_| KeyError::EnvNotSet(var_name.clone()))?;
                let key_data = base64_decode(&base64_key).map_err(|_| KeyError::InvalidBase64)?;

                let file = write_temp_key(&key_data)?;
                Ok(ResolvedKey::Temp(file))
            }
        }
    }
}

/// Resolved key location
#[derive(Debug)]
pub enum ResolvedKey {
    /// Path to key file
    Path(PathBuf),
    /// Temporary file (deleted on drop)
    Temp(NamedTempFile),
}

impl ResolvedKey {
    /// Get path for SSH library
    #[must_use]
    pub fn path(&self) -> &Path {
        match self {
            ResolvedKey::Path(p) => p,
            ResolvedKey::Temp(f) => f.path(),
        }
    }
}

/// Key resolution errors
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("environment variable {0} not set")]
    EnvNotSet(String),

    #[error("invalid base64 encoding")]
    InvalidBase64,

    #[error("key file permissions too open: {0} (should be 600)")]
    BadPermissions(String),

    #[error("key file not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn base64_decode(input: &str) -> Result<Vec<u8>, base64::DecodeError> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.decode(input.trim())
}

#[cfg(unix)]
fn validate_key_permissions(path: &Path) -> Result<(), KeyError> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = std::fs::metadata(path)
        .map_err(|_| KeyError::NotFound(path.display().to_string()))?;

    // group and other bits must be clear
    if metadata.permissions().mode() & 0o77 != 0 {
        return Err(KeyError::BadPermissions(path.display().to_string()));
    }

    Ok(())
}

#[cfg(not(unix))]
fn validate_key_permissions(path: &Path) -> Result<(), KeyError> {
    if path.exists() {
        Ok(())
    } else {
        Err(KeyError::NotFound(path.display().to_string()))
    }
}

fn write_temp_key(key_data: &[u8]) -> Result<NamedTempFile, KeyError> {
    // tempfile creates the file with 0600 on unix
    let mut file = tempfile::Builder::new()
        .prefix("spooky_ssh_key_")
        .tempfile()?;
    file.write_all(key_data)?;
    file.flush()?;

    debug!(path = %file.path().display(), "wrote temporary SSH key");

    Ok(file)
}
