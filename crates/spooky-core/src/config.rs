//! Inventory and action definitions
//!
//! These are the in-memory shapes handed over by the config loader. They are
//! validated once with [`Config::validate`] and never mutated afterwards.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use spooky_exec::{ConnectionInfo, KeySource};

use crate::error::CoreError;

/// A managed machine
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    /// Unique identifier within the inventory
    pub name: String,
    /// IP address or hostname for SSH connection
    pub host: String,
    /// SSH port
    #[serde(default = "default_port")]
    pub port: u16,
    /// SSH user (defaults to root)
    #[serde(default = "default_user")]
    pub user: String,
    /// Password credential
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Private key path, or `env:VAR` for a base64 key in the environment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_file: Option<String>,
    /// Tags for targeting and grouping
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

fn default_port() -> u16 {
    22
}

fn default_user() -> String {
    "root".to_string()
}

impl std::fmt::Debug for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Machine")
            .field("name", &self.name)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("key_file", &self.key_file)
            .field("tags", &self.tags)
            .finish()
    }
}

impl Machine {
    /// Create a machine with default port and user and no credentials
    pub fn new(name: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port: default_port(),
            user: default_user(),
            password: None,
            key_file: None,
            tags: BTreeMap::new(),
        }
    }

    /// Set the login user
    #[must_use]
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    /// Set a password credential
    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Set a key file credential
    #[must_use]
    pub fn with_key_file(mut self, key_file: impl Into<String>) -> Self {
        self.key_file = Some(key_file.into());
        self
    }

    /// Add a tag
    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Look up a tag value
    #[must_use]
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    fn has_credential(&self) -> bool {
        self.password.as_deref().is_some_and(|p| !p.is_empty())
            || self.key_file.as_deref().is_some_and(|k| !k.is_empty())
    }

    /// Build SSH connection parameters for this machine
    #[must_use]
    pub fn connection_info(&self) -> ConnectionInfo {
        let mut info = ConnectionInfo::new(&self.host, &self.user).with_port(self.port);
        if let Some(key_file) = self.key_file.as_deref().filter(|k| !k.is_empty()) {
            info = info.with_key(KeySource::parse(key_file));
        }
        if let Some(password) = self.password.as_deref().filter(|p| !p.is_empty()) {
            info = info.with_password(password);
        }
        info
    }
}

/// A unit of work: a command or a script, plus a targeting rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Action {
    /// Unique identifier within the action set
    pub name: String,
    /// Human readable description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Inline shell command
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Path to a local script whose body is executed remotely
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
    /// Explicit target machine names
    #[serde(default)]
    pub servers: Vec<String>,
    /// Tag selectors (`key` or `key=value`), any of which selects a machine
    #[serde(default)]
    pub tags: Vec<String>,
    /// Run on all targets concurrently
    #[serde(default)]
    pub parallel: bool,
    /// Per-machine timeout in seconds, 0 for the dispatcher default
    #[serde(default)]
    pub timeout: u64,
}

/// What an action runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionTask<'a> {
    /// Inline command
    Command(&'a str),
    /// Local script path
    Script(&'a Path),
}

impl Action {
    /// Create a command action with no targeting rule
    pub fn command(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            command: Some(command.into()),
            script: None,
            servers: Vec::new(),
            tags: Vec::new(),
            parallel: false,
            timeout: 0,
        }
    }

    /// Create a script action with no targeting rule
    pub fn script(name: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            command: None,
            script: Some(script.into()),
            ..Self::command(name, "")
        }
    }

    /// Target explicit machines
    #[must_use]
    pub fn with_servers<I, S>(mut self, servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.servers = servers.into_iter().map(Into::into).collect();
        self
    }

    /// Target machines by tag selector
    #[must_use]
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Run in parallel
    #[must_use]
    pub fn in_parallel(mut self) -> Self {
        self.parallel = true;
        self
    }

    /// Set timeout in seconds
    #[must_use]
    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout = seconds;
        self
    }

    /// The command or script this action runs
    ///
    /// # Errors
    /// Returns `CoreError::ConfigError` unless exactly one of `command` and
    /// `script` is set and non-empty.
    pub fn task(&self) -> Result<ActionTask<'_>, CoreError> {
        let command = self.command.as_deref().filter(|c| !c.trim().is_empty());
        let script = self.script.as_deref().filter(|s| !s.trim().is_empty());

        match (command, script) {
            (Some(command), None) => Ok(ActionTask::Command(command)),
            (None, Some(script)) => Ok(ActionTask::Script(Path::new(script))),
            (Some(_), Some(_)) => Err(CoreError::ConfigError(format!(
                "action '{}' sets both command and script",
                self.name
            ))),
            (None, None) => Err(CoreError::ConfigError(format!(
                "action '{}' needs a command or a script",
                self.name
            ))),
        }
    }

    /// Effective per-machine timeout
    #[must_use]
    pub fn timeout_or(&self, default: Duration) -> Duration {
        if self.timeout == 0 {
            default
        } else {
            Duration::from_secs(self.timeout)
        }
    }
}

/// Machines and actions loaded from configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Machine inventory, in declaration order
    #[serde(default, rename = "machine")]
    pub machines: Vec<Machine>,
    /// Action set, in declaration order
    #[serde(default, rename = "action")]
    pub actions: Vec<Action>,
}

impl Config {
    /// Check every invariant the engine relies on
    ///
    /// # Errors
    /// Returns `CoreError::ConfigError` listing every problem found.
    pub fn validate(&self) -> Result<(), CoreError> {
        let mut problems = Vec::new();

        let mut machine_names = HashSet::new();
        for machine in &self.machines {
            if machine.name.trim().is_empty() {
                problems.push(format!("machine with host '{}' has no name", machine.host));
                continue;
            }
            if !machine_names.insert(machine.name.as_str()) {
                problems.push(format!("duplicate machine name '{}'", machine.name));
            }
            if machine.host.trim().is_empty() {
                problems.push(format!("machine '{}' has no host", machine.name));
            }
            if machine.user.trim().is_empty() {
                problems.push(format!("machine '{}' has no user", machine.name));
            }
            if machine.port == 0 {
                problems.push(format!("machine '{}' has port 0", machine.name));
            }
            if !machine.has_credential() {
                problems.push(format!(
                    "machine '{}' needs a password or a key_file",
                    machine.name
                ));
            }
        }

        let mut action_names = HashSet::new();
        for action in &self.actions {
            if action.name.trim().is_empty() {
                problems.push("action without a name".to_string());
                continue;
            }
            if !action_names.insert(action.name.as_str()) {
                problems.push(format!("duplicate action name '{}'", action.name));
            }
            if let Err(CoreError::ConfigError(msg)) = action.task() {
                problems.push(msg);
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(CoreError::ConfigError(problems.join("; ")))
        }
    }

    /// Find an action by name
    ///
    /// # Errors
    /// Returns `CoreError::ActionNotFound` if no action has that name.
    pub fn action(&self, name: &str) -> Result<&Action, CoreError> {
        self.actions
            .iter()
            .find(|a| a.name == name)
            .ok_or_else(|| CoreError::ActionNotFound(name.to_string()))
    }

    /// Find a machine by name
    #[must_use]
    pub fn machine(&self, name: &str) -> Option<&Machine> {
        self.machines.iter().find(|m| m.name == name)
    }
}
