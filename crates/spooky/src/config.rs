//! Configuration loading and types

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use spooky_core::DispatchOptions;
use spooky_facts::{ManagerOptions, MergeMode, store_dir};

/// Environment variable naming the config file
pub const CONFIG_ENV: &str = "SPOOKY_CONFIG";

/// Top-level configuration read from `spooky.toml`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Machines and actions
    #[serde(flatten)]
    pub inventory: spooky_core::Config,
    /// Fact store settings
    #[serde(default)]
    pub facts: FactsConfig,
    /// Dispatcher settings
    #[serde(default)]
    pub execution: ExecutionConfig,
}

/// Fact store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactsConfig {
    /// Store directory, defaults to the XDG state dir
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// `replace`, `merge`, `append` or `select:key1,key2`
    #[serde(default = "default_merge_mode")]
    pub merge_mode: String,
    /// TTL in seconds for gathered facts, 0 for none
    #[serde(default)]
    pub default_ttl: u64,
    /// Concurrent gathers
    #[serde(default = "default_fact_workers")]
    pub max_workers: usize,
    /// Project name recorded on gathered machines
    #[serde(default)]
    pub project: Option<String>,
}

impl Default for FactsConfig {
    fn default() -> Self {
        Self {
            path: None,
            merge_mode: default_merge_mode(),
            default_ttl: 0,
            max_workers: default_fact_workers(),
            project: None,
        }
    }
}

fn default_merge_mode() -> String {
    "replace".to_string()
}

fn default_fact_workers() -> usize {
    4
}

/// Dispatcher settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Seconds, for actions that do not set a timeout
    #[serde(default = "default_timeout")]
    pub default_timeout: u64,
    /// Seconds allowed for connecting and authenticating
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    /// Parallel worker bound, 0 for one per machine
    #[serde(default)]
    pub max_workers: usize,
    /// Extra connection attempts on retryable failures
    #[serde(default)]
    pub retries: u32,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            default_timeout: default_timeout(),
            connect_timeout: default_connect_timeout(),
            max_workers: 0,
            retries: 0,
            log_level: default_log_level(),
        }
    }
}

fn default_timeout() -> u64 {
    30
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from file
    ///
    /// Relative script paths are resolved against the file's directory.
    ///
    /// # Errors
    /// Returns error if file cannot be read or parsed
    pub fn load(path: &Path) -> eyre::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| eyre::eyre!("cannot read {}: {e}", path.display()))?;
        let mut config: Config = toml::from_str(&content)
            .map_err(|e| eyre::eyre!("cannot parse {}: {e}", path.display()))?;

        if let Some(base) = path.parent() {
            config.anchor_scripts(base);
        }
        Ok(config)
    }

    /// First config file found: `explicit`, `$SPOOKY_CONFIG`, `./spooky.toml`,
    /// then `<config dir>/spooky/spooky.toml`
    pub fn locate(explicit: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = explicit {
            return Some(path.to_path_buf());
        }

        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Some(PathBuf::from(path));
        }

        let candidates = [
            Some(PathBuf::from("spooky.toml")),
            dirs::config_dir().map(|p| p.join("spooky/spooky.toml")),
        ];

        candidates.into_iter().flatten().find(|p| p.exists())
    }

    fn anchor_scripts(&mut self, base: &Path) {
        for action in &mut self.inventory.actions {
            if let Some(script) = action.script.as_mut() {
                let path = Path::new(script.as_str());
                if !script.trim().is_empty() && path.is_relative() {
                    *script = base.join(path).to_string_lossy().into_owned();
                }
            }
        }
    }

    /// Dispatcher options from `[execution]`
    #[must_use]
    pub fn dispatch_options(&self) -> DispatchOptions {
        DispatchOptions {
            default_timeout: Duration::from_secs(self.execution.default_timeout),
            connect_timeout: Duration::from_secs(self.execution.connect_timeout),
            max_workers: self.execution.max_workers,
            retries: self.execution.retries,
            ..DispatchOptions::default()
        }
    }

    /// Fact manager options from `[facts]` and `[execution]`
    ///
    /// # Errors
    /// Returns error if `merge_mode` is not recognised
    pub fn manager_options(&self) -> eyre::Result<ManagerOptions> {
        let merge_mode: MergeMode = self.facts.merge_mode.parse()?;
        Ok(ManagerOptions {
            merge_mode,
            max_workers: self.facts.max_workers,
            connect_timeout: Duration::from_secs(self.execution.connect_timeout),
            default_ttl: self.facts.default_ttl,
            project_name: self.facts.project.clone(),
            ..ManagerOptions::default()
        })
    }

    /// Fact store directory: `SPOOKY_FACTS_PATH` overrides `[facts] path`
    #[must_use]
    pub fn store_dir(&self) -> PathBuf {
        store_dir(self.facts.path.as_deref())
    }
}
