//! Fact collection over a command channel

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use spooky_exec::CommandChannel;
use tracing::{debug, info, instrument, warn};

use crate::types::{Fact, FactCollection, FactSource, FactValue};

/// Value recorded when a fact command fails or prints nothing
pub const UNKNOWN: &str = "unknown";

/// Value recorded when a service check fails
pub const INACTIVE: &str = "inactive";

/// How a fact command's stdout becomes a value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Parse {
    Text,
    Integer,
    Words,
}

/// One shell command producing one fact
#[derive(Debug, Clone, Copy)]
struct FactCommand {
    key: &'static str,
    command: &'static str,
    parse: Parse,
    sentinel: &'static str,
}

const FACT_COMMANDS: &[FactCommand] = &[
    FactCommand {
        key: "hostname",
        command: "hostname",
        parse: Parse::Text,
        sentinel: UNKNOWN,
    },
    FactCommand {
        key: "os",
        command: ". /etc/os-release 2>/dev/null && echo \"$ID\"",
        parse: Parse::Text,
        sentinel: UNKNOWN,
    },
    FactCommand {
        key: "os_version",
        command: ". /etc/os-release 2>/dev/null && echo \"$VERSION_ID\"",
        parse: Parse::Text,
        sentinel: UNKNOWN,
    },
    FactCommand {
        key: "kernel",
        command: "uname -r",
        parse: Parse::Text,
        sentinel: UNKNOWN,
    },
    FactCommand {
        key: "arch",
        command: "uname -m",
        parse: Parse::Text,
        sentinel: UNKNOWN,
    },
    FactCommand {
        key: "system_id",
        command: "cat /etc/machine-id 2>/dev/null",
        parse: Parse::Text,
        sentinel: UNKNOWN,
    },
    FactCommand {
        key: "ip_addresses",
        command: "hostname -I 2>/dev/null",
        parse: Parse::Words,
        sentinel: UNKNOWN,
    },
    FactCommand {
        key: "cpu_count",
        command: "nproc",
        parse: Parse::Integer,
        sentinel: UNKNOWN,
    },
    FactCommand {
        key: "memory_total",
        command: "awk '/MemTotal/ {print $2 * 1024}' /proc/meminfo",
        parse: Parse::Integer,
        sentinel: UNKNOWN,
    },
    FactCommand {
        key: "uptime_seconds",
        command: "cut -d. -f1 /proc/uptime",
        parse: Parse::Integer,
        sentinel: UNKNOWN,
    },
    FactCommand {
        key: "docker",
        command: "systemctl is-active docker 2>/dev/null",
        parse: Parse::Text,
        sentinel: INACTIVE,
    },
];

/// Runs every fact command against one machine
///
/// Individual command failures are logged and recorded as sentinel values;
/// collection as a whole never fails once a channel is open.
pub struct FactCollector {
    channel: Arc<dyn CommandChannel>,
    server: String,
    source: FactSource,
    command_timeout: Duration,
    ttl: u64,
}

impl FactCollector {
    /// Create a collector for `server` over `channel`
    pub fn new(channel: Arc<dyn CommandChannel>, server: impl Into<String>, source: FactSource) -> Self {
        Self {
            channel,
            server: server.into(),
            source,
            command_timeout: Duration::from_secs(10),
            ttl: 0,
        }
    }

    /// Set per-command timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Give every collected fact this TTL in seconds
    #[must_use]
    pub fn with_ttl(mut self, ttl: u64) -> Self {
        self.ttl = ttl;
        self
    }

    /// Run every fact command
    #[instrument(skip(self), fields(server = %self.server, channel = self.channel.channel_type()))]
    pub async fn collect(&self) -> FactCollection {
        info!("collecting facts");

        let mut collection = FactCollection::new(&self.server);
        let mut failed = 0;

        for entry in FACT_COMMANDS {
            let value = match self
                .channel
                .run_with_timeout(entry.command, self.command_timeout)
                .await
            {
                Ok(output) => parse_output(entry, &output),
                Err(e) => {
                    failed += 1;
                    warn!(fact = entry.key, error = %e, "fact command failed");
                    FactValue::from(entry.sentinel)
                }
            };
            debug!(fact = entry.key, value = %value, "fact command finished");

            collection.insert(
                Fact::new(&self.server, entry.key, value, self.source).with_ttl(self.ttl),
            );
        }

        collection.timestamp = Utc::now();
        info!(facts = collection.facts.len(), failed, "fact collection completed");

        collection
    }
}

fn parse_output(entry: &FactCommand, output: &str) -> FactValue {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return FactValue::from(entry.sentinel);
    }

    match entry.parse {
        Parse::Text => FactValue::from(trimmed),
        Parse::Integer => trimmed
            .parse::<i64>()
            .map_or_else(|_| FactValue::from(entry.sentinel), FactValue::Integer),
        Parse::Words => FactValue::List(trimmed.split_whitespace().map(FactValue::from).collect()),
    }
}
