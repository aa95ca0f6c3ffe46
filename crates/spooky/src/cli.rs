//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Debug, Parser)]
#[command(name = "spooky")]
#[command(about = "Declarative server automation over SSH", long_about = None)]
pub struct Cli {
    /// Config file (defaults to $SPOOKY_CONFIG, ./spooky.toml, then the user config dir)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level, overrides RUST_LOG and the config file
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run actions against their target machines
    Execute {
        /// Only run this action (repeatable)
        #[arg(short, long = "action")]
        actions: Vec<String>,

        /// Resolve and print targets without running anything
        #[arg(long)]
        dry_run: bool,

        /// Hide per-machine progress lines
        #[arg(short, long)]
        quiet: bool,
    },

    /// Check the configuration without running anything
    Validate,

    /// List machines, actions and resolved targets
    List,

    /// Inspect and manage the fact store
    #[command(subcommand)]
    Facts(FactsCommand),
}

#[derive(Debug, Subcommand)]
pub enum FactsCommand {
    /// Print one fact of one machine
    Get { machine: String, key: String },

    /// List stored machines
    List {
        /// Print full records as JSON
        #[arg(long)]
        json: bool,
    },

    /// Find machines, e.g. `os=debian,tag=role:web,limit=5`
    Query {
        query: String,
        /// Print full records as JSON
        #[arg(long)]
        json: bool,
    },

    /// Collect facts from machines (`local` for this host, default: every machine)
    Gather { targets: Vec<String> },

    /// Import facts from a JSON file or https URL
    Import {
        source: String,
        /// Overwrite facts that already exist
        #[arg(long = "override")]
        override_existing: bool,
        /// Validate and report without writing
        #[arg(long)]
        dry_run: bool,
    },

    /// Export every machine record as JSON
    Export {
        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Remove stored facts
    Clear {
        /// Only remove expired facts
        #[arg(long)]
        expired: bool,
    },

    /// Remove one machine and its facts
    Delete { machine: String },
}
