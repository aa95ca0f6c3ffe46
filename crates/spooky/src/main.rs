//! spooky
//!
//! Declarative server automation: runs configured actions over SSH and keeps
//! a local store of facts about the machines it manages.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use color_eyre::Result;
use spooky_core::Dispatcher;
use spooky_facts::{FactManager, FactStore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod cli;
mod commands;
mod config;
mod factory;

use cli::{Cli, Commands, LogFormat};
use commands::RunOptions;
use config::Config;
use factory::SshChannelOpener;

/// Level from `--log-level`, else `RUST_LOG`, else `[execution] log_level`
fn init_tracing(cli: &Cli, config_level: &str) -> Result<()> {
    let filter = match &cli.log_level {
        Some(level) => EnvFilter::try_new(level)?,
        None => EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(config_level))?,
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match cli.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
    Ok(())
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling");
            signal_token.cancel();
        }
    });
    token
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let config_path = Config::locate(cli.config.as_deref());
    let config = match &config_path {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    init_tracing(&cli, &config.execution.log_level)?;
    match &config_path {
        Some(path) => info!(path = %path.display(), "configuration loaded"),
        None => warn!("no config file found, using defaults"),
    }

    let cancel = cancel_on_ctrl_c();

    let ok = match cli.command {
        Commands::Validate => commands::validate(&config),

        Commands::List => {
            let fact_tags = commands::load_fact_tags(&config)?;
            commands::list(&config, fact_tags.as_ref())
        }

        Commands::Execute {
            actions,
            dry_run,
            quiet,
        } => {
            config.inventory.validate()?;
            let dispatcher = Dispatcher::new(Arc::new(SshChannelOpener::new()), config.dispatch_options())
                .with_cancellation(cancel.clone());
            let fact_tags = commands::load_fact_tags(&config)?;
            let options = RunOptions {
                actions,
                dry_run,
                quiet,
            };
            commands::execute(&config, dispatcher, fact_tags.as_ref(), options).await?
        }

        Commands::Facts(command) => {
            let store = Arc::new(FactStore::open(config.store_dir())?);
            let manager = FactManager::new(
                store.clone(),
                Arc::new(SshChannelOpener::new()),
                config.inventory.machines.clone(),
                config.manager_options()?,
            )
            .with_cancellation(cancel.clone());

            let result = commands::facts(&manager, &config, command).await;
            if let Err(e) = store.close() {
                warn!(error = %e, "failed to close fact store");
            }
            result?
        }
    };

    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}
