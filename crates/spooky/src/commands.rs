//! Subcommand implementations
//!
//! Each command returns `Ok(true)` when everything it ran succeeded; `main`
//! turns that into the process exit code.

use std::fs::File;
use std::io::{self, Write};
use std::sync::Arc;

use spooky_core::{
    Action, ActionResult, CoreError, Dispatcher, FactTags, Machine, Outcome, Resolver,
};
use spooky_facts::{
    DATABASE_FILE, FactError, FactManager, FactQuery, FactStore, ImportOptions, MachineFacts,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::cli::FactsCommand;
use crate::config::Config;
use crate::factory::SshChannelOpener;

/// Flags for one `execute` run, fixed before any action starts
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Action names to run, empty for all
    pub actions: Vec<String>,
    /// Resolve targets only
    pub dry_run: bool,
    /// Suppress progress lines
    pub quiet: bool,
}

/// Actions to run, in declaration order
///
/// # Errors
/// Returns `CoreError::ActionNotFound` for a name with no action.
pub fn select_actions<'a>(
    config: &'a spooky_core::Config,
    names: &[String],
) -> Result<Vec<&'a Action>, CoreError> {
    if names.is_empty() {
        return Ok(config.actions.iter().collect());
    }

    for name in names {
        config.action(name)?;
    }
    Ok(config
        .actions
        .iter()
        .filter(|a| names.contains(&a.name))
        .collect())
}

/// Tags from the fact store, when any action selects by tag
///
/// Returns `Ok(None)` when no action uses tags or no store has been created
/// yet; the store is never created here.
///
/// # Errors
/// Returns `FactError::Storage` when an existing store cannot be opened or
/// read.
pub fn load_fact_tags(config: &Config) -> Result<Option<FactTags>, FactError> {
    if config.inventory.actions.iter().all(|a| a.tags.is_empty()) {
        return Ok(None);
    }

    let dir = config.store_dir();
    if !dir.join(DATABASE_FILE).exists() {
        debug!(path = %dir.display(), "no fact store yet, resolving with config tags only");
        return Ok(None);
    }

    let store = Arc::new(FactStore::open(&dir)?);
    let manager = FactManager::new(
        store.clone(),
        Arc::new(SshChannelOpener::new()),
        Vec::new(),
        Default::default(),
    );
    let tags = manager.fact_tags();

    if let Err(e) = store.close() {
        warn!(error = %e, "failed to close fact store");
    }
    tags.map(Some)
}

fn resolver<'a>(config: &'a Config, fact_tags: Option<&'a FactTags>) -> Resolver<'a> {
    let resolver = Resolver::new(&config.inventory.machines);
    match fact_tags {
        Some(tags) => resolver.with_fact_tags(tags),
        None => resolver,
    }
}

fn names(machines: &[&Machine]) -> String {
    if machines.is_empty() {
        return "(none)".to_string();
    }
    machines
        .iter()
        .map(|m| m.name.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

fn failure_line(action: &str, outcome: &Outcome) -> String {
    match &outcome.error {
        Some(e) => format!("{action} {}: {} error: {e}", outcome.machine, e.kind()),
        None => format!("{action} {}: failed", outcome.machine),
    }
}

fn report(result: &ActionResult) {
    for outcome in result.failures() {
        println!("{}", failure_line(&result.action, outcome));
    }
    println!("{}", result.summary());
}

/// `spooky validate`
pub fn validate(config: &Config) -> bool {
    let mut ok = true;

    if let Err(e) = config.inventory.validate() {
        println!("{e}");
        ok = false;
    }
    if let Err(e) = config.manager_options() {
        println!("[facts] {e}");
        ok = false;
    }

    let resolver = resolver(config, None);
    for action in &config.inventory.actions {
        if let Err(e) = resolver.resolve(action) {
            println!("{e}");
            ok = false;
        }
    }

    if ok {
        println!(
            "configuration ok: {} machines, {} actions",
            config.inventory.machines.len(),
            config.inventory.actions.len()
        );
    }
    ok
}

/// `spooky list`
pub fn list(config: &Config, fact_tags: Option<&FactTags>) -> bool {
    println!("machines:");
    for machine in &config.inventory.machines {
        let tags: Vec<String> = machine
            .tags
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        println!(
            "  {:<20} {}@{}:{}  {}",
            machine.name,
            machine.user,
            machine.host,
            machine.port,
            tags.join(" ")
        );
    }

    let resolver = resolver(config, fact_tags);
    let mut ok = true;
    println!("actions:");
    for action in &config.inventory.actions {
        let mode = if action.parallel { "parallel" } else { "sequential" };
        match resolver.resolve(action) {
            Ok(targets) => println!("  {:<20} {mode:<10} -> {}", action.name, names(&targets)),
            Err(e) => {
                ok = false;
                println!("  {:<20} {mode:<10} -> {e}", action.name);
            }
        }
    }
    ok
}

/// `spooky execute`
///
/// Runs the selected actions one after another. A resolution failure fails
/// that action and moves on; cancellation stops before the next action.
///
/// # Errors
/// Returns `CoreError::ActionNotFound` for an unknown `--action`.
pub async fn execute(
    config: &Config,
    dispatcher: Dispatcher,
    fact_tags: Option<&FactTags>,
    options: RunOptions,
) -> eyre::Result<bool> {
    let actions = select_actions(&config.inventory, &options.actions)?;
    let resolver = resolver(config, fact_tags);
    let cancel = dispatcher.cancellation_token();

    let progress = (!options.quiet && !options.dry_run).then(|| {
        let mut events = dispatcher.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => eprintln!("{event}"),
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "progress output lagged"),
                    Err(RecvError::Closed) => break,
                }
            }
        })
    });

    let mut all_ok = true;
    for action in actions {
        if cancel.is_cancelled() {
            warn!(action = %action.name, "cancelled, skipping remaining actions");
            all_ok = false;
            break;
        }

        let targets = match resolver.resolve(action) {
            Ok(targets) => targets,
            Err(e) => {
                println!("{e}");
                all_ok = false;
                continue;
            }
        };

        if options.dry_run {
            println!("{}: {}", action.name, names(&targets));
            continue;
        }

        match dispatcher.execute(action, &targets).await {
            Ok(result) => {
                report(&result);
                all_ok &= result.success;
            }
            Err(e) => {
                println!("{e}");
                all_ok = false;
            }
        }
    }

    drop(dispatcher);
    if let Some(handle) = progress {
        if let Err(e) = handle.await {
            warn!(error = %e, "progress printer failed");
        }
    }

    Ok(all_ok)
}

fn print_records(records: &[MachineFacts], json: bool) -> eyre::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(records)?);
        return Ok(());
    }

    for record in records {
        println!(
            "{:<20} {:<16} {:<10} {:>4} facts  updated {}",
            record.machine_name,
            record.primary_ip,
            record.os,
            record.facts.len(),
            record.updated_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

/// `spooky facts ...`
///
/// # Errors
/// Returns store, query parse and import errors.
pub async fn facts(manager: &FactManager, config: &Config, command: FactsCommand) -> eyre::Result<bool> {
    match command {
        FactsCommand::Get { machine, key } => match manager.get_fact(&machine, &key)? {
            Some(fact) => {
                println!("{}", fact.value);
                Ok(true)
            }
            None => {
                eprintln!("no fact '{key}' for {machine}");
                Ok(false)
            }
        },

        FactsCommand::List { json } => {
            print_records(&manager.store().list_machines()?, json)?;
            Ok(true)
        }

        FactsCommand::Query { query, json } => {
            let query: FactQuery = query.parse()?;
            print_records(&manager.query_machine_facts(&query)?, json)?;
            Ok(true)
        }

        FactsCommand::Gather { targets } => {
            let targets = if targets.is_empty() {
                config
                    .inventory
                    .machines
                    .iter()
                    .map(|m| m.name.clone())
                    .collect()
            } else {
                targets
            };

            let mut ok = true;
            for (name, result) in manager.gather_many(targets).await {
                match result {
                    Ok(record) => println!("{name}: {} facts", record.facts.len()),
                    Err(e) => {
                        ok = false;
                        println!("{name}: {e}");
                    }
                }
            }
            Ok(ok)
        }

        FactsCommand::Import {
            source,
            override_existing,
            dry_run,
        } => {
            let report = manager
                .import_custom_facts_with_options(
                    &source,
                    ImportOptions {
                        dry_run,
                        override_existing,
                    },
                )
                .await?;
            println!(
                "{} facts imported, {} skipped, {} machines{}",
                report.imported,
                report.skipped,
                report.machines,
                if report.dry_run { " (dry run)" } else { "" }
            );
            Ok(true)
        }

        FactsCommand::Export { output } => {
            let count = match &output {
                Some(path) => manager.export_to_json(File::create(path)?)?,
                None => manager.export_to_json(io::stdout().lock())?,
            };
            info!(machines = count, "facts exported");
            if output.is_none() {
                io::stdout().flush()?;
            }
            Ok(true)
        }

        FactsCommand::Clear { expired } => {
            let removed = if expired {
                manager.clear_expired_cache()?
            } else {
                manager.clear_cache()?
            };
            println!("{removed} facts removed");
            Ok(true)
        }

        FactsCommand::Delete { machine } => {
            let existed = manager.delete_machine(&machine)?;
            if existed {
                println!("{machine} deleted");
            } else {
                eprintln!("{machine} not found");
            }
            Ok(existed)
        }
    }
}
