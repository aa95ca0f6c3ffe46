//! Fact manager: collection, merging, import and queries over one store

use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use spooky_core::{ChannelOpener, FactTags, Machine, WorkerOutcome, WorkerPool};
use spooky_exec::{CommandChannel, LocalChannel};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use url::Url;

use crate::collector::FactCollector;
use crate::error::FactError;
use crate::import::{ImportOptions, ImportReport, parse_document};
use crate::merge::MergeMode;
use crate::query::FactQuery;
use crate::store::FactStore;
use crate::types::{Fact, FactCollection, FactSource, MachineFacts, machine_id};

/// Collection target meaning "this host"
pub const LOCAL_TARGET: &str = "local";

/// Where a gather run is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionState {
    /// Not started
    Idle,
    /// Opening the channel and running fact commands
    Collecting,
    /// Combining with the stored record and writing it
    Merging,
    /// Record written
    Persisted,
    /// Collection or persistence failed; nothing was written
    Failed,
}

impl fmt::Display for CollectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CollectionState::Idle => "idle",
            CollectionState::Collecting => "collecting",
            CollectionState::Merging => "merging",
            CollectionState::Persisted => "persisted",
            CollectionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Tracks one gather run and logs every transition
#[derive(Debug)]
struct Transitions<'a> {
    target: &'a str,
    state: CollectionState,
}

impl<'a> Transitions<'a> {
    fn new(target: &'a str) -> Self {
        Self {
            target,
            state: CollectionState::Idle,
        }
    }

    fn to(&mut self, next: CollectionState) {
        debug!(target_machine = self.target, from = %self.state, to = %next, "collection state");
        self.state = next;
    }
}

/// Tunables for a fact manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerOptions {
    /// How gathered facts combine with stored ones
    pub merge_mode: MergeMode,
    /// Concurrent gathers in `gather_many`, 0 for unbounded
    pub max_workers: usize,
    /// Bound on opening a channel
    pub connect_timeout: Duration,
    /// Bound on each fact command
    pub command_timeout: Duration,
    /// TTL in seconds given to gathered facts, 0 for none
    pub default_ttl: u64,
    /// Project name recorded on gathered machines
    pub project_name: Option<String>,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            merge_mode: MergeMode::default(),
            max_workers: 4,
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(10),
            default_ttl: 0,
            project_name: None,
        }
    }
}

/// Orchestrates fact collection and persistence
///
/// Cheap to clone; clones share the store and the inventory. Store writes
/// made by the async methods run on the blocking pool. The synchronous
/// methods (queries, lookups, deletes, clears, export) block the calling
/// thread for one redb transaction.
#[derive(Clone)]
pub struct FactManager {
    store: Arc<FactStore>,
    opener: Arc<dyn ChannelOpener>,
    inventory: Arc<Vec<Machine>>,
    options: ManagerOptions,
    cancel: CancellationToken,
}

impl fmt::Debug for FactManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FactManager")
            .field("store", &self.store)
            .field("machines", &self.inventory.len())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl FactManager {
    /// Create a manager over `store` for machines in `inventory`
    pub fn new(
        store: Arc<FactStore>,
        opener: Arc<dyn ChannelOpener>,
        inventory: Vec<Machine>,
        options: ManagerOptions,
    ) -> Self {
        Self {
            store,
            opener,
            inventory: Arc::new(inventory),
            options,
            cancel: CancellationToken::new(),
        }
    }

    /// Stop pending gathers when `token` is cancelled
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// The shared store
    #[must_use]
    pub fn store(&self) -> &Arc<FactStore> {
        &self.store
    }

    fn machine(&self, name: &str) -> Result<&Machine, FactError> {
        self.inventory
            .iter()
            .find(|m| m.name == name)
            .ok_or_else(|| FactError::UnknownMachine(name.to_string()))
    }

    /// Run every fact command against `target` (`local` or an inventory name)
    ///
    /// # Errors
    /// `FactError::UnknownMachine` for an unknown target, `FactError::Channel`
    /// if the channel cannot be opened. Failed fact commands do not fail collection.
    #[instrument(skip(self, target), fields(machine = %target))]
    pub async fn collect_all_facts(&self, target: &str) -> Result<FactCollection, FactError> {
        let (channel, source): (Arc<dyn CommandChannel>, FactSource) = if target == LOCAL_TARGET {
            (Arc::new(LocalChannel::new()), FactSource::Local)
        } else {
            let machine = self.machine(target)?;
            let channel = self.opener.open(machine, self.options.connect_timeout).await?;
            (channel, FactSource::Ssh)
        };

        let collection = FactCollector::new(channel.clone(), target, source)
            .with_timeout(self.options.command_timeout)
            .with_ttl(self.options.default_ttl)
            .collect()
            .await;

        if let Err(e) = channel.close().await {
            warn!(error = %e, "failed to close channel");
        }

        Ok(collection)
    }

    /// Collect, merge with the stored record and persist
    ///
    /// # Errors
    /// Any `collect_all_facts` error, or `FactError::Storage`.
    #[instrument(skip(self, target), fields(machine = %target))]
    pub async fn gather_and_persist_facts(&self, target: &str) -> Result<MachineFacts, FactError> {
        let mut state = Transitions::new(target);

        state.to(CollectionState::Collecting);
        let collection = match self.collect_all_facts(target).await {
            Ok(collection) => collection,
            Err(e) => {
                state.to(CollectionState::Failed);
                error!(error = %e, "fact collection failed");
                return Err(e);
            }
        };

        state.to(CollectionState::Merging);
        let result = self.merge_and_store(target, collection).await;

        match &result {
            Ok(record) => {
                state.to(CollectionState::Persisted);
                info!(facts = record.facts.len(), mode = %self.options.merge_mode, "facts persisted");
            }
            Err(e) => {
                state.to(CollectionState::Failed);
                error!(error = %e, "persisting facts failed");
            }
        }
        result
    }

    async fn merge_and_store(&self, target: &str, collection: FactCollection) -> Result<MachineFacts, FactError> {
        let mut incoming = MachineFacts::from_collection(target, collection);
        if let Ok(machine) = self.machine(target) {
            incoming.tags.clone_from(&machine.tags);
        }
        if let Some(project) = &self.options.project_name {
            incoming.project_name.clone_from(project);
        }

        let mode = self.options.merge_mode.clone();
        self.with_store(move |store| {
            let existing = store.get_machine(&incoming.machine_id)?;
            let merged = mode.apply(existing, incoming);
            store.put_machine(&merged)?;
            Ok(merged)
        })
        .await
    }

    /// Run `f` against the store on the blocking pool
    async fn with_store<T, F>(&self, f: F) -> Result<T, FactError>
    where
        T: Send + 'static,
        F: FnOnce(&FactStore) -> Result<T, FactError> + Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| FactError::Io(format!("store task failed: {e}")))?
    }

    /// Gather several targets through a bounded worker pool
    ///
    /// Results come back in input order.
    #[instrument(skip(self, targets), fields(targets = targets.len()))]
    pub async fn gather_many(&self, targets: Vec<String>) -> Vec<(String, Result<MachineFacts, FactError>)> {
        let pool = WorkerPool::new(self.options.max_workers).with_cancellation(self.cancel.clone());
        let names = targets.clone();

        let results = pool
            .run(targets, |target, _token| {
                let manager = self.clone();
                async move { manager.gather_and_persist_facts(&target).await }
            })
            .await;

        let results: Vec<(String, Result<MachineFacts, FactError>)> = names
            .into_iter()
            .zip(results)
            .map(|(name, outcome)| {
                let result = match outcome {
                    WorkerOutcome::Completed(result) => result,
                    WorkerOutcome::Cancelled => Err(FactError::Cancelled),
                    WorkerOutcome::Panicked(msg) => Err(FactError::Io(format!("gather panicked: {msg}"))),
                };
                (name, result)
            })
            .collect();

        let failed = results.iter().filter(|(_, r)| r.is_err()).count();
        info!(total = results.len(), failed, "gather finished");
        results
    }

    /// Import facts from a local JSON file or an `https://` URL
    ///
    /// # Errors
    /// `FactError::UnsupportedSource` for `http://`, `ftp://` and `ftps://`
    /// (checked before any network access), `FactError::Fetch` or
    /// `FactError::Io` when the source cannot be read, then any
    /// `FactStore::import` error.
    #[instrument(skip(self))]
    pub async fn import_custom_facts_with_options(
        &self,
        source: &str,
        options: ImportOptions,
    ) -> Result<ImportReport, FactError> {
        let bytes = read_source(source).await?;
        let batch = parse_document(&bytes)?;
        debug!(records = batch.records.len(), facts = batch.fact_count(), "import document validated");
        self.with_store(move |store| store.import(batch, &options)).await
    }

    /// Import with default options (no override, not a dry run)
    ///
    /// # Errors
    /// See [`FactManager::import_custom_facts_with_options`].
    pub async fn import_custom_facts(&self, source: &str) -> Result<ImportReport, FactError> {
        self.import_custom_facts_with_options(source, ImportOptions::default())
            .await
    }

    /// Machine records matching `query`
    ///
    /// # Errors
    /// Returns `FactError::Storage` on store failure.
    pub fn query_machine_facts(&self, query: &FactQuery) -> Result<Vec<MachineFacts>, FactError> {
        self.store.query(query)
    }

    /// One live fact of a named machine
    ///
    /// # Errors
    /// Returns `FactError::Storage` on store failure.
    pub fn get_fact(&self, machine_name: &str, key: &str) -> Result<Option<Fact>, FactError> {
        match self.store.get_machine_by_name(machine_name)? {
            Some(record) => self.store.get(&record.machine_id, key),
            None => self.store.get(&machine_id(machine_name), key),
        }
    }

    /// Record for a named machine
    ///
    /// # Errors
    /// Returns `FactError::Storage` on store failure.
    pub fn machine_facts(&self, machine_name: &str) -> Result<Option<MachineFacts>, FactError> {
        self.store.get_machine_by_name(machine_name)
    }

    /// Delete a named machine's record; returns whether it existed
    ///
    /// # Errors
    /// Returns `FactError::Storage` on store failure.
    pub fn delete_machine(&self, machine_name: &str) -> Result<bool, FactError> {
        match self.store.get_machine_by_name(machine_name)? {
            Some(record) => self.store.delete_machine(&record.machine_id),
            None => Ok(false),
        }
    }

    /// Remove every stored fact
    ///
    /// # Errors
    /// Returns `FactError::Storage` on store failure.
    pub fn clear_cache(&self) -> Result<usize, FactError> {
        self.store.clear_cache()
    }

    /// Remove expired facts
    ///
    /// # Errors
    /// Returns `FactError::Storage` on store failure.
    pub fn clear_expired_cache(&self) -> Result<usize, FactError> {
        self.store.clear_expired_cache()
    }

    /// Export the store as JSON
    ///
    /// # Errors
    /// Returns `FactError::Storage` or `FactError::Io`.
    pub fn export_to_json(&self, writer: impl Write) -> Result<usize, FactError> {
        self.store.export_json(writer)
    }

    /// Tags per machine name for target resolution: record tags plus `os`
    ///
    /// # Errors
    /// Returns `FactError::Storage` on store failure.
    pub fn fact_tags(&self) -> Result<FactTags, FactError> {
        let mut tags = FactTags::new();
        for record in self.store.list_machines()? {
            let mut entry: BTreeMap<String, String> = record.tags;
            if !record.os.is_empty() {
                entry.insert("os".to_string(), record.os);
            }
            tags.insert(record.machine_name, entry);
        }
        Ok(tags)
    }
}

/// Fetch import bytes, enforcing the source policy before any I/O
async fn read_source(source: &str) -> Result<Vec<u8>, FactError> {
    if !source.contains("://") {
        return tokio::fs::read(Path::new(source))
            .await
            .map_err(|e| FactError::Io(format!("cannot read {source}: {e}")));
    }

    let url = Url::parse(source).map_err(|e| FactError::UnsupportedSource(format!("{source}: {e}")))?;
    match url.scheme() {
        "https" => {
            info!(url = %url, "fetching facts");
            let response = reqwest::get(url.clone())
                .await
                .and_then(reqwest::Response::error_for_status)
                .map_err(|e| FactError::Fetch(e.to_string()))?;
            let body = response.bytes().await.map_err(|e| FactError::Fetch(e.to_string()))?;
            Ok(body.to_vec())
        }
        "file" => {
            let path = url
                .to_file_path()
                .map_err(|()| FactError::UnsupportedSource(source.to_string()))?;
            tokio::fs::read(&path)
                .await
                .map_err(|e| FactError::Io(format!("cannot read {}: {e}", path.display())))
        }
        "http" => Err(FactError::UnsupportedSource(format!(
            "{source}: plain http is not allowed, use https"
        ))),
        scheme => Err(FactError::UnsupportedSource(format!(
            "{source}: scheme '{scheme}' is not allowed"
        ))),
    }
}
