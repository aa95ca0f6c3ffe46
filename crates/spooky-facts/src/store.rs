//! Persistent fact store on top of redb
//!
//! One table holds two kinds of rows, both JSON encoded:
//! - `machine/<machine_id>`: the machine record without its facts
//! - `fact/<machine_id>/<key>`: one fact
//!
//! Expired facts stay on disk until `clear_expired_cache` but are never
//! returned by reads.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, Table, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, instrument, warn};

use crate::error::{FactError, storage};
use crate::import::{ExportEnvelope, ImportBatch, ImportOptions, ImportReport, MachineRef, parse_document};
use crate::merge::overlay_identity;
use crate::paths::DATABASE_FILE;
use crate::query::FactQuery;
use crate::types::{Fact, MachineFacts, machine_id};

const RECORDS: TableDefinition<&str, &[u8]> = TableDefinition::new("records");

const MACHINE_PREFIX: &str = "machine/";
const FACT_PREFIX: &str = "fact/";

fn machine_key(machine_id: &str) -> String {
    format!("{MACHINE_PREFIX}{machine_id}")
}

fn fact_prefix(machine_id: &str) -> String {
    format!("{FACT_PREFIX}{machine_id}/")
}

fn fact_key(machine_id: &str, key: &str) -> String {
    format!("{FACT_PREFIX}{machine_id}/{key}")
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, FactError> {
    serde_json::to_vec(value).map_err(|e| FactError::Storage(format!("cannot encode record: {e}")))
}

fn decode<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> Result<T, FactError> {
    serde_json::from_slice(bytes)
        .map_err(|e| FactError::Storage(format!("corrupt record '{key}': {e}")))
}

/// All rows whose key starts with `prefix`, in key order
fn scan_prefix<T>(table: &T, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, FactError>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    let mut rows = Vec::new();
    for entry in table.range::<&str>(prefix..).map_err(storage)? {
        let (key, value) = entry.map_err(storage)?;
        let key = key.value();
        if !key.starts_with(prefix) {
            break;
        }
        rows.push((key.to_string(), value.value().to_vec()));
    }
    Ok(rows)
}

fn read_facts<T>(table: &T, machine_id: &str, now: DateTime<Utc>) -> Result<BTreeMap<String, Fact>, FactError>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    let mut facts = BTreeMap::new();
    for (key, bytes) in scan_prefix(table, &fact_prefix(machine_id))? {
        let fact: Fact = decode(&key, &bytes)?;
        if !fact.is_expired_at(now) {
            facts.insert(fact.key.clone(), fact);
        }
    }
    Ok(facts)
}

fn read_machine<T>(table: &T, machine_id: &str, now: DateTime<Utc>) -> Result<Option<MachineFacts>, FactError>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    let key = machine_key(machine_id);
    let Some(bytes) = table.get(key.as_str()).map_err(storage)? else {
        return Ok(None);
    };
    let mut record: MachineFacts = decode(&key, bytes.value())?;
    record.facts = read_facts(table, machine_id, now)?;
    Ok(Some(record))
}

/// Replace the machine row and every fact row of `record`
fn write_machine(table: &mut Table<'_, &'static str, &'static [u8]>, record: &MachineFacts) -> Result<(), FactError> {
    let stale = scan_prefix(table, &fact_prefix(&record.machine_id))?;
    for (key, _) in stale {
        table.remove(key.as_str()).map_err(storage)?;
    }

    let header = MachineFacts {
        facts: BTreeMap::new(),
        ..record.clone()
    };
    table
        .insert(machine_key(&record.machine_id).as_str(), encode(&header)?.as_slice())
        .map_err(storage)?;

    for fact in record.facts.values() {
        table
            .insert(fact_key(&record.machine_id, &fact.key).as_str(), encode(fact)?.as_slice())
            .map_err(storage)?;
    }
    Ok(())
}

/// Embedded fact store
///
/// Safe for concurrent use: reads run in parallel, writes are serialized by
/// redb. Open it once per process and share it behind an `Arc`.
pub struct FactStore {
    path: PathBuf,
    db: RwLock<Option<Database>>,
}

impl std::fmt::Debug for FactStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FactStore")
            .field("path", &self.path)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl FactStore {
    /// Open or create the store inside `dir`
    ///
    /// # Errors
    /// Returns `FactError::Storage` if the directory cannot be created or the
    /// database file is unreadable or corrupt.
    #[instrument(skip_all, fields(dir = %dir.as_ref().display()))]
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, FactError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir).map_err(|e| {
            FactError::Storage(format!("cannot create {}: {e}", dir.display()))
        })?;

        let path = dir.join(DATABASE_FILE);
        let db = Database::create(&path).map_err(storage)?;

        let txn = db.begin_write().map_err(storage)?;
        txn.open_table(RECORDS).map_err(storage)?;
        txn.commit().map_err(storage)?;

        info!(path = %path.display(), "fact store opened");

        Ok(Self {
            path,
            db: RwLock::new(Some(db)),
        })
    }

    /// Database file path
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether `close` has been called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.db.read().map_or(true, |db| db.is_none())
    }

    /// Release the database. Closing twice is a no-op.
    ///
    /// # Errors
    /// Returns `FactError::Storage` if the lock is poisoned.
    pub fn close(&self) -> Result<(), FactError> {
        let mut guard = self
            .db
            .write()
            .map_err(|_| FactError::Storage("store lock poisoned".to_string()))?;
        if guard.take().is_some() {
            info!(path = %self.path.display(), "fact store closed");
        }
        Ok(())
    }

    fn with_db<T>(&self, f: impl FnOnce(&Database) -> Result<T, FactError>) -> Result<T, FactError> {
        let guard = self
            .db
            .read()
            .map_err(|_| FactError::Storage("store lock poisoned".to_string()))?;
        let db = guard.as_ref().ok_or(FactError::Closed)?;
        f(db)
    }

    fn read<T>(
        &self,
        f: impl FnOnce(&redb::ReadOnlyTable<&'static str, &'static [u8]>) -> Result<T, FactError>,
    ) -> Result<T, FactError> {
        self.with_db(|db| {
            let txn = db.begin_read().map_err(storage)?;
            let table = txn.open_table(RECORDS).map_err(storage)?;
            f(&table)
        })
    }

    /// Run `f` in a write transaction, committing unless `commit` is false
    fn write<T>(
        &self,
        commit: bool,
        f: impl FnOnce(&mut Table<'_, &'static str, &'static [u8]>) -> Result<T, FactError>,
    ) -> Result<T, FactError> {
        self.with_db(|db| {
            let txn = db.begin_write().map_err(storage)?;
            let value = {
                let mut table = txn.open_table(RECORDS).map_err(storage)?;
                f(&mut table)?
            };
            if commit {
                txn.commit().map_err(storage)?;
            } else {
                txn.abort().map_err(storage)?;
            }
            Ok(value)
        })
    }

    /// Upsert one fact
    ///
    /// A machine row is created from `fact.server` if none exists yet.
    ///
    /// # Errors
    /// Returns `FactError::Storage` on I/O failure or after `close`.
    #[instrument(skip(self, fact), fields(key = %key))]
    pub fn put(&self, machine_id: &str, key: &str, fact: &Fact) -> Result<(), FactError> {
        self.write(true, |table| {
            let header_key = machine_key(machine_id);
            if table.get(header_key.as_str()).map_err(storage)?.is_none() {
                let mut header = MachineFacts::new(fact.server.clone());
                header.machine_id = machine_id.to_string();
                table
                    .insert(header_key.as_str(), encode(&header)?.as_slice())
                    .map_err(storage)?;
            }

            let mut fact = fact.clone();
            fact.key = key.to_string();
            table
                .insert(fact_key(machine_id, key).as_str(), encode(&fact)?.as_slice())
                .map_err(storage)?;
            Ok(())
        })
    }

    /// Point lookup; expired facts read as absent
    ///
    /// # Errors
    /// Returns `FactError::Storage` on I/O failure, corruption or after `close`.
    pub fn get(&self, machine_id: &str, key: &str) -> Result<Option<Fact>, FactError> {
        self.read(|table| {
            let row_key = fact_key(machine_id, key);
            let Some(bytes) = table.get(row_key.as_str()).map_err(storage)? else {
                return Ok(None);
            };
            let fact: Fact = decode(&row_key, bytes.value())?;
            Ok((!fact.is_expired()).then_some(fact))
        })
    }

    /// Every live fact of one machine, ordered by key
    ///
    /// # Errors
    /// Returns `FactError::Storage` on I/O failure, corruption or after `close`.
    pub fn scan_by_machine(&self, machine_id: &str) -> Result<Vec<Fact>, FactError> {
        self.read(|table| Ok(read_facts(table, machine_id, Utc::now())?.into_values().collect()))
    }

    /// Replace one machine record and all of its facts
    ///
    /// # Errors
    /// Returns `FactError::Storage` on I/O failure or after `close`.
    #[instrument(skip(self, record), fields(machine = %record.machine_name))]
    pub fn put_machine(&self, record: &MachineFacts) -> Result<(), FactError> {
        self.write(true, |table| write_machine(table, record))?;
        debug!(facts = record.facts.len(), "machine record stored");
        Ok(())
    }

    /// Replace several machine records in one transaction
    ///
    /// # Errors
    /// Returns `FactError::Storage` on I/O failure or after `close`; nothing is
    /// written in that case.
    pub fn replace_machines(&self, records: &[MachineFacts]) -> Result<(), FactError> {
        self.write(true, |table| {
            for record in records {
                write_machine(table, record)?;
            }
            Ok(())
        })
    }

    /// Machine record by id, with its live facts
    ///
    /// # Errors
    /// Returns `FactError::Storage` on I/O failure, corruption or after `close`.
    pub fn get_machine(&self, machine_id: &str) -> Result<Option<MachineFacts>, FactError> {
        self.read(|table| read_machine(table, machine_id, Utc::now()))
    }

    /// Machine record by inventory name
    ///
    /// # Errors
    /// Returns `FactError::Storage` on I/O failure, corruption or after `close`.
    pub fn get_machine_by_name(&self, name: &str) -> Result<Option<MachineFacts>, FactError> {
        if let Some(record) = self.get_machine(&machine_id(name))? {
            return Ok(Some(record));
        }
        Ok(self
            .list_machines()?
            .into_iter()
            .find(|r| r.machine_name == name))
    }

    /// Every machine record, ordered by machine id
    ///
    /// # Errors
    /// Returns `FactError::Storage` on I/O failure, corruption or after `close`.
    pub fn list_machines(&self) -> Result<Vec<MachineFacts>, FactError> {
        self.read(|table| {
            let now = Utc::now();
            let mut records = Vec::new();
            for (key, bytes) in scan_prefix(table, MACHINE_PREFIX)? {
                let mut record: MachineFacts = decode(&key, &bytes)?;
                record.facts = read_facts(table, &record.machine_id, now)?;
                records.push(record);
            }
            Ok(records)
        })
    }

    /// Remove a machine and its facts; returns whether it existed
    ///
    /// # Errors
    /// Returns `FactError::Storage` on I/O failure or after `close`.
    #[instrument(skip(self))]
    pub fn delete_machine(&self, machine_id: &str) -> Result<bool, FactError> {
        self.write(true, |table| {
            for (key, _) in scan_prefix(table, &fact_prefix(machine_id))? {
                table.remove(key.as_str()).map_err(storage)?;
            }
            let existed = table
                .remove(machine_key(machine_id).as_str())
                .map_err(storage)?
                .is_some();
            Ok(existed)
        })
    }

    /// Machine records matching `query`
    ///
    /// # Errors
    /// Returns `FactError::Storage` on I/O failure, corruption or after `close`.
    #[instrument(skip(self), fields(query = %query))]
    pub fn query(&self, query: &FactQuery) -> Result<Vec<MachineFacts>, FactError> {
        let limit = if query.limit == 0 { usize::MAX } else { query.limit };
        let matches: Vec<MachineFacts> = self
            .list_machines()?
            .into_iter()
            .filter(|r| query.matches(r))
            .take(limit)
            .collect();
        debug!(matches = matches.len(), "query finished");
        Ok(matches)
    }

    /// Write a validated batch in a single transaction
    ///
    /// # Errors
    /// `FactError::Validation` if a record names an unknown machine id, or
    /// `FactError::Storage`. Nothing is written on error.
    #[instrument(skip(self, batch), fields(records = batch.records.len()))]
    pub fn import(&self, batch: ImportBatch, options: &ImportOptions) -> Result<ImportReport, FactError> {
        let mut report = ImportReport {
            dry_run: options.dry_run,
            ..ImportReport::default()
        };

        self.write(!options.dry_run, |table| {
            let now = Utc::now();
            for (machine, incoming) in batch.records {
                let id = match &machine {
                    MachineRef::Name(name) if incoming.machine_id.is_empty() => machine_id(name),
                    MachineRef::Name(_) => incoming.machine_id.clone(),
                    MachineRef::Id(id) => id.clone(),
                };

                let mut record = match (read_machine(table, &id, now)?, &machine) {
                    (Some(mut existing), _) => {
                        overlay_identity(&mut existing, &incoming);
                        existing.tags.extend(incoming.tags.clone());
                        existing.updated_at = existing.updated_at.max(incoming.updated_at);
                        existing
                    }
                    (None, MachineRef::Id(id)) => {
                        return Err(FactError::Validation(format!("unknown machine id '{id}'")));
                    }
                    (None, MachineRef::Name(_)) => MachineFacts {
                        machine_id: id.clone(),
                        facts: BTreeMap::new(),
                        ..incoming.clone()
                    },
                };

                for (key, mut fact) in incoming.facts {
                    if fact.server.is_empty() {
                        fact.server.clone_from(&record.machine_name);
                    }
                    if record.facts.contains_key(&key) && !options.override_existing {
                        report.skipped += 1;
                        continue;
                    }
                    record.facts.insert(key, fact);
                    report.imported += 1;
                }

                write_machine(table, &record)?;
                report.machines += 1;
            }
            Ok(())
        })?;

        info!(
            machines = report.machines,
            imported = report.imported,
            skipped = report.skipped,
            dry_run = report.dry_run,
            "import finished"
        );
        Ok(report)
    }

    /// Parse, validate and import a JSON document
    ///
    /// # Errors
    /// `FactError::Parse` for malformed JSON, `FactError::Validation` for bad
    /// records, `FactError::Storage` for I/O. Nothing is written on error.
    pub fn import_json(&self, mut reader: impl Read, options: &ImportOptions) -> Result<ImportReport, FactError> {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        let batch = parse_document(&bytes)?;
        self.import(batch, options)
    }

    /// Write the whole store as an export envelope; returns the machine count
    ///
    /// # Errors
    /// Returns `FactError::Storage` on read failure or `FactError::Io` if the
    /// writer fails.
    pub fn export_json(&self, writer: impl Write) -> Result<usize, FactError> {
        let envelope = ExportEnvelope::new(self.list_machines()?);
        let count = envelope.machines.len();
        serde_json::to_writer_pretty(writer, &envelope).map_err(|e| FactError::Io(e.to_string()))?;
        Ok(count)
    }

    /// Remove every record; returns the number of facts removed
    ///
    /// # Errors
    /// Returns `FactError::Storage` on I/O failure or after `close`.
    #[instrument(skip(self))]
    pub fn clear_cache(&self) -> Result<usize, FactError> {
        let removed = self.write(true, |table| {
            let mut facts = 0;
            for (key, _) in scan_prefix(table, "")? {
                if key.starts_with(FACT_PREFIX) {
                    facts += 1;
                }
                table.remove(key.as_str()).map_err(storage)?;
            }
            Ok(facts)
        })?;
        warn!(removed, "fact cache cleared");
        Ok(removed)
    }

    /// Remove expired facts; returns how many were removed
    ///
    /// # Errors
    /// Returns `FactError::Storage` on I/O failure, corruption or after `close`.
    #[instrument(skip(self))]
    pub fn clear_expired_cache(&self) -> Result<usize, FactError> {
        let now = Utc::now();
        let removed = self.write(true, |table| {
            let mut expired = Vec::new();
            for (key, bytes) in scan_prefix(table, FACT_PREFIX)? {
                let fact: Fact = decode(&key, &bytes)?;
                if fact.is_expired_at(now) {
                    expired.push(key);
                }
            }
            for key in &expired {
                table.remove(key.as_str()).map_err(storage)?;
            }
            Ok(expired.len())
        })?;
        info!(removed, "expired facts removed");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::TimeDelta;
    use tempfile::TempDir;

    use super::*;
    use crate::types::{FactSource, FactValue};

    fn store() -> (TempDir, FactStore) {
        let dir = TempDir::new().unwrap();
        let store = FactStore::open(dir.path()).unwrap();
        (dir, store)
    }

    fn web1() -> MachineFacts {
        let mut record = MachineFacts::new("web1");
        record.os = "debian".into();
        record.tags = BTreeMap::from([("role".to_string(), "web".to_string())]);
        record.insert(Fact::new("web1", "cores", 4_i64, FactSource::Ssh));
        record.insert(Fact::new("web1", "kernel", "6.1.0", FactSource::Ssh));
        record
    }

    #[test]
    fn test_put_and_get() {
        let (_dir, store) = store();
        let id = machine_id("web1");
        let fact = Fact::new("web1", "role", "web", FactSource::Local);

        store.put(&id, "role", &fact).unwrap();

        let got = store.get(&id, "role").unwrap().unwrap();
        assert_eq!(got.value, FactValue::from("web"));
        assert!(store.get(&id, "missing").unwrap().is_none());
        // put creates the machine row
        assert_eq!(store.get_machine(&id).unwrap().unwrap().machine_name, "web1");
    }

    #[test]
    fn test_machine_round_trip() {
        let (_dir, store) = store();
        let record = web1();
        store.put_machine(&record).unwrap();

        let loaded = store.get_machine_by_name("web1").unwrap().unwrap();
        assert_eq!(loaded, record);
        assert_eq!(store.scan_by_machine(&record.machine_id).unwrap().len(), 2);
    }

    #[test]
    fn test_put_machine_replaces_facts() {
        let (_dir, store) = store();
        store.put_machine(&web1()).unwrap();

        let mut smaller = MachineFacts::new("web1");
        smaller.insert(Fact::new("web1", "cores", 8_i64, FactSource::Ssh));
        store.put_machine(&smaller).unwrap();

        let facts = store.scan_by_machine(&machine_id("web1")).unwrap();
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].value, FactValue::Integer(8));
    }

    #[test]
    fn test_expired_fact_reads_as_absent() {
        let (_dir, store) = store();
        let id = machine_id("web1");
        let stale = Fact::new("web1", "old", "x", FactSource::Local)
            .with_timestamp(Utc::now() - TimeDelta::seconds(10))
            .with_ttl(1);
        store.put(&id, "old", &stale).unwrap();

        assert!(store.get(&id, "old").unwrap().is_none());
        assert!(store.scan_by_machine(&id).unwrap().is_empty());
        assert_eq!(store.clear_expired_cache().unwrap(), 1);
        assert_eq!(store.clear_expired_cache().unwrap(), 0);
    }

    #[test]
    fn test_delete_machine() {
        let (_dir, store) = store();
        let record = web1();
        store.put_machine(&record).unwrap();

        assert!(store.delete_machine(&record.machine_id).unwrap());
        assert!(!store.delete_machine(&record.machine_id).unwrap());
        assert!(store.get(&record.machine_id, "cores").unwrap().is_none());
    }

    #[test]
    fn test_query_limit() {
        let (_dir, store) = store();
        for name in ["a", "b", "c"] {
            store.put_machine(&MachineFacts::new(name)).unwrap();
        }

        assert_eq!(store.query(&FactQuery::new()).unwrap().len(), 3);
        assert_eq!(store.query(&FactQuery::new().limit(2)).unwrap().len(), 2);
    }

    #[test]
    fn test_clear_cache_counts_facts() {
        let (_dir, store) = store();
        store.put_machine(&web1()).unwrap();

        assert_eq!(store.clear_cache().unwrap(), 2);
        assert!(store.list_machines().unwrap().is_empty());
    }

    #[test]
    fn test_operations_after_close_fail() {
        let (_dir, store) = store();
        store.close().unwrap();
        store.close().unwrap();

        assert!(store.is_closed());
        let err = store.list_machines().unwrap_err();
        assert_eq!(err, FactError::Closed);
        assert!(err.is_storage());
    }

    #[test]
    fn test_import_skips_existing_without_override() {
        let (_dir, store) = store();
        store.put_machine(&web1()).unwrap();

        let doc = br#"[
            {"machine_name": "web1", "key": "cores", "value": 16},
            {"machine_name": "web1", "key": "rack", "value": "r2"}
        ]"#;

        let report = store.import_json(&doc[..], &ImportOptions::default()).unwrap();
        assert_eq!(report.imported, 1);
        assert_eq!(report.skipped, 1);

        let id = machine_id("web1");
        assert_eq!(store.get(&id, "cores").unwrap().unwrap().value, FactValue::Integer(4));

        let report = store
            .import_json(
                &doc[..],
                &ImportOptions {
                    override_existing: true,
                    ..ImportOptions::default()
                },
            )
            .unwrap();
        assert_eq!(report.imported, 2);
        assert_eq!(store.get(&id, "cores").unwrap().unwrap().value, FactValue::Integer(16));
    }

    #[test]
    fn test_import_dry_run_writes_nothing() {
        let (_dir, store) = store();
        let doc = br#"{"web1": {"role": "web"}}"#;

        let report = store
            .import_json(
                &doc[..],
                &ImportOptions {
                    dry_run: true,
                    ..ImportOptions::default()
                },
            )
            .unwrap();

        assert!(report.dry_run);
        assert_eq!(report.imported, 1);
        assert!(store.list_machines().unwrap().is_empty());
    }

    #[test]
    fn test_import_by_unknown_machine_id_fails_atomically() {
        let (_dir, store) = store();
        let doc = br#"[
            {"machine_name": "web1", "key": "role", "value": "web"},
            {"machine_id": "ffffffffffffffff", "key": "role", "value": "db"}
        ]"#;

        let err = store.import_json(&doc[..], &ImportOptions::default()).unwrap_err();
        assert!(matches!(err, FactError::Validation(_)));
        assert!(store.list_machines().unwrap().is_empty());
    }

    #[test]
    fn test_import_by_known_machine_id() {
        let (_dir, store) = store();
        store.put_machine(&web1()).unwrap();
        let doc = format!(
            r#"[{{"machine_id": "{}", "key": "rack", "value": "r9"}}]"#,
            machine_id("web1")
        );

        store.import_json(doc.as_bytes(), &ImportOptions::default()).unwrap();

        let fact = store.get(&machine_id("web1"), "rack").unwrap().unwrap();
        assert_eq!(fact.server, "web1");
    }
}
