//! Import and export documents
//!
//! Accepted import shapes:
//! - the export envelope `{ "version", "exported_at", "machines": [...] }`
//! - an array of machine records
//! - an array of flat records `{ machine_name | machine_id, key, value, source?, ttl? }`
//! - an object mapping machine name to `{ key: value }`
//!
//! A document is parsed and validated as a whole before anything is written.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::FactError;
use crate::types::{Fact, FactSource, FactValue, MachineFacts, machine_id};

/// Version written into export envelopes
pub const EXPORT_VERSION: u32 = 1;

/// Full-store export document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportEnvelope {
    /// Document format, currently [`EXPORT_VERSION`]
    pub version: u32,
    pub exported_at: DateTime<Utc>,
    /// Every stored record, ordered by machine id
    pub machines: Vec<MachineFacts>,
}

impl ExportEnvelope {
    /// Wrap `machines` stamped now
    #[must_use]
    pub fn new(machines: Vec<MachineFacts>) -> Self {
        Self {
            version: EXPORT_VERSION,
            exported_at: Utc::now(),
            machines,
        }
    }
}

/// Import behaviour
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportOptions {
    /// Validate and count without writing
    pub dry_run: bool,
    /// Overwrite facts that already exist; otherwise they are skipped
    pub override_existing: bool,
}

/// What an import did, or would have done
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    /// Machines touched
    pub machines: usize,
    /// Facts written
    pub imported: usize,
    /// Facts left alone because they already existed
    pub skipped: usize,
    /// Nothing was written
    pub dry_run: bool,
}

/// Machine identity carried by an import record
///
/// Flat records may name a machine only by id; those are resolved against
/// the store before writing.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum MachineRef {
    /// Inventory name; the id is derived from it
    Name(String),
    /// Store id, looked up as given
    Id(String),
}

/// A validated import document grouped per machine
#[derive(Debug, Clone, PartialEq)]
pub struct ImportBatch {
    pub records: Vec<(MachineRef, MachineFacts)>,
}

impl ImportBatch {
    /// Total facts across all records
    #[must_use]
    pub fn fact_count(&self) -> usize {
        self.records.iter().map(|(_, r)| r.facts.len()).sum()
    }
}

#[derive(Debug, Deserialize)]
struct FlatRecord {
    #[serde(default, alias = "MachineName")]
    machine_name: Option<String>,
    #[serde(default, alias = "MachineID")]
    machine_id: Option<String>,
    #[serde(default, alias = "Key")]
    key: String,
    #[serde(alias = "Value")]
    value: FactValue,
    #[serde(default, alias = "Source")]
    source: Option<FactSource>,
    #[serde(default, alias = "TTL")]
    ttl: Option<u64>,
    #[serde(default, alias = "Timestamp")]
    timestamp: Option<DateTime<Utc>>,
}

/// Parse and validate an import document
///
/// # Errors
/// `FactError::Parse` if `bytes` is not JSON, `FactError::Validation` if
/// the shape is unrecognised or any record is invalid.
pub fn parse_document(bytes: &[u8]) -> Result<ImportBatch, FactError> {
    let document: Value =
        serde_json::from_slice(bytes).map_err(|e| FactError::Parse(e.to_string()))?;

    if document.get("machines").is_some() {
        let envelope: ExportEnvelope = serde_json::from_value(document)
            .map_err(|e| FactError::Validation(format!("invalid export envelope: {e}")))?;
        return Ok(ImportBatch {
            records: machine_records(envelope.machines)?,
        });
    }

    let records = match document {
        Value::Array(items) if items.iter().all(is_flat_record) => flat_records(items)?,
        Value::Array(items) => {
            let machines = items
                .into_iter()
                .enumerate()
                .map(|(i, item)| {
                    serde_json::from_value::<MachineFacts>(item)
                        .map_err(|e| FactError::Validation(format!("record {i}: {e}")))
                })
                .collect::<Result<Vec<_>, _>>()?;
            machine_records(machines)?
        }
        Value::Object(map) => name_map(map)?,
        other => {
            return Err(FactError::Validation(format!(
                "expected an object or an array, got {}",
                json_type(&other)
            )));
        }
    };

    Ok(ImportBatch { records })
}

fn is_flat_record(value: &Value) -> bool {
    value
        .as_object()
        .is_some_and(|o| o.contains_key("key") || o.contains_key("Key"))
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn machine_records(machines: Vec<MachineFacts>) -> Result<Vec<(MachineRef, MachineFacts)>, FactError> {
    let mut grouped: BTreeMap<String, MachineFacts> = BTreeMap::new();

    for (i, mut record) in machines.into_iter().enumerate() {
        if record.machine_name.trim().is_empty() {
            return Err(FactError::Validation(format!(
                "record {i} has no machine_name"
            )));
        }
        if record.machine_id.is_empty() {
            record.machine_id = machine_id(&record.machine_name);
        }

        let mut facts = BTreeMap::new();
        for (map_key, mut fact) in std::mem::take(&mut record.facts) {
            if fact.key.is_empty() {
                fact.key.clone_from(&map_key);
            }
            if fact.key.trim().is_empty() {
                return Err(FactError::Validation(format!(
                    "machine '{}' has a fact with an empty key",
                    record.machine_name
                )));
            }
            if fact.server.is_empty() {
                fact.server.clone_from(&record.machine_name);
            }
            facts.insert(fact.key.clone(), fact);
        }
        record.facts = facts;

        match grouped.get_mut(&record.machine_name) {
            Some(existing) => existing.facts.extend(record.facts),
            None => {
                grouped.insert(record.machine_name.clone(), record);
            }
        }
    }

    Ok(grouped
        .into_values()
        .map(|r| (MachineRef::Name(r.machine_name.clone()), r))
        .collect())
}

fn flat_records(items: Vec<Value>) -> Result<Vec<(MachineRef, MachineFacts)>, FactError> {
    let mut grouped: BTreeMap<MachineRef, MachineFacts> = BTreeMap::new();

    for (i, item) in items.into_iter().enumerate() {
        let record: FlatRecord = serde_json::from_value(item)
            .map_err(|e| FactError::Validation(format!("record {i}: {e}")))?;

        let name = record.machine_name.filter(|n| !n.trim().is_empty());
        let id = record.machine_id.filter(|n| !n.trim().is_empty());
        let machine = match (name, id) {
            (Some(name), _) => MachineRef::Name(name),
            (None, Some(id)) => MachineRef::Id(id),
            (None, None) => {
                return Err(FactError::Validation(format!(
                    "record {i} has no machine_name"
                )));
            }
        };

        if record.key.trim().is_empty() {
            return Err(FactError::Validation(format!("record {i} has an empty key")));
        }

        let entry = grouped.entry(machine.clone()).or_insert_with(|| match &machine {
            MachineRef::Name(name) => MachineFacts::new(name.clone()),
            MachineRef::Id(id) => {
                let mut r = MachineFacts::new(String::new());
                r.machine_id.clone_from(id);
                r
            }
        });

        let mut fact = Fact::new(
            entry.machine_name.clone(),
            record.key,
            record.value,
            record.source.unwrap_or_default(),
        )
        .with_ttl(record.ttl.unwrap_or(0));
        if let Some(ts) = record.timestamp {
            fact = fact.with_timestamp(ts);
        }
        entry.insert(fact);
    }

    Ok(grouped.into_iter().collect())
}

fn name_map(map: serde_json::Map<String, Value>) -> Result<Vec<(MachineRef, MachineFacts)>, FactError> {
    let mut records = Vec::with_capacity(map.len());

    for (name, facts) in map {
        if name.trim().is_empty() {
            return Err(FactError::Validation("empty machine name".to_string()));
        }
        let Value::Object(facts) = facts else {
            return Err(FactError::Validation(format!(
                "facts for '{name}' must be an object, got {}",
                json_type(&facts)
            )));
        };

        let mut record = MachineFacts::new(name.clone());
        for (key, value) in facts {
            if key.trim().is_empty() {
                return Err(FactError::Validation(format!(
                    "machine '{name}' has a fact with an empty key"
                )));
            }
            record.insert(Fact::new(name.clone(), key, FactValue::from(value), FactSource::Import));
        }
        records.push((MachineRef::Name(name), record));
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_json_is_parse_error() {
        let err = parse_document(b"{ not json").unwrap_err();
        assert!(matches!(err, FactError::Parse(_)));
    }

    #[test]
    fn test_flat_records_group_by_machine() {
        let batch = parse_document(
            br#"[
                {"machine_name": "web1", "key": "role", "value": "web"},
                {"MachineName": "web1", "Key": "rack", "Value": 4, "ttl": 60},
                {"machine_name": "db1", "key": "role", "value": "db", "source": "opentofu"}
            ]"#,
        )
        .unwrap();

        assert_eq!(batch.records.len(), 2);
        assert_eq!(batch.fact_count(), 3);

        let (_, web1) = batch
            .records
            .iter()
            .find(|(m, _)| *m == MachineRef::Name("web1".into()))
            .unwrap();
        assert_eq!(web1.facts["rack"].value, FactValue::Integer(4));
        assert_eq!(web1.facts["rack"].ttl, 60);
        assert_eq!(web1.facts["role"].source, FactSource::Import);
    }

    #[test]
    fn test_missing_machine_name_fails_validation() {
        let err = parse_document(
            br#"[
                {"machine_name": "web1", "key": "role", "value": "web"},
                {"key": "role", "value": "db"}
            ]"#,
        )
        .unwrap_err();
        assert!(matches!(err, FactError::Validation(msg) if msg.contains("record 1")));
    }

    #[test]
    fn test_empty_key_fails_validation() {
        let err = parse_document(br#"[{"machine_name": "web1", "key": " ", "value": 1}]"#)
            .unwrap_err();
        assert!(matches!(err, FactError::Validation(_)));
    }

    #[test]
    fn test_machine_id_only_record() {
        let batch =
            parse_document(br#"[{"machine_id": "abc123", "key": "k", "value": true}]"#).unwrap();
        assert_eq!(batch.records[0].0, MachineRef::Id("abc123".into()));
    }

    #[test]
    fn test_name_map_document() {
        let batch = parse_document(br#"{"web1": {"role": "web", "cores": 8}}"#).unwrap();

        let (machine, record) = &batch.records[0];
        assert_eq!(*machine, MachineRef::Name("web1".into()));
        assert_eq!(record.machine_id, machine_id("web1"));
        assert_eq!(record.facts["cores"].value, FactValue::Integer(8));
    }

    #[test]
    fn test_name_map_rejects_non_object_facts() {
        let err = parse_document(br#"{"web1": ["role"]}"#).unwrap_err();
        assert!(matches!(err, FactError::Validation(_)));
    }

    #[test]
    fn test_machine_record_array() {
        let batch = parse_document(
            br#"[{"machine_name": "web1", "os": "debian", "facts": {"role": {"value": "web"}}}]"#,
        )
        .unwrap();

        let (_, record) = &batch.records[0];
        assert_eq!(record.os, "debian");
        assert_eq!(record.facts["role"].key, "role");
        assert_eq!(record.facts["role"].server, "web1");
    }

    #[test]
    fn test_envelope_document() {
        let envelope = ExportEnvelope::new(vec![MachineFacts::new("web1")]);
        let bytes = serde_json::to_vec(&envelope).unwrap();

        let batch = parse_document(&bytes).unwrap();
        assert_eq!(batch.records.len(), 1);
    }

    #[test]
    fn test_scalar_document_rejected() {
        let err = parse_document(b"42").unwrap_err();
        assert!(matches!(err, FactError::Validation(msg) if msg.contains("a number")));
    }
}
