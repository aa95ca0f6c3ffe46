//! Fact type definitions

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ============================================================================
// Values
// ============================================================================

/// A structured fact value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "serde_json::Value", into = "serde_json::Value")]
pub enum FactValue {
    /// JSON `null`
    Null,
    Bool(bool),
    /// Any JSON number that fits in an `i64`
    Integer(i64),
    /// Any other JSON number
    Float(f64),
    String(String),
    List(Vec<FactValue>),
    /// Object with keys kept sorted
    Map(BTreeMap<String, FactValue>),
}

impl FactValue {
    /// String content, if this is a string
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FactValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Integer content, if this is an integer
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FactValue::Integer(n) => Some(*n),
            _ => None,
        }
    }

    /// Type name for display
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            FactValue::Null => "null",
            FactValue::Bool(_) => "bool",
            FactValue::Integer(_) => "integer",
            FactValue::Float(_) => "float",
            FactValue::String(_) => "string",
            FactValue::List(_) => "list",
            FactValue::Map(_) => "map",
        }
    }
}

impl From<serde_json::Value> for FactValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => FactValue::Null,
            serde_json::Value::Bool(b) => FactValue::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => FactValue::Integer(i),
                None => FactValue::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => FactValue::String(s),
            serde_json::Value::Array(items) => {
                FactValue::List(items.into_iter().map(FactValue::from).collect())
            }
            serde_json::Value::Object(map) => FactValue::Map(
                map.into_iter()
                    .map(|(k, v)| (k, FactValue::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<FactValue> for serde_json::Value {
    fn from(value: FactValue) -> Self {
        match value {
            FactValue::Null => serde_json::Value::Null,
            FactValue::Bool(b) => serde_json::Value::Bool(b),
            FactValue::Integer(i) => serde_json::Value::from(i),
            FactValue::Float(f) => serde_json::Number::from_f64(f)
                .map_or(serde_json::Value::Null, serde_json::Value::Number),
            FactValue::String(s) => serde_json::Value::String(s),
            FactValue::List(items) => {
                serde_json::Value::Array(items.into_iter().map(Into::into).collect())
            }
            FactValue::Map(map) => {
                serde_json::Value::Object(map.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

impl From<&str> for FactValue {
    fn from(s: &str) -> Self {
        FactValue::String(s.to_string())
    }
}

impl From<String> for FactValue {
    fn from(s: String) -> Self {
        FactValue::String(s)
    }
}

impl From<i64> for FactValue {
    fn from(n: i64) -> Self {
        FactValue::Integer(n)
    }
}

impl From<bool> for FactValue {
    fn from(b: bool) -> Self {
        FactValue::Bool(b)
    }
}

impl fmt::Display for FactValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FactValue::String(s) => f.write_str(s),
            other => write!(f, "{}", serde_json::Value::from(other.clone())),
        }
    }
}

// ============================================================================
// Facts
// ============================================================================

/// Where a fact came from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FactSource {
    /// Gathered over an SSH channel
    Ssh,
    /// Gathered from the host running spooky
    Local,
    /// Read from HCL configuration
    Hcl,
    /// Read from OpenTofu state
    Opentofu,
    /// Loaded by `facts import`
    #[default]
    Import,
}

impl fmt::Display for FactSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FactSource::Ssh => "ssh",
            FactSource::Local => "local",
            FactSource::Hcl => "hcl",
            FactSource::Opentofu => "opentofu",
            FactSource::Import => "import",
        };
        f.write_str(s)
    }
}

/// One piece of machine metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    /// Fact name, unique within a machine
    #[serde(default, alias = "Key")]
    pub key: String,
    /// Fact value
    #[serde(alias = "Value")]
    pub value: FactValue,
    /// Provenance
    #[serde(default, alias = "Source")]
    pub source: FactSource,
    /// Machine name the fact describes
    #[serde(default, alias = "Server")]
    pub server: String,
    /// When the fact was recorded
    #[serde(default = "Utc::now", alias = "Timestamp")]
    pub timestamp: DateTime<Utc>,
    /// Lifetime in seconds, 0 for no expiry
    #[serde(default, alias = "TTL")]
    pub ttl: u64,
}

impl Fact {
    /// Create a fact stamped now, without expiry
    pub fn new(
        server: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<FactValue>,
        source: FactSource,
    ) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            source,
            server: server.into(),
            timestamp: Utc::now(),
            ttl: 0,
        }
    }

    /// Set a TTL in seconds
    #[must_use]
    pub fn with_ttl(mut self, seconds: u64) -> Self {
        self.ttl = seconds;
        self
    }

    /// Set the recording time
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Expired iff it has a TTL and `now > timestamp + ttl`
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        if self.ttl == 0 {
            return false;
        }
        let ttl = i64::try_from(self.ttl).unwrap_or(i64::MAX);
        match self.timestamp.checked_add_signed(chrono::TimeDelta::seconds(ttl)) {
            Some(expires_at) => now > expires_at,
            None => false,
        }
    }

    /// Whether the fact is expired right now
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

/// Transient result of one collection pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactCollection {
    /// Machine name, or `local`
    pub server: String,
    /// When the pass finished
    pub timestamp: DateTime<Utc>,
    /// Facts by key
    pub facts: BTreeMap<String, Fact>,
}

impl FactCollection {
    /// Start an empty collection for `server`
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            timestamp: Utc::now(),
            facts: BTreeMap::new(),
        }
    }

    /// Insert a fact, keyed by its `key`
    pub fn insert(&mut self, fact: Fact) {
        self.facts.insert(fact.key.clone(), fact);
    }

    /// Look up a fact value
    #[must_use]
    pub fn value(&self, key: &str) -> Option<&FactValue> {
        self.facts.get(key).map(|f| &f.value)
    }

    fn string(&self, key: &str) -> String {
        self.value(key)
            .and_then(FactValue::as_str)
            .unwrap_or_default()
            .to_string()
    }
}

// ============================================================================
// Machine records
// ============================================================================

/// Stable machine id: first 16 hex chars of the sha256 of the machine name
#[must_use]
pub fn machine_id(machine_name: &str) -> String {
    let digest = Sha256::digest(machine_name.as_bytes());
    let mut id = hex::encode(digest);
    id.truncate(16);
    id
}

/// Persisted facts for one machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineFacts {
    /// Stable identity, derived from the machine name when absent
    #[serde(default, alias = "MachineID")]
    pub machine_id: String,
    /// Inventory name
    #[serde(default, alias = "MachineName")]
    pub machine_name: String,
    /// OS-level machine id (`/etc/machine-id`)
    #[serde(default, alias = "SystemID")]
    pub system_id: String,
    #[serde(default, alias = "Hostname")]
    pub hostname: String,
    #[serde(default, alias = "IPAddresses")]
    pub ip_addresses: Vec<String>,
    #[serde(default, alias = "PrimaryIP")]
    pub primary_ip: String,
    #[serde(default, alias = "OS")]
    pub os: String,
    #[serde(default, alias = "OSVersion")]
    pub os_version: String,
    /// Project the machine belongs to
    #[serde(default, alias = "ProjectName")]
    pub project_name: String,
    #[serde(default, alias = "Tags")]
    pub tags: BTreeMap<String, String>,
    /// Facts by key
    #[serde(default, alias = "Facts")]
    pub facts: BTreeMap<String, Fact>,
    #[serde(default = "Utc::now", alias = "UpdatedAt")]
    pub updated_at: DateTime<Utc>,
}

impl MachineFacts {
    /// Empty record for `machine_name`
    pub fn new(machine_name: impl Into<String>) -> Self {
        let machine_name = machine_name.into();
        Self {
            machine_id: machine_id(&machine_name),
            machine_name,
            system_id: String::new(),
            hostname: String::new(),
            ip_addresses: Vec::new(),
            primary_ip: String::new(),
            os: String::new(),
            os_version: String::new(),
            project_name: String::new(),
            tags: BTreeMap::new(),
            facts: BTreeMap::new(),
            updated_at: Utc::now(),
        }
    }

    /// Build a record from a collection pass
    #[must_use]
    pub fn from_collection(machine_name: &str, collection: FactCollection) -> Self {
        let mut record = Self::new(machine_name);
        record.system_id = collection.string("system_id");
        record.hostname = collection.string("hostname");
        record.os = collection.string("os");
        record.os_version = collection.string("os_version");
        if let Some(FactValue::List(ips)) = collection.value("ip_addresses") {
            record.ip_addresses = ips.iter().filter_map(|v| v.as_str().map(String::from)).collect();
        }
        record.primary_ip = record.ip_addresses.first().cloned().unwrap_or_default();
        record.updated_at = collection.timestamp;
        record.facts = collection.facts;
        record
    }

    /// Add or replace a fact
    pub fn insert(&mut self, fact: Fact) {
        self.facts.insert(fact.key.clone(), fact);
    }

    /// Look up a fact that has not expired
    #[must_use]
    pub fn fact(&self, key: &str) -> Option<&Fact> {
        self.facts.get(key).filter(|f| !f.is_expired())
    }

    /// Drop facts that have expired at `now`, returning how many were removed
    pub fn prune_expired(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.facts.len();
        self.facts.retain(|_, f| !f.is_expired_at(now));
        before - self.facts.len()
    }
}
