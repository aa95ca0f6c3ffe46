//! Merge policy between a fresh collection and the stored record

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::FactError;
use crate::types::MachineFacts;

/// How newly gathered facts combine with stored ones
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeMode {
    /// New record replaces the stored one
    #[default]
    Replace,
    /// Stored facts kept, new values win on conflict
    Merge,
    /// Stored facts kept, new facts only fill missing keys
    Append,
    /// Only the listed keys are taken from the new record
    Select(Vec<String>),
}

impl MergeMode {
    /// Combine `incoming` with `existing` under this policy
    #[must_use]
    pub fn apply(&self, existing: Option<MachineFacts>, incoming: MachineFacts) -> MachineFacts {
        let Some(mut merged) = existing else {
            return match self {
                MergeMode::Select(keys) => {
                    let mut record = incoming;
                    record.facts.retain(|k, _| keys.contains(k));
                    record
                }
                _ => incoming,
            };
        };

        match self {
            MergeMode::Replace => return incoming,
            MergeMode::Select(keys) => {
                for (key, fact) in incoming.facts {
                    if keys.contains(&key) {
                        merged.facts.insert(key, fact);
                    }
                }
                merged.updated_at = incoming.updated_at;
                return merged;
            }
            MergeMode::Merge | MergeMode::Append => {}
        }

        overlay_identity(&mut merged, &incoming);

        let prefer_new = *self == MergeMode::Merge;
        for (key, fact) in incoming.facts {
            if prefer_new {
                merged.facts.insert(key, fact);
            } else {
                merged.facts.entry(key).or_insert(fact);
            }
        }
        for (key, value) in incoming.tags {
            if prefer_new {
                merged.tags.insert(key, value);
            } else {
                merged.tags.entry(key).or_insert(value);
            }
        }

        merged.updated_at = incoming.updated_at;
        merged
    }
}

/// Copy non-empty identity fields from `source`
pub(crate) fn overlay_identity(target: &mut MachineFacts, source: &MachineFacts) {
    fn set(field: &mut String, value: &str) {
        if !value.is_empty() {
            *field = value.to_string();
        }
    }

    set(&mut target.system_id, &source.system_id);
    set(&mut target.hostname, &source.hostname);
    set(&mut target.primary_ip, &source.primary_ip);
    set(&mut target.os, &source.os);
    set(&mut target.os_version, &source.os_version);
    set(&mut target.project_name, &source.project_name);
    if !source.ip_addresses.is_empty() {
        target.ip_addresses.clone_from(&source.ip_addresses);
    }
}

impl FromStr for MergeMode {
    type Err = FactError;

    /// `replace`, `merge`, `append`, or `select:key1,key2`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "replace" => Ok(MergeMode::Replace),
            "merge" => Ok(MergeMode::Merge),
            "append" => Ok(MergeMode::Append),
            other => match other.strip_prefix("select:") {
                Some(keys) => {
                    let keys: Vec<String> = keys
                        .split(',')
                        .map(str::trim)
                        .filter(|k| !k.is_empty())
                        .map(String::from)
                        .collect();
                    if keys.is_empty() {
                        Err(FactError::Validation("select needs at least one key".into()))
                    } else {
                        Ok(MergeMode::Select(keys))
                    }
                }
                None => Err(FactError::Validation(format!("unknown merge mode '{other}'"))),
            },
        }
    }
}

impl fmt::Display for MergeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeMode::Replace => f.write_str("replace"),
            MergeMode::Merge => f.write_str("merge"),
            MergeMode::Append => f.write_str("append"),
            MergeMode::Select(keys) => write!(f, "select:{}", keys.join(",")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Fact, FactSource, FactValue};

    fn record(facts: &[(&str, &str)]) -> MachineFacts {
        let mut r = MachineFacts::new("web1");
        for (k, v) in facts {
            r.insert(Fact::new("web1", *k, *v, FactSource::Ssh));
        }
        r
    }

    fn value<'a>(r: &'a MachineFacts, key: &str) -> Option<&'a FactValue> {
        r.facts.get(key).map(|f| &f.value)
    }

    #[test]
    fn test_replace_drops_old_keys() {
        let merged = MergeMode::Replace.apply(
            Some(record(&[("a", "1"), ("b", "1")])),
            record(&[("a", "2")]),
        );
        assert_eq!(value(&merged, "a"), Some(&FactValue::from("2")));
        assert!(value(&merged, "b").is_none());
    }

    #[test]
    fn test_merge_keeps_old_and_prefers_new() {
        let merged = MergeMode::Merge.apply(
            Some(record(&[("a", "1"), ("b", "1")])),
            record(&[("a", "2"), ("c", "2")]),
        );
        assert_eq!(value(&merged, "a"), Some(&FactValue::from("2")));
        assert_eq!(value(&merged, "b"), Some(&FactValue::from("1")));
        assert_eq!(value(&merged, "c"), Some(&FactValue::from("2")));
    }

    #[test]
    fn test_append_never_overwrites() {
        let merged = MergeMode::Append.apply(
            Some(record(&[("a", "1")])),
            record(&[("a", "2"), ("c", "2")]),
        );
        assert_eq!(value(&merged, "a"), Some(&FactValue::from("1")));
        assert_eq!(value(&merged, "c"), Some(&FactValue::from("2")));
    }

    #[test]
    fn test_select_only_touches_listed_keys() {
        let mode: MergeMode = "select:a".parse().unwrap();
        let merged = mode.apply(
            Some(record(&[("a", "1"), ("b", "1")])),
            record(&[("a", "2"), ("b", "2")]),
        );
        assert_eq!(value(&merged, "a"), Some(&FactValue::from("2")));
        assert_eq!(value(&merged, "b"), Some(&FactValue::from("1")));
    }

    #[test]
    fn test_select_without_existing_filters_incoming() {
        let mode = MergeMode::Select(vec!["a".into()]);
        let merged = mode.apply(None, record(&[("a", "2"), ("b", "2")]));
        assert_eq!(merged.facts.len(), 1);
    }

    #[test]
    fn test_merge_overlays_non_empty_identity() {
        let mut old = record(&[]);
        old.os = "debian".into();
        old.hostname = "web1".into();
        let mut new = record(&[]);
        new.os = "ubuntu".into();

        let merged = MergeMode::Merge.apply(Some(old), new);
        assert_eq!(merged.os, "ubuntu");
        assert_eq!(merged.hostname, "web1");
    }

    #[test]
    fn test_parse_modes() {
        assert_eq!("merge".parse::<MergeMode>().unwrap(), MergeMode::Merge);
        assert_eq!(MergeMode::default(), MergeMode::Replace);
        assert!("select:".parse::<MergeMode>().is_err());
        assert!("upsert".parse::<MergeMode>().is_err());
        assert_eq!(MergeMode::Select(vec!["a".into(), "b".into()]).to_string(), "select:a,b");
    }
}
