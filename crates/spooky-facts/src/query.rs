//! Structured fact queries

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::FactError;
use crate::types::MachineFacts;

/// Query over stored machine records
///
/// Unset fields match anything. Every listed tag must be present with the
/// exact value. A `limit` of 0 means unlimited.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FactQuery {
    /// Exact machine name
    pub machine_name: Option<String>,
    /// OS name, compared case-insensitively
    pub os: Option<String>,
    /// Exact project name
    pub project: Option<String>,
    /// Tags that must all match
    pub tags: BTreeMap<String, String>,
    /// Maximum number of records returned
    pub limit: usize,
}

impl FactQuery {
    /// Query matching every record
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to one machine
    #[must_use]
    pub fn machine(mut self, name: impl Into<String>) -> Self {
        self.machine_name = Some(name.into());
        self
    }

    /// Restrict to an OS
    #[must_use]
    pub fn os(mut self, os: impl Into<String>) -> Self {
        self.os = Some(os.into());
        self
    }

    /// Restrict to a project
    #[must_use]
    pub fn project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }

    /// Require a tag value
    #[must_use]
    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Limit results
    #[must_use]
    pub fn limit(mut self, n: usize) -> Self {
        self.limit = n;
        self
    }

    /// Whether `record` satisfies every set criterion
    #[must_use]
    pub fn matches(&self, record: &MachineFacts) -> bool {
        if self
            .machine_name
            .as_ref()
            .is_some_and(|name| *name != record.machine_name)
        {
            return false;
        }

        if self
            .os
            .as_ref()
            .is_some_and(|os| !os.eq_ignore_ascii_case(&record.os))
        {
            return false;
        }

        if self
            .project
            .as_ref()
            .is_some_and(|project| *project != record.project_name)
        {
            return false;
        }

        self.tags
            .iter()
            .all(|(key, value)| record.tags.get(key) == Some(value))
    }
}

impl FromStr for FactQuery {
    type Err = FactError;

    /// Parse `machine=web1,os=debian,project=shop,tag=role:web,limit=10`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut query = FactQuery::new();

        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| FactError::InvalidQuery(format!("expected key=value, got '{part}'")))?;
            let value = value.trim();

            match key.trim() {
                "machine" => query.machine_name = Some(value.to_string()),
                "os" => query.os = Some(value.to_string()),
                "project" => query.project = Some(value.to_string()),
                "tag" => {
                    let (tag_key, tag_value) = value.split_once(':').ok_or_else(|| {
                        FactError::InvalidQuery(format!("tag must be key:value, got '{value}'"))
                    })?;
                    query
                        .tags
                        .insert(tag_key.trim().to_string(), tag_value.trim().to_string());
                }
                "limit" => {
                    query.limit = value.parse().map_err(|_| {
                        FactError::InvalidQuery(format!("limit must be a number, got '{value}'"))
                    })?;
                }
                other => {
                    return Err(FactError::InvalidQuery(format!("unknown field '{other}'")));
                }
            }
        }

        Ok(query)
    }
}

impl fmt::Display for FactQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(ref name) = self.machine_name {
            parts.push(format!("machine={name}"));
        }
        if let Some(ref os) = self.os {
            parts.push(format!("os={os}"));
        }
        if let Some(ref project) = self.project {
            parts.push(format!("project={project}"));
        }
        for (key, value) in &self.tags {
            parts.push(format!("tag={key}:{value}"));
        }
        if self.limit > 0 {
            parts.push(format!("limit={}", self.limit));
        }
        write!(f, "{}", parts.join(","))
    }
}
