//! Turns an action's targeting rule into a concrete machine list

use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::debug;

use crate::config::{Action, Machine};
use crate::error::CoreError;

/// Extra tags per machine name, typically derived from stored facts
pub type FactTags = HashMap<String, BTreeMap<String, String>>;

/// One entry of an action's `tags` list
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagSelector {
    /// `key`: the tag must be present with a non-empty value
    Key(String),
    /// `key=value`: the tag must have exactly this value
    KeyValue(String, String),
}

impl TagSelector {
    /// Parse `key` or `key=value`
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw.split_once('=') {
            Some((key, value)) => {
                TagSelector::KeyValue(key.trim().to_string(), value.trim().to_string())
            }
            None => TagSelector::Key(raw.trim().to_string()),
        }
    }

    fn matches(&self, tags: &BTreeMap<String, String>) -> bool {
        match self {
            TagSelector::Key(key) => tags.get(key).is_some_and(|v| !v.is_empty()),
            TagSelector::KeyValue(key, value) => tags.get(key).is_some_and(|v| v == value),
        }
    }
}

/// Machine resolver over one inventory
///
/// Resolution is recomputed on every call and always follows inventory order.
#[derive(Debug, Clone, Copy)]
pub struct Resolver<'a> {
    inventory: &'a [Machine],
    fact_tags: Option<&'a FactTags>,
}

impl<'a> Resolver<'a> {
    /// Create a resolver over `inventory`
    #[must_use]
    pub fn new(inventory: &'a [Machine]) -> Self {
        Self {
            inventory,
            fact_tags: None,
        }
    }

    /// Also match tag selectors against fact-derived tags
    #[must_use]
    pub fn with_fact_tags(mut self, fact_tags: &'a FactTags) -> Self {
        self.fact_tags = Some(fact_tags);
        self
    }

    /// Resolve the machines `action` applies to
    ///
    /// 1. `servers` set: every listed name must exist.
    /// 2. `tags` set: machines matching any selector.
    /// 3. Otherwise the whole inventory.
    ///
    /// # Errors
    /// Returns `CoreError::UnknownMachine` if `servers` names a machine that
    /// is not in the inventory.
    pub fn resolve(&self, action: &Action) -> Result<Vec<&'a Machine>, CoreError> {
        let targets = if !action.servers.is_empty() {
            self.by_servers(action)?
        } else if !action.tags.is_empty() {
            self.by_tags(action)
        } else {
            dedup(self.inventory.iter())
        };

        debug!(
            action = %action.name,
            targets = targets.len(),
            "resolved targets"
        );

        Ok(targets)
    }

    fn by_servers(&self, action: &Action) -> Result<Vec<&'a Machine>, CoreError> {
        let wanted: HashSet<&str> = action.servers.iter().map(String::as_str).collect();

        for name in &action.servers {
            if !self.inventory.iter().any(|m| &m.name == name) {
                return Err(CoreError::UnknownMachine {
                    action: action.name.clone(),
                    machine: name.clone(),
                });
            }
        }

        Ok(dedup(
            self.inventory
                .iter()
                .filter(|m| wanted.contains(m.name.as_str())),
        ))
    }

    fn by_tags(&self, action: &Action) -> Vec<&'a Machine> {
        let selectors: Vec<TagSelector> =
            action.tags.iter().map(|t| TagSelector::parse(t)).collect();

        dedup(self.inventory.iter().filter(|m| {
            selectors.iter().any(|s| {
                s.matches(&m.tags)
                    || self
                        .fact_tags
                        .and_then(|ft| ft.get(&m.name))
                        .is_some_and(|tags| s.matches(tags))
            })
        }))
    }
}

fn dedup<'a>(machines: impl Iterator<Item = &'a Machine>) -> Vec<&'a Machine> {
    let mut seen = HashSet::new();
    machines.filter(|m| seen.insert(m.name.as_str())).collect()
}

/// Resolve `action` against `inventory` without fact tags
///
/// # Errors
/// See [`Resolver::resolve`].
pub fn resolve<'a>(action: &Action, inventory: &'a [Machine]) -> Result<Vec<&'a Machine>, CoreError> {
    Resolver::new(inventory).resolve(action)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inventory() -> Vec<Machine> {
        vec![
            Machine::new("web1", "10.0.0.1").with_tag("role", "web"),
            Machine::new("db1", "10.0.0.2").with_tag("role", "db"),
            Machine::new("web2", "10.0.0.3")
                .with_tag("role", "web")
                .with_tag("canary", "yes"),
            Machine::new("cache1", "10.0.0.4").with_tag("canary", ""),
        ]
    }

    fn names(machines: &[&Machine]) -> Vec<String> {
        machines.iter().map(|m| m.name.clone()).collect()
    }

    #[test]
    fn test_servers_follow_inventory_order() {
        let inv = inventory();
        let action = Action::command("a", "true").with_servers(["web2", "web1", "web2"]);

        let targets = resolve(&action, &inv).unwrap();
        assert_eq!(names(&targets), vec!["web1", "web2"]);
    }

    #[test]
    fn test_unknown_server_fails() {
        let inv = inventory();
        let action = Action::command("a", "true").with_servers(["web1", "ghost"]);

        let err = resolve(&action, &inv).unwrap_err();
        assert_eq!(
            err,
            CoreError::UnknownMachine {
                action: "a".to_string(),
                machine: "ghost".to_string()
            }
        );
    }

    #[test]
    fn test_tags_are_ored() {
        let inv = inventory();
        let action = Action::command("a", "true").with_tags(["role=db", "canary"]);

        let targets = resolve(&action, &inv).unwrap();
        // cache1 has canary with an empty value and does not match
        assert_eq!(names(&targets), vec!["db1", "web2"]);
    }

    #[test]
    fn test_bare_key_matches_any_value() {
        let inv = inventory();
        let action = Action::command("a", "true").with_tags(["role"]);

        let targets = resolve(&action, &inv).unwrap();
        assert_eq!(names(&targets), vec!["web1", "db1", "web2"]);
    }

    #[test]
    fn test_key_value_selector() {
        let inv = vec![
            Machine::new("web1", "h1").with_tag("role", "web"),
            Machine::new("db1", "h2").with_tag("role", "db"),
        ];
        let action = Action::command("a", "true").with_tags(["role=web"]);

        let targets = resolve(&action, &inv).unwrap();
        assert_eq!(names(&targets), vec!["web1"]);
    }

    #[test]
    fn test_servers_take_priority_over_tags() {
        let inv = inventory();
        let action = Action::command("a", "true")
            .with_servers(["db1"])
            .with_tags(["role=web"]);

        let targets = resolve(&action, &inv).unwrap();
        assert_eq!(names(&targets), vec!["db1"]);
    }

    #[test]
    fn test_untargeted_action_is_broadcast() {
        let inv = inventory();
        let action = Action::command("a", "true");

        let targets = resolve(&action, &inv).unwrap();
        assert_eq!(names(&targets), vec!["web1", "db1", "web2", "cache1"]);
    }

    #[test]
    fn test_resolution_is_idempotent() {
        let inv = inventory();
        let action = Action::command("a", "true").with_tags(["canary", "role=web"]);
        let resolver = Resolver::new(&inv);

        let first = names(&resolver.resolve(&action).unwrap());
        let second = names(&resolver.resolve(&action).unwrap());
        assert_eq!(first, second);
    }

    #[test]
    fn test_fact_tags_extend_selection() {
        let inv = inventory();
        let mut fact_tags = FactTags::new();
        fact_tags.insert(
            "cache1".to_string(),
            BTreeMap::from([("os".to_string(), "debian".to_string())]),
        );

        let action = Action::command("a", "true").with_tags(["os=debian"]);
        let targets = Resolver::new(&inv)
            .with_fact_tags(&fact_tags)
            .resolve(&action)
            .unwrap();
        assert_eq!(names(&targets), vec!["cache1"]);
    }

    #[test]
    fn test_no_tag_match_is_empty() {
        let inv = inventory();
        let action = Action::command("a", "true").with_tags(["role=mail"]);
        assert!(resolve(&action, &inv).unwrap().is_empty());
    }

    #[test]
    fn test_selector_parse() {
        assert_eq!(TagSelector::parse("role"), TagSelector::Key("role".into()));
        assert_eq!(
            TagSelector::parse(" env = prod "),
            TagSelector::KeyValue("env".into(), "prod".into())
        );
    }
}
