use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::{NamedTempFile, TempDir};

use spooky_core::{Action, ChannelOpener, Machine, Resolver};
use spooky_exec::{CommandChannel, CommandResult, ExecError};
use spooky_facts::*;

/// Answers hostname, os and nproc commands; everything else exits 127
struct FakeHost {
    hostname: String,
    os: &'static str,
}

#[async_trait]
impl CommandChannel for FakeHost {
    async fn exec(&self, cmd: &str) -> Result<CommandResult, ExecError> {
        let stdout = if cmd == "hostname" {
            self.hostname.clone()
        } else if cmd.contains("$ID") {
            self.os.to_string()
        } else if cmd == "nproc" {
            "2".to_string()
        } else {
            return Ok(CommandResult {
                status: 127,
                stdout: String::new(),
                stderr: "not found".to_string(),
                duration: Duration::ZERO,
            });
        };

        Ok(CommandResult {
            status: 0,
            stdout: format!("{stdout}\n"),
            stderr: String::new(),
            duration: Duration::ZERO,
        })
    }

    async fn close(&self) -> Result<(), ExecError> {
        Ok(())
    }

    fn channel_type(&self) -> &'static str {
        "fake"
    }
}

struct FakeOpener {
    os: HashMap<String, &'static str>,
}

#[async_trait]
impl ChannelOpener for FakeOpener {
    async fn open(
        &self,
        machine: &Machine,
        _connect_timeout: Duration,
    ) -> Result<Arc<dyn CommandChannel>, ExecError> {
        match self.os.get(&machine.name) {
            Some(os) => Ok(Arc::new(FakeHost {
                hostname: machine.name.clone(),
                os,
            })),
            None => Err(ExecError::ConnectionFailed(format!("{} unreachable", machine.host))),
        }
    }
}

fn inventory() -> Vec<Machine> {
    vec![
        Machine::new("web1", "10.0.0.1")
            .with_password("pw")
            .with_tag("role", "web"),
        Machine::new("db1", "10.0.0.2")
            .with_password("pw")
            .with_tag("role", "db"),
        Machine::new("down1", "10.0.0.3").with_password("pw"),
    ]
}

fn manager(options: ManagerOptions) -> (TempDir, FactManager) {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(FactStore::open(dir.path()).unwrap());
    let opener = Arc::new(FakeOpener {
        os: HashMap::from([("web1".to_string(), "debian"), ("db1".to_string(), "rocky")]),
    });
    (dir, FactManager::new(store, opener, inventory(), options))
}

#[tokio::test]
async fn test_gather_persists_record() {
    let (_dir, manager) = manager(ManagerOptions::default());

    let record = manager.gather_and_persist_facts("web1").await.unwrap();
    assert_eq!(record.machine_id, machine_id("web1"));
    assert_eq!(record.hostname, "web1");
    assert_eq!(record.os, "debian");
    assert_eq!(record.tags.get("role").map(String::as_str), Some("web"));

    let stored = manager.machine_facts("web1").unwrap().unwrap();
    assert_eq!(stored, record);

    let kernel = manager.get_fact("web1", "kernel").unwrap().unwrap();
    assert_eq!(kernel.value, FactValue::from("unknown"));
    assert_eq!(kernel.source, FactSource::Ssh);
}

#[tokio::test]
async fn test_unreachable_machine_fails_collection() {
    let (_dir, manager) = manager(ManagerOptions::default());

    let err = manager.gather_and_persist_facts("down1").await.unwrap_err();
    assert!(matches!(err, FactError::Channel(ExecError::ConnectionFailed(_))));
    assert!(manager.machine_facts("down1").unwrap().is_none());
}

#[tokio::test]
async fn test_unknown_target() {
    let (_dir, manager) = manager(ManagerOptions::default());
    let err = manager.collect_all_facts("ghost").await.unwrap_err();
    assert_eq!(err, FactError::UnknownMachine("ghost".to_string()));
}

#[tokio::test]
async fn test_gather_many_keeps_input_order() {
    let (_dir, manager) = manager(ManagerOptions {
        max_workers: 2,
        ..ManagerOptions::default()
    });

    let results = manager
        .gather_many(vec!["db1".into(), "down1".into(), "web1".into()])
        .await;

    let names: Vec<&str> = results.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(names, vec!["db1", "down1", "web1"]);
    assert!(results[0].1.is_ok());
    assert!(results[1].1.is_err());
    assert!(results[2].1.is_ok());
    assert_eq!(manager.store().list_machines().unwrap().len(), 2);
}

#[tokio::test]
async fn test_merge_mode_keeps_imported_facts() {
    let (_dir, manager) = manager(ManagerOptions {
        merge_mode: MergeMode::Merge,
        ..ManagerOptions::default()
    });

    let mut file = NamedTempFile::new().unwrap();
    write!(file, r#"{{"web1": {{"rack": "r7"}}}}"#).unwrap();
    manager
        .import_custom_facts(file.path().to_str().unwrap())
        .await
        .unwrap();

    manager.gather_and_persist_facts("web1").await.unwrap();

    let rack = manager.get_fact("web1", "rack").unwrap().unwrap();
    assert_eq!(rack.value, FactValue::from("r7"));
    assert!(manager.get_fact("web1", "hostname").unwrap().is_some());
}

#[tokio::test]
async fn test_replace_mode_drops_imported_facts() {
    let (_dir, manager) = manager(ManagerOptions::default());

    let mut file = NamedTempFile::new().unwrap();
    write!(file, r#"{{"web1": {{"rack": "r7"}}}}"#).unwrap();
    manager
        .import_custom_facts(file.path().to_str().unwrap())
        .await
        .unwrap();

    manager.gather_and_persist_facts("web1").await.unwrap();
    assert!(manager.get_fact("web1", "rack").unwrap().is_none());
}

#[tokio::test]
async fn test_import_report_and_dry_run() {
    let (_dir, manager) = manager(ManagerOptions::default());
    let mut file = NamedTempFile::new().unwrap();
    write!(
        file,
        r#"[{{"machine_name": "web1", "key": "rack", "value": "r1"}},
            {{"machine_name": "db1", "key": "rack", "value": "r2"}}]"#
    )
    .unwrap();
    let path = file.path().to_str().unwrap();

    let dry = manager
        .import_custom_facts_with_options(
            path,
            ImportOptions {
                dry_run: true,
                override_existing: false,
            },
        )
        .await
        .unwrap();
    assert_eq!(dry.imported, 2);
    assert!(manager.store().list_machines().unwrap().is_empty());

    let real = manager.import_custom_facts(path).await.unwrap();
    assert_eq!(real.machines, 2);

    let again = manager.import_custom_facts(path).await.unwrap();
    assert_eq!(again.imported, 0);
    assert_eq!(again.skipped, 2);
}

#[tokio::test]
async fn test_http_import_rejected() {
    let (_dir, manager) = manager(ManagerOptions::default());
    let err = manager
        .import_custom_facts("http://facts.example.com/all.json")
        .await
        .unwrap_err();
    assert!(matches!(err, FactError::UnsupportedSource(_)));
}

#[tokio::test]
async fn test_fact_tags_feed_resolver() {
    let (_dir, manager) = manager(ManagerOptions::default());
    manager.gather_and_persist_facts("db1").await.unwrap();

    let fact_tags = manager.fact_tags().unwrap();
    assert_eq!(
        fact_tags["db1"].get("os").map(String::as_str),
        Some("rocky")
    );

    let machines = inventory();
    let action = Action::command("patch", "dnf -y upgrade").with_tags(["os=rocky"]);
    let targets = Resolver::new(&machines)
        .with_fact_tags(&fact_tags)
        .resolve(&action)
        .unwrap();

    let names: Vec<&str> = targets.iter().map(|m| m.name.as_str()).collect();
    assert_eq!(names, vec!["db1"]);
}

#[tokio::test]
async fn test_query_and_delete() {
    let (_dir, manager) = manager(ManagerOptions {
        project_name: Some("shop".into()),
        ..ManagerOptions::default()
    });
    manager.gather_and_persist_facts("web1").await.unwrap();
    manager.gather_and_persist_facts("db1").await.unwrap();

    let query: FactQuery = "project=shop,tag=role:web".parse().unwrap();
    let found = manager.query_machine_facts(&query).unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].machine_name, "web1");

    assert!(manager.delete_machine("web1").unwrap());
    assert!(!manager.delete_machine("web1").unwrap());
    assert!(manager.clear_cache().unwrap() > 0);
    assert!(manager.store().list_machines().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_gathers_on_multi_thread_runtime() {
    let (_dir, manager) = manager(ManagerOptions {
        max_workers: 0,
        ..ManagerOptions::default()
    });

    let targets: Vec<String> = ["web1", "db1", "web1", "db1"].map(String::from).to_vec();
    let results = manager.gather_many(targets).await;
    assert!(results.iter().all(|(_, r)| r.is_ok()));

    let mut names: Vec<String> = manager
        .query_machine_facts(&FactQuery::new())
        .unwrap()
        .into_iter()
        .map(|m| m.machine_name)
        .collect();
    names.sort();
    assert_eq!(names, vec!["db1", "web1"]);
}
