use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use tempfile::TempDir;

use spooky_facts::*;

fn machine(name: &str, os: &str, tags: &[(&str, &str)]) -> MachineFacts {
    let mut record = MachineFacts::new(name);
    record.os = os.to_string();
    record.hostname = format!("{name}.internal");
    record.tags = tags
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect::<BTreeMap<_, _>>();
    record.insert(Fact::new(name, "role", tags.first().map_or("none", |t| t.1), FactSource::Ssh));
    record.insert(
        Fact::new(name, "disks", FactValue::List(vec!["sda".into(), "sdb".into()]), FactSource::Ssh)
            .with_ttl(3600),
    );
    record
}

fn seeded_store() -> (TempDir, FactStore) {
    let dir = TempDir::new().unwrap();
    let store = FactStore::open(dir.path()).unwrap();
    store
        .replace_machines(&[
            machine("web1", "debian", &[("role", "web"), ("env", "prod")]),
            machine("web2", "debian", &[("role", "web"), ("env", "staging")]),
            machine("db1", "rocky", &[("role", "db"), ("env", "prod")]),
        ])
        .unwrap();
    (dir, store)
}

#[test]
fn test_export_import_round_trip() {
    let (_dir, store) = seeded_store();

    let mut exported = Vec::new();
    assert_eq!(store.export_json(&mut exported).unwrap(), 3);

    let fresh_dir = TempDir::new().unwrap();
    let fresh = FactStore::open(fresh_dir.path()).unwrap();
    let report = fresh
        .import_json(exported.as_slice(), &ImportOptions::default())
        .unwrap();

    assert_eq!(report.machines, 3);
    assert_eq!(report.imported, 6);
    assert_eq!(report.skipped, 0);

    let mut original = store.list_machines().unwrap();
    let mut restored = fresh.list_machines().unwrap();
    original.sort_by(|a, b| a.machine_name.cmp(&b.machine_name));
    restored.sort_by(|a, b| a.machine_name.cmp(&b.machine_name));
    assert_eq!(original, restored);
}

#[test]
fn test_ttl_boundary() {
    let dir = TempDir::new().unwrap();
    let store = FactStore::open(dir.path()).unwrap();
    let id = machine_id("web1");

    let fact = Fact::new("web1", "session", "abc", FactSource::Local).with_ttl(1);
    store.put(&id, "session", &fact).unwrap();
    assert!(store.get(&id, "session").unwrap().is_some());

    std::thread::sleep(Duration::from_millis(1100));

    assert!(store.get(&id, "session").unwrap().is_none());
    assert_eq!(store.clear_expired_cache().unwrap(), 1);
}

#[test]
fn test_expired_facts_survive_until_cleared_but_are_hidden() {
    let dir = TempDir::new().unwrap();
    let store = FactStore::open(dir.path()).unwrap();

    let mut record = MachineFacts::new("web1");
    record.insert(Fact::new("web1", "fresh", 1_i64, FactSource::Local));
    record.insert(
        Fact::new("web1", "stale", 2_i64, FactSource::Local)
            .with_timestamp(Utc::now() - TimeDelta::minutes(5))
            .with_ttl(60),
    );
    store.put_machine(&record).unwrap();

    let loaded = store.get_machine_by_name("web1").unwrap().unwrap();
    assert_eq!(loaded.facts.len(), 1);
    assert!(loaded.facts.contains_key("fresh"));

    assert_eq!(store.clear_expired_cache().unwrap(), 1);
}

#[test]
fn test_invalid_import_leaves_store_unchanged() {
    let (_dir, store) = seeded_store();
    let before = store.list_machines().unwrap();

    let doc = br#"[
        {"MachineName": "web1", "Key": "rack", "Value": "r1"},
        {"MachineName": "web3", "Key": "rack", "Value": "r2"},
        {"Key": "rack", "Value": "r3"}
    ]"#;

    let err = store
        .import_json(
            &doc[..],
            &ImportOptions {
                override_existing: true,
                ..ImportOptions::default()
            },
        )
        .unwrap_err();

    assert!(matches!(err, FactError::Validation(_)));
    assert_eq!(store.list_machines().unwrap(), before);
    assert!(store.get_machine_by_name("web3").unwrap().is_none());
}

#[test]
fn test_malformed_import_is_parse_error() {
    let (_dir, store) = seeded_store();
    let err = store
        .import_json(&b"[{\"machine_name\": "[..], &ImportOptions::default())
        .unwrap_err();
    assert!(matches!(err, FactError::Parse(_)));
}

#[test]
fn test_query_tags_require_every_match() {
    let (_dir, store) = seeded_store();

    let prod_web = store
        .query(&FactQuery::new().tag("role", "web").tag("env", "prod"))
        .unwrap();
    assert_eq!(prod_web.len(), 1);
    assert_eq!(prod_web[0].machine_name, "web1");

    let debian: FactQuery = "os=debian".parse().unwrap();
    assert_eq!(store.query(&debian).unwrap().len(), 2);

    let none = store.query(&FactQuery::new().os("debian").tag("role", "db")).unwrap();
    assert!(none.is_empty());
}

#[test]
fn test_corrupt_database_fails_to_open() {
    let dir = TempDir::new().unwrap();
    std::fs::write(dir.path().join("facts.redb"), b"this is not a redb database file").unwrap();

    let err = FactStore::open(dir.path()).unwrap_err();
    assert!(err.is_storage());
}

#[test]
fn test_reopen_keeps_data() {
    let dir = TempDir::new().unwrap();
    {
        let store = FactStore::open(dir.path()).unwrap();
        store.put_machine(&machine("web1", "debian", &[("role", "web")])).unwrap();
        store.close().unwrap();
    }

    let store = FactStore::open(dir.path()).unwrap();
    let record = store.get_machine_by_name("web1").unwrap().unwrap();
    assert_eq!(record.os, "debian");
    assert_eq!(record.facts.len(), 2);
}

#[test]
fn test_concurrent_readers_and_writer() {
    let (_dir, store) = seeded_store();
    let store = Arc::new(store);

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let store = store.clone();
            std::thread::spawn(move || {
                let id = machine_id("web1");
                let fact = Fact::new("web1", format!("k{i}"), i64::from(i), FactSource::Local);
                store.put(&id, &format!("k{i}"), &fact).unwrap();
                store.list_machines().unwrap().len()
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.join().unwrap(), 3);
    }
    assert_eq!(store.scan_by_machine(&machine_id("web1")).unwrap().len(), 6);
}
