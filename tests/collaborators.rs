#[path = "common/mod.rs"]
mod common;

use common::*;
use restructure::{
    flatten_record, is_record_file, is_transient, FileLockManager, LocalStorage, LockManager, Metrics, NoopLockManager,
    RecordFile, SourceStorage,
};
use serde_json::json;
use std::fs;
use std::path::Path;
use std::time::Duration;

#[test]
fn record_files_iterate_lazily_and_restart_from_the_top() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_topic_file(dir.path(), "t", 0, 0, 3);
    let storage = LocalStorage;
    let file = RecordFile::new(&storage, &path, 8 * 1024);
    assert!(!file.is_empty().unwrap());

    let first: Vec<_> = file.records().unwrap().map(|r| r.unwrap()).collect();
    let again: Vec<_> = file.records().unwrap().map(|r| r.unwrap()).collect();
    assert_eq!(first.len(), 3);
    assert_eq!(first, again);
    assert_eq!(first[2].value_field("x"), Some(&json!(2)));
    assert_eq!(first[0].key_field("projectId"), Some(&json!("p")));
}

#[test]
fn plain_jsonl_files_and_malformed_lines() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t+0+0+2.jsonl");
    fs::write(&path, "{\"key\":{\"a\":1},\"value\":{\"b\":2}}\n\n{not json}\n").unwrap();
    let storage = LocalStorage;
    let mut records = RecordFile::new(&storage, &path, 8 * 1024).records().unwrap();
    assert!(records.next().unwrap().is_ok());
    assert!(records.next().unwrap().is_err());
    assert!(records.next().is_none());
}

#[test]
fn local_storage_lists_recursively() {
    let dir = tempfile::tempdir().unwrap();
    let a = write_topic_file(dir.path(), "t", 0, 0, 1);
    let b = write_topic_file(&dir.path().join("+tmp"), "t", 0, 1, 1);

    let entries = LocalStorage.list(dir.path()).unwrap();
    let files: Vec<&Path> = entries.iter().filter(|e| !e.is_dir).map(|e| e.path.as_path()).collect();
    assert!(files.contains(&a.as_path()) && files.contains(&b.as_path()));
    assert!(entries.iter().any(|e| e.is_dir && e.path.ends_with("partition=0")));
    assert!(is_transient(&b) && !is_transient(&a));
    assert!(LocalStorage.len(&a).unwrap() > 0);
    assert!(LocalStorage.list(&dir.path().join("missing")).is_err());
}

#[test]
fn record_file_extensions() {
    assert!(is_record_file(Path::new("a/t+0+0+1.jsonl.zst")));
    assert!(is_record_file(Path::new("t+0+0+1.jsonl")));
    assert!(!is_record_file(Path::new("t+0+0+1.csv")));
    assert!(!is_record_file(Path::new("schema-t.json")));
}

#[test]
fn flattening_uses_dotted_columns() {
    let rec = restructure::Record::new(json!({ "id": "a" }), json!({ "pos": { "lat": 1.5, "lon": 2 }, "tags": ["x", "y"], "none": null }));
    let cells = flatten_record(&rec);
    let columns: Vec<&str> = cells.iter().map(|(c, _)| c.as_str()).collect();
    assert_eq!(columns, ["key.id", "value.none", "value.pos.lat", "value.pos.lon", "value.tags.0", "value.tags.1"]);
    assert_eq!(cells[1].1, "");
    assert_eq!(cells[2].1, "1.5");
}

#[test]
fn file_locks_are_exclusive_until_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let locks = FileLockManager::new(dir.path().join("locks"));
    let held = locks.try_acquire("t").unwrap().expect("first acquisition");
    assert!(locks.try_acquire("t").unwrap().is_none());
    assert!(locks.try_acquire("other").unwrap().is_some());
    drop(held);
    assert!(locks.try_acquire("t").unwrap().is_some());

    let noop = NoopLockManager;
    let _a = noop.try_acquire("t").unwrap().unwrap();
    assert!(noop.try_acquire("t").unwrap().is_some());
}

#[test]
fn disabled_metrics_record_nothing() {
    let off = Metrics::disabled();
    {
        let _t = off.time("x");
    }
    off.record("y", Duration::from_millis(5));
    assert!(off.get("x").is_none() && off.get("y").is_none());

    let on = Metrics::new(true);
    on.record("y", Duration::from_millis(5));
    on.record("y", Duration::from_millis(7));
    let stat = on.get("y").unwrap();
    assert_eq!(stat.count, 2);
    assert_eq!(stat.total, Duration::from_millis(12));
    on.report();
}
