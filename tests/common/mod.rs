#![allow(dead_code)]

use restructure::{Record, RestructureOptions};
use serde_json::{json, Value};
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 2020-01-01T00:00:00Z, i.e. hour bucket `20200101_0000`.
pub const T0: i64 = 1_577_836_800;

/// Key/value pair shaped like an observation from one device.
pub fn observation(project: &str, user: &str, source: &str, time: i64, value: Value) -> Value {
    let mut v = value;
    if let Some(obj) = v.as_object_mut() {
        obj.insert("time".into(), json!(time));
    }
    json!({
        "key": { "projectId": project, "userId": user, "sourceId": source },
        "value": v,
    })
}

pub fn record(project: &str, user: &str, source: &str, time: i64, value: Value) -> Record {
    serde_json::from_value(observation(project, user, source, time, value)).unwrap()
}

/// `<input>/<topic>/partition=<p>/<topic>+<p>+<from>+<to>.jsonl.zst`
pub fn topic_file(input: &Path, topic: &str, partition: i32, from: i64, to: i64) -> PathBuf {
    input
        .join(topic)
        .join(format!("partition={partition}"))
        .join(format!("{topic}+{partition}+{from}+{to}.jsonl.zst"))
}

/// Write a zstd-compressed JSONL record file.
pub fn write_records(path: &Path, records: &[Value]) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    let f = File::create(path).unwrap();
    let mut enc = zstd::stream::write::Encoder::new(f, 3).unwrap();
    for r in records {
        writeln!(&mut enc, "{}", r).unwrap();
    }
    enc.finish().unwrap();
}

/// Write `count` observations for user `u` of project `p` as offsets `from..from+count`.
pub fn write_topic_file(input: &Path, topic: &str, partition: i32, from: i64, count: i64) -> PathBuf {
    let path = topic_file(input, topic, partition, from, from + count - 1);
    let records: Vec<Value> = (from..from + count)
        .map(|o| observation("p", "u", "s", T0 + o, json!({ "x": o })))
        .collect();
    write_records(&path, &records);
    path
}

/// Options rooted in `root`: single input `root/input`, output `root/output`.
pub fn test_options(root: &Path) -> RestructureOptions {
    RestructureOptions::default()
        .with_inputs([root.join("input")])
        .with_output(root.join("output"))
        .with_tmp_dir(root.join("tmp"))
        .with_threads(2)
        .with_debounce(Duration::from_millis(20))
        .with_flush_timeout(Duration::from_secs(10))
        .with_low_memory_fraction(0.0)
}

/// Non-empty lines of a plain text file.
pub fn read_lines(path: &Path) -> Vec<String> {
    let f = File::open(path).unwrap();
    BufReader::new(f).lines().map(|l| l.unwrap()).filter(|s| !s.is_empty()).collect()
}

/// Non-empty lines of a zstd-compressed text file.
pub fn read_zst_lines(path: &Path) -> Vec<String> {
    let mut s = String::new();
    zstd::stream::read::Decoder::new(File::open(path).unwrap())
        .unwrap()
        .read_to_string(&mut s)
        .unwrap();
    s.lines().filter(|l| !l.is_empty()).map(str::to_string).collect()
}
