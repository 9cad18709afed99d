//! Structured records and the container files that carry them.
//!
//! A container file holds newline-delimited JSON objects of the form
//! `{"key": {...}, "value": {...}}`, zstd-compressed when the name ends in `.zst`.
//! The i-th record of `topic+partition+from+to.jsonl.zst` has offset `from + i`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

use crate::compression::Compression;
use crate::storage::SourceStorage;

/// Extensions recognised as record containers, longest first.
pub const RECORD_FILE_EXTENSIONS: [&str; 2] = [".jsonl.zst", ".jsonl"];

pub fn is_record_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| RECORD_FILE_EXTENSIONS.iter().any(|ext| n.ends_with(ext)))
        .unwrap_or(false)
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Record {
    #[serde(default)]
    pub key: Option<Value>,
    #[serde(default)]
    pub value: Option<Value>,
}

impl Record {
    pub fn new(key: Value, value: Value) -> Self {
        Self { key: Some(key), value: Some(value) }
    }

    /// Structural schema of this record, suitable for a pretty-printed sidecar.
    pub fn schema(&self) -> Value {
        json!({
            "type": "record",
            "fields": [
                { "name": "key", "type": self.key.as_ref().map(schema_of).unwrap_or_else(|| json!("null")) },
                { "name": "value", "type": self.value.as_ref().map(schema_of).unwrap_or_else(|| json!("null")) },
            ]
        })
    }

    /// Field lookup inside `key` (`Record::key_field("projectId")`).
    pub fn key_field(&self, name: &str) -> Option<&Value> {
        self.key.as_ref().and_then(|k| k.get(name))
    }

    pub fn value_field(&self, name: &str) -> Option<&Value> {
        self.value.as_ref().and_then(|v| v.get(name))
    }
}

fn schema_of(v: &Value) -> Value {
    match v {
        Value::Null => json!("null"),
        Value::Bool(_) => json!("boolean"),
        Value::Number(n) if n.is_i64() || n.is_u64() => json!("long"),
        Value::Number(_) => json!("double"),
        Value::String(_) => json!("string"),
        Value::Array(items) => json!({
            "type": "array",
            "items": items.first().map(schema_of).unwrap_or_else(|| json!("null")),
        }),
        Value::Object(map) => {
            let fields: Vec<Value> = map
                .iter()
                .map(|(name, field)| json!({ "name": name, "type": schema_of(field) }))
                .collect();
            let mut obj = Map::new();
            obj.insert("type".into(), json!("record"));
            obj.insert("fields".into(), Value::Array(fields));
            Value::Object(obj)
        }
    }
}

/// One record container on the source storage.
pub struct RecordFile<'a> {
    storage: &'a dyn SourceStorage,
    path: PathBuf,
    read_buf_bytes: usize,
}

impl<'a> RecordFile<'a> {
    pub fn new(storage: &'a dyn SourceStorage, path: impl Into<PathBuf>, read_buf_bytes: usize) -> Self {
        Self { storage, path: path.into(), read_buf_bytes }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stored (possibly compressed) length in bytes.
    pub fn len(&self) -> Result<u64> {
        self.storage.len(&self.path)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// A fresh pass over the records, from the start of the file.
    pub fn records(&self) -> Result<RecordIter> {
        let raw = self.storage.open(&self.path)?;
        let compression = if self.path.extension().map(|e| e == "zst").unwrap_or(false) {
            Compression::Zstd
        } else {
            Compression::None
        };
        let decoded = compression
            .decompress(raw)
            .with_context(|| format!("decode {}", self.path.display()))?;
        Ok(RecordIter {
            reader: BufReader::with_capacity(self.read_buf_bytes.max(8 * 1024), decoded),
            buf: String::with_capacity(16 * 1024),
            path: self.path.clone(),
            line: 0,
        })
    }
}

pub struct RecordIter {
    reader: BufReader<Box<dyn Read>>,
    buf: String,
    path: PathBuf,
    line: u64,
}

impl Iterator for RecordIter {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.buf.clear();
            self.line += 1;
            match self.reader.read_line(&mut self.buf) {
                Ok(0) => return None,
                Ok(_) => {}
                Err(e) => {
                    return Some(Err(e).with_context(|| format!("read {} line {}", self.path.display(), self.line)))
                }
            }
            let line = self.buf.trim_end_matches(['\n', '\r']);
            if line.trim().is_empty() {
                continue;
            }
            return Some(
                serde_json::from_str::<Record>(line)
                    .with_context(|| format!("parse {} line {}", self.path.display(), self.line)),
            );
        }
    }
}
