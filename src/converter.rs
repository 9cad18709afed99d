//! Row-oriented output formats.

use ahash::AHashSet;
use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use std::fmt;
use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;
use std::str::FromStr;

use crate::compression::Compression;
use crate::config::ConfigError;
use crate::csv_row::{encode_row, flips_quote_state, parse_row};
use crate::record::Record;
use crate::util::{create_with_backoff, open_with_backoff, publish_atomic, remove_with_backoff, unique_temp_path};

/// Serializes records into one output stream.
pub trait RecordConverter: Send {
    /// Append `record`. `Ok(false)` means its shape does not fit this file and
    /// nothing was written.
    fn write(&mut self, record: &Record, out: &mut dyn Write) -> Result<bool>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Format {
    #[default]
    Csv,
    Json,
}

impl Format {
    pub fn extension(&self) -> &'static str {
        match self {
            Format::Csv => ".csv",
            Format::Json => ".json",
        }
    }

    /// Converter for a file whose existing content starts with `first_line`
    /// (`None` for a new or empty file). For a new CSV file the header derived
    /// from `example` is written to `out` immediately.
    pub fn converter(&self, first_line: Option<&str>, example: &Record, out: &mut dyn Write) -> Result<Box<dyn RecordConverter>> {
        match self {
            Format::Json => Ok(Box::new(JsonConverter)),
            Format::Csv => {
                let headers = match first_line {
                    Some(line) => parse_row(line).ok_or_else(|| anyhow!("unreadable CSV header {line:?}"))?,
                    None => {
                        let headers: Vec<String> = flatten_record(example).into_iter().map(|(h, _)| h).collect();
                        out.write_all(encode_row(&headers).as_bytes())?;
                        out.write_all(b"\n")?;
                        headers
                    }
                };
                Ok(Box::new(CsvConverter { headers }))
            }
        }
    }

    /// Rewrite a finished file without exact duplicate rows, keeping first-seen
    /// order. The CSV header always stays on top.
    pub fn deduplicate(&self, path: &Path, compression: Compression, tmp_dir: &Path, write_buf_bytes: usize) -> Result<()> {
        let tmp = unique_temp_path(tmp_dir, "dedup");
        let res = self.deduplicate_into(path, &tmp, compression, write_buf_bytes);
        if res.is_err() {
            let _ = remove_with_backoff(&tmp);
        }
        res
    }

    fn deduplicate_into(&self, path: &Path, tmp: &Path, compression: Compression, write_buf_bytes: usize) -> Result<()> {
        let input = open_with_backoff(path).with_context(|| format!("open {}", path.display()))?;
        let mut reader = BufReader::new(compression.decompress(BufReader::new(input))?);
        let out = create_with_backoff(tmp).with_context(|| format!("create {}", tmp.display()))?;
        let mut sink = compression.compress(out, write_buf_bytes)?;

        let read_err = || format!("read {}", path.display());
        if *self == Format::Csv {
            if let Some(header) = self.read_row(&mut reader).with_context(read_err)? {
                sink.write_all(header.as_bytes())?;
            }
        }
        let mut seen: AHashSet<String> = AHashSet::with_capacity(16 * 1024);
        let (mut kept, mut dropped) = (0u64, 0u64);
        while let Some(row) = self.read_row(&mut reader).with_context(read_err)? {
            if row.trim_end_matches(['\n', '\r']).is_empty() {
                continue;
            }
            if seen.contains(&row) {
                dropped += 1;
                continue;
            }
            sink.write_all(row.as_bytes())?;
            seen.insert(row);
            kept += 1;
        }
        sink.finish().with_context(|| format!("finish {}", tmp.display()))?;
        publish_atomic(tmp, path)?;
        tracing::debug!("deduplicated {}: kept {} dropped {}", path.display(), kept, dropped);
        Ok(())
    }

    /// Next logical row with its line terminator, or `None` at the end of input.
    /// A CSV row spans several physical lines while a quoted field is open; a
    /// missing final terminator is added.
    pub fn read_row(&self, reader: &mut impl BufRead) -> io::Result<Option<String>> {
        let mut row = String::new();
        let mut open = false;
        loop {
            let start = row.len();
            if reader.read_line(&mut row)? == 0 {
                break;
            }
            if *self == Format::Csv && flips_quote_state(&row[start..]) {
                open = !open;
            }
            if !open {
                break;
            }
        }
        if row.is_empty() {
            return Ok(None);
        }
        if !row.ends_with('\n') {
            row.push('\n');
        }
        Ok(Some(row))
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Format::Csv => "csv",
            Format::Json => "json",
        })
    }
}

impl FromStr for Format {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "csv" => Ok(Format::Csv),
            "json" | "jsonl" => Ok(Format::Json),
            other => Err(ConfigError::UnknownFormat(other.to_string())),
        }
    }
}

/// One JSON object per line; any shape fits.
struct JsonConverter;

impl RecordConverter for JsonConverter {
    fn write(&mut self, record: &Record, out: &mut dyn Write) -> Result<bool> {
        serde_json::to_writer(&mut *out, record)?;
        out.write_all(b"\n")?;
        Ok(true)
    }
}

/// Flattened `key.*` / `value.*` columns under a fixed header.
struct CsvConverter {
    headers: Vec<String>,
}

impl RecordConverter for CsvConverter {
    fn write(&mut self, record: &Record, out: &mut dyn Write) -> Result<bool> {
        let cells = flatten_record(record);
        if cells.len() != self.headers.len() || cells.iter().zip(&self.headers).any(|((h, _), want)| h != want) {
            return Ok(false);
        }
        let values: Vec<&str> = cells.iter().map(|(_, v)| v.as_str()).collect();
        out.write_all(encode_row(&values).as_bytes())?;
        out.write_all(b"\n")?;
        Ok(true)
    }
}

/// `(column, cell)` pairs; nested objects and arrays become dotted columns.
pub fn flatten_record(record: &Record) -> Vec<(String, String)> {
    let mut cells = Vec::new();
    flatten_into("key", record.key.as_ref().unwrap_or(&Value::Null), &mut cells);
    flatten_into("value", record.value.as_ref().unwrap_or(&Value::Null), &mut cells);
    cells
}

fn flatten_into(prefix: &str, v: &Value, cells: &mut Vec<(String, String)>) {
    match v {
        Value::Object(map) if !map.is_empty() => {
            for (k, child) in map {
                flatten_into(&format!("{prefix}.{k}"), child, cells);
            }
        }
        Value::Array(items) if !items.is_empty() => {
            for (i, child) in items.iter().enumerate() {
                flatten_into(&format!("{prefix}.{i}"), child, cells);
            }
        }
        Value::Null | Value::Object(_) | Value::Array(_) => cells.push((prefix.to_string(), String::new())),
        Value::String(s) => cells.push((prefix.to_string(), s.clone())),
        other => cells.push((prefix.to_string(), other.to_string())),
    }
}
