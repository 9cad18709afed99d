//! Mapping records to output paths and accounting bins.

use anyhow::{anyhow, Result};
use serde_json::Value;
use std::path::PathBuf;
use time::macros::format_description;
use time::OffsetDateTime;

use crate::record::Record;
use crate::util::sanitize_id;

/// Where a record goes and how it is counted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Organization {
    pub path: PathBuf,
    pub category: String,
    pub time: String,
}

pub trait PathFactory: Send + Sync {
    /// Deterministic for a given `(topic, record, attempt)`. `attempt` only grows
    /// when the previous path rejected the record's shape.
    fn organization(&self, topic: &str, record: &Record, attempt: u32) -> Result<Organization>;
}

pub const UNKNOWN_DATE: &str = "unknown_date";

/// Lays files out as `<root>/<project>/<user>/<topic>/<YYYYMMDD_HH>00[_N]<ext>`.
///
/// Ids come from the record key (`projectId`, `userId`, `sourceId`); the hour
/// bucket from `value.time` or, failing that, `key.timeStart` (epoch seconds, UTC).
#[derive(Clone, Debug)]
pub struct ObservationKeyPathFactory {
    root: PathBuf,
    extension: String,
}

impl ObservationKeyPathFactory {
    /// `extension` is the full file suffix, e.g. `.csv.zst`.
    pub fn new(root: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        Self { root: root.into(), extension: extension.into() }
    }

    fn id(record: &Record, field: &str, fallback: &str) -> String {
        let raw = match record.key_field(field) {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => String::new(),
        };
        let clean = sanitize_id(&raw);
        if clean.is_empty() {
            fallback.to_string()
        } else {
            clean
        }
    }

    fn hour_bucket(record: &Record) -> String {
        let seconds = record
            .value_field("time")
            .and_then(Value::as_f64)
            .or_else(|| record.key_field("timeStart").and_then(Value::as_f64));
        seconds
            .and_then(|s| OffsetDateTime::from_unix_timestamp(s.floor() as i64).ok())
            .and_then(|dt| dt.format(format_description!("[year][month][day]_[hour]00")).ok())
            .unwrap_or_else(|| UNKNOWN_DATE.to_string())
    }
}

impl PathFactory for ObservationKeyPathFactory {
    fn organization(&self, topic: &str, record: &Record, attempt: u32) -> Result<Organization> {
        if record.key.is_none() {
            return Err(anyhow!("record in topic {topic} has no key"));
        }
        if record.value.is_none() {
            return Err(anyhow!("record in topic {topic} has no value"));
        }
        let project = Self::id(record, "projectId", "unknown-project");
        let user = Self::id(record, "userId", "unknown-user");
        let source = Self::id(record, "sourceId", "unknown-source");
        let time = Self::hour_bucket(record);

        let file_name = if attempt == 0 {
            format!("{}{}", time, self.extension)
        } else {
            format!("{}_{}{}", time, attempt, self.extension)
        };
        let path = self.root.join(project).join(user).join(topic).join(file_name);
        Ok(Organization { path, category: source, time })
    }
}
