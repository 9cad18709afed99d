//! Offset ranges and the filename grammar that encodes them.

use anyhow::{bail, Context, Result};
use regex::Regex;
use std::cmp::Ordering;
use std::fmt;
use std::sync::OnceLock;

/// Shard key for offset bookkeeping.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self { topic: topic.into(), partition }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}", self.topic, self.partition)
    }
}

/// Inclusive `[from, to]` block of offsets within one topic partition.
///
/// Ordered by `(from, to)` first and `(topic, partition)` second, so sorting a
/// mixed list of file ranges processes the lowest offsets first.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct OffsetRange {
    pub topic: String,
    pub partition: i32,
    pub from: i64,
    pub to: i64,
}

impl OffsetRange {
    pub fn new(topic: impl Into<String>, partition: i32, from: i64, to: i64) -> Result<Self> {
        if from > to {
            bail!("offset range start {} exceeds end {}", from, to);
        }
        Ok(Self { topic: topic.into(), partition, from, to })
    }

    /// Range covering exactly one offset.
    pub fn single(topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        Self { topic: topic.into(), partition, from: offset, to: offset }
    }

    pub fn key(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }

    /// Number of offsets covered.
    pub fn size(&self) -> u64 {
        (self.to - self.from) as u64 + 1
    }

    /// Parse a record file name of the form `topic+partition+from+to[.ext...]`.
    ///
    /// The topic may contain dots; everything after the last offset is treated as
    /// extension and ignored.
    pub fn parse_filename(name: &str) -> Result<Self> {
        static RE: OnceLock<Regex> = OnceLock::new();
        let re = RE.get_or_init(|| {
            Regex::new(r"^(?P<topic>[^+/]+)\+(?P<partition>\d+)\+(?P<from>\d+)\+(?P<to>\d+)(?:\..*)?$")
                .expect("static offset filename pattern")
        });
        let caps = match re.captures(name) {
            Some(c) => c,
            None => bail!("file name {:?} does not match topic+partition+from+to", name),
        };
        let partition = caps["partition"].parse::<i32>().with_context(|| format!("partition in {name:?}"))?;
        let from = caps["from"].parse::<i64>().with_context(|| format!("start offset in {name:?}"))?;
        let to = caps["to"].parse::<i64>().with_context(|| format!("end offset in {name:?}"))?;
        Self::new(&caps["topic"], partition, from, to).with_context(|| format!("file name {name:?}"))
    }
}

impl Ord for OffsetRange {
    fn cmp(&self, other: &Self) -> Ordering {
        self.from
            .cmp(&other.from)
            .then_with(|| self.to.cmp(&other.to))
            .then_with(|| self.topic.cmp(&other.topic))
            .then_with(|| self.partition.cmp(&other.partition))
    }
}

impl PartialOrd for OffsetRange {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for OffsetRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}+{}+{}", self.topic, self.partition, self.from, self.to)
    }
}
