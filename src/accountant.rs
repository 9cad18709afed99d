//! Per-topic bookkeeping of processed offsets and output record counts.
//!
//! Both tables live in memory and are mirrored to CSV sidecars under the output
//! root (`offsets/<topic>.csv`, `bins/<topic>.csv`). Sidecars are always rewritten
//! whole into a temp file and atomically published; a table is never patched in
//! place. Writes are debounced on a dedicated thread per table.

use ahash::AHashMap;
use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::fs;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

use crate::config::RestructureOptions;
use crate::csv_row::{encode_row, parse_row};
use crate::debounce::{DebouncedPersister, Persist};
use crate::ledger::IntervalLedger;
use crate::metrics::Metrics;
use crate::offsets::OffsetRange;
use crate::util::{create_with_backoff, open_with_backoff, publish_atomic, remove_with_backoff, sanitize_id, unique_temp_path};

pub const OFFSETS_HEADER: &str = "offsetFrom,offsetTo,partition,topic";
pub const BINS_HEADER: &str = "topic,category,timestamp,count";

/// Aggregation key for output record counts.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Bin {
    pub topic: String,
    pub category: String,
    pub time: String,
}

impl Bin {
    pub fn new(topic: impl Into<String>, category: impl Into<String>, time: impl Into<String>) -> Self {
        Self { topic: topic.into(), category: category.into(), time: time.into() }
    }
}

/// One record's worth of bookkeeping: where it came from and how it is counted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    pub offset: OffsetRange,
    pub bin: Bin,
}

impl Transaction {
    pub fn new(offset: OffsetRange, bin: Bin) -> Self {
        Self { offset, bin }
    }
}

/// Transactions not yet handed to an [`Accountant`]. Owned by a single writer.
#[derive(Debug, Default)]
pub struct Ledger {
    offsets: IntervalLedger,
    bins: AHashMap<Bin, u64>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, tx: &Transaction) {
        self.offsets.add(&tx.offset);
        *self.bins.entry(tx.bin.clone()).or_insert(0) += 1;
    }

    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }

    pub fn offsets(&self) -> &IntervalLedger {
        &self.offsets
    }

    pub fn bins(&self) -> &AHashMap<Bin, u64> {
        &self.bins
    }
}

// ---------------------------------------------------------------------------
// Offset table

struct OffsetTable {
    path: PathBuf,
    tmp_dir: PathBuf,
    ledger: IntervalLedger,
}

impl OffsetTable {
    fn load(path: &Path) -> Result<IntervalLedger> {
        let mut ledger = IntervalLedger::new();
        let f = match open_with_backoff(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(ledger),
            Err(e) => return Err(e).with_context(|| format!("open {}", path.display())),
        };
        for (i, line) in BufReader::new(f).lines().enumerate() {
            let line = line.with_context(|| format!("read {}", path.display()))?;
            if (i == 0 && line.starts_with("offsetFrom")) || line.trim().is_empty() {
                continue;
            }
            match parse_offset_row(&line) {
                Some(range) => ledger.add(&range),
                None => tracing::warn!("skipping malformed offset row {} in {}: {:?}", i + 1, path.display(), line),
            }
        }
        Ok(ledger)
    }
}

fn parse_offset_row(line: &str) -> Option<OffsetRange> {
    let mut cols = line.splitn(4, ',');
    let from = cols.next()?.trim().parse::<i64>().ok()?;
    let to = cols.next()?.trim().parse::<i64>().ok()?;
    let partition = cols.next()?.trim().parse::<i32>().ok()?;
    let topic = cols.next()?.trim();
    if topic.is_empty() {
        return None;
    }
    OffsetRange::new(topic, partition, from, to).ok()
}

impl Persist for OffsetTable {
    fn persist(&self) -> Result<()> {
        let ranges = self.ledger.ranges();
        write_table(&self.path, &self.tmp_dir, "offsets", |w| {
            writeln!(w, "{OFFSETS_HEADER}")?;
            for r in &ranges {
                writeln!(w, "{},{},{},{}", r.from, r.to, r.partition, r.topic)?;
            }
            Ok(())
        })
    }
}

// ---------------------------------------------------------------------------
// Bin table

struct BinTable {
    path: PathBuf,
    tmp_dir: PathBuf,
    counts: Mutex<AHashMap<Bin, u64>>,
}

impl BinTable {
    fn load(path: &Path) -> Result<AHashMap<Bin, u64>> {
        let mut counts = AHashMap::new();
        let f = match open_with_backoff(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(counts),
            Err(e) => return Err(e).with_context(|| format!("open {}", path.display())),
        };
        for (i, line) in BufReader::new(f).lines().enumerate() {
            let line = line.with_context(|| format!("read {}", path.display()))?;
            if (i == 0 && line.starts_with("topic,")) || line.trim().is_empty() {
                continue;
            }
            match parse_bin_row(&line) {
                Some((bin, n)) => *counts.entry(bin).or_insert(0) += n,
                None => tracing::warn!("skipping malformed bin row {} in {}: {:?}", i + 1, path.display(), line),
            }
        }
        Ok(counts)
    }
}

fn parse_bin_row(line: &str) -> Option<(Bin, u64)> {
    let cols = parse_row(line)?;
    if cols.len() != 4 {
        return None;
    }
    let count = cols[3].trim().parse::<u64>().ok()?;
    Some((Bin::new(&cols[0], &cols[1], &cols[2]), count))
}

impl Persist for BinTable {
    fn persist(&self) -> Result<()> {
        // Rows that appeared on disk since we loaded are kept rather than overwritten.
        let on_disk = match Self::load(&self.path) {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!("cannot re-read {} before rewrite: {:#}", self.path.display(), e);
                AHashMap::new()
            }
        };
        let mut rows: Vec<(Bin, u64)> = {
            let mut counts = self.counts.lock();
            for (bin, n) in on_disk {
                counts.entry(bin).or_insert(n);
            }
            counts.iter().map(|(b, n)| (b.clone(), *n)).collect()
        };
        rows.sort();
        write_table(&self.path, &self.tmp_dir, "bins", |w| {
            writeln!(w, "{BINS_HEADER}")?;
            for (bin, n) in &rows {
                let count = n.to_string();
                writeln!(w, "{}", encode_row(&[bin.topic.as_str(), bin.category.as_str(), bin.time.as_str(), count.as_str()]))?;
            }
            Ok(())
        })
    }
}

/// Write a complete table to a temp file, then publish it over `dest`.
fn write_table(dest: &Path, tmp_dir: &Path, stem: &str, body: impl FnOnce(&mut dyn Write) -> io::Result<()>) -> Result<()> {
    let tmp = unique_temp_path(tmp_dir, stem);
    let res = (|| -> Result<()> {
        let f = create_with_backoff(&tmp).with_context(|| format!("create {}", tmp.display()))?;
        let mut w = BufWriter::new(f);
        body(&mut w).with_context(|| format!("write {}", tmp.display()))?;
        let f = w.into_inner().map_err(|e| e.into_error())?;
        f.sync_all()?;
        publish_atomic(&tmp, dest)
    })();
    if res.is_err() {
        let _ = remove_with_backoff(&tmp);
    }
    res
}

// ---------------------------------------------------------------------------

/// Bookkeeping for one topic during one run.
pub struct Accountant {
    topic: String,
    offsets: Arc<OffsetTable>,
    bins: Arc<BinTable>,
    offset_persister: DebouncedPersister,
    bin_persister: DebouncedPersister,
    tmp_dir: TempDir,
    metrics: Arc<Metrics>,
}

impl Accountant {
    /// Load the topic's sidecars. Unreadable sidecars are logged and treated as
    /// empty: the worst outcome is reprocessing, never loss.
    pub fn open(topic: &str, opts: &RestructureOptions, metrics: Arc<Metrics>) -> Result<Self> {
        fs::create_dir_all(&opts.tmp_dir).with_context(|| format!("create {}", opts.tmp_dir.display()))?;
        let tmp_dir = tempfile::Builder::new()
            .prefix(&format!("accountant-{}-", sanitize_id(topic)))
            .tempdir_in(&opts.tmp_dir)
            .with_context(|| format!("create temp directory in {}", opts.tmp_dir.display()))?;

        let offsets_path = opts.offsets_dir().join(format!("{topic}.csv"));
        let bins_path = opts.bins_dir().join(format!("{topic}.csv"));

        let ledger = OffsetTable::load(&offsets_path).unwrap_or_else(|e| {
            tracing::warn!("cannot read offsets for {}; treating as unseen: {:#}", topic, e);
            IntervalLedger::new()
        });
        let counts = BinTable::load(&bins_path).unwrap_or_else(|e| {
            tracing::warn!("cannot read bins for {}; starting from zero: {:#}", topic, e);
            AHashMap::new()
        });

        let offsets = Arc::new(OffsetTable { path: offsets_path, tmp_dir: tmp_dir.path().to_path_buf(), ledger });
        let bins = Arc::new(BinTable { path: bins_path, tmp_dir: tmp_dir.path().to_path_buf(), counts: Mutex::new(counts) });

        let offset_persister = DebouncedPersister::start(
            format!("offsets-{topic}"),
            offsets.clone() as Arc<dyn Persist>,
            opts.debounce,
            opts.flush_timeout,
        )?;
        let bin_persister =
            DebouncedPersister::start(format!("bins-{topic}"), bins.clone() as Arc<dyn Persist>, opts.debounce, opts.flush_timeout)?;

        Ok(Self { topic: topic.to_string(), offsets, bins, offset_persister, bin_persister, tmp_dir, metrics })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Offsets already accounted for, including this run's processed batches.
    pub fn offsets(&self) -> &IntervalLedger {
        &self.offsets.ledger
    }

    /// Accumulated count for `bin`.
    pub fn bin_count(&self, bin: &Bin) -> u64 {
        self.bins.counts.lock().get(bin).copied().unwrap_or(0)
    }

    /// Merge a finished batch and schedule both sidecars for writing.
    pub fn process(&self, ledger: Ledger) {
        let _t = self.metrics.time("accounting.process");
        self.offsets.ledger.merge_shared(&ledger.offsets);
        {
            let mut counts = self.bins.counts.lock();
            for (bin, n) in ledger.bins {
                *counts.entry(bin).or_insert(0) += n;
            }
        }
        self.offset_persister.trigger();
        self.bin_persister.trigger();
    }

    /// Write both sidecars now.
    pub fn flush(&self) -> Result<()> {
        let _t = self.metrics.time("accounting.flush");
        let offsets = self.offset_persister.flush();
        let bins = self.bin_persister.flush();
        offsets.and(bins)
    }

    /// Flush, stop the writer threads, and remove the working directory.
    pub fn close(self) -> Result<()> {
        let Accountant { topic, offset_persister, bin_persister, tmp_dir, metrics, .. } = self;
        let _t = metrics.time("accounting.close");
        let offsets = offset_persister.close();
        let bins = bin_persister.close();
        let cleanup = tmp_dir.close().with_context(|| format!("remove accountant temp directory for {topic}"));
        offsets.and(bins).and(cleanup)
    }
}
