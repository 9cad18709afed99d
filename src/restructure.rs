//! Per-topic restructuring runs.
//!
//! Topics are discovered from the input roots, shuffled, and restructured
//! concurrently on a bounded pool. Within a topic everything is sequential: one
//! worker owns the topic's [`Accountant`] and [`FileCacheStore`] for the whole task.

use anyhow::{Context, Result};
use rand::seq::SliceRandom;
use rand::Rng;
use rayon::prelude::*;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::accountant::{Accountant, Bin, Transaction};
use crate::config::RestructureOptions;
use crate::file_cache_store::FileCacheStore;
use crate::ledger::IntervalLedger;
use crate::lock::{FileLockManager, LockManager};
use crate::mem::MemoryWatcher;
use crate::metrics::Metrics;
use crate::offsets::OffsetRange;
use crate::path::{ObservationKeyPathFactory, PathFactory};
use crate::progress::TopicProgress;
use crate::record::{is_record_file, Record, RecordFile};
use crate::storage::{is_transient, LocalStorage, SourceStorage};
use crate::util::init_tracing_once;

/// Upper bound on disambiguated output paths tried for one record.
pub const MAX_WRITE_ATTEMPTS: u32 = 16;

const SHUTDOWN_POLL: Duration = Duration::from_millis(200);

/// Totals for one [`Restructurer::run`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub topics_processed: usize,
    pub topics_skipped: usize,
    pub topics_failed: usize,
    pub files_processed: usize,
    pub records_written: u64,
}

#[derive(Default)]
struct TopicSummary {
    files: usize,
    records: u64,
}

enum TopicOutcome {
    Done(TopicSummary),
    Skipped,
    Failed,
}

pub struct Restructurer {
    opts: RestructureOptions,
    storage: Arc<dyn SourceStorage>,
    locks: Arc<dyn LockManager>,
    paths: Arc<dyn PathFactory>,
    metrics: Arc<Metrics>,
    memory: MemoryWatcher,
    shutdown: Arc<AtomicBool>,
}

impl Restructurer {
    /// Local storage, file locks under `<output>/locks`, and observation-key paths
    /// under the output root.
    pub fn new(opts: RestructureOptions) -> Self {
        let locks = Arc::new(FileLockManager::new(opts.locks_dir()));
        let paths = Arc::new(ObservationKeyPathFactory::new(&opts.output, opts.output_extension()));
        Self {
            storage: Arc::new(LocalStorage),
            locks,
            paths,
            metrics: Metrics::new(opts.metrics),
            memory: MemoryWatcher::new(opts.low_memory_fraction),
            shutdown: Arc::new(AtomicBool::new(false)),
            opts,
        }
    }

    // -------- Builder methods --------
    pub fn with_storage(mut self, storage: Arc<dyn SourceStorage>) -> Self { self.storage = storage; self }
    pub fn with_lock_manager(mut self, locks: Arc<dyn LockManager>) -> Self { self.locks = locks; self }
    pub fn with_path_factory(mut self, paths: Arc<dyn PathFactory>) -> Self { self.paths = paths; self }
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self { self.metrics = metrics; self }
    pub fn with_shutdown_flag(mut self, flag: Arc<AtomicBool>) -> Self { self.shutdown = flag; self }

    pub fn options(&self) -> &RestructureOptions {
        &self.opts
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Setting this flag stops new topics from starting; running topics finish
    /// their current file and close cleanly.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Restructure every topic found under the inputs once.
    pub fn run(&self) -> Result<RunSummary> {
        init_tracing_once();
        self.opts.validate()?;
        let started = Instant::now();

        let topics = self.discover_topics();
        tracing::info!("found {} topics under {} input paths", topics.len(), self.opts.inputs.len());

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.opts.num_threads)
            .thread_name(|i| format!("topic-worker-{i}"))
            .build()
            .context("build topic worker pool")?;
        let progress = TopicProgress::new(self.opts.progress, topics.len() as u64);

        let outcomes: Vec<TopicOutcome> = pool.install(|| {
            topics
                .par_iter()
                .map(|(topic, dirs)| {
                    if self.is_shutdown() {
                        return TopicOutcome::Skipped;
                    }
                    let outcome = match self.process_topic(topic, dirs) {
                        Ok(Some(summary)) => TopicOutcome::Done(summary),
                        Ok(None) => TopicOutcome::Skipped,
                        Err(e) => {
                            tracing::error!("topic {} failed: {:#}", topic, e);
                            TopicOutcome::Failed
                        }
                    };
                    progress.topic_done(topic);
                    outcome
                })
                .collect()
        });
        progress.finish();

        let mut summary = RunSummary::default();
        for outcome in outcomes {
            match outcome {
                TopicOutcome::Done(t) => {
                    summary.topics_processed += 1;
                    summary.files_processed += t.files;
                    summary.records_written += t.records;
                }
                TopicOutcome::Skipped => summary.topics_skipped += 1,
                TopicOutcome::Failed => summary.topics_failed += 1,
            }
        }
        tracing::info!(
            "restructured {} topics ({} skipped, {} failed), {} files, {} records in {:.1?}",
            summary.topics_processed,
            summary.topics_skipped,
            summary.topics_failed,
            summary.files_processed,
            summary.records_written,
            started.elapsed()
        );
        self.metrics.report();
        Ok(summary)
    }

    /// Run repeatedly, `interval` apart, until the shutdown flag is set.
    pub fn run_service(&self, interval: Duration) -> Result<()> {
        init_tracing_once();
        self.opts.validate()?;
        while !self.is_shutdown() {
            if let Err(e) = self.run() {
                tracing::error!("restructuring run failed: {:#}", e);
            }
            let deadline = Instant::now() + interval;
            while !self.is_shutdown() {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                std::thread::sleep((deadline - now).min(SHUTDOWN_POLL));
            }
        }
        tracing::info!("shutdown requested; service stopped");
        Ok(())
    }

    /// Topic name -> topic directories, in random order. A topic directory sits two
    /// levels above each record file (`<topic>/<partition dir>/<file>`).
    fn discover_topics(&self) -> Vec<(String, Vec<PathBuf>)> {
        let mut topics: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
        for input in &self.opts.inputs {
            let entries = match self.storage.list(input) {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::error!("cannot list input {}: {:#}", input.display(), e);
                    continue;
                }
            };
            for entry in entries {
                if entry.is_dir || is_transient(&entry.path) || !is_record_file(&entry.path) {
                    continue;
                }
                let Some(topic_dir) = entry.path.parent().and_then(Path::parent) else { continue };
                let Some(topic) = topic_dir.file_name().and_then(|n| n.to_str()) else { continue };
                if self.opts.excluded_topics.iter().any(|t| t == topic) {
                    continue;
                }
                let dirs = topics.entry(topic.to_string()).or_default();
                if !dirs.iter().any(|d| d == topic_dir) {
                    dirs.push(topic_dir.to_path_buf());
                }
            }
        }
        let mut topics: Vec<(String, Vec<PathBuf>)> = topics.into_iter().collect();
        topics.shuffle(&mut rand::thread_rng());
        topics
    }

    /// `Ok(None)` when another process holds the topic.
    fn process_topic(&self, topic: &str, dirs: &[PathBuf]) -> Result<Option<TopicSummary>> {
        let Some(_lock) = self.locks.try_acquire(topic)? else {
            tracing::info!("topic {} is locked by another process; skipping", topic);
            return Ok(None);
        };
        let _t = self.metrics.time("topic");

        let accountant = Accountant::open(topic, &self.opts, self.metrics.clone())?;
        let restructured = self.restructure_topic(topic, dirs, &accountant);
        let closed = accountant.close();
        match (restructured, closed) {
            (Ok(summary), Ok(())) => Ok(Some(summary)),
            (Ok(_), Err(e)) => Err(e).context("close accountant"),
            (Err(e), closed) => {
                if let Err(close_err) = closed {
                    tracing::error!("closing accountant for {}: {:#}", topic, close_err);
                }
                Err(e)
            }
        }
    }

    fn restructure_topic(&self, topic: &str, dirs: &[PathBuf], accountant: &Accountant) -> Result<TopicSummary> {
        let files = self.candidate_files(topic, dirs, accountant.offsets())?;
        let mut summary = TopicSummary::default();
        if files.is_empty() {
            tracing::debug!("topic {} has no new files", topic);
            return Ok(summary);
        }
        tracing::info!("topic {}: {} files to process", topic, files.len());

        let mut rng = rand::thread_rng();
        let mut store = FileCacheStore::new(accountant, &self.opts, self.metrics.clone())?;
        let mut since_flush = 0u64;
        let mut threshold = flush_threshold(self.opts.batch_size, &mut rng);

        for (range, path) in &files {
            if self.is_shutdown() {
                tracing::info!("shutdown requested; stopping topic {} after {} files", topic, summary.files);
                break;
            }
            match self.restructure_file(topic, range, path, &mut store, accountant.offsets()) {
                Ok(written) => {
                    summary.files += 1;
                    summary.records += written;
                }
                Err(e) => tracing::error!("skipping {}: {:#}", path.display(), e),
            }

            since_flush = since_flush.saturating_add(range.size());
            let low_memory = self.memory.is_low();
            if since_flush >= threshold || low_memory {
                if low_memory {
                    tracing::warn!("available memory is low; flushing {} open files of topic {}", store.open_files(), topic);
                }
                if let Err(e) = store.flush() {
                    tracing::error!("flushing topic {}: {:#}", topic, e);
                }
                since_flush = 0;
                threshold = flush_threshold(self.opts.batch_size, &mut rng);
            }
        }

        store.close().with_context(|| format!("close output files of topic {topic}"))?;
        Ok(summary)
    }

    /// Record files of `topic` not yet fully accounted for, in offset order.
    fn candidate_files(&self, topic: &str, dirs: &[PathBuf], seen: &IntervalLedger) -> Result<Vec<(OffsetRange, PathBuf)>> {
        let mut files = Vec::new();
        for dir in dirs {
            let entries = self.storage.list(dir).with_context(|| format!("list {}", dir.display()))?;
            for entry in entries {
                if entry.is_dir || is_transient(&entry.path) || !is_record_file(&entry.path) {
                    continue;
                }
                let Some(name) = entry.path.file_name().and_then(|n| n.to_str()) else { continue };
                match OffsetRange::parse_filename(name) {
                    Ok(range) if range.topic != topic => {
                        tracing::warn!("{} belongs to topic {}, not {}; ignoring", entry.path.display(), range.topic, topic);
                    }
                    Ok(range) if seen.contains(&range) => {}
                    Ok(range) => files.push((range, entry.path)),
                    Err(e) => tracing::warn!("ignoring {}: {:#}", entry.path.display(), e),
                }
            }
        }
        // Stable: equal ranges keep listing order.
        files.sort_by(|a, b| a.0.cmp(&b.0));
        if let Some(cap) = self.opts.max_files_per_topic {
            files.truncate(cap);
        }
        Ok(files)
    }

    /// Number of records written from one file.
    fn restructure_file(
        &self,
        topic: &str,
        range: &OffsetRange,
        path: &Path,
        store: &mut FileCacheStore<'_>,
        seen: &IntervalLedger,
    ) -> Result<u64> {
        let _t = self.metrics.time("topic.file");
        let file = RecordFile::new(self.storage.as_ref(), path, self.opts.read_buffer_bytes);
        if file.is_empty()? {
            tracing::warn!("{} is empty; skipping", path.display());
            return Ok(0);
        }

        let mut written = 0u64;
        let mut offset = range.from;
        for record in file.records()? {
            if offset > range.to {
                tracing::warn!("{} holds records past offset {}; ignoring the rest", path.display(), range.to);
                break;
            }
            let current = OffsetRange::single(range.topic.clone(), range.partition, offset);
            offset += 1;
            let record = record?;
            if seen.contains(&current) {
                continue;
            }
            if self.write_record(topic, &record, current, store) {
                written += 1;
            }
        }
        if offset <= range.to {
            tracing::warn!("{} ends at offset {}, before its named end {}", path.display(), offset - 1, range.to);
        }
        Ok(written)
    }

    /// Write one record, moving to the next disambiguated path on shape conflicts.
    /// Returns whether it was written; failures are logged and leave the offset
    /// unaccounted.
    fn write_record(&self, topic: &str, record: &Record, offset: OffsetRange, store: &mut FileCacheStore<'_>) -> bool {
        for attempt in 0..MAX_WRITE_ATTEMPTS {
            let org = match self.paths.organization(topic, record, attempt) {
                Ok(org) => org,
                Err(e) => {
                    tracing::warn!("cannot place offset {} of {}: {:#}", offset.from, offset.key(), e);
                    return false;
                }
            };
            let tx = Transaction::new(offset.clone(), Bin::new(topic, org.category, org.time));
            match store.write(topic, &org.path, record, &tx, attempt) {
                Ok(response) if response.is_successful() => return true,
                Ok(_) => tracing::debug!("offset {} of {} does not fit {}", offset.from, offset.key(), org.path.display()),
                Err(e) => {
                    tracing::error!("writing offset {} of {}: {:#}", offset.from, offset.key(), e);
                    return false;
                }
            }
        }
        tracing::warn!(
            "offset {} of {} conflicts with {} output files; leaving it for a later run",
            offset.from,
            offset.key(),
            MAX_WRITE_ATTEMPTS
        );
        false
    }
}

/// Nominal batch size jittered by ±25%.
fn flush_threshold(nominal: u64, rng: &mut impl Rng) -> u64 {
    let spread = nominal / 4;
    rng.gen_range(nominal.saturating_sub(spread)..=nominal.saturating_add(spread)).max(1)
}
