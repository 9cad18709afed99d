//! Bounded set of open output files for one topic task.

use ahash::{AHashMap, AHashSet};
use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

use crate::accountant::{Accountant, Transaction};
use crate::config::RestructureOptions;
use crate::file_cache::{FileCache, FileCacheOptions};
use crate::metrics::Metrics;
use crate::record::Record;
use crate::util::{create_with_backoff, publish_atomic, remove_with_backoff, sanitize_id, unique_temp_path};

/// Outcome of [`FileCacheStore::write`].
///
/// Not written never means lost: the record's shape conflicts with the file at that
/// path and the caller should retry with the next attempt suffix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteResponse {
    CacheHitWritten,
    CacheHitNotWritten,
    CacheMissWritten,
    CacheMissNotWritten,
}

impl WriteResponse {
    fn new(cache_hit: bool, written: bool) -> Self {
        match (cache_hit, written) {
            (true, true) => WriteResponse::CacheHitWritten,
            (true, false) => WriteResponse::CacheHitNotWritten,
            (false, true) => WriteResponse::CacheMissWritten,
            (false, false) => WriteResponse::CacheMissNotWritten,
        }
    }

    pub fn is_successful(self) -> bool {
        matches!(self, WriteResponse::CacheHitWritten | WriteResponse::CacheMissWritten)
    }

    pub fn is_cache_hit(self) -> bool {
        matches!(self, WriteResponse::CacheHitWritten | WriteResponse::CacheHitNotWritten)
    }
}

pub struct FileCacheStore<'a> {
    accountant: &'a Accountant,
    caches: AHashMap<PathBuf, FileCache>,
    max_files: usize,
    file_opts: FileCacheOptions,
    deduplicate: bool,
    tmp_dir: TempDir,
    schemas: AHashSet<PathBuf>,
    finished: BTreeSet<PathBuf>,
    metrics: Arc<Metrics>,
}

impl<'a> FileCacheStore<'a> {
    pub fn new(accountant: &'a Accountant, opts: &RestructureOptions, metrics: Arc<Metrics>) -> Result<Self> {
        fs::create_dir_all(&opts.tmp_dir).with_context(|| format!("create {}", opts.tmp_dir.display()))?;
        let tmp_dir = tempfile::Builder::new()
            .prefix(&format!("store-{}-", sanitize_id(accountant.topic())))
            .tempdir_in(&opts.tmp_dir)
            .with_context(|| format!("create temp directory in {}", opts.tmp_dir.display()))?;
        Ok(Self {
            accountant,
            caches: AHashMap::with_capacity(opts.cache_size),
            max_files: opts.cache_size.max(1),
            file_opts: FileCacheOptions {
                format: opts.format,
                compression: opts.compression,
                write_buffer_bytes: opts.write_buffer_bytes,
            },
            deduplicate: opts.deduplicate,
            tmp_dir,
            schemas: AHashSet::new(),
            finished: BTreeSet::new(),
            metrics,
        })
    }

    /// Number of currently open writers.
    pub fn open_files(&self) -> usize {
        self.caches.len()
    }

    pub fn is_open(&self, path: &Path) -> bool {
        self.caches.contains_key(path)
    }

    /// Write `record` to `path` and, on success, hold `tx` until the file is closed.
    ///
    /// An I/O failure tears the writer down, drops its unflushed bookkeeping so the
    /// affected offsets are processed again on a later run, and is returned as an
    /// error.
    pub fn write(&mut self, topic: &str, path: &Path, record: &Record, tx: &Transaction, attempt: u32) -> Result<WriteResponse> {
        let metrics = self.metrics.clone();
        let _t = metrics.time("store.write");
        let cache_hit = self.caches.contains_key(path);
        if !cache_hit {
            self.ensure_capacity();
            self.ensure_schema(topic, path, record, attempt)?;
            let cache = {
                let _t = self.metrics.time("store.open");
                FileCache::open(path, record, self.tmp_dir.path(), &self.file_opts)?
            };
            self.caches.insert(path.to_path_buf(), cache);
        }
        let Some(cache) = self.caches.get_mut(path) else {
            return Ok(WriteResponse::new(cache_hit, false));
        };

        match cache.write(record) {
            Ok(true) => {
                cache.add_transaction(tx);
                Ok(WriteResponse::new(cache_hit, true))
            }
            Ok(false) => Ok(WriteResponse::new(cache_hit, false)),
            Err(e) => {
                if let Some(mut failed) = self.caches.remove(path) {
                    failed.mark_error();
                    if let Err(close_err) = failed.close() {
                        tracing::warn!("discarding failed writer {}: {:#}", path.display(), close_err);
                    }
                }
                Err(e).with_context(|| format!("write to {}", path.display()))
            }
        }
    }

    /// Close every open writer and persist the accountant.
    pub fn flush(&mut self) -> Result<()> {
        let metrics = self.metrics.clone();
        let _t = metrics.time("store.flush");
        let paths: Vec<PathBuf> = self.caches.keys().cloned().collect();
        self.close_writers(paths);
        self.accountant.flush()
    }

    /// Close writers, optionally deduplicate every file written by this store,
    /// persist the accountant, and remove the working directory.
    pub fn close(mut self) -> Result<()> {
        let paths: Vec<PathBuf> = self.caches.keys().cloned().collect();
        self.close_writers(paths);

        if self.deduplicate {
            let _t = self.metrics.time("store.deduplicate");
            for path in &self.finished {
                if let Err(e) = self.file_opts.format.deduplicate(
                    path,
                    self.file_opts.compression,
                    self.tmp_dir.path(),
                    self.file_opts.write_buffer_bytes,
                ) {
                    tracing::error!("deduplicate {}: {:#}", path.display(), e);
                }
            }
        }

        let flushed = self.accountant.flush();
        let FileCacheStore { tmp_dir, .. } = self;
        let cleanup = tmp_dir.close().context("remove store temp directory");
        flushed.and(cleanup)
    }

    /// Evict the least recently used half of the writers when the store is full.
    fn ensure_capacity(&mut self) {
        if self.caches.len() < self.max_files {
            return;
        }
        let metrics = self.metrics.clone();
        let _t = metrics.time("store.evict");
        let mut by_age: Vec<(std::time::Instant, PathBuf)> =
            self.caches.iter().map(|(p, c)| (c.last_use(), p.clone())).collect();
        by_age.sort();
        let evict = (by_age.len() / 2).max(1);
        let paths: Vec<PathBuf> = by_age.into_iter().take(evict).map(|(_, p)| p).collect();
        tracing::debug!("evicting {} of {} open files", paths.len(), self.caches.len());
        self.close_writers(paths);
        if let Err(e) = self.accountant.flush() {
            tracing::error!("persisting offsets after eviction: {:#}", e);
        }
    }

    /// Close the named writers and hand their bookkeeping to the accountant.
    fn close_writers(&mut self, paths: Vec<PathBuf>) {
        for path in paths {
            let Some(cache) = self.caches.remove(&path) else { continue };
            match cache.close() {
                Ok(Some(ledger)) => {
                    self.finished.insert(path);
                    if !ledger.is_empty() {
                        self.accountant.process(ledger);
                    }
                }
                Ok(None) => {}
                Err(e) => tracing::error!("closing {}; its records will be processed again: {:#}", path.display(), e),
            }
        }
    }

    /// Write `schema-<topic>[_<attempt>].json` next to `path` once.
    fn ensure_schema(&mut self, topic: &str, path: &Path, record: &Record, attempt: u32) -> Result<()> {
        let Some(dir) = path.parent() else { return Ok(()) };
        let name = if attempt == 0 { format!("schema-{topic}.json") } else { format!("schema-{topic}_{attempt}.json") };
        let schema_path = dir.join(name);
        if self.schemas.contains(&schema_path) {
            return Ok(());
        }
        if !schema_path.exists() {
            fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
            let tmp = unique_temp_path(self.tmp_dir.path(), "schema");
            let res = (|| -> Result<()> {
                let mut f = create_with_backoff(&tmp)?;
                serde_json::to_writer_pretty(&mut f, &record.schema())?;
                f.write_all(b"\n")?;
                f.sync_all()?;
                publish_atomic(&tmp, &schema_path)
            })();
            if let Err(e) = res {
                let _ = remove_with_backoff(&tmp);
                return Err(e).with_context(|| format!("write schema {}", schema_path.display()));
            }
        }
        self.schemas.insert(schema_path);
        Ok(())
    }
}
