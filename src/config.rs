use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::compression::Compression;
use crate::converter::Format;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no input paths given")]
    NoInputs,
    #[error("number of threads must be at least 1, got {0}")]
    InvalidThreads(usize),
    #[error("cache size must be at least 1, got {0}")]
    InvalidCacheSize(usize),
    #[error("batch size must be at least 1")]
    InvalidBatchSize,
    #[error("maximum files per topic must be at least 1 when set")]
    InvalidFileCap,
    #[error("unknown output format {0:?} (expected csv or json)")]
    UnknownFormat(String),
    #[error("unknown compression {0:?} (expected none or zstd)")]
    UnknownCompression(String),
}

/// Run configuration with defaults and builder chaining.
#[derive(Clone, Debug)]
pub struct RestructureOptions {
    pub inputs: Vec<PathBuf>,
    pub output: PathBuf,
    pub tmp_dir: PathBuf,
    pub format: Format,
    pub compression: Compression,
    pub deduplicate: bool,
    pub num_threads: usize,
    pub max_files_per_topic: Option<usize>,
    pub excluded_topics: Vec<String>,
    pub cache_size: usize,               // open output files per topic
    pub batch_size: u64,                 // offsets processed between forced flushes, before jitter
    pub debounce: Duration,              // bookkeeping write coalescing window
    pub flush_timeout: Duration,         // bound on synchronous bookkeeping writes
    pub low_memory_fraction: f64,        // force a flush when available memory drops below
    pub poll_interval: Option<Duration>, // service mode when set

    // IO tuning
    pub read_buffer_bytes: usize,
    pub write_buffer_bytes: usize,

    pub metrics: bool,
    pub progress: bool,
}

impl Default for RestructureOptions {
    fn default() -> Self {
        let threads = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
        Self {
            inputs: Vec::new(),
            output: PathBuf::from("output"),
            tmp_dir: std::env::temp_dir().join("restructure"),
            format: Format::Csv,
            compression: Compression::None,
            deduplicate: false,
            num_threads: threads,
            max_files_per_topic: None,
            excluded_topics: Vec::new(),
            cache_size: 100,
            batch_size: 100_000,
            debounce: Duration::from_secs(3),
            flush_timeout: Duration::from_secs(30),
            low_memory_fraction: 0.10,
            poll_interval: None,

            read_buffer_bytes: 256 * 1024,
            write_buffer_bytes: 64 * 1024,

            metrics: false,
            progress: false,
        }
    }
}

impl RestructureOptions {
    pub fn with_inputs<I, P>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.inputs = inputs.into_iter().map(Into::into).collect();
        self
    }
    pub fn with_output(mut self, dir: impl AsRef<Path>) -> Self {
        self.output = dir.as_ref().to_path_buf();
        self
    }
    pub fn with_tmp_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.tmp_dir = dir.as_ref().to_path_buf();
        self
    }
    pub fn with_format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }
    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }
    pub fn with_deduplicate(mut self, yes: bool) -> Self {
        self.deduplicate = yes;
        self
    }
    pub fn with_threads(mut self, n: usize) -> Self {
        self.num_threads = n;
        self
    }
    pub fn with_max_files_per_topic(mut self, n: Option<usize>) -> Self {
        self.max_files_per_topic = n;
        self
    }
    pub fn with_excluded_topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excluded_topics = topics.into_iter().map(Into::into).collect();
        self
    }
    pub fn with_cache_size(mut self, n: usize) -> Self {
        self.cache_size = n;
        self
    }
    pub fn with_batch_size(mut self, n: u64) -> Self {
        self.batch_size = n;
        self
    }
    pub fn with_debounce(mut self, delay: Duration) -> Self {
        self.debounce = delay;
        self
    }
    pub fn with_flush_timeout(mut self, timeout: Duration) -> Self {
        self.flush_timeout = timeout;
        self
    }
    pub fn with_low_memory_fraction(mut self, frac: f64) -> Self {
        self.low_memory_fraction = frac.clamp(0.0, 1.0);
        self
    }
    pub fn with_poll_interval(mut self, interval: Option<Duration>) -> Self {
        self.poll_interval = interval;
        self
    }
    pub fn with_io_buffers(mut self, read_bytes: usize, write_bytes: usize) -> Self {
        self.read_buffer_bytes = read_bytes.max(8 * 1024);
        self.write_buffer_bytes = write_bytes.max(8 * 1024);
        self
    }
    pub fn with_metrics(mut self, yes: bool) -> Self {
        self.metrics = yes;
        self
    }
    pub fn with_progress(mut self, yes: bool) -> Self {
        self.progress = yes;
        self
    }

    /// Reject configurations that cannot run. Called before any processing starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.inputs.is_empty() {
            return Err(ConfigError::NoInputs);
        }
        if self.num_threads == 0 {
            return Err(ConfigError::InvalidThreads(self.num_threads));
        }
        if self.cache_size == 0 {
            return Err(ConfigError::InvalidCacheSize(self.cache_size));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidBatchSize);
        }
        if self.max_files_per_topic == Some(0) {
            return Err(ConfigError::InvalidFileCap);
        }
        Ok(())
    }

    /// Full output file suffix, e.g. `.csv.zst`.
    pub fn output_extension(&self) -> String {
        format!("{}{}", self.format.extension(), self.compression.extension())
    }

    pub fn offsets_dir(&self) -> PathBuf {
        self.output.join("offsets")
    }

    pub fn bins_dir(&self) -> PathBuf {
        self.output.join("bins")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.output.join("locks")
    }
}
