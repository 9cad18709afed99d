use anyhow::{Context, Result};
use clap::Parser;
use restructure::{init_tracing_once, Compression, Format, RestructureOptions, Restructurer};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::Ordering;
use std::time::Duration;

/// Restructure topic record files into per project/user/topic/hour output files.
#[derive(Debug, Parser)]
#[command(name = "restructure")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Input roots containing `<topic>/<partition>/<topic>+<partition>+<from>+<to>.jsonl[.zst]` files.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Output root.
    #[arg(short, long, env = "RESTRUCTURE_OUTPUT", default_value = "output")]
    output: PathBuf,

    /// Output format: csv or json.
    #[arg(short, long, default_value = "csv")]
    format: Format,

    /// Output compression: none or zstd.
    #[arg(short, long, default_value = "none")]
    compression: Compression,

    /// Remove duplicate lines from every written file after each topic.
    #[arg(short, long)]
    deduplicate: bool,

    /// Topics restructured concurrently.
    #[arg(short = 't', long, env = "RESTRUCTURE_THREADS")]
    num_threads: Option<usize>,

    /// Process at most this many new files per topic per run.
    #[arg(long)]
    max_files: Option<usize>,

    /// Topics to leave alone; may be repeated or comma separated.
    #[arg(long = "exclude", value_delimiter = ',')]
    excluded_topics: Vec<String>,

    /// Working directory for staged output and bookkeeping.
    #[arg(long, env = "RESTRUCTURE_TMP_DIR")]
    tmp_dir: Option<PathBuf>,

    /// Open output files per topic.
    #[arg(long, default_value_t = 100)]
    cache_size: usize,

    /// Offsets between forced flushes (jittered).
    #[arg(long, default_value_t = 100_000)]
    batch_size: u64,

    /// Re-run every N seconds until interrupted.
    #[arg(long)]
    poll_interval: Option<u64>,

    /// Log operation timings at the end of each run.
    #[arg(long)]
    metrics: bool,

    /// Show a progress bar over topics.
    #[arg(long)]
    progress: bool,
}

impl Cli {
    fn options(&self) -> RestructureOptions {
        let mut opts = RestructureOptions::default()
            .with_inputs(self.inputs.iter().cloned())
            .with_output(&self.output)
            .with_format(self.format)
            .with_compression(self.compression)
            .with_deduplicate(self.deduplicate)
            .with_max_files_per_topic(self.max_files)
            .with_excluded_topics(self.excluded_topics.iter().cloned())
            .with_cache_size(self.cache_size)
            .with_batch_size(self.batch_size)
            .with_poll_interval(self.poll_interval.map(Duration::from_secs))
            .with_metrics(self.metrics)
            .with_progress(self.progress);
        if let Some(n) = self.num_threads {
            opts = opts.with_threads(n);
        }
        if let Some(dir) = &self.tmp_dir {
            opts = opts.with_tmp_dir(dir);
        }
        opts
    }
}

fn main() -> ExitCode {
    init_tracing_once();
    let cli = Cli::parse();
    let opts = cli.options();
    if let Err(e) = opts.validate() {
        tracing::error!("invalid configuration: {}", e);
        return ExitCode::from(2);
    }
    match run(opts) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(opts: RestructureOptions) -> Result<()> {
    let poll_interval = opts.poll_interval;
    let restructurer = Restructurer::new(opts);

    let shutdown = restructurer.shutdown_flag();
    ctrlc::set_handler(move || {
        tracing::info!("interrupt received; finishing current files");
        shutdown.store(true, Ordering::SeqCst);
    })
    .context("install interrupt handler")?;

    match poll_interval {
        Some(interval) => restructurer.run_service(interval),
        None => {
            let summary = restructurer.run()?;
            tracing::info!(
                "{} topics processed, {} skipped, {} failed",
                summary.topics_processed,
                summary.topics_skipped,
                summary.topics_failed
            );
            Ok(())
        }
    }
}
