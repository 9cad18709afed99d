use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::Duration;

const TRIES: usize = 16;
const DELAY_MS: u64 = 50;

static INIT_ONCE: std::sync::Once = std::sync::Once::new();

/// Install the global `tracing` subscriber once; honours `RUST_LOG` (default `info`).
pub fn init_tracing_once() {
    INIT_ONCE.call_once(|| {
        let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
        let _ = tracing_subscriber::fmt().with_env_filter(env_filter).try_init();
    });
}

/// Return true for transient/retriable I/O errors often seen on Windows when
/// filter drivers (AV/backup), network volumes, or sharing violations occur.
fn is_retriable_io_error(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        // 5 access denied, 32 sharing violation, 33 lock violation, 225 AV blocked,
        // 433 missing device, 1006 volume altered, 1117 device error,
        // 1224 user-mapped section open, 21 device not ready
        Some(5) | Some(32) | Some(33) | Some(225) | Some(433) | Some(1006) | Some(1117) | Some(1224) | Some(21)
    ) || e.kind() == io::ErrorKind::Interrupted
}

/// Run `op` until it succeeds, fails with a non-retriable error, or `tries` is exhausted.
/// Backoff grows linearly with the attempt number.
fn with_backoff<T>(tries: usize, delay_ms: u64, mut op: impl FnMut() -> io::Result<T>) -> io::Result<T> {
    let mut last_err: Option<io::Error> = None;
    for i in 0..tries.max(1) {
        match op() {
            Ok(v) => return Ok(v),
            Err(e) if is_retriable_io_error(&e) => {
                last_err = Some(e);
                sleep(Duration::from_millis(delay_ms.saturating_mul((i + 1) as u64)));
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "retries exhausted")))
}

/// Open a file for reading with retries/backoff for transient errors.
pub fn open_with_backoff(path: &Path) -> io::Result<File> {
    with_backoff(TRIES, DELAY_MS, || File::open(path))
}

/// Create (truncate) a file with retries/backoff for transient errors.
pub fn create_with_backoff(path: &Path) -> io::Result<File> {
    with_backoff(TRIES, DELAY_MS, || File::create(path))
}

/// Remove a file with retries/backoff. Succeeds if the file doesn't exist.
pub fn remove_with_backoff(path: &Path) -> Result<()> {
    match with_backoff(TRIES, DELAY_MS, || fs::remove_file(path)) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("remove {}", path.display())),
    }
}

/// Create the parent directory of `path` if it has one.
pub fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
        }
    }
    Ok(())
}

/// Sibling of `dest` used as a same-filesystem staging file.
fn staging_sibling(dest: &Path) -> PathBuf {
    let name = dest.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    dest.with_file_name(format!(".{}.{:016x}.partial", name, rand::random::<u64>()))
}

/// Atomically publish `tmp` over `dest`. Readers see either the old or the new file,
/// never a partially written one.
///
/// A plain rename is tried first. When `tmp` lives on another filesystem the content
/// is copied to a staging sibling of `dest` and that sibling is renamed instead.
pub fn publish_atomic(tmp: &Path, dest: &Path) -> Result<()> {
    ensure_parent_dir(dest)?;
    if with_backoff(TRIES, DELAY_MS, || fs::rename(tmp, dest)).is_ok() {
        return Ok(());
    }
    let staging = staging_sibling(dest);
    with_backoff(TRIES, DELAY_MS, || fs::copy(tmp, &staging))
        .with_context(|| format!("copy {} -> {}", tmp.display(), staging.display()))?;
    if let Err(e) = with_backoff(TRIES, DELAY_MS, || fs::rename(&staging, dest)) {
        let _ = fs::remove_file(&staging);
        return Err(e).with_context(|| format!("rename {} -> {}", staging.display(), dest.display()));
    }
    remove_with_backoff(tmp)
}

/// A file name that is unique within `dir`, derived from `stem`.
pub fn unique_temp_path(dir: &Path, stem: &str) -> PathBuf {
    dir.join(format!("{}.{:016x}.tmp", stem, rand::random::<u64>()))
}

/// Replace every character outside `[A-Za-z0-9_-]` with `_`.
pub fn sanitize_id(raw: &str) -> String {
    raw.trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect()
}
