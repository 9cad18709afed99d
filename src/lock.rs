//! Per-topic advisory locks so that one process at a time restructures a topic.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::PathBuf;

pub trait LockManager: Send + Sync {
    /// Take the lock for `topic` without waiting. `None` means another holder has it.
    fn try_acquire(&self, topic: &str) -> Result<Option<TopicLock>>;
}

/// Held lock; released on drop.
pub struct TopicLock {
    topic: String,
    file: Option<File>,
}

impl TopicLock {
    /// A guard that is not backed by any file; for lock managers without state.
    pub fn unbacked(topic: impl Into<String>) -> Self {
        Self { topic: topic.into(), file: None }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl Drop for TopicLock {
    fn drop(&mut self) {
        if let Some(file) = &self.file {
            if let Err(e) = file.unlock() {
                tracing::warn!("unlock topic {}: {}", self.topic, e);
            }
        }
    }
}

/// `flock`-style exclusive locks on `<dir>/<topic>.lock`.
#[derive(Clone, Debug)]
pub struct FileLockManager {
    dir: PathBuf,
}

impl FileLockManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl LockManager for FileLockManager {
    fn try_acquire(&self, topic: &str) -> Result<Option<TopicLock>> {
        fs::create_dir_all(&self.dir).with_context(|| format!("create lock directory {}", self.dir.display()))?;
        let path = self.dir.join(format!("{topic}.lock"));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("open lock {}", path.display()))?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(TopicLock { topic: topic.to_string(), file: Some(file) })),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
                Ok(None)
            }
            Err(e) => Err(e).with_context(|| format!("lock {}", path.display())),
        }
    }
}

/// Lock manager for single-instance deployments: every acquisition succeeds.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopLockManager;

impl LockManager for NoopLockManager {
    fn try_acquire(&self, topic: &str) -> Result<Option<TopicLock>> {
        Ok(Some(TopicLock::unbacked(topic)))
    }
}
