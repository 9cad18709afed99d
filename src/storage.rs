//! Source file system access.

use anyhow::{Context, Result};
use std::fs;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::util::open_with_backoff;

/// Directory name used by upstream writers for files that are still being written.
pub const TRANSIENT_DIR: &str = "+tmp";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceEntry {
    pub path: PathBuf,
    pub is_dir: bool,
}

/// Read-only view of the hierarchical store holding record containers.
pub trait SourceStorage: Send + Sync {
    /// Every entry below `path`, recursively, excluding `path` itself.
    fn list(&self, path: &Path) -> Result<Vec<SourceEntry>>;

    fn len(&self, path: &Path) -> Result<u64>;

    fn open(&self, path: &Path) -> Result<Box<dyn Read + Send>>;
}

/// True if any component of `path` is the transient-write directory.
pub fn is_transient(path: &Path) -> bool {
    path.components().any(|c| c.as_os_str() == TRANSIENT_DIR)
}

/// Local disk implementation.
#[derive(Clone, Copy, Debug, Default)]
pub struct LocalStorage;

impl SourceStorage for LocalStorage {
    fn list(&self, path: &Path) -> Result<Vec<SourceEntry>> {
        let mut out = Vec::new();
        for entry in WalkDir::new(path).min_depth(1).follow_links(true) {
            let entry = entry.with_context(|| format!("list {}", path.display()))?;
            out.push(SourceEntry { path: entry.path().to_path_buf(), is_dir: entry.file_type().is_dir() });
        }
        Ok(out)
    }

    fn len(&self, path: &Path) -> Result<u64> {
        Ok(fs::metadata(path).with_context(|| format!("stat {}", path.display()))?.len())
    }

    fn open(&self, path: &Path) -> Result<Box<dyn Read + Send>> {
        let f = open_with_backoff(path).with_context(|| format!("open {}", path.display()))?;
        Ok(Box::new(BufReader::new(f)))
    }
}
