//! One open output file.
//!
//! Output always goes to a temp file first. Reopening an existing destination
//! copies its decoded content into the temp stream and appends after it; closing
//! publishes the temp file over the destination in one rename. A destination that
//! cannot be decoded is moved aside to `<name>.corrupted[-N]` and the file starts
//! over empty.

use anyhow::{anyhow, Context, Result};
use std::fs;
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::accountant::{Ledger, Transaction};
use crate::compression::{Compression, Sink};
use crate::converter::{Format, RecordConverter};
use crate::record::Record;
use crate::util::{create_with_backoff, ensure_parent_dir, open_with_backoff, publish_atomic, remove_with_backoff, unique_temp_path};

const MAX_QUARANTINE_ATTEMPTS: usize = 100;

/// Settings shared by every writer of one store.
#[derive(Clone, Copy, Debug)]
pub struct FileCacheOptions {
    pub format: Format,
    pub compression: Compression,
    pub write_buffer_bytes: usize,
}

pub struct FileCache {
    path: PathBuf,
    tmp_path: PathBuf,
    sink: Option<Sink>,
    converter: Box<dyn RecordConverter>,
    last_use: Instant,
    pending: Ledger,
    has_error: bool,
}

impl FileCache {
    /// Open a writer for `path`, staging output in `tmp_dir`. `example` decides the
    /// header of a brand-new file.
    pub fn open(path: &Path, example: &Record, tmp_dir: &Path, opts: &FileCacheOptions) -> Result<Self> {
        let stem = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_else(|| "output".into());
        let tmp_path = unique_temp_path(tmp_dir, &stem);

        let mut sink = new_sink(&tmp_path, opts)?;
        let mut first_line = None;

        let existing_len = match fs::metadata(path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e).with_context(|| format!("stat {}", path.display())),
        };
        if existing_len > 0 {
            match copy_existing(path, opts.format, opts.compression, &mut sink) {
                Ok(line) => first_line = line,
                Err(CopyError::Corrupt(e)) => {
                    tracing::warn!("existing file {} is unreadable, starting over: {:#}", path.display(), e);
                    drop(sink);
                    quarantine(path)?;
                    sink = new_sink(&tmp_path, opts)?;
                }
                Err(CopyError::Io(e)) => {
                    drop(sink);
                    let _ = remove_with_backoff(&tmp_path);
                    return Err(e).with_context(|| format!("carry over {}", path.display()));
                }
            }
        }

        let converter = match opts.format.converter(first_line.as_deref(), example, &mut sink) {
            Ok(c) => c,
            Err(e) => {
                drop(sink);
                let _ = remove_with_backoff(&tmp_path);
                return Err(e).with_context(|| format!("prepare converter for {}", path.display()));
            }
        };

        Ok(Self {
            path: path.to_path_buf(),
            tmp_path,
            sink: Some(sink),
            converter,
            last_use: Instant::now(),
            pending: Ledger::new(),
            has_error: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn last_use(&self) -> Instant {
        self.last_use
    }

    pub fn has_error(&self) -> bool {
        self.has_error
    }

    /// Serialize `record`. `Ok(false)` when its shape does not fit this file.
    pub fn write(&mut self, record: &Record) -> Result<bool> {
        self.last_use = Instant::now();
        let sink = self.sink.as_mut().ok_or_else(|| anyhow!("write to closed file {}", self.path.display()))?;
        self.converter.write(record, sink)
    }

    /// Remember `tx` for hand-off to the accountant once this file is closed.
    pub fn add_transaction(&mut self, tx: &Transaction) {
        self.pending.add(tx);
    }

    /// Mark as failed: the file is not published and its bookkeeping is dropped.
    pub fn mark_error(&mut self) {
        self.has_error = true;
    }

    /// Finish the stream and publish it. Returns the pending bookkeeping, or
    /// `None` when the writer had failed and nothing was published.
    pub fn close(mut self) -> Result<Option<Ledger>> {
        let Some(sink) = self.sink.take() else { return Ok(None) };
        if self.has_error {
            drop(sink);
            remove_with_backoff(&self.tmp_path)?;
            return Ok(None);
        }
        let published = sink
            .finish()
            .with_context(|| format!("finish {}", self.tmp_path.display()))
            .and_then(|_| publish_atomic(&self.tmp_path, &self.path));
        if let Err(e) = published {
            let _ = remove_with_backoff(&self.tmp_path);
            return Err(e);
        }
        Ok(Some(std::mem::take(&mut self.pending)))
    }
}

impl Drop for FileCache {
    fn drop(&mut self) {
        // Abandoned without close(): discard the staged output.
        if self.sink.take().is_some() {
            let _ = remove_with_backoff(&self.tmp_path);
        }
    }
}

fn new_sink(tmp_path: &Path, opts: &FileCacheOptions) -> Result<Sink> {
    ensure_parent_dir(tmp_path)?;
    let f = create_with_backoff(tmp_path).with_context(|| format!("create {}", tmp_path.display()))?;
    Ok(opts.compression.compress(f, opts.write_buffer_bytes)?)
}

/// Why an existing destination could not be carried over.
#[derive(Debug)]
enum CopyError {
    /// The destination does not decode; it may be quarantined.
    Corrupt(anyhow::Error),
    /// Opening the destination or writing the staging file failed; the
    /// destination is left alone.
    Io(anyhow::Error),
}

/// Decode `path` into `out`; returns its first row without terminator.
fn copy_existing(path: &Path, format: Format, compression: Compression, out: &mut impl Write) -> Result<Option<String>, CopyError> {
    let f = open_with_backoff(path)
        .with_context(|| format!("open {}", path.display()))
        .map_err(CopyError::Io)?;
    let corrupt = |e: io::Error| CopyError::Corrupt(anyhow::Error::new(e).context(format!("decode {}", path.display())));
    let staging = |e: io::Error| CopyError::Io(anyhow::Error::new(e).context("write staging file"));

    let mut reader = BufReader::new(compression.decompress(BufReader::new(f)).map_err(corrupt)?);
    let Some(first) = format.read_row(&mut reader).map_err(corrupt)? else { return Ok(None) };
    out.write_all(first.as_bytes()).map_err(staging)?;
    loop {
        let chunk = match reader.fill_buf() {
            Ok([]) => break,
            Ok(chunk) => chunk,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(corrupt(e)),
        };
        let n = chunk.len();
        out.write_all(chunk).map_err(staging)?;
        reader.consume(n);
    }
    Ok(Some(first.trim_end_matches(['\n', '\r']).to_string()))
}

/// Move an unreadable destination out of the way.
fn quarantine(path: &Path) -> Result<()> {
    let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
    for attempt in 0..MAX_QUARANTINE_ATTEMPTS {
        let target = if attempt == 0 {
            path.with_file_name(format!("{name}.corrupted"))
        } else {
            path.with_file_name(format!("{name}.corrupted-{attempt}"))
        };
        if target.exists() {
            continue;
        }
        fs::rename(path, &target).with_context(|| format!("move {} to {}", path.display(), target.display()))?;
        tracing::warn!("moved corrupted file {} to {}", path.display(), target.display());
        return Ok(());
    }
    Err(anyhow!("no free quarantine name for {} after {} attempts", path.display(), MAX_QUARANTINE_ATTEMPTS))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Accepts `limit` bytes, then reports a full disk.
    struct FullDisk {
        limit: usize,
    }

    impl Write for FullDisk {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.limit == 0 {
                return Err(io::Error::new(io::ErrorKind::Other, "no space left on device"));
            }
            let n = buf.len().min(self.limit);
            self.limit -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn staging_failures_are_not_mistaken_for_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.csv");
        fs::write(&path, "h\n1\n2\n").unwrap();

        for limit in [0, 4] {
            let err = copy_existing(&path, Format::Csv, Compression::None, &mut FullDisk { limit }).unwrap_err();
            assert!(matches!(err, CopyError::Io(_)), "{err:?}");
        }
        assert_eq!(fs::read_to_string(&path).unwrap(), "h\n1\n2\n");
    }

    #[test]
    fn undecodable_content_is_reported_as_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.csv.zst");
        fs::write(&path, b"this is not a zstd frame").unwrap();

        let err = copy_existing(&path, Format::Csv, Compression::Zstd, &mut Vec::<u8>::new()).unwrap_err();
        assert!(matches!(err, CopyError::Corrupt(_)), "{err:?}");
    }

    #[test]
    fn multiline_header_is_copied_whole() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.csv");
        fs::write(&path, "\"a\nb\",c\n1,2\n").unwrap();

        let mut out: Vec<u8> = Vec::new();
        let first = copy_existing(&path, Format::Csv, Compression::None, &mut out).unwrap();
        assert_eq!(first.as_deref(), Some("\"a\nb\",c"));
        assert_eq!(out, b"\"a\nb\",c\n1,2\n");
    }
}
