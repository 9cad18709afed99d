//! Debounced persistence on a dedicated writer thread.
//!
//! Many `trigger()` calls within one delay window collapse into a single write.
//! `flush()` writes immediately and waits (bounded) for the outcome; `close()`
//! flushes and stops the thread. A failing scheduled write is logged and the
//! thread keeps serving later triggers.

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Something that can write its current in-memory state to durable storage.
///
/// Called from the persister thread while other threads keep mutating that state,
/// so implementations must snapshot through a thread-safe read path.
pub trait Persist: Send + Sync + 'static {
    fn persist(&self) -> Result<()>;
}

enum Command {
    Trigger,
    Flush(Sender<Result<()>>),
    Close(Sender<Result<()>>),
}

pub struct DebouncedPersister {
    name: String,
    tx: Sender<Command>,
    scheduled: Arc<AtomicBool>,
    timeout: Duration,
    handle: Option<JoinHandle<()>>,
}

impl DebouncedPersister {
    /// Spawn the writer thread for `target`.
    ///
    /// `delay` is the debounce window; `timeout` bounds how long `flush`/`close`
    /// wait for the writer thread.
    pub fn start(name: impl Into<String>, target: Arc<dyn Persist>, delay: Duration, timeout: Duration) -> Result<Self> {
        let name = name.into();
        let (tx, rx) = unbounded();
        let scheduled = Arc::new(AtomicBool::new(false));
        let thread_flag = scheduled.clone();
        let thread_name = name.clone();
        let handle = std::thread::Builder::new()
            .name(format!("persist-{}", truncate(&name, 40)))
            .spawn(move || run_writer(&thread_name, target, rx, thread_flag, delay))
            .with_context(|| format!("spawn persister thread for {name}"))?;
        Ok(Self { name, tx, scheduled, timeout, handle: Some(handle) })
    }

    /// Schedule a write within the debounce window; no-op when one is pending.
    pub fn trigger(&self) {
        if !self.scheduled.swap(true, Ordering::AcqRel) && self.tx.send(Command::Trigger).is_err() {
            tracing::warn!("persister {} is closed; trigger dropped", self.name);
        }
    }

    /// Write now, cancelling any pending scheduled write, and wait for the result.
    pub fn flush(&self) -> Result<()> {
        let (reply_tx, reply_rx) = bounded(1);
        self.tx
            .send(Command::Flush(reply_tx))
            .map_err(|_| anyhow!("persister {} is closed", self.name))?;
        self.await_reply(&reply_rx)
    }

    /// Flush, then stop the writer thread.
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    fn await_reply(&self, reply_rx: &Receiver<Result<()>>) -> Result<()> {
        match reply_rx.recv_timeout(self.timeout) {
            Ok(res) => res.with_context(|| format!("persist {}", self.name)),
            Err(RecvTimeoutError::Timeout) => Err(anyhow!("persister {} timed out after {:?}", self.name, self.timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(anyhow!("persister {} thread exited", self.name)),
        }
    }

    fn shutdown(&mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else { return Ok(()) };
        let (reply_tx, reply_rx) = bounded(1);
        if self.tx.send(Command::Close(reply_tx)).is_err() {
            let _ = handle.join();
            return Err(anyhow!("persister {} thread exited", self.name));
        }
        match reply_rx.recv_timeout(self.timeout) {
            Ok(res) => {
                let _ = handle.join();
                res.with_context(|| format!("persist {}", self.name))
            }
            // The thread is left to finish on its own; joining could block forever.
            Err(RecvTimeoutError::Timeout) => Err(anyhow!("persister {} timed out after {:?}", self.name, self.timeout)),
            Err(RecvTimeoutError::Disconnected) => {
                let _ = handle.join();
                Err(anyhow!("persister {} thread exited", self.name))
            }
        }
    }
}

impl Drop for DebouncedPersister {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::error!("closing persister {}: {:#}", self.name, e);
        }
    }
}

fn run_writer(name: &str, target: Arc<dyn Persist>, rx: Receiver<Command>, scheduled: Arc<AtomicBool>, delay: Duration) {
    let write = |scheduled: &AtomicBool| -> Result<()> {
        scheduled.store(false, Ordering::Release);
        let res = target.persist();
        if let Err(e) = &res {
            tracing::error!("persist {} failed: {:#}", name, e);
        }
        res
    };

    let mut deadline: Option<Instant> = None;
    loop {
        let cmd = match deadline {
            Some(at) => match rx.recv_deadline(at) {
                Ok(cmd) => Some(cmd),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => {
                    let _ = write(&scheduled);
                    break;
                }
            },
            None => match rx.recv() {
                Ok(cmd) => Some(cmd),
                Err(_) => break,
            },
        };

        match cmd {
            None => {
                deadline = None;
                let _ = write(&scheduled);
            }
            Some(Command::Trigger) => {
                if deadline.is_none() {
                    deadline = Some(Instant::now() + delay);
                }
            }
            Some(Command::Flush(reply)) => {
                deadline = None;
                let _ = reply.send(write(&scheduled));
            }
            Some(Command::Close(reply)) => {
                let _ = reply.send(write(&scheduled));
                break;
            }
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
