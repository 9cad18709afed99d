mod config;
mod offsets;
mod guarded;
mod ledger;
mod debounce;
mod accountant;

mod csv_row;
mod compression;
mod converter;
mod record;
mod storage;
mod path;
mod lock;

mod file_cache;
mod file_cache_store;
mod restructure;

mod metrics;
mod mem;
mod progress;
mod util;

pub use crate::config::{ConfigError, RestructureOptions};
pub use crate::offsets::{OffsetRange, TopicPartition};
pub use crate::guarded::Guarded;
pub use crate::ledger::{IntervalLedger, RangeSet};
pub use crate::debounce::{DebouncedPersister, Persist};
pub use crate::accountant::{Accountant, Bin, Ledger, Transaction, BINS_HEADER, OFFSETS_HEADER};

// Collaborators: formats, codecs, sources, path policy, locks.
pub use crate::compression::{Compression, Sink};
pub use crate::converter::{flatten_record, Format, RecordConverter};
pub use crate::record::{is_record_file, Record, RecordFile, RecordIter, RECORD_FILE_EXTENSIONS};
pub use crate::storage::{is_transient, LocalStorage, SourceEntry, SourceStorage, TRANSIENT_DIR};
pub use crate::path::{ObservationKeyPathFactory, Organization, PathFactory, UNKNOWN_DATE};
pub use crate::lock::{FileLockManager, LockManager, NoopLockManager, TopicLock};

pub use crate::file_cache::{FileCache, FileCacheOptions};
pub use crate::file_cache_store::{FileCacheStore, WriteResponse};
pub use crate::restructure::{Restructurer, RunSummary, MAX_WRITE_ATTEMPTS};

// Injected collectors and guards.
pub use crate::metrics::{Metrics, Stat, Timing};
pub use crate::mem::MemoryWatcher;
pub use crate::progress::TopicProgress;

//export robust file ops so binaries can import from crate root.
pub use crate::util::{init_tracing_once, open_with_backoff, create_with_backoff, remove_with_backoff, publish_atomic};
