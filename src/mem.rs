use parking_lot::Mutex;
use std::time::{Duration, Instant};
use sysinfo::{System, SystemExt};

const REFRESH_EVERY: Duration = Duration::from_millis(500);

/// Cached, low-overhead memory watcher.
/// - Refreshes at most every `REFRESH_EVERY`.
/// - Uses available/total RAM to decide when open writers should be flushed early.
pub struct MemoryWatcher {
    state: Mutex<MemState>,
    low_fraction: f64,
}

struct MemState {
    sys: System,
    last_check: Instant,
    last_frac: f64, // available / total (0.0..1.0)
}

impl MemoryWatcher {
    /// `low_fraction`: available share of RAM below which memory counts as low.
    pub fn new(low_fraction: f64) -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        Self {
            state: Mutex::new(MemState {
                sys,
                last_check: Instant::now().checked_sub(REFRESH_EVERY * 2).unwrap_or_else(Instant::now),
                last_frac: 1.0,
            }),
            low_fraction,
        }
    }

    /// Recent estimate of the available memory fraction (0.0..1.0).
    pub fn available_fraction(&self) -> f64 {
        let mut st = self.state.lock();
        let now = Instant::now();
        if now.duration_since(st.last_check) >= REFRESH_EVERY {
            st.sys.refresh_memory();
            let total = st.sys.total_memory() as f64;
            let avail = st.sys.available_memory() as f64;
            st.last_frac = if total > 0.0 { (avail / total).clamp(0.0, 1.0) } else { 1.0 };
            st.last_check = now;
        }
        st.last_frac
    }

    pub fn is_low(&self) -> bool {
        self.available_fraction() < self.low_fraction
    }
}
