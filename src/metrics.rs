//! Operation timings, collected by an explicitly constructed and shared collector.

use ahash::AHashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stat {
    pub count: u64,
    pub total: Duration,
}

#[derive(Debug, Default)]
pub struct Metrics {
    enabled: bool,
    stats: Mutex<AHashMap<&'static str, Stat>>,
}

impl Metrics {
    pub fn new(enabled: bool) -> Arc<Self> {
        Arc::new(Self { enabled, stats: Mutex::new(AHashMap::new()) })
    }

    /// A collector that records nothing.
    pub fn disabled() -> Arc<Self> {
        Self::new(false)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Time the enclosing scope under `name`; recorded when the guard drops.
    pub fn time(&self, name: &'static str) -> Timing<'_> {
        Timing { metrics: self, name, start: self.enabled.then(Instant::now) }
    }

    pub fn record(&self, name: &'static str, elapsed: Duration) {
        if !self.enabled {
            return;
        }
        let mut stats = self.stats.lock();
        let stat = stats.entry(name).or_default();
        stat.count += 1;
        stat.total += elapsed;
    }

    pub fn get(&self, name: &str) -> Option<Stat> {
        self.stats.lock().get(name).copied()
    }

    /// Log every recorded operation, slowest total first.
    pub fn report(&self) {
        if !self.enabled {
            return;
        }
        let mut rows: Vec<(&'static str, Stat)> = self.stats.lock().iter().map(|(k, v)| (*k, *v)).collect();
        rows.sort_by(|a, b| b.1.total.cmp(&a.1.total));
        for (name, stat) in rows {
            let mean = stat.total.div_f64(stat.count.max(1) as f64);
            tracing::info!("{:<28} n={:<10} total={:.3?} mean={:.3?}", name, stat.count, stat.total, mean);
        }
    }
}

pub struct Timing<'a> {
    metrics: &'a Metrics,
    name: &'static str,
    start: Option<Instant>,
}

impl Drop for Timing<'_> {
    fn drop(&mut self) {
        if let Some(start) = self.start {
            self.metrics.record(self.name, start.elapsed());
        }
    }
}
