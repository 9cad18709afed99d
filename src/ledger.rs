//! Interval bookkeeping for processed offsets.
//!
//! Every `(topic, partition)` owns a [`RangeSet`]: a sorted set of disjoint,
//! non-adjacent inclusive ranges. Adding `[0,1]` and `[3,4]` stores two ranges;
//! adding `[2,2]` afterwards collapses them into `[0,4]`. Storage therefore grows
//! with the number of gaps, not the number of offsets, and membership is a
//! single ordered lookup.

use ahash::AHashMap;
use parking_lot::RwLock;
use std::collections::BTreeMap;

use crate::guarded::Guarded;
use crate::offsets::{OffsetRange, TopicPartition};

/// Disjoint, non-adjacent inclusive ranges keyed by their lower bound.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RangeSet {
    ranges: BTreeMap<i64, i64>,
}

impl RangeSet {
    /// Merge `[from, to]` into the set.
    ///
    /// Extending an existing range is preferred over inserting; a touching
    /// predecessor is absorbed, and so is every successor that the grown range
    /// touches or overlaps.
    pub fn add(&mut self, from: i64, to: i64) {
        debug_assert!(from <= to);
        if self.contains(from, to) {
            return;
        }
        let mut lo = from;
        let mut hi = to;

        let previous = self.ranges.range(..from).next_back().map(|(&f, &t)| (f, t));
        if let Some((prev_from, prev_to)) = previous {
            if prev_to >= from.saturating_sub(1) {
                lo = prev_from;
                hi = hi.max(prev_to);
                self.ranges.remove(&prev_from);
            }
        }

        loop {
            let next = self.ranges.range(lo..).next().map(|(&f, &t)| (f, t));
            let Some((next_from, next_to)) = next else { break };
            if next_from > hi.saturating_add(1) {
                break;
            }
            hi = hi.max(next_to);
            self.ranges.remove(&next_from);
        }

        self.ranges.insert(lo, hi);
    }

    /// True when a single stored range covers all of `[from, to]`.
    pub fn contains(&self, from: i64, to: i64) -> bool {
        match self.ranges.range(..=from).next_back() {
            Some((_, &stored_to)) => stored_to >= to,
            None => false,
        }
    }

    /// Number of disjoint stored ranges.
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Stored ranges in increasing order as `(from, to)`.
    pub fn iter(&self) -> impl Iterator<Item = (i64, i64)> + '_ {
        self.ranges.iter().map(|(&f, &t)| (f, t))
    }
}

/// Processed offsets for any number of topic partitions.
///
/// `&mut self` methods are the single-writer path and take no locks. The `*_shared`
/// methods take a per-partition write lock and may be called from several threads at
/// once; merges into the same partition never interleave.
#[derive(Debug, Default)]
pub struct IntervalLedger {
    partitions: RwLock<AHashMap<TopicPartition, Guarded<RangeSet>>>,
}

impl IntervalLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, range: &OffsetRange) {
        self.partitions
            .get_mut()
            .entry(range.key())
            .or_default()
            .exclusive()
            .add(range.from, range.to);
    }

    pub fn add_shared(&self, range: &OffsetRange) {
        let key = range.key();
        {
            let map = self.partitions.read();
            if let Some(set) = map.get(&key) {
                set.write(|s| s.add(range.from, range.to));
                return;
            }
        }
        self.partitions.write().entry(key).or_default().write(|s| s.add(range.from, range.to));
    }

    /// Merge every range of `other` into this ledger through the shared path.
    pub fn merge_shared(&self, other: &IntervalLedger) {
        for range in other.ranges() {
            self.add_shared(&range);
        }
    }

    /// True when `range` is entirely covered by previously added ranges.
    pub fn contains(&self, range: &OffsetRange) -> bool {
        let map = self.partitions.read();
        match map.get(&range.key()) {
            Some(set) => set.read(|s| s.contains(range.from, range.to)),
            None => false,
        }
    }

    /// Number of disjoint ranges stored for `key`.
    pub fn size(&self, key: &TopicPartition) -> usize {
        self.partitions.read().get(key).map(|set| set.read(RangeSet::len)).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.read().values().all(|set| set.read(RangeSet::is_empty))
    }

    /// Snapshot of every stored range, ordered by topic, partition, then offset.
    pub fn ranges(&self) -> Vec<OffsetRange> {
        let map = self.partitions.read();
        let mut keys: Vec<&TopicPartition> = map.keys().collect();
        keys.sort();
        let mut out = Vec::new();
        for key in keys {
            let Some(guarded) = map.get(key) else { continue };
            let set = guarded.snapshot();
            out.extend(set.iter().map(|(from, to)| OffsetRange {
                topic: key.topic.clone(),
                partition: key.partition,
                from,
                to,
            }));
        }
        out
    }
}
