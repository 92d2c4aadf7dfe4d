//! In-memory interval storage.
//!
//! Intervals are held in one ordered sequence per quark. Insertion order
//! already satisfies the per-quark ordering invariant, so appends go at the
//! tail and point queries are a binary search by start time. No persistence;
//! the history is destroyed with the state system.

use crate::backend::StateBackend;
use crate::error::{Result, StateError};
use crate::interval::{Quark, StateInterval, Timestamp};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::RwLock;

/// Bounded in-memory backend: per-quark ordered interval sequences.
///
/// Suitable for short traces and ephemeral derived analyses. Reads and the
/// single writer may proceed concurrently; the interval table is guarded by
/// a reader-writer lock.
#[derive(Debug)]
pub struct InMemoryBackend {
    start: Timestamp,
    end: AtomicI64,
    finished: AtomicBool,
    /// Interval sequences indexed by quark, each sorted by start time.
    intervals: RwLock<Vec<Vec<StateInterval>>>,
}

impl InMemoryBackend {
    /// Creates an empty backend whose history begins at `start`.
    pub fn new(start: Timestamp) -> Self {
        Self {
            start,
            end: AtomicI64::new(start),
            finished: AtomicBool::new(false),
            intervals: RwLock::new(Vec::new()),
        }
    }

    /// Total number of stored intervals, across all quarks.
    pub fn interval_count(&self) -> usize {
        self.intervals.read().unwrap().iter().map(Vec::len).sum()
    }

    fn find_at(seq: &[StateInterval], t: Timestamp) -> Option<&StateInterval> {
        // Last interval whose start <= t; since intervals are contiguous and
        // non-overlapping it is the only candidate.
        let idx = seq.partition_point(|iv| iv.start <= t);
        if idx == 0 {
            return None;
        }
        let candidate = &seq[idx - 1];
        candidate.intersects(t).then_some(candidate)
    }
}

impl StateBackend for InMemoryBackend {
    fn start_time(&self) -> Timestamp {
        self.start
    }

    fn end_time(&self) -> Timestamp {
        self.end.load(Ordering::Acquire)
    }

    fn insert_past_state(&self, interval: StateInterval) -> Result<()> {
        if self.finished.load(Ordering::Acquire) {
            return Err(StateError::Closed);
        }
        if interval.start < self.start {
            return Err(StateError::TimeRange {
                ts: interval.start,
                start: self.start,
                end: self.end_time(),
            });
        }

        let mut table = self.intervals.write().unwrap();
        if table.len() <= interval.quark {
            table.resize_with(interval.quark + 1, Vec::new);
        }
        let seq = &mut table[interval.quark];
        if let Some(last) = seq.last() {
            if interval.start <= last.end {
                return Err(StateError::TimeRange {
                    ts: interval.start,
                    start: last.end + 1,
                    end: i64::MAX,
                });
            }
        }
        self.end.fetch_max(interval.end, Ordering::AcqRel);
        seq.push(interval);
        Ok(())
    }

    fn finished_building(&self, end_time: Timestamp) -> Result<()> {
        self.end.fetch_max(end_time, Ordering::AcqRel);
        self.finished.store(true, Ordering::Release);
        Ok(())
    }

    fn query_single(&self, t: Timestamp, quark: Quark) -> Result<Option<StateInterval>> {
        let table = self.intervals.read().unwrap();
        Ok(table
            .get(quark)
            .and_then(|seq| Self::find_at(seq, t))
            .cloned())
    }

    fn query_full(&self, slots: &mut [Option<StateInterval>], t: Timestamp) -> Result<()> {
        let table = self.intervals.read().unwrap();
        for (quark, seq) in table.iter().enumerate().take(slots.len()) {
            if let Some(iv) = Self::find_at(seq, t) {
                slots[quark] = Some(iv.clone());
            }
        }
        Ok(())
    }

    fn query_range(
        &self,
        quark: Quark,
        range_start: Timestamp,
        range_end: Timestamp,
    ) -> Result<Vec<StateInterval>> {
        let table = self.intervals.read().unwrap();
        let Some(seq) = table.get(quark) else {
            return Ok(Vec::new());
        };
        let from = seq.partition_point(|iv| iv.end < range_start);
        Ok(seq[from..]
            .iter()
            .take_while(|iv| iv.start <= range_end)
            .cloned()
            .collect())
    }
}
