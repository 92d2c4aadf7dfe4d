//! Disk-persisted interval storage built on a history tree.
//!
//! The backend wraps the [`HistoryTree`] with the [`StateBackend`] contract:
//! it enforces the per-attribute ordering invariant on insertions, checks
//! query bounds against the covered time range, and keeps the tree read-only
//! once building finishes. A finished history file can be reopened later and
//! queried without rebuilding.

pub mod io;
pub mod node;
pub mod tree;

pub use tree::{HistoryTree, HistoryTreeConfig};

use crate::backend::StateBackend;
use crate::error::{Result, StateError};
use crate::interval::{Quark, StateInterval, Timestamp};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::debug;

/// History tree backend: intervals persisted in a paged tree file.
#[derive(Debug)]
pub struct HistoryTreeBackend {
    tree: HistoryTree,
    finished: AtomicBool,
    /// End time of the last interval inserted per quark, for ordering
    /// checks. Only the single producer touches this.
    last_end: Mutex<Vec<Timestamp>>,
}

impl HistoryTreeBackend {
    /// Creates a backend building a new history file at `path`, covering
    /// times from `start`.
    pub fn new(path: &Path, config: HistoryTreeConfig, start: Timestamp) -> Result<Self> {
        let tree = HistoryTree::create(path, config, start)?;
        debug!(path = %path.display(), start, "created history tree backend");
        Ok(Self {
            tree,
            finished: AtomicBool::new(false),
            last_end: Mutex::new(Vec::new()),
        })
    }

    /// Reopens a finished history file read-only for queries.
    ///
    /// # Errors
    ///
    /// Returns an error of the corrupt-backend family if the file is not a
    /// valid history file.
    pub fn open(path: &Path, cache_size: usize) -> Result<Self> {
        let tree = HistoryTree::open(path, cache_size)?;
        debug!(path = %path.display(), "opened history tree backend");
        Ok(Self {
            tree,
            finished: AtomicBool::new(true),
            last_end: Mutex::new(Vec::new()),
        })
    }

    /// Number of page slots used by the underlying tree.
    pub fn node_count(&self) -> u32 {
        self.tree.node_count()
    }

    /// Verifies the structural consistency of a finished tree. See
    /// [`HistoryTree::check_integrity`].
    pub fn check_integrity(&self) -> Result<()> {
        self.tree.check_integrity()
    }

    fn check_bounds(&self, t: Timestamp) -> Result<()> {
        let (start, end) = (self.tree.start_time(), self.tree.end_time());
        if t < start || t > end {
            return Err(StateError::TimeRange { ts: t, start, end });
        }
        Ok(())
    }
}

impl StateBackend for HistoryTreeBackend {
    fn start_time(&self) -> Timestamp {
        self.tree.start_time()
    }

    fn end_time(&self) -> Timestamp {
        self.tree.end_time()
    }

    fn insert_past_state(&self, interval: StateInterval) -> Result<()> {
        if self.finished.load(Ordering::Acquire) {
            return Err(StateError::Closed);
        }
        if interval.start < self.tree.start_time() {
            return Err(StateError::TimeRange {
                ts: interval.start,
                start: self.tree.start_time(),
                end: self.tree.end_time(),
            });
        }

        {
            let mut last_end = self.last_end.lock().unwrap();
            if last_end.len() <= interval.quark {
                last_end.resize(interval.quark + 1, Timestamp::MIN);
            }
            let prev = last_end[interval.quark];
            if prev != Timestamp::MIN && interval.start <= prev {
                return Err(StateError::TimeRange {
                    ts: interval.start,
                    start: prev + 1,
                    end: i64::MAX,
                });
            }
            last_end[interval.quark] = interval.end;
        }
        self.tree.insert(interval)
    }

    fn finished_building(&self, end_time: Timestamp) -> Result<()> {
        self.tree.finish(end_time)?;
        self.finished.store(true, Ordering::Release);
        Ok(())
    }

    fn query_single(&self, t: Timestamp, quark: Quark) -> Result<Option<StateInterval>> {
        self.check_bounds(t)?;
        self.tree.query_single(t, quark)
    }

    fn query_full(&self, slots: &mut [Option<StateInterval>], t: Timestamp) -> Result<()> {
        self.check_bounds(t)?;
        self.tree.query_full(slots, t)
    }

    fn query_range(
        &self,
        quark: Quark,
        range_start: Timestamp,
        range_end: Timestamp,
    ) -> Result<Vec<StateInterval>> {
        if range_end < range_start {
            return Ok(Vec::new());
        }
        self.tree.query_range(
            quark,
            range_start.max(self.tree.start_time()),
            range_end.min(self.tree.end_time()),
        )
    }
}
