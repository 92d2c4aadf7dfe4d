//! Storage backends for state intervals.
//!
//! A backend receives closed intervals from the transient state in
//! non-decreasing start-time order and answers point and range queries.
//! Two strategies are provided: [`InMemoryBackend`] for short or ephemeral
//! histories, and [`HistoryTreeBackend`] for disk-persisted ones. Callers
//! depend only on the [`StateBackend`] trait and select the strategy at
//! construction time.

pub mod history;
pub mod memory;

pub use history::{HistoryTreeBackend, HistoryTreeConfig};
pub use memory::InMemoryBackend;

use crate::error::Result;
use crate::interval::{Quark, StateInterval, Timestamp};

/// How queries behave when asked about a time the history has not reached
/// yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryMode {
    /// Answer immediately from what is known, serving the open value for
    /// times past the latest state change.
    #[default]
    BestEffort,
    /// Block until the history reaches the requested time or finishes
    /// building.
    Block,
}

/// Polymorphic interval storage.
///
/// Implementations are internally synchronized: one thread may insert while
/// any number of threads query. After [`StateBackend::finished_building`] the
/// backend is read-only.
pub trait StateBackend: Send + Sync {
    /// The start of the time range covered by this backend.
    fn start_time(&self) -> Timestamp;

    /// The latest end time observed so far. Monotonically non-decreasing;
    /// equals `start_time` until the first interval closes.
    fn end_time(&self) -> Timestamp;

    /// Appends a closed interval.
    ///
    /// # Errors
    ///
    /// - `StateError::TimeRange` if the interval starts before the backend's
    ///   start time or overlaps the previously inserted interval for the
    ///   same quark.
    /// - `StateError::Closed` if the backend has finished building.
    fn insert_past_state(&self, interval: StateInterval) -> Result<()>;

    /// Marks the history as complete at `end_time` and makes the backend
    /// read-only. For disk backends this flushes all buffered nodes.
    fn finished_building(&self, end_time: Timestamp) -> Result<()>;

    /// Returns the interval covering `t` for `quark`, if one was inserted.
    fn query_single(&self, t: Timestamp, quark: Quark) -> Result<Option<StateInterval>>;

    /// Fills `slots[q]` with the interval covering `t` for every quark `q`
    /// that has one. Slots for quarks with no stored interval at `t` are
    /// left untouched.
    fn query_full(&self, slots: &mut [Option<StateInterval>], t: Timestamp) -> Result<()>;

    /// Returns the stored intervals for `quark` intersecting
    /// `[range_start, range_end]`, in time order.
    ///
    /// The default implementation walks [`StateBackend::query_single`] from
    /// interval to interval.
    fn query_range(
        &self,
        quark: Quark,
        range_start: Timestamp,
        range_end: Timestamp,
    ) -> Result<Vec<StateInterval>> {
        let mut out = Vec::new();
        let mut t = range_start.max(self.start_time());
        let end = range_end.min(self.end_time());
        while t <= end {
            match self.query_single(t, quark)? {
                Some(interval) => {
                    let next = interval.end.saturating_add(1);
                    out.push(interval);
                    t = next;
                }
                None => break,
            }
        }
        Ok(out)
    }
}
