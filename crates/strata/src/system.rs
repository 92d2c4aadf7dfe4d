//! The state system façade: attribute tree + transient state + backend.
//!
//! One producer thread drives the history forward through
//! [`StateSystem::modify_attribute`] and eventually
//! [`StateSystem::close_history`]; any number of consumer threads query
//! concurrently. Queries hit the transient state first (the open values are
//! the freshest information), then fall through to the backend for closed
//! intervals.

use crate::attribute::AttributeTree;
use crate::backend::{
    HistoryTreeBackend, HistoryTreeConfig, InMemoryBackend, QueryMode, StateBackend,
};
use crate::error::{Result, StateError};
use crate::interval::{Quark, StateInterval, StateValue, Timestamp};
use crate::transient::TransientState;
use std::path::Path;
use std::sync::{Condvar, Mutex, RwLock};
use std::time::Duration;
use tracing::debug;

/// Upper bound on stack-attribute depth, so runaway pushes cannot grow the
/// attribute tree without limit.
const MAX_STACK_DEPTH: i32 = 100_000;

#[derive(Debug)]
struct Progress {
    finished: bool,
}

/// A complete state system: hierarchical attributes, their open values, and
/// a backend holding the closed intervals.
pub struct StateSystem {
    attributes: RwLock<AttributeTree>,
    transient: TransientState,
    backend: Box<dyn StateBackend>,
    query_mode: QueryMode,
    progress: Mutex<Progress>,
    built: Condvar,
}

impl StateSystem {
    /// Creates a state system over an arbitrary backend.
    pub fn with_backend(backend: Box<dyn StateBackend>, query_mode: QueryMode) -> Self {
        let transient = TransientState::new(backend.start_time());
        // Entry for the root attribute, quark 0.
        transient.add_empty_entry();
        Self {
            attributes: RwLock::new(AttributeTree::new()),
            transient,
            backend,
            query_mode,
            progress: Mutex::new(Progress { finished: false }),
            built: Condvar::new(),
        }
    }

    /// Creates a state system with an in-memory backend, starting at
    /// `start`.
    pub fn in_memory(start: Timestamp) -> Self {
        Self::with_backend(Box::new(InMemoryBackend::new(start)), QueryMode::default())
    }

    /// Creates a state system persisting to a history file at `path`.
    pub fn to_file(path: &Path, config: HistoryTreeConfig, start: Timestamp) -> Result<Self> {
        let backend = HistoryTreeBackend::new(path, config, start)?;
        Ok(Self::with_backend(Box::new(backend), QueryMode::default()))
    }

    /// Attaches to an already finished backend, typically a reopened history
    /// file. The system is read-only; attribute paths are not persisted, so
    /// callers re-register the paths they intend to query by name.
    pub fn from_existing_backend(backend: Box<dyn StateBackend>) -> Self {
        let system = Self::with_backend(backend, QueryMode::default());
        system.transient.deactivate();
        system.progress.lock().unwrap().finished = true;
        system
    }

    /// Start of the history's time range.
    pub fn start_time(&self) -> Timestamp {
        self.backend.start_time()
    }

    /// Latest time covered so far: grows while building, final once closed.
    pub fn current_end_time(&self) -> Timestamp {
        if self.transient.is_active() {
            self.backend.end_time().max(self.transient.latest_time())
        } else {
            self.backend.end_time()
        }
    }

    /// Number of existing attributes, root included.
    pub fn attribute_count(&self) -> usize {
        self.attributes.read().unwrap().len()
    }

    // ------------------------------------------------------------------
    // Attribute tree access
    // ------------------------------------------------------------------

    /// Returns the quark for `path`, creating any missing attributes.
    pub fn get_quark_and_create(&self, path: &str) -> Quark {
        let mut attributes = self.attributes.write().unwrap();
        let quark = attributes.quark_and_create(path);
        // New attributes open with a null value from the latest known time.
        while self.transient.len() < attributes.len() {
            self.transient.add_empty_entry();
        }
        quark
    }

    /// Looks up the quark for `path` without creating it.
    pub fn get_quark(&self, path: &str) -> Result<Quark> {
        self.attributes.read().unwrap().quark(path)
    }

    /// Reconstructs the full path of `quark`.
    pub fn attribute_path(&self, quark: Quark) -> Result<String> {
        self.attributes.read().unwrap().path(quark)
    }

    /// The leaf name of `quark`.
    pub fn attribute_name(&self, quark: Quark) -> Result<String> {
        Ok(self.attributes.read().unwrap().name(quark)?.to_string())
    }

    /// The parent quark of `quark`.
    pub fn parent_quark(&self, quark: Quark) -> Result<Quark> {
        self.attributes.read().unwrap().parent(quark)
    }

    /// The quarks below `quark`, optionally including all descendants.
    pub fn sub_attributes(&self, quark: Quark, recursive: bool) -> Result<Vec<Quark>> {
        self.attributes.read().unwrap().sub_attributes(quark, recursive)
    }

    /// Returns the quarks matching `pattern`, a `/`-separated path in which
    /// at most one segment may be the wildcard `*` (matching any one
    /// attribute at that depth). Unknown paths yield an empty list, as does
    /// a pattern with more than one wildcard.
    pub fn get_quarks(&self, pattern: &str) -> Vec<Quark> {
        let attributes = self.attributes.read().unwrap();
        let segments: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();

        let mut wildcard = None;
        for (i, segment) in segments.iter().enumerate() {
            if *segment == "*" {
                if wildcard.is_some() {
                    return Vec::new();
                }
                wildcard = Some(i);
            }
        }
        let Some(split) = wildcard else {
            return attributes.quark(pattern).into_iter().collect();
        };

        let prefix = segments[..split].join("/");
        let suffix = &segments[split + 1..];
        let Ok(base) = attributes.quark(&prefix) else {
            return Vec::new();
        };
        let Ok(children) = attributes.sub_attributes(base, false) else {
            return Vec::new();
        };

        let mut quarks = Vec::new();
        for child in children {
            if suffix.is_empty() {
                quarks.push(child);
                continue;
            }
            let Ok(child_path) = attributes.path(child) else {
                continue;
            };
            let candidate = format!("{}/{}", child_path, suffix.join("/"));
            if let Ok(q) = attributes.quark(&candidate) {
                quarks.push(q);
            }
        }
        quarks
    }

    // ------------------------------------------------------------------
    // Producer API
    // ------------------------------------------------------------------

    /// Applies a state change: `quark` takes `value` from time `t` on.
    ///
    /// # Errors
    ///
    /// See [`TransientState::process_state_change`] for the rejection
    /// cases: closed history, unknown quark, time before the open value's
    /// start, or a value type conflict.
    pub fn modify_attribute(&self, t: Timestamp, quark: Quark, value: StateValue) -> Result<()> {
        self.transient
            .process_state_change(&*self.backend, t, quark, value)?;
        if self.query_mode == QueryMode::Block {
            let _progress = self.progress.lock().unwrap();
            self.built.notify_all();
        }
        Ok(())
    }

    /// Replaces the open value of `quark` without emitting an interval,
    /// for corrections to the present.
    pub fn update_ongoing_state(&self, quark: Quark, value: StateValue) -> Result<()> {
        self.transient.set_ongoing(quark, value)
    }

    /// The open value of `quark`.
    pub fn query_ongoing(&self, quark: Quark) -> Result<StateValue> {
        self.transient.ongoing_value(quark)
    }

    /// The time the open value of `quark` took effect.
    pub fn ongoing_start_time(&self, quark: Quark) -> Result<Timestamp> {
        self.transient.ongoing_start(quark)
    }

    /// Pushes `value` onto the stack attribute `quark` at time `t`.
    ///
    /// The stack attribute itself holds the current depth as an `Int` (null
    /// when empty); each pushed value lives in a sub-attribute named after
    /// its depth, `1` being the bottom of the stack.
    ///
    /// # Errors
    ///
    /// - `StateError::ValueType` if the attribute already holds a
    ///   non-integer value.
    /// - `StateError::StackDepth` if the depth limit is reached.
    /// - The rejection cases of [`StateSystem::modify_attribute`].
    pub fn push_attribute(&self, t: Timestamp, quark: Quark, value: StateValue) -> Result<()> {
        self.check_quark(quark)?;
        let depth = match self.transient.ongoing_value(quark)? {
            StateValue::Null => 0,
            StateValue::Int(d) => d,
            other => {
                return Err(StateError::ValueType {
                    quark,
                    got: other.type_name(),
                    expected: "int",
                })
            }
        };
        // Bounded so buggy providers cannot grow the attribute tree without
        // limit.
        if depth >= MAX_STACK_DEPTH {
            return Err(StateError::StackDepth(quark));
        }
        let depth = depth + 1;
        let path = self.attribute_path(quark)?;
        let sub = self.get_quark_and_create(&format!("{}/{}", path, depth));
        self.modify_attribute(t, quark, StateValue::Int(depth))?;
        self.modify_attribute(t, sub, value)
    }

    /// Pops the top value off the stack attribute `quark` at time `t`.
    ///
    /// Returns `None` on an empty stack; this is common at the start of a
    /// trace, when the matching push predates the first event. The
    /// sub-attribute that held the popped value is nulled out.
    pub fn pop_attribute(&self, t: Timestamp, quark: Quark) -> Result<Option<StateValue>> {
        self.check_quark(quark)?;
        let depth = match self.transient.ongoing_value(quark)? {
            StateValue::Null => return Ok(None),
            StateValue::Int(d) if d > 0 => d,
            StateValue::Int(_) => return Ok(None),
            other => {
                return Err(StateError::ValueType {
                    quark,
                    got: other.type_name(),
                    expected: "int",
                })
            }
        };
        let path = self.attribute_path(quark)?;
        let sub = self.get_quark(&format!("{}/{}", path, depth))?;
        let popped = self.transient.ongoing_value(sub)?;

        let next = if depth == 1 {
            StateValue::Null
        } else {
            StateValue::Int(depth - 1)
        };
        self.modify_attribute(t, quark, next)?;
        self.remove_attribute(t, sub)?;
        Ok(Some(popped))
    }

    /// Nulls out `quark` and all its descendants from time `t` on.
    ///
    /// The attributes themselves remain in the tree; quarks are never
    /// reassigned. Their recorded history before `t` is untouched.
    pub fn remove_attribute(&self, t: Timestamp, quark: Quark) -> Result<()> {
        self.check_quark(quark)?;
        for child in self.sub_attributes(quark, false)? {
            self.remove_attribute(t, child)?;
        }
        self.modify_attribute(t, quark, StateValue::Null)
    }

    /// Closes the history at `end`: like a final state change at that time,
    /// every open value becomes an interval ending at `end - 1` (never
    /// before the latest recorded change), the backend is sealed, and all
    /// waiters are released. Idempotent; later mutations fail with `Closed`.
    pub fn close_history(&self, end: Timestamp) -> Result<()> {
        let real_end = end
            .saturating_sub(1)
            .max(self.transient.latest_time())
            .max(self.backend.end_time());
        self.transient.close(&*self.backend, real_end)?;
        self.backend.finished_building(real_end)?;

        let mut progress = self.progress.lock().unwrap();
        progress.finished = true;
        self.built.notify_all();
        debug!(end = real_end, "history closed");
        Ok(())
    }

    /// Blocks until the history finishes building.
    pub fn wait_until_built(&self) {
        let mut progress = self.progress.lock().unwrap();
        while !progress.finished {
            progress = self.built.wait(progress).unwrap();
        }
    }

    /// Blocks until the history finishes building or `timeout` elapses.
    /// Returns true if the history is built.
    pub fn wait_until_built_timeout(&self, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut progress = self.progress.lock().unwrap();
        while !progress.finished {
            let Some(remaining) = deadline.checked_duration_since(std::time::Instant::now())
            else {
                return false;
            };
            let (guard, _) = self.built.wait_timeout(progress, remaining).unwrap();
            progress = guard;
        }
        true
    }

    // ------------------------------------------------------------------
    // Consumer API
    // ------------------------------------------------------------------

    /// Returns the interval covering `t` for `quark`.
    ///
    /// The result always covers `t`: attributes with no recorded interval
    /// there get a synthesized null interval, so callers never have to
    /// handle absence.
    ///
    /// # Errors
    ///
    /// - `StateError::InvalidQuark` for an unknown quark.
    /// - `StateError::TimeRange` if `t` is outside the covered range (in
    ///   blocking mode, after waiting for the history to catch up).
    pub fn query_single_state(&self, t: Timestamp, quark: Quark) -> Result<StateInterval> {
        self.check_quark(quark)?;
        self.check_query_time(t)?;

        if self.transient.is_active() {
            if let Some(open) = self.transient.interval_at(quark, t)? {
                return Ok(open);
            }
        }
        if t <= self.backend.end_time() {
            if let Some(closed) = self.backend.query_single(t, quark)? {
                return Ok(closed);
            }
        }
        // Nothing recorded at t for this attribute (it was created later):
        // report an explicit null instead of an absence.
        Ok(StateInterval::new(
            t,
            self.current_end_time().max(t),
            quark,
            StateValue::Null,
        ))
    }

    /// Returns the state of every attribute at `t`, indexed by quark.
    ///
    /// Slots with no recorded interval hold a synthesized null interval.
    pub fn query_full_state(&self, t: Timestamp) -> Result<Vec<StateInterval>> {
        self.check_query_time(t)?;

        let count = self.attribute_count();
        let mut slots: Vec<Option<StateInterval>> = vec![None; count];
        // Snapshot the open values before touching the backend: a state
        // change landing between the two reads moves an interval from the
        // transient side into the backend, and reading the backend first
        // would miss it on both sides.
        if self.transient.is_active() {
            self.transient.write_info(&mut slots, t);
        }
        if t >= self.backend.start_time() && t <= self.backend.end_time() {
            let mut closed: Vec<Option<StateInterval>> = vec![None; count];
            self.backend.query_full(&mut closed, t)?;
            for (slot, interval) in slots.iter_mut().zip(closed) {
                if slot.is_none() {
                    *slot = interval;
                }
            }
        }

        Ok(slots
            .into_iter()
            .enumerate()
            .map(|(quark, slot)| {
                slot.unwrap_or_else(|| StateInterval::new(t, t, quark, StateValue::Null))
            })
            .collect())
    }

    /// Returns an iterator over the intervals of `quark` intersecting
    /// `[t1, t2]`, in time order. Each step is an independent point query,
    /// so the iterator stays valid while the history keeps building.
    pub fn query_history_range(
        &self,
        quark: Quark,
        t1: Timestamp,
        t2: Timestamp,
    ) -> Result<HistoryRange<'_>> {
        self.check_quark(quark)?;
        if t2 < t1 {
            return Err(StateError::TimeRange {
                ts: t2,
                start: t1,
                end: i64::MAX,
            });
        }
        self.check_query_time(t1)?;
        Ok(HistoryRange {
            system: self,
            quark,
            next: t1,
            end: t2.min(self.current_end_time()),
            done: false,
        })
    }

    fn check_quark(&self, quark: Quark) -> Result<()> {
        if quark >= self.attribute_count() {
            return Err(StateError::InvalidQuark(quark));
        }
        Ok(())
    }

    /// Validates `t` against the covered range, waiting for the builder
    /// first in blocking mode.
    fn check_query_time(&self, t: Timestamp) -> Result<()> {
        let start = self.start_time();
        if t < start {
            return Err(StateError::TimeRange {
                ts: t,
                start,
                end: self.current_end_time(),
            });
        }
        if t > self.current_end_time() {
            match self.query_mode {
                QueryMode::BestEffort => {
                    if !self.transient.is_active() {
                        return Err(StateError::TimeRange {
                            ts: t,
                            start,
                            end: self.current_end_time(),
                        });
                    }
                    // Still building: the open values stand in for the
                    // not-yet-seen future.
                }
                QueryMode::Block => {
                    let mut progress = self.progress.lock().unwrap();
                    while !progress.finished && self.current_end_time() < t {
                        progress = self.built.wait(progress).unwrap();
                    }
                    if t > self.current_end_time() {
                        return Err(StateError::TimeRange {
                            ts: t,
                            start,
                            end: self.current_end_time(),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for StateSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateSystem")
            .field("attributes", &self.attribute_count())
            .field("start", &self.start_time())
            .field("end", &self.current_end_time())
            .field("building", &self.transient.is_active())
            .finish()
    }
}

/// Iterator over the stored intervals of one attribute within a time range.
///
/// Yields each interval once, stepping from one interval's end to the next
/// one's start. Errors from the underlying queries end the iteration.
#[derive(Debug)]
pub struct HistoryRange<'a> {
    system: &'a StateSystem,
    quark: Quark,
    next: Timestamp,
    end: Timestamp,
    done: bool,
}

impl Iterator for HistoryRange<'_> {
    type Item = Result<StateInterval>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.next > self.end {
            return None;
        }
        match self.system.query_single_state(self.next, self.quark) {
            Ok(interval) => {
                match interval.end.checked_add(1) {
                    Some(next) => self.next = next,
                    None => self.done = true,
                }
                Some(Ok(interval))
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
