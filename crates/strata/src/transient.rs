//! The transient state: the open-ended present values of every attribute.
//!
//! For each quark the transient state holds the current value and the time
//! it took effect. A state change closes the previous value into an interval
//! ending just before the change and hands it to the backend; the new value
//! becomes the open one. Equal consecutive values coalesce into a single
//! growing interval, and a change at exactly the open value's start time
//! corrects it in place instead of emitting a zero-length interval.
//!
//! A single producer mutates this structure while queries read it, so the
//! three parallel per-quark vectors sit behind one reader-writer lock.

use crate::backend::StateBackend;
use crate::error::{Result, StateError};
use crate::interval::{Quark, StateInterval, StateValue, Timestamp};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::RwLock;
use tracing::debug;

#[derive(Debug)]
struct Inner {
    /// Current open value per quark.
    values: Vec<StateValue>,
    /// Time each open value took effect.
    start_times: Vec<Timestamp>,
    /// Value type fixed by the first non-null assignment, if any.
    types: Vec<Option<&'static str>>,
}

/// Open state values, indexed by quark.
#[derive(Debug)]
pub struct TransientState {
    /// False once the history has been closed.
    active: AtomicBool,
    /// Latest state-change time seen so far.
    latest: AtomicI64,
    inner: RwLock<Inner>,
}

impl TransientState {
    /// Creates an empty transient state whose history begins at `start`.
    pub fn new(start: Timestamp) -> Self {
        Self {
            active: AtomicBool::new(true),
            latest: AtomicI64::new(start),
            inner: RwLock::new(Inner {
                values: Vec::new(),
                start_times: Vec::new(),
                types: Vec::new(),
            }),
        }
    }

    /// Returns true until the history is closed.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Latest state-change time seen so far.
    pub fn latest_time(&self) -> Timestamp {
        self.latest.load(Ordering::Acquire)
    }

    /// Number of tracked quarks.
    pub fn len(&self) -> usize {
        self.inner.read().unwrap().values.len()
    }

    /// Returns true if no quarks are tracked yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registers a newly created quark with a null open value starting at
    /// the latest known time. Quarks are appended in creation order.
    pub fn add_empty_entry(&self) {
        let mut inner = self.inner.write().unwrap();
        inner.values.push(StateValue::Null);
        inner.start_times.push(self.latest.load(Ordering::Acquire));
        inner.types.push(None);
    }

    /// Applies a state change: closes the open value for `quark` into an
    /// interval ending at `t - 1`, pushes it to `backend`, and opens `value`
    /// at `t`.
    ///
    /// Setting the value it already has only extends the open interval.
    /// Setting a different value at exactly the open value's start time
    /// replaces it in place, with no interval emitted.
    ///
    /// # Errors
    ///
    /// - `StateError::Closed` if the history has been closed.
    /// - `StateError::InvalidQuark` if `quark` is unknown.
    /// - `StateError::TimeRange` if `t` is before the open value's start.
    /// - `StateError::ValueType` if a non-null `value` conflicts with the
    ///   type previously recorded for this attribute.
    pub fn process_state_change(
        &self,
        backend: &dyn StateBackend,
        t: Timestamp,
        quark: Quark,
        value: StateValue,
    ) -> Result<()> {
        if !self.is_active() {
            return Err(StateError::Closed);
        }
        let mut inner = self.inner.write().unwrap();
        if quark >= inner.values.len() {
            return Err(StateError::InvalidQuark(quark));
        }

        if value != StateValue::Null {
            match inner.types[quark] {
                Some(expected) if expected != value.type_name() => {
                    return Err(StateError::ValueType {
                        quark,
                        got: value.type_name(),
                        expected,
                    });
                }
                Some(_) => {}
                None => inner.types[quark] = Some(value.type_name()),
            }
        }

        let open_start = inner.start_times[quark];
        if t < open_start {
            return Err(StateError::TimeRange {
                ts: t,
                start: open_start,
                end: i64::MAX,
            });
        }

        if inner.values[quark] == value {
            // Same value again: the open interval simply keeps growing.
        } else if t == open_start {
            // Correction: a different value at the very start of the open
            // interval replaces it, nothing to close yet.
            inner.values[quark] = value;
        } else {
            let closed = StateInterval::new(
                open_start,
                t - 1,
                quark,
                std::mem::replace(&mut inner.values[quark], value),
            );
            backend.insert_past_state(closed)?;
            inner.start_times[quark] = t;
        }

        self.latest.fetch_max(t, Ordering::AcqRel);
        Ok(())
    }

    /// Replaces the open value for `quark` without emitting an interval or
    /// touching its start time.
    pub fn set_ongoing(&self, quark: Quark, value: StateValue) -> Result<()> {
        if !self.is_active() {
            return Err(StateError::Closed);
        }
        let mut inner = self.inner.write().unwrap();
        if quark >= inner.values.len() {
            return Err(StateError::InvalidQuark(quark));
        }
        if value != StateValue::Null {
            match inner.types[quark] {
                Some(expected) if expected != value.type_name() => {
                    return Err(StateError::ValueType {
                        quark,
                        got: value.type_name(),
                        expected,
                    });
                }
                Some(_) => {}
                None => inner.types[quark] = Some(value.type_name()),
            }
        }
        inner.values[quark] = value;
        Ok(())
    }

    /// The open value for `quark`.
    pub fn ongoing_value(&self, quark: Quark) -> Result<StateValue> {
        let inner = self.inner.read().unwrap();
        inner
            .values
            .get(quark)
            .cloned()
            .ok_or(StateError::InvalidQuark(quark))
    }

    /// The time the open value for `quark` took effect.
    pub fn ongoing_start(&self, quark: Quark) -> Result<Timestamp> {
        let inner = self.inner.read().unwrap();
        inner
            .start_times
            .get(quark)
            .copied()
            .ok_or(StateError::InvalidQuark(quark))
    }

    /// Returns the open interval for `quark` if it covers `t`, as an
    /// interval ending at the latest known time.
    pub fn interval_at(&self, quark: Quark, t: Timestamp) -> Result<Option<StateInterval>> {
        if !self.is_active() {
            return Ok(None);
        }
        let inner = self.inner.read().unwrap();
        if quark >= inner.values.len() {
            return Err(StateError::InvalidQuark(quark));
        }
        let start = inner.start_times[quark];
        if t < start {
            return Ok(None);
        }
        Ok(Some(StateInterval::new(
            start,
            self.latest.load(Ordering::Acquire).max(t),
            quark,
            inner.values[quark].clone(),
        )))
    }

    /// Fills `slots[q]` with the open interval of every quark whose open
    /// value covers `t`.
    pub fn write_info(&self, slots: &mut [Option<StateInterval>], t: Timestamp) {
        if !self.is_active() {
            return;
        }
        let inner = self.inner.read().unwrap();
        let latest = self.latest.load(Ordering::Acquire).max(t);
        for quark in 0..inner.values.len().min(slots.len()) {
            let start = inner.start_times[quark];
            if t >= start {
                slots[quark] = Some(StateInterval::new(
                    start,
                    latest,
                    quark,
                    inner.values[quark].clone(),
                ));
            }
        }
    }

    /// Marks this transient state inert without flushing anything. Used when
    /// attaching to an already finished backend.
    pub(crate) fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// Closes every open value into a final interval ending at `end` and
    /// pushes them all to `backend`. The transient state becomes inert.
    pub fn close(&self, backend: &dyn StateBackend, end: Timestamp) -> Result<()> {
        if !self.active.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let inner = self.inner.write().unwrap();
        for quark in 0..inner.values.len() {
            let start = inner.start_times[quark];
            backend.insert_past_state(StateInterval::new(
                start,
                end.max(start),
                quark,
                inner.values[quark].clone(),
            ))?;
        }
        debug!(quarks = inner.values.len(), end, "closed transient state");
        Ok(())
    }
}
