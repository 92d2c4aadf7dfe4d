//! Strata - Attribute State History Engine
//!
//! This crate models the evolving state of a system under observation as a
//! tree of attributes whose values change over time, and stores the
//! resulting intervals for fast point-in-time queries.
//!
//! # Components
//!
//! - [`StateSystem`]: the façade tying everything together
//! - [`AttributeTree`]: hierarchical attribute paths mapped to dense quarks
//! - [`StateBackend`]: interval storage trait, with [`InMemoryBackend`] and
//!   the disk-persisted [`HistoryTreeBackend`]
//!
//! # Example
//!
//! ```rust,ignore
//! use strata::{StateSystem, StateValue};
//!
//! // Build a history from observed state changes
//! let ss = StateSystem::in_memory(0);
//! let cpu = ss.get_quark_and_create("CPUs/0/Current_thread");
//! ss.modify_attribute(10, cpu, StateValue::Int(42))?;
//! ss.modify_attribute(20, cpu, StateValue::Int(7))?;
//! ss.close_history(30)?;
//!
//! // Ask what the state was at any past time
//! let interval = ss.query_single_state(15, cpu)?;
//! assert_eq!(interval.value, StateValue::Int(42));
//! ```

#![deny(missing_docs)]

pub mod attribute;
pub mod backend;
pub mod error;
pub mod interval;
pub mod system;
pub mod transient;

pub use attribute::{AttributeTree, ROOT_QUARK};
pub use backend::{
    HistoryTreeBackend, HistoryTreeConfig, InMemoryBackend, QueryMode, StateBackend,
};
pub use error::{Result, StateError};
pub use interval::{Quark, StateInterval, StateValue, Timestamp};
pub use system::{HistoryRange, StateSystem};
