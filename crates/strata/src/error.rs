//! Error and Result types for state system operations.

use std::io;
use thiserror::Error;

/// A convenience `Result` type for state system operations.
pub type Result<T> = std::result::Result<T, StateError>;

/// The error type for state system operations.
///
/// The `InvalidMagic`, `UnsupportedVersion`, `ChecksumMismatch` and `Corrupt`
/// variants form the "corrupt backend" family: they are fatal for the affected
/// backend instance and no partial recovery is attempted.
#[derive(Debug, Error)]
pub enum StateError {
    /// The requested attribute path is not present in the attribute tree.
    #[error("Attribute not found: {0}")]
    AttributeNotFound(String),

    /// The given quark does not map to any known attribute.
    #[error("Invalid quark: {0}")]
    InvalidQuark(usize),

    /// A timestamp fell outside the valid time range, or an insertion
    /// violated the per-attribute ordering invariant.
    #[error("Timestamp {ts} outside valid range [{start}, {end}]")]
    TimeRange {
        /// The offending timestamp.
        ts: i64,
        /// Start of the valid range (inclusive).
        start: i64,
        /// End of the valid range (inclusive).
        end: i64,
    },

    /// Mutation was attempted after the history was closed.
    #[error("State system is closed, no further modifications accepted")]
    Closed,

    /// A state value's type did not match the type previously recorded for
    /// the attribute.
    #[error("Value type mismatch for quark {quark}: got {got}, expected {expected}")]
    ValueType {
        /// The attribute being modified.
        quark: usize,
        /// Type tag of the rejected value.
        got: &'static str,
        /// Type tag previously recorded for this attribute.
        expected: &'static str,
    },

    /// A stack attribute reached the maximum supported depth.
    #[error("Stack attribute {0} reached the depth limit, not pushing")]
    StackDepth(usize),

    /// Invalid magic bytes in the history file header.
    #[error("Invalid magic bytes: expected STRA, got {0:?}")]
    InvalidMagic([u8; 4]),

    /// Unsupported history file format version.
    #[error("Unsupported version: {0}")]
    UnsupportedVersion(u16),

    /// A node page's checksum does not match its contents.
    #[error("Checksum mismatch on node {seq}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Sequence number of the corrupt node.
        seq: u32,
        /// CRC32 recorded in the page header.
        expected: u32,
        /// CRC32 computed over the page contents.
        actual: u32,
    },

    /// The persisted tree is structurally inconsistent.
    #[error("Corrupt history file: {0}")]
    Corrupt(String),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
}
