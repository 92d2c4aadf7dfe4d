//! State values and state intervals.
//!
//! A [`StateValue`] is the payload an attribute carries over a span of time;
//! a [`StateInterval`] is the atomic storage record `(quark, start, end,
//! value)`. Both are immutable once constructed and serialize to the
//! little-endian binary layout used inside history tree node pages:
//!
//! ```text
//! Offset  Size    Field
//! ------  ----    -----
//! 0x00    8       start (i64 LE)
//! 0x08    8       end (i64 LE)
//! 0x10    4       quark (u32 LE)
//! 0x14    1       value type tag (u8)
//! 0x15    N       value payload (type-dependent)
//! ```
//!
//! Variable-length payloads (`Str`, `Bytes`) carry a `u32` length prefix, so
//! values larger than a node page survive intact.

use crate::error::{Result, StateError};
use std::cmp::Ordering;
use std::io::{Read, Write};

/// Timestamp in trace time units (typically nanoseconds).
pub type Timestamp = i64;

/// Dense integer identifier for an attribute path.
pub type Quark = usize;

/// Value type tag for `Null` payloads.
const TAG_NULL: u8 = 0;
/// Value type tag for 32-bit integer payloads.
const TAG_INT: u8 = 1;
/// Value type tag for 64-bit integer payloads.
const TAG_LONG: u8 = 2;
/// Value type tag for double payloads.
const TAG_DOUBLE: u8 = 3;
/// Value type tag for string payloads.
const TAG_STR: u8 = 4;
/// Value type tag for custom binary payloads.
const TAG_BYTES: u8 = 5;

/// The payload types a state interval may carry.
///
/// Values are immutable. `Double` equality and ordering use the bit pattern
/// (`f64::total_cmp`), so identical payloads always compare equal and the
/// transient state can coalesce repeated states.
#[derive(Debug, Clone)]
pub enum StateValue {
    /// The absence of a value. Every attribute starts out null.
    Null,
    /// 32-bit signed integer.
    Int(i32),
    /// 64-bit signed integer.
    Long(i64),
    /// 64-bit float.
    Double(f64),
    /// UTF-8 string.
    Str(String),
    /// Opaque binary payload.
    Bytes(Vec<u8>),
}

impl PartialEq for StateValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for StateValue {}

impl PartialOrd for StateValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for StateValue {
    fn cmp(&self, other: &Self) -> Ordering {
        use StateValue::*;
        match (self, other) {
            (Null, Null) => Ordering::Equal,
            (Int(a), Int(b)) => a.cmp(b),
            (Long(a), Long(b)) => a.cmp(b),
            (Double(a), Double(b)) => a.total_cmp(b),
            (Str(a), Str(b)) => a.cmp(b),
            (Bytes(a), Bytes(b)) => a.cmp(b),
            _ => self.type_tag().cmp(&other.type_tag()),
        }
    }
}

impl StateValue {
    /// Returns true if this is the null value.
    pub fn is_null(&self) -> bool {
        matches!(self, StateValue::Null)
    }

    /// Returns the on-disk type tag for this value.
    pub(crate) fn type_tag(&self) -> u8 {
        match self {
            StateValue::Null => TAG_NULL,
            StateValue::Int(_) => TAG_INT,
            StateValue::Long(_) => TAG_LONG,
            StateValue::Double(_) => TAG_DOUBLE,
            StateValue::Str(_) => TAG_STR,
            StateValue::Bytes(_) => TAG_BYTES,
        }
    }

    /// Returns a human-readable name for this value's type.
    pub fn type_name(&self) -> &'static str {
        match self {
            StateValue::Null => "null",
            StateValue::Int(_) => "int",
            StateValue::Long(_) => "long",
            StateValue::Double(_) => "double",
            StateValue::Str(_) => "string",
            StateValue::Bytes(_) => "bytes",
        }
    }

    /// Returns the serialized size of this value in bytes (tag included).
    pub fn serialized_size(&self) -> usize {
        1 + match self {
            StateValue::Null => 0,
            StateValue::Int(_) => 4,
            StateValue::Long(_) | StateValue::Double(_) => 8,
            StateValue::Str(s) => 4 + s.len(),
            StateValue::Bytes(b) => 4 + b.len(),
        }
    }

    /// Writes the value to a writer using little-endian byte order.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&[self.type_tag()])?;
        match self {
            StateValue::Null => {}
            StateValue::Int(v) => writer.write_all(&v.to_le_bytes())?,
            StateValue::Long(v) => writer.write_all(&v.to_le_bytes())?,
            StateValue::Double(v) => writer.write_all(&v.to_le_bytes())?,
            StateValue::Str(s) => {
                let bytes = s.as_bytes();
                writer.write_all(&(bytes.len() as u32).to_le_bytes())?;
                writer.write_all(bytes)?;
            }
            StateValue::Bytes(b) => {
                writer.write_all(&(b.len() as u32).to_le_bytes())?;
                writer.write_all(b)?;
            }
        }
        Ok(())
    }

    /// Reads a value from a reader.
    ///
    /// # Errors
    ///
    /// Returns `StateError::Corrupt` if the type tag is unknown or a string
    /// payload is not valid UTF-8.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut tag = [0u8; 1];
        reader.read_exact(&mut tag)?;
        match tag[0] {
            TAG_NULL => Ok(StateValue::Null),
            TAG_INT => {
                let mut buf = [0u8; 4];
                reader.read_exact(&mut buf)?;
                Ok(StateValue::Int(i32::from_le_bytes(buf)))
            }
            TAG_LONG => {
                let mut buf = [0u8; 8];
                reader.read_exact(&mut buf)?;
                Ok(StateValue::Long(i64::from_le_bytes(buf)))
            }
            TAG_DOUBLE => {
                let mut buf = [0u8; 8];
                reader.read_exact(&mut buf)?;
                Ok(StateValue::Double(f64::from_le_bytes(buf)))
            }
            TAG_STR => {
                let bytes = read_len_prefixed(reader)?;
                let s = String::from_utf8(bytes)
                    .map_err(|e| StateError::Corrupt(format!("invalid UTF-8 in value: {}", e)))?;
                Ok(StateValue::Str(s))
            }
            TAG_BYTES => Ok(StateValue::Bytes(read_len_prefixed(reader)?)),
            t => Err(StateError::Corrupt(format!("unknown value type tag {}", t))),
        }
    }
}

fn read_len_prefixed<R: Read>(reader: &mut R) -> Result<Vec<u8>> {
    let mut buf4 = [0u8; 4];
    reader.read_exact(&mut buf4)?;
    let len = u32::from_le_bytes(buf4) as usize;
    let mut bytes = vec![0u8; len];
    reader.read_exact(&mut bytes)?;
    Ok(bytes)
}

/// A closed time range over which one attribute held one value.
///
/// Invariant: `start <= end`. For a fixed quark, the intervals stored in a
/// state system are temporally contiguous and non-overlapping.
#[derive(Debug, Clone, PartialEq)]
pub struct StateInterval {
    /// Start of the interval (inclusive).
    pub start: Timestamp,
    /// End of the interval (inclusive).
    pub end: Timestamp,
    /// The attribute this interval belongs to.
    pub quark: Quark,
    /// The value in effect over `[start, end]`.
    pub value: StateValue,
}

impl StateInterval {
    /// Creates a new interval. Panics in debug builds if `start > end`.
    pub fn new(start: Timestamp, end: Timestamp, quark: Quark, value: StateValue) -> Self {
        debug_assert!(start <= end, "interval start {} > end {}", start, end);
        Self {
            start,
            end,
            quark,
            value,
        }
    }

    /// Returns true if `t` falls inside `[start, end]`.
    pub fn intersects(&self, t: Timestamp) -> bool {
        self.start <= t && t <= self.end
    }

    /// Returns the serialized size of this interval in bytes.
    pub fn serialized_size(&self) -> usize {
        8 + 8 + 4 + self.value.serialized_size()
    }

    /// Writes the interval to a writer using little-endian byte order.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.start.to_le_bytes())?;
        writer.write_all(&self.end.to_le_bytes())?;
        writer.write_all(&(self.quark as u32).to_le_bytes())?;
        self.value.write_to(writer)
    }

    /// Reads an interval from a reader.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut buf8 = [0u8; 8];
        reader.read_exact(&mut buf8)?;
        let start = i64::from_le_bytes(buf8);
        reader.read_exact(&mut buf8)?;
        let end = i64::from_le_bytes(buf8);
        let mut buf4 = [0u8; 4];
        reader.read_exact(&mut buf4)?;
        let quark = u32::from_le_bytes(buf4) as Quark;
        let value = StateValue::read_from(reader)?;
        if start > end {
            return Err(StateError::Corrupt(format!(
                "interval start {} > end {}",
                start, end
            )));
        }
        Ok(Self {
            start,
            end,
            quark,
            value,
        })
    }
}
