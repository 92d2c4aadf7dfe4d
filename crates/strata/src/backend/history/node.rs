//! History tree node pages.
//!
//! A node is a fixed-byte-budget page holding a header and an ordered list
//! of intervals; internal nodes (level > 0) additionally hold an ordered
//! list of `(child sequence number, child minimum start time)` pairs. Nodes
//! are referenced by sequence number only, never by memory address.
//!
//! Each node is a one-way `Open → Sealed` state machine: once the byte
//! budget is exhausted (or the history closes) the node is sealed, written
//! out whole, and never modified again.
//!
//! ## Page Layout
//!
//! ```text
//! Offset  Size    Field
//! ------  ----    -----
//! 0x00    1       level (u8, 0 = leaf)
//! 0x01    1       sealed flag (u8)
//! 0x02    4       sequence number (u32 LE)
//! 0x06    4       parent sequence number (i32 LE, -1 = root)
//! 0x0A    8       node start time (i64 LE)
//! 0x12    8       node end time (i64 LE, valid when sealed)
//! 0x1A    4       interval count (u32 LE)
//! 0x1E    4       payload bytes used (u32 LE)
//! 0x22    4       page CRC32 (u32 LE, computed with this field zeroed)
//! -- internal nodes only --
//! 0x26    4       child count (u32 LE)
//! 0x2A    12*M    M = max_children slots of (child seq u32, child start i64)
//! -- all nodes --
//! ...     N       serialized intervals (sorted by end time once sealed)
//! ...     pad     zeros to the end of the page
//! ```
//!
//! A page normally occupies exactly `block_size` bytes. An oversized node
//! (one holding a single interval bigger than the byte budget) spans
//! `ceil(size / block_size)` consecutive sequence slots.

use crate::error::{Result, StateError};
use crate::interval::{Quark, StateInterval, Timestamp};
use std::io::Cursor;

/// Size of the header fields common to all node types.
pub const COMMON_HEADER_SIZE: usize = 38;

/// Byte offset of the CRC32 field within the page.
const CRC_OFFSET: usize = 0x22;

/// Parent sequence number of the root node.
pub const NO_PARENT: i32 = -1;

/// A page of the history tree.
#[derive(Debug, Clone)]
pub struct HtNode {
    /// Tree level; 0 for leaves, increasing toward the root.
    level: u8,
    /// Sequence number: position in the node section of the file.
    seq: u32,
    parent_seq: i32,
    start: Timestamp,
    /// Only meaningful once sealed.
    end: Timestamp,
    sealed: bool,
    intervals: Vec<StateInterval>,
    /// Sum of the serialized sizes of `intervals`.
    payload_bytes: usize,
    /// `(child seq, child minimum start time)`, ordered by start time.
    children: Vec<(u32, Timestamp)>,
    block_size: usize,
    max_children: usize,
}

impl HtNode {
    /// Creates a new open node.
    pub fn new(
        level: u8,
        seq: u32,
        parent_seq: i32,
        start: Timestamp,
        block_size: usize,
        max_children: usize,
    ) -> Self {
        Self {
            level,
            seq,
            parent_seq,
            start,
            end: start,
            sealed: false,
            intervals: Vec::new(),
            payload_bytes: 0,
            children: Vec::new(),
            block_size,
            max_children,
        }
    }

    /// This node's level (0 = leaf).
    pub fn level(&self) -> u8 {
        self.level
    }

    /// This node's sequence number.
    pub fn seq(&self) -> u32 {
        self.seq
    }

    /// The parent's sequence number, or [`NO_PARENT`] for the root.
    pub fn parent_seq(&self) -> i32 {
        self.parent_seq
    }

    /// Reparents this node (used when a new root is grown).
    pub fn set_parent_seq(&mut self, parent: i32) {
        self.parent_seq = parent;
    }

    /// Moves this node to a different sequence slot. Used when a sealed node
    /// turns out oversized and needs consecutive slots at the end of the
    /// file; the caller updates the parent's child link to match.
    pub fn relocate(&mut self, new_seq: u32) {
        self.seq = new_seq;
    }

    /// Rewrites the child link for `old_seq` to point at `new_seq`.
    pub fn relink_child(&mut self, old_seq: u32, new_seq: u32) {
        for child in &mut self.children {
            if child.0 == old_seq {
                child.0 = new_seq;
                return;
            }
        }
    }

    /// Start of the time range covered by this node.
    pub fn start(&self) -> Timestamp {
        self.start
    }

    /// End of the time range covered; meaningful once sealed.
    pub fn end(&self) -> Timestamp {
        self.end
    }

    /// Returns true once this node has been sealed.
    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Number of intervals held by this node.
    pub fn interval_count(&self) -> usize {
        self.intervals.len()
    }

    /// Number of linked children.
    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    /// Returns true if another child link fits.
    pub fn has_child_capacity(&self) -> bool {
        self.children.len() < self.max_children
    }

    /// The `(seq, min start)` pair of child `i`.
    pub fn child(&self, i: usize) -> (u32, Timestamp) {
        self.children[i]
    }

    /// The sequence number of the most recently linked child.
    pub fn latest_child(&self) -> Option<u32> {
        self.children.last().map(|&(seq, _)| seq)
    }

    /// Links a new child covering times from `start` on.
    pub fn link_child(&mut self, seq: u32, start: Timestamp) {
        debug_assert!(self.level > 0, "leaf nodes cannot have children");
        debug_assert!(self.has_child_capacity());
        self.children.push((seq, start));
    }

    /// Selects the child to descend into for a query at `t`: the last child
    /// whose covered start time is <= `t`.
    pub fn select_child(&self, t: Timestamp) -> Option<u32> {
        self.children
            .iter()
            .take_while(|&&(_, start)| start <= t)
            .last()
            .map(|&(seq, _)| seq)
    }

    /// Size in bytes of this node's header, child slots included.
    pub fn header_size(&self) -> usize {
        header_size(self.level, self.max_children)
    }

    /// Remaining byte budget. Negative for oversized nodes.
    pub fn free_space(&self) -> i64 {
        self.block_size as i64 - self.header_size() as i64 - self.payload_bytes as i64
    }

    /// Returns true if an interval of `size` bytes fits the budget.
    pub fn fits(&self, size: usize) -> bool {
        size as i64 <= self.free_space()
    }

    /// Appends an interval. The caller has checked [`HtNode::fits`], except
    /// when deliberately building an oversized node.
    pub fn add_interval(&mut self, interval: StateInterval) {
        debug_assert!(!self.sealed);
        self.payload_bytes += interval.serialized_size();
        self.intervals.push(interval);
    }

    /// Seals this node at `end`: sorts the intervals by end time (which
    /// speeds up in-node lookups) and freezes the page. One-way transition.
    pub fn seal(&mut self, end: Timestamp) {
        debug_assert!(!self.sealed);
        debug_assert!(end >= self.start);
        self.intervals.sort_by_key(|iv| (iv.end, iv.start));
        self.end = end;
        self.sealed = true;
    }

    /// Index of the first interval whose end time is >= `t`. Everything
    /// before it ended too early to intersect `t`.
    fn search_floor(&self, t: Timestamp) -> usize {
        if self.sealed {
            self.intervals.partition_point(|iv| iv.end < t)
        } else {
            0
        }
    }

    /// Returns the interval covering `t` for `quark` in this node, if any.
    pub fn find_at(&self, quark: Quark, t: Timestamp) -> Option<&StateInterval> {
        self.intervals[self.search_floor(t)..]
            .iter()
            .find(|iv| iv.quark == quark && iv.intersects(t))
    }

    /// Fills `slots` with every interval in this node intersecting `t`.
    pub fn write_info(&self, slots: &mut [Option<StateInterval>], t: Timestamp) {
        for iv in &self.intervals[self.search_floor(t)..] {
            if iv.intersects(t) && iv.quark < slots.len() {
                slots[iv.quark] = Some(iv.clone());
            }
        }
    }

    /// Intervals of this node intersecting `[range_start, range_end]` for
    /// `quark`, appended to `out`.
    pub fn collect_range(
        &self,
        quark: Quark,
        range_start: Timestamp,
        range_end: Timestamp,
        out: &mut Vec<StateInterval>,
    ) {
        for iv in &self.intervals[self.search_floor(range_start)..] {
            if iv.quark == quark && iv.start <= range_end && iv.end >= range_start {
                out.push(iv.clone());
            }
        }
    }

    /// Number of `block_size` pages this node occupies on disk.
    pub fn page_count(&self) -> usize {
        let total = self.header_size() + self.payload_bytes;
        total.div_ceil(self.block_size).max(1)
    }

    /// Serializes this node into whole pages (zero-padded, CRC stamped).
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.page_count() * self.block_size];
        buf[0x00] = self.level;
        buf[0x01] = self.sealed as u8;
        buf[0x02..0x06].copy_from_slice(&self.seq.to_le_bytes());
        buf[0x06..0x0A].copy_from_slice(&self.parent_seq.to_le_bytes());
        buf[0x0A..0x12].copy_from_slice(&self.start.to_le_bytes());
        buf[0x12..0x1A].copy_from_slice(&self.end.to_le_bytes());
        buf[0x1A..0x1E].copy_from_slice(&(self.intervals.len() as u32).to_le_bytes());
        buf[0x1E..CRC_OFFSET].copy_from_slice(&(self.payload_bytes as u32).to_le_bytes());
        // CRC slot stays zero until the end.

        let mut pos = COMMON_HEADER_SIZE;
        if self.level > 0 {
            buf[pos..pos + 4].copy_from_slice(&(self.children.len() as u32).to_le_bytes());
            pos += 4;
            for i in 0..self.max_children {
                if let Some(&(seq, start)) = self.children.get(i) {
                    buf[pos..pos + 4].copy_from_slice(&seq.to_le_bytes());
                    buf[pos + 4..pos + 12].copy_from_slice(&start.to_le_bytes());
                }
                pos += 12;
            }
        }

        let mut cursor = Cursor::new(&mut buf[pos..]);
        for interval in &self.intervals {
            interval.write_to(&mut cursor)?;
        }

        let crc = crc32fast::hash(&buf);
        buf[CRC_OFFSET..CRC_OFFSET + 4].copy_from_slice(&crc.to_le_bytes());
        Ok(buf)
    }

    /// Decodes a node from its on-disk pages, verifying the CRC.
    ///
    /// `bytes` must hold the node's full extent (whole pages).
    pub fn decode(
        bytes: &[u8],
        block_size: usize,
        max_children: usize,
        expected_seq: u32,
    ) -> Result<Self> {
        if bytes.len() < COMMON_HEADER_SIZE {
            return Err(StateError::Corrupt("truncated node page".to_string()));
        }

        let stored_crc = u32::from_le_bytes(bytes[CRC_OFFSET..CRC_OFFSET + 4].try_into().unwrap());
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&bytes[..CRC_OFFSET]);
        hasher.update(&[0u8; 4]);
        hasher.update(&bytes[CRC_OFFSET + 4..]);
        let actual_crc = hasher.finalize();
        if stored_crc != actual_crc {
            return Err(StateError::ChecksumMismatch {
                seq: expected_seq,
                expected: stored_crc,
                actual: actual_crc,
            });
        }

        let level = bytes[0x00];
        let sealed = bytes[0x01] == 1;
        let seq = u32::from_le_bytes(bytes[0x02..0x06].try_into().unwrap());
        let parent_seq = i32::from_le_bytes(bytes[0x06..0x0A].try_into().unwrap());
        let start = i64::from_le_bytes(bytes[0x0A..0x12].try_into().unwrap());
        let end = i64::from_le_bytes(bytes[0x12..0x1A].try_into().unwrap());
        let interval_count = u32::from_le_bytes(bytes[0x1A..0x1E].try_into().unwrap()) as usize;
        let payload_bytes = u32::from_le_bytes(bytes[0x1E..CRC_OFFSET].try_into().unwrap()) as usize;

        if seq != expected_seq {
            return Err(StateError::Corrupt(format!(
                "node at slot {} claims sequence number {}",
                expected_seq, seq
            )));
        }

        let mut pos = COMMON_HEADER_SIZE;
        let mut children = Vec::new();
        if level > 0 {
            let child_count =
                u32::from_le_bytes(bytes[pos..pos + 4].try_into().unwrap()) as usize;
            pos += 4;
            if child_count > max_children {
                return Err(StateError::Corrupt(format!(
                    "node {} claims {} children, max is {}",
                    seq, child_count, max_children
                )));
            }
            for i in 0..child_count {
                let base = pos + i * 12;
                let child_seq = u32::from_le_bytes(bytes[base..base + 4].try_into().unwrap());
                let child_start =
                    i64::from_le_bytes(bytes[base + 4..base + 12].try_into().unwrap());
                children.push((child_seq, child_start));
            }
            pos += max_children * 12;
        }

        let mut cursor = Cursor::new(&bytes[pos..]);
        let mut intervals = Vec::with_capacity(interval_count);
        for _ in 0..interval_count {
            intervals.push(StateInterval::read_from(&mut cursor)?);
        }

        Ok(Self {
            level,
            seq,
            parent_seq,
            start,
            end,
            sealed,
            intervals,
            payload_bytes,
            children,
            block_size,
            max_children,
        })
    }
}

/// Header size for a node of the given level.
pub fn header_size(level: u8, max_children: usize) -> usize {
    if level > 0 {
        COMMON_HEADER_SIZE + 4 + max_children * 12
    } else {
        COMMON_HEADER_SIZE
    }
}

/// Usable payload capacity of a fresh node at the given level.
pub fn node_capacity(level: u8, block_size: usize, max_children: usize) -> usize {
    block_size.saturating_sub(header_size(level, max_children))
}
