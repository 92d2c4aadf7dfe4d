//! History file I/O: whole-page node reads/writes and the sealed-node cache.
//!
//! The file starts with a 4096-byte header block, followed by node pages;
//! the page for sequence number `s` begins at `FILE_HEADER_SIZE + s *
//! block_size`. Nodes are always written whole, never partially, so a crash
//! mid-write leaves previously sealed pages intact.
//!
//! ## File Header Layout
//!
//! ```text
//! Offset  Size    Field
//! ------  ----    -----
//! 0x00    4       Magic: "STRA"
//! 0x04    2       Format version (u16 LE) = 1
//! 0x06    2       Reserved
//! 0x08    4       Block size (u32 LE)
//! 0x0C    4       Max children per node (u32 LE)
//! 0x10    4       Node count (u32 LE)
//! 0x14    4       Root node sequence number (u32 LE)
//! 0x18    8       Tree start time (i64 LE)
//! 0x20    8       Tree end time (i64 LE)
//! ```

use crate::backend::history::node::HtNode;
use crate::error::{Result, StateError};
use crate::interval::Timestamp;
use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Magic bytes identifying a history file.
pub const FILE_MAGIC: [u8; 4] = *b"STRA";

/// Current history file format version.
pub const FILE_VERSION: u16 = 1;

/// Size of the file header block. Node pages start at this offset.
pub const FILE_HEADER_SIZE: usize = 4096;

/// Serialized size of the meaningful header fields.
const HEADER_FIELDS_SIZE: usize = 0x28;

/// The history file header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    /// Node page size in bytes.
    pub block_size: u32,
    /// Maximum number of children per internal node.
    pub max_children: u32,
    /// Total number of page slots in use.
    pub node_count: u32,
    /// Sequence number of the root node.
    pub root_seq: u32,
    /// Start of the covered time range.
    pub tree_start: Timestamp,
    /// End of the covered time range.
    pub tree_end: Timestamp,
}

impl FileHeader {
    /// Writes the header to a writer using little-endian byte order,
    /// zero-padded to [`FILE_HEADER_SIZE`].
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        let mut buf = [0u8; FILE_HEADER_SIZE];
        buf[0x00..0x04].copy_from_slice(&FILE_MAGIC);
        buf[0x04..0x06].copy_from_slice(&FILE_VERSION.to_le_bytes());
        buf[0x08..0x0C].copy_from_slice(&self.block_size.to_le_bytes());
        buf[0x0C..0x10].copy_from_slice(&self.max_children.to_le_bytes());
        buf[0x10..0x14].copy_from_slice(&self.node_count.to_le_bytes());
        buf[0x14..0x18].copy_from_slice(&self.root_seq.to_le_bytes());
        buf[0x18..0x20].copy_from_slice(&self.tree_start.to_le_bytes());
        buf[0x20..0x28].copy_from_slice(&self.tree_end.to_le_bytes());
        writer.write_all(&buf)?;
        Ok(())
    }

    /// Reads and validates a header.
    ///
    /// # Errors
    ///
    /// Returns `StateError::InvalidMagic` or `StateError::UnsupportedVersion`
    /// if the file is not a history file this version can read.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut buf = [0u8; HEADER_FIELDS_SIZE];
        reader.read_exact(&mut buf)?;

        let magic: [u8; 4] = buf[0x00..0x04].try_into().unwrap();
        if magic != FILE_MAGIC {
            return Err(StateError::InvalidMagic(magic));
        }
        let version = u16::from_le_bytes(buf[0x04..0x06].try_into().unwrap());
        if version != FILE_VERSION {
            return Err(StateError::UnsupportedVersion(version));
        }

        let header = Self {
            block_size: u32::from_le_bytes(buf[0x08..0x0C].try_into().unwrap()),
            max_children: u32::from_le_bytes(buf[0x0C..0x10].try_into().unwrap()),
            node_count: u32::from_le_bytes(buf[0x10..0x14].try_into().unwrap()),
            root_seq: u32::from_le_bytes(buf[0x14..0x18].try_into().unwrap()),
            tree_start: i64::from_le_bytes(buf[0x18..0x20].try_into().unwrap()),
            tree_end: i64::from_le_bytes(buf[0x20..0x28].try_into().unwrap()),
        };
        if header.block_size == 0 || header.max_children < 2 {
            return Err(StateError::Corrupt(format!(
                "implausible header: block_size={}, max_children={}",
                header.block_size, header.max_children
            )));
        }
        Ok(header)
    }
}

/// Most-recently-used cache of decoded sealed nodes.
///
/// Sealed nodes are immutable, so eviction needs no write-back. Duplicate
/// decodes on concurrent misses are harmless; the bookkeeping itself is
/// guarded by the owning [`TreeIo`]'s mutex.
#[derive(Debug)]
struct NodeCache {
    capacity: usize,
    nodes: HashMap<u32, Arc<HtNode>>,
    /// Sequence numbers from least to most recently used.
    order: VecDeque<u32>,
}

impl NodeCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            nodes: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&mut self, seq: u32) -> Option<Arc<HtNode>> {
        let node = self.nodes.get(&seq)?.clone();
        if let Some(pos) = self.order.iter().position(|&s| s == seq) {
            self.order.remove(pos);
        }
        self.order.push_back(seq);
        Some(node)
    }

    fn put(&mut self, seq: u32, node: Arc<HtNode>) {
        if self.nodes.contains_key(&seq) {
            return;
        }
        while self.nodes.len() >= self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.nodes.remove(&evicted);
                debug!(seq = evicted, "evicting node from cache");
            }
        }
        self.nodes.insert(seq, node);
        self.order.push_back(seq);
    }
}

/// Reader/writer for the history file.
///
/// All disk access goes through here: the writer pushes whole sealed pages,
/// readers fault sealed pages in through the node cache.
#[derive(Debug)]
pub struct TreeIo {
    path: PathBuf,
    file: Mutex<File>,
    block_size: usize,
    max_children: usize,
    cache: Mutex<NodeCache>,
}

impl TreeIo {
    /// Creates a new history file, truncating any existing one, and writes
    /// a placeholder header (rewritten with final values on close).
    pub fn create(
        path: &Path,
        block_size: usize,
        max_children: usize,
        cache_size: usize,
    ) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        FileHeader {
            block_size: block_size as u32,
            max_children: max_children as u32,
            node_count: 0,
            root_seq: 0,
            tree_start: 0,
            tree_end: 0,
        }
        .write_to(&mut file)?;

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            block_size,
            max_children,
            cache: Mutex::new(NodeCache::new(cache_size)),
        })
    }

    /// Opens an existing history file for querying and validates its header.
    pub fn open(path: &Path, cache_size: usize) -> Result<(Self, FileHeader)> {
        let mut file = OpenOptions::new().read(true).open(path)?;
        let header = FileHeader::read_from(&mut file)?;

        let io = Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            block_size: header.block_size as usize,
            max_children: header.max_children as usize,
            cache: Mutex::new(NodeCache::new(cache_size)),
        };
        Ok((io, header))
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn node_offset(&self, seq: u32) -> u64 {
        FILE_HEADER_SIZE as u64 + seq as u64 * self.block_size as u64
    }

    /// Writes a sealed node to its page slot, whole pages only.
    pub fn write_node(&self, node: &HtNode) -> Result<()> {
        let bytes = node.encode()?;
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(self.node_offset(node.seq())))?;
        file.write_all(&bytes)?;
        debug!(
            seq = node.seq(),
            level = node.level(),
            intervals = node.interval_count(),
            pages = node.page_count(),
            "wrote node"
        );
        Ok(())
    }

    /// Reads a sealed node, consulting the cache first.
    pub fn read_node(&self, seq: u32) -> Result<Arc<HtNode>> {
        if let Some(node) = self.cache.lock().unwrap().get(seq) {
            return Ok(node);
        }

        let bytes = self.read_node_bytes(seq)?;
        let node = match HtNode::decode(&bytes, self.block_size, self.max_children, seq) {
            Ok(node) => Arc::new(node),
            Err(e) => {
                warn!(seq, path = %self.path.display(), "failed to decode node: {}", e);
                return Err(e);
            }
        };
        self.cache.lock().unwrap().put(seq, node.clone());
        Ok(node)
    }

    fn read_node_bytes(&self, seq: u32) -> Result<Vec<u8>> {
        let mut file = self.file.lock().unwrap();
        let mut bytes = vec![0u8; self.block_size];
        file.seek(SeekFrom::Start(self.node_offset(seq)))?;
        file.read_exact(&mut bytes)?;

        // Oversized nodes span extra pages; the payload size field tells us
        // how many before the CRC can be checked over the full extent.
        let level = bytes[0x00];
        let payload =
            u32::from_le_bytes(bytes[0x1E..0x22].try_into().unwrap()) as usize;
        let total = crate::backend::history::node::header_size(level, self.max_children) + payload;
        let pages = total.div_ceil(self.block_size).max(1);
        if pages > 1 {
            let mut rest = vec![0u8; (pages - 1) * self.block_size];
            file.read_exact(&mut rest)?;
            bytes.extend_from_slice(&rest);
        }
        Ok(bytes)
    }

    /// Rewrites the file header with final values and syncs everything to
    /// disk.
    pub fn write_header(&self, header: &FileHeader) -> Result<()> {
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(0))?;
        header.write_to(&mut *file)?;
        file.flush()?;
        file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::history::node::NO_PARENT;
    use crate::interval::{StateInterval, StateValue};
    use tempfile::TempDir;

    const BLOCK: usize = 4096;
    const MAXC: usize = 8;

    #[test]
    fn node_write_read_through_cache() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.strata");
        let io = TreeIo::create(&path, BLOCK, MAXC, 4).unwrap();

        let mut node = HtNode::new(0, 0, NO_PARENT, 0, BLOCK, MAXC);
        node.add_interval(StateInterval::new(0, 50, 1, StateValue::Int(9)));
        node.seal(100);
        io.write_node(&node).unwrap();

        let read = io.read_node(0).unwrap();
        assert_eq!(read.find_at(1, 25).unwrap().value, StateValue::Int(9));
        // Second read is served from cache (same Arc).
        let again = io.read_node(0).unwrap();
        assert!(Arc::ptr_eq(&read, &again));
    }

    #[test]
    fn cache_eviction_keeps_reads_correct() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("evict.strata");
        let io = TreeIo::create(&path, BLOCK, MAXC, 2).unwrap();

        for seq in 0..5u32 {
            let mut node = HtNode::new(0, seq, NO_PARENT, seq as i64 * 100, BLOCK, MAXC);
            node.add_interval(StateInterval::new(
                seq as i64 * 100,
                seq as i64 * 100 + 50,
                0,
                StateValue::Int(seq as i32),
            ));
            node.seal(seq as i64 * 100 + 99);
            io.write_node(&node).unwrap();
        }

        // Touch all nodes twice; with capacity 2 most hits are misses, and
        // every read must still return the right page.
        for _ in 0..2 {
            for seq in 0..5u32 {
                let node = io.read_node(seq).unwrap();
                assert_eq!(node.seq(), seq);
                assert_eq!(
                    node.find_at(0, seq as i64 * 100).unwrap().value,
                    StateValue::Int(seq as i32)
                );
            }
        }
    }

    #[test]
    fn open_rejects_bad_magic() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bogus.strata");
        std::fs::write(&path, vec![0xAB; FILE_HEADER_SIZE]).unwrap();
        assert!(matches!(
            TreeIo::open(&path, 4),
            Err(StateError::InvalidMagic(_))
        ));
    }

    #[test]
    fn header_roundtrip() {
        let header = FileHeader {
            block_size: 4096,
            max_children: 50,
            node_count: 17,
            root_seq: 16,
            tree_start: -5,
            tree_end: 12345,
        };
        let mut buf = Vec::new();
        header.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), FILE_HEADER_SIZE);
        let back = FileHeader::read_from(&mut &buf[..]).unwrap();
        assert_eq!(back, header);
    }
}
