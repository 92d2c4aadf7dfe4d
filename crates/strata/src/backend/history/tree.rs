//! The history tree proper: an append-only, disk-backed interval tree.
//!
//! The tree is built incrementally along its right edge, the *latest
//! branch*: the only open nodes at any moment are the root-to-leaf path
//! holding the most recent time range. Intervals go into the deepest branch
//! node whose start time they reach; when a node's byte budget runs out it
//! is sealed at the current tree end time and a fresh sibling (or a taller
//! root) takes over from the next timestamp.
//!
//! Sealed nodes are immutable and live on disk; queries descend a single
//! root-to-leaf path because sibling subtrees cover disjoint time ranges.
//! The latest branch is guarded by a reader-writer lock, so queries only
//! contend with the writer for the short branch walk and read sealed pages
//! through the node cache without any lock.

use crate::backend::history::io::{FileHeader, TreeIo};
use crate::backend::history::node::{HtNode, NO_PARENT};
use crate::error::{Result, StateError};
use crate::interval::{Quark, StateInterval, Timestamp};
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::RwLock;
use tracing::debug;

/// Construction parameters for a history tree.
#[derive(Debug, Clone, Copy)]
pub struct HistoryTreeConfig {
    /// Node page size in bytes.
    pub block_size: usize,
    /// Maximum number of children per internal node.
    pub max_children: usize,
    /// Number of decoded sealed nodes kept in memory.
    pub cache_size: usize,
}

impl Default for HistoryTreeConfig {
    fn default() -> Self {
        Self {
            block_size: 4096,
            max_children: 50,
            cache_size: 256,
        }
    }
}

/// Mutable tree structure, guarded by the tree's reader-writer lock.
#[derive(Debug)]
struct TreeState {
    /// Open nodes from root (index 0) to leaf. Empty in read-only mode.
    latest_branch: Vec<HtNode>,
    /// Next free page slot in the file.
    node_count: u32,
    /// Sequence number of the current root.
    root_seq: u32,
}

/// A history tree, either being built or opened read-only for queries.
#[derive(Debug)]
pub struct HistoryTree {
    io: TreeIo,
    config: HistoryTreeConfig,
    tree_start: Timestamp,
    /// Latest end time covered, mirrored out of the lock for cheap reads.
    end: AtomicI64,
    state: RwLock<TreeState>,
}

impl HistoryTree {
    /// Creates a new tree writing to `path`, covering times from `start`.
    pub fn create(path: &Path, config: HistoryTreeConfig, start: Timestamp) -> Result<Self> {
        let io = TreeIo::create(path, config.block_size, config.max_children, config.cache_size)?;
        let leaf = HtNode::new(0, 0, NO_PARENT, start, config.block_size, config.max_children);
        Ok(Self {
            io,
            config,
            tree_start: start,
            end: AtomicI64::new(start),
            state: RwLock::new(TreeState {
                latest_branch: vec![leaf],
                node_count: 1,
                root_seq: 0,
            }),
        })
    }

    /// Opens a finished tree read-only for queries.
    pub fn open(path: &Path, cache_size: usize) -> Result<Self> {
        let (io, header) = TreeIo::open(path, cache_size)?;
        let config = HistoryTreeConfig {
            block_size: header.block_size as usize,
            max_children: header.max_children as usize,
            cache_size,
        };
        Ok(Self {
            io,
            config,
            tree_start: header.tree_start,
            end: AtomicI64::new(header.tree_end),
            state: RwLock::new(TreeState {
                latest_branch: Vec::new(),
                node_count: header.node_count,
                root_seq: header.root_seq,
            }),
        })
    }

    /// Start of the covered time range.
    pub fn start_time(&self) -> Timestamp {
        self.tree_start
    }

    /// Latest end time covered so far.
    pub fn end_time(&self) -> Timestamp {
        self.end.load(Ordering::Acquire)
    }

    /// Number of page slots in use.
    pub fn node_count(&self) -> u32 {
        self.state.read().unwrap().node_count
    }

    /// Current tree depth (number of levels). Zero in read-only mode.
    pub fn depth(&self) -> usize {
        self.state.read().unwrap().latest_branch.len()
    }

    /// Inserts a closed interval.
    ///
    /// The interval goes into the deepest latest-branch node whose start
    /// time it reaches. Full nodes are sealed and replaced by siblings, the
    /// root growing taller when its own child slots run out.
    pub fn insert(&self, interval: StateInterval) -> Result<()> {
        let size = interval.serialized_size();
        let end = interval.end;

        let mut state = self.state.write().unwrap();
        if state.latest_branch.first().is_none_or(HtNode::is_sealed) {
            return Err(StateError::Closed);
        }
        let leaf = state.latest_branch.len() - 1;
        self.try_insert(&mut state, leaf, interval, size)?;
        drop(state);

        self.end.fetch_max(end, Ordering::AcqRel);
        Ok(())
    }

    fn try_insert(
        &self,
        state: &mut TreeState,
        index: usize,
        interval: StateInterval,
        size: usize,
    ) -> Result<()> {
        let node = &state.latest_branch[index];
        // Intervals starting before this node's range go into an ancestor.
        if interval.start < node.start() && index > 0 {
            return self.try_insert(state, index - 1, interval, size);
        }
        // An interval too big even for an empty page is stored alone in an
        // oversized node; the budget goes negative and the next insertion
        // forces a split, so nothing else shares its pages.
        if !node.fits(size) && node.interval_count() > 0 {
            let split_time = self.end.load(Ordering::Acquire);
            self.add_sibling(state, index, split_time)?;
            let leaf = state.latest_branch.len() - 1;
            return self.try_insert(state, leaf, interval, size);
        }
        state.latest_branch[index].add_interval(interval);
        Ok(())
    }

    /// Seals the branch at `index` (and everything below it) at
    /// `split_time`, then rebuilds those depths with fresh nodes starting at
    /// `split_time + 1`. Recurses upward when the parent has no child slot
    /// left; at the root, grows the tree instead.
    fn add_sibling(&self, state: &mut TreeState, index: usize, split_time: Timestamp) -> Result<()> {
        if index == 0 {
            return self.add_root(state, split_time);
        }
        if !state.latest_branch[index - 1].has_child_capacity() {
            return self.add_sibling(state, index - 1, split_time);
        }

        self.seal_branch_from(state, index, split_time)?;
        for d in index..state.latest_branch.len() {
            let level = state.latest_branch[d].level();
            let node = self.alloc_node(state, level, split_time + 1, d);
            state.latest_branch[d - 1].link_child(node.seq(), split_time + 1);
            state.latest_branch[d] = node;
        }
        Ok(())
    }

    /// Grows the tree by one level: the whole branch is sealed, the old root
    /// becomes the first child of a new root spanning from the tree start,
    /// and a fresh branch starting at `split_time + 1` hangs beside it.
    fn add_root(&self, state: &mut TreeState, split_time: Timestamp) -> Result<()> {
        let new_root_seq = state.node_count;
        state.node_count += 1;
        state.latest_branch[0].set_parent_seq(new_root_seq as i32);
        self.seal_branch_from(state, 0, split_time)?;

        let old_root = &state.latest_branch[0];
        let new_level = old_root.level() + 1;
        let mut new_root = HtNode::new(
            new_level,
            new_root_seq,
            NO_PARENT,
            self.tree_start,
            self.config.block_size,
            self.config.max_children,
        );
        new_root.link_child(old_root.seq(), self.tree_start);
        debug!(
            seq = new_root_seq,
            level = new_level,
            "growing history tree root"
        );

        let old_depth = state.latest_branch.len();
        let mut branch = vec![new_root];
        for d in 1..=old_depth {
            let level = new_level - d as u8;
            let seq = state.node_count;
            state.node_count += 1;
            let parent = branch[d - 1].seq();
            let node = HtNode::new(
                level,
                seq,
                parent as i32,
                split_time + 1,
                self.config.block_size,
                self.config.max_children,
            );
            branch[d - 1].link_child(seq, split_time + 1);
            branch.push(node);
        }
        state.latest_branch = branch;
        state.root_seq = new_root_seq;
        Ok(())
    }

    fn alloc_node(
        &self,
        state: &mut TreeState,
        level: u8,
        start: Timestamp,
        depth: usize,
    ) -> HtNode {
        let seq = state.node_count;
        state.node_count += 1;
        let parent = state.latest_branch[depth - 1].seq() as i32;
        HtNode::new(
            level,
            seq,
            parent,
            start,
            self.config.block_size,
            self.config.max_children,
        )
    }

    /// Seals and writes out the branch nodes at depth `from` and below,
    /// bottom-up. A node that grew past one page is relocated to fresh
    /// consecutive slots at the end of the file and its parent link (or the
    /// root pointer) is updated; its original slot stays an unreferenced
    /// hole.
    fn seal_branch_from(&self, state: &mut TreeState, from: usize, end: Timestamp) -> Result<()> {
        let TreeState {
            latest_branch,
            node_count,
            root_seq,
        } = state;
        for i in (from..latest_branch.len()).rev() {
            let (upper, lower) = latest_branch.split_at_mut(i);
            let node = &mut lower[0];
            node.seal(end.max(node.start()));

            let pages = node.page_count();
            if pages > 1 {
                let old_seq = node.seq();
                let new_seq = *node_count;
                *node_count += pages as u32;
                node.relocate(new_seq);
                match upper.last_mut() {
                    Some(parent) => parent.relink_child(old_seq, new_seq),
                    None => *root_seq = new_seq,
                }
                debug!(old_seq, new_seq, pages, "relocating oversized node");
            }
            self.io.write_node(node)?;
        }
        Ok(())
    }

    /// Seals every open node at `end` and writes the final file header.
    /// The tree remains queryable afterwards; further insertions fail.
    pub fn finish(&self, end: Timestamp) -> Result<()> {
        let mut state = self.state.write().unwrap();
        if state.latest_branch.first().is_none_or(HtNode::is_sealed) {
            return Ok(());
        }
        let end = end
            .max(self.end.load(Ordering::Acquire))
            .max(self.tree_start);
        self.seal_branch_from(&mut state, 0, end)?;
        self.end.store(end, Ordering::Release);

        self.io.write_header(&FileHeader {
            block_size: self.config.block_size as u32,
            max_children: self.config.max_children as u32,
            node_count: state.node_count,
            root_seq: state.root_seq,
            tree_start: self.tree_start,
            tree_end: end,
        })?;
        debug!(
            nodes = state.node_count,
            end, "history tree construction finished"
        );
        Ok(())
    }

    /// Returns the interval covering `t` for `quark`, if one is stored.
    ///
    /// The latest branch is walked under the read lock; once the descent
    /// leaves it for a sealed subtree the lock is dropped and the remaining
    /// nodes come from the cache.
    pub fn query_single(&self, t: Timestamp, quark: Quark) -> Result<Option<StateInterval>> {
        let mut seq = {
            let state = self.state.read().unwrap();
            match self.walk_branch(&state, t, &mut |node| {
                node.find_at(quark, t).cloned()
            }) {
                BranchWalk::Found(iv) => return Ok(Some(iv)),
                BranchWalk::Exhausted => return Ok(None),
                BranchWalk::Sealed(seq) => seq,
            }
        };
        loop {
            let node = self.io.read_node(seq)?;
            if let Some(iv) = node.find_at(quark, t) {
                return Ok(Some(iv.clone()));
            }
            if node.level() == 0 {
                return Ok(None);
            }
            match node.select_child(t) {
                Some(child) => seq = child,
                None => return Ok(None),
            }
        }
    }

    /// Fills `slots[q]` with the interval covering `t` for every quark that
    /// has one, descending the single root-to-leaf path containing `t`.
    pub fn query_full(&self, slots: &mut [Option<StateInterval>], t: Timestamp) -> Result<()> {
        let mut seq = {
            let state = self.state.read().unwrap();
            match self.walk_branch(&state, t, &mut |node| {
                node.write_info(slots, t);
                None::<()>
            }) {
                BranchWalk::Found(()) => unreachable!("visitor never yields"),
                BranchWalk::Exhausted => return Ok(()),
                BranchWalk::Sealed(seq) => seq,
            }
        };
        loop {
            let node = self.io.read_node(seq)?;
            node.write_info(slots, t);
            if node.level() == 0 {
                return Ok(());
            }
            match node.select_child(t) {
                Some(child) => seq = child,
                None => return Ok(()),
            }
        }
    }

    /// Walks the latest branch along the path containing `t`, applying
    /// `visit` to every node on the way. Returns what the caller should do
    /// next: a value found by the visitor, the sequence number of the sealed
    /// subtree to continue in, or nothing left to search.
    fn walk_branch<T>(
        &self,
        state: &TreeState,
        t: Timestamp,
        visit: &mut dyn FnMut(&HtNode) -> Option<T>,
    ) -> BranchWalk<T> {
        if state.latest_branch.is_empty() {
            // Read-only mode: the whole tree is sealed.
            return BranchWalk::Sealed(state.root_seq);
        }
        for i in 0..state.latest_branch.len() {
            let node = &state.latest_branch[i];
            if let Some(found) = visit(node) {
                return BranchWalk::Found(found);
            }
            if node.level() == 0 {
                return BranchWalk::Exhausted;
            }
            match node.select_child(t) {
                None => return BranchWalk::Exhausted,
                Some(child) => {
                    if child != state.latest_branch[i + 1].seq() {
                        return BranchWalk::Sealed(child);
                    }
                }
            }
        }
        BranchWalk::Exhausted
    }

    /// Returns the stored intervals for `quark` intersecting
    /// `[range_start, range_end]`, sorted by start time.
    ///
    /// Branch nodes are scanned under the read lock while the sealed
    /// subtrees intersecting the range are noted; those are then walked
    /// through the cache without the lock.
    pub fn query_range(
        &self,
        quark: Quark,
        range_start: Timestamp,
        range_end: Timestamp,
    ) -> Result<Vec<StateInterval>> {
        let mut out = Vec::new();
        let mut sealed_roots = Vec::new();
        {
            let state = self.state.read().unwrap();
            if state.latest_branch.is_empty() {
                sealed_roots.push(state.root_seq);
            }
            for (i, node) in state.latest_branch.iter().enumerate() {
                node.collect_range(quark, range_start, range_end, &mut out);
                if node.level() == 0 {
                    break;
                }
                let branch_child = state.latest_branch[i + 1].seq();
                for (seq, span_start, span_end) in child_spans(node, node.end().max(range_end)) {
                    if seq != branch_child && span_start <= range_end && span_end >= range_start {
                        sealed_roots.push(seq);
                    }
                }
            }
        }
        for seq in sealed_roots {
            self.collect_sealed(seq, quark, range_start, range_end, &mut out)?;
        }
        out.sort_by_key(|iv| iv.start);
        Ok(out)
    }

    /// Verifies the structural consistency of a finished tree: every child
    /// link resolves to a decodable page one level down whose start time
    /// matches the link, and sibling start times never decrease.
    pub fn check_integrity(&self) -> Result<()> {
        let root_seq = self.state.read().unwrap().root_seq;
        self.check_node(root_seq)
    }

    fn check_node(&self, seq: u32) -> Result<()> {
        let node = self.io.read_node(seq)?;
        if node.level() == 0 {
            return Ok(());
        }
        let mut prev_start = Timestamp::MIN;
        for i in 0..node.child_count() {
            let (child_seq, link_start) = node.child(i);
            if link_start < prev_start || link_start < node.start() {
                return Err(StateError::Corrupt(format!(
                    "node {}: child {} start {} out of order",
                    seq, child_seq, link_start
                )));
            }
            prev_start = link_start;

            let child = self.io.read_node(child_seq)?;
            if child.level() + 1 != node.level() {
                return Err(StateError::Corrupt(format!(
                    "node {}: child {} at level {}, expected {}",
                    seq,
                    child_seq,
                    child.level(),
                    node.level() - 1
                )));
            }
            if child.start() != link_start {
                return Err(StateError::Corrupt(format!(
                    "node {}: child {} starts at {}, link says {}",
                    seq,
                    child_seq,
                    child.start(),
                    link_start
                )));
            }
            self.check_node(child_seq)?;
        }
        Ok(())
    }

    fn collect_sealed(
        &self,
        seq: u32,
        quark: Quark,
        range_start: Timestamp,
        range_end: Timestamp,
        out: &mut Vec<StateInterval>,
    ) -> Result<()> {
        let node = self.io.read_node(seq)?;
        node.collect_range(quark, range_start, range_end, out);
        if node.level() > 0 {
            for (child, span_start, span_end) in child_spans(&node, node.end()) {
                if span_start <= range_end && span_end >= range_start {
                    self.collect_sealed(child, quark, range_start, range_end, out)?;
                }
            }
        }
        Ok(())
    }
}

/// Outcome of a latest-branch walk.
enum BranchWalk<T> {
    /// The visitor found what it was looking for.
    Found(T),
    /// The path containing `t` ends inside the branch.
    Exhausted,
    /// The path continues into the sealed node with this sequence number.
    Sealed(u32),
}

/// The `(seq, span start, span end)` of each child of an internal node.
/// A child's span runs to just before the next sibling's start; the last
/// child runs to `last_end`.
fn child_spans(node: &HtNode, last_end: Timestamp) -> Vec<(u32, Timestamp, Timestamp)> {
    let n = node.child_count();
    (0..n)
        .map(|i| {
            let (seq, start) = node.child(i);
            let end = if i + 1 < n {
                node.child(i + 1).1 - 1
            } else {
                last_end
            };
            (seq, start, end)
        })
        .collect()
}
