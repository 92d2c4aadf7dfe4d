//! The attribute tree: a bidirectional mapping between hierarchical attribute
//! paths (e.g. `CPUs/0/Current_thread`) and dense integer quarks.
//!
//! Quarks are assigned on first request for a path and are never reassigned
//! or removed; the tree only grows. Path matching is case-sensitive and
//! exact, one `/`-delimited segment at a time. The tree owns no time data.

use crate::error::{Result, StateError};
use crate::interval::Quark;
use std::collections::HashMap;

/// The quark of the (unnamed) root attribute.
pub const ROOT_QUARK: Quark = 0;

/// Path segment separator.
const SEPARATOR: char = '/';

#[derive(Debug)]
struct AttributeNode {
    /// This attribute's path segment (empty for the root).
    name: String,
    /// Parent quark; `None` only for the root.
    parent: Option<Quark>,
    /// Child quarks in insertion order.
    children: Vec<Quark>,
    /// Segment name to child quark, for lookups.
    index: HashMap<String, Quark>,
}

impl AttributeNode {
    fn new(name: String, parent: Option<Quark>) -> Self {
        Self {
            name,
            parent,
            children: Vec::new(),
            index: HashMap::new(),
        }
    }
}

/// Bidirectional path ⇄ quark mapping.
///
/// The quark→path mapping is bijective and append-only. Quark 0 is reserved
/// for the root.
#[derive(Debug)]
pub struct AttributeTree {
    nodes: Vec<AttributeNode>,
}

impl AttributeTree {
    /// Creates a tree containing only the root attribute (quark 0).
    pub fn new() -> Self {
        Self {
            nodes: vec![AttributeNode::new(String::new(), None)],
        }
    }

    /// Returns the total number of attributes, root included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if only the root attribute exists.
    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1
    }

    /// Looks up the quark for `path` without creating it.
    ///
    /// # Errors
    ///
    /// Returns `StateError::AttributeNotFound` if any segment of the path is
    /// unknown.
    pub fn quark(&self, path: &str) -> Result<Quark> {
        let mut current = ROOT_QUARK;
        for segment in segments(path) {
            current = *self.nodes[current]
                .index
                .get(segment)
                .ok_or_else(|| StateError::AttributeNotFound(path.to_string()))?;
        }
        Ok(current)
    }

    /// Returns the quark for `path`, creating any missing segments.
    ///
    /// Newly created attributes are appended after all existing quarks, so a
    /// caller can detect creations by comparing [`AttributeTree::len`] before
    /// and after.
    pub fn quark_and_create(&mut self, path: &str) -> Quark {
        let mut current = ROOT_QUARK;
        for segment in segments(path) {
            current = match self.nodes[current].index.get(segment) {
                Some(&q) => q,
                None => {
                    let q = self.nodes.len();
                    self.nodes
                        .push(AttributeNode::new(segment.to_string(), Some(current)));
                    self.nodes[current].children.push(q);
                    self.nodes[current].index.insert(segment.to_string(), q);
                    q
                }
            };
        }
        current
    }

    /// Reconstructs the full path for `quark`.
    ///
    /// # Errors
    ///
    /// Returns `StateError::InvalidQuark` if `quark` is out of range.
    pub fn path(&self, quark: Quark) -> Result<String> {
        self.check(quark)?;
        let mut parts = Vec::new();
        let mut current = quark;
        while let Some(parent) = self.nodes[current].parent {
            parts.push(self.nodes[current].name.as_str());
            current = parent;
        }
        parts.reverse();
        Ok(parts.join("/"))
    }

    /// Returns the path segment (leaf name) of `quark`.
    pub fn name(&self, quark: Quark) -> Result<&str> {
        self.check(quark)?;
        Ok(&self.nodes[quark].name)
    }

    /// Returns the parent quark of `quark`, or the root for the root itself.
    pub fn parent(&self, quark: Quark) -> Result<Quark> {
        self.check(quark)?;
        Ok(self.nodes[quark].parent.unwrap_or(ROOT_QUARK))
    }

    /// Returns the quarks of the attributes below `quark`, in insertion
    /// order. With `recursive`, descendants are listed depth-first.
    pub fn sub_attributes(&self, quark: Quark, recursive: bool) -> Result<Vec<Quark>> {
        self.check(quark)?;
        let mut out = Vec::new();
        self.collect_children(quark, recursive, &mut out);
        Ok(out)
    }

    fn collect_children(&self, quark: Quark, recursive: bool, out: &mut Vec<Quark>) {
        for &child in &self.nodes[quark].children {
            out.push(child);
            if recursive {
                self.collect_children(child, true, out);
            }
        }
    }

    fn check(&self, quark: Quark) -> Result<()> {
        if quark >= self.nodes.len() {
            return Err(StateError::InvalidQuark(quark));
        }
        Ok(())
    }
}

impl Default for AttributeTree {
    fn default() -> Self {
        Self::new()
    }
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split(SEPARATOR).filter(|s| !s.is_empty())
}
