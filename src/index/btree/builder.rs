//! Streaming bulk loader.
//!
//! Accepts strictly increasing (key, offset) pairs, packs leaves to the
//! node size bound, and pushes a separator up one builder level each time
//! a node closes. `finish` closes the partial node at every level and
//! emits the root. The resulting tree is fully persisted, with no
//! redirects.

use std::sync::Arc;

use super::node;
use super::{Btree, LeafKeyFn, Redirs};
use crate::errinput;
use crate::error::Result;
use crate::index::ixkey::Spec;
use crate::stor::Stor;

pub struct BtreeBuilder {
    stor: Arc<Stor>,
    ispec: Spec,
    leaf_key: LeafKeyFn,
    max_node_size: usize,
    levels: Vec<Level>,
    prev: Vec<u8>,
    count: usize,
}

#[derive(Default)]
struct Level {
    entries: Vec<(Vec<u8>, u64)>,
    size: usize,
    /// Separator routing the next node closed at this level; empty for
    /// the first.
    lower: Vec<u8>,
}

impl BtreeBuilder {
    pub fn new(
        stor: Arc<Stor>,
        ispec: Spec,
        max_node_size: usize,
        leaf_key: LeafKeyFn,
    ) -> BtreeBuilder {
        BtreeBuilder {
            stor,
            ispec,
            leaf_key,
            max_node_size,
            levels: Vec::new(),
            prev: Vec::new(),
            count: 0,
        }
    }

    pub fn add(&mut self, key: &[u8], off: u64) -> Result<()> {
        if self.count > 0 && key <= self.prev.as_slice() {
            return Err(errinput!("btree builder keys must be strictly increasing"));
        }
        // a node must be able to hold at least two entries
        if 2 * (9 + key.len()) + 2 > self.max_node_size {
            return Err(errinput!("key of {} bytes exceeds the node size bound", key.len()));
        }
        self.prev = key.to_vec();
        self.count += 1;
        self.push(0, key.to_vec(), off);
        Ok(())
    }

    fn push(&mut self, level: usize, key: Vec<u8>, off: u64) {
        if self.levels.len() <= level {
            self.levels.push(Level::default());
        }
        let lv = &self.levels[level];
        let entry_size = match lv.entries.last() {
            Some((prev, _)) => 9 + key.len() - node::common_prefix(prev, &key),
            None => 2 + 9 + key.len(),
        };
        if !lv.entries.is_empty() && lv.size + entry_size > self.max_node_size {
            self.close(level, Some(&key));
        }
        let lv = &mut self.levels[level];
        let entry_size = match lv.entries.last() {
            Some((prev, _)) => 9 + key.len() - node::common_prefix(prev, &key),
            None => 2 + 9 + key.len(),
        };
        lv.size += entry_size;
        lv.entries.push((key, off));
    }

    /// Closes the node being assembled at `level` and pushes its routing
    /// entry up. `next_key` is the first key of the node that will follow
    /// at this level, used to choose the separator.
    fn close(&mut self, level: usize, next_key: Option<&[u8]>) {
        let lv = &mut self.levels[level];
        let mut ents = std::mem::take(&mut lv.entries);
        lv.size = 0;
        let last_key = ents[ents.len() - 1].0.clone();
        if level > 0 {
            // the first interior entry routes everything below the second
            ents[0].0 = Vec::new();
        }
        let off = Btree::write_node_chunk(&self.stor, &node::build(&ents));
        let lower = std::mem::take(&mut self.levels[level].lower);
        if let Some(next) = next_key {
            self.levels[level].lower = if level == 0 {
                node::separator(&last_key, next)
            } else {
                // interior keys are separators already
                next.to_vec()
            };
        }
        self.push(level + 1, lower, off);
    }

    /// Closes every partial level and returns the finished tree.
    pub fn finish(mut self) -> Result<Btree> {
        if self.levels.is_empty() {
            // an empty tree is a single empty leaf
            let root = Btree::write_node_chunk(&self.stor, &node::empty());
            return Ok(self.assemble(root, 0));
        }
        let mut level = 0;
        loop {
            let top = self.levels.len() == level + 1;
            if top {
                let lv = &mut self.levels[level];
                if level > 0 && lv.entries.len() == 1 {
                    // a lone child at the top is the root itself
                    let root = lv.entries[0].1;
                    return Ok(self.assemble(root, level - 1));
                }
                let mut ents = std::mem::take(&mut lv.entries);
                if level > 0 {
                    ents[0].0 = Vec::new();
                }
                let root = Btree::write_node_chunk(&self.stor, &node::build(&ents));
                return Ok(self.assemble(root, level));
            }
            if !self.levels[level].entries.is_empty() {
                self.close(level, None);
            }
            level += 1;
        }
    }

    fn assemble(self, root: u64, tree_levels: usize) -> Btree {
        Btree {
            root,
            tree_levels,
            stor: self.stor,
            redirs: Redirs::new(),
            redirs_off: 0,
            max_node_size: self.max_node_size,
            ispec: self.ispec,
            leaf_key: self.leaf_key,
            mutable: false,
        }
    }
}
