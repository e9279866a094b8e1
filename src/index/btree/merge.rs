//! Folding staged edits into the base tree.
//!
//! A merge walks an inter-buffer's edits in key order and applies them
//! through the redirect layer: inserts and updates rebuild the covering
//! leaf, tombstones remove entries, and a leaf that empties is dropped
//! from its parent (cascading up; a tree that empties collapses to the
//! empty-leaf sentinel). An update for a key the base does not hold is
//! applied as an insert, matching the staging layers' view that the key
//! exists somewhere below.

use super::node;
use super::Btree;
use crate::errcorrupt;
use crate::error::Result;
use crate::index::interbuf::{DELETED, OFFSET_MASK, UPDATED};

impl Btree {
    /// Applies an inter-buffer's edit stream, returning the merged tree.
    /// The result holds its changes in the redirect layer until saved.
    pub fn merge(&self, edits: impl IntoIterator<Item = (Vec<u8>, u64)>) -> Result<Btree> {
        let mut nmerged = 0;
        let bt = self.update(|bt| {
            for (key, staged) in edits {
                let off = staged & OFFSET_MASK;
                if staged & DELETED != 0 {
                    bt.merge_delete(&key)?;
                } else if staged & UPDATED != 0 {
                    bt.merge_update(&key, off)?;
                } else {
                    bt.insert(&key, off)?;
                }
                nmerged += 1;
            }
            Ok(())
        })?;
        tracing::debug!(edits = nmerged, "btree merge");
        Ok(bt)
    }

    fn merge_update(&mut self, key: &[u8], off: u64) -> Result<()> {
        let (spine, leaf_off) = self.descend(key)?;
        let mut ents = self.node_entries(leaf_off)?;
        let pos = ents.partition_point(|(k, _)| k.as_slice() < key);
        if pos < ents.len() && ents[pos].0 == key {
            ents[pos].1 = off;
            self.set_node(leaf_off, node::build(&ents), &spine);
            Ok(())
        } else {
            // an update staged over a layer that has since merged away:
            // the base doesn't hold the key, so this is an insert
            ents.insert(pos, (key.to_vec(), off));
            self.replace_node(leaf_off, ents, pos, &spine)
        }
    }

    // The tombstone's staged offset is not compared here: an update staged
    // in the same buffer may have moved the key past the base's version.
    fn merge_delete(&mut self, key: &[u8]) -> Result<()> {
        let (spine, leaf_off) = self.descend(key)?;
        let mut ents = self.node_entries(leaf_off)?;
        let pos = ents.partition_point(|(k, _)| k.as_slice() < key);
        if pos >= ents.len() || ents[pos].0 != key {
            return Err(errcorrupt!("btree merge: tombstone for missing key"));
        }
        ents.remove(pos);
        if ents.is_empty() {
            self.drop_leaf(leaf_off, &spine)
        } else {
            self.set_node(leaf_off, node::build(&ents), &spine);
            Ok(())
        }
    }

    /// Removes an emptied leaf from its parent, cascading upward. An
    /// emptied root collapses to the empty-leaf sentinel.
    fn drop_leaf(&mut self, leaf_off: u64, spine: &[(u64, usize)]) -> Result<()> {
        self.redirs.remove(leaf_off);
        let mut spine = spine;
        loop {
            let Some(((parent_off, idx), above)) = spine.split_last() else {
                // the whole tree emptied: collapse to the sentinel root
                self.redirs = super::Redirs::new().mutable();
                self.root = self.redirs.add_ephemeral(node::empty());
                self.tree_levels = 0;
                return Ok(());
            };
            let mut ents = self.node_entries(*parent_off)?;
            ents.remove(*idx);
            if ents.is_empty() {
                self.redirs.remove(*parent_off);
                spine = above;
                continue;
            }
            if *idx == 0 {
                // the surviving first entry takes over the open lower bound
                ents[0].0 = Vec::new();
            }
            self.set_node(*parent_off, node::build(&ents), above);
            return Ok(());
        }
    }
}
