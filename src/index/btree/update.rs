//! B-tree mutation through the redirect layer.
//!
//! Writes never touch Stor. A modified node is re-encoded in memory and
//! keyed by its old offset in the redirect table; every ancestor offset
//! joins the path set so traversals know which subtrees may hold
//! redirected children. Nodes created by splits get ephemeral offsets
//! above the persistent address range.
//!
//! `save(false)` writes redirected nodes out and keeps the old -> new
//! mapping, so clean ancestors are not rewritten. `save(true)` flattens:
//! the affected spines are rewritten so every entry points at a real
//! offset, and the redirect table empties.

use super::node;
use super::{is_ephemeral, Btree, Redir, Redirs};
use crate::errcorrupt;
use crate::error::Result;

impl Btree {
    pub(crate) fn make_mutable(&self) -> Btree {
        let mut bt = self.clone();
        bt.redirs = self.redirs.mutable();
        bt.mutable = true;
        bt
    }

    pub(crate) fn freeze(mut self) -> Btree {
        self.redirs = self.redirs.freeze();
        self.mutable = false;
        self
    }

    /// Runs mutations on a copy and returns the updated tree. The
    /// original remains valid: shared nodes are never modified.
    pub fn update(&self, f: impl FnOnce(&mut Btree) -> Result<()>) -> Result<Btree> {
        let mut bt = self.make_mutable();
        f(&mut bt)?;
        Ok(bt.freeze())
    }

    fn ck_mutable(&self) {
        assert!(self.mutable, "can't modify an immutable Btree");
    }

    //-------------------------------------------------------------------

    /// Inserts a key in sorted position, splitting as needed.
    pub fn insert(&mut self, key: &[u8], off: u64) -> Result<()> {
        self.ck_mutable();
        let (spine, leaf_off) = self.descend(key)?;
        let mut ents = self.node_entries(leaf_off)?;
        let pos = ents.partition_point(|(k, _)| k.as_slice() < key);
        if pos < ents.len() && ents[pos].0 == key {
            ents[pos].1 = off;
        } else {
            ents.insert(pos, (key.to_vec(), off));
        }
        self.replace_node(leaf_off, ents, pos, &spine)
    }

    /// Removes a key from its leaf. Empty leaves are permitted; the next
    /// merge or rebuild reclaims them.
    pub fn delete(&mut self, key: &[u8], off: u64) -> Result<()> {
        self.ck_mutable();
        let (spine, leaf_off) = self.descend(key)?;
        let mut ents = self.node_entries(leaf_off)?;
        let pos = ents.partition_point(|(k, _)| k.as_slice() < key);
        if pos >= ents.len() || ents[pos].0 != key {
            return Err(errcorrupt!("btree delete: key not found"));
        }
        if ents[pos].1 != off {
            return Err(errcorrupt!("btree delete: offset mismatch"));
        }
        ents.remove(pos);
        self.set_node(leaf_off, node::build(&ents), &spine);
        Ok(())
    }

    /// Replaces the value offset stored for a key.
    pub fn update_offset(&mut self, key: &[u8], off: u64) -> Result<()> {
        self.ck_mutable();
        let (spine, leaf_off) = self.descend(key)?;
        let mut ents = self.node_entries(leaf_off)?;
        let pos = ents.partition_point(|(k, _)| k.as_slice() < key);
        if pos >= ents.len() || ents[pos].0 != key {
            return Err(errcorrupt!("btree update: key not found"));
        }
        ents[pos].1 = off;
        self.set_node(leaf_off, node::build(&ents), &spine);
        Ok(())
    }

    /// The spine of (node offset, chosen entry index) above the leaf a
    /// key routes to, plus the leaf offset.
    pub(crate) fn descend(&self, key: &[u8]) -> Result<(Vec<(u64, usize)>, u64)> {
        let mut spine = Vec::with_capacity(self.tree_levels);
        let mut off = self.root;
        for _ in 0..self.tree_levels {
            let nd = self.node_bytes(off)?;
            let (idx, child) = node::route(nd.bytes(), key);
            spine.push((off, idx));
            off = child;
        }
        Ok((spine, off))
    }

    /// Installs rebuilt entries for the node at `off`, splitting while the
    /// encoding exceeds the node size bound.
    pub(crate) fn replace_node(
        &mut self,
        off: u64,
        ents: Vec<(Vec<u8>, u64)>,
        changed_at: usize,
        spine: &[(u64, usize)],
    ) -> Result<()> {
        let data = node::build(&ents);
        if data.len() <= self.max_node_size || ents.len() < 2 {
            self.set_node(off, data, spine);
            return Ok(());
        }
        self.split(off, ents, changed_at, spine)
    }

    fn split(
        &mut self,
        off: u64,
        mut ents: Vec<(Vec<u8>, u64)>,
        changed_at: usize,
        spine: &[(u64, usize)],
    ) -> Result<()> {
        let depth = spine.len();
        let is_leaf = depth == self.tree_levels;
        let at = split_point(&ents, changed_at);
        let mut right = ents.split_off(at);
        // the separator promoted to the parent routes the right node
        let sep = if is_leaf {
            node::separator(&ents[ents.len() - 1].0, &right[0].0)
        } else {
            // interior keys are already separators; the first right key
            // moves up and the node-local copy becomes the open bound
            std::mem::take(&mut right[0].0)
        };
        self.set_node(off, node::build(&ents), spine);
        let right_off = self.redirs.add_ephemeral(node::build(&right));
        match spine.split_last() {
            Some(((parent_off, parent_idx), above)) => {
                let mut pents = self.node_entries(*parent_off)?;
                pents.insert(parent_idx + 1, (sep, right_off));
                self.replace_node(*parent_off, pents, parent_idx + 1, above)
            }
            None => {
                // splitting the root grows the tree
                let root_ents = vec![(Vec::new(), off), (sep, right_off)];
                let new_root = self.redirs.add_ephemeral(node::build(&root_ents));
                self.redirs.add_path(new_root);
                self.root = new_root;
                self.tree_levels += 1;
                Ok(())
            }
        }
    }

    pub(crate) fn set_node(&mut self, off: u64, data: Vec<u8>, spine: &[(u64, usize)]) {
        self.redirs.set_node(off, data);
        for &(ancestor, _) in spine {
            self.redirs.add_path(ancestor);
        }
    }

    //-------------------------------------------------------------------

    /// Persists outstanding changes and returns the saved tree.
    ///
    /// With `flatten` false, redirected nodes are written and the
    /// old -> new redirects retained (parents are untouched); the root
    /// holder absorbs a root redirect. With `flatten` true the affected
    /// spines are rewritten and the redirect table empties.
    pub fn save(&self, flatten: bool) -> Result<Btree> {
        let mut bt = self.make_mutable();
        if flatten {
            bt.root = bt.flatten_node(bt.root, 0)?;
            bt.redirs = Redirs::new().mutable();
        } else {
            let old_root = bt.root;
            let root = bt.save_node(old_root, 0)?;
            if root != old_root {
                // the root holder absorbs the root's own redirect
                bt.root = root;
                bt.redirs.remove(old_root);
                if bt.redirs.on_path(old_root) {
                    bt.redirs.remove_path(old_root);
                    bt.redirs.add_path(root);
                }
            }
            bt.cleanup_ephemerals();
        }
        bt.redirs_off = bt.redirs.save_to(&bt.stor);
        self.stor.sync()?;
        tracing::debug!(
            root = bt.root,
            levels = bt.tree_levels,
            redirs = bt.redirs.len(),
            flatten,
            "btree saved"
        );
        Ok(bt.freeze())
    }

    /// Writes the redirected nodes under `off` and returns its final
    /// offset. Entries keep their old child offsets (the retained
    /// redirects resolve them), except ephemeral children which must be
    /// materialized.
    fn save_node(&mut self, off: u64, depth: usize) -> Result<u64> {
        match self.redirs.get(off) {
            Some(Redir {
                node: Some(data), ..
            }) => {
                let mut data = (*data).clone();
                if depth < self.tree_levels {
                    let mut ents = node::entries(&data);
                    let mut changed = false;
                    for ent in ents.iter_mut() {
                        let child = ent.1;
                        let saved = self.save_node(child, depth + 1)?;
                        if is_ephemeral(child) {
                            ent.1 = saved;
                            changed = true;
                        }
                    }
                    if changed {
                        data = node::build(&ents);
                    }
                }
                let new_off = Btree::write_node_chunk(&self.stor, &data);
                self.redirs.set_moved(off, new_off);
                Ok(new_off)
            }
            Some(Redir { new_offset, .. }) => {
                // already on disk; newer redirects may hide below it
                if depth < self.tree_levels {
                    let ents = node::entries(self.read_saved(new_offset)?.as_slice());
                    for (_, child) in ents {
                        self.save_node(child, depth + 1)?;
                    }
                }
                Ok(new_offset)
            }
            None => {
                if depth < self.tree_levels && self.redirs.on_path(off) {
                    for (_, child) in self.node_entries(off)? {
                        self.save_node(child, depth + 1)?;
                    }
                }
                Ok(off)
            }
        }
    }

    fn read_saved(&self, off: u64) -> Result<Vec<u8>> {
        self.node_bytes(off).map(|nd| nd.bytes().to_vec())
    }

    /// Ephemeral offsets never reach disk; once saved, their redirects
    /// (and any path entries) move to the real offsets.
    fn cleanup_ephemerals(&mut self) {
        let mut moves = Vec::new();
        self.redirs.for_each_redir(|r| {
            if is_ephemeral(r.offset) {
                moves.push((r.offset, r.new_offset));
            }
        });
        for (eph, real) in moves {
            self.redirs.remove(eph);
            if self.redirs.on_path(eph) {
                self.redirs.remove_path(eph);
                self.redirs.add_path(real);
            }
        }
    }

    /// Rewrites the spine under `off` so every entry holds a final
    /// offset, returning the node's own final offset.
    fn flatten_node(&mut self, off: u64, depth: usize) -> Result<u64> {
        let redir = self.redirs.get(off);
        let (mut data, mut dirty, saved_at) = match &redir {
            Some(Redir {
                node: Some(data), ..
            }) => ((**data).clone(), true, 0),
            Some(Redir { new_offset, .. }) => (self.read_saved(*new_offset)?, false, *new_offset),
            None => {
                if depth < self.tree_levels && self.redirs.on_path(off) {
                    (self.read_saved(off)?, false, off)
                } else {
                    return Ok(off);
                }
            }
        };
        if depth < self.tree_levels {
            let mut ents = node::entries(&data);
            let mut changed = false;
            for ent in ents.iter_mut() {
                let flat = self.flatten_node(ent.1, depth + 1)?;
                if flat != ent.1 {
                    ent.1 = flat;
                    changed = true;
                }
            }
            if changed {
                data = node::build(&ents);
                dirty = true;
            }
        }
        if dirty {
            Ok(Btree::write_node_chunk(&self.stor, &data))
        } else {
            // already persisted and unchanged below
            Ok(saved_at)
        }
    }
}

/// Where to split a full node. Appending and prepending split unevenly so
/// sequential loads stay densely packed; anything else splits at the byte
/// midpoint.
fn split_point(ents: &[(Vec<u8>, u64)], changed_at: usize) -> usize {
    debug_assert!(ents.len() >= 2);
    if changed_at >= ents.len() - 1 {
        return ents.len() - 1;
    }
    if changed_at == 0 {
        return 1;
    }
    let total = node::size_of(ents);
    let mut size = 2;
    let mut prev: &[u8] = &[];
    for (i, (key, _)) in ents.iter().enumerate() {
        size += 9 + key.len() - node::common_prefix(prev, key);
        prev = key;
        if size >= total / 2 {
            return (i + 1).clamp(1, ents.len() - 1);
        }
    }
    ents.len() / 2
}
