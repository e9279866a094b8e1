//! Persistent B-tree of (encoded key, value offset).
//!
//! The tree never loads fully into memory: nodes are read from Stor on
//! demand and verified against their checksum trailer. Reads route through
//! interior nodes holding shortest-separator keys down to leaves holding
//! complete keys.
//!
//! Mutation is ephemeral until saved. A modified node becomes an entry in
//! the redirect table (old offset -> in-memory bytes) and its ancestors
//! join the path set; nothing is allocated in Stor per write. `save`
//! serializes redirected nodes and retains old -> new redirects so clean
//! parents never get rewritten; `save(flatten)` rewrites the affected
//! spines and clears the table. See `update` for the write path and
//! `merge` for folding an inter-buffer into the base.

pub mod builder;
mod merge;
pub mod node;
#[cfg(test)]
mod tests;
mod update;

use std::sync::Arc;

use crate::cksum;
use crate::errcorrupt;
use crate::error::Result;
use crate::hamt::{hash_off, Hamt, HamtItem};
use crate::index::ixkey::Spec;
use crate::stor::io::{Reader, Writer};
use crate::stor::Stor;

pub use builder::BtreeBuilder;

/// Rebuilds the full key for a leaf value offset, normally by reading the
/// referenced record. Each B-tree holds its own extractor.
pub type LeafKeyFn = Arc<dyn Fn(&Stor, &Spec, u64) -> Vec<u8> + Send + Sync>;

/// Default bound on encoded node size. Tests shrink it to force splits.
pub const MAX_NODE_SIZE: usize = 4096;

/// Offsets at and above this are ephemeral: handed to split-created nodes
/// that have never been persisted. They live only in the redirect table
/// and are resolved to real offsets on save.
const EPHEMERAL_BASE: u64 = 1 << 40;

fn is_ephemeral(off: u64) -> bool {
    off >= EPHEMERAL_BASE
}

//-------------------------------------------------------------------

/// A redirected node: `node` holds the modified bytes until save, after
/// which `new_offset` points at the saved copy.
#[derive(Clone)]
pub struct Redir {
    pub offset: u64,
    pub new_offset: u64,
    pub node: Option<Arc<Vec<u8>>>,
}

impl HamtItem for Redir {
    type Key = u64;

    fn key(&self) -> &u64 {
        &self.offset
    }

    fn hash(key: &u64) -> u32 {
        hash_off(key)
    }
}

#[derive(Clone, PartialEq)]
pub struct PathEntry(pub u64);

impl HamtItem for PathEntry {
    type Key = u64;

    fn key(&self) -> &u64 {
        &self.0
    }

    fn hash(key: &u64) -> u32 {
        hash_off(key)
    }
}

/// The redirect table plus the path set of ancestors that may lead to
/// redirected children.
#[derive(Clone)]
pub struct Redirs {
    tbl: Hamt<Redir>,
    paths: Hamt<PathEntry>,
    next_ephemeral: u64,
}

impl Redirs {
    fn new() -> Redirs {
        Redirs {
            tbl: Hamt::new(),
            paths: Hamt::new(),
            next_ephemeral: EPHEMERAL_BASE,
        }
    }

    fn mutable(&self) -> Redirs {
        Redirs {
            tbl: self.tbl.mutable(),
            paths: self.paths.mutable(),
            next_ephemeral: self.next_ephemeral,
        }
    }

    fn freeze(self) -> Redirs {
        Redirs {
            tbl: self.tbl.freeze(),
            paths: self.paths.freeze(),
            next_ephemeral: self.next_ephemeral,
        }
    }

    pub fn get(&self, off: u64) -> Option<Redir> {
        self.tbl.get(&off).cloned()
    }

    fn set_node(&mut self, off: u64, data: Vec<u8>) {
        self.tbl.put(Redir {
            offset: off,
            new_offset: 0,
            node: Some(Arc::new(data)),
        });
    }

    fn set_moved(&mut self, off: u64, new_offset: u64) {
        self.tbl.put(Redir {
            offset: off,
            new_offset,
            node: None,
        });
    }

    fn remove(&mut self, off: u64) {
        self.tbl.delete(&off);
    }

    fn add_ephemeral(&mut self, data: Vec<u8>) -> u64 {
        let off = self.next_ephemeral;
        self.next_ephemeral += 1;
        self.set_node(off, data);
        off
    }

    fn add_path(&mut self, off: u64) {
        self.paths.put(PathEntry(off));
    }

    fn remove_path(&mut self, off: u64) {
        self.paths.delete(&off);
    }

    pub fn on_path(&self, off: u64) -> bool {
        self.paths.get(&off).is_some()
    }

    pub fn len(&self) -> usize {
        self.tbl.count()
    }

    pub fn is_empty(&self) -> bool {
        self.tbl.is_nil() || self.tbl.count() == 0
    }

    pub fn path_count(&self) -> usize {
        self.paths.count()
    }

    pub fn for_each_redir(&self, f: impl FnMut(&Redir)) {
        self.tbl.for_each(f);
    }

    pub fn for_each_path(&self, mut f: impl FnMut(u64)) {
        self.paths.for_each(|p| f(p.0));
    }

    /// Persists the redirect pairs and path set as one chunk:
    /// size, redirect count, (old, new) pairs, path count, offsets,
    /// checksum. Returns 0 when there is nothing to save.
    fn save_to(&self, stor: &Stor) -> u64 {
        let nredirs = self.tbl.count();
        let npaths = self.paths.count();
        if nredirs == 0 && npaths == 0 {
            return 0;
        }
        let size = 3 + 3 + nredirs * 10 + 3 + npaths * 5 + cksum::LEN;
        let (off, buf) = stor.alloc(size);
        {
            let mut w = Writer::new(buf);
            w.put3(size).put3(nredirs);
            self.tbl.for_each(|r| {
                assert!(r.node.is_none(), "unsaved node in redirect table");
                assert!(!is_ephemeral(r.offset));
                w.put5(r.offset).put5(r.new_offset);
            });
            w.put3(npaths);
            self.paths.for_each(|p| {
                w.put5(p.0);
            });
            debug_assert_eq!(w.len(), size - cksum::LEN);
        }
        cksum::update(buf);
        off
    }

    fn read(stor: &Stor, off: u64) -> Result<Redirs> {
        let mut redirs = Redirs::new();
        if off == 0 {
            return Ok(redirs);
        }
        let buf = stor.data(off);
        if buf.len() < 3 {
            return Err(errcorrupt!("short redirect chunk at {off}"));
        }
        let size = Reader::new(buf).get3();
        if size > buf.len() {
            return Err(errcorrupt!("bad redirect chunk size {size} at {off}"));
        }
        cksum::check(&buf[..size])?;
        let mut r = Reader::new(&buf[3..size - cksum::LEN]);
        let mut tbl = redirs.tbl.mutable();
        let nredirs = r.get3();
        for _ in 0..nredirs {
            let offset = r.get5();
            let new_offset = r.get5();
            tbl.put(Redir {
                offset,
                new_offset,
                node: None,
            });
        }
        let mut paths = redirs.paths.mutable();
        let npaths = r.get3();
        for _ in 0..npaths {
            paths.put(PathEntry(r.get5()));
        }
        redirs.tbl = tbl.freeze();
        redirs.paths = paths.freeze();
        Ok(redirs)
    }
}

//-------------------------------------------------------------------

#[derive(Clone)]
pub struct Btree {
    pub(crate) root: u64,
    pub(crate) tree_levels: usize,
    pub(crate) stor: Arc<Stor>,
    pub(crate) redirs: Redirs,
    pub(crate) redirs_off: u64,
    pub(crate) max_node_size: usize,
    pub(crate) ispec: Spec,
    pub(crate) leaf_key: LeafKeyFn,
    pub(crate) mutable: bool,
}

pub(crate) enum NodeBytes<'a> {
    Mem(Arc<Vec<u8>>),
    Stored(&'a [u8]),
}

impl NodeBytes<'_> {
    pub fn bytes(&self) -> &[u8] {
        match self {
            NodeBytes::Mem(data) => data.as_slice(),
            NodeBytes::Stored(data) => data,
        }
    }
}

impl Btree {
    /// Creates an empty tree: a single empty leaf held as an ephemeral
    /// redirect until the first save.
    pub fn create(stor: Arc<Stor>, ispec: Spec, max_node_size: usize, leaf_key: LeafKeyFn) -> Btree {
        let mut redirs = Redirs::new().mutable();
        let root = redirs.add_ephemeral(node::empty());
        Btree {
            root,
            tree_levels: 0,
            stor,
            redirs: redirs.freeze(),
            redirs_off: 0,
            max_node_size,
            ispec,
            leaf_key,
            mutable: false,
        }
    }

    /// Opens a saved tree from its root, level count, and redirect chunk
    /// offset.
    pub fn open(
        stor: Arc<Stor>,
        root: u64,
        tree_levels: usize,
        redirs_off: u64,
        ispec: Spec,
        max_node_size: usize,
        leaf_key: LeafKeyFn,
    ) -> Result<Btree> {
        let redirs = Redirs::read(&stor, redirs_off)?;
        Ok(Btree {
            root,
            tree_levels,
            stor,
            redirs,
            redirs_off,
            max_node_size,
            ispec,
            leaf_key,
            mutable: false,
        })
    }

    pub fn root(&self) -> u64 {
        self.root
    }

    pub fn tree_levels(&self) -> usize {
        self.tree_levels
    }

    pub fn redirs(&self) -> &Redirs {
        &self.redirs
    }

    pub fn redirs_off(&self) -> u64 {
        self.redirs_off
    }

    /// Whether the tree has unsaved redirected nodes.
    pub fn modified(&self) -> bool {
        let mut modified = false;
        self.redirs.for_each_redir(|r| modified |= r.node.is_some());
        modified
    }

    //-------------------------------------------------------------------

    pub(crate) fn node_bytes(&self, off: u64) -> Result<NodeBytes<'_>> {
        match self.redirs.get(off) {
            Some(Redir {
                node: Some(data), ..
            }) => Ok(NodeBytes::Mem(data)),
            Some(Redir { new_offset, .. }) => {
                Ok(NodeBytes::Stored(self.read_node_chunk(new_offset)?))
            }
            None => {
                if is_ephemeral(off) {
                    return Err(errcorrupt!("dangling ephemeral node offset"));
                }
                Ok(NodeBytes::Stored(self.read_node_chunk(off)?))
            }
        }
    }

    pub(crate) fn node_entries(&self, off: u64) -> Result<Vec<(Vec<u8>, u64)>> {
        Ok(node::entries(self.node_bytes(off)?.bytes()))
    }

    fn read_node_chunk(&self, off: u64) -> Result<&[u8]> {
        let buf = self.stor.data(off);
        if buf.len() < 3 + cksum::LEN {
            return Err(errcorrupt!("short btree node at {off}"));
        }
        let size = Reader::new(buf).get3();
        if size < 3 + cksum::LEN || size > buf.len() {
            return Err(errcorrupt!("bad btree node size {size} at {off}"));
        }
        cksum::check(&buf[..size])?;
        Ok(&buf[3..size - cksum::LEN])
    }

    pub(crate) fn write_node_chunk(stor: &Stor, data: &[u8]) -> u64 {
        let size = 3 + data.len() + cksum::LEN;
        let (off, buf) = stor.alloc(size);
        {
            let mut w = Writer::new(buf);
            w.put3(size).put_bytes(data);
        }
        cksum::update(buf);
        off
    }

    //-------------------------------------------------------------------

    /// Point lookup: the value offset stored for `key`, if present.
    pub fn search(&self, key: &[u8]) -> Result<Option<u64>> {
        let mut off = self.root;
        for _ in 0..self.tree_levels {
            let nd = self.node_bytes(off)?;
            (_, off) = node::route(nd.bytes(), key);
        }
        let nd = self.node_bytes(off)?;
        Ok(node::find(nd.bytes(), key))
    }

    /// The neighbor of `after` in the given direction, or the extreme
    /// entry when `after` is None. `inclusive` admits `after` itself.
    /// This is the building block for cursors: each call is one descent.
    pub fn step(
        &self,
        after: Option<&[u8]>,
        inclusive: bool,
        ascending: bool,
    ) -> Result<Option<(Vec<u8>, u64)>> {
        // descend, recording the child index chosen at each tree level
        let mut spine: Vec<(Vec<(Vec<u8>, u64)>, usize)> = Vec::with_capacity(self.tree_levels);
        let mut off = self.root;
        for _ in 0..self.tree_levels {
            let ents = self.node_entries(off)?;
            if ents.is_empty() {
                return Err(errcorrupt!("empty btree tree node"));
            }
            let idx = match after {
                None => {
                    if ascending {
                        0
                    } else {
                        ents.len() - 1
                    }
                }
                Some(key) => route_entries(&ents, key),
            };
            off = ents[idx].1;
            spine.push((ents, idx));
        }

        let mut leaf = self.node_entries(off)?;
        let mut in_target = true; // still inside the subtree `after` routed to
        loop {
            let pos = match (after, in_target) {
                (Some(key), true) => {
                    if ascending {
                        let p = leaf.partition_point(|(k, _)| {
                            if inclusive {
                                k.as_slice() < key
                            } else {
                                k.as_slice() <= key
                            }
                        });
                        if p < leaf.len() {
                            Some(p)
                        } else {
                            None
                        }
                    } else {
                        let p = leaf.partition_point(|(k, _)| {
                            if inclusive {
                                k.as_slice() <= key
                            } else {
                                k.as_slice() < key
                            }
                        });
                        if p > 0 {
                            Some(p - 1)
                        } else {
                            None
                        }
                    }
                }
                _ => {
                    if leaf.is_empty() {
                        None
                    } else if ascending {
                        Some(0)
                    } else {
                        Some(leaf.len() - 1)
                    }
                }
            };
            if let Some(pos) = pos {
                let (key, off) = leaf.swap_remove(pos);
                return Ok(Some((key, off)));
            }
            // advance to the neighboring leaf; empty leaves are permitted
            // and skipped
            in_target = false;
            let mut level = spine.len();
            loop {
                if level == 0 {
                    return Ok(None);
                }
                level -= 1;
                let (ents, idx) = &mut spine[level];
                if ascending && *idx + 1 < ents.len() {
                    *idx += 1;
                    break;
                }
                if !ascending && *idx > 0 {
                    *idx -= 1;
                    break;
                }
            }
            let mut off = spine[level].0[spine[level].1].1;
            for l in level + 1..spine.len() {
                let ents = self.node_entries(off)?;
                if ents.is_empty() {
                    return Err(errcorrupt!("empty btree tree node"));
                }
                let idx = if ascending { 0 } else { ents.len() - 1 };
                off = ents[idx].1;
                spine[l] = (ents, idx);
            }
            leaf = self.node_entries(off)?;
        }
    }

    /// A cursor over the whole tree.
    pub fn iter(&self, ascending: bool) -> BtreeIter<'_> {
        BtreeIter {
            bt: self,
            ascending,
            cur: None,
            inclusive: false,
            done: false,
        }
    }

    /// Whether any stored key begins with `prefix`.
    pub fn prefix_exists(&self, prefix: &[u8]) -> Result<bool> {
        let mut off = self.root;
        for _ in 0..self.tree_levels {
            let nd = self.node_bytes(off)?;
            (_, off) = node::route_prefix_high(nd.bytes(), prefix);
        }
        let nd = self.node_bytes(off)?;
        let mut it = node::NodeIter::new(nd.bytes());
        while it.next() {
            if it.key.starts_with(prefix) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    //-------------------------------------------------------------------

    /// Walks the whole tree validating its invariants: strictly increasing
    /// leaf keys, interior separators bounding their children, and leaf
    /// keys matching the key extractor. Returns (entry count, total node
    /// bytes, node count).
    pub fn check(&self) -> Result<(usize, usize, usize)> {
        let mut state = CheckState {
            count: 0,
            size: 0,
            nnodes: 0,
            last_key: None,
        };
        self.check1(self.root, 0, &[], &mut state)?;
        Ok((state.count, state.size, state.nnodes))
    }

    fn check1(&self, off: u64, depth: usize, lower: &[u8], state: &mut CheckState) -> Result<()> {
        let nd = self.node_bytes(off)?;
        let data = nd.bytes();
        state.nnodes += 1;
        state.size += data.len();
        if depth == self.tree_levels {
            let mut it = node::NodeIter::new(data);
            while it.next() {
                if let Some(last) = &state.last_key {
                    if it.key.as_slice() <= last.as_slice() {
                        return Err(errcorrupt!("btree keys out of order"));
                    }
                }
                if it.key.as_slice() < lower {
                    return Err(errcorrupt!("btree leaf key below its separator"));
                }
                let expect = (self.leaf_key)(&self.stor, &self.ispec, it.offset);
                if expect != it.key {
                    return Err(errcorrupt!("btree leaf key does not match its record"));
                }
                state.count += 1;
                state.last_key = Some(it.key.clone());
            }
            return Ok(());
        }
        let ents = node::entries(data);
        if ents.is_empty() {
            return Err(errcorrupt!("empty btree tree node"));
        }
        for (i, (key, child)) in ents.iter().enumerate() {
            if i > 0 && key.as_slice() <= ents[i - 1].0.as_slice() {
                return Err(errcorrupt!("btree separators out of order"));
            }
            let bound = if i == 0 { lower } else { key.as_slice() };
            self.check1(*child, depth + 1, bound, state)?;
        }
        Ok(())
    }
}

struct CheckState {
    count: usize,
    size: usize,
    nnodes: usize,
    last_key: Option<Vec<u8>>,
}

/// The child index `key` routes to: the last entry at or below it.
fn route_entries(ents: &[(Vec<u8>, u64)], key: &[u8]) -> usize {
    let mut at = 0;
    for (i, (k, _)) in ents.iter().enumerate().skip(1) {
        if k.as_slice() > key {
            break;
        }
        at = i;
    }
    at
}

pub struct BtreeIter<'a> {
    bt: &'a Btree,
    ascending: bool,
    cur: Option<Vec<u8>>,
    inclusive: bool,
    done: bool,
}

impl BtreeIter<'_> {
    pub fn next(&mut self) -> Result<Option<(Vec<u8>, u64)>> {
        if self.done {
            return Ok(None);
        }
        let found = self
            .bt
            .step(self.cur.as_deref(), self.inclusive, self.ascending)?;
        self.inclusive = false;
        match found {
            Some((key, off)) => {
                self.cur = Some(key.clone());
                Ok(Some((key, off)))
            }
            None => {
                self.done = true;
                Ok(None)
            }
        }
    }

    /// Repositions so the next call returns the first entry at or past
    /// `key` in the iteration direction.
    pub fn seek(&mut self, key: &[u8]) {
        self.cur = Some(key.to_vec());
        self.inclusive = true;
        self.done = false;
    }
}
