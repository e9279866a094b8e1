//! Persistent hash-array-mapped trie.
//!
//! The metadata directories (schema and info, keyed by table name) and the
//! B-tree redirect tables are all instances of this one generic map. A
//! frozen `Hamt` is an immutable snapshot that is cheap to share between
//! readers; `mutable` derives a copy-on-write handle whose edits are
//! invisible until `freeze`.
//!
//! Each node consumes 5 hash bits per level and carries two bitmaps:
//! `bm_val` marks slots holding an item, `bm_ptr` marks slots with a child.
//! Entries are ordered by bit position, so an item's rank in `vals` is the
//! popcount of the lower bits. Past 32 hash bits a node degrades to an
//! overflow node holding colliding items in an unordered list.
//!
//! Nodes are stamped with the generation of the mutable handle that created
//! them. A mutable handle may edit its own generation's nodes in place;
//! anything older is path-copied on the way down.

use std::sync::Arc;

use crate::cksum;
use crate::error::Result;
use crate::stor::io::{Reader, Writer};
use crate::stor::Stor;

pub trait HamtItem: Clone {
    type Key: PartialEq + ?Sized;

    fn key(&self) -> &Self::Key;
    fn hash(key: &Self::Key) -> u32;
}

/// Items that persist in chained chunks (schema and info entries).
pub trait HamtStored: HamtItem {
    fn stor_size(&self) -> usize;
    fn write(&self, w: &mut Writer);
    fn read(stor: &Arc<Stor>, r: &mut Reader) -> Result<Self>
    where
        Self: Sized;
}

const BITS_PER_NODE: u32 = 5;
const MASK: u32 = (1 << BITS_PER_NODE) - 1;

#[derive(Clone)]
pub struct Hamt<I: HamtItem> {
    root: Option<Arc<Node<I>>>,
    mutable: bool,
    generation: u32,
}

#[derive(Clone)]
struct Node<I: HamtItem> {
    generation: u32,
    bm_val: u32,
    bm_ptr: u32,
    vals: Vec<I>,
    ptrs: Vec<Arc<Node<I>>>,
}

impl<I: HamtItem> Node<I> {
    fn empty(generation: u32) -> Node<I> {
        Node {
            generation,
            bm_val: 0,
            bm_ptr: 0,
            vals: Vec::new(),
            ptrs: Vec::new(),
        }
    }

    fn bit(hash: u32, shift: u32) -> u32 {
        1 << ((hash >> shift) & MASK)
    }
}

impl<I: HamtItem> Default for Hamt<I> {
    fn default() -> Self {
        Hamt::new()
    }
}

impl<I: HamtItem> Hamt<I> {
    pub fn new() -> Hamt<I> {
        Hamt {
            root: None,
            mutable: false,
            generation: 0,
        }
    }

    pub fn is_nil(&self) -> bool {
        self.root.is_none()
    }

    pub fn get(&self, key: &I::Key) -> Option<&I> {
        let mut nd = self.root.as_deref()?;
        let hash = I::hash(key);
        let mut shift = 0;
        while shift < 32 {
            let bit = Node::<I>::bit(hash, shift);
            if nd.bm_val & bit != 0 {
                let iv = (nd.bm_val & (bit - 1)).count_ones() as usize;
                if nd.vals[iv].key() == key {
                    return Some(&nd.vals[iv]);
                }
            }
            if nd.bm_ptr & bit == 0 {
                return None;
            }
            let ip = (nd.bm_ptr & (bit - 1)).count_ones() as usize;
            nd = &nd.ptrs[ip];
            shift += BITS_PER_NODE;
        }
        // overflow node, linear search
        nd.vals.iter().find(|it| it.key() == key)
    }

    /// Derives a copy-on-write handle with a fresh generation.
    pub fn mutable(&self) -> Hamt<I> {
        let generation = self.generation + 1;
        let mut root = match &self.root {
            Some(r) => (**r).clone(),
            None => Node::empty(generation),
        };
        root.generation = generation;
        Hamt {
            root: Some(Arc::new(root)),
            mutable: true,
            generation,
        }
    }

    pub fn freeze(self) -> Hamt<I> {
        Hamt {
            root: self.root,
            mutable: false,
            generation: self.generation,
        }
    }

    pub fn put(&mut self, item: I) {
        assert!(self.mutable, "can't modify an immutable Hamt");
        let generation = self.generation;
        let hash = I::hash(item.key());
        let root = self.root.as_mut().expect("mutable Hamt has a root");
        with(root, generation, item, hash, 0);
    }

    /// Removes an item, returning whether it was found.
    pub fn delete(&mut self, key: &I::Key) -> bool {
        assert!(self.mutable, "can't modify an immutable Hamt");
        let generation = self.generation;
        let hash = I::hash(key);
        let root = self.root.as_mut().expect("mutable Hamt has a root");
        // the root stays in place even when it empties
        let (_, found) = without(root, generation, key, hash, 0);
        found
    }

    pub fn for_each<F: FnMut(&I)>(&self, mut f: F) {
        if let Some(root) = &self.root {
            each(root, &mut f);
        }
    }

    /// The number of items held. O(n).
    pub fn count(&self) -> usize {
        let mut n = 0;
        self.for_each(|_| n += 1);
        n
    }
}

/// Path-copies `slot` unless it already belongs to `generation`, then
/// returns it mutably. A current-generation node is normally owned by the
/// one live mutable handle, so `make_mut` mutates in place; if it is
/// still shared it gets copied, so a frozen view never observes an edit.
fn owned<I: HamtItem>(slot: &mut Arc<Node<I>>, generation: u32) -> &mut Node<I> {
    if slot.generation != generation {
        let mut nd = (**slot).clone();
        nd.generation = generation;
        *slot = Arc::new(nd);
    }
    Arc::make_mut(slot)
}

fn with<I: HamtItem>(slot: &mut Arc<Node<I>>, generation: u32, item: I, hash: u32, shift: u32) {
    let nd = owned(slot, generation);
    if shift >= 32 {
        // overflow node
        for val in nd.vals.iter_mut() {
            if val.key() == item.key() {
                *val = item;
                return;
            }
        }
        nd.vals.push(item);
        return;
    }
    let bit = Node::<I>::bit(hash, shift);
    let iv = (nd.bm_val & (bit - 1)).count_ones() as usize;
    if nd.bm_val & bit == 0 {
        // slot is empty, insert new value
        nd.bm_val |= bit;
        nd.vals.insert(iv, item);
        return;
    }
    if nd.vals[iv].key() == item.key() {
        nd.vals[iv] = item;
        return;
    }
    let ip = (nd.bm_ptr & (bit - 1)).count_ones() as usize;
    if nd.bm_ptr & bit != 0 {
        with(&mut nd.ptrs[ip], generation, item, hash, shift + BITS_PER_NODE);
        return;
    }
    // collision, push the new value down to a new child node
    let mut child = Arc::new(Node::empty(generation));
    with(&mut child, generation, item, hash, shift + BITS_PER_NODE);
    nd.ptrs.insert(ip, child);
    nd.bm_ptr |= bit;
}

/// Returns (emptied, found). The parent removes an emptied child's pointer.
fn without<I: HamtItem>(
    slot: &mut Arc<Node<I>>,
    generation: u32,
    key: &I::Key,
    hash: u32,
    shift: u32,
) -> (bool, bool) {
    let nd = owned(slot, generation);
    if shift >= 32 {
        // overflow node
        if let Some(i) = nd.vals.iter().position(|it| it.key() == key) {
            nd.vals.swap_remove(i);
            return (nd.vals.is_empty(), true);
        }
        return (false, false);
    }
    let bit = Node::<I>::bit(hash, shift);
    if nd.bm_val & bit != 0 {
        let iv = (nd.bm_val & (bit - 1)).count_ones() as usize;
        if nd.vals[iv].key() == key {
            if nd.bm_ptr & bit == 0 {
                nd.bm_val &= !bit;
                nd.vals.remove(iv); // preserve order
                return (nd.bm_val == 0 && nd.bm_ptr == 0, true);
            }
            // slot also has a child: pull up its rightmost item
            let ip = (nd.bm_ptr & (bit - 1)).count_ones() as usize;
            let (emptied, item) = pull_up(&mut nd.ptrs[ip], generation);
            nd.vals[iv] = item;
            if emptied {
                nd.bm_ptr &= !bit;
                nd.ptrs.remove(ip);
            }
            return (false, true);
        }
    }
    if nd.bm_ptr & bit == 0 {
        return (false, false);
    }
    let ip = (nd.bm_ptr & (bit - 1)).count_ones() as usize;
    let (emptied, found) = without(&mut nd.ptrs[ip], generation, key, hash, shift + BITS_PER_NODE);
    if emptied {
        nd.bm_ptr &= !bit;
        nd.ptrs.remove(ip);
    }
    (false, found)
}

/// Takes the rightmost item out of the subtree, so the freed bit is always
/// the highest set one. Returns (emptied, item).
fn pull_up<I: HamtItem>(slot: &mut Arc<Node<I>>, generation: u32) -> (bool, I) {
    let nd = owned(slot, generation);
    if nd.bm_ptr != 0 {
        debug_assert!(nd.bm_val != 0);
        let ip = nd.ptrs.len() - 1;
        let (emptied, item) = pull_up(&mut nd.ptrs[ip], generation);
        if emptied {
            nd.ptrs.pop();
            nd.bm_ptr = clear_highest_bit(nd.bm_ptr);
        }
        return (false, item);
    }
    let item = nd.vals.pop().expect("pull up from empty Hamt node");
    if nd.vals.is_empty() {
        return (true, item);
    }
    if nd.bm_val != 0 {
        // not an overflow node
        nd.bm_val = clear_highest_bit(nd.bm_val);
    }
    (false, item)
}

fn clear_highest_bit(n: u32) -> u32 {
    n & !(1 << (31 - n.leading_zeros()))
}

fn each<I: HamtItem, F: FnMut(&I)>(nd: &Node<I>, f: &mut F) {
    for val in &nd.vals {
        f(val);
    }
    for ptr in &nd.ptrs {
        each(ptr, f);
    }
}

//-------------------------------------------------------------------

impl<I: HamtStored> Hamt<I> {
    /// Serializes the items passing `filter` as one chunk chained to
    /// `prev_off`: a 3-byte size, a 5-byte previous chunk offset, the item
    /// encodings, and a checksum trailer. Returns 0 if nothing passed the
    /// filter.
    pub fn write(&self, stor: &Stor, prev_off: u64, filter: impl Fn(&I) -> bool) -> u64 {
        let mut size = 0;
        self.for_each(|it| {
            if filter(it) {
                size += it.stor_size();
            }
        });
        if size == 0 {
            return 0;
        }
        size += 3 + 5 + cksum::LEN;
        let (off, buf) = stor.alloc(size);
        {
            let mut w = Writer::new(buf);
            w.put3(size).put5(prev_off);
            self.for_each(|it| {
                if filter(it) {
                    it.write(&mut w);
                }
            });
            debug_assert_eq!(w.len(), size - cksum::LEN);
        }
        cksum::update(buf);
        off
    }

    /// Reads a chunk chain newest-first, returning the assembled map and
    /// the chunk offsets walked. Within the chain the first occurrence of a
    /// key wins, so newer chunks shadow older ones.
    pub fn read_chain(stor: &Arc<Stor>, mut off: u64) -> Result<(Hamt<I>, Vec<u64>)> {
        let mut offs = Vec::new();
        let mut ht = Hamt::new().mutable();
        while off != 0 {
            offs.push(off);
            off = ht.read_chunk(stor, off)?;
        }
        Ok((ht.freeze(), offs))
    }

    fn read_chunk(&mut self, stor: &Arc<Stor>, off: u64) -> Result<u64> {
        let buf = stor.data(off);
        if buf.len() < 3 + 5 + cksum::LEN {
            return Err(crate::errcorrupt!("short Hamt chunk at {off}"));
        }
        let size = Reader::new(buf).get3();
        if size < 3 + 5 + cksum::LEN || size > buf.len() {
            return Err(crate::errcorrupt!("bad Hamt chunk size {size} at {off}"));
        }
        cksum::check(&buf[..size])?;
        let mut r = Reader::new(&buf[3..size - cksum::LEN]);
        let prev_off = r.get5();
        while r.remaining() > 0 {
            let it = I::read(stor, &mut r)?;
            if self.get(it.key()).is_none() {
                self.put(it);
            }
        }
        Ok(prev_off)
    }
}

//-------------------------------------------------------------------

/// FNV-1a, the hash for string-keyed directories.
pub fn hash_str(s: &str) -> u32 {
    let mut hash: u32 = 2166136261;
    for &b in s.as_bytes() {
        hash ^= b as u32;
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

/// Mixes a 64-bit offset down to a 32-bit hash (for redirect tables).
pub fn hash_off(off: &u64) -> u32 {
    let h = off.wrapping_mul(0x9e3779b97f4a7c15);
    (h ^ (h >> 32)) as u32
}
