//! Overlay: the composite view of one index.
//!
//! An overlay layers a persisted base B-tree under a stack of frozen
//! inter-buffers (oldest first) and, inside a transaction, one private
//! mutable buffer on top:
//!
//! ```text
//! ┌──────────────────┐  newest   ── transaction writes land here
//! │ mutable buffer   │
//! ├──────────────────┤
//! │ frozen buffer n  │           ── committed, not yet merged
//! │      ...         │
//! │ frozen buffer 1  │  oldest
//! ├──────────────────┤
//! │ base B-tree      │           ── persisted
//! └──────────────────┘
//! ```
//!
//! Point reads take the newest hit, with a tombstone reading as absent.
//! Iteration merges all layers on the fly with the same shadowing. The
//! overlay pivots between write latency (one buffer insert) and read
//! amplification (layer count times per-layer cost); `merge` folds the
//! oldest layers into the base to bound the latter.
//!
//! Merge and save return opaque results that the metadata layer applies
//! copy-on-write, so concurrent readers keep their snapshot.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::index::btree::{Btree, LeafKeyFn};
use crate::index::interbuf::{InterBuf, DELETED, OFFSET_MASK};
use crate::index::ixkey::Spec;
use crate::record;
use crate::stor::io::{Reader, Writer};
use crate::stor::Stor;

#[derive(Clone)]
pub struct Overlay {
    bt: Btree,
    /// Committed, unmerged layers, oldest first.
    under: Vec<Arc<InterBuf>>,
    /// The transaction-private staging buffer.
    mutbuf: Option<Arc<InterBuf>>,
}

/// The folded base produced by `merge`, applied later by `with_merged`.
pub struct MergeResult {
    bt: Btree,
    nmerged: usize,
}

/// The saved base produced by `save`, applied later by `with_saved`.
pub struct SaveResult {
    bt: Btree,
}

impl Overlay {
    pub fn new(bt: Btree) -> Overlay {
        Overlay {
            bt,
            under: Vec::new(),
            mutbuf: None,
        }
    }

    pub fn base(&self) -> &Btree {
        &self.bt
    }

    pub fn layers(&self) -> usize {
        self.under.len()
    }

    /// A transaction's view: same layers plus a private mutable buffer.
    pub fn with_mut(&self) -> Overlay {
        Overlay {
            bt: self.bt.clone(),
            under: self.under.clone(),
            mutbuf: Some(Arc::new(InterBuf::new())),
        }
    }

    /// The private buffer, detached for commit.
    pub fn take_mut(&mut self) -> Option<Arc<InterBuf>> {
        self.mutbuf.take()
    }

    fn mutbuf(&self) -> Result<&InterBuf> {
        match &self.mutbuf {
            Some(buf) => Ok(buf),
            None => Err(Error::ReadOnly),
        }
    }

    pub fn insert(&self, key: &[u8], off: u64) -> Result<()> {
        self.mutbuf()?.insert(key, off)
    }

    pub fn update(&self, key: &[u8], off: u64) -> Result<()> {
        self.mutbuf()?.update(key, off)
    }

    pub fn delete(&self, key: &[u8], off: u64) -> Result<()> {
        self.mutbuf()?.delete(key, off)
    }

    /// Layered point lookup: the newest layer that knows the key wins,
    /// and a tombstone means not present.
    pub fn get(&self, key: &[u8]) -> Result<Option<u64>> {
        if let Some(buf) = &self.mutbuf {
            if let Some(staged) = buf.get(key) {
                return Ok(live(staged));
            }
        }
        for buf in self.under.iter().rev() {
            if let Some(staged) = buf.get(key) {
                return Ok(live(staged));
            }
        }
        self.bt.search(key)
    }

    /// An n-way merged cursor over every layer.
    pub fn iter(&self, ascending: bool) -> OverlayIter<'_> {
        let mut bufs: Vec<&InterBuf> = Vec::with_capacity(self.under.len() + 1);
        if let Some(buf) = &self.mutbuf {
            bufs.push(buf);
        }
        for buf in self.under.iter().rev() {
            bufs.push(buf);
        }
        OverlayIter {
            bufs,
            bt: &self.bt,
            ascending,
            cur: None,
            inclusive: false,
            done: false,
        }
    }

    //-------------------------------------------------------------------

    /// A new overlay with `buf` committed as the newest frozen layer.
    pub fn with_committed(&self, buf: Arc<InterBuf>) -> Overlay {
        buf.freeze();
        let mut under = self.under.clone();
        under.push(buf);
        Overlay {
            bt: self.bt.clone(),
            under,
            mutbuf: None,
        }
    }

    /// Folds the oldest `n` frozen layers into the base. Read-only: the
    /// result is applied by `with_merged`.
    pub fn merge(&self, n: usize) -> Result<MergeResult> {
        assert!(n > 0 && n <= self.under.len(), "bad merge layer count");
        let mut folded = self.under[0].clone();
        for buf in &self.under[1..n] {
            folded = Arc::new(InterBuf::merged(&folded, buf));
        }
        let bt = self.bt.merge(folded.iter())?;
        Ok(MergeResult { bt, nmerged: n })
    }

    /// Installs a merge result, dropping the folded layers.
    pub fn with_merged(&self, result: MergeResult) -> Overlay {
        Overlay {
            bt: result.bt,
            under: self.under[result.nmerged..].to_vec(),
            mutbuf: None,
        }
    }

    /// Whether the base holds unsaved changes from prior merges.
    pub fn modified(&self) -> bool {
        self.bt.modified()
    }

    /// Persists the base's outstanding redirects. Read-only: the result
    /// is applied by `with_saved`.
    pub fn save(&self) -> Result<SaveResult> {
        Ok(SaveResult {
            bt: self.bt.save(false)?,
        })
    }

    pub fn with_saved(&self, result: SaveResult) -> Overlay {
        Overlay {
            bt: result.bt,
            under: self.under.clone(),
            mutbuf: None,
        }
    }

    //-------------------------------------------------------------------

    /// The persisted form of an overlay handle inside an info entry:
    /// base root, level count, and redirect chunk offset.
    pub fn stor_size(&self) -> usize {
        5 + 1 + 5
    }

    // Frozen layers are deliberately not persisted: they only become
    // durable once a merge folds them into the base and a save lands it.
    pub fn write(&self, w: &mut Writer) {
        debug_assert!(
            !self.bt.modified(),
            "persisting an overlay with unsaved base changes"
        );
        w.put5(self.bt.root())
            .put1(self.bt.tree_levels())
            .put5(self.bt.redirs_off());
    }

    pub fn read(stor: &Arc<Stor>, r: &mut Reader) -> Result<Overlay> {
        let root = r.get5();
        let tree_levels = r.get1();
        let redirs_off = r.get5();
        let bt = Btree::open(
            stor.clone(),
            root,
            tree_levels,
            redirs_off,
            Spec::default(),
            crate::index::btree::MAX_NODE_SIZE,
            Arc::new(record::leaf_key),
        )?;
        Ok(Overlay::new(bt))
    }

    /// Re-links the index spec (and key extractor) after a chain read;
    /// specs live in the schema directory, not in the persisted handle.
    pub fn with_index_spec(&self, ispec: Spec, leaf_key: LeafKeyFn) -> Overlay {
        let mut bt = self.bt.clone();
        bt.ispec = ispec;
        bt.leaf_key = leaf_key;
        Overlay {
            bt,
            under: self.under.clone(),
            mutbuf: self.mutbuf.clone(),
        }
    }
}

fn live(staged: u64) -> Option<u64> {
    if staged & DELETED != 0 {
        None
    } else {
        Some(staged & OFFSET_MASK)
    }
}

pub struct OverlayIter<'a> {
    /// Buffers newest first; the base tree is implicitly the oldest.
    bufs: Vec<&'a InterBuf>,
    bt: &'a Btree,
    ascending: bool,
    cur: Option<Vec<u8>>,
    inclusive: bool,
    done: bool,
}

impl OverlayIter<'_> {
    pub fn next(&mut self) -> Result<Option<(Vec<u8>, u64)>> {
        while !self.done {
            let after = self.cur.as_deref();
            let mut best: Option<(Vec<u8>, u64)> = None;
            for buf in &self.bufs {
                if let Some((key, staged)) = buf.step(after, self.inclusive, self.ascending) {
                    if self.better(&key, &best) {
                        best = Some((key, staged));
                    }
                }
            }
            if let Some((key, off)) = self.bt.step(after, self.inclusive, self.ascending)? {
                if self.better(&key, &best) {
                    best = Some((key, off));
                }
            }
            let Some((key, staged)) = best else {
                self.done = true;
                break;
            };
            self.cur = Some(key.clone());
            self.inclusive = false;
            if staged & DELETED != 0 {
                continue; // suppressed below this layer as well
            }
            return Ok(Some((key, staged & OFFSET_MASK)));
        }
        Ok(None)
    }

    /// Strictly closer in the iteration direction. On a tie the earlier
    /// (newer) source already holds the slot, which implements shadowing.
    fn better(&self, key: &[u8], best: &Option<(Vec<u8>, u64)>) -> bool {
        match best {
            None => true,
            Some((bk, _)) => {
                if self.ascending {
                    key < bk.as_slice()
                } else {
                    key > bk.as_slice()
                }
            }
        }
    }

    /// Repositions so the next entry is the first at or past `key` in the
    /// iteration direction.
    pub fn seek(&mut self, key: &[u8]) {
        self.cur = Some(key.to_vec());
        self.inclusive = true;
        self.done = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn key2off(key: &[u8]) -> u64 {
        key.iter().fold(0, |acc, &b| (acc << 8) + b as u64)
    }

    fn test_tree(stor: Arc<Stor>, max_node_size: usize) -> Btree {
        // offsets encode their keys, so the extractor can reverse them
        let leaf_key: LeafKeyFn = Arc::new(|_, _, off| {
            let mut key = Vec::new();
            let mut off = off;
            while off > 0 {
                key.insert(0, (off & 0xff) as u8);
                off >>= 8;
            }
            key
        });
        Btree::create(stor, Spec::default(), max_node_size, leaf_key)
    }

    fn check_iter(ov: &Overlay, expect: &BTreeMap<Vec<u8>, u64>) {
        let mut it = ov.iter(true);
        let mut n = 0;
        for (key, off) in expect {
            let (k, o) = it.next().unwrap().expect("iterator ended early");
            assert_eq!(&k, key);
            assert_eq!(o, *off);
            n += 1;
        }
        assert_eq!(it.next().unwrap(), None);
        assert_eq!(n, expect.len());

        let mut it = ov.iter(false);
        for (key, off) in expect.iter().rev() {
            let (k, o) = it.next().unwrap().expect("iterator ended early");
            assert_eq!(&k, key);
            assert_eq!(o, *off);
        }
        assert_eq!(it.next().unwrap(), None);
    }

    #[test]
    fn empty_overlay() {
        let stor = Arc::new(Stor::heap(8192));
        stor.alloc(1);
        let ov = Overlay::new(test_tree(stor, 64)).with_mut();
        assert_eq!(ov.get(b"x").unwrap(), None);
        check_iter(&ov, &BTreeMap::new());
    }

    #[test]
    fn layered_reads_and_iteration() {
        use rand::prelude::*;
        let mut rng = StdRng::seed_from_u64(42);
        let stor = Arc::new(Stor::heap(64 * 1024));
        stor.alloc(1);

        let mut expect: BTreeMap<Vec<u8>, u64> = BTreeMap::new();
        let mut gen_key = |rng: &mut StdRng| -> Vec<u8> {
            let n = rng.gen_range(3..9);
            (0..n).map(|_| rng.gen_range(b'a'..=b'f')).collect()
        };

        // one committed layer and one mutable buffer over an empty base
        let under = Arc::new(InterBuf::new());
        for _ in 0..100 {
            let key = gen_key(&mut rng);
            let off = key2off(&key);
            under.insert(&key, off).unwrap();
            expect.insert(key, off);
        }
        under.freeze();
        let ov = Overlay::new(test_tree(stor, 64))
            .with_committed(under)
            .with_mut();
        for _ in 0..100 {
            let key = gen_key(&mut rng);
            let off = key2off(&key);
            ov.insert(&key, off).unwrap();
            expect.insert(key, off);
        }
        check_iter(&ov, &expect);

        // random deletes through the mutable buffer
        let keys: Vec<Vec<u8>> = expect.keys().cloned().collect();
        for key in keys.iter().take(keys.len() / 2) {
            let off = expect.remove(key).unwrap();
            ov.delete(key, off).unwrap();
        }
        check_iter(&ov, &expect);
        for key in keys.iter().take(keys.len() / 2) {
            assert_eq!(ov.get(key).unwrap(), None, "tombstone must hide {key:?}");
        }
        for (key, off) in &expect {
            assert_eq!(ov.get(key).unwrap(), Some(*off));
        }
    }

    #[test]
    fn merge_folds_layers_into_base() {
        use rand::prelude::*;
        let mut rng = StdRng::seed_from_u64(99);
        let stor = Arc::new(Stor::heap(256 * 1024));
        stor.alloc(1);

        let mut expect: BTreeMap<Vec<u8>, u64> = BTreeMap::new();
        let mut ov = Overlay::new(test_tree(stor, 64));
        for round in 0..3u64 {
            let buf = Arc::new(InterBuf::new());
            for i in 0..300u64 {
                let n = rng.gen_range(3..10);
                let key: Vec<u8> = (0..n).map(|_| rng.gen_range(b'a'..=b'f')).collect();
                let off = 1 + round * 1000 + i;
                if expect.contains_key(&key) {
                    buf.update(&key, off).unwrap();
                } else {
                    buf.insert(&key, off).unwrap();
                }
                expect.insert(key, off);
            }
            ov = ov.with_committed(buf);
            let result = ov.merge(1).unwrap();
            ov = ov.with_merged(result);
            assert_eq!(ov.layers(), 0);
        }
        let ov = ov.with_mut();
        let mut it = ov.iter(true);
        for (key, off) in &expect {
            let (k, o) = it.next().unwrap().expect("merge lost an entry");
            assert_eq!(&k, key);
            assert_eq!(o, *off);
        }
        assert_eq!(it.next().unwrap(), None);
        for (key, off) in &expect {
            assert_eq!(ov.get(key).unwrap(), Some(*off));
        }
    }

    #[test]
    fn update_for_missing_key_merges_as_insert() {
        let stor = Arc::new(Stor::heap(8192));
        stor.alloc(1);
        let buf = Arc::new(InterBuf::new());
        buf.update(b"k", 7).unwrap();
        let ov = Overlay::new(test_tree(stor, 64)).with_committed(buf);
        let merged = ov.with_merged(ov.merge(1).unwrap());
        assert_eq!(merged.base().search(b"k").unwrap(), Some(7));
    }

    #[test]
    fn seek_positions_both_directions() {
        let stor = Arc::new(Stor::heap(8192));
        stor.alloc(1);
        let ov = Overlay::new(test_tree(stor, 64)).with_mut();
        for key in [&b"aa"[..], b"cc", b"ee"] {
            ov.insert(key, key2off(key)).unwrap();
        }
        let mut it = ov.iter(true);
        it.seek(b"bb");
        assert_eq!(it.next().unwrap().unwrap().0, b"cc");
        let mut it = ov.iter(true);
        it.seek(b"cc");
        assert_eq!(it.next().unwrap().unwrap().0, b"cc");
        let mut it = ov.iter(false);
        it.seek(b"dd");
        assert_eq!(it.next().unwrap().unwrap().0, b"cc");
    }
}
