//! Inter-buffer: the in-memory staging layer for index edits.
//!
//! An inter-buffer is a small sorted map of encoded key to flagged value
//! offset, capturing the inserts, updates, and deletes that have not yet
//! been merged into the base B-tree. Offsets are 40-bit Stor locators;
//! the two high flag bits mark the kind of edit:
//!
//! ```text
//! bit 63: tombstone  (the key exists below this layer and is deleted)
//! bit 62: update     (the key exists below this layer with another offset)
//! neither: insert    (the key is new in this layer)
//! ```
//!
//! Flags are stripped before an offset reaches Stor.
//!
//! Edits to a key already staged in the same buffer combine: deleting a
//! staged insert removes the entry outright, inserting over a staged
//! tombstone becomes an update, updating a staged insert stays an insert
//! with the new offset. This keeps a buffer normalized relative to the
//! layers below it.
//!
//! The container is a lock-free skip list: one writer stages edits while
//! any number of readers iterate a consistent view. Freezing a buffer
//! rejects further writes; frozen buffers stack up in an overlay until a
//! merge folds them into the base tree.

use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam_skiplist::SkipMap;
use itertools::{EitherOrBoth, Itertools};

use crate::error::{Error, Result};

/// Tombstone flag: the key is deleted.
pub const DELETED: u64 = 1 << 63;
/// Update flag: the value offset replaces the one below.
pub const UPDATED: u64 = 1 << 62;
/// Strips the flag bits off a staged offset.
pub const OFFSET_MASK: u64 = UPDATED - 1;

pub struct InterBuf {
    map: SkipMap<Vec<u8>, u64>,
    size: AtomicUsize,
    frozen: AtomicBool,
}

impl Default for InterBuf {
    fn default() -> Self {
        InterBuf::new()
    }
}

impl InterBuf {
    pub fn new() -> InterBuf {
        InterBuf {
            map: SkipMap::new(),
            size: AtomicUsize::new(0),
            frozen: AtomicBool::new(false),
        }
    }

    fn ck_mutable(&self) -> Result<()> {
        if self.frozen.load(Ordering::SeqCst) {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    /// Stages an insert of a key that is new below this layer.
    pub fn insert(&self, key: &[u8], off: u64) -> Result<()> {
        self.ck_mutable()?;
        debug_assert_eq!(off & !OFFSET_MASK, 0);
        let staged = match self.map.get(key).map(|e| *e.value()) {
            // deleted below, reappearing: the layers below still hold the
            // old version, so this is an update of it
            Some(v) if v & DELETED != 0 => off | UPDATED,
            _ => off,
        };
        self.set(key, staged);
        Ok(())
    }

    /// Stages a new value offset for a key that exists below this layer.
    pub fn update(&self, key: &[u8], off: u64) -> Result<()> {
        self.ck_mutable()?;
        debug_assert_eq!(off & !OFFSET_MASK, 0);
        let staged = match self.map.get(key).map(|e| *e.value()) {
            // updating our own staged insert keeps it an insert
            Some(v) if v & (DELETED | UPDATED) == 0 => off,
            _ => off | UPDATED,
        };
        self.set(key, staged);
        Ok(())
    }

    /// Stages a tombstone. `off` is the offset of the doomed version as
    /// this layer saw it.
    pub fn delete(&self, key: &[u8], off: u64) -> Result<()> {
        self.ck_mutable()?;
        debug_assert_eq!(off & !OFFSET_MASK, 0);
        match self.map.get(key).map(|e| *e.value()) {
            // deleting our own staged insert: the layers below never saw
            // the key, so the entry just disappears
            Some(v) if v & (DELETED | UPDATED) == 0 => {
                if let Some(e) = self.map.remove(key) {
                    self.size.fetch_sub(e.key().len(), Ordering::SeqCst);
                }
            }
            _ => self.set(key, off | DELETED),
        }
        Ok(())
    }

    fn set(&self, key: &[u8], staged: u64) {
        if self.map.get(key).is_none() {
            self.size.fetch_add(key.len(), Ordering::SeqCst);
        }
        self.map.insert(key.to_vec(), staged);
    }

    /// The staged offset (with flags) for a key.
    pub fn get(&self, key: &[u8]) -> Option<u64> {
        self.map.get(key).map(|e| *e.value())
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Staged key bytes, used to decide when a merge is due.
    pub fn size(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }

    /// Rejects any further writes.
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::SeqCst);
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }

    /// Ascending iteration over the staged edits, flags included.
    pub fn iter(&self) -> impl Iterator<Item = (Vec<u8>, u64)> + '_ {
        self.map.iter().map(|e| (e.key().clone(), *e.value()))
    }

    /// The neighbor of `after` in the requested direction, or the extreme
    /// entry when `after` is None. `inclusive` admits `after` itself,
    /// which is what a seek wants.
    pub fn step(&self, after: Option<&[u8]>, inclusive: bool, ascending: bool) -> Option<(Vec<u8>, u64)> {
        let entry = match (after, ascending) {
            (None, true) => self.map.front(),
            (None, false) => self.map.back(),
            (Some(k), true) if inclusive => self.map.lower_bound(Bound::Included(k)),
            (Some(k), true) => self.map.lower_bound(Bound::Excluded(k)),
            (Some(k), false) if inclusive => self.map.upper_bound(Bound::Included(k)),
            (Some(k), false) => self.map.upper_bound(Bound::Excluded(k)),
        };
        entry.map(|e| (e.key().clone(), *e.value()))
    }

    /// Combines a newer staged edit over an older one for the same key.
    /// None means the entry disappears entirely.
    pub fn combine(older: u64, newer: u64) -> Option<u64> {
        if newer & DELETED != 0 {
            if older & (DELETED | UPDATED) == 0 {
                None // insert then delete cancel out
            } else {
                Some(newer)
            }
        } else if newer & UPDATED != 0 {
            if older & (DELETED | UPDATED) == 0 {
                Some(newer & !UPDATED) // update of an insert stays an insert
            } else {
                Some(newer)
            }
        } else {
            // a plain insert over a tombstone is an update of the base
            if older & DELETED != 0 {
                Some(newer | UPDATED)
            } else {
                Some(newer)
            }
        }
    }

    /// Folds `newer` over `older` into a fresh frozen buffer.
    pub fn merged(older: &InterBuf, newer: &InterBuf) -> InterBuf {
        let out = InterBuf::new();
        let pairs = older
            .iter()
            .merge_join_by(newer.iter(), |a, b| a.0.cmp(&b.0));
        for pair in pairs {
            match pair {
                EitherOrBoth::Left((k, v)) | EitherOrBoth::Right((k, v)) => out.set(&k, v),
                EitherOrBoth::Both((k, old), (_, new)) => {
                    if let Some(v) = Self::combine(old, new) {
                        out.set(&k, v);
                    }
                }
            }
        }
        out.freeze();
        out
    }
}
