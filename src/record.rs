//! Stored record format.
//!
//! A record is a flat list of raw field values written to Stor as one
//! checksummed chunk:
//!
//! ```text
//! +--------+-----------+----------------+--------------+----------+
//! |size: 3 |nfields: 1 | field len: 2 …  | field bytes … | cksum: 4 |
//! +--------+-----------+----------------+--------------+----------+
//! ```
//!
//! Index keys are derived from records by an `ixkey::Spec`, and the
//! B-tree's leaf-key extractor reads records back through this module.

use crate::cksum;
use crate::errcorrupt;
use crate::error::Result;
use crate::index::ixkey::{RawRecord, Spec};
use crate::stor::io::{Reader, Writer};
use crate::stor::Stor;

/// A record read back from Stor. Field slices borrow store memory.
pub struct Record<'a> {
    data: &'a [u8],
    bounds: Vec<(usize, usize)>,
}

impl RawRecord for Record<'_> {
    fn count(&self) -> usize {
        self.bounds.len()
    }

    fn raw(&self, i: usize) -> &[u8] {
        match self.bounds.get(i) {
            Some(&(lo, hi)) => &self.data[lo..hi],
            None => &[],
        }
    }
}

impl<'a> Record<'a> {
    pub fn fields(&self) -> Vec<Vec<u8>> {
        (0..self.count()).map(|i| self.raw(i).to_vec()).collect()
    }
}

/// The chunk size `write` would use for these fields.
pub fn stor_size(fields: &[impl AsRef<[u8]>]) -> usize {
    3 + 1 + fields.iter().map(|f| 2 + f.as_ref().len()).sum::<usize>() + cksum::LEN
}

/// Appends a record and returns its offset.
pub fn write(stor: &Stor, fields: &[impl AsRef<[u8]>]) -> u64 {
    assert!(fields.len() < 256, "too many record fields");
    let size = stor_size(fields);
    let (off, buf) = stor.alloc(size);
    {
        let mut w = Writer::new(buf);
        w.put3(size).put1(fields.len());
        for f in fields {
            w.put2(f.as_ref().len());
        }
        for f in fields {
            w.put_bytes(f.as_ref());
        }
        debug_assert_eq!(w.len(), size - cksum::LEN);
    }
    cksum::update(buf);
    off
}

/// Reads and verifies the record at `off`.
pub fn read(stor: &Stor, off: u64) -> Result<Record<'_>> {
    let buf = stor.data(off);
    if buf.len() < 3 + 1 + cksum::LEN {
        return Err(errcorrupt!("short record at {off}"));
    }
    let size = Reader::new(buf).get3();
    if size < 3 + 1 + cksum::LEN || size > buf.len() {
        return Err(errcorrupt!("bad record size {size} at {off}"));
    }
    cksum::check(&buf[..size])?;
    let data = &buf[..size - cksum::LEN];
    let mut r = Reader::new(&data[3..]);
    let nfields = r.get1();
    let mut lens = Vec::with_capacity(nfields);
    for _ in 0..nfields {
        lens.push(r.get2());
    }
    let mut at = 3 + 1 + 2 * nfields;
    let mut bounds = Vec::with_capacity(nfields);
    for len in lens {
        if at + len > data.len() {
            return Err(errcorrupt!("record field overruns chunk at {off}"));
        }
        bounds.push((at, at + len));
        at += len;
    }
    Ok(Record { data, bounds })
}

/// The persisted size of the record at `off`.
pub fn size(stor: &Stor, off: u64) -> usize {
    Reader::new(stor.data(off)).get3()
}

/// The standard leaf-key extractor: reads the record a leaf entry points
/// at and rebuilds its index key. Corruption here is fatal, like any
/// other corrupt node read.
pub fn leaf_key(stor: &Stor, spec: &Spec, off: u64) -> Vec<u8> {
    let rec = read(stor, off).expect("corrupt record reached from btree leaf");
    spec.key(&rec)
}
