//! Bounded big-endian integer readers and writers.
//!
//! Persisted structures use fixed 1 to 5 byte big-endian integers (offsets
//! are 40 bits, chunk sizes 24 bits) and length-prefixed strings. Writers
//! fill a slice handed out by `Stor::alloc`; readers walk a published
//! chunk. Overrunning either is a programming error, not corruption:
//! chunks are checksum-verified before parsing.

use byteorder::{BigEndian, ByteOrder};

pub struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    pub fn new(buf: &'a mut [u8]) -> Writer<'a> {
        Writer { buf, pos: 0 }
    }

    fn put(&mut self, val: u64, n: usize) -> &mut Self {
        BigEndian::write_uint(&mut self.buf[self.pos..self.pos + n], val, n);
        self.pos += n;
        self
    }

    pub fn put1(&mut self, val: usize) -> &mut Self {
        debug_assert!(val < 1 << 8);
        self.put(val as u64, 1)
    }

    pub fn put2(&mut self, val: usize) -> &mut Self {
        debug_assert!(val < 1 << 16);
        self.put(val as u64, 2)
    }

    pub fn put3(&mut self, val: usize) -> &mut Self {
        debug_assert!(val < 1 << 24);
        self.put(val as u64, 3)
    }

    pub fn put4(&mut self, val: usize) -> &mut Self {
        debug_assert!(val < 1 << 32);
        self.put(val as u64, 4)
    }

    pub fn put5(&mut self, val: u64) -> &mut Self {
        debug_assert!(val < 1 << 40);
        self.put(val, 5)
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
        self
    }

    /// A string with a 2-byte length prefix.
    pub fn put_str(&mut self, s: &str) -> &mut Self {
        self.put2(s.len());
        self.put_bytes(s.as_bytes())
    }

    pub fn len(&self) -> usize {
        self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos == 0
    }
}

/// The persisted size of a string written by `put_str`.
pub fn str_size(s: &str) -> usize {
    2 + s.len()
}

pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Reader<'a> {
        Reader { buf, pos: 0 }
    }

    fn get(&mut self, n: usize) -> u64 {
        let val = BigEndian::read_uint(&self.buf[self.pos..self.pos + n], n);
        self.pos += n;
        val
    }

    pub fn get1(&mut self) -> usize {
        self.get(1) as usize
    }

    pub fn get2(&mut self) -> usize {
        self.get(2) as usize
    }

    pub fn get3(&mut self) -> usize {
        self.get(3) as usize
    }

    pub fn get4(&mut self) -> usize {
        self.get(4) as usize
    }

    pub fn get5(&mut self) -> u64 {
        self.get(5)
    }

    pub fn get_bytes(&mut self, n: usize) -> &'a [u8] {
        let bytes = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        bytes
    }

    pub fn get_str(&mut self) -> String {
        let n = self.get2();
        String::from_utf8_lossy(self.get_bytes(n)).into_owned()
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}
