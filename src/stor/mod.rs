//! Segmented append-mostly byte store.
//!
//! All persistent structures (B-tree nodes, HAMT chunks, records, redirect
//! tables) live in a single `Stor`. Space is handed out by `alloc` in
//! append order and addressed by 40-bit offsets that are never reused.
//! Memory is organized as fixed-size chunks so that previously returned
//! slices stay valid while new chunks are added:
//!
//! ```text
//! +-----------+-----------+-----------+
//! | chunk 0   | chunk 1   | chunk 2   | ...
//! +-----------+-----------+-----------+
//!   ^offset 0   ^offset chunksize
//! ```
//!
//! An allocation never straddles a chunk boundary; when it does not fit in
//! the tail of the current chunk the remainder is skipped. Skipped bytes are
//! never addressed because offsets are only published after a full write.
//!
//! A `Stor` may be backed by a file. The file holds the raw chunk bytes in
//! order; `sync` appends everything allocated since the last sync. Readers
//! are never blocked: they only dereference offsets that were returned by a
//! completed `alloc`, and chunk memory is stable for the life of the store.

pub mod io;

use std::fs::{File, OpenOptions};
use std::io::{Read as _, Seek, SeekFrom, Write as _};
use std::path::Path;
use std::sync::Mutex;

use crate::error::Result;

/// Offsets are 40 bits; offset 0 is reserved as the null offset.
pub const MAX_OFFSET: u64 = 1 << 40;

const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

pub struct Stor {
    chunksize: usize,
    inner: Mutex<Inner>,
    backing: Option<Mutex<Backing>>,
}

struct Inner {
    chunks: Vec<Box<[u8]>>,
    size: u64,
}

struct Backing {
    file: File,
    synced: u64,
}

impl Stor {
    /// An in-memory store, mostly for tests and for scratch indexes.
    pub fn heap(chunksize: usize) -> Stor {
        assert!(chunksize > 0);
        Stor {
            chunksize,
            inner: Mutex::new(Inner {
                chunks: Vec::new(),
                size: 0,
            }),
            backing: None,
        }
    }

    /// Opens (or creates) a file-backed store, loading any existing
    /// contents. The chunk size must match the one the file was written
    /// with; the default is used by `Database`.
    pub fn open(path: impl AsRef<Path>) -> Result<Stor> {
        Stor::open_with(path, DEFAULT_CHUNK_SIZE)
    }

    pub fn open_with(path: impl AsRef<Path>, chunksize: usize) -> Result<Stor> {
        assert!(chunksize > 0);
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;
        let len = file.metadata()?.len();
        let mut chunks = Vec::with_capacity(len.div_ceil(chunksize as u64) as usize);
        file.seek(SeekFrom::Start(0))?;
        let mut remaining = len;
        while remaining > 0 {
            let n = remaining.min(chunksize as u64) as usize;
            let mut chunk = vec![0u8; chunksize].into_boxed_slice();
            file.read_exact(&mut chunk[..n])?;
            chunks.push(chunk);
            remaining -= n as u64;
        }
        Ok(Stor {
            chunksize,
            inner: Mutex::new(Inner { chunks, size: len }),
            backing: Some(Mutex::new(Backing { file, synced: len })),
        })
    }

    /// Allocates `n` bytes and returns the offset along with the slice to
    /// write into. The offset must not be shared with readers until the
    /// write is complete.
    ///
    /// The returned slice aliases store memory. This is sound because chunk
    /// boxes are never moved or freed while the store is alive, allocations
    /// are disjoint, and the single-writer discipline (spec'd for the whole
    /// core) means nobody reads an offset before its alloc call returns.
    #[allow(clippy::mut_from_ref)]
    pub fn alloc(&self, n: usize) -> (u64, &mut [u8]) {
        assert!(
            n > 0 && n <= self.chunksize,
            "stor alloc of {n} bytes exceeds chunk size {}",
            self.chunksize
        );
        let mut inner = self.inner.lock().expect("stor lock poisoned");
        let cs = self.chunksize as u64;
        let capacity = inner.chunks.len() as u64 * cs;
        if inner.size + n as u64 > capacity {
            // skip the unusable tail and start a fresh chunk
            inner.size = capacity;
            inner.chunks.push(vec![0u8; self.chunksize].into_boxed_slice());
        }
        let off = inner.size;
        inner.size += n as u64;
        assert!(inner.size <= MAX_OFFSET, "stor address space exhausted");
        let chunk = (off / cs) as usize;
        let at = (off % cs) as usize;
        let ptr = inner.chunks[chunk][at..at + n].as_mut_ptr();
        drop(inner);
        (off, unsafe { std::slice::from_raw_parts_mut(ptr, n) })
    }

    /// Returns the data at `off`, extending to the end of its chunk.
    /// Chunk-framed readers use the embedded size prefix for the real
    /// extent.
    pub fn data(&self, off: u64) -> &[u8] {
        let inner = self.inner.lock().expect("stor lock poisoned");
        assert!(off < inner.size, "stor data request past end: {off}");
        let cs = self.chunksize as u64;
        let chunk = (off / cs) as usize;
        let at = (off % cs) as usize;
        let end = (inner.size - chunk as u64 * cs).min(cs) as usize;
        let slice = &inner.chunks[chunk][at..end];
        // stable for the life of the store, see alloc
        unsafe { std::slice::from_raw_parts(slice.as_ptr(), slice.len()) }
    }

    /// Current store size, which is also the next offset to be allocated.
    pub fn size(&self) -> u64 {
        self.inner.lock().expect("stor lock poisoned").size
    }

    /// Appends everything allocated since the last sync to the backing
    /// file and flushes it. A no-op for heap stores.
    pub fn sync(&self) -> Result<()> {
        let Some(backing) = &self.backing else {
            return Ok(());
        };
        let inner = self.inner.lock().expect("stor lock poisoned");
        let mut backing = backing.lock().expect("stor file lock poisoned");
        let cs = self.chunksize as u64;
        let synced_start = backing.synced;
        backing.file.seek(SeekFrom::Start(synced_start))?;
        let mut at = backing.synced;
        while at < inner.size {
            let chunk = (at / cs) as usize;
            let lo = (at % cs) as usize;
            let hi = (inner.size - chunk as u64 * cs).min(cs) as usize;
            backing.file.write_all(&inner.chunks[chunk][lo..hi])?;
            at = (chunk as u64 + 1) * cs;
        }
        backing.file.sync_all()?;
        backing.synced = inner.size;
        Ok(())
    }
}

// Readers only dereference published offsets, and chunk memory is stable.
unsafe impl Send for Stor {}
unsafe impl Sync for Stor {}
