//! Chunk checksum trailer.
//!
//! Every persisted chunk ends with a 4-byte CRC32 over the rest of the
//! chunk. A mismatch on read means the store is corrupt; there is no
//! recovery short of reopening the database.

use byteorder::{BigEndian, ByteOrder};
use crc::{Crc, CRC_32_ISCSI};

use crate::errcorrupt;
use crate::error::Result;

pub const LEN: usize = 4;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Computes the checksum of `buf` excluding its trailer and stores it in
/// the trailer.
pub fn update(buf: &mut [u8]) {
    let at = buf.len() - LEN;
    let sum = CRC32.checksum(&buf[..at]);
    BigEndian::write_u32(&mut buf[at..], sum);
}

/// Verifies the trailer of `buf`.
pub fn check(buf: &[u8]) -> Result<()> {
    if buf.len() < LEN {
        return Err(errcorrupt!("chunk shorter than its checksum"));
    }
    let at = buf.len() - LEN;
    let sum = CRC32.checksum(&buf[..at]);
    let stored = BigEndian::read_u32(&buf[at..]);
    if sum != stored {
        return Err(errcorrupt!(
            "checksum mismatch: stored {stored:08x}, computed {sum:08x}"
        ));
    }
    Ok(())
}
