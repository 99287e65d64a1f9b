#![forbid(unsafe_code)]
//! On-disk format parsing for UFS2 and its soft-updates journal.
//!
//! Pure parsing crate with no I/O. Parses byte slices into
//! typed structures for the superblock and its summary area, cylinder group
//! blocks, 256-byte dinodes, and journal segment/operation records, and
//! encodes the fields recovery rewrites.

pub mod cg;
pub mod dinode;
pub mod suj;
pub mod ufs2;

pub use cg::CylinderGroup;
pub use dinode::Dinode;
pub use suj::{BlockRecord, MoveRecord, RefRecord, SegmentHeader};
pub use ufs2::{Csum, CsumTotal, Superblock, parse_csum_array, write_csum_array};

/// Metadata check hash as stored on disk.
///
/// UFS stores the CRC-32C register without the final inversion.
#[must_use]
pub fn ufs_ckhash(bytes: &[u8]) -> u32 {
    !crc32c::crc32c(bytes)
}
