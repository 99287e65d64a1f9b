#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ── Device geometry ─────────────────────────────────────────────────────────

/// Sector size used for all device addressing.
pub const DEV_BSIZE: u64 = 512;
pub const DEV_BSHIFT: u32 = 9;

/// Byte offset of the UFS2 superblock.
pub const SBLOCK_UFS2: u64 = 65_536;
/// Maximum superblock size.
pub const SBLOCKSIZE: usize = 8192;
pub const FS_UFS2_MAGIC: u32 = 0x1954_0119;
pub const CG_MAGIC: u32 = 0x0009_0255;

/// Maximum fragments per block.
pub const MAXFRAG: u32 = 8;

/// Direct block pointers per inode.
pub const UFS_NDADDR: usize = 12;
/// Indirect block pointers per inode.
pub const UFS_NIADDR: usize = 3;
/// Extended-attribute block pointers per inode.
pub const UFS_NXADDR: usize = 2;
/// Size of one on-disk UFS2 inode.
pub const DINODE2_SIZE: usize = 256;
/// Largest link count representable in `di_nlink`.
pub const UFS_LINK_MAX: i64 = 32_767;

/// Directory chunk size; entries never span a chunk boundary.
pub const DIRBLKSIZ: usize = 512;
/// Byte offset of the "." entry within a directory's first chunk.
pub const DOT_OFFSET: u64 = 0;
/// Byte offset of the ".." entry within a directory's first chunk.
pub const DOTDOT_OFFSET: u64 = 12;

// ── Superblock flags and check hashes ───────────────────────────────────────

/// Soft-updates journaling is enabled.
pub const FS_SUJ: u32 = 0x0000_0008;
/// Soft updates are enabled.
pub const FS_DOSOFTDEP: u32 = 0x0000_0002;

pub const CK_SUPERBLOCK: u32 = 0x0001;
pub const CK_CYLGRP: u32 = 0x0002;
pub const CK_INODE: u32 = 0x0004;

// ── Journal ─────────────────────────────────────────────────────────────────

/// Size of every journal record, including segment headers.
pub const JREC_SIZE: usize = 32;
/// Name of the journal file in the root directory.
pub const SUJ_FILE: &[u8] = b".sujournal";
/// Smallest journal the kernel will create.
pub const SUJ_MIN: u64 = 4 * 1024 * 1024;

// ── POSIX file mode constants ────────────────────────────────────────────────

/// File type mask (upper 4 bits of mode).
pub const S_IFMT: u16 = 0o170_000;
/// Named pipe (FIFO).
pub const S_IFIFO: u16 = 0o010_000;
/// Character device.
pub const S_IFCHR: u16 = 0o020_000;
/// Directory.
pub const S_IFDIR: u16 = 0o040_000;
/// Block device.
pub const S_IFBLK: u16 = 0o060_000;
/// Regular file.
pub const S_IFREG: u16 = 0o100_000;
/// Symbolic link.
pub const S_IFLNK: u16 = 0o120_000;
/// Socket.
pub const S_IFSOCK: u16 = 0o140_000;
/// Whiteout.
pub const S_IFWHT: u16 = 0o160_000;

// ── System file flags (di_flags) ────────────────────────────────────────────

pub const SF_IMMUTABLE: u32 = 0x0002_0000;
pub const SF_NOUNLINK: u32 = 0x0010_0000;

/// File type bits of a mode.
#[must_use]
pub fn file_type(mode: u16) -> u16 {
    mode & S_IFMT
}

#[must_use]
pub fn is_dir(mode: u16) -> bool {
    file_type(mode) == S_IFDIR
}

// ── Newtypes ────────────────────────────────────────────────────────────────

/// UFS inode number (32-bit on disk).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNumber(pub u32);

impl InodeNumber {
    /// Whiteout placeholder inode.
    pub const WHITEOUT: Self = Self(1);
    pub const ROOT: Self = Self(2);

    #[must_use]
    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

/// Filesystem address in fragment units.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct FragAddr(pub u64);

impl FragAddr {
    #[must_use]
    pub fn checked_add(self, frags: u64) -> Option<Self> {
        self.0.checked_add(frags).map(Self)
    }

    #[must_use]
    pub fn is_hole(self) -> bool {
        self.0 == 0
    }
}

/// Device address in `DEV_BSIZE` sectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DevAddr(pub u64);

impl DevAddr {
    /// Address of the sector containing `byte_offset` (truncating).
    #[must_use]
    pub fn from_byte_offset(byte_offset: u64) -> Self {
        Self(byte_offset >> DEV_BSHIFT)
    }

    /// Byte offset of this sector, `None` on overflow.
    #[must_use]
    pub fn to_byte_offset(self) -> Option<u64> {
        self.0.checked_mul(DEV_BSIZE)
    }

    #[must_use]
    pub fn checked_add(self, sectors: u64) -> Option<Self> {
        self.0.checked_add(sectors).map(Self)
    }
}

/// File-relative logical block number.
///
/// Non-negative values address data blocks. Values `-1` and `-2` address the
/// extended-attribute blocks. Indirect blocks use `-(first covered lbn) - level`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Lbn(pub i64);

impl Lbn {
    #[must_use]
    pub fn is_data(self) -> bool {
        self.0 >= 0
    }
}

/// Cylinder group index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupNumber(pub u32);

/// Journal segment sequence number.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct JournalSeq(pub u64);

impl JournalSeq {
    #[must_use]
    pub fn next(self) -> Option<Self> {
        self.0.checked_add(1).map(Self)
    }
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for FragAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for DevAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Lbn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for GroupNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for JournalSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Parsing ─────────────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn ensure_slice_mut(data: &mut [u8], offset: usize, len: usize) -> Result<&mut [u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&mut data[offset..end])
}

#[inline]
pub fn read_u8(data: &[u8], offset: usize) -> Result<u8, ParseError> {
    Ok(ensure_slice(data, offset, 1)?[0])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_i32(data: &[u8], offset: usize) -> Result<i32, ParseError> {
    read_le_u32(data, offset).map(|v| i32::from_le_bytes(v.to_le_bytes()))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn read_le_i64(data: &[u8], offset: usize) -> Result<i64, ParseError> {
    read_le_u64(data, offset).map(|v| i64::from_le_bytes(v.to_le_bytes()))
}

#[inline]
pub fn write_u8(data: &mut [u8], offset: usize, value: u8) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 1)?[0] = value;
    Ok(())
}

#[inline]
pub fn write_le_u16(data: &mut [u8], offset: usize, value: u16) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 2)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_u32(data: &mut [u8], offset: usize, value: u32) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 4)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_i32(data: &mut [u8], offset: usize, value: i32) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 4)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_u64(data: &mut [u8], offset: usize, value: u64) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 8)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_i64(data: &mut [u8], offset: usize, value: i64) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 8)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

// ── Arithmetic helpers ──────────────────────────────────────────────────────

/// Round `value` down to a multiple of `alignment` (power of two).
///
/// Returns `None` if `alignment` is zero or not a power of two.
#[must_use]
pub fn align_down(value: u64, alignment: u64) -> Option<u64> {
    if alignment == 0 || !alignment.is_power_of_two() {
        return None;
    }
    Some(value & !(alignment - 1))
}

/// Round `value` up to a multiple of `alignment` (power of two).
///
/// Returns `None` if `alignment` is zero, not a power of two, or on overflow.
#[must_use]
pub fn align_up(value: u64, alignment: u64) -> Option<u64> {
    if alignment == 0 || !alignment.is_power_of_two() {
        return None;
    }
    let mask = alignment - 1;
    value.checked_add(mask).map(|v| v & !mask)
}

/// Number of `unit`-sized pieces needed to hold `value`.
#[must_use]
pub fn howmany(value: u64, unit: u64) -> u64 {
    if unit == 0 {
        return 0;
    }
    value.div_ceil(unit)
}

/// Narrow a `u64` to `usize` with an explicit error path.
pub fn u64_to_usize(value: u64, field: &'static str) -> Result<usize, ParseError> {
    usize::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

/// Reinterpret a signed on-disk value as unsigned, rejecting negatives.
pub fn i64_to_u64(value: i64, field: &'static str) -> Result<u64, ParseError> {
    u64::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_helpers() {
        let bytes = [1_u8, 0, 2, 0, 0, 0, 3, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(read_le_u16(&bytes, 0).expect("u16"), 1);
        assert_eq!(read_le_u32(&bytes, 2).expect("u32"), 2);
        assert_eq!(read_le_u64(&bytes, 6).expect("u64"), 3);
        assert!(read_le_u64(&bytes, 7).is_err());
    }

    #[test]
    fn test_signed_reads() {
        let mut bytes = [0_u8; 12];
        write_le_i64(&mut bytes, 0, -5).expect("write i64");
        write_le_i32(&mut bytes, 8, -7).expect("write i32");
        assert_eq!(read_le_i64(&bytes, 0).expect("i64"), -5);
        assert_eq!(read_le_i32(&bytes, 8).expect("i32"), -7);
    }

    #[test]
    fn test_write_out_of_bounds() {
        let mut bytes = [0_u8; 4];
        let err = write_le_u64(&mut bytes, 0, 1).expect_err("short buffer");
        assert_eq!(
            err,
            ParseError::InsufficientData {
                needed: 8,
                offset: 0,
                actual: 4,
            }
        );
        assert!(write_le_u16(&mut bytes, usize::MAX, 1).is_err());
    }

    #[test]
    fn test_align_helpers() {
        assert_eq!(align_up(33, 32), Some(64));
        assert_eq!(align_up(64, 32), Some(64));
        assert_eq!(align_down(63, 32), Some(32));
        assert_eq!(align_up(1, 3), None);
        assert_eq!(align_down(1, 0), None);
        assert_eq!(align_up(u64::MAX, 512), None);
    }

    #[test]
    fn test_howmany() {
        assert_eq!(howmany(0, 8), 0);
        assert_eq!(howmany(1, 8), 1);
        assert_eq!(howmany(16, 8), 2);
        assert_eq!(howmany(17, 8), 3);
        assert_eq!(howmany(5, 0), 0);
    }

    #[test]
    fn test_dev_addr_conversions() {
        assert_eq!(DevAddr::from_byte_offset(SBLOCK_UFS2), DevAddr(128));
        assert_eq!(DevAddr(128).to_byte_offset(), Some(SBLOCK_UFS2));
        assert_eq!(DevAddr(u64::MAX).to_byte_offset(), None);
    }

    #[test]
    fn test_mode_helpers() {
        assert!(is_dir(S_IFDIR | 0o755));
        assert!(!is_dir(S_IFREG | 0o644));
        assert_eq!(file_type(S_IFLNK | 0o777), S_IFLNK);
    }

    #[test]
    fn test_signed_narrowing() {
        assert_eq!(i64_to_u64(7, "blkno"), Ok(7));
        assert_eq!(
            i64_to_u64(-1, "blkno"),
            Err(ParseError::IntegerConversion { field: "blkno" })
        );
    }

    #[test]
    fn test_inode_constants() {
        assert_eq!(InodeNumber::ROOT.0, 2);
        assert_eq!(InodeNumber::WHITEOUT.0, 1);
        assert!(InodeNumber(0).is_none());
    }

    #[test]
    fn display_newtypes() {
        assert_eq!(Lbn(-12).to_string(), "-12");
        assert_eq!(FragAddr(224).to_string(), "224");
        assert_eq!(JournalSeq(9).next(), Some(JournalSeq(10)));
    }
}
