//! Soft-updates journal record layouts.
//!
//! Every record is `JREC_SIZE` bytes. A segment starts with a header record
//! followed by `cnt` operation records; the first `u32` of an operation
//! record selects its layout.

use serde::{Deserialize, Serialize};
use suj_types::{
    FragAddr, InodeNumber, JREC_SIZE, JournalSeq, Lbn, ParseError, ensure_slice, i64_to_u64,
    read_le_i64, read_le_u16, read_le_u32, read_le_u64, write_le_i64, write_le_u16, write_le_u32,
    write_le_u64,
};

pub const JOP_ADDREF: u32 = 1;
pub const JOP_REMREF: u32 = 2;
pub const JOP_NEWBLK: u32 = 3;
pub const JOP_FREEBLK: u32 = 4;
pub const JOP_MVREF: u32 = 5;
pub const JOP_TRUNC: u32 = 6;
pub const JOP_SYNC: u32 = 7;

/// Segment header (`struct jsegrec`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentHeader {
    pub seq: JournalSeq,
    /// Oldest sequence number still needed by the kernel when written.
    pub oldest: JournalSeq,
    /// Operation records following the header.
    pub cnt: u16,
    /// Device blocks spanned by the segment.
    pub blocks: u16,
    pub crc: u32,
    /// Mount time of the filesystem that wrote the segment.
    pub time: i64,
}

impl SegmentHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(bytes, 0, JREC_SIZE)?;
        Ok(Self {
            seq: JournalSeq(read_le_u64(bytes, 0)?),
            oldest: JournalSeq(read_le_u64(bytes, 8)?),
            cnt: read_le_u16(bytes, 16)?,
            blocks: read_le_u16(bytes, 18)?,
            crc: read_le_u32(bytes, 20)?,
            time: read_le_i64(bytes, 24)?,
        })
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; JREC_SIZE] {
        let mut out = [0_u8; JREC_SIZE];
        let _ = write_le_u64(&mut out, 0, self.seq.0);
        let _ = write_le_u64(&mut out, 8, self.oldest.0);
        let _ = write_le_u16(&mut out, 16, self.cnt);
        let _ = write_le_u16(&mut out, 18, self.blocks);
        let _ = write_le_u32(&mut out, 20, self.crc);
        let _ = write_le_i64(&mut out, 24, self.time);
        out
    }
}

/// Directory reference record (`struct jrefrec`): a name for `ino` at byte
/// `diroff` of directory `parent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefRecord {
    pub ino: InodeNumber,
    pub parent: InodeNumber,
    /// Link count of `ino` when the record was written.
    pub nlink: u16,
    pub mode: u16,
    pub diroff: u64,
}

impl RefRecord {
    pub fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(bytes, 0, JREC_SIZE)?;
        Ok(Self {
            ino: InodeNumber(read_le_u32(bytes, 4)?),
            parent: InodeNumber(read_le_u32(bytes, 8)?),
            nlink: read_le_u16(bytes, 12)?,
            mode: read_le_u16(bytes, 14)?,
            diroff: i64_to_u64(read_le_i64(bytes, 16)?, "jr_diroff")?,
        })
    }

    #[must_use]
    pub fn to_bytes(&self, op: u32) -> [u8; JREC_SIZE] {
        let mut out = [0_u8; JREC_SIZE];
        let _ = write_le_u32(&mut out, 0, op);
        let _ = write_le_u32(&mut out, 4, self.ino.0);
        let _ = write_le_u32(&mut out, 8, self.parent.0);
        let _ = write_le_u16(&mut out, 12, self.nlink);
        let _ = write_le_u16(&mut out, 14, self.mode);
        let _ = write_le_i64(&mut out, 16, i64::try_from(self.diroff).unwrap_or(i64::MAX));
        out
    }
}

/// Rename record (`struct jmvrec`): the name for `ino` in `parent` moved
/// from `old_off` to `new_off`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveRecord {
    pub ino: InodeNumber,
    pub parent: InodeNumber,
    pub old_off: u64,
    pub new_off: u64,
}

impl MoveRecord {
    pub fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(bytes, 0, JREC_SIZE)?;
        Ok(Self {
            ino: InodeNumber(read_le_u32(bytes, 4)?),
            parent: InodeNumber(read_le_u32(bytes, 8)?),
            old_off: i64_to_u64(read_le_i64(bytes, 16)?, "jm_oldoff")?,
            new_off: i64_to_u64(read_le_i64(bytes, 24)?, "jm_newoff")?,
        })
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; JREC_SIZE] {
        let mut out = [0_u8; JREC_SIZE];
        let _ = write_le_u32(&mut out, 0, JOP_MVREF);
        let _ = write_le_u32(&mut out, 4, self.ino.0);
        let _ = write_le_u32(&mut out, 8, self.parent.0);
        let _ = write_le_i64(&mut out, 16, i64::try_from(self.old_off).unwrap_or(i64::MAX));
        let _ = write_le_i64(&mut out, 24, i64::try_from(self.new_off).unwrap_or(i64::MAX));
        out
    }
}

/// Block record (`struct jblkrec`): `frags` fragments at `blkno` for
/// logical block `lbn` of `ino`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub ino: InodeNumber,
    pub blkno: FragAddr,
    pub lbn: Lbn,
    pub frags: u16,
    pub oldfrags: u16,
}

impl BlockRecord {
    pub fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(bytes, 0, JREC_SIZE)?;
        Ok(Self {
            ino: InodeNumber(read_le_u32(bytes, 4)?),
            blkno: FragAddr(i64_to_u64(read_le_i64(bytes, 8)?, "jb_blkno")?),
            lbn: Lbn(read_le_i64(bytes, 16)?),
            frags: read_le_u16(bytes, 24)?,
            oldfrags: read_le_u16(bytes, 26)?,
        })
    }

    #[must_use]
    pub fn to_bytes(&self, op: u32) -> [u8; JREC_SIZE] {
        let mut out = [0_u8; JREC_SIZE];
        let _ = write_le_u32(&mut out, 0, op);
        let _ = write_le_u32(&mut out, 4, self.ino.0);
        let _ = write_le_i64(&mut out, 8, i64::try_from(self.blkno.0).unwrap_or(i64::MAX));
        let _ = write_le_i64(&mut out, 16, self.lbn.0);
        let _ = write_le_u16(&mut out, 24, self.frags);
        let _ = write_le_u16(&mut out, 26, self.oldfrags);
        out
    }
}

/// Operation code of a record.
pub fn record_op(bytes: &[u8]) -> Result<u32, ParseError> {
    read_le_u32(bytes, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout() {
        let hdr = SegmentHeader {
            seq: JournalSeq(7),
            oldest: JournalSeq(5),
            cnt: 3,
            blocks: 1,
            crc: 0,
            time: 1_700_000_000,
        };
        let bytes = hdr.to_bytes();
        assert_eq!(read_le_u64(&bytes, 0).expect("seq"), 7);
        assert_eq!(read_le_u16(&bytes, 16).expect("cnt"), 3);
        assert_eq!(SegmentHeader::parse(&bytes).expect("parse"), hdr);
    }

    #[test]
    fn ref_record_layout() {
        let rec = RefRecord {
            ino: InodeNumber(20),
            parent: InodeNumber(2),
            nlink: 1,
            mode: 0o100_644,
            diroff: 524,
        };
        let bytes = rec.to_bytes(JOP_REMREF);
        assert_eq!(record_op(&bytes).expect("op"), JOP_REMREF);
        assert_eq!(read_le_i64(&bytes, 16).expect("diroff"), 524);
        assert_eq!(RefRecord::parse(&bytes).expect("parse"), rec);
    }

    #[test]
    fn negative_block_address_is_rejected() {
        let mut bytes = BlockRecord {
            ino: InodeNumber(3),
            blkno: FragAddr(0),
            lbn: Lbn(-12),
            frags: 8,
            oldfrags: 0,
        }
        .to_bytes(JOP_FREEBLK);
        write_le_i64(&mut bytes, 8, -5).expect("poison");
        assert_eq!(
            BlockRecord::parse(&bytes),
            Err(ParseError::IntegerConversion { field: "jb_blkno" })
        );
    }

    #[test]
    fn short_record_is_rejected() {
        assert!(MoveRecord::parse(&[0_u8; 16]).is_err());
    }
}
