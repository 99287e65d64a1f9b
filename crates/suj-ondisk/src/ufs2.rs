//! UFS2 superblock and per-group summary records.

use serde::{Deserialize, Serialize};
use suj_types::{
    DEV_BSIZE, DINODE2_SIZE, DevAddr, FS_UFS2_MAGIC, FragAddr, GroupNumber, InodeNumber, Lbn,
    MAXFRAG, ParseError, SBLOCKSIZE, UFS_NDADDR, ensure_slice, read_le_i32, read_le_i64,
    read_le_u32, read_u8, write_le_i32, write_le_i64, write_le_u32, write_u8,
};

use crate::ufs_ckhash;

const FS_SBLKNO: usize = 8;
const FS_CBLKNO: usize = 12;
const FS_IBLKNO: usize = 16;
const FS_DBLKNO: usize = 20;
const FS_NCG: usize = 44;
const FS_BSIZE: usize = 48;
const FS_FSIZE: usize = 52;
const FS_FRAG: usize = 56;
const FS_BSHIFT: usize = 80;
const FS_FSHIFT: usize = 84;
const FS_FRAGSHIFT: usize = 96;
const FS_FSBTODB: usize = 100;
const FS_SBSIZE: usize = 104;
const FS_NINDIR: usize = 116;
const FS_INOPB: usize = 120;
const FS_CSSIZE: usize = 156;
const FS_CGSIZE: usize = 160;
const FS_IPG: usize = 184;
const FS_FPG: usize = 188;
const FS_CLEAN: usize = 209;
const FS_CSTOTAL: usize = 1008;
const FS_TIME: usize = 1072;
const FS_SIZE: usize = 1080;
const FS_DSIZE: usize = 1088;
const FS_CSADDR: usize = 1096;
const FS_PENDINGBLOCKS: usize = 1104;
const FS_PENDINGINODES: usize = 1112;
const FS_MTIME: usize = 1208;
const FS_SUJFREE: usize = 1216;
const FS_CKHASH: usize = 1304;
const FS_METACKHASH: usize = 1308;
const FS_FLAGS: usize = 1312;
const FS_CONTIGSUMSIZE: usize = 1316;
const FS_MAXSYMLINKLEN: usize = 1320;
const FS_MAGIC: usize = 1372;

/// Size of one `struct csum` record in the summary area.
pub const CSUM_SIZE: usize = 16;

/// Per-group summary counters (`struct csum`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Csum {
    pub ndir: i32,
    pub nbfree: i32,
    pub nifree: i32,
    pub nffree: i32,
}

impl Csum {
    pub fn parse(bytes: &[u8], offset: usize) -> Result<Self, ParseError> {
        Ok(Self {
            ndir: read_le_i32(bytes, offset)?,
            nbfree: read_le_i32(bytes, offset + 4)?,
            nifree: read_le_i32(bytes, offset + 8)?,
            nffree: read_le_i32(bytes, offset + 12)?,
        })
    }

    pub fn write(&self, bytes: &mut [u8], offset: usize) -> Result<(), ParseError> {
        write_le_i32(bytes, offset, self.ndir)?;
        write_le_i32(bytes, offset + 4, self.nbfree)?;
        write_le_i32(bytes, offset + 8, self.nifree)?;
        write_le_i32(bytes, offset + 12, self.nffree)
    }
}

/// Filesystem-wide summary counters (`struct csum_total`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsumTotal {
    pub ndir: i64,
    pub nbfree: i64,
    pub nifree: i64,
    pub nffree: i64,
    pub numclusters: i64,
}

impl CsumTotal {
    fn parse(bytes: &[u8], offset: usize) -> Result<Self, ParseError> {
        Ok(Self {
            ndir: read_le_i64(bytes, offset)?,
            nbfree: read_le_i64(bytes, offset + 8)?,
            nifree: read_le_i64(bytes, offset + 16)?,
            nffree: read_le_i64(bytes, offset + 24)?,
            numclusters: read_le_i64(bytes, offset + 32)?,
        })
    }

    fn write(&self, bytes: &mut [u8], offset: usize) -> Result<(), ParseError> {
        write_le_i64(bytes, offset, self.ndir)?;
        write_le_i64(bytes, offset + 8, self.nbfree)?;
        write_le_i64(bytes, offset + 16, self.nifree)?;
        write_le_i64(bytes, offset + 24, self.nffree)?;
        write_le_i64(bytes, offset + 32, self.numclusters)
    }

    /// Sum of the per-group records.
    #[must_use]
    pub fn from_groups(groups: &[Csum]) -> Self {
        groups.iter().fold(Self::default(), |mut acc, cs| {
            acc.ndir += i64::from(cs.ndir);
            acc.nbfree += i64::from(cs.nbfree);
            acc.nifree += i64::from(cs.nifree);
            acc.nffree += i64::from(cs.nffree);
            acc
        })
    }
}

/// Parse `ncg` summary records from the bytes at `fs_csaddr`.
pub fn parse_csum_array(bytes: &[u8], ncg: u32) -> Result<Vec<Csum>, ParseError> {
    (0..ncg as usize)
        .map(|cg| Csum::parse(bytes, cg * CSUM_SIZE))
        .collect()
}

/// Write summary records back into the buffer read from `fs_csaddr`.
pub fn write_csum_array(bytes: &mut [u8], groups: &[Csum]) -> Result<(), ParseError> {
    for (cg, cs) in groups.iter().enumerate() {
        cs.write(bytes, cg * CSUM_SIZE)?;
    }
    Ok(())
}

fn read_pos(bytes: &[u8], offset: usize, field: &'static str) -> Result<u32, ParseError> {
    let value = read_le_i32(bytes, offset)?;
    u32::try_from(value).map_err(|_| ParseError::InvalidField {
        field,
        reason: "must be non-negative",
    })
}

fn log2_exact(value: u32, field: &'static str) -> Result<u32, ParseError> {
    if value == 0 || !value.is_power_of_two() {
        return Err(ParseError::InvalidField {
            field,
            reason: "must be a power of two",
        });
    }
    Ok(value.trailing_zeros())
}

/// Parsed UFS2 superblock.
///
/// The raw bytes are retained so that writing the superblock back only
/// changes the fields recovery maintains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    pub sblkno: u32,
    pub cblkno: u32,
    pub iblkno: u32,
    pub dblkno: u32,
    pub ncg: u32,
    pub bsize: u32,
    pub fsize: u32,
    pub frag: u32,
    pub bshift: u32,
    pub fshift: u32,
    pub fragshift: u32,
    pub fsbtodb: u32,
    pub sbsize: u32,
    pub nindir: u32,
    pub inopb: u32,
    pub cssize: u32,
    pub cgsize: u32,
    pub ipg: u32,
    pub fpg: u32,
    pub clean: bool,
    pub cstotal: CsumTotal,
    pub time: i64,
    pub size: u64,
    pub dsize: u64,
    pub csaddr: u64,
    pub pendingblocks: i64,
    pub pendinginodes: u32,
    pub mtime: i64,
    pub sujfree: u32,
    pub ckhash: u32,
    pub metackhash: u32,
    pub flags: u32,
    pub contigsumsize: u32,
    pub maxsymlinklen: u32,
    raw: Vec<u8>,
}

impl Superblock {
    /// Parse and validate a superblock read from `SBLOCK_UFS2`.
    ///
    /// `bytes` must hold at least `fs_sbsize` bytes; extra bytes are ignored.
    pub fn parse(bytes: &[u8]) -> Result<Self, ParseError> {
        let magic = read_le_u32(bytes, FS_MAGIC)?;
        if magic != FS_UFS2_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(FS_UFS2_MAGIC),
                actual: u64::from(magic),
            });
        }

        let sbsize = read_pos(bytes, FS_SBSIZE, "fs_sbsize")?;
        if sbsize as usize > SBLOCKSIZE || (sbsize as usize) < FS_MAGIC + 4 {
            return Err(ParseError::InvalidField {
                field: "fs_sbsize",
                reason: "out of range",
            });
        }
        let raw = ensure_slice(bytes, 0, sbsize as usize)?.to_vec();

        let sb = Self {
            sblkno: read_pos(&raw, FS_SBLKNO, "fs_sblkno")?,
            cblkno: read_pos(&raw, FS_CBLKNO, "fs_cblkno")?,
            iblkno: read_pos(&raw, FS_IBLKNO, "fs_iblkno")?,
            dblkno: read_pos(&raw, FS_DBLKNO, "fs_dblkno")?,
            ncg: read_le_u32(&raw, FS_NCG)?,
            bsize: read_pos(&raw, FS_BSIZE, "fs_bsize")?,
            fsize: read_pos(&raw, FS_FSIZE, "fs_fsize")?,
            frag: read_pos(&raw, FS_FRAG, "fs_frag")?,
            bshift: read_pos(&raw, FS_BSHIFT, "fs_bshift")?,
            fshift: read_pos(&raw, FS_FSHIFT, "fs_fshift")?,
            fragshift: read_pos(&raw, FS_FRAGSHIFT, "fs_fragshift")?,
            fsbtodb: read_pos(&raw, FS_FSBTODB, "fs_fsbtodb")?,
            sbsize,
            nindir: read_pos(&raw, FS_NINDIR, "fs_nindir")?,
            inopb: read_le_u32(&raw, FS_INOPB)?,
            cssize: read_pos(&raw, FS_CSSIZE, "fs_cssize")?,
            cgsize: read_pos(&raw, FS_CGSIZE, "fs_cgsize")?,
            ipg: read_le_u32(&raw, FS_IPG)?,
            fpg: read_pos(&raw, FS_FPG, "fs_fpg")?,
            clean: read_u8(&raw, FS_CLEAN)? != 0,
            cstotal: CsumTotal::parse(&raw, FS_CSTOTAL)?,
            time: read_le_i64(&raw, FS_TIME)?,
            size: nonneg_i64(&raw, FS_SIZE, "fs_size")?,
            dsize: nonneg_i64(&raw, FS_DSIZE, "fs_dsize")?,
            csaddr: nonneg_i64(&raw, FS_CSADDR, "fs_csaddr")?,
            pendingblocks: read_le_i64(&raw, FS_PENDINGBLOCKS)?,
            pendinginodes: read_le_u32(&raw, FS_PENDINGINODES)?,
            mtime: read_le_i64(&raw, FS_MTIME)?,
            sujfree: read_le_u32(&raw, FS_SUJFREE)?,
            ckhash: read_le_u32(&raw, FS_CKHASH)?,
            metackhash: read_le_u32(&raw, FS_METACKHASH)?,
            flags: read_le_u32(&raw, FS_FLAGS)?,
            contigsumsize: read_pos(&raw, FS_CONTIGSUMSIZE, "fs_contigsumsize")?,
            maxsymlinklen: read_pos(&raw, FS_MAXSYMLINKLEN, "fs_maxsymlinklen")?,
            raw,
        };
        sb.validate()?;
        Ok(sb)
    }

    fn validate(&self) -> Result<(), ParseError> {
        let invalid = |field, reason| Err(ParseError::InvalidField { field, reason });

        if log2_exact(self.bsize, "fs_bsize")? != self.bshift {
            return invalid("fs_bshift", "does not match fs_bsize");
        }
        if !(4096..=65_536).contains(&self.bsize) {
            return invalid("fs_bsize", "must be in 4096..=65536");
        }
        if log2_exact(self.fsize, "fs_fsize")? != self.fshift {
            return invalid("fs_fshift", "does not match fs_fsize");
        }
        if u64::from(self.fsize) < DEV_BSIZE {
            return invalid("fs_fsize", "smaller than a sector");
        }
        if self.frag == 0 || self.frag > MAXFRAG || log2_exact(self.frag, "fs_frag")? != self.fragshift
        {
            return invalid("fs_frag", "must be 1, 2, 4 or 8 and match fs_fragshift");
        }
        if self.fsize.checked_mul(self.frag) != Some(self.bsize) {
            return invalid("fs_frag", "fs_bsize != fs_fsize * fs_frag");
        }
        if 1_u64
            .checked_shl(self.fsbtodb)
            .and_then(|n| n.checked_mul(DEV_BSIZE))
            != Some(u64::from(self.fsize)) {
            return invalid("fs_fsbtodb", "does not match fs_fsize");
        }
        if self.ncg == 0 || self.ipg == 0 || self.fpg == 0 {
            return invalid("fs_ncg", "group counts must be non-zero");
        }
        if self.fpg % self.frag != 0 {
            return invalid("fs_fpg", "not a whole number of blocks");
        }
        if self.inopb as usize != self.bsize as usize / DINODE2_SIZE {
            return invalid("fs_inopb", "does not match fs_bsize");
        }
        if self.nindir != self.bsize / 8 {
            return invalid("fs_nindir", "does not match fs_bsize");
        }
        if self.cgsize == 0 || self.cgsize > self.bsize {
            return invalid("fs_cgsize", "must fit in one block");
        }
        if self.iblkno <= self.cblkno || self.dblkno <= self.iblkno || self.dblkno >= self.fpg {
            return invalid("fs_dblkno", "group layout out of order");
        }
        if (self.cssize as usize) < self.ncg as usize * CSUM_SIZE {
            return invalid("fs_cssize", "too small for fs_ncg");
        }
        Ok(())
    }

    /// Encode the maintained fields back over the original bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ParseError> {
        let mut raw = self.raw.clone();
        write_u8(&mut raw, FS_CLEAN, u8::from(self.clean))?;
        self.cstotal.write(&mut raw, FS_CSTOTAL)?;
        write_le_i64(&mut raw, FS_TIME, self.time)?;
        write_le_i64(&mut raw, FS_PENDINGBLOCKS, self.pendingblocks)?;
        write_le_u32(&mut raw, FS_PENDINGINODES, self.pendinginodes)?;
        write_le_i64(&mut raw, FS_MTIME, self.mtime)?;
        write_le_u32(&mut raw, FS_SUJFREE, self.sujfree)?;
        write_le_u32(&mut raw, FS_FLAGS, self.flags)?;
        if self.metackhash & suj_types::CK_SUPERBLOCK != 0 {
            write_le_u32(&mut raw, FS_CKHASH, 0)?;
            let hash = ufs_ckhash(&raw);
            write_le_u32(&mut raw, FS_CKHASH, hash)?;
        }
        Ok(raw)
    }

    #[must_use]
    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags & flag != 0
    }

    #[must_use]
    pub fn ckhash_enabled(&self, kind: u32) -> bool {
        self.metackhash & kind != 0
    }

    // ── Geometry ────────────────────────────────────────────────────────────

    /// First fragment of cylinder group `cg`.
    #[must_use]
    pub fn cgbase(&self, cg: GroupNumber) -> FragAddr {
        FragAddr(u64::from(self.fpg) * u64::from(cg.0))
    }

    /// Address of the cylinder group block.
    #[must_use]
    pub fn cgtod(&self, cg: GroupNumber) -> FragAddr {
        FragAddr(self.cgbase(cg).0 + u64::from(self.cblkno))
    }

    /// First fragment of the group's inode table.
    #[must_use]
    pub fn cgimin(&self, cg: GroupNumber) -> FragAddr {
        FragAddr(self.cgbase(cg).0 + u64::from(self.iblkno))
    }

    #[must_use]
    pub fn dtog(&self, addr: FragAddr) -> GroupNumber {
        #[allow(clippy::cast_possible_truncation)] // bounded by fs_ncg
        GroupNumber((addr.0 / u64::from(self.fpg)) as u32)
    }

    /// Fragment offset within its cylinder group.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // remainder of fs_fpg
    pub fn dtogd(&self, addr: FragAddr) -> u32 {
        (addr.0 % u64::from(self.fpg)) as u32
    }

    #[must_use]
    pub fn ino_to_cg(&self, ino: InodeNumber) -> GroupNumber {
        GroupNumber(ino.0 / self.ipg)
    }

    /// Index of the inode within its group's bitmap.
    #[must_use]
    pub fn ino_index(&self, ino: InodeNumber) -> u32 {
        ino.0 % self.ipg
    }

    /// Fragment address of the block holding `ino`.
    #[must_use]
    pub fn ino_to_fsba(&self, ino: InodeNumber) -> FragAddr {
        let cg = self.ino_to_cg(ino);
        let block = u64::from(self.ino_index(ino) / self.inopb);
        FragAddr(self.cgimin(cg).0 + self.blkstofrags(block))
    }

    /// Slot of `ino` within its inode block.
    #[must_use]
    pub fn ino_to_fsbo(&self, ino: InodeNumber) -> usize {
        (ino.0 % self.inopb) as usize
    }

    #[must_use]
    pub fn maxino(&self) -> u64 {
        u64::from(self.ncg) * u64::from(self.ipg)
    }

    /// Sector address of a fragment address.
    #[must_use]
    pub fn fsbtodb(&self, addr: FragAddr) -> DevAddr {
        DevAddr(addr.0 << self.fsbtodb)
    }

    /// Sectors occupied by `frags` fragments.
    #[must_use]
    pub fn frags_to_sectors(&self, frags: u64) -> u64 {
        frags << self.fsbtodb
    }

    #[must_use]
    pub fn blkstofrags(&self, blocks: u64) -> u64 {
        blocks << self.fragshift
    }

    /// Block-aligned address containing `addr`.
    #[must_use]
    pub fn blknum(&self, addr: FragAddr) -> FragAddr {
        FragAddr(addr.0 & !u64::from(self.frag - 1))
    }

    /// Fragment offset of `addr` within its block.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // < fs_frag
    pub fn fragnum(&self, addr: FragAddr) -> u32 {
        (addr.0 & u64::from(self.frag - 1)) as u32
    }

    /// Whole fragments in `bytes` (truncating).
    #[must_use]
    pub fn numfrags(&self, bytes: u64) -> u64 {
        bytes >> self.fshift
    }

    #[must_use]
    pub fn fragroundup(&self, bytes: u64) -> u64 {
        let mask = u64::from(self.fsize) - 1;
        (bytes + mask) & !mask
    }

    /// Byte offset within a block.
    #[must_use]
    pub fn blkoff(&self, bytes: u64) -> u64 {
        bytes & (u64::from(self.bsize) - 1)
    }

    /// Logical block containing byte `bytes`.
    #[must_use]
    pub fn lblkno(&self, bytes: u64) -> u64 {
        bytes >> self.bshift
    }

    /// Byte offset of logical block `lbn`.
    #[must_use]
    pub fn lblktosize(&self, lbn: u64) -> u64 {
        lbn << self.bshift
    }

    /// Bytes allocated to data block `lbn` of a file of `size` bytes.
    ///
    /// Only the last direct block can be a fragment run; every other block,
    /// including every block past `UFS_NDADDR`, is a full block.
    #[must_use]
    pub fn sblksize(&self, size: u64, lbn: Lbn) -> u64 {
        let bsize = u64::from(self.bsize);
        let Ok(index) = u64::try_from(lbn.0) else {
            return bsize;
        };
        if index >= UFS_NDADDR as u64 || size >= (index + 1) * bsize {
            bsize
        } else {
            self.fragroundup(self.blkoff(size))
        }
    }

    /// Bytes of the summary area, rounded to whole fragments.
    #[must_use]
    pub fn cssize_rounded(&self) -> u64 {
        self.fragroundup(u64::from(self.cssize))
    }
}

fn nonneg_i64(bytes: &[u8], offset: usize, field: &'static str) -> Result<u64, ParseError> {
    let value = read_le_i64(bytes, offset)?;
    u64::try_from(value).map_err(|_| ParseError::InvalidField {
        field,
        reason: "must be non-negative",
    })
}

/// Field offsets used by image builders.
pub mod layout {
    pub const FS_SBLKNO: usize = super::FS_SBLKNO;
    pub const FS_CBLKNO: usize = super::FS_CBLKNO;
    pub const FS_IBLKNO: usize = super::FS_IBLKNO;
    pub const FS_DBLKNO: usize = super::FS_DBLKNO;
    pub const FS_NCG: usize = super::FS_NCG;
    pub const FS_BSIZE: usize = super::FS_BSIZE;
    pub const FS_FSIZE: usize = super::FS_FSIZE;
    pub const FS_FRAG: usize = super::FS_FRAG;
    pub const FS_BSHIFT: usize = super::FS_BSHIFT;
    pub const FS_FSHIFT: usize = super::FS_FSHIFT;
    pub const FS_FRAGSHIFT: usize = super::FS_FRAGSHIFT;
    pub const FS_FSBTODB: usize = super::FS_FSBTODB;
    pub const FS_SBSIZE: usize = super::FS_SBSIZE;
    pub const FS_NINDIR: usize = super::FS_NINDIR;
    pub const FS_INOPB: usize = super::FS_INOPB;
    pub const FS_CSSIZE: usize = super::FS_CSSIZE;
    pub const FS_CGSIZE: usize = super::FS_CGSIZE;
    pub const FS_IPG: usize = super::FS_IPG;
    pub const FS_FPG: usize = super::FS_FPG;
    pub const FS_CLEAN: usize = super::FS_CLEAN;
    pub const FS_SIZE: usize = super::FS_SIZE;
    pub const FS_DSIZE: usize = super::FS_DSIZE;
    pub const FS_CSADDR: usize = super::FS_CSADDR;
    pub const FS_MTIME: usize = super::FS_MTIME;
    pub const FS_TIME: usize = super::FS_TIME;
    pub const FS_SUJFREE: usize = super::FS_SUJFREE;
    pub const FS_METACKHASH: usize = super::FS_METACKHASH;
    pub const FS_FLAGS: usize = super::FS_FLAGS;
    pub const FS_CONTIGSUMSIZE: usize = super::FS_CONTIGSUMSIZE;
    pub const FS_MAXSYMLINKLEN: usize = super::FS_MAXSYMLINKLEN;
    pub const FS_MAGIC: usize = super::FS_MAGIC;
}
