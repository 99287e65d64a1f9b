//! Cylinder group block.

use suj_types::{
    CG_MAGIC, GroupNumber, MAXFRAG, ParseError, ensure_slice, ensure_slice_mut, howmany,
    read_le_u32, write_le_u32,
};

use crate::ufs2::{Csum, Superblock};
use crate::ufs_ckhash;

const CG_MAGIC_OFF: usize = 4;
const CG_CGX: usize = 12;
const CG_NDBLK: usize = 20;
const CG_CS: usize = 24;
const CG_IROTOR: usize = 48;
const CG_FRSUM: usize = 52;
const CG_IUSEDOFF: usize = 92;
const CG_FREEOFF: usize = 96;
const CG_NEXTFREEOFF: usize = 100;
const CG_CLUSTERSUMOFF: usize = 104;
const CG_CLUSTEROFF: usize = 108;
const CG_NCLUSTERBLKS: usize = 112;
const CG_NIBLK: usize = 116;
const CG_INITEDIBLK: usize = 120;
const CG_CKHASH: usize = 132;

/// Fixed header size; the bitmaps follow it.
pub const CG_HEADER_SIZE: usize = 168;

/// One cylinder group block, owned as raw bytes.
///
/// Accessors read and write in place so that fields recovery does not
/// interpret survive writeback unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CylinderGroup {
    buf: Vec<u8>,
}

impl CylinderGroup {
    /// Wrap a group block read from disk, checking its magic and index.
    pub fn parse(buf: Vec<u8>, expected: GroupNumber) -> Result<Self, ParseError> {
        let magic = read_le_u32(&buf, CG_MAGIC_OFF)?;
        if magic != CG_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(CG_MAGIC),
                actual: u64::from(magic),
            });
        }
        if read_le_u32(&buf, CG_CGX)? != expected.0 {
            return Err(ParseError::InvalidField {
                field: "cg_cgx",
                reason: "does not match group index",
            });
        }
        let cg = Self { buf };
        if cg.ndblk()? == 0 {
            return Err(ParseError::InvalidField {
                field: "cg_ndblk",
                reason: "must be non-zero",
            });
        }
        Ok(cg)
    }

    /// Initialize an empty group block with the standard bitmap layout.
    ///
    /// Every inode is marked free and every fragment allocated; the caller
    /// frees the data area.
    pub fn format(sb: &Superblock, cgx: GroupNumber, ndblk: u32) -> Result<Self, ParseError> {
        let mut buf = vec![0_u8; sb.cgsize as usize];
        let iusedoff = CG_HEADER_SIZE as u32;
        let freeoff = iusedoff + howmany(u64::from(sb.ipg), 8) as u32;
        let nextfreeoff = freeoff + howmany(u64::from(sb.fpg), 8) as u32;
        let (clustersumoff, clusteroff, nclusterblks, end) = if sb.contigsumsize > 0 {
            let sumoff = nextfreeoff.next_multiple_of(4);
            let cluoff = sumoff + 4 * (sb.contigsumsize + 1);
            let nblks = sb.fpg / sb.frag;
            (sumoff, cluoff, nblks, cluoff + howmany(u64::from(nblks), 8) as u32)
        } else {
            (0, 0, 0, nextfreeoff)
        };
        if end as usize > buf.len() {
            return Err(ParseError::InvalidField {
                field: "fs_cgsize",
                reason: "too small for group bitmaps",
            });
        }
        write_le_u32(&mut buf, CG_MAGIC_OFF, CG_MAGIC)?;
        write_le_u32(&mut buf, CG_CGX, cgx.0)?;
        write_le_u32(&mut buf, CG_NDBLK, ndblk)?;
        write_le_u32(&mut buf, CG_IUSEDOFF, iusedoff)?;
        write_le_u32(&mut buf, CG_FREEOFF, freeoff)?;
        write_le_u32(&mut buf, CG_NEXTFREEOFF, nextfreeoff)?;
        write_le_u32(&mut buf, CG_CLUSTERSUMOFF, clustersumoff)?;
        write_le_u32(&mut buf, CG_CLUSTEROFF, clusteroff)?;
        write_le_u32(&mut buf, CG_NCLUSTERBLKS, nclusterblks)?;
        write_le_u32(&mut buf, CG_NIBLK, sb.ipg)?;
        write_le_u32(&mut buf, CG_INITEDIBLK, sb.ipg)?;
        Ok(Self { buf })
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn cgx(&self) -> Result<u32, ParseError> {
        read_le_u32(&self.buf, CG_CGX)
    }

    /// Fragments in this group (the last group may be short).
    pub fn ndblk(&self) -> Result<u32, ParseError> {
        read_le_u32(&self.buf, CG_NDBLK)
    }

    pub fn cs(&self) -> Result<Csum, ParseError> {
        Csum::parse(&self.buf, CG_CS)
    }

    pub fn set_cs(&mut self, cs: &Csum) -> Result<(), ParseError> {
        cs.write(&mut self.buf, CG_CS)
    }

    pub fn irotor(&self) -> Result<u32, ParseError> {
        read_le_u32(&self.buf, CG_IROTOR)
    }

    pub fn set_irotor(&mut self, value: u32) -> Result<(), ParseError> {
        write_le_u32(&mut self.buf, CG_IROTOR, value)
    }

    pub fn frsum(&self) -> Result<[u32; MAXFRAG as usize], ParseError> {
        let mut out = [0_u32; MAXFRAG as usize];
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = read_le_u32(&self.buf, CG_FRSUM + 4 * i)?;
        }
        Ok(out)
    }

    pub fn set_frsum(&mut self, frsum: &[u32; MAXFRAG as usize]) -> Result<(), ParseError> {
        for (i, value) in frsum.iter().enumerate() {
            write_le_u32(&mut self.buf, CG_FRSUM + 4 * i, *value)?;
        }
        Ok(())
    }

    fn region(&self, off_field: usize, len: u64) -> Result<(usize, usize), ParseError> {
        let off = read_le_u32(&self.buf, off_field)? as usize;
        let len = usize::try_from(len).map_err(|_| ParseError::IntegerConversion {
            field: "cg bitmap length",
        })?;
        ensure_slice(&self.buf, off, len)?;
        Ok((off, len))
    }

    /// Inode allocation bitmap (`cg_inosused`); a set bit is in use.
    pub fn inosused(&self, sb: &Superblock) -> Result<&[u8], ParseError> {
        let (off, len) = self.region(CG_IUSEDOFF, howmany(u64::from(sb.ipg), 8))?;
        ensure_slice(&self.buf, off, len)
    }

    pub fn inosused_mut(&mut self, sb: &Superblock) -> Result<&mut [u8], ParseError> {
        let (off, len) = self.region(CG_IUSEDOFF, howmany(u64::from(sb.ipg), 8))?;
        ensure_slice_mut(&mut self.buf, off, len)
    }

    /// Fragment free bitmap (`cg_blksfree`); a set bit is free.
    pub fn blksfree(&self, sb: &Superblock) -> Result<&[u8], ParseError> {
        let (off, len) = self.region(CG_FREEOFF, howmany(u64::from(sb.fpg), 8))?;
        ensure_slice(&self.buf, off, len)
    }

    pub fn blksfree_mut(&mut self, sb: &Superblock) -> Result<&mut [u8], ParseError> {
        let (off, len) = self.region(CG_FREEOFF, howmany(u64::from(sb.fpg), 8))?;
        ensure_slice_mut(&mut self.buf, off, len)
    }

    pub fn nclusterblks(&self) -> Result<u32, ParseError> {
        read_le_u32(&self.buf, CG_NCLUSTERBLKS)
    }

    /// Cluster summary counts, `fs_contigsumsize + 1` entries.
    ///
    /// Returns `None` when the filesystem keeps no cluster summary.
    pub fn clustersum(&self, sb: &Superblock) -> Result<Option<Vec<u32>>, ParseError> {
        if sb.contigsumsize == 0 {
            return Ok(None);
        }
        let entries = sb.contigsumsize as usize + 1;
        let (off, _) = self.region(CG_CLUSTERSUMOFF, 4 * entries as u64)?;
        (0..entries)
            .map(|i| read_le_u32(&self.buf, off + 4 * i))
            .collect::<Result<Vec<_>, _>>()
            .map(Some)
    }

    pub fn set_clustersum(&mut self, sb: &Superblock, sums: &[u32]) -> Result<(), ParseError> {
        if sb.contigsumsize == 0 {
            return Ok(());
        }
        let entries = sb.contigsumsize as usize + 1;
        let (off, _) = self.region(CG_CLUSTERSUMOFF, 4 * entries as u64)?;
        for (i, value) in sums.iter().take(entries).enumerate() {
            write_le_u32(&mut self.buf, off + 4 * i, *value)?;
        }
        Ok(())
    }

    /// Free-cluster bitmap, one bit per block.
    pub fn clustersfree_mut(&mut self, sb: &Superblock) -> Result<Option<&mut [u8]>, ParseError> {
        if sb.contigsumsize == 0 {
            return Ok(None);
        }
        let blocks = self.nclusterblks()?;
        let (off, len) = self.region(CG_CLUSTEROFF, howmany(u64::from(blocks), 8))?;
        ensure_slice_mut(&mut self.buf, off, len).map(Some)
    }

    /// Recompute `cg_ckhash` over the whole group block.
    pub fn update_ckhash(&mut self) -> Result<(), ParseError> {
        write_le_u32(&mut self.buf, CG_CKHASH, 0)?;
        let hash = ufs_ckhash(&self.buf);
        write_le_u32(&mut self.buf, CG_CKHASH, hash)
    }

    pub fn ckhash(&self) -> Result<u32, ParseError> {
        read_le_u32(&self.buf, CG_CKHASH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ufs2::layout;
    use suj_types::{FS_UFS2_MAGIC, write_le_i64};

    fn sb() -> Superblock {
        let mut b = vec![0_u8; 2048];
        for (off, v) in [
            (layout::FS_SBLKNO, 128),
            (layout::FS_CBLKNO, 144),
            (layout::FS_IBLKNO, 152),
            (layout::FS_DBLKNO, 216),
            (layout::FS_NCG, 2),
            (layout::FS_BSIZE, 4096),
            (layout::FS_FSIZE, 512),
            (layout::FS_FRAG, 8),
            (layout::FS_BSHIFT, 12),
            (layout::FS_FSHIFT, 9),
            (layout::FS_FRAGSHIFT, 3),
            (layout::FS_SBSIZE, 2048),
            (layout::FS_NINDIR, 512),
            (layout::FS_INOPB, 16),
            (layout::FS_CSSIZE, 32),
            (layout::FS_CGSIZE, 4096),
            (layout::FS_IPG, 128),
            (layout::FS_FPG, 2048),
            (layout::FS_CONTIGSUMSIZE, 4),
            (layout::FS_MAGIC, FS_UFS2_MAGIC),
        ] {
            write_le_u32(&mut b, off, v).expect("field");
        }
        write_le_i64(&mut b, layout::FS_CSADDR, 216).expect("csaddr");
        Superblock::parse(&b).expect("superblock")
    }

    #[test]
    fn format_then_parse() {
        let sb = sb();
        let cg = CylinderGroup::format(&sb, GroupNumber(1), 2048).expect("format");
        let cg = CylinderGroup::parse(cg.as_bytes().to_vec(), GroupNumber(1)).expect("parse");
        assert_eq!(cg.ndblk().expect("ndblk"), 2048);
        assert_eq!(cg.inosused(&sb).expect("inosused").len(), 16);
        assert_eq!(cg.blksfree(&sb).expect("blksfree").len(), 256);
        assert_eq!(cg.clustersum(&sb).expect("sum").map(|s| s.len()), Some(5));
        assert_eq!(cg.nclusterblks().expect("nclusterblks"), 256);
    }

    #[test]
    fn wrong_index_is_rejected() {
        let sb = sb();
        let cg = CylinderGroup::format(&sb, GroupNumber(0), 2048).expect("format");
        let err = CylinderGroup::parse(cg.as_bytes().to_vec(), GroupNumber(1)).expect_err("cgx");
        assert!(matches!(err, ParseError::InvalidField { field: "cg_cgx", .. }));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let err = CylinderGroup::parse(vec![0_u8; 4096], GroupNumber(0)).expect_err("magic");
        assert!(matches!(err, ParseError::InvalidMagic { .. }));
    }

    #[test]
    fn summary_fields_round_trip() {
        let sb = sb();
        let mut cg = CylinderGroup::format(&sb, GroupNumber(0), 2048).expect("format");
        let cs = Csum {
            ndir: 1,
            nbfree: 10,
            nifree: 100,
            nffree: 3,
        };
        cg.set_cs(&cs).expect("cs");
        cg.set_irotor(9).expect("irotor");
        let mut frsum = [0_u32; 8];
        frsum[3] = 1;
        cg.set_frsum(&frsum).expect("frsum");
        assert_eq!(cg.cs().expect("cs"), cs);
        assert_eq!(cg.irotor().expect("irotor"), 9);
        assert_eq!(cg.frsum().expect("frsum")[3], 1);
    }

    #[test]
    fn check_hash_covers_bitmaps() {
        let sb = sb();
        let mut cg = CylinderGroup::format(&sb, GroupNumber(0), 2048).expect("format");
        cg.update_ckhash().expect("hash");
        let before = cg.ckhash().expect("hash");
        cg.blksfree_mut(&sb).expect("map")[40] = 0xFF;
        cg.update_ckhash().expect("hash");
        assert_ne!(before, cg.ckhash().expect("hash"));
    }
}
