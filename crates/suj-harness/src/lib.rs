#![forbid(unsafe_code)]
//! Synthetic UFS2 images for recovery tests.
//!
//! [`TestImage`] lays out a small two-group soft-updates filesystem in
//! memory: a root directory, a `.sujournal` journal file, and helpers to
//! create directories and files, poke at inodes and bitmaps, and append
//! journal segments. [`TestImage::device`] writes every summary the way a
//! clean unmount would and hands back a [`MemoryByteDevice`];
//! [`TestImage::load`] reopens an image after recovery for assertions.
//!
//! Geometry: 4 KiB blocks, 512-byte fragments, 2 groups of 2048 fragments,
//! 128 inodes per group.

pub mod journal;

use suj_alloc::{GroupSummary, bitmap_count_set, bitmap_find_clear, bitmap_get, bitmap_set,
    clear_block, is_block_free};
use suj_block::MemoryByteDevice;
use suj_dir::{DT_DIR, DT_REG, add_entry, find_name, init_dir_block, remove_entry};
use suj_error::{Result, SujError};
use suj_journal::{JournalRecord, segment_len};
use suj_ondisk::ufs2::layout;
use suj_ondisk::{Csum, CsumTotal, CylinderGroup, Dinode, SegmentHeader, Superblock,
    parse_csum_array, write_csum_array};
use suj_types::{
    CK_CYLGRP, CK_INODE, CK_SUPERBLOCK, DEV_BSIZE, DINODE2_SIZE, DOTDOT_OFFSET, DevAddr,
    FS_DOSOFTDEP, FS_SUJ, FS_UFS2_MAGIC, FragAddr, GroupNumber, InodeNumber, JREC_SIZE,
    JournalSeq, ParseError, S_IFDIR, S_IFMT, S_IFREG, SBLOCK_UFS2, SF_IMMUTABLE, SF_NOUNLINK,
    SUJ_FILE, UFS_NDADDR, is_dir, write_le_i64, write_le_u32, write_le_u64,
};

pub const BSIZE: u32 = 4096;
pub const FSIZE: u32 = 512;
pub const FRAG: u32 = 8;
pub const NCG: u32 = 2;
pub const FPG: u32 = 2048;
pub const IPG: u32 = 128;
const SBLKNO: u32 = 128;
const CBLKNO: u32 = 144;
const IBLKNO: u32 = 152;
const DBLKNO: u32 = 216;
const CSADDR: u32 = 216;
const SBSIZE: usize = 4096;
const CONTIGSUMSIZE: u32 = 4;
const MAXSYMLINKLEN: u32 = 120;
/// First free fragment of group 0, past the summary area.
const DATA_START0: u32 = 224;

/// Mount time stamped into the superblock, the journal inode and every
/// segment header.
pub const MTIME: i64 = 1_700_000_000;
/// Journal file length in blocks; the last four hang off `ib[0]`.
pub const JOURNAL_BLOCKS: usize = 16;
/// Journal file length in bytes.
pub const JOURNAL_BYTES: u64 = JOURNAL_BLOCKS as u64 * BSIZE as u64;
/// Total image size.
pub const IMAGE_BYTES: usize = (NCG * FPG * FSIZE) as usize;

fn parse_err(err: ParseError) -> SujError {
    SujError::Parse(err.to_string())
}

fn to_i32(value: u32) -> Result<i32> {
    i32::try_from(value).map_err(|_| SujError::Format(format!("counter {value} overflows")))
}

#[derive(Debug, Clone)]
struct JournalFile {
    ino: InodeNumber,
    /// Physical address of each logical journal block.
    blocks: Vec<FragAddr>,
    /// Append position in bytes.
    pos: u64,
}

/// An in-memory UFS2 image under construction or inspection.
#[derive(Debug, Clone)]
pub struct TestImage {
    bytes: Vec<u8>,
    sb: Superblock,
    cgs: Vec<CylinderGroup>,
    journal: Option<JournalFile>,
}

impl TestImage {
    /// Fresh filesystem with no metadata check hashes.
    pub fn new() -> Result<Self> {
        Self::build(0)
    }

    /// Fresh filesystem with superblock, group and inode check hashes on.
    pub fn with_check_hashes() -> Result<Self> {
        Self::build(CK_SUPERBLOCK | CK_CYLGRP | CK_INODE)
    }

    fn build(metackhash: u32) -> Result<Self> {
        let mut raw = vec![0_u8; SBSIZE];
        let fields = [
            (layout::FS_SBLKNO, SBLKNO),
            (layout::FS_CBLKNO, CBLKNO),
            (layout::FS_IBLKNO, IBLKNO),
            (layout::FS_DBLKNO, DBLKNO),
            (layout::FS_NCG, NCG),
            (layout::FS_BSIZE, BSIZE),
            (layout::FS_FSIZE, FSIZE),
            (layout::FS_FRAG, FRAG),
            (layout::FS_BSHIFT, BSIZE.trailing_zeros()),
            (layout::FS_FSHIFT, FSIZE.trailing_zeros()),
            (layout::FS_FRAGSHIFT, FRAG.trailing_zeros()),
            (layout::FS_FSBTODB, 0),
            (layout::FS_SBSIZE, SBSIZE as u32),
            (layout::FS_NINDIR, BSIZE / 8),
            (layout::FS_INOPB, BSIZE / DINODE2_SIZE as u32),
            (layout::FS_CSSIZE, NCG * 16),
            (layout::FS_CGSIZE, BSIZE),
            (layout::FS_IPG, IPG),
            (layout::FS_FPG, FPG),
            (layout::FS_METACKHASH, metackhash),
            (layout::FS_FLAGS, FS_SUJ | FS_DOSOFTDEP),
            (layout::FS_CONTIGSUMSIZE, CONTIGSUMSIZE),
            (layout::FS_MAXSYMLINKLEN, MAXSYMLINKLEN),
            (layout::FS_MAGIC, FS_UFS2_MAGIC),
        ];
        for (off, value) in fields {
            write_le_u32(&mut raw, off, value).map_err(parse_err)?;
        }
        let size = i64::from(NCG * FPG);
        write_le_i64(&mut raw, layout::FS_SIZE, size).map_err(parse_err)?;
        write_le_i64(&mut raw, layout::FS_DSIZE, size).map_err(parse_err)?;
        write_le_i64(&mut raw, layout::FS_CSADDR, i64::from(CSADDR)).map_err(parse_err)?;
        write_le_i64(&mut raw, layout::FS_MTIME, MTIME).map_err(parse_err)?;
        write_le_i64(&mut raw, layout::FS_TIME, MTIME).map_err(parse_err)?;
        let sb = Superblock::parse(&raw).map_err(parse_err)?;

        let mut cgs = Vec::new();
        for cg in 0..NCG {
            let mut group = CylinderGroup::format(&sb, GroupNumber(cg), FPG).map_err(parse_err)?;
            let first = if cg == 0 { DATA_START0 } else { DBLKNO };
            let map = group.blksfree_mut(&sb).map_err(parse_err)?;
            for block in first / FRAG..FPG / FRAG {
                suj_alloc::set_block_free(map, block, FRAG);
            }
            cgs.push(group);
        }

        let mut img = Self {
            bytes: vec![0_u8; IMAGE_BYTES],
            sb,
            cgs,
            journal: None,
        };
        img.mark_inode_used(InodeNumber(0))?;
        img.mark_inode_used(InodeNumber::WHITEOUT)?;
        img.mark_inode_used(InodeNumber::ROOT)?;
        let blk = img.alloc_block()?;
        let mut block = vec![0_u8; BSIZE as usize];
        init_dir_block(&mut block, InodeNumber::ROOT, InodeNumber::ROOT)?;
        img.write_frags(blk, &block)?;
        let mut root = Dinode::zeroed();
        root.set_mode(S_IFDIR | 0o755);
        root.set_nlink(2);
        root.set_size(u64::from(BSIZE));
        root.set_db(0, blk);
        root.set_blocks(u64::from(FRAG));
        root.set_generation(1);
        img.write_inode(InodeNumber::ROOT, &root)?;
        img.create_journal(JOURNAL_BLOCKS)?;
        Ok(img)
    }

    /// Reopen an image, typically after recovery has written it.
    pub fn load(bytes: Vec<u8>) -> Result<Self> {
        let start = SBLOCK_UFS2 as usize;
        let sb_bytes = bytes
            .get(start..start + SBSIZE)
            .ok_or_else(|| SujError::Format("image too small".to_owned()))?;
        let sb = Superblock::parse(sb_bytes).map_err(parse_err)?;
        let mut img = Self {
            bytes,
            sb,
            cgs: Vec::new(),
            journal: None,
        };
        for cg in 0..img.sb.ncg {
            let addr = img.sb.cgtod(GroupNumber(cg));
            let raw = img.read_frags(addr, img.sb.cgsize as usize)?.to_vec();
            img.cgs.push(CylinderGroup::parse(raw, GroupNumber(cg)).map_err(parse_err)?);
        }
        if let Some((ino, _)) = img.lookup(InodeNumber::ROOT, SUJ_FILE)? {
            img.journal = Some(JournalFile {
                ino,
                blocks: img.data_blocks(ino)?,
                pos: 0,
            });
        }
        Ok(img)
    }

    // ── Raw access ──────────────────────────────────────────────────────────

    fn frag_byte(&self, addr: FragAddr) -> usize {
        (addr.0 * u64::from(self.sb.fsize)) as usize
    }

    fn read_frags(&self, addr: FragAddr, len: usize) -> Result<&[u8]> {
        let start = self.frag_byte(addr);
        self.bytes
            .get(start..start + len)
            .ok_or_else(|| SujError::corruption(addr.0, "read past image end"))
    }

    fn write_frags(&mut self, addr: FragAddr, data: &[u8]) -> Result<()> {
        let start = self.frag_byte(addr);
        self.bytes
            .get_mut(start..start + data.len())
            .ok_or_else(|| SujError::corruption(addr.0, "write past image end"))?
            .copy_from_slice(data);
        Ok(())
    }

    /// Raw image bytes as they stand, without flushing summaries.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn superblock(&self) -> &Superblock {
        &self.sb
    }

    pub fn superblock_mut(&mut self) -> &mut Superblock {
        &mut self.sb
    }

    /// Cylinder group `cg` as currently held.
    pub fn group(&self, cg: u32) -> Result<&CylinderGroup> {
        self.cgs.get(cg as usize).ok_or(SujError::GroupOutOfRange {
            group: cg,
            ncg: self.sb.ncg,
        })
    }

    fn group_mut(&mut self, cg: GroupNumber) -> Result<&mut CylinderGroup> {
        let ncg = self.sb.ncg;
        self.cgs.get_mut(cg.0 as usize).ok_or(SujError::GroupOutOfRange {
            group: cg.0,
            ncg,
        })
    }

    /// Summary records as stored at `fs_csaddr`.
    pub fn csums(&self) -> Result<Vec<Csum>> {
        let raw = self.read_frags(FragAddr(self.sb.csaddr), self.sb.cssize as usize)?;
        parse_csum_array(raw, self.sb.ncg).map_err(parse_err)
    }

    // ── Inodes ──────────────────────────────────────────────────────────────

    fn inode_byte(&self, ino: InodeNumber) -> usize {
        self.frag_byte(self.sb.ino_to_fsba(ino)) + self.sb.ino_to_fsbo(ino) * DINODE2_SIZE
    }

    pub fn inode(&self, ino: InodeNumber) -> Result<Dinode> {
        let start = self.inode_byte(ino);
        let raw = self
            .bytes
            .get(start..start + DINODE2_SIZE)
            .ok_or_else(|| SujError::NotFound(format!("inode {ino}")))?;
        Dinode::from_bytes(raw).map_err(parse_err)
    }

    pub fn write_inode(&mut self, ino: InodeNumber, dinode: &Dinode) -> Result<()> {
        let mut dinode = dinode.clone();
        if self.sb.ckhash_enabled(CK_INODE) {
            dinode.update_ckhash();
        }
        let start = self.inode_byte(ino);
        self.bytes
            .get_mut(start..start + DINODE2_SIZE)
            .ok_or_else(|| SujError::NotFound(format!("inode {ino}")))?
            .copy_from_slice(dinode.as_bytes());
        Ok(())
    }

    /// Read, modify and write back one inode.
    pub fn update_inode(&mut self, ino: InodeNumber, f: impl FnOnce(&mut Dinode)) -> Result<()> {
        let mut dinode = self.inode(ino)?;
        f(&mut dinode);
        self.write_inode(ino, &dinode)
    }

    pub fn inode_is_used(&self, ino: InodeNumber) -> Result<bool> {
        let group = self.group(self.sb.ino_to_cg(ino).0)?;
        let map = group.inosused(&self.sb).map_err(parse_err)?;
        Ok(bitmap_get(map, self.sb.ino_index(ino)))
    }

    fn mark_inode_used(&mut self, ino: InodeNumber) -> Result<()> {
        let sb = self.sb.clone();
        let group = self.group_mut(sb.ino_to_cg(ino))?;
        let map = group.inosused_mut(&sb).map_err(parse_err)?;
        bitmap_set(map, sb.ino_index(ino));
        Ok(())
    }

    /// Lowest free inode in group 0, marked in use.
    pub fn alloc_inode(&mut self) -> Result<InodeNumber> {
        let sb = self.sb.clone();
        let group = self.group_mut(GroupNumber(0))?;
        let map = group.inosused_mut(&sb).map_err(parse_err)?;
        let idx = bitmap_find_clear(map, sb.ipg, 0)
            .ok_or_else(|| SujError::NotFound("free inode".to_owned()))?;
        bitmap_set(map, idx);
        Ok(InodeNumber(idx))
    }

    // ── Fragments ───────────────────────────────────────────────────────────

    pub fn frag_is_free(&self, addr: FragAddr) -> Result<bool> {
        let group = self.group(self.sb.dtog(addr).0)?;
        let map = group.blksfree(&self.sb).map_err(parse_err)?;
        Ok(bitmap_get(map, self.sb.dtogd(addr)))
    }

    /// Number of free fragments in `[addr, addr + count)`.
    pub fn free_frags_in(&self, addr: FragAddr, count: u32) -> Result<u32> {
        let mut free = 0;
        for i in 0..u64::from(count) {
            if self.frag_is_free(FragAddr(addr.0 + i))? {
                free += 1;
            }
        }
        Ok(free)
    }

    /// First wholly free block, marked allocated.
    pub fn alloc_block(&mut self) -> Result<FragAddr> {
        let sb = self.sb.clone();
        for cg in 0..sb.ncg {
            let group = self.group_mut(GroupNumber(cg))?;
            let map = group.blksfree_mut(&sb).map_err(parse_err)?;
            if let Some(block) = (0..sb.fpg / sb.frag).find(|&b| is_block_free(map, b, sb.frag)) {
                clear_block(map, block, sb.frag);
                return Ok(FragAddr(sb.cgbase(GroupNumber(cg)).0 + u64::from(block * sb.frag)));
            }
        }
        Err(SujError::NotFound("free block".to_owned()))
    }

    /// Fill the indirect block at `addr` with `pointers`, zeroing the rest.
    pub fn write_indirect(&mut self, addr: FragAddr, pointers: &[FragAddr]) -> Result<()> {
        let mut block = vec![0_u8; BSIZE as usize];
        for (slot, ptr) in pointers.iter().enumerate() {
            write_le_u64(&mut block, slot * 8, ptr.0).map_err(parse_err)?;
        }
        self.write_frags(addr, &block)
    }

    // ── Directories ─────────────────────────────────────────────────────────

    fn dir_block(&self, dir: InodeNumber) -> Result<(FragAddr, Vec<u8>)> {
        let dinode = self.inode(dir)?;
        if !is_dir(dinode.mode()) {
            return Err(SujError::Format(format!("inode {dir} is not a directory")));
        }
        let blk = dinode.db(0);
        Ok((blk, self.read_frags(blk, BSIZE as usize)?.to_vec()))
    }

    /// Look `name` up in `dir`, returning the target and the entry offset.
    pub fn lookup(&self, dir: InodeNumber, name: &[u8]) -> Result<Option<(InodeNumber, u64)>> {
        let (_, block) = self.dir_block(dir)?;
        Ok(find_name(&block, name)?.map(|e| (e.ino, e.offset as u64)))
    }

    /// Add a name for `ino` to `dir` without touching any link count.
    pub fn link(&mut self, dir: InodeNumber, name: &[u8], ino: InodeNumber, d_type: u8) -> Result<u64> {
        let (blk, mut block) = self.dir_block(dir)?;
        let off = add_entry(&mut block, ino, name, d_type)?
            .ok_or_else(|| SujError::NotFound(format!("room in directory {dir}")))?;
        self.write_frags(blk, &block)?;
        Ok(off as u64)
    }

    /// Remove `name` from `dir` without touching any link count.
    pub fn unlink(&mut self, dir: InodeNumber, name: &[u8]) -> Result<Option<u64>> {
        let (blk, mut block) = self.dir_block(dir)?;
        let off = remove_entry(&mut block, name)?;
        self.write_frags(blk, &block)?;
        Ok(off.map(|o| o as u64))
    }

    /// Point the ".." entry of `dir` at `parent` without touching any
    /// link count.
    pub fn set_dotdot(&mut self, dir: InodeNumber, parent: InodeNumber) -> Result<()> {
        let (blk, mut block) = self.dir_block(dir)?;
        write_le_u32(&mut block, DOTDOT_OFFSET as usize, parent.0).map_err(parse_err)?;
        self.write_frags(blk, &block)
    }

    /// Create a directory under `parent`, returning it and its entry offset.
    pub fn mkdir(&mut self, parent: InodeNumber, name: &[u8]) -> Result<(InodeNumber, u64)> {
        let ino = self.alloc_inode()?;
        let blk = self.alloc_block()?;
        let mut block = vec![0_u8; BSIZE as usize];
        init_dir_block(&mut block, ino, parent)?;
        self.write_frags(blk, &block)?;
        let mut dinode = Dinode::zeroed();
        dinode.set_mode(S_IFDIR | 0o755);
        dinode.set_nlink(2);
        dinode.set_size(u64::from(BSIZE));
        dinode.set_db(0, blk);
        dinode.set_blocks(u64::from(FRAG));
        dinode.set_generation(ino.0);
        self.write_inode(ino, &dinode)?;
        let off = self.link(parent, name, ino, DT_DIR)?;
        self.update_inode(parent, |d| d.set_nlink(d.nlink() + 1))?;
        Ok((ino, off))
    }

    /// Create a regular file of `blocks` full direct blocks under `parent`.
    pub fn create_file(&mut self, parent: InodeNumber, name: &[u8], blocks: usize) -> Result<(InodeNumber, u64)> {
        if blocks > UFS_NDADDR {
            return Err(SujError::Format("only direct blocks are supported".to_owned()));
        }
        let ino = self.alloc_inode()?;
        let mut dinode = Dinode::zeroed();
        dinode.set_mode(S_IFREG | 0o644);
        dinode.set_nlink(1);
        dinode.set_size(blocks as u64 * u64::from(BSIZE));
        dinode.set_generation(ino.0);
        for i in 0..blocks {
            dinode.set_db(i, self.alloc_block()?);
        }
        dinode.set_blocks(blocks as u64 * u64::from(FRAG));
        self.write_inode(ino, &dinode)?;
        let off = self.link(parent, name, ino, DT_REG)?;
        Ok((ino, off))
    }

    // ── Unlinked list ───────────────────────────────────────────────────────

    /// Chain `inodes` onto `fs_sujfree` in order.
    pub fn set_unlinked_list(&mut self, inodes: &[InodeNumber]) -> Result<()> {
        self.sb.sujfree = inodes.first().map_or(0, |ino| ino.0);
        for pair in inodes.windows(2) {
            let next = pair[1].0;
            self.update_inode(pair[0], |d| d.set_freelink(next))?;
        }
        if let Some(last) = inodes.last() {
            self.update_inode(*last, |d| d.set_freelink(0))?;
        }
        Ok(())
    }

    // ── Journal ─────────────────────────────────────────────────────────────

    fn create_journal(&mut self, nblocks: usize) -> Result<()> {
        let ino = self.alloc_inode()?;
        let nindir = self.sb.nindir as usize;
        let mut dinode = Dinode::zeroed();
        dinode.set_mode(S_IFREG | 0o400);
        dinode.set_nlink(1);
        dinode.set_flags(SF_IMMUTABLE | SF_NOUNLINK);
        dinode.set_size(nblocks as u64 * u64::from(BSIZE));
        dinode.set_modrev(MTIME as u64);
        dinode.set_generation(ino.0);

        let mut blocks = Vec::with_capacity(nblocks);
        for i in 0..nblocks.min(UFS_NDADDR) {
            let blk = self.alloc_block()?;
            dinode.set_db(i, blk);
            blocks.push(blk);
        }
        let mut total = blocks.len() as u64;
        if nblocks > UFS_NDADDR {
            if nblocks - UFS_NDADDR > nindir {
                return Err(SujError::Format("journal too large".to_owned()));
            }
            let ind = self.alloc_block()?;
            dinode.set_ib(0, ind);
            total += 1;
            let mut pointers = vec![0_u8; BSIZE as usize];
            for slot in 0..nblocks - UFS_NDADDR {
                let blk = self.alloc_block()?;
                write_le_u64(&mut pointers, slot * 8, blk.0).map_err(parse_err)?;
                blocks.push(blk);
                total += 1;
            }
            self.write_frags(ind, &pointers)?;
        }
        dinode.set_blocks(total * u64::from(FRAG));
        self.write_inode(ino, &dinode)?;
        self.link(InodeNumber::ROOT, SUJ_FILE, ino, DT_REG)?;
        self.journal = Some(JournalFile { ino, blocks, pos: 0 });
        Ok(())
    }

    fn data_blocks(&self, ino: InodeNumber) -> Result<Vec<FragAddr>> {
        let dinode = self.inode(ino)?;
        let nblocks = (dinode.size() / u64::from(BSIZE)) as usize;
        let mut out: Vec<FragAddr> = (0..nblocks.min(UFS_NDADDR)).map(|i| dinode.db(i)).collect();
        if nblocks > UFS_NDADDR {
            let ind = self.read_frags(dinode.ib(0), BSIZE as usize)?;
            for slot in 0..nblocks - UFS_NDADDR {
                let raw = suj_types::read_le_u64(ind, slot * 8).map_err(parse_err)?;
                out.push(FragAddr(raw));
            }
        }
        Ok(out)
    }

    fn journal(&self) -> Result<&JournalFile> {
        self.journal
            .as_ref()
            .ok_or_else(|| SujError::NotFound("journal".to_owned()))
    }

    pub fn journal_ino(&self) -> Result<InodeNumber> {
        Ok(self.journal()?.ino)
    }

    /// Physical address of every journal block, in file order.
    pub fn journal_blocks(&self) -> Result<Vec<FragAddr>> {
        Ok(self.journal()?.blocks.clone())
    }

    /// Append a segment stamped with the current mount time.
    pub fn append_segment(&mut self, seq: u64, oldest: u64, records: &[JournalRecord]) -> Result<DevAddr> {
        self.append_segment_at(seq, oldest, self.sb.mtime, records)
    }

    /// Append a segment with an explicit header timestamp.
    ///
    /// A segment never straddles a journal block; the append position skips
    /// to the next block instead.
    pub fn append_segment_at(
        &mut self,
        seq: u64,
        oldest: u64,
        time: i64,
        records: &[JournalRecord],
    ) -> Result<DevAddr> {
        let cnt = u16::try_from(records.len())
            .map_err(|_| SujError::Format("too many records".to_owned()))?;
        let len = segment_len(cnt, DEV_BSIZE as usize);
        let bsize = u64::from(BSIZE);
        if len > bsize {
            return Err(SujError::Format("segment larger than a block".to_owned()));
        }
        let journal = self.journal()?;
        let mut pos = journal.pos;
        if pos % bsize + len > bsize {
            pos += bsize - pos % bsize;
        }
        let blk = *journal
            .blocks
            .get((pos / bsize) as usize)
            .ok_or_else(|| SujError::NotFound("journal space".to_owned()))?;

        let header = SegmentHeader {
            seq: JournalSeq(seq),
            oldest: JournalSeq(oldest),
            cnt,
            blocks: (len / DEV_BSIZE) as u16,
            crc: 0,
            time,
        };
        let mut buf = vec![0_u8; len as usize];
        buf[..JREC_SIZE].copy_from_slice(&header.to_bytes());
        for (i, record) in records.iter().enumerate() {
            let at = JREC_SIZE * (i + 1);
            buf[at..at + JREC_SIZE].copy_from_slice(&record.encode());
        }
        let byte = self.frag_byte(blk) + (pos % bsize) as usize;
        self.bytes[byte..byte + buf.len()].copy_from_slice(&buf);
        if let Some(journal) = self.journal.as_mut() {
            journal.pos = pos + len;
        }
        Ok(DevAddr((byte as u64) / DEV_BSIZE))
    }

    /// Leave `bytes` of untouched journal space before the next segment.
    pub fn skip_journal(&mut self, bytes: u64) -> Result<()> {
        let journal = self
            .journal
            .as_mut()
            .ok_or_else(|| SujError::NotFound("journal".to_owned()))?;
        journal.pos += bytes;
        Ok(())
    }

    // ── Flush ───────────────────────────────────────────────────────────────

    fn count_dirs(&self, cg: u32) -> Result<u32> {
        let group = self.group(cg)?;
        let map = group.inosused(&self.sb).map_err(parse_err)?.to_vec();
        let mut ndir = 0;
        for idx in 0..self.sb.ipg {
            if bitmap_get(&map, idx) {
                let ino = InodeNumber(cg * self.sb.ipg + idx);
                if self.inode(ino)?.mode() & S_IFMT == S_IFDIR {
                    ndir += 1;
                }
            }
        }
        Ok(ndir)
    }

    /// Recompute every summary, write groups, summary area and superblock.
    pub fn flush(&mut self) -> Result<()> {
        let sb = self.sb.clone();
        let mut csums = Vec::with_capacity(self.cgs.len());
        for cg in 0..sb.ncg {
            let ndir = self.count_dirs(cg)?;
            let group = self.group_mut(GroupNumber(cg))?;
            let free = group.blksfree(&sb).map_err(parse_err)?.to_vec();
            let ndblk = group.ndblk().map_err(parse_err)?;
            let clusters = group.clustersfree_mut(&sb).map_err(parse_err)?;
            let summary = GroupSummary::recompute(&free, ndblk, sb.frag, sb.contigsumsize, clusters);
            let used = bitmap_count_set(group.inosused(&sb).map_err(parse_err)?, sb.ipg);
            let cs = Csum {
                ndir: to_i32(ndir)?,
                nbfree: to_i32(summary.nbfree)?,
                nifree: to_i32(sb.ipg - used)?,
                nffree: to_i32(summary.nffree)?,
            };
            group.set_cs(&cs).map_err(parse_err)?;
            group.set_frsum(&summary.frsum).map_err(parse_err)?;
            group.set_clustersum(&sb, &summary.clustersum).map_err(parse_err)?;
            if sb.ckhash_enabled(CK_CYLGRP) {
                group.update_ckhash().map_err(parse_err)?;
            }
            let raw = group.as_bytes().to_vec();
            self.write_frags(sb.cgtod(GroupNumber(cg)), &raw)?;
            csums.push(cs);
        }

        let mut area = self.read_frags(FragAddr(sb.csaddr), sb.cssize as usize)?.to_vec();
        write_csum_array(&mut area, &csums).map_err(parse_err)?;
        self.write_frags(FragAddr(sb.csaddr), &area)?;

        self.sb.cstotal = CsumTotal::from_groups(&csums);
        let raw = self.sb.to_bytes().map_err(parse_err)?;
        let start = SBLOCK_UFS2 as usize;
        self.bytes[start..start + raw.len()].copy_from_slice(&raw);
        Ok(())
    }

    /// Flush and hand the image over as a device.
    pub fn device(&mut self) -> Result<MemoryByteDevice> {
        self.flush()?;
        Ok(MemoryByteDevice::from_vec(self.bytes.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_image_round_trips() {
        let mut img = TestImage::new().expect("build");
        let dev = img.device().expect("flush");
        let loaded = TestImage::load(dev.snapshot()).expect("load");

        let sb = loaded.superblock();
        assert!(sb.has_flag(FS_SUJ));
        assert_eq!(sb.mtime, MTIME);
        let root = loaded.inode(InodeNumber::ROOT).expect("root");
        assert_eq!(root.nlink(), 2);
        let journal = loaded.journal_ino().expect("journal");
        let jnode = loaded.inode(journal).expect("journal inode");
        assert_eq!(jnode.size(), JOURNAL_BYTES);
        assert_eq!(jnode.modrev(), MTIME as u64);
        assert_eq!(loaded.journal_blocks().expect("blocks").len(), JOURNAL_BLOCKS);

        let csums = loaded.csums().expect("csums");
        assert_eq!(csums[0].ndir, 1);
        assert_eq!(csums[0].nifree, 128 - 4);
        assert_eq!(csums[1].nifree, 128);
        // Group 0: 228 data blocks minus root (1) and journal (17).
        assert_eq!(csums[0].nbfree, (2048 - 224) / 8 - 18);
        assert_eq!(csums[1].nbfree, (2048 - 216) / 8);
        assert_eq!(sb.cstotal.nbfree, i64::from(csums[0].nbfree + csums[1].nbfree));
    }

    #[test]
    fn mkdir_and_files_update_links_and_entries() {
        let mut img = TestImage::new().expect("build");
        let (dir, off) = img.mkdir(InodeNumber::ROOT, b"d").expect("mkdir");
        let (file, foff) = img.create_file(dir, b"f", 2).expect("file");
        assert_eq!(img.inode(InodeNumber::ROOT).expect("root").nlink(), 3);
        assert_eq!(img.lookup(InodeNumber::ROOT, b"d").expect("lookup"), Some((dir, off)));
        assert_eq!(img.lookup(dir, b"f").expect("lookup"), Some((file, foff)));
        assert_eq!(img.lookup(dir, b"..").expect("lookup"), Some((InodeNumber::ROOT, 12)));
        let dinode = img.inode(file).expect("file inode");
        assert_eq!(dinode.blocks(), 16);
        assert!(!img.frag_is_free(dinode.db(1)).expect("bitmap"));
        assert_eq!(img.unlink(dir, b"f").expect("unlink"), Some(foff));
        assert!(img.lookup(dir, b"f").expect("lookup").is_none());
    }

    #[test]
    fn segments_land_in_journal_blocks() {
        let mut img = TestImage::new().expect("build");
        let rec = journal::add_ref(InodeNumber(9), InodeNumber::ROOT, 1, S_IFREG, 48);
        let first = img.append_segment(1, 1, &[rec]).expect("seg");
        let blocks = img.journal_blocks().expect("blocks");
        assert_eq!(first, DevAddr(blocks[0].0));
        // 127 records fill a whole block and force the next one.
        let many = vec![rec; 127];
        let second = img.append_segment(2, 1, &many).expect("seg");
        assert_eq!(second, DevAddr(blocks[1].0));
        let raw = &img.bytes()[(first.0 * DEV_BSIZE) as usize..][..JREC_SIZE];
        let header = SegmentHeader::parse(raw).expect("header");
        assert_eq!(header.seq, JournalSeq(1));
        assert_eq!(header.time, MTIME);
    }

    #[test]
    fn check_hashes_are_written() {
        let mut img = TestImage::with_check_hashes().expect("build");
        img.flush().expect("flush");
        let group = img.group(0).expect("cg");
        let mut copy = group.clone();
        let stored = copy.ckhash().expect("hash");
        copy.update_ckhash().expect("rehash");
        assert_eq!(copy.ckhash().expect("hash"), stored);
        assert_ne!(stored, 0);
    }
}
