//! Block-tree traversal and logical-to-physical resolution.
//!
//! Indirect blocks are named by a negative logical block number:
//! `-(first data lbn covered) - level`, where level 0 is a single indirect
//! whose children are data blocks. Extended-attribute blocks are `-1` and
//! `-2`.

use suj_block::ByteDevice;
use suj_error::{Result, SujError};
use suj_ondisk::Dinode;
use suj_types::{
    FragAddr, InodeNumber, Lbn, S_IFBLK, S_IFCHR, S_IFLNK, UFS_NDADDR, UFS_NIADDR, UFS_NXADDR,
    file_type, read_le_i64,
};
use tracing::trace;

use crate::aggregate::BlockOp;
use crate::context::{RecoveryContext, corrupt_at};

/// Which blocks a traversal reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Visit {
    /// Report indirect blocks, after their children.
    pub indirect: bool,
    /// Report extended-attribute blocks.
    pub ext: bool,
    /// The indirect block came from an inode pointer rather than the
    /// journal, so it needs no ownership check.
    pub(crate) trusted: bool,
}

impl Visit {
    /// Data blocks only.
    pub const DATA: Self = Self {
        indirect: false,
        ext: false,
        trusted: false,
    };
    /// Every block the inode owns.
    pub const ALL: Self = Self {
        indirect: true,
        ext: true,
        trusted: false,
    };
}

/// Callback invoked with `(ino, lbn, fragment address, fragment count)`.
pub type Visitor<'v, D> =
    dyn FnMut(&mut RecoveryContext<D>, InodeNumber, Lbn, FragAddr, u32) -> Result<()> + 'v;

/// Data blocks spanned by one pointer of an indirect block at `level`.
fn lbn_offset(nindir: i64, level: u32) -> i64 {
    nindir.saturating_pow(level)
}

/// Level of the indirect block named by `lbn`.
///
/// Fails unless `lbn` is exactly the name of some indirect block in the
/// three trees.
pub fn lbn_level(nindir: i64, ino: InodeNumber, lbn: Lbn) -> Result<u32> {
    let out_of_range = || SujError::LbnOutOfRange { ino: ino.0, lbn: lbn.0 };
    let key = lbn.0.checked_neg().ok_or_else(out_of_range)?;
    let mut first = UFS_NDADDR as i64;
    let mut span = nindir;
    for tree in 0..UFS_NIADDR as u32 {
        let next = first.saturating_add(span);
        if key >= first && key < next {
            // key = covered + level; covered - first is a multiple of the
            // child span, which is at least nindir > level.
            let level = (key - first) % nindir;
            let covered = key - level;
            let level = u32::try_from(level).map_err(|_| out_of_range())?;
            if level > tree || (covered - first) % lbn_offset(nindir, level + 1) != 0 {
                return Err(out_of_range());
            }
            return Ok(level);
        }
        first = next;
        span = span.saturating_mul(nindir);
    }
    Err(out_of_range())
}

impl<D: ByteDevice> RecoveryContext<D> {
    fn nindir(&self) -> i64 {
        i64::from(self.sb.nindir)
    }

    /// Level of the indirect block named by `lbn` for `ino`.
    pub(crate) fn indir_level(&self, ino: InodeNumber, lbn: Lbn) -> Result<u32> {
        lbn_level(self.nindir(), ino, lbn)
    }

    /// Pointer `index` of the indirect block at `blk`.
    fn indirect_slot(&mut self, blk: FragAddr, index: usize) -> Result<FragAddr> {
        let bsize = self.sb.bsize as usize;
        let buf = self.data_block_read(blk, bsize)?;
        let raw = read_le_i64(buf, index * 8).map_err(corrupt_at(blk))?;
        u64::try_from(raw)
            .map(FragAddr)
            .map_err(|_| SujError::corruption(blk.0, format!("negative pointer {raw} at slot {index}")))
    }

    /// Every pointer of the indirect block at `blk`, copied out of the cache.
    fn indirect_pointers(&mut self, blk: FragAddr) -> Result<Vec<FragAddr>> {
        let nindir = self.sb.nindir as usize;
        (0..nindir).map(|i| self.indirect_slot(blk, i)).collect()
    }

    /// Physical address and fragment count of `lbn` in `ino`.
    ///
    /// Holes and logical blocks past the end of the extended-attribute area
    /// resolve to address zero.
    pub fn block_at(&mut self, ino: InodeNumber, dinode: &Dinode, lbn: Lbn) -> Result<(FragAddr, u32)> {
        let frag = self.sb.frag;
        if lbn.0 < 0 && lbn.0 >= -(UFS_NXADDR as i64) {
            let extsize = u64::from(dinode.extsize());
            let idx = (-1 - lbn.0) as usize;
            if extsize == 0 || idx as u64 > self.sb.lblkno(extsize - 1) {
                return Ok((FragAddr(0), 0));
            }
            let frags = self.frags_of(self.sb.sblksize(extsize, Lbn(idx as i64)));
            return Ok((dinode.extb(idx), frags));
        }
        let size = dinode.size();
        if file_type(dinode.mode()) == S_IFLNK && size < u64::from(self.sb.maxsymlinklen) {
            return Ok((FragAddr(0), 0));
        }
        if lbn.is_data() && lbn.0 < UFS_NDADDR as i64 {
            let frags = self.frags_of(self.sb.sblksize(size, lbn));
            return Ok((dinode.db(lbn.0 as usize), frags));
        }

        let nindir = self.nindir();
        let mut first = UFS_NDADDR as i64;
        let mut span = nindir;
        for tree in 0..UFS_NIADDR {
            let next = first.saturating_add(span);
            let level = tree as i64;
            if lbn.0 == -first - level {
                return Ok((dinode.ib(tree), frag));
            }
            let skip = (lbn.0 < 0 && -lbn.0 >= next) || (lbn.0 > 0 && lbn.0 >= next);
            if !skip {
                let addr = self.indir_block_at(ino, dinode.ib(tree), tree as u32, first, lbn)?;
                return Ok((addr, frag));
            }
            first = next;
            span = span.saturating_mul(nindir);
        }
        Err(SujError::LbnOutOfRange { ino: ino.0, lbn: lbn.0 })
    }

    /// Descend from the indirect block `blk` at `level`, whose first covered
    /// data block is `first`, towards `target`.
    fn indir_block_at(
        &mut self,
        ino: InodeNumber,
        blk: FragAddr,
        level: u32,
        first: i64,
        target: Lbn,
    ) -> Result<FragAddr> {
        if blk.is_hole() {
            return Ok(FragAddr(0));
        }
        let out_of_range = || SujError::LbnOutOfRange { ino: ino.0, lbn: target.0 };
        let nindir = self.nindir();
        let span = lbn_offset(nindir, level);
        let key = target.0.checked_abs().ok_or_else(out_of_range)?;
        let rel = key - first;
        if rel < 0 || rel / span >= nindir {
            return Err(out_of_range());
        }
        let index = rel / span;
        let ptr = self.indirect_slot(blk, index as usize)?;
        let child_first = first + index * span;
        if level == 0 {
            return if target.0 == child_first {
                Ok(ptr)
            } else {
                Err(out_of_range())
            };
        }
        if target.0 == -child_first - i64::from(level - 1) {
            return Ok(ptr);
        }
        self.indir_block_at(ino, ptr, level - 1, child_first, target)
    }

    /// Whether `blk` is an indirect block `ino` freed at `lbn` whose
    /// contents are still intact.
    ///
    /// The newest record for the block must be that exact free, and the
    /// block must not have been released since.
    fn is_freed_indirect(&mut self, blk: FragAddr, ino: InodeNumber, lbn: Lbn) -> Result<bool> {
        let frag = self.sb.frag;
        let base = self.sb.blknum(blk);
        let start = self.sb.fragnum(blk);
        let newest = self
            .block_aggregate(base)?
            .and_then(|agg| agg.entries.last().copied());
        let Some(entry) = newest else {
            return Ok(false);
        };
        if entry.op != BlockOp::Free || !entry.covers(ino, lbn, start, frag) {
            return Ok(false);
        }
        Ok(!self.frag_is_free(blk)?)
    }

    /// Visit the indirect block `blk` named `lbn` at `level` and everything
    /// below it. Adds every visited fragment to `total`.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn indir_visit(
        &mut self,
        ino: InodeNumber,
        lbn: Lbn,
        level: u32,
        blk: FragAddr,
        flags: Visit,
        total: &mut u64,
        visitor: &mut Visitor<'_, D>,
    ) -> Result<()> {
        if !flags.trusted && !self.is_freed_indirect(blk, ino, lbn)? {
            trace!(ino = ino.0, lbn = lbn.0, blk = blk.0, "indirect block reused, not followed");
            return Ok(());
        }
        let frag = self.sb.frag;
        let span = lbn_offset(self.nindir(), level);
        let first = -lbn.0 - i64::from(level);
        let pointers = self.indirect_pointers(blk)?;
        for (i, child) in pointers.into_iter().enumerate() {
            if child.is_hole() {
                continue;
            }
            let child_first = first + i as i64 * span;
            if level == 0 {
                *total += u64::from(frag);
                visitor(self, ino, Lbn(child_first), child, frag)?;
                continue;
            }
            let child_lbn = Lbn(-child_first - i64::from(level - 1));
            self.indir_visit(ino, child_lbn, level - 1, child, flags, total, visitor)?;
        }
        if flags.indirect {
            *total += u64::from(frag);
            visitor(self, ino, lbn, blk, frag)?;
        }
        Ok(())
    }

    /// Visit every block `dinode` references, returning the fragment total.
    ///
    /// Device nodes and short symlinks own no data blocks. Indirect blocks
    /// reached from the inode are trusted.
    pub fn ino_visit(
        &mut self,
        ino: InodeNumber,
        dinode: &Dinode,
        flags: Visit,
        visitor: &mut Visitor<'_, D>,
    ) -> Result<u64> {
        let mut total = 0_u64;
        let extsize = u64::from(dinode.extsize());
        if flags.ext && extsize != 0 {
            for i in 0..UFS_NXADDR {
                let blk = dinode.extb(i);
                if blk.is_hole() {
                    continue;
                }
                let frags = self.frags_of(self.sb.sblksize(extsize, Lbn(i as i64)));
                total += u64::from(frags);
                visitor(self, ino, Lbn(-1 - i as i64), blk, frags)?;
            }
        }

        let kind = file_type(dinode.mode());
        let size = dinode.size();
        if kind == S_IFBLK
            || kind == S_IFCHR
            || (kind == S_IFLNK && size < u64::from(self.sb.maxsymlinklen))
        {
            return Ok(total);
        }

        for i in 0..UFS_NDADDR {
            let blk = dinode.db(i);
            if blk.is_hole() {
                continue;
            }
            let lbn = Lbn(i as i64);
            let frags = self.frags_of(self.sb.sblksize(size, lbn));
            total += u64::from(frags);
            visitor(self, ino, lbn, blk, frags)?;
        }

        let flags = Visit {
            trusted: true,
            ..flags
        };
        let nindir = self.nindir();
        let mut first = UFS_NDADDR as i64;
        let mut span = nindir;
        for tree in 0..UFS_NIADDR {
            let blk = dinode.ib(tree);
            if !blk.is_hole() {
                let lbn = Lbn(-first - tree as i64);
                self.indir_visit(ino, lbn, tree as u32, blk, flags, &mut total, visitor)?;
            }
            first = first.saturating_add(span);
            span = span.saturating_mul(nindir);
        }
        Ok(total)
    }
}
