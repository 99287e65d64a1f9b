//! Block reconciliation: releasing fragments the journal says were
//! allocated or freed but that no inode owns any more.

use suj_alloc::{bitmap_get, bitmap_set, is_block_free, set_block_free};
use suj_block::ByteDevice;
use suj_error::{Result, SujError};
use suj_types::{FragAddr, InodeNumber, Lbn, UFS_NDADDR};
use tracing::{debug, trace};

use crate::aggregate::BlockOp;
use crate::context::{RecoveryContext, corrupt_at};
use crate::visit::Visit;

impl<D: ByteDevice> RecoveryContext<D> {
    /// Fragments of `[blk, blk + frags)` that other journaled owners still
    /// claim, as a mask relative to `blk`.
    ///
    /// A record that is exactly `ino`/`lbn` at `blk` covering the range
    /// wipes whatever earlier records claimed.
    pub fn free_mask(&mut self, blk: FragAddr, ino: InodeNumber, lbn: Lbn, frags: u32) -> Result<u32> {
        let base = self.sb.blknum(blk);
        let start = self.sb.fragnum(blk);
        let Some(agg) = self.block_aggregate(base)? else {
            return Ok(0);
        };
        let mut mask = 0_u32;
        for entry in &agg.entries {
            if !entry.overlaps(start, frags) {
                continue;
            }
            if entry.covers(ino, lbn, start, frags) {
                mask = 0;
            } else {
                mask |= entry.mask();
            }
        }
        Ok(mask >> start)
    }

    /// Mark `[blk, blk + frags)` free, skipping fragments set in `mask`.
    pub fn free_range(&mut self, blk: FragAddr, mask: u32, frags: u32) -> Result<()> {
        if frags == 0 {
            return Ok(());
        }
        self.check_range(blk, frags)?;
        let frag = self.sb.frag;
        let cg = self.sb.dtog(blk);
        let cgbno = self.sb.dtogd(blk);
        let cgtod = self.sb.cgtod(cg);
        if u64::from(cgbno) + u64::from(frags) > u64::from(self.sb.fpg) {
            return Err(SujError::corruption(
                blk.0,
                format!("free of {frags} fragments crosses cylinder group {cg}"),
            ));
        }

        let (group, sb) = self.group_and_sb(cg)?;
        let map = group.cg.blksfree_mut(sb).map_err(corrupt_at(cgtod))?;
        let mut blocks = 0_u64;
        let mut freed = 0_u64;
        if frags == frag && mask == 0 && cgbno % frag == 0 {
            let block = cgbno / frag;
            if !is_block_free(map, block, frag) {
                set_block_free(map, block, frag);
                blocks = 1;
            }
        } else {
            for i in 0..frags {
                let idx = cgbno + i;
                if mask & (1 << i) == 0 && !bitmap_get(map, idx) {
                    bitmap_set(map, idx);
                    freed += 1;
                }
            }
        }
        if blocks + freed > 0 {
            group.dirty = true;
        }
        self.stats.freed_blocks += blocks;
        self.stats.freed_frags += freed;
        debug!(blk = blk.0, frags, mask, blocks, freed, "released fragments");
        Ok(())
    }

    /// Visitor releasing every block it is handed.
    pub(crate) fn free_visit(&mut self, ino: InodeNumber, lbn: Lbn, blk: FragAddr, frags: u32) -> Result<()> {
        let mask = self.free_mask(blk, ino, lbn, frags)?;
        self.free_range(blk, mask, frags)
    }

    /// Release `frags` fragments at `blk` that `ino` no longer owns at `lbn`.
    ///
    /// With `follow`, an indirect block is walked and its children released
    /// too, provided nothing else claims it.
    pub fn free_lbn(
        &mut self,
        blk: FragAddr,
        ino: InodeNumber,
        lbn: Lbn,
        frags: u32,
        follow: bool,
    ) -> Result<()> {
        let mask = self.free_mask(blk, ino, lbn, frags)?;
        if follow && mask == 0 && lbn.0 <= -(UFS_NDADDR as i64) {
            let level = self.indir_level(ino, lbn)?;
            let flags = Visit {
                indirect: true,
                ext: false,
                trusted: false,
            };
            let mut total = 0_u64;
            return self.indir_visit(ino, lbn, level, blk, flags, &mut total, &mut |ctx, ino, lbn, blk, frags| {
                ctx.free_visit(ino, lbn, blk, frags)
            });
        }
        self.free_range(blk, mask, frags)
    }

    /// Fragments currently at `lbn` of `ino` if they start at `blk`.
    ///
    /// A released inode owns nothing.
    fn block_is_at(&mut self, ino: InodeNumber, lbn: Lbn, blk: FragAddr) -> Result<Option<u32>> {
        let dinode = self.inode_read(ino)?;
        if dinode.nlink() == 0 || dinode.mode() == 0 {
            return Ok(None);
        }
        let (addr, frags) = self.block_at(ino, &dinode, lbn)?;
        Ok((addr == blk).then_some(frags))
    }

    /// Reconcile every journaled range of the block at `base`.
    pub fn reconcile_block(&mut self, base: FragAddr) -> Result<()> {
        let Some(entries) = self.block_aggregate(base)?.map(|agg| agg.entries.clone()) else {
            return Ok(());
        };
        let mut last_owner = None;
        for entry in entries {
            let blk = FragAddr(base.0 + u64::from(entry.off));
            if last_owner != Some(entry.ino) {
                self.inode_aggregate_or_insert(entry.ino)?.recount_blocks = true;
                last_owner = Some(entry.ino);
            }
            let current = self.block_is_at(entry.ino, entry.lbn, blk)?;
            trace!(
                blk = blk.0,
                ino = entry.ino.0,
                lbn = entry.lbn.0,
                frags = entry.frags,
                op = ?entry.op,
                current = ?current,
                "reconciling block record"
            );
            match current {
                Some(held) if held >= entry.frags => {}
                Some(held) => {
                    // The owner shrank: release the tail it gave up.
                    let mask = self.free_mask(blk, entry.ino, entry.lbn, entry.frags)? >> held;
                    let tail = blk
                        .checked_add(u64::from(held))
                        .ok_or_else(|| SujError::corruption(blk.0, "block address overflow"))?;
                    self.free_range(tail, mask, entry.frags - held)?;
                }
                None => {
                    let follow = entry.op == BlockOp::Free;
                    self.free_lbn(blk, entry.ino, entry.lbn, entry.frags, follow)?;
                }
            }
        }
        Ok(())
    }

    /// Rewrite `di_blocks` of `ino` from the blocks it actually references.
    pub fn recompute_block_count(&mut self, ino: InodeNumber) -> Result<()> {
        let mut dinode = self.inode_read(ino)?;
        if dinode.mode() == 0 {
            return Ok(());
        }
        let frags = self.ino_visit(ino, &dinode, Visit::ALL, &mut |_, _, _, _, _| Ok(()))?;
        let blocks = self.sb.frags_to_sectors(frags);
        if blocks == dinode.blocks() {
            return Ok(());
        }
        debug!(ino = ino.0, old = dinode.blocks(), new = blocks, "adjusting block count");
        dinode.set_blocks(blocks);
        self.inode_write(ino, &dinode)
    }

    /// Reconcile every block aggregate, then recount every inode a block
    /// record touched.
    pub fn reconcile_blocks(&mut self) -> Result<()> {
        for base in self.aggregated_blocks() {
            self.reconcile_block(base)?;
        }
        for ino in self.aggregated_inodes() {
            let recount = self
                .inode_aggregate(ino)?
                .is_some_and(|agg| agg.recount_blocks);
            if recount {
                self.recompute_block_count(ino)?;
            }
        }
        Ok(())
    }
}
