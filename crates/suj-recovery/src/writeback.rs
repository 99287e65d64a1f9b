use serde::{Deserialize, Serialize};
use suj_alloc::GroupSummary;
use suj_block::ByteDevice;
use suj_error::{Result, SujError};
use suj_ondisk::{CsumTotal, write_csum_array};
use suj_types::{CK_CYLGRP, DevAddr, FragAddr, SBLOCK_UFS2, u64_to_usize};
use tracing::{debug, info};

use crate::context::{RecoveryContext, corrupt_at};

/// What writeback put on disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WritebackStats {
    pub inode_blocks: usize,
    pub groups: usize,
}

fn to_i32(value: u32, addr: FragAddr) -> Result<i32> {
    i32::try_from(value).map_err(|_| SujError::corruption(addr.0, format!("count {value} overflows")))
}

impl<D: ByteDevice> RecoveryContext<D> {
    /// Flush every change: inode blocks, then cylinder groups with fresh
    /// summaries, then the summary area and a clean superblock.
    pub fn writeback(&mut self) -> Result<WritebackStats> {
        let mut stats = WritebackStats::default();

        for group in self.groups.values_mut() {
            for (addr, block) in &mut group.inode_blocks {
                if !block.dirty {
                    continue;
                }
                self.dev.write(self.sb.fsbtodb(*addr), &block.buf)?;
                block.dirty = false;
                stats.inode_blocks += 1;
            }
        }

        for (cg, group) in &mut self.groups {
            if !group.dirty {
                continue;
            }
            let addr = self.sb.cgtod(*cg);
            let err = corrupt_at(addr);
            let ndblk = group.cg.ndblk().map_err(err)?;
            let blksfree = group.cg.blksfree(&self.sb).map_err(err)?.to_vec();
            let clusters = group.cg.clustersfree_mut(&self.sb).map_err(err)?;
            let summary = GroupSummary::recompute(
                &blksfree,
                ndblk,
                self.sb.frag,
                self.sb.contigsumsize,
                clusters,
            );
            let mut cs = group.cg.cs().map_err(err)?;
            cs.nbfree = to_i32(summary.nbfree, addr)?;
            cs.nffree = to_i32(summary.nffree, addr)?;
            group.cg.set_cs(&cs).map_err(err)?;
            group.cg.set_frsum(&summary.frsum).map_err(err)?;
            if !summary.clustersum.is_empty() {
                group.cg.set_clustersum(&self.sb, &summary.clustersum).map_err(err)?;
            }
            if self.sb.ckhash_enabled(CK_CYLGRP) {
                group.cg.update_ckhash().map_err(err)?;
            }
            self.dev.write(self.sb.fsbtodb(addr), group.cg.as_bytes())?;
            debug!(
                cg = cg.0,
                nbfree = cs.nbfree,
                nffree = cs.nffree,
                nifree = cs.nifree,
                ndir = cs.ndir,
                "cylinder group written"
            );
            if let Some(slot) = self.csums.get_mut(cg.0 as usize) {
                *slot = cs;
            }
            group.dirty = false;
            stats.groups += 1;
        }

        let csaddr = FragAddr(self.sb.csaddr);
        let area_len = u64_to_usize(self.sb.cssize_rounded(), "fs_cssize").map_err(corrupt_at(csaddr))?;
        let mut area = self.dev.read(self.sb.fsbtodb(csaddr), area_len)?;
        write_csum_array(&mut area, &self.csums).map_err(corrupt_at(csaddr))?;
        self.dev.write(self.sb.fsbtodb(csaddr), &area)?;

        self.sb.cstotal = CsumTotal::from_groups(&self.csums);
        self.sb.pendingblocks = 0;
        self.sb.pendinginodes = 0;
        self.sb.clean = true;
        self.sb.time = self.now;
        self.sb.mtime = self.now;
        let raw = self
            .sb
            .to_bytes()
            .map_err(|err| SujError::Format(format!("superblock: {err}")))?;
        self.dev.write(DevAddr::from_byte_offset(SBLOCK_UFS2), &raw)?;
        self.dev.sync()?;
        info!(
            inode_blocks = stats.inode_blocks,
            groups = stats.groups,
            nbfree = self.sb.cstotal.nbfree,
            nifree = self.sb.cstotal.nifree,
            "changes written"
        );
        Ok(stats)
    }
}
