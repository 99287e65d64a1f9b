//! Per-group caches: cylinder group blocks, inode blocks and data blocks.
//!
//! Everything is loaded on first use and kept until writeback. Only inode
//! blocks and cylinder groups are ever written back; data and indirect
//! blocks are read-only.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

use suj_alloc::bitmap_get;
use suj_block::{ByteDevice, DiskDevice};
use suj_error::{Result, SujError};
use suj_ondisk::{CylinderGroup, Dinode, Superblock};
use suj_types::{CK_CYLGRP, CK_INODE, DINODE2_SIZE, FragAddr, GroupNumber, InodeNumber};
use tracing::{trace, warn};

use crate::aggregate::{BlockAggregate, InodeAggregate};
use crate::context::{RecoveryContext, corrupt_at};

/// An inode block held in memory.
#[derive(Debug, Clone)]
pub(crate) struct CachedBlock {
    pub(crate) buf: Vec<u8>,
    pub(crate) dirty: bool,
}

/// Cached state of one cylinder group.
#[derive(Debug)]
pub(crate) struct GroupCache {
    pub(crate) cg: CylinderGroup,
    /// Bitmaps changed; the summary must be recomputed and written.
    pub(crate) dirty: bool,
    pub(crate) inodes: BTreeMap<InodeNumber, InodeAggregate>,
    /// Keyed by block-aligned fragment address.
    pub(crate) blocks: BTreeMap<FragAddr, BlockAggregate>,
    pub(crate) inode_blocks: BTreeMap<FragAddr, CachedBlock>,
}

impl GroupCache {
    fn new(cg: CylinderGroup) -> Self {
        Self {
            cg,
            dirty: false,
            inodes: BTreeMap::new(),
            blocks: BTreeMap::new(),
            inode_blocks: BTreeMap::new(),
        }
    }
}

fn load_group<D: ByteDevice>(
    dev: &mut DiskDevice<D>,
    sb: &Superblock,
    cg: GroupNumber,
) -> Result<CylinderGroup> {
    let addr = sb.cgtod(cg);
    let buf = dev.read(sb.fsbtodb(addr), sb.cgsize as usize)?;
    let group = CylinderGroup::parse(buf, cg)
        .map_err(|err| SujError::corruption(addr.0, format!("cylinder group {cg}: {err}")))?;
    if sb.ckhash_enabled(CK_CYLGRP) {
        let stored = group.ckhash().map_err(corrupt_at(addr))?;
        let mut probe = group.clone();
        probe.update_ckhash().map_err(corrupt_at(addr))?;
        let computed = probe.ckhash().map_err(corrupt_at(addr))?;
        if stored != computed {
            warn!(cg = cg.0, stored, computed, "cylinder group check hash mismatch");
        }
    }
    trace!(cg = cg.0, addr = addr.0, "cylinder group loaded");
    Ok(group)
}

impl<D: ByteDevice> RecoveryContext<D> {
    /// The cached group `cg` together with the superblock, loading the
    /// group on first use.
    pub(crate) fn group_and_sb(
        &mut self,
        cg: GroupNumber,
    ) -> Result<(&mut GroupCache, &Superblock)> {
        if cg.0 >= self.sb.ncg {
            return Err(SujError::GroupOutOfRange {
                group: cg.0,
                ncg: self.sb.ncg,
            });
        }
        let Self {
            dev, sb, groups, ..
        } = self;
        let group = match groups.entry(cg) {
            Entry::Occupied(slot) => slot.into_mut(),
            Entry::Vacant(slot) => slot.insert(GroupCache::new(load_group(dev, sb, cg)?)),
        };
        Ok((group, sb))
    }

    /// Load or fetch the cached state of cylinder group `cg`.
    pub(crate) fn cg_lookup(&mut self, cg: GroupNumber) -> Result<&mut GroupCache> {
        self.group_and_sb(cg).map(|(group, _)| group)
    }

    /// Read `size` bytes at `addr` through the data cache.
    ///
    /// A cached copy of a different length is discarded and reread.
    pub(crate) fn data_block_read(&mut self, addr: FragAddr, size: usize) -> Result<&[u8]> {
        let frags = u32::try_from(size.div_ceil(self.sb.fsize as usize)).unwrap_or(u32::MAX);
        self.check_range(addr, frags)?;
        let stale = self
            .data_blocks
            .get(&addr)
            .is_none_or(|buf| buf.len() != size);
        if stale {
            let buf = self.dev.read(self.sb.fsbtodb(addr), size)?;
            trace!(addr = addr.0, size, "data block loaded");
            self.data_blocks.insert(addr, buf);
        }
        self.data_blocks
            .get(&addr)
            .map(Vec::as_slice)
            .ok_or_else(|| SujError::corruption(addr.0, "data block vanished from cache"))
    }

    fn check_inode(&self, ino: InodeNumber) -> Result<()> {
        if ino.is_none() || u64::from(ino.0) >= self.sb.maxino() {
            return Err(SujError::corruption(
                0,
                format!("inode {ino} outside 1..{}", self.sb.maxino()),
            ));
        }
        Ok(())
    }

    /// The cached inode block holding `ino` and the byte offset of its slot.
    fn inode_slot(&mut self, ino: InodeNumber) -> Result<(&mut CachedBlock, usize)> {
        self.check_inode(ino)?;
        let cg = self.sb.ino_to_cg(ino);
        let addr = self.sb.ino_to_fsba(ino);
        let offset = self.sb.ino_to_fsbo(ino) * DINODE2_SIZE;
        let bsize = self.sb.bsize as usize;
        let dev_addr = self.sb.fsbtodb(addr);
        if !self.cg_lookup(cg)?.inode_blocks.contains_key(&addr) {
            let buf = self.dev.read(dev_addr, bsize)?;
            trace!(cg = cg.0, addr = addr.0, "inode block loaded");
            self.cg_lookup(cg)?
                .inode_blocks
                .insert(addr, CachedBlock { buf, dirty: false });
        }
        let block = self
            .cg_lookup(cg)?
            .inode_blocks
            .get_mut(&addr)
            .ok_or_else(|| SujError::corruption(addr.0, "inode block vanished from cache"))?;
        Ok((block, offset))
    }

    /// Copy of the on-disk inode `ino` as currently cached.
    pub fn inode_read(&mut self, ino: InodeNumber) -> Result<Dinode> {
        let check = self.sb.ckhash_enabled(CK_INODE);
        let (block, offset) = self.inode_slot(ino)?;
        let raw = &block.buf[offset..offset + DINODE2_SIZE];
        let dinode = Dinode::from_bytes(raw).map_err(|err| SujError::Parse(err.to_string()))?;
        if check && dinode.mode() != 0 {
            let mut probe = dinode.clone();
            probe.update_ckhash();
            if probe.ckhash() != dinode.ckhash() {
                warn!(ino = ino.0, "inode check hash mismatch");
            }
        }
        Ok(dinode)
    }

    /// Store `dinode` into the cached inode block and mark it dirty.
    pub fn inode_write(&mut self, ino: InodeNumber, dinode: &Dinode) -> Result<()> {
        let mut dinode = dinode.clone();
        if self.sb.ckhash_enabled(CK_INODE) {
            dinode.update_ckhash();
        }
        let (block, offset) = self.inode_slot(ino)?;
        block.buf[offset..offset + DINODE2_SIZE].copy_from_slice(dinode.as_bytes());
        block.dirty = true;
        Ok(())
    }

    /// Whether fragment `addr` is free in its group's bitmap.
    pub(crate) fn frag_is_free(&mut self, addr: FragAddr) -> Result<bool> {
        self.check_range(addr, 1)?;
        let cg = self.sb.dtog(addr);
        let cgbno = self.sb.dtogd(addr);
        let cgtod = self.sb.cgtod(cg);
        let (group, sb) = self.group_and_sb(cg)?;
        let map = group.cg.blksfree(sb).map_err(corrupt_at(cgtod))?;
        Ok(bitmap_get(map, cgbno))
    }

    /// The aggregate of `ino`, if one exists.
    pub(crate) fn inode_aggregate(&mut self, ino: InodeNumber) -> Result<Option<&mut InodeAggregate>> {
        self.check_inode(ino)?;
        let cg = self.sb.ino_to_cg(ino);
        Ok(self.cg_lookup(cg)?.inodes.get_mut(&ino))
    }

    pub(crate) fn inode_aggregate_or_insert(&mut self, ino: InodeNumber) -> Result<&mut InodeAggregate> {
        self.check_inode(ino)?;
        let cg = self.sb.ino_to_cg(ino);
        Ok(self.cg_lookup(cg)?.inodes.entry(ino).or_default())
    }

    /// The aggregate of the block starting at `base`, if one exists.
    pub(crate) fn block_aggregate(&mut self, base: FragAddr) -> Result<Option<&BlockAggregate>> {
        let cg = self.sb.dtog(base);
        Ok(self.cg_lookup(cg)?.blocks.get(&base))
    }

    pub(crate) fn block_aggregate_or_insert(&mut self, base: FragAddr) -> Result<&mut BlockAggregate> {
        let frag = self.sb.frag;
        self.check_range(base, frag)?;
        let cg = self.sb.dtog(base);
        Ok(self
            .cg_lookup(cg)?
            .blocks
            .entry(base)
            .or_insert_with(|| BlockAggregate::new(base)))
    }

    /// Copy of the aggregate of `ino`.
    pub fn aggregate_of(&mut self, ino: InodeNumber) -> Result<Option<InodeAggregate>> {
        Ok(self.inode_aggregate(ino)?.map(|agg| agg.clone()))
    }

    /// Copy of the aggregate of the block containing `addr`.
    pub fn block_aggregate_of(&mut self, addr: FragAddr) -> Result<Option<BlockAggregate>> {
        let base = self.sb.blknum(addr);
        Ok(self.block_aggregate(base)?.cloned())
    }

    /// Every inode aggregate key, in group then inode order.
    pub(crate) fn aggregated_inodes(&self) -> Vec<InodeNumber> {
        self.groups
            .values()
            .flat_map(|group| group.inodes.keys().copied())
            .collect()
    }

    /// Every block aggregate key, in address order.
    pub(crate) fn aggregated_blocks(&self) -> Vec<FragAddr> {
        self.groups
            .values()
            .flat_map(|group| group.blocks.keys().copied())
            .collect()
    }
}
