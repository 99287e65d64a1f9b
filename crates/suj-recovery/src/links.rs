//! Link-count reconciliation and inode release.
//!
//! A journaled reference counts only if the named slot still holds the
//! inode. The surviving count is written back, and an inode left below
//! its minimum is truncated and freed, cascading into the children of a
//! released directory.

use suj_alloc::{bitmap_clear, bitmap_get};
use suj_block::ByteDevice;
use suj_dir::{dt_to_if, entries, entry_at};
use suj_error::{Result, SujError};
use suj_types::{
    DOTDOT_OFFSET, FragAddr, InodeNumber, Lbn, UFS_LINK_MAX, file_type, is_dir,
};
use tracing::{debug, trace, warn};

use crate::aggregate::RefOp;
use crate::context::{RecoveryContext, corrupt_at};
use crate::visit::Visit;

/// What a directory slot holds for a given inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryPresence {
    pub found: bool,
    /// The slot is "." or "..".
    pub is_dot: bool,
    /// File-type bits from the entry's `d_type`.
    pub mode: u16,
}

impl EntryPresence {
    const ABSENT: Self = Self {
        found: false,
        is_dot: false,
        mode: 0,
    };
}

/// A live entry of a directory block being released.
struct Child {
    ino: InodeNumber,
    offset: u64,
    is_dotdot: bool,
}

fn required_links(mode: u16) -> i64 {
    if is_dir(mode) { 2 } else { 1 }
}

impl<D: ByteDevice> RecoveryContext<D> {
    /// Whether the entry at byte `diroff` of directory `parent` names
    /// `child`.
    pub fn entry_is_at(&mut self, parent: InodeNumber, diroff: u64, child: InodeNumber) -> Result<EntryPresence> {
        let dinode = self.inode_read(parent)?;
        if !is_dir(dinode.mode()) {
            trace!(parent = parent.0, "parent is not a directory");
            return Ok(EntryPresence::ABSENT);
        }
        let lbn = i64::try_from(self.sb.lblkno(diroff))
            .map_err(|_| SujError::LbnOutOfRange { ino: parent.0, lbn: i64::MAX })?;
        let (blk, frags) = self.block_at(parent, &dinode, Lbn(lbn))?;
        if blk.is_hole() || frags == 0 {
            return Ok(EntryPresence::ABSENT);
        }
        let size = frags as usize * self.sb.fsize as usize;
        let offset = self.sb.blkoff(diroff) as usize;
        let block = self.data_block_read(blk, size)?;
        let entry = entry_at(block, offset).map_err(|_| SujError::DirectoryOffset {
            ino: parent.0,
            offset: diroff,
            block_size: size as u64,
        })?;
        Ok(match entry {
            Some(e) if e.ino == child => EntryPresence {
                found: true,
                is_dot: child == parent || e.is_dotdot(),
                mode: dt_to_if(e.d_type),
            },
            _ => EntryPresence::ABSENT,
        })
    }

    /// Recompute the link count of `ino` from its journaled references.
    pub fn reconcile_inode(&mut self, ino: InodeNumber) -> Result<()> {
        let Some(agg) = self.inode_aggregate(ino)? else {
            return Ok(());
        };
        if !agg.has_records || agg.reconciled {
            return Ok(());
        }
        let refs = agg.refs.clone();
        let deferred = agg.nlink_adjust;
        let (Some(first), Some(last)) = (refs.first(), refs.last()) else {
            return Ok(());
        };
        let mut links = i64::from(first.nlink);
        let journaled_mode = last.mode;
        let mut removes = deferred;
        let mut dotlinks = 0_i64;

        for r in &refs {
            let at = self.entry_is_at(r.parent, r.diroff, ino)?;
            let present = at.found && file_type(at.mode) == file_type(r.mode);
            if at.found && !present {
                warn!(
                    ino = ino.0,
                    parent = r.parent.0,
                    diroff = r.diroff,
                    entry_mode = at.mode,
                    journal_mode = r.mode,
                    "directory entry type does not match journal"
                );
            }
            if r.op == RefOp::Remove {
                removes += 1;
            }
            if present {
                links += 1;
                if at.is_dot {
                    dotlinks += 1;
                }
            }
            trace!(
                ino = ino.0,
                parent = r.parent.0,
                diroff = r.diroff,
                op = ?r.op,
                present,
                "checked reference"
            );
        }
        links -= removes;

        if let Some(agg) = self.inode_aggregate(ino)? {
            agg.reconciled = true;
        }

        if is_dir(journaled_mode) && links - dotlinks == 0 {
            debug!(ino = ino.0, dotlinks, "directory has no names left");
            links = 0;
            for r in refs.iter().filter(|r| r.diroff == DOTDOT_OFFSET) {
                self.mark_skip_parent(r.parent, ino)?;
            }
        }
        self.apply_link_count(ino, links)
    }

    /// Stop the child directory `dir` from following its ".." when it is
    /// released.
    fn mark_skip_parent(&mut self, dir: InodeNumber, target: InodeNumber) -> Result<()> {
        if let Some(agg) = self.inode_aggregate(dir)? {
            trace!(dir = dir.0, target = target.0, "parent decrement skipped");
            agg.skip_parent = true;
        }
        Ok(())
    }

    /// Write `links` into `ino`, releasing it when below its minimum.
    pub fn apply_link_count(&mut self, ino: InodeNumber, links: i64) -> Result<()> {
        let mut dinode = self.inode_read(ino)?;
        let mode = dinode.mode();
        if mode == 0 {
            debug!(ino = ino.0, links, "inode already free");
            return Ok(());
        }
        if links > UFS_LINK_MAX {
            return Err(SujError::LinkCountOverflow { ino: ino.0, links });
        }
        if links < required_links(mode) {
            debug!(ino = ino.0, links, "no links remain");
            return self.truncate_and_free(ino);
        }
        if i64::from(dinode.nlink()) == links {
            return Ok(());
        }
        let nlink = i16::try_from(links).map_err(|_| SujError::LinkCountOverflow { ino: ino.0, links })?;
        debug!(ino = ino.0, old = dinode.nlink(), new = nlink, "adjusting link count");
        dinode.set_nlink(nlink);
        self.inode_write(ino, &dinode)
    }

    /// Drop one link of `ino`, releasing it when below its minimum.
    pub fn decrement_link(&mut self, ino: InodeNumber) -> Result<()> {
        if self.in_truncation.contains(&ino) {
            trace!(ino = ino.0, "decrement of inode being released");
            return Ok(());
        }
        let mut dinode = self.inode_read(ino)?;
        let mode = dinode.mode();
        let nlink = dinode.nlink();
        if mode == 0 || nlink < 1 {
            warn!(ino = ino.0, mode, nlink, "link decrement of unlinked inode");
            return Ok(());
        }
        let links = i64::from(nlink) - 1;
        if links < required_links(mode) {
            debug!(ino = ino.0, links, "last link dropped");
            return self.truncate_and_free(ino);
        }
        dinode.set_nlink(nlink - 1);
        self.inode_write(ino, &dinode)
    }

    /// Account for the entry of `child` at `diroff` in `parent`
    /// disappearing along with `parent`.
    fn remove_reference(
        &mut self,
        parent: InodeNumber,
        child: InodeNumber,
        diroff: u64,
        is_dotdot: bool,
    ) -> Result<()> {
        if let Some(agg) = self.inode_aggregate(child)? {
            if !is_dotdot {
                agg.skip_parent = true;
            }
            if agg.has_records && !agg.reconciled {
                if agg.refs.iter().any(|r| r.parent == parent && r.diroff == diroff) {
                    trace!(
                        parent = parent.0,
                        child = child.0,
                        diroff,
                        "released slot already journaled"
                    );
                    return Ok(());
                }
                agg.nlink_adjust += 1;
                trace!(
                    parent = parent.0,
                    child = child.0,
                    diroff,
                    "link decrement deferred"
                );
                return Ok(());
            }
        }
        trace!(parent = parent.0, child = child.0, diroff, "link decrement");
        self.decrement_link(child)
    }

    /// Visitor dropping the references held by one block of a directory
    /// being released.
    fn free_children(&mut self, dir: InodeNumber, lbn: Lbn, blk: FragAddr, frags: u32) -> Result<()> {
        let size = frags as usize * self.sb.fsize as usize;
        let lbn = u64::try_from(lbn.0).map_err(|_| SujError::LbnOutOfRange { ino: dir.0, lbn: lbn.0 })?;
        let base = self.sb.lblktosize(lbn);
        let block = self.data_block_read(blk, size)?;
        let mut children = Vec::new();
        for entry in entries(block) {
            let entry = entry.map_err(|err| match err {
                SujError::Corruption { detail, .. } => SujError::corruption(blk.0, detail),
                other => other,
            })?;
            if entry.ino.0 <= InodeNumber::WHITEOUT.0 || entry.is_dot() {
                continue;
            }
            children.push(Child {
                ino: entry.ino,
                offset: base + entry.offset as u64,
                is_dotdot: entry.is_dotdot(),
            });
        }
        let skip_parent = self.inode_aggregate(dir)?.is_some_and(|agg| agg.skip_parent);
        for child in children {
            if child.is_dotdot && skip_parent {
                continue;
            }
            self.remove_reference(dir, child.ino, child.offset, child.is_dotdot)?;
        }
        Ok(())
    }

    /// Release `ino`: drop the references a directory holds, free every
    /// block, clear the inode keeping its generation, and free its bit.
    pub fn truncate_and_free(&mut self, ino: InodeNumber) -> Result<()> {
        if ino == InodeNumber::ROOT {
            return Err(SujError::RootInodeFree);
        }
        if !self.in_truncation.insert(ino) {
            return Ok(());
        }
        let dinode = self.inode_read(ino)?;
        let mode = dinode.mode();
        debug!(ino = ino.0, mode, nlink = dinode.nlink(), size = dinode.size(), "releasing inode");
        if is_dir(mode) {
            self.ino_visit(ino, &dinode, Visit::DATA, &mut |ctx, ino, lbn, blk, frags| {
                ctx.free_children(ino, lbn, blk, frags)
            })?;
        }

        let mut dinode = self.inode_read(ino)?;
        dinode.set_nlink(0);
        self.ino_visit(ino, &dinode, Visit::ALL, &mut |ctx, ino, lbn, blk, frags| {
            ctx.free_visit(ino, lbn, blk, frags)
        })?;
        dinode.clear_preserving_generation();
        self.inode_write(ino, &dinode)?;
        self.free_inode(ino, mode)
    }

    /// Clear the allocation bit of `ino` and update its group's counters.
    fn free_inode(&mut self, ino: InodeNumber, mode: u16) -> Result<()> {
        let cg = self.sb.ino_to_cg(ino);
        let idx = self.sb.ino_index(ino);
        let cgtod = self.sb.cgtod(cg);
        let (group, sb) = self.group_and_sb(cg)?;
        let map = group.cg.inosused_mut(sb).map_err(corrupt_at(cgtod))?;
        if !bitmap_get(map, idx) {
            debug!(ino = ino.0, "inode already free in bitmap");
            return Ok(());
        }
        bitmap_clear(map, idx);
        if idx < group.cg.irotor().map_err(corrupt_at(cgtod))? {
            group.cg.set_irotor(idx).map_err(corrupt_at(cgtod))?;
        }
        let mut cs = group.cg.cs().map_err(corrupt_at(cgtod))?;
        cs.nifree += 1;
        if is_dir(mode) {
            cs.ndir -= 1;
        }
        group.cg.set_cs(&cs).map_err(corrupt_at(cgtod))?;
        group.dirty = true;
        self.stats.freed_inodes += 1;
        if is_dir(mode) {
            self.stats.freed_dirs += 1;
        }
        Ok(())
    }

    /// Reconcile every inode aggregate.
    pub fn reconcile_inodes(&mut self) -> Result<()> {
        for ino in self.aggregated_inodes() {
            self.reconcile_inode(ino)?;
        }
        Ok(())
    }
}
