//! Folding journal records into per-inode and per-block aggregates.
//!
//! Records arrive oldest first. Reference records are merged by directory
//! slot, moves are chained so a later record at the new offset can be
//! traced back to the original slot, and block records are deduplicated by
//! exact range.

use suj_block::ByteDevice;
use suj_error::{Result, SujError};
use suj_journal::{JournalRecord, JournalSegment};
use suj_ondisk::{BlockRecord, MoveRecord, RefRecord};
use suj_types::{FragAddr, InodeNumber, Lbn};
use tracing::{debug, trace};

use crate::context::RecoveryContext;

/// Direction of a journaled name change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefOp {
    Add,
    Remove,
}

/// The newest journaled state of one directory slot naming an inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefEntry {
    pub op: RefOp,
    pub parent: InodeNumber,
    pub diroff: u64,
    /// Link count when the record was written.
    pub nlink: u16,
    pub mode: u16,
}

impl RefEntry {
    #[must_use]
    pub fn from_record(op: RefOp, rec: &RefRecord) -> Self {
        Self {
            op,
            parent: rec.parent,
            diroff: rec.diroff,
            nlink: rec.nlink,
            mode: rec.mode,
        }
    }
}

/// A pending move of a name within `parent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoveEntry {
    pub parent: InodeNumber,
    pub old_off: u64,
    pub new_off: u64,
}

impl From<&MoveRecord> for MoveEntry {
    fn from(rec: &MoveRecord) -> Self {
        Self {
            parent: rec.parent,
            old_off: rec.old_off,
            new_off: rec.new_off,
        }
    }
}

/// Everything the journal says about one inode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InodeAggregate {
    pub(crate) refs: Vec<RefEntry>,
    pub(crate) moves: Vec<MoveEntry>,
    /// Link decrements deferred until this inode is reconciled.
    pub(crate) nlink_adjust: i64,
    /// At least one reference record was aggregated.
    pub(crate) has_records: bool,
    pub(crate) reconciled: bool,
    /// Do not follow this directory's ".." when it is truncated.
    pub(crate) skip_parent: bool,
    /// A block record touched this inode; recount `di_blocks`.
    pub(crate) recount_blocks: bool,
}

impl InodeAggregate {
    #[must_use]
    pub fn refs(&self) -> &[RefEntry] {
        &self.refs
    }

    #[must_use]
    pub fn moves(&self) -> &[MoveEntry] {
        &self.moves
    }

    /// Link decrements owed by released parent directories.
    #[must_use]
    pub fn nlink_adjust(&self) -> i64 {
        self.nlink_adjust
    }

    #[must_use]
    pub fn skip_parent(&self) -> bool {
        self.skip_parent
    }

    /// Merge `entry` with the newest record for the same slot.
    ///
    /// An add superseded by a remove is replaced in place, keeping the
    /// add's link count. Any other collision only refreshes the mode.
    pub(crate) fn add_ref(&mut self, entry: RefEntry) {
        self.has_records = true;
        let existing = self
            .refs
            .iter_mut()
            .rev()
            .find(|r| r.parent == entry.parent && r.diroff == entry.diroff);
        if let Some(existing) = existing {
            if existing.op == RefOp::Add && entry.op == RefOp::Remove {
                *existing = RefEntry {
                    nlink: existing.nlink,
                    ..entry
                };
            } else {
                existing.mode = entry.mode;
            }
            return;
        }
        self.refs.push(entry);
    }

    /// Record a move, extending an earlier move that ended where this one
    /// starts.
    pub(crate) fn add_move(&mut self, mv: MoveEntry) {
        let chained = self
            .moves
            .iter_mut()
            .find(|m| m.parent == mv.parent && m.new_off == mv.old_off);
        match chained {
            Some(prev) => prev.new_off = mv.new_off,
            None => self.moves.push(mv),
        }
    }

    /// Consume every pending move that landed on `diroff`, newest first,
    /// returning the original slots in the order they were unwound.
    pub(crate) fn unwind_moves(&mut self, parent: InodeNumber, mut diroff: u64) -> Vec<u64> {
        let mut origins = Vec::new();
        let mut i = self.moves.len();
        while i > 0 {
            i -= 1;
            let mv = self.moves[i];
            if mv.parent != parent || mv.new_off != diroff {
                continue;
            }
            diroff = mv.old_off;
            self.moves.remove(i);
            origins.push(diroff);
        }
        origins
    }
}

/// Journaled operation on a fragment range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOp {
    New,
    Free,
}

/// One journaled allocation or free inside a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockEntry {
    pub op: BlockOp,
    pub ino: InodeNumber,
    pub lbn: Lbn,
    /// First fragment, relative to the block.
    pub off: u32,
    pub frags: u32,
}

impl BlockEntry {
    /// Fragments of the block this entry covers.
    #[must_use]
    pub fn mask(&self) -> u32 {
        let bits = if self.frags >= 32 {
            u32::MAX
        } else {
            (1_u32 << self.frags) - 1
        };
        bits << self.off
    }

    /// Whether `[start, start + frags)` (relative to the block) intersects
    /// this entry.
    #[must_use]
    pub fn overlaps(&self, start: u32, frags: u32) -> bool {
        start < self.off + self.frags && self.off < start + frags
    }

    /// Whether this entry records exactly `ino`/`lbn` starting at `start`
    /// and covering at least `frags` fragments.
    #[must_use]
    pub fn covers(&self, ino: InodeNumber, lbn: Lbn, start: u32, frags: u32) -> bool {
        self.ino == ino && self.lbn == lbn && self.off == start && self.frags >= frags
    }

    fn same_range(&self, other: &Self) -> bool {
        self.ino == other.ino
            && self.lbn == other.lbn
            && self.off == other.off
            && self.frags == other.frags
    }
}

/// Journal records touching one block, oldest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockAggregate {
    pub(crate) base: FragAddr,
    pub(crate) entries: Vec<BlockEntry>,
}

impl BlockAggregate {
    pub(crate) fn new(base: FragAddr) -> Self {
        Self {
            base,
            entries: Vec::new(),
        }
    }

    #[must_use]
    pub fn base(&self) -> FragAddr {
        self.base
    }

    #[must_use]
    pub fn entries(&self) -> &[BlockEntry] {
        &self.entries
    }

    /// Add `entry`, superseding an identical older range.
    ///
    /// A free of a range already recorded is dropped: the older record
    /// already says everything reconciliation needs.
    pub(crate) fn push(&mut self, entry: BlockEntry) {
        if let Some(pos) = self.entries.iter().position(|e| e.same_range(&entry)) {
            if entry.op == BlockOp::Free {
                return;
            }
            self.entries.remove(pos);
        }
        self.entries.push(entry);
    }
}

impl<D: ByteDevice> RecoveryContext<D> {
    /// Merge a name add or remove into the aggregate of `ino`.
    pub fn aggregate_reference(&mut self, ino: InodeNumber, mut entry: RefEntry) -> Result<()> {
        let agg = self.inode_aggregate_or_insert(ino)?;
        let origins = agg.unwind_moves(entry.parent, entry.diroff);
        for &origin in &origins {
            agg.add_ref(RefEntry {
                op: RefOp::Add,
                diroff: origin,
                ..entry
            });
        }
        if let (Some(&origin), RefOp::Remove) = (origins.last(), entry.op) {
            entry.diroff = origin;
        }
        trace!(
            ino = ino.0,
            parent = entry.parent.0,
            diroff = entry.diroff,
            op = ?entry.op,
            nlink = entry.nlink,
            "reference aggregated"
        );
        agg.add_ref(entry);
        Ok(())
    }

    /// Merge a name move into the aggregate of `ino`.
    pub fn aggregate_move(&mut self, ino: InodeNumber, mv: MoveEntry) -> Result<()> {
        let source = self
            .inode_aggregate_or_insert(ino)?
            .refs
            .iter()
            .rev()
            .find(|r| r.op == RefOp::Add && r.parent == mv.parent && r.diroff == mv.old_off)
            .copied();
        if let Some(add) = source {
            self.aggregate_reference(
                ino,
                RefEntry {
                    diroff: mv.new_off,
                    ..add
                },
            )?;
        }
        trace!(
            ino = ino.0,
            parent = mv.parent.0,
            old_off = mv.old_off,
            new_off = mv.new_off,
            "move aggregated"
        );
        self.inode_aggregate_or_insert(ino)?.add_move(mv);
        Ok(())
    }

    /// Record an allocation or free of a fragment range.
    pub fn aggregate_block(&mut self, op: BlockOp, rec: &BlockRecord) -> Result<()> {
        let frag = self.sb.frag;
        let base = self.sb.blknum(rec.blkno);
        let off = self.sb.fragnum(rec.blkno);
        let frags = u32::from(rec.frags);
        if frags == 0 || off + frags > frag {
            return Err(SujError::corruption(
                rec.blkno.0,
                format!("journal block record of {frags} fragments at offset {off}"),
            ));
        }
        let entry = BlockEntry {
            op,
            ino: rec.ino,
            lbn: rec.lbn,
            off,
            frags,
        };
        trace!(
            blk = rec.blkno.0,
            ino = rec.ino.0,
            lbn = rec.lbn.0,
            frags,
            op = ?op,
            "block aggregated"
        );
        self.block_aggregate_or_insert(base)?.push(entry);
        Ok(())
    }

    /// Fold one decoded record into the aggregates.
    pub fn aggregate_record(&mut self, rec: &JournalRecord) -> Result<()> {
        match rec {
            JournalRecord::AddRef(r) => {
                self.aggregate_reference(r.ino, RefEntry::from_record(RefOp::Add, r))
            }
            JournalRecord::RemoveRef(r) => {
                self.aggregate_reference(r.ino, RefEntry::from_record(RefOp::Remove, r))
            }
            JournalRecord::Move(m) => self.aggregate_move(m.ino, MoveEntry::from(m)),
            JournalRecord::NewBlock(b) => self.aggregate_block(BlockOp::New, b),
            JournalRecord::FreeBlock(b) => self.aggregate_block(BlockOp::Free, b),
        }
    }

    /// Fold every record of `segments`, in order. Returns the record count.
    pub fn aggregate_segments(&mut self, segments: &[JournalSegment]) -> Result<u64> {
        let mut count = 0_u64;
        for seg in segments {
            for rec in seg.records()? {
                self.aggregate_record(&rec)?;
                count += 1;
            }
        }
        debug!(segments = segments.len(), records = count, "journal aggregated");
        Ok(count)
    }
}
