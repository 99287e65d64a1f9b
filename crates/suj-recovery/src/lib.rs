#![forbid(unsafe_code)]
//! Soft-updates journal recovery for UFS2.
//!
//! Replays the journal a crashed mount left behind, so the filesystem can
//! be marked clean without a full check:
//!
//! 1. Locate and validate the journal file, map its extents, and read
//!    every segment written by the last mount.
//! 2. Prune to the contiguous run of segments starting at the oldest one
//!    still needed, and fold their records into per-inode and per-block
//!    aggregates.
//! 3. Release inodes on the unlinked list.
//! 4. Free blocks the journal shows as abandoned, recount `di_blocks`,
//!    and recompute link counts, releasing inodes left with none.
//! 5. Write inode blocks, cylinder groups with fresh summaries, and a
//!    clean superblock.
//!
//! Nothing touches the disk before step 5, so declining either
//! confirmation gate leaves the filesystem exactly as it was.

mod aggregate;
mod blocks;
mod cache;
mod confirm;
mod context;
mod journal;
mod links;
mod summary;
mod sweep;
mod visit;
mod writeback;

pub use aggregate::{
    BlockAggregate, BlockEntry, BlockOp, InodeAggregate, MoveEntry, RefEntry, RefOp,
};
pub use confirm::{AssumeNo, AssumeYes, Confirm, Gate};
pub use context::{RecoveryContext, RecoveryOptions, RecoveryStats};
pub use journal::JournalStatus;
pub use links::EntryPresence;
pub use summary::{RecoveryOutcome, RecoverySummary};
pub use visit::{Visit, Visitor, lbn_level};
pub use writeback::WritebackStats;

use serde::{Deserialize, Serialize};
use suj_block::{ByteDevice, DiskDevice};
use suj_error::Result;
use suj_journal::{PruneReport, prune_segments};
use suj_types::{DevAddr, JournalSeq};
use tracing::{info, info_span};

impl<D: ByteDevice> RecoveryContext<D> {
    fn ask(&self, confirm: &mut dyn Confirm, gate: Gate) -> bool {
        if self.options.preen {
            return true;
        }
        confirm.confirm(gate)
    }
}

/// Replay the journal on `device`.
///
/// Returns a summary for every non-fatal outcome, including a missing or
/// invalid journal and a declined gate. Errors mean the image is
/// unrecoverable by the journal alone; nothing has been written when one
/// is returned.
pub fn recover<D: ByteDevice>(
    device: D,
    options: RecoveryOptions,
    confirm: &mut dyn Confirm,
) -> Result<RecoverySummary> {
    let span = info_span!("suj_recover");
    let _guard = span.enter();

    let mut ctx = RecoveryContext::open(DiskDevice::new(device), options)?;
    let status = ctx.open_journal()?;
    let JournalStatus::Usable { ino } = status else {
        let outcome = RecoveryOutcome::from_status(&status).unwrap_or(RecoveryOutcome::JournalMissing);
        info!(outcome = ?outcome, "journal not replayed");
        return Ok(RecoverySummary::new(outcome));
    };

    let mut map = ctx.build_extent_map(ino)?;
    let mut scan = ctx.read_journal(&mut map)?;
    if !ctx.ask(confirm, Gate::Recover) {
        return Ok(RecoverySummary::new(RecoveryOutcome::Declined {
            gate: Gate::Recover,
        }));
    }

    info!("building recovery table");
    let report = prune_segments(&mut scan.segments, scan.oldest, ctx.options.dev_bsize)?;
    ctx.aggregate_segments(&scan.segments)?;

    info!("resolving unreferenced inode list");
    ctx.sweep_unlinked_list()?;

    info!("processing journal entries");
    ctx.reconcile_blocks()?;
    ctx.reconcile_inodes()?;

    if report.records > 0 && !ctx.ask(confirm, Gate::WriteChanges) {
        return Ok(RecoverySummary::new(RecoveryOutcome::Declined {
            gate: Gate::WriteChanges,
        }));
    }

    let written = ctx.writeback()?;
    let mut summary = RecoverySummary::new(RecoveryOutcome::Recovered);
    summary.record_prune(&report);
    summary.skipped_blocks = scan.skipped_blocks;
    summary.freed = ctx.stats();
    summary.written = written;
    info!(
        records = summary.journal_records,
        freed_inodes = summary.freed.freed_inodes,
        freed_blocks = summary.freed.freed_blocks,
        freed_frags = summary.freed.freed_frags,
        "journal recovery complete"
    );
    Ok(summary)
}

/// One segment kept after pruning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentInfo {
    pub seq: JournalSeq,
    pub oldest: JournalSeq,
    pub records: u16,
    pub addr: DevAddr,
}

/// Read-only view of a journal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalListing {
    pub status: JournalStatus,
    pub segments: Vec<SegmentInfo>,
    pub report: PruneReport,
    pub skipped_blocks: u64,
}

/// Locate, read and prune the journal on `device` without changing
/// anything.
pub fn inspect_journal<D: ByteDevice>(device: D, options: RecoveryOptions) -> Result<JournalListing> {
    let mut ctx = RecoveryContext::open(DiskDevice::new(device), options)?;
    let status = ctx.open_journal()?;
    let mut listing = JournalListing {
        status: status.clone(),
        segments: Vec::new(),
        report: PruneReport::default(),
        skipped_blocks: 0,
    };
    let JournalStatus::Usable { ino } = status else {
        return Ok(listing);
    };
    let mut map = ctx.build_extent_map(ino)?;
    let mut scan = ctx.read_journal(&mut map)?;
    listing.report = prune_segments(&mut scan.segments, scan.oldest, ctx.options.dev_bsize)?;
    listing.skipped_blocks = scan.skipped_blocks;
    listing.segments = scan
        .segments
        .iter()
        .map(|seg| SegmentInfo {
            seq: seg.header.seq,
            oldest: seg.header.oldest,
            records: seg.header.cnt,
            addr: seg.addr,
        })
        .collect();
    Ok(listing)
}
