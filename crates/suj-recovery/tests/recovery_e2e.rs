#![forbid(unsafe_code)]
//! End-to-end journal recovery over synthetic UFS2 images.
//!
//! Every scenario builds an image with `suj-harness`, appends journal
//! segments describing an interrupted operation, runs [`recover`], and
//! reopens the written image to check inodes, bitmaps and summaries.

use suj_block::{DiskDevice, MemoryByteDevice};
use suj_dir::{DT_DIR, DT_REG};
use suj_error::SujError;
use suj_harness::journal::{add_ref, free_block, move_ref, new_block, remove_ref};
use suj_harness::{BSIZE, JOURNAL_BYTES, MTIME, TestImage};
use suj_recovery::{
    AssumeNo, AssumeYes, BlockOp, Gate, MoveEntry, RecoveryContext, RecoveryOptions,
    RecoveryOutcome, RecoverySummary, RefEntry, RefOp, recover,
};
use suj_types::{
    DOT_OFFSET, DOTDOT_OFFSET, FS_SUJ, FragAddr, InodeNumber, S_IFDIR, S_IFREG, SBLOCK_UFS2,
    SBLOCKSIZE, SUJ_FILE,
};

const ROOT: InodeNumber = InodeNumber::ROOT;
const NOW: i64 = MTIME + 3600;
const DIR_MODE: u16 = S_IFDIR | 0o755;
const REG_MODE: u16 = S_IFREG | 0o644;

// ── Helpers ─────────────────────────────────────────────────────────────

fn options() -> RecoveryOptions {
    RecoveryOptions {
        min_journal_size: JOURNAL_BYTES,
        now: Some(NOW),
        ..RecoveryOptions::default()
    }
}

/// Flush `img`, recover it, and reopen the result.
fn run(img: &mut TestImage) -> (RecoverySummary, TestImage) {
    let dev = img.device().expect("device");
    let summary = recover(dev.clone(), options(), &mut AssumeYes).expect("recover");
    let after = TestImage::load(dev.snapshot()).expect("reload");
    (summary, after)
}

fn recover_err(img: &mut TestImage) -> (SujError, MemoryByteDevice) {
    let dev = img.device().expect("device");
    let err = recover(dev.clone(), options(), &mut AssumeYes).expect_err("recovery must fail");
    (err, dev)
}

/// Summaries on disk must equal a from-scratch rescan of the bitmaps.
fn assert_summaries_consistent(img: &TestImage) {
    let stored = img.csums().expect("csums");
    let groups: Vec<_> = (0..2)
        .map(|cg| {
            let group = img.group(cg).expect("cg");
            (group.cs().expect("cs"), group.frsum().expect("frsum"))
        })
        .collect();
    let mut rescanned = img.clone();
    rescanned.flush().expect("rescan");
    assert_eq!(rescanned.csums().expect("csums"), stored);
    for (cg, (cs, frsum)) in groups.into_iter().enumerate() {
        let group = rescanned.group(cg as u32).expect("cg");
        assert_eq!(group.cs().expect("cs"), cs, "group {cg} counters");
        assert_eq!(group.frsum().expect("frsum"), frsum, "group {cg} frsum");
        assert_eq!(stored[cg], cs, "group {cg} summary area");
    }
    assert_eq!(
        rescanned.superblock().cstotal,
        img.superblock().cstotal,
        "superblock totals"
    );
}

fn without_superblock(bytes: &[u8]) -> Vec<u8> {
    let mut out = bytes.to_vec();
    let start = SBLOCK_UFS2 as usize;
    out[start..start + SBLOCKSIZE].fill(0);
    out
}

// ── Aggregation ─────────────────────────────────────────────────────────

#[test]
fn remove_after_move_folds_back_onto_the_original_slot() {
    let mut img = TestImage::new().expect("image");
    let dev = img.device().expect("device");
    let mut ctx = RecoveryContext::open(DiskDevice::new(dev), options()).expect("open");
    assert_eq!(ctx.superblock().ncg, 2);
    assert_eq!(ctx.options().min_journal_size, JOURNAL_BYTES);

    let ino = InodeNumber(40);
    for rec in [
        add_ref(ino, ROOT, 1, REG_MODE, 40),
        move_ref(ino, ROOT, 40, 64),
        remove_ref(ino, ROOT, 2, REG_MODE, 64),
    ] {
        ctx.aggregate_record(&rec).expect("aggregate");
    }
    let agg = ctx.aggregate_of(ino).expect("lookup").expect("aggregate");
    let slot = |op, diroff| RefEntry {
        op,
        parent: ROOT,
        diroff,
        nlink: 1,
        mode: REG_MODE,
    };
    assert_eq!(agg.refs(), &[slot(RefOp::Remove, 40), slot(RefOp::Add, 64)]);
    assert!(agg.moves().is_empty());

    ctx.aggregate_record(&move_ref(ino, ROOT, 64, 96)).expect("move");
    let agg = ctx.aggregate_of(ino).expect("lookup").expect("aggregate");
    assert_eq!(
        agg.moves(),
        &[MoveEntry {
            parent: ROOT,
            old_off: 64,
            new_off: 96,
        }]
    );
    assert!(ctx.aggregate_of(InodeNumber(41)).expect("lookup").is_none());
}

#[test]
fn block_records_group_by_block_and_reject_bad_ranges() {
    let mut img = TestImage::new().expect("image");
    let dev = img.device().expect("device");
    let mut ctx = RecoveryContext::open(DiskDevice::new(dev), options()).expect("open");
    let ino = InodeNumber(40);
    ctx.aggregate_record(&free_block(ino, FragAddr(1002), 0, 3)).expect("free");
    ctx.aggregate_record(&new_block(ino, FragAddr(1002), 0, 3)).expect("new");

    let agg = ctx
        .block_aggregate_of(FragAddr(1004))
        .expect("lookup")
        .expect("aggregate");
    assert_eq!(agg.base(), FragAddr(1000));
    assert_eq!(agg.entries().len(), 1);
    let entry = agg.entries()[0];
    assert_eq!(entry.op, BlockOp::New);
    assert_eq!((entry.off, entry.frags), (2, 3));

    let empty = ctx.aggregate_record(&new_block(ino, FragAddr(1008), 0, 0));
    assert!(matches!(empty, Err(SujError::Corruption { .. })));
    let straddling = ctx.aggregate_record(&new_block(ino, FragAddr(1014), 0, 4));
    assert!(matches!(straddling, Err(SujError::Corruption { .. })));
}

// ── Link counts ─────────────────────────────────────────────────────────

#[test]
fn completed_remove_lowers_directory_link_count() {
    let mut img = TestImage::new().expect("image");
    let (dir, _) = img.mkdir(ROOT, b"x").expect("mkdir");
    let alias = img.link(ROOT, b"alias", dir, DT_DIR).expect("link");
    img.update_inode(dir, |d| d.set_nlink(3)).expect("nlink");
    img.unlink(ROOT, b"alias").expect("unlink");
    img.append_segment(1, 1, &[remove_ref(dir, ROOT, 3, DIR_MODE, alias)])
        .expect("segment");

    let (summary, after) = run(&mut img);
    assert_eq!(summary.outcome, RecoveryOutcome::Recovered);
    assert_eq!(summary.journal_records, 1);
    assert_eq!(after.inode(dir).expect("dir").nlink(), 2);
    assert_eq!(after.inode(ROOT).expect("root").nlink(), 3);
    assert_eq!(summary.freed.freed_inodes, 0);
    let sb = after.superblock();
    assert!(sb.clean);
    assert_eq!(sb.mtime, NOW);
    assert_eq!(sb.time, NOW);
    assert_eq!(sb.sujfree, 0);
    assert_summaries_consistent(&after);
}

#[test]
fn incomplete_remove_leaves_link_count_alone() {
    let mut img = TestImage::new().expect("image");
    let (file, off) = img.create_file(ROOT, b"keep", 1).expect("file");
    img.append_segment(1, 1, &[remove_ref(file, ROOT, 1, REG_MODE, off)])
        .expect("segment");

    let (summary, after) = run(&mut img);
    assert_eq!(summary.outcome, RecoveryOutcome::Recovered);
    let dinode = after.inode(file).expect("file");
    assert_eq!(dinode.nlink(), 1);
    assert!(after.inode_is_used(file).expect("bitmap"));
    assert!(!after.frag_is_free(dinode.db(0)).expect("block"));
}

#[test]
fn reference_to_free_inode_is_ignored() {
    let mut img = TestImage::new().expect("image");
    let ghost = InodeNumber(20);
    img.append_segment(1, 1, &[add_ref(ghost, ROOT, 0, REG_MODE, 28)])
        .expect("segment");
    let before = img.clone();

    let (summary, after) = run(&mut img);
    assert_eq!(summary.outcome, RecoveryOutcome::Recovered);
    assert_eq!(after.inode(ghost).expect("ghost"), before.inode(ghost).expect("ghost"));
    assert!(!after.inode_is_used(ghost).expect("bitmap"));
    assert_eq!(after.csums().expect("csums"), before.csums().expect("csums"));
    assert_eq!(summary.freed, Default::default());
}

#[test]
fn add_chased_through_move_keeps_the_inode() {
    let mut img = TestImage::new().expect("image");
    let (file, new_off) = img.create_file(ROOT, b"moved", 1).expect("file");
    // Mid-entry offset: no record starts there.
    let old_off = 400;
    img.append_segment(
        1,
        1,
        &[
            add_ref(file, ROOT, 0, REG_MODE, old_off),
            move_ref(file, ROOT, old_off, new_off),
        ],
    )
    .expect("segment");

    let (summary, after) = run(&mut img);
    assert_eq!(summary.outcome, RecoveryOutcome::Recovered);
    let dinode = after.inode(file).expect("file");
    assert_eq!(dinode.nlink(), 1);
    assert!(after.inode_is_used(file).expect("bitmap"));
    assert_eq!(summary.freed.freed_inodes, 0);
}

#[test]
fn link_count_overflow_is_fatal() {
    let mut img = TestImage::new().expect("image");
    let (file, off) = img.create_file(ROOT, b"busy", 0).expect("file");
    img.append_segment(1, 1, &[add_ref(file, ROOT, 32_767, REG_MODE, off)])
        .expect("segment");
    let (err, _) = recover_err(&mut img);
    assert!(matches!(err, SujError::LinkCountOverflow { links: 32_768, .. }), "{err}");
}

// ── Inode release ───────────────────────────────────────────────────────

#[test]
fn removed_directory_is_released_with_its_children() {
    let mut img = TestImage::new().expect("image");
    let (dir, off) = img.mkdir(ROOT, b"d").expect("mkdir");
    let (file, _) = img.create_file(dir, b"f", 1).expect("file");
    let dir_block = img.inode(dir).expect("dir").db(0);
    let file_block = img.inode(file).expect("file").db(0);
    img.unlink(ROOT, b"d").expect("unlink");
    img.append_segment(
        1,
        1,
        &[
            remove_ref(dir, ROOT, 2, DIR_MODE, off),
            remove_ref(ROOT, dir, 3, DIR_MODE, DOTDOT_OFFSET),
        ],
    )
    .expect("segment");

    let (summary, after) = run(&mut img);
    assert_eq!(summary.outcome, RecoveryOutcome::Recovered);
    assert_eq!(after.inode(ROOT).expect("root").nlink(), 2);
    for ino in [dir, file] {
        let dinode = after.inode(ino).expect("inode");
        assert_eq!(dinode.mode(), 0, "inode {ino} cleared");
        assert_eq!(dinode.generation(), ino.0, "generation kept");
        assert!(!after.inode_is_used(ino).expect("bitmap"));
    }
    assert_eq!(after.free_frags_in(dir_block, 8).expect("dir block"), 8);
    assert_eq!(after.free_frags_in(file_block, 8).expect("file block"), 8);
    assert_eq!(summary.freed.freed_inodes, 2);
    assert_eq!(summary.freed.freed_dirs, 1);
    assert_eq!(summary.freed.freed_blocks, 2);
    assert_eq!(after.csums().expect("csums")[0].ndir, 1, "only the root remains");
    assert_summaries_consistent(&after);
}

/// A file named both inside an unlinked directory and in the root.
///
/// With `file_first` the file gets the lower inode number, so it is
/// reconciled before the directory is released.
fn shared_file_in_removed_directory(file_first: bool) -> (TestImage, InodeNumber, InodeNumber) {
    let mut img = TestImage::new().expect("image");
    let (dir, file, in_dir) = if file_first {
        let (file, _) = img.create_file(ROOT, b"g", 1).expect("file");
        let (dir, _) = img.mkdir(ROOT, b"d").expect("mkdir");
        let in_dir = img.link(dir, b"f", file, DT_REG).expect("link");
        (dir, file, in_dir)
    } else {
        let (dir, _) = img.mkdir(ROOT, b"d").expect("mkdir");
        let (file, in_dir) = img.create_file(dir, b"f", 1).expect("file");
        img.link(ROOT, b"g", file, DT_REG).expect("link");
        (dir, file, in_dir)
    };
    img.update_inode(file, |d| d.set_nlink(2)).expect("nlink");
    let off = img.unlink(ROOT, b"d").expect("unlink").expect("entry");
    img.append_segment(
        1,
        1,
        &[
            remove_ref(dir, ROOT, 2, DIR_MODE, off),
            remove_ref(ROOT, dir, 3, DIR_MODE, DOTDOT_OFFSET),
            add_ref(file, dir, 1, REG_MODE, in_dir),
        ],
    )
    .expect("segment");
    (img, dir, file)
}

#[test]
fn released_directory_spares_a_file_linked_elsewhere() {
    for file_first in [false, true] {
        let (mut img, dir, file) = shared_file_in_removed_directory(file_first);
        assert_eq!(dir < file, !file_first);

        let (summary, after) = run(&mut img);
        assert_eq!(summary.outcome, RecoveryOutcome::Recovered);
        assert_eq!(summary.freed.freed_inodes, 1, "file_first={file_first}");
        assert_eq!(after.inode(dir).expect("dir").mode(), 0);
        let dinode = after.inode(file).expect("file");
        assert_eq!(dinode.mode(), REG_MODE, "file_first={file_first}");
        assert_eq!(dinode.nlink(), 1, "file_first={file_first}");
        assert!(after.inode_is_used(file).expect("bitmap"));
        assert!(!after.frag_is_free(dinode.db(0)).expect("block"));
        assert_eq!(after.lookup(ROOT, b"g").expect("lookup").map(|(ino, _)| ino), Some(file));
        assert_eq!(after.inode(ROOT).expect("root").nlink(), 2);
        assert_summaries_consistent(&after);
    }
}

#[test]
fn released_directory_defers_decrement_of_unreconciled_child() {
    let mut img = TestImage::new().expect("image");
    let (dir, _) = img.mkdir(ROOT, b"d").expect("mkdir");
    let (file, _) = img.create_file(dir, b"f", 1).expect("file");
    let alias = img.link(ROOT, b"g", file, DT_REG).expect("link");
    img.update_inode(file, |d| d.set_nlink(2)).expect("nlink");
    let off = img.unlink(ROOT, b"d").expect("unlink").expect("entry");
    let records = [
        remove_ref(dir, ROOT, 2, DIR_MODE, off),
        remove_ref(ROOT, dir, 3, DIR_MODE, DOTDOT_OFFSET),
        add_ref(file, ROOT, 1, REG_MODE, alias),
    ];
    img.append_segment(1, 1, &records).expect("segment");

    let dev = img.device().expect("device");
    let mut ctx = RecoveryContext::open(DiskDevice::new(dev), options()).expect("open");
    for rec in &records {
        ctx.aggregate_record(rec).expect("aggregate");
    }
    ctx.reconcile_inode(ROOT).expect("root");
    ctx.reconcile_inode(dir).expect("dir");
    let agg = ctx.aggregate_of(file).expect("lookup").expect("aggregate");
    assert_eq!(agg.nlink_adjust(), 1);
    assert!(agg.skip_parent());

    let (summary, after) = run(&mut img);
    assert_eq!(summary.freed.freed_inodes, 1);
    let dinode = after.inode(file).expect("file");
    assert_eq!(dinode.nlink(), 1);
    assert!(after.inode_is_used(file).expect("bitmap"));
    assert_summaries_consistent(&after);
}

/// A directory whose name never reached its parent, holding one
/// subdirectory. Only "." and the child's ".." still name it.
///
/// With `child_first` the subdirectory gets the lower inode number.
fn orphaned_directory_tree(child_first: bool) -> (TestImage, InodeNumber, InodeNumber) {
    let mut img = TestImage::new().expect("image");
    let (dir, child, dir_off, child_off) = if child_first {
        let (child, _) = img.mkdir(ROOT, b"s").expect("mkdir");
        let (dir, dir_off) = img.mkdir(ROOT, b"d").expect("mkdir");
        img.unlink(ROOT, b"s").expect("unlink");
        let child_off = img.link(dir, b"s", child, DT_DIR).expect("link");
        img.set_dotdot(child, dir).expect("dotdot");
        img.update_inode(dir, |d| d.set_nlink(3)).expect("nlink");
        img.update_inode(ROOT, |d| d.set_nlink(3)).expect("nlink");
        (dir, child, dir_off, child_off)
    } else {
        let (dir, dir_off) = img.mkdir(ROOT, b"d").expect("mkdir");
        let (child, child_off) = img.mkdir(dir, b"s").expect("mkdir");
        (dir, child, dir_off, child_off)
    };
    img.unlink(ROOT, b"d").expect("unlink");
    img.append_segment(
        1,
        1,
        &[
            add_ref(dir, ROOT, 0, DIR_MODE, dir_off),
            add_ref(dir, dir, 0, DIR_MODE, DOT_OFFSET),
            add_ref(ROOT, dir, 2, DIR_MODE, DOTDOT_OFFSET),
            add_ref(child, dir, 0, DIR_MODE, child_off),
            add_ref(child, child, 0, DIR_MODE, DOT_OFFSET),
            add_ref(dir, child, 1, DIR_MODE, DOTDOT_OFFSET),
        ],
    )
    .expect("segment");
    (img, dir, child)
}

#[test]
fn directory_named_only_by_dot_entries_is_released() {
    for child_first in [false, true] {
        let (mut img, dir, child) = orphaned_directory_tree(child_first);
        assert_eq!(child < dir, child_first);
        assert_eq!(img.inode(dir).expect("dir").nlink(), 3);

        let (summary, after) = run(&mut img);
        assert_eq!(summary.outcome, RecoveryOutcome::Recovered);
        assert_eq!(summary.freed.freed_inodes, 2, "child_first={child_first}");
        assert_eq!(summary.freed.freed_dirs, 2, "child_first={child_first}");
        for ino in [dir, child] {
            assert_eq!(after.inode(ino).expect("inode").mode(), 0, "inode {ino} cleared");
            assert!(!after.inode_is_used(ino).expect("bitmap"));
        }
        assert_eq!(after.inode(ROOT).expect("root").nlink(), 2, "child_first={child_first}");
        assert_eq!(after.csums().expect("csums")[0].ndir, 1);
        assert_summaries_consistent(&after);
    }
}

#[test]
fn released_dot_only_directory_marks_its_subdirectories() {
    let (mut img, dir, child) = orphaned_directory_tree(false);
    let (_, child_off) = img.lookup(dir, b"s").expect("lookup").expect("entry");
    let dev = img.device().expect("device");
    let mut ctx = RecoveryContext::open(DiskDevice::new(dev), options()).expect("open");
    ctx.aggregate_record(&add_ref(child, dir, 0, DIR_MODE, child_off))
        .expect("child");
    ctx.aggregate_record(&add_ref(dir, dir, 0, DIR_MODE, DOT_OFFSET))
        .expect("dot");
    ctx.aggregate_record(&add_ref(dir, child, 1, DIR_MODE, DOTDOT_OFFSET))
        .expect("dotdot");
    assert!(!ctx.aggregate_of(child).expect("lookup").expect("aggregate").skip_parent());

    ctx.reconcile_inode(dir).expect("dir");
    let agg = ctx.aggregate_of(child).expect("lookup").expect("aggregate");
    assert!(agg.skip_parent());
    assert_eq!(agg.nlink_adjust(), 0);
    assert_eq!(ctx.inode_read(dir).expect("dir").mode(), 0);
}

#[test]
fn stale_dotdot_record_still_marks_the_named_directory() {
    let mut img = TestImage::new().expect("image");
    let (dir, dir_off) = img.mkdir(ROOT, b"d").expect("mkdir");
    let (other, other_off) = img.mkdir(ROOT, b"s").expect("mkdir");
    img.unlink(ROOT, b"d").expect("unlink");
    let dev = img.device().expect("device");
    let mut ctx = RecoveryContext::open(DiskDevice::new(dev), options()).expect("open");
    for rec in [
        add_ref(dir, ROOT, 0, DIR_MODE, dir_off),
        add_ref(dir, dir, 0, DIR_MODE, DOT_OFFSET),
        add_ref(dir, other, 1, DIR_MODE, DOTDOT_OFFSET),
        add_ref(other, ROOT, 1, DIR_MODE, other_off),
    ] {
        ctx.aggregate_record(&rec).expect("aggregate");
    }
    // The ".." of `other` names the root on disk, not `dir`.
    assert!(!ctx.entry_is_at(other, DOTDOT_OFFSET, dir).expect("lookup").found);

    ctx.reconcile_inodes().expect("reconcile");
    assert_eq!(ctx.inode_read(dir).expect("dir").mode(), 0);
    let agg = ctx.aggregate_of(other).expect("lookup").expect("aggregate");
    assert!(agg.skip_parent());
    let dinode = ctx.inode_read(other).expect("other");
    assert_eq!(dinode.mode(), DIR_MODE);
    assert_eq!(dinode.nlink(), 2);
}

#[test]
fn freeing_the_root_is_fatal_and_writes_nothing() {
    let mut img = TestImage::new().expect("image");
    img.append_segment(1, 1, &[remove_ref(ROOT, ROOT, 1, DIR_MODE, DOT_OFFSET)])
        .expect("segment");
    img.flush().expect("flush");
    let before = img.bytes().to_vec();

    let (err, dev) = recover_err(&mut img);
    assert!(matches!(err, SujError::RootInodeFree), "{err}");
    assert_eq!(err.exit_code(), suj_error::EXIT_OPERATIONAL);
    assert_eq!(dev.snapshot(), before);
}

#[test]
fn unlinked_list_is_swept() {
    let mut img = TestImage::new().expect("image");
    let (gone, _) = img.create_file(ROOT, b"gone", 2).expect("file");
    let (kept, _) = img.create_file(ROOT, b"kept", 1).expect("file");
    let blocks = [img.inode(gone).expect("gone").db(0), img.inode(gone).expect("gone").db(1)];
    img.unlink(ROOT, b"gone").expect("unlink");
    img.update_inode(gone, |d| d.set_nlink(0)).expect("nlink");
    img.set_unlinked_list(&[gone, kept]).expect("list");

    let dev = img.device().expect("device");
    let mut asked = Vec::new();
    let mut confirm = |gate: Gate| {
        asked.push(gate);
        true
    };
    let summary = recover(dev.clone(), options(), &mut confirm).expect("recover");
    assert_eq!(asked, vec![Gate::Recover], "empty journal skips the write gate");
    assert_eq!(summary.outcome, RecoveryOutcome::Recovered);
    assert_eq!(summary.journal_records, 0);

    let after = TestImage::load(dev.snapshot()).expect("reload");
    assert_eq!(after.superblock().sujfree, 0);
    let dinode = after.inode(gone).expect("gone");
    assert_eq!(dinode.mode(), 0);
    assert_eq!(dinode.generation(), gone.0);
    assert!(!after.inode_is_used(gone).expect("bitmap"));
    for blk in blocks {
        assert_eq!(after.free_frags_in(blk, 8).expect("block"), 8);
    }
    let kept_inode = after.inode(kept).expect("kept");
    assert_eq!(kept_inode.nlink(), 1);
    assert_eq!(kept_inode.freelink(), 0);
    assert!(after.inode_is_used(kept).expect("bitmap"));
    assert_eq!(summary.freed.freed_inodes, 1);
    assert_eq!(summary.freed.freed_blocks, 2);
    assert_summaries_consistent(&after);
}

// ── Blocks ──────────────────────────────────────────────────────────────

#[test]
fn released_inode_frees_its_extended_attribute_block() {
    let mut img = TestImage::new().expect("image");
    let (file, off) = img.create_file(ROOT, b"xattr", 1).expect("file");
    let ext = img.alloc_block().expect("ext block");
    img.update_inode(file, |d| {
        d.set_extsize(BSIZE);
        d.set_extb(0, ext);
        d.set_blocks(16);
    })
    .expect("ext");
    img.unlink(ROOT, b"xattr").expect("unlink");
    img.append_segment(1, 1, &[remove_ref(file, ROOT, 1, REG_MODE, off)])
        .expect("segment");

    let (summary, after) = run(&mut img);
    assert_eq!(after.free_frags_in(ext, 8).expect("ext"), 8);
    assert_eq!(summary.freed.freed_inodes, 1);
    assert_eq!(summary.freed.freed_blocks, 2);
    assert_summaries_consistent(&after);
}

#[test]
fn partial_free_spares_fragments_still_claimed() {
    let mut img = TestImage::new().expect("image");
    let blk = img.alloc_block().expect("block");
    let (owner, _) = img.create_file(ROOT, b"owner", 0).expect("file");
    let (former, _) = img.create_file(ROOT, b"former", 0).expect("file");
    img.update_inode(owner, |d| {
        d.set_db(0, blk);
        d.set_size(2048);
        d.set_blocks(4);
    })
    .expect("owner");
    img.append_segment(
        1,
        1,
        &[free_block(former, blk, 0, 8), new_block(owner, blk, 0, 4)],
    )
    .expect("segment");

    let (summary, after) = run(&mut img);
    assert_eq!(summary.outcome, RecoveryOutcome::Recovered);
    assert_eq!(after.free_frags_in(blk, 4).expect("head"), 0);
    assert_eq!(after.free_frags_in(FragAddr(blk.0 + 4), 4).expect("tail"), 4);
    assert_eq!(summary.freed.freed_frags, 4);
    assert_eq!(summary.freed.freed_blocks, 0);
    assert_eq!(after.inode(owner).expect("owner").blocks(), 4);
    assert_summaries_consistent(&after);
}

#[test]
fn abandoned_allocation_is_released() {
    let mut img = TestImage::new().expect("image");
    let blk = img.alloc_block().expect("block");
    let (file, _) = img.create_file(ROOT, b"short", 0).expect("file");
    img.append_segment(1, 1, &[new_block(file, blk, 3, 8)]).expect("segment");

    let (summary, after) = run(&mut img);
    assert_eq!(after.free_frags_in(blk, 8).expect("block"), 8);
    assert_eq!(summary.freed.freed_blocks, 1);
    assert_eq!(after.inode(file).expect("file").blocks(), 0);
}

#[test]
fn freed_indirect_block_is_followed() {
    let mut img = TestImage::new().expect("image");
    let (file, _) = img.create_file(ROOT, b"big", 0).expect("file");
    let indirect = img.alloc_block().expect("indirect");
    let children = [img.alloc_block().expect("child"), img.alloc_block().expect("child")];
    img.write_indirect(indirect, &children).expect("pointers");
    img.append_segment(1, 1, &[free_block(file, indirect, -12, 8)])
        .expect("segment");

    let (summary, after) = run(&mut img);
    assert_eq!(after.free_frags_in(indirect, 8).expect("indirect"), 8);
    for child in children {
        assert_eq!(after.free_frags_in(child, 8).expect("child"), 8);
    }
    assert_eq!(summary.freed.freed_blocks, 3);
    assert_summaries_consistent(&after);
}

#[test]
fn reused_indirect_block_is_not_followed() {
    let mut img = TestImage::new().expect("image");
    let (file, _) = img.create_file(ROOT, b"big", 0).expect("file");
    let indirect = img.alloc_block().expect("indirect");
    let children = [img.alloc_block().expect("child"), img.alloc_block().expect("child")];
    img.write_indirect(indirect, &children).expect("pointers");
    let (reuser, _) = img.create_file(ROOT, b"reuser", 0).expect("file");
    img.update_inode(reuser, |d| {
        d.set_db(0, indirect);
        d.set_size(4096);
        d.set_blocks(8);
    })
    .expect("reuser");
    img.append_segment(
        1,
        1,
        &[free_block(file, indirect, -12, 8), new_block(reuser, indirect, 0, 8)],
    )
    .expect("segment");

    let (summary, after) = run(&mut img);
    assert_eq!(after.free_frags_in(indirect, 8).expect("indirect"), 0);
    for child in children {
        assert_eq!(after.free_frags_in(child, 8).expect("child"), 0);
    }
    assert_eq!(summary.freed.freed_blocks, 0);
    assert_eq!(after.inode(reuser).expect("reuser").blocks(), 8);
}

// ── Journal selection ───────────────────────────────────────────────────

#[test]
fn segments_after_a_gap_are_ignored() {
    let mut img = TestImage::new().expect("image");
    let (file, off) = img.create_file(ROOT, b"f", 1).expect("file");
    img.append_segment(5, 5, &[add_ref(file, ROOT, 0, REG_MODE, off)])
        .expect("segment");
    img.append_segment(6, 5, &[add_ref(file, ROOT, 0, REG_MODE, off)])
        .expect("segment");
    // Would release the file if replayed.
    img.append_segment(8, 5, &[remove_ref(file, ROOT, 1, REG_MODE, off + 512)])
        .expect("segment");

    let (summary, after) = run(&mut img);
    assert_eq!(summary.segments_kept, 2);
    assert_eq!(summary.segments_pruned, 1);
    assert_eq!(after.inode(file).expect("file").nlink(), 1);
}

#[test]
fn garbage_between_segments_is_skipped() {
    let mut img = TestImage::new().expect("image");
    let (file, off) = img.create_file(ROOT, b"f", 1).expect("file");
    img.unlink(ROOT, b"f").expect("unlink");
    img.append_segment(1, 1, &[add_ref(InodeNumber(20), ROOT, 0, REG_MODE, 28)])
        .expect("segment");
    img.skip_journal(1024).expect("gap");
    img.append_segment(2, 1, &[remove_ref(file, ROOT, 1, REG_MODE, off)])
        .expect("segment");

    let (summary, after) = run(&mut img);
    assert_eq!(summary.segments_kept, 2);
    assert!(summary.skipped_blocks >= 2);
    assert_eq!(summary.freed.freed_inodes, 1);
    assert!(!after.inode_is_used(file).expect("bitmap"));
}

#[test]
fn stale_segments_are_skipped() {
    let mut img = TestImage::new().expect("image");
    let (file, off) = img.create_file(ROOT, b"f", 1).expect("file");
    img.append_segment_at(1, 1, MTIME - 1, &[remove_ref(file, ROOT, 1, REG_MODE, off + 512)])
        .expect("stale");
    img.append_segment(3, 3, &[add_ref(file, ROOT, 0, REG_MODE, off)])
        .expect("segment");

    let (summary, after) = run(&mut img);
    assert_eq!(summary.segments_kept, 1);
    assert!(summary.skipped_blocks > 0);
    assert_eq!(after.inode(file).expect("file").nlink(), 1);
}

#[test]
fn missing_oldest_segment_is_fatal() {
    let mut img = TestImage::new().expect("image");
    img.append_segment(5, 4, &[add_ref(InodeNumber(20), ROOT, 0, REG_MODE, 28)])
        .expect("segment");
    let (err, _) = recover_err(&mut img);
    assert!(
        matches!(err, SujError::JournalSequence { expected: 4, found: 5 }),
        "{err}"
    );
}

#[test]
fn sparse_journal_is_fatal() {
    let mut img = TestImage::new().expect("image");
    let journal = img.journal_ino().expect("journal");
    img.update_inode(journal, |d| d.set_db(3, FragAddr(0))).expect("hole");
    let (err, _) = recover_err(&mut img);
    assert!(
        matches!(err, SujError::SparseJournal { expected: 128, .. }),
        "{err}"
    );
}

#[test]
fn unusable_journals_are_reported() {
    let mut plain = TestImage::new().expect("image");
    plain.superblock_mut().flags &= !FS_SUJ;
    let (summary, _) = run(&mut plain);
    assert_eq!(summary.outcome, RecoveryOutcome::NotJournaled);

    let mut missing = TestImage::new().expect("image");
    missing.unlink(ROOT, SUJ_FILE).expect("unlink");
    let (summary, _) = run(&mut missing);
    assert_eq!(summary.outcome, RecoveryOutcome::JournalMissing);

    let mut small = TestImage::new().expect("image");
    let dev = small.device().expect("device");
    let summary = recover(dev, RecoveryOptions::default(), &mut AssumeYes).expect("recover");
    assert_eq!(
        summary.outcome,
        RecoveryOutcome::JournalInvalid {
            reason: format!("invalid size {JOURNAL_BYTES}")
        }
    );

    let mut unflagged = TestImage::new().expect("image");
    let journal = unflagged.journal_ino().expect("journal");
    unflagged.update_inode(journal, |d| d.set_flags(0)).expect("flags");
    let (summary, _) = run(&mut unflagged);
    assert!(matches!(summary.outcome, RecoveryOutcome::JournalInvalid { .. }));
}

// ── Gates and repeat runs ───────────────────────────────────────────────

#[test]
fn declining_either_gate_leaves_the_image_untouched() {
    let mut img = TestImage::new().expect("image");
    let (dir, _) = img.mkdir(ROOT, b"x").expect("mkdir");
    let alias = img.link(ROOT, b"alias", dir, DT_DIR).expect("link");
    img.update_inode(dir, |d| d.set_nlink(3)).expect("nlink");
    img.unlink(ROOT, b"alias").expect("unlink");
    img.append_segment(1, 1, &[remove_ref(dir, ROOT, 3, DIR_MODE, alias)])
        .expect("segment");
    let dev = img.device().expect("device");
    let before = dev.snapshot();

    let summary = recover(dev.clone(), options(), &mut AssumeNo).expect("recover");
    assert_eq!(summary.outcome, RecoveryOutcome::Declined { gate: Gate::Recover });
    assert_eq!(dev.snapshot(), before);

    let mut only_recover = |gate: Gate| gate == Gate::Recover;
    let summary = recover(dev.clone(), options(), &mut only_recover).expect("recover");
    assert_eq!(
        summary.outcome,
        RecoveryOutcome::Declined {
            gate: Gate::WriteChanges
        }
    );
    assert_eq!(dev.snapshot(), before);

    let preen = RecoveryOptions {
        preen: true,
        ..options()
    };
    let summary = recover(dev.clone(), preen, &mut AssumeNo).expect("recover");
    assert_eq!(summary.outcome, RecoveryOutcome::Recovered);
    assert_ne!(dev.snapshot(), before);
}

#[test]
fn second_run_sees_a_stale_journal() {
    let mut img = TestImage::new().expect("image");
    let (file, off) = img.create_file(ROOT, b"gone", 1).expect("file");
    img.unlink(ROOT, b"gone").expect("unlink");
    img.append_segment(1, 1, &[remove_ref(file, ROOT, 1, REG_MODE, off)])
        .expect("segment");
    let dev = img.device().expect("device");
    let first = recover(dev.clone(), options(), &mut AssumeYes).expect("first");
    assert_eq!(first.freed.freed_inodes, 1);

    let second = recover(dev.clone(), options(), &mut AssumeYes).expect("second");
    assert!(matches!(second.outcome, RecoveryOutcome::JournalInvalid { .. }));
}

#[test]
fn replaying_a_recovered_image_changes_nothing() {
    let mut img = TestImage::new().expect("image");
    let (dir, off) = img.mkdir(ROOT, b"d").expect("mkdir");
    img.create_file(dir, b"f", 1).expect("file");
    let (file, foff) = img.create_file(ROOT, b"partial", 2).expect("file");
    img.unlink(ROOT, b"d").expect("unlink");
    img.append_segment(
        1,
        1,
        &[
            remove_ref(dir, ROOT, 2, DIR_MODE, off),
            remove_ref(ROOT, dir, 3, DIR_MODE, DOTDOT_OFFSET),
            add_ref(file, ROOT, 0, REG_MODE, foff),
        ],
    )
    .expect("segment");
    let (_, mut recovered) = run(&mut img);

    // Pretend the same mount crashed again with the same journal.
    recovered.superblock_mut().mtime = MTIME;
    recovered.flush().expect("flush");
    let before = without_superblock(recovered.bytes());
    let (summary, again) = run(&mut recovered);
    assert_eq!(summary.outcome, RecoveryOutcome::Recovered);
    assert_eq!(summary.freed, Default::default());
    assert_eq!(without_superblock(again.bytes()), before);
}

#[test]
fn check_hashes_are_maintained() {
    let mut img = TestImage::with_check_hashes().expect("image");
    let (file, off) = img.create_file(ROOT, b"gone", 1).expect("file");
    img.unlink(ROOT, b"gone").expect("unlink");
    img.append_segment(1, 1, &[remove_ref(file, ROOT, 1, REG_MODE, off)])
        .expect("segment");

    let (summary, after) = run(&mut img);
    assert_eq!(summary.freed.freed_inodes, 1);
    for cg in 0..2 {
        let group = after.group(cg).expect("cg");
        let mut copy = group.clone();
        copy.update_ckhash().expect("rehash");
        assert_eq!(copy.ckhash().expect("hash"), group.ckhash().expect("hash"));
    }
    for ino in [ROOT, file] {
        let dinode = after.inode(ino).expect("inode");
        let mut copy = dinode.clone();
        copy.update_ckhash();
        assert_eq!(copy.ckhash(), dinode.ckhash(), "inode {ino}");
    }
}
