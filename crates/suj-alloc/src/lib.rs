#![forbid(unsafe_code)]
//! Cylinder-group bitmap accounting.
//!
//! UFS keeps three bitmaps per group: inodes in use, free fragments, and
//! free whole-block clusters. All of them are LSB-first within each byte.
//!
//! ## Design
//!
//! The crate is layered:
//!
//! 1. **Bitmap**: raw bit manipulation.
//! 2. **Block predicates**: whole-block views over the fragment bitmap for
//!    `fs_frag` of 1, 2, 4 or 8.
//! 3. **GroupSummary**: counters recomputed from scratch by rescanning the
//!    fragment bitmap. Recovery never adjusts these incrementally.

use serde::{Deserialize, Serialize};
use suj_types::MAXFRAG;

// ── Bitmap operations ───────────────────────────────────────────────────────

/// Get bit `idx` from a bitmap byte slice.
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: u32) -> bool {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx >= bitmap.len() {
        return false;
    }
    (bitmap[byte_idx] >> bit_idx) & 1 == 1
}

/// Set bit `idx` in a bitmap byte slice.
pub fn bitmap_set(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] |= 1 << bit_idx;
    }
}

/// Clear bit `idx` in a bitmap byte slice.
pub fn bitmap_clear(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] &= !(1 << bit_idx);
    }
}

/// Count set bits in the first `count` bits of `bitmap`.
#[must_use]
pub fn bitmap_count_set(bitmap: &[u8], count: u32) -> u32 {
    (0..count).filter(|&idx| bitmap_get(bitmap, idx)).count() as u32
}

/// First clear bit at or after `start` in the first `count` bits.
#[must_use]
pub fn bitmap_find_clear(bitmap: &[u8], count: u32, start: u32) -> Option<u32> {
    (start..count).find(|&idx| !bitmap_get(bitmap, idx))
}

// ── Block predicates ────────────────────────────────────────────────────────

fn block_bits(block: u32, frag: u32) -> std::ops::Range<u32> {
    let first = block * frag;
    first..first + frag
}

/// Whether every fragment of block `block` is free (`ffs_isblock`).
#[must_use]
pub fn is_block_free(blksfree: &[u8], block: u32, frag: u32) -> bool {
    block_bits(block, frag).all(|idx| bitmap_get(blksfree, idx))
}

/// Whether every fragment of block `block` is allocated (`ffs_isfreeblock`
/// in the negative sense).
#[must_use]
pub fn is_block_allocated(blksfree: &[u8], block: u32, frag: u32) -> bool {
    block_bits(block, frag).all(|idx| !bitmap_get(blksfree, idx))
}

/// Mark every fragment of block `block` free.
pub fn set_block_free(blksfree: &mut [u8], block: u32, frag: u32) {
    for idx in block_bits(block, frag) {
        bitmap_set(blksfree, idx);
    }
}

/// Mark every fragment of block `block` allocated.
pub fn clear_block(blksfree: &mut [u8], block: u32, frag: u32) {
    for idx in block_bits(block, frag) {
        bitmap_clear(blksfree, idx);
    }
}

// ── Group summary ───────────────────────────────────────────────────────────

/// Free-space counters of one cylinder group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSummary {
    /// Wholly free blocks.
    pub nbfree: u32,
    /// Free fragments inside partially allocated blocks.
    pub nffree: u32,
    /// `frsum[n]`: runs of exactly `n` free fragments inside partial blocks.
    pub frsum: [u32; MAXFRAG as usize],
    /// `clustersum[n]`: runs of `n` free blocks, the last slot counting
    /// every run at least that long. Empty when clustering is disabled.
    pub clustersum: Vec<u32>,
}

impl GroupSummary {
    /// Rescan a group's fragment bitmap.
    ///
    /// `ndblk` is the number of fragments the group holds. When
    /// `contigsumsize` is non-zero the free-cluster bitmap `clusters` is
    /// rewritten from scratch and the cluster summary filled in.
    #[must_use]
    pub fn recompute(
        blksfree: &[u8],
        ndblk: u32,
        frag: u32,
        contigsumsize: u32,
        mut clusters: Option<&mut [u8]>,
    ) -> Self {
        let mut summary = Self::default();
        if contigsumsize > 0 {
            summary.clustersum = vec![0; contigsumsize as usize + 1];
        }
        if let Some(map) = clusters.as_deref_mut() {
            map.fill(0);
        }

        let full_blocks = ndblk / frag;
        let mut run = 0_u32;
        for block in 0..full_blocks {
            if is_block_free(blksfree, block, frag) {
                summary.nbfree += 1;
                if let Some(map) = clusters.as_deref_mut() {
                    bitmap_set(map, block);
                }
                run += 1;
                continue;
            }
            summary.close_cluster(run);
            run = 0;
            summary.count_fragments(blksfree, block * frag, frag);
        }
        summary.close_cluster(run);

        // A trailing partial block only ever holds fragments.
        let tail = ndblk - full_blocks * frag;
        if tail > 0 {
            summary.count_fragments(blksfree, full_blocks * frag, tail);
        }
        summary
    }

    fn count_fragments(&mut self, blksfree: &[u8], first: u32, len: u32) {
        let mut run = 0_u32;
        for idx in first..first + len {
            if bitmap_get(blksfree, idx) {
                run += 1;
                self.nffree += 1;
            } else if run > 0 {
                self.frsum[run as usize] += 1;
                run = 0;
            }
        }
        if run > 0 && (run as usize) < self.frsum.len() {
            self.frsum[run as usize] += 1;
        }
    }

    fn close_cluster(&mut self, run: u32) {
        if run == 0 || self.clustersum.is_empty() {
            return;
        }
        let last = self.clustersum.len() - 1;
        let slot = (run as usize).min(last);
        self.clustersum[slot] += 1;
    }
}
