//! Physical layout of the journal file.

use serde::{Deserialize, Serialize};
use suj_types::{DEV_BSIZE, DevAddr};

/// A run of contiguous journal sectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalExtent {
    pub start: DevAddr,
    /// Length in `DEV_BSIZE` sectors.
    pub sectors: u64,
}

/// Ordered extents of the journal file plus a read cursor.
///
/// Built once from the journal inode's block pointers, then consumed front
/// to back by the segment scanner.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JournalExtentMap {
    extents: Vec<JournalExtent>,
    /// Index of the extent the cursor is in.
    cursor: usize,
    /// Bytes already consumed from the current extent.
    consumed: u64,
}

impl JournalExtentMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `sectors` sectors at `start`, merging with the previous
    /// extent when the two are physically adjacent.
    pub fn add(&mut self, start: DevAddr, sectors: u64) {
        if sectors == 0 {
            return;
        }
        if let Some(last) = self.extents.last_mut() {
            if last.start.0.checked_add(last.sectors) == Some(start.0) {
                last.sectors += sectors;
                return;
            }
        }
        self.extents.push(JournalExtent { start, sectors });
    }

    #[must_use]
    pub fn extents(&self) -> &[JournalExtent] {
        &self.extents
    }

    #[must_use]
    pub fn total_sectors(&self) -> u64 {
        self.extents.iter().map(|e| e.sectors).sum()
    }

    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.total_sectors() * DEV_BSIZE
    }

    /// Address and length of the next contiguous read of at most
    /// `max_bytes`, or `None` once the journal is exhausted.
    ///
    /// Never crosses an extent boundary and does not move the cursor.
    #[must_use]
    pub fn next(&self, max_bytes: usize) -> Option<(DevAddr, usize)> {
        let extent = self.extents.get(self.cursor)?;
        let left = extent.sectors * DEV_BSIZE - self.consumed;
        let len = left.min(max_bytes as u64);
        if len == 0 {
            return None;
        }
        let addr = DevAddr(extent.start.0 + self.consumed / DEV_BSIZE);
        Some((addr, len as usize))
    }

    /// Move the cursor forward by `bytes`, stepping into following extents
    /// as each one is used up.
    pub fn advance(&mut self, bytes: u64) {
        let mut bytes = bytes;
        while bytes > 0 {
            let Some(extent) = self.extents.get(self.cursor) else {
                return;
            };
            let left = extent.sectors * DEV_BSIZE - self.consumed;
            if bytes < left {
                self.consumed += bytes;
                return;
            }
            bytes -= left;
            self.cursor += 1;
            self.consumed = 0;
        }
    }

    /// Move the cursor back to the start of the journal.
    pub fn rewind(&mut self) {
        self.cursor = 0;
        self.consumed = 0;
    }
}
