//! Finding, validating and mapping the journal file.

use serde::{Deserialize, Serialize};
use suj_block::ByteDevice;
use suj_dir::find_name;
use suj_error::{Result, SujError};
use suj_journal::JournalExtentMap;
use suj_ondisk::Dinode;
use suj_types::{FS_SUJ, InodeNumber, SF_IMMUTABLE, SF_NOUNLINK, SUJ_FILE, is_dir};
use tracing::{debug, info};

use crate::context::RecoveryContext;
use crate::visit::Visit;

/// Whether the filesystem carries a usable journal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JournalStatus {
    /// Soft-updates journaling is not enabled.
    NotJournaled,
    /// The root directory has no journal entry.
    Missing,
    /// The journal inode failed validation.
    Invalid { reason: String },
    Usable { ino: InodeNumber },
}

impl<D: ByteDevice> RecoveryContext<D> {
    /// Find the journal file in the root directory.
    pub fn locate_journal(&mut self) -> Result<Option<InodeNumber>> {
        let root = self.inode_read(InodeNumber::ROOT)?;
        if !is_dir(root.mode()) {
            return Err(SujError::corruption(0, "root inode is not a directory"));
        }
        let fsize = self.sb.fsize as usize;
        let mut found = None;
        self.ino_visit(InodeNumber::ROOT, &root, Visit::DATA, &mut |ctx, _, _, blk, frags| {
            if found.is_some() {
                return Ok(());
            }
            let block = ctx.data_block_read(blk, frags as usize * fsize)?;
            found = find_name(block, SUJ_FILE)
                .map_err(|err| SujError::corruption(blk.0, err.to_string()))?
                .map(|entry| entry.ino);
            Ok(())
        })?;
        Ok(found)
    }

    /// Why `dinode` cannot be the journal of this mount, if anything.
    #[must_use]
    pub fn journal_inode_problem(&self, dinode: &Dinode) -> Option<String> {
        if dinode.nlink() != 1 {
            return Some(format!("invalid link count {}", dinode.nlink()));
        }
        let required = SF_IMMUTABLE | SF_NOUNLINK;
        if dinode.flags() & required != required {
            return Some(format!("invalid flags {:#x}", dinode.flags()));
        }
        if dinode.size() < self.options.min_journal_size {
            return Some(format!("invalid size {}", dinode.size()));
        }
        if u64::try_from(self.sb.mtime).ok() != Some(dinode.modrev()) {
            return Some("journal timestamp does not match fs mount time".to_owned());
        }
        None
    }

    /// Locate and validate the journal.
    pub fn open_journal(&mut self) -> Result<JournalStatus> {
        if !self.sb.has_flag(FS_SUJ) {
            debug!(flags = self.sb.flags, "soft updates journaling not enabled");
            return Ok(JournalStatus::NotJournaled);
        }
        let Some(ino) = self.locate_journal()? else {
            return Ok(JournalStatus::Missing);
        };
        let dinode = self.inode_read(ino)?;
        if let Some(reason) = self.journal_inode_problem(&dinode) {
            return Ok(JournalStatus::Invalid { reason });
        }
        info!(ino = ino.0, size = dinode.size(), "found journal");
        Ok(JournalStatus::Usable { ino })
    }

    /// Device extents of the journal file, in file order.
    ///
    /// Fails unless the data blocks cover the whole file.
    pub fn build_extent_map(&mut self, ino: InodeNumber) -> Result<JournalExtentMap> {
        let dinode = self.inode_read(ino)?;
        let mut map = JournalExtentMap::new();
        let visited = self.ino_visit(ino, &dinode, Visit::DATA, &mut |ctx, _, _, blk, frags| {
            map.add(ctx.sb.fsbtodb(blk), ctx.sb.frags_to_sectors(u64::from(frags)));
            Ok(())
        })?;
        let expected = self.sb.numfrags(dinode.size());
        if visited != expected {
            return Err(SujError::SparseJournal {
                ino: ino.0,
                visited,
                expected,
            });
        }
        debug!(
            ino = ino.0,
            extents = map.extents().len(),
            bytes = map.total_bytes(),
            "journal mapped"
        );
        Ok(map)
    }
}
