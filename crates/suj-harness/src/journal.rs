//! Journal record constructors for test scenarios.

use suj_journal::JournalRecord;
use suj_ondisk::{BlockRecord, MoveRecord, RefRecord};
use suj_types::{FragAddr, InodeNumber, Lbn};

/// A name for `ino` was added at `diroff` in `parent`.
#[must_use]
pub fn add_ref(
    ino: InodeNumber,
    parent: InodeNumber,
    nlink: u16,
    mode: u16,
    diroff: u64,
) -> JournalRecord {
    JournalRecord::AddRef(RefRecord {
        ino,
        parent,
        nlink,
        mode,
        diroff,
    })
}

/// The name for `ino` at `diroff` in `parent` was removed.
#[must_use]
pub fn remove_ref(
    ino: InodeNumber,
    parent: InodeNumber,
    nlink: u16,
    mode: u16,
    diroff: u64,
) -> JournalRecord {
    JournalRecord::RemoveRef(RefRecord {
        ino,
        parent,
        nlink,
        mode,
        diroff,
    })
}

#[must_use]
pub fn move_ref(ino: InodeNumber, parent: InodeNumber, old_off: u64, new_off: u64) -> JournalRecord {
    JournalRecord::Move(MoveRecord {
        ino,
        parent,
        old_off,
        new_off,
    })
}

#[must_use]
pub fn new_block(ino: InodeNumber, blkno: FragAddr, lbn: i64, frags: u16) -> JournalRecord {
    JournalRecord::NewBlock(BlockRecord {
        ino,
        blkno,
        lbn: Lbn(lbn),
        frags,
        oldfrags: 0,
    })
}

#[must_use]
pub fn free_block(ino: InodeNumber, blkno: FragAddr, lbn: i64, frags: u16) -> JournalRecord {
    JournalRecord::FreeBlock(BlockRecord {
        ino,
        blkno,
        lbn: Lbn(lbn),
        frags,
        oldfrags: 0,
    })
}
