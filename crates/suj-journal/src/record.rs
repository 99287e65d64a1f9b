//! Typed journal records.

use serde::{Deserialize, Serialize};
use suj_ondisk::suj::{
    BlockRecord, JOP_ADDREF, JOP_FREEBLK, JOP_MVREF, JOP_NEWBLK, JOP_REMREF, JOP_SYNC, JOP_TRUNC,
    MoveRecord, RefRecord, record_op,
};
use suj_types::{InodeNumber, JREC_SIZE, ParseError};

/// One recoverable journal operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JournalRecord {
    AddRef(RefRecord),
    RemoveRef(RefRecord),
    Move(MoveRecord),
    NewBlock(BlockRecord),
    FreeBlock(BlockRecord),
}

impl JournalRecord {
    /// Decode one `JREC_SIZE` record.
    ///
    /// Truncate and sync records carry nothing recovery replays and decode
    /// to `None`. Any other unknown operation is an error.
    pub fn decode(bytes: &[u8]) -> Result<Option<Self>, ParseError> {
        let record = match record_op(bytes)? {
            JOP_ADDREF => Self::AddRef(RefRecord::parse(bytes)?),
            JOP_REMREF => Self::RemoveRef(RefRecord::parse(bytes)?),
            JOP_MVREF => Self::Move(MoveRecord::parse(bytes)?),
            JOP_NEWBLK => Self::NewBlock(BlockRecord::parse(bytes)?),
            JOP_FREEBLK => Self::FreeBlock(BlockRecord::parse(bytes)?),
            JOP_TRUNC | JOP_SYNC => return Ok(None),
            _ => {
                return Err(ParseError::InvalidField {
                    field: "jrec_op",
                    reason: "unknown journal operation",
                });
            }
        };
        Ok(Some(record))
    }

    #[must_use]
    pub fn encode(&self) -> [u8; JREC_SIZE] {
        match self {
            Self::AddRef(rec) => rec.to_bytes(JOP_ADDREF),
            Self::RemoveRef(rec) => rec.to_bytes(JOP_REMREF),
            Self::Move(rec) => rec.to_bytes(),
            Self::NewBlock(rec) => rec.to_bytes(JOP_NEWBLK),
            Self::FreeBlock(rec) => rec.to_bytes(JOP_FREEBLK),
        }
    }

    /// Inode the record is about.
    #[must_use]
    pub fn ino(&self) -> InodeNumber {
        match self {
            Self::AddRef(rec) | Self::RemoveRef(rec) => rec.ino,
            Self::Move(rec) => rec.ino,
            Self::NewBlock(rec) | Self::FreeBlock(rec) => rec.ino,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use suj_types::{FragAddr, Lbn, write_le_u32};

    #[test]
    fn decodes_each_kind() {
        let rr = RefRecord {
            ino: InodeNumber(9),
            parent: InodeNumber::ROOT,
            nlink: 1,
            mode: 0o100_644,
            diroff: 36,
        };
        let br = BlockRecord {
            ino: InodeNumber(9),
            blkno: FragAddr(300),
            lbn: Lbn(0),
            frags: 8,
            oldfrags: 0,
        };
        let mv = MoveRecord {
            ino: InodeNumber(9),
            parent: InodeNumber::ROOT,
            old_off: 36,
            new_off: 60,
        };
        for rec in [
            JournalRecord::AddRef(rr),
            JournalRecord::RemoveRef(rr),
            JournalRecord::Move(mv),
            JournalRecord::NewBlock(br),
            JournalRecord::FreeBlock(br),
        ] {
            let decoded = JournalRecord::decode(&rec.encode()).expect("decode");
            assert_eq!(decoded, Some(rec));
            assert_eq!(rec.ino(), InodeNumber(9));
        }
    }

    #[test]
    fn truncate_and_sync_are_skipped() {
        let mut bytes = [0_u8; JREC_SIZE];
        write_le_u32(&mut bytes, 0, JOP_TRUNC).expect("op");
        assert_eq!(JournalRecord::decode(&bytes).expect("trunc"), None);
        write_le_u32(&mut bytes, 0, JOP_SYNC).expect("op");
        assert_eq!(JournalRecord::decode(&bytes).expect("sync"), None);
    }

    #[test]
    fn unknown_op_is_an_error() {
        let mut bytes = [0_u8; JREC_SIZE];
        write_le_u32(&mut bytes, 0, 42).expect("op");
        assert!(matches!(
            JournalRecord::decode(&bytes),
            Err(ParseError::InvalidField {
                field: "jrec_op",
                ..
            })
        ));
    }
}
