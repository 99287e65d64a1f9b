#![forbid(unsafe_code)]
//! Soft-updates journal reading.
//!
//! Turns the journal inode's block map into a list of physical extents,
//! scans those extents for segment headers written during the current
//! mount, and prunes the result to the contiguous run of sequence numbers
//! recovery can trust. Record payloads are decoded into [`JournalRecord`].

pub mod extent;
pub mod reader;
pub mod record;

pub use extent::{JournalExtent, JournalExtentMap};
pub use reader::{
    JournalScan, JournalSegment, PruneReport, ScanParams, prune_segments, read_all_segments,
    segment_len,
};
pub use record::JournalRecord;
