#![forbid(unsafe_code)]
//! Error types for soft-updates journal recovery.
//!
//! # Error Taxonomy
//!
//! Recovery uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `suj-types` | On-disk format violations detected during byte parsing |
//! | Runtime | `SujError` | `suj-error` (this crate) | Errors surfaced to the recovery driver and the CLI |
//!
//! ## Mapping Policy: ParseError → SujError
//!
//! `suj-error` does not depend on `suj-types`. The conversion from
//! `ParseError` happens where the failing block address is known
//! (`suj-journal` and `suj-recovery`):
//!
//! | ParseError Variant | SujError Variant |
//! |--------------------|------------------|
//! | `InsufficientData` | `Corruption { block, detail }` |
//! | `InvalidMagic` | `Corruption` for cylinder groups, `Format` for the superblock |
//! | `InvalidField` | `Corruption` / `InvalidGeometry` |
//! | `IntegerConversion` | `Corruption { block, detail }` |
//!
//! ## Fatal vs. recoverable
//!
//! Every `SujError` that reaches the driver is fatal: the run aborts before
//! writeback and nothing computed so far is trusted. Recoverable journal
//! anomalies (bad segment headers, sequence gaps) and soft inconsistencies
//! (an already-free inode, a matching link count) never become errors; they
//! are handled in place and logged.
//!
//! ## Exit codes
//!
//! [`SujError::exit_code`] maps each variant to the fsck exit status
//! convention. The mapping is exhaustive (no wildcard arms).
//!
//! | Variant | Exit code | Meaning |
//! |---------|-----------|---------|
//! | `Io` | 8 | operational error |
//! | `Corruption` | 8 | operational error |
//! | `Format` | 16 | not a UFS2 image |
//! | `Parse` | 8 | operational error |
//! | `InvalidGeometry` | 16 | unusable superblock |
//! | `GroupOutOfRange` | 8 | operational error |
//! | `SparseJournal` | 8 | operational error |
//! | `JournalSequence` | 8 | operational error |
//! | `LbnOutOfRange` | 8 | operational error |
//! | `RootInodeFree` | 8 | operational error |
//! | `DirectoryOffset` | 8 | operational error |
//! | `LinkCountOverflow` | 8 | operational error |
//! | `NotFound` | 8 | operational error |
//! | `ReadOnly` | 8 | operational error |

use thiserror::Error;

/// Exit status for operational failures.
pub const EXIT_OPERATIONAL: i32 = 8;
/// Exit status for unusable input.
pub const EXIT_USAGE: i32 = 16;

/// Unified error type for journal recovery.
#[derive(Debug, Error)]
pub enum SujError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// On-disk metadata is unreadable or inconsistent at a known address.
    ///
    /// `block` is a fragment address for filesystem metadata, or a sector
    /// address for raw device reads.
    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    /// The image is not a UFS2 filesystem.
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// Parse-layer error without a known block address.
    #[error("parse error: {0}")]
    Parse(String),

    /// Superblock geometry is numerically invalid.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// A cylinder group index at or beyond `fs_ncg`.
    #[error("cylinder group {group} out of range (ncg={ncg})")]
    GroupOutOfRange { group: u32, ncg: u32 },

    /// The journal inode has holes.
    #[error("sparse journal inode {ino}: visited {visited} fragments, expected {expected}")]
    SparseJournal { ino: u32, visited: u64, expected: u64 },

    /// The first segment after sorting is not the oldest one still needed.
    #[error("journal sequence mismatch: expected {expected}, found {found}")]
    JournalSequence { expected: u64, found: u64 },

    /// A logical block number does not resolve inside the inode's block tree.
    #[error("invalid logical block {lbn} for inode {ino}")]
    LbnOutOfRange { ino: u32, lbn: i64 },

    /// Reconciliation tried to free the root directory.
    #[error("attempted to free the root inode")]
    RootInodeFree,

    /// A directory entry offset past the end of its block.
    #[error("directory {ino}: offset {offset} exceeds block size {block_size}")]
    DirectoryOffset {
        ino: u32,
        offset: u64,
        block_size: u64,
    },

    /// A recomputed link count does not fit `di_nlink`.
    #[error("inode {ino}: link count {links} out of range")]
    LinkCountOverflow { ino: u32, links: i64 },

    /// Named object not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// The device was opened without write access.
    #[error("read-only device")]
    ReadOnly,
}

impl SujError {
    /// Process exit status for this error.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Format(_) | Self::InvalidGeometry(_) => EXIT_USAGE,
            Self::Io(_)
            | Self::Corruption { .. }
            | Self::Parse(_)
            | Self::GroupOutOfRange { .. }
            | Self::SparseJournal { .. }
            | Self::JournalSequence { .. }
            | Self::LbnOutOfRange { .. }
            | Self::RootInodeFree
            | Self::DirectoryOffset { .. }
            | Self::LinkCountOverflow { .. }
            | Self::NotFound(_)
            | Self::ReadOnly => EXIT_OPERATIONAL,
        }
    }

    /// Shorthand for a [`SujError::Corruption`] at `block`.
    pub fn corruption(block: u64, detail: impl Into<String>) -> Self {
        Self::Corruption {
            block,
            detail: detail.into(),
        }
    }
}

/// Result alias using `SujError`.
pub type Result<T> = std::result::Result<T, SujError>;
