//! Run state shared by every recovery phase.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use suj_block::{ByteDevice, DiskDevice};
use suj_error::{Result, SujError};
use suj_journal::{JournalExtentMap, JournalScan, ScanParams, read_all_segments};
use suj_ondisk::{Csum, Superblock, parse_csum_array};
use suj_types::{
    DEV_BSIZE, DevAddr, FragAddr, GroupNumber, InodeNumber, ParseError, SBLOCK_UFS2, SBLOCKSIZE,
    SUJ_MIN, u64_to_usize,
};
use tracing::debug;

use crate::cache::GroupCache;

/// Tunables for one recovery run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryOptions {
    /// Journal block size: segment alignment and resynchronization step.
    pub dev_bsize: usize,
    /// Smallest journal file accepted.
    pub min_journal_size: u64,
    /// Largest contiguous journal read.
    pub read_window: usize,
    /// Timestamp written to `fs_time` and `fs_mtime`; the wall clock at
    /// run start when unset.
    pub now: Option<i64>,
    /// Answer every confirmation gate with yes.
    pub preen: bool,
}

impl Default for RecoveryOptions {
    fn default() -> Self {
        Self {
            dev_bsize: DEV_BSIZE as usize,
            min_journal_size: SUJ_MIN,
            read_window: 1024 * 1024,
            now: None,
            preen: false,
        }
    }
}

/// What the run released.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryStats {
    pub freed_inodes: u64,
    pub freed_dirs: u64,
    pub freed_blocks: u64,
    pub freed_frags: u64,
}

/// Everything one recovery run knows: the device, the superblock and its
/// summary array, the per-group caches and aggregates, and the counters.
///
/// Created at run start, consumed by writeback, then dropped. All state
/// lives here rather than in globals so every phase can be driven and
/// inspected on its own.
#[derive(Debug)]
pub struct RecoveryContext<D: ByteDevice> {
    pub(crate) dev: DiskDevice<D>,
    pub(crate) sb: Superblock,
    pub(crate) csums: Vec<Csum>,
    pub(crate) options: RecoveryOptions,
    pub(crate) now: i64,
    pub(crate) groups: BTreeMap<GroupNumber, GroupCache>,
    pub(crate) data_blocks: HashMap<FragAddr, Vec<u8>>,
    /// Inodes whose truncation has started; never truncated twice.
    pub(crate) in_truncation: HashSet<InodeNumber>,
    pub(crate) stats: RecoveryStats,
}

fn superblock_error(err: ParseError) -> SujError {
    match err {
        ParseError::InvalidMagic { .. } => SujError::Format(format!("not a UFS2 filesystem: {err}")),
        ParseError::InvalidField { .. } => SujError::InvalidGeometry(err.to_string()),
        ParseError::InsufficientData { .. } | ParseError::IntegerConversion { .. } => {
            SujError::Format(err.to_string())
        }
    }
}

/// Maps a parse failure to corruption of the fragment at `addr`.
pub(crate) fn corrupt_at(addr: FragAddr) -> impl Fn(ParseError) -> SujError + Copy {
    move |err| SujError::corruption(addr.0, err.to_string())
}

fn wall_clock() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
}

impl<D: ByteDevice> RecoveryContext<D> {
    /// Read the superblock and the group summary array.
    pub fn open(mut dev: DiskDevice<D>, options: RecoveryOptions) -> Result<Self> {
        let raw = dev.read(DevAddr::from_byte_offset(SBLOCK_UFS2), SBLOCKSIZE)?;
        let sb = Superblock::parse(&raw).map_err(superblock_error)?;
        let csaddr = FragAddr(sb.csaddr);
        let area_len = u64_to_usize(sb.cssize_rounded(), "fs_cssize").map_err(corrupt_at(csaddr))?;
        let area = dev.read(sb.fsbtodb(csaddr), area_len)?;
        let csums = parse_csum_array(&area, sb.ncg).map_err(corrupt_at(csaddr))?;
        let now = options.now.unwrap_or_else(wall_clock);
        debug!(
            ncg = sb.ncg,
            bsize = sb.bsize,
            fsize = sb.fsize,
            mtime = sb.mtime,
            sujfree = sb.sujfree,
            "superblock loaded"
        );
        Ok(Self {
            dev,
            sb,
            csums,
            options,
            now,
            groups: BTreeMap::new(),
            data_blocks: HashMap::new(),
            in_truncation: HashSet::new(),
            stats: RecoveryStats::default(),
        })
    }

    #[must_use]
    pub fn superblock(&self) -> &Superblock {
        &self.sb
    }

    #[must_use]
    pub fn options(&self) -> &RecoveryOptions {
        &self.options
    }

    #[must_use]
    pub fn stats(&self) -> RecoveryStats {
        self.stats
    }

    /// Scan every extent of the journal for current segments.
    pub fn read_journal(&mut self, map: &mut JournalExtentMap) -> Result<JournalScan> {
        let params = ScanParams {
            mtime: self.sb.mtime,
            dev_bsize: self.options.dev_bsize,
            read_window: self.options.read_window,
        };
        read_all_segments(&mut self.dev, map, params)
    }

    /// Fragments held by `bytes` of a block, at most `fs_frag`.
    #[allow(clippy::cast_possible_truncation)] // bounded by fs_frag
    pub(crate) fn frags_of(&self, bytes: u64) -> u32 {
        self.sb.numfrags(bytes).min(u64::from(self.sb.frag)) as u32
    }

    /// Fail unless `[addr, addr + frags)` lies inside the filesystem.
    pub(crate) fn check_range(&self, addr: FragAddr, frags: u32) -> Result<()> {
        let end = addr.0.checked_add(u64::from(frags));
        if addr.is_hole() || end.is_none_or(|end| end > self.sb.size) {
            return Err(SujError::corruption(
                addr.0,
                format!("fragment range of {frags} outside filesystem of {}", self.sb.size),
            ));
        }
        Ok(())
    }
}
