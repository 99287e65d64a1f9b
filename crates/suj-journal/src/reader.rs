//! Journal segment scanning and pruning.
//!
//! The journal is a ring buffer with no head or tail pointer. Recovery
//! reads the whole file, accepts every region that parses as a segment
//! written during the current mount, and then keeps only the contiguous run
//! of sequence numbers starting at the oldest one the kernel still needed.

use serde::{Deserialize, Serialize};
use suj_block::{ByteDevice, DiskDevice};
use suj_error::{Result, SujError};
use suj_ondisk::SegmentHeader;
use suj_types::{DEV_BSIZE, DevAddr, JREC_SIZE, JournalSeq, ParseError, align_up};
use tracing::{debug, info, trace, warn};

use crate::extent::JournalExtentMap;
use crate::record::JournalRecord;

/// One accepted segment: its header and the raw bytes of its records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalSegment {
    /// Sector the segment header was read from.
    pub addr: DevAddr,
    pub header: SegmentHeader,
    records: Vec<u8>,
}

impl JournalSegment {
    /// Build a segment from its header and `header.cnt` raw records.
    #[must_use]
    pub fn new(addr: DevAddr, header: SegmentHeader, records: Vec<u8>) -> Self {
        Self {
            addr,
            header,
            records,
        }
    }

    #[must_use]
    pub fn seq(&self) -> JournalSeq {
        self.header.seq
    }

    /// Decode every record in journal order, dropping the ones recovery
    /// does not replay.
    pub fn records(&self) -> Result<Vec<JournalRecord>> {
        let mut out = Vec::with_capacity(usize::from(self.header.cnt));
        for (i, raw) in self.records.chunks_exact(JREC_SIZE).enumerate() {
            match JournalRecord::decode(raw) {
                Ok(Some(record)) => out.push(record),
                Ok(None) => trace!(seq = self.header.seq.0, index = i, "skipping record"),
                Err(err) => return Err(segment_error(self, i, &err)),
            }
        }
        Ok(out)
    }
}

fn segment_error(seg: &JournalSegment, index: usize, err: &ParseError) -> SujError {
    SujError::corruption(
        seg.addr.0,
        format!("journal segment {} record {index}: {err}", seg.header.seq),
    )
}

/// Parameters of one journal scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanParams {
    /// `fs_mtime`; headers from any other mount are stale.
    pub mtime: i64,
    /// Resynchronization step and segment alignment.
    pub dev_bsize: usize,
    /// Largest single read.
    pub read_window: usize,
}

/// Everything a scan found, in physical order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JournalScan {
    pub segments: Vec<JournalSegment>,
    /// Largest `jsr_oldest` seen across all accepted headers.
    pub oldest: JournalSeq,
    /// Device blocks skipped while resynchronizing.
    pub skipped_blocks: u64,
}

/// Byte length of a segment holding `cnt` records.
#[must_use]
pub fn segment_len(cnt: u16, dev_bsize: usize) -> u64 {
    let raw = (u64::from(cnt) + 1) * JREC_SIZE as u64;
    align_up(raw, dev_bsize as u64).unwrap_or(raw)
}

/// Scan the whole journal for segments written by the current mount.
///
/// Reads up to `read_window` contiguous bytes at a time. A region that is
/// not a valid header, or whose implied length runs past what a fresh read
/// can hold, costs exactly one device block before the scan retries.
pub fn read_all_segments<D: ByteDevice>(
    dev: &mut DiskDevice<D>,
    map: &mut JournalExtentMap,
    params: ScanParams,
) -> Result<JournalScan> {
    if params.dev_bsize < JREC_SIZE || params.read_window < params.dev_bsize {
        return Err(SujError::Format(format!(
            "journal block size {} / read window {} unusable",
            params.dev_bsize, params.read_window
        )));
    }
    let step = params.dev_bsize as u64;
    let mut scan = JournalScan::default();

    while let Some((addr, avail)) = map.next(params.read_window) {
        let buf = dev.read(addr, avail)?;
        trace!(addr = addr.0, bytes = avail, "journal read");
        let mut off = 0_usize;
        while off < buf.len() {
            let remaining = buf.len() - off;
            let header = match SegmentHeader::parse(&buf[off..]) {
                Ok(h) if h.time == params.mtime && h.cnt != 0 => h,
                Ok(h) => {
                    trace!(
                        addr = addr.0,
                        off,
                        time = h.time,
                        cnt = h.cnt,
                        "not a current segment header"
                    );
                    off += params.dev_bsize;
                    map.advance(step);
                    scan.skipped_blocks += 1;
                    continue;
                }
                Err(_) => {
                    // Tail shorter than a record.
                    map.advance(remaining as u64);
                    break;
                }
            };

            let len = segment_len(header.cnt, params.dev_bsize);
            if len > remaining as u64 {
                if off != 0 {
                    // Re-read starting at this header.
                    break;
                }
                debug!(
                    seq = header.seq.0,
                    len,
                    available = remaining,
                    "segment longer than contiguous journal space"
                );
                off += params.dev_bsize;
                map.advance(step);
                scan.skipped_blocks += 1;
                continue;
            }

            let len = len as usize;
            let body_end = off + JREC_SIZE * (usize::from(header.cnt) + 1);
            let body = buf[off + JREC_SIZE..body_end].to_vec();
            let seg_addr = DevAddr(addr.0 + (off as u64) / DEV_BSIZE);
            debug!(
                seq = header.seq.0,
                oldest = header.oldest.0,
                cnt = header.cnt,
                addr = seg_addr.0,
                "found journal segment"
            );
            if header.oldest > scan.oldest {
                scan.oldest = header.oldest;
            }
            scan.segments.push(JournalSegment::new(seg_addr, header, body));
            off += len;
            map.advance(len as u64);
        }
    }

    info!(
        segments = scan.segments.len(),
        oldest = scan.oldest.0,
        skipped_blocks = scan.skipped_blocks,
        "journal scan complete"
    );
    Ok(scan)
}

/// Outcome of pruning a scan down to its trustworthy run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneReport {
    pub kept: usize,
    pub pruned: usize,
    /// Records in the kept segments.
    pub records: u64,
    /// Journal space the kept segments occupy.
    pub bytes: u64,
}

impl PruneReport {
    /// Share of the kept journal space holding records, in percent.
    #[must_use]
    pub fn utilization(&self) -> f64 {
        if self.bytes == 0 {
            return 0.0;
        }
        let slots = self.bytes as f64 / JREC_SIZE as f64;
        self.records as f64 / slots * 100.0
    }
}

/// Keep the contiguous run of segments starting at `oldest`.
///
/// Segments older than `oldest` are dropped, the rest sorted by sequence
/// number, and everything after the first missing sequence number
/// discarded. Fails if, after sorting, the run does not start at `oldest`.
pub fn prune_segments(
    segments: &mut Vec<JournalSegment>,
    oldest: JournalSeq,
    dev_bsize: usize,
) -> Result<PruneReport> {
    let total = segments.len();
    segments.retain(|seg| seg.seq() >= oldest);
    segments.sort_by_key(JournalSegment::seq);

    let Some(first) = segments.first() else {
        debug!(oldest = oldest.0, "empty journal");
        return Ok(PruneReport {
            pruned: total,
            ..PruneReport::default()
        });
    };
    if first.seq() != oldest {
        return Err(SujError::JournalSequence {
            expected: oldest.0,
            found: first.seq().0,
        });
    }

    let mut expected = Some(oldest);
    segments.retain(|seg| {
        if Some(seg.seq()) == expected {
            expected = seg.seq().next();
            true
        } else {
            false
        }
    });
    if let Some(last) = segments.last() {
        let dropped = total - segments.len();
        if dropped > 0 {
            warn!(
                last = last.seq().0,
                dropped, "discarding journal segments outside the contiguous run"
            );
        }
    }

    let report = PruneReport {
        kept: segments.len(),
        pruned: total - segments.len(),
        records: segments.iter().map(|s| u64::from(s.header.cnt)).sum(),
        bytes: segments
            .iter()
            .map(|s| u64::from(s.header.blocks) * dev_bsize as u64)
            .sum(),
    };
    info!(
        kept = report.kept,
        pruned = report.pruned,
        records = report.records,
        "journal pruned"
    );
    Ok(report)
}
