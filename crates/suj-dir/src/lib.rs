#![forbid(unsafe_code)]
//! UFS directory blocks.
//!
//! A directory block is a sequence of `DIRBLKSIZ` chunks. Each chunk holds
//! variable-length `struct direct` records whose `d_reclen` values tile the
//! chunk exactly; a record never crosses a chunk boundary. Record lengths
//! come straight off the disk, so every walk here range-checks them.

use suj_error::{Result, SujError};
use suj_types::{DIRBLKSIZ, InodeNumber, S_IFMT};

/// Fixed part of `struct direct`: ino, reclen, type, namlen.
const DIRECT_HEADER_LEN: usize = 8;

pub const DT_UNKNOWN: u8 = 0;
pub const DT_FIFO: u8 = 1;
pub const DT_CHR: u8 = 2;
pub const DT_DIR: u8 = 4;
pub const DT_BLK: u8 = 6;
pub const DT_REG: u8 = 8;
pub const DT_LNK: u8 = 10;
pub const DT_SOCK: u8 = 12;
pub const DT_WHT: u8 = 14;

/// Record size needed for a name of `namlen` bytes (`DIRECTSIZ`).
#[must_use]
pub fn directsiz(namlen: usize) -> usize {
    (DIRECT_HEADER_LEN + namlen + 1 + 3) & !3
}

/// Mode type bits for a directory entry type (`DTTOIF`).
#[must_use]
pub fn dt_to_if(d_type: u8) -> u16 {
    u16::from(d_type) << 12
}

/// Directory entry type for a mode (`IFTODT`).
#[must_use]
pub fn if_to_dt(mode: u16) -> u8 {
    // S_IFMT >> 12 fits in four bits.
    ((mode & S_IFMT) >> 12) as u8
}

/// One live or empty record inside a directory block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirEntry<'a> {
    /// Byte offset of the record within the block.
    pub offset: usize,
    pub ino: InodeNumber,
    pub reclen: u16,
    pub d_type: u8,
    pub name: &'a [u8],
}

impl DirEntry<'_> {
    #[must_use]
    pub fn is_dot(&self) -> bool {
        self.name == b"."
    }

    #[must_use]
    pub fn is_dotdot(&self) -> bool {
        self.name == b".."
    }
}

fn corrupt(detail: impl Into<String>) -> SujError {
    SujError::Corruption {
        block: 0,
        detail: detail.into(),
    }
}

/// Parse the record at `offset`, checking that it fits its chunk.
pub fn parse_entry(block: &[u8], offset: usize) -> Result<DirEntry<'_>> {
    let header = offset
        .checked_add(DIRECT_HEADER_LEN)
        .and_then(|end| block.get(offset..end))
        .ok_or_else(|| corrupt(format!("directory entry header at {offset} past block end")))?;
    let ino = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let reclen = u16::from_le_bytes([header[4], header[5]]);
    let d_type = header[6];
    let namlen = usize::from(header[7]);

    let len = usize::from(reclen);
    if len < DIRECT_HEADER_LEN || len % 4 != 0 {
        return Err(corrupt(format!("invalid d_reclen {reclen} at {offset}")));
    }
    let chunk_end = (offset / DIRBLKSIZ + 1) * DIRBLKSIZ;
    if offset + len > chunk_end || offset + len > block.len() {
        return Err(corrupt(format!(
            "directory entry at {offset} crosses chunk boundary"
        )));
    }
    if ino != 0 && directsiz(namlen) > len {
        return Err(corrupt(format!(
            "directory entry name length {namlen} exceeds d_reclen {reclen}"
        )));
    }
    let name_end = (offset + DIRECT_HEADER_LEN + namlen).min(offset + len);
    Ok(DirEntry {
        offset,
        ino: InodeNumber(ino),
        reclen,
        d_type,
        name: &block[offset + DIRECT_HEADER_LEN..name_end],
    })
}

/// Iterator over every record of a directory block, empty slots included.
///
/// Yields one error and then stops if a record is malformed.
pub struct DirEntries<'a> {
    block: &'a [u8],
    offset: usize,
    failed: bool,
}

impl<'a> Iterator for DirEntries<'a> {
    type Item = Result<DirEntry<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset + DIRECT_HEADER_LEN > self.block.len() {
            return None;
        }
        match parse_entry(self.block, self.offset) {
            Ok(entry) => {
                self.offset += usize::from(entry.reclen);
                Some(Ok(entry))
            }
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}

/// Walk every record in `block`.
#[must_use]
pub fn entries(block: &[u8]) -> DirEntries<'_> {
    DirEntries {
        block,
        offset: 0,
        failed: false,
    }
}

/// The record starting exactly at `offset`, if any.
///
/// Walks from the start of the enclosing chunk so that bytes inside a name
/// or in slack space are never mistaken for a record.
pub fn entry_at(block: &[u8], offset: usize) -> Result<Option<DirEntry<'_>>> {
    if offset >= block.len() {
        return Ok(None);
    }
    let mut cur = offset - offset % DIRBLKSIZ;
    while cur <= offset {
        let entry = parse_entry(block, cur)?;
        if cur == offset {
            return Ok(Some(entry));
        }
        cur += usize::from(entry.reclen);
    }
    Ok(None)
}

/// First live record named `name`.
pub fn find_name<'a>(block: &'a [u8], name: &[u8]) -> Result<Option<DirEntry<'a>>> {
    for entry in entries(block) {
        let entry = entry?;
        if !entry.ino.is_none() && entry.name == name {
            return Ok(Some(entry));
        }
    }
    Ok(None)
}

// ── Construction ────────────────────────────────────────────────────────────

fn write_entry(
    block: &mut [u8],
    offset: usize,
    ino: u32,
    reclen: usize,
    d_type: u8,
    name: &[u8],
) -> Result<()> {
    let namlen = u8::try_from(name.len())
        .map_err(|_| SujError::Format("directory entry name exceeds 255 bytes".to_owned()))?;
    let reclen_u16 = u16::try_from(reclen)
        .map_err(|_| SujError::Format("directory entry d_reclen exceeds u16".to_owned()))?;
    if reclen < directsiz(name.len()) {
        return Err(SujError::Format(
            "directory entry d_reclen smaller than minimum".to_owned(),
        ));
    }
    let slot = block
        .get_mut(offset..offset + reclen)
        .ok_or_else(|| corrupt("directory entry exceeds block boundary"))?;
    slot.fill(0);
    slot[0..4].copy_from_slice(&ino.to_le_bytes());
    slot[4..6].copy_from_slice(&reclen_u16.to_le_bytes());
    slot[6] = d_type;
    slot[7] = namlen;
    slot[DIRECT_HEADER_LEN..DIRECT_HEADER_LEN + name.len()].copy_from_slice(name);
    Ok(())
}

/// Format `block` as a fresh directory: "." and ".." in the first chunk,
/// every other chunk a single empty record.
pub fn init_dir_block(block: &mut [u8], self_ino: InodeNumber, parent: InodeNumber) -> Result<()> {
    if block.is_empty() || block.len() % DIRBLKSIZ != 0 {
        return Err(SujError::Format(
            "directory block is not a multiple of DIRBLKSIZ".to_owned(),
        ));
    }
    block.fill(0);
    let dot_len = directsiz(1);
    write_entry(block, 0, self_ino.0, dot_len, DT_DIR, b".")?;
    write_entry(block, dot_len, parent.0, DIRBLKSIZ - dot_len, DT_DIR, b"..")?;
    for chunk in (DIRBLKSIZ..block.len()).step_by(DIRBLKSIZ) {
        write_entry(block, chunk, 0, DIRBLKSIZ, DT_UNKNOWN, b"")?;
    }
    Ok(())
}

/// Insert a record for `name`, returning its offset in the block.
///
/// Reuses an empty record or splits the slack off a live one, whichever
/// comes first.
pub fn add_entry(
    block: &mut [u8],
    ino: InodeNumber,
    name: &[u8],
    d_type: u8,
) -> Result<Option<usize>> {
    if ino.is_none() || name.is_empty() {
        return Err(SujError::Format(
            "directory entry needs an inode and a name".to_owned(),
        ));
    }
    let need = directsiz(name.len());
    let mut target = None;
    for entry in entries(block) {
        let entry = entry?;
        let len = usize::from(entry.reclen);
        if entry.ino.is_none() {
            if len >= need {
                target = Some((entry.offset, None));
                break;
            }
            continue;
        }
        let used = directsiz(entry.name.len());
        if len - used >= need {
            target = Some((entry.offset, Some(used)));
            break;
        }
    }
    let Some((offset, split)) = target else {
        return Ok(None);
    };
    let reclen = usize::from(parse_entry(block, offset)?.reclen);
    match split {
        None => {
            write_entry(block, offset, ino.0, reclen, d_type, name)?;
            Ok(Some(offset))
        }
        Some(used) => {
            let used_u16 = u16::try_from(used)
                .map_err(|_| SujError::Format("d_reclen exceeds u16".to_owned()))?;
            block[offset + 4..offset + 6].copy_from_slice(&used_u16.to_le_bytes());
            write_entry(block, offset + used, ino.0, reclen - used, d_type, name)?;
            Ok(Some(offset + used))
        }
    }
}

/// Remove the live record named `name`, returning the offset it had.
///
/// The space is folded into the preceding record of the same chunk; a
/// record that starts its chunk is emptied in place instead.
pub fn remove_entry(block: &mut [u8], name: &[u8]) -> Result<Option<usize>> {
    let mut prev: Option<(usize, u16)> = None;
    let mut found = None;
    for entry in entries(block) {
        let entry = entry?;
        if entry.offset % DIRBLKSIZ == 0 {
            prev = None;
        }
        if !entry.ino.is_none() && entry.name == name {
            found = Some((entry.offset, entry.reclen, prev));
            break;
        }
        prev = Some((entry.offset, entry.reclen));
    }
    let Some((offset, reclen, prev)) = found else {
        return Ok(None);
    };
    match prev {
        Some((prev_off, prev_len)) => {
            let merged = prev_len
                .checked_add(reclen)
                .ok_or_else(|| SujError::Format("merged d_reclen overflow".to_owned()))?;
            block[prev_off + 4..prev_off + 6].copy_from_slice(&merged.to_le_bytes());
        }
        None => block[offset..offset + 4].copy_from_slice(&0_u32.to_le_bytes()),
    }
    Ok(Some(offset))
}
