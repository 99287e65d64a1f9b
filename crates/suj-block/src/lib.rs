#![forbid(unsafe_code)]
//! Device access for offline recovery.
//!
//! Provides the byte-addressed `ByteDevice` trait, a file-backed and an
//! in-memory implementation, and `DiskDevice`, the sector-addressed handle
//! the recovery engine owns exclusively for the duration of a run.

use parking_lot::Mutex;
use std::fs::File;
use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use suj_error::{Result, SujError};
use suj_types::{DEV_BSIZE, DevAddr};
use tracing::trace;

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to stable storage.
    fn sync(&self) -> Result<()>;
}

fn checked_end(offset: u64, len: usize, device_len: u64, what: &str) -> Result<()> {
    let end = offset
        .checked_add(
            u64::try_from(len)
                .map_err(|_| SujError::Format(format!("{what} length overflows u64")))?,
        )
        .ok_or_else(|| SujError::Format(format!("{what} range overflows u64")))?;
    if end > device_len {
        return Err(SujError::Corruption {
            block: offset / DEV_BSIZE,
            detail: format!("{what} out of bounds: offset={offset} len={len} device_len={device_len}"),
        });
    }
    Ok(())
}

/// File-backed byte device using `pread`/`pwrite` style I/O.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
    writable: bool,
}

impl FileByteDevice {
    /// Open read-write, falling back to read-only if write access is denied.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        Self::from_file(file, writable)
    }

    /// Open without write access.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path.as_ref())?;
        Self::from_file(file, false)
    }

    fn from_file(file: File, writable: bool) -> Result<Self> {
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
            writable,
        })
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        checked_end(offset, buf.len(), self.len, "read")?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(SujError::ReadOnly);
        }
        checked_end(offset, buf.len(), self.len, "write")?;
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// In-memory byte device.
///
/// Clones share the same backing buffer, so a caller can keep a handle to
/// inspect an image after handing another clone to a `DiskDevice`.
#[derive(Debug, Clone)]
pub struct MemoryByteDevice {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl MemoryByteDevice {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self::from_vec(vec![0_u8; len])
    }

    #[must_use]
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(bytes)),
        }
    }

    /// Copy of the current contents.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }
}

impl ByteDevice for MemoryByteDevice {
    fn len_bytes(&self) -> u64 {
        u64::try_from(self.bytes.lock().len()).unwrap_or(u64::MAX)
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.lock();
        checked_end(offset, buf.len(), u64::try_from(bytes.len()).unwrap_or(u64::MAX), "read")?;
        let start = usize::try_from(offset)
            .map_err(|_| SujError::Format("offset does not fit usize".to_owned()))?;
        buf.copy_from_slice(&bytes[start..start + buf.len()]);
        drop(bytes);
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.lock();
        checked_end(offset, buf.len(), u64::try_from(bytes.len()).unwrap_or(u64::MAX), "write")?;
        let start = usize::try_from(offset)
            .map_err(|_| SujError::Format("offset does not fit usize".to_owned()))?;
        bytes[start..start + buf.len()].copy_from_slice(buf);
        drop(bytes);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// I/O counters for one `DiskDevice`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoStats {
    pub reads: u64,
    pub writes: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

/// Sector-addressed device handle.
///
/// All filesystem metadata I/O goes through `read`/`write`, addressed in
/// `DEV_BSIZE` units. Short or out-of-range transfers are errors and are
/// never retried.
#[derive(Debug)]
pub struct DiskDevice<D: ByteDevice> {
    inner: D,
    stats: IoStats,
}

impl<D: ByteDevice> DiskDevice<D> {
    #[must_use]
    pub fn new(inner: D) -> Self {
        Self {
            inner,
            stats: IoStats::default(),
        }
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }

    #[must_use]
    pub fn stats(&self) -> IoStats {
        self.stats
    }

    /// Device size in sectors.
    #[must_use]
    pub fn sectors(&self) -> u64 {
        self.inner.len_bytes() / DEV_BSIZE
    }

    fn byte_offset(addr: DevAddr) -> Result<u64> {
        addr.to_byte_offset().ok_or_else(|| SujError::Corruption {
            block: addr.0,
            detail: "sector address overflows byte offset".to_owned(),
        })
    }

    /// Read `len` bytes starting at sector `addr`.
    pub fn read(&mut self, addr: DevAddr, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0_u8; len];
        self.read_into(addr, &mut buf)?;
        Ok(buf)
    }

    /// Read `buf.len()` bytes starting at sector `addr` into `buf`.
    pub fn read_into(&mut self, addr: DevAddr, buf: &mut [u8]) -> Result<()> {
        let offset = Self::byte_offset(addr)?;
        trace!(sector = addr.0, len = buf.len(), "device read");
        self.inner.read_exact_at(offset, buf)?;
        self.stats.reads += 1;
        self.stats.bytes_read += buf.len() as u64;
        Ok(())
    }

    /// Write `bytes` starting at sector `addr`.
    pub fn write(&mut self, addr: DevAddr, bytes: &[u8]) -> Result<()> {
        let offset = Self::byte_offset(addr)?;
        trace!(sector = addr.0, len = bytes.len(), "device write");
        self.inner.write_all_at(offset, bytes)?;
        self.stats.writes += 1;
        self.stats.bytes_written += bytes.len() as u64;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.inner.sync()
    }
}
