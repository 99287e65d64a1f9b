//! UFS2 on-disk inode.

use suj_types::{
    DINODE2_SIZE, FragAddr, ParseError, UFS_NDADDR, UFS_NIADDR, UFS_NXADDR, ensure_slice,
    read_le_i64, read_le_u16, read_le_u32, read_le_u64, write_le_i64, write_le_u16, write_le_u32,
    write_le_u64,
};

use crate::ufs_ckhash;

const DI_MODE: usize = 0;
const DI_NLINK: usize = 2;
const DI_SIZE: usize = 16;
const DI_BLOCKS: usize = 24;
const DI_GEN: usize = 80;
const DI_FLAGS: usize = 88;
const DI_EXTSIZE: usize = 92;
const DI_EXTB: usize = 96;
const DI_DB: usize = 112;
const DI_IB: usize = 208;
const DI_MODREV: usize = 232;
const DI_FREELINK: usize = 240;
const DI_CKHASH: usize = 244;

/// Copy of one 256-byte UFS2 dinode.
///
/// Block pointers are stored signed on disk; negative values never name a
/// real fragment and read back as holes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dinode {
    bytes: [u8; DINODE2_SIZE],
}

impl Dinode {
    /// Copy a dinode out of an inode block.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        let src = ensure_slice(bytes, 0, DINODE2_SIZE)?;
        let mut out = [0_u8; DINODE2_SIZE];
        out.copy_from_slice(src);
        Ok(Self { bytes: out })
    }

    #[must_use]
    pub fn zeroed() -> Self {
        Self {
            bytes: [0_u8; DINODE2_SIZE],
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; DINODE2_SIZE] {
        &self.bytes
    }

    fn u16_at(&self, off: usize) -> u16 {
        read_le_u16(&self.bytes, off).unwrap_or_default()
    }

    fn u32_at(&self, off: usize) -> u32 {
        read_le_u32(&self.bytes, off).unwrap_or_default()
    }

    fn u64_at(&self, off: usize) -> u64 {
        read_le_u64(&self.bytes, off).unwrap_or_default()
    }

    fn addr_at(&self, off: usize) -> FragAddr {
        let raw = read_le_i64(&self.bytes, off).unwrap_or_default();
        FragAddr(u64::try_from(raw).unwrap_or(0))
    }

    // All offsets below are constants inside the fixed-size array, so the
    // writes cannot fail.
    fn put_u16(&mut self, off: usize, value: u16) {
        let _ = write_le_u16(&mut self.bytes, off, value);
    }

    fn put_u32(&mut self, off: usize, value: u32) {
        let _ = write_le_u32(&mut self.bytes, off, value);
    }

    fn put_u64(&mut self, off: usize, value: u64) {
        let _ = write_le_u64(&mut self.bytes, off, value);
    }

    fn put_addr(&mut self, off: usize, addr: FragAddr) {
        let _ = write_le_i64(&mut self.bytes, off, i64::try_from(addr.0).unwrap_or(0));
    }

    #[must_use]
    pub fn mode(&self) -> u16 {
        self.u16_at(DI_MODE)
    }

    pub fn set_mode(&mut self, mode: u16) {
        self.put_u16(DI_MODE, mode);
    }

    /// Link count (`di_nlink`, signed on disk).
    #[must_use]
    pub fn nlink(&self) -> i16 {
        i16::from_le_bytes(self.u16_at(DI_NLINK).to_le_bytes())
    }

    pub fn set_nlink(&mut self, nlink: i16) {
        self.put_u16(DI_NLINK, u16::from_le_bytes(nlink.to_le_bytes()));
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.u64_at(DI_SIZE)
    }

    pub fn set_size(&mut self, size: u64) {
        self.put_u64(DI_SIZE, size);
    }

    /// Allocated space in `DEV_BSIZE` sectors.
    #[must_use]
    pub fn blocks(&self) -> u64 {
        self.u64_at(DI_BLOCKS)
    }

    pub fn set_blocks(&mut self, blocks: u64) {
        self.put_u64(DI_BLOCKS, blocks);
    }

    #[must_use]
    pub fn generation(&self) -> u32 {
        self.u32_at(DI_GEN)
    }

    pub fn set_generation(&mut self, generation: u32) {
        self.put_u32(DI_GEN, generation);
    }

    #[must_use]
    pub fn flags(&self) -> u32 {
        self.u32_at(DI_FLAGS)
    }

    pub fn set_flags(&mut self, flags: u32) {
        self.put_u32(DI_FLAGS, flags);
    }

    #[must_use]
    pub fn extsize(&self) -> u32 {
        self.u32_at(DI_EXTSIZE)
    }

    pub fn set_extsize(&mut self, extsize: u32) {
        self.put_u32(DI_EXTSIZE, extsize);
    }

    /// Extended-attribute block pointer `i` (`i < UFS_NXADDR`).
    #[must_use]
    pub fn extb(&self, i: usize) -> FragAddr {
        if i >= UFS_NXADDR {
            return FragAddr(0);
        }
        self.addr_at(DI_EXTB + 8 * i)
    }

    pub fn set_extb(&mut self, i: usize, addr: FragAddr) {
        if i < UFS_NXADDR {
            self.put_addr(DI_EXTB + 8 * i, addr);
        }
    }

    /// Direct block pointer `i` (`i < UFS_NDADDR`).
    #[must_use]
    pub fn db(&self, i: usize) -> FragAddr {
        if i >= UFS_NDADDR {
            return FragAddr(0);
        }
        self.addr_at(DI_DB + 8 * i)
    }

    pub fn set_db(&mut self, i: usize, addr: FragAddr) {
        if i < UFS_NDADDR {
            self.put_addr(DI_DB + 8 * i, addr);
        }
    }

    /// Indirect block pointer at level `i` (`i < UFS_NIADDR`).
    #[must_use]
    pub fn ib(&self, i: usize) -> FragAddr {
        if i >= UFS_NIADDR {
            return FragAddr(0);
        }
        self.addr_at(DI_IB + 8 * i)
    }

    pub fn set_ib(&mut self, i: usize, addr: FragAddr) {
        if i < UFS_NIADDR {
            self.put_addr(DI_IB + 8 * i, addr);
        }
    }

    /// Mount generation stamp (`di_modrev`), compared against `fs_mtime`
    /// for the journal inode.
    #[must_use]
    pub fn modrev(&self) -> u64 {
        self.u64_at(DI_MODREV)
    }

    pub fn set_modrev(&mut self, modrev: u64) {
        self.put_u64(DI_MODREV, modrev);
    }

    /// Next inode on the unlinked-but-referenced chain.
    #[must_use]
    pub fn freelink(&self) -> u32 {
        self.u32_at(DI_FREELINK)
    }

    pub fn set_freelink(&mut self, next: u32) {
        self.put_u32(DI_FREELINK, next);
    }

    #[must_use]
    pub fn ckhash(&self) -> u32 {
        self.u32_at(DI_CKHASH)
    }

    pub fn update_ckhash(&mut self) {
        self.put_u32(DI_CKHASH, 0);
        let hash = ufs_ckhash(&self.bytes);
        self.put_u32(DI_CKHASH, hash);
    }

    /// Zero every field except the generation number.
    pub fn clear_preserving_generation(&mut self) {
        let generation = self.generation();
        self.bytes = [0_u8; DINODE2_SIZE];
        self.set_generation(generation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use suj_types::S_IFDIR;

    #[test]
    fn accessors_round_trip() {
        let mut ino = Dinode::zeroed();
        ino.set_mode(S_IFDIR | 0o755);
        ino.set_nlink(3);
        ino.set_size(4096);
        ino.set_db(0, FragAddr(224));
        ino.set_ib(0, FragAddr(232));
        ino.set_extb(1, FragAddr(240));
        ino.set_freelink(17);

        let copy = Dinode::from_bytes(ino.as_bytes()).expect("copy");
        assert_eq!(copy.mode(), S_IFDIR | 0o755);
        assert_eq!(copy.nlink(), 3);
        assert_eq!(copy.db(0), FragAddr(224));
        assert_eq!(copy.ib(0), FragAddr(232));
        assert_eq!(copy.extb(1), FragAddr(240));
        assert_eq!(copy.freelink(), 17);
        assert_eq!(copy.db(UFS_NDADDR), FragAddr(0));
    }

    #[test]
    fn negative_nlink_survives() {
        let mut ino = Dinode::zeroed();
        ino.set_nlink(-1);
        assert_eq!(ino.nlink(), -1);
    }

    #[test]
    fn clear_keeps_generation() {
        let mut ino = Dinode::zeroed();
        ino.set_generation(0xDEAD_BEEF);
        ino.set_mode(0o100_644);
        ino.set_db(3, FragAddr(999));
        ino.clear_preserving_generation();
        assert_eq!(ino.generation(), 0xDEAD_BEEF);
        assert_eq!(ino.mode(), 0);
        assert_eq!(ino.db(3), FragAddr(0));
    }

    #[test]
    fn check_hash_changes_with_contents() {
        let mut ino = Dinode::zeroed();
        ino.update_ckhash();
        let first = ino.ckhash();
        ino.set_nlink(1);
        ino.update_ckhash();
        assert_ne!(first, ino.ckhash());
    }

    #[test]
    fn short_buffer_is_rejected() {
        assert!(Dinode::from_bytes(&[0_u8; 100]).is_err());
    }
}
