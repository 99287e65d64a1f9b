use std::collections::HashSet;

use suj_block::ByteDevice;
use suj_error::{Result, SujError};
use suj_types::InodeNumber;
use tracing::{debug, warn};

use crate::context::RecoveryContext;

impl<D: ByteDevice> RecoveryContext<D> {
    /// Walk the unlinked-inode list from `fs_sujfree`, unchaining every
    /// entry and releasing those with no links.
    ///
    /// Clears `fs_sujfree`. Returns the number of inodes released.
    pub fn sweep_unlinked_list(&mut self) -> Result<u64> {
        let mut next = self.sb.sujfree;
        self.sb.sujfree = 0;
        let mut seen = HashSet::new();
        let mut released = 0_u64;
        while next != 0 {
            let ino = InodeNumber(next);
            if u64::from(next) >= self.sb.maxino() {
                return Err(SujError::corruption(
                    0,
                    format!("unlinked list names inode {ino} beyond {}", self.sb.maxino()),
                ));
            }
            if !seen.insert(ino) {
                warn!(ino = ino.0, "unlinked list loops back on itself");
                break;
            }
            let mut dinode = self.inode_read(ino)?;
            next = dinode.freelink();
            dinode.set_freelink(0);
            self.inode_write(ino, &dinode)?;
            if dinode.nlink() == 0 {
                debug!(ino = ino.0, mode = dinode.mode(), "releasing unlinked inode");
                self.truncate_and_free(ino)?;
                released += 1;
            } else {
                debug!(ino = ino.0, nlink = dinode.nlink(), "unlinked inode still referenced");
            }
        }
        Ok(released)
    }
}
