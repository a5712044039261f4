//! Filesystem interface used by the VM layer
//!
//! Only the narrow surface the fault handler needs: a dentry names an
//! inode, inodes are readable at byte offsets, and both are reference
//! counted. Filesystems register an operations table per inode; an
//! in-memory kind is provided for ramdisk-style backing and tests.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use spin::Mutex;

use crate::errno::{Errno, KResult};
use crate::types::InodeId;

/// Which filesystem implementation backs an inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsKind {
    /// Contents held in kernel memory
    Mem,
    /// An external filesystem driver
    External,
}

/// Operations an inode's filesystem provides.
pub struct InodeOps {
    /// Read up to `buf.len()` bytes at `offset`; returns the byte count.
    pub read: fn(&Inode, &mut [u8], u64) -> KResult<usize>,
}

fn mem_read(inode: &Inode, buf: &mut [u8], offset: u64) -> KResult<usize> {
    let data = inode.data.lock();
    let offset = offset as usize;
    if offset >= data.len() {
        return Ok(0);
    }
    let n = buf.len().min(data.len() - offset);
    buf[..n].copy_from_slice(&data[offset..offset + n]);
    Ok(n)
}

/// Operations table for memory-backed inodes.
pub static MEM_INODE_OPS: InodeOps = InodeOps { read: mem_read };

/// The file body behind a dentry, addressable by offset.
pub struct Inode {
    pub id: InodeId,
    pub kind: FsKind,
    ops: &'static InodeOps,
    size: AtomicU64,
    /// Backing bytes for `FsKind::Mem` inodes; unused otherwise
    data: Mutex<Vec<u8>>,
}

impl Inode {
    /// An inode served by an external filesystem driver.
    pub fn new(id: InodeId, kind: FsKind, ops: &'static InodeOps, size: u64) -> Arc<Inode> {
        Arc::new(Inode {
            id,
            kind,
            ops,
            size: AtomicU64::new(size),
            data: Mutex::new(Vec::new()),
        })
    }

    /// A memory-backed inode holding `data`.
    pub fn new_mem(id: InodeId, data: Vec<u8>) -> Arc<Inode> {
        let size = data.len() as u64;
        Arc::new(Inode {
            id,
            kind: FsKind::Mem,
            ops: &MEM_INODE_OPS,
            size: AtomicU64::new(size),
            data: Mutex::new(data),
        })
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Relaxed)
    }

    pub fn read(&self, buf: &mut [u8], offset: u64) -> KResult<usize> {
        (self.ops.read)(self, buf, offset)
    }
}

/// A named directory entry referring to an inode.
pub struct Dentry {
    pub name: heapless::String<64>,
    pub inode: Arc<Inode>,
    refcount: AtomicU32,
}

impl Dentry {
    pub fn new(name: &str, inode: Arc<Inode>) -> Arc<Dentry> {
        let mut buf = heapless::String::new();
        for c in name.chars() {
            if buf.push(c).is_err() {
                break;
            }
        }
        Arc::new(Dentry {
            name: buf,
            inode,
            refcount: AtomicU32::new(1),
        })
    }

    pub fn ref_(&self) {
        let prev = self.refcount.fetch_add(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "reffing dead dentry");
    }

    pub fn deref(&self) {
        let prev = self.refcount.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "dereffing dead dentry");
    }

    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Relaxed)
    }

    /// Read from the backing inode at `offset`.
    pub fn read(&self, buf: &mut [u8], offset: u64) -> KResult<usize> {
        self.inode.read(buf, offset)
    }

    /// Read from the backing inode; short reads against a live offset are
    /// an I/O error, matching what the fault handler requires.
    pub fn read_exact(&self, buf: &mut [u8], offset: u64) -> KResult<()> {
        let n = self.inode.read(buf, offset)?;
        if n != buf.len() {
            return Err(Errno::Io);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mem_inode_read() {
        let inode = Inode::new_mem(InodeId(1), alloc::vec![1, 2, 3, 4, 5]);
        assert_eq!(inode.size(), 5);

        let mut buf = [0u8; 3];
        assert_eq!(inode.read(&mut buf, 1).unwrap(), 3);
        assert_eq!(buf, [2, 3, 4]);

        // Reads past the end return what is left
        assert_eq!(inode.read(&mut buf, 4).unwrap(), 1);
        assert_eq!(inode.read(&mut buf, 99).unwrap(), 0);
    }

    #[test]
    fn test_dentry_read_exact() {
        let inode = Inode::new_mem(InodeId(2), alloc::vec![7; 100]);
        let dentry = Dentry::new("initrd", inode);
        let mut buf = [0u8; 50];
        dentry.read_exact(&mut buf, 25).unwrap();
        assert!(buf.iter().all(|&b| b == 7));

        let mut big = [0u8; 200];
        assert_eq!(dentry.read_exact(&mut big, 0), Err(Errno::Io));
    }

    #[test]
    fn test_dentry_refcount() {
        let dentry = Dentry::new("x", Inode::new_mem(InodeId(3), Vec::new()));
        assert_eq!(dentry.refcount(), 1);
        dentry.ref_();
        assert_eq!(dentry.refcount(), 2);
        dentry.deref();
        assert_eq!(dentry.refcount(), 1);
    }
}
