//! Reference-counted physical pages
//!
//! A `VmPage` wraps one page frame. Pages can be shared between address
//! spaces (copy-on-write after a fork, read-only file cache); the refcount
//! counts installed mappings, and the frame goes back to the allocator
//! when the last mapping is dropped.
//!
//! Inode-backed pages additionally live in a cache keyed by
//! `(inode, offset)` so every mapper of the same file page shares one
//! frame. A page under construction carries the `PENDING` flag and stays
//! locked until its creator has filled it; concurrent lookups block on the
//! page lock.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::errno::KResult;
use crate::kern::lock::{LockLevel, SpinLock, Spinlock};
use crate::mm::phys;
use crate::types::InodeId;

/// Page state flags.
pub mod pageflags {
    /// Mappings of this page must be read-only
    pub const READ_ONLY: u32 = 0x01;
    /// Owned by a single address space; never shared
    pub const PRIVATE: u32 = 0x02;
    /// Contents are still being read in; the page lock is held
    pub const PENDING: u32 = 0x04;
    /// Produced by copy-on-write promotion
    pub const PROMOTED: u32 = 0x08;
}

/// Where a page's contents came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSource {
    /// Zero-filled on first touch
    Anonymous,
    /// Read from a file at the given byte offset
    Inode { inode: InodeId, offset: u64 },
}

/// A handle to one physical page frame.
pub struct VmPage {
    frame: u64,
    refcount: AtomicU32,
    flags: AtomicU32,
    source: PageSource,
    /// Last virtual address this page was mapped at; a hint for unmapping
    vaddr: AtomicU64,
    /// Content lock; also serializes waiters against a pending read
    lock: Spinlock,
}

impl VmPage {
    fn new(frame: u64, flags: u32, source: PageSource, locked: bool) -> Arc<VmPage> {
        Arc::new(VmPage {
            frame,
            refcount: AtomicU32::new(1),
            flags: AtomicU32::new(flags),
            source,
            vaddr: AtomicU64::new(0),
            lock: if locked {
                Spinlock::new_locked(LockLevel::VmPage)
            } else {
                Spinlock::with_level(LockLevel::VmPage)
            },
        })
    }

    /// Allocate a private anonymous page (not zeroed).
    pub fn alloc_private(extra_flags: u32) -> KResult<Arc<VmPage>> {
        let frame = phys::alloc_frame()?;
        Ok(VmPage::new(
            frame,
            pageflags::PRIVATE | extra_flags,
            PageSource::Anonymous,
            false,
        ))
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn source(&self) -> PageSource {
        self.source
    }

    // === Flags ===

    pub fn has_flags(&self, mask: u32) -> bool {
        self.flags.load(Ordering::Acquire) & mask != 0
    }

    pub fn set_flags(&self, mask: u32) {
        self.flags.fetch_or(mask, Ordering::AcqRel);
    }

    pub fn clear_flags(&self, mask: u32) {
        self.flags.fetch_and(!mask, Ordering::AcqRel);
    }

    pub fn is_read_only(&self) -> bool {
        self.has_flags(pageflags::READ_ONLY)
    }

    pub fn is_private(&self) -> bool {
        self.has_flags(pageflags::PRIVATE)
    }

    // === Lock ===

    pub fn lock(&self) {
        self.lock.lock();
    }

    pub fn unlock(&self) {
        self.lock.unlock();
    }

    // === Mapping hint ===

    pub fn set_vaddr(&self, virt: u64) {
        self.vaddr.store(virt, Ordering::Relaxed);
    }

    pub fn vaddr(&self) -> u64 {
        self.vaddr.load(Ordering::Relaxed)
    }

    // === Reference counting ===

    /// Count one more mapping of this page.
    pub fn ref_(&self) {
        let prev = self.refcount.fetch_add(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "reffing page with zero refcount");
    }

    /// Drop one mapping. The last drop removes the page from the inode
    /// cache and returns the frame to the allocator.
    pub fn deref(self: &Arc<Self>) {
        let prev = self.refcount.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "dereffing page with zero refcount");
        if prev == 1 {
            if let PageSource::Inode { inode, offset } = self.source {
                cache_remove(inode, offset);
            }
            phys::free_frame(self.frame);
        }
    }

    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Relaxed)
    }

    // === Contents ===

    /// Zero the page.
    pub fn zero(&self) {
        phys::zero_frame(self.frame);
    }

    /// Copy the first `len` bytes into `dst`, zero-filling its remainder.
    pub fn copy_to(&self, dst: &VmPage, len: usize) {
        phys::copy_frame(self.frame, dst.frame, len);
    }

    /// Write-fault resolution for a copy-on-write page: a fresh private
    /// page with the same contents. The faulting side installs the copy,
    /// which drops this page's slot reference; once every sharer has
    /// promoted, the original frame goes back to the allocator.
    pub fn promote(self: &Arc<Self>) -> KResult<Arc<VmPage>> {
        let new = VmPage::alloc_private(pageflags::PROMOTED)?;
        self.copy_to(&new, crate::mm::PAGE_SIZE);
        Ok(new)
    }
}

impl core::fmt::Debug for VmPage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VmPage")
            .field("frame", &self.frame)
            .field("refcount", &self.refcount())
            .field("flags", &self.flags.load(Ordering::Relaxed))
            .field("source", &self.source)
            .finish()
    }
}

// ============================================================================
// Inode page cache
// ============================================================================

type CacheKey = (InodeId, u64);

static INODE_CACHE: SpinLock<BTreeMap<CacheKey, Arc<VmPage>>> =
    SpinLock::with_level(LockLevel::InodeCache, BTreeMap::new());

/// Find or create the page caching `inode` contents at page-aligned
/// `offset`.
///
/// The returned page is locked in both cases. When `created` is true the
/// page carries `PENDING` and holds no data yet: the caller must fill it,
/// clear `PENDING` and unlock. Concurrent lookups for the same key block
/// on the page lock until then.
pub fn lookup_or_create_inode_page(
    inode: InodeId,
    offset: u64,
    extra_flags: u32,
) -> KResult<(Arc<VmPage>, bool)> {
    debug_assert_eq!(offset % crate::mm::PAGE_SIZE as u64, 0);

    let existing = {
        let cache = INODE_CACHE.lock();
        cache.get(&(inode, offset)).cloned()
    };
    if let Some(page) = existing {
        page.ref_();
        page.lock();
        debug_assert!(!page.has_flags(pageflags::PENDING));
        return Ok((page, false));
    }

    let frame = phys::alloc_frame()?;
    let page = VmPage::new(
        frame,
        pageflags::PENDING | extra_flags,
        PageSource::Inode { inode, offset },
        true,
    );

    let mut cache = INODE_CACHE.lock();
    // Someone else may have raced the creation; prefer their page.
    if let Some(other) = cache.get(&(inode, offset)).cloned() {
        drop(cache);
        phys::free_frame(frame);
        other.ref_();
        other.lock();
        return Ok((other, false));
    }
    cache.insert((inode, offset), page.clone());
    drop(cache);

    Ok((page, true))
}

fn cache_remove(inode: InodeId, offset: u64) {
    INODE_CACHE.lock().remove(&(inode, offset));
}

/// Whether a given file page is currently cached.
pub fn inode_page_cached(inode: InodeId, offset: u64) -> bool {
    INODE_CACHE.lock().contains_key(&(inode, offset))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_private_page_lifecycle() {
        phys::test_pool();
        let before = phys::free_frame_count();
        let page = VmPage::alloc_private(0).unwrap();
        assert!(page.is_private());
        assert_eq!(page.refcount(), 1);
        page.zero();
        page.deref();
        assert_eq!(phys::free_frame_count(), before);
    }

    #[test]
    fn test_promote_copies_contents() {
        phys::test_pool();
        let page = VmPage::alloc_private(pageflags::READ_ONLY).unwrap();
        unsafe { *phys::frame_ptr(page.frame()) = 0xAA };
        page.ref_(); // second mapping

        let promoted = page.promote().unwrap();
        assert!(!Arc::ptr_eq(&page, &promoted));
        assert_eq!(unsafe { *phys::frame_ptr(promoted.frame()) }, 0xAA);
        assert!(!promoted.is_read_only());
        assert!(promoted.has_flags(pageflags::PROMOTED));

        // The faulting side drops its hold on the original
        page.deref();
        assert_eq!(page.refcount(), 1);
        page.deref();
        promoted.deref();
    }

    #[test]
    fn test_inode_cache_shares_pages() {
        let _guard = crate::testsync::lock();
        phys::test_pool();
        let ino = InodeId(900);

        let (page, created) = lookup_or_create_inode_page(ino, 0, 0).unwrap();
        assert!(created);
        assert!(page.has_flags(pageflags::PENDING));
        page.zero();
        page.clear_flags(pageflags::PENDING);
        page.unlock();

        let (again, created) = lookup_or_create_inode_page(ino, 0, 0).unwrap();
        assert!(!created);
        assert!(Arc::ptr_eq(&page, &again));
        assert_eq!(again.refcount(), 2);
        again.unlock();

        // Dropping both mappings evicts the cache entry
        again.deref();
        page.deref();
        assert!(!inode_page_cached(ino, 0));
    }

    #[test]
    fn test_distinct_offsets_distinct_pages() {
        let _guard = crate::testsync::lock();
        phys::test_pool();
        let ino = InodeId(901);
        let (a, _) = lookup_or_create_inode_page(ino, 0, 0).unwrap();
        let (b, _) = lookup_or_create_inode_page(ino, 4096, 0).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        a.clear_flags(pageflags::PENDING);
        b.clear_flags(pageflags::PENDING);
        a.unlock();
        b.unlock();
        a.deref();
        b.deref();
    }
}
