//! Page fault resolution
//!
//! Turns a faulting access into a page installation. Three sources:
//!
//! - **Copy-on-write**: a write to a shared page in a cow-flagged area
//!   promotes it into a private copy mapped writable.
//! - **File-backed**: the touched page lies inside the area's backing-file
//!   window; the inode page cache supplies (or reads) the shared frame.
//!   Pages straddling the end of the window are copied with a zero tail.
//! - **Anonymous**: everything else zero-fills a fresh private page.
//!
//! Mappings are entered with permissions derived from the area: read-only
//! areas always map read-only, and cow areas map read-only even when
//! writable so the next write re-enters promotion.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::errno::{Errno, KResult};
use crate::mm::phys;
use crate::mm::vmpage::{self, pageflags, VmPage};
use crate::mm::vmspace::{vmflags, VmSpace};
use crate::mm::{trunc_page, PAGE_SIZE};

// ============================================================================
// Statistics
// ============================================================================

/// Fault counters, readable from the debugger.
#[derive(Debug, Default)]
pub struct FaultStats {
    pub total: AtomicU64,
    pub cow: AtomicU64,
    pub zero_fill: AtomicU64,
    /// File pages read in from the filesystem
    pub page_in: AtomicU64,
    /// File pages served from the inode cache
    pub cache_hit: AtomicU64,
    pub failures: AtomicU64,
}

static FAULT_STATS: FaultStats = FaultStats {
    total: AtomicU64::new(0),
    cow: AtomicU64::new(0),
    zero_fill: AtomicU64::new(0),
    page_in: AtomicU64::new(0),
    cache_hit: AtomicU64::new(0),
    failures: AtomicU64::new(0),
};

pub fn stats() -> &'static FaultStats {
    &FAULT_STATS
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

// ============================================================================
// Helpers
// ============================================================================

/// Page flags derived from the owning area: pages of read-only areas may
/// never be written through any mapping.
fn page_flags_for_area(area_flags: u32) -> u32 {
    if area_flags & (vmflags::READ | vmflags::WRITE) == vmflags::READ {
        pageflags::READ_ONLY
    } else {
        0
    }
}

/// Mapping permissions for a page in an area. Copy-on-write areas and
/// read-only pages lose the write bit so the hardware faults again.
fn map_protection(area_flags: u32, page: &VmPage) -> u32 {
    let mut prot = area_flags & vmflags::PROT_MASK;
    if area_flags & vmflags::COW != 0 || page.is_read_only() {
        prot &= !vmflags::WRITE;
    }
    prot
}

/// Fill a freshly created inode page from the filesystem, zero-filling
/// whatever lies past the end of the file.
fn fill_inode_page(page: &Arc<VmPage>, dentry: &Arc<crate::vfs::Dentry>, file_off: u64) -> KResult<()> {
    let size = dentry.inode.size();
    let read_len = if file_off >= size {
        0
    } else {
        ((size - file_off) as usize).min(PAGE_SIZE)
    };

    if read_len < PAGE_SIZE {
        page.zero();
    }
    if read_len > 0 {
        let buf = unsafe {
            core::slice::from_raw_parts_mut(phys::frame_ptr(page.frame()), read_len)
        };
        dentry.read_exact(buf, file_off)?;
    }
    page.clear_flags(pageflags::PENDING);
    Ok(())
}

/// Resolve a fault inside the area's backing-file window. Returns false
/// when the address lies past the window (zero-fill territory).
fn dentry_backed_fault(
    vs: &mut VmSpace,
    base: u64,
    aligned_virt: u64,
) -> KResult<bool> {
    let (dentry, doffset, dlength, area_flags) = {
        let area = vs.areas.get(&base).unwrap();
        let Some(ref dentry) = area.dentry else {
            return Ok(false);
        };
        (dentry.clone(), area.doffset, area.dlength, area.flags)
    };
    debug_assert_eq!(doffset % PAGE_SIZE as u64, 0, "window offset not page-aligned");

    let read_off = aligned_virt - base;
    if read_off >= dlength {
        // Past the file window; the caller zero-fills.
        return Ok(false);
    }
    let file_off = doffset + read_off;

    let (cached, created) = vmpage::lookup_or_create_inode_page(
        dentry.inode.id,
        file_off,
        page_flags_for_area(area_flags),
    )?;
    if created {
        if let Err(e) = fill_inode_page(&cached, &dentry, file_off) {
            cached.unlock();
            cached.deref();
            bump(&FAULT_STATS.failures);
            return Err(e);
        }
        bump(&FAULT_STATS.page_in);
    } else {
        bump(&FAULT_STATS.cache_hit);
    }

    let whole_page_in_window = read_off + PAGE_SIZE as u64 <= dlength;
    let writable_private =
        area_flags & vmflags::WRITE != 0 && area_flags & vmflags::SHARED == 0;

    if whole_page_in_window && !writable_private {
        // Read-only or shared: the cached frame is mapped directly.
        let prot = map_protection(area_flags, &cached);
        cached.unlock();
        vs.install_page(base, aligned_virt, cached, prot);
    } else if whole_page_in_window {
        // Privately writable: share the cached frame copy-on-write. The
        // area is flagged and the mapping loses its write bit so the
        // first store promotes.
        {
            let area = vs.areas.get_mut(&base).unwrap();
            area.flags |= vmflags::COW;
        }
        let prot = area_flags & vmflags::PROT_MASK & !vmflags::WRITE;
        cached.unlock();
        vs.install_page(base, aligned_virt, cached, prot);
    } else {
        // The page straddles the end of the window: copy the live bytes
        // into a private page and zero the rest.
        let live = (dlength - read_off).min(PAGE_SIZE as u64) as usize;
        let private = VmPage::alloc_private(page_flags_for_area(area_flags))?;
        cached.copy_to(&private, live);
        cached.unlock();
        cached.deref();
        let prot = map_protection(area_flags, &private);
        vs.install_page(base, aligned_virt, private, prot);
    }
    Ok(true)
}

// ============================================================================
// Entry point
// ============================================================================

/// Resolve a fault at `virt` with the given access bits (`vmflags`
/// values). Success means the faulting instruction can be restarted.
pub fn handle_fault(vs: &mut VmSpace, virt: u64, access: u32) -> KResult<()> {
    bump(&FAULT_STATS.total);

    let Some(base) = vs.area_base_of(virt) else {
        bump(&FAULT_STATS.failures);
        return Err(Errno::Fault);
    };
    let aligned = trunc_page(virt);

    let (area_flags, existing) = {
        let area = vs.areas.get(&base).unwrap();
        (area.flags, area.page_at(aligned))
    };

    if let Some(vp) = existing {
        vp.lock();
        if access & vmflags::WRITE != 0 && area_flags & vmflags::COW != 0 {
            // Write to a shared cow page: promote into a private copy and
            // remap writable. Installing the copy drops the old page's
            // slot reference.
            debug_assert!(!vp.is_read_only(), "promoting a read-only page");
            let promoted = vp.promote()?;
            vp.unlock();
            let prot = area_flags & vmflags::PROT_MASK;
            vs.install_page(base, aligned, promoted, prot);
            bump(&FAULT_STATS.cow);
            return Ok(());
        }
        // Mapped, but the access is not a promotable write: reject.
        vp.unlock();
        bump(&FAULT_STATS.failures);
        return Err(Errno::Fault);
    }

    if dentry_backed_fault(vs, base, aligned)? {
        return Ok(());
    }

    // Anonymous: a zeroed private page, mapped per area flags.
    let page = VmPage::alloc_private(page_flags_for_area(area_flags))?;
    page.zero();
    let prot = map_protection(area_flags, &page);
    vs.install_page(base, aligned, page, prot);
    bump(&FAULT_STATS.zero_fill);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::vmspace::vmflags as vf;
    use crate::types::InodeId;
    use crate::vfs::{Dentry, Inode};

    const RW_USER: u32 = vf::READ | vf::WRITE | vf::USER;

    fn anon_space(pages: usize) -> (VmSpace, u64) {
        phys::test_pool();
        let mut vs = VmSpace::new();
        let base = vs.map(pages * PAGE_SIZE, RW_USER).unwrap();
        (vs, base)
    }

    #[test]
    fn test_unmapped_address_faults() {
        let (mut vs, _) = anon_space(1);
        assert_eq!(handle_fault(&mut vs, 0x6000_0000, vf::READ), Err(Errno::Fault));
    }

    #[test]
    fn test_anonymous_zero_fill() {
        let (mut vs, base) = anon_space(1);
        handle_fault(&mut vs, base + 0x123, vf::WRITE).unwrap();

        let entry = vs.pmap.extract(base).unwrap();
        assert!(entry.writable());
        let mut buf = [0xFFu8; 16];
        vs.copy_in(base, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_write_to_read_only_area_rejected() {
        phys::test_pool();
        let mut vs = VmSpace::new();
        let base = vs.map(PAGE_SIZE, vf::READ | vf::USER).unwrap();
        // First touch installs a read-only zero page
        handle_fault(&mut vs, base, vf::READ).unwrap();
        assert!(!vs.pmap.extract(base).unwrap().writable());
        // The retried write then has nowhere to go
        assert_eq!(handle_fault(&mut vs, base, vf::WRITE), Err(Errno::Fault));
    }

    #[test]
    fn test_cow_isolation_after_clone() {
        let (mut parent, base) = anon_space(3);

        // Parent writes before the fork
        parent.copy_out(base, &[0xAA]).unwrap();
        let original = parent.area_containing(base).unwrap().page_at(base).unwrap();
        assert_eq!(original.refcount(), 1);

        let mut child = VmSpace::new();
        parent.clone_into(&mut child).unwrap();
        assert_eq!(original.refcount(), 2);
        assert!(parent.areas.get(&base).unwrap().flags & vf::COW != 0);
        assert!(child.areas.get(&base).unwrap().flags & vf::COW != 0);
        assert!(!parent.pmap.extract(base).unwrap().writable());
        assert!(!child.pmap.extract(base).unwrap().writable());

        // Child's write promotes its copy
        child.copy_out(base, &[0xBB]).unwrap();
        assert_eq!(original.refcount(), 1);

        let mut got = [0u8; 1];
        parent.copy_in(base, &mut got).unwrap();
        assert_eq!(got[0], 0xAA);
        child.copy_in(base, &mut got).unwrap();
        assert_eq!(got[0], 0xBB);

        // Parent's next write promotes too; the original frame is freed
        parent.copy_out(base, &[0xCC]).unwrap();
        assert_eq!(original.refcount(), 0);
        parent.copy_in(base, &mut got).unwrap();
        assert_eq!(got[0], 0xCC);
        child.copy_in(base, &mut got).unwrap();
        assert_eq!(got[0], 0xBB);

        parent.check_invariants();
        child.check_invariants();
    }

    #[test]
    fn test_file_backed_read_only_share() {
        let _guard = crate::testsync::lock();
        phys::test_pool();
        let data: alloc::vec::Vec<u8> = (0..PAGE_SIZE).map(|i| (i % 251) as u8).collect();
        let inode = Inode::new_mem(InodeId(700), data.clone());
        let dentry = Dentry::new("shared-lib", inode);

        let mut vs_a = VmSpace::new();
        let mut vs_b = VmSpace::new();
        let base_a = vs_a
            .map_dentry(&dentry, 0, PAGE_SIZE as u64, PAGE_SIZE, vf::READ | vf::USER)
            .unwrap();
        let base_b = vs_b
            .map_dentry(&dentry, 0, PAGE_SIZE as u64, PAGE_SIZE, vf::READ | vf::USER)
            .unwrap();

        let reads_before = FAULT_STATS.page_in.load(Ordering::Relaxed);
        handle_fault(&mut vs_a, base_a, vf::READ).unwrap();
        handle_fault(&mut vs_b, base_b, vf::READ).unwrap();
        // The inode page was read once and is shared by both spaces
        assert_eq!(FAULT_STATS.page_in.load(Ordering::Relaxed), reads_before + 1);

        let pa = vs_a.pmap.extract(base_a).unwrap();
        let pb = vs_b.pmap.extract(base_b).unwrap();
        assert_eq!(pa.paddr, pb.paddr);
        assert!(!pa.writable());

        let page = vs_a.area_containing(base_a).unwrap().page_at(base_a).unwrap();
        assert_eq!(page.refcount(), 2);

        let mut buf = [0u8; 64];
        vs_b.copy_in(base_b, &mut buf).unwrap();
        assert_eq!(&buf[..], &data[..64]);
    }

    #[test]
    fn test_private_file_mapping_promotes_on_write() {
        let _guard = crate::testsync::lock();
        phys::test_pool();
        let inode = Inode::new_mem(InodeId(701), alloc::vec![0x11; PAGE_SIZE]);
        let dentry = Dentry::new("data", inode);

        let mut vs = VmSpace::new();
        let base = vs
            .map_dentry(&dentry, 0, PAGE_SIZE as u64, PAGE_SIZE, RW_USER)
            .unwrap();

        // The read fault shares the cache frame copy-on-write
        handle_fault(&mut vs, base, vf::READ).unwrap();
        assert!(!vs.pmap.extract(base).unwrap().writable());
        assert!(vs.areas.get(&base).unwrap().flags & vf::COW != 0);
        let cached = vs.area_containing(base).unwrap().page_at(base).unwrap();

        // The write promotes a private copy; the last mapping of the
        // cached page is gone, so its cache entry is evicted with it.
        handle_fault(&mut vs, base, vf::WRITE).unwrap();
        assert!(vs.pmap.extract(base).unwrap().writable());
        let private = vs.area_containing(base).unwrap().page_at(base).unwrap();
        assert!(!Arc::ptr_eq(&cached, &private));
        assert_eq!(cached.refcount(), 0);
        assert!(!vmpage::inode_page_cached(InodeId(701), 0));

        vs.copy_out(base, &[0x99]).unwrap();
        let mut buf = [0u8; 2];
        vs.copy_in(base, &mut buf).unwrap();
        assert_eq!(buf, [0x99, 0x11]);
    }

    #[test]
    fn test_window_straddle_zero_tail() {
        let _guard = crate::testsync::lock();
        phys::test_pool();
        // 1.5 pages of file data in a 2-page area
        let dlength = PAGE_SIZE as u64 + PAGE_SIZE as u64 / 2;
        let inode = Inode::new_mem(InodeId(702), alloc::vec![0x77; dlength as usize]);
        let dentry = Dentry::new("tail", inode);

        let mut vs = VmSpace::new();
        let base = vs
            .map_dentry(&dentry, 0, dlength, 2 * PAGE_SIZE, vf::READ | vf::USER)
            .unwrap();

        // Second page straddles the window end: live bytes then zeros
        let second = base + PAGE_SIZE as u64;
        handle_fault(&mut vs, second, vf::READ).unwrap();
        let page = vs.area_containing(second).unwrap().page_at(second).unwrap();
        assert!(page.is_private());

        let mut buf = [0u8; PAGE_SIZE];
        vs.copy_in(second, &mut buf).unwrap();
        assert!(buf[..PAGE_SIZE / 2].iter().all(|&b| b == 0x77));
        assert!(buf[PAGE_SIZE / 2..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_fault_past_window_zero_fills() {
        let _guard = crate::testsync::lock();
        phys::test_pool();
        let inode = Inode::new_mem(InodeId(703), alloc::vec![0x42; PAGE_SIZE]);
        let dentry = Dentry::new("bss", inode);

        let mut vs = VmSpace::new();
        let base = vs
            .map_dentry(&dentry, 0, PAGE_SIZE as u64, 3 * PAGE_SIZE, RW_USER)
            .unwrap();

        // Third page is entirely past the window: plain anonymous zeroes
        let third = base + 2 * PAGE_SIZE as u64;
        handle_fault(&mut vs, third, vf::WRITE).unwrap();
        let mut buf = [0xFFu8; 32];
        vs.copy_in(third, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
        assert!(vs.pmap.extract(third).unwrap().writable());
    }
}
