//! Per-process virtual address spaces
//!
//! A `VmSpace` is an ordered map from non-overlapping virtual intervals to
//! `VmArea`s. Areas carry permissions and an optional backing-file window;
//! their page slots fill in lazily as the fault handler resolves touches.
//! Cloning a space implements fork: private writable areas go
//! copy-on-write in both parent and child.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::errno::{Errno, KResult};
use crate::mm::phys;
use crate::mm::pmap::Pmap;
use crate::mm::vmpage::VmPage;
use crate::mm::{trunc_page, PAGE_SIZE};
use crate::vfs::Dentry;

/// Area permission and behavior flags; fault flags use the same bits.
pub mod vmflags {
    pub const READ: u32 = 0x01;
    pub const WRITE: u32 = 0x02;
    pub const EXECUTE: u32 = 0x04;
    /// Accessible from user mode
    pub const USER: u32 = 0x08;
    /// Skipped by `clone_into` (per-process pages)
    pub const NO_CLONE: u32 = 0x10;
    /// Writes fault for copy-on-write promotion
    pub const COW: u32 = 0x20;
    /// Shared mapping: never copied, writes go to the common frames
    pub const SHARED: u32 = 0x40;

    /// The bits that translate into hardware mapping permissions.
    pub const PROT_MASK: u32 = READ | WRITE | EXECUTE | USER;
}

/// Base address for mappings without a caller-chosen location.
const MAP_BASE: u64 = 0x1000_0000;

/// A contiguous virtual region with uniform permissions.
pub struct VmArea {
    pub virt: u64,
    pub len: usize,
    pub flags: u32,
    /// Backing file window: `dlength` bytes at file offset `doffset`
    /// appear at `[virt, virt + dlength)`; the rest is zero-filled.
    pub dentry: Option<Arc<Dentry>>,
    pub doffset: u64,
    pub dlength: u64,
    /// One slot per page, filled in by the fault handler
    pub pages: Vec<Option<Arc<VmPage>>>,
}

impl VmArea {
    fn new(
        virt: u64,
        len: usize,
        flags: u32,
        dentry: Option<Arc<Dentry>>,
        doffset: u64,
        dlength: u64,
    ) -> VmArea {
        let slots = len.div_ceil(PAGE_SIZE);
        VmArea {
            virt,
            len,
            flags,
            dentry,
            doffset,
            dlength,
            pages: {
                let mut v = Vec::with_capacity(slots);
                v.resize_with(slots, || None);
                v
            },
        }
    }

    pub fn contains(&self, virt: u64) -> bool {
        virt >= self.virt && virt < self.virt + self.len as u64
    }

    pub fn end(&self) -> u64 {
        self.virt + self.len as u64
    }

    /// Page-slot index for an address inside the area.
    pub fn slot_of(&self, aligned_virt: u64) -> usize {
        debug_assert!(self.contains(aligned_virt));
        ((aligned_virt - self.virt) / PAGE_SIZE as u64) as usize
    }

    pub fn page_at(&self, aligned_virt: u64) -> Option<Arc<VmPage>> {
        self.pages.get(self.slot_of(aligned_virt))?.clone()
    }

    pub fn resident_pages(&self) -> usize {
        self.pages.iter().filter(|p| p.is_some()).count()
    }

    fn release_pages(&mut self) {
        for slot in self.pages.iter_mut() {
            if let Some(page) = slot.take() {
                page.deref();
            }
        }
    }
}

impl Drop for VmArea {
    fn drop(&mut self) {
        self.release_pages();
        if let Some(dentry) = self.dentry.take() {
            dentry.deref();
        }
    }
}

/// One process's address space.
pub struct VmSpace {
    pub areas: BTreeMap<u64, VmArea>,
    pub pmap: Pmap,
    next_virt: u64,
}

impl VmSpace {
    pub fn new() -> VmSpace {
        VmSpace {
            areas: BTreeMap::new(),
            pmap: Pmap::new(),
            next_virt: MAP_BASE,
        }
    }

    fn overlaps(&self, virt: u64, len: usize) -> bool {
        let end = virt + len as u64;
        if let Some((_, prev)) = self.areas.range(..=virt).next_back() {
            if prev.end() > virt {
                return true;
            }
        }
        if let Some((_, next)) = self.areas.range(virt..).next() {
            if next.virt < end {
                return true;
            }
        }
        false
    }

    /// Map a fresh anonymous area at a kernel-chosen address.
    pub fn map(&mut self, len: usize, flags: u32) -> KResult<u64> {
        let len = phys::round_page(len as u64) as usize;
        if len == 0 {
            return Err(Errno::BadLength);
        }
        let mut virt = phys::round_page(self.next_virt);
        while self.overlaps(virt, len) {
            let conflicting = self
                .areas
                .range(..=virt + len as u64)
                .next_back()
                .map(|(_, a)| a.end())
                .unwrap_or(virt + PAGE_SIZE as u64);
            virt = phys::round_page(conflicting);
        }
        self.areas.insert(virt, VmArea::new(virt, len, flags, None, 0, 0));
        self.next_virt = virt + len as u64;
        Ok(virt)
    }

    /// Map a fresh anonymous area at a fixed address.
    pub fn map_at(&mut self, virt: u64, len: usize, flags: u32) -> KResult<u64> {
        if virt % PAGE_SIZE as u64 != 0 {
            return Err(Errno::Invalid);
        }
        let len = phys::round_page(len as u64) as usize;
        if len == 0 {
            return Err(Errno::BadLength);
        }
        if self.overlaps(virt, len) {
            return Err(Errno::Invalid);
        }
        self.areas.insert(virt, VmArea::new(virt, len, flags, None, 0, 0));
        Ok(virt)
    }

    /// Map `len` bytes backed by a file window: `dlength` bytes of the
    /// file starting at `doffset` land at the area base, the remainder is
    /// zero-filled on first touch. The window offset must be page-aligned.
    pub fn map_dentry(
        &mut self,
        dentry: &Arc<Dentry>,
        doffset: u64,
        dlength: u64,
        len: usize,
        flags: u32,
    ) -> KResult<u64> {
        if doffset % PAGE_SIZE as u64 != 0 {
            return Err(Errno::BadLength);
        }
        let len = phys::round_page(len as u64) as usize;
        if len == 0 || dlength > len as u64 {
            return Err(Errno::BadLength);
        }
        let virt = self.map(len, flags)?;
        let area = self.areas.get_mut(&virt).unwrap();
        dentry.ref_();
        area.dentry = Some(dentry.clone());
        area.doffset = doffset;
        area.dlength = dlength;
        Ok(virt)
    }

    /// Remove the area based at `virt`.
    ///
    /// An area that already holds resident pages cannot be unmapped yet;
    /// the call is refused as unsupported.
    pub fn unmap(&mut self, virt: u64) -> KResult<()> {
        let area = self.areas.get(&virt).ok_or(Errno::NotFound)?;
        if area.resident_pages() > 0 {
            return Err(Errno::Unsupported);
        }
        self.areas.remove(&virt);
        Ok(())
    }

    /// The area containing `virt`, if any.
    pub fn area_containing(&self, virt: u64) -> Option<&VmArea> {
        self.areas
            .range(..=virt)
            .next_back()
            .map(|(_, a)| a)
            .filter(|a| a.contains(virt))
    }

    /// Base address of the area containing `virt`.
    pub fn area_base_of(&self, virt: u64) -> Option<u64> {
        self.area_containing(virt).map(|a| a.virt)
    }

    /// Install `page` into the slot covering `aligned_virt`, replacing and
    /// releasing any previous occupant, and enter the hardware mapping.
    pub fn install_page(&mut self, base: u64, aligned_virt: u64, page: Arc<VmPage>, prot: u32) {
        let area = self.areas.get_mut(&base).expect("installing into unknown area");
        let slot = area.slot_of(aligned_virt);
        // A different incoming page arrives with its reference already
        // counted; the displaced page loses the slot's hold. Re-installing
        // the same page just keeps the existing hold.
        if let Some(old) = area.pages[slot].take() {
            if !Arc::ptr_eq(&old, &page) {
                old.deref();
            }
        }
        page.set_vaddr(aligned_virt);
        let frame = page.frame();
        area.pages[slot] = Some(page);
        self.pmap.enter(aligned_virt, frame, prot);
    }

    /// Duplicate this space into `child` (fork).
    ///
    /// Areas marked no-clone are skipped. Shared areas share their frames
    /// writable; read-only areas share frames directly; private writable
    /// areas go copy-on-write: both sides lose write permission and both
    /// areas are flagged so the next write promotes.
    pub fn clone_into(&mut self, child: &mut VmSpace) -> KResult<()> {
        let bases: Vec<u64> = self.areas.keys().copied().collect();
        for base in bases {
            let (mirror, cow_pages) = {
                let area = self.areas.get(&base).unwrap();
                if area.flags & vmflags::NO_CLONE != 0 {
                    continue;
                }
                if let Some(ref dentry) = area.dentry {
                    dentry.ref_();
                }
                let mut mirror = VmArea::new(
                    area.virt,
                    area.len,
                    area.flags,
                    area.dentry.clone(),
                    area.doffset,
                    area.dlength,
                );
                let writable_private = area.flags & vmflags::WRITE != 0
                    && area.flags & vmflags::SHARED == 0;
                let mut cow_pages = Vec::new();
                for (slot, maybe_page) in area.pages.iter().enumerate() {
                    let Some(page) = maybe_page else { continue };
                    let virt = area.virt + (slot * PAGE_SIZE) as u64;
                    page.ref_();
                    mirror.pages[slot] = Some(page.clone());
                    if writable_private {
                        // Both sides map read-only; the first write on
                        // either side faults into promotion.
                        let ro = area.flags & vmflags::PROT_MASK & !vmflags::WRITE;
                        cow_pages.push((virt, page.frame(), ro));
                    } else {
                        let prot = area.flags & vmflags::PROT_MASK;
                        child.pmap.enter(virt, page.frame(), prot);
                    }
                }
                if writable_private && !cow_pages.is_empty() {
                    mirror.flags |= vmflags::COW;
                }
                (mirror, cow_pages)
            };

            if !cow_pages.is_empty() {
                let area = self.areas.get_mut(&base).unwrap();
                area.flags |= vmflags::COW;
                for &(virt, frame, ro) in cow_pages.iter() {
                    self.pmap.protect(virt, ro);
                    child.pmap.enter(virt, frame, ro);
                }
            }
            child.areas.insert(base, mirror);
        }
        Ok(())
    }

    /// Tear down every mapping; run at process destruction.
    pub fn cleanup(&mut self) {
        self.areas.clear();
        self.pmap.clear();
    }

    /// Copy bytes out of kernel memory into this space, faulting pages in
    /// as needed.
    pub fn copy_out(&mut self, virt: u64, data: &[u8]) -> KResult<()> {
        let mut done = 0;
        while done < data.len() {
            let cur = virt + done as u64;
            let aligned = trunc_page(cur);
            let entry = match self.pmap.extract(cur) {
                Some(e) if e.writable() => e,
                _ => {
                    crate::mm::vmfault::handle_fault(self, cur, vmflags::WRITE)?;
                    self.pmap.extract(cur).ok_or(Errno::Fault)?
                }
            };
            if !entry.writable() {
                return Err(Errno::Fault);
            }
            let page_off = (cur - aligned) as usize;
            let chunk = (PAGE_SIZE - page_off).min(data.len() - done);
            unsafe {
                core::ptr::copy_nonoverlapping(
                    data[done..].as_ptr(),
                    phys::frame_ptr(entry.paddr).add(page_off),
                    chunk,
                );
            }
            done += chunk;
        }
        Ok(())
    }

    /// Copy bytes from this space into kernel memory, faulting pages in as
    /// needed.
    pub fn copy_in(&mut self, virt: u64, buf: &mut [u8]) -> KResult<()> {
        let mut done = 0;
        while done < buf.len() {
            let cur = virt + done as u64;
            let aligned = trunc_page(cur);
            let entry = match self.pmap.extract(cur) {
                Some(e) => e,
                None => {
                    crate::mm::vmfault::handle_fault(self, cur, vmflags::READ)?;
                    self.pmap.extract(cur).ok_or(Errno::Fault)?
                }
            };
            let page_off = (cur - aligned) as usize;
            let chunk = (PAGE_SIZE - page_off).min(buf.len() - done);
            unsafe {
                core::ptr::copy_nonoverlapping(
                    phys::frame_ptr(entry.paddr).add(page_off),
                    buf[done..].as_mut_ptr(),
                    chunk,
                );
            }
            done += chunk;
        }
        Ok(())
    }

    /// Verify the mapping invariants: every installed mapping belongs to
    /// an area slot holding the same frame, and a writable mapping always
    /// points at a private, writable page.
    pub fn check_invariants(&self) {
        for (&virt, entry) in self.pmap.iter() {
            let area = self
                .area_containing(virt)
                .expect("mapping outside every area");
            let page = area.page_at(virt).expect("mapping without a page");
            assert_eq!(page.frame(), entry.paddr, "slot and mapping disagree");
            if entry.writable() && area.flags & vmflags::SHARED == 0 {
                assert!(page.is_private(), "writable mapping of a shared page");
                assert!(!page.is_read_only(), "writable mapping of a read-only page");
            }
        }
    }

    /// Print the area map to the console.
    pub fn dump(&self) {
        for (_, area) in self.areas.iter() {
            crate::kprintln!(
                "[{:#x}..{:#x}) {}{}{}{}",
                area.virt,
                area.end(),
                if area.flags & vmflags::READ != 0 { 'r' } else { '-' },
                if area.flags & vmflags::WRITE != 0 { 'w' } else { '-' },
                if area.flags & vmflags::EXECUTE != 0 { 'x' } else { '-' },
                if area.flags & vmflags::COW != 0 { " cow" } else { "" },
            );
        }
    }
}

impl Default for VmSpace {
    fn default() -> Self {
        Self::new()
    }
}
