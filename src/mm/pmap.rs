//! Physical map: the page-table layer behind a VM space
//!
//! Keeps the authoritative virtual-to-physical mappings with their
//! permission bits. The walkable map here is what the hardware tables are
//! programmed from; keeping it explicit makes the permission state
//! inspectable and lets the fault handler flip protections without
//! touching architecture code directly.
//!
//! The pmap has no lock of its own; it is reached only through its owning
//! VM space, whose lock is already held.

use alloc::collections::BTreeMap;

use crate::arch;
use crate::mm::vmspace::vmflags;

/// One installed mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PmapEntry {
    pub paddr: u64,
    /// Permission bits, `vmflags` values
    pub flags: u32,
}

impl PmapEntry {
    pub fn writable(&self) -> bool {
        self.flags & vmflags::WRITE != 0
    }

    pub fn user(&self) -> bool {
        self.flags & vmflags::USER != 0
    }
}

/// Page-table state of one address space.
pub struct Pmap {
    mappings: BTreeMap<u64, PmapEntry>,
}

impl Pmap {
    pub const fn new() -> Self {
        Self {
            mappings: BTreeMap::new(),
        }
    }

    /// Install or replace the mapping for a page-aligned `virt`.
    pub fn enter(&mut self, virt: u64, paddr: u64, flags: u32) {
        debug_assert_eq!(virt % crate::mm::PAGE_SIZE as u64, 0);
        debug_assert_eq!(paddr % crate::mm::PAGE_SIZE as u64, 0);
        self.mappings.insert(virt, PmapEntry { paddr, flags });
        arch::invlpg(virt);
    }

    /// Drop the mapping at `virt`, returning what was installed.
    pub fn remove(&mut self, virt: u64) -> Option<PmapEntry> {
        let entry = self.mappings.remove(&virt);
        if entry.is_some() {
            arch::invlpg(virt);
        }
        entry
    }

    /// Change the permission bits of an existing mapping.
    pub fn protect(&mut self, virt: u64, flags: u32) {
        if let Some(entry) = self.mappings.get_mut(&virt) {
            entry.flags = flags;
            arch::invlpg(virt);
        }
    }

    /// Look up the mapping covering `virt` (page-aligned lookup).
    pub fn extract(&self, virt: u64) -> Option<PmapEntry> {
        self.mappings.get(&crate::mm::trunc_page(virt)).copied()
    }

    pub fn is_mapped(&self, virt: u64) -> bool {
        self.extract(virt).is_some()
    }

    pub fn resident_count(&self) -> usize {
        self.mappings.len()
    }

    /// Drop every mapping; used when an address space is torn down.
    pub fn clear(&mut self) {
        self.mappings.clear();
    }

    /// Iterate over all mappings, for invariant checks and the debugger.
    pub fn iter(&self) -> impl Iterator<Item = (&u64, &PmapEntry)> {
        self.mappings.iter()
    }
}

impl Default for Pmap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enter_extract_remove() {
        let mut pmap = Pmap::new();
        pmap.enter(0x4000, 0x1_0000, vmflags::READ | vmflags::USER);
        assert_eq!(pmap.resident_count(), 1);

        let entry = pmap.extract(0x4abc).unwrap();
        assert_eq!(entry.paddr, 0x1_0000);
        assert!(entry.user());
        assert!(!entry.writable());

        assert!(pmap.remove(0x4000).is_some());
        assert!(pmap.extract(0x4000).is_none());
        assert!(pmap.remove(0x4000).is_none());
    }

    #[test]
    fn test_protect_flips_write() {
        let mut pmap = Pmap::new();
        pmap.enter(0x8000, 0x2_0000, vmflags::READ | vmflags::WRITE);
        assert!(pmap.extract(0x8000).unwrap().writable());
        pmap.protect(0x8000, vmflags::READ);
        assert!(!pmap.extract(0x8000).unwrap().writable());
        assert_eq!(pmap.extract(0x8000).unwrap().paddr, 0x2_0000);
    }
}
