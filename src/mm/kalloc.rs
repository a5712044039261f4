//! Zone-based kernel heap
//!
//! A zone is a collection of fixed-size blocks carved out of page frames;
//! free blocks form an intrusive singly-linked list threaded through the
//! blocks themselves. The kernel heap is a ladder of power-of-two zones;
//! requests larger than a page fall through to contiguous frames.
//!
//! On bare metal this is the global allocator. Hosted builds (tests) keep
//! the host allocator and exercise the zones directly.

use alloc::vec::Vec;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use spin::Mutex;

use crate::errno::{Errno, KResult};
use crate::mm::phys;
use crate::mm::PAGE_SIZE;

/// Smallest zone block; a block must hold the free-list link.
const MIN_BLOCK: usize = 16;

/// Zone block sizes, one zone per power of two up to a page.
const CLASS_SIZES: [usize; 9] = [16, 32, 64, 128, 256, 512, 1024, 2048, 4096];

/// Allocation statistics per zone.
#[derive(Debug, Default)]
pub struct ZoneStats {
    pub alloc_count: AtomicU64,
    pub free_count: AtomicU64,
    pub in_use: AtomicU32,
    pub expansions: AtomicU32,
    pub failures: AtomicU32,
}

impl ZoneStats {
    const fn new() -> Self {
        Self {
            alloc_count: AtomicU64::new(0),
            free_count: AtomicU64::new(0),
            in_use: AtomicU32::new(0),
            expansions: AtomicU32::new(0),
            failures: AtomicU32::new(0),
        }
    }

    fn record_alloc(&self) {
        self.alloc_count.fetch_add(1, Ordering::Relaxed);
        self.in_use.fetch_add(1, Ordering::Relaxed);
    }

    fn record_free(&self) {
        self.free_count.fetch_add(1, Ordering::Relaxed);
        self.in_use.fetch_sub(1, Ordering::Relaxed);
    }
}

/// A collection of fixed-size blocks with quick alloc/free.
pub struct Zone {
    name: &'static str,
    elem_size: usize,
    /// Head of the intrusive free list (0 = empty)
    free_head: Mutex<usize>,
    free_count: AtomicU32,
    /// Frames feeding this zone; never returned while the kernel runs
    pages: Mutex<Vec<u64>>,
    pub stats: ZoneStats,
}

impl Zone {
    pub const fn new(name: &'static str, elem_size: usize) -> Self {
        Self {
            name,
            elem_size,
            free_head: Mutex::new(0),
            free_count: AtomicU32::new(0),
            pages: Mutex::new(Vec::new()),
            stats: ZoneStats::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn elem_size(&self) -> usize {
        self.elem_size
    }

    pub fn free_count(&self) -> u32 {
        self.free_count.load(Ordering::Relaxed)
    }

    /// Feed one more frame into the zone's free list.
    fn expand(&self) -> KResult<()> {
        let frame = phys::alloc_frame()?;
        self.pages.lock().push(frame);
        self.stats.expansions.fetch_add(1, Ordering::Relaxed);

        let per_page = PAGE_SIZE / self.elem_size;
        let mut head = self.free_head.lock();
        for i in 0..per_page {
            let block = frame as usize + i * self.elem_size;
            unsafe { *(block as *mut usize) = *head };
            *head = block;
        }
        self.free_count.fetch_add(per_page as u32, Ordering::Relaxed);
        Ok(())
    }

    /// Allocate one block, expanding the zone when the list runs dry.
    pub fn alloc(&self) -> KResult<NonNull<u8>> {
        loop {
            {
                let mut head = self.free_head.lock();
                if *head != 0 {
                    let block = *head;
                    *head = unsafe { *(block as *const usize) };
                    drop(head);
                    self.free_count.fetch_sub(1, Ordering::Relaxed);
                    self.stats.record_alloc();
                    return NonNull::new(block as *mut u8).ok_or(Errno::OutOfMemory);
                }
            }
            if let Err(e) = self.expand() {
                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        }
    }

    /// Return a block to the zone.
    pub fn free(&self, ptr: NonNull<u8>) {
        let block = ptr.as_ptr() as usize;
        let mut head = self.free_head.lock();
        unsafe { *(block as *mut usize) = *head };
        *head = block;
        drop(head);
        self.free_count.fetch_add(1, Ordering::Relaxed);
        self.stats.record_free();
    }
}

// ============================================================================
// The kernel heap: a ladder of zones
// ============================================================================

/// Power-of-two zone ladder plus a contiguous-frame path for larger
/// requests.
pub struct KernelHeap {
    zones: [Zone; CLASS_SIZES.len()],
}

impl KernelHeap {
    pub const fn new() -> Self {
        Self {
            zones: [
                Zone::new("kalloc-16", 16),
                Zone::new("kalloc-32", 32),
                Zone::new("kalloc-64", 64),
                Zone::new("kalloc-128", 128),
                Zone::new("kalloc-256", 256),
                Zone::new("kalloc-512", 512),
                Zone::new("kalloc-1024", 1024),
                Zone::new("kalloc-2048", 2048),
                Zone::new("kalloc-4096", 4096),
            ],
        }
    }

    fn class_for(size: usize, align: usize) -> Option<usize> {
        let want = size.max(align).max(MIN_BLOCK);
        CLASS_SIZES.iter().position(|&c| c >= want)
    }

    /// Allocate `size` bytes with the given alignment.
    pub fn allocate(&self, size: usize, align: usize) -> KResult<NonNull<u8>> {
        if size == 0 {
            return Err(Errno::BadLength);
        }
        match Self::class_for(size, align) {
            Some(class) => self.zones[class].alloc(),
            None => {
                if align > PAGE_SIZE {
                    return Err(Errno::Unsupported);
                }
                let frames = size.div_ceil(PAGE_SIZE);
                let paddr = phys::alloc_contiguous(frames)?;
                NonNull::new(phys::frame_ptr(paddr)).ok_or(Errno::OutOfMemory)
            }
        }
    }

    /// Free an allocation made with the same size/alignment.
    pub fn release(&self, ptr: NonNull<u8>, size: usize, align: usize) {
        match Self::class_for(size, align) {
            Some(class) => self.zones[class].free(ptr),
            None => {
                let frames = size.div_ceil(PAGE_SIZE);
                phys::free_contiguous(ptr.as_ptr() as u64, frames);
            }
        }
    }

    pub fn zones(&self) -> &[Zone] {
        &self.zones
    }
}

impl Default for KernelHeap {
    fn default() -> Self {
        Self::new()
    }
}

static HEAP: KernelHeap = KernelHeap::new();

/// The kernel heap instance.
pub fn heap() -> &'static KernelHeap {
    &HEAP
}

/// Prime the heap's smallest zones so early boot allocations cannot fail.
pub fn init() {
    for zone in HEAP.zones.iter().take(4) {
        let _ = zone.expand();
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod global {
    use super::*;
    use core::alloc::{GlobalAlloc, Layout};

    struct HeapAlloc;

    unsafe impl GlobalAlloc for HeapAlloc {
        unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
            match HEAP.allocate(layout.size(), layout.align()) {
                Ok(ptr) => ptr.as_ptr(),
                Err(_) => core::ptr::null_mut(),
            }
        }

        unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
            if let Some(ptr) = NonNull::new(ptr) {
                HEAP.release(ptr, layout.size(), layout.align());
            }
        }
    }

    #[global_allocator]
    static GLOBAL: HeapAlloc = HeapAlloc;
}
