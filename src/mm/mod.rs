//! Memory management
//!
//! The physical side (frame allocator, kernel heap zones) and the virtual
//! side (per-process address spaces, reference-counted pages, the fault
//! handler, and the software page-table layer behind it).

pub mod kalloc;
pub mod phys;
pub mod pmap;
pub mod vmfault;
pub mod vmpage;
pub mod vmspace;

pub use phys::{round_page, trunc_page};
pub use vmfault::handle_fault;

/// Page size used throughout the VM layer.
pub const PAGE_SIZE: usize = crate::arch::PAGE_SIZE;

/// Initialize the memory subsystem from the boot configuration. Runs
/// once; later calls are no-ops.
pub fn init() {
    static INIT: spin::Once<()> = spin::Once::new();
    INIT.call_once(|| {
        phys::init_from_config(crate::config::get());
        kalloc::init();
    });
}
