//! Basalt - a small multiprocessor x86-64 operating system kernel
//!
//! The execution core: thread and process lifecycle, a priority scheduler
//! with sleep/timeout queues, demand-paged virtual memory with
//! copy-on-write and file-backed mappings, and the inter-CPU coordination
//! that keeps it all correct under SMP. Device drivers and filesystems
//! plug in through the narrow interfaces in `kern::irq` and `vfs`.

#![no_std]
// Kernel types often have specialized initialization that doesn't fit Default
#![allow(clippy::new_without_default)]
// Flag words and page arithmetic read better with explicit bit operations
#![allow(clippy::identity_op)]

extern crate alloc;

// Core types
pub mod types;

pub mod arch;
pub mod config;
pub mod console;
pub mod errno;
pub mod kern;
pub mod mm;
pub mod vfs;

/// Kernel version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Kernel name
pub const NAME: &str = "Basalt";

/// Bring the core up on the boot CPU: capture the configuration, set up
/// physical memory and the kernel heap, then the per-CPU areas, IPI
/// vectors and idle threads. The caller starts scheduling with
/// `kern::sched::launch()` once the platform pieces are registered.
pub fn init(config: config::BootConfig) {
    config::set(config);
    mm::init();
    kern::init();
    kprintln!("{} {} core up, {} cpus", NAME, VERSION, kern::pcpu::cpu_count());
}

/// Fatal invariant violation: stop every other CPU, report, and halt.
/// The panic handler of the kernel binary funnels in here.
pub fn panic_stop(msg: &str) -> ! {
    kern::sched::panic_others();
    kprintln!("panic: {}", msg);
    arch::halt();
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(NAME, "Basalt");
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_init_is_idempotent_enough_for_tests() {
        let _guard = crate::testsync::lock();
        crate::mm::phys::test_pool();
        init(config::BootConfig::new());
        init(config::BootConfig::new());
        assert!(kern::pcpu::cpu_count() >= 1);
    }
}
