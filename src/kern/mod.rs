//! Core kernel primitives
//!
//! Scheduling, threads and processes, locking, per-CPU state, time keeping
//! and interrupt plumbing.

pub mod handle;
pub mod ipi;
pub mod irq;
pub mod lock;
pub mod pcpu;
pub mod process;
pub mod sched;
pub mod syscall;
pub mod thread;
pub mod time;

pub use lock::{LockLevel, Mutex, Semaphore, SpinLock, Spinlock};
pub use thread::{Thread, PRIORITY_DEFAULT, PRIORITY_IDLE};

/// Initialize the kern subsystem: per-CPU areas, IPI vectors and the
/// per-CPU idle threads. The boot CPU calls `sched::launch()` afterwards
/// to start scheduling. Runs once; later calls are no-ops.
pub fn init() {
    static INIT: spin::Once<()> = spin::Once::new();
    INIT.call_once(|| {
        pcpu::init();
        ipi::init().expect("ipi vectors unavailable");
        sched::setup_idle_threads();
    });
}
