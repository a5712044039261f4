//! Per-CPU areas
//!
//! Each CPU owns a `PerCpu` record holding the thread it is currently
//! running, its idle thread and its kernel stack pointer. All access from
//! the core goes through `pcpu::current()`; how the running CPU finds its
//! own record is an architecture detail (`arch::cpu_id`).

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use spin::{Mutex, Once};

use crate::arch;
use crate::config;
use crate::kern::thread::Thread;

/// State belonging to one CPU.
pub struct PerCpu {
    id: u32,
    /// Thread currently executing on this CPU
    curthread: Mutex<Option<Arc<Thread>>>,
    /// This CPU's idle thread, installed during bring-up
    idlethread: Mutex<Option<Arc<Thread>>>,
    /// Thread switched away from, released by the incoming thread
    outgoing: Mutex<Option<Arc<Thread>>>,
    /// Top of the kernel stack for ring transitions
    kernel_stack_top: AtomicU64,
    /// Interrupt handler nesting depth
    irq_nesting: AtomicU32,
}

impl PerCpu {
    fn new(id: u32) -> Self {
        Self {
            id,
            curthread: Mutex::new(None),
            idlethread: Mutex::new(None),
            outgoing: Mutex::new(None),
            kernel_stack_top: AtomicU64::new(0),
            irq_nesting: AtomicU32::new(0),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn current_thread(&self) -> Option<Arc<Thread>> {
        self.curthread.lock().clone()
    }

    pub fn set_current_thread(&self, t: Arc<Thread>) {
        self.kernel_stack_top.store(t.kernel_stack_top(), Ordering::Relaxed);
        *self.curthread.lock() = Some(t);
    }

    pub fn idle_thread(&self) -> Option<Arc<Thread>> {
        self.idlethread.lock().clone()
    }

    pub fn set_idle_thread(&self, t: Arc<Thread>) {
        *self.idlethread.lock() = Some(t);
    }

    /// Record the thread this CPU is switching away from.
    pub fn set_outgoing(&self, t: Arc<Thread>) {
        *self.outgoing.lock() = Some(t);
    }

    /// Take the thread the previous switch displaced, if any.
    pub fn take_outgoing(&self) -> Option<Arc<Thread>> {
        self.outgoing.lock().take()
    }

    pub fn kernel_stack_top(&self) -> u64 {
        self.kernel_stack_top.load(Ordering::Relaxed)
    }

    pub fn irq_enter(&self) {
        self.irq_nesting.fetch_add(1, Ordering::Relaxed);
    }

    pub fn irq_exit(&self) {
        let prev = self.irq_nesting.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "irq_exit without irq_enter");
    }

    pub fn irq_nesting(&self) -> u32 {
        self.irq_nesting.load(Ordering::Relaxed)
    }
}

static CPUS: Once<Vec<PerCpu>> = Once::new();

fn cpus() -> &'static Vec<PerCpu> {
    CPUS.call_once(|| {
        let count = (config::get().cpu_count.max(1) as usize).min(arch::MAX_CPUS);
        (0..count as u32).map(PerCpu::new).collect()
    })
}

/// Set up the per-CPU areas from the boot configuration.
pub fn init() {
    let _ = cpus();
}

/// Number of per-CPU areas.
pub fn cpu_count() -> u32 {
    cpus().len() as u32
}

/// The per-CPU area of a specific CPU.
pub fn get(id: u32) -> &'static PerCpu {
    &cpus()[id as usize]
}

/// All per-CPU areas.
pub fn all() -> &'static [PerCpu] {
    cpus()
}

/// The per-CPU area of the CPU executing this code.
pub fn current() -> &'static PerCpu {
    get(arch::cpu_id())
}

/// The thread running on this CPU; panics if the scheduler has not been
/// handed a thread yet.
pub fn current_thread() -> Arc<Thread> {
    current().current_thread().expect("no current thread active")
}

/// The thread running on this CPU, or `None` during early bring-up.
pub fn try_current_thread() -> Option<Arc<Thread>> {
    if CPUS.get().is_none() {
        return None;
    }
    current().current_thread()
}

/// Whether this CPU is currently inside an interrupt handler.
pub fn in_interrupt() -> bool {
    CPUS.get().is_some_and(|_| current().irq_nesting() > 0)
}

/// Install a bootstrap kernel thread as the current thread of CPU 0 so
/// sleepable primitives have an owner during tests.
#[cfg(test)]
pub fn test_boot() -> Arc<Thread> {
    static BOOT: Once<Arc<Thread>> = Once::new();
    let t = BOOT
        .call_once(|| Thread::new_bootstrap("test-boot"))
        .clone();
    arch::set_cpu_id(0);
    get(0).set_current_thread(t.clone());
    t
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_cpu_accessor() {
        let _guard = crate::testsync::lock();
        arch::set_cpu_id(0);
        assert_eq!(current().id(), 0);
        assert!(cpu_count() >= 1);
    }

    #[test]
    fn test_irq_nesting() {
        let _guard = crate::testsync::lock();
        arch::set_cpu_id(0);
        let pc = current();
        let base = pc.irq_nesting();
        pc.irq_enter();
        assert!(in_interrupt());
        pc.irq_exit();
        assert_eq!(pc.irq_nesting(), base);
    }

    #[test]
    fn test_boot_thread_installed() {
        let _guard = crate::testsync::lock();
        let t = test_boot();
        assert_eq!(current_thread().id, t.id);
    }
}
