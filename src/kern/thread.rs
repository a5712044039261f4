//! Thread management
//!
//! A thread's state lives in its flag word; the possible transitions are:
//!
//! ```text
//!  +-->[suspended]->-+
//!  |       |         |
//!  |       v         |
//!  +-<--[active]     |
//!          |         |
//!          v         |
//!       [zombie]<----+
//!          |
//!          v
//!       [(gone)]
//! ```
//!
//! All transitions are managed by the scheduler. Threads are reference
//! counted on top of `Arc` so the kernel can observe the moment the last
//! external holder lets go of a zombie and unregister it.

use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use spin::Mutex;

use crate::arch::Context;
use crate::errno::KResult;
use crate::kern::lock::{LockLevel, Semaphore, SpinLock};
use crate::kern::pcpu;
use crate::kern::process::Process;
use crate::kern::sched;
use crate::kern::time;
use crate::types::{CpuAffinity, ThreadId, Tick};

/// Maximum thread name length; longer names are truncated.
pub const THREAD_MAX_NAME_LEN: usize = 32;

/// Default priority of new threads (0 is highest).
pub const PRIORITY_DEFAULT: u32 = 200;

/// Priority of the per-CPU idle threads; nothing may be lower.
pub const PRIORITY_IDLE: u32 = 255;

/// Kernel stack size per thread.
pub const KERNEL_STACK_SIZE: usize = 16 * 1024;

/// Size of the user-mode stack mapped for a fresh user thread.
pub const USER_STACK_SIZE: usize = 64 * 1024;

/// Top of the user-mode stack area.
pub const USER_STACK_TOP: u64 = 0x0000_7fff_ffe0_0000;

/// Thread state flags.
pub mod flags {
    /// Scheduled on some CPU; its stack is in use
    pub const ACTIVE: u32 = 0x0001;
    /// On the sleepqueue
    pub const SUSPENDED: u32 = 0x0002;
    /// Terminated; off both queues, resources mostly gone
    pub const ZOMBIE: u32 = 0x0004;
    /// A reschedule is requested; checked on interrupt return
    pub const RESCHEDULE: u32 = 0x0008;
    /// The timeout field holds a valid wake deadline
    pub const TIMEOUT: u32 = 0x0010;
    /// Kernel thread: no owning process, no userland state
    pub const KERNEL: u32 = 0x8000;
}

/// Why a thread terminated; stored in the top byte of the exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExitReason {
    Syscall = 0,
    Signal = 1,
    Fault = 2,
}

/// Combine an exit reason with a 24-bit code.
pub fn make_exit_code(reason: ExitReason, code: u32) -> u32 {
    ((reason as u32) << 24) | (code & 0x00ff_ffff)
}

/// Split an exit code into its reason byte and 24-bit code.
pub fn exit_code_parts(raw: u32) -> (u8, u32) {
    ((raw >> 24) as u8, raw & 0x00ff_ffff)
}

/// How a thread is being allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocKind {
    /// Fresh thread: user stack and entry context are set up
    Default,
    /// Clone target: the machine context is copied from the parent after
    /// allocation, so no entry setup happens here
    Clone,
}

/// A thread's kernel stack.
struct KernelStack {
    mem: alloc::boxed::Box<[u8]>,
}

impl KernelStack {
    fn new(bytes: usize) -> Self {
        let mut v = Vec::with_capacity(bytes);
        v.resize(bytes, 0);
        Self { mem: v.into_boxed_slice() }
    }

    fn top(&self) -> u64 {
        let base = self.mem.as_ptr() as u64;
        (base + self.mem.len() as u64) & !0xF
    }
}

/// A unit of execution.
pub struct Thread {
    pub id: ThreadId,
    name: Mutex<heapless::String<THREAD_MAX_NAME_LEN>>,
    state: AtomicU32,
    refcount: AtomicU32,
    priority: AtomicU32,
    affinity: AtomicI64,
    /// Wake deadline; meaningful while the TIMEOUT flag is set
    timeout: AtomicU64,
    /// Exit reason and code, written by `terminate`
    terminate_info: AtomicU32,
    /// Owning process; kernel threads have none
    process: Option<Weak<Process>>,
    /// Semaphores to signal when the thread terminates
    waiters: SpinLock<Vec<Arc<Semaphore>>>,
    /// Set once `signal_waiters` has run; late joiners return immediately
    signaled: AtomicBool,
    ctx: UnsafeCell<Context>,
    kstack: KernelStack,
    /// Mutexes currently held; must be zero at terminate
    held_mutexes: AtomicU32,
    /// Lock-hierarchy levels held, innermost last
    lock_levels: Mutex<heapless::Vec<u8, 16>>,
}

unsafe impl Send for Thread {}
unsafe impl Sync for Thread {}

impl Thread {
    fn build(name: &str, process: Option<Weak<Process>>, state: u32, ctx: Context) -> Arc<Thread> {
        let kstack = KernelStack::new(KERNEL_STACK_SIZE);
        let mut ctx = ctx;
        if ctx.kernel_rsp == 0 {
            ctx.kernel_rsp = kstack.top();
        }
        if ctx.rsp == 0 {
            ctx.rsp = kstack.top();
        }
        let t = Arc::new(Thread {
            id: ThreadId::new(),
            name: Mutex::new(heapless::String::new()),
            state: AtomicU32::new(state),
            refcount: AtomicU32::new(1),
            priority: AtomicU32::new(PRIORITY_DEFAULT),
            affinity: AtomicI64::new(CpuAffinity::Any.to_raw()),
            timeout: AtomicU64::new(0),
            terminate_info: AtomicU32::new(0),
            process,
            waiters: SpinLock::with_level(LockLevel::Thread, Vec::new()),
            signaled: AtomicBool::new(false),
            ctx: UnsafeCell::new(ctx),
            kstack,
            held_mutexes: AtomicU32::new(0),
            lock_levels: Mutex::new(heapless::Vec::new()),
        });
        t.set_name(name);
        t
    }

    /// Allocate a user thread inside `process`. The thread comes back
    /// suspended on the sleepqueue; the caller resumes it when ready.
    pub fn alloc(process: &Arc<Process>, name: &str, kind: AllocKind) -> KResult<Arc<Thread>> {
        let t = Thread::build(name, Some(Arc::downgrade(process)), 0, Context::new());

        if kind == AllocKind::Default {
            process.map_user_stack()?;
            let entry = Context::user_entry(0, USER_STACK_TOP, t.kstack.top());
            unsafe { *t.ctx.get() = entry };
        }

        process.add_thread(&t);
        sched::init_thread(&t);
        register(&t);
        Ok(t)
    }

    /// Create a kernel thread entering `entry(arg)`. Kernel threads have no
    /// process association and are named `[name]`.
    pub fn spawn_kernel(name: &str, entry: fn(usize) -> !, arg: usize) -> KResult<Arc<Thread>> {
        let t = Thread::build(name, None, flags::KERNEL, Context::new());
        let ctx = Context::kernel_entry(entry as usize, arg, t.kstack.top());
        unsafe { *t.ctx.get() = ctx };
        sched::init_thread(&t);
        register(&t);
        Ok(t)
    }

    /// A bare kernel thread outside scheduler and registry control; used on
    /// the boot path before the scheduler exists.
    pub fn new_bootstrap(name: &str) -> Arc<Thread> {
        Thread::build(name, None, flags::KERNEL, Context::new())
    }

    /// The idle thread for one CPU: lowest priority, pinned, and placed on
    /// the runqueue by the scheduler rather than the sleepqueue.
    pub fn new_idle(cpu: u32) -> Arc<Thread> {
        let t = Thread::build("idle", None, flags::KERNEL, Context::new());
        let ctx = Context::kernel_entry(idle_thread_body as usize, cpu as usize, t.kstack.top());
        unsafe { *t.ctx.get() = ctx };
        t.set_priority(PRIORITY_IDLE);
        t.set_affinity(crate::types::CpuAffinity::Fixed(cpu));
        register(&t);
        t
    }

    /// Clone the current thread into `process`; the child resumes from the
    /// same point with a syscall return value of zero.
    pub fn clone_into(process: &Arc<Process>) -> KResult<Arc<Thread>> {
        let cur = pcpu::current_thread();
        let t = Thread::alloc(process, cur.name().as_str(), AllocKind::Clone)?;
        let child_ctx = {
            let parent_ctx = unsafe { &*cur.ctx.get() };
            Context::cloned_from(parent_ctx, 0, t.kstack.top())
        };
        unsafe { *t.ctx.get() = child_ctx };
        Ok(t)
    }

    // === State ===

    pub fn has_flags(&self, mask: u32) -> bool {
        self.state.load(Ordering::Acquire) & mask != 0
    }

    pub fn set_flags(&self, mask: u32) {
        self.state.fetch_or(mask, Ordering::AcqRel);
    }

    pub fn clear_flags(&self, mask: u32) {
        self.state.fetch_and(!mask, Ordering::AcqRel);
    }

    pub fn is_kernel(&self) -> bool {
        self.has_flags(flags::KERNEL)
    }

    pub fn is_zombie(&self) -> bool {
        self.has_flags(flags::ZOMBIE)
    }

    // === Scheduling attributes ===

    pub fn priority(&self) -> u32 {
        self.priority.load(Ordering::Relaxed)
    }

    pub fn set_priority(&self, prio: u32) {
        self.priority.store(prio.min(PRIORITY_IDLE), Ordering::Relaxed);
    }

    pub fn affinity(&self) -> CpuAffinity {
        CpuAffinity::from_raw(self.affinity.load(Ordering::Relaxed))
    }

    pub fn set_affinity(&self, affinity: CpuAffinity) {
        self.affinity.store(affinity.to_raw(), Ordering::Relaxed);
    }

    pub fn timeout(&self) -> Tick {
        self.timeout.load(Ordering::Relaxed)
    }

    /// Arm the wake deadline; the next suspend inserts in wake order.
    pub fn arm_timeout(&self, deadline: Tick) {
        self.timeout.store(deadline, Ordering::Relaxed);
        self.set_flags(flags::TIMEOUT);
    }

    pub fn terminate_info(&self) -> u32 {
        self.terminate_info.load(Ordering::Relaxed)
    }

    // === Name ===

    pub fn name(&self) -> heapless::String<THREAD_MAX_NAME_LEN> {
        self.name.lock().clone()
    }

    /// Set the thread name; kernel thread names get `[ ]` brackets so they
    /// stand out in listings. Overlong names are truncated.
    pub fn set_name(&self, name: &str) {
        let mut buf: heapless::String<THREAD_MAX_NAME_LEN> = heapless::String::new();
        if self.is_kernel() {
            let _ = buf.push('[');
        }
        for c in name.chars() {
            if buf.push(c).is_err() {
                break;
            }
        }
        if self.is_kernel() {
            if buf.len() == buf.capacity() {
                buf.pop();
            }
            let _ = buf.push(']');
        }
        *self.name.lock() = buf;
    }

    // === Process linkage ===

    pub fn process(&self) -> Option<Arc<Process>> {
        self.process.as_ref().and_then(Weak::upgrade)
    }

    // === Machine context ===

    /// Raw pointer to the saved machine context, for the context switch.
    ///
    /// Only the scheduler may use this, and only while the thread is held
    /// off every CPU but the one switching.
    pub fn ctx_ptr(&self) -> *mut Context {
        self.ctx.get()
    }

    /// Point a not-yet-resumed thread at its entry address.
    pub fn set_entry_point(&self, rip: u64) {
        debug_assert!(self.has_flags(flags::SUSPENDED));
        unsafe { (*self.ctx.get()).rip = rip };
    }

    pub fn kernel_stack_top(&self) -> u64 {
        self.kstack.top()
    }

    // === Scheduler hand-off ===

    /// Make this thread runnable.
    pub fn resume(self: &Arc<Self>) {
        sched::resume_thread(self);
    }

    /// Take this thread off the runqueue.
    pub fn suspend(self: &Arc<Self>) {
        debug_assert!(!self.has_flags(flags::SUSPENDED), "suspending suspended thread");
        if let Some(idle) = pcpu::current().idle_thread() {
            debug_assert!(!Arc::ptr_eq(self, &idle), "suspending idle thread");
        }
        sched::suspend_thread(self);
    }

    // === Reference counting ===

    pub fn ref_(&self) {
        let prev = self.refcount.fetch_add(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "reffing thread with zero refcount");
    }

    /// Drop one reference; the last reference to a zombie unregisters it.
    pub fn deref(self: &Arc<Self>) {
        let prev = self.refcount.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "dereffing thread with zero refcount");
        if prev == 1 && self.is_zombie() {
            self.destroy();
        }
    }

    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Relaxed)
    }

    /// Unregister a zombie thread; the backing memory goes away when the
    /// final `Arc` drops.
    fn destroy(self: &Arc<Self>) {
        debug_assert!(self.is_zombie(), "destroying non-zombie thread");
        if let Some(cur) = pcpu::try_current_thread() {
            debug_assert!(!Arc::ptr_eq(self, &cur), "destroying current thread");
        }
        if let Some(proc) = self.process() {
            proc.remove_thread(self.id);
        }
        unregister(self.id);
    }

    // === Waiters ===

    /// Block until this thread terminates.
    pub fn join(self: &Arc<Self>) {
        if self.signaled.load(Ordering::SeqCst) {
            return;
        }
        let sem = Arc::new(Semaphore::new("thread-waiter", 0));
        self.waiters.lock().push(sem.clone());
        if self.signaled.load(Ordering::SeqCst) {
            // The drain may or may not have seen our entry; either way the
            // thread is gone and there is nothing to wait for.
            return;
        }
        sem.wait();
    }

    /// Wake every `join`er. The terminate path runs this exactly once.
    pub fn signal_waiters(&self) {
        self.signaled.store(true, Ordering::SeqCst);
        let waiters = core::mem::take(&mut *self.waiters.lock());
        for sem in waiters {
            sem.signal();
        }
    }

    // === Mutex accounting ===

    pub fn note_mutex_acquired(&self) {
        self.held_mutexes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_mutex_released(&self) {
        let prev = self.held_mutexes.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "mutex release without acquire");
    }

    pub fn held_mutexes(&self) -> u32 {
        self.held_mutexes.load(Ordering::Relaxed)
    }

    pub fn push_lock_level(&self, level: u8) {
        let mut levels = self.lock_levels.lock();
        if let Some(&top) = levels.last() {
            debug_assert!(
                level >= top,
                "lock order violation: level {} after {}",
                level,
                top
            );
        }
        let _ = levels.push(level);
    }

    pub fn pop_lock_level(&self, level: u8) {
        let mut levels = self.lock_levels.lock();
        if let Some(pos) = levels.iter().rposition(|&l| l == level) {
            levels.remove(pos);
        }
    }

    // === Termination ===

    /// Terminate the calling thread. This is the only way a thread leaves
    /// the running state for good; it never returns.
    pub fn terminate(self: &Arc<Self>, exitcode: u32) -> ! {
        let cur = pcpu::current_thread();
        assert!(Arc::ptr_eq(self, &cur), "terminate not on current thread");
        assert!(!self.is_zombie(), "exiting zombie thread");
        debug_assert_eq!(
            self.held_mutexes(),
            0,
            "thread terminating while holding a mutex"
        );

        self.terminate_info.store(exitcode, Ordering::Relaxed);

        let proc = self.process();
        if let Some(ref p) = proc {
            // The process lock spans the scheduler exit so a parent in
            // wait cannot observe the thread half-demolished.
            p.lifecycle_lock().lock();
            if p.is_main_thread(self.id) {
                p.exit_locked(exitcode);
            }
        }

        self.signal_waiters();
        self.refcount.fetch_sub(1, Ordering::SeqCst);

        sched::exit_current(self);
        if let Some(ref p) = proc {
            p.signal_exit();
            p.lifecycle_lock().unlock();
        }

        sched::schedule();
        unreachable!("schedule returned to a zombie");
    }
}

/// Sleep the current thread for at least `ms` milliseconds. The wake has
/// tick granularity and happens on the first reschedule past the deadline.
pub fn thread_sleep_ms(ms: u64) {
    let t = pcpu::current_thread();
    t.arm_timeout(time::get_ticks() + time::ms_to_ticks(ms));
    t.suspend();
    sched::schedule();
}

/// Body of the per-CPU idle threads.
pub fn idle_thread_body(_arg: usize) -> ! {
    loop {
        crate::arch::relax();
    }
}

// ============================================================================
// Global thread registry
// ============================================================================

static ALL_THREADS: Mutex<BTreeMap<ThreadId, Arc<Thread>>> = Mutex::new(BTreeMap::new());

fn register(t: &Arc<Thread>) {
    ALL_THREADS.lock().insert(t.id, t.clone());
}

fn unregister(id: ThreadId) {
    ALL_THREADS.lock().remove(&id);
}

/// Look up a live thread by id.
pub fn find(id: ThreadId) -> Option<Arc<Thread>> {
    ALL_THREADS.lock().get(&id).cloned()
}

/// Snapshot of all live threads.
pub fn all_threads() -> Vec<Arc<Thread>> {
    ALL_THREADS.lock().values().cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_round_trip() {
        let raw = make_exit_code(ExitReason::Fault, 0x123456);
        assert_eq!(exit_code_parts(raw), (ExitReason::Fault as u8, 0x123456));
        // The code is clipped to 24 bits
        let raw = make_exit_code(ExitReason::Syscall, 0xff00_0042);
        assert_eq!(exit_code_parts(raw), (0, 0x42));
    }

    #[test]
    fn test_kernel_thread_name_brackets() {
        let t = Thread::new_bootstrap("reaper");
        assert_eq!(t.name().as_str(), "[reaper]");
    }

    #[test]
    fn test_name_truncation() {
        let t = Thread::new_bootstrap("a-very-long-thread-name-that-does-not-fit");
        let name = t.name();
        assert!(name.len() <= THREAD_MAX_NAME_LEN);
        assert!(name.ends_with(']'));
    }

    #[test]
    fn test_priority_clamped_to_idle() {
        let t = Thread::new_bootstrap("x");
        t.set_priority(999);
        assert_eq!(t.priority(), PRIORITY_IDLE);
    }

    #[test]
    fn test_refcount_guard() {
        let t = Thread::new_bootstrap("x");
        assert_eq!(t.refcount(), 1);
        t.ref_();
        assert_eq!(t.refcount(), 2);
        t.deref();
        assert_eq!(t.refcount(), 1);
    }

    #[test]
    fn test_signal_waiters_marks_late_joiners() {
        let t = Thread::new_bootstrap("x");
        let sem = Arc::new(Semaphore::new("thread-waiter", 0));
        t.waiters.lock().push(sem.clone());
        t.signal_waiters();
        assert!(sem.try_wait());
        // A join after the drain returns without blocking
        t.join();
    }

    #[test]
    fn test_timeout_arming() {
        let t = Thread::new_bootstrap("x");
        assert!(!t.has_flags(flags::TIMEOUT));
        t.arm_timeout(1234);
        assert!(t.has_flags(flags::TIMEOUT));
        assert_eq!(t.timeout(), 1234);
    }

    #[test]
    #[should_panic(expected = "holding a mutex")]
    fn test_terminate_while_holding_mutex_asserts() {
        let _guard = crate::testsync::lock();
        let boot = crate::kern::pcpu::test_boot();
        boot.note_mutex_acquired();
        boot.terminate(make_exit_code(ExitReason::Syscall, 0));
    }

    #[test]
    fn test_lock_level_ordering() {
        let t = Thread::new_bootstrap("x");
        t.push_lock_level(1);
        t.push_lock_level(3);
        t.pop_lock_level(3);
        t.pop_lock_level(1);
    }
}
