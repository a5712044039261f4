//! Locking primitives
//!
//! Three families of locks, all non-reentrant:
//!
//! - `Spinlock` / `SpinLock<T>`: busy-wait locks for short critical
//!   sections. The unpreemptible flavor disables local interrupts and
//!   returns a token that the unlock restores. A spinlock must never be
//!   held across anything that can suspend the current thread.
//! - `Semaphore`: counted units over a sleep queue. `signal` may be called
//!   from interrupt context; `wait` may not.
//! - `Mutex`: binary, owner-tracked, sleepable. Not usable from interrupt
//!   context.
//!
//! The named kernel locks carry a `LockLevel`; acquiring them out of order
//! is a debug assertion failure.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::arch::interrupts;
use crate::arch::IrqState;
use crate::kern::pcpu;
use crate::kern::sched;
use crate::kern::thread::Thread;
use crate::types::ThreadId;

// ============================================================================
// Lock hierarchy
// ============================================================================

/// Acquisition order for the named kernel locks; acquire ascending only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LockLevel {
    Process = 1,
    Thread = 2,
    Scheduler = 3,
    VmSpace = 4,
    VmPage = 5,
    InodeCache = 6,
}

/// Hierarchy tracking; levels held are recorded on the owning thread so the
/// record follows a thread that blocks and migrates between CPUs.
mod hierarchy {
    use super::LockLevel;
    use crate::kern::pcpu;

    pub fn acquired(level: LockLevel) {
        if cfg!(debug_assertions) {
            if let Some(t) = pcpu::try_current_thread() {
                t.push_lock_level(level as u8);
            }
        }
    }

    pub fn released(level: LockLevel) {
        if cfg!(debug_assertions) {
            if let Some(t) = pcpu::try_current_thread() {
                t.pop_lock_level(level as u8);
            }
        }
    }
}

// ============================================================================
// Raw spinlock
// ============================================================================

const NO_OWNER: u32 = u32::MAX;

/// A raw spinning lock guarding no data of its own.
pub struct Spinlock {
    locked: AtomicBool,
    /// CPU currently inside the lock; only for re-entry detection.
    owner_cpu: AtomicU32,
    level: Option<LockLevel>,
}

impl Spinlock {
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
            owner_cpu: AtomicU32::new(NO_OWNER),
            level: None,
        }
    }

    pub const fn with_level(level: LockLevel) -> Self {
        Self {
            locked: AtomicBool::new(false),
            owner_cpu: AtomicU32::new(NO_OWNER),
            level: Some(level),
        }
    }

    /// A lock born in the held state; the creator unlocks it once the
    /// protected object is ready. Keeps lock creation out of any enclosing
    /// critical section.
    pub const fn new_locked(level: LockLevel) -> Self {
        Self {
            locked: AtomicBool::new(true),
            owner_cpu: AtomicU32::new(NO_OWNER),
            level: Some(level),
        }
    }

    fn acquire(&self) {
        let cpu = crate::arch::cpu_id();
        debug_assert!(
            !(self.locked.load(Ordering::Relaxed)
                && self.owner_cpu.load(Ordering::Relaxed) == cpu
                && !interrupts::enabled()),
            "spinlock re-entry on cpu {}",
            cpu
        );
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                crate::arch::relax();
            }
        }
        self.owner_cpu.store(cpu, Ordering::Relaxed);
        if let Some(level) = self.level {
            hierarchy::acquired(level);
        }
    }

    fn release(&self) {
        if let Some(level) = self.level {
            hierarchy::released(level);
        }
        self.owner_cpu.store(NO_OWNER, Ordering::Relaxed);
        self.locked.store(false, Ordering::Release);
    }

    /// Acquire, spinning; the holder stays preemptible.
    pub fn lock(&self) {
        self.acquire();
    }

    pub fn unlock(&self) {
        self.assert_locked();
        self.release();
    }

    /// Acquire with local interrupts disabled; pass the returned state to
    /// `unlock_unpreemptible` to restore them.
    pub fn lock_unpreemptible(&self) -> IrqState {
        let state = interrupts::save_and_disable();
        self.acquire();
        state
    }

    pub fn unlock_unpreemptible(&self, state: IrqState) {
        self.assert_locked();
        self.release();
        interrupts::restore(state);
    }

    pub fn try_lock(&self) -> bool {
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.owner_cpu.store(crate::arch::cpu_id(), Ordering::Relaxed);
            if let Some(level) = self.level {
                hierarchy::acquired(level);
            }
            true
        } else {
            false
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    pub fn assert_locked(&self) {
        debug_assert!(self.is_locked(), "spinlock not held");
    }

    pub fn assert_unlocked(&self) {
        debug_assert!(!self.is_locked(), "spinlock unexpectedly held");
    }
}

impl Default for Spinlock {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl Send for Spinlock {}
unsafe impl Sync for Spinlock {}

// ============================================================================
// Data-carrying spinlock
// ============================================================================

/// A spinlock protecting data, handed out through RAII guards.
pub struct SpinLock<T> {
    lock: Spinlock,
    data: UnsafeCell<T>,
}

impl<T> SpinLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            lock: Spinlock::new(),
            data: UnsafeCell::new(data),
        }
    }

    pub const fn with_level(level: LockLevel, data: T) -> Self {
        Self {
            lock: Spinlock::with_level(level),
            data: UnsafeCell::new(data),
        }
    }

    pub fn lock(&self) -> SpinGuard<'_, T> {
        self.lock.lock();
        SpinGuard { lock: self }
    }

    /// Lock with interrupts disabled; dropping the guard restores them.
    pub fn lock_unpreemptible(&self) -> IrqSpinGuard<'_, T> {
        let state = interrupts::save_and_disable();
        self.lock.lock();
        IrqSpinGuard {
            lock: self,
            state: Some(state),
        }
    }

    pub fn try_lock(&self) -> Option<SpinGuard<'_, T>> {
        if self.lock.try_lock() {
            Some(SpinGuard { lock: self })
        } else {
            None
        }
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }
}

unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

pub struct SpinGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> core::ops::Deref for SpinGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> core::ops::DerefMut for SpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.lock.release();
    }
}

/// Guard for an unpreemptible acquisition; restores the interrupt flag on
/// drop unless `unlock_keep_disabled` consumed it first.
pub struct IrqSpinGuard<'a, T> {
    lock: &'a SpinLock<T>,
    state: Option<IrqState>,
}

impl<T> IrqSpinGuard<'_, T> {
    /// Release the lock but leave interrupts disabled, handing the saved
    /// state back to the caller.
    pub fn unlock_keep_disabled(mut self) -> IrqState {
        let state = self.state.take().expect("state already consumed");
        self.lock.lock.release();
        core::mem::forget(self);
        state
    }
}

impl<T> core::ops::Deref for IrqSpinGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> core::ops::DerefMut for IrqSpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for IrqSpinGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.lock.release();
        if let Some(state) = self.state.take() {
            interrupts::restore(state);
        }
    }
}

// ============================================================================
// Semaphore
// ============================================================================

struct SemInner {
    count: i32,
    waiters: VecDeque<Arc<Thread>>,
}

/// Counted units over a sleep queue.
///
/// `signal` increments the count and wakes at most one waiter; `wait`
/// decrements if a unit is available, otherwise it suspends the current
/// thread until a signal arrives and re-checks.
pub struct Semaphore {
    name: &'static str,
    inner: SpinLock<SemInner>,
}

impl Semaphore {
    pub const fn new(name: &'static str, count: i32) -> Self {
        Self {
            name,
            inner: SpinLock::new(SemInner {
                count,
                waiters: VecDeque::new(),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Release one unit and wake at most one waiter.
    pub fn signal(&self) {
        let mut inner = self.inner.lock();
        inner.count += 1;
        if let Some(waiter) = inner.waiters.pop_front() {
            drop(inner);
            waiter.resume();
        }
    }

    /// Acquire one unit, suspending until one is available.
    pub fn wait(&self) {
        debug_assert!(!pcpu::in_interrupt(), "semaphore wait in interrupt context");
        loop {
            let mut inner = self.inner.lock();
            if inner.count > 0 {
                inner.count -= 1;
                return;
            }
            let current = pcpu::current_thread();
            inner.waiters.push_back(current.clone());
            current.suspend();
            drop(inner);
            sched::schedule();
        }
    }

    /// Acquire one unit without blocking; reports whether one was taken.
    pub fn try_wait(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.count > 0 {
            inner.count -= 1;
            true
        } else {
            false
        }
    }

    /// Wait for at least one unit, then take everything available.
    pub fn wait_and_drain(&self) {
        self.wait();
        let mut inner = self.inner.lock();
        inner.count = 0;
    }

    /// Units currently available.
    pub fn count(&self) -> i32 {
        self.inner.lock().count
    }
}

// ============================================================================
// Mutex
// ============================================================================

struct MutexInner {
    owner: Option<ThreadId>,
    waiters: VecDeque<Arc<Thread>>,
}

/// Binary sleepable lock with ownership tracking and direct hand-off.
pub struct Mutex {
    name: &'static str,
    level: Option<LockLevel>,
    inner: SpinLock<MutexInner>,
}

impl Mutex {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            level: None,
            inner: SpinLock::new(MutexInner {
                owner: None,
                waiters: VecDeque::new(),
            }),
        }
    }

    pub const fn with_level(name: &'static str, level: LockLevel) -> Self {
        Self {
            name,
            level: Some(level),
            inner: SpinLock::new(MutexInner {
                owner: None,
                waiters: VecDeque::new(),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Acquire the mutex, suspending while another thread owns it.
    pub fn lock(&self) {
        debug_assert!(!pcpu::in_interrupt(), "mutex lock in interrupt context");
        let current = pcpu::current_thread();
        let mut blocked = false;
        loop {
            let mut inner = self.inner.lock();
            match inner.owner {
                None => {
                    inner.owner = Some(current.id);
                    drop(inner);
                    self.note_acquired(&current);
                    return;
                }
                Some(owner) if owner == current.id => {
                    // Ownership was handed to us by the previous holder
                    // while we slept; first-try means re-entry.
                    debug_assert!(blocked, "mutex '{}' re-entry", self.name);
                    drop(inner);
                    self.note_acquired(&current);
                    return;
                }
                Some(_) => {
                    inner.waiters.push_back(current.clone());
                    current.suspend();
                    drop(inner);
                    sched::schedule();
                    blocked = true;
                }
            }
        }
    }

    /// Acquire without blocking; reports whether the lock was taken.
    pub fn try_lock(&self) -> bool {
        let current = pcpu::current_thread();
        let mut inner = self.inner.lock();
        if inner.owner.is_none() {
            inner.owner = Some(current.id);
            drop(inner);
            self.note_acquired(&current);
            true
        } else {
            false
        }
    }

    /// Release the mutex; the caller must be the owner. Ownership is handed
    /// off to at most one waiter.
    pub fn unlock(&self) {
        let current = pcpu::current_thread();
        let mut inner = self.inner.lock();
        debug_assert_eq!(
            inner.owner,
            Some(current.id),
            "mutex '{}' unlocked by non-owner",
            self.name
        );
        if let Some(next) = inner.waiters.pop_front() {
            inner.owner = Some(next.id);
            drop(inner);
            self.note_released(&current);
            next.resume();
        } else {
            inner.owner = None;
            drop(inner);
            self.note_released(&current);
        }
    }

    pub fn is_held(&self) -> bool {
        self.inner.lock().owner.is_some()
    }

    pub fn held_by_current(&self) -> bool {
        let current = pcpu::try_current_thread();
        match (current, self.inner.lock().owner) {
            (Some(t), Some(owner)) => t.id == owner,
            _ => false,
        }
    }

    pub fn assert_locked(&self) {
        debug_assert!(self.is_held(), "mutex '{}' not held", self.name);
    }

    pub fn assert_unlocked(&self) {
        debug_assert!(!self.is_held(), "mutex '{}' unexpectedly held", self.name);
    }

    fn note_acquired(&self, t: &Arc<Thread>) {
        t.note_mutex_acquired();
        if let Some(level) = self.level {
            hierarchy::acquired(level);
        }
    }

    fn note_released(&self, t: &Arc<Thread>) {
        if let Some(level) = self.level {
            hierarchy::released(level);
        }
        t.note_mutex_released();
    }
}
