//! The scheduler
//!
//! Two queues: a runqueue holding every thread that can run (including the
//! ones currently on a CPU, marked active) and a sleepqueue for suspended
//! threads. The runqueue is kept sorted by priority, FIFO within a level;
//! the sleepqueue keeps its timeout-armed prefix sorted by wake deadline so
//! only the head needs to be inspected per reschedule.
//!
//! All state transitions happen under one spinlock, taken with interrupts
//! disabled. `schedule()` releases the lock before the context switch but
//! leaves interrupts off; the state saved on entry is restored at the end.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicI32, Ordering};

use crate::arch;
use crate::arch::{interrupts, IrqState};
use crate::kern::ipi;
use crate::kern::lock::{LockLevel, SpinLock};
use crate::kern::pcpu;
use crate::kern::thread::{flags, Thread};
use crate::kern::time;
use crate::types::ThreadId;

/// The two scheduler queues. Queue entries share ownership of the thread;
/// the queue never outlives the thread's registry entry.
pub struct SchedQueues {
    runq: VecDeque<Arc<Thread>>,
    sleepq: VecDeque<Arc<Thread>>,
}

impl SchedQueues {
    const fn new() -> Self {
        Self {
            runq: VecDeque::new(),
            sleepq: VecDeque::new(),
        }
    }
}

/// Scheduler instance: the queues plus an activation count.
pub struct Scheduler {
    queues: SpinLock<SchedQueues>,
    active: AtomicI32,
}

static SCHEDULER: Scheduler = Scheduler::new();

/// The kernel's scheduler.
pub fn scheduler() -> &'static Scheduler {
    &SCHEDULER
}

#[cfg(debug_assertions)]
fn on_queue(q: &VecDeque<Arc<Thread>>, id: ThreadId) -> usize {
    q.iter().filter(|t| t.id == id).count()
}

impl Scheduler {
    pub const fn new() -> Self {
        Self {
            queues: SpinLock::with_level(LockLevel::Scheduler, SchedQueues::new()),
            active: AtomicI32::new(0),
        }
    }

    /// Hook a freshly allocated thread onto the sleepqueue in suspended
    /// state; the scheduler owns this transition.
    pub fn init_thread(&self, t: &Arc<Thread>) {
        t.set_flags(flags::SUSPENDED);
        let mut q = self.queues.lock_unpreemptible();
        #[cfg(debug_assertions)]
        {
            debug_assert_eq!(on_queue(&q.runq, t.id), 0, "new thread already on runq");
            debug_assert_eq!(on_queue(&q.sleepq, t.id), 0, "new thread already on sleepq");
        }
        q.sleepq.push_back(t.clone());
    }

    /// Place an idle thread directly on the runqueue. Idle threads are
    /// never suspended and never visit the sleepqueue.
    pub fn add_idle(&self, t: &Arc<Thread>) {
        let mut q = self.queues.lock_unpreemptible();
        #[cfg(debug_assertions)]
        debug_assert_eq!(on_queue(&q.runq, t.id), 0, "idle thread already queued");
        insert_runq(&mut q.runq, t.clone());
    }

    /// Move a suspended thread from the sleepqueue to the runqueue.
    pub fn resume_thread(&self, t: &Arc<Thread>) {
        let mut q = self.queues.lock_unpreemptible();
        debug_assert!(t.has_flags(flags::SUSPENDED), "resuming non-suspended thread");
        #[cfg(debug_assertions)]
        {
            debug_assert_eq!(on_queue(&q.runq, t.id), 0, "resuming thread already on runq");
            debug_assert_eq!(on_queue(&q.sleepq, t.id), 1, "resuming thread not on sleepq");
        }
        remove_from(&mut q.sleepq, t.id);
        insert_runq(&mut q.runq, t.clone());
        // Flag updates happen under the scheduler lock: nobody else may
        // touch the thread while it moves between queues. The timeout is
        // cancelled as well since the thread is awake now.
        t.clear_flags(flags::SUSPENDED | flags::TIMEOUT);
    }

    /// Move a runnable thread from the runqueue to the sleepqueue.
    pub fn suspend_thread(&self, t: &Arc<Thread>) {
        let mut q = self.queues.lock_unpreemptible();
        debug_assert!(!t.has_flags(flags::SUSPENDED), "suspending suspended thread");
        #[cfg(debug_assertions)]
        {
            debug_assert_eq!(on_queue(&q.sleepq, t.id), 0, "suspending thread already on sleepq");
            debug_assert_eq!(on_queue(&q.runq, t.id), 1, "suspending thread not on runq");
        }
        remove_from(&mut q.runq, t.id);
        insert_sleepq(&mut q.sleepq, t.clone());
        t.set_flags(flags::SUSPENDED);
    }

    /// Turn the current thread into a zombie: drop it from the runqueue so
    /// it can never be picked again. Interrupts stay disabled on return so
    /// no context switch can happen before the caller's final `schedule()`.
    pub fn exit_thread(&self, t: &Arc<Thread>) -> IrqState {
        let mut q = self.queues.lock_unpreemptible();
        #[cfg(debug_assertions)]
        {
            debug_assert_eq!(on_queue(&q.runq, t.id), 1, "exiting thread not on runq");
            debug_assert_eq!(on_queue(&q.sleepq, t.id), 0, "exiting thread on sleepq");
        }
        remove_from(&mut q.runq, t.id);
        // A zombie off both queues is invisible to the scheduler; the
        // remaining references keep the stack alive until released.
        t.set_flags(flags::ZOMBIE);
        q.unlock_keep_disabled()
    }

    /// Queue surgery for one reschedule on `cpu`: possibly wake the
    /// sleepqueue head, pick the next thread, re-queue an involuntarily
    /// preempted `cur`. Returns the chosen thread and the interrupt state
    /// saved on entry; interrupts remain disabled.
    pub fn reschedule_begin(&self, cpu: u32, cur: &Arc<Thread>) -> (Arc<Thread>, IrqState) {
        let mut q = self.queues.lock_unpreemptible();

        // We are about to schedule: cancel any pending request.
        cur.clear_flags(flags::RESCHEDULE);

        // Wake the head of the sleepqueue if its deadline passed. Entries
        // are kept in wake order, so the head check suffices.
        let wake = match q.sleepq.front() {
            Some(head) => {
                head.has_flags(flags::TIMEOUT)
                    && time::is_tick_after(time::get_ticks(), head.timeout())
            }
            None => false,
        };
        if wake {
            let t = q.sleepq.pop_front().unwrap();
            t.clear_flags(flags::TIMEOUT | flags::SUSPENDED);
            insert_runq(&mut q.runq, t);
        }

        assert!(!q.runq.is_empty(), "runqueue cannot be empty");

        // Highest-priority thread this CPU may run: affinity must match and
        // the thread must not be active on some other CPU.
        let next = q
            .runq
            .iter()
            .find(|t| {
                t.affinity().allows(cpu)
                    && (!t.has_flags(flags::ACTIVE) || Arc::ptr_eq(t, cur))
            })
            .cloned()
            .unwrap_or_else(|| panic!("nothing on the runqueue for cpu {}", cpu));

        debug_assert!(!next.has_flags(flags::SUSPENDED), "activating suspended thread");
        debug_assert!(
            Arc::ptr_eq(&next, cur) || !next.has_flags(flags::ACTIVE),
            "activating active thread"
        );

        // An involuntarily interrupted current thread goes to the back of
        // its priority band, giving round-robin within each level. Zombies
        // and suspended threads have already left the runqueue.
        if !cur.has_flags(flags::SUSPENDED) && !cur.has_flags(flags::ZOMBIE) {
            remove_from(&mut q.runq, cur.id);
            insert_runq(&mut q.runq, cur.clone());
        }

        // Marking the choice active keeps other CPUs away from it.
        next.set_flags(flags::ACTIVE);

        let state = q.unlock_keep_disabled();
        (next, state)
    }

    /// Scheduler activations (one per launched CPU).
    pub fn activate(&self) {
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn deactivate(&self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed) > 0
    }

    /// Thread ids currently on the runqueue, in queue order.
    pub fn runq_ids(&self) -> alloc::vec::Vec<ThreadId> {
        self.queues.lock().runq.iter().map(|t| t.id).collect()
    }

    /// Thread ids currently on the sleepqueue, in queue order.
    pub fn sleepq_ids(&self) -> alloc::vec::Vec<ThreadId> {
        self.queues.lock().sleepq.iter().map(|t| t.id).collect()
    }

    /// Verify the queue invariants; used by the debugger and tests.
    pub fn check_invariants(&self) {
        let q = self.queues.lock();
        let mut last_prio = 0;
        for t in q.runq.iter() {
            assert!(t.priority() >= last_prio, "runqueue not sorted by priority");
            assert!(!t.has_flags(flags::SUSPENDED), "suspended thread on runq");
            last_prio = t.priority();
        }
        let mut prev_deadline: Option<u64> = None;
        let mut seen_untimed = false;
        for t in q.sleepq.iter() {
            assert!(t.has_flags(flags::SUSPENDED), "non-suspended thread on sleepq");
            if t.has_flags(flags::TIMEOUT) {
                assert!(!seen_untimed, "timeout-armed thread behind untimed entries");
                if let Some(prev) = prev_deadline {
                    assert!(
                        !time::is_tick_before(t.timeout(), prev),
                        "sleepq not in wake order"
                    );
                }
                prev_deadline = Some(t.timeout());
            } else {
                seen_untimed = true;
            }
        }
        for t in q.runq.iter() {
            assert_eq!(
                q.sleepq.iter().filter(|s| s.id == t.id).count(),
                0,
                "thread on both queues"
            );
        }
    }

    /// Print both queues to the console.
    pub fn dump(&self) {
        let q = self.queues.lock();
        crate::kprintln!("runqueue");
        for t in q.runq.iter() {
            crate::kprintln!("  thread {:?} prio {}", t.id, t.priority());
        }
        crate::kprintln!("sleepqueue");
        for t in q.sleepq.iter() {
            crate::kprintln!("  thread {:?} timeout {}", t.id, t.timeout());
        }
    }

}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

fn remove_from(q: &mut VecDeque<Arc<Thread>>, id: ThreadId) {
    if let Some(pos) = q.iter().position(|t| t.id == id) {
        q.remove(pos);
    }
}

/// Insert preserving priority order (0 is highest); FIFO within a level.
fn insert_runq(q: &mut VecDeque<Arc<Thread>>, t: Arc<Thread>) {
    let prio = t.priority();
    match q.iter().position(|s| s.priority() > prio) {
        Some(pos) => q.insert(pos, t),
        None => q.push_back(t),
    }
}

/// Insert in first-to-wake order; threads without a deadline go to the tail.
fn insert_sleepq(q: &mut VecDeque<Arc<Thread>>, t: Arc<Thread>) {
    if !t.has_flags(flags::TIMEOUT) {
        q.push_back(t);
        return;
    }
    let deadline = t.timeout();
    let pos = q.iter().position(|s| {
        !(s.has_flags(flags::TIMEOUT) && time::is_tick_before(s.timeout(), deadline))
    });
    match pos {
        Some(pos) => q.insert(pos, t),
        None => q.push_back(t),
    }
}

// ============================================================================
// Kernel entry points
// ============================================================================

/// Place a new thread under scheduler control (suspended).
pub fn init_thread(t: &Arc<Thread>) {
    SCHEDULER.init_thread(t);
}

/// Make a suspended thread runnable.
pub fn resume_thread(t: &Arc<Thread>) {
    SCHEDULER.resume_thread(t);
}

/// Take a runnable thread off the runqueue.
pub fn suspend_thread(t: &Arc<Thread>) {
    SCHEDULER.suspend_thread(t);
}

/// Retire the current thread; the caller must invoke `schedule()` next and
/// will never regain control.
pub fn exit_current(t: &Arc<Thread>) {
    let _state = SCHEDULER.exit_thread(t);
    // Interrupts stay disabled; the state dies with this thread.
}

/// Ask for a reschedule on this CPU; honored on the next interrupt return.
pub fn request_reschedule() {
    if let Some(t) = pcpu::try_current_thread() {
        t.set_flags(flags::RESCHEDULE);
    }
}

/// Whether the current thread has a reschedule pending.
pub fn want_reschedule() -> bool {
    pcpu::try_current_thread().is_some_and(|t| t.has_flags(flags::RESCHEDULE))
}

/// Pick the next thread for this CPU and switch to it.
pub fn schedule() {
    let pc = pcpu::current();
    let cur = pc.current_thread().expect("no current thread active");

    let (next, state) = SCHEDULER.reschedule_begin(pc.id(), &cur);
    pc.set_current_thread(next.clone());

    if !Arc::ptr_eq(&cur, &next) {
        pc.set_outgoing(cur.clone());
        unsafe {
            arch::context_switch(cur.ctx_ptr(), next.ctx_ptr());
        }
        // Running again, possibly on another CPU: let go of whichever
        // thread this CPU just switched away from. Its stack is quiesced
        // the moment the active flag clears, which is why the incoming
        // thread performs the release rather than the outgoing one.
        release_outgoing();
    }

    interrupts::restore(state);
}

/// Release the thread the running CPU most recently switched away from.
pub fn release_outgoing() {
    if let Some(prev) = pcpu::current().take_outgoing() {
        prev.clear_flags(flags::ACTIVE);
    }
}

/// Create one idle thread per CPU, pinned and at the lowest priority, and
/// hand each to its per-CPU area. Runs once on the boot CPU.
pub fn setup_idle_threads() {
    for pc in pcpu::all() {
        if pc.idle_thread().is_some() {
            continue;
        }
        let t = Thread::new_idle(pc.id());
        SCHEDULER.add_idle(&t);
        pc.set_idle_thread(t);
    }
}

/// Activate the scheduler on this CPU. The CPU's idle thread becomes the
/// current thread; from here on the timer interrupt drives scheduling.
pub fn launch() {
    let pc = pcpu::current();
    let idle = pc.idle_thread().expect("idle thread not set up");

    interrupts::disable();
    idle.set_flags(flags::ACTIVE);
    pc.set_current_thread(idle);
    SCHEDULER.activate();
    interrupts::enable();
}

/// Ask every CPU (including this one) to reschedule.
pub fn broadcast_schedule() {
    ipi::broadcast(ipi::IpiVector::Schedule);
}

/// Halt every other CPU; used on the panic path.
pub fn panic_others() {
    ipi::send_others(ipi::IpiVector::Panic);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kern::thread::{flags, Thread};
    use proptest::prelude::*;

    fn kthread(name: &'static str, prio: u32) -> Arc<Thread> {
        let t = Thread::new_bootstrap(name);
        t.set_priority(prio);
        t
    }

    #[test]
    fn test_init_places_on_sleepq_suspended() {
        let _guard = crate::testsync::lock();
        let s = Scheduler::new();
        let t = kthread("a", 200);
        s.init_thread(&t);
        assert!(t.has_flags(flags::SUSPENDED));
        assert_eq!(s.sleepq_ids(), alloc::vec![t.id]);
        assert!(s.runq_ids().is_empty());
        s.check_invariants();
    }

    #[test]
    fn test_resume_moves_to_runq_in_priority_order() {
        let _guard = crate::testsync::lock();
        let s = Scheduler::new();
        let hi = kthread("hi", 10);
        let mid = kthread("mid", 100);
        let lo = kthread("lo", 250);
        for t in [&lo, &hi, &mid] {
            s.init_thread(t);
            s.resume_thread(t);
        }
        assert_eq!(s.runq_ids(), alloc::vec![hi.id, mid.id, lo.id]);
        assert!(!hi.has_flags(flags::SUSPENDED));
        s.check_invariants();
    }

    #[test]
    fn test_fifo_within_priority_band() {
        let _guard = crate::testsync::lock();
        let s = Scheduler::new();
        let a = kthread("a", 100);
        let b = kthread("b", 100);
        let c = kthread("c", 100);
        for t in [&a, &b, &c] {
            s.init_thread(t);
            s.resume_thread(t);
        }
        assert_eq!(s.runq_ids(), alloc::vec![a.id, b.id, c.id]);
    }

    #[test]
    fn test_suspend_resume_round_trip() {
        let _guard = crate::testsync::lock();
        let s = Scheduler::new();
        let a = kthread("a", 100);
        let b = kthread("b", 100);
        for t in [&a, &b] {
            s.init_thread(t);
            s.resume_thread(t);
        }
        // Leaving and re-entering the band puts the thread at its tail.
        s.suspend_thread(&a);
        assert_eq!(s.runq_ids(), alloc::vec![b.id]);
        assert_eq!(s.sleepq_ids(), alloc::vec![a.id]);
        s.resume_thread(&a);
        assert_eq!(s.runq_ids(), alloc::vec![b.id, a.id]);
        s.check_invariants();
    }

    #[test]
    fn test_sleepq_ordered_by_deadline() {
        let _guard = crate::testsync::lock();
        crate::kern::time::test_set_ticks(1000);
        let s = Scheduler::new();
        let late = kthread("late", 100);
        let early = kthread("early", 100);
        let plain = kthread("plain", 100);
        for t in [&late, &early, &plain] {
            s.init_thread(t);
            s.resume_thread(t);
        }
        late.arm_timeout(1050);
        s.suspend_thread(&late);
        plain.clear_flags(flags::TIMEOUT);
        s.suspend_thread(&plain);
        early.arm_timeout(1010);
        s.suspend_thread(&early);
        assert_eq!(s.sleepq_ids(), alloc::vec![early.id, late.id, plain.id]);
        s.check_invariants();
    }

    #[test]
    fn test_timeout_wake_on_reschedule() {
        let _guard = crate::testsync::lock();
        crate::kern::time::test_set_ticks(1000);
        let s = Scheduler::new();
        let cur = kthread("cur", 200);
        s.init_thread(&cur);
        s.resume_thread(&cur);
        cur.set_flags(flags::ACTIVE);

        let sleeper = kthread("sleeper", 100);
        s.init_thread(&sleeper);
        s.resume_thread(&sleeper);
        // sleep_ms(50) at 100 Hz arms tick 1005
        sleeper.arm_timeout(1005);
        s.suspend_thread(&sleeper);

        // Not due yet: the current thread keeps running.
        crate::kern::time::test_set_ticks(1004);
        let (next, state) = s.reschedule_begin(0, &cur);
        interrupts::restore(state);
        assert_eq!(next.id, cur.id);
        assert!(sleeper.has_flags(flags::SUSPENDED));

        // Due: the sleeper wakes into its priority slot and wins.
        crate::kern::time::test_set_ticks(1005);
        let (next, state) = s.reschedule_begin(0, &cur);
        interrupts::restore(state);
        assert_eq!(next.id, sleeper.id);
        assert!(!sleeper.has_flags(flags::SUSPENDED));
        assert!(!sleeper.has_flags(flags::TIMEOUT));
        assert_eq!(s.runq_ids(), alloc::vec![sleeper.id, cur.id]);
        s.check_invariants();
    }

    #[test]
    fn test_priority_preemption_requeues_current() {
        let _guard = crate::testsync::lock();
        crate::kern::time::test_set_ticks(0);
        let s = Scheduler::new();
        let cur = kthread("cur", 200);
        let urgent = kthread("urgent", 100);
        for t in [&cur, &urgent] {
            s.init_thread(t);
            s.resume_thread(t);
        }
        cur.set_flags(flags::ACTIVE);
        cur.set_flags(flags::RESCHEDULE);

        let (next, state) = s.reschedule_begin(0, &cur);
        interrupts::restore(state);
        assert_eq!(next.id, urgent.id);
        assert!(next.has_flags(flags::ACTIVE));
        assert!(!cur.has_flags(flags::RESCHEDULE));
        // Involuntary preemption re-queues at the tail of the 200 band.
        assert_eq!(s.runq_ids(), alloc::vec![urgent.id, cur.id]);
        s.check_invariants();
    }

    #[test]
    fn test_affinity_and_active_are_skipped() {
        let _guard = crate::testsync::lock();
        crate::kern::time::test_set_ticks(0);
        let s = Scheduler::new();
        let cur = kthread("cur", 200);
        let pinned = kthread("pinned", 50);
        let busy = kthread("busy", 60);
        let free = kthread("free", 70);
        for t in [&cur, &pinned, &busy, &free] {
            s.init_thread(t);
            s.resume_thread(t);
        }
        cur.set_flags(flags::ACTIVE);
        pinned.set_affinity(crate::types::CpuAffinity::Fixed(1));
        busy.set_flags(flags::ACTIVE); // running on another CPU

        let (next, state) = s.reschedule_begin(0, &cur);
        interrupts::restore(state);
        assert_eq!(next.id, free.id);
    }

    #[test]
    fn test_exit_leaves_zombie_off_both_queues() {
        let _guard = crate::testsync::lock();
        let s = Scheduler::new();
        let t = kthread("dying", 200);
        s.init_thread(&t);
        s.resume_thread(&t);
        let state = s.exit_thread(&t);
        interrupts::restore(state);
        assert!(t.has_flags(flags::ZOMBIE));
        assert!(s.runq_ids().is_empty());
        assert!(s.sleepq_ids().is_empty());
    }

    proptest! {
        #[test]
        fn prop_runq_stays_priority_sorted(prios in proptest::collection::vec(0u32..=255, 1..24)) {
            let _guard = crate::testsync::lock();
            let s = Scheduler::new();
            for (i, prio) in prios.iter().enumerate() {
                let t = kthread(if i % 2 == 0 { "even" } else { "odd" }, *prio);
                s.init_thread(&t);
                s.resume_thread(&t);
            }
            let ids = s.runq_ids();
            assert_eq!(ids.len(), prios.len());
            s.check_invariants();
        }

        #[test]
        fn prop_sleepq_timeout_prefix_sorted(deadlines in proptest::collection::vec(0u64..10_000, 1..16)) {
            let _guard = crate::testsync::lock();
            let s = Scheduler::new();
            for d in deadlines.iter() {
                let t = kthread("sleeper", 100);
                s.init_thread(&t);
                s.resume_thread(&t);
                t.arm_timeout(*d);
                s.suspend_thread(&t);
            }
            s.check_invariants();
        }
    }
}
