//! Process management
//!
//! A process is a container: threads, an exclusively owned VM space, a
//! handle table, and a position in the parent/child tree. Children hold
//! only a weak link back to the parent; the owning direction is parent to
//! child. A zombie process keeps its exit status until the parent harvests
//! it through `wait_and_lock`, whose final deref tears everything down.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use spin::Mutex as DataMutex;

use crate::errno::{Errno, KResult};
use crate::kern::handle::HandleTable;
use crate::kern::lock::{LockLevel, Mutex, Semaphore, SpinLock};
use crate::kern::thread::{Thread, USER_STACK_SIZE, USER_STACK_TOP};
use crate::mm::vmspace::{vmflags, VmSpace};
use crate::mm::PAGE_SIZE;
use crate::types::{ProcessId, ThreadId};

/// Byte budget for the argument buffer in the process-info page.
pub const PROCINFO_ARGS_LENGTH: usize = 1024;

/// Byte budget for the environment buffer in the process-info page.
pub const PROCINFO_ENV_LENGTH: usize = 1024;

// Process-info page layout: a small header, then args, then environment.
const PROCINFO_PID_OFFSET: u64 = 4;
const PROCINFO_ARGS_OFFSET: u64 = 16;
const PROCINFO_ENV_OFFSET: u64 = PROCINFO_ARGS_OFFSET + PROCINFO_ARGS_LENGTH as u64;

/// Process states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ProcessState {
    Active = 0,
    Zombie = 1,
}

/// Callback run for every new process, in registration order.
pub type InitCallback = fn(&Arc<Process>) -> KResult<()>;

/// Callback run as a process is destroyed.
pub type ExitCallback = fn(&Process);

/// A container of threads, memory and handles.
pub struct Process {
    pub id: ProcessId,
    /// Lifecycle lock: serializes exit against wait
    lock: Mutex,
    state: AtomicU32,
    exit_status: AtomicU32,
    refcount: AtomicU32,
    parent: DataMutex<Weak<Process>>,
    children: DataMutex<Vec<Arc<Process>>>,
    threads: DataMutex<Vec<Arc<Thread>>>,
    main_thread: DataMutex<Option<ThreadId>>,
    vmspace: SpinLock<VmSpace>,
    handles: DataMutex<HandleTable>,
    /// Where the process-info page is mapped
    info_va: AtomicU64,
}

impl Process {
    fn build(parent: Option<&Arc<Process>>) -> Arc<Process> {
        Arc::new(Process {
            id: ProcessId::new(),
            lock: Mutex::with_level("process", LockLevel::Process),
            state: AtomicU32::new(ProcessState::Active as u32),
            exit_status: AtomicU32::new(0),
            refcount: AtomicU32::new(1),
            parent: DataMutex::new(parent.map(Arc::downgrade).unwrap_or_default()),
            children: DataMutex::new(Vec::new()),
            threads: DataMutex::new(Vec::new()),
            main_thread: DataMutex::new(None),
            vmspace: SpinLock::with_level(LockLevel::VmSpace, VmSpace::new()),
            handles: DataMutex::new(HandleTable::new()),
            info_va: AtomicU64::new(0),
        })
    }

    // === Lifecycle lock ===

    pub fn lifecycle_lock(&self) -> &Mutex {
        &self.lock
    }

    // === State ===

    pub fn state(&self) -> ProcessState {
        if self.state.load(Ordering::Acquire) == ProcessState::Zombie as u32 {
            ProcessState::Zombie
        } else {
            ProcessState::Active
        }
    }

    pub fn is_zombie(&self) -> bool {
        self.state() == ProcessState::Zombie
    }

    pub fn exit_status(&self) -> u32 {
        self.exit_status.load(Ordering::Acquire)
    }

    /// Mark the process zombie with its exit status. The caller holds the
    /// lifecycle lock.
    pub fn exit_locked(&self, status: u32) {
        self.lock.assert_locked();
        self.exit_status.store(status, Ordering::Release);
        self.state.store(ProcessState::Zombie as u32, Ordering::Release);
    }

    /// Wake any parent blocked in `wait_and_lock`.
    pub fn signal_exit(&self) {
        process_sleep().signal();
    }

    // === Tree ===

    pub fn parent(&self) -> Option<Arc<Process>> {
        self.parent.lock().upgrade()
    }

    pub fn children_snapshot(&self) -> Vec<Arc<Process>> {
        self.children.lock().clone()
    }

    fn adopt(&self, child: &Arc<Process>) {
        self.children.lock().push(child.clone());
    }

    fn disown(&self, id: ProcessId) {
        self.children.lock().retain(|c| c.id != id);
    }

    // === Threads ===

    pub fn add_thread(&self, t: &Arc<Thread>) {
        let mut threads = self.threads.lock();
        threads.push(t.clone());
        let mut main = self.main_thread.lock();
        if main.is_none() {
            *main = Some(t.id);
        }
    }

    pub fn remove_thread(&self, id: ThreadId) {
        self.threads.lock().retain(|t| t.id != id);
    }

    pub fn is_main_thread(&self, id: ThreadId) -> bool {
        *self.main_thread.lock() == Some(id)
    }

    pub fn main_thread(&self) -> Option<Arc<Thread>> {
        let id = (*self.main_thread.lock())?;
        self.threads.lock().iter().find(|t| t.id == id).cloned()
    }

    // === VM space ===

    /// Run `f` with the process's address space locked.
    pub fn with_vmspace<R>(&self, f: impl FnOnce(&mut VmSpace) -> R) -> R {
        let mut vs = self.vmspace.lock();
        f(&mut vs)
    }

    /// Map the fixed user stack area if this space does not have it yet.
    pub fn map_user_stack(&self) -> KResult<()> {
        let base = USER_STACK_TOP - USER_STACK_SIZE as u64;
        self.with_vmspace(|vs| {
            if vs.area_containing(base).is_some() {
                return Ok(());
            }
            vs.map_at(base, USER_STACK_SIZE, vmflags::USER | vmflags::READ | vmflags::WRITE)
                .map(|_| ())
        })
    }

    // === Handles ===

    pub fn with_handles<R>(&self, f: impl FnOnce(&mut HandleTable) -> R) -> R {
        let mut handles = self.handles.lock();
        f(&mut handles)
    }

    // === Process-info page ===

    pub fn info_va(&self) -> u64 {
        self.info_va.load(Ordering::Relaxed)
    }

    /// Store the double-NUL-terminated argument buffer into the info page.
    pub fn set_args(&self, args: &[u8]) -> KResult<()> {
        let data = validated_strings(args, PROCINFO_ARGS_LENGTH)?;
        let va = self.info_va() + PROCINFO_ARGS_OFFSET;
        self.with_vmspace(|vs| vs.copy_out(va, data))
    }

    /// Store the double-NUL-terminated environment buffer into the info
    /// page.
    pub fn set_environment(&self, env: &[u8]) -> KResult<()> {
        let data = validated_strings(env, PROCINFO_ENV_LENGTH)?;
        let va = self.info_va() + PROCINFO_ENV_OFFSET;
        self.with_vmspace(|vs| vs.copy_out(va, data))
    }

    /// The raw environment buffer, as inherited by children.
    pub fn environment(&self) -> KResult<Vec<u8>> {
        let va = self.info_va() + PROCINFO_ENV_OFFSET;
        let mut buf = alloc::vec![0u8; PROCINFO_ENV_LENGTH];
        self.with_vmspace(|vs| vs.copy_in(va, &mut buf))?;
        Ok(buf)
    }

    // === Reference counting ===

    pub fn ref_(&self) {
        let prev = self.refcount.fetch_add(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "reffing process with zero refcount");
    }

    /// Drop one reference; the last one destroys the process.
    pub fn deref(self: &Arc<Self>) {
        let prev = self.refcount.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "dereffing process with zero refcount");
        if prev == 1 {
            destroy(self);
        }
    }

    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Relaxed)
    }
}

/// Check a double-NUL-terminated string block and return the bytes to
/// store, including the terminator.
fn validated_strings(data: &[u8], max: usize) -> KResult<&[u8]> {
    let limit = data.len().min(max - 1);
    for i in 0..limit {
        if data[i] == 0 && i + 1 < data.len() && data[i + 1] == 0 {
            return Ok(&data[..i + 2]);
        }
    }
    Err(Errno::BadLength)
}

// ============================================================================
// Global state
// ============================================================================

static ALL_PROCESSES: DataMutex<Vec<Arc<Process>>> = DataMutex::new(Vec::new());

static PROCESS_SLEEP: Semaphore = Semaphore::new("process-sleep", 0);

static INIT_CALLBACKS: DataMutex<Vec<InitCallback>> = DataMutex::new(Vec::new());
static EXIT_CALLBACKS: DataMutex<Vec<ExitCallback>> = DataMutex::new(Vec::new());

/// The semaphore parents sleep on while waiting for children to exit.
pub fn process_sleep() -> &'static Semaphore {
    &PROCESS_SLEEP
}

/// Register a callback run for every process at allocation.
pub fn register_init_callback(f: InitCallback) {
    INIT_CALLBACKS.lock().push(f);
}

/// Register a callback run for every process at destruction.
pub fn register_exit_callback(f: ExitCallback) {
    EXIT_CALLBACKS.lock().push(f);
}

pub fn unregister_init_callback(f: InitCallback) {
    INIT_CALLBACKS.lock().retain(|&g| !core::ptr::fn_addr_eq(g, f));
}

pub fn unregister_exit_callback(f: ExitCallback) {
    EXIT_CALLBACKS.lock().retain(|&g| !core::ptr::fn_addr_eq(g, f));
}

// ============================================================================
// Lifecycle operations
// ============================================================================

/// Allocate a process: fresh VM space with its info page mapped, the
/// parent's environment and handles (slot numbers preserved), and a place
/// in the parent's child list.
pub fn alloc(parent: Option<&Arc<Process>>) -> KResult<Arc<Process>> {
    let p = Process::build(parent);

    // Map the process-info page and stamp the pid into it.
    let info_va = p.with_vmspace(|vs| {
        vs.map(
            PAGE_SIZE,
            vmflags::USER | vmflags::READ | vmflags::WRITE | vmflags::NO_CLONE,
        )
    })?;
    p.info_va.store(info_va, Ordering::Relaxed);
    let pid_bytes = p.id.0.to_le_bytes();
    p.with_vmspace(|vs| vs.copy_out(info_va + PROCINFO_PID_OFFSET, &pid_bytes))?;

    if let Some(parent) = parent {
        // The child starts from the parent's environment and handles.
        let env = parent.environment()?;
        p.with_vmspace(|vs| vs.copy_out(info_va + PROCINFO_ENV_OFFSET, &env))?;
        let handles = parent.with_handles(|h| h.clone_table())?;
        p.with_handles(|h| *h = handles);
    }

    let callbacks: Vec<InitCallback> = INIT_CALLBACKS.lock().clone();
    for cb in callbacks {
        cb(&p)?;
    }

    if let Some(parent) = parent {
        parent.adopt(&p);
    }
    ALL_PROCESSES.lock().push(p.clone());
    Ok(p)
}

/// Clone `p` for fork: a new child of `p` whose VM space is a
/// copy-on-write duplicate. The caller still clones the running thread.
pub fn clone(p: &Arc<Process>) -> KResult<Arc<Process>> {
    let new = alloc(Some(p))?;
    let result = p.with_vmspace(|parent_vs| {
        new.with_vmspace(|child_vs| parent_vs.clone_into(child_vs))
    });
    if let Err(e) = result {
        new.deref();
        return Err(e);
    }
    Ok(new)
}

/// Mark `p` zombie with `status` and wake any waiting parent.
pub fn exit(p: &Arc<Process>, status: u32) {
    p.lifecycle_lock().lock();
    p.exit_locked(status);
    p.lifecycle_lock().unlock();
    p.signal_exit();
}

/// Wait for any child of `parent` to become a zombie.
///
/// The harvested child is removed from the child list and returned with
/// its lifecycle lock held and its reference transferred to the caller;
/// the caller's final `deref` destroys it.
pub fn wait_and_lock(parent: &Arc<Process>) -> KResult<Arc<Process>> {
    loop {
        parent.lifecycle_lock().lock();
        let children = parent.children_snapshot();
        for child in children {
            child.lifecycle_lock().lock();
            if child.is_zombie() {
                parent.disown(child.id);
                parent.lifecycle_lock().unlock();
                return Ok(child);
            }
            child.lifecycle_lock().unlock();
        }
        parent.lifecycle_lock().unlock();

        // Nothing yet; sleep until some child exits.
        process_sleep().wait();
    }
}

/// Look up a process by id, taking a reference on the result.
pub fn lookup_by_id_and_ref(id: ProcessId) -> Option<Arc<Process>> {
    let all = ALL_PROCESSES.lock();
    let p = all.iter().find(|p| p.id == id)?;
    p.ref_();
    Some(p.clone())
}

/// Snapshot of all live processes.
pub fn all_processes() -> Vec<Arc<Process>> {
    ALL_PROCESSES.lock().clone()
}

fn destroy(p: &Arc<Process>) {
    let callbacks: Vec<ExitCallback> = EXIT_CALLBACKS.lock().clone();
    for cb in callbacks {
        cb(p);
    }

    p.with_handles(|h| h.close_all());
    // Tearing down the address space also drops the info page.
    p.with_vmspace(|vs| vs.cleanup());
    ALL_PROCESSES.lock().retain(|q| q.id != p.id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kern::handle::{Handle, HandleKind, DEFAULT_HANDLE_OPS};

    fn boot() {
        crate::kern::pcpu::test_boot();
        crate::mm::phys::test_pool();
    }

    #[test]
    fn test_alloc_maps_info_page_with_pid() {
        let _guard = crate::testsync::lock();
        boot();
        let p = alloc(None).unwrap();
        assert!(p.info_va() != 0);

        let mut pid = [0u8; 4];
        p.with_vmspace(|vs| vs.copy_in(p.info_va() + PROCINFO_PID_OFFSET, &mut pid))
            .unwrap();
        assert_eq!(u32::from_le_bytes(pid), p.id.0);
        p.deref();
    }

    #[test]
    fn test_args_validation() {
        let _guard = crate::testsync::lock();
        boot();
        let p = alloc(None).unwrap();
        // No double-NUL terminator
        assert_eq!(p.set_args(b"ls -l"), Err(Errno::BadLength));
        p.set_args(b"ls\0-l\0\0").unwrap();

        let mut buf = [0u8; 8];
        p.with_vmspace(|vs| vs.copy_in(p.info_va() + PROCINFO_ARGS_OFFSET, &mut buf))
            .unwrap();
        assert_eq!(&buf[..7], b"ls\0-l\0\0");
        p.deref();
    }

    #[test]
    fn test_child_inherits_environment_and_handles() {
        let _guard = crate::testsync::lock();
        boot();
        let parent = alloc(None).unwrap();
        parent.set_environment(b"PATH=/bin\0\0").unwrap();
        parent
            .with_handles(|h| h.alloc(Handle::new(HandleKind::File, &DEFAULT_HANDLE_OPS, 7)))
            .unwrap();

        let child = alloc(Some(&parent)).unwrap();
        let env = child.environment().unwrap();
        assert_eq!(&env[..11], b"PATH=/bin\0\0");
        child.with_handles(|h| {
            assert_eq!(h.get(0).unwrap().value, 7);
        });
        assert_eq!(parent.children_snapshot().len(), 1);

        child.deref();
        parent.deref();
    }

    #[test]
    fn test_fork_wait_harvests_zombie() {
        let _guard = crate::testsync::lock();
        boot();
        let parent = alloc(None).unwrap();
        let child = clone(&parent).unwrap();
        let child_id = child.id;

        exit(&child, 42);
        assert!(child.is_zombie());

        let harvested = wait_and_lock(&parent).unwrap();
        assert_eq!(harvested.id, child_id);
        assert_eq!(harvested.exit_status(), 42);
        harvested.lifecycle_lock().unlock();
        // Parent no longer lists the child
        assert!(parent.children_snapshot().is_empty());

        // Final deref tears the child down
        harvested.deref();
        assert!(lookup_by_id_and_ref(child_id).is_none());
        parent.deref();
    }

    #[test]
    fn test_clone_shares_vmspace_cow() {
        let _guard = crate::testsync::lock();
        boot();
        let parent = alloc(None).unwrap();
        let base = parent
            .with_vmspace(|vs| vs.map(PAGE_SIZE, vmflags::USER | vmflags::READ | vmflags::WRITE))
            .unwrap();
        parent.with_vmspace(|vs| vs.copy_out(base, &[0x5A])).unwrap();

        let child = clone(&parent).unwrap();
        let mut got = [0u8; 1];
        child.with_vmspace(|vs| vs.copy_in(base, &mut got)).unwrap();
        assert_eq!(got[0], 0x5A);

        // The info page is not cloned: the child sees its own pid there
        let mut pid = [0u8; 4];
        child
            .with_vmspace(|vs| vs.copy_in(child.info_va() + PROCINFO_PID_OFFSET, &mut pid))
            .unwrap();
        assert_eq!(u32::from_le_bytes(pid), child.id.0);
        child.deref();
        parent.deref();
    }

    #[test]
    fn test_init_callbacks_run_in_order() {
        let _guard = crate::testsync::lock();
        boot();
        use core::sync::atomic::AtomicU32;
        static SEEN: AtomicU32 = AtomicU32::new(0);
        fn first(_p: &Arc<Process>) -> KResult<()> {
            SEEN.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
        fn second(_p: &Arc<Process>) -> KResult<()> {
            SEEN.fetch_add(10, Ordering::Relaxed);
            Ok(())
        }
        register_init_callback(first);
        register_init_callback(second);
        let p = alloc(None).unwrap();
        assert_eq!(SEEN.load(Ordering::Relaxed), 11);
        unregister_init_callback(first);
        unregister_init_callback(second);
        p.deref();
    }
}
