//! Syscall entries into the kernel core
//!
//! Only the calls that reach the execution core live here: process
//! cloning, exit, wait, sleep, anonymous mappings, and the polling select
//! loop. Argument marshalling from user registers happens in the syscall
//! stubs; these functions take already-decoded values.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::errno::{Errno, KResult};
use crate::kern::pcpu;
use crate::kern::process::{self, Process};
use crate::kern::thread::{self, make_exit_code, ExitReason, Thread};
use crate::mm::vmspace::vmflags;
use crate::types::ProcessId;

fn current_process() -> KResult<Arc<Process>> {
    pcpu::current_thread().process().ok_or(Errno::Invalid)
}

/// Fork the current process. Returns the child's pid to the parent; the
/// child thread resumes with a syscall result of zero.
pub fn sys_clone(clone_flags: u32) -> KResult<ProcessId> {
    if clone_flags != 0 {
        return Err(Errno::BadFlag);
    }
    let proc = current_process()?;

    let new_proc = process::clone(&proc)?;
    let new_thread = match Thread::clone_into(&new_proc) {
        Ok(t) => t,
        Err(e) => {
            new_proc.deref();
            return Err(e);
        }
    };
    let pid = new_proc.id;

    // The clone observes a zero return value when it first runs.
    new_thread.resume();
    Ok(pid)
}

/// Terminate the current thread with a syscall exit code.
pub fn sys_exit(status: u32) -> ! {
    let cur = pcpu::current_thread();
    cur.terminate(make_exit_code(ExitReason::Syscall, status))
}

/// Wait for any child to exit; returns its pid and exit status. The
/// harvested zombie is destroyed here.
pub fn sys_wait() -> KResult<(ProcessId, u32)> {
    let proc = current_process()?;
    let child = process::wait_and_lock(&proc)?;
    let result = (child.id, child.exit_status());
    child.lifecycle_lock().unlock();
    child.deref();
    Ok(result)
}

/// Sleep for at least `ms` milliseconds.
pub fn sys_sleep(ms: u64) {
    thread::thread_sleep_ms(ms);
}

/// Map `len` bytes of anonymous memory into the current process.
pub fn sys_mmap(len: usize, prot: u32) -> KResult<u64> {
    if prot & !(vmflags::READ | vmflags::WRITE | vmflags::EXECUTE | vmflags::SHARED) != 0 {
        return Err(Errno::BadFlag);
    }
    let proc = current_process()?;
    proc.with_vmspace(|vs| vs.map(len, prot | vmflags::USER))
}

/// Remove the mapping based at `virt` from the current process.
pub fn sys_munmap(virt: u64) -> KResult<()> {
    let proc = current_process()?;
    proc.with_vmspace(|vs| vs.unmap(virt))
}

/// Which readiness classes `sys_select` polls.
#[derive(Debug, Default)]
pub struct SelectRequest {
    pub read: Vec<usize>,
    pub write: Vec<usize>,
    pub except: Vec<usize>,
}

/// Slots that reported ready, per class.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SelectResult {
    pub read: Vec<usize>,
    pub write: Vec<usize>,
    pub except: Vec<usize>,
}

impl SelectResult {
    pub fn count(&self) -> usize {
        self.read.len() + self.write.len() + self.except.len()
    }
}

/// Poll handles for readiness, sleeping 10 ms between scans until at
/// least one slot reports ready. Every polled handle must support the
/// requested operation.
pub fn sys_select(request: &SelectRequest) -> KResult<SelectResult> {
    let proc = current_process()?;

    // Validate up front, like the scan order below.
    proc.with_handles(|handles| {
        for &slot in request.read.iter() {
            if handles.get(slot)?.ops.can_read.is_none() {
                return Err(Errno::Invalid);
            }
        }
        for &slot in request.write.iter() {
            if handles.get(slot)?.ops.can_write.is_none() {
                return Err(Errno::Invalid);
            }
        }
        for &slot in request.except.iter() {
            if handles.get(slot)?.ops.has_except.is_none() {
                return Err(Errno::Invalid);
            }
        }
        Ok(())
    })?;

    loop {
        let result = proc.with_handles(|handles| -> KResult<SelectResult> {
            let mut result = SelectResult::default();
            for &slot in request.read.iter() {
                let h = handles.get(slot)?;
                if (h.ops.can_read.unwrap())(h) {
                    result.read.push(slot);
                }
            }
            for &slot in request.write.iter() {
                let h = handles.get(slot)?;
                if (h.ops.can_write.unwrap())(h) {
                    result.write.push(slot);
                }
            }
            for &slot in request.except.iter() {
                let h = handles.get(slot)?;
                if (h.ops.has_except.unwrap())(h) {
                    result.except.push(slot);
                }
            }
            Ok(result)
        })?;

        if result.count() > 0 {
            return Ok(result);
        }

        // No events yet; poll again after a tick's worth of sleep.
        thread::thread_sleep_ms(10);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kern::handle::{Handle, HandleKind, HandleOps};

    fn ready(_h: &Handle) -> bool {
        true
    }
    fn not_ready(_h: &Handle) -> bool {
        false
    }

    static POLLABLE_OPS: HandleOps = HandleOps {
        clone: None,
        free: None,
        can_read: Some(ready),
        can_write: Some(not_ready),
        has_except: Some(not_ready),
    };

    static PLAIN_OPS: HandleOps = HandleOps {
        clone: None,
        free: None,
        can_read: None,
        can_write: None,
        has_except: None,
    };

    /// Install a fresh process with one user thread as the current thread.
    fn boot_user_process(name: &str) -> (Arc<Process>, Arc<Thread>) {
        crate::kern::pcpu::test_boot();
        crate::mm::phys::test_pool();
        let p = process::alloc(None).unwrap();
        let t = Thread::alloc(&p, name, thread::AllocKind::Default).unwrap();
        crate::kern::pcpu::current().set_current_thread(t.clone());
        (p, t)
    }

    fn restore_boot_thread() {
        crate::kern::pcpu::test_boot();
    }

    #[test]
    fn test_clone_then_wait_returns_pid_and_status() {
        let _guard = crate::testsync::lock();
        let (parent, _pt) = boot_user_process("init");

        let pid = sys_clone(0).unwrap();
        assert_ne!(pid, parent.id);

        let child = process::lookup_by_id_and_ref(pid).unwrap();
        // The cloned thread sits on the runqueue, ready to go
        let child_thread = child.main_thread().unwrap();
        assert!(!child_thread.has_flags(crate::kern::thread::flags::SUSPENDED));

        // The child exits; the parent harvests pid and status
        process::exit(&child, 42);
        let (got_pid, status) = sys_wait().unwrap();
        assert_eq!(got_pid, pid);
        assert_eq!(status, 42);

        child.deref();
        assert!(process::lookup_by_id_and_ref(pid).is_none());
        parent.deref();
        restore_boot_thread();
    }

    #[test]
    fn test_clone_rejects_flags() {
        let _guard = crate::testsync::lock();
        let (parent, _t) = boot_user_process("flags");
        assert_eq!(sys_clone(0xdead).err(), Some(Errno::BadFlag));
        parent.deref();
        restore_boot_thread();
    }

    #[test]
    fn test_mmap_munmap_round_trip() {
        let _guard = crate::testsync::lock();
        let (parent, _t) = boot_user_process("mapper");

        let base = sys_mmap(8192, vmflags::READ | vmflags::WRITE).unwrap();
        parent.with_vmspace(|vs| {
            let area = vs.area_containing(base).unwrap();
            assert!(area.flags & vmflags::USER != 0);
        });
        // Untouched areas unmap cleanly
        sys_munmap(base).unwrap();
        assert_eq!(sys_munmap(base).err(), Some(Errno::NotFound));

        // A resident page blocks the unmap for now
        let base = sys_mmap(4096, vmflags::READ | vmflags::WRITE).unwrap();
        parent.with_vmspace(|vs| vs.copy_out(base, &[1])).unwrap();
        assert_eq!(sys_munmap(base).err(), Some(Errno::Unsupported));

        assert_eq!(sys_mmap(4096, 0x8000_0000).err(), Some(Errno::BadFlag));
        parent.deref();
        restore_boot_thread();
    }

    #[test]
    fn test_select_returns_ready_slots() {
        let _guard = crate::testsync::lock();
        let (parent, _t) = boot_user_process("poller");
        let slot = parent
            .with_handles(|h| h.alloc(Handle::new(HandleKind::Socket, &POLLABLE_OPS, 0)))
            .unwrap();

        let request = SelectRequest {
            read: alloc::vec![slot],
            write: alloc::vec![slot],
            except: alloc::vec![slot],
        };
        let result = sys_select(&request).unwrap();
        assert_eq!(result.read, alloc::vec![slot]);
        assert!(result.write.is_empty());
        assert!(result.except.is_empty());
        assert_eq!(result.count(), 1);

        parent.deref();
        restore_boot_thread();
    }

    #[test]
    fn test_select_rejects_unpollable_handle() {
        let _guard = crate::testsync::lock();
        let (parent, _t) = boot_user_process("badpoll");
        let slot = parent
            .with_handles(|h| h.alloc(Handle::new(HandleKind::File, &PLAIN_OPS, 0)))
            .unwrap();

        let request = SelectRequest {
            read: alloc::vec![slot],
            ..Default::default()
        };
        assert_eq!(sys_select(&request).err(), Some(Errno::Invalid));

        let request = SelectRequest {
            read: alloc::vec![slot + 40],
            ..Default::default()
        };
        assert_eq!(sys_select(&request).err(), Some(Errno::BadHandle));

        parent.deref();
        restore_boot_thread();
    }
}
