//! Interrupt dispatch
//!
//! Drivers register interrupt sources (a vector range plus mask/unmask/ack
//! operations) and per-vector handlers. The low-level entry stubs funnel
//! into `irq_handle`; the return path is the kernel's only preemption
//! point: a pending reschedule request on the current thread is honored
//! once the outermost handler unwinds.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use spin::Mutex;

use crate::errno::{Errno, KResult};
use crate::kern::pcpu;
use crate::kern::sched;
use crate::kern::thread::{make_exit_code, ExitReason};
use crate::mm::vmspace::vmflags;

/// What kind of event a handler serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqType {
    Device,
    Ipi,
    Timer,
}

/// Controller operations for a range of vectors.
pub struct IrqSourceOps {
    pub mask: fn(u32),
    pub unmask: fn(u32),
    pub ack: fn(u32),
}

/// A registered interrupt source covering `[base, base + count)`.
pub struct IrqSource {
    pub base: u32,
    pub count: u32,
    pub ops: &'static IrqSourceOps,
}

/// A vector handler.
pub type IrqHandler = fn(u32);

struct Registration {
    handler: IrqHandler,
    irq_type: IrqType,
}

static SOURCES: Mutex<Vec<IrqSource>> = Mutex::new(Vec::new());
static HANDLERS: Mutex<BTreeMap<u32, Vec<Registration>>> = Mutex::new(BTreeMap::new());

/// Register an interrupt source for a vector range.
pub fn register_irq_source(source: IrqSource) -> KResult<()> {
    let mut sources = SOURCES.lock();
    let end = source.base + source.count;
    for s in sources.iter() {
        if source.base < s.base + s.count && s.base < end {
            return Err(Errno::Invalid);
        }
    }
    sources.push(source);
    Ok(())
}

/// Register a handler for `vector`; the vector must belong to a source.
pub fn irq_register(vector: u32, handler: IrqHandler, irq_type: IrqType) -> KResult<()> {
    if !source_covers(vector) {
        return Err(Errno::NotFound);
    }
    HANDLERS
        .lock()
        .entry(vector)
        .or_default()
        .push(Registration { handler, irq_type });
    if irq_type == IrqType::Device {
        with_source(vector, |s| (s.ops.unmask)(vector));
    }
    Ok(())
}

fn source_covers(vector: u32) -> bool {
    SOURCES
        .lock()
        .iter()
        .any(|s| vector >= s.base && vector < s.base + s.count)
}

fn with_source(vector: u32, f: impl FnOnce(&IrqSource)) {
    let sources = SOURCES.lock();
    if let Some(s) = sources.iter().find(|s| vector >= s.base && vector < s.base + s.count) {
        f(s);
    }
}

/// Entry from the low-level interrupt stubs.
pub fn irq_handle(vector: u32) {
    let pc = pcpu::current();
    pc.irq_enter();

    with_source(vector, |s| (s.ops.ack)(vector));

    let handlers: Vec<IrqHandler> = {
        let map = HANDLERS.lock();
        map.get(&vector)
            .map(|regs| regs.iter().map(|r| r.handler).collect())
            .unwrap_or_default()
    };
    for handler in handlers {
        handler(vector);
    }

    pc.irq_exit();
}

/// The interrupt return path: the only preemption point. Called by the
/// entry stub after `irq_handle`, with interrupts still disabled, once the
/// nesting level has dropped to zero.
pub fn on_interrupt_return() {
    if pcpu::in_interrupt() {
        return;
    }
    if sched::scheduler().is_active() && sched::want_reschedule() {
        sched::schedule();
    }
}

/// Number of handlers registered for a vector.
pub fn handler_count(vector: u32) -> usize {
    HANDLERS.lock().get(&vector).map(Vec::len).unwrap_or(0)
}

/// Types registered on a vector, for the debugger.
pub fn vector_types(vector: u32) -> Vec<IrqType> {
    HANDLERS
        .lock()
        .get(&vector)
        .map(|regs| regs.iter().map(|r| r.irq_type).collect())
        .unwrap_or_default()
}

// ============================================================================
// Fault entry
// ============================================================================

/// Entry from the page-fault exception stub.
///
/// Resolves the fault against the current process's address space. An
/// unresolvable user-mode fault terminates the process with a fault exit
/// code; an unresolvable kernel-mode fault is fatal.
pub fn on_page_fault(virt: u64, access: u32) -> KResult<()> {
    let cur = pcpu::current_thread();
    let proc = match cur.process() {
        Some(p) => p,
        None => panic!("kernel page fault at {:#x}", virt),
    };

    let result = proc.with_vmspace(|vs| crate::mm::handle_fault(vs, virt, access));
    match result {
        Ok(()) => Ok(()),
        Err(e) => {
            if access & vmflags::USER != 0 {
                cur.terminate(make_exit_code(ExitReason::Fault, e.code() as u32));
            }
            panic!("unrecoverable kernel fault at {:#x}: {:?}", virt, e);
        }
    }
}

/// Convenience for exception stubs that cannot recover at all.
pub fn fault_current_thread(code: u32) -> ! {
    let cur = pcpu::current_thread();
    cur.terminate(make_exit_code(ExitReason::Fault, code));
}
