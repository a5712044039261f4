//! Inter-processor interrupts
//!
//! Two vectors do all the cross-CPU work: `Schedule` asks the target to
//! re-evaluate its runqueue on the next interrupt return, `Panic` stops it
//! for good. A third vector is reserved. The vectors register as a normal
//! interrupt source; the actual ICR write belongs to the APIC driver,
//! which installs itself as the transport. Delivery needs no
//! acknowledgement: the handlers do the minimum work and return.

use spin::Mutex;

use crate::arch;
use crate::errno::KResult;
use crate::kern::irq::{self, IrqSource, IrqSourceOps, IrqType};
use crate::kern::pcpu;
use crate::kern::thread::flags;

/// First vector of the IPI block.
pub const IPI_BASE: u32 = 0xf5;

/// The IPI vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum IpiVector {
    /// Request a reschedule on the target CPU
    Schedule = IPI_BASE,
    /// Halt the target CPU
    Panic = IPI_BASE + 1,
    /// Reserved for future use
    Reserved = IPI_BASE + 2,
}

/// How IPIs leave this CPU. The APIC driver registers the real thing
/// (fixed-delivery ICR writes); tests substitute their own.
pub struct IpiTransport {
    /// Deliver `vector` to one CPU.
    pub send: fn(target_cpu: u32, vector: u32),
    /// Deliver `vector` to every CPU except the sender; `include_self`
    /// loops it back as well.
    pub broadcast: fn(vector: u32, include_self: bool),
}

static TRANSPORT: Mutex<Option<&'static IpiTransport>> = Mutex::new(None);

/// Install the transport; called by the interrupt-controller driver.
pub fn set_transport(transport: &'static IpiTransport) {
    *TRANSPORT.lock() = Some(transport);
}

/// Deliver a vector to one CPU.
pub fn send(target_cpu: u32, vector: IpiVector) {
    let transport = *TRANSPORT.lock();
    match transport {
        Some(t) => (t.send)(target_cpu, vector as u32),
        None => deliver_locally(target_cpu, vector),
    }
}

/// Deliver a vector to every CPU but this one.
pub fn send_others(vector: IpiVector) {
    let transport = *TRANSPORT.lock();
    match transport {
        Some(t) => (t.broadcast)(vector as u32, false),
        None => {
            let self_id = arch::cpu_id();
            for pc in pcpu::all() {
                if pc.id() != self_id {
                    deliver_locally(pc.id(), vector);
                }
            }
        }
    }
}

/// Deliver a vector to every CPU including this one.
pub fn broadcast(vector: IpiVector) {
    let transport = *TRANSPORT.lock();
    match transport {
        Some(t) => (t.broadcast)(vector as u32, true),
        None => {
            for pc in pcpu::all() {
                deliver_locally(pc.id(), vector);
            }
        }
    }
}

/// Transport-less delivery: perform the target handler's effect directly.
/// Keeps single-CPU bring-up and tests working before an APIC exists.
fn deliver_locally(target_cpu: u32, vector: IpiVector) {
    match vector {
        IpiVector::Schedule => {
            if let Some(t) = pcpu::get(target_cpu).current_thread() {
                t.set_flags(flags::RESCHEDULE);
            }
        }
        IpiVector::Panic => {
            if target_cpu == arch::cpu_id() {
                arch::halt();
            }
            // A remote CPU without a transport cannot be stopped from
            // here; it halts when it next handles the panic vector.
        }
        IpiVector::Reserved => {}
    }
}

// ============================================================================
// Handlers
// ============================================================================

fn ipi_schedule_handler(_vector: u32) {
    // Minimum work: flag the current thread and let the interrupt return
    // path do the actual switch.
    crate::kern::sched::request_reschedule();
}

fn ipi_panic_handler(_vector: u32) {
    arch::halt();
}

fn nop(_v: u32) {}

static IPI_SOURCE_OPS: IrqSourceOps = IrqSourceOps {
    mask: nop,
    unmask: nop,
    ack: nop,
};

/// Register the IPI vectors as an interrupt source.
pub fn init() -> KResult<()> {
    irq::register_irq_source(IrqSource {
        base: IPI_BASE,
        count: 3,
        ops: &IPI_SOURCE_OPS,
    })?;
    irq::irq_register(IpiVector::Schedule as u32, ipi_schedule_handler, IrqType::Ipi)?;
    irq::irq_register(IpiVector::Panic as u32, ipi_panic_handler, IrqType::Ipi)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_local_schedule_delivery_flags_current() {
        let _guard = crate::testsync::lock();
        let boot = pcpu::test_boot();
        boot.clear_flags(flags::RESCHEDULE);

        broadcast(IpiVector::Schedule);
        assert!(boot.has_flags(flags::RESCHEDULE));
        boot.clear_flags(flags::RESCHEDULE);

        // send_others skips the only CPU there is
        send_others(IpiVector::Schedule);
        assert!(!boot.has_flags(flags::RESCHEDULE));
    }

    #[test]
    fn test_transport_is_preferred() {
        let _guard = crate::testsync::lock();
        pcpu::test_boot();
        static SENT: AtomicU32 = AtomicU32::new(0);

        fn send_stub(_cpu: u32, _vector: u32) {
            SENT.fetch_add(1, Ordering::Relaxed);
        }
        fn broadcast_stub(_vector: u32, _include_self: bool) {
            SENT.fetch_add(100, Ordering::Relaxed);
        }
        static STUB: IpiTransport = IpiTransport {
            send: send_stub,
            broadcast: broadcast_stub,
        };

        set_transport(&STUB);
        send(0, IpiVector::Schedule);
        broadcast(IpiVector::Panic);
        assert_eq!(SENT.load(Ordering::Relaxed), 101);
        *TRANSPORT.lock() = None;
    }
}
