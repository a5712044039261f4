//! Architecture-specific code
//!
//! The kernel core only talks to this module through the small surface
//! re-exported here: the machine context, the local interrupt flag, the
//! current-CPU accessor and a few instruction wrappers. Everything is
//! x86-64; the instruction-level pieces are compiled for bare-metal targets
//! and replaced by a software model elsewhere so the core stays testable.

pub mod x86_64;

pub use x86_64::{
    context_switch, cpu_id, halt, invlpg, relax, set_cpu_id, Context, IrqState,
};

pub use x86_64::interrupts;

/// Upper bound on the number of CPUs the kernel supports.
pub const MAX_CPUS: usize = 32;

/// Page size used by the paging hardware.
pub const PAGE_SIZE: usize = 4096;
