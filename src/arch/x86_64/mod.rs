//! x86-64 architecture support
//!
//! Provides the machine context used for thread switching, local interrupt
//! flag management, and the per-CPU identification register. On bare metal
//! the real instructions run; on hosted builds (tests) the same interfaces
//! are backed by a software model with identical semantics.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use super::MAX_CPUS;

/// Initial RFLAGS for a new context: interrupts enabled.
const RFLAGS_IF: u64 = 0x200;

// ============================================================================
// Machine context
// ============================================================================

/// Saved machine state of a thread that is not running.
///
/// Only the callee-saved registers, stack and instruction pointers and the
/// page-table root are kept; everything else lives on the thread's kernel
/// stack at switch time.
#[repr(C)]
#[derive(Debug, Clone)]
pub struct Context {
    pub rbx: u64,
    pub rbp: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    /// Stack pointer to resume from
    pub rsp: u64,
    /// Instruction pointer to resume at
    pub rip: u64,
    pub rflags: u64,
    /// Syscall/fork return value slot
    pub rax: u64,
    /// Page-table root (CR3) for user threads; 0 means kernel page tables
    pub cr3: u64,
    /// Top of the kernel stack, loaded into the TSS on switch
    pub kernel_rsp: u64,
}

impl Context {
    pub const fn new() -> Self {
        Self {
            rbx: 0,
            rbp: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
            rsp: 0,
            rip: 0,
            rflags: RFLAGS_IF,
            rax: 0,
            cr3: 0,
            kernel_rsp: 0,
        }
    }

    /// Context for a kernel thread entering `entry(arg)` on `stack_top`.
    pub fn kernel_entry(entry: usize, arg: usize, stack_top: u64) -> Self {
        let mut ctx = Self::new();
        ctx.rip = entry as u64;
        // Entry argument is passed in a callee-saved register; the entry
        // trampoline moves it into rdi before calling the thread body.
        ctx.r12 = arg as u64;
        ctx.rsp = stack_top;
        ctx.kernel_rsp = stack_top;
        ctx
    }

    /// Context for a user thread entering `entry` with the given user stack.
    pub fn user_entry(entry: u64, user_sp: u64, kernel_stack_top: u64) -> Self {
        let mut ctx = Self::new();
        ctx.rip = entry;
        ctx.rsp = user_sp;
        ctx.kernel_rsp = kernel_stack_top;
        ctx
    }

    /// Copy of `parent` resuming with `retval` as the syscall result.
    pub fn cloned_from(parent: &Context, retval: u64, kernel_stack_top: u64) -> Self {
        let mut ctx = parent.clone();
        ctx.rax = retval;
        ctx.kernel_rsp = kernel_stack_top;
        ctx
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Context switch
// ============================================================================

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
core::arch::global_asm!(
    ".global basalt_context_switch",
    "basalt_context_switch:",
    // Save callee-saved state into *prev (rdi)
    "mov [rdi + 0x00], rbx",
    "mov [rdi + 0x08], rbp",
    "mov [rdi + 0x10], r12",
    "mov [rdi + 0x18], r13",
    "mov [rdi + 0x20], r14",
    "mov [rdi + 0x28], r15",
    "mov [rdi + 0x30], rsp",
    "lea rax, [rip + 2f]",
    "mov [rdi + 0x38], rax",
    "pushfq",
    "pop rax",
    "mov [rdi + 0x40], rax",
    // Load *next (rsi)
    "mov rax, [rsi + 0x50]",
    "test rax, rax",
    "jz 1f",
    "mov cr3, rax",
    "1:",
    "mov rbx, [rsi + 0x00]",
    "mov rbp, [rsi + 0x08]",
    "mov r12, [rsi + 0x10]",
    "mov r13, [rsi + 0x18]",
    "mov r14, [rsi + 0x20]",
    "mov r15, [rsi + 0x28]",
    "mov rsp, [rsi + 0x30]",
    "mov rax, [rsi + 0x40]",
    "push rax",
    "popfq",
    "mov rax, [rsi + 0x48]",
    "jmp qword ptr [rsi + 0x38]",
    "2:",
    "ret",
);

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
extern "C" {
    fn basalt_context_switch(prev: *mut Context, next: *const Context);
}

/// Switch from the context at `prev` to the one at `next`.
///
/// Returns when some CPU later switches back to `prev`. The caller must
/// guarantee both pointers stay valid for the lifetime of the switched-out
/// thread and that no locks guarding either context are held.
///
/// # Safety
///
/// `prev` and `next` must point at contexts owned by live threads; `next`
/// must not be running on any other CPU.
pub unsafe fn context_switch(prev: *mut Context, next: *const Context) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    basalt_context_switch(prev, next);

    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        // Hosted model: record the hand-off without moving the stack.
        let _ = (prev, next);
        SWITCH_COUNT.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
static SWITCH_COUNT: AtomicU64 = AtomicU64::new(0);

/// Number of context switches recorded by the hosted model.
#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
pub fn switch_count() -> u64 {
    SWITCH_COUNT.load(Ordering::Relaxed)
}

// ============================================================================
// Interrupt flag
// ============================================================================

/// Saved interrupt state returned by `interrupts::save_and_disable`.
#[derive(Debug, Clone, Copy)]
#[must_use = "dropping the state loses the previous interrupt flag"]
pub struct IrqState(bool);

/// Local interrupt flag management.
///
/// A per-CPU shadow of the IF flag is kept in software; on bare metal the
/// real flag is driven alongside it. The shadow is what makes the
/// save/restore token verifiable under test.
pub mod interrupts {
    use super::*;

    static IF_SHADOW: [AtomicBool; MAX_CPUS] = [const { AtomicBool::new(true) }; MAX_CPUS];

    fn shadow() -> &'static AtomicBool {
        &IF_SHADOW[super::cpu_id() as usize % MAX_CPUS]
    }

    /// Whether interrupts are enabled on this CPU.
    pub fn enabled() -> bool {
        shadow().load(Ordering::Relaxed)
    }

    /// Enable interrupts on this CPU.
    pub fn enable() {
        shadow().store(true, Ordering::Relaxed);
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        unsafe {
            core::arch::asm!("sti", options(nomem, nostack));
        }
    }

    /// Disable interrupts on this CPU.
    pub fn disable() {
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        unsafe {
            core::arch::asm!("cli", options(nomem, nostack));
        }
        shadow().store(false, Ordering::Relaxed);
    }

    /// Disable interrupts, returning the previous state for `restore`.
    pub fn save_and_disable() -> IrqState {
        let was = shadow().swap(false, Ordering::Relaxed);
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        unsafe {
            core::arch::asm!("cli", options(nomem, nostack));
        }
        IrqState(was)
    }

    /// Restore the interrupt state saved by `save_and_disable`.
    pub fn restore(state: IrqState) {
        if state.0 {
            enable();
        } else {
            disable();
        }
    }
}

// ============================================================================
// CPU identification
// ============================================================================

// Bring-up stores each CPU's logical id in IA32_TSC_AUX so it survives
// without a per-CPU segment; hosted builds keep it in a plain register.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
const IA32_TSC_AUX: u32 = 0xC000_0103;

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
static SOFT_CPU_ID: AtomicU32 = AtomicU32::new(0);

/// Logical id of the CPU executing this code.
pub fn cpu_id() -> u32 {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    unsafe {
        let aux: u32;
        core::arch::asm!("rdpid rax", out("rax") aux, options(nomem, nostack));
        aux
    }

    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    SOFT_CPU_ID.load(Ordering::Relaxed)
}

/// Record the logical id of the calling CPU; done once per CPU at bring-up.
pub fn set_cpu_id(id: u32) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    unsafe {
        core::arch::asm!(
            "wrmsr",
            in("ecx") IA32_TSC_AUX,
            in("eax") id,
            in("edx") 0u32,
            options(nomem, nostack),
        );
    }

    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    SOFT_CPU_ID.store(id, Ordering::Relaxed);
}

// ============================================================================
// Misc instructions
// ============================================================================

/// CPU relaxation hint for busy-wait loops and the idle thread.
pub fn relax() {
    core::hint::spin_loop();
}

/// Stop this CPU permanently.
pub fn halt() -> ! {
    loop {
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        unsafe {
            core::arch::asm!("hlt", options(nomem, nostack));
        }
        relax();
    }
}

/// Invalidate the TLB entry covering `virt`.
pub fn invlpg(virt: u64) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) virt, options(nostack));
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    let _ = virt;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_irq_save_restore() {
        interrupts::enable();
        assert!(interrupts::enabled());

        let state = interrupts::save_and_disable();
        assert!(!interrupts::enabled());

        // Nested save observes the disabled state and restores to it
        let nested = interrupts::save_and_disable();
        interrupts::restore(nested);
        assert!(!interrupts::enabled());

        interrupts::restore(state);
        assert!(interrupts::enabled());
    }

    #[test]
    fn test_kernel_entry_context() {
        fn body() {}
        let ctx = Context::kernel_entry(body as usize, 7, 0x8000);
        assert_eq!(ctx.rsp, 0x8000);
        assert_eq!(ctx.r12, 7);
        assert_eq!(ctx.rflags & RFLAGS_IF, RFLAGS_IF);
    }

    #[test]
    fn test_cloned_context_retval() {
        let mut parent = Context::new();
        parent.rbx = 11;
        parent.rax = 99;
        let child = Context::cloned_from(&parent, 0, 0x9000);
        assert_eq!(child.rbx, 11);
        assert_eq!(child.rax, 0);
        assert_eq!(child.kernel_rsp, 0x9000);
    }
}
