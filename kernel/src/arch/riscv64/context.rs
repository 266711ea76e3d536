//! Kernel context switching.
//!
//! A [`Context`] holds the callee-saved register state of a suspended
//! kernel execution: `ra`, `sp`, and `s0`-`s11`. Caller-saved registers are
//! dead across the `context_switch` call boundary by the RISC-V calling
//! convention, so they are not stored.

/// Saved kernel execution context (callee-saved registers only).
#[repr(C)]
#[derive(Debug, Clone)]
pub struct Context {
    /// Return address: where the context resumes when switched to
    pub ra: u64,
    /// Kernel stack pointer
    pub sp: u64,
    /// Saved registers s0-s11
    pub s: [u64; 12],
}

impl Context {
    pub const fn zeroed() -> Self {
        Self {
            ra: 0,
            sp: 0,
            s: [0; 12],
        }
    }
}

#[cfg(target_arch = "riscv64")]
core::arch::global_asm!(
    r#"
    # __context_switch(a0: *mut Context old, a1: *const Context new)
    #
    # Stores the callee-saved state of the current execution into *old and
    # resumes *new. Returns (into the new context's ra) with the new stack.
    .globl __context_switch
__context_switch:
    sd      ra, 0(a0)
    sd      sp, 8(a0)
    sd      s0, 16(a0)
    sd      s1, 24(a0)
    sd      s2, 32(a0)
    sd      s3, 40(a0)
    sd      s4, 48(a0)
    sd      s5, 56(a0)
    sd      s6, 64(a0)
    sd      s7, 72(a0)
    sd      s8, 80(a0)
    sd      s9, 88(a0)
    sd      s10, 96(a0)
    sd      s11, 104(a0)

    ld      ra, 0(a1)
    ld      sp, 8(a1)
    ld      s0, 16(a1)
    ld      s1, 24(a1)
    ld      s2, 32(a1)
    ld      s3, 40(a1)
    ld      s4, 48(a1)
    ld      s5, 56(a1)
    ld      s6, 64(a1)
    ld      s7, 72(a1)
    ld      s8, 80(a1)
    ld      s9, 88(a1)
    ld      s10, 96(a1)
    ld      s11, 104(a1)
    ret
"#
);

/// Switch kernel execution from `old` to `new`.
///
/// # Safety
///
/// Both pointers must reference valid [`Context`] values; `new` must have
/// been produced by a prior switch or seeded with a valid `ra`/`sp` pair.
/// Must be called with interrupts disabled: the switch manipulates the
/// stack pointer non-atomically.
#[inline]
pub unsafe fn context_switch(old: *mut Context, new: *const Context) {
    #[cfg(target_arch = "riscv64")]
    {
        extern "C" {
            fn __context_switch(old: *mut Context, new: *const Context);
        }
        // SAFETY: contract forwarded to the caller.
        unsafe { __context_switch(old, new) };
    }

    #[cfg(not(target_arch = "riscv64"))]
    {
        let _ = (old, new);
        unreachable!("context_switch is only reachable on riscv64");
    }
}
