//! Memory barrier primitives.
//!
//! Centralizes every fence the kernel uses so that driver and memory code
//! never reach for inline assembly directly. Device ordering (MMIO register
//! access, virtqueue ring updates) must go through these; the kernel never
//! relies on implicit ordering of volatile accesses.
//!
//! # Barrier types
//!
//! * [`memory_fence`] -- full `fence rw, rw` (strongest).
//! * [`write_fence`] -- store-ordering `fence w, w`.
//! * [`read_fence`] -- load-ordering `fence r, r`.
//! * [`io_fence`] -- device I/O fence, currently the full fence.
//! * [`instruction_fence`] -- `fence.i` instruction-stream synchronization.
//! * [`compiler_fence`] -- compiler-only reordering barrier, no instruction.
//!
//! Host (non-riscv64) builds lower each hardware fence to an atomic fence so
//! unit tests of code paths containing barriers behave identically.

use core::sync::atomic::{self, Ordering};

/// Full memory fence: all reads and writes before the fence are globally
/// visible before any read or write after it (`fence rw, rw`).
#[inline(always)]
pub fn memory_fence() {
    #[cfg(target_arch = "riscv64")]
    {
        // SAFETY: `fence rw, rw` only orders memory accesses; no other
        // side effects.
        unsafe {
            core::arch::asm!("fence rw, rw", options(nostack, nomem, preserves_flags));
        }
    }

    #[cfg(not(target_arch = "riscv64"))]
    {
        atomic::fence(Ordering::SeqCst);
    }
}

/// Store fence: all writes before the fence are visible before any write
/// after it (`fence w, w`).
#[inline(always)]
pub fn write_fence() {
    #[cfg(target_arch = "riscv64")]
    {
        // SAFETY: `fence w, w` only orders stores; no other side effects.
        unsafe {
            core::arch::asm!("fence w, w", options(nostack, nomem, preserves_flags));
        }
    }

    #[cfg(not(target_arch = "riscv64"))]
    {
        atomic::fence(Ordering::Release);
    }
}

/// Load fence: all reads before the fence complete before any read after it
/// (`fence r, r`).
#[inline(always)]
pub fn read_fence() {
    #[cfg(target_arch = "riscv64")]
    {
        // SAFETY: `fence r, r` only orders loads; no other side effects.
        unsafe {
            core::arch::asm!("fence r, r", options(nostack, nomem, preserves_flags));
        }
    }

    #[cfg(not(target_arch = "riscv64"))]
    {
        atomic::fence(Ordering::Acquire);
    }
}

/// Device I/O fence. The platform has no distinct I/O ordering channel, so
/// this is the full fence; kept separate so MMIO call sites read correctly.
#[inline(always)]
pub fn io_fence() {
    memory_fence();
}

/// Instruction-stream synchronization (`fence.i`). Required after writing
/// memory that will be executed, e.g. the user signal trampoline page.
#[inline(always)]
pub fn instruction_fence() {
    #[cfg(target_arch = "riscv64")]
    {
        // SAFETY: `fence.i` synchronizes the instruction and data streams.
        // No memory side effects.
        unsafe {
            core::arch::asm!("fence.i", options(nostack));
        }
    }

    #[cfg(not(target_arch = "riscv64"))]
    {
        atomic::fence(Ordering::SeqCst);
    }
}

/// Compiler-only barrier: prevents the compiler from reordering memory
/// accesses across this point without emitting any instruction.
#[inline(always)]
pub fn compiler_fence() {
    atomic::compiler_fence(Ordering::SeqCst);
}
