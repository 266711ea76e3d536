//! Boot entry point.
//!
//! The M-mode firmware (OpenSBI) jumps here in S-mode with the hart id in
//! `a0` and a device-tree pointer in `a1`. The entry stub is the boot
//! preamble the rest of the kernel assumes: it installs the boot stack and
//! clears `.bss`, then transfers to `kmain` and never returns.
//!
//! The memory layout (`0x8020_0000` load address, `__bss_start`,
//! `__bss_end`, `__stack_top`, `__kernel_end`) comes from
//! `arch/riscv64/linker.ld`.

#[cfg(target_arch = "riscv64")]
core::arch::global_asm!(
    r#"
    .section .text.entry
    .globl _start
_start:
    la      sp, __stack_top
    la      t0, __bss_start
    la      t1, __bss_end
1:
    bgeu    t0, t1, 2f
    sd      zero, 0(t0)
    addi    t0, t0, 8
    j       1b
2:
    call    kmain
3:
    wfi
    j       3b
"#
);

/// First physical address past the loaded kernel image (page-aligned by the
/// linker script). Physical memory management begins here.
#[cfg(target_arch = "riscv64")]
pub fn kernel_end() -> usize {
    extern "C" {
        static __kernel_end: u8;
    }
    // SAFETY: __kernel_end is a linker-provided symbol; only its address is
    // taken, it is never dereferenced.
    unsafe { &__kernel_end as *const u8 as usize }
}

/// First physical address of the kernel image.
#[cfg(target_arch = "riscv64")]
pub fn kernel_start() -> usize {
    extern "C" {
        static __kernel_start: u8;
    }
    // SAFETY: address-of only, never dereferenced.
    unsafe { &__kernel_start as *const u8 as usize }
}
