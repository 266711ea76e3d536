//! RISC-V 64 supervisor-mode support.

pub mod boot;
pub mod context;
pub mod sbi;
pub mod timer;
pub mod trap;

/// RAII guard restoring the interrupt-enable state it captured.
pub struct InterruptGuard {
    was_enabled: bool,
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        if self.was_enabled {
            enable_interrupts();
        }
    }
}

/// Set `sstatus.SIE`.
#[inline]
pub fn enable_interrupts() {
    #[cfg(target_arch = "riscv64")]
    {
        // SAFETY: setting SIE only permits supervisor interrupt delivery.
        unsafe { riscv::register::sstatus::set_sie() };
    }
}

/// Clear `sstatus.SIE` and return a guard that restores the previous state.
#[inline]
pub fn disable_interrupts() -> InterruptGuard {
    #[cfg(target_arch = "riscv64")]
    {
        let was_enabled = riscv::register::sstatus::read().sie();
        // SAFETY: clearing SIE only defers supervisor interrupt delivery.
        unsafe { riscv::register::sstatus::clear_sie() };
        InterruptGuard { was_enabled }
    }

    #[cfg(not(target_arch = "riscv64"))]
    {
        InterruptGuard { was_enabled: false }
    }
}

/// `wfi`: stall until an interrupt is pending.
#[inline]
pub fn wait_for_interrupt() {
    #[cfg(target_arch = "riscv64")]
    {
        riscv::asm::wfi();
    }

    #[cfg(not(target_arch = "riscv64"))]
    {
        core::hint::spin_loop();
    }
}

/// Park the hart forever with interrupts off.
pub fn halt() -> ! {
    let _guard = disable_interrupts();
    loop {
        wait_for_interrupt();
    }
}

/// Current value of the `time` CSR (timebase cycles since boot).
#[inline]
pub fn read_time() -> u64 {
    #[cfg(target_arch = "riscv64")]
    {
        riscv::register::time::read64()
    }

    #[cfg(not(target_arch = "riscv64"))]
    {
        0
    }
}
