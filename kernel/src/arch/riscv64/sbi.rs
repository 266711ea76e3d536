//! SBI (Supervisor Binary Interface) calls.
//!
//! Wrappers over the `ecall` interface to the M-mode firmware. The kernel
//! relies on the TIME extension for the scheduler tick and SRST for
//! shutdown; everything else it drives directly through MMIO.

/// SBI extension IDs
const SBI_EXT_BASE: usize = 0x10;
const SBI_EXT_TIMER: usize = 0x54494D45; // "TIME"
const SBI_EXT_SRST: usize = 0x53525354; // "SRST"

/// SBI function IDs for the timer extension
const SBI_TIMER_SET_TIMER: usize = 0;

/// SBI return value
#[derive(Debug, Clone, Copy)]
pub struct SbiRet {
    pub error: isize,
    pub value: usize,
}

impl SbiRet {
    pub fn is_ok(&self) -> bool {
        self.error == 0
    }
}

/// Make an SBI call.
#[inline(always)]
#[allow(unused_variables)]
fn sbi_call(extension: usize, function: usize, arg0: usize, arg1: usize, arg2: usize) -> SbiRet {
    #[cfg(target_arch = "riscv64")]
    {
        let error: isize;
        let value: usize;

        // SAFETY: `ecall` transfers to the M-mode firmware using the SBI
        // calling convention; only a0/a1 are clobbered as outputs.
        unsafe {
            core::arch::asm!(
                "ecall",
                in("a0") arg0,
                in("a1") arg1,
                in("a2") arg2,
                in("a6") function,
                in("a7") extension,
                lateout("a0") error,
                lateout("a1") value,
            );
        }

        SbiRet { error, value }
    }

    #[cfg(not(target_arch = "riscv64"))]
    {
        SbiRet { error: 0, value: 0 }
    }
}

/// Program the next timer interrupt at absolute timebase value
/// `stime_value`.
pub fn set_timer(stime_value: u64) -> SbiRet {
    sbi_call(
        SBI_EXT_TIMER,
        SBI_TIMER_SET_TIMER,
        stime_value as usize,
        0,
        0,
    )
}

/// Check if an SBI extension is available.
pub fn probe_extension(extension_id: usize) -> bool {
    let ret = sbi_call(SBI_EXT_BASE, 3, extension_id, 0, 0);
    ret.value != 0
}

/// System shutdown through the SRST extension.
pub fn shutdown() -> ! {
    sbi_call(SBI_EXT_SRST, 0, 0, 0, 0);
    // SRST did not take; park the hart instead.
    super::halt()
}

/// Legacy console putchar, usable before the UART driver is up.
pub fn console_putchar(ch: u8) {
    sbi_call(0x01, 0, ch as usize, 0, 0);
}
