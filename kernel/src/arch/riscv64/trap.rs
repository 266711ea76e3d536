//! Supervisor trap entry and dispatch.
//!
//! The trap vector saves all 31 integer registers plus `sepc` and `sstatus`
//! into a [`TrapFrame`] carved on the kernel stack, then calls the Rust
//! dispatcher. Traps from user mode switch to the process kernel stack
//! through `sscratch`; `sscratch` is zero whenever the hart is already in
//! kernel mode.
//!
//! The same assembly also provides the return path: `__trap_return` enters
//! the restore sequence with `a0` pointing at a seeded [`TrapFrame`], which
//! is how new user processes (and fork children) first reach user mode.

use crate::process::signals;
use crate::syscall;

/// `sstatus.SPP`: privilege level the trap came from (0 = user).
pub const SSTATUS_SPP: u64 = 1 << 8;
/// `sstatus.SPIE`: interrupt-enable state to restore on `sret`.
pub const SSTATUS_SPIE: u64 = 1 << 5;
/// `sstatus.SIE`: supervisor interrupt enable.
pub const SSTATUS_SIE: u64 = 1 << 1;

/// Interrupt flag in `scause`.
pub const SCAUSE_INTERRUPT: u64 = 1 << 63;

/// `scause` interrupt codes.
pub const IRQ_S_SOFT: u64 = 1;
pub const IRQ_S_TIMER: u64 = 5;
pub const IRQ_S_EXTERNAL: u64 = 9;

/// `scause` exception codes.
pub const EXC_ILLEGAL_INSTRUCTION: u64 = 2;
pub const EXC_LOAD_ACCESS_FAULT: u64 = 5;
pub const EXC_STORE_ACCESS_FAULT: u64 = 7;
pub const EXC_ECALL_FROM_U: u64 = 8;
pub const EXC_ECALL_FROM_S: u64 = 9;
pub const EXC_INSTRUCTION_PAGE_FAULT: u64 = 12;
pub const EXC_LOAD_PAGE_FAULT: u64 = 13;
pub const EXC_STORE_PAGE_FAULT: u64 = 15;

/// Saved register state of an interrupted execution.
///
/// `regs[i]` holds `x(i + 1)`: `regs[0]` = `ra` (x1), `regs[1]` = `sp`
/// (x2), ..., `regs[30]` = `t6` (x31). The layout must match the offsets
/// used by the trap vector assembly.
#[repr(C)]
#[derive(Debug, Clone)]
pub struct TrapFrame {
    pub regs: [u64; 31],
    pub sepc: u64,
    pub sstatus: u64,
}

/// Size of the stack frame the trap vector carves (layout size rounded up
/// to 16-byte stack alignment).
pub const TRAP_FRAME_BYTES: usize = 272;

// Register indices into TrapFrame::regs.
pub const REG_RA: usize = 0; // x1
pub const REG_SP: usize = 1; // x2
pub const REG_S0: usize = 7; // x8
pub const REG_A0: usize = 9; // x10
pub const REG_A1: usize = 10; // x11
pub const REG_A2: usize = 11; // x12
pub const REG_A3: usize = 12; // x13
pub const REG_A4: usize = 13; // x14
pub const REG_A5: usize = 14; // x15
pub const REG_A6: usize = 15; // x16
pub const REG_A7: usize = 16; // x17

impl TrapFrame {
    pub const fn zeroed() -> Self {
        Self {
            regs: [0; 31],
            sepc: 0,
            sstatus: 0,
        }
    }

    pub fn a0(&self) -> u64 {
        self.regs[REG_A0]
    }

    pub fn set_a0(&mut self, v: u64) {
        self.regs[REG_A0] = v;
    }

    pub fn arg(&self, n: usize) -> u64 {
        debug_assert!(n < 6);
        self.regs[REG_A0 + n]
    }

    pub fn syscall_number(&self) -> u64 {
        self.regs[REG_A7]
    }

    pub fn sp(&self) -> u64 {
        self.regs[REG_SP]
    }

    pub fn set_sp(&mut self, v: u64) {
        self.regs[REG_SP] = v;
    }

    /// True if the trap was taken from user mode.
    pub fn from_user(&self) -> bool {
        self.sstatus & SSTATUS_SPP == 0
    }
}

#[cfg(target_arch = "riscv64")]
core::arch::global_asm!(
    r#"
    .align 4
    .globl __trap_vector
__trap_vector:
    # sscratch holds the kernel stack top while in user mode, 0 in kernel.
    csrrw   sp, sscratch, sp
    bnez    sp, 1f
    # Trap from S-mode: the interrupted sp is now in sscratch.
    csrr    sp, sscratch
1:
    addi    sp, sp, -272
    sd      x1, 0(sp)
    sd      x3, 16(sp)
    sd      x4, 24(sp)
    sd      x5, 32(sp)
    sd      x6, 40(sp)
    sd      x7, 48(sp)
    sd      x8, 56(sp)
    sd      x9, 64(sp)
    sd      x10, 72(sp)
    sd      x11, 80(sp)
    sd      x12, 88(sp)
    sd      x13, 96(sp)
    sd      x14, 104(sp)
    sd      x15, 112(sp)
    sd      x16, 120(sp)
    sd      x17, 128(sp)
    sd      x18, 136(sp)
    sd      x19, 144(sp)
    sd      x20, 152(sp)
    sd      x21, 160(sp)
    sd      x22, 168(sp)
    sd      x23, 176(sp)
    sd      x24, 184(sp)
    sd      x25, 192(sp)
    sd      x26, 200(sp)
    sd      x27, 208(sp)
    sd      x28, 216(sp)
    sd      x29, 224(sp)
    sd      x30, 232(sp)
    sd      x31, 240(sp)
    # The interrupted sp was parked in sscratch by the csrrw above.
    csrr    t0, sscratch
    sd      t0, 8(sp)
    csrr    t0, sepc
    sd      t0, 248(sp)
    csrr    t1, sstatus
    sd      t1, 256(sp)
    # Mark the hart as in-kernel for nested traps.
    csrw    sscratch, zero
    mv      a0, sp
    call    trap_dispatch
    j       __trap_restore

    # __trap_return(a0: *mut TrapFrame) -- first entry to user mode.
    .globl __trap_return
__trap_return:
    mv      sp, a0
    .globl __trap_restore
__trap_restore:
    ld      t0, 248(sp)
    csrw    sepc, t0
    ld      t1, 256(sp)
    csrw    sstatus, t1
    # Returning to user mode (SPP clear): sscratch = kernel stack top.
    andi    t2, t1, 0x100
    bnez    t2, 2f
    addi    t3, sp, 272
    csrw    sscratch, t3
2:
    ld      x1, 0(sp)
    ld      x3, 16(sp)
    ld      x4, 24(sp)
    ld      x5, 32(sp)
    ld      x6, 40(sp)
    ld      x7, 48(sp)
    ld      x8, 56(sp)
    ld      x9, 64(sp)
    ld      x10, 72(sp)
    ld      x11, 80(sp)
    ld      x12, 88(sp)
    ld      x13, 96(sp)
    ld      x14, 104(sp)
    ld      x15, 112(sp)
    ld      x16, 120(sp)
    ld      x17, 128(sp)
    ld      x18, 136(sp)
    ld      x19, 144(sp)
    ld      x20, 152(sp)
    ld      x21, 160(sp)
    ld      x22, 168(sp)
    ld      x23, 176(sp)
    ld      x24, 184(sp)
    ld      x25, 192(sp)
    ld      x26, 200(sp)
    ld      x27, 208(sp)
    ld      x28, 216(sp)
    ld      x29, 224(sp)
    ld      x30, 232(sp)
    ld      x31, 240(sp)
    ld      sp, 8(sp)
    sret
"#
);

/// Install the trap vector into `stvec` (direct mode) and clear `sscratch`.
pub fn init() {
    #[cfg(target_arch = "riscv64")]
    {
        extern "C" {
            fn __trap_vector();
        }
        // SAFETY: __trap_vector is 4-byte aligned (`.align 4`) and is a
        // valid direct-mode trap handler.
        unsafe {
            riscv::register::stvec::write(
                __trap_vector as usize,
                riscv::register::stvec::TrapMode::Direct,
            );
            core::arch::asm!("csrw sscratch, zero");
        }
    }
    log::info!("trap vector installed");
}

/// Resume execution from a seeded trap frame. Does not return.
///
/// # Safety
///
/// `frame` must point to a fully initialized [`TrapFrame`] at the top of
/// the current process's kernel stack, with `sepc`/`sstatus` describing a
/// valid user-mode entry point, and the current `satp` root must map that
/// entry point.
#[cfg(target_arch = "riscv64")]
pub unsafe fn trap_return(frame: *mut TrapFrame) -> ! {
    extern "C" {
        fn __trap_return(frame: *mut TrapFrame) -> !;
    }
    // SAFETY: contract forwarded to the caller.
    unsafe { __trap_return(frame) }
}

/// C-level trap dispatcher invoked by the vector with the frame pointer.
#[cfg(target_arch = "riscv64")]
#[no_mangle]
extern "C" fn trap_dispatch(frame: *mut TrapFrame) {
    let scause = riscv::register::scause::read().bits() as u64;
    let stval = riscv::register::stval::read() as u64;
    // SAFETY: the trap vector passes a pointer to the frame it just wrote
    // on this stack; it stays valid for the duration of the dispatch.
    let frame = unsafe { &mut *frame };
    handle_trap(frame, scause, stval);
}

/// Architecture-neutral trap dispatch, keyed on the `scause` value.
pub fn handle_trap(frame: &mut TrapFrame, scause: u64, stval: u64) {
    if scause & SCAUSE_INTERRUPT != 0 {
        match scause & !SCAUSE_INTERRUPT {
            IRQ_S_TIMER => super::timer::handle_interrupt(),
            IRQ_S_SOFT => log::warn!("unhandled supervisor software interrupt"),
            IRQ_S_EXTERNAL => log::warn!("unhandled supervisor external interrupt"),
            code => log::warn!("unknown interrupt cause {}", code),
        }
    } else {
        match scause {
            EXC_ECALL_FROM_U => {
                // Advance past the ecall before the handler runs, so exec
                // can rewrite sepc without it being clobbered afterward.
                frame.sepc += 4;
                syscall::dispatch(frame);
            }
            EXC_ILLEGAL_INSTRUCTION if frame.from_user() => {
                log::warn!(
                    "illegal instruction in user mode, sepc={:#x} stval={:#x}",
                    frame.sepc,
                    stval
                );
                signals::post_to_current(signals::SIGILL);
            }
            EXC_INSTRUCTION_PAGE_FAULT | EXC_LOAD_PAGE_FAULT | EXC_STORE_PAGE_FAULT
                if frame.from_user() =>
            {
                log::warn!(
                    "user page fault, scause={} sepc={:#x} stval={:#x}",
                    scause,
                    frame.sepc,
                    stval
                );
                signals::post_to_current(signals::SIGSEGV);
            }
            EXC_LOAD_ACCESS_FAULT | EXC_STORE_ACCESS_FAULT if frame.from_user() => {
                log::warn!(
                    "user access fault, scause={} sepc={:#x} stval={:#x}",
                    scause,
                    frame.sepc,
                    stval
                );
                signals::post_to_current(signals::SIGSEGV);
            }
            EXC_ECALL_FROM_S => {
                panic!(
                    "unexpected ecall from supervisor mode, sepc={:#x}",
                    frame.sepc
                );
            }
            _ => {
                panic!(
                    "kernel trap: scause={:#x} sepc={:#x} stval={:#x} sstatus={:#x}",
                    scause, frame.sepc, stval, frame.sstatus
                );
            }
        }
    }

    // Signal delivery runs only on the way back to user mode.
    if frame.from_user() {
        signals::deliver_pending(frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_layout_matches_vector_offsets() {
        assert_eq!(core::mem::offset_of!(TrapFrame, regs), 0);
        assert_eq!(core::mem::offset_of!(TrapFrame, sepc), 248);
        assert_eq!(core::mem::offset_of!(TrapFrame, sstatus), 256);
        assert!(core::mem::size_of::<TrapFrame>() <= TRAP_FRAME_BYTES);
    }

    #[test]
    fn register_accessors_index_the_right_slots() {
        let mut f = TrapFrame::zeroed();
        f.regs[REG_A0] = 11;
        f.regs[REG_A7] = 93;
        f.regs[REG_SP] = 0x8000_0000;
        assert_eq!(f.a0(), 11);
        assert_eq!(f.syscall_number(), 93);
        assert_eq!(f.sp(), 0x8000_0000);
        assert_eq!(f.arg(0), 11);
    }

    #[test]
    fn from_user_reads_spp() {
        let mut f = TrapFrame::zeroed();
        assert!(f.from_user());
        f.sstatus |= SSTATUS_SPP;
        assert!(!f.from_user());
    }
}
