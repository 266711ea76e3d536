//! Signals: pending masks, handler table, trampoline delivery.
//!
//! Delivery runs on the trap-return path, only when heading back to user
//! mode. One handler fires per delivery window: the kernel pushes a save
//! frame (a0-a7, sepc, sstatus, the original sp) onto the user stack,
//! points `sepc` at the handler with the signal number in `a0`, and sets
//! `ra` to the per-process trampoline page, whose two instructions issue
//! the sigreturn syscall that restores the saved frame.
//!
//! Default action for SIGKILL, SIGSEGV, SIGILL, and SIGTERM without a
//! handler is process exit with code `128 + sig`; other unhandled
//! signals are discarded.

use crate::arch::riscv64::trap::{TrapFrame, REG_A0, REG_RA};
use crate::error::{KernelError, ProcessError};
use crate::mm::layout::USER_SIGTRAMP_BASE;
use crate::mm::user_validation::{copy_from_user, copy_to_user};
use crate::mm::{frame_allocator, vmm, PhysicalAddress, VirtualAddress};
use crate::process::{table, Pid, ProcessState, Vma, VmaFlags};

/// Number of signal slots.
pub const NSIG: usize = 32;

pub const SIGILL: u32 = 4;
pub const SIGKILL: u32 = 9;
pub const SIGUSR1: u32 = 10;
pub const SIGSEGV: u32 = 11;
pub const SIGTERM: u32 = 15;

/// Signals whose default action is fatal.
const FATAL_DEFAULT: u32 =
    (1 << SIGKILL) | (1 << SIGSEGV) | (1 << SIGILL) | (1 << SIGTERM);

/// Save-frame layout pushed onto the user stack: a0-a7, sepc, sstatus,
/// original sp, pad. 16-byte aligned.
const SAVE_WORDS: usize = 12;
const SAVE_BYTES: u64 = (SAVE_WORDS * 8) as u64;

/// Trampoline code: `li a7, 22; ecall` (22 = sigreturn).
const TRAMPOLINE_CODE: [u32; 2] = [0x0160_0893, 0x0000_0073];

/// Map the signal trampoline page (R|X|U) into a fresh user root and
/// return the VMA to record.
pub fn install_trampoline(root: PhysicalAddress) -> Result<Vma, KernelError> {
    let page = frame_allocator::alloc_frame()?;
    // SAFETY: freshly allocated frame, exclusively ours.
    unsafe {
        core::ptr::write_bytes(page.as_ptr(), 0, crate::mm::FRAME_SIZE);
        let insns = page.as_ptr() as *mut u32;
        for (i, insn) in TRAMPOLINE_CODE.iter().enumerate() {
            insns.add(i).write(*insn);
        }
    }
    crate::arch::barriers::instruction_fence();

    if let Err(e) = vmm::map(
        root,
        VirtualAddress::new(USER_SIGTRAMP_BASE),
        page,
        crate::mm::page_table::PteFlags::USER_RX,
    ) {
        frame_allocator::free_frame(page);
        return Err(e);
    }
    Ok(Vma::new(
        USER_SIGTRAMP_BASE,
        USER_SIGTRAMP_BASE + crate::mm::FRAME_SIZE as u64,
        VmaFlags::READ | VmaFlags::EXEC | VmaFlags::USER,
    ))
}

/// Mark `sig` pending for `pid`. Sleeping targets are woken so fatal
/// signals take effect promptly.
pub fn post_signal(pid: Pid, sig: u32) -> Result<(), KernelError> {
    if sig == 0 || sig as usize >= NSIG {
        return Err(ProcessError::BadSignal { sig }.into());
    }
    let woke = table::with_process(pid, |p| {
        p.sig_pending |= 1 << sig;
        if p.state == ProcessState::Sleeping {
            p.state = ProcessState::Ready;
            p.wait_channel = 0;
            true
        } else {
            false
        }
    })
    .ok_or(KernelError::Process(ProcessError::NoSuchProcess { pid: pid.0 }))?;

    if woke {
        crate::sched::enqueue(pid);
    }
    Ok(())
}

/// Post `sig` to the current process (trap-handler convenience).
pub fn post_to_current(sig: u32) {
    if let Some(pid) = table::current_pid() {
        let _ = post_signal(pid, sig);
    }
}

/// Register a handler for `sig` in the current process, returning the
/// previous handler address.
pub fn register_handler(sig: u32, handler: u64) -> Result<u64, KernelError> {
    if sig == 0 || sig as usize >= NSIG || sig == SIGKILL {
        return Err(ProcessError::BadSignal { sig }.into());
    }
    table::with_current(|p| {
        let old = p.sig_handlers[sig as usize];
        p.sig_handlers[sig as usize] = handler;
        old
    })
    .ok_or(KernelError::Process(ProcessError::NoSuchProcess { pid: 0 }))
}

/// Trap-return hook: deliver at most one handled signal, applying default
/// actions to the rest.
pub fn deliver_pending(frame: &mut TrapFrame) {
    let Some(pid) = table::current_pid() else {
        return;
    };

    loop {
        // Take the lowest pending signal, if any.
        let taken = table::with_process(pid, |p| {
            if p.sig_pending == 0 {
                return None;
            }
            let sig = p.sig_pending.trailing_zeros();
            p.sig_pending &= !(1 << sig);
            let handler = if sig == SIGKILL {
                0 // SIGKILL cannot be handled
            } else {
                p.sig_handlers[sig as usize]
            };
            Some((sig, handler, p.root))
        })
        .flatten();

        let Some((sig, handler, root)) = taken else {
            return;
        };

        if handler != 0 {
            if let Some(root) = root {
                match push_signal_frame(root, frame, handler, sig) {
                    Ok(()) => return, // one delivery per window
                    Err(e) => {
                        // Unwritable user stack: treat as a fatal fault.
                        log::warn!("signal {} delivery failed for pid {}: {}", sig, pid, e);
                        crate::process::lifecycle::exit_current(128 + SIGSEGV as i32);
                    }
                }
            }
            continue;
        }

        if FATAL_DEFAULT & (1 << sig) != 0 {
            log::info!("pid {} killed by signal {}", pid, sig);
            crate::process::lifecycle::exit_current(128 + sig as i32);
        }
        // Default for everything else: ignore and keep scanning.
    }
}

/// Push the save frame onto the user stack and rewrite the trap frame to
/// enter the handler.
fn push_signal_frame(
    root: PhysicalAddress,
    frame: &mut TrapFrame,
    handler: u64,
    sig: u32,
) -> Result<(), KernelError> {
    let old_sp = frame.sp();
    let new_sp = old_sp
        .checked_sub(SAVE_BYTES)
        .ok_or(KernelError::InvalidAddress { addr: 0 })?
        & !0xF;

    let mut save = [0u64; SAVE_WORDS];
    save[..8].copy_from_slice(&frame.regs[REG_A0..REG_A0 + 8]);
    save[8] = frame.sepc;
    save[9] = frame.sstatus;
    save[10] = old_sp;

    let bytes: [u8; SAVE_WORDS * 8] =
        // SAFETY: plain transmute of u64 words to bytes for the copy-out.
        unsafe { core::mem::transmute(save) };
    copy_to_user(root, new_sp, &bytes)?;

    frame.set_sp(new_sp);
    frame.sepc = handler;
    frame.set_a0(sig as u64);
    frame.regs[REG_RA] = USER_SIGTRAMP_BASE;
    Ok(())
}

/// sigreturn: restore the save frame the trampoline's sp points at.
/// Returns the restored a0 so the syscall path hands it back unchanged.
pub fn sigreturn(frame: &mut TrapFrame) -> Result<i64, KernelError> {
    let root = table::with_current(|p| p.root)
        .flatten()
        .ok_or(KernelError::Process(ProcessError::NoSuchProcess { pid: 0 }))?;

    let sp = frame.sp();
    let mut bytes = [0u8; SAVE_WORDS * 8];
    copy_from_user(root, sp, &mut bytes)?;
    // SAFETY: plain transmute of bytes back to u64 words.
    let save: [u64; SAVE_WORDS] = unsafe { core::mem::transmute(bytes) };

    frame.regs[REG_A0..REG_A0 + 8].copy_from_slice(&save[..8]);
    frame.sepc = save[8];
    frame.sstatus = save[9];
    frame.set_sp(save[10]);

    Ok(frame.a0() as i64)
}
