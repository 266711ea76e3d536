//! Process-group syscall handlers.

use crate::arch::riscv64::trap::TrapFrame;
use crate::error::{KernelError, ProcessError};
use crate::mm::user_validation::copy_to_user;
use crate::mm::{vmm, PhysicalAddress, VirtualAddress, FRAME_SIZE};
use crate::process::{fork, lifecycle, signals, table, Pid, Vma, VmaFlags};

fn current_root() -> Result<PhysicalAddress, KernelError> {
    table::with_current(|p| p.root)
        .flatten()
        .ok_or(KernelError::Process(ProcessError::NoSuchProcess { pid: 0 }))
}

pub fn sys_exit(code: u64) -> Result<i64, KernelError> {
    lifecycle::exit_current(code as i32)
}

pub fn sys_getpid() -> Result<i64, KernelError> {
    table::current_pid()
        .map(|pid| pid.0 as i64)
        .ok_or(KernelError::Process(ProcessError::NoSuchProcess { pid: 0 }))
}

pub fn sys_getppid() -> Result<i64, KernelError> {
    table::with_current(|p| p.parent)
        .ok_or(KernelError::Process(ProcessError::NoSuchProcess { pid: 0 }))
        .map(|parent| parent.map(|p| p.0 as i64).unwrap_or(0))
}

pub fn sys_fork(frame: &mut TrapFrame) -> Result<i64, KernelError> {
    fork::fork(frame).map(|child| child.0 as i64)
}

pub fn sys_execve(frame: &mut TrapFrame, path: u64, argv: u64) -> Result<i64, KernelError> {
    crate::elf::exec_replace(frame, path, argv)
}

/// Block for a zombie child; its exit code is stored through
/// `status_uva` (when non-null) and its pid returned.
pub fn sys_wait(status_uva: u64) -> Result<i64, KernelError> {
    let (child, code) = lifecycle::wait_for_child()?;
    if status_uva != 0 {
        let root = current_root()?;
        copy_to_user(root, status_uva, &code.to_le_bytes())?;
    }
    Ok(child.0 as i64)
}

pub fn sys_kill(pid: u64, sig: u64) -> Result<i64, KernelError> {
    signals::post_signal(Pid(pid), sig as u32)?;
    Ok(0)
}

pub fn sys_signal(sig: u64, handler: u64) -> Result<i64, KernelError> {
    signals::register_handler(sig as u32, handler).map(|old| old as i64)
}

pub fn sys_yield() -> Result<i64, KernelError> {
    crate::sched::yield_now();
    Ok(0)
}

pub fn sys_sleep(ticks: u64) -> Result<i64, KernelError> {
    lifecycle::sleep_ticks(ticks);
    Ok(0)
}

/// Monotonic tick count (100 Hz).
pub fn sys_gettime() -> Result<i64, KernelError> {
    Ok(crate::arch::riscv64::timer::get_ticks() as i64)
}

/// Grow or shrink the heap by `delta` bytes; returns the previous break.
pub fn sys_sbrk(delta: i64) -> Result<i64, KernelError> {
    let root = current_root()?;
    let (heap_base, old_end) = table::with_current(|p| (p.heap_base, p.heap_end))
        .ok_or(KernelError::Process(ProcessError::NoSuchProcess { pid: 0 }))?;

    let new_end = if delta >= 0 {
        old_end
            .checked_add(delta as u64)
            .ok_or(KernelError::InvalidArgument { name: "delta" })?
    } else {
        old_end
            .checked_sub(delta.unsigned_abs())
            .ok_or(KernelError::InvalidArgument { name: "delta" })?
    };
    if new_end < heap_base
        || new_end >= crate::mm::layout::USER_STACK_TOP - crate::mm::layout::USER_STACK_SIZE
    {
        return Err(KernelError::InvalidArgument { name: "delta" });
    }

    let old_pages_end = crate::mm::align_up(old_end as usize, FRAME_SIZE) as u64;
    let new_pages_end = crate::mm::align_up(new_end as usize, FRAME_SIZE) as u64;

    if new_pages_end > old_pages_end {
        vmm::map_user_memory(
            root,
            VirtualAddress::new(old_pages_end),
            None,
            (new_pages_end - old_pages_end) as usize,
            true,
        )?;
    } else if new_pages_end < old_pages_end {
        vmm::unmap_and_free_range(
            root,
            VirtualAddress::new(new_pages_end),
            ((old_pages_end - new_pages_end) as usize) / FRAME_SIZE,
        );
    }

    table::with_current(|p| {
        p.heap_end = new_end;
        // Keep a single heap VMA covering [heap_base, page-rounded end).
        p.vmas.retain(|v| v.start != heap_base || v.flags.contains(VmaFlags::EXEC));
        if new_pages_end > heap_base {
            let _ = p.add_vma(Vma::new(
                heap_base,
                new_pages_end,
                VmaFlags::READ | VmaFlags::WRITE | VmaFlags::USER,
            ));
        }
    });

    Ok(old_end as i64)
}
