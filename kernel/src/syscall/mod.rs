//! System call dispatch.
//!
//! Syscalls arrive via `ecall` with the number in `a7` and up to six
//! arguments in `a0..a5`; the result goes back in `a0`. Failures return
//! `-errno` and record the code as the process's last error; successes
//! clear it. The numbering is stable ABI.

pub mod filesystem;
pub mod process;

use crate::arch::riscv64::trap::TrapFrame;
use crate::errno::Errno;
use crate::error::KernelError;
use crate::process::{signals, table};

/// Stable syscall numbers.
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    Exit = 0,
    Write = 1,
    Read = 2,
    GetPid = 3,
    Sbrk = 4,
    Sleep = 5,
    Yield = 6,
    Fork = 7,
    /// Legacy alias of [`Syscall::Execve`].
    Exec = 8,
    Wait = 9,
    GetPPid = 10,
    Kill = 11,
    GetTime = 12,
    Open = 13,
    Close = 14,
    Seek = 15,
    Stat = 16,
    Mkdir = 17,
    Unlink = 18,
    Rmdir = 19,
    Execve = 20,
    Signal = 21,
    SigReturn = 22,
    Chdir = 28,
    Getcwd = 29,
}

impl TryFrom<u64> for Syscall {
    type Error = ();

    fn try_from(value: u64) -> Result<Self, ()> {
        Ok(match value {
            0 => Self::Exit,
            1 => Self::Write,
            2 => Self::Read,
            3 => Self::GetPid,
            4 => Self::Sbrk,
            5 => Self::Sleep,
            6 => Self::Yield,
            7 => Self::Fork,
            8 => Self::Exec,
            9 => Self::Wait,
            10 => Self::GetPPid,
            11 => Self::Kill,
            12 => Self::GetTime,
            13 => Self::Open,
            14 => Self::Close,
            15 => Self::Seek,
            16 => Self::Stat,
            17 => Self::Mkdir,
            18 => Self::Unlink,
            19 => Self::Rmdir,
            20 => Self::Execve,
            21 => Self::Signal,
            22 => Self::SigReturn,
            28 => Self::Chdir,
            29 => Self::Getcwd,
            _ => return Err(()),
        })
    }
}

/// Entry point from the trap dispatcher. `sepc` was already advanced
/// past the `ecall`.
pub fn dispatch(frame: &mut TrapFrame) {
    let number = frame.syscall_number();

    #[cfg(feature = "syscall-trace")]
    crate::println!(
        "[syscall] pid {:?} nr {} args ({:#x}, {:#x}, {:#x})",
        table::current_pid(),
        number,
        frame.arg(0),
        frame.arg(1),
        frame.arg(2),
    );

    let result = match Syscall::try_from(number) {
        Ok(syscall) => handle(syscall, frame),
        Err(()) => {
            log::warn!("unknown syscall {}", number);
            Err(KernelError::NotSupported {
                operation: "unknown syscall",
            })
        }
    };

    match result {
        Ok(value) => {
            frame.set_a0(value as u64);
            table::with_current(|p| p.errno = 0);
        }
        Err(err) => {
            let errno = Errno::from(err);
            table::with_current(|p| p.errno = errno.as_i32());
            frame.set_a0(-(errno.as_i32() as i64) as u64);
        }
    }
}

fn handle(syscall: Syscall, frame: &mut TrapFrame) -> Result<i64, KernelError> {
    // Snapshot the arguments before any handler rewrites the frame.
    let (a0, a1, a2) = (frame.arg(0), frame.arg(1), frame.arg(2));

    match syscall {
        Syscall::Exit => process::sys_exit(a0),
        Syscall::Write => filesystem::sys_write(a0, a1, a2),
        Syscall::Read => filesystem::sys_read(a0, a1, a2),
        Syscall::GetPid => process::sys_getpid(),
        Syscall::Sbrk => process::sys_sbrk(a0 as i64),
        Syscall::Sleep => process::sys_sleep(a0),
        Syscall::Yield => process::sys_yield(),
        Syscall::Fork => process::sys_fork(frame),
        Syscall::Exec | Syscall::Execve => process::sys_execve(frame, a0, a1),
        Syscall::Wait => process::sys_wait(a0),
        Syscall::GetPPid => process::sys_getppid(),
        Syscall::Kill => process::sys_kill(a0, a1),
        Syscall::GetTime => process::sys_gettime(),
        Syscall::Open => filesystem::sys_open(a0, a1),
        Syscall::Close => filesystem::sys_close(a0),
        Syscall::Seek => filesystem::sys_seek(a0, a1 as i64, a2),
        Syscall::Stat => filesystem::sys_stat(a0, a1),
        Syscall::Mkdir => filesystem::sys_mkdir(a0),
        Syscall::Unlink => filesystem::sys_unlink(a0),
        Syscall::Rmdir => filesystem::sys_rmdir(a0),
        Syscall::Signal => process::sys_signal(a0, a1),
        Syscall::SigReturn => signals::sigreturn(frame),
        Syscall::Chdir => filesystem::sys_chdir(a0),
        Syscall::Getcwd => filesystem::sys_getcwd(a0, a1),
    }
}
