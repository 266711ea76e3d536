//! Process control block.

use alloc::string::String;
use alloc::vec::Vec;

use crate::arch::riscv64::context::Context;
use crate::arch::riscv64::trap::{TrapFrame, TRAP_FRAME_BYTES};
use crate::error::KernelError;
use crate::mm::{PhysicalAddress, FRAME_SIZE};

use super::signals::NSIG;
use super::KERNEL_STACK_PAGES;

/// Process identifier. Small monotonically assigned integers; pid 0 is
/// never used (it stands for "no process" in the current-pid register).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(pub u64);

impl core::fmt::Display for Pid {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Slot vacated; transient between reap and slot reuse.
    Unused,
    /// Being constructed, not yet schedulable.
    Embryo,
    /// On the ready queue.
    Ready,
    /// Currently executing.
    Running,
    /// Blocked on a wait channel.
    Sleeping,
    /// Exited; retains pid and exit code until the parent reaps it.
    Zombie,
}

bitflags::bitflags! {
    /// VMA permission flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmaFlags: u32 {
        const READ  = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC  = 1 << 2;
        const USER  = 1 << 3;
    }
}

/// A user virtual memory area: half-open range with uniform permissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Vma {
    pub start: u64,
    pub end: u64,
    pub flags: VmaFlags,
}

impl Vma {
    pub fn new(start: u64, end: u64, flags: VmaFlags) -> Self {
        debug_assert!(start < end);
        Self { start, end, flags }
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }

    pub fn overlaps(&self, other: &Vma) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Number of pages spanned.
    pub fn pages(&self) -> u64 {
        (self.end - self.start).div_ceil(FRAME_SIZE as u64)
    }

    /// Stacks are the VMAs exec preserves.
    pub fn is_stack(&self) -> bool {
        self.end == crate::mm::layout::USER_STACK_TOP
    }
}

/// Process control block.
#[derive(Debug)]
pub struct Process {
    pub pid: Pid,
    pub parent: Option<Pid>,
    pub state: ProcessState,
    pub name: String,
    /// User page-table root; `None` for kernel threads.
    pub root: Option<PhysicalAddress>,
    /// Base of the kernel stack page run.
    pub kstack: PhysicalAddress,
    /// Saved callee context for the kernel-side switch.
    pub context: Context,
    /// Kernel-thread entry `(fn ptr, arg)`, consumed on first dispatch.
    pub kentry: Option<(usize, usize)>,
    /// Timer ticks charged to this process.
    pub cpu_time: u64,
    pub priority: u8,
    pub exit_code: i32,
    /// Current working directory (absolute, normalized).
    pub cwd: String,
    /// Pending-signal bitmask.
    pub sig_pending: u32,
    /// User handler addresses; 0 = default action.
    pub sig_handlers: [u64; NSIG],
    pub vmas: Vec<Vma>,
    /// sbrk heap bounds.
    pub heap_base: u64,
    pub heap_end: u64,
    /// Wait channel identifier; 0 = not waiting.
    pub wait_channel: usize,
    /// Tick at which a timed sleep expires.
    pub wakeup_tick: u64,
    /// Last error visible to userland.
    pub errno: i32,
}

impl Process {
    pub fn new(pid: Pid, name: &str, kstack: PhysicalAddress) -> Self {
        Self {
            pid,
            parent: None,
            state: ProcessState::Embryo,
            name: String::from(name),
            root: None,
            kstack,
            context: Context::zeroed(),
            kentry: None,
            cpu_time: 0,
            priority: 0,
            exit_code: 0,
            cwd: String::from("/"),
            sig_pending: 0,
            sig_handlers: [0; NSIG],
            vmas: Vec::new(),
            heap_base: 0,
            heap_end: 0,
            wait_channel: 0,
            wakeup_tick: 0,
            errno: 0,
        }
    }

    /// One past the highest kernel-stack address.
    pub fn kstack_top(&self) -> u64 {
        self.kstack.as_u64() + (KERNEL_STACK_PAGES * FRAME_SIZE) as u64
    }

    /// The trap frame slot at the top of the kernel stack.
    pub fn trap_frame_ptr(&self) -> *mut TrapFrame {
        (self.kstack_top() - TRAP_FRAME_BYTES as u64) as *mut TrapFrame
    }

    /// Record a VMA, refusing overlap with any existing one.
    pub fn add_vma(&mut self, vma: Vma) -> Result<(), KernelError> {
        if self.vmas.iter().any(|v| v.overlaps(&vma)) {
            return Err(KernelError::InvalidAddress {
                addr: vma.start as usize,
            });
        }
        self.vmas.push(vma);
        Ok(())
    }

    /// The VMA containing `addr`, if any.
    pub fn vma_containing(&self, addr: u64) -> Option<&Vma> {
        self.vmas.iter().find(|v| v.contains(addr))
    }
}
