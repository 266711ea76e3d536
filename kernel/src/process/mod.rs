//! Process management.
//!
//! Processes live in a bounded, pid-indexed table (no PCB pointers cross
//! module boundaries; parent and waiter references are pids). Kernel
//! threads and user processes share the PCB shape; user processes
//! additionally own a page-table root and a VMA list.

pub mod creation;
pub mod fork;
pub mod lifecycle;
pub mod pcb;
pub mod signals;
pub mod table;

pub use pcb::{Pid, Process, ProcessState, Vma, VmaFlags};

/// Process table capacity.
pub const MAX_PROCS: usize = 64;

/// Kernel stack size per process, in pages (16 KiB).
pub const KERNEL_STACK_PAGES: usize = 4;

/// Scheduler quantum in timer ticks.
pub const QUANTUM_TICKS: u32 = 2;

/// The init process pid: first pid handed out, adoptive parent of
/// orphans.
pub const INIT_PID: Pid = Pid(1);

/// Bring up the process subsystem.
pub fn init() {
    table::init();
    log::info!("process table ready ({} slots)", MAX_PROCS);
}
