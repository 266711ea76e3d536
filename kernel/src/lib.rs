//! ThunderOS kernel library.
//!
//! A small monolithic kernel for 64-bit RISC-V (Sv39, supervisor mode,
//! booted under an SBI firmware). The library builds for the bare-metal
//! target and for the host, where the hardware touch points become inert
//! and the subsystems run under the standard test harness.

#![no_std]

extern crate alloc;

// Host builds (unit tests, tooling) get std and the system allocator.
#[cfg(not(target_os = "none"))]
extern crate std;

/// On bare metal the `alloc` crate draws from kmalloc.
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
#[global_allocator]
static ALLOCATOR: mm::heap::KernelAllocator = mm::heap::KernelAllocator;

#[macro_use]
pub mod print;

pub mod arch;
pub mod drivers;
pub mod elf;
pub mod errno;
pub mod error;
pub mod fs;
pub mod log_service;
pub mod mm;
pub mod process;
pub mod sched;
pub mod syscall;

#[cfg(test)]
mod test_support;

pub use errno::Errno;
pub use error::{KernelError, KernelResult};
