//! Physical and virtual memory map of the qemu virt platform.

/// Start of RAM.
pub const RAM_BASE: usize = 0x8000_0000;
/// RAM size (128 MiB).
pub const RAM_SIZE: usize = 128 * 1024 * 1024;
/// One past the end of RAM.
pub const RAM_END: usize = RAM_BASE + RAM_SIZE;

/// Kernel load address (OpenSBI occupies [RAM_BASE, KERNEL_BASE)).
pub const KERNEL_BASE: usize = 0x8020_0000;

/// CLINT MMIO block (timer comparators live here).
pub const CLINT_BASE: usize = 0x0200_0000;
pub const CLINT_SIZE: usize = 0x1_0000;

/// PLIC MMIO block.
pub const PLIC_BASE: usize = 0x0C00_0000;
pub const PLIC_SIZE: usize = 0x0200_0000;

/// NS16550A UART.
pub const UART0_BASE: usize = 0x1000_0000;
pub const UART0_SIZE: usize = 0x100;

/// First virtio-mmio slot on the virt machine; 8 slots, 0x1000 apart.
pub const VIRTIO_MMIO_BASE: usize = 0x1000_1000;
pub const VIRTIO_MMIO_STRIDE: usize = 0x1000;
pub const VIRTIO_MMIO_SLOTS: usize = 8;

/// Base virtual address user program images are linked at.
pub const USER_CODE_BASE: u64 = 0x10000;
/// Top of the user stack (exclusive).
pub const USER_STACK_TOP: u64 = 0x8000_0000;
/// User stack size (1 MiB).
pub const USER_STACK_SIZE: u64 = 0x10_0000;
/// User-space addresses are below this bound.
pub const USER_SPACE_END: u64 = USER_STACK_TOP;

/// Signal trampoline page, mapped R|X|U into every user root.
pub const USER_SIGTRAMP_BASE: u64 = 0xF000;
