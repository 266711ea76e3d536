//! ThunderOS kernel binary: boot sequence.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(target_os = "none")]
use thunderos_kernel as kernel;

#[cfg(target_os = "none")]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    kernel::println!("[KERNEL PANIC] {}", info);
    kernel::arch::halt();
}

/// Kernel entry, called from the boot stub with the boot stack installed
/// and `.bss` cleared. Initialization order is fixed: console, traps,
/// timer, PMM, paging, kmalloc, DMA, block device, root filesystem,
/// processes, scheduler.
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
#[no_mangle]
pub extern "C" fn kmain() -> ! {
    use kernel::arch;
    use kernel::mm::{self, layout, PhysicalAddress};

    kernel::drivers::uart::init();
    kernel::log_service::init();
    kernel::println!("ThunderOS {} (riscv64, sv39)", env!("CARGO_PKG_VERSION"));

    arch::riscv64::trap::init();
    arch::riscv64::timer::init();

    // Physical memory: manage the window after the kernel image.
    let pmm_start = arch::riscv64::boot::kernel_end();
    let pmm_size = (layout::RAM_END - pmm_start).min(mm::frame_allocator::MAX_MANAGED_BYTES);
    mm::frame_allocator::init(PhysicalAddress::new(pmm_start as u64), pmm_size);

    if let Err(e) = mm::vmm::init() {
        panic!("paging init failed: {}", e);
    }
    mm::heap::init();

    kernel::drivers::virtio::blk::init();
    match kernel::fs::ext2::vfs::mount_root() {
        Ok(()) => {}
        Err(e) => log::error!("root filesystem mount failed: {}", e),
    }
    kernel::fs::file::init();

    kernel::process::init();
    kernel::sched::init();

    // The first user process: the shell from disk.
    match kernel::elf::load_process("/bin/sh", "sh") {
        Ok(pid) => log::info!("shell loaded as pid {}", pid),
        Err(e) => log::error!("no shell: {}", e),
    }

    arch::enable_interrupts();
    kernel::sched::run()
}

#[cfg(not(target_os = "none"))]
fn main() {
    // Host build: the kernel only runs on riscv64 bare metal; the library
    // (and its test suite) is the useful artifact here.
    println!(
        "thunderos-kernel {}: boot image must be built for riscv64gc-unknown-none-elf",
        env!("CARGO_PKG_VERSION")
    );
}
