//! Process creation: kernel threads and user processes.

use alloc::boxed::Box;
use alloc::vec::Vec;

use super::lifecycle;
use super::signals;
use super::table;
use super::{Pid, Process, ProcessState, Vma, VmaFlags, KERNEL_STACK_PAGES};
use crate::error::{KernelError, ProcessError};
use crate::mm::layout::{USER_CODE_BASE, USER_STACK_SIZE, USER_STACK_TOP};
use crate::mm::{frame_allocator, vmm, VirtualAddress, FRAME_SIZE};

/// Default base of the sbrk heap in user space.
pub const USER_HEAP_BASE: u64 = 0x4000_0000;

/// Kernel-thread entry shim. The context switch restores only callee
/// state, so the entry function and argument travel through the PCB and
/// are picked up here on first dispatch.
extern "C" fn kernel_thread_entry() {
    crate::arch::enable_interrupts();
    let (entry, arg) = table::with_current(|p| p.kentry.take())
        .flatten()
        .expect("kernel thread started without an entry point");
    // SAFETY: kentry is only ever set by process_create from a real
    // `extern "C" fn(usize)`.
    let entry: extern "C" fn(usize) = unsafe { core::mem::transmute(entry) };
    entry(arg);
    lifecycle::exit_current(0);
}

/// First-dispatch shim for user processes: jump into user mode through
/// the seeded trap frame at the top of the kernel stack.
pub(super) extern "C" fn user_entry_trampoline() {
    let frame = table::with_current(|p| p.trap_frame_ptr())
        .expect("user trampoline without a current process");

    #[cfg(target_arch = "riscv64")]
    // SAFETY: the frame was seeded by process creation (or fork) with a
    // valid user entry, and the scheduler switched satp to this process's
    // root before dispatching us.
    unsafe {
        crate::arch::riscv64::trap::trap_return(frame);
    }

    #[cfg(not(target_arch = "riscv64"))]
    {
        let _ = frame;
        unreachable!("user processes cannot run on the host");
    }
}

fn alloc_kstack() -> Result<crate::mm::PhysicalAddress, KernelError> {
    frame_allocator::alloc_frames(KERNEL_STACK_PAGES)
}

/// Create a kernel thread that enters `entry(arg)` on first dispatch.
pub fn process_create(
    name: &str,
    entry: extern "C" fn(usize),
    arg: usize,
) -> Result<Pid, KernelError> {
    let kstack = alloc_kstack()?;

    let pid = table::with_table(|t| t.alloc_pid());
    let mut process = Box::new(Process::new(pid, name, kstack));
    process.kentry = Some((entry as usize, arg));
    process.context.ra = kernel_thread_entry as usize as u64;
    process.context.sp = process.kstack_top();
    process.state = ProcessState::Ready;

    if table::with_table(|t| t.insert(process)).is_err() {
        frame_allocator::free_frames(kstack, KERNEL_STACK_PAGES);
        return Err(ProcessError::TableFull.into());
    }
    crate::sched::enqueue(pid);
    log::debug!("created kernel thread '{}' pid {}", name, pid);
    Ok(pid)
}

/// Create a user process running `code` (a flat image mapped at
/// [`USER_CODE_BASE`]) with a 1 MiB stack ending at [`USER_STACK_TOP`].
pub fn process_create_user(name: &str, code: &[u8]) -> Result<Pid, KernelError> {
    process_create_user_at(name, code, USER_CODE_BASE, USER_CODE_BASE)
}

/// Create a user process with the image mapped at `image_base` and the
/// first instruction at `entry` (ELF images may enter past the base).
pub fn process_create_user_at(
    name: &str,
    code: &[u8],
    image_base: u64,
    entry: u64,
) -> Result<Pid, KernelError> {
    let root = vmm::create_user_root()?;
    let mut vmas: Vec<Vma> = Vec::new();

    if let Err(e) = build_user_image(root, &mut vmas, code, image_base) {
        lifecycle::destroy_image(root, &vmas);
        return Err(e);
    }

    let kstack = match alloc_kstack() {
        Ok(k) => k,
        Err(e) => {
            lifecycle::destroy_image(root, &vmas);
            return Err(e);
        }
    };

    let pid = table::with_table(|t| t.alloc_pid());
    let mut process = Box::new(Process::new(pid, name, kstack));
    process.root = Some(root);
    process.vmas = vmas;
    process.heap_base = USER_HEAP_BASE;
    process.heap_end = USER_HEAP_BASE;

    // Seed the trap frame: the first `sret` lands in user code with a
    // fresh stack, user privilege (SPP=0), and interrupts on (SPIE=1).
    let frame_ptr = process.trap_frame_ptr();
    let mut frame = crate::arch::riscv64::trap::TrapFrame::zeroed();
    frame.sepc = entry;
    frame.set_sp(USER_STACK_TOP);
    frame.sstatus = crate::arch::riscv64::trap::SSTATUS_SPIE;
    // SAFETY: frame_ptr points into the freshly allocated kernel stack.
    unsafe {
        core::ptr::write(frame_ptr, frame);
    }

    process.context.ra = user_entry_trampoline as usize as u64;
    process.context.sp = frame_ptr as u64;
    process.state = ProcessState::Ready;

    if let Err(rejected) = table::with_table(|t| t.insert(process)) {
        frame_allocator::free_frames(rejected.kstack, KERNEL_STACK_PAGES);
        lifecycle::destroy_image(root, &rejected.vmas);
        return Err(ProcessError::TableFull.into());
    }
    crate::sched::enqueue(pid);
    log::info!("created user process '{}' pid {}", name, pid);
    Ok(pid)
}

/// Map trampoline, code image, and stack into `root`, recording each VMA
/// into `vmas` as it lands so a failure can be unwound by the caller.
fn build_user_image(
    root: crate::mm::PhysicalAddress,
    vmas: &mut Vec<Vma>,
    code: &[u8],
    image_base: u64,
) -> Result<(), KernelError> {
    vmas.push(signals::install_trampoline(root)?);

    vmm::map_user_code(root, VirtualAddress::new(image_base), code)?;
    let code_start = image_base & !(FRAME_SIZE as u64 - 1);
    let code_pages =
        ((image_base - code_start) as usize + code.len()).div_ceil(FRAME_SIZE);
    vmas.push(Vma::new(
        code_start,
        code_start + (code_pages * FRAME_SIZE) as u64,
        VmaFlags::READ | VmaFlags::EXEC | VmaFlags::USER,
    ));

    let stack_base = USER_STACK_TOP - USER_STACK_SIZE;
    vmm::map_user_memory(
        root,
        VirtualAddress::new(stack_base),
        None,
        USER_STACK_SIZE as usize,
        true,
    )?;
    vmas.push(Vma::new(
        stack_base,
        USER_STACK_TOP,
        VmaFlags::READ | VmaFlags::WRITE | VmaFlags::USER,
    ));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;

    fn cleanup(pid: Pid) {
        let p = table::with_table(|t| t.remove(pid)).unwrap();
        if let Some(root) = p.root {
            lifecycle::destroy_image(root, &p.vmas);
        }
        frame_allocator::free_frames(p.kstack, KERNEL_STACK_PAGES);
        crate::sched::remove_from_queue(pid);
    }

    #[test]
    fn kernel_thread_is_seeded_for_first_dispatch() {
        let _serial = test_support::proc_serial();
        test_support::init_test_memory();

        extern "C" fn noop(_: usize) {}
        let pid = process_create("worker", noop, 77).unwrap();

        table::with_process(pid, |p| {
            assert_eq!(p.state, ProcessState::Ready);
            assert_eq!(p.kentry, Some((noop as usize, 77)));
            assert_eq!(p.context.ra, kernel_thread_entry as usize as u64);
            assert_eq!(p.context.sp, p.kstack_top());
            assert!(p.root.is_none());
        })
        .unwrap();

        cleanup(pid);
    }

    #[test]
    fn user_process_layout_and_trap_frame() {
        let _serial = test_support::proc_serial();
        test_support::init_test_memory();

        let code = [0x13u8, 0, 0, 0, 0x13, 0, 0, 0]; // two nops
        let pid = process_create_user("shell", &code).unwrap();

        table::with_process(pid, |p| {
            let root = p.root.unwrap();

            // Code is mapped at the code base.
            let pa = vmm::translate(root, VirtualAddress::new(USER_CODE_BASE)).unwrap();
            // SAFETY: pa belongs to the image page in the test pool.
            assert_eq!(unsafe { *pa.as_ptr() }, 0x13);

            // Stack top - 1 resolves; the top itself is an exclusive
            // bound and stays unmapped.
            assert!(vmm::translate(root, VirtualAddress::new(USER_STACK_TOP - 1)).is_ok());
            assert!(vmm::translate(root, VirtualAddress::new(USER_STACK_TOP)).is_err());

            // Trampoline page is present with the sigreturn sequence.
            let tramp = vmm::translate(
                root,
                VirtualAddress::new(crate::mm::layout::USER_SIGTRAMP_BASE),
            )
            .unwrap();
            // SAFETY: trampoline page in the test pool.
            let first_insn = unsafe { *(tramp.as_ptr() as *const u32) };
            assert_eq!(first_insn, 0x0160_0893);

            // Three VMAs: trampoline, code, stack; the stack is last.
            assert_eq!(p.vmas.len(), 3);
            assert!(p.vmas.iter().any(|v| v.is_stack()));

            // Trap frame: user entry, full stack, SPP=user, SPIE set.
            // SAFETY: the frame was seeded at creation.
            let frame = unsafe { &*p.trap_frame_ptr() };
            assert_eq!(frame.sepc, USER_CODE_BASE);
            assert_eq!(frame.sp(), USER_STACK_TOP);
            assert!(frame.from_user());
            assert_ne!(
                frame.sstatus & crate::arch::riscv64::trap::SSTATUS_SPIE,
                0
            );
        })
        .unwrap();

        cleanup(pid);
    }

    #[test]
    fn table_full_releases_the_whole_image() {
        let _serial = test_support::proc_serial();
        test_support::init_test_memory();

        extern "C" fn noop(_: usize) {}
        let mut fillers = alloc::vec::Vec::new();
        loop {
            match process_create("filler", noop, 0) {
                Ok(pid) => fillers.push(pid),
                Err(e) => {
                    assert!(matches!(
                        e,
                        KernelError::Process(ProcessError::TableFull)
                    ));
                    break;
                }
            }
        }

        // A user process cannot be inserted either, and everything it
        // allocated on the way (root, trampoline, code, stack, kstack)
        // must come back.
        let free_before = frame_allocator::stats().1;
        let code = [0x13u8, 0, 0, 0];
        assert!(matches!(
            process_create_user("rejected", &code),
            Err(KernelError::Process(ProcessError::TableFull))
        ));
        assert_eq!(frame_allocator::stats().1, free_before);

        for pid in fillers {
            cleanup(pid);
        }
    }
}
