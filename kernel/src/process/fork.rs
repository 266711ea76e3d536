//! fork: duplicate the current user process.
//!
//! The child gets a fresh pid and user root, a deep copy of every parent
//! VMA page (same user addresses, same permissions), and a duplicate of
//! the parent's trap frame with `a0` forced to 0 -- that is how the two
//! returns of fork are told apart. The parent's return value is the child
//! pid.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;

use super::creation::user_entry_trampoline;
use super::lifecycle;
use super::signals::NSIG;
use super::table;
use super::{Pid, Process, ProcessState, Vma, VmaFlags, KERNEL_STACK_PAGES};
use crate::arch::riscv64::trap::TrapFrame;
use crate::error::{KernelError, ProcessError};
use crate::mm::page_table::PteFlags;
use crate::mm::{frame_allocator, vmm, PhysicalAddress, VirtualAddress, FRAME_SIZE};

/// Leaf flags for a page copied under `vma`.
fn pte_flags_for(vma: &Vma) -> PteFlags {
    let mut flags = PteFlags::VALID | PteFlags::USER | PteFlags::ACCESSED;
    if vma.flags.contains(VmaFlags::READ) {
        flags |= PteFlags::READ;
    }
    if vma.flags.contains(VmaFlags::WRITE) {
        flags |= PteFlags::WRITE | PteFlags::DIRTY;
    }
    if vma.flags.contains(VmaFlags::EXEC) {
        flags |= PteFlags::EXECUTE;
    }
    flags
}

/// Snapshot of the parent state fork needs outside the table lock.
struct ParentSnapshot {
    pid: Pid,
    name: String,
    root: PhysicalAddress,
    vmas: Vec<Vma>,
    cwd: String,
    sig_handlers: [u64; NSIG],
    heap_base: u64,
    heap_end: u64,
    priority: u8,
}

/// Duplicate the calling process. `parent_frame` is the live trap frame
/// of the fork syscall.
pub fn fork(parent_frame: &TrapFrame) -> Result<Pid, KernelError> {
    let parent = table::with_current(|p| {
        p.root.map(|root| ParentSnapshot {
            pid: p.pid,
            name: p.name.clone(),
            root,
            vmas: p.vmas.clone(),
            cwd: p.cwd.clone(),
            sig_handlers: p.sig_handlers,
            heap_base: p.heap_base,
            heap_end: p.heap_end,
            priority: p.priority,
        })
    })
    .flatten()
    .ok_or(KernelError::Process(ProcessError::NoSuchProcess { pid: 0 }))?;

    let child_root = vmm::create_user_root()?;

    // Deep-copy every parent page into the child at the same address.
    let mut copied: Vec<Vma> = Vec::new();
    for vma in &parent.vmas {
        if let Err(e) = copy_vma(parent.root, child_root, vma) {
            // Unwind whole copied VMAs plus whatever partial work copy_vma
            // already rolled back itself.
            lifecycle::destroy_image(child_root, &copied);
            return Err(e);
        }
        copied.push(*vma);
    }

    let kstack = match frame_allocator::alloc_frames(KERNEL_STACK_PAGES) {
        Ok(k) => k,
        Err(e) => {
            lifecycle::destroy_image(child_root, &copied);
            return Err(e);
        }
    };

    let child_pid = table::with_table(|t| t.alloc_pid());
    let mut child = Box::new(Process::new(child_pid, &parent.name, kstack));
    child.parent = Some(parent.pid);
    child.root = Some(child_root);
    child.vmas = copied;
    child.cwd = parent.cwd;
    child.sig_handlers = parent.sig_handlers;
    child.heap_base = parent.heap_base;
    child.heap_end = parent.heap_end;
    child.priority = parent.priority;

    // The child resumes exactly where the parent trapped, with a0 = 0.
    let mut frame = parent_frame.clone();
    frame.set_a0(0);
    let frame_ptr = child.trap_frame_ptr();
    // SAFETY: frame_ptr points into the child's freshly allocated kernel
    // stack.
    unsafe {
        core::ptr::write(frame_ptr, frame);
    }
    child.context.ra = user_entry_trampoline as usize as u64;
    child.context.sp = frame_ptr as u64;
    child.state = ProcessState::Ready;

    if let Err(rejected) = table::with_table(|t| t.insert(child)) {
        frame_allocator::free_frames(rejected.kstack, KERNEL_STACK_PAGES);
        lifecycle::destroy_image(child_root, &rejected.vmas);
        return Err(ProcessError::TableFull.into());
    }
    crate::sched::enqueue(child_pid);
    log::debug!("pid {} forked child {}", parent.pid, child_pid);
    Ok(child_pid)
}

/// Copy one VMA's pages from `src_root` into `dst_root`. On failure the
/// pages already installed for this VMA are unwound.
fn copy_vma(
    src_root: PhysicalAddress,
    dst_root: PhysicalAddress,
    vma: &Vma,
) -> Result<(), KernelError> {
    let flags = pte_flags_for(vma);
    let base = VirtualAddress::new(vma.start);

    for i in 0..vma.pages() as usize {
        let va = base.add(i * FRAME_SIZE);
        let src_pa = match vmm::translate(src_root, va) {
            Ok(pa) => pa,
            Err(e) => {
                vmm::unmap_and_free_range(dst_root, base, i);
                return Err(e);
            }
        };

        let page = match frame_allocator::alloc_frame() {
            Ok(p) => p,
            Err(e) => {
                vmm::unmap_and_free_range(dst_root, base, i);
                return Err(e);
            }
        };
        // SAFETY: src_pa is a live leaf translation (one full page);
        // `page` is a fresh frame we own.
        unsafe {
            core::ptr::copy_nonoverlapping(src_pa.as_ptr(), page.as_ptr(), FRAME_SIZE);
        }

        if let Err(e) = vmm::map(dst_root, va, page, flags) {
            frame_allocator::free_frame(page);
            vmm::unmap_and_free_range(dst_root, base, i);
            return Err(e);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::layout::USER_STACK_TOP;
    use crate::process::creation::process_create_user;
    use crate::test_support;

    fn cleanup(pid: Pid) {
        if let Some(p) = table::with_table(|t| t.remove(pid)) {
            if let Some(root) = p.root {
                lifecycle::destroy_image(root, &p.vmas);
            }
            frame_allocator::free_frames(p.kstack, KERNEL_STACK_PAGES);
        }
        crate::sched::remove_from_queue(pid);
        if table::current_pid() == Some(pid) {
            table::set_current(None);
        }
    }

    #[test]
    fn fork_deep_copies_the_image() {
        let _serial = test_support::proc_serial();
        test_support::init_test_memory();

        let code = [0x93u8, 0x08, 0x60, 0x01, 0x73, 0, 0, 0];
        let parent = process_create_user("parent", &code).unwrap();
        table::set_current(Some(parent));
        let parent_root = table::with_process(parent, |p| p.root.unwrap()).unwrap();

        // Scribble a marker into the parent's stack.
        let marker_va = VirtualAddress::new(USER_STACK_TOP - 128);
        let marker_pa = vmm::translate(parent_root, marker_va).unwrap();
        // SAFETY: stack page owned by the parent in the test pool.
        unsafe { *marker_pa.as_ptr() = 0xC7 };

        let mut frame = TrapFrame::zeroed();
        frame.set_a0(999);
        frame.sepc = 0x1_0004;
        frame.set_sp(USER_STACK_TOP - 256);
        let child = fork(&frame).unwrap();

        let (child_root, child_parent, child_state) =
            table::with_process(child, |p| (p.root.unwrap(), p.parent, p.state)).unwrap();
        assert_eq!(child_parent, Some(parent));
        assert_eq!(child_state, ProcessState::Ready);
        assert_ne!(child_root, parent_root);

        // Same addresses, different physical pages, same content.
        let child_marker_pa = vmm::translate(child_root, marker_va).unwrap();
        assert_ne!(child_marker_pa, marker_pa);
        // SAFETY: child stack page in the test pool.
        assert_eq!(unsafe { *child_marker_pa.as_ptr() }, 0xC7);

        // Copies are independent after the fork.
        // SAFETY: as above.
        unsafe { *marker_pa.as_ptr() = 0x11 };
        assert_eq!(unsafe { *child_marker_pa.as_ptr() }, 0xC7);

        // Child trap frame: a0 = 0, rest duplicated.
        table::with_process(child, |p| {
            // SAFETY: frame seeded by fork on the child's kstack.
            let child_frame = unsafe { &*p.trap_frame_ptr() };
            assert_eq!(child_frame.a0(), 0);
            assert_eq!(child_frame.sepc, 0x1_0004);
            assert_eq!(child_frame.sp(), USER_STACK_TOP - 256);
        })
        .unwrap();

        cleanup(child);
        cleanup(parent);
    }

    #[test]
    fn fork_requires_a_user_process() {
        let _serial = test_support::proc_serial();
        test_support::init_test_memory();
        table::set_current(None);
        let frame = TrapFrame::zeroed();
        assert!(fork(&frame).is_err());
    }

    #[test]
    fn fork_accounting_is_leak_free() {
        let _serial = test_support::proc_serial();
        test_support::init_test_memory();

        let code = [0x13u8, 0, 0, 0];
        let parent = process_create_user("p", &code).unwrap();
        table::set_current(Some(parent));

        let free_before = frame_allocator::stats().1;
        let frame = TrapFrame::zeroed();
        let child = fork(&frame).unwrap();
        cleanup(child);
        assert_eq!(frame_allocator::stats().1, free_before);

        cleanup(parent);
    }
}
