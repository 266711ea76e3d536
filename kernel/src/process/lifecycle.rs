//! Process lifecycle: exit, wait, sleep/wakeup.

use super::table;
use super::{Pid, ProcessState, Vma, KERNEL_STACK_PAGES};
use crate::error::{KernelError, ProcessError};
use crate::mm::{frame_allocator, vmm, PhysicalAddress, VirtualAddress};

/// Wait-channel id for timed sleeps.
pub const CHAN_TIMER: usize = 1;

/// Wait channel a parent blocks on while waiting for children.
pub fn child_wait_channel(parent: Pid) -> usize {
    0x1000 + parent.0 as usize
}

/// Free a user image: every page of every VMA goes back to the PMM, then
/// the page-table tree itself (interior nodes only; the VMA walk just
/// freed the leaves).
pub fn destroy_image(root: PhysicalAddress, vmas: &[Vma]) {
    for vma in vmas {
        vmm::unmap_and_free_range(
            root,
            VirtualAddress::new(vma.start),
            vma.pages() as usize,
        );
    }
    vmm::free_root_tree(root);
}

/// Terminate the current process. Closes its fds, tears down its user
/// image, marks it ZOMBIE (pid and exit code retained for the parent),
/// reparents its children to init, and wakes a waiting parent. Never
/// returns: the scheduler dispatches someone else.
pub fn exit_current(code: i32) -> ! {
    let pid = table::current_pid().expect("exit without a current process");

    crate::fs::file::close_all_owned_by(pid.0);

    // Leave this root before freeing it.
    vmm::switch_root(vmm::kernel_root_addr());

    let (root, vmas, parent) = table::with_process(pid, |p| {
        (p.root.take(), core::mem::take(&mut p.vmas), p.parent)
    })
    .expect("current process vanished during exit");

    if let Some(root) = root {
        destroy_image(root, &vmas);
    }

    // Orphans are adopted by init so someone reaps them.
    table::with_table(|t| {
        for p in t.iter_mut() {
            if p.parent == Some(pid) {
                p.parent = Some(super::INIT_PID);
            }
        }
    });

    table::with_process(pid, |p| {
        p.state = ProcessState::Zombie;
        p.exit_code = code;
    });
    log::debug!("pid {} exited with code {}", pid, code);

    if let Some(parent) = parent {
        wakeup(child_wait_channel(parent));
    }

    loop {
        crate::sched::schedule();
    }
}

/// Block until a child exits, then reap it: the PCB slot is released and
/// `(pid, exit code)` returned. Fails with NoChildren when the caller has
/// no children at all.
pub fn wait_for_child() -> Result<(Pid, i32), KernelError> {
    let me = table::current_pid().ok_or(KernelError::Process(ProcessError::NoSuchProcess {
        pid: 0,
    }))?;

    loop {
        enum Scan {
            Reap(Pid),
            Waiting,
            NoChildren,
        }

        let scan = table::with_table(|t| {
            let mut have_children = false;
            for p in t.iter_mut() {
                if p.parent != Some(me) {
                    continue;
                }
                have_children = true;
                if p.state == ProcessState::Zombie {
                    return Scan::Reap(p.pid);
                }
            }
            if have_children {
                Scan::Waiting
            } else {
                Scan::NoChildren
            }
        });

        match scan {
            Scan::Reap(child) => {
                let mut pcb = table::with_table(|t| t.remove(child))
                    .expect("zombie child vanished before reap");
                pcb.state = ProcessState::Unused;
                frame_allocator::free_frames(pcb.kstack, KERNEL_STACK_PAGES);
                return Ok((child, pcb.exit_code));
            }
            Scan::NoChildren => return Err(ProcessError::NoChildren.into()),
            Scan::Waiting => sleep_on(child_wait_channel(me)),
        }
    }
}

/// Block the current process on `chan` and run someone else. Returns when
/// a matching [`wakeup`] (or a signal) makes it READY again.
pub fn sleep_on(chan: usize) {
    debug_assert_ne!(chan, 0);
    table::with_current(|p| {
        p.state = ProcessState::Sleeping;
        p.wait_channel = chan;
    });
    crate::sched::schedule();
    table::with_current(|p| p.wait_channel = 0);
}

/// Make every process sleeping on `chan` READY.
pub fn wakeup(chan: usize) {
    let woken = table::with_table(|t| {
        let mut woken = alloc::vec::Vec::new();
        for p in t.iter_mut() {
            if p.state == ProcessState::Sleeping && p.wait_channel == chan {
                p.state = ProcessState::Ready;
                p.wait_channel = 0;
                woken.push(p.pid);
            }
        }
        woken
    });
    for pid in woken {
        crate::sched::enqueue(pid);
    }
}

/// Sleep for `ticks` timer ticks.
pub fn sleep_ticks(ticks: u64) {
    let now = crate::arch::riscv64::timer::get_ticks();
    table::with_current(|p| p.wakeup_tick = now + ticks);
    sleep_on(CHAN_TIMER);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::Process;
    use crate::test_support;
    use alloc::boxed::Box;

    fn insert_proc(name: &str, parent: Option<Pid>, state: ProcessState) -> Pid {
        table::with_table(|t| {
            let pid = t.alloc_pid();
            let kstack = frame_allocator::alloc_frames(KERNEL_STACK_PAGES).unwrap();
            let mut p = Process::new(pid, name, kstack);
            p.parent = parent;
            p.state = state;
            t.insert(Box::new(p)).ok().unwrap();
            pid
        })
    }

    #[test]
    fn wakeup_moves_sleepers_to_ready() {
        let _serial = test_support::proc_serial();
        test_support::init_test_memory();

        let a = insert_proc("a", None, ProcessState::Sleeping);
        let b = insert_proc("b", None, ProcessState::Sleeping);
        table::with_process(a, |p| p.wait_channel = 99);
        table::with_process(b, |p| p.wait_channel = 77);

        wakeup(99);
        assert_eq!(
            table::with_process(a, |p| p.state),
            Some(ProcessState::Ready)
        );
        assert_eq!(
            table::with_process(b, |p| p.state),
            Some(ProcessState::Sleeping)
        );

        crate::sched::remove_from_queue(a);
        for pid in [a, b] {
            let p = table::with_table(|t| t.remove(pid)).unwrap();
            frame_allocator::free_frames(p.kstack, KERNEL_STACK_PAGES);
        }
    }

    #[test]
    fn wait_reaps_zombie_children() {
        let _serial = test_support::proc_serial();
        test_support::init_test_memory();

        let parent = insert_proc("parent", None, ProcessState::Running);
        table::set_current(Some(parent));

        let child = insert_proc("child", Some(parent), ProcessState::Zombie);
        table::with_process(child, |p| p.exit_code = 42);

        let (reaped, code) = wait_for_child().unwrap();
        assert_eq!(reaped, child);
        assert_eq!(code, 42);
        // The slot is gone.
        assert!(table::with_process(child, |p| p.pid).is_none());

        // Without children, wait fails immediately.
        assert!(matches!(
            wait_for_child(),
            Err(KernelError::Process(ProcessError::NoChildren))
        ));

        table::set_current(None);
        let p = table::with_table(|t| t.remove(parent)).unwrap();
        frame_allocator::free_frames(p.kstack, KERNEL_STACK_PAGES);
    }

    #[test]
    fn destroy_image_returns_every_page() {
        let _serial = test_support::proc_serial();
        test_support::init_test_memory();
        let free_before = frame_allocator::stats().1;

        let root = vmm::create_user_root().unwrap();
        vmm::map_user_memory(
            root,
            VirtualAddress::new(0x10000),
            None,
            3 * crate::mm::FRAME_SIZE,
            true,
        )
        .unwrap();
        let vmas = [crate::process::Vma::new(
            0x10000,
            0x10000 + 3 * crate::mm::FRAME_SIZE as u64,
            crate::process::VmaFlags::READ | crate::process::VmaFlags::WRITE,
        )];
        destroy_image(root, &vmas);

        assert_eq!(frame_allocator::stats().1, free_before);
    }
}
