//! Global process table.
//!
//! A bounded arena of [`MAX_PROCS`] slots indexed by scan, keyed by pid.
//! All access happens with interrupts disabled (the timer tick touches the
//! table from trap context), through the `with_*` helpers. The helpers
//! must not be nested: the table lock is not reentrant.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use lazy_static::lazy_static;
use spin::Mutex;

use super::{Pid, Process, MAX_PROCS};

pub struct ProcessTable {
    slots: Vec<Option<Box<Process>>>,
    next_pid: u64,
}

impl ProcessTable {
    fn new() -> Self {
        Self {
            slots: (0..MAX_PROCS).map(|_| None).collect(),
            next_pid: 1,
        }
    }

    /// Hand out the next pid.
    pub fn alloc_pid(&mut self) -> Pid {
        let pid = Pid(self.next_pid);
        self.next_pid += 1;
        pid
    }

    /// Place a process into a free slot. On a full table the PCB is
    /// handed back so the caller can release its resources.
    pub fn insert(&mut self, process: Box<Process>) -> Result<(), Box<Process>> {
        match self.slots.iter_mut().find(|s| s.is_none()) {
            Some(slot) => {
                *slot = Some(process);
                Ok(())
            }
            None => Err(process),
        }
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Process> {
        self.slots
            .iter_mut()
            .filter_map(|s| s.as_mut())
            .find(|p| p.pid == pid)
            .map(|b| &mut **b)
    }

    /// Remove the process with `pid`, returning its PCB.
    pub fn remove(&mut self, pid: Pid) -> Option<Box<Process>> {
        for slot in self.slots.iter_mut() {
            if slot.as_ref().map(|p| p.pid == pid).unwrap_or(false) {
                return slot.take();
            }
        }
        None
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Box<Process>> {
        self.slots.iter_mut().filter_map(|s| s.as_mut())
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

lazy_static! {
    static ref PROCESS_TABLE: Mutex<ProcessTable> = Mutex::new(ProcessTable::new());
}

/// pid of the process currently on the CPU (0 = none).
static CURRENT: AtomicU64 = AtomicU64::new(0);

pub fn init() {
    // Force construction of the lazy table during boot, not on first use.
    let _ = PROCESS_TABLE.lock().len();
}

pub fn current_pid() -> Option<Pid> {
    match CURRENT.load(Ordering::Acquire) {
        0 => None,
        pid => Some(Pid(pid)),
    }
}

pub fn set_current(pid: Option<Pid>) {
    CURRENT.store(pid.map(|p| p.0).unwrap_or(0), Ordering::Release);
}

/// Run `f` against the table with interrupts disabled.
pub fn with_table<R>(f: impl FnOnce(&mut ProcessTable) -> R) -> R {
    let _irq = crate::arch::disable_interrupts();
    let mut table = PROCESS_TABLE.lock();
    f(&mut table)
}

/// Run `f` against the process `pid`, if it exists.
pub fn with_process<R>(pid: Pid, f: impl FnOnce(&mut Process) -> R) -> Option<R> {
    with_table(|t| t.get_mut(pid).map(f))
}

/// Run `f` against the current process, if there is one.
pub fn with_current<R>(f: impl FnOnce(&mut Process) -> R) -> Option<R> {
    current_pid().and_then(|pid| with_process(pid, f))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::PhysicalAddress;
    use crate::process::ProcessState;
    use crate::test_support;

    #[test]
    fn pids_are_monotonic_and_lookup_works() {
        let _serial = test_support::proc_serial();
        let (a, b) = with_table(|t| {
            let a = t.alloc_pid();
            let b = t.alloc_pid();
            (a, b)
        });
        assert!(b.0 > a.0);

        with_table(|t| {
            t.insert(Box::new(Process::new(a, "one", PhysicalAddress::new(0))))
                .unwrap();
            assert!(t.get_mut(a).is_some());
            assert!(t.get_mut(Pid(9999)).is_none());
            let removed = t.remove(a).unwrap();
            assert_eq!(removed.pid, a);
            assert!(t.get_mut(a).is_none());
        });
    }

    #[test]
    fn table_capacity_is_bounded() {
        let _serial = test_support::proc_serial();
        let inserted: Vec<Pid> = with_table(|t| {
            let mut pids = Vec::new();
            loop {
                let pid = t.alloc_pid();
                let proc_box = Box::new(Process::new(pid, "filler", PhysicalAddress::new(0)));
                match t.insert(proc_box) {
                    Ok(()) => pids.push(pid),
                    Err(_rejected) => break,
                }
            }
            pids
        });
        assert!(!inserted.is_empty());

        with_table(|t| {
            for pid in &inserted {
                t.remove(*pid);
            }
        });
    }

    #[test]
    fn current_register_roundtrips() {
        let _serial = test_support::proc_serial();
        assert_eq!(current_pid(), None);
        set_current(Some(Pid(7)));
        assert_eq!(current_pid(), Some(Pid(7)));
        set_current(None);
        assert_eq!(current_pid(), None);
    }

    #[test]
    fn with_process_sees_mutations() {
        let _serial = test_support::proc_serial();
        let pid = with_table(|t| {
            let pid = t.alloc_pid();
            t.insert(Box::new(Process::new(pid, "mut", PhysicalAddress::new(0))))
                .unwrap();
            pid
        });
        with_process(pid, |p| p.state = ProcessState::Ready).unwrap();
        assert_eq!(
            with_process(pid, |p| p.state),
            Some(ProcessState::Ready)
        );
        with_table(|t| t.remove(pid));
    }
}
