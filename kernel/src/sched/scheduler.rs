//! The scheduler core.
//!
//! Single CPU, FIFO ready queue, fixed quantum. Preemption happens from
//! the timer tick; voluntary switches through `yield_now` and the
//! blocking primitives in [`crate::process::lifecycle`]. Critical
//! sections run with supervisor interrupts disabled -- every queue or
//! table access below goes through an interrupt-guarded helper.

use core::sync::atomic::{AtomicU32, Ordering};

use spin::Mutex;

use super::queue::ReadyQueue;
use crate::arch::riscv64::context::{context_switch, Context};
use crate::process::{lifecycle, table, Pid, ProcessState, QUANTUM_TICKS};

static READY: Mutex<ReadyQueue> = Mutex::new(ReadyQueue::new());

/// Context of the boot stack, switched away from when the first process
/// is dispatched.
static BOOT_CONTEXT: Mutex<Context> = Mutex::new(Context::zeroed());

/// Ticks left in the current process's quantum.
static QUANTUM_LEFT: AtomicU32 = AtomicU32::new(QUANTUM_TICKS);

pub fn init() {
    log::info!("scheduler: round-robin, quantum {} ticks", QUANTUM_TICKS);
}

/// Put `pid` on the ready queue tail.
pub fn enqueue(pid: Pid) {
    let _irq = crate::arch::disable_interrupts();
    READY.lock().push(pid);
}

/// Drop `pid` from the ready queue (teardown paths).
pub fn remove_from_queue(pid: Pid) {
    let _irq = crate::arch::disable_interrupts();
    READY.lock().remove(pid);
}

/// Number of READY processes queued.
pub fn ready_count() -> usize {
    let _irq = crate::arch::disable_interrupts();
    READY.lock().len()
}

/// Timer-tick hook, called from trap context with interrupts disabled.
///
/// Charges one tick of cpu time to the current process, wakes expired
/// timed sleepers, and preempts the current process when its quantum
/// runs out.
pub fn timer_tick() {
    table::with_current(|p| p.cpu_time += 1);

    wake_expired_sleepers();

    let remaining = QUANTUM_LEFT.fetch_sub(1, Ordering::AcqRel);
    if remaining <= 1 {
        QUANTUM_LEFT.store(QUANTUM_TICKS, Ordering::Release);
        // Only a RUNNING process can be preempted; when the tick lands
        // mid-block (current is SLEEPING or ZOMBIE) the switch is already
        // in progress.
        if table::with_current(|p| p.state) == Some(ProcessState::Running) {
            yield_now();
        }
    }
}

fn wake_expired_sleepers() {
    let now = crate::arch::riscv64::timer::get_ticks();
    let woken = table::with_table(|t| {
        let mut woken = alloc::vec::Vec::new();
        for p in t.iter_mut() {
            if p.state == ProcessState::Sleeping
                && p.wait_channel == lifecycle::CHAN_TIMER
                && p.wakeup_tick <= now
            {
                p.state = ProcessState::Ready;
                p.wait_channel = 0;
                woken.push(p.pid);
            }
        }
        woken
    });
    for pid in woken {
        enqueue(pid);
    }
}

/// Voluntarily give up the CPU: the current process goes back to READY
/// and the head of the queue runs.
pub fn yield_now() {
    let changed = table::with_current(|p| {
        if p.state == ProcessState::Running {
            p.state = ProcessState::Ready;
            true
        } else {
            false
        }
    });
    if changed != Some(true) {
        // Nothing to put back (boot context, or already blocked): a plain
        // schedule still picks the next runnable process.
        if table::current_pid().is_none() {
            return;
        }
    }
    schedule();
}

/// Dispatch the next READY process.
///
/// Returns into the caller's context when this execution is eventually
/// switched back to -- or immediately when the queue is empty and the
/// current process is still RUNNING. With nothing runnable at all, idles
/// in `wfi` until an interrupt makes something READY.
pub fn schedule() {
    let _irq = crate::arch::disable_interrupts();

    loop {
        let next = {
            let mut ready = READY.lock();
            ready.pop()
        };

        match next {
            Some(next_pid) => {
                dispatch(next_pid);
                return;
            }
            None => {
                let current_state = table::with_current(|p| p.state);
                match current_state {
                    // Quantum expired with an empty queue: keep running.
                    Some(ProcessState::Running) => return,
                    // Blocked or exiting with nothing else runnable, or
                    // no process at all: idle until an interrupt. The
                    // timer handler must be able to run (it is what makes
                    // processes READY again), so interrupts are enabled
                    // across the wfi and masked again before the queue is
                    // re-checked. The guard is forgotten: the outer guard
                    // restores the caller's state on exit.
                    _ => {
                        crate::arch::enable_interrupts();
                        crate::arch::wait_for_interrupt();
                        core::mem::forget(crate::arch::disable_interrupts());
                    }
                }
            }
        }
    }
}

/// Switch from the current execution to `next_pid`.
///
/// Interrupts are disabled by the caller. The raw context pointers stay
/// valid across the switch: PCB slots are only reclaimed by `wait`, which
/// runs strictly after the dying process has been switched away from.
fn dispatch(next_pid: Pid) {
    let current = table::current_pid();

    let (old_ctx, new_ctx, next_root) = table::with_table(|t| {
        // Requeue the outgoing process when it is still READY.
        if let Some(cur) = current {
            if let Some(p) = t.get_mut(cur) {
                if p.state == ProcessState::Ready {
                    // Tail of the FIFO, after the one we just popped.
                    READY.lock().push(cur);
                }
            }
        }

        let old_ctx: *mut Context = match current.and_then(|cur| t.get_mut(cur)) {
            Some(p) => &mut p.context as *mut Context,
            None => {
                let mut boot = BOOT_CONTEXT.lock();
                &mut *boot as *mut Context
            }
        };

        let next = t.get_mut(next_pid).expect("ready pid vanished");
        next.state = ProcessState::Running;
        let new_ctx: *const Context = &next.context as *const Context;
        let next_root = next.root;
        (old_ctx, new_ctx, next_root)
    });

    table::set_current(Some(next_pid));
    QUANTUM_LEFT.store(QUANTUM_TICKS, Ordering::Release);

    // User processes run on their own root; kernel threads on the kernel
    // root.
    match next_root {
        Some(root) => crate::mm::vmm::switch_root(root),
        None => crate::mm::vmm::switch_root(crate::mm::vmm::kernel_root_addr()),
    }

    // SAFETY: both contexts live in PCB slots (or the boot context
    // static) that outlive the switch; interrupts are disabled.
    unsafe {
        context_switch(old_ctx, new_ctx);
    }

    // Back on this context: we are the current process again.
}

/// Enter the scheduler for good. The boot context is abandoned once the
/// first process runs and only briefly revisited when the queue drains.
pub fn run() -> ! {
    log::info!("scheduler: dispatching first process");
    loop {
        schedule();
    }
}
