//! Supervisor timer: the scheduler's tick source.
//!
//! The QEMU virt machine exposes a 10 MHz timebase. Each tick reprograms
//! the comparator through the SBI TIME extension; the tick counter is the
//! kernel's only notion of wall-clock progress.

use core::sync::atomic::{AtomicU64, Ordering};

use super::sbi;

/// Timebase frequency of the qemu virt machine (Hz).
pub const TIMEBASE_FREQ: u64 = 10_000_000;

/// Scheduler tick rate (Hz).
pub const TICK_HZ: u64 = 100;

/// Timebase cycles per tick.
pub const TICK_INTERVAL: u64 = TIMEBASE_FREQ / TICK_HZ;

static TICKS: AtomicU64 = AtomicU64::new(0);

/// Monotonically non-decreasing tick count since boot.
pub fn get_ticks() -> u64 {
    TICKS.load(Ordering::Relaxed)
}

/// Enable the supervisor timer interrupt and schedule the first tick.
pub fn init() {
    #[cfg(target_arch = "riscv64")]
    {
        // SAFETY: setting sie.STIE only unmasks the supervisor timer
        // interrupt; the trap vector is already installed.
        unsafe { riscv::register::sie::set_stimer() };
        sbi::set_timer(super::read_time() + TICK_INTERVAL);
    }
    log::info!("timer: {} Hz tick, {} Hz timebase", TICK_HZ, TIMEBASE_FREQ);
}

/// Timer interrupt handler: advance the tick counter, arm the next
/// comparator, then let the scheduler account and possibly preempt.
pub fn handle_interrupt() {
    TICKS.fetch_add(1, Ordering::Relaxed);
    sbi::set_timer(super::read_time() + TICK_INTERVAL);
    crate::sched::timer_tick();
}

/// Test-only manual tick advance (the interrupt path needs hardware).
#[cfg(test)]
pub fn advance_ticks_for_test(n: u64) {
    TICKS.fetch_add(n, Ordering::Relaxed);
}
