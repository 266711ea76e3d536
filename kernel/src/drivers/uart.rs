//! NS16550A UART console driver.
//!
//! The qemu virt machine exposes a 16550-compatible UART at `0x1000_0000`.
//! The driver is strictly polling: TX waits on LSR.THRE, RX checks LSR.DR.
//! Console fds 0/1/2 in the VFS route here.

// Register constants are unused on host builds
#![allow(dead_code)]

use core::fmt;

use spin::Mutex;

use crate::mm::layout::UART0_BASE;

// Register offsets (byte-wide).
const RBR: usize = 0x00; // receive buffer (read)
const THR: usize = 0x00; // transmit holding (write)
const IER: usize = 0x01; // interrupt enable
const FCR: usize = 0x02; // FIFO control
const LCR: usize = 0x03; // line control
const MCR: usize = 0x04; // modem control
const LSR: usize = 0x05; // line status

const LSR_DATA_READY: u8 = 0x01;
const LSR_THR_EMPTY: u8 = 0x20;

/// A memory-mapped 16550 UART.
pub struct Uart {
    base: usize,
}

impl Uart {
    pub const fn new(base: usize) -> Self {
        Self { base }
    }

    /// 8N1, FIFOs enabled and cleared, interrupts masked (polling only).
    pub fn init(&mut self) {
        #[cfg(target_arch = "riscv64")]
        // SAFETY: base points at the UART register block, mapped by the
        // platform; byte-wide accesses are valid for all 16550 registers.
        unsafe {
            crate::arch::mmio::write8(self.base + IER, 0x00);
            crate::arch::mmio::write8(self.base + FCR, 0x07);
            crate::arch::mmio::write8(self.base + LCR, 0x03);
            crate::arch::mmio::write8(self.base + MCR, 0x03);
        }
    }

    /// Blocking single-byte transmit.
    pub fn put_byte(&mut self, byte: u8) {
        #[cfg(target_arch = "riscv64")]
        // SAFETY: base points at the UART register block.
        unsafe {
            while crate::arch::mmio::read8(self.base + LSR) & LSR_THR_EMPTY == 0 {
                core::hint::spin_loop();
            }
            crate::arch::mmio::write8(self.base + THR, byte);
        }

        #[cfg(not(target_arch = "riscv64"))]
        {
            let _ = byte;
        }
    }

    /// Non-blocking single-byte receive.
    pub fn try_get_byte(&mut self) -> Option<u8> {
        #[cfg(target_arch = "riscv64")]
        // SAFETY: base points at the UART register block.
        unsafe {
            if crate::arch::mmio::read8(self.base + LSR) & LSR_DATA_READY != 0 {
                return Some(crate::arch::mmio::read8(self.base + RBR));
            }
            None
        }

        #[cfg(not(target_arch = "riscv64"))]
        {
            None
        }
    }
}

impl fmt::Write for Uart {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.put_byte(b'\r');
            }
            self.put_byte(byte);
        }
        Ok(())
    }
}

static CONSOLE: Mutex<Uart> = Mutex::new(Uart::new(UART0_BASE));

/// Initialize the console UART. Must run before the first `println!`.
pub fn init() {
    CONSOLE.lock().init();
}

/// Formatted output to the console (used by the `print!` macros).
pub fn console_print(args: fmt::Arguments) {
    use fmt::Write;
    let _ = CONSOLE.lock().write_fmt(args);
}

/// Raw byte output, used by `write` on the console fds. Returns the number
/// of bytes written.
pub fn write_bytes(data: &[u8]) -> usize {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    {
        let mut uart = CONSOLE.lock();
        for &b in data {
            if b == b'\n' {
                uart.put_byte(b'\r');
            }
            uart.put_byte(b);
        }
        data.len()
    }

    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        #[cfg(not(target_os = "none"))]
        {
            use std::io::Write;
            let _ = std::io::stdout().write_all(data);
        }
        data.len()
    }
}

/// Blocking byte read, used by `read` on fd 0. Echoes the byte back and
/// translates CR to LF the way a line-oriented shell expects.
pub fn read_byte_blocking() -> u8 {
    loop {
        if let Some(b) = CONSOLE.lock().try_get_byte() {
            let b = if b == b'\r' { b'\n' } else { b };
            write_bytes(&[b]);
            return b;
        }
        // Nothing pending: let the scheduler run someone else.
        crate::sched::yield_now();
    }
}

/// Non-blocking byte read for polling callers.
pub fn try_read_byte() -> Option<u8> {
    CONSOLE.lock().try_get_byte()
}
