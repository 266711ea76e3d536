//! Kernel logging backend.
//!
//! Implements the `log` facade for the whole kernel: records are formatted
//! to the UART console with a level + target prefix, and additionally
//! recorded into a fixed-size, heap-free circular buffer of structured
//! entries (tick, level, target, truncated message) for post-mortem
//! inspection. Once full the buffer wraps and overwrites the oldest
//! entries.

use core::fmt::Write;

use spin::Mutex;

/// Capacity of the circular entry buffer.
const LOG_BUFFER_CAPACITY: usize = 256;

/// Maximum stored message length per entry.
const LOG_MESSAGE_MAX_LEN: usize = 128;

/// Maximum stored target (module path) length per entry.
const LOG_TARGET_MAX_LEN: usize = 24;

/// One structured log record. All fields are inline fixed-size arrays so
/// the buffer needs no heap.
#[derive(Clone, Copy)]
pub struct LogEntry {
    pub tick: u64,
    pub level: log::Level,
    target: [u8; LOG_TARGET_MAX_LEN],
    target_len: u8,
    message: [u8; LOG_MESSAGE_MAX_LEN],
    message_len: u8,
}

impl LogEntry {
    const fn empty() -> Self {
        Self {
            tick: 0,
            level: log::Level::Info,
            target: [0; LOG_TARGET_MAX_LEN],
            target_len: 0,
            message: [0; LOG_MESSAGE_MAX_LEN],
            message_len: 0,
        }
    }

    pub fn target(&self) -> &str {
        core::str::from_utf8(&self.target[..self.target_len as usize]).unwrap_or("?")
    }

    pub fn message(&self) -> &str {
        core::str::from_utf8(&self.message[..self.message_len as usize]).unwrap_or("?")
    }
}

struct LogBuffer {
    entries: [LogEntry; LOG_BUFFER_CAPACITY],
    /// Index of the next slot to write.
    head: usize,
    /// Total records ever written (so count = min(written, capacity)).
    written: u64,
}

impl LogBuffer {
    const fn new() -> Self {
        Self {
            entries: [LogEntry::empty(); LOG_BUFFER_CAPACITY],
            head: 0,
            written: 0,
        }
    }

    fn push(&mut self, entry: LogEntry) {
        self.entries[self.head] = entry;
        self.head = (self.head + 1) % LOG_BUFFER_CAPACITY;
        self.written += 1;
    }

    fn count(&self) -> usize {
        (self.written as usize).min(LOG_BUFFER_CAPACITY)
    }
}

static LOG_BUFFER: Mutex<LogBuffer> = Mutex::new(LogBuffer::new());

/// Writer that fills a fixed byte buffer, silently truncating.
struct FixedWriter<'a> {
    buf: &'a mut [u8],
    len: usize,
}

impl Write for FixedWriter<'_> {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let space = self.buf.len() - self.len;
        let take = space.min(s.len());
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

fn copy_truncated(dst: &mut [u8], src: &str) -> u8 {
    let take = dst.len().min(src.len());
    dst[..take].copy_from_slice(&src.as_bytes()[..take]);
    take as u8
}

struct KernelLog;

impl log::Log for KernelLog {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        crate::println!("[{:5}] {}: {}", record.level(), record.target(), record.args());

        let mut entry = LogEntry::empty();
        entry.tick = crate::arch::riscv64::timer::get_ticks();
        entry.level = record.level();
        entry.target_len = copy_truncated(&mut entry.target, record.target());
        let mut writer = FixedWriter {
            buf: &mut entry.message,
            len: 0,
        };
        let _ = write!(writer, "{}", record.args());
        entry.message_len = writer.len as u8;

        LOG_BUFFER.lock().push(entry);
    }

    fn flush(&self) {}
}

static KERNEL_LOG: KernelLog = KernelLog;

/// Install the kernel logger. Must run right after the console comes up so
/// every subsystem init logs through the facade.
pub fn init() {
    if log::set_logger(&KERNEL_LOG).is_ok() {
        log::set_max_level(log::LevelFilter::Info);
    }
}

/// Number of records currently held in the circular buffer.
pub fn klog_count() -> usize {
    LOG_BUFFER.lock().count()
}

/// Visit buffered records, oldest first.
pub fn klog_for_each(mut f: impl FnMut(&LogEntry)) {
    let buf = LOG_BUFFER.lock();
    let count = buf.count();
    let start = if buf.written as usize > LOG_BUFFER_CAPACITY {
        buf.head
    } else {
        0
    };
    for i in 0..count {
        f(&buf.entries[(start + i) % LOG_BUFFER_CAPACITY]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_wraps_and_keeps_latest_entries() {
        let mut buf = LogBuffer::new();
        for i in 0..(LOG_BUFFER_CAPACITY + 10) {
            let mut e = LogEntry::empty();
            e.tick = i as u64;
            buf.push(e);
        }
        assert_eq!(buf.count(), LOG_BUFFER_CAPACITY);
        // Oldest surviving entry is number 10.
        assert_eq!(buf.entries[buf.head].tick, 10);
    }

    #[test]
    fn messages_are_truncated_not_dropped() {
        let mut entry = LogEntry::empty();
        let long = "x".repeat(LOG_MESSAGE_MAX_LEN * 2);
        let mut writer = FixedWriter {
            buf: &mut entry.message,
            len: 0,
        };
        write!(writer, "{}", long).unwrap();
        entry.message_len = writer.len as u8;
        assert_eq!(entry.message().len(), LOG_MESSAGE_MAX_LEN);
    }

    #[test]
    fn target_roundtrips() {
        let mut e = LogEntry::empty();
        e.target_len = copy_truncated(&mut e.target, "thunderos_kernel::mm");
        assert_eq!(e.target(), "thunderos_kernel::mm");
    }
}
