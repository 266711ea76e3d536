//! Global file descriptor table.
//!
//! 64 slots; 0/1/2 are reserved for the console (stdin/stdout/stderr) and
//! never occupy table storage. Each open slot records the owning mount,
//! the filesystem-private node handle, the current offset, the open
//! flags, and the pid that opened it (so `exit` can release the
//! process's descriptors). Allocation always yields indices >= 3.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use lazy_static::lazy_static;
use spin::Mutex;

use super::{FilesystemOps, NodeHandle, OpenFlags, Whence};
use crate::error::{FsError, KernelError};

/// Total fd slots, console fds included.
pub const MAX_FDS: usize = 64;

/// First allocatable fd.
const FIRST_FREE_FD: usize = 3;

/// An open file table slot.
pub struct OpenFile {
    pub fs: Arc<dyn FilesystemOps>,
    pub node: NodeHandle,
    pub offset: u64,
    pub flags: OpenFlags,
    /// Absolute VFS path, kept for stat-based SEEK_END.
    pub path: String,
    /// pid of the opener (0 = kernel).
    pub owner: u64,
}

struct FdTable {
    slots: Vec<Option<OpenFile>>,
}

impl FdTable {
    fn slot(&mut self, fd: i32) -> Result<&mut OpenFile, KernelError> {
        if fd < FIRST_FREE_FD as i32 || fd as usize >= MAX_FDS {
            return Err(KernelError::Fs(FsError::BadFileDescriptor));
        }
        self.slots[fd as usize]
            .as_mut()
            .ok_or(KernelError::Fs(FsError::BadFileDescriptor))
    }
}

lazy_static! {
    static ref FD_TABLE: Mutex<FdTable> = Mutex::new(FdTable {
        slots: (0..MAX_FDS).map(|_| None).collect(),
    });
}

/// Bring up the fd table. Slots 0/1/2 stay console-backed by construction.
pub fn init() {
    let table = FD_TABLE.lock();
    log::info!(
        "vfs: fd table ready, {} slots ({} reserved for console)",
        table.slots.len(),
        FIRST_FREE_FD
    );
}

/// Open `path` (absolute, normalized) with `flags` on behalf of `owner`.
pub fn vfs_open(path: &str, flags: OpenFlags, owner: u64) -> Result<i32, KernelError> {
    let (fs, residual) = super::resolve(path)?;
    let node = fs.open(&residual, flags)?;

    let mut table = FD_TABLE.lock();
    let fd = match table.slots[FIRST_FREE_FD..].iter().position(Option::is_none) {
        Some(i) => i + FIRST_FREE_FD,
        None => {
            // No slot: drop the filesystem handle again.
            let _ = fs.close(node);
            return Err(KernelError::Fs(FsError::TooManyOpenFiles));
        }
    };

    table.slots[fd] = Some(OpenFile {
        fs,
        node,
        offset: 0,
        flags,
        path: String::from(path),
        owner,
    });
    Ok(fd as i32)
}

/// Close `fd`. Closing a console fd is a no-op success.
pub fn vfs_close(fd: i32) -> Result<(), KernelError> {
    if (0..FIRST_FREE_FD as i32).contains(&fd) {
        return Ok(());
    }
    let file = {
        let mut table = FD_TABLE.lock();
        if fd < 0 || fd as usize >= MAX_FDS {
            return Err(KernelError::Fs(FsError::BadFileDescriptor));
        }
        table.slots[fd as usize]
            .take()
            .ok_or(KernelError::Fs(FsError::BadFileDescriptor))?
    };
    file.fs.close(file.node)
}

/// Read from `fd` at its current offset, advancing it by the bytes read.
/// fd 0 reads from the console.
pub fn vfs_read(fd: i32, buf: &mut [u8]) -> Result<usize, KernelError> {
    if fd == 0 {
        return Ok(console_read(buf));
    }
    if fd == 1 || fd == 2 {
        return Err(KernelError::Fs(FsError::BadFileDescriptor));
    }

    // Clone what we need, run the filesystem call unlocked, then update
    // the offset: filesystem reads can be slow (disk I/O).
    let (fs, node, offset, flags) = {
        let mut table = FD_TABLE.lock();
        let f = table.slot(fd)?;
        (f.fs.clone(), f.node, f.offset, f.flags)
    };
    if !flags.readable() {
        return Err(KernelError::Fs(FsError::AccessDenied));
    }

    let n = fs.read(node, offset, buf)?;

    let mut table = FD_TABLE.lock();
    if let Ok(f) = table.slot(fd) {
        f.offset = offset + n as u64;
    }
    Ok(n)
}

/// Write to `fd` at its current offset, advancing it by the bytes
/// written. fds 1/2 write to the console.
pub fn vfs_write(fd: i32, data: &[u8]) -> Result<usize, KernelError> {
    if fd == 1 || fd == 2 {
        return Ok(crate::drivers::uart::write_bytes(data));
    }
    if fd == 0 {
        return Err(KernelError::Fs(FsError::BadFileDescriptor));
    }

    let (fs, node, mut offset, flags, path) = {
        let mut table = FD_TABLE.lock();
        let f = table.slot(fd)?;
        (f.fs.clone(), f.node, f.offset, f.flags, f.path.clone())
    };
    if !flags.writable() {
        return Err(KernelError::Fs(FsError::AccessDenied));
    }
    if flags.contains(OpenFlags::APPEND) {
        let (fs_for_stat, residual) = super::resolve(&path)?;
        offset = fs_for_stat.stat(&residual)?.size;
    }

    let n = fs.write(node, offset, data)?;

    let mut table = FD_TABLE.lock();
    if let Ok(f) = table.slot(fd) {
        f.offset = offset + n as u64;
    }
    Ok(n)
}

/// Reposition `fd`. Delegates to the filesystem when it implements seek;
/// otherwise updates the stored offset locally (SEEK_END via stat).
pub fn vfs_seek(fd: i32, offset: i64, whence: Whence) -> Result<u64, KernelError> {
    if (0..FIRST_FREE_FD as i32).contains(&fd) {
        return Err(KernelError::Fs(FsError::BadFileDescriptor));
    }

    let (fs, node, current, path) = {
        let mut table = FD_TABLE.lock();
        let f = table.slot(fd)?;
        (f.fs.clone(), f.node, f.offset, f.path.clone())
    };

    if let Some(result) = fs.seek(node, offset, whence) {
        let new = result?;
        let mut table = FD_TABLE.lock();
        table.slot(fd)?.offset = new;
        return Ok(new);
    }

    let base: u64 = match whence {
        Whence::Set => 0,
        Whence::Cur => current,
        Whence::End => {
            let (fs_for_stat, residual) = super::resolve(&path)?;
            fs_for_stat.stat(&residual)?.size
        }
    };
    let new = if offset >= 0 {
        base.checked_add(offset as u64)
    } else {
        base.checked_sub(offset.unsigned_abs())
    }
    .ok_or(KernelError::InvalidArgument { name: "offset" })?;

    let mut table = FD_TABLE.lock();
    table.slot(fd)?.offset = new;
    Ok(new)
}

/// Close every fd opened by `owner`. Used by process exit.
pub fn close_all_owned_by(owner: u64) {
    let mut closing: Vec<OpenFile> = Vec::new();
    {
        let mut table = FD_TABLE.lock();
        for slot in table.slots[FIRST_FREE_FD..].iter_mut() {
            if slot.as_ref().map(|f| f.owner == owner).unwrap_or(false) {
                if let Some(f) = slot.take() {
                    closing.push(f);
                }
            }
        }
    }
    for f in closing {
        let _ = f.fs.close(f.node);
    }
}

/// Count of open (non-console) descriptors.
pub fn open_count() -> usize {
    FD_TABLE
        .lock()
        .slots[FIRST_FREE_FD..]
        .iter()
        .filter(|s| s.is_some())
        .count()
}

/// Console read for fd 0: blocks for the first byte, then drains whatever
/// else is immediately available.
fn console_read(buf: &mut [u8]) -> usize {
    if buf.is_empty() {
        return 0;
    }
    buf[0] = crate::drivers::uart::read_byte_blocking();
    let mut n = 1;
    while n < buf.len() {
        match crate::drivers::uart::try_read_byte() {
            Some(b) => {
                buf[n] = b;
                n += 1;
            }
            None => break,
        }
    }
    n
}
