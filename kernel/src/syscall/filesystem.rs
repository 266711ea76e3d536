//! Filesystem-group syscall handlers.
//!
//! User pointers are validated and staged through kernel buffers; paths
//! are resolved against the caller's working directory.

use alloc::string::String;
use alloc::vec;

use crate::error::{FsError, KernelError, ProcessError};
use crate::fs::{self, file, OpenFlags, Whence};
use crate::mm::user_validation::{copy_from_user, copy_str_from_user, copy_to_user};
use crate::mm::PhysicalAddress;
use crate::process::table;

/// Longest path accepted from userland in one syscall.
const USER_PATH_MAX: usize = 512;

/// Largest single read/write transfer staged in one piece.
const IO_CHUNK_MAX: usize = 64 * 1024;

fn current_root() -> Result<PhysicalAddress, KernelError> {
    table::with_current(|p| p.root)
        .flatten()
        .ok_or(KernelError::Process(ProcessError::NoSuchProcess { pid: 0 }))
}

fn current_pid_raw() -> u64 {
    table::current_pid().map(|p| p.0).unwrap_or(0)
}

/// Copy a path string from user memory and make it absolute against the
/// caller's cwd.
fn user_path(path_uva: u64) -> Result<String, KernelError> {
    let root = current_root()?;
    let raw = copy_str_from_user(root, path_uva, USER_PATH_MAX)?;
    if raw.is_empty() {
        return Err(KernelError::Fs(FsError::InvalidPath));
    }
    let cwd = table::with_current(|p| p.cwd.clone())
        .ok_or(KernelError::Process(ProcessError::NoSuchProcess { pid: 0 }))?;
    Ok(fs::normalize_path(&cwd, &raw))
}

pub fn sys_open(path_uva: u64, flags: u64) -> Result<i64, KernelError> {
    let path = user_path(path_uva)?;
    let flags = OpenFlags::from_bits_truncate(flags as u32);
    let fd = file::vfs_open(&path, flags, current_pid_raw())?;
    Ok(fd as i64)
}

pub fn sys_close(fd: u64) -> Result<i64, KernelError> {
    file::vfs_close(fd as i32)?;
    Ok(0)
}

pub fn sys_read(fd: u64, buf_uva: u64, count: u64) -> Result<i64, KernelError> {
    let root = current_root()?;
    let want = (count as usize).min(IO_CHUNK_MAX);
    let mut bounce = vec![0u8; want];
    let n = file::vfs_read(fd as i32, &mut bounce)?;
    if n > 0 {
        copy_to_user(root, buf_uva, &bounce[..n])?;
    }
    Ok(n as i64)
}

pub fn sys_write(fd: u64, buf_uva: u64, count: u64) -> Result<i64, KernelError> {
    let root = current_root()?;
    let want = (count as usize).min(IO_CHUNK_MAX);
    if want == 0 {
        return Ok(0);
    }
    let mut bounce = vec![0u8; want];
    copy_from_user(root, buf_uva, &mut bounce)?;
    let n = file::vfs_write(fd as i32, &bounce)?;
    Ok(n as i64)
}

pub fn sys_seek(fd: u64, offset: i64, whence: u64) -> Result<i64, KernelError> {
    let whence = Whence::try_from(whence)?;
    let pos = file::vfs_seek(fd as i32, offset, whence)?;
    Ok(pos as i64)
}

pub fn sys_stat(path_uva: u64, stat_uva: u64) -> Result<i64, KernelError> {
    let root = current_root()?;
    let path = user_path(path_uva)?;
    let (fs_ops, residual) = fs::resolve(&path)?;
    let stat = fs_ops.stat(&residual)?;

    let bytes: &[u8] = {
        // SAFETY: Stat is repr(C) plain old data; we expose its bytes for
        // the copy-out only.
        unsafe {
            core::slice::from_raw_parts(
                &stat as *const fs::Stat as *const u8,
                core::mem::size_of::<fs::Stat>(),
            )
        }
    };
    copy_to_user(root, stat_uva, bytes)?;
    Ok(0)
}

pub fn sys_mkdir(path_uva: u64) -> Result<i64, KernelError> {
    let path = user_path(path_uva)?;
    let (fs_ops, residual) = fs::resolve(&path)?;
    fs_ops.mkdir(&residual, 0o755)?;
    Ok(0)
}

pub fn sys_rmdir(path_uva: u64) -> Result<i64, KernelError> {
    let path = user_path(path_uva)?;
    let (fs_ops, residual) = fs::resolve(&path)?;
    fs_ops.rmdir(&residual)?;
    Ok(0)
}

pub fn sys_unlink(path_uva: u64) -> Result<i64, KernelError> {
    let path = user_path(path_uva)?;
    let (fs_ops, residual) = fs::resolve(&path)?;
    fs_ops.unlink(&residual)?;
    Ok(0)
}

pub fn sys_chdir(path_uva: u64) -> Result<i64, KernelError> {
    let path = user_path(path_uva)?;
    let (fs_ops, residual) = fs::resolve(&path)?;
    let stat = fs_ops.stat(&residual)?;
    if stat.mode as u16 & crate::fs::ext2::S_IFMT != crate::fs::ext2::S_IFDIR {
        return Err(KernelError::Fs(FsError::NotADirectory));
    }
    table::with_current(|p| p.cwd = path)
        .ok_or(KernelError::Process(ProcessError::NoSuchProcess { pid: 0 }))?;
    Ok(0)
}

pub fn sys_getcwd(buf_uva: u64, size: u64) -> Result<i64, KernelError> {
    let root = current_root()?;
    let cwd = table::with_current(|p| p.cwd.clone())
        .ok_or(KernelError::Process(ProcessError::NoSuchProcess { pid: 0 }))?;
    let needed = cwd.len() + 1;
    if (size as usize) < needed {
        return Err(KernelError::InvalidArgument { name: "size" });
    }
    copy_to_user(root, buf_uva, cwd.as_bytes())?;
    copy_to_user(root, buf_uva + cwd.len() as u64, &[0u8])?;
    Ok(needed as i64)
}
