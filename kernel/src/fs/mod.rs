//! Virtual filesystem layer.
//!
//! Filesystems implement [`FilesystemOps`] (the per-filesystem operations
//! vtable) and are attached to the mount list. Path resolution walks the
//! list and picks the mount whose point is the longest prefix of the path
//! ending at a `/` boundary, handing the residual path to the filesystem.
//!
//! File descriptors live in a global 64-slot table (see [`file`]); slots
//! 0/1/2 are pre-connected to the console.

pub mod blockdev;
pub mod ext2;
pub mod file;

use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::RwLock;

use crate::error::{FsError, KernelError};

/// Maximum path length accepted by the VFS.
pub const PATH_MAX: usize = 4096;

/// Maximum single-component (file name) length.
pub const NAME_MAX: usize = 255;

/// Filesystem node types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    File,
    Directory,
    CharDevice,
    BlockDevice,
    Symlink,
}

/// stat() result, shared with userland.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Stat {
    pub ino: u64,
    pub size: u64,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub blocks: u64,
}

/// A directory listing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub ino: u64,
    pub name: String,
    pub node_type: NodeType,
}

/// Seek origins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set = 0,
    Cur = 1,
    End = 2,
}

impl TryFrom<u64> for Whence {
    type Error = KernelError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Set),
            1 => Ok(Self::Cur),
            2 => Ok(Self::End),
            _ => Err(KernelError::InvalidArgument { name: "whence" }),
        }
    }
}

bitflags::bitflags! {
    /// open(2)-style flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const WRONLY = 0x001;
        const RDWR   = 0x002;
        const CREATE = 0x040;
        const TRUNC  = 0x200;
        const APPEND = 0x400;
    }
}

impl OpenFlags {
    const ACCMODE: u32 = 0x003;

    pub fn readable(&self) -> bool {
        self.bits() & Self::ACCMODE != Self::WRONLY.bits()
    }

    pub fn writable(&self) -> bool {
        self.bits() & Self::ACCMODE != 0
    }
}

/// Opaque filesystem-private node handle (an inode number for ext2).
pub type NodeHandle = u64;

/// Per-filesystem operations vtable.
///
/// Path arguments are filesystem-relative (the VFS strips the mount
/// point), absolute, and normalized.
pub trait FilesystemOps: Send + Sync {
    /// Resolve `path` to a node handle, honoring CREATE/TRUNC in `flags`.
    fn open(&self, path: &str, flags: OpenFlags) -> Result<NodeHandle, KernelError>;

    /// Release a node handle obtained from `open`.
    fn close(&self, node: NodeHandle) -> Result<(), KernelError> {
        let _ = node;
        Ok(())
    }

    fn read(&self, node: NodeHandle, offset: u64, buf: &mut [u8]) -> Result<usize, KernelError>;

    fn write(&self, node: NodeHandle, offset: u64, data: &[u8]) -> Result<usize, KernelError>;

    /// Filesystem-side seek. `None` means "not implemented": the VFS then
    /// maintains the offset itself (SEEK_END through `stat`).
    fn seek(
        &self,
        node: NodeHandle,
        offset: i64,
        whence: Whence,
    ) -> Option<Result<u64, KernelError>> {
        let _ = (node, offset, whence);
        None
    }

    fn readdir(&self, path: &str) -> Result<Vec<DirEntry>, KernelError>;

    fn mkdir(&self, path: &str, mode: u16) -> Result<(), KernelError>;

    fn rmdir(&self, path: &str) -> Result<(), KernelError>;

    fn unlink(&self, path: &str) -> Result<(), KernelError>;

    fn stat(&self, path: &str) -> Result<Stat, KernelError>;

    fn rename(&self, from: &str, to: &str) -> Result<(), KernelError> {
        let _ = (from, to);
        Err(KernelError::Fs(FsError::NotSupported))
    }

    fn sync(&self) -> Result<(), KernelError> {
        Ok(())
    }
}

/// A mounted filesystem.
struct Mount {
    point: String,
    fs: Arc<dyn FilesystemOps>,
}

static MOUNTS: RwLock<Vec<Mount>> = RwLock::new(Vec::new());

/// Attach `fs` at `point` (an absolute path).
pub fn mount(point: &str, fs: Arc<dyn FilesystemOps>) -> Result<(), KernelError> {
    let point = normalize_path("/", point);
    let mut mounts = MOUNTS.write();
    if mounts.iter().any(|m| m.point == point) {
        return Err(KernelError::Fs(FsError::AlreadyExists));
    }
    log::info!("vfs: mounted filesystem at {}", point);
    mounts.push(Mount { point, fs });
    Ok(())
}

/// Detach the filesystem mounted at `point`.
pub fn unmount(point: &str) -> Result<(), KernelError> {
    let point = normalize_path("/", point);
    let mut mounts = MOUNTS.write();
    match mounts.iter().position(|m| m.point == point) {
        Some(idx) => {
            let m = mounts.remove(idx);
            m.fs.sync()?;
            Ok(())
        }
        None => Err(KernelError::Fs(FsError::NotFound)),
    }
}

/// Resolve an absolute path to `(filesystem, residual path)`.
///
/// The chosen mount is the one whose point is the longest prefix of `path`
/// ending at a `/` boundary. The residual is always absolute within the
/// filesystem (`"/"` for the mount point itself).
pub fn resolve(path: &str) -> Result<(Arc<dyn FilesystemOps>, String), KernelError> {
    if !path.starts_with('/') || path.len() > PATH_MAX {
        return Err(KernelError::Fs(FsError::InvalidPath));
    }

    let mounts = MOUNTS.read();
    let mut best: Option<&Mount> = None;
    for m in mounts.iter() {
        let matches = if m.point == "/" {
            true
        } else {
            path == m.point || {
                path.strip_prefix(m.point.as_str())
                    .is_some_and(|rest| rest.starts_with('/'))
            }
        };
        if matches && best.map(|b| m.point.len() > b.point.len()).unwrap_or(true) {
            best = Some(m);
        }
    }

    match best {
        Some(m) => {
            let residual = if m.point == "/" {
                path.to_string()
            } else {
                let rest = &path[m.point.len()..];
                if rest.is_empty() {
                    "/".to_string()
                } else {
                    rest.to_string()
                }
            };
            Ok((m.fs.clone(), residual))
        }
        None => Err(KernelError::Fs(FsError::NoRootFs)),
    }
}

/// Join `path` against `cwd` (when relative) and normalize: collapse
/// repeated slashes, resolve `.` and `..`, strip the trailing slash.
pub fn normalize_path(cwd: &str, path: &str) -> String {
    let mut components: Vec<&str> = Vec::new();
    let full = if path.starts_with('/') {
        (String::new(), path)
    } else {
        (String::from(cwd), path)
    };

    for part in full.0.split('/').chain(full.1.split('/')) {
        match part {
            "" | "." => {}
            ".." => {
                components.pop();
            }
            name => components.push(name),
        }
    }

    if components.is_empty() {
        return String::from("/");
    }
    let mut out = String::new();
    for c in components {
        out.push('/');
        out.push_str(c);
    }
    out
}

/// Unix permission check: uid 0 is always allowed; otherwise the owner,
/// group, or other bit triplet is chosen and tested against `want`
/// (a mask of R=4, W=2, X=1).
pub fn check_permission(
    mode: u32,
    node_uid: u32,
    node_gid: u32,
    uid: u32,
    gid: u32,
    want: u32,
) -> bool {
    if uid == 0 {
        return true;
    }
    let triplet = if uid == node_uid {
        (mode >> 6) & 0o7
    } else if gid == node_gid {
        (mode >> 3) & 0o7
    } else {
        mode & 0o7
    };
    triplet & want == want
}

#[cfg(test)]
pub(crate) fn clear_mounts_for_test() {
    MOUNTS.write().clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    struct NamedFs(&'static str);

    impl FilesystemOps for NamedFs {
        fn open(&self, _path: &str, _flags: OpenFlags) -> Result<NodeHandle, KernelError> {
            Ok(0)
        }
        fn read(&self, _n: NodeHandle, _o: u64, _b: &mut [u8]) -> Result<usize, KernelError> {
            Ok(0)
        }
        fn write(&self, _n: NodeHandle, _o: u64, _d: &[u8]) -> Result<usize, KernelError> {
            Ok(0)
        }
        fn readdir(&self, _path: &str) -> Result<Vec<DirEntry>, KernelError> {
            Ok(vec![])
        }
        fn mkdir(&self, _path: &str, _mode: u16) -> Result<(), KernelError> {
            Ok(())
        }
        fn rmdir(&self, _path: &str) -> Result<(), KernelError> {
            Ok(())
        }
        fn unlink(&self, _path: &str) -> Result<(), KernelError> {
            Ok(())
        }
        fn stat(&self, _path: &str) -> Result<Stat, KernelError> {
            Ok(Stat {
                ino: self.0.len() as u64,
                ..Default::default()
            })
        }
    }

    fn mounted(point: &'static str) -> Arc<dyn FilesystemOps> {
        let fs: Arc<dyn FilesystemOps> = Arc::new(NamedFs(point));
        mount(point, fs.clone()).unwrap();
        fs
    }

    #[test]
    fn longest_prefix_resolution_at_slash_boundaries() {
        let _serial = crate::test_support::vfs_serial();
        clear_mounts_for_test();
        mounted("/");
        let mnt = mounted("/mnt");
        let mnt_disk = mounted("/mnt/disk");

        let (fs, rest) = resolve("/mnt/disk/a/b").unwrap();
        assert!(Arc::ptr_eq(&fs, &mnt_disk));
        assert_eq!(rest, "/a/b");

        let (fs, rest) = resolve("/mnt/diskette").unwrap();
        // "/mnt/disk" is not a prefix at a '/' boundary here.
        assert!(Arc::ptr_eq(&fs, &mnt));
        assert_eq!(rest, "/diskette");

        let (fs, rest) = resolve("/etc/passwd").unwrap();
        assert_eq!(fs.stat("/").unwrap().ino, 1);
        assert_eq!(rest, "/etc/passwd");

        let (_, rest) = resolve("/mnt").unwrap();
        assert_eq!(rest, "/");

        clear_mounts_for_test();
    }

    #[test]
    fn relative_paths_are_resolved_against_cwd() {
        assert_eq!(normalize_path("/home/user", "docs"), "/home/user/docs");
        assert_eq!(normalize_path("/home/user", "../etc//passwd"), "/home/etc/passwd");
        assert_eq!(normalize_path("/", "a/./b/"), "/a/b");
        assert_eq!(normalize_path("/a/b", "/x"), "/x");
        assert_eq!(normalize_path("/", "../.."), "/");
    }

    #[test]
    fn permission_triplet_selection() {
        // rw-r----- owned by 5:7
        let mode = 0o640;
        assert!(check_permission(mode, 5, 7, 0, 0, 0o7)); // root
        assert!(check_permission(mode, 5, 7, 5, 1, 0o6)); // owner rw
        assert!(!check_permission(mode, 5, 7, 5, 1, 0o1)); // owner x denied
        assert!(check_permission(mode, 5, 7, 8, 7, 0o4)); // group r
        assert!(!check_permission(mode, 5, 7, 8, 7, 0o2)); // group w denied
        assert!(!check_permission(mode, 5, 7, 9, 9, 0o4)); // other denied
    }

    #[test]
    fn open_flag_access_modes() {
        assert!(OpenFlags::empty().readable());
        assert!(!OpenFlags::empty().writable());
        assert!(!OpenFlags::WRONLY.readable());
        assert!(OpenFlags::WRONLY.writable());
        assert!(OpenFlags::RDWR.readable());
        assert!(OpenFlags::RDWR.writable());
    }
}
