//! VFS glue: [`Ext2Filesystem`] as a [`FilesystemOps`] vtable.
//!
//! Node handles are inode numbers. Paths arriving here are absolute
//! within the filesystem and normalized by the VFS.

use alloc::vec::Vec;

use super::{Ext2Filesystem, DEFAULT_FILE_MODE, ROOT_INO};
use crate::error::{FsError, KernelError};
use crate::fs::{DirEntry, FilesystemOps, NodeHandle, OpenFlags, Stat};

impl FilesystemOps for Ext2Filesystem {
    fn open(&self, path: &str, flags: OpenFlags) -> Result<NodeHandle, KernelError> {
        let mut inner = self.inner.lock();

        let ino = match self.resolve_path(&mut inner, path) {
            Ok(ino) => ino,
            Err(KernelError::Fs(FsError::NotFound)) if flags.contains(OpenFlags::CREATE) => {
                let (parent_path, name) = Self::split_parent(path)?;
                let parent = self.resolve_path(&mut inner, parent_path)?;
                self.create_file(&mut inner, parent, name, DEFAULT_FILE_MODE)?
            }
            Err(e) => return Err(e),
        };

        let inode = self.read_inode(&mut inner, ino)?;
        if inode.is_dir() && flags.writable() {
            return Err(FsError::IsADirectory.into());
        }
        if flags.contains(OpenFlags::TRUNC) && inode.is_regular() {
            self.truncate(&mut inner, ino)?;
        }
        Ok(ino as NodeHandle)
    }

    fn read(&self, node: NodeHandle, offset: u64, buf: &mut [u8]) -> Result<usize, KernelError> {
        let mut inner = self.inner.lock();
        let inode = self.read_inode(&mut inner, node as u32)?;
        if inode.is_dir() {
            return Err(FsError::IsADirectory.into());
        }
        self.read_at(&mut inner, node as u32, offset, buf)
    }

    fn write(&self, node: NodeHandle, offset: u64, data: &[u8]) -> Result<usize, KernelError> {
        let mut inner = self.inner.lock();
        let inode = self.read_inode(&mut inner, node as u32)?;
        if inode.is_dir() {
            return Err(FsError::IsADirectory.into());
        }
        self.write_at(&mut inner, node as u32, offset, data)
    }

    fn readdir(&self, path: &str) -> Result<Vec<DirEntry>, KernelError> {
        let mut inner = self.inner.lock();
        let ino = self.resolve_path(&mut inner, path)?;
        self.dir_list(&mut inner, ino)
    }

    fn mkdir(&self, path: &str, mode: u16) -> Result<(), KernelError> {
        let mut inner = self.inner.lock();
        let (parent_path, name) = Self::split_parent(path)?;
        let parent = self.resolve_path(&mut inner, parent_path)?;
        self.make_dir(&mut inner, parent, name, mode)?;
        Ok(())
    }

    fn rmdir(&self, path: &str) -> Result<(), KernelError> {
        let mut inner = self.inner.lock();
        let (parent_path, name) = Self::split_parent(path)?;
        let parent = self.resolve_path(&mut inner, parent_path)?;
        self.remove_dir(&mut inner, parent, name)
    }

    fn unlink(&self, path: &str) -> Result<(), KernelError> {
        let mut inner = self.inner.lock();
        let (parent_path, name) = Self::split_parent(path)?;
        let parent = self.resolve_path(&mut inner, parent_path)?;
        self.unlink_file(&mut inner, parent, name)
    }

    fn stat(&self, path: &str) -> Result<Stat, KernelError> {
        let mut inner = self.inner.lock();
        let ino = self.resolve_path(&mut inner, path)?;
        let inode = self.read_inode(&mut inner, ino)?;
        Ok(Stat {
            ino: ino as u64,
            size: inode.i_size as u64,
            mode: inode.i_mode as u32,
            nlink: inode.i_links_count as u32,
            uid: inode.i_uid as u32,
            gid: inode.i_gid as u32,
            blocks: inode.i_blocks as u64,
        })
    }

    fn sync(&self) -> Result<(), KernelError> {
        let mut inner = self.inner.lock();
        self.write_superblock(&mut inner)?;
        inner.dev.flush()
    }
}

/// Mount the ext2 root filesystem from the global block device at `/`.
pub fn mount_root() -> Result<(), KernelError> {
    use crate::drivers::virtio::blk::GlobalBlockDevice;

    let fs = Ext2Filesystem::mount(alloc::boxed::Box::new(GlobalBlockDevice))?;
    crate::fs::mount("/", alloc::sync::Arc::new(fs))
}

/// Keep the root inode constant visible to callers of `open("/")`.
pub const ROOT_NODE: NodeHandle = ROOT_INO as NodeHandle;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{self, file, OpenFlags, Whence};
    use crate::test_support;
    use alloc::boxed::Box;
    use alloc::sync::Arc;
    use alloc::vec;

    fn mount_test_fs(point: &str) -> Arc<Ext2Filesystem> {
        let fs = Arc::new(
            Ext2Filesystem::mount(Box::new(test_support::mkfs_ext2_ramdisk(1024))).unwrap(),
        );
        fs::mount(point, fs.clone()).unwrap();
        fs
    }

    #[test]
    fn end_to_end_file_io_through_the_vfs() {
        let _serial = test_support::vfs_serial();
        mount_test_fs("/disk");

        let fd = file::vfs_open(
            "/disk/hello.txt",
            OpenFlags::RDWR | OpenFlags::CREATE,
            1,
        )
        .unwrap();
        assert_eq!(file::vfs_write(fd, b"hello\n").unwrap(), 6);
        file::vfs_seek(fd, 0, Whence::Set).unwrap();
        let mut buf = [0u8; 32];
        let n = file::vfs_read(fd, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello\n");
        file::vfs_close(fd).unwrap();

        // Reopen and check persistence.
        let fd = file::vfs_open("/disk/hello.txt", OpenFlags::empty(), 1).unwrap();
        let n = file::vfs_read(fd, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello\n");
        file::vfs_close(fd).unwrap();

        fs::unmount("/disk").unwrap();
    }

    #[test]
    fn mkdir_rmdir_idempotence_errors() {
        let _serial = test_support::vfs_serial();
        let fs = mount_test_fs("/idem");

        fs.mkdir("/a", 0o755).unwrap();
        assert!(matches!(
            fs.mkdir("/a", 0o755),
            Err(KernelError::Fs(FsError::AlreadyExists))
        ));

        fs.rmdir("/a").unwrap();
        assert!(matches!(
            fs.rmdir("/a"),
            Err(KernelError::Fs(FsError::NotFound))
        ));

        fs::unmount("/idem").unwrap();
    }

    #[test]
    fn readdir_and_stat_report_metadata() {
        let _serial = test_support::vfs_serial();
        let fs = mount_test_fs("/meta");

        fs.mkdir("/bin", 0o755).unwrap();
        let fd = file::vfs_open("/meta/bin/ls", OpenFlags::RDWR | OpenFlags::CREATE, 1).unwrap();
        file::vfs_write(fd, &[0u8; 2000]).unwrap();
        file::vfs_close(fd).unwrap();

        let entries = fs.readdir("/bin").unwrap();
        let ls = entries.iter().find(|e| e.name == "ls").unwrap();
        assert_eq!(ls.node_type, fs::NodeType::File);
        assert!(ls.ino >= super::super::FIRST_USER_INO as u64);

        let st = fs.stat("/bin/ls").unwrap();
        assert_eq!(st.size, 2000);
        assert_eq!(st.nlink, 1);
        assert_eq!(st.mode & 0o7777, 0o644);
        assert_eq!(st.blocks, 2 * 2); // two 1 KiB blocks in 512-byte units

        let st = fs.stat("/bin").unwrap();
        assert_eq!(st.mode as u16 & super::super::S_IFMT, super::super::S_IFDIR);

        fs::unmount("/meta").unwrap();
    }

    #[test]
    fn trunc_resets_contents() {
        let _serial = test_support::vfs_serial();
        let fs = mount_test_fs("/trunc");

        let fd = file::vfs_open("/trunc/f", OpenFlags::RDWR | OpenFlags::CREATE, 1).unwrap();
        file::vfs_write(fd, &vec![9u8; 4096]).unwrap();
        file::vfs_close(fd).unwrap();
        assert_eq!(fs.stat("/f").unwrap().size, 4096);

        let fd = file::vfs_open("/trunc/f", OpenFlags::RDWR | OpenFlags::TRUNC, 1).unwrap();
        assert_eq!(fs.stat("/f").unwrap().size, 0);
        file::vfs_close(fd).unwrap();

        fs::unmount("/trunc").unwrap();
    }

    #[test]
    fn writes_to_directories_are_refused() {
        let _serial = test_support::vfs_serial();
        let fs = mount_test_fs("/dirs");
        fs.mkdir("/d", 0o755).unwrap();
        assert!(matches!(
            fs.open("/d", OpenFlags::RDWR),
            Err(KernelError::Fs(FsError::IsADirectory))
        ));
        // Read-only open of a directory is allowed (for fstat-style use).
        assert!(fs.open("/d", OpenFlags::empty()).is_ok());
        fs::unmount("/dirs").unwrap();
    }
}
