//! errno codes for the syscall ABI
//!
//! Userland sees every kernel failure as a syscall return of `-errno`, with
//! the code also recorded as the calling process's last error. The numeric
//! values are part of the stable ABI: the POSIX-flavored codes use the
//! conventional numbers, kernel-specific codes live at 100 and above.

use crate::error::{Ext2Error, FsError, KernelError, ProcessError};

/// Stable errno values.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(non_camel_case_types)]
pub enum Errno {
    EPERM = 1,
    ENOENT = 2,
    ESRCH = 3,
    EIO = 5,
    EBADF = 9,
    ECHILD = 10,
    EAGAIN = 11,
    ENOMEM = 12,
    EACCES = 13,
    EEXIST = 17,
    ENOTDIR = 20,
    EISDIR = 21,
    EINVAL = 22,
    EMFILE = 24,
    EFBIG = 27,
    ENOSYS = 38,
    ENOTEMPTY = 39,

    EVIRTIO_TIMEOUT = 100,

    EFS_BADSUPER = 110,
    EFS_INVAL = 111,
    EFS_BADBLK = 112,
    EFS_BADINO = 113,
    EFS_NOBLK = 114,
    EFS_NOINODE = 115,
    EFS_BADDIR = 116,
    EFS_CORRUPT = 117,

    EELF_MAGIC = 120,
    EELF_ARCH = 121,
    EELF_TYPE = 122,
    EELF_NOPHDR = 123,

    EPROC_INIT = 130,
}

impl Errno {
    pub const fn as_i32(self) -> i32 {
        self as i32
    }

    /// Symbolic name, for diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            Self::EPERM => "EPERM",
            Self::ENOENT => "ENOENT",
            Self::ESRCH => "ESRCH",
            Self::EIO => "EIO",
            Self::EBADF => "EBADF",
            Self::ECHILD => "ECHILD",
            Self::EAGAIN => "EAGAIN",
            Self::ENOMEM => "ENOMEM",
            Self::EACCES => "EACCES",
            Self::EEXIST => "EEXIST",
            Self::ENOTDIR => "ENOTDIR",
            Self::EISDIR => "EISDIR",
            Self::EINVAL => "EINVAL",
            Self::EMFILE => "EMFILE",
            Self::EFBIG => "EFBIG",
            Self::ENOSYS => "ENOSYS",
            Self::ENOTEMPTY => "ENOTEMPTY",
            Self::EVIRTIO_TIMEOUT => "EVIRTIO_TIMEOUT",
            Self::EFS_BADSUPER => "EFS_BADSUPER",
            Self::EFS_INVAL => "EFS_INVAL",
            Self::EFS_BADBLK => "EFS_BADBLK",
            Self::EFS_BADINO => "EFS_BADINO",
            Self::EFS_NOBLK => "EFS_NOBLK",
            Self::EFS_NOINODE => "EFS_NOINODE",
            Self::EFS_BADDIR => "EFS_BADDIR",
            Self::EFS_CORRUPT => "EFS_CORRUPT",
            Self::EELF_MAGIC => "EELF_MAGIC",
            Self::EELF_ARCH => "EELF_ARCH",
            Self::EELF_TYPE => "EELF_TYPE",
            Self::EELF_NOPHDR => "EELF_NOPHDR",
            Self::EPROC_INIT => "EPROC_INIT",
        }
    }
}

impl core::fmt::Display for Errno {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{} ({})", self.name(), self.as_i32())
    }
}

impl From<KernelError> for Errno {
    fn from(err: KernelError) -> Self {
        match err {
            KernelError::OutOfMemory { .. } => Self::ENOMEM,
            KernelError::InvalidAddress { .. }
            | KernelError::UnmappedMemory { .. }
            | KernelError::AlreadyMapped { .. }
            | KernelError::PageTableCorrupt { .. }
            | KernelError::InvalidArgument { .. } => Self::EINVAL,
            KernelError::ResourceExhausted { .. } => Self::EAGAIN,
            KernelError::PermissionDenied { .. } => Self::EACCES,
            KernelError::Timeout { .. } => Self::EAGAIN,
            KernelError::NotSupported { .. } => Self::ENOSYS,
            KernelError::WouldBlock => Self::EAGAIN,
            KernelError::NotInitialized { .. } => Self::EINVAL,

            KernelError::Fs(e) => e.into(),
            KernelError::Ext2(e) => e.into(),
            KernelError::Elf(e) => match e {
                crate::error::ElfError::BadMagic => Self::EELF_MAGIC,
                crate::error::ElfError::UnsupportedMachine { .. } => Self::EELF_ARCH,
                crate::error::ElfError::UnsupportedType { .. } => Self::EELF_TYPE,
                crate::error::ElfError::BadProgramHeaders { .. } => Self::EELF_NOPHDR,
            },
            KernelError::Process(e) => e.into(),
            KernelError::Virtio(e) => match e {
                crate::error::VirtioError::Timeout => Self::EVIRTIO_TIMEOUT,
                _ => Self::EIO,
            },
        }
    }
}

impl From<FsError> for Errno {
    fn from(err: FsError) -> Self {
        match err {
            FsError::NotFound => Self::ENOENT,
            FsError::AlreadyExists => Self::EEXIST,
            FsError::AccessDenied => Self::EACCES,
            FsError::NotADirectory => Self::ENOTDIR,
            FsError::IsADirectory => Self::EISDIR,
            FsError::DirectoryNotEmpty => Self::ENOTEMPTY,
            FsError::BadFileDescriptor => Self::EBADF,
            FsError::TooManyOpenFiles => Self::EMFILE,
            FsError::InvalidPath => Self::EINVAL,
            FsError::NoRootFs => Self::ENOENT,
            FsError::FileTooLarge => Self::EFBIG,
            FsError::ReadOnly => Self::EACCES,
            FsError::IoError => Self::EIO,
            FsError::NotSupported => Self::ENOSYS,
        }
    }
}

impl From<Ext2Error> for Errno {
    fn from(err: Ext2Error) -> Self {
        match err {
            Ext2Error::BadSuperblock => Self::EFS_BADSUPER,
            Ext2Error::BadBlockNumber { .. } => Self::EFS_BADBLK,
            Ext2Error::BadInodeNumber { .. } => Self::EFS_BADINO,
            Ext2Error::NoFreeBlocks => Self::EFS_NOBLK,
            Ext2Error::NoFreeInodes => Self::EFS_NOINODE,
            Ext2Error::BadDirent => Self::EFS_BADDIR,
            Ext2Error::Corrupt => Self::EFS_CORRUPT,
            Ext2Error::Invalid => Self::EFS_INVAL,
        }
    }
}

impl From<ProcessError> for Errno {
    fn from(err: ProcessError) -> Self {
        match err {
            ProcessError::TableFull => Self::EAGAIN,
            ProcessError::NoSuchProcess { .. } => Self::ESRCH,
            ProcessError::NoChildren => Self::ECHILD,
            ProcessError::InitFailed => Self::EPROC_INIT,
            ProcessError::BadSignal { .. } => Self::EINVAL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ElfError;

    #[test]
    fn posix_codes_are_conventional() {
        assert_eq!(Errno::ENOENT.as_i32(), 2);
        assert_eq!(Errno::EBADF.as_i32(), 9);
        assert_eq!(Errno::EINVAL.as_i32(), 22);
        assert_eq!(Errno::ENOTEMPTY.as_i32(), 39);
    }

    #[test]
    fn kernel_errors_map_to_expected_codes() {
        assert_eq!(
            Errno::from(KernelError::OutOfMemory { requested: 4096 }),
            Errno::ENOMEM
        );
        assert_eq!(Errno::from(KernelError::Fs(FsError::NotFound)), Errno::ENOENT);
        assert_eq!(
            Errno::from(KernelError::Ext2(Ext2Error::NoFreeBlocks)),
            Errno::EFS_NOBLK
        );
        assert_eq!(
            Errno::from(KernelError::Elf(ElfError::BadMagic)),
            Errno::EELF_MAGIC
        );
        assert_eq!(
            Errno::from(KernelError::Virtio(crate::error::VirtioError::Timeout)),
            Errno::EVIRTIO_TIMEOUT
        );
    }

    #[test]
    fn fs_errors_cover_directory_semantics() {
        assert_eq!(Errno::from(FsError::IsADirectory), Errno::EISDIR);
        assert_eq!(Errno::from(FsError::NotADirectory), Errno::ENOTDIR);
        assert_eq!(Errno::from(FsError::DirectoryNotEmpty), Errno::ENOTEMPTY);
    }
}
