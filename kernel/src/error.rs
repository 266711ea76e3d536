//! Kernel error types for ThunderOS
//!
//! Every fallible kernel API returns `Result<T, KernelError>`. Subsystems
//! with a richer failure vocabulary (filesystem, ext2, ELF, process, virtio)
//! define their own error enums which convert into [`KernelError`] via
//! `From`, so `?` propagation works across subsystem boundaries. The syscall
//! layer maps each error onto a stable errno code (see [`crate::errno`]).

use core::fmt;

/// Main kernel error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Physical or heap memory exhausted
    OutOfMemory {
        requested: usize,
    },
    /// Address is outside the range valid for the operation
    InvalidAddress {
        addr: usize,
    },
    /// Virtual address has no mapping in the given root
    UnmappedMemory {
        addr: usize,
    },
    /// Attempt to map a virtual address that already has a valid leaf
    AlreadyMapped {
        addr: usize,
    },
    /// A leaf entry was found at an interior level of a page-table walk
    PageTableCorrupt {
        addr: usize,
    },
    /// Generic bad argument
    InvalidArgument {
        name: &'static str,
    },
    /// A bounded kernel resource ran out (descriptors, fd slots, PCB slots)
    ResourceExhausted {
        resource: &'static str,
    },
    PermissionDenied {
        operation: &'static str,
    },
    Timeout {
        operation: &'static str,
    },
    NotSupported {
        operation: &'static str,
    },
    WouldBlock,
    /// Subsystem used before its init() ran
    NotInitialized {
        subsystem: &'static str,
    },

    /// VFS-level errors
    Fs(FsError),
    /// ext2 on-disk structure errors
    Ext2(Ext2Error),
    /// ELF image validation errors
    Elf(ElfError),
    /// Process management errors
    Process(ProcessError),
    /// VirtIO transport/device errors
    Virtio(VirtioError),
}

/// VFS-level errors (path resolution, fd table, generic file semantics)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// File or directory not found
    NotFound,
    /// Path already exists
    AlreadyExists,
    /// Permission denied
    AccessDenied,
    /// Target is not a directory
    NotADirectory,
    /// Target is a directory (when a file was expected)
    IsADirectory,
    /// Directory is not empty
    DirectoryNotEmpty,
    /// Invalid file descriptor
    BadFileDescriptor,
    /// File descriptor table is full
    TooManyOpenFiles,
    /// Invalid path format
    InvalidPath,
    /// Root filesystem not mounted
    NoRootFs,
    /// File size exceeds what the filesystem can address
    FileTooLarge,
    /// Filesystem is read-only
    ReadOnly,
    /// I/O error during operation
    IoError,
    /// Operation not supported by this filesystem
    NotSupported,
}

/// ext2-specific integrity and allocation errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ext2Error {
    /// Superblock magic or geometry check failed
    BadSuperblock,
    /// Block number outside the filesystem
    BadBlockNumber { block: u32 },
    /// Inode number outside the inode space
    BadInodeNumber { ino: u32 },
    /// No free blocks in any group
    NoFreeBlocks,
    /// No free inodes in any group
    NoFreeInodes,
    /// Directory entry record malformed
    BadDirent,
    /// On-disk structure internally inconsistent
    Corrupt,
    /// Invalid argument to an ext2 operation
    Invalid,
}

/// ELF image validation errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfError {
    /// Not an ELF file (bad magic or class)
    BadMagic,
    /// Not an EM_RISCV image
    UnsupportedMachine { machine: u16 },
    /// Not an ET_EXEC static executable
    UnsupportedType { elf_type: u16 },
    /// Program header count outside [1, 16]
    BadProgramHeaders { phnum: u16 },
}

/// Process management errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessError {
    /// Process table has no free slot
    TableFull,
    /// No process with the given pid
    NoSuchProcess { pid: u64 },
    /// wait() called with no children
    NoChildren,
    /// Failure while constructing a process image
    InitFailed,
    /// Signal number outside [1, 31]
    BadSignal { sig: u32 },
}

/// VirtIO transport and block-device errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtioError {
    /// MMIO magic register mismatch
    BadMagic { found: u32 },
    /// Device is not a modern (version 2) virtio-mmio device
    UnsupportedVersion { found: u32 },
    /// Device id is not the expected device class
    WrongDeviceId { found: u32 },
    /// Device rejected our feature selection (FEATURES_OK cleared)
    FeatureNegotiation,
    /// Queue 0 missing or its max size is zero
    QueueUnavailable,
    /// Bounded completion poll expired
    Timeout,
    /// Device reported a non-OK status byte
    IoError { status: u8 },
}

/// Result type alias for kernel operations
pub type KernelResult<T> = Result<T, KernelError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory { requested } => {
                write!(f, "Out of memory: requested {} bytes", requested)
            }
            Self::InvalidAddress { addr } => write!(f, "Invalid address: {:#x}", addr),
            Self::UnmappedMemory { addr } => write!(f, "Unmapped memory at {:#x}", addr),
            Self::AlreadyMapped { addr } => write!(f, "Address {:#x} is already mapped", addr),
            Self::PageTableCorrupt { addr } => {
                write!(
                    f,
                    "Page table corrupt: leaf at interior level for {:#x}",
                    addr
                )
            }
            Self::InvalidArgument { name } => write!(f, "Invalid argument '{}'", name),
            Self::ResourceExhausted { resource } => write!(f, "Resource exhausted: {}", resource),
            Self::PermissionDenied { operation } => {
                write!(f, "Permission denied for operation: {}", operation)
            }
            Self::Timeout { operation } => write!(f, "Timeout during {}", operation),
            Self::NotSupported { operation } => write!(f, "Operation not supported: {}", operation),
            Self::WouldBlock => write!(f, "Operation would block"),
            Self::NotInitialized { subsystem } => {
                write!(f, "Subsystem not initialized: {}", subsystem)
            }
            Self::Fs(e) => write!(f, "Filesystem error: {:?}", e),
            Self::Ext2(e) => write!(f, "ext2 error: {:?}", e),
            Self::Elf(e) => write!(f, "ELF error: {:?}", e),
            Self::Process(e) => write!(f, "Process error: {:?}", e),
            Self::Virtio(e) => write!(f, "VirtIO error: {:?}", e),
        }
    }
}

impl From<FsError> for KernelError {
    fn from(err: FsError) -> Self {
        Self::Fs(err)
    }
}

impl From<Ext2Error> for KernelError {
    fn from(err: Ext2Error) -> Self {
        Self::Ext2(err)
    }
}

impl From<ElfError> for KernelError {
    fn from(err: ElfError) -> Self {
        Self::Elf(err)
    }
}

impl From<ProcessError> for KernelError {
    fn from(err: ProcessError) -> Self {
        Self::Process(err)
    }
}

impl From<VirtioError> for KernelError {
    fn from(err: VirtioError) -> Self {
        Self::Virtio(err)
    }
}
