//! ext2 filesystem driver (rev 0 compatible).
//!
//! All access goes through sector-granular block I/O on a
//! [`BlockDevice`]; the filesystem block size (1024..4096) is read from
//! the superblock. Triple-indirect blocks are not supported: block
//! indices beyond the double-indirect range fail with `EFBIG`.
//!
//! Layering inside the driver:
//!
//! * `mod.rs` -- on-disk structures, mount/unmount, raw block I/O
//! * [`alloc`] -- per-group bitmap block/inode allocation
//! * [`inode`] -- inode read/write and file-block index resolution
//! * [`file`] -- byte-granular file read/write
//! * [`dir`] -- directory records, lookup, create/remove, path walk
//! * [`vfs`] -- glue onto the VFS [`crate::fs::FilesystemOps`] vtable

pub mod alloc;
pub mod dir;
pub mod file;
pub mod inode;
pub mod vfs;

use ::alloc::boxed::Box;
use ::alloc::vec;
use ::alloc::vec::Vec;

use spin::Mutex;

use crate::error::{Ext2Error, KernelError};
use crate::fs::blockdev::{BlockDevice, SECTOR_SIZE};

/// Superblock magic.
pub const EXT2_MAGIC: u16 = 0xEF53;

/// Root directory inode number.
pub const ROOT_INO: u32 = 2;

/// First non-reserved inode in rev 0 filesystems.
pub const FIRST_USER_INO: u32 = 11;

/// Direct block pointers per inode.
pub const NDIR_BLOCKS: usize = 12;
/// Index of the single-indirect pointer in `i_block`.
pub const IND_BLOCK: usize = 12;
/// Index of the double-indirect pointer.
pub const DIND_BLOCK: usize = 13;
/// Index of the (unsupported) triple-indirect pointer.
pub const TIND_BLOCK: usize = 14;
/// Total `i_block` slots.
pub const N_BLOCKS: usize = 15;

// i_mode file-type bits.
pub const S_IFMT: u16 = 0xF000;
pub const S_IFREG: u16 = 0x8000;
pub const S_IFDIR: u16 = 0x4000;

// Directory entry file_type values.
pub const FT_UNKNOWN: u8 = 0;
pub const FT_REG_FILE: u8 = 1;
pub const FT_DIR: u8 = 2;

/// Default mode bits for new files and directories.
pub const DEFAULT_FILE_MODE: u16 = 0o644;
pub const DEFAULT_DIR_MODE: u16 = 0o755;

/// On-disk superblock (the leading fields through the rev 1 extension;
/// the rest of the 1024-byte record is preserved, not interpreted).
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Superblock {
    pub s_inodes_count: u32,
    pub s_blocks_count: u32,
    pub s_r_blocks_count: u32,
    pub s_free_blocks_count: u32,
    pub s_free_inodes_count: u32,
    pub s_first_data_block: u32,
    pub s_log_block_size: u32,
    pub s_log_frag_size: u32,
    pub s_blocks_per_group: u32,
    pub s_frags_per_group: u32,
    pub s_inodes_per_group: u32,
    pub s_mtime: u32,
    pub s_wtime: u32,
    pub s_mnt_count: u16,
    pub s_max_mnt_count: u16,
    pub s_magic: u16,
    pub s_state: u16,
    pub s_errors: u16,
    pub s_minor_rev_level: u16,
    pub s_lastcheck: u32,
    pub s_checkinterval: u32,
    pub s_creator_os: u32,
    pub s_rev_level: u32,
    pub s_def_resuid: u16,
    pub s_def_resgid: u16,
    // Rev 1 extension; meaningful when s_rev_level >= 1.
    pub s_first_ino: u32,
    pub s_inode_size: u16,
    pub s_block_group_nr: u16,
    pub s_feature_compat: u32,
    pub s_feature_incompat: u32,
    pub s_feature_ro_compat: u32,
}

/// On-disk block group descriptor (32 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct GroupDesc {
    pub bg_block_bitmap: u32,
    pub bg_inode_bitmap: u32,
    pub bg_inode_table: u32,
    pub bg_free_blocks_count: u16,
    pub bg_free_inodes_count: u16,
    pub bg_used_dirs_count: u16,
    pub bg_pad: u16,
    pub bg_reserved: [u32; 3],
}

/// On-disk inode (128 bytes in rev 0).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Inode {
    pub i_mode: u16,
    pub i_uid: u16,
    pub i_size: u32,
    pub i_atime: u32,
    pub i_ctime: u32,
    pub i_mtime: u32,
    pub i_dtime: u32,
    pub i_gid: u16,
    pub i_links_count: u16,
    pub i_blocks: u32,
    pub i_flags: u32,
    pub i_osd1: u32,
    pub i_block: [u32; N_BLOCKS],
    pub i_generation: u32,
    pub i_file_acl: u32,
    pub i_dir_acl: u32,
    pub i_faddr: u32,
    pub i_osd2: [u8; 12],
}

impl Inode {
    pub fn is_dir(&self) -> bool {
        self.i_mode & S_IFMT == S_IFDIR
    }

    pub fn is_regular(&self) -> bool {
        self.i_mode & S_IFMT == S_IFREG
    }
}

/// Fixed header of an on-disk directory entry; the name follows inline.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct DirEntryHeader {
    pub inode: u32,
    pub rec_len: u16,
    pub name_len: u8,
    pub file_type: u8,
}

/// Size of [`DirEntryHeader`].
pub const DIRENT_HEADER_SIZE: usize = 8;

/// Read a `#[repr(C)]` structure out of a byte buffer.
pub(crate) fn read_struct<T: Copy>(buf: &[u8]) -> T {
    assert!(buf.len() >= core::mem::size_of::<T>());
    // SAFETY: length checked above; T is a plain-old-data on-disk record
    // and the read is unaligned-safe.
    unsafe { core::ptr::read_unaligned(buf.as_ptr() as *const T) }
}

/// Write a `#[repr(C)]` structure into a byte buffer.
pub(crate) fn write_struct<T: Copy>(buf: &mut [u8], value: &T) {
    let size = core::mem::size_of::<T>();
    assert!(buf.len() >= size);
    // SAFETY: length checked above; plain-old-data copy.
    unsafe {
        core::ptr::copy_nonoverlapping(value as *const T as *const u8, buf.as_mut_ptr(), size);
    }
}

/// Mutable filesystem state: the device plus the cached-on-write
/// superblock and group descriptor table.
pub(crate) struct Ext2Inner {
    pub dev: Box<dyn BlockDevice>,
    pub sb: Superblock,
    pub groups: Vec<GroupDesc>,
}

/// A mounted ext2 filesystem.
pub struct Ext2Filesystem {
    pub(crate) inner: Mutex<Ext2Inner>,
    /// Filesystem block size in bytes (1024..4096).
    pub block_size: usize,
    pub num_groups: usize,
    pub inodes_per_block: usize,
    pub desc_per_block: usize,
    pub inode_size: usize,
    pub inodes_per_group: u32,
    pub blocks_per_group: u32,
    pub first_data_block: u32,
}

impl Ext2Filesystem {
    /// Mount the filesystem on `dev`.
    ///
    /// Reads the superblock from byte offset 1024, validates the magic,
    /// derives the geometry, and loads the group descriptor table (which
    /// immediately follows the block holding the superblock).
    pub fn mount(mut dev: Box<dyn BlockDevice>) -> Result<Self, KernelError> {
        let mut sb_buf = [0u8; 1024];
        dev.read_sectors(2, 2, &mut sb_buf)?;
        let sb: Superblock = read_struct(&sb_buf);

        if sb.s_magic != EXT2_MAGIC {
            return Err(Ext2Error::BadSuperblock.into());
        }
        let block_size = (1024usize << sb.s_log_block_size).clamp(1024, 4096);
        if sb.s_blocks_per_group == 0 || sb.s_inodes_per_group == 0 {
            return Err(Ext2Error::BadSuperblock.into());
        }

        let num_groups = (sb.s_blocks_count as usize).div_ceil(sb.s_blocks_per_group as usize);
        if num_groups == 0 {
            return Err(Ext2Error::BadSuperblock.into());
        }

        let inode_size = if sb.s_rev_level >= 1 {
            sb.s_inode_size as usize
        } else {
            128
        };
        if inode_size < 128 || inode_size > block_size {
            return Err(Ext2Error::BadSuperblock.into());
        }
        let inodes_per_block = block_size / inode_size;
        let desc_per_block = block_size / core::mem::size_of::<GroupDesc>();

        // Group descriptor table: the block(s) after the superblock's.
        let gdt_block = sb.s_first_data_block + 1;
        let gdt_blocks = num_groups.div_ceil(desc_per_block);
        let sectors_per_block = block_size / SECTOR_SIZE;
        let mut gdt_buf = vec![0u8; gdt_blocks * block_size];
        dev.read_sectors(
            gdt_block as u64 * sectors_per_block as u64,
            gdt_blocks * sectors_per_block,
            &mut gdt_buf,
        )?;
        let mut groups = Vec::with_capacity(num_groups);
        for g in 0..num_groups {
            let off = g * core::mem::size_of::<GroupDesc>();
            groups.push(read_struct::<GroupDesc>(&gdt_buf[off..]));
        }

        log::info!(
            "ext2: mounted, {} blocks of {} bytes, {} inodes, {} group(s)",
            sb.s_blocks_count,
            block_size,
            sb.s_inodes_count,
            num_groups
        );

        Ok(Self {
            inner: Mutex::new(Ext2Inner { dev, sb, groups }),
            block_size,
            num_groups,
            inodes_per_block,
            desc_per_block,
            inode_size,
            inodes_per_group: sb.s_inodes_per_group,
            blocks_per_group: sb.s_blocks_per_group,
            first_data_block: sb.s_first_data_block,
        })
    }

    /// Flush metadata and the device write cache.
    pub fn unmount(&self) -> Result<(), KernelError> {
        let mut inner = self.inner.lock();
        self.write_superblock(&mut inner)?;
        inner.dev.flush()
    }

    pub(crate) fn sectors_per_block(&self) -> usize {
        self.block_size / SECTOR_SIZE
    }

    /// Read filesystem block `block` into `buf` (`buf.len() >= block_size`).
    pub(crate) fn read_block(
        &self,
        inner: &mut Ext2Inner,
        block: u32,
        buf: &mut [u8],
    ) -> Result<(), KernelError> {
        if block == 0 || block >= inner.sb.s_blocks_count {
            return Err(Ext2Error::BadBlockNumber { block }.into());
        }
        let spb = self.sectors_per_block();
        inner.dev.read_sectors(block as u64 * spb as u64, spb, buf)
    }

    /// Write filesystem block `block` from `buf`.
    pub(crate) fn write_block(
        &self,
        inner: &mut Ext2Inner,
        block: u32,
        buf: &[u8],
    ) -> Result<(), KernelError> {
        if block == 0 || block >= inner.sb.s_blocks_count {
            return Err(Ext2Error::BadBlockNumber { block }.into());
        }
        let spb = self.sectors_per_block();
        inner.dev.write_sectors(block as u64 * spb as u64, spb, buf)
    }

    /// Persist the in-memory superblock (read-modify-write of its 1024
    /// bytes at offset 1024, preserving the uninterpreted tail).
    pub(crate) fn write_superblock(&self, inner: &mut Ext2Inner) -> Result<(), KernelError> {
        let mut buf = [0u8; 1024];
        inner.dev.read_sectors(2, 2, &mut buf)?;
        let sb = inner.sb;
        write_struct(&mut buf, &sb);
        inner.dev.write_sectors(2, 2, &buf)
    }

    /// Persist group descriptor `group`.
    pub(crate) fn write_group_desc(
        &self,
        inner: &mut Ext2Inner,
        group: usize,
    ) -> Result<(), KernelError> {
        let gdt_block = self.first_data_block + 1 + (group / self.desc_per_block) as u32;
        let offset = (group % self.desc_per_block) * core::mem::size_of::<GroupDesc>();

        let mut buf = vec![0u8; self.block_size];
        self.read_block(inner, gdt_block, &mut buf)?;
        let desc = inner.groups[group];
        write_struct(&mut buf[offset..], &desc);
        self.write_block(inner, gdt_block, &buf)
    }
}
