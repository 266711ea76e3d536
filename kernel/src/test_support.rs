//! Shared test scaffolding (host builds only).
//!
//! Unit tests exercise the real allocators and page-table code over a
//! leaked, 64 KiB-aligned host buffer handed to the global frame
//! allocator: physical addresses are then genuine host pointers, matching
//! the kernel's identity-mapping invariant.

use alloc::vec;
use alloc::vec::Vec;
use std::sync::Once;

use crate::mm::{frame_allocator, PhysicalAddress};

/// Size of the shared test memory pool (16 MiB = 4096 frames).
const POOL_BYTES: usize = 16 * 1024 * 1024;

static INIT: Once = Once::new();

/// Initialize the global frame allocator over the shared pool. Idempotent;
/// every test touching the PMM, heap, vmm, or DMA layer calls this first.
pub fn init_test_memory() {
    INIT.call_once(|| {
        let layout = std::alloc::Layout::from_size_align(POOL_BYTES, 65536).unwrap();
        // SAFETY: valid, non-zero-size layout; the allocation is leaked on
        // purpose so frame addresses stay valid for the process lifetime.
        let pool = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!pool.is_null(), "test pool allocation failed");
        frame_allocator::init(PhysicalAddress::new(pool as u64), POOL_BYTES);
    });
}

static VFS_SERIAL: std::sync::Mutex<()> = std::sync::Mutex::new(());

/// Serialize tests that touch the global mount list or fd table. The VFS
/// state is process-wide, so concurrent tests would observe each other.
pub fn vfs_serial() -> std::sync::MutexGuard<'static, ()> {
    VFS_SERIAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

static PROC_SERIAL: std::sync::Mutex<()> = std::sync::Mutex::new(());

/// Serialize tests that touch the global process table or ready queue.
pub fn proc_serial() -> std::sync::MutexGuard<'static, ()> {
    PROC_SERIAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Build a minimal, valid ext2 rev-0 image on a [`RamDisk`]:
/// 1 KiB blocks, one block group, 64 inodes, a root directory holding
/// `.` and `..`. Layout:
///
/// | block | content          |
/// |-------|------------------|
/// | 0     | boot (zeros)     |
/// | 1     | superblock       |
/// | 2     | group descriptor |
/// | 3     | block bitmap     |
/// | 4     | inode bitmap     |
/// | 5..13 | inode table      |
/// | 13    | root directory   |
pub fn mkfs_ext2_ramdisk(total_blocks: u32) -> crate::fs::blockdev::RamDisk {
    use crate::fs::ext2::{
        write_struct, DirEntryHeader, GroupDesc, Inode, Superblock, EXT2_MAGIC, FT_DIR, ROOT_INO,
        S_IFDIR,
    };

    const BLOCK_SIZE: usize = 1024;
    const INODE_COUNT: u32 = 64;
    const RESERVED_INODES: u32 = 10;
    const INODE_TABLE_BLOCKS: u32 = INODE_COUNT * 128 / BLOCK_SIZE as u32; // 8
    const ROOT_DIR_BLOCK: u32 = 5 + INODE_TABLE_BLOCKS; // 13
    const META_BLOCKS: u32 = ROOT_DIR_BLOCK; // blocks 1..=13 are in use

    assert!(total_blocks > META_BLOCKS + 2, "image too small");
    assert!(total_blocks <= 8192 + 1, "single group only");

    let mut image = vec![0u8; total_blocks as usize * BLOCK_SIZE];
    let block = |n: u32| -> std::ops::Range<usize> {
        let start = n as usize * BLOCK_SIZE;
        start..start + BLOCK_SIZE
    };

    let free_blocks = (total_blocks - 1) - META_BLOCKS;
    let free_inodes = INODE_COUNT - RESERVED_INODES;

    // Superblock (block 1).
    let sb = Superblock {
        s_inodes_count: INODE_COUNT,
        s_blocks_count: total_blocks,
        s_r_blocks_count: 0,
        s_free_blocks_count: free_blocks,
        s_free_inodes_count: free_inodes,
        s_first_data_block: 1,
        s_log_block_size: 0,
        s_log_frag_size: 0,
        s_blocks_per_group: 8192,
        s_frags_per_group: 8192,
        s_inodes_per_group: INODE_COUNT,
        s_mtime: 0,
        s_wtime: 0,
        s_mnt_count: 0,
        s_max_mnt_count: 0xFFFF,
        s_magic: EXT2_MAGIC,
        s_state: 1,
        s_errors: 1,
        s_minor_rev_level: 0,
        s_lastcheck: 0,
        s_checkinterval: 0,
        s_creator_os: 0,
        s_rev_level: 0,
        s_def_resuid: 0,
        s_def_resgid: 0,
        s_first_ino: 11,
        s_inode_size: 128,
        s_block_group_nr: 0,
        s_feature_compat: 0,
        s_feature_incompat: 0,
        s_feature_ro_compat: 0,
    };
    let r = block(1);
    write_struct(&mut image[r], &sb);

    // Group descriptor table (block 2).
    let gd = GroupDesc {
        bg_block_bitmap: 3,
        bg_inode_bitmap: 4,
        bg_inode_table: 5,
        bg_free_blocks_count: free_blocks as u16,
        bg_free_inodes_count: free_inodes as u16,
        bg_used_dirs_count: 1,
        bg_pad: 0,
        bg_reserved: [0; 3],
    };
    let r = block(2);
    write_struct(&mut image[r], &gd);

    // Block bitmap (block 3): bit i covers block 1 + i.
    {
        let r = block(3);
        let bitmap = &mut image[r];
        for b in 1..=META_BLOCKS {
            let bit = (b - 1) as usize;
            bitmap[bit / 8] |= 1 << (bit % 8);
        }
        // Bits past the end of the device are permanently "in use".
        for bit in (total_blocks - 1) as usize..BLOCK_SIZE * 8 {
            bitmap[bit / 8] |= 1 << (bit % 8);
        }
    }

    // Inode bitmap (block 4): inodes 1..=10 reserved.
    {
        let r = block(4);
        let bitmap = &mut image[r];
        for bit in 0..RESERVED_INODES as usize {
            bitmap[bit / 8] |= 1 << (bit % 8);
        }
        for bit in INODE_COUNT as usize..BLOCK_SIZE * 8 {
            bitmap[bit / 8] |= 1 << (bit % 8);
        }
    }

    // Root inode (ino 2, table index 1).
    {
        let mut root = Inode {
            i_mode: S_IFDIR | 0o755,
            i_links_count: 2,
            i_size: BLOCK_SIZE as u32,
            i_blocks: (BLOCK_SIZE / 512) as u32,
            ..Inode::default()
        };
        root.i_block[0] = ROOT_DIR_BLOCK;
        let table_start = 5 * BLOCK_SIZE;
        let offset = table_start + (ROOT_INO as usize - 1) * 128;
        write_struct(&mut image[offset..], &root);
    }

    // Root directory block: "." and "..".
    {
        let r = block(ROOT_DIR_BLOCK);
        let buf = &mut image[r];
        let dot = DirEntryHeader {
            inode: ROOT_INO,
            rec_len: 12,
            name_len: 1,
            file_type: FT_DIR,
        };
        write_struct(buf, &dot);
        buf[8] = b'.';
        let dotdot = DirEntryHeader {
            inode: ROOT_INO,
            rec_len: (BLOCK_SIZE - 12) as u16,
            name_len: 2,
            file_type: FT_DIR,
        };
        write_struct(&mut buf[12..], &dotdot);
        buf[12 + 8] = b'.';
        buf[12 + 9] = b'.';
    }

    crate::fs::blockdev::RamDisk::from_image(image)
}

/// Assemble a minimal valid riscv64 ET_EXEC image from
/// `(vaddr, file bytes, memsz)` load segments. The entry point is the
/// lowest segment vaddr.
pub fn build_test_elf(segments: &[(u64, Vec<u8>, u64)]) -> Vec<u8> {
    use crate::elf::types::{
        Elf64Header, Elf64ProgramHeader, ELFCLASS64, ELF_MAGIC, EM_RISCV, ET_EXEC, PT_LOAD,
    };

    let header_size = core::mem::size_of::<Elf64Header>() as u64; // 64
    let ph_size = core::mem::size_of::<Elf64ProgramHeader>() as u64; // 56
    let data_start = header_size + ph_size * segments.len() as u64;

    let entry = segments.iter().map(|(v, _, _)| *v).min().unwrap_or(0);
    let header = Elf64Header {
        magic: ELF_MAGIC,
        class: ELFCLASS64,
        data: 1, // little endian
        version: 1,
        os_abi: 0,
        abi_version: 0,
        padding: [0; 7],
        elf_type: ET_EXEC,
        machine: EM_RISCV,
        version2: 1,
        entry,
        phoff: header_size,
        shoff: 0,
        flags: 0,
        ehsize: header_size as u16,
        phentsize: ph_size as u16,
        phnum: segments.len() as u16,
        shentsize: 0,
        shnum: 0,
        shstrndx: 0,
    };

    let mut file: Vec<u8> = Vec::new();
    // SAFETY: plain-old-data views of repr(C) structs for serialization.
    file.extend_from_slice(unsafe {
        core::slice::from_raw_parts(&header as *const _ as *const u8, header_size as usize)
    });

    let mut offset = data_start;
    for (vaddr, data, memsz) in segments {
        let ph = Elf64ProgramHeader {
            p_type: PT_LOAD,
            p_flags: 0x7, // RWX
            p_offset: offset,
            p_vaddr: *vaddr,
            p_paddr: *vaddr,
            p_filesz: data.len() as u64,
            p_memsz: *memsz,
            p_align: 0x1000,
        };
        // SAFETY: as above.
        file.extend_from_slice(unsafe {
            core::slice::from_raw_parts(&ph as *const _ as *const u8, ph_size as usize)
        });
        offset += data.len() as u64;
    }

    for (_, data, _) in segments {
        file.extend_from_slice(data);
    }
    file
}
