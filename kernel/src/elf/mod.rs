//! ELF64 loader: static executables, as new processes or via exec.
//!
//! Only `PT_LOAD` segments are loaded. The image is staged into a
//! physically contiguous buffer spanning `[min_vaddr, max_vaddr)` across
//! all load segments, zero-filled so each segment's `[p_filesz, p_memsz)`
//! tail reads as zeros.

pub mod types;

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use types::{Elf64Header, Elf64ProgramHeader, PT_LOAD};

use crate::error::{ElfError, KernelError};
use crate::mm::user_validation::{copy_from_user, copy_str_from_user, copy_to_user};
use crate::mm::{frame_allocator, vmm, PhysicalAddress, VirtualAddress, FRAME_SIZE};
use crate::process::{creation, signals, table, Pid, Vma, VmaFlags};

/// exec argv limits: fixed kernel staging buffers.
pub const EXEC_MAX_ARGS: usize = 16;
pub const EXEC_MAX_ARG_LEN: usize = 128;

/// A staged program image.
pub struct LoadedImage {
    /// Physically contiguous staging buffer.
    base: PhysicalAddress,
    pages: usize,
    /// Lowest PT_LOAD vaddr (the mapping base).
    pub min_vaddr: u64,
    /// Bytes spanned by the load segments.
    pub span: usize,
    /// Entry point (`e_entry`).
    pub entry: u64,
}

impl LoadedImage {
    /// The staged bytes.
    pub fn bytes(&self) -> &[u8] {
        // SAFETY: base points at `pages` frames owned by this image.
        unsafe { core::slice::from_raw_parts(self.base.as_ptr(), self.span) }
    }
}

impl Drop for LoadedImage {
    fn drop(&mut self) {
        frame_allocator::free_frames(self.base, self.pages);
    }
}

/// Parse and validate the header and program headers of `file`.
fn parse(file: &[u8]) -> Result<(Elf64Header, Vec<Elf64ProgramHeader>), KernelError> {
    if file.len() < core::mem::size_of::<Elf64Header>() {
        return Err(ElfError::BadMagic.into());
    }
    // SAFETY: length checked; plain-old-data read.
    let header: Elf64Header =
        unsafe { core::ptr::read_unaligned(file.as_ptr() as *const Elf64Header) };
    header.validate()?;

    let phentsize = header.phentsize as usize;
    let table_end = header.phoff as usize + header.phnum as usize * phentsize;
    if phentsize < core::mem::size_of::<Elf64ProgramHeader>() || table_end > file.len() {
        return Err(ElfError::BadProgramHeaders {
            phnum: header.phnum,
        }
        .into());
    }

    let mut phdrs = Vec::with_capacity(header.phnum as usize);
    for i in 0..header.phnum as usize {
        let off = header.phoff as usize + i * phentsize;
        // SAFETY: table_end bound checked above.
        let ph: Elf64ProgramHeader =
            unsafe { core::ptr::read_unaligned(file.as_ptr().add(off) as *const _) };
        phdrs.push(ph);
    }
    Ok((header, phdrs))
}

/// Stage `file` into a contiguous physical buffer.
pub fn build_image(file: &[u8]) -> Result<LoadedImage, KernelError> {
    let (header, phdrs) = parse(file)?;

    let loads: Vec<&Elf64ProgramHeader> =
        phdrs.iter().filter(|p| p.p_type == PT_LOAD).collect();
    if loads.is_empty() {
        return Err(ElfError::BadProgramHeaders {
            phnum: header.phnum,
        }
        .into());
    }

    let min_vaddr = loads.iter().map(|p| p.p_vaddr).min().unwrap();
    let max_vaddr = loads
        .iter()
        .map(|p| p.p_vaddr + p.p_memsz)
        .max()
        .unwrap();
    let span = (max_vaddr - min_vaddr) as usize;
    let pages = span.div_ceil(FRAME_SIZE).max(1);

    let base = frame_allocator::alloc_frames(pages)?;
    // SAFETY: fresh page run, exclusively ours.
    unsafe {
        core::ptr::write_bytes(base.as_ptr(), 0, pages * FRAME_SIZE);
    }

    for ph in loads {
        let file_start = ph.p_offset as usize;
        let file_end = file_start + ph.p_filesz as usize;
        if file_end > file.len() || ph.p_filesz > ph.p_memsz {
            frame_allocator::free_frames(base, pages);
            return Err(ElfError::BadProgramHeaders {
                phnum: header.phnum,
            }
            .into());
        }
        let dst_off = (ph.p_vaddr - min_vaddr) as usize;
        // SAFETY: dst_off + p_filesz <= span by the min/max computation;
        // source range checked above. The memsz tail stays zero from the
        // initial fill.
        unsafe {
            core::ptr::copy_nonoverlapping(
                file.as_ptr().add(file_start),
                base.as_ptr().add(dst_off),
                ph.p_filesz as usize,
            );
        }
    }

    Ok(LoadedImage {
        base,
        pages,
        min_vaddr,
        span,
        entry: header.entry,
    })
}

/// Read a whole file out of the VFS.
fn read_file(path: &str) -> Result<Vec<u8>, KernelError> {
    let (fs, residual) = crate::fs::resolve(path)?;
    let node = fs.open(&residual, crate::fs::OpenFlags::empty())?;
    let size = fs.stat(&residual)?.size as usize;

    let mut data = vec![0u8; size];
    let mut off = 0usize;
    while off < size {
        let n = fs.read(node, off as u64, &mut data[off..])?;
        if n == 0 {
            break;
        }
        off += n;
    }
    let _ = fs.close(node);
    data.truncate(off);
    Ok(data)
}

/// Load the executable at `path` as a new process.
pub fn load_process(path: &str, name: &str) -> Result<Pid, KernelError> {
    let file = read_file(path)?;
    let image = build_image(&file)?;
    creation::process_create_user_at(name, image.bytes(), image.min_vaddr, image.entry)
}

/// Replace the current process image (execve).
///
/// `path_uva` and `argv_uva` point into the *current* user image, which
/// is about to be unmapped: both are copied into fixed kernel buffers
/// first. On success the rewritten trap frame enters the new program and
/// the syscall return value (argc, already in `a0`) is never observed by
/// the old image. Failures before teardown return an error; a mapping
/// failure after teardown is fatal.
pub fn exec_replace(
    frame: &mut crate::arch::riscv64::trap::TrapFrame,
    path_uva: u64,
    argv_uva: u64,
) -> Result<i64, KernelError> {
    let (pid, root, cwd) = table::with_current(|p| (p.pid, p.root, p.cwd.clone()))
        .ok_or(KernelError::Process(crate::error::ProcessError::NoSuchProcess { pid: 0 }))?;
    let root = root.ok_or(KernelError::InvalidArgument { name: "exec" })?;

    // Preserve path and argv in kernel memory before anything is torn
    // down.
    let path = copy_str_from_user(root, path_uva, EXEC_MAX_ARG_LEN)?;
    let mut args: Vec<String> = Vec::new();
    if argv_uva != 0 {
        for i in 0..=EXEC_MAX_ARGS {
            let mut ptr_bytes = [0u8; 8];
            copy_from_user(root, argv_uva + (i * 8) as u64, &mut ptr_bytes)?;
            let ptr = u64::from_le_bytes(ptr_bytes);
            if ptr == 0 {
                break;
            }
            if i == EXEC_MAX_ARGS {
                return Err(KernelError::InvalidArgument { name: "argv" });
            }
            args.push(copy_str_from_user(root, ptr, EXEC_MAX_ARG_LEN)?);
        }
    }

    // Read and validate the new image while the old one is still intact.
    let abs_path = crate::fs::normalize_path(&cwd, &path);
    let file = read_file(&abs_path)?;
    let image = build_image(&file)?;

    // Point of no return: free every non-stack VMA.
    let (stack_vmas, doomed): (Vec<Vma>, Vec<Vma>) = table::with_current(|p| {
        let vmas = core::mem::take(&mut p.vmas);
        vmas.into_iter().partition(|v| v.is_stack())
    })
    .expect("exec caller vanished");

    for vma in &doomed {
        vmm::unmap_and_free_range(root, VirtualAddress::new(vma.start), vma.pages() as usize);
    }

    // Install the new image with full user permissions. A failure here
    // would leave the process without a coherent image; that is fatal.
    let image_base = VirtualAddress::new(image.min_vaddr).page_base();
    let image_pages = ((image.min_vaddr - image_base.as_u64()) as usize + image.span)
        .div_ceil(FRAME_SIZE);
    let bytes = image.bytes();
    for i in 0..image_pages {
        let page = frame_allocator::alloc_frame()
            .unwrap_or_else(|_| panic!("exec: out of memory installing image for pid {}", pid));
        // SAFETY: fresh frame; copy bounds derived from span.
        unsafe {
            core::ptr::write_bytes(page.as_ptr(), 0, FRAME_SIZE);
            let page_va = image_base.as_u64() + (i * FRAME_SIZE) as u64;
            let copy_start = page_va.max(image.min_vaddr);
            let copy_end = (page_va + FRAME_SIZE as u64).min(image.min_vaddr + image.span as u64);
            if copy_end > copy_start {
                let src = (copy_start - image.min_vaddr) as usize;
                let dst = (copy_start - page_va) as usize;
                core::ptr::copy_nonoverlapping(
                    bytes.as_ptr().add(src),
                    page.as_ptr().add(dst),
                    (copy_end - copy_start) as usize,
                );
            }
        }
        vmm::map(
            root,
            image_base.add(i * FRAME_SIZE),
            page,
            crate::mm::page_table::PteFlags::USER_RWX,
        )
        .unwrap_or_else(|e| panic!("exec: mapping new image failed for pid {}: {}", pid, e));
    }

    // Rebuild the trampoline (it lived in a doomed VMA) and reset
    // handlers: the new image knows nothing about the old one's.
    let tramp_vma = signals::install_trampoline(root)
        .unwrap_or_else(|e| panic!("exec: trampoline remap failed for pid {}: {}", pid, e));

    // Build argv on the user stack, top down.
    let mut sp = crate::mm::layout::USER_STACK_TOP;
    let mut arg_ptrs: Vec<u64> = Vec::with_capacity(args.len());
    for arg in &args {
        sp -= arg.len() as u64 + 1;
        copy_to_user(root, sp, arg.as_bytes())
            .and_then(|_| copy_to_user(root, sp + arg.len() as u64, &[0u8]))
            .unwrap_or_else(|e| panic!("exec: argv copy failed for pid {}: {}", pid, e));
        arg_ptrs.push(sp);
    }
    sp &= !7;
    sp -= ((args.len() + 1) * 8) as u64;
    sp &= !15;
    for (i, ptr) in arg_ptrs.iter().enumerate() {
        copy_to_user(root, sp + (i * 8) as u64, &ptr.to_le_bytes())
            .unwrap_or_else(|e| panic!("exec: argv table copy failed for pid {}: {}", pid, e));
    }
    copy_to_user(
        root,
        sp + (args.len() * 8) as u64,
        &0u64.to_le_bytes(),
    )
    .unwrap_or_else(|e| panic!("exec: argv terminator copy failed for pid {}: {}", pid, e));

    let argc = args.len() as u64;
    let argv_base = sp;

    // Record the new image in the PCB.
    table::with_current(|p| {
        p.vmas = stack_vmas;
        p.vmas.push(tramp_vma);
        let _ = p.add_vma(Vma::new(
            image_base.as_u64(),
            image_base.as_u64() + (image_pages * FRAME_SIZE) as u64,
            VmaFlags::READ | VmaFlags::WRITE | VmaFlags::EXEC | VmaFlags::USER,
        ));
        p.sig_handlers = [0; signals::NSIG];
        p.sig_pending = 0;
        p.heap_base = creation::USER_HEAP_BASE;
        p.heap_end = creation::USER_HEAP_BASE;
        p.name = match abs_path.rsplit('/').next() {
            Some(base) if !base.is_empty() => String::from(base),
            _ => abs_path.clone(),
        };
    });

    // Rewrite the trap frame: all integer registers zero except the new
    // entry state.
    *frame = crate::arch::riscv64::trap::TrapFrame::zeroed();
    frame.sepc = image.entry;
    frame.set_sp(argv_base);
    frame.regs[crate::arch::riscv64::trap::REG_S0] = argv_base;
    frame.set_a0(argc);
    frame.regs[crate::arch::riscv64::trap::REG_A1] = argv_base;
    frame.sstatus = crate::arch::riscv64::trap::SSTATUS_SPIE;

    // Reload the translation state for the rebuilt address space.
    vmm::switch_root(root);

    Ok(argc as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;

    #[test]
    fn build_image_round_trips_segments_and_zeroes_bss() {
        test_support::init_test_memory();

        let seg1: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let seg2: Vec<u8> = (0..300u32).map(|i| (i % 97) as u8).collect();
        let elf = test_support::build_test_elf(&[
            // vaddr, filesz bytes, memsz
            (0x10000, seg1.clone(), 1000),
            (0x12000, seg2.clone(), 2048), // 1748 bytes of BSS
        ]);

        let image = build_image(&elf).unwrap();
        assert_eq!(image.min_vaddr, 0x10000);
        assert_eq!(image.span, 0x2000 + 2048);
        assert_eq!(image.entry, 0x10000);

        let bytes = image.bytes();
        // Segment contents match byte for byte.
        assert_eq!(&bytes[..1000], &seg1[..]);
        assert_eq!(&bytes[0x2000..0x2000 + 300], &seg2[..]);
        // Gap between segments and the memsz tail are zero.
        assert!(bytes[1000..0x2000].iter().all(|&b| b == 0));
        assert!(bytes[0x2000 + 300..].iter().all(|&b| b == 0));
    }

    #[test]
    fn image_buffers_are_returned_on_drop() {
        test_support::init_test_memory();
        let elf = test_support::build_test_elf(&[(0x10000, vec![1, 2, 3], 3)]);
        let free_before = frame_allocator::stats().1;
        let image = build_image(&elf).unwrap();
        assert!(frame_allocator::stats().1 < free_before);
        drop(image);
        assert_eq!(frame_allocator::stats().1, free_before);
    }

    #[test]
    fn malformed_files_are_rejected() {
        test_support::init_test_memory();

        // Truncated header.
        assert!(build_image(&[0x7F, b'E', b'L', b'F']).is_err());

        // Segment data past the end of the file.
        let mut elf = test_support::build_test_elf(&[(0x10000, vec![9u8; 64], 64)]);
        let len = elf.len();
        elf.truncate(len - 32);
        assert!(build_image(&elf).is_err());
    }

    #[test]
    fn load_process_from_an_ext2_volume() {
        let _serial_proc = test_support::proc_serial();
        let _serial_vfs = test_support::vfs_serial();
        test_support::init_test_memory();

        // Put an executable on a disk volume.
        let program: Vec<u8> = (0..600u32).map(|i| (i ^ 0x5A) as u8).collect();
        let elf = test_support::build_test_elf(&[(0x10000, program.clone(), 600)]);
        let fs = alloc::sync::Arc::new(
            crate::fs::ext2::Ext2Filesystem::mount(alloc::boxed::Box::new(
                test_support::mkfs_ext2_ramdisk(1024),
            ))
            .unwrap(),
        );
        crate::fs::mount("/elfload", fs).unwrap();

        let fd = crate::fs::file::vfs_open(
            "/elfload/app",
            crate::fs::OpenFlags::RDWR | crate::fs::OpenFlags::CREATE,
            0,
        )
        .unwrap();
        crate::fs::file::vfs_write(fd, &elf).unwrap();
        crate::fs::file::vfs_close(fd).unwrap();

        // Load it and verify the mapped image matches the segment bytes.
        let pid = load_process("/elfload/app", "app").unwrap();
        table::with_process(pid, |p| {
            let root = p.root.unwrap();
            for (i, &expect) in program.iter().enumerate() {
                let pa = vmm::translate(root, VirtualAddress::new(0x10000 + i as u64)).unwrap();
                // SAFETY: image page in the test pool.
                assert_eq!(unsafe { *pa.as_ptr() }, expect, "byte {}", i);
            }
            // SAFETY: trap frame seeded by creation.
            let frame = unsafe { &*p.trap_frame_ptr() };
            assert_eq!(frame.sepc, 0x10000);
        })
        .unwrap();

        // Teardown.
        let p = table::with_table(|t| t.remove(pid)).unwrap();
        if let Some(root) = p.root {
            crate::process::lifecycle::destroy_image(root, &p.vmas);
        }
        frame_allocator::free_frames(p.kstack, crate::process::KERNEL_STACK_PAGES);
        crate::sched::remove_from_queue(pid);
        crate::fs::unmount("/elfload").unwrap();
    }

    #[test]
    fn exec_replaces_the_image_and_builds_argv() {
        let _serial_proc = test_support::proc_serial();
        let _serial_vfs = test_support::vfs_serial();
        test_support::init_test_memory();

        // Volume with the new program.
        let program: Vec<u8> = (0..256u32).map(|i| i as u8).collect();
        let elf = test_support::build_test_elf(&[(0x10000, program.clone(), 256)]);
        let fs = alloc::sync::Arc::new(
            crate::fs::ext2::Ext2Filesystem::mount(alloc::boxed::Box::new(
                test_support::mkfs_ext2_ramdisk(1024),
            ))
            .unwrap(),
        );
        crate::fs::mount("/", fs).unwrap();
        let fd = crate::fs::file::vfs_open(
            "/newprog",
            crate::fs::OpenFlags::RDWR | crate::fs::OpenFlags::CREATE,
            0,
        )
        .unwrap();
        crate::fs::file::vfs_write(fd, &elf).unwrap();
        crate::fs::file::vfs_close(fd).unwrap();

        // A live process whose stack holds path + argv.
        let old_code = [0x13u8, 0, 0, 0];
        let pid = crate::process::creation::process_create_user("old", &old_code).unwrap();
        table::set_current(Some(pid));
        let root = table::with_process(pid, |p| p.root.unwrap()).unwrap();

        let scratch = crate::mm::layout::USER_STACK_TOP - 4096;
        copy_to_user(root, scratch, b"/newprog\0").unwrap();
        copy_to_user(root, scratch + 32, b"newprog\0").unwrap();
        copy_to_user(root, scratch + 48, b"-v\0").unwrap();
        // argv array: [scratch+32, scratch+48, NULL]
        let argv_at = scratch + 64;
        copy_to_user(root, argv_at, &(scratch + 32).to_le_bytes()).unwrap();
        copy_to_user(root, argv_at + 8, &(scratch + 48).to_le_bytes()).unwrap();
        copy_to_user(root, argv_at + 16, &0u64.to_le_bytes()).unwrap();

        let mut frame = crate::arch::riscv64::trap::TrapFrame::zeroed();
        frame.set_sp(scratch);
        let ret = exec_replace(&mut frame, scratch, argv_at).unwrap();
        assert_eq!(ret, 2);

        // Frame enters the new program with argc/argv.
        assert_eq!(frame.sepc, 0x10000);
        assert_eq!(frame.a0(), 2);
        let argv_base = frame.regs[crate::arch::riscv64::trap::REG_A1];
        assert_eq!(argv_base % 16, 0);
        assert_eq!(frame.sp(), argv_base);

        // argv strings are reachable through the new stack layout.
        let mut ptr0 = [0u8; 8];
        copy_from_user(root, argv_base, &mut ptr0).unwrap();
        let s0 = copy_str_from_user(root, u64::from_le_bytes(ptr0), 64).unwrap();
        assert_eq!(s0, "newprog");
        let mut ptr1 = [0u8; 8];
        copy_from_user(root, argv_base + 8, &mut ptr1).unwrap();
        let s1 = copy_str_from_user(root, u64::from_le_bytes(ptr1), 64).unwrap();
        assert_eq!(s1, "-v");
        let mut nullp = [0u8; 8];
        copy_from_user(root, argv_base + 16, &mut nullp).unwrap();
        assert_eq!(u64::from_le_bytes(nullp), 0);

        // The new image is mapped; process renamed.
        let pa = vmm::translate(root, VirtualAddress::new(0x10000 + 100)).unwrap();
        // SAFETY: image page in the test pool.
        assert_eq!(unsafe { *pa.as_ptr() }, 100);
        assert_eq!(
            table::with_process(pid, |p| p.name.clone()).unwrap(),
            "newprog"
        );

        // Teardown.
        table::set_current(None);
        let p = table::with_table(|t| t.remove(pid)).unwrap();
        crate::process::lifecycle::destroy_image(p.root.unwrap(), &p.vmas);
        frame_allocator::free_frames(p.kstack, crate::process::KERNEL_STACK_PAGES);
        crate::sched::remove_from_queue(pid);
        crate::fs::unmount("/").unwrap();
    }
}
