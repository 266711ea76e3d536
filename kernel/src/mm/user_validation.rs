//! User pointer validation and copy helpers.
//!
//! The syscall layer never dereferences a user address directly. Every
//! transfer validates the range against the user address space bound, then
//! copies page-by-page through the process root's translations, so an
//! unmapped or kernel-space pointer fails cleanly with an error instead of
//! faulting in supervisor mode.

use alloc::string::String;
use alloc::vec::Vec;

use super::layout::USER_SPACE_END;
use super::{vmm, PhysicalAddress, VirtualAddress, FRAME_SIZE};
use crate::error::KernelError;

/// Largest single user transfer the kernel will stage.
pub const MAX_USER_COPY: usize = 1024 * 1024;

/// Check that `[addr, addr + len)` lies inside the user address range.
pub fn validate_user_range(addr: u64, len: usize) -> Result<(), KernelError> {
    if addr == 0 || len > MAX_USER_COPY {
        return Err(KernelError::InvalidAddress { addr: addr as usize });
    }
    let end = addr.checked_add(len as u64).ok_or(KernelError::InvalidAddress {
        addr: addr as usize,
    })?;
    if addr >= USER_SPACE_END || end > USER_SPACE_END {
        return Err(KernelError::InvalidAddress { addr: addr as usize });
    }
    Ok(())
}

/// Copy `buf.len()` bytes from user memory at `uva` (translated through
/// `root`) into `buf`.
pub fn copy_from_user(
    root: PhysicalAddress,
    uva: u64,
    buf: &mut [u8],
) -> Result<(), KernelError> {
    validate_user_range(uva, buf.len())?;

    let mut copied = 0usize;
    while copied < buf.len() {
        let va = VirtualAddress::new(uva + copied as u64);
        let pa = vmm::translate(root, va)?;
        let chunk = (FRAME_SIZE - va.page_offset()).min(buf.len() - copied);
        // SAFETY: pa comes from a live leaf translation, so at least
        // `chunk` bytes starting there belong to the mapped page.
        unsafe {
            core::ptr::copy_nonoverlapping(pa.as_ptr(), buf.as_mut_ptr().add(copied), chunk);
        }
        copied += chunk;
    }
    Ok(())
}

/// Copy `data` into user memory at `uva` (translated through `root`).
pub fn copy_to_user(root: PhysicalAddress, uva: u64, data: &[u8]) -> Result<(), KernelError> {
    validate_user_range(uva, data.len())?;

    let mut copied = 0usize;
    while copied < data.len() {
        let va = VirtualAddress::new(uva + copied as u64);
        let pa = vmm::translate(root, va)?;
        let chunk = (FRAME_SIZE - va.page_offset()).min(data.len() - copied);
        // SAFETY: as in copy_from_user; the leaf is writable because user
        // data mappings that syscalls write through are created writable.
        unsafe {
            core::ptr::copy_nonoverlapping(data.as_ptr().add(copied), pa.as_ptr(), chunk);
        }
        copied += chunk;
    }
    Ok(())
}

/// Copy a NUL-terminated string of at most `max_len` bytes from user
/// memory. Fails if no terminator is found within the bound or the bytes
/// are not UTF-8.
pub fn copy_str_from_user(
    root: PhysicalAddress,
    uva: u64,
    max_len: usize,
) -> Result<String, KernelError> {
    validate_user_range(uva, 1)?;

    let mut bytes: Vec<u8> = Vec::new();
    let mut offset = 0u64;
    'outer: while (offset as usize) < max_len {
        let va = VirtualAddress::new(uva + offset);
        let pa = vmm::translate(root, va)?;
        let chunk = (FRAME_SIZE - va.page_offset()).min(max_len - offset as usize);
        for i in 0..chunk {
            // SAFETY: within the translated page, bounded by `chunk`.
            let b = unsafe { *pa.as_ptr().add(i) };
            if b == 0 {
                break 'outer;
            }
            bytes.push(b);
        }
        offset += chunk as u64;
        if offset as usize >= max_len {
            return Err(KernelError::InvalidArgument { name: "string" });
        }
    }

    String::from_utf8(bytes).map_err(|_| KernelError::InvalidArgument { name: "string" })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::frame_allocator;
    use crate::test_support;

    fn user_root_with_page(va: u64) -> PhysicalAddress {
        let root = vmm::create_user_root().unwrap();
        vmm::map_user_memory(root, VirtualAddress::new(va), None, 2 * FRAME_SIZE, true).unwrap();
        root
    }

    fn teardown(root: PhysicalAddress, va: u64, pages: usize) {
        for i in 0..pages {
            let pa = vmm::unmap(root, VirtualAddress::new(va + (i * FRAME_SIZE) as u64)).unwrap();
            frame_allocator::free_frame(pa);
        }
        vmm::free_root_tree(root);
    }

    #[test]
    fn range_validation_rejects_kernel_and_null_pointers() {
        assert!(validate_user_range(0, 8).is_err());
        assert!(validate_user_range(USER_SPACE_END, 8).is_err());
        assert!(validate_user_range(USER_SPACE_END - 4, 8).is_err());
        assert!(validate_user_range(0x10000, 8).is_ok());
    }

    #[test]
    fn copies_cross_page_boundaries() {
        test_support::init_test_memory();
        let va = 0x40_0000u64;
        let root = user_root_with_page(va);

        // Write a pattern straddling the first page boundary.
        let pattern: Vec<u8> = (0..600u32).map(|i| (i % 255) as u8).collect();
        let start = va + FRAME_SIZE as u64 - 300;
        copy_to_user(root, start, &pattern).unwrap();

        let mut back = alloc::vec![0u8; pattern.len()];
        copy_from_user(root, start, &mut back).unwrap();
        assert_eq!(back, pattern);

        teardown(root, va, 2);
    }

    #[test]
    fn unmapped_user_memory_is_an_error() {
        test_support::init_test_memory();
        let root = vmm::create_user_root().unwrap();
        let mut buf = [0u8; 16];
        assert!(copy_from_user(root, 0x50_0000, &mut buf).is_err());
        vmm::free_root_tree(root);
    }

    #[test]
    fn strings_are_copied_up_to_the_terminator() {
        test_support::init_test_memory();
        let va = 0x60_0000u64;
        let root = user_root_with_page(va);

        copy_to_user(root, va, b"/bin/sh\0trailing").unwrap();
        let s = copy_str_from_user(root, va, 128).unwrap();
        assert_eq!(s, "/bin/sh");

        // Unterminated within the bound.
        copy_to_user(root, va, b"AAAAAAAA").unwrap();
        assert!(copy_str_from_user(root, va, 8).is_err());

        teardown(root, va, 2);
    }
}
