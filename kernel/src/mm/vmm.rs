//! Virtual memory: Sv39 mapping, kernel identity map, user address spaces.
//!
//! The kernel root table is a static, page-aligned singleton. User roots
//! are PMM-page-backed and owned by exactly one process; their entries
//! 2..511 are copied from the kernel root at creation time so the kernel
//! half of every address space stays identical, and the UART and CLINT
//! MMIO pages are mapped per-root so trap handling keeps working after
//! `switch_root`.
//!
//! Page-table tree nodes form an owning tree rooted at a process; leaf
//! data pages are owned through VMAs. [`free_root_tree`] therefore frees
//! interior nodes only -- freeing leaf pages is the VMA walk's job.

use spin::Mutex;

use super::frame_allocator;
use super::layout;
use super::page_table::{
    PageTable, PageTableEntry, PteFlags, VirtualAddressBreakdown, PAGE_TABLE_ENTRIES,
};
use super::{PhysicalAddress, VirtualAddress, FRAME_SIZE};
use crate::error::KernelError;

/// The kernel's root page table: static, page-aligned singleton.
static KERNEL_ROOT: Mutex<PageTable> = Mutex::new(PageTable::new());

/// Physical address of the kernel root table.
pub fn kernel_root_addr() -> PhysicalAddress {
    let guard = KERNEL_ROOT.lock();
    PhysicalAddress::new(&*guard as *const PageTable as u64)
}

/// Zero a freshly allocated physical page.
fn zero_page(page: PhysicalAddress) {
    // SAFETY: the caller just allocated this page from the PMM; it is
    // identity-accessible and exclusively ours.
    unsafe {
        core::ptr::write_bytes(page.as_ptr(), 0, FRAME_SIZE);
    }
}

/// Walk to the VPN0 entry for `va`, allocating interior nodes as needed.
///
/// Returns a pointer into the leaf-level table. Encountering a leaf entry
/// at an interior level means the tree is corrupt.
fn walk_alloc(
    root: PhysicalAddress,
    va: VirtualAddress,
) -> Result<*mut PageTableEntry, KernelError> {
    let b = VirtualAddressBreakdown::new(va);
    let mut table = root.as_ptr() as *mut PageTable;

    for level in [2usize, 1] {
        // SAFETY: `table` points at a valid page-table node: either the
        // root supplied by the caller or a child installed below.
        let entry = unsafe { &mut (&mut *table)[b.index(level)] };
        if entry.is_leaf() {
            return Err(KernelError::PageTableCorrupt {
                addr: va.as_usize(),
            });
        }
        if !entry.is_valid() {
            let page = frame_allocator::alloc_frame()?;
            zero_page(page);
            entry.set(page, PteFlags::VALID);
        }
        table = entry.addr().as_ptr() as *mut PageTable;
    }

    // SAFETY: after two interior steps `table` is the VPN0 node.
    Ok(unsafe { &mut (&mut *table)[b.vpn0] })
}

/// Walk to the VPN0 entry for `va` without allocating.
fn walk(root: PhysicalAddress, va: VirtualAddress) -> Result<*mut PageTableEntry, KernelError> {
    let b = VirtualAddressBreakdown::new(va);
    let mut table = root.as_ptr() as *mut PageTable;

    for level in [2usize, 1] {
        // SAFETY: `table` points at a valid page-table node.
        let entry = unsafe { &mut (&mut *table)[b.index(level)] };
        if entry.is_leaf() {
            return Err(KernelError::PageTableCorrupt {
                addr: va.as_usize(),
            });
        }
        if !entry.is_valid() {
            return Err(KernelError::UnmappedMemory {
                addr: va.as_usize(),
            });
        }
        table = entry.addr().as_ptr() as *mut PageTable;
    }

    // SAFETY: as in walk_alloc.
    Ok(unsafe { &mut (&mut *table)[b.vpn0] })
}

/// Install a 4 KiB leaf mapping `va -> pa` in `root`.
///
/// Mapping an address that already has a valid leaf is an error.
pub fn map(
    root: PhysicalAddress,
    va: VirtualAddress,
    pa: PhysicalAddress,
    flags: PteFlags,
) -> Result<(), KernelError> {
    debug_assert!(pa.is_page_aligned());
    let entry = walk_alloc(root, va)?;
    // SAFETY: walk_alloc returned a valid entry pointer into a live node.
    unsafe {
        if (*entry).is_valid() {
            return Err(KernelError::AlreadyMapped {
                addr: va.as_usize(),
            });
        }
        (*entry).set(pa, flags);
    }
    Ok(())
}

/// Remove the leaf mapping for `va`, returning the physical page it
/// pointed at. The page itself is not freed.
pub fn unmap(root: PhysicalAddress, va: VirtualAddress) -> Result<PhysicalAddress, KernelError> {
    let entry = walk(root, va)?;
    // SAFETY: walk returned a valid entry pointer.
    let pa = unsafe {
        if !(*entry).is_valid() {
            return Err(KernelError::UnmappedMemory {
                addr: va.as_usize(),
            });
        }
        let pa = (*entry).addr();
        (*entry).clear();
        pa
    };
    flush_tlb(Some(va));
    Ok(pa)
}

/// Translate `va` through `root`, preserving the intra-page offset.
pub fn translate(
    root: PhysicalAddress,
    va: VirtualAddress,
) -> Result<PhysicalAddress, KernelError> {
    let entry = walk(root, va)?;
    // SAFETY: walk returned a valid entry pointer.
    unsafe {
        if !(*entry).is_valid() || !(*entry).is_leaf() {
            return Err(KernelError::UnmappedMemory {
                addr: va.as_usize(),
            });
        }
        Ok((*entry).addr().offset(va.page_offset() as u64))
    }
}

/// Translate a kernel virtual address to physical. The kernel runs
/// identity-mapped, but device code must obtain DMA addresses through this
/// call rather than assuming the identity.
pub fn kernel_translate(va: usize) -> PhysicalAddress {
    PhysicalAddress::new(va as u64)
}

/// Flush the TLB for one page, or entirely when `va` is `None`.
#[allow(unused_variables)]
pub fn flush_tlb(va: Option<VirtualAddress>) {
    #[cfg(target_arch = "riscv64")]
    // SAFETY: sfence.vma only invalidates address-translation caches.
    unsafe {
        match va {
            Some(va) => {
                core::arch::asm!("sfence.vma {}, zero", in(reg) va.as_usize());
            }
            None => core::arch::asm!("sfence.vma"),
        }
    }
}

/// Point `satp` at `root` (Sv39) and flush the TLB.
#[allow(unused_variables)]
pub fn switch_root(root: PhysicalAddress) {
    #[cfg(target_arch = "riscv64")]
    {
        let ppn = (root.as_u64() >> 12) as usize;
        // SAFETY: `root` is a live page-table root whose kernel half maps
        // the currently executing code, so the hart keeps fetching from
        // valid translations across the write.
        unsafe {
            riscv::register::satp::set(riscv::register::satp::Mode::Sv39, 0, ppn);
        }
        flush_tlb(None);
    }
}

/// Identity-map `[start, end)` into `root` with `flags`.
fn map_range_identity(
    root: PhysicalAddress,
    start: usize,
    end: usize,
    flags: PteFlags,
) -> Result<(), KernelError> {
    let mut addr = super::align_down(start, FRAME_SIZE);
    while addr < end {
        map(
            root,
            VirtualAddress::new(addr as u64),
            PhysicalAddress::new(addr as u64),
            flags,
        )?;
        addr += FRAME_SIZE;
    }
    Ok(())
}

/// Map the UART and CLINT MMIO pages into `root` (supervisor-only, RW).
fn map_mmio(root: PhysicalAddress) -> Result<(), KernelError> {
    map_range_identity(
        root,
        layout::UART0_BASE,
        layout::UART0_BASE + FRAME_SIZE,
        PteFlags::KERNEL_RW,
    )?;
    map_range_identity(
        root,
        layout::CLINT_BASE,
        layout::CLINT_BASE + layout::CLINT_SIZE,
        PteFlags::KERNEL_RW,
    )
}

/// Build the kernel address space and enable Sv39.
///
/// Identity maps: the kernel image (RWX), the rest of RAM (RW), and the
/// UART/CLINT MMIO pages; then writes `satp` and flushes the TLB.
#[cfg(target_arch = "riscv64")]
pub fn init() -> Result<(), KernelError> {
    let root = kernel_root_addr();
    let kstart = crate::arch::riscv64::boot::kernel_start();
    let kend = super::align_up(crate::arch::riscv64::boot::kernel_end(), FRAME_SIZE);

    // Kernel text + data, executable.
    map_range_identity(root, kstart, kend, PteFlags::KERNEL_RWX)?;
    // Remaining RAM, data only. The firmware region below the kernel is
    // included so the PMM-managed window and DMA memory stay reachable.
    map_range_identity(root, layout::RAM_BASE, kstart, PteFlags::KERNEL_RW)?;
    map_range_identity(root, kend, layout::RAM_END, PteFlags::KERNEL_RW)?;
    map_mmio(root)?;

    switch_root(root);
    log::info!(
        "vmm: sv39 enabled, kernel root {:#x}, image [{:#x}, {:#x})",
        root.as_u64(),
        kstart,
        kend
    );
    Ok(())
}

/// Allocate a user root table: kernel half (entries 2..511) copied from
/// the kernel root, user half empty, MMIO pages mapped.
pub fn create_user_root() -> Result<PhysicalAddress, KernelError> {
    let root = frame_allocator::alloc_frame()?;
    zero_page(root);

    {
        let kernel = KERNEL_ROOT.lock();
        // SAFETY: `root` is a freshly allocated, zeroed page we own; the
        // kernel root is a valid table behind its lock.
        let user = unsafe { &mut *(root.as_ptr() as *mut PageTable) };
        for i in 2..PAGE_TABLE_ENTRIES {
            user[i] = kernel[i];
        }
    }

    if let Err(e) = map_mmio(root) {
        free_root_tree(root);
        return Err(e);
    }
    Ok(root)
}

/// Free every interior node of a user root tree, post-order, then the root
/// itself. Leaf data pages are not touched -- the caller frees those
/// through its VMA walk. Forbidden on the kernel root.
pub fn free_root_tree(root: PhysicalAddress) {
    if root == kernel_root_addr() {
        panic!("attempt to free the kernel root page table");
    }

    // SAFETY: `root` is a user root produced by create_user_root; nothing
    // else references it once the owning process is tearing down.
    let table = unsafe { &mut *(root.as_ptr() as *mut PageTable) };

    // Entries 2..511 alias the kernel root's shared subtrees; only the
    // user half (entries 0 and 1) is owned by this tree.
    for i in 0..2 {
        let l2_entry: PageTableEntry = table[i];
        if !l2_entry.is_valid() || l2_entry.is_leaf() {
            continue;
        }
        let mid_addr = l2_entry.addr();
        // SAFETY: interior entries installed by walk_alloc always point at
        // PMM-allocated table nodes.
        let mid = unsafe { &mut *(mid_addr.as_ptr() as *mut PageTable) };
        for j in 0..PAGE_TABLE_ENTRIES {
            let l1_entry: PageTableEntry = mid[j];
            if l1_entry.is_valid() && !l1_entry.is_leaf() {
                frame_allocator::free_frame(l1_entry.addr());
            }
        }
        frame_allocator::free_frame(mid_addr);
    }

    frame_allocator::free_frame(root);
}

/// Unmap `[base, base + pages * FRAME_SIZE)` from `root`, returning each
/// mapped leaf page to the PMM. Holes are skipped. Used by teardown paths
/// and by the mapping helpers to undo partial work.
pub fn unmap_and_free_range(root: PhysicalAddress, base: VirtualAddress, pages: usize) {
    for i in 0..pages {
        if let Ok(pa) = unmap(root, base.add(i * FRAME_SIZE)) {
            frame_allocator::free_frame(pa);
        }
    }
}

/// Map a user code image at `uva` with `V|R|X|U`, allocating and zeroing
/// physical pages and copying `code` into them. Honors an unaligned `uva`
/// (intra-page offset) and a partial last page. On failure, already
/// installed pages are unmapped and freed.
pub fn map_user_code(
    root: PhysicalAddress,
    uva: VirtualAddress,
    code: &[u8],
) -> Result<(), KernelError> {
    let start_offset = uva.page_offset();
    let total = start_offset + code.len();
    let pages = total.div_ceil(FRAME_SIZE);
    let base = uva.page_base();

    let mut copied = 0usize;
    for i in 0..pages {
        let page = match frame_allocator::alloc_frame() {
            Ok(p) => p,
            Err(e) => {
                unmap_and_free_range(root, base, i);
                return Err(e);
            }
        };
        zero_page(page);

        // Portion of `code` landing in this page.
        let page_start = i * FRAME_SIZE;
        let dst_off = if i == 0 { start_offset } else { 0 };
        let space = FRAME_SIZE - dst_off;
        let take = space.min(code.len() - copied);
        if take > 0 {
            // SAFETY: `page` is a fresh zeroed frame; dst_off + take is
            // bounded by FRAME_SIZE and the source range by code.len().
            unsafe {
                core::ptr::copy_nonoverlapping(
                    code.as_ptr().add(copied),
                    page.as_ptr().add(dst_off),
                    take,
                );
            }
            copied += take;
        }

        if let Err(e) = map(root, base.add(page_start), page, PteFlags::USER_RX) {
            frame_allocator::free_frame(page);
            unmap_and_free_range(root, base, i);
            return Err(e);
        }
    }

    crate::arch::barriers::instruction_fence();
    Ok(())
}

/// Map `size` bytes of user memory at `uva` (page-aligned). When `phys` is
/// `None` fresh zeroed pages are allocated; otherwise the given contiguous
/// physical range is mapped. Writable mappings get `V|R|W|U`, read-only
/// ones `V|R|U`.
pub fn map_user_memory(
    root: PhysicalAddress,
    uva: VirtualAddress,
    phys: Option<PhysicalAddress>,
    size: usize,
    writable: bool,
) -> Result<(), KernelError> {
    if uva.page_offset() != 0 {
        return Err(KernelError::InvalidAddress {
            addr: uva.as_usize(),
        });
    }
    let pages = size.div_ceil(FRAME_SIZE);
    let flags = if writable {
        PteFlags::USER_RW
    } else {
        PteFlags::USER_RO
    };

    for i in 0..pages {
        let pa = match phys {
            Some(p) => p.offset((i * FRAME_SIZE) as u64),
            None => {
                let page = match frame_allocator::alloc_frame() {
                    Ok(p) => p,
                    Err(e) => {
                        unmap_and_free_range(root, uva, i);
                        return Err(e);
                    }
                };
                zero_page(page);
                page
            }
        };
        if let Err(e) = map(root, uva.add(i * FRAME_SIZE), pa, flags) {
            match phys {
                // Freshly allocated pages go back to the PMM.
                None => {
                    frame_allocator::free_frame(pa);
                    unmap_and_free_range(root, uva, i);
                }
                // Caller-owned physical range: unmap only.
                Some(_) => {
                    for j in 0..i {
                        let _ = unmap(root, uva.add(j * FRAME_SIZE));
                    }
                }
            }
            return Err(e);
        }
    }
    Ok(())
}
