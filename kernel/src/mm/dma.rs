//! DMA-contiguous memory allocation.
//!
//! Device drivers need physically contiguous buffers whose addresses can be
//! handed to hardware. Regions come straight from the PMM (so they are
//! contiguous by construction) and are tracked in a global registry list.
//! The registry is bookkeeping only: ownership of a region belongs to
//! whoever holds the [`DmaRegion`] handle.
//!
//! The kernel is identity-mapped, so a region's virtual address equals its
//! physical address; drivers must still go through
//! [`crate::mm::vmm::kernel_translate`] when deriving device addresses.

use alloc::vec::Vec;

use spin::Mutex;

use super::{frame_allocator, PhysicalAddress, FRAME_SIZE};
use crate::error::KernelError;

bitflags::bitflags! {
    /// Allocation behavior flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DmaFlags: u32 {
        /// Zero the region before returning it.
        const ZERO = 1 << 0;
        /// 4 KiB alignment (the default; pages are always 4 KiB aligned).
        const ALIGN_4K = 1 << 1;
        /// 64 KiB alignment.
        const ALIGN_64K = 1 << 2;
    }
}

/// A physically contiguous DMA region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaRegion {
    /// Kernel virtual address (== physical address under identity mapping)
    pub vaddr: usize,
    /// Physical base address
    pub paddr: PhysicalAddress,
    /// Region size, page-rounded
    pub size: usize,
}

impl DmaRegion {
    /// Kernel pointer to the start of the region.
    pub fn as_ptr(&self) -> *mut u8 {
        self.vaddr as *mut u8
    }
}

/// Global registry of live DMA regions.
static DMA_REGIONS: Mutex<Vec<DmaRegion>> = Mutex::new(Vec::new());

/// Allocate a DMA region of at least `size` bytes.
pub fn dma_alloc(size: usize, flags: DmaFlags) -> Result<DmaRegion, KernelError> {
    if size == 0 {
        return Err(KernelError::InvalidArgument { name: "size" });
    }
    let pages = size.div_ceil(FRAME_SIZE);
    let align_frames = if flags.contains(DmaFlags::ALIGN_64K) {
        65536 / FRAME_SIZE
    } else {
        1
    };

    let paddr = frame_allocator::alloc_frames_aligned(pages, align_frames)?;
    let rounded = pages * FRAME_SIZE;

    if flags.contains(DmaFlags::ZERO) {
        // SAFETY: the page run was just allocated and is exclusively ours.
        unsafe {
            core::ptr::write_bytes(paddr.as_ptr(), 0, rounded);
        }
    }

    let region = DmaRegion {
        vaddr: paddr.as_usize(),
        paddr,
        size: rounded,
    };
    DMA_REGIONS.lock().push(region);
    log::debug!(
        "dma: allocated {} bytes at {:#x}",
        rounded,
        paddr.as_u64()
    );
    Ok(region)
}

/// Free a DMA region: remove it from the registry and return its pages.
pub fn dma_free(region: DmaRegion) {
    let mut regions = DMA_REGIONS.lock();
    match regions.iter().position(|r| *r == region) {
        Some(idx) => {
            regions.remove(idx);
        }
        None => {
            log::warn!(
                "dma: freeing unregistered region at {:#x}",
                region.paddr.as_u64()
            );
        }
    }
    drop(regions);
    frame_allocator::free_frames(region.paddr, region.size / FRAME_SIZE);
}

/// Number of live registered regions.
pub fn region_count() -> usize {
    DMA_REGIONS.lock().len()
}
