//! Split virtqueue.
//!
//! Three DMA-allocated regions per queue: descriptor table, available
//! ring, used ring. A free list of descriptors is threaded through each
//! descriptor's `next` field with a `free_head` cursor and `num_free`
//! counter; `num_free` always equals the number of descriptors reachable
//! from `free_head`. `avail.idx` only ever moves forward, as does the
//! device-written `used.idx`.

use crate::arch::barriers;
use crate::error::KernelError;
use crate::mm::dma::{self, DmaFlags, DmaRegion};

/// Compiled-in queue size ceiling; the negotiated size is
/// `min(device max, 64)`.
pub const QUEUE_SIZE_MAX: u16 = 64;

/// Descriptor flag: chain continues via `next`.
pub const VIRTQ_DESC_F_NEXT: u16 = 1;
/// Descriptor flag: buffer is device-writable.
pub const VIRTQ_DESC_F_WRITE: u16 = 2;

/// Descriptor table entry.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct VirtqDesc {
    /// Physical address of the buffer
    pub addr: u64,
    /// Buffer length in bytes
    pub len: u32,
    /// NEXT / WRITE flags
    pub flags: u16,
    /// Next descriptor in the chain (when NEXT is set) or free list
    pub next: u16,
}

/// Available ring: driver-to-device chain heads.
#[repr(C)]
pub struct VirtqAvail {
    pub flags: u16,
    pub idx: u16,
    pub ring: [u16; QUEUE_SIZE_MAX as usize],
}

/// Used ring element written by the device.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct VirtqUsedElem {
    /// Head of the completed descriptor chain
    pub id: u32,
    /// Bytes the device wrote into the chain
    pub len: u32,
}

/// Used ring: device-to-driver completions.
#[repr(C)]
pub struct VirtqUsed {
    pub flags: u16,
    pub idx: u16,
    pub ring: [VirtqUsedElem; QUEUE_SIZE_MAX as usize],
}

/// A split virtqueue and its backing DMA regions.
pub struct VirtQueue {
    size: u16,
    desc: *mut VirtqDesc,
    avail: *mut VirtqAvail,
    used: *mut VirtqUsed,
    free_head: u16,
    num_free: u16,
    last_used_idx: u16,
    desc_region: DmaRegion,
    avail_region: DmaRegion,
    used_region: DmaRegion,
}

// SAFETY: VirtQueue's raw pointers target DMA memory it owns exclusively;
// access is serialized by the owning driver's lock.
unsafe impl Send for VirtQueue {}

impl VirtQueue {
    /// Allocate and initialize a virtqueue of `size` entries
    /// (clamped to [`QUEUE_SIZE_MAX`]).
    ///
    /// The rings are zero-initialized and every descriptor is linked into
    /// the free list.
    pub fn new(size: u16) -> Result<Self, KernelError> {
        let size = if size == 0 || size > QUEUE_SIZE_MAX {
            QUEUE_SIZE_MAX
        } else {
            size
        };

        // Ring layouts are declared for QUEUE_SIZE_MAX entries; allocating
        // the full extent keeps in-bounds access for any negotiated size.
        let desc_region = dma::dma_alloc(
            core::mem::size_of::<VirtqDesc>() * QUEUE_SIZE_MAX as usize,
            DmaFlags::ZERO | DmaFlags::ALIGN_4K,
        )?;
        let avail_region = match dma::dma_alloc(
            core::mem::size_of::<VirtqAvail>(),
            DmaFlags::ZERO | DmaFlags::ALIGN_4K,
        ) {
            Ok(r) => r,
            Err(e) => {
                dma::dma_free(desc_region);
                return Err(e);
            }
        };
        let used_region = match dma::dma_alloc(
            core::mem::size_of::<VirtqUsed>(),
            DmaFlags::ZERO | DmaFlags::ALIGN_4K,
        ) {
            Ok(r) => r,
            Err(e) => {
                dma::dma_free(desc_region);
                dma::dma_free(avail_region);
                return Err(e);
            }
        };

        let desc = desc_region.as_ptr() as *mut VirtqDesc;

        // Thread the free list through `next`.
        // SAFETY: desc points at a zeroed region of QUEUE_SIZE_MAX
        // descriptors that we exclusively own.
        unsafe {
            for i in 0..size {
                (*desc.add(i as usize)).next = if i + 1 < size { i + 1 } else { 0 };
            }
        }

        Ok(Self {
            size,
            desc,
            avail: avail_region.as_ptr() as *mut VirtqAvail,
            used: used_region.as_ptr() as *mut VirtqUsed,
            free_head: 0,
            num_free: size,
            last_used_idx: 0,
            desc_region,
            avail_region,
            used_region,
        })
    }

    pub fn size(&self) -> u16 {
        self.size
    }

    pub fn num_free(&self) -> u16 {
        self.num_free
    }

    /// Physical addresses of the rings, for the queue registers.
    pub fn ring_addrs(&self) -> (u64, u64, u64) {
        (
            self.desc_region.paddr.as_u64(),
            self.avail_region.paddr.as_u64(),
            self.used_region.paddr.as_u64(),
        )
    }

    /// Pop a descriptor off the free list.
    pub fn alloc_desc(&mut self) -> Option<u16> {
        if self.num_free == 0 {
            return None;
        }
        let idx = self.free_head;
        // SAFETY: free-list indices are always < size.
        let next = unsafe { (*self.desc.add(idx as usize)).next };
        self.free_head = next;
        self.num_free -= 1;
        Some(idx)
    }

    /// Push a descriptor back onto the free list.
    pub fn free_desc(&mut self, idx: u16) {
        debug_assert!(idx < self.size);
        // SAFETY: idx is in bounds; the descriptor is relinked and cleared.
        unsafe {
            let d = &mut *self.desc.add(idx as usize);
            d.next = self.free_head;
            d.addr = 0;
            d.len = 0;
            d.flags = 0;
        }
        self.free_head = idx;
        self.num_free += 1;
    }

    /// Free a NEXT-linked chain starting at `head`.
    pub fn free_chain(&mut self, head: u16) {
        let mut idx = head;
        loop {
            debug_assert!(idx < self.size);
            // SAFETY: idx is in bounds; flags/next are read before the
            // descriptor is recycled.
            let (flags, next) = unsafe {
                let d = &*self.desc.add(idx as usize);
                (d.flags, d.next)
            };
            self.free_desc(idx);
            if flags & VIRTQ_DESC_F_NEXT == 0 {
                break;
            }
            idx = next;
        }
    }

    /// Fill descriptor `idx`.
    ///
    /// # Safety
    ///
    /// `phys_addr` must reference a physically contiguous buffer of `len`
    /// bytes that stays valid until the device hands the descriptor back
    /// through the used ring.
    pub unsafe fn write_desc(&mut self, idx: u16, phys_addr: u64, len: u32, flags: u16, next: u16) {
        debug_assert!(idx < self.size);
        // SAFETY: idx is in bounds; buffer validity is the caller's
        // obligation.
        unsafe {
            let d = &mut *self.desc.add(idx as usize);
            d.addr = phys_addr;
            d.len = len;
            d.flags = flags;
            d.next = next;
        }
    }

    /// Publish a chain head on the available ring. Write barriers order
    /// the descriptor stores before the slot store, and the slot store
    /// before the index bump, exactly as the device expects.
    pub fn push_avail(&mut self, head: u16) {
        // SAFETY: avail points at our owned ring; ring index is reduced
        // modulo size.
        unsafe {
            let avail = &mut *self.avail;
            let slot = avail.idx as usize % self.size as usize;
            avail.ring[slot] = head;
            barriers::write_fence();
            avail.idx = avail.idx.wrapping_add(1);
            barriers::write_fence();
        }
    }

    /// Current avail index (diagnostics/tests).
    pub fn avail_idx(&self) -> u16 {
        // SAFETY: avail points at our owned ring.
        unsafe { (*self.avail).idx }
    }

    /// Check for an unconsumed completion without consuming it.
    pub fn has_used(&self) -> bool {
        barriers::read_fence();
        // SAFETY: used points at our owned ring.
        let used_idx = unsafe { (*self.used).idx };
        self.last_used_idx != used_idx
    }

    /// Consume one completion: returns `(chain head, bytes written)`.
    /// The caller must `free_chain` the head afterwards.
    pub fn poll_used(&mut self) -> Option<(u16, u32)> {
        barriers::read_fence();
        // SAFETY: used points at our owned ring.
        let used_idx = unsafe { (*self.used).idx };
        if self.last_used_idx == used_idx {
            return None;
        }
        let slot = self.last_used_idx as usize % self.size as usize;
        // SAFETY: slot is in bounds by the modulo reduction.
        let elem = unsafe { (*self.used).ring[slot] };
        self.last_used_idx = self.last_used_idx.wrapping_add(1);
        Some((elem.id as u16, elem.len))
    }

    /// Device-side test hook: append a completion to the used ring the way
    /// hardware would.
    #[cfg(test)]
    pub fn push_used_for_test(&mut self, id: u16, len: u32) {
        // SAFETY: used points at our owned ring; tests run single-threaded
        // over this queue.
        unsafe {
            let used = &mut *self.used;
            let slot = used.idx as usize % self.size as usize;
            used.ring[slot] = VirtqUsedElem {
                id: id as u32,
                len,
            };
            barriers::write_fence();
            used.idx = used.idx.wrapping_add(1);
        }
    }
}

impl Drop for VirtQueue {
    fn drop(&mut self) {
        dma::dma_free(self.desc_region);
        dma::dma_free(self.avail_region);
        dma::dma_free(self.used_region);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;

    #[test]
    fn free_list_accounting_invariant() {
        test_support::init_test_memory();
        let mut q = VirtQueue::new(8).unwrap();
        assert_eq!(q.size(), 8);
        assert_eq!(q.num_free(), 8);

        // Drain the free list completely.
        let mut held = alloc::vec::Vec::new();
        while let Some(d) = q.alloc_desc() {
            held.push(d);
        }
        assert_eq!(held.len(), 8);
        assert_eq!(q.num_free(), 0);
        assert!(q.alloc_desc().is_none());

        // Return everything; the count is restored.
        for d in held {
            q.free_desc(d);
        }
        assert_eq!(q.num_free(), 8);
    }

    #[test]
    fn chains_are_freed_as_a_unit() {
        test_support::init_test_memory();
        let mut q = VirtQueue::new(8).unwrap();
        let d0 = q.alloc_desc().unwrap();
        let d1 = q.alloc_desc().unwrap();
        let d2 = q.alloc_desc().unwrap();
        // SAFETY: test buffers are not really handed to a device.
        unsafe {
            q.write_desc(d0, 0x1000, 16, VIRTQ_DESC_F_NEXT, d1);
            q.write_desc(d1, 0x2000, 512, VIRTQ_DESC_F_NEXT, d2);
            q.write_desc(d2, 0x3000, 1, VIRTQ_DESC_F_WRITE, 0);
        }
        assert_eq!(q.num_free(), 5);
        q.free_chain(d0);
        assert_eq!(q.num_free(), 8);
    }

    #[test]
    fn avail_index_moves_forward_only() {
        test_support::init_test_memory();
        let mut q = VirtQueue::new(4).unwrap();
        let d = q.alloc_desc().unwrap();
        let before = q.avail_idx();
        q.push_avail(d);
        q.push_avail(d);
        assert_eq!(q.avail_idx(), before.wrapping_add(2));
    }

    #[test]
    fn used_ring_completions_are_consumed_in_order() {
        test_support::init_test_memory();
        let mut q = VirtQueue::new(4).unwrap();
        assert!(!q.has_used());
        assert!(q.poll_used().is_none());

        q.push_used_for_test(2, 512);
        q.push_used_for_test(3, 1);
        assert!(q.has_used());
        assert_eq!(q.poll_used(), Some((2, 512)));
        assert_eq!(q.poll_used(), Some((3, 1)));
        assert!(q.poll_used().is_none());
    }

    #[test]
    fn rings_are_distinct_dma_regions() {
        test_support::init_test_memory();
        let q = VirtQueue::new(16).unwrap();
        let (d, a, u) = q.ring_addrs();
        assert_ne!(d, a);
        assert_ne!(a, u);
        assert_eq!(d % 4096, 0);
        assert_eq!(a % 4096, 0);
        assert_eq!(u % 4096, 0);
    }
}
