//! Physical frame allocator (PMM).
//!
//! A bitmap allocator over up to 32 MiB of managed RAM. Bit `i` set means
//! page `i` is allocated. Single-page allocation returns the lowest free
//! page; multi-page allocation is a first-fit scan for a contiguous run of
//! clear bits, ties broken by lowest address.
//!
//! Bad frees (misaligned, out of range, double) are logged and ignored
//! rather than treated as fatal.

use spin::Mutex;

use super::PhysicalAddress;
use crate::error::KernelError;

/// Size of a physical frame (4 KiB).
pub const FRAME_SIZE: usize = 4096;

/// Maximum RAM under management (32 MiB = 8192 frames).
pub const MAX_MANAGED_BYTES: usize = 32 * 1024 * 1024;

const MAX_FRAMES: usize = MAX_MANAGED_BYTES / FRAME_SIZE;
const BITMAP_WORDS: usize = MAX_FRAMES / 64;

/// Bitmap allocator over a contiguous physical region.
pub struct BitmapFrameAllocator {
    /// Bit set = frame allocated.
    bitmap: [u64; BITMAP_WORDS],
    /// First managed physical address (page-aligned).
    base: u64,
    /// Number of frames under management.
    total_frames: usize,
    /// Current free frame count.
    free_frames: usize,
    initialized: bool,
}

impl BitmapFrameAllocator {
    pub const fn new() -> Self {
        Self {
            bitmap: [0; BITMAP_WORDS],
            base: 0,
            total_frames: 0,
            free_frames: 0,
            initialized: false,
        }
    }

    /// Begin managing `size` bytes of physical memory starting at `start`.
    /// The base is rounded up to a page boundary; the managed span is capped
    /// at the bitmap capacity.
    pub fn init(&mut self, start: PhysicalAddress, size: usize) {
        let base = super::align_up(start.as_usize(), FRAME_SIZE);
        let usable = size.saturating_sub(base - start.as_usize());
        self.base = base as u64;
        self.total_frames = (usable / FRAME_SIZE).min(MAX_FRAMES);
        self.free_frames = self.total_frames;
        self.bitmap = [0; BITMAP_WORDS];
        self.initialized = true;
        log::info!(
            "pmm: managing {} frames ({} KiB) from {:#x}",
            self.total_frames,
            self.total_frames * FRAME_SIZE / 1024,
            self.base
        );
    }

    fn frame_addr(&self, index: usize) -> PhysicalAddress {
        PhysicalAddress::new(self.base + (index * FRAME_SIZE) as u64)
    }

    fn frame_index(&self, addr: PhysicalAddress) -> Option<usize> {
        let a = addr.as_u64();
        if a < self.base {
            return None;
        }
        let index = ((a - self.base) as usize) / FRAME_SIZE;
        if index < self.total_frames {
            Some(index)
        } else {
            None
        }
    }

    fn is_set(&self, index: usize) -> bool {
        self.bitmap[index / 64] & (1 << (index % 64)) != 0
    }

    fn set(&mut self, index: usize) {
        self.bitmap[index / 64] |= 1 << (index % 64);
    }

    fn clear(&mut self, index: usize) {
        self.bitmap[index / 64] &= !(1 << (index % 64));
    }

    /// Allocate the lowest free frame.
    pub fn alloc_frame(&mut self) -> Result<PhysicalAddress, KernelError> {
        self.alloc_frames(1)
    }

    /// Allocate `count` physically contiguous frames, first fit.
    pub fn alloc_frames(&mut self, count: usize) -> Result<PhysicalAddress, KernelError> {
        self.alloc_frames_aligned(count, 1)
    }

    /// Allocate `count` contiguous frames whose first frame index is a
    /// multiple of `align_frames`. Used by the DMA allocator for 64 KiB
    /// alignment.
    pub fn alloc_frames_aligned(
        &mut self,
        count: usize,
        align_frames: usize,
    ) -> Result<PhysicalAddress, KernelError> {
        if count == 0 || !self.initialized {
            return Err(KernelError::InvalidArgument { name: "count" });
        }
        if count > self.free_frames {
            return Err(KernelError::OutOfMemory {
                requested: count * FRAME_SIZE,
            });
        }

        let align = align_frames.max(1);
        let base_frame = (self.base as usize) / FRAME_SIZE;
        // Candidate runs must start at an index whose physical address is
        // align_frames-page aligned.
        let align_index = |i: usize| super::align_up(base_frame + i, align) - base_frame;

        let mut start = align_index(0);
        while start + count <= self.total_frames {
            match (start..start + count).find(|&i| self.is_set(i)) {
                Some(busy) => {
                    // Skip past the allocated frame that broke the run.
                    start = align_index(busy + 1);
                }
                None => {
                    for i in start..start + count {
                        self.set(i);
                    }
                    self.free_frames -= count;
                    return Ok(self.frame_addr(start));
                }
            }
        }

        Err(KernelError::OutOfMemory {
            requested: count * FRAME_SIZE,
        })
    }

    /// Free a single frame. Misaligned, out-of-range, or double frees are
    /// logged and ignored.
    pub fn free_frame(&mut self, addr: PhysicalAddress) {
        self.free_frames_run(addr, 1);
    }

    /// Free a run of `count` frames starting at `addr`.
    pub fn free_frames_run(&mut self, addr: PhysicalAddress, count: usize) {
        if !addr.is_page_aligned() {
            log::warn!("pmm: ignoring misaligned free of {:#x}", addr.as_u64());
            return;
        }
        let Some(first) = self.frame_index(addr) else {
            log::warn!("pmm: ignoring out-of-range free of {:#x}", addr.as_u64());
            return;
        };
        if first + count > self.total_frames {
            log::warn!(
                "pmm: ignoring free of {} frames at {:#x}: run exceeds managed range",
                count,
                addr.as_u64()
            );
            return;
        }
        for i in first..first + count {
            if !self.is_set(i) {
                log::warn!(
                    "pmm: double free of frame {:#x}",
                    self.frame_addr(i).as_u64()
                );
                continue;
            }
            self.clear(i);
            self.free_frames += 1;
        }
    }

    /// (total, free) frame counts.
    pub fn stats(&self) -> (usize, usize) {
        (self.total_frames, self.free_frames)
    }

    /// Whether the frame containing `addr` is currently allocated.
    pub fn is_allocated(&self, addr: PhysicalAddress) -> bool {
        self.frame_index(addr).map(|i| self.is_set(i)).unwrap_or(false)
    }
}

impl Default for BitmapFrameAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Global frame allocator singleton.
pub static FRAME_ALLOCATOR: Mutex<BitmapFrameAllocator> = Mutex::new(BitmapFrameAllocator::new());

/// Initialize the global allocator over `[start, start + size)`.
pub fn init(start: PhysicalAddress, size: usize) {
    FRAME_ALLOCATOR.lock().init(start, size);
}

/// Allocate one frame from the global allocator.
pub fn alloc_frame() -> Result<PhysicalAddress, KernelError> {
    FRAME_ALLOCATOR.lock().alloc_frame()
}

/// Allocate `count` contiguous frames from the global allocator.
pub fn alloc_frames(count: usize) -> Result<PhysicalAddress, KernelError> {
    FRAME_ALLOCATOR.lock().alloc_frames(count)
}

/// Allocate aligned contiguous frames from the global allocator.
pub fn alloc_frames_aligned(
    count: usize,
    align_frames: usize,
) -> Result<PhysicalAddress, KernelError> {
    FRAME_ALLOCATOR.lock().alloc_frames_aligned(count, align_frames)
}

/// Free one frame back to the global allocator.
pub fn free_frame(addr: PhysicalAddress) {
    FRAME_ALLOCATOR.lock().free_frame(addr);
}

/// Free a run of frames back to the global allocator.
pub fn free_frames(addr: PhysicalAddress, count: usize) {
    FRAME_ALLOCATOR.lock().free_frames_run(addr, count);
}

/// (total, free) counts from the global allocator.
pub fn stats() -> (usize, usize) {
    FRAME_ALLOCATOR.lock().stats()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh(frames: usize) -> BitmapFrameAllocator {
        let mut a = BitmapFrameAllocator::new();
        a.init(
            PhysicalAddress::new(0x8040_0000),
            frames * FRAME_SIZE,
        );
        a
    }

    #[test]
    fn allocates_lowest_free_frame_first() {
        let mut a = fresh(16);
        let f0 = a.alloc_frame().unwrap();
        let f1 = a.alloc_frame().unwrap();
        assert_eq!(f0.as_u64(), 0x8040_0000);
        assert_eq!(f1.as_u64(), 0x8040_1000);
        a.free_frame(f0);
        // Lowest frame is free again and must be returned before higher ones.
        assert_eq!(a.alloc_frame().unwrap(), f0);
    }

    #[test]
    fn accounting_holds_across_operations() {
        let mut a = fresh(32);
        let (total, free) = a.stats();
        assert_eq!(total, 32);
        assert_eq!(free, 32);

        let run = a.alloc_frames(5).unwrap();
        assert_eq!(a.stats().1, 27);
        a.free_frames_run(run, 5);
        let (total, free) = a.stats();
        assert_eq!(free, total);
    }

    #[test]
    fn contiguous_runs_are_first_fit_lowest() {
        let mut a = fresh(16);
        let f0 = a.alloc_frame().unwrap(); // frame 0
        let _f1 = a.alloc_frame().unwrap(); // frame 1
        a.free_frame(f0); // hole of size 1 at frame 0
        // A 2-frame run cannot use the size-1 hole; it must start at frame 2.
        let run = a.alloc_frames(2).unwrap();
        assert_eq!(run.as_u64(), 0x8040_2000);
        // A 1-frame allocation takes the hole.
        assert_eq!(a.alloc_frame().unwrap(), f0);
    }

    #[test]
    fn aligned_runs_start_on_alignment_boundary() {
        let mut a = fresh(64);
        let _pad = a.alloc_frame().unwrap(); // occupy frame 0
        let run = a.alloc_frames_aligned(4, 16).unwrap();
        assert_eq!(run.as_usize() % (16 * FRAME_SIZE), 0);
        assert!(run.as_u64() >= 0x8040_0000 + (16 * FRAME_SIZE) as u64);
    }

    #[test]
    fn exhaustion_is_reported() {
        let mut a = fresh(4);
        for _ in 0..4 {
            a.alloc_frame().unwrap();
        }
        assert!(matches!(
            a.alloc_frame(),
            Err(KernelError::OutOfMemory { .. })
        ));
    }

    #[test]
    fn bad_frees_are_ignored_not_fatal() {
        let mut a = fresh(8);
        let f = a.alloc_frame().unwrap();
        let free_before = a.stats().1;

        // Misaligned
        a.free_frame(PhysicalAddress::new(f.as_u64() + 3));
        // Out of range
        a.free_frame(PhysicalAddress::new(0x1000));
        assert_eq!(a.stats().1, free_before);

        // Double free: first free succeeds, second is ignored.
        a.free_frame(f);
        assert_eq!(a.stats().1, free_before + 1);
        a.free_frame(f);
        assert_eq!(a.stats().1, free_before + 1);
    }

    #[test]
    fn bitmap_bit_tracks_allocation_state() {
        let mut a = fresh(8);
        let f = a.alloc_frame().unwrap();
        assert!(a.is_allocated(f));
        a.free_frame(f);
        assert!(!a.is_allocated(f));
    }
}
