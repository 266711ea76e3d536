//! VirtIO block device driver (modern MMIO transport).
//!
//! # Request format
//!
//! Each request is a descriptor chain:
//!
//! 1. **Header** (device-readable): `{type, reserved, sector}`
//! 2. **Data** (device-writable for reads, device-readable for writes),
//!    `sectors * 512` bytes -- omitted for FLUSH
//! 3. **Status** (device-writable): one byte, 0 = OK
//!
//! Submission is synchronous: the chain head is published on the available
//! ring, the device is notified, and completion is polled with a bounded
//! spin (acknowledging any interrupt status on the way) that fails with a
//! timeout error on expiry.

use spin::{Mutex, Once};

use super::mmio::{self, VirtioMmioTransport};
use super::queue::{VirtQueue, QUEUE_SIZE_MAX, VIRTQ_DESC_F_NEXT, VIRTQ_DESC_F_WRITE};
use super::status;
use crate::error::{KernelError, VirtioError};
use crate::fs::blockdev::{BlockDevice, SECTOR_SIZE};
use crate::mm::{heap, vmm};

/// Feature bits (virtio spec 5.2.3).
pub mod features {
    /// Device is read-only.
    pub const VIRTIO_BLK_F_RO: u64 = 1 << 5;
    /// Device reports its preferred block size.
    pub const VIRTIO_BLK_F_BLK_SIZE: u64 = 1 << 6;
    /// Cache flush command supported.
    pub const VIRTIO_BLK_F_FLUSH: u64 = 1 << 9;
}

/// Request types (virtio spec 5.2.6).
mod req_type {
    pub const VIRTIO_BLK_T_IN: u32 = 0;
    pub const VIRTIO_BLK_T_OUT: u32 = 1;
    pub const VIRTIO_BLK_T_FLUSH: u32 = 4;
}

/// Status byte values.
mod blk_status {
    pub const VIRTIO_BLK_S_OK: u8 = 0;
}

/// Completion poll ceiling.
const POLL_LIMIT: u32 = 1_000_000;

/// Request header, first descriptor of every chain.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct BlkReqHeader {
    type_: u32,
    reserved: u32,
    sector: u64,
}

/// kmalloc-backed header + status pair. A single sub-page allocation is
/// physically contiguous, which the descriptors require.
struct RequestBuffer {
    ptr: *mut u8,
}

const STATUS_OFFSET: usize = core::mem::size_of::<BlkReqHeader>();

impl RequestBuffer {
    fn new(type_: u32, sector: u64) -> Result<Self, KernelError> {
        let ptr = heap::kmalloc(STATUS_OFFSET + 1)?;
        // SAFETY: the allocation holds a header plus one status byte; it
        // is exclusively ours.
        unsafe {
            core::ptr::write(
                ptr as *mut BlkReqHeader,
                BlkReqHeader {
                    type_,
                    reserved: 0,
                    sector,
                },
            );
            *ptr.add(STATUS_OFFSET) = 0xFF;
        }
        Ok(Self { ptr })
    }

    fn header_phys(&self) -> u64 {
        vmm::kernel_translate(self.ptr as usize).as_u64()
    }

    fn status_phys(&self) -> u64 {
        vmm::kernel_translate(self.ptr as usize + STATUS_OFFSET).as_u64()
    }

    fn status(&self) -> u8 {
        // SAFETY: within our allocation; volatile because the device
        // writes it.
        unsafe { core::ptr::read_volatile(self.ptr.add(STATUS_OFFSET)) }
    }
}

impl Drop for RequestBuffer {
    fn drop(&mut self) {
        heap::kfree(self.ptr);
    }
}

/// A probed and initialized virtio block device.
pub struct VirtioBlkDevice {
    transport: VirtioMmioTransport,
    queue: VirtQueue,
    capacity_sectors: u64,
    /// Device-reported block size (informational; I/O is sector-granular).
    block_size: u32,
    read_only: bool,
    features: u64,
    reads: u64,
    writes: u64,
    errors: u64,
}

impl VirtioBlkDevice {
    /// Initialize the device behind `transport`: negotiate features, set
    /// up queue 0, read the configuration, and set DRIVER_OK.
    pub fn new(transport: VirtioMmioTransport) -> Result<Self, KernelError> {
        let features = transport.negotiate(u64::MAX)?;
        let read_only = features & features::VIRTIO_BLK_F_RO != 0;

        transport.select_queue(0);
        let max = transport.queue_num_max();
        if max == 0 {
            transport.add_status(status::FAILED);
            return Err(VirtioError::QueueUnavailable.into());
        }
        let queue_size = (max as u16).min(QUEUE_SIZE_MAX);
        let queue = VirtQueue::new(queue_size)?;

        transport.set_queue_num(queue_size as u32);
        let (desc, avail, used) = queue.ring_addrs();
        transport.set_queue_rings(desc, avail, used);
        transport.set_queue_ready();

        transport.add_status(status::DRIVER_OK);

        let capacity_sectors = transport.read_config_u64(0);
        let block_size = if features & features::VIRTIO_BLK_F_BLK_SIZE != 0 {
            transport.read_config_u32(20)
        } else {
            SECTOR_SIZE as u32
        };

        log::info!(
            "virtio-blk: {} sectors ({} KiB), block size {}, {}",
            capacity_sectors,
            capacity_sectors * SECTOR_SIZE as u64 / 1024,
            block_size,
            if read_only { "read-only" } else { "read-write" }
        );

        Ok(Self {
            transport,
            queue,
            capacity_sectors,
            block_size,
            read_only,
            features,
            reads: 0,
            writes: 0,
            errors: 0,
        })
    }

    pub fn capacity_sectors(&self) -> u64 {
        self.capacity_sectors
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// (reads, writes, errors) counters.
    pub fn counters(&self) -> (u64, u64, u64) {
        (self.reads, self.writes, self.errors)
    }

    /// Read `count` sectors starting at `sector` into `buf`.
    pub fn read(&mut self, sector: u64, count: usize, buf: &mut [u8]) -> Result<(), KernelError> {
        self.check_span(sector, count, buf.len())?;
        let data_phys = vmm::kernel_translate(buf.as_mut_ptr() as usize).as_u64();
        self.do_request(
            req_type::VIRTIO_BLK_T_IN,
            sector,
            Some((data_phys, count * SECTOR_SIZE)),
        )?;
        self.reads += count as u64;
        Ok(())
    }

    /// Write `count` sectors starting at `sector` from `data`.
    pub fn write(&mut self, sector: u64, count: usize, data: &[u8]) -> Result<(), KernelError> {
        if self.read_only {
            return Err(KernelError::PermissionDenied {
                operation: "write to read-only virtio-blk device",
            });
        }
        self.check_span(sector, count, data.len())?;
        let data_phys = vmm::kernel_translate(data.as_ptr() as usize).as_u64();
        self.do_request(
            req_type::VIRTIO_BLK_T_OUT,
            sector,
            Some((data_phys, count * SECTOR_SIZE)),
        )?;
        self.writes += count as u64;
        Ok(())
    }

    /// Flush the device's volatile write cache, when it negotiated one.
    pub fn flush(&mut self) -> Result<(), KernelError> {
        if self.features & features::VIRTIO_BLK_F_FLUSH == 0 {
            return Ok(());
        }
        self.do_request(req_type::VIRTIO_BLK_T_FLUSH, 0, None)
    }

    fn check_span(&self, sector: u64, count: usize, buf_len: usize) -> Result<(), KernelError> {
        if count == 0 || buf_len < count * SECTOR_SIZE {
            return Err(KernelError::InvalidArgument { name: "count" });
        }
        if sector + count as u64 > self.capacity_sectors {
            return Err(KernelError::InvalidArgument { name: "sector" });
        }
        Ok(())
    }

    /// Build the descriptor chain, publish it, notify, and poll to
    /// completion. `data` is `(physical address, length)`; `None` for
    /// data-less requests (FLUSH). The WRITE flag on the data descriptor
    /// follows the transfer direction.
    fn do_request(
        &mut self,
        type_: u32,
        sector: u64,
        data: Option<(u64, usize)>,
    ) -> Result<(), KernelError> {
        let req = RequestBuffer::new(type_, sector)?;

        let head = self.queue.alloc_desc().ok_or(KernelError::ResourceExhausted {
            resource: "virtio-blk descriptors",
        })?;
        let status_desc = match self.queue.alloc_desc() {
            Some(d) => d,
            None => {
                self.queue.free_desc(head);
                return Err(KernelError::ResourceExhausted {
                    resource: "virtio-blk descriptors",
                });
            }
        };
        let data_desc = match data {
            Some(_) => match self.queue.alloc_desc() {
                Some(d) => Some(d),
                None => {
                    self.queue.free_desc(head);
                    self.queue.free_desc(status_desc);
                    return Err(KernelError::ResourceExhausted {
                        resource: "virtio-blk descriptors",
                    });
                }
            },
            None => None,
        };

        // SAFETY: header/status live in the RequestBuffer allocation which
        // outlives the request; the data buffer is the caller's and valid
        // for the duration of this synchronous call.
        unsafe {
            match (data, data_desc) {
                (Some((phys, len)), Some(dd)) => {
                    self.queue.write_desc(
                        head,
                        req.header_phys(),
                        core::mem::size_of::<BlkReqHeader>() as u32,
                        VIRTQ_DESC_F_NEXT,
                        dd,
                    );
                    let dir = if type_ == req_type::VIRTIO_BLK_T_IN {
                        VIRTQ_DESC_F_WRITE | VIRTQ_DESC_F_NEXT
                    } else {
                        VIRTQ_DESC_F_NEXT
                    };
                    self.queue.write_desc(dd, phys, len as u32, dir, status_desc);
                }
                _ => {
                    self.queue.write_desc(
                        head,
                        req.header_phys(),
                        core::mem::size_of::<BlkReqHeader>() as u32,
                        VIRTQ_DESC_F_NEXT,
                        status_desc,
                    );
                }
            }
            self.queue
                .write_desc(status_desc, req.status_phys(), 1, VIRTQ_DESC_F_WRITE, 0);
        }

        self.queue.push_avail(head);
        self.transport.notify_queue(0);

        let mut spins: u32 = 0;
        while !self.queue.has_used() {
            let pending = self.transport.interrupt_status();
            if pending != 0 {
                self.transport.interrupt_ack(pending);
            }
            core::hint::spin_loop();
            spins += 1;
            if spins >= POLL_LIMIT {
                self.queue.free_chain(head);
                self.errors += 1;
                return Err(VirtioError::Timeout.into());
            }
        }

        let _ = self.queue.poll_used();
        self.queue.free_chain(head);

        let code = req.status();
        if code != blk_status::VIRTIO_BLK_S_OK {
            self.errors += 1;
            return Err(VirtioError::IoError { status: code }.into());
        }
        Ok(())
    }
}

impl BlockDevice for VirtioBlkDevice {
    fn read_sectors(&mut self, lba: u64, count: usize, buf: &mut [u8]) -> Result<(), KernelError> {
        VirtioBlkDevice::read(self, lba, count, buf)
    }

    fn write_sectors(&mut self, lba: u64, count: usize, data: &[u8]) -> Result<(), KernelError> {
        VirtioBlkDevice::write(self, lba, count, data)
    }

    fn num_sectors(&self) -> u64 {
        self.capacity_sectors
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn flush(&mut self) -> Result<(), KernelError> {
        VirtioBlkDevice::flush(self)
    }
}

static VIRTIO_BLK: Once<Mutex<VirtioBlkDevice>> = Once::new();

/// Probe the platform's virtio-mmio slots and initialize the first block
/// device found.
pub fn init() {
    let Some(transport) = mmio::probe_block_slots() else {
        log::warn!("virtio-blk: no device found");
        return;
    };
    match VirtioBlkDevice::new(transport) {
        Ok(dev) => {
            VIRTIO_BLK.call_once(|| Mutex::new(dev));
        }
        Err(e) => log::error!("virtio-blk: init failed: {}", e),
    }
}

/// The global block device, if one was probed.
pub fn device() -> Option<&'static Mutex<VirtioBlkDevice>> {
    VIRTIO_BLK.get()
}

/// [`BlockDevice`] handle that forwards to the probed global device.
/// Lets the filesystem own a `Box<dyn BlockDevice>` while the driver
/// instance stays process-wide.
pub struct GlobalBlockDevice;

impl BlockDevice for GlobalBlockDevice {
    fn read_sectors(&mut self, lba: u64, count: usize, buf: &mut [u8]) -> Result<(), KernelError> {
        match device() {
            Some(dev) => dev.lock().read_sectors(lba, count, buf),
            None => Err(KernelError::NotInitialized {
                subsystem: "virtio-blk",
            }),
        }
    }

    fn write_sectors(&mut self, lba: u64, count: usize, data: &[u8]) -> Result<(), KernelError> {
        match device() {
            Some(dev) => dev.lock().write_sectors(lba, count, data),
            None => Err(KernelError::NotInitialized {
                subsystem: "virtio-blk",
            }),
        }
    }

    fn num_sectors(&self) -> u64 {
        device().map(|d| d.lock().num_sectors()).unwrap_or(0)
    }

    fn is_read_only(&self) -> bool {
        device().map(|d| d.lock().is_read_only()).unwrap_or(false)
    }

    fn flush(&mut self) -> Result<(), KernelError> {
        match device() {
            Some(dev) => dev.lock().flush(),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_header_matches_wire_layout() {
        assert_eq!(core::mem::size_of::<BlkReqHeader>(), 16);
        assert_eq!(core::mem::offset_of!(BlkReqHeader, type_), 0);
        assert_eq!(core::mem::offset_of!(BlkReqHeader, sector), 8);
    }

    #[test]
    fn request_buffer_seeds_header_and_poison_status() {
        crate::test_support::init_test_memory();
        let req = RequestBuffer::new(req_type::VIRTIO_BLK_T_IN, 1234).unwrap();
        // SAFETY: reading back the header we just wrote.
        let header = unsafe { core::ptr::read(req.ptr as *const BlkReqHeader) };
        assert_eq!(header.type_, 0);
        assert_eq!(header.sector, 1234);
        assert_eq!(header.reserved, 0);
        // Status starts poisoned so a device that never writes is detected.
        assert_eq!(req.status(), 0xFF);
    }
}
