//! VirtIO MMIO transport.
//!
//! Register map per the virtio specification, section 4.2.2. Every access
//! goes through [`crate::arch::mmio`], which brackets the volatile
//! load/store with barriers. Only the modern (version 2) interface is
//! supported; legacy devices fail the probe.

use crate::arch::mmio;
use crate::error::{KernelError, VirtioError};

use super::{status, VIRTIO_DEVICE_ID_BLOCK, VIRTIO_MAGIC, VIRTIO_VERSION_MODERN};

// Register offsets.
const MAGIC_VALUE: usize = 0x000;
const VERSION: usize = 0x004;
const DEVICE_ID: usize = 0x008;
const VENDOR_ID: usize = 0x00C;
const DEVICE_FEATURES: usize = 0x010;
const DEVICE_FEATURES_SEL: usize = 0x014;
const DRIVER_FEATURES: usize = 0x020;
const DRIVER_FEATURES_SEL: usize = 0x024;
const QUEUE_SEL: usize = 0x030;
const QUEUE_NUM_MAX: usize = 0x034;
const QUEUE_NUM: usize = 0x038;
const QUEUE_READY: usize = 0x044;
const QUEUE_NOTIFY: usize = 0x050;
const INTERRUPT_STATUS: usize = 0x060;
const INTERRUPT_ACK: usize = 0x064;
const STATUS: usize = 0x070;
const QUEUE_DESC_LOW: usize = 0x080;
const QUEUE_DESC_HIGH: usize = 0x084;
const QUEUE_AVAIL_LOW: usize = 0x090;
const QUEUE_AVAIL_HIGH: usize = 0x094;
const QUEUE_USED_LOW: usize = 0x0A0;
const QUEUE_USED_HIGH: usize = 0x0A4;
const CONFIG: usize = 0x100;

/// Handle to one virtio-mmio device slot.
#[derive(Debug, Clone, Copy)]
pub struct VirtioMmioTransport {
    base: usize,
}

impl VirtioMmioTransport {
    /// Wrap the MMIO slot at `base` and verify it hosts a modern virtio
    /// device of class `device_id`.
    pub fn probe(base: usize, device_id: u32) -> Result<Self, KernelError> {
        let t = Self { base };

        let magic = t.read(MAGIC_VALUE);
        if magic != VIRTIO_MAGIC {
            return Err(VirtioError::BadMagic { found: magic }.into());
        }
        let version = t.read(VERSION);
        if version != VIRTIO_VERSION_MODERN {
            return Err(VirtioError::UnsupportedVersion { found: version }.into());
        }
        let id = t.read(DEVICE_ID);
        if id != device_id {
            return Err(VirtioError::WrongDeviceId { found: id }.into());
        }
        Ok(t)
    }

    pub fn base(&self) -> usize {
        self.base
    }

    fn read(&self, offset: usize) -> u32 {
        // SAFETY: base was validated by probe to be a live virtio-mmio
        // register block; all offsets used are in-spec registers.
        unsafe { mmio::read32(self.base + offset) }
    }

    fn write(&self, offset: usize, value: u32) {
        // SAFETY: as in read.
        unsafe { mmio::write32(self.base + offset, value) }
    }

    /// Reset the device (status = 0).
    pub fn reset(&self) {
        self.write(STATUS, 0);
    }

    /// OR `bits` into the status register.
    pub fn add_status(&self, bits: u32) {
        let current = self.read(STATUS);
        self.write(STATUS, current | bits);
    }

    pub fn read_status(&self) -> u32 {
        self.read(STATUS)
    }

    /// Read the 64-bit device feature word (both halves via the selector).
    pub fn read_device_features(&self) -> u64 {
        self.write(DEVICE_FEATURES_SEL, 0);
        let low = self.read(DEVICE_FEATURES) as u64;
        self.write(DEVICE_FEATURES_SEL, 1);
        let high = self.read(DEVICE_FEATURES) as u64;
        (high << 32) | low
    }

    /// Write the accepted driver feature word (both halves).
    pub fn write_driver_features(&self, features: u64) {
        self.write(DRIVER_FEATURES_SEL, 0);
        self.write(DRIVER_FEATURES, features as u32);
        self.write(DRIVER_FEATURES_SEL, 1);
        self.write(DRIVER_FEATURES, (features >> 32) as u32);
    }

    pub fn select_queue(&self, index: u32) {
        self.write(QUEUE_SEL, index);
    }

    /// Maximum queue size the device supports for the selected queue.
    pub fn queue_num_max(&self) -> u32 {
        self.read(QUEUE_NUM_MAX)
    }

    pub fn set_queue_num(&self, num: u32) {
        self.write(QUEUE_NUM, num);
    }

    /// Program the physical addresses of the three rings.
    pub fn set_queue_rings(&self, desc: u64, avail: u64, used: u64) {
        self.write(QUEUE_DESC_LOW, desc as u32);
        self.write(QUEUE_DESC_HIGH, (desc >> 32) as u32);
        self.write(QUEUE_AVAIL_LOW, avail as u32);
        self.write(QUEUE_AVAIL_HIGH, (avail >> 32) as u32);
        self.write(QUEUE_USED_LOW, used as u32);
        self.write(QUEUE_USED_HIGH, (used >> 32) as u32);
    }

    pub fn set_queue_ready(&self) {
        self.write(QUEUE_READY, 1);
    }

    /// Notify the device that the selected queue has new buffers.
    pub fn notify_queue(&self, index: u32) {
        self.write(QUEUE_NOTIFY, index);
    }

    pub fn interrupt_status(&self) -> u32 {
        self.read(INTERRUPT_STATUS)
    }

    pub fn interrupt_ack(&self, bits: u32) {
        self.write(INTERRUPT_ACK, bits);
    }

    pub fn vendor_id(&self) -> u32 {
        self.read(VENDOR_ID)
    }

    /// Read a 32-bit field from the device configuration area.
    pub fn read_config_u32(&self, offset: usize) -> u32 {
        self.read(CONFIG + offset)
    }

    /// Read a 64-bit field from the device configuration area.
    pub fn read_config_u64(&self, offset: usize) -> u64 {
        let low = self.read(CONFIG + offset) as u64;
        let high = self.read(CONFIG + offset + 4) as u64;
        (high << 32) | low
    }

    /// Run the modern-mode init handshake through feature negotiation:
    /// reset, ACKNOWLEDGE, DRIVER, write accepted features, FEATURES_OK,
    /// and verify the device kept FEATURES_OK set.
    pub fn negotiate(&self, wanted: u64) -> Result<u64, KernelError> {
        self.reset();
        self.add_status(status::ACKNOWLEDGE);
        self.add_status(status::DRIVER);

        let offered = self.read_device_features();
        let accepted = offered & wanted;
        self.write_driver_features(accepted);

        self.add_status(status::FEATURES_OK);
        if self.read_status() & status::FEATURES_OK == 0 {
            self.add_status(status::FAILED);
            return Err(VirtioError::FeatureNegotiation.into());
        }
        Ok(accepted)
    }
}

/// Probe every virtio-mmio slot of the platform for a block device.
pub fn probe_block_slots() -> Option<VirtioMmioTransport> {
    use crate::mm::layout::{VIRTIO_MMIO_BASE, VIRTIO_MMIO_SLOTS, VIRTIO_MMIO_STRIDE};

    for slot in 0..VIRTIO_MMIO_SLOTS {
        let base = VIRTIO_MMIO_BASE + slot * VIRTIO_MMIO_STRIDE;
        match VirtioMmioTransport::probe(base, VIRTIO_DEVICE_ID_BLOCK) {
            Ok(t) => {
                log::info!("virtio-mmio: block device at {:#x}", base);
                return Some(t);
            }
            Err(_) => continue,
        }
    }
    None
}
