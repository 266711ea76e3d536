//! Block and inode allocation (per-group bitmaps).
//!
//! Allocation scans the chosen group's bitmap for the first clear bit,
//! sets it, writes the bitmap back, and decrements the group descriptor's
//! and superblock's free counters. The caller picks the starting group
//! (currently always 0); the scan wraps across all groups.

use alloc::vec;

use super::{Ext2Filesystem, Ext2Inner};
use crate::error::{Ext2Error, KernelError};

fn bit_is_set(buf: &[u8], bit: usize) -> bool {
    buf[bit / 8] & (1 << (bit % 8)) != 0
}

fn set_bit(buf: &mut [u8], bit: usize) {
    buf[bit / 8] |= 1 << (bit % 8);
}

fn clear_bit(buf: &mut [u8], bit: usize) {
    buf[bit / 8] &= !(1 << (bit % 8));
}

impl Ext2Filesystem {
    /// Number of data-bitmap bits valid in `group` (the last group may be
    /// partial).
    fn blocks_in_group(&self, inner: &Ext2Inner, group: usize) -> usize {
        let covered = inner.sb.s_blocks_count as usize - self.first_data_block as usize;
        let before = group * self.blocks_per_group as usize;
        (covered - before).min(self.blocks_per_group as usize)
    }

    /// Allocate one block, scanning groups starting at `start_group`.
    /// Returns the absolute block number.
    pub(crate) fn alloc_block(
        &self,
        inner: &mut Ext2Inner,
        start_group: usize,
    ) -> Result<u32, KernelError> {
        for step in 0..self.num_groups {
            let group = (start_group + step) % self.num_groups;
            if inner.groups[group].bg_free_blocks_count == 0 {
                continue;
            }

            let bitmap_block = inner.groups[group].bg_block_bitmap;
            let mut bitmap = vec![0u8; self.block_size];
            self.read_block(inner, bitmap_block, &mut bitmap)?;

            let valid_bits = self.blocks_in_group(inner, group);
            let Some(bit) = (0..valid_bits).find(|&b| !bit_is_set(&bitmap, b)) else {
                continue;
            };

            set_bit(&mut bitmap, bit);
            self.write_block(inner, bitmap_block, &bitmap)?;

            inner.groups[group].bg_free_blocks_count -= 1;
            self.write_group_desc(inner, group)?;
            inner.sb.s_free_blocks_count -= 1;
            self.write_superblock(inner)?;

            let block = self.first_data_block
                + (group as u32) * self.blocks_per_group
                + bit as u32;
            return Ok(block);
        }
        Err(Ext2Error::NoFreeBlocks.into())
    }

    /// Return `block` to its group's bitmap.
    pub(crate) fn free_block(
        &self,
        inner: &mut Ext2Inner,
        block: u32,
    ) -> Result<(), KernelError> {
        if block < self.first_data_block || block >= inner.sb.s_blocks_count {
            return Err(Ext2Error::BadBlockNumber { block }.into());
        }
        let rel = (block - self.first_data_block) as usize;
        let group = rel / self.blocks_per_group as usize;
        let bit = rel % self.blocks_per_group as usize;

        let bitmap_block = inner.groups[group].bg_block_bitmap;
        let mut bitmap = vec![0u8; self.block_size];
        self.read_block(inner, bitmap_block, &mut bitmap)?;

        if !bit_is_set(&bitmap, bit) {
            log::warn!("ext2: freeing already-free block {}", block);
            return Ok(());
        }
        clear_bit(&mut bitmap, bit);
        self.write_block(inner, bitmap_block, &bitmap)?;

        inner.groups[group].bg_free_blocks_count += 1;
        self.write_group_desc(inner, group)?;
        inner.sb.s_free_blocks_count += 1;
        self.write_superblock(inner)
    }

    /// Allocate an inode, scanning groups starting at `start_group`.
    /// Returns the inode number (1-based).
    pub(crate) fn alloc_inode(
        &self,
        inner: &mut Ext2Inner,
        start_group: usize,
        is_dir: bool,
    ) -> Result<u32, KernelError> {
        for step in 0..self.num_groups {
            let group = (start_group + step) % self.num_groups;
            if inner.groups[group].bg_free_inodes_count == 0 {
                continue;
            }

            let bitmap_block = inner.groups[group].bg_inode_bitmap;
            let mut bitmap = vec![0u8; self.block_size];
            self.read_block(inner, bitmap_block, &mut bitmap)?;

            let covered = inner.sb.s_inodes_count as usize
                - group * self.inodes_per_group as usize;
            let valid_bits = covered.min(self.inodes_per_group as usize);
            let Some(bit) = (0..valid_bits).find(|&b| !bit_is_set(&bitmap, b)) else {
                continue;
            };

            set_bit(&mut bitmap, bit);
            self.write_block(inner, bitmap_block, &bitmap)?;

            inner.groups[group].bg_free_inodes_count -= 1;
            if is_dir {
                inner.groups[group].bg_used_dirs_count += 1;
            }
            self.write_group_desc(inner, group)?;
            inner.sb.s_free_inodes_count -= 1;
            self.write_superblock(inner)?;

            return Ok((group as u32) * self.inodes_per_group + bit as u32 + 1);
        }
        Err(Ext2Error::NoFreeInodes.into())
    }

    /// Return inode `ino` to its group's bitmap.
    pub(crate) fn free_inode(
        &self,
        inner: &mut Ext2Inner,
        ino: u32,
        was_dir: bool,
    ) -> Result<(), KernelError> {
        if ino == 0 || ino > inner.sb.s_inodes_count {
            return Err(Ext2Error::BadInodeNumber { ino }.into());
        }
        let index = (ino - 1) as usize;
        let group = index / self.inodes_per_group as usize;
        let bit = index % self.inodes_per_group as usize;

        let bitmap_block = inner.groups[group].bg_inode_bitmap;
        let mut bitmap = vec![0u8; self.block_size];
        self.read_block(inner, bitmap_block, &mut bitmap)?;

        if !bit_is_set(&bitmap, bit) {
            log::warn!("ext2: freeing already-free inode {}", ino);
            return Ok(());
        }
        clear_bit(&mut bitmap, bit);
        self.write_block(inner, bitmap_block, &bitmap)?;

        inner.groups[group].bg_free_inodes_count += 1;
        if was_dir {
            inner.groups[group].bg_used_dirs_count =
                inner.groups[group].bg_used_dirs_count.saturating_sub(1);
        }
        self.write_group_desc(inner, group)?;
        inner.sb.s_free_inodes_count += 1;
        self.write_superblock(inner)
    }
}

#[cfg(test)]
mod tests {
    use super::super::Ext2Filesystem;
    use crate::test_support;
    use alloc::boxed::Box;

    #[test]
    fn block_allocation_updates_free_counters() {
        let fs =
            Ext2Filesystem::mount(Box::new(test_support::mkfs_ext2_ramdisk(256))).unwrap();
        let mut inner = fs.inner.lock();

        let free_before = inner.sb.s_free_blocks_count;
        let b1 = fs.alloc_block(&mut inner, 0).unwrap();
        let b2 = fs.alloc_block(&mut inner, 0).unwrap();
        assert_ne!(b1, b2);
        assert_eq!(inner.sb.s_free_blocks_count, free_before - 2);
        assert_eq!(
            inner.groups[0].bg_free_blocks_count as u32,
            inner.sb.s_free_blocks_count
        );

        fs.free_block(&mut inner, b1).unwrap();
        assert_eq!(inner.sb.s_free_blocks_count, free_before - 1);

        // Freed block is reused first (first-fit).
        let b3 = fs.alloc_block(&mut inner, 0).unwrap();
        assert_eq!(b3, b1);
    }

    #[test]
    fn double_free_of_block_is_a_logged_noop() {
        let fs =
            Ext2Filesystem::mount(Box::new(test_support::mkfs_ext2_ramdisk(256))).unwrap();
        let mut inner = fs.inner.lock();
        let b = fs.alloc_block(&mut inner, 0).unwrap();
        fs.free_block(&mut inner, b).unwrap();
        let free = inner.sb.s_free_blocks_count;
        fs.free_block(&mut inner, b).unwrap();
        assert_eq!(inner.sb.s_free_blocks_count, free);
    }

    #[test]
    fn inode_allocation_skips_reserved_range() {
        let fs =
            Ext2Filesystem::mount(Box::new(test_support::mkfs_ext2_ramdisk(256))).unwrap();
        let mut inner = fs.inner.lock();
        let ino = fs.alloc_inode(&mut inner, 0, false).unwrap();
        // Inodes 1..=10 are reserved by mkfs; the first free one is 11.
        assert_eq!(ino, super::super::FIRST_USER_INO);

        let free = inner.sb.s_free_inodes_count;
        fs.free_inode(&mut inner, ino, false).unwrap();
        assert_eq!(inner.sb.s_free_inodes_count, free + 1);
    }

    #[test]
    fn exhaustion_reports_no_free_inodes() {
        let fs =
            Ext2Filesystem::mount(Box::new(test_support::mkfs_ext2_ramdisk(256))).unwrap();
        let mut inner = fs.inner.lock();
        loop {
            match fs.alloc_inode(&mut inner, 0, false) {
                Ok(_) => continue,
                Err(e) => {
                    assert!(matches!(
                        e,
                        crate::error::KernelError::Ext2(
                            crate::error::Ext2Error::NoFreeInodes
                        )
                    ));
                    break;
                }
            }
        }
    }
}
