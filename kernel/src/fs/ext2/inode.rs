//! Inode read/write and file-block index resolution.
//!
//! A file-block index maps onto a disk block through the classic ext2
//! scheme: 12 direct pointers, then `P = block_size / 4` single-indirect
//! entries, then `P * P` double-indirect entries. Triple-indirect is
//! unsupported; indices beyond the double-indirect range fail `EFBIG`.
//! A zero pointer at any level is a sparse hole: reads see zeros, writes
//! allocate the missing blocks on the way down.

use alloc::vec;

use super::{
    Ext2Filesystem, Ext2Inner, Inode, DIND_BLOCK, IND_BLOCK, NDIR_BLOCKS,
};
use crate::error::{Ext2Error, FsError, KernelError};

impl Ext2Filesystem {
    /// Pointer entries per indirect block.
    pub(crate) fn ptrs_per_block(&self) -> u64 {
        (self.block_size / 4) as u64
    }

    fn inode_location(&self, inner: &Ext2Inner, ino: u32) -> Result<(u32, usize), KernelError> {
        if ino == 0 || ino > inner.sb.s_inodes_count {
            return Err(Ext2Error::BadInodeNumber { ino }.into());
        }
        let index = (ino - 1) as usize;
        let group = index / self.inodes_per_group as usize;
        let within = index % self.inodes_per_group as usize;
        let block = inner.groups[group].bg_inode_table as usize + within / self.inodes_per_block;
        let offset = (within % self.inodes_per_block) * self.inode_size;
        Ok((block as u32, offset))
    }

    /// Read inode `ino` from its table slot.
    pub(crate) fn read_inode(&self, inner: &mut Ext2Inner, ino: u32) -> Result<Inode, KernelError> {
        let (block, offset) = self.inode_location(inner, ino)?;
        let mut buf = vec![0u8; self.block_size];
        self.read_block(inner, block, &mut buf)?;
        Ok(super::read_struct(&buf[offset..]))
    }

    /// Write inode `ino` back (read-modify-write of its table block).
    pub(crate) fn write_inode(
        &self,
        inner: &mut Ext2Inner,
        ino: u32,
        inode: &Inode,
    ) -> Result<(), KernelError> {
        let (block, offset) = self.inode_location(inner, ino)?;
        let mut buf = vec![0u8; self.block_size];
        self.read_block(inner, block, &mut buf)?;
        super::write_struct(&mut buf[offset..], inode);
        self.write_block(inner, block, &buf)
    }

    fn read_ptr(
        &self,
        inner: &mut Ext2Inner,
        ptr_block: u32,
        index: u64,
    ) -> Result<u32, KernelError> {
        let mut buf = vec![0u8; self.block_size];
        self.read_block(inner, ptr_block, &mut buf)?;
        let off = index as usize * 4;
        Ok(u32::from_le_bytes(buf[off..off + 4].try_into().unwrap()))
    }

    fn write_ptr(
        &self,
        inner: &mut Ext2Inner,
        ptr_block: u32,
        index: u64,
        value: u32,
    ) -> Result<(), KernelError> {
        let mut buf = vec![0u8; self.block_size];
        self.read_block(inner, ptr_block, &mut buf)?;
        let off = index as usize * 4;
        buf[off..off + 4].copy_from_slice(&value.to_le_bytes());
        self.write_block(inner, ptr_block, &buf)
    }

    /// Resolve file-block index `idx` to a disk block. 0 means a sparse
    /// hole.
    pub(crate) fn block_for_index(
        &self,
        inner: &mut Ext2Inner,
        inode: &Inode,
        idx: u64,
    ) -> Result<u32, KernelError> {
        let p = self.ptrs_per_block();

        if idx < NDIR_BLOCKS as u64 {
            return Ok(inode.i_block[idx as usize]);
        }

        let idx = idx - NDIR_BLOCKS as u64;
        if idx < p {
            let ind = inode.i_block[IND_BLOCK];
            if ind == 0 {
                return Ok(0);
            }
            return self.read_ptr(inner, ind, idx);
        }

        let idx = idx - p;
        if idx < p * p {
            let dind = inode.i_block[DIND_BLOCK];
            if dind == 0 {
                return Ok(0);
            }
            let mid = self.read_ptr(inner, dind, idx / p)?;
            if mid == 0 {
                return Ok(0);
            }
            return self.read_ptr(inner, mid, idx % p);
        }

        // Triple-indirect range.
        Err(FsError::FileTooLarge.into())
    }

    /// Allocate a zeroed block and return its number.
    fn alloc_zeroed_block(&self, inner: &mut Ext2Inner) -> Result<u32, KernelError> {
        let block = self.alloc_block(inner, 0)?;
        let zeros = vec![0u8; self.block_size];
        self.write_block(inner, block, &zeros)?;
        Ok(block)
    }

    /// Resolve `idx` like [`Self::block_for_index`], transparently
    /// allocating missing data and pointer blocks. Updated `i_block`
    /// pointers are stored into `inode`; the caller persists the inode.
    pub(crate) fn get_or_alloc_block(
        &self,
        inner: &mut Ext2Inner,
        inode: &mut Inode,
        idx: u64,
    ) -> Result<u32, KernelError> {
        let p = self.ptrs_per_block();

        if idx < NDIR_BLOCKS as u64 {
            if inode.i_block[idx as usize] == 0 {
                inode.i_block[idx as usize] = self.alloc_zeroed_block(inner)?;
            }
            return Ok(inode.i_block[idx as usize]);
        }

        let rel = idx - NDIR_BLOCKS as u64;
        if rel < p {
            if inode.i_block[IND_BLOCK] == 0 {
                inode.i_block[IND_BLOCK] = self.alloc_zeroed_block(inner)?;
            }
            let ind = inode.i_block[IND_BLOCK];
            let mut data = self.read_ptr(inner, ind, rel)?;
            if data == 0 {
                data = self.alloc_zeroed_block(inner)?;
                self.write_ptr(inner, ind, rel, data)?;
            }
            return Ok(data);
        }

        let rel = rel - p;
        if rel < p * p {
            if inode.i_block[DIND_BLOCK] == 0 {
                inode.i_block[DIND_BLOCK] = self.alloc_zeroed_block(inner)?;
            }
            let dind = inode.i_block[DIND_BLOCK];
            let mut mid = self.read_ptr(inner, dind, rel / p)?;
            if mid == 0 {
                mid = self.alloc_zeroed_block(inner)?;
                self.write_ptr(inner, dind, rel / p, mid)?;
            }
            let mut data = self.read_ptr(inner, mid, rel % p)?;
            if data == 0 {
                data = self.alloc_zeroed_block(inner)?;
                self.write_ptr(inner, mid, rel % p, data)?;
            }
            return Ok(data);
        }

        Err(FsError::FileTooLarge.into())
    }

    /// Free every block referenced by `inode`: direct, single-indirect,
    /// and double-indirect data blocks plus the pointer blocks themselves.
    pub(crate) fn free_all_blocks(
        &self,
        inner: &mut Ext2Inner,
        inode: &Inode,
    ) -> Result<(), KernelError> {
        let p = self.ptrs_per_block();

        for &block in inode.i_block.iter().take(NDIR_BLOCKS) {
            if block != 0 {
                self.free_block(inner, block)?;
            }
        }

        let ind = inode.i_block[IND_BLOCK];
        if ind != 0 {
            for i in 0..p {
                let b = self.read_ptr(inner, ind, i)?;
                if b != 0 {
                    self.free_block(inner, b)?;
                }
            }
            self.free_block(inner, ind)?;
        }

        let dind = inode.i_block[DIND_BLOCK];
        if dind != 0 {
            for i in 0..p {
                let mid = self.read_ptr(inner, dind, i)?;
                if mid == 0 {
                    continue;
                }
                for j in 0..p {
                    let b = self.read_ptr(inner, mid, j)?;
                    if b != 0 {
                        self.free_block(inner, b)?;
                    }
                }
                self.free_block(inner, mid)?;
            }
            self.free_block(inner, dind)?;
        }

        Ok(())
    }
}
