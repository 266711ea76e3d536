//! Byte-granular file read/write.
//!
//! Reads clamp to `i_size` and return zeros for sparse holes without any
//! device I/O. Writes allocate missing blocks on demand, read-modify-write
//! partial blocks, extend `i_size` when writing past the end, and keep
//! `i_blocks` consistent (`ceil(i_size / block_size) * (block_size/512)`).

use alloc::vec;

use super::{Ext2Filesystem, Ext2Inner};
use crate::error::KernelError;

impl Ext2Filesystem {
    /// Read up to `buf.len()` bytes from inode `ino` at byte offset
    /// `offset`. Returns the number of bytes read (0 at or past EOF).
    pub(crate) fn read_at(
        &self,
        inner: &mut Ext2Inner,
        ino: u32,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize, KernelError> {
        let inode = self.read_inode(inner, ino)?;
        let size = inode.i_size as u64;
        if offset >= size {
            return Ok(0);
        }
        let total = (buf.len() as u64).min(size - offset) as usize;

        let mut block_buf = vec![0u8; self.block_size];
        let mut done = 0usize;
        while done < total {
            let pos = offset + done as u64;
            let idx = pos / self.block_size as u64;
            let block_off = (pos % self.block_size as u64) as usize;
            let chunk = (self.block_size - block_off).min(total - done);

            let block = self.block_for_index(inner, &inode, idx)?;
            if block == 0 {
                // Sparse hole: zeros, no I/O.
                buf[done..done + chunk].fill(0);
            } else {
                self.read_block(inner, block, &mut block_buf)?;
                buf[done..done + chunk].copy_from_slice(&block_buf[block_off..block_off + chunk]);
            }
            done += chunk;
        }
        Ok(total)
    }

    /// Write `data` to inode `ino` at byte offset `offset`, extending the
    /// file as needed. Returns the number of bytes written.
    pub(crate) fn write_at(
        &self,
        inner: &mut Ext2Inner,
        ino: u32,
        offset: u64,
        data: &[u8],
    ) -> Result<usize, KernelError> {
        if data.is_empty() {
            return Ok(0);
        }
        let mut inode = self.read_inode(inner, ino)?;

        let mut block_buf = vec![0u8; self.block_size];
        let mut done = 0usize;
        while done < data.len() {
            let pos = offset + done as u64;
            let idx = pos / self.block_size as u64;
            let block_off = (pos % self.block_size as u64) as usize;
            let chunk = (self.block_size - block_off).min(data.len() - done);

            let block = self.get_or_alloc_block(inner, &mut inode, idx)?;
            if chunk == self.block_size {
                // Whole-block overwrite.
                self.write_block(inner, block, &data[done..done + chunk])?;
            } else {
                self.read_block(inner, block, &mut block_buf)?;
                block_buf[block_off..block_off + chunk].copy_from_slice(&data[done..done + chunk]);
                self.write_block(inner, block, &block_buf)?;
            }
            done += chunk;
        }

        let end = offset + data.len() as u64;
        if end > inode.i_size as u64 {
            inode.i_size = end as u32;
        }
        let fs_blocks = (inode.i_size as u64).div_ceil(self.block_size as u64);
        inode.i_blocks = (fs_blocks * (self.block_size as u64 / 512)) as u32;
        self.write_inode(inner, ino, &inode)?;

        Ok(data.len())
    }

    /// Drop every data block and reset the size to zero (O_TRUNC).
    pub(crate) fn truncate(&self, inner: &mut Ext2Inner, ino: u32) -> Result<(), KernelError> {
        let mut inode = self.read_inode(inner, ino)?;
        self.free_all_blocks(inner, &inode)?;
        inode.i_block = [0; super::N_BLOCKS];
        inode.i_size = 0;
        inode.i_blocks = 0;
        self.write_inode(inner, ino, &inode)
    }
}
