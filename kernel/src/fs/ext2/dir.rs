//! Directory records and namespace operations.
//!
//! Directory contents are a sequence of variable-length records; in every
//! directory block the `rec_len` fields are 4-byte aligned and sum to
//! exactly `block_size`. Records with `inode == 0` are tombstones whose
//! space can be reclaimed. Insertion either reuses a tombstone, splits an
//! existing record's slack (first fit), or appends a fresh block.
//! Deletion zeroes the record's inode and merges its `rec_len` into the
//! preceding record when there is one.

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use super::{
    DirEntryHeader, Ext2Filesystem, Ext2Inner, Inode, DIRENT_HEADER_SIZE, FT_DIR, FT_REG_FILE,
    ROOT_INO, S_IFDIR, S_IFREG,
};
use crate::error::{Ext2Error, FsError, KernelError};
use crate::fs::{DirEntry, NodeType, NAME_MAX};

/// Record length needed for a name of `name_len` bytes (4-byte aligned).
fn record_size(name_len: usize) -> usize {
    (DIRENT_HEADER_SIZE + name_len + 3) & !3
}

/// Parsed view of one directory record inside a block buffer.
struct RawEntry {
    offset: usize,
    header: DirEntryHeader,
}

/// Walk the records of one directory block, validating the structural
/// invariants (alignment, bounds, exact coverage of the block).
fn walk_block(block_size: usize, buf: &[u8]) -> Result<Vec<RawEntry>, KernelError> {
    let mut entries = Vec::new();
    let mut offset = 0usize;
    while offset < block_size {
        let header: DirEntryHeader = super::read_struct(&buf[offset..]);
        let rec_len = header.rec_len as usize;
        if rec_len < DIRENT_HEADER_SIZE
            || rec_len % 4 != 0
            || offset + rec_len > block_size
            || (header.inode != 0
                && DIRENT_HEADER_SIZE + header.name_len as usize > rec_len)
        {
            return Err(Ext2Error::BadDirent.into());
        }
        entries.push(RawEntry { offset, header });
        offset += rec_len;
    }
    if offset != block_size {
        return Err(Ext2Error::BadDirent.into());
    }
    Ok(entries)
}

impl Ext2Filesystem {
    fn dir_block_count(&self, dir: &Inode) -> u64 {
        (dir.i_size as u64).div_ceil(self.block_size as u64)
    }

    /// Find `name` in directory `dir_ino`. Returns the entry's inode
    /// number, or `None`.
    pub(crate) fn dir_lookup(
        &self,
        inner: &mut Ext2Inner,
        dir_ino: u32,
        name: &str,
    ) -> Result<Option<u32>, KernelError> {
        let dir = self.read_inode(inner, dir_ino)?;
        if !dir.is_dir() {
            return Err(FsError::NotADirectory.into());
        }

        let mut buf = vec![0u8; self.block_size];
        for idx in 0..self.dir_block_count(&dir) {
            let block = self.block_for_index(inner, &dir, idx)?;
            if block == 0 {
                continue;
            }
            self.read_block(inner, block, &mut buf)?;
            for e in walk_block(self.block_size, &buf)? {
                if e.header.inode == 0 {
                    continue;
                }
                let start = e.offset + DIRENT_HEADER_SIZE;
                let entry_name = &buf[start..start + e.header.name_len as usize];
                if entry_name == name.as_bytes() {
                    return Ok(Some(e.header.inode));
                }
            }
        }
        Ok(None)
    }

    /// List every live entry of directory `dir_ino`, in record order.
    pub(crate) fn dir_list(
        &self,
        inner: &mut Ext2Inner,
        dir_ino: u32,
    ) -> Result<Vec<DirEntry>, KernelError> {
        let dir = self.read_inode(inner, dir_ino)?;
        if !dir.is_dir() {
            return Err(FsError::NotADirectory.into());
        }

        let mut out = Vec::new();
        let mut buf = vec![0u8; self.block_size];
        for idx in 0..self.dir_block_count(&dir) {
            let block = self.block_for_index(inner, &dir, idx)?;
            if block == 0 {
                continue;
            }
            self.read_block(inner, block, &mut buf)?;
            for e in walk_block(self.block_size, &buf)? {
                if e.header.inode == 0 {
                    continue;
                }
                let start = e.offset + DIRENT_HEADER_SIZE;
                let name_bytes = &buf[start..start + e.header.name_len as usize];
                let name = String::from_utf8_lossy(name_bytes).into_owned();
                let node_type = match e.header.file_type {
                    FT_DIR => NodeType::Directory,
                    _ => NodeType::File,
                };
                out.push(DirEntry {
                    ino: e.header.inode as u64,
                    name,
                    node_type,
                });
            }
        }
        Ok(out)
    }

    /// Insert `(name -> ino)` into directory `dir_ino`.
    ///
    /// First fit: reuse a tombstone with enough room, else split a record
    /// with enough slack, else append a fresh directory block.
    pub(crate) fn dir_insert(
        &self,
        inner: &mut Ext2Inner,
        dir_ino: u32,
        name: &str,
        ino: u32,
        file_type: u8,
    ) -> Result<(), KernelError> {
        if name.is_empty() || name.len() > NAME_MAX || name.contains('/') {
            return Err(FsError::InvalidPath.into());
        }
        let needed = record_size(name.len());
        let mut dir = self.read_inode(inner, dir_ino)?;
        if !dir.is_dir() {
            return Err(FsError::NotADirectory.into());
        }

        let mut buf = vec![0u8; self.block_size];
        for idx in 0..self.dir_block_count(&dir) {
            let block = self.block_for_index(inner, &dir, idx)?;
            if block == 0 {
                continue;
            }
            self.read_block(inner, block, &mut buf)?;
            for e in walk_block(self.block_size, &buf)? {
                let rec_len = e.header.rec_len as usize;

                if e.header.inode == 0 && rec_len >= needed {
                    // Reuse the tombstone in place, keeping its rec_len.
                    let header = DirEntryHeader {
                        inode: ino,
                        rec_len: e.header.rec_len,
                        name_len: name.len() as u8,
                        file_type,
                    };
                    super::write_struct(&mut buf[e.offset..], &header);
                    let start = e.offset + DIRENT_HEADER_SIZE;
                    buf[start..start + name.len()].copy_from_slice(name.as_bytes());
                    return self.write_block(inner, block, &buf);
                }

                let used = record_size(e.header.name_len as usize);
                if e.header.inode != 0 && rec_len >= used + needed {
                    // Split: shrink the existing record to its real size
                    // and put the new one in the slack.
                    let mut shrunk = e.header;
                    shrunk.rec_len = used as u16;
                    super::write_struct(&mut buf[e.offset..], &shrunk);

                    let new_off = e.offset + used;
                    let header = DirEntryHeader {
                        inode: ino,
                        rec_len: (rec_len - used) as u16,
                        name_len: name.len() as u8,
                        file_type,
                    };
                    super::write_struct(&mut buf[new_off..], &header);
                    let start = new_off + DIRENT_HEADER_SIZE;
                    buf[start..start + name.len()].copy_from_slice(name.as_bytes());
                    return self.write_block(inner, block, &buf);
                }
            }
        }

        // No room anywhere: append a new block holding a single record
        // spanning the whole block.
        let idx = self.dir_block_count(&dir);
        let block = self.get_or_alloc_block(inner, &mut dir, idx)?;
        buf.fill(0);
        let header = DirEntryHeader {
            inode: ino,
            rec_len: self.block_size as u16,
            name_len: name.len() as u8,
            file_type,
        };
        super::write_struct(&mut buf, &header);
        buf[DIRENT_HEADER_SIZE..DIRENT_HEADER_SIZE + name.len()]
            .copy_from_slice(name.as_bytes());
        self.write_block(inner, block, &buf)?;

        dir.i_size += self.block_size as u32;
        dir.i_blocks = ((dir.i_size as u64).div_ceil(self.block_size as u64)
            * (self.block_size as u64 / 512)) as u32;
        self.write_inode(inner, dir_ino, &dir)
    }

    /// Remove `name` from directory `dir_ino`: zero the record's inode and
    /// merge its `rec_len` into the preceding record when one exists.
    pub(crate) fn dir_remove(
        &self,
        inner: &mut Ext2Inner,
        dir_ino: u32,
        name: &str,
    ) -> Result<(), KernelError> {
        let dir = self.read_inode(inner, dir_ino)?;
        if !dir.is_dir() {
            return Err(FsError::NotADirectory.into());
        }

        let mut buf = vec![0u8; self.block_size];
        for idx in 0..self.dir_block_count(&dir) {
            let block = self.block_for_index(inner, &dir, idx)?;
            if block == 0 {
                continue;
            }
            self.read_block(inner, block, &mut buf)?;
            let entries = walk_block(self.block_size, &buf)?;
            for (i, e) in entries.iter().enumerate() {
                if e.header.inode == 0 {
                    continue;
                }
                let start = e.offset + DIRENT_HEADER_SIZE;
                if &buf[start..start + e.header.name_len as usize] != name.as_bytes() {
                    continue;
                }

                if i > 0 {
                    // Fold this record into its predecessor.
                    let prev = &entries[i - 1];
                    let mut merged = prev.header;
                    merged.rec_len += e.header.rec_len;
                    super::write_struct(&mut buf[prev.offset..], &merged);
                } else {
                    // First record of the block: tombstone it.
                    let mut dead = e.header;
                    dead.inode = 0;
                    super::write_struct(&mut buf[e.offset..], &dead);
                }
                return self.write_block(inner, block, &buf);
            }
        }
        Err(FsError::NotFound.into())
    }

    /// True when `dir_ino` holds nothing beyond `.` and `..`.
    pub(crate) fn dir_is_empty(
        &self,
        inner: &mut Ext2Inner,
        dir_ino: u32,
    ) -> Result<bool, KernelError> {
        let entries = self.dir_list(inner, dir_ino)?;
        Ok(entries.iter().all(|e| e.name == "." || e.name == ".."))
    }

    /// Create a regular file `name` in `parent_ino`.
    pub(crate) fn create_file(
        &self,
        inner: &mut Ext2Inner,
        parent_ino: u32,
        name: &str,
        mode: u16,
    ) -> Result<u32, KernelError> {
        if self.dir_lookup(inner, parent_ino, name)?.is_some() {
            return Err(FsError::AlreadyExists.into());
        }

        let ino = self.alloc_inode(inner, 0, false)?;
        let inode = Inode {
            i_mode: S_IFREG | (mode & 0o7777),
            i_links_count: 1,
            ..Inode::default()
        };
        self.write_inode(inner, ino, &inode)?;
        self.dir_insert(inner, parent_ino, name, ino, FT_REG_FILE)?;
        Ok(ino)
    }

    /// Create directory `name` in `parent_ino`: one fresh block with `.`
    /// and `..`, link count 2, parent link count incremented.
    pub(crate) fn make_dir(
        &self,
        inner: &mut Ext2Inner,
        parent_ino: u32,
        name: &str,
        mode: u16,
    ) -> Result<u32, KernelError> {
        if self.dir_lookup(inner, parent_ino, name)?.is_some() {
            return Err(FsError::AlreadyExists.into());
        }

        let ino = self.alloc_inode(inner, 0, true)?;
        let block = self.alloc_block(inner, 0)?;

        let mut buf = vec![0u8; self.block_size];
        let dot = DirEntryHeader {
            inode: ino,
            rec_len: record_size(1) as u16,
            name_len: 1,
            file_type: FT_DIR,
        };
        super::write_struct(&mut buf, &dot);
        buf[DIRENT_HEADER_SIZE] = b'.';

        let dotdot_off = record_size(1);
        let dotdot = DirEntryHeader {
            inode: parent_ino,
            rec_len: (self.block_size - dotdot_off) as u16,
            name_len: 2,
            file_type: FT_DIR,
        };
        super::write_struct(&mut buf[dotdot_off..], &dotdot);
        buf[dotdot_off + DIRENT_HEADER_SIZE] = b'.';
        buf[dotdot_off + DIRENT_HEADER_SIZE + 1] = b'.';
        self.write_block(inner, block, &buf)?;

        let mut inode = Inode {
            i_mode: S_IFDIR | (mode & 0o7777),
            i_links_count: 2,
            i_size: self.block_size as u32,
            i_blocks: (self.block_size / 512) as u32,
            ..Inode::default()
        };
        inode.i_block[0] = block;
        self.write_inode(inner, ino, &inode)?;

        self.dir_insert(inner, parent_ino, name, ino, FT_DIR)?;

        let mut parent = self.read_inode(inner, parent_ino)?;
        parent.i_links_count += 1;
        self.write_inode(inner, parent_ino, &parent)?;
        Ok(ino)
    }

    /// Remove directory `name` from `parent_ino`. Refuses `.`/`..` and
    /// non-empty directories.
    pub(crate) fn remove_dir(
        &self,
        inner: &mut Ext2Inner,
        parent_ino: u32,
        name: &str,
    ) -> Result<(), KernelError> {
        if name == "." || name == ".." {
            return Err(Ext2Error::Invalid.into());
        }
        let ino = self
            .dir_lookup(inner, parent_ino, name)?
            .ok_or(KernelError::Fs(FsError::NotFound))?;
        let inode = self.read_inode(inner, ino)?;
        if !inode.is_dir() {
            return Err(FsError::NotADirectory.into());
        }
        if !self.dir_is_empty(inner, ino)? {
            return Err(FsError::DirectoryNotEmpty.into());
        }

        self.dir_remove(inner, parent_ino, name)?;
        self.free_all_blocks(inner, &inode)?;

        let mut dead = inode;
        dead.i_links_count = 0;
        dead.i_dtime = 1;
        self.write_inode(inner, ino, &dead)?;
        self.free_inode(inner, ino, true)?;

        let mut parent = self.read_inode(inner, parent_ino)?;
        parent.i_links_count = parent.i_links_count.saturating_sub(1);
        self.write_inode(inner, parent_ino, &parent)
    }

    /// Unlink file `name` from `parent_ino`. Directories are refused;
    /// when the link count reaches zero every referenced block is freed,
    /// `i_dtime` is set, and the inode returns to the bitmap.
    pub(crate) fn unlink_file(
        &self,
        inner: &mut Ext2Inner,
        parent_ino: u32,
        name: &str,
    ) -> Result<(), KernelError> {
        let ino = self
            .dir_lookup(inner, parent_ino, name)?
            .ok_or(KernelError::Fs(FsError::NotFound))?;
        let mut inode = self.read_inode(inner, ino)?;
        if inode.is_dir() {
            return Err(FsError::IsADirectory.into());
        }

        self.dir_remove(inner, parent_ino, name)?;

        inode.i_links_count = inode.i_links_count.saturating_sub(1);
        if inode.i_links_count == 0 {
            self.free_all_blocks(inner, &inode)?;
            inode.i_dtime = 1;
            self.write_inode(inner, ino, &inode)?;
            self.free_inode(inner, ino, false)?;
        } else {
            self.write_inode(inner, ino, &inode)?;
        }
        Ok(())
    }

    /// Walk an absolute, normalized, filesystem-relative path to its
    /// inode number.
    pub(crate) fn resolve_path(
        &self,
        inner: &mut Ext2Inner,
        path: &str,
    ) -> Result<u32, KernelError> {
        let mut ino = ROOT_INO;
        for part in path.split('/').filter(|p| !p.is_empty()) {
            ino = self
                .dir_lookup(inner, ino, part)?
                .ok_or(KernelError::Fs(FsError::NotFound))?;
        }
        Ok(ino)
    }

    /// Split a path into `(parent path, final component)`.
    pub(crate) fn split_parent(path: &str) -> Result<(&str, &str), KernelError> {
        let trimmed = path.trim_end_matches('/');
        if trimmed.is_empty() {
            return Err(FsError::InvalidPath.into());
        }
        match trimmed.rfind('/') {
            Some(pos) => Ok((&trimmed[..pos.max(1)], &trimmed[pos + 1..])),
            None => Err(FsError::InvalidPath.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::{
        Ext2Filesystem, DEFAULT_DIR_MODE, DEFAULT_FILE_MODE, ROOT_INO,
    };
    use super::walk_block;
    use crate::error::{FsError, KernelError};
    use crate::test_support;
    use alloc::boxed::Box;
    use alloc::vec;

    fn fresh_fs() -> Ext2Filesystem {
        Ext2Filesystem::mount(Box::new(test_support::mkfs_ext2_ramdisk(512))).unwrap()
    }

    /// rec_len of every block of a directory must sum to block_size.
    fn assert_reclen_invariant(fs: &Ext2Filesystem, dir_ino: u32) {
        let mut inner = fs.inner.lock();
        let dir = fs.read_inode(&mut inner, dir_ino).unwrap();
        let blocks = (dir.i_size as u64).div_ceil(fs.block_size as u64);
        let mut buf = vec![0u8; fs.block_size];
        for idx in 0..blocks {
            let block = fs.block_for_index(&mut inner, &dir, idx).unwrap();
            fs.read_block(&mut inner, block, &mut buf).unwrap();
            let entries = walk_block(fs.block_size, &buf).unwrap();
            let total: usize = entries.iter().map(|e| e.header.rec_len as usize).sum();
            assert_eq!(total, fs.block_size);
            for e in &entries {
                assert_eq!(e.header.rec_len % 4, 0);
            }
        }
    }

    #[test]
    fn root_lists_dot_and_dotdot() {
        let fs = fresh_fs();
        let mut inner = fs.inner.lock();
        let entries = fs.dir_list(&mut inner, ROOT_INO).unwrap();
        let names: alloc::vec::Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, [".", ".."]);
        assert!(fs.dir_is_empty(&mut inner, ROOT_INO).unwrap());
    }

    #[test]
    fn insert_splits_and_lookup_finds() {
        let fs = fresh_fs();
        {
            let mut inner = fs.inner.lock();
            let a = fs
                .create_file(&mut inner, ROOT_INO, "alpha.txt", DEFAULT_FILE_MODE)
                .unwrap();
            let b = fs
                .create_file(&mut inner, ROOT_INO, "beta", DEFAULT_FILE_MODE)
                .unwrap();
            assert_ne!(a, b);

            assert_eq!(fs.dir_lookup(&mut inner, ROOT_INO, "alpha.txt").unwrap(), Some(a));
            assert_eq!(fs.dir_lookup(&mut inner, ROOT_INO, "beta").unwrap(), Some(b));
            assert_eq!(fs.dir_lookup(&mut inner, ROOT_INO, "gamma").unwrap(), None);
        }
        assert_reclen_invariant(&fs, ROOT_INO);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let fs = fresh_fs();
        let mut inner = fs.inner.lock();
        fs.create_file(&mut inner, ROOT_INO, "dup", DEFAULT_FILE_MODE)
            .unwrap();
        assert!(matches!(
            fs.create_file(&mut inner, ROOT_INO, "dup", DEFAULT_FILE_MODE),
            Err(KernelError::Fs(FsError::AlreadyExists))
        ));
    }

    #[test]
    fn removal_merges_into_previous_record() {
        let fs = fresh_fs();
        {
            let mut inner = fs.inner.lock();
            for name in ["one", "two", "three"] {
                fs.create_file(&mut inner, ROOT_INO, name, DEFAULT_FILE_MODE)
                    .unwrap();
            }
            fs.dir_remove(&mut inner, ROOT_INO, "two").unwrap();
            assert_eq!(fs.dir_lookup(&mut inner, ROOT_INO, "two").unwrap(), None);
            assert!(fs.dir_lookup(&mut inner, ROOT_INO, "one").unwrap().is_some());
            assert!(fs.dir_lookup(&mut inner, ROOT_INO, "three").unwrap().is_some());
        }
        assert_reclen_invariant(&fs, ROOT_INO);
    }

    #[test]
    fn tombstones_are_reused() {
        let fs = fresh_fs();
        let mut inner = fs.inner.lock();
        fs.create_file(&mut inner, ROOT_INO, "fill", DEFAULT_FILE_MODE)
            .unwrap();
        fs.create_file(&mut inner, ROOT_INO, "gone", DEFAULT_FILE_MODE)
            .unwrap();
        fs.create_file(&mut inner, ROOT_INO, "keep", DEFAULT_FILE_MODE)
            .unwrap();
        let size_before = fs.read_inode(&mut inner, ROOT_INO).unwrap().i_size;

        fs.unlink_file(&mut inner, ROOT_INO, "gone").unwrap();
        fs.create_file(&mut inner, ROOT_INO, "back", DEFAULT_FILE_MODE)
            .unwrap();
        // The directory did not grow: the freed space was reused.
        let size_after = fs.read_inode(&mut inner, ROOT_INO).unwrap().i_size;
        assert_eq!(size_before, size_after);
    }

    #[test]
    fn directory_grows_a_block_when_full() {
        let fs = fresh_fs();
        {
            let mut inner = fs.inner.lock();
            // Long names exhaust the first 1 KiB block quickly.
            for i in 0..30 {
                let name = alloc::format!("file-with-a-rather-long-name-{:02}", i);
                fs.create_file(&mut inner, ROOT_INO, &name, DEFAULT_FILE_MODE)
                    .unwrap();
            }
            let root = fs.read_inode(&mut inner, ROOT_INO).unwrap();
            assert!(root.i_size as usize > fs.block_size);
            // Everything is still reachable.
            for i in 0..30 {
                let name = alloc::format!("file-with-a-rather-long-name-{:02}", i);
                assert!(fs.dir_lookup(&mut inner, ROOT_INO, &name).unwrap().is_some());
            }
        }
        assert_reclen_invariant(&fs, ROOT_INO);
    }

    #[test]
    fn mkdir_rmdir_lifecycle_and_link_counts() {
        let fs = fresh_fs();
        let mut inner = fs.inner.lock();

        let root_links = fs.read_inode(&mut inner, ROOT_INO).unwrap().i_links_count;
        let sub = fs
            .make_dir(&mut inner, ROOT_INO, "sub", DEFAULT_DIR_MODE)
            .unwrap();

        let sub_inode = fs.read_inode(&mut inner, sub).unwrap();
        assert!(sub_inode.is_dir());
        assert_eq!(sub_inode.i_links_count, 2);
        assert_eq!(
            fs.read_inode(&mut inner, ROOT_INO).unwrap().i_links_count,
            root_links + 1
        );

        // ".." points back at the parent.
        assert_eq!(fs.dir_lookup(&mut inner, sub, "..").unwrap(), Some(ROOT_INO));

        // Non-empty directory refuses rmdir.
        fs.create_file(&mut inner, sub, "blocker", DEFAULT_FILE_MODE)
            .unwrap();
        assert!(matches!(
            fs.remove_dir(&mut inner, ROOT_INO, "sub"),
            Err(KernelError::Fs(FsError::DirectoryNotEmpty))
        ));

        fs.unlink_file(&mut inner, sub, "blocker").unwrap();
        let free_blocks = inner.sb.s_free_blocks_count;
        let free_inodes = inner.sb.s_free_inodes_count;
        fs.remove_dir(&mut inner, ROOT_INO, "sub").unwrap();

        assert_eq!(fs.dir_lookup(&mut inner, ROOT_INO, "sub").unwrap(), None);
        assert_eq!(inner.sb.s_free_blocks_count, free_blocks + 1);
        assert_eq!(inner.sb.s_free_inodes_count, free_inodes + 1);
        assert_eq!(
            fs.read_inode(&mut inner, ROOT_INO).unwrap().i_links_count,
            root_links
        );

        // rmdir of "." and ".." is refused outright.
        assert!(fs.remove_dir(&mut inner, ROOT_INO, ".").is_err());
        assert!(fs.remove_dir(&mut inner, ROOT_INO, "..").is_err());
    }

    #[test]
    fn unlink_refuses_directories_and_frees_blocks() {
        let fs = fresh_fs();
        let mut inner = fs.inner.lock();

        fs.make_dir(&mut inner, ROOT_INO, "d", DEFAULT_DIR_MODE).unwrap();
        assert!(matches!(
            fs.unlink_file(&mut inner, ROOT_INO, "d"),
            Err(KernelError::Fs(FsError::IsADirectory))
        ));

        let ino = fs
            .create_file(&mut inner, ROOT_INO, "f", DEFAULT_FILE_MODE)
            .unwrap();
        fs.write_at(&mut inner, ino, 0, &[7u8; 5000]).unwrap();
        let free_before_unlink = inner.sb.s_free_blocks_count;
        fs.unlink_file(&mut inner, ROOT_INO, "f").unwrap();
        // 5 data blocks came back.
        assert_eq!(inner.sb.s_free_blocks_count, free_before_unlink + 5);
        assert_eq!(fs.dir_lookup(&mut inner, ROOT_INO, "f").unwrap(), None);
    }

    #[test]
    fn path_walk_descends_components() {
        let fs = fresh_fs();
        let mut inner = fs.inner.lock();
        let a = fs.make_dir(&mut inner, ROOT_INO, "a", DEFAULT_DIR_MODE).unwrap();
        let b = fs.make_dir(&mut inner, a, "b", DEFAULT_DIR_MODE).unwrap();
        let f = fs.create_file(&mut inner, b, "f", DEFAULT_FILE_MODE).unwrap();

        assert_eq!(fs.resolve_path(&mut inner, "/").unwrap(), ROOT_INO);
        assert_eq!(fs.resolve_path(&mut inner, "/a").unwrap(), a);
        assert_eq!(fs.resolve_path(&mut inner, "/a/b/f").unwrap(), f);
        assert!(matches!(
            fs.resolve_path(&mut inner, "/a/missing"),
            Err(KernelError::Fs(FsError::NotFound))
        ));
    }

    #[test]
    fn split_parent_handles_roots_and_nesting() {
        assert_eq!(
            Ext2Filesystem::split_parent("/a/b/c").unwrap(),
            ("/a/b", "c")
        );
        assert_eq!(Ext2Filesystem::split_parent("/top").unwrap(), ("/", "top"));
        assert!(Ext2Filesystem::split_parent("/").is_err());
    }
}
