//! Directory layer: a regular file whose contents are fixed-width entry
//! records, plus path resolution (spec.md section 4.4).

use std::sync::Arc;

use crate::bio::BufferCache;
use crate::block_device::BlockDevice;
use crate::error::{KResult, KernelError};
use crate::fs::free_map::FreeMap;
use crate::param::{NAME_MAX, ROOT_DIR_SECTOR};

/// On-disk directory entry: `(inode_sector: u32, name: [u8; NAME_MAX+1],
/// in_use: u8, is_dir: u8)` (spec.md section 6).
const ENTRY_SIZE: usize = 4 + (NAME_MAX + 1) + 1 + 1;

struct DirEntry {
    inode_sector: u32,
    name: String,
    in_use: bool,
    is_dir: bool,
}

impl DirEntry {
    fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; ENTRY_SIZE];
        buf[0..4].copy_from_slice(&self.inode_sector.to_le_bytes());
        let name_bytes = self.name.as_bytes();
        let len = name_bytes.len().min(NAME_MAX + 1);
        buf[4..4 + len].copy_from_slice(&name_bytes[..len]);
        buf[4 + NAME_MAX + 1] = self.in_use as u8;
        buf[4 + NAME_MAX + 2] = self.is_dir as u8;
        buf
    }

    fn from_bytes(buf: &[u8]) -> Self {
        let inode_sector = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let name_raw = &buf[4..4 + NAME_MAX + 1];
        let end = name_raw.iter().position(|&b| b == 0).unwrap_or(name_raw.len());
        let name = String::from_utf8_lossy(&name_raw[..end]).into_owned();
        let in_use = buf[4 + NAME_MAX + 1] != 0;
        let is_dir = buf[4 + NAME_MAX + 2] != 0;
        Self {
            inode_sector,
            name,
            in_use,
            is_dir,
        }
    }
}

/// Directory operations over an already-open directory inode.
pub struct Directory<D: BlockDevice> {
    pub inode: Arc<crate::fs::inode::Inode<D>>,
}

impl<D: BlockDevice + 'static> Directory<D> {
    pub fn new(inode: Arc<crate::fs::inode::Inode<D>>) -> Self {
        Self { inode }
    }

    fn entry_count(&self) -> usize {
        self.inode.readable_length() as usize / ENTRY_SIZE
    }

    /// Reads one entry. Callers hold `inode.content_lock` (via `guard`) for
    /// the whole directory operation, so this goes through the non-locking
    /// inode path rather than `Inode::read_at`, which would try to
    /// re-acquire the same non-reentrant lock and block forever.
    fn read_entry(&self, cache: &BufferCache<D>, index: usize) -> Option<DirEntry> {
        let mut buf = vec![0u8; ENTRY_SIZE];
        let n = self.inode.read_at_locked(cache, &mut buf, index * ENTRY_SIZE);
        if n < ENTRY_SIZE {
            return None;
        }
        Some(DirEntry::from_bytes(&buf))
    }

    /// Writes one entry through the non-locking inode path; see
    /// `read_entry`.
    fn write_entry(&self, cache: &Arc<BufferCache<D>>, free_map: &FreeMap<D>, index: usize, entry: &DirEntry) {
        self.inode
            .write_at_locked(cache, free_map, &entry.to_bytes(), index * ENTRY_SIZE)
            .expect("directory growth cannot fail on a well-formed filesystem");
    }

    /// Installs `.` (and `..` for non-root directories) at creation time
    /// (spec.md section 4.4).
    pub fn install_dots(
        &self,
        cache: &Arc<BufferCache<D>>,
        free_map: &FreeMap<D>,
        self_sector: u32,
        parent_sector: u32,
    ) {
        let _g = guard(&self.inode);
        self.write_entry(
            cache,
            free_map,
            0,
            &DirEntry {
                inode_sector: self_sector,
                name: ".".into(),
                in_use: true,
                is_dir: true,
            },
        );
        // The root directory's ".." points back to itself (spec.md section
        // 8: "`.` and `..` in root resolve to root").
        self.write_entry(
            cache,
            free_map,
            1,
            &DirEntry {
                inode_sector: parent_sector,
                name: "..".into(),
                in_use: true,
                is_dir: true,
            },
        );
    }

    /// Linear scan for `name`; returns the matching entry's sector and
    /// whether it is a directory.
    pub fn lookup(&self, cache: &BufferCache<D>, name: &str) -> Option<(u32, bool)> {
        let _g = guard(&self.inode);
        for i in 0..self.entry_count() {
            if let Some(e) = self.read_entry(cache, i) {
                if e.in_use && e.name == name {
                    return Some((e.inode_sector, e.is_dir));
                }
            }
        }
        None
    }

    /// Appends an entry, reusing a freed slot if one exists.
    pub fn add(
        &self,
        cache: &Arc<BufferCache<D>>,
        free_map: &FreeMap<D>,
        name: &str,
        inode_sector: u32,
        is_dir: bool,
    ) -> KResult<()> {
        let _g = guard(&self.inode);
        if name.len() > NAME_MAX {
            return Err(KernelError::InvalidArgument);
        }
        for i in 0..self.entry_count() {
            if let Some(e) = self.read_entry(cache, i) {
                if e.in_use && e.name == name {
                    return Err(KernelError::AlreadyExists);
                }
            }
        }
        let mut free_slot = None;
        for i in 0..self.entry_count() {
            if let Some(e) = self.read_entry(cache, i) {
                if !e.in_use {
                    free_slot = Some(i);
                    break;
                }
            }
        }
        let index = free_slot.unwrap_or_else(|| self.entry_count());
        self.write_entry(
            cache,
            free_map,
            index,
            &DirEntry {
                inode_sector,
                name: name.to_string(),
                in_use: true,
                is_dir,
            },
        );
        Ok(())
    }

    /// Refuses to remove the root, `.`/`..`, or a non-empty directory.
    pub fn remove(&self, cache: &Arc<BufferCache<D>>, free_map: &FreeMap<D>, name: &str) -> KResult<u32> {
        let _g = guard(&self.inode);
        if name == "." || name == ".." {
            return Err(KernelError::NotPermitted);
        }
        let mut found = None;
        for i in 0..self.entry_count() {
            if let Some(e) = self.read_entry(cache, i) {
                if e.in_use && e.name == name {
                    found = Some((i, e));
                    break;
                }
            }
        }
        let (index, entry) = found.ok_or(KernelError::NotFound)?;
        if entry.is_dir && entry.inode_sector == ROOT_DIR_SECTOR {
            return Err(KernelError::NotPermitted);
        }
        if entry.is_dir {
            let child = crate::fs::inode::Inode::open_raw(cache, entry.inode_sector)?;
            let child_dir = Directory::new(child);
            if child_dir.has_entries_other_than_dots(cache) {
                return Err(KernelError::NotEmpty);
            }
        }
        self.write_entry(
            cache,
            free_map,
            index,
            &DirEntry {
                inode_sector: 0,
                name: String::new(),
                in_use: false,
                is_dir: false,
            },
        );
        Ok(entry.inode_sector)
    }

    fn has_entries_other_than_dots(&self, cache: &BufferCache<D>) -> bool {
        let _g = guard(&self.inode);
        for i in 0..self.entry_count() {
            if let Some(e) = self.read_entry(cache, i) {
                if e.in_use && e.name != "." && e.name != ".." {
                    return true;
                }
            }
        }
        false
    }

    /// Lists every in-use entry except `.` and `..` (spec.md section 8
    /// scenario 5).
    pub fn list(&self, cache: &BufferCache<D>) -> Vec<String> {
        let _g = guard(&self.inode);
        let mut names = Vec::new();
        for i in 0..self.entry_count() {
            if let Some(e) = self.read_entry(cache, i) {
                if e.in_use && e.name != "." && e.name != ".." {
                    names.push(e.name);
                }
            }
        }
        names
    }
}

/// RAII helper so `lookup`/`add`/`remove`/`list` all serialize on the
/// inode's content lock (directory content is file content).
fn guard<D: BlockDevice>(inode: &Arc<crate::fs::inode::Inode<D>>) -> impl Drop + '_ {
    inode.content_lock.acquire();
    scopeguard::guard(inode.as_ref(), |inode| inode.content_lock.release())
}
