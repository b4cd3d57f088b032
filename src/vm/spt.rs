//! Supplemental page table: the kernel's description of what should
//! appear at a given user virtual page when it is faulted in (spec.md
//! section 3 "Supplemental-Page Entry", section 4.5).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::block_device::BlockDevice;
use crate::fs::inode::Inode;
use crate::lock::Lock;
use crate::vm::swap::SwapSlot;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum EntryKind {
    CodeSegment,
    DataSegment,
    StackZero,
    MMap,
}

/// File-backed segments read `PGSIZE - zero_tail` bytes from `offset` and
/// zero the remainder; `StackZero` pages have no backing file.
#[derive(Clone)]
pub struct FileBacking<D: BlockDevice> {
    pub inode: Arc<Inode<D>>,
    pub offset: u32,
    pub zero_tail: u32,
    pub writable_back: bool,
}

#[derive(Clone, Copy)]
pub enum Residency {
    /// Not yet faulted in.
    NotLoaded,
    Frame(usize),
    Swapped(SwapSlot),
}

pub struct SptEntry<D: BlockDevice> {
    pub page: u32,
    pub kind: EntryKind,
    pub writable: bool,
    pub backing: Option<FileBacking<D>>,
    pub residency: Residency,
    pub dirty: bool,
}

/// A per-process mapping from user page address to supplemental-page
/// entry.
pub struct SupplementalPageTable<D: BlockDevice> {
    entries: Mutex<HashMap<u32, Arc<Mutex<SptEntry<D>>>>>,
    /// Serializes structural changes (insert/remove) distinct from the
    /// per-entry lock guarding an individual entry's residency, mirroring
    /// spec.md section 3's "entry lock" plus the table-level bookkeeping
    /// the frame-fault path needs.
    pub table_lock: Lock,
}

impl<D: BlockDevice> SupplementalPageTable<D> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            table_lock: Lock::new(None),
        }
    }

    pub fn insert(&self, entry: SptEntry<D>) -> Arc<Mutex<SptEntry<D>>> {
        let handle = Arc::new(Mutex::new(entry));
        let page = handle.lock().unwrap().page;
        self.entries.lock().unwrap().insert(page, handle.clone());
        handle
    }

    pub fn get(&self, page: u32) -> Option<Arc<Mutex<SptEntry<D>>>> {
        self.entries.lock().unwrap().get(&page).cloned()
    }

    pub fn remove(&self, page: u32) -> Option<Arc<Mutex<SptEntry<D>>>> {
        self.entries.lock().unwrap().remove(&page)
    }

    pub fn pages(&self) -> Vec<u32> {
        self.entries.lock().unwrap().keys().copied().collect()
    }

    pub fn contains(&self, page: u32) -> bool {
        self.entries.lock().unwrap().contains_key(&page)
    }
}

impl<D: BlockDevice> Default for SupplementalPageTable<D> {
    fn default() -> Self {
        Self::new()
    }
}
