//! Demand-paged virtual memory: supplemental page table, global frame
//! table with second-chance eviction, swap pool, and memory-mapped files
//! (spec.md section 4.5, section 2 item 7).
//!
//! Grounded in `examples/original_source/src/vm/{page.c,frame.c,swap.c}`
//! for the fault-handling shape (look up the supplemental entry, obtain a
//! frame, page in by kind, install, unpin) and spec.md section 3's
//! "Frame Table Entry" / "Supplemental-Page Entry" data model.

pub mod frame;
pub mod spt;
pub mod swap;

use std::sync::{Arc, Mutex};

use tracing::trace;

use crate::block_device::BlockDevice;
use crate::error::{KResult, KernelError};
use crate::fs::Filesystem;
use crate::param::{PGSIZE, STACK_GROWTH_HEADROOM, STACK_LIMIT_PAGES, USER_STACK_TOP};
use crate::sched::Tid;
use crate::vm::frame::FrameTable;
use crate::vm::spt::{EntryKind, FileBacking, Residency, SptEntry, SupplementalPageTable};
use crate::vm::swap::SwapPool;

/// Ties the frame table, swap pool and filesystem together to service page
/// faults and memory-mapped files for every process sharing this kernel
/// instance.
pub struct VirtualMemory<D: BlockDevice> {
    pub frames: FrameTable<D>,
    pub swap: SwapPool<D>,
    fs: Arc<Filesystem<D>>,
}

impl<D: BlockDevice + 'static> VirtualMemory<D> {
    pub fn new(num_frames: usize, swap_device: Arc<D>, fs: Arc<Filesystem<D>>) -> Self {
        Self {
            frames: FrameTable::new(num_frames),
            swap: SwapPool::new(swap_device),
            fs,
        }
    }

    /// Resolves a fault at `page` for `tid`: if already resident, just
    /// marks it accessed; otherwise obtains a frame (the free-list first,
    /// a second-chance victim otherwise) and pages the content in
    /// according to the entry's kind.
    pub fn handle_fault(&self, spt: &SupplementalPageTable<D>, tid: Tid, page: u32) -> KResult<usize> {
        let entry_handle = spt.get(page).ok_or(KernelError::BadUserAccess)?;
        {
            let entry = entry_handle.lock().unwrap();
            if let Residency::Frame(idx) = entry.residency {
                self.frames.mark_accessed(idx);
                return Ok(idx);
            }
        }
        let kind = entry_handle.lock().unwrap().kind;
        let idx = self.acquire_frame(tid);
        self.frames.install(idx, tid, kind, entry_handle.clone());
        self.page_in(idx, &entry_handle);
        entry_handle.lock().unwrap().residency = Residency::Frame(idx);
        self.frames.unpin(idx);
        trace!(page, idx, "page fault resolved");
        Ok(idx)
    }

    fn acquire_frame(&self, tid: Tid) -> usize {
        if let Some(idx) = self.frames.try_alloc_free(tid) {
            return idx;
        }
        let idx = self.frames.select_victim();
        self.evict_frame(idx);
        idx
    }

    /// Writes back or discards whatever `idx` held before handing it to a
    /// new owner (spec.md section 4.5: code segments are read-only and
    /// simply discarded, mmap pages write back if dirty, everything else
    /// goes to swap).
    fn evict_frame(&self, idx: usize) {
        let entry_handle = match self.frames.clear(idx) {
            Some(h) => h,
            None => return,
        };
        let mut entry = entry_handle.lock().unwrap();
        match entry.kind {
            EntryKind::CodeSegment => {
                entry.residency = Residency::NotLoaded;
            }
            EntryKind::MMap => {
                if entry.dirty {
                    self.writeback_mmap_page(idx, &entry);
                }
                entry.residency = Residency::NotLoaded;
            }
            EntryKind::DataSegment | EntryKind::StackZero => {
                let slot = self.swap.get();
                self.frames.with_data(idx, |data| self.swap.write_out(slot, data));
                entry.residency = Residency::Swapped(slot);
            }
        }
        entry.dirty = false;
    }

    fn writeback_mmap_page(&self, idx: usize, entry: &SptEntry<D>) {
        if let Some(backing) = &entry.backing {
            let len = (PGSIZE as u32 - backing.zero_tail) as usize;
            self.frames.with_data(idx, |data| {
                let _ = backing
                    .inode
                    .write_at(&self.fs.cache, &self.fs.free_map, &data[..len], backing.offset as usize);
            });
        }
    }

    fn page_in(&self, idx: usize, entry_handle: &Arc<Mutex<SptEntry<D>>>) {
        let mut entry = entry_handle.lock().unwrap();
        match entry.residency {
            Residency::Swapped(slot) => {
                let data = self.swap.read_in(slot);
                self.frames.with_data(idx, |d| *d = data);
                self.swap.put(slot);
            }
            _ => match &entry.backing {
                Some(backing) => {
                    let len = (PGSIZE as u32 - backing.zero_tail) as usize;
                    let inode = backing.inode.clone();
                    let offset = backing.offset as usize;
                    self.frames.with_data(idx, |d| {
                        d.fill(0);
                        inode.read_at(&self.fs.cache, &mut d[..len], offset);
                    });
                }
                None => {
                    self.frames.with_data(idx, |d| d.fill(0));
                }
            },
        }
        entry.dirty = false;
    }

    /// Lazily instantiates a zero-filled stack page the first time it's
    /// faulted on, within `STACK_GROWTH_HEADROOM` of the current stack
    /// pointer (spec.md section 4.6's caller is expected to have already
    /// checked that headroom before calling this).
    pub fn ensure_stack_page(&self, spt: &SupplementalPageTable<D>, page: u32) {
        if !spt.contains(page) {
            spt.insert(SptEntry {
                page,
                kind: EntryKind::StackZero,
                writable: true,
                backing: None,
                residency: Residency::NotLoaded,
                dirty: false,
            });
        }
    }

    /// The actual page-fault entry point: resolves a fault at `fault_addr`
    /// for `tid`, whose saved user stack pointer is `user_esp`. A page
    /// already present in the supplemental page table is serviced as
    /// usual; an unmapped page is legitimate stack growth only if
    /// `fault_addr` is within `STACK_GROWTH_HEADROOM` bytes below
    /// `user_esp` and above the stack's address-space floor (spec.md
    /// section 4.5, section 8 boundary scenario: "Stack auto-grow at
    /// `(user_esp - 32)` is allowed; at `(user_esp - 33)` exits -1").
    /// Anything else is a bad access the caller should turn into
    /// `exit(-1)` (spec.md section 7).
    pub fn handle_user_fault(
        &self,
        spt: &SupplementalPageTable<D>,
        tid: Tid,
        fault_addr: u32,
        user_esp: u32,
    ) -> KResult<usize> {
        let page = fault_addr - fault_addr % PGSIZE as u32;
        if !spt.contains(page) {
            if !Self::is_stack_growth(fault_addr, user_esp) {
                return Err(KernelError::BadUserAccess);
            }
            self.ensure_stack_page(spt, page);
        }
        self.handle_fault(spt, tid, page)
    }

    fn is_stack_growth(fault_addr: u32, user_esp: u32) -> bool {
        let stack_floor = USER_STACK_TOP - (STACK_LIMIT_PAGES * PGSIZE) as u32;
        if fault_addr < stack_floor || fault_addr >= USER_STACK_TOP {
            return false;
        }
        user_esp <= fault_addr.saturating_add(STACK_GROWTH_HEADROOM)
    }

    /// Marks a resident page dirty (callers record this on every write
    /// access so eviction/munmap know whether to persist it).
    pub fn mark_dirty(&self, spt: &SupplementalPageTable<D>, page: u32) {
        if let Some(handle) = spt.get(page) {
            handle.lock().unwrap().dirty = true;
        }
    }

    /// Maps `inode`'s content, read-only or read-write, starting at
    /// `start_page`; fails if any covered page is already mapped (spec.md
    /// section 4.5 "mmap"/"munmap").
    pub fn mmap(
        &self,
        spt: &SupplementalPageTable<D>,
        inode: Arc<crate::fs::inode::Inode<D>>,
        start_page: u32,
        writable: bool,
    ) -> KResult<Vec<u32>> {
        let length = inode.readable_length();
        if length == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let num_pages = (length as usize + PGSIZE - 1) / PGSIZE;
        let pages: Vec<u32> = (0..num_pages).map(|i| start_page + (i * PGSIZE) as u32).collect();
        if pages.iter().any(|&p| spt.contains(p)) {
            return Err(KernelError::InvalidArgument);
        }
        for (i, &page) in pages.iter().enumerate() {
            let offset = (i * PGSIZE) as u32;
            let remaining = length - offset;
            let zero_tail = if (remaining as usize) < PGSIZE {
                PGSIZE as u32 - remaining
            } else {
                0
            };
            spt.insert(SptEntry {
                page,
                kind: EntryKind::MMap,
                writable,
                backing: Some(FileBacking {
                    inode: inode.clone(),
                    offset,
                    zero_tail,
                    writable_back: writable,
                }),
                residency: Residency::NotLoaded,
                dirty: false,
            });
        }
        Ok(pages)
    }

    /// Writes back every dirty resident page covered by a mapping, then
    /// drops its supplemental entries and any frame/swap resources they
    /// hold.
    pub fn munmap(&self, spt: &SupplementalPageTable<D>, pages: &[u32]) {
        for &page in pages {
            if let Some(handle) = spt.remove(page) {
                self.release_entry(&handle);
            }
        }
    }

    /// Tears down every supplemental entry a process still owns at exit:
    /// mmap pages write back if dirty, everything else is simply dropped
    /// (spec.md section 4.6 "process exit").
    pub fn cleanup_process(&self, spt: &SupplementalPageTable<D>) {
        for page in spt.pages() {
            if let Some(handle) = spt.remove(page) {
                self.release_entry(&handle);
            }
        }
    }

    /// Validates and copies `len` bytes starting at user address `addr`
    /// out of the process's address space, faulting in any page that
    /// isn't yet resident (spec.md section 4.6: "validates each user
    /// pointer argument by checking that each page it touches is present
    /// in the caller's supplemental page table").
    pub fn read_user_bytes(
        &self,
        spt: &SupplementalPageTable<D>,
        tid: Tid,
        addr: u32,
        len: usize,
    ) -> KResult<Vec<u8>> {
        let mut out = vec![0u8; len];
        let mut i = 0;
        while i < len {
            let a = addr as usize + i;
            let page = (a - a % PGSIZE) as u32;
            let offset = a % PGSIZE;
            let idx = self.handle_fault(spt, tid, page)?;
            let chunk = (PGSIZE - offset).min(len - i);
            self.frames.with_data(idx, |d| out[i..i + chunk].copy_from_slice(&d[offset..offset + chunk]));
            i += chunk;
        }
        Ok(out)
    }

    /// Validates and writes `data` into user address space starting at
    /// `addr`; fails if any touched page is not mapped writable (spec.md
    /// section 4.6: "for buffer-out arguments, that the mapping is
    /// writable").
    pub fn write_user_bytes(&self, spt: &SupplementalPageTable<D>, tid: Tid, addr: u32, data: &[u8]) -> KResult<()> {
        let len = data.len();
        let mut i = 0;
        while i < len {
            let a = addr as usize + i;
            let page = (a - a % PGSIZE) as u32;
            let offset = a % PGSIZE;
            let entry_handle = spt.get(page).ok_or(KernelError::BadUserAccess)?;
            if !entry_handle.lock().unwrap().writable {
                return Err(KernelError::BadUserAccess);
            }
            let idx = self.handle_fault(spt, tid, page)?;
            let chunk = (PGSIZE - offset).min(len - i);
            self.frames
                .with_data(idx, |d| d[offset..offset + chunk].copy_from_slice(&data[i..i + chunk]));
            self.mark_dirty(spt, page);
            i += chunk;
        }
        Ok(())
    }

    /// Reads a NUL-terminated string starting at user address `addr`,
    /// walking byte by byte until a NUL or `max_len` is reached (spec.md
    /// section 4.6: "strings are walked byte-by-byte until a NUL is
    /// found").
    pub fn read_user_cstr(&self, spt: &SupplementalPageTable<D>, tid: Tid, addr: u32, max_len: usize) -> KResult<String> {
        let mut bytes = Vec::new();
        for i in 0..max_len {
            let b = self.read_user_bytes(spt, tid, addr + i as u32, 1)?[0];
            if b == 0 {
                return Ok(String::from_utf8_lossy(&bytes).into_owned());
            }
            bytes.push(b);
        }
        Err(KernelError::BadUserAccess)
    }

    fn release_entry(&self, handle: &Arc<Mutex<SptEntry<D>>>) {
        let entry = handle.lock().unwrap();
        match entry.residency {
            Residency::Frame(idx) => {
                if entry.kind == EntryKind::MMap && entry.dirty {
                    self.writeback_mmap_page(idx, &entry);
                }
                drop(entry);
                self.frames.clear(idx);
            }
            Residency::Swapped(slot) => {
                self.swap.put(slot);
            }
            Residency::NotLoaded => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_device::MemBlockDevice;
    use crate::param::ROOT_DIR_SECTOR;

    fn setup() -> (Arc<Filesystem<MemBlockDevice>>, VirtualMemory<MemBlockDevice>) {
        let dev = Arc::new(MemBlockDevice::new(8192));
        let fs = Filesystem::format(dev).unwrap();
        let swap_dev = Arc::new(MemBlockDevice::new(256));
        let vm = VirtualMemory::new(4, swap_dev, fs.clone());
        (fs, vm)
    }

    #[test]
    fn fault_on_a_zero_page_returns_zero_filled_data() {
        let (_fs, vm) = setup();
        let spt = SupplementalPageTable::new();
        spt.insert(SptEntry {
            page: 0x1000,
            kind: EntryKind::StackZero,
            writable: true,
            backing: None,
            residency: Residency::NotLoaded,
            dirty: false,
        });
        let idx = vm.handle_fault(&spt, 1, 0x1000).unwrap();
        vm.frames.with_data(idx, |d| assert!(d.iter().all(|&b| b == 0)));
    }

    #[test]
    fn fault_on_an_unmapped_page_fails() {
        let (_fs, vm) = setup();
        let spt = SupplementalPageTable::new();
        let err = vm.handle_fault(&spt, 1, 0xdead0000).unwrap_err();
        assert_eq!(err, KernelError::BadUserAccess);
    }

    #[test]
    fn user_bytes_round_trip_across_a_page_boundary() {
        let (_fs, vm) = setup();
        let spt = SupplementalPageTable::new();
        for page in [0x1000u32, 0x2000u32] {
            spt.insert(SptEntry {
                page,
                kind: EntryKind::StackZero,
                writable: true,
                backing: None,
                residency: Residency::NotLoaded,
                dirty: false,
            });
        }
        let addr = 0x1000 + PGSIZE as u32 - 2;
        let payload = [1u8, 2, 3, 4];
        vm.write_user_bytes(&spt, 1, addr, &payload).unwrap();
        let back = vm.read_user_bytes(&spt, 1, addr, payload.len()).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn write_to_a_read_only_page_is_rejected() {
        let (_fs, vm) = setup();
        let spt = SupplementalPageTable::new();
        spt.insert(SptEntry {
            page: 0x1000,
            kind: EntryKind::CodeSegment,
            writable: false,
            backing: None,
            residency: Residency::NotLoaded,
            dirty: false,
        });
        let err = vm.write_user_bytes(&spt, 1, 0x1000, &[9u8]).unwrap_err();
        assert_eq!(err, KernelError::BadUserAccess);
    }

    #[test]
    fn user_cstr_reads_up_to_the_nul() {
        let (_fs, vm) = setup();
        let spt = SupplementalPageTable::new();
        spt.insert(SptEntry {
            page: 0x1000,
            kind: EntryKind::StackZero,
            writable: true,
            backing: None,
            residency: Residency::NotLoaded,
            dirty: false,
        });
        let mut msg = b"hello".to_vec();
        msg.push(0);
        vm.write_user_bytes(&spt, 1, 0x1000, &msg).unwrap();
        let s = vm.read_user_cstr(&spt, 1, 0x1000, 64).unwrap();
        assert_eq!(s, "hello");
    }

    #[test]
    fn eviction_round_trips_a_dirty_stack_page_through_swap() {
        let (_fs, vm) = setup();
        let spt = SupplementalPageTable::new();
        // One more page than frames, so the last fault forces an eviction.
        for i in 0..vm.frames.num_frames() + 1 {
            let page = (i as u32) * PGSIZE as u32;
            spt.insert(SptEntry {
                page,
                kind: EntryKind::StackZero,
                writable: true,
                backing: None,
                residency: Residency::NotLoaded,
                dirty: false,
            });
        }
        let mut written = Vec::new();
        for i in 0..vm.frames.num_frames() + 1 {
            let page = (i as u32) * PGSIZE as u32;
            let idx = vm.handle_fault(&spt, 1, page).unwrap();
            vm.frames.with_data(idx, |d| d[0] = (i + 1) as u8);
            vm.mark_dirty(&spt, page);
            written.push(page);
        }
        // Re-fault the first page: it must have been evicted to swap and
        // now come back with its original byte intact.
        let idx = vm.handle_fault(&spt, 1, written[0]).unwrap();
        vm.frames.with_data(idx, |d| assert_eq!(d[0], 1));
    }

    #[test]
    fn mmap_then_munmap_writes_back_dirty_pages() {
        let (fs, vm) = setup();
        fs.create(ROOT_DIR_SECTOR, "mapped", 0).unwrap();
        let inode = fs.open(ROOT_DIR_SECTOR, "mapped").unwrap();
        inode.write_at(&fs.cache, &fs.free_map, &[b'a'; 100], 0).unwrap();

        let spt = SupplementalPageTable::new();
        let pages = vm.mmap(&spt, inode.clone(), 0x40000, true).unwrap();
        assert_eq!(pages.len(), 1);

        let idx = vm.handle_fault(&spt, 1, pages[0]).unwrap();
        vm.frames.with_data(idx, |d| d[0] = b'Z');
        vm.mark_dirty(&spt, pages[0]);

        vm.munmap(&spt, &pages);

        let mut buf = [0u8; 1];
        let n = inode.read_at(&fs.cache, &mut buf, 0);
        assert_eq!(n, 1);
        assert_eq!(buf[0], b'Z');
    }

    #[test]
    fn process_exit_cleanup_releases_every_entry() {
        let (_fs, vm) = setup();
        let spt = SupplementalPageTable::new();
        spt.insert(SptEntry {
            page: 0x2000,
            kind: EntryKind::StackZero,
            writable: true,
            backing: None,
            residency: Residency::NotLoaded,
            dirty: false,
        });
        vm.handle_fault(&spt, 1, 0x2000).unwrap();
        assert!(!spt.pages().is_empty());
        vm.cleanup_process(&spt);
        assert!(spt.pages().is_empty());
    }

    #[test]
    fn stack_grows_exactly_at_the_32_byte_headroom_and_no_further() {
        let (_fs, vm) = setup();
        let spt = SupplementalPageTable::new();
        let stack_page = USER_STACK_TOP - PGSIZE as u32;
        spt.insert(SptEntry {
            page: stack_page,
            kind: EntryKind::StackZero,
            writable: true,
            backing: None,
            residency: Residency::NotLoaded,
            dirty: false,
        });
        let user_esp = stack_page + 64;

        // One page below esp's page is unmapped; a fault 32 bytes below esp
        // must be treated as legitimate growth.
        let growth_addr = user_esp - STACK_GROWTH_HEADROOM;
        vm.handle_user_fault(&spt, 1, growth_addr, user_esp)
            .expect("fault exactly at the headroom boundary must succeed");

        // One byte further down must not be stack growth.
        let spt2 = SupplementalPageTable::new();
        let too_far = user_esp - STACK_GROWTH_HEADROOM - 1;
        let err = vm.handle_user_fault(&spt2, 1, too_far, user_esp).unwrap_err();
        assert_eq!(err, KernelError::BadUserAccess);
    }

    #[test]
    fn a_fault_far_outside_any_mapped_or_stack_region_is_rejected() {
        let (_fs, vm) = setup();
        let spt = SupplementalPageTable::new();
        let user_esp = USER_STACK_TOP - PGSIZE as u32 + 64;
        let err = vm.handle_user_fault(&spt, 1, 0x0000_1000, user_esp).unwrap_err();
        assert_eq!(err, KernelError::BadUserAccess);
    }
}
