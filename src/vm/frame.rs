//! Global frame table: one entry per physical user frame, with a clock
//! hand implementing second-chance eviction (spec.md section 3
//! "Frame Table Entry", section 4.5 "Frame table + second-chance
//! eviction").

use std::sync::{Arc, Mutex, MutexGuard};

use crate::block_device::BlockDevice;
use crate::param::PGSIZE;
use crate::sched::Tid;
use crate::vm::spt::{EntryKind, SptEntry};

struct FrameSlot<D: BlockDevice> {
    data: [u8; PGSIZE],
    occupied: bool,
    owner_tid: Tid,
    kind: Option<EntryKind>,
    spt_entry: Option<Arc<Mutex<SptEntry<D>>>>,
    pinned: bool,
    accessed: bool,
}

impl<D: BlockDevice> FrameSlot<D> {
    fn free() -> Self {
        Self {
            data: [0u8; PGSIZE],
            occupied: false,
            owner_tid: 0,
            kind: None,
            spt_entry: None,
            pinned: false,
            accessed: false,
        }
    }
}

pub struct FrameTable<D: BlockDevice> {
    slots: Vec<Mutex<FrameSlot<D>>>,
    clock_hand: Mutex<usize>,
}

impl<D: BlockDevice> FrameTable<D> {
    pub fn new(num_frames: usize) -> Self {
        Self {
            slots: (0..num_frames).map(|_| Mutex::new(FrameSlot::free())).collect(),
            clock_hand: Mutex::new(0),
        }
    }

    pub fn num_frames(&self) -> usize {
        self.slots.len()
    }

    /// Tries the physical allocator first (spec.md section 4.5): scans
    /// for any unoccupied slot and claims it pinned.
    pub fn try_alloc_free(&self, owner_tid: Tid) -> Option<usize> {
        for (i, slot) in self.slots.iter().enumerate() {
            let mut s = slot.lock().unwrap();
            if !s.occupied {
                s.occupied = true;
                s.pinned = true;
                s.owner_tid = owner_tid;
                s.accessed = false;
                return Some(i);
            }
        }
        None
    }

    /// Second-chance clock scan. A first pass skips `CodeSegment` frames
    /// (spec.md: "but we skip here to prefer MMap/DataSegment/StackZero
    /// victims"); a second pass accepts any unpinned, unaccessed frame if
    /// the first pass found nothing (all-code-segment working sets still
    /// have to evict something).
    pub fn select_victim(&self) -> usize {
        let mut hand = self.clock_hand.lock().unwrap();
        let len = self.slots.len();
        if let Some(idx) = self.scan(&mut hand, len, true) {
            return idx;
        }
        self.scan(&mut hand, len, false)
            .unwrap_or_else(|| panic!("no evictable frame: all {} frames pinned", len))
    }

    fn scan(&self, hand: &mut MutexGuard<'_, usize>, len: usize, avoid_code: bool) -> Option<usize> {
        for _ in 0..(2 * len) {
            let idx = **hand;
            **hand = (idx + 1) % len;
            let mut s = self.slots[idx].lock().unwrap();
            if !s.occupied || s.pinned {
                continue;
            }
            if s.accessed {
                s.accessed = false;
                continue;
            }
            if avoid_code && s.kind == Some(EntryKind::CodeSegment) {
                continue;
            }
            s.pinned = true;
            return Some(idx);
        }
        None
    }

    pub fn with_data<R>(&self, idx: usize, f: impl FnOnce(&mut [u8; PGSIZE]) -> R) -> R {
        let mut s = self.slots[idx].lock().unwrap();
        f(&mut s.data)
    }

    pub fn install(&self, idx: usize, owner_tid: Tid, kind: EntryKind, entry: Arc<Mutex<SptEntry<D>>>) {
        let mut s = self.slots[idx].lock().unwrap();
        s.owner_tid = owner_tid;
        s.kind = Some(kind);
        s.spt_entry = Some(entry);
        s.occupied = true;
    }

    /// Clears ownership of `idx` (the frame has just been evicted or
    /// freed); returns the supplemental-page entry it used to back, if
    /// any, so the caller can invalidate its residency.
    pub fn clear(&self, idx: usize) -> Option<Arc<Mutex<SptEntry<D>>>> {
        let mut s = self.slots[idx].lock().unwrap();
        s.occupied = false;
        s.kind = None;
        s.accessed = false;
        s.owner_tid = 0;
        s.spt_entry.take()
    }

    pub fn unpin(&self, idx: usize) {
        self.slots[idx].lock().unwrap().pinned = false;
    }

    pub fn mark_accessed(&self, idx: usize) {
        self.slots[idx].lock().unwrap().accessed = true;
    }

    pub fn owner_tid(&self, idx: usize) -> Tid {
        self.slots[idx].lock().unwrap().owner_tid
    }

    pub fn spt_entry_of(&self, idx: usize) -> Option<Arc<Mutex<SptEntry<D>>>> {
        self.slots[idx].lock().unwrap().spt_entry.clone()
    }
}
