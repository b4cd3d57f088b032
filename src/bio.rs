//! Buffer cache: fixed-size clock-evicted slot array with write-behind and
//! read-ahead daemons.
//!
//! Grounded directly in `examples/original_source/src/filesys/cache.c`
//! (`buffer_cache`, `get_entry_index`, `switch_cache_entry`,
//! `evict_cache_entry`, `cache_read`/`cache_write`, the read-ahead and
//! write-behind daemons) and spec.md section 4.2. The teacher's own
//! `bio.rs` is xv6's much smaller LRU list without read-ahead/write-behind
//! daemons or per-slot reader/writer accounting; this module keeps the
//! teacher's "one lock per entry plus a list/array lock" shape (`Buf` /
//! `SleepLock`) but replaces the eviction and concurrency policy with the
//! one spec.md describes, since that policy (not xv6's) is what spec.md
//! section 4.2 and section 8's testable properties pin down.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar as StdCondvar, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use tracing::{debug, trace};

use crate::block_device::BlockDevice;
use crate::param::{CACHE_SIZE, SECTOR_SIZE, WRITE_BEHIND_INTERVAL_SECS};

struct SlotState {
    sector_id: Option<u32>,
    /// Sector reserved for a flush-then-load transition in progress.
    next_sector_id: Option<u32>,
    dirty: bool,
    accessed: bool,
    loading_in: bool,
    flushing_out: bool,
    readers: u32,
    writers: u32,
    waiting_readers: u32,
    waiting_writers: u32,
    data: [u8; SECTOR_SIZE],
}

impl SlotState {
    fn empty() -> Self {
        Self {
            sector_id: None,
            next_sector_id: None,
            dirty: false,
            accessed: false,
            loading_in: false,
            flushing_out: false,
            readers: 0,
            writers: 0,
            waiting_readers: 0,
            waiting_writers: 0,
            data: [0u8; SECTOR_SIZE],
        }
    }

    fn busy(&self) -> bool {
        self.readers + self.writers + self.waiting_readers + self.waiting_writers > 0
            || self.loading_in
            || self.flushing_out
    }
}

struct Slot {
    state: Mutex<SlotState>,
    cv: StdCondvar,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::empty()),
            cv: StdCondvar::new(),
        }
    }
}

/// The fixed-size buffer cache described in spec.md section 2 item 2 and
/// section 4.2.
pub struct BufferCache<D: BlockDevice> {
    device: Arc<D>,
    slots: Vec<Slot>,
    /// Guards the clock hand and serializes the slot-array search /
    /// eviction decision (spec.md: "the global cache lock").
    clock_hand: Mutex<usize>,
    read_ahead: Mutex<VecDeque<u32>>,
    read_ahead_cv: StdCondvar,
}

impl<D: BlockDevice + 'static> BufferCache<D> {
    pub fn new(device: Arc<D>) -> Arc<Self> {
        let cache = Arc::new(Self {
            device,
            slots: (0..CACHE_SIZE).map(|_| Slot::new()).collect(),
            clock_hand: Mutex::new(0),
            read_ahead: Mutex::new(VecDeque::new()),
            read_ahead_cv: StdCondvar::new(),
        });
        cache.clone().spawn_read_ahead_daemon();
        cache
    }

    fn spawn_read_ahead_daemon(self: Arc<Self>) {
        thread::Builder::new()
            .name("read_ahead_daemon".into())
            .spawn(move || loop {
                let sector = {
                    let mut q = self.read_ahead.lock().unwrap();
                    while q.is_empty() {
                        q = self.read_ahead_cv.wait(q).unwrap();
                    }
                    q.pop_front().unwrap()
                };
                if let Some(idx) = self.find_existing(sector) {
                    let mut st = self.slots[idx].state.lock().unwrap();
                    st.accessed = true;
                    continue;
                }
                match self.switch_slot(sector, false) {
                    Some(_) => trace!(sector, "read-ahead completed"),
                    None => {
                        // Couldn't flush/load without waiting; retry later.
                        self.read_ahead.lock().unwrap().push_back(sector);
                    }
                }
            })
            .expect("failed to spawn read_ahead_daemon");
    }

    /// Spawns the write-behind daemon on its own thread; returns a handle
    /// the caller can detach (it runs for the process lifetime, matching
    /// the teacher's "daemon thread" model).
    pub fn spawn_write_behind_daemon(self: &Arc<Self>) {
        let cache = self.clone();
        thread::Builder::new()
            .name("write_behind_daemon".into())
            .spawn(move || loop {
                thread::sleep(Duration::from_secs(WRITE_BEHIND_INTERVAL_SECS));
                cache.write_behind_pass();
            })
            .expect("failed to spawn write_behind_daemon");
    }

    fn write_behind_pass(&self) {
        for idx in 0..self.slots.len() {
            let dirty = self.slots[idx].state.lock().unwrap().dirty;
            if dirty {
                self.flush_slot(idx, false);
            }
        }
    }

    /// Forced flush, invoked at filesystem shutdown (spec.md section 4.2).
    pub fn force_flush_all(&self) {
        for idx in 0..self.slots.len() {
            let dirty = self.slots[idx].state.lock().unwrap().dirty;
            if dirty {
                self.flush_slot(idx, true);
            }
        }
    }

    fn find_existing(&self, sector: u32) -> Option<usize> {
        for (i, slot) in self.slots.iter().enumerate() {
            let mut st = slot.state.lock().unwrap();
            if st.sector_id == Some(sector) {
                while st.flushing_out {
                    st = slot.cv.wait(st).unwrap();
                }
                if st.sector_id == Some(sector) {
                    return Some(i);
                }
                return None;
            } else if st.next_sector_id == Some(sector) {
                while st.flushing_out || st.loading_in {
                    st = slot.cv.wait(st).unwrap();
                }
                if st.sector_id == Some(sector) {
                    return Some(i);
                }
                return None;
            }
        }
        None
    }

    fn advance_hand(hand: &mut usize, len: usize) {
        *hand = (*hand + 1) % len;
    }

    /// Clock eviction: advance past busy or recently-accessed slots,
    /// demoting `accessed` as it passes (spec.md section 4.2).
    fn evict(&self, hand: &mut MutexGuard<'_, usize>) -> usize {
        loop {
            let idx = **hand;
            let mut st = self.slots[idx].state.lock().unwrap();
            if st.busy() {
                drop(st);
                Self::advance_hand(hand, self.slots.len());
                continue;
            }
            if st.accessed {
                st.accessed = false;
                drop(st);
                Self::advance_hand(hand, self.slots.len());
                continue;
            }
            drop(st);
            Self::advance_hand(hand, self.slots.len());
            return idx;
        }
    }

    fn flush_slot(&self, idx: usize, need_wait: bool) -> bool {
        let slot = &self.slots[idx];
        let mut st = slot.state.lock().unwrap();
        if !st.dirty {
            return true;
        }
        if st.busy() {
            if !need_wait {
                return false;
            }
            while st.busy() {
                st = slot.cv.wait(st).unwrap();
            }
            if !st.dirty {
                return true;
            }
        }
        st.flushing_out = true;
        let sector = st.sector_id.expect("flush of invalid sector");
        let snapshot = st.data;
        drop(st);

        self.device.write(sector, &snapshot);

        let mut st = slot.state.lock().unwrap();
        st.dirty = false;
        st.flushing_out = false;
        slot.cv.notify_all();
        debug!(sector, "flushed cache slot");
        true
    }

    fn load_slot(&self, idx: usize, sector: u32, need_wait: bool) -> bool {
        let slot = &self.slots[idx];
        let mut st = slot.state.lock().unwrap();
        if st.busy() {
            if !need_wait {
                return false;
            }
            while st.busy() {
                st = slot.cv.wait(st).unwrap();
            }
        }
        st.loading_in = true;
        drop(st);

        let mut buf = [0u8; SECTOR_SIZE];
        self.device.read(sector, &mut buf);

        let mut st = slot.state.lock().unwrap();
        st.data = buf;
        st.dirty = false;
        st.loading_in = false;
        slot.cv.notify_all();
        true
    }

    /// Evicts a slot and switches it to `sector`. `need_wait = false` is
    /// used only by the read-ahead daemon, which must not block.
    fn switch_slot(&self, sector: u32, need_wait: bool) -> Option<usize> {
        let mut hand = self.clock_hand.lock().unwrap();
        let idx = self.evict(&mut hand);
        {
            let mut st = self.slots[idx].state.lock().unwrap();
            st.next_sector_id = Some(sector);
        }
        drop(hand);

        let need_flush = self.slots[idx].state.lock().unwrap().dirty;
        if need_flush && !self.flush_slot(idx, need_wait) {
            self.slots[idx].state.lock().unwrap().next_sector_id = None;
            return None;
        }
        if !self.load_slot(idx, sector, need_wait) {
            self.slots[idx].state.lock().unwrap().next_sector_id = None;
            return None;
        }
        let mut st = self.slots[idx].state.lock().unwrap();
        st.sector_id = Some(sector);
        st.next_sector_id = None;
        Some(idx)
    }

    fn get_or_load(&self, sector: u32) -> usize {
        // `find_existing` relocks each slot individually and may wait on a
        // slot's condvar for in-flight I/O to finish; it must not be called
        // under `clock_hand`, or every other lookup/eviction blocks behind
        // that one transfer (spec.md section 4.2/5: "no thread may hold the
        // global cache lock while waiting on an entry's I/O").
        if let Some(idx) = self.find_existing(sector) {
            return idx;
        }
        self.switch_slot(sector, true)
            .expect("cache miss cannot fail under a blocking switch")
    }

    fn enqueue_read_ahead(&self, sector: u32) {
        // Open Question (a) in spec.md section 9: sector 0 (the free-map
        // sector) is never read ahead, matching the source's behaviour.
        if sector == 0 {
            return;
        }
        self.read_ahead.lock().unwrap().push_back(sector);
        self.read_ahead_cv.notify_one();
    }

    /// Reads `len` bytes at `offset` within `sector`. `next_sector` is a
    /// caller-supplied hint for read-ahead (0 disables it).
    pub fn read(&self, sector: u32, next_sector: u32, offset: usize, buf: &mut [u8]) {
        let idx = self.get_or_load(sector);
        let slot = &self.slots[idx];
        {
            let mut st = slot.state.lock().unwrap();
            st.waiting_readers += 1;
            while st.writers + st.waiting_writers > 0 || st.loading_in {
                st = slot.cv.wait(st).unwrap();
            }
            st.waiting_readers -= 1;
            st.readers += 1;
        }
        {
            let st = slot.state.lock().unwrap();
            buf.copy_from_slice(&st.data[offset..offset + buf.len()]);
        }
        {
            let mut st = slot.state.lock().unwrap();
            st.readers -= 1;
            st.accessed = true;
            slot.cv.notify_all();
        }
        if next_sector != 0 {
            self.enqueue_read_ahead(next_sector);
        }
    }

    /// Writes `len` bytes at `offset` within `sector`.
    pub fn write(&self, sector: u32, offset: usize, buf: &[u8]) {
        let idx = self.get_or_load(sector);
        let slot = &self.slots[idx];
        {
            let mut st = slot.state.lock().unwrap();
            st.waiting_writers += 1;
            while st.writers + st.readers > 0 || st.flushing_out || st.loading_in {
                st = slot.cv.wait(st).unwrap();
            }
            st.waiting_writers -= 1;
            st.writers += 1;
        }
        {
            let mut st = slot.state.lock().unwrap();
            st.data[offset..offset + buf.len()].copy_from_slice(buf);
        }
        {
            let mut st = slot.state.lock().unwrap();
            st.writers -= 1;
            st.accessed = true;
            st.dirty = true;
            slot.cv.notify_all();
        }
    }

    /// Zero-fills a whole sector through the cache (used by inode creation
    /// to zero newly-allocated data sectors).
    pub fn zero_sector(&self, sector: u32) {
        let zeros = [0u8; SECTOR_SIZE];
        self.write(sector, 0, &zeros);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_device::MemBlockDevice;
    use std::time::Duration;

    #[test]
    fn read_then_write_round_trips() {
        let dev = Arc::new(MemBlockDevice::new(16));
        let cache = BufferCache::new(dev);
        let payload = [b'x'; 100];
        cache.write(3, 50, &payload);
        let mut out = [0u8; 100];
        cache.read(3, 0, 50, &mut out);
        assert_eq!(out, payload);
    }

    #[test]
    fn force_flush_persists_to_device() {
        let dev = Arc::new(MemBlockDevice::new(4));
        let cache = BufferCache::new(dev.clone());
        cache.write(1, 0, &[b'z'; 512]);
        cache.force_flush_all();
        let mut raw = [0u8; SECTOR_SIZE];
        dev.read(1, &mut raw);
        assert_eq!(raw, [b'z'; 512]);
    }

    #[test]
    fn read_ahead_avoids_a_second_disk_read_of_the_same_sector() {
        let dev = Arc::new(MemBlockDevice::new(16));
        let cache = BufferCache::new(dev.clone());
        let mut buf = [0u8; 10];
        cache.read(10, 11, 0, &mut buf);
        // Give the read-ahead daemon a chance to run.
        thread::sleep(Duration::from_millis(50));
        let before = dev.read_count();
        cache.read(11, 0, 0, &mut buf);
        assert_eq!(dev.read_count(), before, "sector 11 should already be cached");
    }
}
