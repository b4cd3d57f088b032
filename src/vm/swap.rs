//! Swap pool: a disk region divided into page-sized slots, with a free
//! list of slot indices (spec.md section 3 "Swap Pool", section 4.5
//! "Swap pool").

use std::sync::{Arc, Mutex};

use tracing::error;

use crate::block_device::BlockDevice;
use crate::param::{PGSIZE, SWAP_SLOT_SECTORS};

pub type SwapSlot = usize;

pub struct SwapPool<S: BlockDevice> {
    device: Arc<S>,
    free: Mutex<Vec<SwapSlot>>,
}

impl<S: BlockDevice> SwapPool<S> {
    pub fn new(device: Arc<S>) -> Self {
        let num_slots = device.num_sectors() as usize / SWAP_SLOT_SECTORS;
        Self {
            device,
            free: Mutex::new((0..num_slots).collect()),
        }
    }

    /// Pops a free slot. Swap exhaustion is fatal (spec.md section 7: "the
    /// kernel cannot make progress").
    pub fn get(&self) -> SwapSlot {
        self.free.lock().unwrap().pop().unwrap_or_else(|| {
            error!("swap pool exhausted");
            panic!("swap exhaustion: out of swap slots")
        })
    }

    pub fn put(&self, slot: SwapSlot) {
        self.free.lock().unwrap().push(slot);
    }

    /// Reads a page's worth of data from `slot` (8 sequential sector
    /// reads).
    pub fn read_in(&self, slot: SwapSlot) -> [u8; PGSIZE] {
        let mut page = [0u8; PGSIZE];
        let base = (slot * SWAP_SLOT_SECTORS) as u32;
        for i in 0..SWAP_SLOT_SECTORS {
            let mut sector = [0u8; 512];
            self.device.read(base + i as u32, &mut sector);
            page[i * 512..(i + 1) * 512].copy_from_slice(&sector);
        }
        page
    }

    /// Writes a page's worth of data into `slot` (8 sequential sector
    /// writes).
    pub fn write_out(&self, slot: SwapSlot, page: &[u8; PGSIZE]) {
        let base = (slot * SWAP_SLOT_SECTORS) as u32;
        for i in 0..SWAP_SLOT_SECTORS {
            let mut sector = [0u8; 512];
            sector.copy_from_slice(&page[i * 512..(i + 1) * 512]);
            self.device.write(base + i as u32, &sector);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_device::MemBlockDevice;

    #[test]
    fn swap_out_then_in_preserves_a_page() {
        let dev = Arc::new(MemBlockDevice::new((SWAP_SLOT_SECTORS * 4) as u32));
        let pool = SwapPool::new(dev);
        let slot = pool.get();
        let mut page = [0u8; PGSIZE];
        for (i, b) in page.iter_mut().enumerate() {
            *b = (i % 256) as u8;
        }
        pool.write_out(slot, &page);
        pool.put(slot);

        let slot2 = pool.get();
        // A fresh get() may not return the same index, but since we only
        // had one outstanding slot, it must.
        assert_eq!(slot2, slot);
        let back = pool.read_in(slot2);
        assert_eq!(back, page);
    }
}
