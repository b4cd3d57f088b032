//! Free-sector bitmap, persisted as a file whose inode lives at a reserved
//! sector (spec.md section 3 "Free Map"; grounded in
//! `examples/original_source/src/filesys/free-map.c`'s `free_map_create`/
//! `free_map_open`/`free_map_close` lifecycle).

use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::bio::BufferCache;
use crate::block_device::BlockDevice;
use crate::error::{KResult, KernelError};
use crate::fs::inode::{DiskInode, Inode};
use crate::param::{FIRST_DATA_SECTOR, FREE_MAP_SECTOR, ROOT_DIR_SECTOR};

/// Linear-scan bitmap allocator over every sector on the device.
pub struct FreeMap<D: BlockDevice> {
    cache: Arc<BufferCache<D>>,
    bits: Mutex<Vec<bool>>,
}

impl<D: BlockDevice + 'static> FreeMap<D> {
    /// Builds a fresh, all-free bitmap sized to the device, then reserves
    /// the sectors that are spoken for before any inode exists: sector 0
    /// (the free map's own inode), sector 1 (root directory's inode), and
    /// whatever data sectors the free-map inode itself will need once its
    /// length is known. Mirrors `free_map_create`.
    pub fn format(cache: Arc<BufferCache<D>>, num_sectors: u32) -> Arc<Self> {
        let mut bits = vec![false; num_sectors as usize];
        bits[FREE_MAP_SECTOR as usize] = true;
        bits[ROOT_DIR_SECTOR as usize] = true;
        let map = Arc::new(Self {
            cache,
            bits: Mutex::new(bits),
        });
        let bytes_needed = (num_sectors as usize + 7) / 8;
        let disk = DiskInode::create_on(&map.cache, &map, FREE_MAP_SECTOR, bytes_needed as u32, false)
            .expect("free map bootstrap allocation cannot fail on a fresh device");
        map.persist(&disk);
        debug!(num_sectors, bytes_needed, "formatted free map");
        map
    }

    /// Reloads a previously-formatted free map from disk (the "mount"
    /// entry point, spec.md section 9 "persist the free map").
    pub fn mount(cache: Arc<BufferCache<D>>, num_sectors: u32) -> KResult<Arc<Self>> {
        let bits = vec![false; num_sectors as usize];
        let map = Arc::new(Self {
            cache,
            bits: Mutex::new(bits),
        });
        let inode = Inode::open_raw(&map.cache, FREE_MAP_SECTOR)?;
        let len = inode.readable_length() as usize;
        let mut bytes = vec![0u8; len];
        inode.read_at_raw(&map.cache, &mut bytes, 0);
        let mut bits = map.bits.lock().unwrap();
        for (sector, bit) in bits.iter_mut().enumerate() {
            let byte = sector / 8;
            let shift = sector % 8;
            *bit = byte < bytes.len() && (bytes[byte] >> shift) & 1 == 1;
        }
        Ok(map.clone())
    }

    fn persist(&self, disk: &DiskInode) {
        let bits = self.bits.lock().unwrap();
        let mut bytes = vec![0u8; (bits.len() + 7) / 8];
        for (sector, &used) in bits.iter().enumerate() {
            if used {
                bytes[sector / 8] |= 1 << (sector % 8);
            }
        }
        disk.write_at_raw(&self.cache, &bytes, 0);
    }

    /// Persists the live in-memory bitmap back through the free map's own
    /// inode (called at clean shutdown).
    pub fn flush(&self) {
        if let Ok(inode) = Inode::open_raw(&self.cache, FREE_MAP_SECTOR) {
            let bits = self.bits.lock().unwrap();
            let mut bytes = vec![0u8; (bits.len() + 7) / 8];
            for (sector, &used) in bits.iter().enumerate() {
                if used {
                    bytes[sector / 8] |= 1 << (sector % 8);
                }
            }
            drop(bits);
            inode.write_at_raw(&self.cache, &bytes, 0);
        }
    }

    pub fn allocate_one(&self) -> KResult<u32> {
        let mut bits = self.bits.lock().unwrap();
        for sector in FIRST_DATA_SECTOR as usize..bits.len() {
            if !bits[sector] {
                bits[sector] = true;
                return Ok(sector as u32);
            }
        }
        warn!("free map exhausted");
        Err(KernelError::NoSpace)
    }

    pub fn release(&self, sector: u32) {
        let mut bits = self.bits.lock().unwrap();
        bits[sector as usize] = false;
    }

    pub fn num_free(&self) -> usize {
        self.bits.lock().unwrap().iter().filter(|&&b| !b).count()
    }

    pub fn is_allocated(&self, sector: u32) -> bool {
        self.bits.lock().unwrap()[sector as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_device::MemBlockDevice;

    #[test]
    fn allocate_then_release_is_reusable() {
        let dev = Arc::new(MemBlockDevice::new(64));
        let cache = BufferCache::new(dev);
        let map = FreeMap::format(cache, 64);
        let a = map.allocate_one().unwrap();
        let b = map.allocate_one().unwrap();
        assert_ne!(a, b);
        map.release(a);
        let c = map.allocate_one().unwrap();
        assert_eq!(a, c, "freed sector should be reused by the linear scan");
    }
}
