//! Raw sector storage contract.
//!
//! spec.md section 6: "512-byte sectors addressed by a 32-bit index.
//! `read(sector, &buf[512])` and `write(sector, &buf[512])` are synchronous
//! and serialized by the driver." This is the narrow external interface
//! spec.md section 1 puts out of scope (no real disk controller here); the
//! teacher's analogous collaborator is `virtio::virtio_disk`, itself kept
//! behind a trait boundary (`hal.rs`/`virtio/mod.rs`) rather than inlined
//! into the filesystem, which is the shape this module keeps.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::param::SECTOR_SIZE;

/// A blocking, serialized raw sector store.
pub trait BlockDevice: Send + Sync {
    fn read(&self, sector: u32, buf: &mut [u8; SECTOR_SIZE]);
    fn write(&self, sector: u32, buf: &[u8; SECTOR_SIZE]);
    fn num_sectors(&self) -> u32;
}

/// An in-memory stand-in for a real disk, used by tests and by the swap
/// device. Each call serializes through a single mutex, matching "blocking
/// and serialized by the device driver".
pub struct MemBlockDevice {
    sectors: Mutex<Vec<[u8; SECTOR_SIZE]>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl MemBlockDevice {
    pub fn new(num_sectors: u32) -> Self {
        Self {
            sectors: Mutex::new(vec![[0u8; SECTOR_SIZE]; num_sectors as usize]),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl BlockDevice for MemBlockDevice {
    fn read(&self, sector: u32, buf: &mut [u8; SECTOR_SIZE]) {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let sectors = self.sectors.lock().unwrap();
        buf.copy_from_slice(&sectors[sector as usize]);
    }

    fn write(&self, sector: u32, buf: &[u8; SECTOR_SIZE]) {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut sectors = self.sectors.lock().unwrap();
        sectors[sector as usize].copy_from_slice(buf);
    }

    fn num_sectors(&self) -> u32 {
        self.sectors.lock().unwrap().len() as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_sector() {
        let dev = MemBlockDevice::new(4);
        let mut buf = [0u8; SECTOR_SIZE];
        buf[0] = 7;
        dev.write(2, &buf);
        let mut out = [0xffu8; SECTOR_SIZE];
        dev.read(2, &mut out);
        assert_eq!(out, buf);
        assert_eq!(dev.read_count(), 1);
        assert_eq!(dev.write_count(), 1);
    }
}
