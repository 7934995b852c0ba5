//! Flash backends and the region/geometry types the OTA engine works in.
//!
//! A backend only has to get one bounded erase, write or read right. Chunking
//! to the device's atomic write size and per-call locking live in
//! [`SharedFlash`], so every target shares the same engine.

mod nor;
mod ram;

#[cfg(feature = "espidf")]
pub mod esp;

pub use nor::NorFlashBackend;
pub use ram::{FaultPlan, FlashStats, RamFlash};

use serde::Serialize;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FlashError {
    #[error("address range outside the flash device")]
    OutOfBounds,
    #[error("address or length not aligned to {0} bytes")]
    Misaligned(u32),
    #[error("write of {len} bytes exceeds the {max}-byte atomic limit")]
    WriteTooLarge { len: usize, max: usize },
    #[error("device accepted no bytes")]
    ShortWrite,
    #[error("programming bits that were not erased")]
    NotErased,
    #[error("flash lock poisoned")]
    LockPoisoned,
    #[error("device error {0}")]
    Device(i32),
}

/// Physical properties a backend reports about its device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FlashGeometry {
    pub size: u32,
    pub erase_block: u32,
    /// Largest write the device performs atomically
    pub max_write: usize,
}

impl FlashGeometry {
    pub fn contains(&self, region: &FlashRegion) -> bool {
        region.end() <= u64::from(self.size)
    }
}

/// A contiguous, erase-block aligned span of flash
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FlashRegion {
    start: u32,
    length: u32,
    erase_block: u32,
}

impl FlashRegion {
    pub fn new(start: u32, length: u32, erase_block: u32) -> Result<Self, FlashError> {
        if erase_block == 0 || !erase_block.is_power_of_two() {
            return Err(FlashError::Misaligned(erase_block));
        }
        if length == 0 || start % erase_block != 0 || length % erase_block != 0 {
            return Err(FlashError::Misaligned(erase_block));
        }
        if start.checked_add(length).is_none() {
            return Err(FlashError::OutOfBounds);
        }
        Ok(Self { start, length, erase_block })
    }

    /// Only for compile-time tables; `targets` tests check every entry with `new`
    pub(crate) const fn from_parts(start: u32, length: u32, erase_block: u32) -> Self {
        Self { start, length, erase_block }
    }

    pub fn start(&self) -> u32 {
        self.start
    }

    pub fn length(&self) -> u32 {
        self.length
    }

    pub fn erase_block(&self) -> u32 {
        self.erase_block
    }

    pub fn end(&self) -> u64 {
        u64::from(self.start) + u64::from(self.length)
    }

    pub fn overlaps(&self, other: &FlashRegion) -> bool {
        u64::from(self.start) < other.end() && u64::from(other.start) < self.end()
    }

    /// The erase block holding `offset` (relative to the region start)
    pub fn block_at(&self, offset: u32) -> Option<FlashRegion> {
        if offset >= self.length {
            return None;
        }
        let aligned = offset - offset % self.erase_block;
        Some(Self {
            start: self.start + aligned,
            length: self.erase_block,
            erase_block: self.erase_block,
        })
    }

    /// First erase block; it carries the image signature and decides bootability
    pub fn signature_block(&self) -> FlashRegion {
        Self {
            start: self.start,
            length: self.erase_block,
            erase_block: self.erase_block,
        }
    }
}

/// Capability interface every hardware target implements
pub trait FlashBackend {
    fn geometry(&self) -> FlashGeometry;

    /// Erase a block-aligned region
    fn erase(&mut self, region: FlashRegion) -> Result<(), FlashError>;

    /// Program at most `geometry().max_write` bytes, returning how many were accepted
    fn write(&mut self, address: u32, bytes: &[u8]) -> Result<usize, FlashError>;

    fn read(&mut self, address: u32, buffer: &mut [u8]) -> Result<(), FlashError>;
}

/// Flash shared with other subsystems. The lock is held for one backend call
/// at a time, never across a whole update.
pub struct SharedFlash<B> {
    inner: Arc<Mutex<B>>,
}

impl<B> Clone for SharedFlash<B> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<B: FlashBackend> SharedFlash<B> {
    pub fn new(backend: B) -> Self {
        Self { inner: Arc::new(Mutex::new(backend)) }
    }

    /// Handle for other subsystems that need the device between chunks
    pub fn handle(&self) -> Arc<Mutex<B>> {
        Arc::clone(&self.inner)
    }

    /// Run one backend call under the device lock
    pub fn with<T>(&self, f: impl FnOnce(&mut B) -> Result<T, FlashError>) -> Result<T, FlashError> {
        let mut guard = self.inner.lock().map_err(|_| FlashError::LockPoisoned)?;
        f(&mut guard)
    }

    pub fn geometry(&self) -> Result<FlashGeometry, FlashError> {
        self.with(|flash| Ok(flash.geometry()))
    }

    pub fn erase(&self, region: FlashRegion) -> Result<(), FlashError> {
        self.with(|flash| flash.erase(region))
    }

    /// Write `bytes` in pieces no larger than the device's atomic write size,
    /// releasing the lock between pieces. On failure returns the address of
    /// the piece that failed.
    pub fn write_all(&self, address: u32, bytes: &[u8]) -> Result<(), (u32, FlashError)> {
        let max_write = self.geometry().map_err(|e| (address, e))?.max_write.max(1);
        let mut offset = 0usize;
        while offset < bytes.len() {
            let end = (offset + max_write).min(bytes.len());
            let at = address + offset as u32;
            let written = self
                .with(|flash| flash.write(at, &bytes[offset..end]))
                .map_err(|e| (at, e))?;
            if written == 0 {
                return Err((at, FlashError::ShortWrite));
            }
            offset += written;
        }
        Ok(())
    }

    pub fn read(&self, address: u32, buffer: &mut [u8]) -> Result<(), FlashError> {
        self.with(|flash| flash.read(address, buffer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_alignment() {
        assert!(FlashRegion::new(0x1000, 0x2000, 0x1000).is_ok());
        assert!(FlashRegion::new(0x1001, 0x2000, 0x1000).is_err());
        assert!(FlashRegion::new(0x1000, 0x2001, 0x1000).is_err());
        assert!(FlashRegion::new(0x1000, 0, 0x1000).is_err());
        assert!(FlashRegion::new(0x1000, 0x1000, 3000).is_err());
        assert!(FlashRegion::new(0xFFFF_F000, 0x2000, 0x1000).is_err());
    }

    #[test]
    fn test_region_overlap() {
        let a = FlashRegion::new(0x0000, 0x4000, 0x1000).unwrap();
        let b = FlashRegion::new(0x4000, 0x4000, 0x1000).unwrap();
        let c = FlashRegion::new(0x3000, 0x2000, 0x1000).unwrap();
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&c));
        assert!(b.overlaps(&c));
    }

    #[test]
    fn test_block_at() {
        let r = FlashRegion::new(0x10000, 0x4000, 0x1000).unwrap();
        assert_eq!(r.block_at(0x1234).unwrap().start(), 0x11000);
        assert!(r.block_at(0x4000).is_none());
        assert_eq!(r.signature_block().length(), 0x1000);
    }

    #[test]
    fn test_write_all_chunks_to_max_write() {
        let flash = SharedFlash::new(RamFlash::new(0x4000, 0x1000, 256));
        flash.erase(FlashRegion::new(0, 0x1000, 0x1000).unwrap()).unwrap();
        flash.write_all(0x10, &[0xA5; 1000]).unwrap();
        let stats = flash.with(|f| Ok(f.stats())).unwrap();
        assert_eq!(stats.writes, 4);
        assert_eq!(stats.bytes_written, 1000);

        let mut back = [0u8; 4];
        flash.read(0x10 + 996, &mut back).unwrap();
        assert_eq!(back, [0xA5; 4]);
    }
}
