// RAM-backed NOR flash used by host tests, ota-tool dry runs and bring-up

use super::{FlashBackend, FlashError, FlashGeometry, FlashRegion};

/// Call counters, so tests can assert what the engine did to the device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlashStats {
    pub erases: usize,
    pub bytes_erased: u64,
    pub writes: usize,
    pub bytes_written: u64,
    pub reads: usize,
}

/// Injected failures. Addresses are absolute; an operation fails when its
/// range contains the address.
#[derive(Debug, Clone, Copy, Default)]
pub struct FaultPlan {
    pub fail_erase_at: Option<u32>,
    pub fail_write_at: Option<u32>,
    /// Fail every write once this many writes have succeeded
    pub fail_after_writes: Option<usize>,
}

pub struct RamFlash {
    data: Vec<u8>,
    geometry: FlashGeometry,
    stats: FlashStats,
    faults: FaultPlan,
}

impl RamFlash {
    /// A fully erased device
    pub fn new(size: u32, erase_block: u32, max_write: usize) -> Self {
        Self {
            data: vec![0xFF; size as usize],
            geometry: FlashGeometry { size, erase_block, max_write },
            stats: FlashStats::default(),
            faults: FaultPlan::default(),
        }
    }

    pub fn with_faults(mut self, faults: FaultPlan) -> Self {
        self.faults = faults;
        self
    }

    pub fn set_faults(&mut self, faults: FaultPlan) {
        self.faults = faults;
    }

    pub fn stats(&self) -> FlashStats {
        self.stats
    }

    /// Direct view of the device contents
    pub fn contents(&self, address: u32, len: usize) -> &[u8] {
        let start = (address as usize).min(self.data.len());
        let end = start.saturating_add(len).min(self.data.len());
        &self.data[start..end]
    }

    fn range(&self, address: u32, len: usize) -> Result<std::ops::Range<usize>, FlashError> {
        let start = address as usize;
        let end = start.checked_add(len).ok_or(FlashError::OutOfBounds)?;
        if end > self.data.len() {
            return Err(FlashError::OutOfBounds);
        }
        Ok(start..end)
    }
}

fn hits(fault: Option<u32>, start: u32, len: usize) -> bool {
    match fault {
        Some(at) => at >= start && u64::from(at) < u64::from(start) + len as u64,
        None => false,
    }
}

impl FlashBackend for RamFlash {
    fn geometry(&self) -> FlashGeometry {
        self.geometry
    }

    fn erase(&mut self, region: FlashRegion) -> Result<(), FlashError> {
        let block = self.geometry.erase_block;
        if region.start() % block != 0 || region.length() % block != 0 {
            return Err(FlashError::Misaligned(block));
        }
        let range = self.range(region.start(), region.length() as usize)?;
        if hits(self.faults.fail_erase_at, region.start(), region.length() as usize) {
            return Err(FlashError::Device(-1));
        }
        self.data[range].fill(0xFF);
        self.stats.erases += 1;
        self.stats.bytes_erased += u64::from(region.length());
        Ok(())
    }

    fn write(&mut self, address: u32, bytes: &[u8]) -> Result<usize, FlashError> {
        if bytes.len() > self.geometry.max_write {
            return Err(FlashError::WriteTooLarge { len: bytes.len(), max: self.geometry.max_write });
        }
        let range = self.range(address, bytes.len())?;
        if hits(self.faults.fail_write_at, address, bytes.len()) {
            return Err(FlashError::Device(-2));
        }
        if let Some(limit) = self.faults.fail_after_writes {
            if self.stats.writes >= limit {
                return Err(FlashError::Device(-3));
            }
        }
        // NOR programming can only clear bits
        let target = &mut self.data[range];
        if target.iter().zip(bytes).any(|(old, new)| old & new != *new) {
            return Err(FlashError::NotErased);
        }
        target.copy_from_slice(bytes);
        self.stats.writes += 1;
        self.stats.bytes_written += bytes.len() as u64;
        Ok(bytes.len())
    }

    fn read(&mut self, address: u32, buffer: &mut [u8]) -> Result<(), FlashError> {
        let range = self.range(address, buffer.len())?;
        buffer.copy_from_slice(&self.data[range]);
        self.stats.reads += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_program_requires_erase() {
        let mut flash = RamFlash::new(0x2000, 0x1000, 256);
        assert_eq!(flash.write(0, &[0x0F]), Ok(1));
        // Clearing more bits is fine, setting them back is not
        assert_eq!(flash.write(0, &[0x0E]), Ok(1));
        assert_eq!(flash.write(0, &[0xF0]), Err(FlashError::NotErased));
        flash.erase(FlashRegion::new(0, 0x1000, 0x1000).unwrap()).unwrap();
        assert_eq!(flash.write(0, &[0xF0]), Ok(1));
    }

    #[test]
    fn test_bounds_and_limits() {
        let mut flash = RamFlash::new(0x2000, 0x1000, 16);
        assert_eq!(flash.write(0x1FFF, &[0, 0]), Err(FlashError::OutOfBounds));
        assert!(matches!(flash.write(0, &[0; 17]), Err(FlashError::WriteTooLarge { .. })));
        let mut buf = [0u8; 2];
        assert_eq!(flash.read(0x1FFF, &mut buf), Err(FlashError::OutOfBounds));
    }

    #[test]
    fn test_fault_injection() {
        let mut flash = RamFlash::new(0x4000, 0x1000, 256).with_faults(FaultPlan {
            fail_erase_at: Some(0x2000),
            fail_write_at: None,
            fail_after_writes: Some(1),
        });
        assert!(flash.erase(FlashRegion::new(0x1000, 0x1000, 0x1000).unwrap()).is_ok());
        assert!(flash.erase(FlashRegion::new(0x1000, 0x2000, 0x1000).unwrap()).is_err());
        assert!(flash.write(0x1000, &[1]).is_ok());
        assert_eq!(flash.write(0x1001, &[1]), Err(FlashError::Device(-3)));
    }
}
