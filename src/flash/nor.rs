// Adapter for any `embedded-storage` NOR flash driver

use embedded_storage::nor_flash::{NorFlash, NorFlashError, NorFlashErrorKind};

use super::{FlashBackend, FlashError, FlashGeometry, FlashRegion};

/// Wraps a HAL flash driver. Writes that do not start or end on the driver's
/// `WRITE_SIZE` are padded with 0xFF, which leaves neighbouring bytes as
/// they were; only use it with parts that accept re-programming a word
/// with 0xFF padding.
pub struct NorFlashBackend<F> {
    flash: F,
    max_write: usize,
}

impl<F: NorFlash> NorFlashBackend<F> {
    pub fn new(flash: F, max_write: usize) -> Self {
        // Whole words only
        let max_write = (max_write / F::WRITE_SIZE).max(1) * F::WRITE_SIZE;
        Self { flash, max_write }
    }
}

fn map_error<E: NorFlashError>(error: E) -> FlashError {
    match error.kind() {
        NorFlashErrorKind::NotAligned => FlashError::Misaligned(0),
        NorFlashErrorKind::OutOfBounds => FlashError::OutOfBounds,
        _ => FlashError::Device(-1),
    }
}

fn align_down(value: u32, to: usize) -> u32 {
    value - value % to as u32
}

fn align_up(value: u32, to: usize) -> u32 {
    align_down(value + to as u32 - 1, to)
}

impl<F: NorFlash> FlashBackend for NorFlashBackend<F> {
    fn geometry(&self) -> FlashGeometry {
        FlashGeometry {
            size: self.flash.capacity() as u32,
            erase_block: F::ERASE_SIZE as u32,
            max_write: self.max_write,
        }
    }

    fn erase(&mut self, region: FlashRegion) -> Result<(), FlashError> {
        let end = u32::try_from(region.end()).map_err(|_| FlashError::OutOfBounds)?;
        self.flash.erase(region.start(), end).map_err(map_error)
    }

    fn write(&mut self, address: u32, bytes: &[u8]) -> Result<usize, FlashError> {
        if bytes.len() > self.max_write {
            return Err(FlashError::WriteTooLarge { len: bytes.len(), max: self.max_write });
        }
        let end = address.checked_add(bytes.len() as u32).ok_or(FlashError::OutOfBounds)?;
        let start = align_down(address, F::WRITE_SIZE);
        let stop = align_up(end, F::WRITE_SIZE);
        if start == address && stop == end {
            self.flash.write(address, bytes).map_err(map_error)?;
        } else {
            let mut padded = vec![0xFF; (stop - start) as usize];
            let at = (address - start) as usize;
            padded[at..at + bytes.len()].copy_from_slice(bytes);
            // padding may push the piece past max_write; both are whole words
            for (i, piece) in padded.chunks(self.max_write).enumerate() {
                let offset = start + (i * self.max_write) as u32;
                self.flash.write(offset, piece).map_err(map_error)?;
            }
        }
        Ok(bytes.len())
    }

    fn read(&mut self, address: u32, buffer: &mut [u8]) -> Result<(), FlashError> {
        let end = address.checked_add(buffer.len() as u32).ok_or(FlashError::OutOfBounds)?;
        let start = align_down(address, F::READ_SIZE);
        let stop = align_up(end, F::READ_SIZE);
        if start == address && stop == end {
            return self.flash.read(address, buffer).map_err(map_error);
        }
        let mut scratch = vec![0u8; (stop - start) as usize];
        self.flash.read(start, &mut scratch).map_err(map_error)?;
        let at = (address - start) as usize;
        buffer.copy_from_slice(&scratch[at..at + buffer.len()]);
        Ok(())
    }
}
