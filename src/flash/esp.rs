// Raw SPI flash access on ESP-IDF targets through the esp_flash driver

use core::ffi::c_void;
use esp_idf_sys::{esp_flash_erase_region, esp_flash_get_size, esp_flash_read, esp_flash_write, ESP_OK};

use super::{FlashBackend, FlashError, FlashGeometry, FlashRegion};

const SECTOR_SIZE: u32 = 4096;
// Caps how long a single write holds the SPI bus
const MAX_WRITE: usize = 4096;

/// Default flash chip (a null chip pointer selects it)
pub struct EspFlash {
    size: u32,
}

impl EspFlash {
    pub fn new() -> Result<Self, FlashError> {
        let mut size = 0u32;
        let result = unsafe { esp_flash_get_size(core::ptr::null_mut(), &mut size) };
        if result != ESP_OK {
            return Err(FlashError::Device(result));
        }
        log::info!("esp_flash: {} KiB detected", size / 1024);
        Ok(Self { size })
    }
}

impl FlashBackend for EspFlash {
    fn geometry(&self) -> FlashGeometry {
        FlashGeometry {
            size: self.size,
            erase_block: SECTOR_SIZE,
            max_write: MAX_WRITE,
        }
    }

    fn erase(&mut self, region: FlashRegion) -> Result<(), FlashError> {
        let result =
            unsafe { esp_flash_erase_region(core::ptr::null_mut(), region.start(), region.length()) };
        if result != ESP_OK {
            return Err(FlashError::Device(result));
        }
        Ok(())
    }

    fn write(&mut self, address: u32, bytes: &[u8]) -> Result<usize, FlashError> {
        if bytes.len() > MAX_WRITE {
            return Err(FlashError::WriteTooLarge { len: bytes.len(), max: MAX_WRITE });
        }
        let result = unsafe {
            esp_flash_write(
                core::ptr::null_mut(),
                bytes.as_ptr() as *const c_void,
                address,
                bytes.len() as u32,
            )
        };
        if result != ESP_OK {
            return Err(FlashError::Device(result));
        }
        Ok(bytes.len())
    }

    fn read(&mut self, address: u32, buffer: &mut [u8]) -> Result<(), FlashError> {
        let result = unsafe {
            esp_flash_read(
                core::ptr::null_mut(),
                buffer.as_mut_ptr() as *mut c_void,
                address,
                buffer.len() as u32,
            )
        };
        if result != ESP_OK {
            return Err(FlashError::Device(result));
        }
        Ok(())
    }
}
