// Boot configuration backed by the ESP-IDF partition table and otadata

use esp_idf_sys::{
    esp_ota_get_running_partition, esp_ota_mark_app_valid_cancel_rollback, esp_ota_set_boot_partition,
    esp_partition_find_first, esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_APP_OTA_0,
    esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_APP_OTA_1, esp_partition_t,
    esp_partition_type_t_ESP_PARTITION_TYPE_APP, ESP_OK,
};

use crate::error::{OtaError, OtaResult};
use crate::flash::FlashRegion;
use crate::partition::{Bank, BootConfig, PartitionLayout, Target};

const SECTOR_SIZE: u32 = 4096;

/// Partition lookups go through ESP-IDF on every call, so the active bank
/// always matches what otadata says
pub struct EspBootConfig;

fn find_ota(bank: Bank) -> OtaResult<*const esp_partition_t> {
    let subtype = match bank {
        Bank::A => esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_APP_OTA_0,
        Bank::B => esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_APP_OTA_1,
    };
    let partition = unsafe {
        esp_partition_find_first(esp_partition_type_t_ESP_PARTITION_TYPE_APP, subtype, core::ptr::null())
    };
    if partition.is_null() {
        return Err(OtaError::BootConfigFailure(format!("no ota_{} partition", bank.index())));
    }
    Ok(partition)
}

fn region_of(partition: *const esp_partition_t) -> OtaResult<FlashRegion> {
    let (address, size) = unsafe { ((*partition).address, (*partition).size) };
    FlashRegion::new(address, size, SECTOR_SIZE)
        .map_err(|_| OtaError::LayoutInvalid("app partition not sector aligned"))
}

impl EspBootConfig {
    pub fn new() -> OtaResult<Self> {
        find_ota(Bank::A)?;
        find_ota(Bank::B)?;
        Ok(Self)
    }

    /// Confirm the running image so the bootloader does not roll back
    pub fn mark_running_valid(&self) {
        let result = unsafe { esp_ota_mark_app_valid_cancel_rollback() };
        if result == ESP_OK {
            log::info!("Running firmware marked valid");
        } else {
            log::warn!("Failed to mark running firmware valid: {}", result);
        }
    }
}

impl BootConfig for EspBootConfig {
    fn layout(&self) -> OtaResult<PartitionLayout> {
        let running = unsafe { esp_ota_get_running_partition() };
        if running.is_null() {
            return Err(OtaError::BootConfigFailure("running partition unknown".into()));
        }
        let running = region_of(running)?;
        let banks = [region_of(find_ota(Bank::A)?)?, region_of(find_ota(Bank::B)?)?];

        let layout = if running == banks[0] {
            PartitionLayout::DualBank { banks, active: Bank::A }
        } else if running == banks[1] {
            PartitionLayout::DualBank { banks, active: Bank::B }
        } else {
            // Booted from factory: ota_0 is the update slot
            PartitionLayout::SingleRegion { ota: banks[0], running }
        };
        Ok(layout)
    }

    fn commit(&mut self, target: &Target) -> OtaResult<()> {
        // single-region targets are ota_0
        let bank = target.bank.unwrap_or(Bank::A);
        let partition = find_ota(bank)?;
        if region_of(partition)? != target.region {
            return Err(OtaError::BootConfigFailure("target is not an app partition".into()));
        }
        let result = unsafe { esp_ota_set_boot_partition(partition) };
        if result != ESP_OK {
            return Err(OtaError::BootConfigFailure(format!(
                "esp_ota_set_boot_partition returned {}",
                result
            )));
        }
        log::info!("Boot partition set to ota_{}", bank.index());
        Ok(())
    }
}
