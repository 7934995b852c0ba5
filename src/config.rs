use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use thiserror::Error;

use crate::flash::FlashBackend;
use crate::ota::image::ImageFormat;
use crate::ota::OtaManager;
use crate::partition::BootConfig;

#[cfg(feature = "espidf")]
use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs};

#[cfg(feature = "espidf")]
const CONFIG_NAMESPACE: &str = "ota";
#[cfg(feature = "espidf")]
const CONFIG_KEY: &str = "config";

pub const MIN_CHUNK_SIZE: usize = 256;
pub const MAX_CHUNK_SIZE: usize = 16384;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EraseStrategy {
    /// Erase every block the image covers before the first write
    Upfront,
    /// Erase each block right before the first write into it
    #[default]
    Incremental,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OtaConfig {
    // Receiver
    pub chunk_size: usize,
    pub yield_every: u32,
    pub yield_ms: u64,

    // Engine
    pub erase_strategy: EraseStrategy,
    /// Images carrying a different hardware tag are refused
    pub hardware_tag: Option<String>,
    /// Formats this device boots; empty accepts every format
    pub formats: Vec<ImageFormat>,

    // Web server
    pub reboot_delay_ms: u64,
}

impl Default for OtaConfig {
    fn default() -> Self {
        Self {
            chunk_size: 2048,
            yield_every: 4,
            yield_ms: 10,
            erase_strategy: EraseStrategy::Incremental,
            hardware_tag: None,
            formats: Vec::new(),
            reboot_delay_ms: 2000,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("chunk_size {0} outside 256..=16384")]
    ChunkSize(usize),
    #[error("yield_every must be at least 1")]
    YieldEvery,
    #[error("malformed config: {0}")]
    Json(#[from] serde_json::Error),
}

impl OtaConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: OtaConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&self.chunk_size) {
            return Err(ConfigError::ChunkSize(self.chunk_size));
        }
        if self.yield_every == 0 {
            return Err(ConfigError::YieldEvery);
        }
        Ok(())
    }

    pub fn accepts(&self, format: ImageFormat) -> bool {
        self.formats.is_empty() || self.formats.contains(&format)
    }

    #[cfg(feature = "espidf")]
    pub fn save(&self, nvs: EspDefaultNvsPartition) -> anyhow::Result<()> {
        save_to_nvs(self, nvs)?;
        log::info!("OTA configuration saved to NVS");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigUpdate {
    Applied,
    /// An upload holds the manager; nothing was persisted
    Busy,
}

/// Persist `config` and hand it to the manager, or do neither while the
/// manager is locked by an upload
pub fn apply_to<B, C, E>(
    manager: &Mutex<OtaManager<B, C>>,
    config: OtaConfig,
    persist: impl FnOnce(&OtaConfig) -> Result<(), E>,
) -> Result<ConfigUpdate, E>
where
    B: FlashBackend,
    C: BootConfig,
{
    let Ok(mut manager) = manager.try_lock() else {
        return Ok(ConfigUpdate::Busy);
    };
    persist(&config)?;
    manager.set_config(config);
    Ok(ConfigUpdate::Applied)
}

#[cfg(feature = "espidf")]
pub fn load_or_default(nvs: EspDefaultNvsPartition) -> anyhow::Result<OtaConfig> {
    match load_from_nvs(nvs.clone()) {
        Ok(config) => {
            log::info!("Loaded OTA configuration from NVS");
            Ok(config)
        }
        Err(e) => {
            log::warn!("Failed to load OTA config from NVS: {:?}, using defaults", e);
            let config = OtaConfig::default();
            if let Err(save_err) = config.save(nvs) {
                log::warn!("Failed to save default OTA config to NVS: {:?}", save_err);
            }
            Ok(config)
        }
    }
}

#[cfg(feature = "espidf")]
fn load_from_nvs(nvs_partition: EspDefaultNvsPartition) -> anyhow::Result<OtaConfig> {
    let nvs = EspNvs::new(nvs_partition, CONFIG_NAMESPACE, true)?;

    let mut buf = vec![0u8; 1024];
    let data = nvs
        .get_blob(CONFIG_KEY, &mut buf)?
        .ok_or_else(|| anyhow::anyhow!("OTA config not found in NVS"))?;
    let text = core::str::from_utf8(data)?;
    Ok(OtaConfig::from_json(text)?)
}

#[cfg(feature = "espidf")]
fn save_to_nvs(config: &OtaConfig, nvs_partition: EspDefaultNvsPartition) -> anyhow::Result<()> {
    let mut nvs = EspNvs::new(nvs_partition, CONFIG_NAMESPACE, false)?;
    nvs.set_blob(CONFIG_KEY, config.to_json()?.as_bytes())?;
    Ok(())
}
