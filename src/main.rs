use anyhow::Result;
use esp_idf_hal::prelude::*;
use esp_idf_svc::{eventloop::EspSystemEventLoop, nvs::EspDefaultNvsPartition};
use esp_idf_sys as _; // Binstart
use std::sync::{Arc, Mutex};

use log::info;

use otaflash::boot::EspBootConfig;
use otaflash::flash::esp::EspFlash;
use otaflash::flash::SharedFlash;
use otaflash::network::{web_server::OtaWebServer, wifi::WifiLink};
use otaflash::ota::OtaManager;
use otaflash::{config, logging, targets, version};

// Generate ESP-IDF app descriptor
#[allow(unexpected_cfgs)]
mod app_desc {
    esp_idf_sys::esp_app_desc!();
}

fn main() -> Result<()> {
    esp_idf_svc::sys::link_patches();
    logging::init_logger().map_err(|e| anyhow::anyhow!("Failed to initialize logger: {}", e))?;

    info!("otaflash {} starting", version::full_version());
    info!("Free heap: {} bytes", unsafe { esp_idf_sys::esp_get_free_heap_size() });

    // A build that came up this far is healthy
    let boot = EspBootConfig::new()?;
    boot.mark_running_valid();

    let nvs = EspDefaultNvsPartition::take()?;
    let mut ota_config = config::load_or_default(nvs.clone())?;
    if ota_config.formats.is_empty() {
        ota_config.formats = targets::built_in().formats.to_vec();
    }

    let flash = SharedFlash::new(EspFlash::new()?);
    let manager = OtaManager::new(flash, boot, ota_config)?;
    match manager.layout() {
        Ok(layout) => info!("Partition layout: {:?}", layout),
        Err(e) => log::warn!("Partition layout unavailable: {}", e),
    }
    let manager = Arc::new(Mutex::new(manager));

    let peripherals = Peripherals::take()?;
    let sys_loop = EspSystemEventLoop::take()?;
    let mut wifi = WifiLink::new(
        peripherals.modem,
        sys_loop,
        nvs.clone(),
        env!("WIFI_SSID"),
        env!("WIFI_PASSWORD"),
    )?;
    wifi.connect()?;

    let _server = OtaWebServer::new(manager, nvs)?;
    info!("Ready for updates: POST http://{}/api/ota", wifi.ip().unwrap_or_default());

    loop {
        std::thread::sleep(std::time::Duration::from_secs(10));
        if let Err(e) = wifi.ensure_connected() {
            log::warn!("WiFi reconnect failed: {}", e);
        }
    }
}
