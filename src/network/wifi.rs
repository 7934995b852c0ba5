// Station-mode WiFi link the management plane listens on
use anyhow::{anyhow, bail, Result};
use esp_idf_hal::modem::Modem;
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    nvs::EspDefaultNvsPartition,
    wifi::{AuthMethod, BlockingWifi, ClientConfiguration, Configuration, EspWifi},
};
use std::time::Duration;

const CONNECT_ATTEMPTS: u32 = 5;
const RETRY_BASE: Duration = Duration::from_secs(2);

pub struct WifiLink {
    wifi: BlockingWifi<EspWifi<'static>>,
    ssid: String,
    reconnects: u32,
}

fn client_config(ssid: &str, password: &str) -> Result<Configuration> {
    let auth_method = if password.is_empty() {
        log::warn!("No WiFi password set, joining '{}' as an open network", ssid);
        AuthMethod::None
    } else {
        AuthMethod::WPA2Personal
    };
    Ok(Configuration::Client(ClientConfiguration {
        ssid: ssid.try_into().map_err(|_| anyhow!("SSID '{}' longer than 32 bytes", ssid))?,
        password: password.try_into().map_err(|_| anyhow!("WiFi password longer than 64 bytes"))?,
        auth_method,
        ..Default::default()
    }))
}

impl WifiLink {
    pub fn new(
        modem: Modem,
        sys_loop: EspSystemEventLoop,
        nvs: EspDefaultNvsPartition,
        ssid: &str,
        password: &str,
    ) -> Result<Self> {
        if ssid.is_empty() {
            bail!("WiFi SSID is empty, set it in wifi_config.h");
        }
        let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs))?;
        esp_wifi.set_configuration(&client_config(ssid, password)?)?;
        Ok(Self {
            wifi: BlockingWifi::wrap(esp_wifi, sys_loop)?,
            ssid: ssid.to_string(),
            reconnects: 0,
        })
    }

    /// Start the driver and join the network, backing off between attempts
    pub fn connect(&mut self) -> Result<()> {
        self.wifi.start()?;
        let mut last_error = None;
        for attempt in 1..=CONNECT_ATTEMPTS {
            log::info!("Joining '{}' (attempt {}/{})", self.ssid, attempt, CONNECT_ATTEMPTS);
            match self.join() {
                Ok(()) => {
                    log::info!("WiFi up, IP {}", self.ip().unwrap_or_else(|| "unknown".into()));
                    return Ok(());
                }
                Err(e) => {
                    log::warn!("WiFi join failed: {}", e);
                    last_error = Some(e);
                    std::thread::sleep(RETRY_BASE * attempt);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| anyhow!("WiFi join failed")))
    }

    fn join(&mut self) -> Result<()> {
        self.wifi.connect()?;
        self.wifi.wait_netif_up()?;
        // Power save drops the link in the middle of long uploads
        let result = unsafe { esp_idf_sys::esp_wifi_set_ps(esp_idf_sys::wifi_ps_type_t_WIFI_PS_NONE) };
        if result != esp_idf_sys::ESP_OK {
            log::warn!("esp_wifi_set_ps failed: {}", result);
        }
        Ok(())
    }

    /// Rejoin if the access point dropped us. Safe to call periodically.
    pub fn ensure_connected(&mut self) -> Result<()> {
        if self.wifi.is_connected()? {
            return Ok(());
        }
        self.reconnects += 1;
        log::warn!("WiFi link lost, reconnecting (#{})", self.reconnects);
        self.join()
    }

    pub fn ip(&self) -> Option<String> {
        self.wifi
            .wifi()
            .sta_netif()
            .get_ip_info()
            .ok()
            .map(|info| info.ip.to_string())
    }
}
