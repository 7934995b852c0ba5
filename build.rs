use std::fs;
use std::path::Path;

fn main() -> anyhow::Result<()> {
    // Necessary for ESP-IDF; host builds of the library skip it
    #[cfg(feature = "espidf")]
    embuild::espidf::sysenv::output();

    // Target profile baked into the firmware (see src/targets.rs)
    let profile = std::env::var("OTAFLASH_TARGET").unwrap_or_else(|_| "esp32-4mb".to_string());
    println!("cargo:rustc-env=OTAFLASH_TARGET={}", profile);
    println!("cargo:rerun-if-env-changed=OTAFLASH_TARGET");

    // Read WiFi configuration if it exists
    let wifi_config_path = "wifi_config.h";
    println!("cargo:rerun-if-changed={}", wifi_config_path);
    let mut ssid = String::new();
    let mut password = String::new();
    if Path::new(wifi_config_path).exists() {
        let contents = fs::read_to_string(wifi_config_path)?;
        for line in contents.lines() {
            let value = line.split('"').nth(1).unwrap_or_default();
            if line.contains("#define WIFI_SSID") {
                ssid = value.to_string();
            } else if line.contains("#define WIFI_PASSWORD") {
                password = value.to_string();
            }
        }
    } else if cfg!(feature = "espidf") {
        println!("cargo:warning=wifi_config.h not found! Copy wifi_config.h.example to wifi_config.h and add your credentials.");
    }
    println!("cargo:rustc-env=WIFI_SSID={}", ssid);
    println!("cargo:rustc-env=WIFI_PASSWORD={}", password);

    Ok(())
}
