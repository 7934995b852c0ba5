use anyhow::Result;
use base64::Engine;
use esp_idf_svc::http::server::{Configuration, EspHttpServer};
use esp_idf_svc::http::Method;
use esp_idf_svc::io::{Read, Write};
use esp_idf_svc::nvs::EspDefaultNvsPartition;
use std::sync::{Arc, Mutex, TryLockError};

use crate::config::{apply_to, ConfigUpdate, OtaConfig};
use crate::network::error_handler::{ErrorResponse, UploadResponse};
use crate::network::validators;
use crate::ota::{receive_update, AbortHandle, ReceiveOptions};
use crate::DeviceOtaManager;

const JSON: &[(&str, &str)] = &[("Content-Type", "application/json")];

pub struct OtaWebServer {
    _server: EspHttpServer<'static>,
}

fn schedule_restart(delay_ms: u64) {
    std::thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_millis(delay_ms));
        log::info!("Restarting system...");
        unsafe {
            esp_idf_sys::esp_restart();
        }
    });
}

impl OtaWebServer {
    pub fn new(manager: Arc<Mutex<DeviceOtaManager>>, nvs: EspDefaultNvsPartition) -> Result<Self> {
        let abort: AbortHandle = manager
            .lock()
            .map_err(|_| anyhow::anyhow!("OTA manager lock poisoned"))?
            .abort_handle();

        let mut server = EspHttpServer::new(&Configuration {
            uri_match_wildcard: true,
            stack_size: 10240,
            ..Default::default()
        })?;

        // Firmware upload; the body is the image
        let ota = manager.clone();
        server.fn_handler("/api/ota", Method::Post, move |mut req| {
            let declared = match validators::parse_content_length(req.header("Content-Length")) {
                Ok(len) => len,
                Err(e) => return ErrorResponse::bad_request(e.to_string()).send(req),
            };
            let hint = match validators::parse_bank_query(req.uri()) {
                Ok(hint) => hint,
                Err(e) => return ErrorResponse::bad_request(e.to_string()).send(req),
            };
            log::info!("OTA upload started, size: {} bytes", declared);

            let (result, reboot_delay) = {
                let mut ota = match ota.lock() {
                    Ok(mgr) => mgr,
                    Err(e) => {
                        log::error!("Failed to lock OTA manager: {}", e);
                        return ErrorResponse::unavailable("OTA manager unavailable").send(req);
                    }
                };
                let options = ReceiveOptions::from_config(ota.config());
                let delay = ota.config().reboot_delay_ms;
                (receive_update(&mut *ota, &mut req, declared, hint, &options), delay)
            };

            match result {
                Ok(report) => {
                    log::info!("OTA update complete, restarting in {} ms", reboot_delay);
                    let body = serde_json::to_string(&UploadResponse { size: report.bytes_written })?;
                    let mut response = req.into_response(200, Some("OK"), JSON)?;
                    response.write_all(body.as_bytes())?;
                    schedule_restart(reboot_delay);
                    Ok(())
                }
                Err(e) => {
                    log::error!("OTA update failed: {}", e);
                    ErrorResponse::from_ota(&e).send(req)
                }
            }
        })?;

        // Status never waits for a running upload
        let ota = manager.clone();
        server.fn_handler("/api/ota/status", Method::Get, move |req| {
            let body = match ota.try_lock() {
                Ok(mgr) => serde_json::json!({
                    "status": mgr.status(),
                    "layout": mgr.layout().ok(),
                    "version": crate::version::full_version(),
                }),
                Err(TryLockError::WouldBlock) => serde_json::json!({ "status": { "state": "busy" } }),
                Err(TryLockError::Poisoned(_)) => {
                    return ErrorResponse::unavailable("OTA manager lock poisoned").send(req);
                }
            };
            let mut response = req.into_response(200, Some("OK"), JSON)?;
            response.write_all(body.to_string().as_bytes())?;
            Ok::<(), anyhow::Error>(())
        })?;

        // Abort goes through the handle; the upload holds the manager lock
        server.fn_handler("/api/ota/abort", Method::Post, move |req| {
            log::warn!("OTA abort requested via web interface");
            abort.abort();
            let mut response = req.into_response(202, Some("Accepted"), JSON)?;
            response.write_all(br#"{"status":"aborting"}"#)?;
            Ok::<(), anyhow::Error>(())
        })?;

        // Raw flash dump: /api/flash/<hex start>-<hex length>
        let ota = manager.clone();
        server.fn_handler("/api/flash/*", Method::Get, move |req| {
            let range = req.uri().trim_start_matches("/api/flash/").to_string();
            let (address, length) = match validators::parse_flash_range(&range) {
                Ok(parsed) => parsed,
                Err(e) => return ErrorResponse::bad_request(e.to_string()).send(req),
            };
            let data = match ota.try_lock() {
                Ok(mgr) => mgr.read_flash(address, length),
                Err(_) => return ErrorResponse::unavailable("OTA in progress").send(req),
            };
            match data {
                Ok(bytes) => {
                    let body = serde_json::json!({
                        "address": address,
                        "length": length,
                        "data": base64::engine::general_purpose::STANDARD.encode(bytes),
                    });
                    let mut response = req.into_response(200, Some("OK"), JSON)?;
                    response.write_all(body.to_string().as_bytes())?;
                    Ok(())
                }
                Err(e) => ErrorResponse::from_ota(&e).send(req),
            }
        })?;

        server.fn_handler("/api/reboot", Method::Post, move |req| {
            log::warn!("Device restart requested via web interface");
            let mut response = req.into_response(200, Some("OK"), JSON)?;
            response.write_all(br#"{"status":"restarting"}"#)?;
            schedule_restart(1000);
            Ok::<(), anyhow::Error>(())
        })?;

        let ota = manager.clone();
        server.fn_handler("/api/config", Method::Get, move |req| {
            let json = match ota.try_lock() {
                Ok(mgr) => mgr.config().to_json()?,
                Err(_) => return ErrorResponse::unavailable("OTA in progress").send(req),
            };
            let mut response = req.into_response(200, Some("OK"), JSON)?;
            response.write_all(json.as_bytes())?;
            Ok(())
        })?;

        let ota = manager;
        server.fn_handler("/api/config", Method::Post, move |mut req| {
            let mut buf = vec![0u8; 1024];
            let mut len = 0;
            while len < buf.len() {
                let n = req.read(&mut buf[len..])?;
                if n == 0 {
                    break;
                }
                len += n;
            }
            let text = std::str::from_utf8(&buf[..len])?;
            let config = match OtaConfig::from_json(text) {
                Ok(config) => config,
                Err(e) => return ErrorResponse::bad_request(e.to_string()).send(req),
            };
            if let Some(tag) = config.hardware_tag.as_deref() {
                if let Err(e) = validators::validate_hardware_tag(tag) {
                    return ErrorResponse::bad_request(e.to_string()).send(req);
                }
            }
            if apply_to(&*ota, config, |c| c.save(nvs.clone()))? == ConfigUpdate::Busy {
                return ErrorResponse::unavailable("OTA in progress").send(req);
            }
            let mut response = req.into_response(200, Some("OK"), JSON)?;
            response.write_all(br#"{"status":"ok"}"#)?;
            Ok(())
        })?;

        log::info!("OTA endpoints registered");
        Ok(Self { _server: server })
    }
}
